//! The central state machine: decide whether to start a new chain, commit stale live
//! snapshots, take a new snapshot, copy it into the archive with correct rebase, and advance
//! the retention ladder. This is the "Chain Manager" of the design.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::info;

use crate::archive::Archive;
use crate::config::{Intervals, Target};
use crate::error::{Error, Result};
use crate::hypervisor::{CommitMode, Hypervisor, SnapshotSpec};
use crate::image_tool::{self, ImageTool};
use crate::name_codec::{Filename, IncrRange};
use crate::rotator;

/// Flags that change the Chain Manager's decisions for a single run, drawn 1:1 from the CLI
/// surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunFlags {
	pub new_chain: bool,
	pub compress: bool,
	pub copy: bool,
	pub omit_unsafe: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
	Clean,
	Pending { backupset: u32, incr: u32 },
}

fn live_top_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| Regex::new(r"\.b(?P<bset>\d+)\.i(?P<incr>\d+)\.img$").unwrap())
}

fn classify(chain: &[PathBuf], domain: &str, drive: &str) -> Result<Classification> {
	match chain.len() {
		1 => Ok(Classification::Clean),
		2 => {
			let top_name = chain[0].file_name().and_then(|n| n.to_str()).unwrap_or_default();
			let caps = live_top_re().captures(top_name).ok_or_else(|| {
				Error::ArchiveInconsistency(format!(
					"cannot recover backupset/increment from live top '{top_name}' for {domain}:{drive}"
				))
			})?;
			Ok(Classification::Pending {
				backupset: caps["bset"].parse().unwrap(),
				incr: caps["incr"].parse().unwrap(),
			})
		}
		len => Err(Error::LiveChainTooLong {
			domain: domain.to_string(),
			drive: drive.to_string(),
			len,
		}),
	}
}

/// Walks the backing-file chain of a live disk, top first, using the same adapter (and the
/// same directory-normalization side effect) as archive scanning.
fn live_chain(tool: &dyn ImageTool, top: &Path, safe: bool) -> Result<Vec<PathBuf>> {
	let mut chain = vec![top.to_path_buf()];
	let mut current = top.to_path_buf();
	loop {
		let info = tool.info(&current, safe)?;
		match info.backing_file {
			Some(name) => {
				let next = current.parent().unwrap_or_else(|| Path::new(".")).join(name);
				chain.push(next.clone());
				current = next;
			}
			None => break,
		}
	}
	Ok(chain)
}

/// The per-drive name for a fresh snapshot top, per the Snapshot XML contract (spec 4.5):
/// `<current-top-basename-minus-.img>.b<BBB>.i<NNNNN>.img`.
fn new_top_basename(current_top: &Path, backupset: u32, incr: u32) -> String {
	let name = current_top.file_name().and_then(|n| n.to_str()).unwrap_or_default();
	let stem = name.strip_suffix(".img").unwrap_or(name);
	format!("{stem}.b{backupset:03}.i{incr:05}.img")
}

pub struct ChainManager<'a> {
	pub tool: &'a dyn ImageTool,
	pub hv: &'a dyn Hypervisor,
}

struct DriveState {
	drive: String,
	classification: Classification,
	chain: Vec<PathBuf>,
}

impl<'a> ChainManager<'a> {
	pub fn new(tool: &'a dyn ImageTool, hv: &'a dyn Hypervisor) -> Self {
		Self { tool, hv }
	}

	/// Runs the full Chain Manager algorithm for one (domain, drive-set) target.
	pub fn run_target(
		&self,
		archive: &mut Archive,
		target: &Target,
		intervals: &Intervals,
		flags: RunFlags,
	) -> Result<()> {
		let domain: &str = &target.domain;
		let blockdevs = self.hv.list_block_devices(domain)?;
		if blockdevs.is_empty() {
			return Err(Error::DomainNotFound(domain.clone()));
		}

		let selected: Vec<String> = if target.drives.is_empty() {
			blockdevs.keys().cloned().collect()
		} else {
			for d in &target.drives {
				if !blockdevs.contains_key(d) {
					return Err(Error::Configuration(format!(
						"unknown block device for domain {domain}: {d}"
					)));
				}
			}
			target.drives.clone()
		};

		// Step A: classify each selected drive's live chain.
		let mut states = Vec::new();
		for drive in &selected {
			let top = &blockdevs[drive];
			let chain = live_chain(self.tool, top, !flags.omit_unsafe)?;
			let classification = classify(&chain, domain, drive)?;
			states.push(DriveState {
				drive: drive.clone(),
				classification,
				chain,
			});
		}

		// Step B: pick the active backupset.
		let pending_backupsets: Vec<u32> = states
			.iter()
			.filter_map(|s| match s.classification {
				Classification::Pending { backupset, .. } => Some(backupset),
				Classification::Clean => None,
			})
			.collect();

		let (active_backupset, mut new_chain) = if flags.new_chain {
			let base = pending_backupsets
				.iter()
				.copied()
				.max()
				.or_else(|| archive.active_backupset(domain))
				.unwrap_or(0);
			(base + 1, true)
		} else if let Some(max) = pending_backupsets.iter().copied().max() {
			(max, false)
		} else {
			(archive.active_backupset(domain).unwrap_or(0) + 1, true)
		};

		info!(domain, backupset = active_backupset, new_chain, "active backupset");

		// Step C: repair / verify chain density for every known tier in this backupset.
		for drive in &selected {
			let tiers: Vec<String> = archive
				.drive(domain, active_backupset, drive)
				.map(|d| d.tiers.keys().cloned().collect())
				.unwrap_or_default();
			for tier in tiers {
				archive.repair_tier(domain, active_backupset, drive, &tier)?;
			}
		}

		// Drives that need Base mode treatment: never-yet-snapshotted for this set, or forced.
		let incomplete: Vec<&DriveState> = states
			.iter()
			.filter(|s| new_chain || matches!(s.classification, Classification::Clean))
			.collect();

		// Every other drive is Pending at the active backupset: whether this is a normal
		// steady-state run or a resumption of a run that crashed before its previous archival
		// copy completed, the live chain looks identical either way (spec 5: "a length-2 live
		// chain with a valid archive-side base is the canonical interrupted state"). Both cases
		// are healed by the same mechanism: freeze the current top with a fresh snapshot, fold
		// it back down with a base-merge commit, and archive the now-frozen image — i.e.
		// Incremental or Graduation mode below, never a copy of the still guest-writable top.
		if !incomplete.is_empty() || new_chain {
			self.run_base_mode(archive, domain, &incomplete, &blockdevs, active_backupset, intervals, flags)?;
			return Ok(());
		}

		if intervals.target_index() == 0 {
			self.run_incremental_mode(archive, domain, &selected, active_backupset, intervals, flags)
		} else {
			self.run_graduation_mode(archive, domain, &selected, active_backupset, intervals)
		}
	}

	#[allow(clippy::too_many_arguments)]
	fn run_base_mode(
		&self,
		archive: &mut Archive,
		domain: &str,
		incomplete: &[&DriveState],
		blockdevs: &BTreeMap<String, PathBuf>,
		backupset: u32,
		intervals: &Intervals,
		flags: RunFlags,
	) -> Result<()> {
		// 1. active-pivot commit for any drive still carrying more than one live image.
		for s in incomplete {
			if s.chain.len() > 1 {
				self.hv.block_commit(domain, &s.drive, CommitMode::ActivePivot)?;
			}
		}

		// 2. guest trim, with its fixed grace period.
		self.hv.trim(domain)?;

		// 3. snapshot: one call naming every incomplete drive's new top.
		let blockdevs_now = self.hv.list_block_devices(domain)?;
		let finest_name = intervals.finest().name.clone();

		let mut new_tops: BTreeMap<String, PathBuf> = BTreeMap::new();
		let mut incr_by_drive: BTreeMap<String, u32> = BTreeMap::new();
		for s in incomplete {
			let current_top = blockdevs_now
				.get(&s.drive)
				.or_else(|| blockdevs.get(&s.drive))
				.ok_or_else(|| Error::Configuration(format!("drive {} disappeared mid-run", s.drive)))?;
			let had_archive = archive.drive(domain, backupset, &s.drive).map(|d| d.has_base).unwrap_or(false);
			let next_incr = if had_archive {
				highest_incr(archive, domain, backupset, &s.drive) + 1
			} else {
				1
			};
			let basename = new_top_basename(current_top, backupset, next_incr);
			new_tops.insert(s.drive.clone(), current_top.parent().unwrap_or_else(|| Path::new(".")).join(basename));
			incr_by_drive.insert(s.drive.clone(), next_incr);
		}

		let spec = SnapshotSpec {
			new_top_paths: new_tops.iter().map(|(d, p)| (d.as_str(), p.clone())).collect(),
		};
		self.hv.snapshot_disk_only(domain, &spec)?;

		// 4. copy into the archive.
		for s in incomplete {
			let had_archive = archive.drive(domain, backupset, &s.drive).map(|d| d.has_base).unwrap_or(false);
			let former_top = &s.chain[0];

			if !had_archive {
				let dst = archive.path_for(&Filename::base(domain, backupset, s.drive.as_str()));
				image_tool::copy_to_archive(self.tool, former_top, &dst, None, flags.compress, flags.copy)?;
				archive.drive_mut(domain, backupset, &s.drive).has_base = true;
			} else {
				let incr = incr_by_drive[&s.drive];
				let new_filename = Filename::incr(
					domain,
					backupset,
					s.drive.as_str(),
					IncrRange::single(incr),
					finest_name.as_str(),
					0,
				);
				let dst = archive.path_for(&new_filename);
				let backing = previous_top_filename(archive, domain, backupset, &s.drive, &finest_name, incr);
				image_tool::copy_to_archive(
					self.tool,
					former_top,
					&dst,
					backing.as_deref(),
					flags.compress,
					flags.copy,
				)?;
				archive
					.drive_mut(domain, backupset, &s.drive)
					.tier_mut(&finest_name)
					.insert(0, new_filename);
			}
		}

		Ok(())
	}

	fn run_incremental_mode(
		&self,
		archive: &mut Archive,
		domain: &str,
		selected: &[String],
		backupset: u32,
		intervals: &Intervals,
		flags: RunFlags,
	) -> Result<()> {
		let finest = intervals.finest();
		self.hv.trim(domain)?;

		for drive in selected {
			let blockdevs = self.hv.list_block_devices(domain)?;
			let top = blockdevs
				.get(drive)
				.ok_or_else(|| Error::Configuration(format!("unknown drive {drive}")))?;
			let chain = live_chain(self.tool, top, !flags.omit_unsafe)?;
			let Classification::Pending { incr, .. } = classify(&chain, domain, drive)? else {
				return Err(Error::ArchiveInconsistency(format!(
					"{domain}:{drive} must be pending to take an incremental snapshot"
				)));
			};
			let next_incr = incr + 1;
			let new_top = new_top_basename(top, backupset, next_incr);
			let new_top_path = top.parent().unwrap_or_else(|| Path::new(".")).join(new_top);

			let mut new_top_paths = BTreeMap::new();
			new_top_paths.insert(drive.as_str(), new_top_path.clone());
			self.hv
				.snapshot_disk_only(domain, &SnapshotSpec { new_top_paths })?;

			self.hv.block_commit(domain, drive, CommitMode::BaseMerge)?;

			rotator::make_room(
				archive,
				self.tool,
				domain,
				backupset,
				drive,
				&finest.name,
				finest.max_keep,
			)?;

			let new_filename = Filename::incr(
				domain,
				backupset,
				drive.as_str(),
				IncrRange::single(next_incr),
				finest.name.as_str(),
				0,
			);
			let dst = archive.path_for(&new_filename);
			let backing = previous_top_filename(archive, domain, backupset, drive, &finest.name, next_incr);
			image_tool::copy_to_archive(self.tool, &chain[0], &dst, backing.as_deref(), flags.compress, flags.copy)?;
			archive
				.drive_mut(domain, backupset, drive)
				.tier_mut(&finest.name)
				.insert(0, new_filename);
		}
		Ok(())
	}

	fn run_graduation_mode(
		&self,
		archive: &mut Archive,
		domain: &str,
		selected: &[String],
		backupset: u32,
		intervals: &Intervals,
	) -> Result<()> {
		let target_idx = intervals.target_index();
		let Some(finer) = intervals.finer_than(target_idx) else {
			return Err(Error::Configuration(
				"graduation requires a finer tier below the target interval".into(),
			));
		};
		let target = intervals.get(target_idx).expect("target index is valid");

		for drive in selected {
			let finer_tier = archive
				.drive(domain, backupset, drive)
				.and_then(|d| d.tier(&finer.name))
				.cloned();
			let Some(finer_tier) = finer_tier else { continue };
			if finer_tier.len() <= 1 {
				continue; // nothing old enough to promote
			}

			let oldest_ord = *finer_tier.keys().max().unwrap();
			let oldest = finer_tier[&oldest_ord].clone();
			let neighbor_ord = oldest_ord - 1;
			let neighbor = finer_tier.get(&neighbor_ord).cloned();

			let target_has_zero = archive
				.drive(domain, backupset, drive)
				.map(|d| d.tier_count(&target.name))
				.unwrap_or(0)
				> 0
				&& archive
					.drive(domain, backupset, drive)
					.and_then(|d| d.tier(&target.name))
					.map(|t| t.contains_key(&0))
					.unwrap_or(false);

			if target_has_zero {
				rotator::make_room(archive, self.tool, domain, backupset, drive, &target.name, target.max_keep)?;
			}

			let promoted = oldest.with_interval_ord(target.name.clone(), 0);
			archive.rename(domain, backupset, &oldest, &promoted)?;

			if let Some(neighbor) = neighbor {
				archive.rebase(self.tool, &neighbor, &promoted)?;
			}
		}
		Ok(())
	}
}

fn highest_incr(archive: &Archive, domain: &str, backupset: u32, drive: &str) -> u32 {
	archive
		.drive(domain, backupset, drive)
		.map(|d| {
			d.tiers
				.values()
				.flat_map(|t| t.values())
				.filter_map(|f| f.range())
				.map(|r| r.hi)
				.max()
				.unwrap_or(0)
		})
		.unwrap_or(0)
}

/// The basename a freshly-archived increment should rebase onto: ordinal 0 of the given
/// interval if occupied by the previous top, or ordinal 1 once ordinal 0 is this new entry's
/// own about-to-be-inserted slot, or the base if this is the very first increment.
fn previous_top_filename(
	archive: &Archive,
	domain: &str,
	backupset: u32,
	drive: &str,
	interval: &str,
	incr: u32,
) -> Option<String> {
	if incr <= 1 {
		return Some(crate::name_codec::format(&Filename::base(domain, backupset, drive)));
	}
	let tier = archive.drive(domain, backupset, drive)?.tier(interval)?;
	let previous = tier.get(&0).or_else(|| tier.get(&1))?;
	Some(crate::name_codec::format(previous))
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::hypervisor::fake::FakeHypervisor;
	use crate::image_tool::fake::FakeImageTool;
	use crate::name_codec;

	/// Makes the fake image tool's backing-file lookups agree with the fake hypervisor's
	/// in-memory chain, the way a real `qemu-img info` would after a real snapshot or commit.
	fn sync_chain(hv: &FakeHypervisor, tool: &FakeImageTool, drive: &str) {
		let chain = hv.blockdevs.borrow()[drive].clone();
		for (i, path) in chain.iter().enumerate() {
			let name = path.file_name().unwrap().to_string_lossy().into_owned();
			let backing = chain
				.get(i + 1)
				.map(|p| p.file_name().unwrap().to_string_lossy().into_owned());
			tool.set_backing(&name, backing.as_deref());
		}
	}

	fn archive_at(dir: &Path) -> Archive {
		Archive {
			backup_dir: dir.to_path_buf(),
			..Default::default()
		}
	}

	fn target(domain: &str, drives: &[&str]) -> Target {
		Target {
			domain: domain.to_string(),
			drives: drives.iter().map(|s| s.to_string()).collect(),
		}
	}

	#[test]
	fn fresh_domain_archives_base_then_takes_first_incremental_snapshot_next_run() {
		let tmp = tempfile::tempdir().unwrap();
		let top = tmp.path().join("vm1.qcow2");
		std::fs::write(&top, b"").unwrap();

		let tool = FakeImageTool::default();
		let hv = FakeHypervisor::new([("vda", top.clone())]);
		let manager = ChainManager::new(&tool, &hv);
		let mut archive = archive_at(tmp.path());
		let intervals = Intervals::parse("daily:3,weekly:2", None).unwrap();
		let tgt = target("vm1", &[]);

		manager
			.run_target(&mut archive, &tgt, &intervals, RunFlags::default())
			.unwrap();
		sync_chain(&hv, &tool, "vda");

		let drive = archive.drive("vm1", 1, "vda").unwrap();
		assert!(drive.has_base);
		assert_eq!(drive.tier_count("daily"), 0);
		assert_eq!(hv.chain_len("vda"), 2);

		manager
			.run_target(&mut archive, &tgt, &intervals, RunFlags::default())
			.unwrap();

		let drive = archive.drive("vm1", 1, "vda").unwrap();
		assert_eq!(drive.tier_count("daily"), 1);
		// the second run must freeze the still-pending top with a fresh snapshot and fold it
		// back down with a base-merge commit, not copy the guest-writable top directly.
		assert_eq!(hv.commits.borrow().len(), 1);
		assert_eq!(hv.commits.borrow()[0].2, CommitMode::BaseMerge);
		assert_eq!(hv.chain_len("vda"), 2);
	}

	#[test]
	fn incremental_run_overflows_and_fuses_the_daily_tier() {
		let tmp = tempfile::tempdir().unwrap();
		let mut archive = archive_at(tmp.path());
		std::fs::write(tmp.path().join("vm1.b001.vda.base.img"), b"").unwrap();
		archive.drive_mut("vm1", 1, "vda").has_base = true;
		for ord in 0..3u32 {
			let f = Filename::incr("vm1", 1, "vda", IncrRange::single(3 - ord), "daily", ord);
			std::fs::write(tmp.path().join(name_codec::format(&f)), b"").unwrap();
			archive.drive_mut("vm1", 1, "vda").tier_mut("daily").insert(ord, f);
		}

		let live_top = tmp.path().join("vm1.vda.b001.i00003.img");
		let live_base = tmp.path().join("vm1.vda.qcow2");
		std::fs::write(&live_top, b"").unwrap();
		std::fs::write(&live_base, b"").unwrap();

		let tool = FakeImageTool::default();
		tool.set_backing("vm1.vda.b001.i00003.img", Some("vm1.vda.qcow2"));
		let hv = FakeHypervisor::new([("vda", live_top.clone())]);
		hv.blockdevs.borrow_mut().get_mut("vda").unwrap().push(live_base.clone());

		let manager = ChainManager::new(&tool, &hv);
		let intervals = Intervals::parse("daily:3", None).unwrap();
		let tgt = target("vm1", &[]);

		manager
			.run_target(&mut archive, &tgt, &intervals, RunFlags::default())
			.unwrap();

		let drive = archive.drive("vm1", 1, "vda").unwrap();
		assert_eq!(drive.tier_count("daily"), 3);
		let newest = drive.tier("daily").unwrap().get(&0).unwrap();
		assert_eq!(newest.range(), Some(IncrRange::single(4)));
		let fused = drive.tier("daily").unwrap().get(&2).unwrap();
		assert_eq!(fused.range(), Some(IncrRange { lo: 1, hi: 2 }));
		assert_eq!(hv.chain_len("vda"), 2);
	}

	#[test]
	fn graduation_promotes_the_oldest_finer_entry_into_the_coarser_tier() {
		let tmp = tempfile::tempdir().unwrap();
		let mut archive = archive_at(tmp.path());
		std::fs::write(tmp.path().join("vm1.b001.vda.base.img"), b"").unwrap();
		archive.drive_mut("vm1", 1, "vda").has_base = true;

		let newest = Filename::incr("vm1", 1, "vda", IncrRange::single(2), "daily", 0);
		let oldest = Filename::incr("vm1", 1, "vda", IncrRange::single(1), "daily", 1);
		for f in [&newest, &oldest] {
			std::fs::write(tmp.path().join(name_codec::format(f)), b"").unwrap();
		}
		archive.drive_mut("vm1", 1, "vda").tier_mut("daily").insert(0, newest.clone());
		archive.drive_mut("vm1", 1, "vda").tier_mut("daily").insert(1, oldest.clone());

		let tool = FakeImageTool::default();
		tool.set_backing(&name_codec::format(&oldest), Some("vm1.b001.vda.base.img"));
		let hv = FakeHypervisor::new([("vda", tmp.path().join("vm1.vda.qcow2"))]);
		let manager = ChainManager::new(&tool, &hv);
		let intervals = Intervals::parse("daily:2,weekly:4", Some("weekly")).unwrap();

		manager
			.run_graduation_mode(&mut archive, "vm1", &["vda".to_string()], 1, &intervals)
			.unwrap();

		let drive = archive.drive("vm1", 1, "vda").unwrap();
		assert_eq!(drive.tier_count("daily"), 1);
		assert!(drive.tier("daily").unwrap().contains_key(&0));
		assert_eq!(drive.tier_count("weekly"), 1);
		let promoted = drive.tier("weekly").unwrap().get(&0).unwrap();
		assert_eq!(promoted.range(), Some(IncrRange::single(1)));

		let backing = tool.backing.borrow();
		let neighbor_name = name_codec::format(&newest);
		assert_eq!(
			backing.get(&neighbor_name).cloned().flatten(),
			Some(name_codec::format(promoted))
		);
	}

	#[test]
	fn forcing_a_new_chain_pivots_away_the_pending_chain_and_starts_a_fresh_backupset() {
		let tmp = tempfile::tempdir().unwrap();
		let mut archive = archive_at(tmp.path());
		std::fs::write(tmp.path().join("vm1.b001.vda.base.img"), b"").unwrap();
		archive.drive_mut("vm1", 1, "vda").has_base = true;

		let live_top = tmp.path().join("vm1.vda.b001.i00001.img");
		let live_base = tmp.path().join("vm1.vda.qcow2");
		std::fs::write(&live_top, b"").unwrap();
		std::fs::write(&live_base, b"").unwrap();

		let tool = FakeImageTool::default();
		tool.set_backing("vm1.vda.b001.i00001.img", Some("vm1.vda.qcow2"));
		let hv = FakeHypervisor::new([("vda", live_top.clone())]);
		hv.blockdevs.borrow_mut().get_mut("vda").unwrap().push(live_base.clone());

		let manager = ChainManager::new(&tool, &hv);
		let intervals = Intervals::parse("daily:3", None).unwrap();
		let tgt = target("vm1", &[]);
		let flags = RunFlags {
			new_chain: true,
			..Default::default()
		};

		manager.run_target(&mut archive, &tgt, &intervals, flags).unwrap();

		assert!(archive.drive("vm1", 2, "vda").unwrap().has_base);
		assert!(archive.drive("vm1", 1, "vda").unwrap().has_base); // old set untouched
		assert_eq!(hv.commits.borrow().len(), 1);
		assert_eq!(hv.commits.borrow()[0].2, CommitMode::ActivePivot);
	}

	#[test]
	fn domain_with_two_drives_and_no_drive_list_backs_up_all_of_them() {
		let tmp = tempfile::tempdir().unwrap();
		let vda = tmp.path().join("vm1.vda.qcow2");
		let vdb = tmp.path().join("vm1.vdb.qcow2");
		std::fs::write(&vda, b"").unwrap();
		std::fs::write(&vdb, b"").unwrap();

		let tool = FakeImageTool::default();
		let hv = FakeHypervisor::new([("vda", vda.clone()), ("vdb", vdb.clone())]);
		let manager = ChainManager::new(&tool, &hv);
		let mut archive = archive_at(tmp.path());
		let intervals = Intervals::parse("daily:3", None).unwrap();
		let tgt = target("vm1", &[]);

		manager
			.run_target(&mut archive, &tgt, &intervals, RunFlags::default())
			.unwrap();

		assert!(archive.drive("vm1", 1, "vda").unwrap().has_base);
		assert!(archive.drive("vm1", 1, "vdb").unwrap().has_base);
	}

	#[test]
	fn explicit_drive_list_scopes_the_run_to_named_drives_only() {
		let tmp = tempfile::tempdir().unwrap();
		let vda = tmp.path().join("vm1.vda.qcow2");
		let vdb = tmp.path().join("vm1.vdb.qcow2");
		std::fs::write(&vda, b"").unwrap();
		std::fs::write(&vdb, b"").unwrap();

		let tool = FakeImageTool::default();
		let hv = FakeHypervisor::new([("vda", vda.clone()), ("vdb", vdb.clone())]);
		let manager = ChainManager::new(&tool, &hv);
		let mut archive = archive_at(tmp.path());
		let intervals = Intervals::parse("daily:3", None).unwrap();
		let tgt = target("vm1", &["vda"]);

		manager
			.run_target(&mut archive, &tgt, &intervals, RunFlags::default())
			.unwrap();

		assert!(archive.drive("vm1", 1, "vda").unwrap().has_base);
		assert!(archive.drive("vm1", 1, "vdb").is_none());
		assert_eq!(hv.chain_len("vdb"), 1);
	}

	#[test]
	fn unknown_drive_in_target_is_a_configuration_error() {
		let tmp = tempfile::tempdir().unwrap();
		let vda = tmp.path().join("vm1.vda.qcow2");
		std::fs::write(&vda, b"").unwrap();

		let tool = FakeImageTool::default();
		let hv = FakeHypervisor::new([("vda", vda.clone())]);
		let manager = ChainManager::new(&tool, &hv);
		let mut archive = archive_at(tmp.path());
		let intervals = Intervals::parse("daily:3", None).unwrap();
		let tgt = target("vm1", &["vdz"]);

		let err = manager.run_target(&mut archive, &tgt, &intervals, RunFlags::default());
		assert!(matches!(err, Err(Error::Configuration(_))));
	}

	#[test]
	fn a_live_chain_longer_than_two_images_is_a_fatal_inconsistency() {
		let tmp = tempfile::tempdir().unwrap();
		let top = tmp.path().join("vm1.b001.i00002.img");
		let mid = tmp.path().join("vm1.b001.i00001.img");
		let base = tmp.path().join("vm1.qcow2");
		for p in [&top, &mid, &base] {
			std::fs::write(p, b"").unwrap();
		}

		let tool = FakeImageTool::default();
		tool.set_backing("vm1.b001.i00002.img", Some("vm1.b001.i00001.img"));
		tool.set_backing("vm1.b001.i00001.img", Some("vm1.qcow2"));

		let hv = FakeHypervisor::new([("vda", top.clone())]);
		let manager = ChainManager::new(&tool, &hv);
		let mut archive = archive_at(tmp.path());
		let intervals = Intervals::parse("daily:3", None).unwrap();
		let tgt = target("vm1", &[]);

		let err = manager.run_target(&mut archive, &tgt, &intervals, RunFlags::default());
		assert!(matches!(err, Err(Error::LiveChainTooLong { .. })));
	}
}
