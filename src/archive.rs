//! In-memory model of the backup directory: `Archive { domains } -> DomainArc { sets } ->
//! SetArc { drives } -> DriveArc { tiers, chain }`, per the re-architecture in spec's design
//! notes. All mutations go through methods that perform the underlying filesystem operation
//! first and update the map only after it succeeds, so the tree can never diverge from disk.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{Error, Result};
use crate::image_tool::ImageTool;
use crate::name_codec::{self, Filename, Kind};

/// A drive's known archive state: per-interval ordinal maps, plus the longest backing chain of
/// basenames seen while scanning (oldest-to-... actually newest-first, top of chain first).
#[derive(Debug, Clone, Default)]
pub struct DriveArc {
	pub tiers: BTreeMap<String, BTreeMap<u32, Filename>>,
	pub has_base: bool,
}

impl DriveArc {
	pub fn tier(&self, name: &str) -> Option<&BTreeMap<u32, Filename>> {
		self.tiers.get(name)
	}

	pub fn tier_mut(&mut self, name: &str) -> &mut BTreeMap<u32, Filename> {
		self.tiers.entry(name.to_string()).or_default()
	}

	pub fn tier_count(&self, name: &str) -> usize {
		self.tiers.get(name).map(|t| t.len()).unwrap_or(0)
	}
}

pub type SetArc = BTreeMap<String, DriveArc>; // drive -> DriveArc
pub type DomainArc = BTreeMap<u32, SetArc>; // backupset -> SetArc

#[derive(Debug, Clone, Default)]
pub struct Archive {
	pub backup_dir: PathBuf,
	pub domains: BTreeMap<String, DomainArc>,
}

impl Archive {
	/// Scans the backup directory and builds the in-memory model, per spec 4.4. Unparseable
	/// filenames are warned about and skipped; a base image with a backing file is a fatal
	/// inconsistency (I3).
	pub fn scan(backup_dir: &Path, tool: &dyn ImageTool, omit_unsafe: bool) -> Result<Self> {
		if !backup_dir.is_dir() {
			return Err(Error::Configuration(format!(
				"backup directory does not exist: {}",
				backup_dir.display()
			)));
		}

		let mut archive = Archive {
			backup_dir: backup_dir.to_path_buf(),
			domains: BTreeMap::new(),
		};

		let pattern = backup_dir.join("*.img");
		let pattern = pattern.to_string_lossy().into_owned();
		for entry in glob::glob(&pattern)
			.map_err(|e| Error::Configuration(format!("invalid backup dir pattern: {e}")))?
		{
			let path = entry.map_err(|e| Error::Configuration(e.to_string()))?;
			let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
				continue;
			};
			let Some(filename) = name_codec::parse(name) else {
				warn!(file = name, "skipping file that does not match archive grammar");
				continue;
			};

			let info = tool.info(&path, !omit_unsafe)?;
			if filename.is_base() && info.backing_file.is_some() {
				return Err(Error::ArchiveInconsistency(format!(
					"base image {name} must not have a backing file"
				)));
			}

			let drive = archive
				.domains
				.entry(filename.domain.clone())
				.or_default()
				.entry(filename.backupset)
				.or_default()
				.entry(filename.drive.clone())
				.or_default();

			match &filename.kind {
				Kind::Base => drive.has_base = true,
				Kind::Incr { interval, ord, .. } => {
					drive.tier_mut(interval).insert(*ord, filename.clone());
				}
			}
		}

		Ok(archive)
	}

	pub fn domain(&self, domain: &str) -> Option<&DomainArc> {
		self.domains.get(domain)
	}

	pub fn active_backupset(&self, domain: &str) -> Option<u32> {
		self.domains.get(domain).and_then(|d| d.keys().max().copied())
	}

	pub fn drive(&self, domain: &str, backupset: u32, drive: &str) -> Option<&DriveArc> {
		self.domains.get(domain)?.get(&backupset)?.get(drive)
	}

	pub fn drive_mut(&mut self, domain: &str, backupset: u32, drive: &str) -> &mut DriveArc {
		self.domains
			.entry(domain.to_string())
			.or_default()
			.entry(backupset)
			.or_default()
			.entry(drive.to_string())
			.or_default()
	}

	pub fn path_for(&self, filename: &Filename) -> PathBuf {
		self.backup_dir.join(name_codec::format(filename))
	}

	/// Renames `old` to `new` on disk (preserving mtime/atime), then updates the index: removes
	/// the entry at `old`'s ordinal and inserts `new` at its own ordinal, within the given
	/// drive's tier. The filesystem op happens first so the index can never point at a name
	/// that doesn't exist on disk.
	pub fn rename(&mut self, domain: &str, backupset: u32, old: &Filename, new: &Filename) -> Result<()> {
		let old_path = self.path_for(old);
		let new_path = self.path_for(new);
		let times = file_times(&old_path)?;
		std::fs::rename(&old_path, &new_path)?;
		preserve_times(&new_path, times)?;

		let drive = self.drive_mut(domain, backupset, &old.drive);
		if let (Some(old_interval), Some(old_ord)) = (old.interval(), old.ord()) {
			drive.tier_mut(old_interval).remove(&old_ord);
		}
		if let (Some(new_interval), Some(new_ord)) = (new.interval(), new.ord()) {
			drive.tier_mut(new_interval).insert(new_ord, new.clone());
		} else {
			drive.has_base = true;
		}
		Ok(())
	}

	/// Removes a file from disk and from the index.
	pub fn unlink(&mut self, domain: &str, backupset: u32, filename: &Filename) -> Result<()> {
		let path = self.path_for(filename);
		std::fs::remove_file(&path)?;
		let drive = self.drive_mut(domain, backupset, &filename.drive);
		if let (Some(interval), Some(ord)) = (filename.interval(), filename.ord()) {
			drive.tier_mut(interval).remove(&ord);
		}
		Ok(())
	}

	/// Rebases `target` onto `new_backing`'s basename, both on disk and recording nothing in
	/// the index (backing pointers are not cached there; the filesystem is authoritative and
	/// re-read by `info` on next scan). Still goes through the adapter so mtime/atime are
	/// preserved.
	pub fn rebase(&self, tool: &dyn ImageTool, target: &Filename, new_backing: &Filename) -> Result<()> {
		let target_path = self.path_for(target);
		let backing_name = name_codec::format(new_backing);
		tool.rebase(&target_path, &backing_name)
	}

	/// Verifies I2 for one (domain, backupset, drive, interval): ordinals must form a dense
	/// `0..k` range. If a hole exists at ordinal 0, shifts ordinals down by one to close it, per
	/// the repair rule in spec 4.5 Step C. Refuses (rather than looping) if a single shift does
	/// not produce a dense range, per the Open Question resolution in DESIGN.md.
	pub fn repair_tier(&mut self, domain: &str, backupset: u32, drive: &str, interval: &str) -> Result<()> {
		let drive_arc = self.drive_mut(domain, backupset, drive);
		let Some(tier) = drive_arc.tiers.get(interval) else {
			return Ok(());
		};
		if tier.is_empty() {
			return Ok(());
		}

		if !tier.contains_key(&0) {
			let old: Vec<(u32, Filename)> = tier.iter().map(|(o, f)| (*o, f.clone())).collect();
			for (ord, filename) in old {
				let new_filename = filename.with_ord(ord - 1);
				self.rename(domain, backupset, &filename, &new_filename)?;
			}
		}

		let drive_arc = self.drive_mut(domain, backupset, drive);
		let tier = drive_arc.tiers.entry(interval.to_string()).or_default();
		let max = *tier.keys().last().unwrap_or(&0);
		for ord in 0..=max {
			if !tier.contains_key(&ord) {
				return Err(Error::ArchiveInconsistency(format!(
					"{domain} b{backupset:03} {drive} {interval}: ordinal {ord} missing after repair"
				)));
			}
		}
		Ok(())
	}
}

pub fn file_times(path: &Path) -> Result<std::fs::FileTimes> {
	let meta = std::fs::metadata(path)?;
	Ok(std::fs::FileTimes::new()
		.set_accessed(meta.accessed()?)
		.set_modified(meta.modified()?))
}

pub fn preserve_times(path: &Path, times: std::fs::FileTimes) -> Result<()> {
	std::fs::File::options()
		.write(true)
		.open(path)?
		.set_times(times)?;
	Ok(())
}
