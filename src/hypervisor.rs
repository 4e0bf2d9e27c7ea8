//! Wraps the hypervisor control surface (`virsh`) needed to list a domain's block devices,
//! take disk-only quiesced snapshots, run block-commit, and trigger a guest trim.
//!
//! The hypervisor control API itself (domain lookup, XML schema, snapshot/commit semantics) is
//! an external collaborator per spec scope; this module is the thin adapter over it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::thread::sleep;
use std::time::Duration;

use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tracing::warn;

use crate::error::{Error, Result};

/// How long to wait after issuing a guest trim before snapshotting, so the trim's freed
/// blocks have propagated into image allocation. Order of minutes, per spec 4.2.
const TRIM_GRACE_PERIOD: Duration = Duration::from_secs(4 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
	/// Merge everything below the top into the base; live chain keeps length 2 with a fresh
	/// top.
	BaseMerge,
	/// Collapse the entire chain into one image and make the guest write to it directly.
	ActivePivot,
}

/// Per-drive instruction for a disk-only snapshot: drives not present here are marked
/// `snapshot='no'` in the generated XML.
pub struct SnapshotSpec<'a> {
	pub new_top_paths: BTreeMap<&'a str, PathBuf>,
}

pub trait Hypervisor {
	/// Ordered mapping of target-dev to current top image path, for disk-typed block devices.
	fn list_block_devices(&self, domain: &str) -> Result<BTreeMap<String, PathBuf>>;
	fn snapshot_disk_only(&self, domain: &str, spec: &SnapshotSpec<'_>) -> Result<()>;
	fn block_commit(&self, domain: &str, dev: &str, mode: CommitMode) -> Result<()>;
	fn trim(&self, domain: &str) -> Result<()>;
}

pub struct VirshHypervisor;

fn run_virsh(domain: &str, args: &[&str]) -> Result<String> {
	let out = duct::cmd("virsh", args)
		.stdout_capture()
		.stderr_capture()
		.unchecked()
		.run()
		.map_err(|e| Error::Hypervisor {
			domain: domain.to_string(),
			detail: e.to_string(),
		})?;
	if !out.status.success() {
		let stderr = String::from_utf8_lossy(&out.stderr);
		if stderr.contains("Domain not found") || stderr.contains("failed to get domain") {
			return Err(Error::DomainNotFound(domain.to_string()));
		}
		return Err(Error::Hypervisor {
			domain: domain.to_string(),
			detail: stderr.trim().to_string(),
		});
	}
	Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Parses `devices/disk[@device='disk']/target/@dev` and `.../source/@file` out of a domain's
/// live XML description.
fn parse_block_devices(xml: &str) -> Result<BTreeMap<String, PathBuf>> {
	let mut reader = Reader::from_str(xml);
	reader.config_mut().trim_text(true);

	let mut devices = BTreeMap::new();
	let mut in_disk = false;
	let mut is_disk_typed = false;
	let mut dev: Option<String> = None;
	let mut file: Option<String> = None;

	loop {
		match reader.read_event() {
			Ok(Event::Start(e)) => {
				let local = e.local_name();
				let name = local.as_ref();
				if name == b"disk" {
					in_disk = true;
					is_disk_typed = e
						.attributes()
						.flatten()
						.any(|a| a.key.as_ref() == b"device" && &*a.value == b"disk");
					dev = None;
					file = None;
				} else if in_disk && name == b"target" {
					dev = e
						.attributes()
						.flatten()
						.find(|a| a.key.as_ref() == b"dev")
						.map(|a| String::from_utf8_lossy(&a.value).into_owned());
				} else if in_disk && name == b"source" {
					file = e
						.attributes()
						.flatten()
						.find(|a| a.key.as_ref() == b"file")
						.map(|a| String::from_utf8_lossy(&a.value).into_owned());
				}
			}
			// Self-closed elements (`<disk/>`, `<target .../>`) never carry children, so a
			// self-closed `disk` has nothing to record; one without a nested `source` (e.g. an
			// empty cdrom) is likewise not something to insert.
			Ok(Event::Empty(e)) => {
				let local = e.local_name();
				let name = local.as_ref();
				if in_disk && name == b"target" {
					dev = e
						.attributes()
						.flatten()
						.find(|a| a.key.as_ref() == b"dev")
						.map(|a| String::from_utf8_lossy(&a.value).into_owned());
				} else if in_disk && name == b"source" {
					file = e
						.attributes()
						.flatten()
						.find(|a| a.key.as_ref() == b"file")
						.map(|a| String::from_utf8_lossy(&a.value).into_owned());
				}
			}
			Ok(Event::End(e)) => {
				if e.local_name().as_ref() == b"disk" {
					if is_disk_typed {
						if let (Some(dev), Some(file)) = (dev.take(), file.take()) {
							devices.insert(dev, PathBuf::from(file));
						}
					}
					in_disk = false;
					is_disk_typed = false;
				}
			}
			Ok(Event::Eof) => break,
			Err(e) => {
				return Err(Error::ArchiveInconsistency(format!(
					"could not parse domain XML: {e}"
				)))
			}
			_ => {}
		}
	}

	Ok(devices)
}

fn snapshot_xml(domain_id: &str, blockdevs: &BTreeMap<String, PathBuf>, spec: &SnapshotSpec<'_>) -> String {
	let mut xml = format!("<domainsnapshot><name>{domain_id}.snapshot</name><disks>");
	for (dev, new_path) in &spec.new_top_paths {
		xml += &format!(
			"<disk name='{dev}'><source file='{}'/></disk>",
			new_path.display()
		);
	}
	for dev in blockdevs.keys() {
		if !spec.new_top_paths.contains_key(dev.as_str()) {
			xml += &format!("<disk name='{dev}' snapshot='no' />");
		}
	}
	xml += "</disks></domainsnapshot>";
	xml
}

impl Hypervisor for VirshHypervisor {
	fn list_block_devices(&self, domain: &str) -> Result<BTreeMap<String, PathBuf>> {
		let xml = run_virsh(domain, &["dumpxml", domain])?;
		parse_block_devices(&xml)
	}

	fn snapshot_disk_only(&self, domain: &str, spec: &SnapshotSpec<'_>) -> Result<()> {
		let blockdevs = self.list_block_devices(domain)?;
		let xml = snapshot_xml(domain, &blockdevs, spec);

		let xml_path = std::env::temp_dir().join(format!("vmchain-backup.{}.snap.xml", std::process::id()));
		std::fs::write(&xml_path, &xml)?;

		run_virsh(
			domain,
			&[
				"snapshot-create",
				domain,
				xml_path.to_str().unwrap_or_default(),
				"--disk-only",
				"--quiesce",
				"--atomic",
			],
		)?;
		let _ = std::fs::remove_file(&xml_path);

		// The on-disk chain is the source of truth; the hypervisor need not remember the
		// snapshot once it has been created.
		run_virsh(
			domain,
			&[
				"snapshot-delete",
				domain,
				&format!("{domain}.snapshot"),
				"--metadata",
			],
		)?;
		Ok(())
	}

	fn block_commit(&self, domain: &str, dev: &str, mode: CommitMode) -> Result<()> {
		match mode {
			CommitMode::BaseMerge => {
				run_virsh(domain, &["blockcommit", domain, dev, "--wait"])?;
			}
			CommitMode::ActivePivot => {
				run_virsh(
					domain,
					&["blockcommit", domain, dev, "--active", "--wait", "--pivot"],
				)?;
			}
		}
		Ok(())
	}

	fn trim(&self, domain: &str) -> Result<()> {
		if let Err(e) = run_virsh(domain, &["domfstrim", domain]) {
			warn!(domain, error = %e, "guest trim failed; continuing (trim is best-effort)");
			return Ok(());
		}
		sleep(TRIM_GRACE_PERIOD);
		Ok(())
	}
}

#[cfg(test)]
pub mod fake {
	use super::*;
	use std::cell::RefCell;

	/// An in-memory double for [`Hypervisor`] used by Chain Manager tests. Live chains are
	/// modelled directly as the vector of image paths a real chain walk would produce; tests
	/// set them up and assert on how the Chain Manager mutates them.
	pub struct FakeHypervisor {
		pub blockdevs: RefCell<BTreeMap<String, Vec<PathBuf>>>,
		pub trims: RefCell<Vec<String>>,
		pub commits: RefCell<Vec<(String, String, CommitMode)>>,
	}

	impl FakeHypervisor {
		pub fn new(drives: impl IntoIterator<Item = (&'static str, PathBuf)>) -> Self {
			let mut blockdevs = BTreeMap::new();
			for (dev, top) in drives {
				blockdevs.insert(dev.to_string(), vec![top]);
			}
			Self {
				blockdevs: RefCell::new(blockdevs),
				trims: RefCell::new(Vec::new()),
				commits: RefCell::new(Vec::new()),
			}
		}

		/// Current chain length for a drive, as the hypervisor would report it.
		pub fn chain_len(&self, dev: &str) -> usize {
			self.blockdevs.borrow()[dev].len()
		}
	}

	impl Hypervisor for FakeHypervisor {
		fn list_block_devices(&self, _domain: &str) -> Result<BTreeMap<String, PathBuf>> {
			Ok(self
				.blockdevs
				.borrow()
				.iter()
				.map(|(dev, chain)| (dev.clone(), chain[0].clone()))
				.collect())
		}

		fn snapshot_disk_only(&self, _domain: &str, spec: &SnapshotSpec<'_>) -> Result<()> {
			let mut blockdevs = self.blockdevs.borrow_mut();
			for (dev, new_top) in &spec.new_top_paths {
				let chain = blockdevs
					.get_mut(*dev)
					.ok_or_else(|| Error::Configuration(format!("unknown drive {dev}")))?;
				chain.insert(0, new_top.clone());
			}
			Ok(())
		}

		fn block_commit(&self, domain: &str, dev: &str, mode: CommitMode) -> Result<()> {
			self.commits
				.borrow_mut()
				.push((domain.to_string(), dev.to_string(), mode));
			let mut blockdevs = self.blockdevs.borrow_mut();
			let chain = blockdevs
				.get_mut(dev)
				.ok_or_else(|| Error::Configuration(format!("unknown drive {dev}")))?;
			match mode {
				CommitMode::ActivePivot => {
					let top = chain[0].clone();
					chain.clear();
					chain.push(top);
				}
				CommitMode::BaseMerge => {
					// Only the backing files below the top fold together; the top keeps
					// taking guest writes, so the chain stays length 2.
					if chain.len() > 1 {
						let top = chain[0].clone();
						let merged_base = chain.last().unwrap().clone();
						chain.clear();
						chain.push(top);
						chain.push(merged_base);
					}
				}
			}
			Ok(())
		}

		fn trim(&self, domain: &str) -> Result<()> {
			self.trims.borrow_mut().push(domain.to_string());
			Ok(())
		}
	}
}
