//! Interval ladder and run configuration, parsed out of the CLI surface.

use std::path::PathBuf;

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interval {
	pub name: String,
	pub max_keep: u32,
	/// Position in the ladder, finest first. Index 0 is the finest tier.
	pub order: usize,
}

/// The full interval ladder for a run, finest-first, and the index of the tier this run
/// targets.
#[derive(Debug, Clone)]
pub struct Intervals {
	tiers: Vec<Interval>,
	target: usize,
}

const DEFAULT_KEEP: u32 = 3;

impl Intervals {
	/// Parses `--intervals` (`name[:keep],...`) and resolves `--interval` (a tier name,
	/// defaulting to the finest tier) against it.
	pub fn parse(spec: &str, target_name: Option<&str>) -> Result<Self> {
		let mut tiers = Vec::new();
		for (order, entry) in spec.split(',').enumerate() {
			let entry = entry.trim();
			if entry.is_empty() {
				return Err(Error::Configuration(format!(
					"empty interval entry in '{spec}'"
				)));
			}
			let (name, keep) = match entry.split_once(':') {
				Some((name, keep)) => {
					let keep: u32 = keep.parse().map_err(|_| {
						Error::Configuration(format!("interval keep count must be an integer: '{keep}'"))
					})?;
					(name, keep)
				}
				None => (entry, DEFAULT_KEEP),
			};
			if keep < 1 {
				return Err(Error::Configuration(
					"interval keep count must be >= 1".into(),
				));
			}
			if tiers.iter().any(|t: &Interval| t.name == name) {
				return Err(Error::Configuration(format!("duplicate interval '{name}'")));
			}
			tiers.push(Interval {
				name: name.to_string(),
				max_keep: keep,
				order,
			});
		}
		if tiers.is_empty() {
			return Err(Error::Configuration("no intervals configured".into()));
		}

		let target = match target_name {
			None => 0,
			Some(name) => tiers
				.iter()
				.position(|t| t.name == name)
				.ok_or_else(|| Error::Configuration(format!("unknown target interval '{name}'")))?,
		};

		Ok(Self { tiers, target })
	}

	pub fn tiers(&self) -> &[Interval] {
		&self.tiers
	}

	pub fn finest(&self) -> &Interval {
		&self.tiers[0]
	}

	pub fn target(&self) -> &Interval {
		&self.tiers[self.target]
	}

	pub fn target_index(&self) -> usize {
		self.target
	}

	/// The tier immediately finer than `index`, if any.
	pub fn finer_than(&self, index: usize) -> Option<&Interval> {
		index.checked_sub(1).and_then(|i| self.tiers.get(i))
	}

	pub fn get(&self, index: usize) -> Option<&Interval> {
		self.tiers.get(index)
	}
}

/// A single backup target: a domain and the drives selected on it (empty = all disk-typed
/// block devices).
#[derive(Debug, Clone)]
pub struct Target {
	pub domain: String,
	pub drives: Vec<String>,
}

impl Target {
	pub fn parse(spec: &str) -> Result<Self> {
		let mut parts = spec.splitn(2, ':');
		let domain = parts
			.next()
			.filter(|s| !s.is_empty())
			.ok_or_else(|| Error::Configuration(format!("invalid target '{spec}'")))?
			.to_string();
		let drives = match parts.next() {
			Some(list) => list.split(',').map(|s| s.to_string()).collect(),
			None => Vec::new(),
		};
		Ok(Self { domain, drives })
	}
}

#[derive(Debug, Clone)]
pub struct Config {
	pub backup_dir: PathBuf,
	pub intervals: Intervals,
	pub new_chain: bool,
	pub compress: bool,
	pub copy: bool,
	pub omit_unsafe: bool,
	pub targets: Vec<Target>,
}

impl Config {
	pub fn lock_path(&self) -> PathBuf {
		self.backup_dir.join(".vmchain-backup.lock")
	}
}
