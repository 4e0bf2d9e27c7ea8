//! Parses and formats the archive filename grammar.
//!
//! `<domain>.b<BBB>.<drive>.base.img`
//! `<domain>.b<BBB>.<drive>.i<NNNNN>[-<NNNNN>].<interval>.<ord>.img`
//!
//! This is the single source of truth for filename structure; every other component goes
//! through here instead of splitting strings itself.

use std::fmt;

use regex::Regex;
use std::sync::OnceLock;

/// An increment number, or a fused range of increment numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IncrRange {
	pub lo: u32,
	pub hi: u32,
}

impl IncrRange {
	pub fn single(n: u32) -> Self {
		Self { lo: n, hi: n }
	}
}

impl fmt::Display for IncrRange {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		if self.lo == self.hi {
			write!(f, "i{:05}", self.lo)
		} else {
			write!(f, "i{:05}-{:05}", self.lo, self.hi)
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Kind {
	Base,
	Incr {
		range: IncrRange,
		interval: String,
		ord: u32,
	},
}

/// A parsed archive filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filename {
	pub domain: String,
	pub backupset: u32,
	pub drive: String,
	pub kind: Kind,
}

impl Filename {
	pub fn base(domain: impl Into<String>, backupset: u32, drive: impl Into<String>) -> Self {
		Self {
			domain: domain.into(),
			backupset,
			drive: drive.into(),
			kind: Kind::Base,
		}
	}

	pub fn incr(
		domain: impl Into<String>,
		backupset: u32,
		drive: impl Into<String>,
		range: IncrRange,
		interval: impl Into<String>,
		ord: u32,
	) -> Self {
		Self {
			domain: domain.into(),
			backupset,
			drive: drive.into(),
			kind: Kind::Incr {
				range,
				interval: interval.into(),
				ord,
			},
		}
	}

	pub fn is_base(&self) -> bool {
		matches!(self.kind, Kind::Base)
	}

	/// The `i<NNNNN>[-<NNNNN>]` for increment files; `None` for bases.
	pub fn range(&self) -> Option<IncrRange> {
		match &self.kind {
			Kind::Base => None,
			Kind::Incr { range, .. } => Some(*range),
		}
	}

	pub fn interval(&self) -> Option<&str> {
		match &self.kind {
			Kind::Base => None,
			Kind::Incr { interval, .. } => Some(interval),
		}
	}

	pub fn ord(&self) -> Option<u32> {
		match &self.kind {
			Kind::Base => None,
			Kind::Incr { ord, .. } => Some(*ord),
		}
	}

	/// Returns a copy of this filename at a different ordinal, keeping everything else.
	pub fn with_ord(&self, new_ord: u32) -> Self {
		let mut out = self.clone();
		if let Kind::Incr { ord, .. } = &mut out.kind {
			*ord = new_ord;
		}
		out
	}

	/// Returns a copy of this filename with a different interval and ordinal (used for
	/// graduation, where an image moves to the next coarser tier).
	pub fn with_interval_ord(&self, new_interval: impl Into<String>, new_ord: u32) -> Self {
		let mut out = self.clone();
		if let Kind::Incr { interval, ord, .. } = &mut out.kind {
			*interval = new_interval.into();
			*ord = new_ord;
		}
		out
	}

	/// Returns a copy of this filename with a fused range, keeping interval and ordinal.
	pub fn with_range(&self, new_range: IncrRange) -> Self {
		let mut out = self.clone();
		if let Kind::Incr { range, .. } = &mut out.kind {
			*range = new_range;
		}
		out
	}
}

impl fmt::Display for Filename {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}.b{:03}.{}.", self.domain, self.backupset, self.drive)?;
		match &self.kind {
			Kind::Base => write!(f, "base.img"),
			Kind::Incr {
				range,
				interval,
				ord,
			} => write!(f, "{range}.{interval}.{ord}.img"),
		}
	}
}

fn base_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| {
		Regex::new(r"^(?P<domain>.+)\.b(?P<bset>\d{3,})\.(?P<drive>[^.]+)\.base\.img$").unwrap()
	})
}

fn incr_re() -> &'static Regex {
	static RE: OnceLock<Regex> = OnceLock::new();
	RE.get_or_init(|| {
		Regex::new(
			r"^(?P<domain>.+)\.b(?P<bset>\d{3,})\.(?P<drive>[^.]+)\.i(?P<lo>\d{5,})(-(?P<hi>\d{5,}))?\.(?P<interval>[^.]+)\.(?P<ord>\d+)\.img$",
		)
		.unwrap()
	})
}

/// Parses an archive filename. Returns `None` (rather than an error) for anything that does
/// not match the grammar, so callers can warn-and-skip unrelated files in the backup
/// directory (per the Archive Index's startup scan).
pub fn parse(name: &str) -> Option<Filename> {
	if let Some(caps) = base_re().captures(name) {
		return Some(Filename::base(
			caps["domain"].to_string(),
			caps["bset"].parse().ok()?,
			caps["drive"].to_string(),
		));
	}

	let caps = incr_re().captures(name)?;
	let lo: u32 = caps["lo"].parse().ok()?;
	let hi: u32 = caps
		.name("hi")
		.map(|m| m.as_str().parse())
		.transpose()
		.ok()?
		.unwrap_or(lo);
	Some(Filename::incr(
		caps["domain"].to_string(),
		caps["bset"].parse().ok()?,
		caps["drive"].to_string(),
		IncrRange { lo, hi },
		caps["interval"].to_string(),
		caps["ord"].parse().ok()?,
	))
}

/// Formats a parsed filename back to its canonical on-disk form. Inverse of [`parse`].
pub fn format(filename: &Filename) -> String {
	filename.to_string()
}
