//! The interval-rotation algorithm: fold a tier's oldest two images into one when it overflows,
//! and shift ordinals up to make room for a new ordinal 0. Mirrors
//! `original_source/qemu-backup.py`'s `img_rotate_interval`, generalized off the hardcoded
//! `daily` tier to any configured interval.

use crate::archive::Archive;
use crate::error::{Error, Result};
use crate::image_tool::ImageTool;
use crate::name_codec::{Filename, IncrRange};

/// Runs overflow-collapse (if the tier is at or over capacity) followed by shift-up, to make
/// room for a new ordinal-0 entry. `backing_after_shift` is the filename the post-shift
/// ordinal-0 slot's *new* neighbour (ordinal 1) should end up rebased onto once the caller
/// inserts its own new top there; this function does not insert anything at ordinal 0 itself,
/// matching spec 4.6 (shift-up only "drops what was at ordinal 0... it has become ordinal 1").
pub fn make_room(
	archive: &mut Archive,
	tool: &dyn ImageTool,
	domain: &str,
	backupset: u32,
	drive: &str,
	interval: &str,
	max_keep: u32,
) -> Result<()> {
	overflow_collapse(archive, tool, domain, backupset, drive, interval, max_keep)?;
	shift_up(archive, tool, domain, backupset, drive, interval)
}

/// Step 1 of spec 4.6: when a tier holds `>= max_keep` images, fuse the oldest two kept
/// ordinals into one via commit+rebase, discarding anything strictly between them.
fn overflow_collapse(
	archive: &mut Archive,
	tool: &dyn ImageTool,
	domain: &str,
	backupset: u32,
	drive: &str,
	interval: &str,
	max_keep: u32,
) -> Result<()> {
	let Some(tier) = archive.drive(domain, backupset, drive).and_then(|d| d.tier(interval)) else {
		return Ok(());
	};
	let n = match tier.keys().max() {
		Some(n) => *n,
		None => return Ok(()),
	};
	if (n as u64 + 1) < max_keep as u64 {
		return Ok(());
	}
	if max_keep < 2 {
		return Err(Error::Configuration(format!(
			"interval '{interval}' keep count must be >= 2 to ever overflow-collapse"
		)));
	}

	let base_ord = n;
	let top_ord = max_keep - 2;
	let tier = archive.drive(domain, backupset, drive).unwrap().tier(interval).unwrap();
	let base_file = tier
		.get(&base_ord)
		.cloned()
		.ok_or_else(|| Error::ArchiveInconsistency(format!("missing ordinal {base_ord} in {interval}")))?;
	let top_file = tier
		.get(&top_ord)
		.cloned()
		.ok_or_else(|| Error::ArchiveInconsistency(format!("missing ordinal {top_ord} in {interval}")))?;

	let base_path = archive.path_for(&base_file);
	let top_path = archive.path_for(&top_file);
	tool.commit(&top_path, &base_path)?;

	// The commit merged top's data down into base; top and anything strictly between top and
	// base are now folded away and can be unlinked. base itself is about to be renamed to the
	// fused name rather than unlinked.
	for ord in top_ord..base_ord {
		if let Some(f) = archive
			.drive(domain, backupset, drive)
			.and_then(|d| d.tier(interval))
			.and_then(|t| t.get(&ord))
			.cloned()
		{
			archive.unlink(domain, backupset, &f)?;
		}
	}

	let old_base_range = base_file.range().ok_or_else(|| {
		Error::ArchiveInconsistency(format!("{interval} ordinal {base_ord} is not an increment file"))
	})?;
	let old_top_range = top_file.range().ok_or_else(|| {
		Error::ArchiveInconsistency(format!("{interval} ordinal {top_ord} is not an increment file"))
	})?;
	let fused_range = IncrRange {
		lo: old_base_range.lo,
		hi: old_top_range.hi,
	};
	let fused_name = base_file.with_range(fused_range).with_ord(top_ord);

	archive.rename(domain, backupset, &base_file, &fused_name)?;

	// Rebase the neighbor now sitting at ordinal top_ord - 1 onto the fused file, since it
	// used to point at `top_file` (now deleted) and must not dangle.
	if top_ord > 0 {
		if let Some(neighbor) = archive
			.drive(domain, backupset, drive)
			.and_then(|d| d.tier(interval))
			.and_then(|t| t.get(&(top_ord - 1)))
			.cloned()
		{
			archive.rebase(tool, &neighbor, &fused_name)?;
		}
	}

	Ok(())
}

/// Step 2 of spec 4.6: shift every ordinal in the tier up by one, renaming before rebasing the
/// child that now sits below it, so no live chain link ever points at a name that has not yet
/// been created. Drops what was at ordinal 0 from the live map.
fn shift_up(
	archive: &mut Archive,
	tool: &dyn ImageTool,
	domain: &str,
	backupset: u32,
	drive: &str,
	interval: &str,
) -> Result<()> {
	let Some(tier) = archive.drive(domain, backupset, drive).and_then(|d| d.tier(interval)) else {
		return Ok(());
	};
	if tier.is_empty() {
		return Ok(());
	}
	let max = *tier.keys().max().unwrap();

	let mut renamed: Vec<Filename> = Vec::with_capacity(max as usize + 1);
	for ord in (0..=max).rev() {
		let old = archive
			.drive(domain, backupset, drive)
			.and_then(|d| d.tier(interval))
			.and_then(|t| t.get(&ord))
			.cloned()
			.ok_or_else(|| Error::ArchiveInconsistency(format!("missing ordinal {ord} in {interval}")))?;
		let new = old.with_ord(ord + 1);
		archive.rename(domain, backupset, &old, &new)?;
		renamed.push(new);
	}
	// `renamed` is now ordered newest-shifted-first (was ordinal `max`..0, now `max+1`..1).
	for i in 0..renamed.len().saturating_sub(1) {
		let child = &renamed[i + 1]; // now sits one ordinal below `renamed[i]`
		archive.rebase(tool, child, &renamed[i])?;
	}
	Ok(())
}
