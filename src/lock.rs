//! A single advisory exclusive lock per backup directory, so two invocations against the same
//! archive never interleave their filesystem mutations. Mirrors `original_source/qemu-backup.py`'s
//! `fcntl.flock` use, but scoped to `<backup-dir>/.vmchain-backup.lock` instead of a single
//! hardcoded `/tmp` path (see DESIGN.md for why).

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs4::fs_std::FileExt;

use crate::error::{Error, Result};

/// Holds the lock for as long as it is alive; dropping it releases the lock (and closing the
/// file descriptor on process exit does the same, so a crash never leaves a stale lock).
pub struct Lock {
	_file: File,
}

impl Lock {
	pub fn acquire(path: &Path) -> Result<Self> {
		let file = OpenOptions::new().create(true).write(true).open(path)?;
		if file.try_lock_exclusive().is_err() {
			return Err(Error::LockHeld {
				backup_dir: path.parent().unwrap_or(path).to_path_buf(),
			});
		}
		Ok(Self { _file: file })
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn second_acquire_on_the_same_path_is_refused() {
		let tmp = tempfile::tempdir().unwrap();
		let path = tmp.path().join(".vmchain-backup.lock");

		let held = Lock::acquire(&path).unwrap();
		assert!(matches!(Lock::acquire(&path), Err(Error::LockHeld { .. })));
		drop(held);
		assert!(Lock::acquire(&path).is_ok());
	}
}
