//! Thin wrapper over the `qemu-img` CLI: `info`, `convert`, `rebase`, `commit`.
//!
//! Mirrors `original_source/qemu-backup.py`'s subprocess calls one-to-one; the only added
//! behaviour is the backing-file self-containment normalization described in spec 4.1.

use std::fs::File;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Error, Result};

/// Result of `qemu-img info`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageInfo {
	/// Basename of the backing file, already normalized to live alongside this image.
	pub backing_file: Option<String>,
}

/// Options for `convert`.
#[derive(Debug, Clone, Default)]
pub struct ConvertOptions {
	pub compress: bool,
	pub copy: bool,
	pub backing: Option<String>,
}

/// The operations the Chain Manager and Retention Rotator need from the image toolchain.
/// Abstracted behind a trait so tests can substitute an in-memory double instead of shelling
/// out to a real `qemu-img` binary.
pub trait ImageTool {
	fn info(&self, path: &Path, safe: bool) -> Result<ImageInfo>;
	fn convert(&self, src: &Path, dst: &Path, opts: &ConvertOptions) -> Result<()>;
	fn rebase(&self, path: &Path, new_backing_basename: &str) -> Result<()>;
	fn commit(&self, top: &Path, base: &Path) -> Result<()>;
}

/// Real adapter, shelling out to `qemu-img`.
pub struct QemuImgTool;

fn run(op: &'static str, path: &Path, expr: duct::Expression) -> Result<std::process::Output> {
	let out = expr
		.stdout_capture()
		.stderr_capture()
		.unchecked()
		.run()
		.map_err(|e| Error::ToolFailure {
			op,
			path: path.to_path_buf(),
			detail: e.to_string(),
		})?;
	if !out.status.success() {
		return Err(Error::ToolFailure {
			op,
			path: path.to_path_buf(),
			detail: String::from_utf8_lossy(&out.stderr).trim().to_string(),
		});
	}
	Ok(out)
}

fn preserve_times(path: &Path, times: std::fs::FileTimes) -> Result<()> {
	File::options().write(true).open(path)?.set_times(times)?;
	Ok(())
}

fn file_times(path: &Path) -> Result<std::fs::FileTimes> {
	let meta = std::fs::metadata(path)?;
	Ok(std::fs::FileTimes::new()
		.set_accessed(meta.accessed()?)
		.set_modified(meta.modified()?))
}

impl ImageTool for QemuImgTool {
	fn info(&self, path: &Path, safe: bool) -> Result<ImageInfo> {
		let mut args: Vec<&str> = vec!["info"];
		if !safe {
			args.push("-U");
		}
		args.push(path.to_str().ok_or_else(|| Error::ToolFailure {
			op: "info",
			path: path.to_path_buf(),
			detail: "path is not valid UTF-8".into(),
		})?);
		let out = run("info", path, duct::cmd("qemu-img", args))?;
		let stdout = String::from_utf8_lossy(&out.stdout);

		let mut backing_file = None;
		for line in stdout.lines() {
			let Some((key, value)) = line.split_once(':') else {
				continue;
			};
			if key.trim() == "backing file" {
				let value = value.trim();
				// qemu-img appends "(actual path: ...)" sometimes; only the first token is the
				// path itself.
				let raw = value.split(' ').next().unwrap_or(value);
				backing_file = Some(raw.to_string());
			}
		}

		let Some(raw) = backing_file else {
			return Ok(ImageInfo { backing_file: None });
		};

		let bf_path = Path::new(&raw);
		let normalized = match (bf_path.parent(), path.parent()) {
			(Some(bf_dir), Some(img_dir)) if !bf_dir.as_os_str().is_empty() && bf_dir != img_dir => {
				let basename = bf_path
					.file_name()
					.and_then(|n| n.to_str())
					.ok_or_else(|| Error::ToolFailure {
						op: "info",
						path: path.to_path_buf(),
						detail: "backing file path has no basename".into(),
					})?
					.to_string();
				debug!(path = %path.display(), old = %raw, new = %basename, "normalizing backing file reference");
				self.rebase(path, &basename)?;
				basename
			}
			_ => bf_path
				.file_name()
				.and_then(|n| n.to_str())
				.unwrap_or(&raw)
				.to_string(),
		};

		Ok(ImageInfo {
			backing_file: Some(normalized),
		})
	}

	fn convert(&self, src: &Path, dst: &Path, opts: &ConvertOptions) -> Result<()> {
		if opts.copy && !opts.compress {
			std::fs::copy(src, dst)?;
			if let Some(backing) = &opts.backing {
				self.rebase(dst, backing)?;
			}
			return Ok(());
		}

		let mut args: Vec<String> = vec!["convert".into(), "-f".into(), "qcow2".into()];
		if opts.compress {
			args.push("-c".into());
		}
		args.push("-O".into());
		args.push("qcow2".into());
		if let Some(backing) = &opts.backing {
			args.push("-B".into());
			args.push(backing.clone());
		}
		args.push(src.to_string_lossy().into_owned());
		args.push(dst.to_string_lossy().into_owned());

		run("convert", src, duct::cmd("qemu-img", args))?;
		Ok(())
	}

	fn rebase(&self, path: &Path, new_backing_basename: &str) -> Result<()> {
		let times = file_times(path)?;
		let dir = path.parent().unwrap_or_else(|| Path::new("."));
		run(
			"rebase",
			path,
			duct::cmd!(
				"qemu-img",
				"rebase",
				"-u",
				"-b",
				new_backing_basename,
				path.file_name().unwrap_or_default()
			)
			.dir(dir),
		)?;
		preserve_times(path, times)?;
		Ok(())
	}

	fn commit(&self, top: &Path, base: &Path) -> Result<()> {
		let times = file_times(base)?;
		run(
			"commit",
			top,
			duct::cmd!("qemu-img", "commit", "-b", base, top),
		)?;
		preserve_times(base, times)?;
		Ok(())
	}
}

/// Copies `filename` into the archive directory under `new_name`, applying the convert options
/// dictated by the CLI (`--compress`/`--copy`), per spec 4.1.
pub fn copy_to_archive(
	tool: &dyn ImageTool,
	src: &Path,
	dst: &Path,
	backing: Option<&str>,
	compress: bool,
	copy: bool,
) -> Result<()> {
	if dst.exists() {
		return Err(Error::ArchiveInconsistency(format!(
			"{} already exists in backup dir",
			dst.display()
		)));
	}
	tool.convert(
		src,
		dst,
		&ConvertOptions {
			compress,
			copy,
			backing: backing.map(str::to_string),
		},
	)
}

pub fn basename(path: &Path) -> PathBuf {
	PathBuf::from(path.file_name().unwrap_or_default())
}

#[cfg(test)]
pub mod fake {
	use super::*;
	use std::cell::RefCell;
	use std::collections::HashMap;

	/// An in-memory double for [`ImageTool`] used by Chain Manager / Retention Rotator tests.
	/// Tracks backing pointers by basename only, which is all the core logic ever consumes.
	#[derive(Default)]
	pub struct FakeImageTool {
		pub backing: RefCell<HashMap<String, Option<String>>>,
		pub calls: RefCell<Vec<String>>,
	}

	impl FakeImageTool {
		pub fn set_backing(&self, path: &str, backing: Option<&str>) {
			self.backing
				.borrow_mut()
				.insert(path.to_string(), backing.map(str::to_string));
		}
	}

	impl ImageTool for FakeImageTool {
		fn info(&self, path: &Path, _safe: bool) -> Result<ImageInfo> {
			let name = path.file_name().unwrap().to_string_lossy().to_string();
			Ok(ImageInfo {
				backing_file: self.backing.borrow().get(&name).cloned().flatten(),
			})
		}

		fn convert(&self, src: &Path, dst: &Path, opts: &ConvertOptions) -> Result<()> {
			self.calls.borrow_mut().push(format!(
				"convert {} -> {}",
				src.display(),
				dst.display()
			));
			let dst_name = dst.file_name().unwrap().to_string_lossy().to_string();
			self.set_backing(&dst_name, opts.backing.as_deref());
			std::fs::write(dst, b"")?;
			Ok(())
		}

		fn rebase(&self, path: &Path, new_backing_basename: &str) -> Result<()> {
			self.calls.borrow_mut().push(format!(
				"rebase {} -> {}",
				path.display(),
				new_backing_basename
			));
			let name = path.file_name().unwrap().to_string_lossy().to_string();
			self.set_backing(&name, Some(new_backing_basename));
			Ok(())
		}

		fn commit(&self, top: &Path, base: &Path) -> Result<()> {
			self.calls
				.borrow_mut()
				.push(format!("commit {} into {}", top.display(), base.display()));
			Ok(())
		}
	}
}
