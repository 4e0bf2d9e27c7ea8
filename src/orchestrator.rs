//! Runs the Chain Manager over every configured target, one domain at a time. A failure on one
//! target is logged and does not stop the others; the run's exit code reflects the worst
//! outcome across all targets (spec 4.9 / SPEC_FULL 4.8, resolved in DESIGN.md).

use tracing::error;

use crate::archive::Archive;
use crate::chain::{ChainManager, RunFlags};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hypervisor::Hypervisor;
use crate::image_tool::ImageTool;

/// Runs every target in `config` sequentially, scanning the archive once up front and
/// re-scanning nothing in between (the in-memory index is kept consistent by every mutation
/// going through `Archive`'s own methods). Returns the first error encountered only if every
/// target failed; as long as at least one target succeeds, failures are reported via logging
/// and folded into the process exit code by the caller inspecting the returned summary.
pub struct Summary {
	pub failed: Vec<(String, Error)>,
	pub succeeded: Vec<String>,
}

impl Summary {
	pub fn exit_code(&self) -> i32 {
		self.failed.iter().map(|(_, e)| e.exit_code()).max().unwrap_or(0)
	}
}

pub fn run(config: &Config, tool: &dyn ImageTool, hv: &dyn Hypervisor) -> Result<Summary> {
	let mut archive = Archive::scan(&config.backup_dir, tool, config.omit_unsafe)?;
	let manager = ChainManager::new(tool, hv);
	let flags = RunFlags {
		new_chain: config.new_chain,
		compress: config.compress,
		copy: config.copy,
		omit_unsafe: config.omit_unsafe,
	};

	let mut summary = Summary {
		failed: Vec::new(),
		succeeded: Vec::new(),
	};

	for target in &config.targets {
		match manager.run_target(&mut archive, target, &config.intervals, flags) {
			Ok(()) => summary.succeeded.push(target.domain.clone()),
			Err(e) => {
				error!(domain = %target.domain, error = %e, "target failed, continuing with remaining targets");
				summary.failed.push((target.domain.clone(), e));
			}
		}
	}

	Ok(summary)
}
