#![deny(rust_2018_idioms)]

pub mod archive;
pub mod args;
pub mod chain;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod image_tool;
pub mod lock;
pub mod logging;
pub mod name_codec;
pub mod orchestrator;
pub mod rotator;

pub(crate) const APP_NAME: &str = concat!(env!("CARGO_PKG_NAME"), "-", env!("CARGO_PKG_VERSION"));

use error::Result;

/// Parses arguments, builds the run configuration, and initializes logging. Split out of
/// `main` so integration tests can exercise the same path the binary does.
pub fn bootstrap() -> Result<config::Config> {
	let args = args::get_args();
	logging::init(args.verbose, args.log_file.as_deref());
	tracing::debug!(app = APP_NAME, "starting up");
	args.into_config()
}

/// Acquires the archive lock and runs every configured target, returning a process exit code.
pub async fn run(config: config::Config) -> i32 {
	let _lock = match lock::Lock::acquire(&config.lock_path()) {
		Ok(lock) => lock,
		Err(e) => {
			tracing::error!(error = %e, "could not acquire backup directory lock");
			return e.exit_code();
		}
	};

	let tool = image_tool::QemuImgTool;
	let hv = hypervisor::VirshHypervisor;

	match orchestrator::run(&config, &tool, &hv) {
		Ok(summary) => {
			for (domain, e) in &summary.failed {
				tracing::error!(domain, error = %e, "backup failed for this domain");
			}
			tracing::info!(
				succeeded = summary.succeeded.len(),
				failed = summary.failed.len(),
				"run complete"
			);
			summary.exit_code()
		}
		Err(e) => {
			tracing::error!(error = %e, "run failed before any target could be attempted");
			e.exit_code()
		}
	}
}
