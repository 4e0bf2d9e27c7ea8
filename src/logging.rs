//! Initializes `tracing-subscriber`, seeded from the `-v` count on the CLI (or `$RUST_LOG`, which
//! always takes precedence), per the error handling / logging design in SPEC_FULL.md 4.8.

use std::path::{Path, PathBuf};

use tracing_subscriber::EnvFilter;

fn level_for(verbosity: u8) -> &'static str {
	match verbosity {
		0 => "warn",
		1 => "info",
		2 => "debug",
		_ => "trace",
	}
}

fn env_filter(verbosity: u8) -> EnvFilter {
	if std::env::var("RUST_LOG").is_ok() {
		EnvFilter::from_default_env()
	} else {
		EnvFilter::new(format!("vmchain_backup={}", level_for(verbosity)))
	}
}

/// Sets up global logging. With `log_file` unset, writes human-readable logs to stderr; with it
/// set, writes newline-delimited JSON to the given file (or a timestamped file inside it, if it
/// names a directory).
pub fn init(verbosity: u8, log_file: Option<&Path>) {
	let filter = env_filter(verbosity);

	match log_file {
		None => {
			tracing_subscriber::fmt()
				.with_env_filter(filter)
				.with_writer(std::io::stderr)
				.init();
		}
		Some(path) => {
			let path = resolve_log_path(path);
			let file = match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
				Ok(f) => f,
				Err(e) => {
					eprintln!("could not open log file {}: {e}", path.display());
					tracing_subscriber::fmt().with_env_filter(filter).init();
					return;
				}
			};
			tracing_subscriber::fmt()
				.json()
				.with_env_filter(filter)
				.with_writer(file)
				.init();
		}
	}
}

fn resolve_log_path(path: &Path) -> PathBuf {
	if path.is_dir() {
		let now = chrono::Utc::now();
		path.join(format!("vmchain-backup.{}.log", now.format("%Y-%m-%dT%H-%M-%SZ")))
	} else {
		path.to_path_buf()
	}
}
