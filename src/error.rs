use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

/// Every fatal error kind the tool can produce, per the error handling design: each variant
/// maps to one of the exit codes in [`Error::exit_code`].
#[derive(Debug, Error, Diagnostic)]
pub enum Error {
	#[error("configuration error: {0}")]
	#[diagnostic(code(vmchain::configuration))]
	Configuration(String),

	#[error("another instance is already backing up {backup_dir}")]
	#[diagnostic(code(vmchain::lock_held))]
	LockHeld { backup_dir: PathBuf },

	#[error("domain not found: {0}")]
	#[diagnostic(code(vmchain::domain_not_found))]
	DomainNotFound(String),

	#[error("archive inconsistency: {0}")]
	#[diagnostic(code(vmchain::archive_inconsistency))]
	ArchiveInconsistency(String),

	#[error("{op} failed on {path}: {detail}")]
	#[diagnostic(code(vmchain::tool_failure))]
	ToolFailure {
		op: &'static str,
		path: PathBuf,
		detail: String,
	},

	#[error("hypervisor error on domain {domain}: {detail}")]
	#[diagnostic(code(vmchain::hypervisor))]
	Hypervisor { domain: String, detail: String },

	#[error("live chain for {domain}:{drive} has length {len}, expected 1 or 2")]
	#[diagnostic(code(vmchain::live_chain_too_long))]
	LiveChainTooLong {
		domain: String,
		drive: String,
		len: usize,
	},

	#[error(transparent)]
	#[diagnostic(code(vmchain::io))]
	Io(#[from] std::io::Error),
}

impl Error {
	/// The process exit code this error should produce.
	/// 0 is reserved for success and never produced here.
	pub fn exit_code(&self) -> i32 {
		match self {
			Error::LockHeld { .. } | Error::DomainNotFound(_) | Error::Configuration(_) => 1,
			_ => 2,
		}
	}
}

pub type Result<T> = std::result::Result<T, Error>;
