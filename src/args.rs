use std::path::PathBuf;

use clap::{ArgAction, Parser};
use tracing::debug;

use crate::config::{Config, Intervals, Target};
use crate::error::{Error, Result};

/// Incremental, chained, live backups of hypervisor-managed disk images.
#[derive(Debug, Clone, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
	/// Domains to back up, optionally with a drive list: DOMAIN[:drive,drive,...]
	///
	/// When no drive list is given, every disk-typed block device on the domain is selected.
	#[arg(required = true)]
	pub targets: Vec<String>,

	/// Directory holding the archive (and its `.vmchain-backup.lock` file)
	#[arg(long, value_name = "PATH", default_value = "/var/vmbackup")]
	pub backup_dir: PathBuf,

	/// Retention ladder, finest first: name[:keep],name[:keep],...
	#[arg(long, default_value = "daily:7,weekly:4,monthly:12,yearly:3")]
	pub intervals: String,

	/// Which tier this run targets; defaults to the finest configured interval
	#[arg(long, value_name = "NAME")]
	pub interval: Option<String>,

	/// Force a fresh backup chain even if a live chain is pending
	#[arg(long)]
	pub new_chain: bool,

	/// Plain file copy instead of qemu-img convert when archiving; skipped if --compress is also set
	#[arg(long)]
	pub copy: bool,

	/// Compress images written into the archive
	#[arg(long)]
	pub compress: bool,

	/// Skip the image-locking safety check when reading qcow2 metadata (`qemu-img info -U`)
	#[arg(long)]
	pub omit_unsafe: bool,

	/// Set diagnostic log level; use multiple times to increase verbosity, up to '-vvv'
	#[arg(long, short, action = ArgAction::Count)]
	pub verbose: u8,

	/// Write diagnostic logs to a file (JSON), instead of stderr
	#[arg(long, value_name = "PATH")]
	pub log_file: Option<PathBuf>,
}

impl Args {
	pub fn into_config(self) -> Result<Config> {
		if !self.backup_dir.is_dir() {
			return Err(Error::Configuration(format!(
				"backup directory does not exist: {}",
				self.backup_dir.display()
			)));
		}
		let intervals = Intervals::parse(&self.intervals, self.interval.as_deref())?;
		let targets = self
			.targets
			.iter()
			.map(|t| Target::parse(t))
			.collect::<Result<Vec<_>>>()?;
		Ok(Config {
			backup_dir: self.backup_dir,
			intervals,
			new_chain: self.new_chain,
			compress: self.compress,
			copy: self.copy,
			omit_unsafe: self.omit_unsafe,
			targets,
		})
	}
}

pub fn get_args() -> Args {
	let args = Args::parse();
	debug!(?args, "got arguments");
	args
}

#[test]
fn verify_cli() {
	use clap::CommandFactory;
	Args::command().debug_assert()
}
