#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

fn main() -> miette::Result<()> {
	let config = match vmchain_backup::bootstrap() {
		Ok(config) => config,
		Err(e) => {
			eprintln!("{e}");
			std::process::exit(e.exit_code());
		}
	};

	let exit_code = tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.unwrap()
		.block_on(vmchain_backup::run(config));

	std::process::exit(exit_code);
}
