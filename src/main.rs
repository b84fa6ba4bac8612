use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use peer_core::telemetry;
use tracing::info;

#[derive(Parser, Debug)]
#[command(about, long_about = None)]
struct Args {
	/// Use config from bytes
	#[arg(short, long, value_name = "config")]
	config: Option<String>,

	/// Use config from file
	#[arg(short, long, value_name = "file")]
	file: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();

	let args = Args::parse();
	let contents = match (args.config, args.file) {
		(Some(_), Some(_)) => {
			anyhow::bail!("only one of --config or --file")
		},
		(Some(config), None) => config,
		(None, Some(file)) => std::fs::read_to_string(file)?,
		(None, None) => "{}".to_string(),
	};
	let config = peergateway::config::parse_config(contents, None)?;

	let worker_threads = std::thread::available_parallelism()
		.map(usize::from)
		.unwrap_or(4)
		.min(config.max_threads.max(1));
	tokio::runtime::Builder::new_multi_thread()
		.worker_threads(worker_threads)
		.enable_all()
		.build()
		.expect("failed to build runtime")
		.block_on(async move {
			info!(
				peer_server_port = config.peer_server_port,
				frontend_port = config.frontend_port,
				countries = config.country_to_port.len(),
				"starting peergateway"
			);
			peergateway::app::run(Arc::new(config))
				.await?
				.wait_termination()
				.await
		})
}
