use std::process::ExitCode;

use power_stats::{EngineConfig, monitor_power_stats};
use tracing::error;
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
	// Logs go to stderr so they don't scroll the in-place display
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
		.with_writer(std::io::stderr)
		.init();

	let config = match std::env::args_os().nth(1) {
		Some(path) => match EngineConfig::from_json_file(&path) {
			Ok(config) => config,
			Err(err) => {
				error!(%err, "failed to load engine config");
				return ExitCode::FAILURE;
			},
		},
		None => EngineConfig::default(),
	};

	match monitor_power_stats(config) {
		Ok(()) => ExitCode::SUCCESS,
		Err(err) => {
			error!(%err, "power monitor failed");
			ExitCode::FAILURE
		},
	}
}
