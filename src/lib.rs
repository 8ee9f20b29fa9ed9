pub mod config;
pub mod constants;
pub mod display;
pub mod energy;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod power;
pub mod reconciler;
pub mod residency;
pub mod snapshot;
pub mod source;
pub mod topology;
pub mod util;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

pub use crate::config::{BaselinePolicy, ConsumerAggregation, EngineConfig};
pub use crate::engine::{EngineEvent, Health, IngestReport, PowerStatsEngine};
pub use crate::error::Error;
pub use crate::snapshot::{Snapshot, SnapshotServer};
pub use crate::source::{SampleBatch, SampleSource};
pub use crate::topology::{PowerTopology, TopologyBuilder};

use crate::display::{display_power_readings, prepare_display_area};
use crate::monitor::PowerMonitor;
use crate::power::{LedgerSnapshot, PowerReading};

/// Registers `source`, then builds an engine over whatever it declared
pub fn build_engine<S: SampleSource>(source: &mut S, config: EngineConfig) -> Result<PowerStatsEngine, Error> {
	let mut builder = TopologyBuilder::new();
	source.register(&mut builder)?;
	let topology = builder.build()?;
	info!(
		entities = topology.entities().len(),
		channels = topology.channels().len(),
		consumers = topology.consumers().len(),
		counters = topology.counters().len(),
		"topology registered"
	);
	Ok(PowerStatsEngine::new(topology, config)?)
}

/// Starts sampling every supported source and displays the results
///
/// This is the main entry point for the monitoring functionality. It runs
/// until the process is interrupted or the terminal can no longer be
/// written to.
pub fn monitor_power_stats(config: EngineConfig) -> Result<(), Error> {
	let mut source = source::detect_sources();
	let engine = Arc::new(build_engine(&mut source, config)?);
	let server = SnapshotServer::new(Arc::clone(&engine));
	let topology = engine.topology();

	println!(
		"Monitoring power stats every {} ms, display refresh {} ms...",
		engine.config().sampling_interval_ms,
		constants::DISPLAY_UPDATE_INTERVAL_MS
	);
	println!("Sources: {}", source.source_names().join(", "));
	println!("Press Ctrl+C to stop.");
	println!();

	prepare_display_area(topology)?;

	let stop = Arc::new(AtomicBool::new(false));
	let interval = engine.config().sampling_interval();
	let sampler = PowerMonitor::new(Arc::clone(&engine), source, interval).spawn(Arc::clone(&stop), None);

	let mut previous = LedgerSnapshot::capture(&server);
	let result = loop {
		thread::sleep(Duration::from_millis(constants::DISPLAY_UPDATE_INTERVAL_MS));
		if sampler.is_finished() {
			break Ok(());
		}

		let current = LedgerSnapshot::capture(&server);
		let reading = PowerReading::between(&previous, &current);
		if let Err(err) = display_power_readings(&reading, topology) {
			error!(%err, "display failed, stopping");
			break Err(Error::Display(err));
		}
		previous = current;
	};

	stop.store(true, Ordering::Relaxed);
	if sampler.join().is_err() {
		error!("sampler thread panicked");
	}
	result
}
