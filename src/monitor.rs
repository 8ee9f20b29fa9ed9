use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, info};

use crate::engine::{IngestReport, PowerStatsEngine};
use crate::source::SampleSource;

// Longest uninterrupted sleep, bounds how long a stop request can go unnoticed
const SLEEP_SLICE: Duration = Duration::from_millis(10);

/// Drives a sample source into the engine at a fixed rate
#[derive(Debug)]
pub struct PowerMonitor<S> {
	engine: Arc<PowerStatsEngine>,
	source: S,
	interval: Duration,
}

impl<S: SampleSource> PowerMonitor<S> {
	/// The source must already be registered in the engine's topology
	pub fn new(engine: Arc<PowerStatsEngine>, source: S, interval: Duration) -> Self {
		Self {
			engine,
			source,
			interval,
		}
	}

	pub fn engine(&self) -> &Arc<PowerStatsEngine> {
		&self.engine
	}

	/// Reads one batch and ingests it, or records the outage when the source fails
	///
	/// Parts of the source that failed while others delivered are reported
	/// through the engine's health.
	pub fn sample_once(&mut self) -> Option<IngestReport> {
		match self.source.sample() {
			Ok(batch) => {
				let report = self.engine.ingest(&batch.samples);
				self.engine.record_degraded(&batch.failures);
				Some(report)
			},
			Err(err) => {
				self.engine.record_unavailable(&err);
				None
			},
		}
	}

	/// Samples until `stop` is set
	///
	/// Cycles are scheduled on a fixed grid; a cycle that overruns skips the
	/// ticks it missed instead of bursting to catch up.
	pub fn run(&mut self, stop: &AtomicBool, reports: Option<Sender<IngestReport>>) {
		info!(interval_ms = self.interval.as_millis() as u64, source = self.source.name(), "sampling started");
		let mut next_tick = Instant::now();

		while !stop.load(Ordering::Relaxed) {
			if let Some(report) = self.sample_once() {
				if let Some(tx) = &reports {
					// A gone receiver only means nobody is listening any more
					let _ = tx.send(report);
				}
			}

			next_tick += self.interval;
			let now = Instant::now();
			if next_tick < now {
				let behind = now - next_tick;
				let skipped = (behind.as_nanos() / self.interval.as_nanos().max(1)) as u32 + 1;
				debug!(skipped, "sampling overran its interval");
				next_tick += self.interval * skipped;
			}

			while !stop.load(Ordering::Relaxed) {
				let now = Instant::now();
				if now >= next_tick {
					break;
				}
				thread::sleep((next_tick - now).min(SLEEP_SLICE));
			}
		}
		info!("sampling stopped");
	}
}

impl<S: SampleSource + 'static> PowerMonitor<S> {
	/// Moves the monitor onto its own thread
	pub fn spawn(mut self, stop: Arc<AtomicBool>, reports: Option<Sender<IngestReport>>) -> JoinHandle<()> {
		thread::spawn(move || self.run(&stop, reports))
	}
}
