use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::constants::{CPU_SYSFS_ROOT, CPUIDLE_COUNTER_WIDTH_BITS};
use crate::error::SourceError;
use crate::reconciler::RawCounterSample;
use crate::source::{SampleBatch, SampleSource};
use crate::topology::{CounterId, CounterScale, CounterTarget, TopologyBuilder};
use crate::util::clock::boot_time_ms;

// cpuidle reports residency in microseconds
const MICROS_TO_MILLIS: CounterScale = CounterScale::new(1, 1000);

#[derive(Debug, Clone)]
struct IdleState {
	dir: PathBuf,
	name: String,
}

#[derive(Debug, Clone)]
struct IdleCpu {
	cpu: usize,
	states: Vec<IdleState>,
}

#[derive(Debug, Clone)]
struct StateCounters {
	dir: PathBuf,
	time: CounterId,
	usage: CounterId,
}

/// Sorted `(index, path)` pairs of the `<prefix>N` directories under `dir`
fn numbered_dirs(dir: &Path, prefix: &str) -> Vec<(usize, PathBuf)> {
	let mut found: Vec<(usize, PathBuf)> = fs::read_dir(dir)
		.map(|entries| {
			entries
				.filter_map(Result::ok)
				.filter_map(|entry| {
					let index = entry.file_name().to_str()?.strip_prefix(prefix)?.parse::<usize>().ok()?;
					Some((index, entry.path()))
				})
				.collect()
		})
		.unwrap_or_default();
	found.sort_unstable_by_key(|&(index, _)| index);
	found
}

fn read_counter(path: &Path) -> Result<u64, SourceError> {
	let contents = fs::read_to_string(path)?;
	contents.trim().parse::<u64>().map_err(|err| SourceError::Unavailable {
		source_name: "cpuidle".into(),
		reason: format!("{}: {err}", path.display()),
	})
}

/// Idle-state residency from the Linux cpuidle sysfs interface
///
/// Every CPU becomes a power entity whose states are its idle states; each
/// state contributes a `time` counter (µs, recorded as ms) and a `usage`
/// counter (entry count).
#[derive(Debug)]
pub struct CpuIdleSource {
	root: PathBuf,
	counters: Vec<StateCounters>,
}

impl CpuIdleSource {
	pub fn new() -> Self {
		Self::with_root(CPU_SYSFS_ROOT)
	}

	/// Reads from a directory laid out like `/sys/devices/system/cpu`
	pub fn with_root(root: impl Into<PathBuf>) -> Self {
		Self {
			root: root.into(),
			counters: Vec::new(),
		}
	}

	/// Whether at least one CPU exposes idle states
	pub fn is_available(&self) -> bool {
		!self.discover().is_empty()
	}

	fn discover(&self) -> Vec<IdleCpu> {
		numbered_dirs(&self.root, "cpu")
			.into_iter()
			.filter_map(|(cpu, path)| {
				let states: Vec<IdleState> = numbered_dirs(&path.join("cpuidle"), "state")
					.into_iter()
					.map(|(index, dir)| {
						let name = fs::read_to_string(dir.join("name"))
							.map(|name| name.trim().to_string())
							.ok()
							.filter(|name| !name.is_empty())
							.unwrap_or_else(|| format!("state{index}"));
						IdleState { dir, name }
					})
					.collect();
				(!states.is_empty()).then_some(IdleCpu { cpu, states })
			})
			.collect()
	}
}

impl Default for CpuIdleSource {
	fn default() -> Self {
		Self::new()
	}
}

impl SampleSource for CpuIdleSource {
	fn name(&self) -> &str {
		"cpuidle"
	}

	fn register(&mut self, topology: &mut TopologyBuilder) -> Result<(), SourceError> {
		let cpus = self.discover();
		if cpus.is_empty() {
			return Err(SourceError::Unavailable {
				source_name: self.name().to_string(),
				reason: format!("no idle states under {}", self.root.display()),
			});
		}
		for state in cpus.iter().flat_map(|cpu| &cpu.states) {
			read_counter(&state.dir.join("time"))?;
			read_counter(&state.dir.join("usage"))?;
		}

		let mut counters = Vec::new();
		for cpu in &cpus {
			let (entity, state_ids) = topology.add_entity(
				format!("cpu{}", cpu.cpu),
				cpu.states.iter().map(|state| state.name.clone()),
			);
			for (state, &id) in cpu.states.iter().zip(&state_ids) {
				let time = topology.add_counter(CPUIDLE_COUNTER_WIDTH_BITS, MICROS_TO_MILLIS, CounterTarget::StateDuration {
					entity,
					state: id,
				});
				let usage = topology.add_counter(
					CPUIDLE_COUNTER_WIDTH_BITS,
					CounterScale::IDENTITY,
					CounterTarget::StateEntries { entity, state: id },
				);
				counters.push(StateCounters {
					dir: state.dir.clone(),
					time,
					usage,
				});
			}
		}

		debug!(cpus = cpus.len(), states = counters.len(), "registered cpuidle counters");
		self.counters = counters;
		Ok(())
	}

	fn sample(&mut self) -> Result<SampleBatch, SourceError> {
		let timestamp_ms = boot_time_ms()?;
		let mut samples = Vec::with_capacity(self.counters.len() * 2);
		for state in &self.counters {
			samples.push(RawCounterSample {
				counter: state.time,
				raw: read_counter(&state.dir.join("time"))?,
				timestamp_ms,
			});
			samples.push(RawCounterSample {
				counter: state.usage,
				raw: read_counter(&state.dir.join("usage"))?,
				timestamp_ms,
			});
		}
		Ok(samples.into())
	}
}
