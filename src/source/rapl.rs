use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::constants::*;
use crate::error::SourceError;
use crate::reconciler::RawCounterSample;
use crate::source::{SampleBatch, SampleSource};
use crate::topology::{ConsumerKind, CounterId, CounterScale, CounterTarget, TopologyBuilder};
use crate::util::clock::boot_time_ms;
use crate::util::msr::{read_energy_status, read_energy_unit};

/// Represents CPU manufacturer types that can be detected
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CpuType {
	/// Intel CPU architecture, package counter only
	Intel,
	/// AMD CPU architecture, package and per-core counters
	Amd,
	/// Any other CPU architecture not explicitly supported
	Unsupported,
}

impl CpuType {
	fn unit_msr(self) -> Option<u32> {
		match self {
			CpuType::Intel => Some(INTEL_POWER_UNIT_MSR),
			CpuType::Amd => Some(AMD_ENERGY_UNIT_MSR),
			CpuType::Unsupported => None,
		}
	}

	fn package_msr(self) -> Option<u32> {
		match self {
			CpuType::Intel => Some(INTEL_PKG_ENERGY_MSR),
			CpuType::Amd => Some(AMD_ENERGY_PKG_MSR),
			CpuType::Unsupported => None,
		}
	}
}

/// Detects the CPU manufacturer by reading /proc/cpuinfo
pub fn detect_cpu_type() -> CpuType {
	let cpuinfo = fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
	if cpuinfo.contains("GenuineIntel") {
		CpuType::Intel
	} else if cpuinfo.contains("AuthenticAMD") {
		CpuType::Amd
	} else {
		CpuType::Unsupported
	}
}

/// Maps physical core id to its logical processors
///
/// Reads `cpuN/topology/core_id` from sysfs, falling back to the usual
/// SMT layout (consecutive threads share a core) when sysfs is unavailable.
pub fn read_core_map(sysfs_root: &Path) -> BTreeMap<usize, Vec<usize>> {
	let mut core_to_threads: BTreeMap<usize, Vec<usize>> = BTreeMap::new();

	if let Ok(entries) = fs::read_dir(sysfs_root) {
		for entry in entries.filter_map(Result::ok) {
			let filename = entry.file_name();
			let Some(cpu_id) = filename
				.to_str()
				.and_then(|name| name.strip_prefix("cpu"))
				.and_then(|id| id.parse::<usize>().ok())
			else {
				continue;
			};

			let core_id_path = entry.path().join("topology/core_id");
			if let Some(core_id) = fs::read_to_string(&core_id_path)
				.ok()
				.and_then(|contents| contents.trim().parse::<usize>().ok())
			{
				core_to_threads.entry(core_id).or_default().push(cpu_id);
			}
		}
	}

	if core_to_threads.is_empty() {
		let total_threads = num_cpus::get();
		let physical_cores = num_cpus::get_physical();
		let threads_per_core = if physical_cores > 0 {
			(total_threads / physical_cores).max(1)
		} else {
			1
		};

		for thread_id in 0..total_threads {
			core_to_threads.entry(thread_id / threads_per_core).or_default().push(thread_id);
		}
	}

	for threads in core_to_threads.values_mut() {
		threads.sort_unstable();
	}
	core_to_threads
}

#[derive(Debug, Clone)]
struct CoreCounter {
	// First logical processor of the core, used to address its MSR
	cpu: usize,
	counter: CounterId,
}

/// RAPL energy counters read through model-specific registers
///
/// Registers one "package" channel feeding a CPU cluster consumer; on AMD
/// also one channel per physical core whose energy register is readable.
#[derive(Debug)]
pub struct RaplSource {
	cpu_type: CpuType,
	package: Option<CounterId>,
	cores: Vec<CoreCounter>,
}

impl RaplSource {
	pub fn new() -> Self {
		Self::with_cpu_type(detect_cpu_type())
	}

	/// Skips vendor detection
	pub fn with_cpu_type(cpu_type: CpuType) -> Self {
		Self {
			cpu_type,
			package: None,
			cores: Vec::new(),
		}
	}

	pub fn is_supported(&self) -> bool {
		self.cpu_type != CpuType::Unsupported
	}

	fn unsupported(&self) -> SourceError {
		SourceError::Unavailable {
			source_name: self.name().to_string(),
			reason: format!("no RAPL support for {:?} CPUs", self.cpu_type),
		}
	}
}

impl Default for RaplSource {
	fn default() -> Self {
		Self::new()
	}
}

impl SampleSource for RaplSource {
	fn name(&self) -> &str {
		"rapl"
	}

	fn register(&mut self, topology: &mut TopologyBuilder) -> Result<(), SourceError> {
		let (Some(unit_msr), Some(package_msr)) = (self.cpu_type.unit_msr(), self.cpu_type.package_msr()) else {
			return Err(self.unsupported());
		};

		let energy_unit = read_energy_unit(unit_msr)?;
		read_energy_status(package_msr, 0)?;
		let scale = CounterScale::new(POWER_SCALE, 1u64 << energy_unit);

		let readable_cores: Vec<(usize, usize)> = if self.cpu_type == CpuType::Amd {
			read_core_map(Path::new(CPU_SYSFS_ROOT))
				.into_iter()
				.filter_map(|(core_id, threads)| threads.first().map(|&cpu| (core_id, cpu)))
				.filter(|&(_, cpu)| read_energy_status(AMD_ENERGY_CORE_MSR, cpu).is_ok())
				.collect()
		} else {
			Vec::new()
		};

		let package = topology.add_channel("RAPL_PACKAGE", "cpu_package");
		let consumer = topology.add_consumer(ConsumerKind::CpuCluster, "CPU");
		topology.map_consumer_channel(consumer, package, 1.0);
		self.package = Some(topology.add_counter(RAPL_COUNTER_WIDTH_BITS, scale, CounterTarget::Channel {
			channel: package,
		}));

		self.cores = readable_cores
			.into_iter()
			.map(|(core_id, cpu)| {
				let channel = topology.add_channel(format!("RAPL_CORE{core_id}"), "cpu_core");
				let counter = topology.add_counter(RAPL_COUNTER_WIDTH_BITS, scale, CounterTarget::Channel { channel });
				CoreCounter { cpu, counter }
			})
			.collect();

		debug!(
			cpu_type = ?self.cpu_type,
			energy_unit,
			cores = self.cores.len(),
			"registered RAPL counters"
		);
		Ok(())
	}

	fn sample(&mut self) -> Result<SampleBatch, SourceError> {
		let (Some(package), Some(package_msr)) = (self.package, self.cpu_type.package_msr()) else {
			return Err(self.unsupported());
		};

		let timestamp_ms = boot_time_ms()?;
		let mut samples = Vec::with_capacity(1 + self.cores.len());
		samples.push(RawCounterSample {
			counter: package,
			raw: read_energy_status(package_msr, 0)?,
			timestamp_ms,
		});

		for core in &self.cores {
			match read_energy_status(AMD_ENERGY_CORE_MSR, core.cpu) {
				Ok(raw) => samples.push(RawCounterSample {
					counter: core.counter,
					raw,
					timestamp_ms,
				}),
				Err(err) => debug!(cpu = core.cpu, %err, "skipping unreadable core energy counter"),
			}
		}
		Ok(samples.into())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn scratch_dir(name: &str) -> std::path::PathBuf {
		let dir = std::env::temp_dir().join(format!("power-stats-rapl-{}-{name}", std::process::id()));
		let _ = fs::remove_dir_all(&dir);
		fs::create_dir_all(&dir).unwrap();
		dir
	}

	#[test]
	fn reads_core_map_from_sysfs() {
		let root = scratch_dir("sysfs");
		for (cpu, core) in [(0, 0), (1, 1), (2, 0), (3, 1)] {
			let topology = root.join(format!("cpu{cpu}/topology"));
			fs::create_dir_all(&topology).unwrap();
			fs::write(topology.join("core_id"), format!("{core}\n")).unwrap();
		}
		fs::create_dir_all(root.join("cpufreq")).unwrap();

		let map = read_core_map(&root);
		assert_eq!(map.get(&0), Some(&vec![0, 2]));
		assert_eq!(map.get(&1), Some(&vec![1, 3]));
		fs::remove_dir_all(&root).unwrap();
	}

	#[test]
	fn falls_back_to_cpu_count() {
		let map = read_core_map(Path::new("/nonexistent/cpu"));
		let threads: usize = map.values().map(Vec::len).sum();
		assert_eq!(threads, num_cpus::get());
	}

	#[test]
	fn unsupported_cpus_do_not_register() {
		let mut source = RaplSource::with_cpu_type(CpuType::Unsupported);
		assert!(!source.is_supported());
		let mut builder = TopologyBuilder::new();
		assert!(matches!(source.register(&mut builder), Err(SourceError::Unavailable { .. })));
		assert!(matches!(source.sample(), Err(SourceError::Unavailable { .. })));
		assert!(builder.build().unwrap().channels().is_empty());
	}
}
