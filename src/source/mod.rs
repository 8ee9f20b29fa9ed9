pub mod cpuidle;
pub mod rapl;

use std::fmt::Debug;

use tracing::{info, warn};

use crate::error::SourceError;
use crate::reconciler::RawCounterSample;
use crate::topology::TopologyBuilder;

/// A provider of raw hardware counter samples
///
/// Implementations own the mapping from physical registers or files to
/// counter ids: they declare what they measure in [`register`](Self::register)
/// and must tag every sample with the ids handed out there.
pub trait SampleSource: Debug + Send {
	fn name(&self) -> &str;

	/// Declares entities, channels, consumers and counters
	///
	/// Hardware detection happens before the builder is touched, so a failed
	/// registration leaves the builder unchanged.
	fn register(&mut self, topology: &mut TopologyBuilder) -> Result<(), SourceError>;

	/// Reads one batch with one sample per registered counter
	fn sample(&mut self) -> Result<SampleBatch, SourceError>;
}

/// Samples of one cycle, plus the failures of parts that could not contribute
#[derive(Debug, Default)]
pub struct SampleBatch {
	pub samples: Vec<RawCounterSample>,
	pub failures: Vec<SourceError>,
}

impl From<Vec<RawCounterSample>> for SampleBatch {
	fn from(samples: Vec<RawCounterSample>) -> Self {
		Self {
			samples,
			failures: Vec::new(),
		}
	}
}

/// Several sources sampled as one
#[derive(Debug, Default)]
pub struct CompositeSource {
	sources: Vec<Box<dyn SampleSource>>,
}

impl CompositeSource {
	pub fn new(sources: Vec<Box<dyn SampleSource>>) -> Self {
		Self { sources }
	}

	/// Names of the members, in sampling order
	pub fn source_names(&self) -> Vec<&str> {
		self.sources.iter().map(|source| source.name()).collect()
	}
}

impl SampleSource for CompositeSource {
	fn name(&self) -> &str {
		"composite"
	}

	/// Registers every member, dropping the ones that fail to register
	fn register(&mut self, topology: &mut TopologyBuilder) -> Result<(), SourceError> {
		self.sources.retain_mut(|source| match source.register(topology) {
			Ok(()) => {
				info!(source = source.name(), "registered sample source");
				true
			},
			Err(err) => {
				warn!(source = source.name(), %err, "sample source unavailable, skipping");
				false
			},
		});

		if self.sources.is_empty() {
			return Err(SourceError::Unavailable {
				source_name: self.name().to_string(),
				reason: "no sample source could be registered".into(),
			});
		}
		Ok(())
	}

	/// Merges member batches, reporting failed members alongside
	///
	/// Fails only when every member fails.
	fn sample(&mut self) -> Result<SampleBatch, SourceError> {
		let mut batch = SampleBatch::default();
		let mut failed = 0;

		for source in &mut self.sources {
			match source.sample() {
				Ok(member) => {
					batch.samples.extend(member.samples);
					batch.failures.extend(member.failures);
				},
				Err(err) => {
					warn!(source = source.name(), %err, "sample source failed this cycle");
					failed += 1;
					batch.failures.push(match err {
						SourceError::Unavailable { .. } => err,
						SourceError::Io(io) => SourceError::Unavailable {
							source_name: source.name().to_string(),
							reason: io.to_string(),
						},
					});
				},
			}
		}

		if failed > 0 && failed == self.sources.len() {
			let reasons: Vec<String> = batch.failures.iter().map(ToString::to_string).collect();
			return Err(SourceError::Unavailable {
				source_name: self.name().to_string(),
				reason: reasons.join("; "),
			});
		}
		Ok(batch)
	}
}

/// Factory function collecting every adapter this machine supports
pub fn detect_sources() -> CompositeSource {
	let mut sources: Vec<Box<dyn SampleSource>> = Vec::new();

	let cpuidle = cpuidle::CpuIdleSource::new();
	if cpuidle.is_available() {
		sources.push(Box::new(cpuidle));
	}

	let rapl = rapl::RaplSource::new();
	if rapl.is_supported() {
		sources.push(Box::new(rapl));
	} else {
		info!("unsupported CPU vendor, RAPL energy counters disabled");
	}

	CompositeSource::new(sources)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::topology::{CounterId, CounterScale, CounterTarget};

	#[derive(Debug)]
	struct FixedSource {
		name: &'static str,
		fail_register: bool,
		fail_sample: bool,
		counter: Option<CounterId>,
	}

	impl FixedSource {
		fn new(name: &'static str) -> Self {
			Self {
				name,
				fail_register: false,
				fail_sample: false,
				counter: None,
			}
		}
	}

	impl SampleSource for FixedSource {
		fn name(&self) -> &str {
			self.name
		}

		fn register(&mut self, topology: &mut TopologyBuilder) -> Result<(), SourceError> {
			if self.fail_register {
				return Err(SourceError::Unavailable {
					source_name: self.name.into(),
					reason: "registration failed".into(),
				});
			}
			let channel = topology.add_channel(self.name, self.name);
			self.counter = Some(topology.add_counter(32, CounterScale::IDENTITY, CounterTarget::Channel { channel }));
			Ok(())
		}

		fn sample(&mut self) -> Result<SampleBatch, SourceError> {
			if self.fail_sample {
				return Err(SourceError::Unavailable {
					source_name: self.name.into(),
					reason: "read failed".into(),
				});
			}
			Ok(self
				.counter
				.map(|counter| RawCounterSample {
					counter,
					raw: 1,
					timestamp_ms: 10,
				})
				.into_iter()
				.collect::<Vec<_>>()
				.into())
		}
	}

	#[test]
	fn drops_sources_that_fail_to_register() {
		let broken = FixedSource {
			fail_register: true,
			..FixedSource::new("broken")
		};
		let mut composite = CompositeSource::new(vec![Box::new(FixedSource::new("ok")), Box::new(broken)]);
		let mut builder = TopologyBuilder::new();
		composite.register(&mut builder).unwrap();

		assert_eq!(composite.source_names(), vec!["ok"]);
		assert_eq!(builder.build().unwrap().channels().len(), 1);
	}

	#[test]
	fn partial_failures_still_yield_samples() {
		let flaky = FixedSource {
			fail_sample: true,
			..FixedSource::new("flaky")
		};
		let mut composite = CompositeSource::new(vec![Box::new(FixedSource::new("ok")), Box::new(flaky)]);
		composite.register(&mut TopologyBuilder::new()).unwrap();

		let batch = composite.sample().unwrap();
		assert_eq!(batch.samples.len(), 1);
		assert_eq!(batch.samples[0].counter, CounterId(0));
		assert_eq!(batch.failures.len(), 1);
		assert_eq!(batch.failures[0].source_name(), Some("flaky"));
	}

	#[test]
	fn fails_when_every_source_fails() {
		let flaky = FixedSource {
			fail_sample: true,
			..FixedSource::new("flaky")
		};
		let mut composite = CompositeSource::new(vec![Box::new(flaky)]);
		composite.register(&mut TopologyBuilder::new()).unwrap();
		assert!(matches!(composite.sample(), Err(SourceError::Unavailable { .. })));

		let mut empty = CompositeSource::default();
		assert!(empty.register(&mut TopologyBuilder::new()).is_err());
	}
}
