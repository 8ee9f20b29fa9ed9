use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::config::{BaselinePolicy, EngineConfig};
use crate::error::ReconcileError;
use crate::topology::{CounterId, CounterScale, CounterTarget, PowerTopology};

/// One raw reading handed over by a sample source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCounterSample {
	pub counter: CounterId,
	pub raw: u64,
	/// Milliseconds since boot
	pub timestamp_ms: u64,
}

/// Monotonic progress of one counter between two samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconciledDelta {
	pub counter: CounterId,
	/// Progress in ledger units (after scaling)
	pub delta: u64,
	/// Progress in raw counter units
	pub raw_delta: u64,
	pub duration_ms: u64,
	pub timestamp_ms: u64,
	/// Whether the counter wrapped past its modulus
	pub wrapped: bool,
}

/// A counter dropped further than a wraparound can explain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ResetNotice {
	pub counter: CounterId,
	/// Start of the new epoch
	pub timestamp_ms: u64,
	pub previous_raw: u64,
	pub raw: u64,
}

/// Outcome of reconciling one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
	Delta(ReconciledDelta),
	Reset(ResetNotice),
}

#[derive(Debug, Clone, Copy)]
struct LastSample {
	raw: u64,
	timestamp_ms: u64,
}

#[derive(Debug)]
struct CounterState {
	width_bits: u32,
	modulus: u128,
	reset_threshold: f64,
	scale: CounterScale,
	// Set for state-duration counters: the most a delta may exceed its interval by
	duration_slack_ms: Option<u64>,
	last: Option<LastSample>,
	// Scaled-division remainder carried into the next delta
	remainder: u128,
}

impl CounterState {
	/// Scaled delta and the remainder to carry, without committing either
	fn scale(&self, raw_delta: u64) -> (u64, u128) {
		let total = u128::from(raw_delta) * u128::from(self.scale.numerator) + self.remainder;
		let denominator = u128::from(self.scale.denominator);
		(u64::try_from(total / denominator).unwrap_or(u64::MAX), total % denominator)
	}

	fn commit_scaled(&mut self, raw_delta: u64) -> u64 {
		let (delta, remainder) = self.scale(raw_delta);
		self.remainder = remainder;
		delta
	}

	fn is_reset(&self, advance: u128) -> bool {
		advance as f64 > self.reset_threshold * self.modulus as f64
	}
}

/// Translates raw, wrapping hardware counters into monotonic deltas
///
/// Holds the last raw value and timestamp of every registered counter. It
/// never touches a ledger; the engine routes what it returns.
#[derive(Debug)]
pub struct CounterReconciler {
	counters: HashMap<CounterId, CounterState>,
	baseline: BaselinePolicy,
}

impl CounterReconciler {
	/// One counter state per counter of `topology`, with no baseline yet
	pub fn new(topology: &PowerTopology, config: &EngineConfig) -> Self {
		let counters = topology
			.counters()
			.iter()
			.map(|counter| {
				let state = CounterState {
					width_bits: counter.width_bits,
					modulus: 1u128 << counter.width_bits,
					reset_threshold: counter.reset_threshold.unwrap_or(config.reset_threshold),
					scale: counter.scale,
					duration_slack_ms: matches!(counter.target, CounterTarget::StateDuration { .. })
						.then_some(config.sampling_tolerance_ms),
					last: None,
					remainder: 0,
				};
				(counter.id, state)
			})
			.collect();

		Self {
			counters,
			baseline: config.baseline,
		}
	}

	/// Reconciles one sample, yielding at most one delta or reset notice
	///
	/// A rejected sample leaves the counter's state exactly as it was, except
	/// for an implausible state-duration delta: that sample still becomes the
	/// counter's new baseline.
	pub fn reconcile(&mut self, sample: &RawCounterSample) -> Result<Option<Reconciled>, ReconcileError> {
		let state = self
			.counters
			.get_mut(&sample.counter)
			.ok_or(ReconcileError::UnknownCounter { counter: sample.counter })?;

		if u128::from(sample.raw) >= state.modulus {
			return Err(ReconcileError::RawOutOfRange {
				counter: sample.counter,
				raw: sample.raw,
				width_bits: state.width_bits,
			});
		}

		let current = LastSample {
			raw: sample.raw,
			timestamp_ms: sample.timestamp_ms,
		};

		let Some(last) = state.last else {
			state.last = Some(current);
			return Ok(match self.baseline {
				BaselinePolicy::SinceStart => None,
				BaselinePolicy::SinceBoot => Some(Reconciled::Delta(ReconciledDelta {
					counter: sample.counter,
					delta: state.commit_scaled(sample.raw),
					raw_delta: sample.raw,
					duration_ms: sample.timestamp_ms,
					timestamp_ms: sample.timestamp_ms,
					wrapped: false,
				})),
			});
		};

		if sample.timestamp_ms <= last.timestamp_ms {
			return Err(ReconcileError::ClockAnomaly {
				counter: sample.counter,
				previous_ms: last.timestamp_ms,
				timestamp_ms: sample.timestamp_ms,
			});
		}

		let (raw_delta, wrapped) = if sample.raw >= last.raw {
			(sample.raw - last.raw, false)
		} else {
			let advance = state.modulus - u128::from(last.raw) + u128::from(sample.raw);
			if state.is_reset(advance) {
				state.last = Some(current);
				state.remainder = 0;
				return Ok(Some(Reconciled::Reset(ResetNotice {
					counter: sample.counter,
					timestamp_ms: sample.timestamp_ms,
					previous_raw: last.raw,
					raw: sample.raw,
				})));
			}
			// advance < modulus <= 2^64 here
			(advance as u64, true)
		};

		let duration_ms = sample.timestamp_ms - last.timestamp_ms;
		let (delta, remainder) = state.scale(raw_delta);
		if let Some(slack_ms) = state.duration_slack_ms {
			if delta > duration_ms.saturating_add(slack_ms) {
				// The jump is dropped; later deltas are measured from this sample
				state.last = Some(current);
				state.remainder = 0;
				return Err(ReconcileError::ImplausibleDelta {
					counter: sample.counter,
					delta,
					duration_ms,
				});
			}
		}

		state.last = Some(current);
		state.remainder = remainder;
		Ok(Some(Reconciled::Delta(ReconciledDelta {
			counter: sample.counter,
			delta,
			raw_delta,
			duration_ms,
			timestamp_ms: sample.timestamp_ms,
			wrapped,
		})))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::topology::{CounterTarget, TopologyBuilder};

	const WIDTH: u32 = 16;
	const MODULUS: u64 = 1 << WIDTH;

	fn reconciler(scale: CounterScale, baseline: BaselinePolicy) -> CounterReconciler {
		let mut builder = TopologyBuilder::new();
		let channel = builder.add_channel("VSYS_PWR_DISPLAY", "display");
		builder.add_counter(WIDTH, scale, CounterTarget::Channel { channel });
		let config = EngineConfig {
			baseline,
			..EngineConfig::default()
		};
		CounterReconciler::new(&builder.build().unwrap(), &config)
	}

	fn sample(raw: u64, timestamp_ms: u64) -> RawCounterSample {
		RawCounterSample {
			counter: CounterId(0),
			raw,
			timestamp_ms,
		}
	}

	fn delta(outcome: Option<Reconciled>) -> ReconciledDelta {
		match outcome {
			Some(Reconciled::Delta(delta)) => delta,
			other => panic!("expected a delta, got {other:?}"),
		}
	}

	#[test]
	fn first_sample_counts_since_boot() {
		let mut reconciler = reconciler(CounterScale::IDENTITY, BaselinePolicy::SinceBoot);
		let first = delta(reconciler.reconcile(&sample(500, 2_000)).unwrap());
		assert_eq!(first.delta, 500);
		assert_eq!(first.duration_ms, 2_000);
	}

	#[test]
	fn first_sample_only_sets_baseline_since_start() {
		let mut reconciler = reconciler(CounterScale::IDENTITY, BaselinePolicy::SinceStart);
		assert_eq!(reconciler.reconcile(&sample(500, 2_000)).unwrap(), None);
		let next = delta(reconciler.reconcile(&sample(700, 2_100)).unwrap());
		assert_eq!(next.delta, 200);
		assert_eq!(next.duration_ms, 100);
		assert!(!next.wrapped);
	}

	#[test]
	fn wraparound_yields_small_delta() {
		let mut reconciler = reconciler(CounterScale::IDENTITY, BaselinePolicy::SinceStart);
		reconciler.reconcile(&sample(MODULUS - 10, 1_000)).unwrap();
		let wrapped = delta(reconciler.reconcile(&sample(5, 1_100)).unwrap());
		assert_eq!(wrapped.delta, 15);
		assert!(wrapped.wrapped);
	}

	#[test]
	fn large_drop_is_a_reset() {
		let mut reconciler = reconciler(CounterScale::IDENTITY, BaselinePolicy::SinceStart);
		let high = MODULUS * 9 / 10;
		reconciler.reconcile(&sample(high, 1_000)).unwrap();
		let outcome = reconciler.reconcile(&sample(3, 1_100)).unwrap();
		assert_eq!(
			outcome,
			Some(Reconciled::Reset(ResetNotice {
				counter: CounterId(0),
				timestamp_ms: 1_100,
				previous_raw: high,
				raw: 3,
			}))
		);

		// The new raw value is the baseline of the next epoch
		let next = delta(reconciler.reconcile(&sample(10, 1_200)).unwrap());
		assert_eq!(next.delta, 7);
	}

	#[test]
	fn clock_anomaly_discards_sample() {
		let mut reconciler = reconciler(CounterScale::IDENTITY, BaselinePolicy::SinceStart);
		reconciler.reconcile(&sample(100, 1_000)).unwrap();
		assert_eq!(
			reconciler.reconcile(&sample(300, 1_000)),
			Err(ReconcileError::ClockAnomaly {
				counter: CounterId(0),
				previous_ms: 1_000,
				timestamp_ms: 1_000,
			})
		);
		assert!(matches!(
			reconciler.reconcile(&sample(300, 900)),
			Err(ReconcileError::ClockAnomaly { .. })
		));

		let next = delta(reconciler.reconcile(&sample(400, 1_100)).unwrap());
		assert_eq!(next.delta, 300);
		assert_eq!(next.duration_ms, 100);
	}

	#[test]
	fn rejects_values_wider_than_counter() {
		let mut reconciler = reconciler(CounterScale::IDENTITY, BaselinePolicy::SinceStart);
		assert_eq!(
			reconciler.reconcile(&sample(MODULUS, 1_000)),
			Err(ReconcileError::RawOutOfRange {
				counter: CounterId(0),
				raw: MODULUS,
				width_bits: WIDTH,
			})
		);
	}

	#[test]
	fn rejects_unknown_counters() {
		let mut reconciler = reconciler(CounterScale::IDENTITY, BaselinePolicy::SinceStart);
		let stray = RawCounterSample {
			counter: CounterId(42),
			raw: 1,
			timestamp_ms: 1,
		};
		assert_eq!(
			reconciler.reconcile(&stray),
			Err(ReconcileError::UnknownCounter { counter: CounterId(42) })
		);
	}

	#[test]
	fn scaling_carries_remainder() {
		let mut reconciler = reconciler(CounterScale::new(1, 1000), BaselinePolicy::SinceStart);
		reconciler.reconcile(&sample(0, 1_000)).unwrap();
		let deltas: Vec<u64> = [600, 1_200, 2_000]
			.iter()
			.enumerate()
			.map(|(i, &raw)| delta(reconciler.reconcile(&sample(raw, 1_100 + i as u64 * 100)).unwrap()).delta)
			.collect();
		assert_eq!(deltas, vec![0, 1, 1]);
	}

	#[test]
	fn residency_faster_than_wall_time_is_implausible() {
		let mut builder = TopologyBuilder::new();
		let (cpu, states) = builder.add_entity("cpu0", ["C1"]);
		builder.add_counter(32, CounterScale::IDENTITY, CounterTarget::StateDuration {
			entity: cpu,
			state: states[0],
		});
		let config = EngineConfig {
			sampling_tolerance_ms: 50,
			..EngineConfig::default()
		};
		let mut reconciler = CounterReconciler::new(&builder.build().unwrap(), &config);

		reconciler.reconcile(&sample(0, 3_600_000)).unwrap();
		assert_eq!(delta(reconciler.reconcile(&sample(150, 3_600_100)).unwrap()).delta, 150);
		assert_eq!(
			reconciler.reconcile(&sample(1_000_150, 3_600_200)),
			Err(ReconcileError::ImplausibleDelta {
				counter: CounterId(0),
				delta: 1_000_000,
				duration_ms: 100,
			})
		);

		// Later deltas are measured from the rejected sample
		assert_eq!(delta(reconciler.reconcile(&sample(1_000_250, 3_600_300)).unwrap()).delta, 100);
	}

	#[test]
	fn energy_counters_have_no_rate_bound() {
		let mut reconciler = reconciler(CounterScale::IDENTITY, BaselinePolicy::SinceStart);
		reconciler.reconcile(&sample(0, 1_000)).unwrap();
		assert_eq!(delta(reconciler.reconcile(&sample(60_000, 1_001)).unwrap()).delta, 60_000);
	}

	#[test]
	fn full_width_counters_wrap() {
		let mut builder = TopologyBuilder::new();
		let channel = builder.add_channel("rail", "rail");
		builder.add_counter(64, CounterScale::IDENTITY, CounterTarget::Channel { channel });
		let config = EngineConfig {
			baseline: BaselinePolicy::SinceStart,
			..EngineConfig::default()
		};
		let mut reconciler = CounterReconciler::new(&builder.build().unwrap(), &config);

		reconciler.reconcile(&sample(u64::MAX - 1, 10)).unwrap();
		assert_eq!(delta(reconciler.reconcile(&sample(3, 20)).unwrap()).delta, 5);
	}
}
