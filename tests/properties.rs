use power_stats::config::BaselinePolicy;
use power_stats::reconciler::{CounterReconciler, RawCounterSample, Reconciled};
use power_stats::topology::{CounterId, CounterScale, CounterTarget, EntityId};
use power_stats::{EngineConfig, PowerStatsEngine, TopologyBuilder};
use proptest::prelude::*;

const TOLERANCE_MS: u64 = 100;

proptest! {
	#[test]
	fn residency_never_exceeds_uptime_and_never_decreases(
		steps in prop::collection::vec((0u64..5_000, 0u64..5_000, 1u64..2_000), 1..60),
	) {
		let mut builder = TopologyBuilder::new();
		let (cpu, states) = builder.add_entity("cpu0", ["WFI", "OFF"]);
		let wfi = builder.add_counter(32, CounterScale::IDENTITY, CounterTarget::StateDuration { entity: cpu, state: states[0] });
		let off = builder.add_counter(32, CounterScale::IDENTITY, CounterTarget::StateDuration { entity: cpu, state: states[1] });
		let config = EngineConfig { sampling_tolerance_ms: TOLERANCE_MS, ..EngineConfig::default() };
		let engine = PowerStatsEngine::new(builder.build().unwrap(), config).unwrap();

		let (mut wfi_raw, mut off_raw, mut now) = (0u64, 0u64, 0u64);
		let mut previous = vec![0u64; 2];
		for (wfi_step, off_step, elapsed) in steps {
			wfi_raw += wfi_step;
			off_raw += off_step;
			now += elapsed;
			engine.ingest(&[
				RawCounterSample { counter: wfi, raw: wfi_raw, timestamp_ms: now },
				RawCounterSample { counter: off, raw: off_raw, timestamp_ms: now },
			]);

			let residency = engine.residency().query(&[EntityId(0)]).remove(0).unwrap();
			prop_assert!(residency.total_time_ms() <= now + TOLERANCE_MS);
			for (state, last) in residency.states.iter().zip(previous.iter_mut()) {
				prop_assert!(state.total_time_ms >= *last);
				*last = state.total_time_ms;
			}
		}
	}

	#[test]
	fn small_wraps_are_recovered_exactly(
		start in 0u64..(1 << 32),
		advance in 0u64..((1u64 << 32) / 20),
	) {
		let mut builder = TopologyBuilder::new();
		let channel = builder.add_channel("VSYS_PWR_DISPLAY", "display");
		let counter = builder.add_counter(32, CounterScale::IDENTITY, CounterTarget::Channel { channel });
		let topology = builder.build().unwrap();
		let config = EngineConfig { baseline: BaselinePolicy::SinceStart, ..EngineConfig::default() };
		let mut reconciler = CounterReconciler::new(&topology, &config);

		let first = RawCounterSample { counter, raw: start, timestamp_ms: 1 };
		prop_assert_eq!(reconciler.reconcile(&first).unwrap(), None);

		let next = RawCounterSample { counter, raw: (start + advance) % (1 << 32), timestamp_ms: 2 };
		match reconciler.reconcile(&next).unwrap() {
			Some(Reconciled::Delta(delta)) => {
				prop_assert_eq!(delta.delta, advance);
				prop_assert_eq!(delta.wrapped, start + advance >= 1 << 32);
			},
			other => prop_assert!(false, "expected a delta, got {:?}", other),
		}
	}

	#[test]
	fn scaled_deltas_lose_nothing(raws in prop::collection::vec(0u64..1_000_000, 1..40)) {
		let mut builder = TopologyBuilder::new();
		let channel = builder.add_channel("RAPL_PACKAGE", "cpu_package");
		let counter = builder.add_counter(64, CounterScale::new(1, 1000), CounterTarget::Channel { channel });
		let topology = builder.build().unwrap();
		let mut reconciler = CounterReconciler::new(&topology, &EngineConfig::default());

		let mut raw = 0u64;
		let mut total = 0u64;
		for (step, increment) in raws.into_iter().enumerate() {
			raw += increment;
			let sample = RawCounterSample { counter, raw, timestamp_ms: step as u64 + 1 };
			if let Some(Reconciled::Delta(delta)) = reconciler.reconcile(&sample).unwrap() {
				total += delta.delta;
			}
		}
		prop_assert_eq!(total, raw / 1000);
	}
}

#[test]
fn unknown_counters_are_rejected() {
	let topology = TopologyBuilder::new().build().unwrap();
	let mut reconciler = CounterReconciler::new(&topology, &EngineConfig::default());
	let sample = RawCounterSample {
		counter: CounterId(3),
		raw: 1,
		timestamp_ms: 1,
	};
	assert!(reconciler.reconcile(&sample).is_err());
}
