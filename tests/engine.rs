use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use power_stats::error::QueryError;
use power_stats::reconciler::RawCounterSample;
use power_stats::topology::{
	ChannelId, ConsumerId, ConsumerKind, CounterId, CounterScale, CounterTarget, EntityId, PowerTopology,
};
use power_stats::{EngineConfig, EngineEvent, PowerStatsEngine, SnapshotServer, TopologyBuilder};

struct Counters {
	c1_time: CounterId,
	c1_entries: CounterId,
	c6_time: CounterId,
	rail: CounterId,
}

fn phone_topology() -> (PowerTopology, Counters) {
	let mut builder = TopologyBuilder::new();
	let (cpu, states) = builder.add_entity("cpu0", ["C1", "C6"]);
	builder.add_entity("gpu", ["ON", "OFF"]);
	let rail = builder.add_channel("S4M_VDD_CPUCL0", "cpu_little");
	let cpu_consumer = builder.add_consumer(ConsumerKind::CpuCluster, "CPU0");
	builder.map_consumer_channel(cpu_consumer, rail, 1.0);

	let counters = Counters {
		c1_time: builder.add_counter(32, CounterScale::IDENTITY, CounterTarget::StateDuration {
			entity: cpu,
			state: states[0],
		}),
		c1_entries: builder.add_counter(32, CounterScale::IDENTITY, CounterTarget::StateEntries {
			entity: cpu,
			state: states[0],
		}),
		c6_time: builder.add_counter(32, CounterScale::IDENTITY, CounterTarget::StateDuration {
			entity: cpu,
			state: states[1],
		}),
		rail: builder.add_counter(32, CounterScale::IDENTITY, CounterTarget::Channel { channel: rail }),
	};
	(builder.build().unwrap(), counters)
}

fn sample(counter: CounterId, raw: u64, timestamp_ms: u64) -> RawCounterSample {
	RawCounterSample {
		counter,
		raw,
		timestamp_ms,
	}
}

#[test]
fn readers_never_see_torn_state_rows() {
	let (topology, counters) = phone_topology();
	let engine = Arc::new(PowerStatsEngine::new(topology, EngineConfig::default()).unwrap());
	let server = SnapshotServer::new(Arc::clone(&engine));
	let done = Arc::new(AtomicBool::new(false));

	let readers: Vec<_> = (0..4)
		.map(|_| {
			let server = server.clone();
			let done = Arc::clone(&done);
			thread::spawn(move || {
				let mut last = 0;
				while !done.load(Ordering::Acquire) {
					let snapshot = server.state_residency(&[EntityId(0)]);
					let cpu = snapshot.successes().next().unwrap();
					let c1 = cpu.states[0];
					assert_eq!(c1.total_time_ms, c1.total_entries);
					assert!(c1.total_time_ms >= last);
					last = c1.total_time_ms;
				}
			})
		})
		.collect();

	for step in 1..=1_000u64 {
		let report = engine.ingest(&[
			sample(counters.c1_time, step, step),
			sample(counters.c1_entries, step, step),
		]);
		assert!(report.is_clean(), "step {step}: {report:?}");
	}
	done.store(true, Ordering::Release);
	for reader in readers {
		reader.join().unwrap();
	}

	let cpu = engine.residency().query(&[EntityId(0)]).remove(0).unwrap();
	assert_eq!(cpu.states[0].total_time_ms, 1_000);
	assert_eq!(cpu.states[0].total_entries, 1_000);
}

#[test]
fn queries_report_unknown_ids_inline() {
	let (topology, _) = phone_topology();
	let server = SnapshotServer::new(Arc::new(PowerStatsEngine::new(topology, EngineConfig::default()).unwrap()));

	let residency = server.state_residency(&[EntityId(1), EntityId(9), EntityId(0)]);
	assert_eq!(residency.entries.len(), 3);
	assert_eq!(residency.entries[0].as_ref().unwrap().entity, EntityId(1));
	assert_eq!(residency.entries[1], Err(QueryError::UnknownEntity(EntityId(9))));
	assert_eq!(residency.entries[2].as_ref().unwrap().entity, EntityId(0));

	let meters = server.read_energy_meters(&[ChannelId(3)]);
	assert_eq!(meters.errors().count(), 1);
	let consumers = server.energy_consumed(&[ConsumerId(0)]);
	assert_eq!(consumers.successes().count(), 1);

	let info = serde_json::to_string(&server.entity_info()).unwrap();
	assert_eq!(info, serde_json::to_string(&server.entity_info()).unwrap());
}

#[test]
fn consumer_energy_stays_monotonic_across_resets() {
	let (topology, counters) = phone_topology();
	let engine = PowerStatsEngine::new(topology, EngineConfig::default()).unwrap();
	let raws = [1_000u64, 2_000, 3_000_000_000, 3_000_000_500, 40, 90];

	let mut last_consumer = 0;
	for (step, &raw) in raws.iter().enumerate() {
		engine.ingest(&[sample(counters.rail, raw, 1_000 * (step as u64 + 1))]);
		let consumer = engine.energy().query_consumers(&[]).remove(0).unwrap();
		assert!(consumer.entry.energy_uj >= last_consumer);
		last_consumer = consumer.entry.energy_uj;
	}

	// 3_000_000_500 -> 40 implies a wrap advance far above 5% of 2^32
	let channel = engine.energy().query_channels(&[]).remove(0).unwrap();
	assert_eq!(channel.entry.epoch, 1);
	assert_eq!(channel.entry.epoch_start_ms, Some(5_000));
	assert_eq!(channel.entry.energy_uj, 50);
	assert_eq!(last_consumer, 3_000_000_500 + 50);
	assert!(
		engine
			.recent_events()
			.iter()
			.any(|event| matches!(event, EngineEvent::Reset(notice) if notice.counter == counters.rail))
	);
}

#[test]
fn residency_is_clamped_to_uptime() {
	let (topology, counters) = phone_topology();
	let config = EngineConfig {
		sampling_tolerance_ms: 50,
		..EngineConfig::default()
	};
	let engine = PowerStatsEngine::new(topology, config).unwrap();

	engine.ingest(&[sample(counters.c1_time, 600, 1_000), sample(counters.c6_time, 400, 1_000)]);
	// Each delta fits its own 100 ms interval, together they overrun the uptime bound
	let report = engine.ingest(&[sample(counters.c1_time, 700, 1_100), sample(counters.c6_time, 550, 1_100)]);

	assert!(report.anomalies.is_empty());
	assert_eq!(report.violations.len(), 1);
	assert_eq!(report.violations[0].applied_ms, 50);
	let cpu = engine.residency().query(&[EntityId(0)]).remove(0).unwrap();
	assert_eq!(cpu.total_time_ms(), 1_150);
}
