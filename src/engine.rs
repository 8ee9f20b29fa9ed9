use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::energy::{ConsumerAggregator, EnergyLedger, EnergyTarget};
use crate::error::{ConfigError, ReconcileError, SourceError};
use crate::reconciler::{CounterReconciler, RawCounterSample, Reconciled, ReconciledDelta, ResetNotice};
use crate::residency::{InvariantViolation, ResidencyDelta, ResidencyLedger};
use crate::topology::{PowerTopology, SlotIndex};

/// Freshness of the data behind a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
	/// Newest sample timestamp ingested so far
	pub last_sample_ms: Option<u64>,
	/// Sampling cycles lost to source failures since the last good batch
	pub consecutive_failures: u32,
	pub last_error: Option<String>,
	/// True until the first batch arrives and after any failed cycle
	pub stale: bool,
	/// Sources that failed during the last cycle while others still delivered
	pub degraded_sources: Vec<String>,
}

impl Default for Health {
	fn default() -> Self {
		Self {
			last_sample_ms: None,
			consecutive_failures: 0,
			last_error: None,
			stale: true,
			degraded_sources: Vec::new(),
		}
	}
}

/// Something noteworthy that happened on the ingest path
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
	Reset(ResetNotice),
	Anomaly(ReconcileError),
	Violation(InvariantViolation),
	SourceUnavailable(String),
}

/// Outcome of ingesting one batch of samples
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IngestReport {
	/// Newest timestamp in the batch
	pub timestamp_ms: Option<u64>,
	/// Number of reconciled deltas routed to a ledger
	pub applied: usize,
	pub resets: Vec<ResetNotice>,
	pub anomalies: Vec<ReconcileError>,
	pub violations: Vec<InvariantViolation>,
}

impl IngestReport {
	/// No resets, anomalies or violations in this cycle
	pub fn is_clean(&self) -> bool {
		self.resets.is_empty() && self.anomalies.is_empty() && self.violations.is_empty()
	}
}

// Writer-side state, touched only while ingesting
#[derive(Debug)]
struct ReconciliationContext {
	reconciler: CounterReconciler,
	aggregator: ConsumerAggregator,
}

// Deltas of one batch grouped by ledger slot before they are applied
struct PendingBatch {
	residency: Vec<Vec<ResidencyDelta>>,
	residency_timestamp: Vec<u64>,
	channels: Vec<Option<(u64, u64)>>,
	// Channel deltas not yet folded into consumer deltas, including ones flushed ahead of a channel reset
	channel_inputs: Vec<Option<u64>>,
	consumers: Vec<Option<u64>>,
}

impl PendingBatch {
	fn new(topology: &PowerTopology) -> Self {
		let entities = topology.entities().len();
		Self {
			residency: vec![Vec::new(); entities],
			residency_timestamp: vec![0; entities],
			channels: vec![None; topology.channels().len()],
			channel_inputs: vec![None; topology.channels().len()],
			consumers: vec![None; topology.consumers().len()],
		}
	}

	fn state_delta(&mut self, entity: usize, state: usize, timestamp_ms: u64) -> &mut ResidencyDelta {
		self.residency_timestamp[entity] = self.residency_timestamp[entity].max(timestamp_ms);
		let deltas = &mut self.residency[entity];
		let position = match deltas.iter().position(|delta| delta.state == state) {
			Some(position) => position,
			None => {
				deltas.push(ResidencyDelta {
					state,
					..Default::default()
				});
				deltas.len() - 1
			},
		};
		&mut deltas[position]
	}

	/// Turns the pending channel inputs into consumer deltas through the mapping table
	fn fold_channel_inputs(&mut self, aggregator: &mut ConsumerAggregator) {
		if self.channel_inputs.iter().all(Option::is_none) {
			return;
		}
		for (consumer, energy) in aggregator.aggregate(&self.channel_inputs) {
			let total = self.consumers[consumer].get_or_insert(0);
			*total = total.saturating_add(energy);
		}
		self.channel_inputs.fill(None);
	}

	fn add(&mut self, slot: SlotIndex, delta: &ReconciledDelta) {
		match slot {
			SlotIndex::StateDuration { entity, state } => {
				let pending = self.state_delta(entity, state, delta.timestamp_ms);
				pending.duration_ms = pending.duration_ms.saturating_add(delta.delta);
			},
			SlotIndex::StateEntries { entity, state } => {
				let pending = self.state_delta(entity, state, delta.timestamp_ms);
				pending.entries = pending.entries.saturating_add(delta.delta);
			},
			SlotIndex::Channel(channel) => {
				let (energy, timestamp) = self.channels[channel].get_or_insert((0, 0));
				*energy = energy.saturating_add(delta.delta);
				*timestamp = (*timestamp).max(delta.timestamp_ms);
				let input = self.channel_inputs[channel].get_or_insert(0);
				*input = input.saturating_add(delta.delta);
			},
			SlotIndex::Consumer(consumer) => {
				let energy = self.consumers[consumer].get_or_insert(0);
				*energy = energy.saturating_add(delta.delta);
			},
		}
	}
}

/// The power accounting engine
///
/// Owns the reconciliation context and both ledgers. Any number of threads
/// may query it while one producer feeds it through [`ingest`](Self::ingest).
#[derive(Debug)]
pub struct PowerStatsEngine {
	topology: Arc<PowerTopology>,
	config: EngineConfig,
	context: Mutex<ReconciliationContext>,
	residency: ResidencyLedger,
	energy: EnergyLedger,
	health: RwLock<Health>,
	events: Mutex<VecDeque<EngineEvent>>,
}

impl PowerStatsEngine {
	/// Builds an engine over a validated topology
	///
	/// Fails when `config` does not pass [`EngineConfig::validate`].
	pub fn new(topology: PowerTopology, config: EngineConfig) -> Result<Self, ConfigError> {
		config.validate()?;
		let topology = Arc::new(topology);

		let context = ReconciliationContext {
			reconciler: CounterReconciler::new(&topology, &config),
			aggregator: ConsumerAggregator::new(&topology, config.consumer_aggregation),
		};

		Ok(Self {
			residency: ResidencyLedger::new(Arc::clone(&topology), config.sampling_tolerance_ms),
			energy: EnergyLedger::new(Arc::clone(&topology)),
			context: Mutex::new(context),
			events: Mutex::new(VecDeque::with_capacity(config.event_log_capacity)),
			health: RwLock::new(Health::default()),
			topology,
			config,
		})
	}

	/// The static topology the engine was built with
	pub fn topology(&self) -> &PowerTopology {
		&self.topology
	}

	/// Policy the engine was built with
	pub fn config(&self) -> &EngineConfig {
		&self.config
	}

	/// Per-entity residency ledger, for direct queries
	pub fn residency(&self) -> &ResidencyLedger {
		&self.residency
	}

	/// Consumer and channel energy ledger, for direct queries
	pub fn energy(&self) -> &EnergyLedger {
		&self.energy
	}

	/// Current freshness indicator
	pub fn health(&self) -> Health {
		self.health.read().clone()
	}

	/// Most recent resets, anomalies, violations and outages, oldest first
	pub fn recent_events(&self) -> Vec<EngineEvent> {
		self.events.lock().iter().cloned().collect()
	}

	/// Reconciles a batch of raw samples and applies the result to the ledgers
	///
	/// Rejected samples are reported and skipped; the rest of the batch is
	/// still applied.
	pub fn ingest(&self, samples: &[RawCounterSample]) -> IngestReport {
		let mut report = IngestReport {
			timestamp_ms: samples.iter().map(|sample| sample.timestamp_ms).max(),
			..Default::default()
		};
		let mut pending = PendingBatch::new(&self.topology);

		let mut context = self.context.lock();
		let ReconciliationContext { reconciler, aggregator } = &mut *context;
		for sample in samples {
			match reconciler.reconcile(sample) {
				Ok(None) => {
					// A baseline-only sample starts the entity's uptime bound
					if let Some((_, SlotIndex::StateDuration { entity, .. } | SlotIndex::StateEntries { entity, .. })) =
						self.topology.counter(sample.counter)
					{
						self.residency.mark_origin(entity, sample.timestamp_ms);
					}
				},
				Ok(Some(Reconciled::Delta(delta))) => {
					if let Some((_, slot)) = self.topology.counter(delta.counter) {
						pending.add(slot, &delta);
						report.applied += 1;
					}
				},
				Ok(Some(Reconciled::Reset(notice))) => {
					self.apply_reset(&notice, &mut pending, aggregator);
					report.resets.push(notice);
				},
				Err(anomaly) => {
					warn!(%anomaly, "dropping sample");
					report.anomalies.push(anomaly);
				},
			}
		}

		for (entity, deltas) in pending.residency.iter().enumerate() {
			if deltas.is_empty() {
				continue;
			}
			let violations = self
				.residency
				.record_entity_deltas(entity, deltas, pending.residency_timestamp[entity]);
			report.violations.extend(violations);
		}

		for (channel, delta) in pending.channels.iter().enumerate() {
			if let Some((energy, timestamp)) = *delta {
				self.energy.record_channel_at(channel, energy, timestamp);
			}
		}

		let batch_timestamp = report.timestamp_ms.unwrap_or_default();
		pending.fold_channel_inputs(aggregator);
		for (consumer, delta) in pending.consumers.into_iter().enumerate() {
			if let Some(energy) = delta {
				self.energy.record_consumer_at(consumer, energy, batch_timestamp);
			}
		}
		drop(context);

		self.finish_batch(&report);
		report
	}

	fn apply_reset(&self, notice: &ResetNotice, pending: &mut PendingBatch, aggregator: &mut ConsumerAggregator) {
		let Some((_, slot)) = self.topology.counter(notice.counter) else {
			return;
		};

		let target = match slot {
			SlotIndex::Channel(channel) => {
				// Deltas already seen in this batch belong to the old epoch
				if let Some((energy, timestamp)) = pending.channels[channel].take() {
					self.energy.record_channel_at(channel, energy, timestamp);
				}
				EnergyTarget::Channel(self.topology.channels()[channel].id)
			},
			SlotIndex::Consumer(consumer) => {
				// Mapped channel energy seen earlier in the batch also belongs to the old epoch
				pending.fold_channel_inputs(aggregator);
				if let Some(energy) = pending.consumers[consumer].take() {
					self.energy.record_consumer_at(consumer, energy, notice.timestamp_ms);
				}
				EnergyTarget::Consumer(self.topology.consumers()[consumer].id)
			},
			// Residency is monotonic for the engine's lifetime; the lost interval is simply not counted
			SlotIndex::StateDuration { .. } | SlotIndex::StateEntries { .. } => {
				info!(counter = %notice.counter, raw = notice.raw, "residency counter reset");
				return;
			},
		};

		if let Err(err) = self.energy.restart_epoch(target, notice.timestamp_ms) {
			warn!(%err, "failed to restart energy epoch");
			return;
		}
		info!(
			counter = %notice.counter,
			previous_raw = notice.previous_raw,
			raw = notice.raw,
			epoch_start_ms = notice.timestamp_ms,
			"hardware counter reset, new energy epoch"
		);
	}

	fn finish_batch(&self, report: &IngestReport) {
		if let Some(timestamp) = report.timestamp_ms {
			let mut health = self.health.write();
			health.last_sample_ms = Some(health.last_sample_ms.map_or(timestamp, |last| last.max(timestamp)));
			health.consecutive_failures = 0;
			health.last_error = None;
			health.stale = false;
		}

		debug!(
			applied = report.applied,
			resets = report.resets.len(),
			anomalies = report.anomalies.len(),
			violations = report.violations.len(),
			"ingested sample batch"
		);

		if report.is_clean() {
			return;
		}
		let events = report
			.resets
			.iter()
			.copied()
			.map(EngineEvent::Reset)
			.chain(report.anomalies.iter().copied().map(EngineEvent::Anomaly))
			.chain(report.violations.iter().copied().map(EngineEvent::Violation));
		self.push_events(events);
	}

	/// Records the sources that failed during a cycle in which others still delivered
	///
	/// An empty `failures` clears the degraded list.
	pub fn record_degraded(&self, failures: &[SourceError]) {
		let names: Vec<String> = failures
			.iter()
			.map(|failure| failure.source_name().unwrap_or("unknown").to_string())
			.collect();
		{
			let mut health = self.health.write();
			health.degraded_sources = names;
			if let Some(last) = failures.last() {
				health.last_error = Some(last.to_string());
			}
		}
		if failures.is_empty() {
			return;
		}

		for failure in failures {
			warn!(error = %failure, "sample source degraded, its ledgers are not advancing");
		}
		self.push_events(failures.iter().map(|failure| EngineEvent::SourceUnavailable(failure.to_string())));
	}

	/// Marks a sampling cycle as lost; the data already in the ledgers is kept
	pub fn record_unavailable(&self, error: &SourceError) {
		let message = error.to_string();
		{
			let mut health = self.health.write();
			health.consecutive_failures = health.consecutive_failures.saturating_add(1);
			health.last_error = Some(message.clone());
			health.stale = true;
		}
		warn!(%error, "sample source unavailable, skipping cycle");
		self.push_events(std::iter::once(EngineEvent::SourceUnavailable(message)));
	}

	fn push_events(&self, new_events: impl IntoIterator<Item = EngineEvent>) {
		let capacity = self.config.event_log_capacity;
		if capacity == 0 {
			return;
		}
		let mut events = self.events.lock();
		for event in new_events {
			if events.len() == capacity {
				events.pop_front();
			}
			events.push_back(event);
		}
	}
}
