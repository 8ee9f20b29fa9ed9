use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use crate::config::ConsumerAggregation;
use crate::error::QueryError;
use crate::topology::{ChannelId, ConsumerId, PowerTopology};

/// Cumulative energy of one consumer or channel within its current epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct EnergyEntry {
	/// Timestamp (ms since boot) of the last update
	pub timestamp_ms: u64,
	pub energy_uj: u64,
	/// Number of hardware resets seen so far
	pub epoch: u32,
	/// When the current epoch began, if a reset has occurred
	pub epoch_start_ms: Option<u64>,
}

/// Energy reading of one consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConsumerEnergy {
	pub consumer: ConsumerId,
	#[serde(flatten)]
	pub entry: EnergyEntry,
}

/// Energy reading of one meter channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChannelEnergy {
	pub channel: ChannelId,
	#[serde(flatten)]
	pub entry: EnergyEntry,
}

/// Ledger namespace an energy delta is recorded against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EnergyTarget {
	Consumer(ConsumerId),
	Channel(ChannelId),
}

/// Cumulative energy per consumer and per meter channel
///
/// Consumers and channels are independent namespaces with one lock per
/// entry; consumer totals are fed through the mapping table by the engine,
/// never by aliasing channel entries.
#[derive(Debug)]
pub struct EnergyLedger {
	topology: Arc<PowerTopology>,
	consumers: Vec<RwLock<EnergyEntry>>,
	channels: Vec<RwLock<EnergyEntry>>,
}

fn add(lock: &RwLock<EnergyEntry>, delta_uj: u64, timestamp_ms: u64) {
	let mut entry = lock.write();
	entry.energy_uj = entry.energy_uj.saturating_add(delta_uj);
	entry.timestamp_ms = entry.timestamp_ms.max(timestamp_ms);
}

impl EnergyLedger {
	/// Zeroed entries for every consumer and channel of `topology`
	pub fn new(topology: Arc<PowerTopology>) -> Self {
		let consumers = topology.consumers().iter().map(|_| RwLock::default()).collect();
		let channels = topology.channels().iter().map(|_| RwLock::default()).collect();
		Self {
			topology,
			consumers,
			channels,
		}
	}

	fn entry(&self, target: EnergyTarget) -> Result<&RwLock<EnergyEntry>, QueryError> {
		match target {
			EnergyTarget::Consumer(id) => self
				.topology
				.consumer_position(id)
				.map(|position| &self.consumers[position])
				.ok_or(QueryError::UnknownConsumer(id)),
			EnergyTarget::Channel(id) => self
				.topology
				.channel_position(id)
				.map(|position| &self.channels[position])
				.ok_or(QueryError::UnknownChannel(id)),
		}
	}

	/// Adds `delta_uj` to the current epoch of `target`
	pub fn record_energy_delta(&self, target: EnergyTarget, delta_uj: u64, timestamp_ms: u64) -> Result<(), QueryError> {
		add(self.entry(target)?, delta_uj, timestamp_ms);
		Ok(())
	}

	/// Starts a new epoch after a hardware reset of the counter behind `target`
	pub fn restart_epoch(&self, target: EnergyTarget, timestamp_ms: u64) -> Result<(), QueryError> {
		let mut entry = self.entry(target)?.write();
		entry.energy_uj = 0;
		entry.epoch += 1;
		entry.epoch_start_ms = Some(timestamp_ms);
		entry.timestamp_ms = entry.timestamp_ms.max(timestamp_ms);
		Ok(())
	}

	pub(crate) fn record_consumer_at(&self, position: usize, delta_uj: u64, timestamp_ms: u64) {
		if let Some(lock) = self.consumers.get(position) {
			add(lock, delta_uj, timestamp_ms);
		}
	}

	pub(crate) fn record_channel_at(&self, position: usize, delta_uj: u64, timestamp_ms: u64) {
		if let Some(lock) = self.channels.get(position) {
			add(lock, delta_uj, timestamp_ms);
		}
	}

	/// Readings for the requested consumers, or all of them when `ids` is empty
	pub fn query_consumers(&self, ids: &[ConsumerId]) -> Vec<Result<ConsumerEnergy, QueryError>> {
		let read = |position: usize| ConsumerEnergy {
			consumer: self.topology.consumers()[position].id,
			entry: *self.consumers[position].read(),
		};

		if ids.is_empty() {
			return (0..self.consumers.len()).map(|position| Ok(read(position))).collect();
		}
		ids.iter()
			.map(|&id| {
				self.topology
					.consumer_position(id)
					.map(|position| read(position))
					.ok_or(QueryError::UnknownConsumer(id))
			})
			.collect()
	}

	/// Readings for the requested channels, or all of them when `ids` is empty
	pub fn query_channels(&self, ids: &[ChannelId]) -> Vec<Result<ChannelEnergy, QueryError>> {
		let read = |position: usize| ChannelEnergy {
			channel: self.topology.channels()[position].id,
			entry: *self.channels[position].read(),
		};

		if ids.is_empty() {
			return (0..self.channels.len()).map(|position| Ok(read(position))).collect();
		}
		ids.iter()
			.map(|&id| {
				self.topology
					.channel_position(id)
					.map(|position| read(position))
					.ok_or(QueryError::UnknownChannel(id))
			})
			.collect()
	}
}

/// Folds channel deltas into consumer deltas through the mapping table
#[derive(Debug)]
pub struct ConsumerAggregator {
	policy: ConsumerAggregation,
	inputs: Vec<Vec<(usize, f64)>>,
	// Fractional microjoules left over from weighted sums
	carry: Vec<f64>,
}

impl ConsumerAggregator {
	/// Uses the consumer inputs of `topology`, all carries starting at zero
	pub fn new(topology: &PowerTopology, policy: ConsumerAggregation) -> Self {
		let inputs = topology.consumer_inputs().to_vec();
		let carry = vec![0.0; inputs.len()];
		Self { policy, inputs, carry }
	}

	/// Returns `(consumer position, delta)` for every consumer fed by at least one of `channel_deltas`
	///
	/// `channel_deltas` is indexed by channel position.
	pub fn aggregate(&mut self, channel_deltas: &[Option<u64>]) -> Vec<(usize, u64)> {
		let mut out = Vec::new();
		for (consumer, inputs) in self.inputs.iter().enumerate() {
			let fed: Vec<(u64, f64)> = inputs
				.iter()
				.filter_map(|&(channel, weight)| {
					channel_deltas
						.get(channel)
						.copied()
						.flatten()
						.map(|delta| (delta, weight))
				})
				.collect();
			if fed.is_empty() {
				continue;
			}

			let delta = match self.policy {
				ConsumerAggregation::Sum => fed.iter().fold(0u64, |sum, &(delta, _)| sum.saturating_add(delta)),
				ConsumerAggregation::Weighted => {
					let exact = fed.iter().map(|&(delta, weight)| delta as f64 * weight).sum::<f64>() + self.carry[consumer];
					let whole = exact.floor();
					self.carry[consumer] = exact - whole;
					whole as u64
				},
			};
			out.push((consumer, delta));
		}
		out
	}
}
