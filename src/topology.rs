use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TopologyError;

macro_rules! define_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(pub u32);

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				write!(f, "{}", self.0)
			}
		}
	};
}

define_id!(
	/// Identifier of a power entity
	EntityId
);
define_id!(
	/// Identifier of a low-power state, unique within its entity
	StateId
);
define_id!(
	/// Identifier of a logical energy consumer
	ConsumerId
);
define_id!(
	/// Identifier of a physical energy meter channel
	ChannelId
);
define_id!(
	/// Identifier of a raw hardware counter
	CounterId
);

/// A named low-power state of a power entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
	pub id: StateId,
	pub name: String,
}

/// A power domain with an ordered set of mutually exclusive states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerEntity {
	pub id: EntityId,
	pub name: String,
	pub states: Vec<State>,
}

/// Subsystem class of an energy consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerKind {
	#[default]
	Other,
	Bluetooth,
	CpuCluster,
	Display,
	Gnss,
	MobileRadio,
	Wifi,
}

/// A logical aggregation point for energy accounting
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergyConsumer {
	pub id: ConsumerId,
	#[serde(default)]
	pub kind: ConsumerKind,
	/// Distinguishes several consumers of the same kind
	#[serde(default)]
	pub ordinal: u32,
	pub name: String,
}

/// A physical energy meter channel measuring one rail
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
	pub id: ChannelId,
	pub name: String,
	pub rail: String,
}

/// One row of the consumer/channel mapping table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsumerChannel {
	pub consumer: ConsumerId,
	pub channel: ChannelId,
	#[serde(default = "default_weight")]
	pub weight: f64,
}

fn default_weight() -> f64 {
	1.0
}

/// Rational conversion from raw counter units to ledger units
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterScale {
	pub numerator: u64,
	pub denominator: u64,
}

impl CounterScale {
	pub const IDENTITY: Self = Self {
		numerator: 1,
		denominator: 1,
	};

	pub const fn new(numerator: u64, denominator: u64) -> Self {
		Self { numerator, denominator }
	}
}

impl Default for CounterScale {
	fn default() -> Self {
		Self::IDENTITY
	}
}

/// The ledger slot a counter feeds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterTarget {
	/// Time spent in a state, scaled to milliseconds
	StateDuration { entity: EntityId, state: StateId },
	/// Number of entries into a state
	StateEntries { entity: EntityId, state: StateId },
	/// Energy on a meter channel, scaled to microjoules
	Channel { channel: ChannelId },
	/// Energy attributed directly to a consumer, scaled to microjoules
	Consumer { consumer: ConsumerId },
}

/// Static definition of one raw hardware counter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterSpec {
	pub id: CounterId,
	pub width_bits: u32,
	#[serde(default)]
	pub scale: CounterScale,
	pub target: CounterTarget,
	/// Overrides the engine-wide reset threshold for this counter
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub reset_threshold: Option<f64>,
}

/// Serializable static topology as supplied at initialization
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TopologySpec {
	#[serde(default)]
	pub entities: Vec<PowerEntity>,
	#[serde(default)]
	pub consumers: Vec<EnergyConsumer>,
	#[serde(default)]
	pub channels: Vec<Channel>,
	#[serde(default)]
	pub consumer_channels: Vec<ConsumerChannel>,
	#[serde(default)]
	pub counters: Vec<CounterSpec>,
}

/// Ledger slot position of a counter target after validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotIndex {
	StateDuration { entity: usize, state: usize },
	StateEntries { entity: usize, state: usize },
	Channel(usize),
	Consumer(usize),
}

/// Validated, indexed topology shared read-only by the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TopologySpec", into = "TopologySpec")]
pub struct PowerTopology {
	spec: TopologySpec,
	entity_index: HashMap<EntityId, usize>,
	state_index: Vec<HashMap<StateId, usize>>,
	consumer_index: HashMap<ConsumerId, usize>,
	channel_index: HashMap<ChannelId, usize>,
	counter_index: HashMap<CounterId, usize>,
	counter_slots: Vec<SlotIndex>,
	// consumer position -> (channel position, weight)
	consumer_inputs: Vec<Vec<(usize, f64)>>,
}

impl PowerTopology {
	/// Validates a topology definition and builds its lookup indexes
	pub fn new(spec: TopologySpec) -> Result<Self, TopologyError> {
		let mut entity_index = HashMap::new();
		let mut state_index = Vec::with_capacity(spec.entities.len());
		for (position, entity) in spec.entities.iter().enumerate() {
			if entity_index.insert(entity.id, position).is_some() {
				return Err(TopologyError::DuplicateEntity(entity.id));
			}
			if entity.states.is_empty() {
				return Err(TopologyError::EmptyEntity(entity.id));
			}

			let mut states = HashMap::new();
			for (state_position, state) in entity.states.iter().enumerate() {
				if states.insert(state.id, state_position).is_some() {
					return Err(TopologyError::DuplicateState {
						entity: entity.id,
						state: state.id,
					});
				}
			}
			state_index.push(states);
		}

		let mut consumer_index = HashMap::new();
		for (position, consumer) in spec.consumers.iter().enumerate() {
			if consumer_index.insert(consumer.id, position).is_some() {
				return Err(TopologyError::DuplicateConsumer(consumer.id));
			}
		}

		let mut channel_index = HashMap::new();
		for (position, channel) in spec.channels.iter().enumerate() {
			if channel_index.insert(channel.id, position).is_some() {
				return Err(TopologyError::DuplicateChannel(channel.id));
			}
		}

		let mut consumer_inputs = vec![Vec::new(); spec.consumers.len()];
		let mut mapped = HashSet::new();
		for mapping in &spec.consumer_channels {
			let consumer = *consumer_index
				.get(&mapping.consumer)
				.ok_or(TopologyError::UnknownConsumer(mapping.consumer))?;
			let channel = *channel_index
				.get(&mapping.channel)
				.ok_or(TopologyError::UnknownChannel(mapping.channel))?;
			if !mapping.weight.is_finite() || mapping.weight < 0.0 {
				return Err(TopologyError::InvalidWeight {
					consumer: mapping.consumer,
					channel: mapping.channel,
					weight: mapping.weight,
				});
			}
			if !mapped.insert((consumer, channel)) {
				return Err(TopologyError::DuplicateMapping {
					consumer: mapping.consumer,
					channel: mapping.channel,
				});
			}
			consumer_inputs[consumer].push((channel, mapping.weight));
		}

		let mut topology = Self {
			spec: TopologySpec::default(),
			entity_index,
			state_index,
			consumer_index,
			channel_index,
			counter_index: HashMap::new(),
			counter_slots: Vec::with_capacity(spec.counters.len()),
			consumer_inputs,
		};

		let mut bound = HashSet::new();
		for (position, counter) in spec.counters.iter().enumerate() {
			if topology.counter_index.insert(counter.id, position).is_some() {
				return Err(TopologyError::DuplicateCounter(counter.id));
			}
			if counter.width_bits == 0 || counter.width_bits > 64 {
				return Err(TopologyError::InvalidWidth {
					counter: counter.id,
					width_bits: counter.width_bits,
				});
			}
			if counter.scale.numerator == 0 || counter.scale.denominator == 0 {
				return Err(TopologyError::InvalidScale(counter.id));
			}
			if let Some(threshold) = counter.reset_threshold {
				if !(threshold > 0.0 && threshold <= 1.0) {
					return Err(TopologyError::InvalidResetThreshold {
						counter: counter.id,
						threshold,
					});
				}
			}

			let slot = topology.resolve_target(counter.target)?;
			if !bound.insert(slot) {
				return Err(TopologyError::DuplicateTarget(counter.id));
			}
			topology.counter_slots.push(slot);
		}

		topology.spec = spec;
		Ok(topology)
	}

	fn resolve_target(&self, target: CounterTarget) -> Result<SlotIndex, TopologyError> {
		let state_position = |entity: EntityId, state: StateId| -> Result<(usize, usize), TopologyError> {
			let entity_position = *self.entity_index.get(&entity).ok_or(TopologyError::UnknownEntity(entity))?;
			let state_position = *self.state_index[entity_position]
				.get(&state)
				.ok_or(TopologyError::UnknownState { entity, state })?;
			Ok((entity_position, state_position))
		};

		Ok(match target {
			CounterTarget::StateDuration { entity, state } => {
				let (entity, state) = state_position(entity, state)?;
				SlotIndex::StateDuration { entity, state }
			},
			CounterTarget::StateEntries { entity, state } => {
				let (entity, state) = state_position(entity, state)?;
				SlotIndex::StateEntries { entity, state }
			},
			CounterTarget::Channel { channel } => SlotIndex::Channel(
				*self
					.channel_index
					.get(&channel)
					.ok_or(TopologyError::UnknownChannel(channel))?,
			),
			CounterTarget::Consumer { consumer } => SlotIndex::Consumer(
				*self
					.consumer_index
					.get(&consumer)
					.ok_or(TopologyError::UnknownConsumer(consumer))?,
			),
		})
	}

	pub fn entities(&self) -> &[PowerEntity] {
		&self.spec.entities
	}

	pub fn consumers(&self) -> &[EnergyConsumer] {
		&self.spec.consumers
	}

	pub fn channels(&self) -> &[Channel] {
		&self.spec.channels
	}

	pub fn counters(&self) -> &[CounterSpec] {
		&self.spec.counters
	}

	/// Row of `id` in `entities()`
	pub fn entity_position(&self, id: EntityId) -> Option<usize> {
		self.entity_index.get(&id).copied()
	}

	pub fn state_position(&self, entity: usize, state: StateId) -> Option<usize> {
		self.state_index.get(entity)?.get(&state).copied()
	}

	pub fn consumer_position(&self, id: ConsumerId) -> Option<usize> {
		self.consumer_index.get(&id).copied()
	}

	pub fn channel_position(&self, id: ChannelId) -> Option<usize> {
		self.channel_index.get(&id).copied()
	}

	/// Returns the counter definition and the ledger slot it feeds
	pub fn counter(&self, id: CounterId) -> Option<(&CounterSpec, SlotIndex)> {
		let position = *self.counter_index.get(&id)?;
		Some((&self.spec.counters[position], self.counter_slots[position]))
	}

	/// Channels feeding each consumer, indexed by consumer position
	pub fn consumer_inputs(&self) -> &[Vec<(usize, f64)>] {
		&self.consumer_inputs
	}
}

impl TryFrom<TopologySpec> for PowerTopology {
	type Error = TopologyError;

	fn try_from(spec: TopologySpec) -> Result<Self, Self::Error> {
		Self::new(spec)
	}
}

impl From<PowerTopology> for TopologySpec {
	fn from(topology: PowerTopology) -> Self {
		topology.spec
	}
}

/// Assembles a topology with sequentially assigned identifiers
///
/// Sample sources use this to declare whatever hardware they discover at
/// runtime; the ids they get back are the ones their samples must carry.
#[derive(Debug, Default)]
pub struct TopologyBuilder {
	spec: TopologySpec,
}

impl TopologyBuilder {
	pub fn new() -> Self {
		Self::default()
	}

	/// Adds a power entity with the given state names, returning its id and state ids
	pub fn add_entity<S: Into<String>>(
		&mut self,
		name: impl Into<String>,
		states: impl IntoIterator<Item = S>,
	) -> (EntityId, Vec<StateId>) {
		let id = EntityId(self.spec.entities.len() as u32);
		let states: Vec<State> = states
			.into_iter()
			.enumerate()
			.map(|(index, name)| State {
				id: StateId(index as u32),
				name: name.into(),
			})
			.collect();
		let state_ids = states.iter().map(|state| state.id).collect();

		self.spec.entities.push(PowerEntity {
			id,
			name: name.into(),
			states,
		});
		(id, state_ids)
	}

	pub fn add_consumer(&mut self, kind: ConsumerKind, name: impl Into<String>) -> ConsumerId {
		let id = ConsumerId(self.spec.consumers.len() as u32);
		let ordinal = self.spec.consumers.iter().filter(|consumer| consumer.kind == kind).count() as u32;
		self.spec.consumers.push(EnergyConsumer {
			id,
			kind,
			ordinal,
			name: name.into(),
		});
		id
	}

	pub fn add_channel(&mut self, name: impl Into<String>, rail: impl Into<String>) -> ChannelId {
		let id = ChannelId(self.spec.channels.len() as u32);
		self.spec.channels.push(Channel {
			id,
			name: name.into(),
			rail: rail.into(),
		});
		id
	}

	/// Feeds `channel` into `consumer`; `weight` only matters under weighted aggregation
	pub fn map_consumer_channel(&mut self, consumer: ConsumerId, channel: ChannelId, weight: f64) {
		self.spec.consumer_channels.push(ConsumerChannel {
			consumer,
			channel,
			weight,
		});
	}

	/// Adds a hardware counter using the engine-wide reset threshold
	pub fn add_counter(&mut self, width_bits: u32, scale: CounterScale, target: CounterTarget) -> CounterId {
		let id = CounterId(self.spec.counters.len() as u32);
		self.spec.counters.push(CounterSpec {
			id,
			width_bits,
			scale,
			target,
			reset_threshold: None,
		});
		id
	}

	/// Validates the collected description
	pub fn build(self) -> Result<PowerTopology, TopologyError> {
		PowerTopology::new(self.spec)
	}
}
