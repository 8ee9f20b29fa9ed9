use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::topology::{ChannelId, ConsumerId, CounterId, EntityId, StateId};

/// Rejections raised while validating a static topology
#[derive(Debug, Error, PartialEq)]
pub enum TopologyError {
	#[error("duplicate power entity id {0}")]
	DuplicateEntity(EntityId),
	#[error("power entity {0} defines no states")]
	EmptyEntity(EntityId),
	#[error("duplicate state id {state} in power entity {entity}")]
	DuplicateState { entity: EntityId, state: StateId },
	#[error("duplicate energy consumer id {0}")]
	DuplicateConsumer(ConsumerId),
	#[error("duplicate channel id {0}")]
	DuplicateChannel(ChannelId),
	#[error("duplicate counter id {0}")]
	DuplicateCounter(CounterId),
	#[error("counter {counter} has unsupported width {width_bits} (expected 1..=64)")]
	InvalidWidth { counter: CounterId, width_bits: u32 },
	#[error("counter {0} has a zero scale numerator or denominator")]
	InvalidScale(CounterId),
	#[error("counter {counter} has reset threshold {threshold} outside (0, 1]")]
	InvalidResetThreshold { counter: CounterId, threshold: f64 },
	#[error("counter {0} targets a ledger slot already bound to another counter")]
	DuplicateTarget(CounterId),
	#[error("reference to unknown power entity {0}")]
	UnknownEntity(EntityId),
	#[error("reference to unknown state {state} of power entity {entity}")]
	UnknownState { entity: EntityId, state: StateId },
	#[error("reference to unknown energy consumer {0}")]
	UnknownConsumer(ConsumerId),
	#[error("reference to unknown channel {0}")]
	UnknownChannel(ChannelId),
	#[error("consumer {consumer} is mapped to channel {channel} more than once")]
	DuplicateMapping { consumer: ConsumerId, channel: ChannelId },
	#[error("consumer {consumer} maps channel {channel} with invalid weight {weight}")]
	InvalidWeight {
		consumer: ConsumerId,
		channel: ChannelId,
		weight: f64,
	},
}

/// Invalid engine options or an unreadable configuration file
#[derive(Debug, Error)]
pub enum ConfigError {
	#[error("invalid configuration: {0}")]
	Invalid(String),
	#[error("failed to read config {path}: {source}")]
	Read { path: PathBuf, source: io::Error },
	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_json::Error),
	#[error("topology error: {0}")]
	Topology(#[from] TopologyError),
}

/// Per-id lookup failure reported inline with successful results
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum QueryError {
	#[error("unknown power entity {0}")]
	UnknownEntity(EntityId),
	#[error("unknown state {state} of power entity {entity}")]
	UnknownState { entity: EntityId, state: StateId },
	#[error("unknown energy consumer {0}")]
	UnknownConsumer(ConsumerId),
	#[error("unknown channel {0}")]
	UnknownChannel(ChannelId),
}

/// A raw sample that was dropped during reconciliation
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ReconcileError {
	#[error("sample for unregistered counter {counter}")]
	UnknownCounter { counter: CounterId },
	#[error("counter {counter} sampled at {timestamp_ms} ms, not after previous sample at {previous_ms} ms")]
	ClockAnomaly {
		counter: CounterId,
		previous_ms: u64,
		timestamp_ms: u64,
	},
	#[error("counter {counter} raw value {raw:#x} does not fit in {width_bits} bits")]
	RawOutOfRange { counter: CounterId, raw: u64, width_bits: u32 },
	#[error("counter {counter} advanced {delta} ms of residency within a {duration_ms} ms interval")]
	ImplausibleDelta {
		counter: CounterId,
		delta: u64,
		duration_ms: u64,
	},
}

/// Failure of a sample source to produce a batch
#[derive(Debug, Error)]
pub enum SourceError {
	#[error("sample source {source_name} unavailable: {reason}")]
	Unavailable { source_name: String, reason: String },
	#[error("sample source i/o error: {0}")]
	Io(#[from] io::Error),
}

impl SourceError {
	/// Name of the failing source, when the error carries one
	pub fn source_name(&self) -> Option<&str> {
		match self {
			SourceError::Unavailable { source_name, .. } => Some(source_name),
			SourceError::Io(_) => None,
		}
	}
}

/// Anything that stops the monitor from starting or keeps it from rendering
#[derive(Debug, Error)]
pub enum Error {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Topology(#[from] TopologyError),
	#[error(transparent)]
	Source(#[from] SourceError),
	#[error("display error: {0}")]
	Display(#[from] io::Error),
}
