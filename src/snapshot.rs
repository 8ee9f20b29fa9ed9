//! Read-only query surface over the engine's ledgers
//!
//! Every query returns one result per requested id in request order (or
//! every known id when the request is empty). Unknown ids come back as
//! inline [`QueryError`]s next to the successful entries, and each answer
//! carries the engine's [`Health`] so callers can judge staleness.

use std::sync::Arc;

use serde::Serialize;

use crate::energy::{ChannelEnergy, ConsumerEnergy};
use crate::engine::{Health, PowerStatsEngine};
use crate::error::QueryError;
use crate::residency::EntityResidency;
use crate::topology::{Channel, ChannelId, ConsumerId, EnergyConsumer, EntityId, PowerEntity};

/// Per-id results of one query plus the engine health at query time
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(bound = "T: Serialize")]
pub struct Snapshot<T> {
	#[serde(serialize_with = "serialize_entries")]
	pub entries: Vec<Result<T, QueryError>>,
	pub health: Health,
}

impl<T> Snapshot<T> {
	pub fn successes(&self) -> impl Iterator<Item = &T> {
		self.entries.iter().filter_map(|entry| entry.as_ref().ok())
	}

	pub fn errors(&self) -> impl Iterator<Item = &QueryError> {
		self.entries.iter().filter_map(|entry| entry.as_ref().err())
	}
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum EntryRepr<'a, T> {
	Ok(&'a T),
	Error(String),
}

fn serialize_entries<S, T>(entries: &Vec<Result<T, QueryError>>, serializer: S) -> Result<S::Ok, S::Error>
where
	S: serde::Serializer,
	T: Serialize,
{
	serializer.collect_seq(entries.iter().map(|entry| match entry {
		Ok(value) => EntryRepr::Ok(value),
		Err(err) => EntryRepr::Error(err.to_string()),
	}))
}

/// Answers point-in-time queries while sampling carries on concurrently
#[derive(Debug, Clone)]
pub struct SnapshotServer {
	engine: Arc<PowerStatsEngine>,
}

impl SnapshotServer {
	pub fn new(engine: Arc<PowerStatsEngine>) -> Self {
		Self { engine }
	}

	pub fn engine(&self) -> &Arc<PowerStatsEngine> {
		&self.engine
	}

	fn snapshot<T>(&self, entries: Vec<Result<T, QueryError>>) -> Snapshot<T> {
		Snapshot {
			entries,
			health: self.engine.health(),
		}
	}

	/// Known power entities and their states
	pub fn entity_info(&self) -> Vec<PowerEntity> {
		self.engine.topology().entities().to_vec()
	}

	/// Residency rows for `ids`, or every entity when `ids` is empty
	pub fn state_residency(&self, ids: &[EntityId]) -> Snapshot<EntityResidency> {
		self.snapshot(self.engine.residency().query(ids))
	}

	/// Known energy consumers with their kind and ordinal
	pub fn energy_consumer_info(&self) -> Vec<EnergyConsumer> {
		self.engine.topology().consumers().to_vec()
	}

	/// Cumulative consumer energy, annotated with the reset epoch it belongs to
	pub fn energy_consumed(&self, ids: &[ConsumerId]) -> Snapshot<ConsumerEnergy> {
		self.snapshot(self.engine.energy().query_consumers(ids))
	}

	/// Meter channels and the rails they measure
	pub fn meter_info(&self) -> Vec<Channel> {
		self.engine.topology().channels().to_vec()
	}

	/// Cumulative energy per channel; unknown ids are reported inline
	pub fn read_energy_meters(&self, ids: &[ChannelId]) -> Snapshot<ChannelEnergy> {
		self.snapshot(self.engine.energy().query_channels(ids))
	}
}
