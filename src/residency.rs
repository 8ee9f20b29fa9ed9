use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::warn;

use crate::error::QueryError;
use crate::topology::{EntityId, PowerTopology, StateId};

/// Cumulative residency of one state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateResidency {
	pub state: StateId,
	pub total_time_ms: u64,
	pub total_entries: u64,
	/// Timestamp (ms since boot) of the sample that last updated this state
	pub last_update_ms: u64,
}

/// Residency of every state of one entity, read atomically
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityResidency {
	pub entity: EntityId,
	pub states: Vec<StateResidency>,
}

impl EntityResidency {
	pub fn total_time_ms(&self) -> u64 {
		self.states.iter().map(|state| state.total_time_ms).sum()
	}
}

/// Pending update for one state, addressed by its position within the entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ResidencyDelta {
	pub state: usize,
	pub duration_ms: u64,
	pub entries: u64,
}

/// A duration delta that would have pushed an entity past elapsed uptime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct InvariantViolation {
	pub entity: EntityId,
	pub state: StateId,
	pub requested_ms: u64,
	pub applied_ms: u64,
	pub uptime_ms: u64,
}

/// Per-entity cumulative state residency
///
/// Every entity row sits behind its own lock, so a state's duration and
/// entry count always move together and readers of other entities are
/// never held up by a write.
#[derive(Debug)]
pub struct ResidencyLedger {
	topology: Arc<PowerTopology>,
	rows: Vec<RwLock<EntityRow>>,
	tolerance_ms: u64,
}

#[derive(Debug)]
struct EntityRow {
	// Start of the uptime bound; boot when unset
	origin_ms: Option<u64>,
	states: Vec<StateResidency>,
}

impl ResidencyLedger {
	/// Creates a zeroed row for every entity of `topology`
	///
	/// `tolerance_ms` is the slack allowed on the residency ≤ uptime bound.
	pub fn new(topology: Arc<PowerTopology>, tolerance_ms: u64) -> Self {
		let rows = topology
			.entities()
			.iter()
			.map(|entity| {
				let states = entity
					.states
					.iter()
					.map(|state| StateResidency {
						state: state.id,
						total_time_ms: 0,
						total_entries: 0,
						last_update_ms: 0,
					})
					.collect();
				RwLock::new(EntityRow {
					origin_ms: None,
					states,
				})
			})
			.collect();

		Self {
			topology,
			rows,
			tolerance_ms,
		}
	}

	/// Measures the uptime bound of the entity at `entity` from `timestamp_ms`
	///
	/// Only the first call per entity has an effect; without one the bound
	/// counts from boot.
	pub fn mark_origin(&self, entity: usize, timestamp_ms: u64) {
		if let Some(row) = self.rows.get(entity) {
			row.write().origin_ms.get_or_insert(timestamp_ms);
		}
	}

	/// Adds time and entries to one state
	pub fn record_residency_delta(
		&self,
		entity: EntityId,
		state: StateId,
		duration_ms: u64,
		entries: u64,
		timestamp_ms: u64,
	) -> Result<Option<InvariantViolation>, QueryError> {
		let entity_position = self
			.topology
			.entity_position(entity)
			.ok_or(QueryError::UnknownEntity(entity))?;
		let state_position = self
			.topology
			.state_position(entity_position, state)
			.ok_or(QueryError::UnknownState { entity, state })?;

		let delta = ResidencyDelta {
			state: state_position,
			duration_ms,
			entries,
		};
		Ok(self.record_entity_deltas(entity_position, &[delta], timestamp_ms).pop())
	}

	/// Applies every delta for one entity inside a single critical section
	///
	/// Durations are clamped so the entity's summed residency stays within
	/// the uptime elapsed since its origin (see [`mark_origin`](Self::mark_origin))
	/// plus the sampling tolerance; each clamp is returned.
	/// Entry counts are always applied.
	pub fn record_entity_deltas(
		&self,
		entity: usize,
		deltas: &[ResidencyDelta],
		timestamp_ms: u64,
	) -> Vec<InvariantViolation> {
		let mut violations = Vec::new();
		let Some(row) = self.rows.get(entity) else {
			return violations;
		};
		let entity_id = self.topology.entities()[entity].id;
		let mut row = row.write();
		let uptime_ms = timestamp_ms.saturating_sub(row.origin_ms.unwrap_or(0));
		let bound = uptime_ms.saturating_add(self.tolerance_ms);
		let states = &mut row.states;
		let mut headroom = bound.saturating_sub(states.iter().map(|state| state.total_time_ms).sum());

		for delta in deltas {
			let Some(state) = states.get_mut(delta.state) else {
				continue;
			};

			let applied = delta.duration_ms.min(headroom);
			headroom -= applied;
			if applied < delta.duration_ms {
				violations.push(InvariantViolation {
					entity: entity_id,
					state: state.state,
					requested_ms: delta.duration_ms,
					applied_ms: applied,
					uptime_ms,
				});
			}

			state.total_time_ms += applied;
			state.total_entries = state.total_entries.saturating_add(delta.entries);
			state.last_update_ms = state.last_update_ms.max(timestamp_ms);
		}
		drop(row);

		for violation in &violations {
			warn!(
				entity = %violation.entity,
				state = %violation.state,
				requested_ms = violation.requested_ms,
				applied_ms = violation.applied_ms,
				uptime_ms = violation.uptime_ms,
				"residency delta exceeds uptime bound, clamped"
			);
		}
		violations
	}

	/// Snapshot of the requested entities, or of all entities when `ids` is empty
	pub fn query(&self, ids: &[EntityId]) -> Vec<Result<EntityResidency, QueryError>> {
		if ids.is_empty() {
			return (0..self.rows.len()).map(|position| Ok(self.read_row(position))).collect();
		}

		ids.iter()
			.map(|&id| {
				self.topology
					.entity_position(id)
					.map(|position| self.read_row(position))
					.ok_or(QueryError::UnknownEntity(id))
			})
			.collect()
	}

	fn read_row(&self, position: usize) -> EntityResidency {
		EntityResidency {
			entity: self.topology.entities()[position].id,
			states: self.rows[position].read().states.clone(),
		}
	}
}
