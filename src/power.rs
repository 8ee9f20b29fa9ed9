use serde::Serialize;

use crate::energy::ChannelEnergy;
use crate::residency::EntityResidency;
use crate::snapshot::SnapshotServer;
use crate::topology::{ChannelId, EntityId, StateId};
use crate::util::{average_power_uw, uw_to_watts};

/// Meter and residency readings taken at one point in time
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerSnapshot {
	pub channels: Vec<ChannelEnergy>,
	pub residency: Vec<EntityResidency>,
	pub stale: bool,
}

impl LedgerSnapshot {
	/// Reads every known channel and entity
	pub fn capture(server: &SnapshotServer) -> Self {
		let meters = server.read_energy_meters(&[]);
		let residency = server.state_residency(&[]);
		Self {
			channels: meters.successes().copied().collect(),
			residency: residency.successes().cloned().collect(),
			stale: meters.health.stale || residency.health.stale,
		}
	}
}

/// Average power of one meter channel over an interval
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelPower {
	pub channel: ChannelId,
	pub watts: f64,
}

/// Fraction of an interval one entity spent in one state
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StateShare {
	pub entity: EntityId,
	pub state: StateId,
	pub share: f64,
	pub entries: u64,
}

/// Contains average power and residency derived from two ledger snapshots
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PowerReading {
	/// Channels whose epoch changed in between are left out
	pub channels: Vec<ChannelPower>,
	pub residency: Vec<StateShare>,
	/// Whether the later snapshot was taken while sampling was failing
	pub stale: bool,
}

impl PowerReading {
	/// Average power and residency share over the span between two snapshots
	pub fn between(before: &LedgerSnapshot, after: &LedgerSnapshot) -> Self {
		let channels = after
			.channels
			.iter()
			.filter_map(|end| {
				let start = before.channels.iter().find(|start| start.channel == end.channel)?;
				if start.entry.epoch != end.entry.epoch {
					return None;
				}
				let interval_ms = end.entry.timestamp_ms.checked_sub(start.entry.timestamp_ms)?;
				let power_uw = average_power_uw(start.entry.energy_uj, end.entry.energy_uj, interval_ms)?;
				Some(ChannelPower {
					channel: end.channel,
					watts: uw_to_watts(power_uw),
				})
			})
			.collect();

		let mut residency = Vec::new();
		for end in &after.residency {
			let Some(start) = before.residency.iter().find(|start| start.entity == end.entity) else {
				continue;
			};
			for state_end in &end.states {
				let Some(state_start) = start.states.iter().find(|state| state.state == state_end.state) else {
					continue;
				};
				let interval_ms = state_end.last_update_ms.saturating_sub(state_start.last_update_ms);
				if interval_ms == 0 {
					continue;
				}
				let spent_ms = state_end.total_time_ms.saturating_sub(state_start.total_time_ms);
				residency.push(StateShare {
					entity: end.entity,
					state: state_end.state,
					share: (spent_ms as f64 / interval_ms as f64).min(1.0),
					entries: state_end.total_entries.saturating_sub(state_start.total_entries),
				});
			}
		}

		Self {
			channels,
			residency,
			stale: after.stale,
		}
	}

	pub fn total_watts(&self) -> f64 {
		self.channels.iter().map(|channel| channel.watts).sum()
	}
}
