use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants::{
	DEFAULT_EVENT_LOG_CAPACITY, DEFAULT_RESET_THRESHOLD, DEFAULT_SAMPLING_INTERVAL_MS, DEFAULT_SAMPLING_TOLERANCE_MS,
};
use crate::error::ConfigError;

/// How the first sample of a counter is accounted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselinePolicy {
	/// The first raw value counts as accrued since boot
	#[default]
	SinceBoot,
	/// The first raw value only establishes a baseline
	SinceStart,
}

/// How channel energy deltas combine into a consumer delta
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsumerAggregation {
	/// Plain sum of every mapped channel, weights ignored
	#[default]
	Sum,
	/// Sum of weight × channel delta
	Weighted,
}

/// Tunable engine policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
	/// Largest fraction of a counter's range that one sampling interval may
	/// advance across a wrap; a larger apparent advance is a hardware reset.
	pub reset_threshold: f64,
	/// Slack allowed on the "residency never exceeds uptime" bound
	pub sampling_tolerance_ms: u64,
	pub sampling_interval_ms: u64,
	pub baseline: BaselinePolicy,
	pub consumer_aggregation: ConsumerAggregation,
	/// Number of recent resets, anomalies and violations kept for inspection
	pub event_log_capacity: usize,
}

impl Default for EngineConfig {
	fn default() -> Self {
		Self {
			reset_threshold: DEFAULT_RESET_THRESHOLD,
			sampling_tolerance_ms: DEFAULT_SAMPLING_TOLERANCE_MS,
			sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL_MS,
			baseline: BaselinePolicy::default(),
			consumer_aggregation: ConsumerAggregation::default(),
			event_log_capacity: DEFAULT_EVENT_LOG_CAPACITY,
		}
	}
}

impl EngineConfig {
	pub fn sampling_interval(&self) -> Duration {
		Duration::from_millis(self.sampling_interval_ms)
	}

	/// Rejects thresholds outside (0, 1] and a zero sampling interval
	pub fn validate(&self) -> Result<(), ConfigError> {
		if !(self.reset_threshold > 0.0 && self.reset_threshold <= 1.0) {
			return Err(ConfigError::Invalid(format!(
				"reset_threshold must be within (0, 1], got {}",
				self.reset_threshold
			)));
		}
		if self.sampling_interval_ms == 0 {
			return Err(ConfigError::Invalid("sampling_interval_ms must be positive".into()));
		}
		Ok(())
	}

	/// Parses and validates a JSON config; missing fields take their defaults
	pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
		let config: Self = serde_json::from_str(json)?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let path = path.as_ref();
		let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
			path: path.to_path_buf(),
			source,
		})?;
		Self::from_json_str(&contents)
	}
}
