pub mod clock;
pub mod msr;

use crate::constants::POWER_SCALE;

/// Average power in microwatts between two cumulative energy readings
///
/// # Arguments
///
/// * `energy_start_uj` - Earlier cumulative energy in microjoules
/// * `energy_end_uj` - Later cumulative energy in microjoules
/// * `interval_ms` - Time between the readings in milliseconds
///
/// # Returns
///
/// Power in microwatts, or `None` for an empty interval or a decreasing reading
pub const fn average_power_uw(energy_start_uj: u64, energy_end_uj: u64, interval_ms: u64) -> Option<u64> {
	if interval_ms == 0 || energy_end_uj < energy_start_uj {
		return None;
	}

	// µJ/ms = mW, scale up to µW
	Some((energy_end_uj - energy_start_uj).saturating_mul(1000) / interval_ms)
}

/// Converts microwatts to watts for display
pub fn uw_to_watts(power_uw: u64) -> f64 {
	power_uw as f64 / POWER_SCALE as f64
}
