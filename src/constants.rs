// AMD RAPL MSR addresses
pub const AMD_ENERGY_UNIT_MSR: u32 = 0xC001_0299;
pub const AMD_ENERGY_CORE_MSR: u32 = 0xC001_029A;
pub const AMD_ENERGY_PKG_MSR: u32 = 0xC001_029B;

// Intel RAPL MSR addresses
pub const INTEL_POWER_UNIT_MSR: u32 = 0x606;
pub const INTEL_PKG_ENERGY_MSR: u32 = 0x611;

// RAPL energy status counters are 32 bits wide
pub const RAPL_COUNTER_WIDTH_BITS: u32 = 32;

// Linux cpuidle sysfs root and counter width
pub const CPU_SYSFS_ROOT: &str = "/sys/devices/system/cpu";
pub const CPUIDLE_COUNTER_WIDTH_BITS: u32 = 64;

// Engine defaults
pub const DEFAULT_RESET_THRESHOLD: f64 = 0.05;
pub const DEFAULT_SAMPLING_TOLERANCE_MS: u64 = 100;
pub const DEFAULT_SAMPLING_INTERVAL_MS: u64 = 100;
pub const DEFAULT_EVENT_LOG_CAPACITY: usize = 64;

// Display settings
pub const DISPLAY_UPDATE_INTERVAL_MS: u64 = 1000;
pub const POWER_SCALE: u64 = 1_000_000;
