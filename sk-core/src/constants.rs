//! Constants and configuration values for the smokehouse controller
//!
//! Centralizes all magic numbers, limits, and configuration defaults.
//! This is the SINGLE SOURCE OF TRUTH for all configuration values.
//! Never use magic numbers in other files - add them here first.

/// Process-wide limits and timing
pub mod process {
    /// Control task tick period
    pub const CONTROL_TICK_MS: u64 = 100;

    /// Hard cap on a single run; exceeding it pauses the process
    pub const MAX_PROCESS_TIME_MS: u64 = 24 * 60 * 60 * 1000;

    /// Maximum steps in a profile
    pub const MAX_STEPS: usize = 10;

    /// Soft overheat cap for the chamber (°C)
    pub const T_MAX_SOFT: f64 = 130.0;

    /// Chamber setpoint bounds (°C)
    pub const T_SET_MIN: f64 = 20.0;
    pub const T_SET_MAX: f64 = 120.0;

    /// Meat target bounds (°C)
    pub const T_MEAT_MIN: f64 = 0.0;
    pub const T_MEAT_MAX: f64 = 100.0;

    /// Manual-mode startup defaults
    pub const MANUAL_DEFAULT_TSET: f64 = 70.0;
    pub const MANUAL_DEFAULT_POWER: u8 = 2;
    pub const MANUAL_DEFAULT_SMOKE: u8 = 0;
}

/// PID controller parameters
pub mod pid {
    /// Base proportional gain
    pub const KP: f64 = 5.0;
    /// Base integral gain
    pub const KI: f64 = 0.3;
    /// Base derivative gain
    pub const KD: f64 = 20.0;

    /// Output clamp range (percent of full heating power)
    pub const OUT_MIN: f64 = 0.0;
    pub const OUT_MAX: f64 = 100.0;

    /// Adaptation cadence
    pub const ADAPT_INTERVAL_MS: u64 = 60_000;

    /// Error-history ring size for gain adaptation
    pub const ERROR_HISTORY: usize = 10;

    /// Samples with |error| above this are excluded from the variance window
    pub const ERROR_OUTLIER: f64 = 50.0;

    /// Variance above this dampens the gains
    pub const VARIANCE_HIGH: f64 = 5.0;
    /// Variance below this (near setpoint) tightens the gains
    pub const VARIANCE_LOW: f64 = 0.5;
    /// |error| gate for the tighten branch
    pub const ERROR_NEAR: f64 = 2.0;

    /// Gain multipliers: oscillation damping
    pub const DAMPEN: (f64, f64, f64) = (0.8, 0.5, 1.2);
    /// Gain multipliers: tighten around setpoint
    pub const TIGHTEN: (f64, f64, f64) = (1.2, 0.8, 0.8);
}

/// Heater staging and fault supervision
pub mod heater {
    /// Soft-enable delays after start/resume, per heater
    pub const SOFT_ENABLE_MS: [u64; 3] = [1000, 2000, 3000];

    /// Scale from percent duty to the 8-bit PWM register
    pub const DUTY_SCALE: f64 = 2.55;

    /// Supervisor activation: setpoint must exceed chamber by this much
    pub const FAULT_DELTA_T: f64 = 10.0;
    /// Supervisor activation: PID output must exceed this
    pub const FAULT_MIN_PID: f64 = 50.0;
    /// Supervision window length
    pub const FAULT_WINDOW_MS: u64 = 20 * 60 * 1000;
    /// Minimum chamber rise expected within the window (°C)
    pub const FAULT_MIN_RISE: f64 = 2.0;
}

/// Fan policy
pub mod fan {
    /// Cyclic defaults
    pub const DEFAULT_ON_MS: u64 = 10_000;
    pub const DEFAULT_OFF_MS: u64 = 60_000;

    /// Lower bound for either cyclic phase
    pub const MIN_PHASE_MS: u64 = 1000;

    /// Trend window (samples at the sampling cadence)
    pub const TREND_SAMPLES: usize = 5;
    /// Trend sampling cadence
    pub const TREND_SAMPLE_MS: u64 = 10_000;

    /// Rising trend threshold (°C per sample)
    pub const TREND_RISING: f64 = 0.5;
    /// Falling trend threshold (°C per sample)
    pub const TREND_FALLING: f64 = -0.2;
    /// Stable-band trend threshold
    pub const TREND_STABLE: f64 = 0.1;
    /// Stable-band setpoint distance (°C)
    pub const STABLE_DELTA_T: f64 = 3.0;

    /// Adjustment factors and rails for the cyclic times
    pub const ON_LENGTHEN: f64 = 1.5;
    pub const OFF_SHORTEN: f64 = 0.7;
    pub const ON_CAP_MS: u64 = 30_000;
    pub const OFF_FLOOR_MS: u64 = 10_000;
}

/// Sensor acquisition parameters
pub mod sensors {
    /// Minimum interval between one-wire conversion requests
    pub const REQUEST_INTERVAL_MS: u64 = 1200;
    /// Conversion time before a result may be read
    pub const CONVERSION_MS: u64 = 850;
    /// Retry delay for the 85.0 °C re-read artifact
    pub const RETRY_85_MS: u64 = 10;

    /// Plausible chamber reading range (°C)
    pub const VALID_MIN: f64 = -20.0;
    pub const VALID_MAX: f64 = 200.0;

    /// Known bogus readings from the digital probes
    pub const POWER_ON_RESET_C: f64 = 85.0;
    pub const BUS_ERROR_C: f64 = 127.0;

    /// Consecutive all-invalid cycles before the sensor error latches
    pub const MAX_MISSES: u32 = 3;

    /// Door debounce window
    pub const DOOR_DEBOUNCE_MS: u64 = 250;
}

/// NTC meat-probe parameters
pub mod ntc {
    /// ADC oversampling bounds
    pub const OVERSAMPLE_MIN: usize = 64;
    pub const OVERSAMPLE_MAX: usize = 256;
    /// Default oversample count
    pub const OVERSAMPLE: usize = 64;
    /// Pacing between ADC samples (µs)
    pub const SAMPLE_GAP_US: u64 = 140;

    /// 12-bit ADC full scale
    pub const ADC_MAX: f64 = 4095.0;

    /// Series resistor (Ω)
    pub const R_SERIES: f64 = 100_000.0;
    /// Thermistor nominal resistance at T0 (Ω)
    pub const R_NOMINAL: f64 = 100_000.0;
    /// Nominal temperature for R_NOMINAL (°C)
    pub const T_NOMINAL: f64 = 25.0;
    /// Beta coefficient
    pub const BETA: f64 = 4350.0;

    /// EMA filter coefficient (weight of the previous filtered value)
    pub const EMA_ALPHA: f64 = 0.91;

    /// Accepted filtered range (°C); outside it the cache wins
    pub const T_MIN: f64 = -10.0;
    pub const T_MAX: f64 = 150.0;

    /// Division-by-zero guard in the resistance computation
    pub const EPSILON: f64 = 0.5;
}

/// Flash chip geometry and filesystem layout
pub mod flash {
    /// Total chip size (16 MB SPI NOR)
    pub const CHIP_SIZE: u32 = 16 * 1024 * 1024;
    /// Erase sector size
    pub const SECTOR_SIZE: u32 = 4096;
    /// Program page size
    pub const PAGE_SIZE: u32 = 256;
    /// Sector count
    pub const SECTOR_COUNT: u16 = (CHIP_SIZE / SECTOR_SIZE) as u16;

    /// FAT header magic, "FAT2" little-endian
    pub const FAT_MAGIC: u32 = 0x4641_5432;
    /// FAT lives in sector 0, its shadow in sector 1
    pub const FAT_SECTOR: u16 = 0;
    pub const FAT_SHADOW_SECTOR: u16 = 1;

    /// Fixed descriptor size and the entry cap one sector allows
    pub const ENTRY_SIZE: usize = 60;
    pub const MAX_ENTRIES: usize = 64;
    /// Filename field width inside an entry
    pub const NAME_LEN: usize = 48;

    /// Entry validity markers
    pub const ENTRY_FREE: u8 = 0xFF;
    pub const ENTRY_ACTIVE: u8 = 0x01;
    pub const ENTRY_TOMBSTONE: u8 = 0x00;
    pub const ENTRY_HIDDEN: u8 = 0xFE;

    /// Static partitions (inclusive sector ranges)
    pub const PROFILE_FIRST: u16 = 2;
    pub const PROFILE_LAST: u16 = 101;
    pub const BACKUP_FIRST: u16 = 102;
    pub const BACKUP_LAST: u16 = 121;
    pub const LOG_FIRST: u16 = 122;
    pub const LOG_LAST: u16 = 201;

    /// Per-file sector cap enforced by the write path
    pub const MAX_FILE_SECTORS: usize = 10;

    /// Append files are trimmed to half once they exceed this
    pub const APPEND_LIMIT: usize = 8 * 1024;

    /// Erase status is polled at this cadence, releasing the bus in between
    pub const ERASE_POLL_MS: u64 = 500;
}

/// Concurrency parameters
pub mod locks {
    use std::time::Duration;

    /// Bounded wait for the state/output/heater mutexes
    pub const TIMEOUT: Duration = Duration::from_secs(1);
}

/// Task scheduling and watchdog parameters
pub mod tasks {
    /// Loop quantum per task (ms)
    pub const CONTROL_PERIOD_MS: u64 = 100;
    pub const SENSORS_PERIOD_MS: u64 = 100;
    pub const UI_PERIOD_MS: u64 = 50;
    pub const WEB_PERIOD_MS: u64 = 20;
    pub const WIFI_PERIOD_MS: u64 = 5000;
    pub const MONITOR_PERIOD_MS: u64 = 5000;

    /// Software task-watchdog staleness threshold
    pub const TASK_WDT_TIMEOUT_MS: u64 = 15_000;

    /// Hardware watchdog timeout, and the widened value used during
    /// firmware upload
    pub const HW_WDT_TIMEOUT_MS: u64 = 10_000;
    pub const HW_WDT_UPLOAD_TIMEOUT_MS: u64 = 60_000;
}

/// Local UI parameters
pub mod ui {
    /// Button debounce window
    pub const DEBOUNCE_MS: u64 = 200;
    /// Enter hold on the idle screen that wipes web credentials
    pub const AUTH_RESET_HOLD_MS: u64 = 5000;
}

/// Web interface parameters
pub mod web {
    /// HTTP Basic auth realm
    pub const AUTH_REALM: &str = "Wedzarnia";
    /// Compiled-in credential defaults (used after an auth reset)
    pub const DEFAULT_USER: &str = "admin";
    pub const DEFAULT_PASS: &str = "wedzarnia";
}

/// Profile text format limits
pub mod profile {
    /// Fields per record line
    pub const FIELD_COUNT: usize = 10;
    /// Maximum step-name length kept from the wire format
    pub const NAME_MAX: usize = 32;
}

/// Process statistics
pub mod stats {
    /// EMA coefficient for the running average temperature
    pub const AVG_TEMP_ALPHA: f64 = 0.98;
}
