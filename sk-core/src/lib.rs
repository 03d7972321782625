//! Smokehouse Controller Core Library
//!
//! Process control, sensing and storage for a smokehouse/curing-chamber
//! controller.
//!
//! # Features
//!
//! - **Process control**: PID with adaptive gains, three-heater power
//!   mapping with soft-enable, a multi-step recipe sequencer and a
//!   heater-efficiency supervisor
//! - **Sensing**: paced one-wire chamber probes with validity filtering
//!   and an oversampled, EMA-filtered NTC meat probe
//! - **Flash filesystem**: sector-allocated files with a shadow FAT for
//!   atomic replace on the raw NOR chip
//! - **Storage**: profile parsing, NVS-style configuration, backups
//!
//! # Module Structure
//!
//! - `hw/` - board abstraction (mock and simulated implementations)
//! - `data/` - data types and the profile wire format
//! - `engine/` - PID, fan trend and heater-fault engines
//! - `flash/` - SPI bus arbitration, chip trait, filesystem

// Grouped modules
pub mod data;
pub mod engine;
pub mod flash;
pub mod hw;

// Standalone modules
pub mod constants;
pub mod controller;
pub mod outputs;
pub mod process;
pub mod sensors;
pub mod storage;

// Re-export primary types from data/
pub use data::{
    CachedReading, ControllerState, FanMode, HeaterEnable, ProcessState, ProcessStats, RunMode,
    Step,
};

// Re-export profile wire-format functions
pub use data::{format_step, parse_profile, parse_step_line};

// Re-export engine types
pub use engine::{AdaptivePid, FanTrend, FaultVerdict, HeaterFaultMonitor, Pid};

// Re-export hardware abstraction
pub use hw::{Board, Button, MockBoard, SimBoard, HEATER_CHANNELS};

// Re-export flash types
pub use flash::{FileFlash, FlashFs, MemFlash, SpiBus, SpiFlash};

// Re-export the controller record and outputs
pub use controller::{Controller, Uptime};
pub use outputs::{map_power_to_heaters, Outputs};

// Re-export process entry points
pub use process::{control_tick, start_auto, start_manual, stop, ControlRuntime};

// Re-export sensing
pub use sensors::SensorEngine;

// Re-export storage
pub use storage::{
    apply_manual_settings, backup_config, default_flash_image_path, default_nvs_path,
    list_backups, load_boot_profile, load_profile, profile_as_json, restore_backup,
    save_manual_settings, NoRemote, Nvs, NvsData, RemoteProfiles,
};

// Re-export error types
pub use sk_error::{Result, SmokehouseError};
