//! Core data types shared across the controller

use serde::{Deserialize, Serialize};

use crate::constants::{fan, process};

/// Process state machine states.
///
/// The numeric discriminants are part of the `/status` wire contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ProcessState {
    Idle = 0,
    RunningAuto = 1,
    RunningManual = 2,
    PauseDoor = 3,
    PauseSensor = 4,
    PauseOverheat = 5,
    PauseUser = 6,
    PauseHeaterFault = 7,
    ErrorProfile = 8,
    /// Transient state between Pause* and Running* while heaters re-stage
    SoftResume = 9,
}

impl ProcessState {
    pub fn is_running(self) -> bool {
        matches!(self, ProcessState::RunningAuto | ProcessState::RunningManual)
    }

    pub fn is_paused(self) -> bool {
        matches!(
            self,
            ProcessState::PauseDoor
                | ProcessState::PauseSensor
                | ProcessState::PauseOverheat
                | ProcessState::PauseUser
                | ProcessState::PauseHeaterFault
        )
    }

    /// True whenever every output must be held off
    pub fn outputs_forbidden(self) -> bool {
        self.is_paused() || matches!(self, ProcessState::Idle | ProcessState::ErrorProfile)
    }

    pub fn name(self) -> &'static str {
        match self {
            ProcessState::Idle => "Idle",
            ProcessState::RunningAuto => "RunningAuto",
            ProcessState::RunningManual => "RunningManual",
            ProcessState::PauseDoor => "PauseDoor",
            ProcessState::PauseSensor => "PauseSensor",
            ProcessState::PauseOverheat => "PauseOverheat",
            ProcessState::PauseUser => "PauseUser",
            ProcessState::PauseHeaterFault => "PauseHeaterFault",
            ProcessState::ErrorProfile => "ErrorProfile",
            ProcessState::SoftResume => "SoftResume",
        }
    }
}

/// Which running mode a SoftResume returns to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    Auto,
    Manual,
}

impl RunMode {
    pub fn name(self) -> &'static str {
        match self {
            RunMode::Auto => "Auto",
            RunMode::Manual => "Manual",
        }
    }
}

/// Fan drive policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FanMode {
    Off = 0,
    On = 1,
    Cyclic = 2,
}

impl FanMode {
    pub fn from_u8(v: u8) -> FanMode {
        match v {
            1 => FanMode::On,
            2 => FanMode::Cyclic,
            _ => FanMode::Off,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FanMode::Off => "Off",
            FanMode::On => "On",
            FanMode::Cyclic => "Cyclic",
        }
    }
}

/// One stage of a curing profile.
///
/// Immutable after load; replaced wholesale when another profile is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    /// Chamber setpoint (°C), clamped to [20, 120]
    pub t_set: f64,
    /// Meat-probe exit target (°C), clamped to [0, 100]
    pub t_meat_target: f64,
    /// Minimum duration (stored as minutes in the wire format)
    pub min_time_ms: u64,
    /// Number of heaters eligible (1-3)
    pub power_mode: u8,
    /// Smoke-fan PWM duty byte
    pub smoke_pwm: u8,
    pub fan_mode: FanMode,
    pub fan_on_ms: u64,
    pub fan_off_ms: u64,
    /// When set, the step also waits for `t_meat >= t_meat_target`
    pub use_meat_temp: bool,
}

impl Default for Step {
    fn default() -> Self {
        Step {
            name: String::new(),
            t_set: process::MANUAL_DEFAULT_TSET,
            t_meat_target: 0.0,
            min_time_ms: 0,
            power_mode: process::MANUAL_DEFAULT_POWER,
            smoke_pwm: 0,
            fan_mode: FanMode::Off,
            fan_on_ms: fan::DEFAULT_ON_MS,
            fan_off_ms: fan::DEFAULT_OFF_MS,
            use_meat_temp: false,
        }
    }
}

/// Heater soft-enable staging, guarded by the heater mutex
#[derive(Debug, Clone, Copy, Default)]
pub struct HeaterEnable {
    pub h1: bool,
    pub h2: bool,
    pub h3: bool,
    /// Stage reference timestamps (ms since boot)
    pub t1: u64,
    pub t2: u64,
    pub t3: u64,
}

impl HeaterEnable {
    /// Restart staging from `now_ms`; every heater becomes ineligible
    pub fn reset(&mut self, now_ms: u64) {
        self.h1 = false;
        self.h2 = false;
        self.h3 = false;
        self.t1 = now_ms;
        self.t2 = now_ms;
        self.t3 = now_ms;
    }
}

/// Last-good cache slot for one sensor
#[derive(Debug, Clone, Copy)]
pub struct CachedReading {
    pub value: f64,
    pub timestamp_ms: u64,
    pub valid: bool,
    pub attempts: u32,
}

impl Default for CachedReading {
    fn default() -> Self {
        CachedReading {
            value: 25.0,
            timestamp_ms: 0,
            valid: false,
            attempts: 0,
        }
    }
}

/// Aggregate run statistics, updated by the control task
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ProcessStats {
    pub total_runtime_ms: u64,
    pub active_heating_ms: u64,
    pub step_changes: u32,
    pub pause_count: u32,
    /// EMA average chamber temperature over the run
    pub avg_temp: f64,
    pub last_update_ms: u64,
    /// Planned duration of the whole profile
    pub total_planned_sec: u64,
    pub remaining_sec: u64,
}

/// Process-wide mutable record, guarded by the state mutex.
///
/// Multi-field reads must copy what they need into locals under one
/// critical section; there is no coherence guarantee across separate
/// lock/unlock pairs.
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub current_state: ProcessState,
    pub last_run_mode: RunMode,

    pub t_chamber: f64,
    pub t_chamber1: f64,
    pub t_chamber2: f64,
    pub t_meat: f64,
    pub t_set: f64,

    pub power_mode: u8,
    pub manual_smoke_pwm: u8,
    pub fan_mode: FanMode,
    /// Operator-configured cyclic times
    pub fan_on_time_ms: u64,
    pub fan_off_time_ms: u64,
    /// Trend-adjusted cyclic times actually driving the fan
    pub fan_on_effective_ms: u64,
    pub fan_off_effective_ms: u64,

    pub door_open: bool,
    pub error_sensor: bool,
    pub error_overheat: bool,
    pub error_profile: bool,

    pub profile: Vec<Step>,
    pub active_profile: String,
    pub current_step: usize,

    pub process_start_ms: u64,
    pub step_start_ms: u64,

    pub stats: ProcessStats,
}

impl Default for ControllerState {
    fn default() -> Self {
        ControllerState {
            current_state: ProcessState::Idle,
            last_run_mode: RunMode::Manual,
            t_chamber: 25.0,
            t_chamber1: 25.0,
            t_chamber2: 25.0,
            t_meat: 25.0,
            t_set: process::MANUAL_DEFAULT_TSET,
            power_mode: process::MANUAL_DEFAULT_POWER,
            manual_smoke_pwm: process::MANUAL_DEFAULT_SMOKE,
            fan_mode: FanMode::Off,
            fan_on_time_ms: fan::DEFAULT_ON_MS,
            fan_off_time_ms: fan::DEFAULT_OFF_MS,
            fan_on_effective_ms: fan::DEFAULT_ON_MS,
            fan_off_effective_ms: fan::DEFAULT_OFF_MS,
            door_open: false,
            error_sensor: false,
            error_overheat: false,
            error_profile: false,
            profile: Vec::new(),
            active_profile: String::new(),
            current_step: 0,
            process_start_ms: 0,
            step_start_ms: 0,
            stats: ProcessStats::default(),
        }
    }
}

impl ControllerState {
    pub fn step_count(&self) -> usize {
        self.profile.len()
    }

    /// The step currently driving the sequencer, if any
    pub fn current_step_ref(&self) -> Option<&Step> {
        self.profile.get(self.current_step)
    }

    pub fn power_mode_text(&self) -> String {
        match self.power_mode {
            1 => "1 heater".to_string(),
            n => format!("{n} heaters"),
        }
    }

    /// Build the `/status` snapshot from a single coherent read
    pub fn snapshot(&self, now_ms: u64) -> sk_protocol::StatusSnapshot {
        let elapsed_ms = if self.current_state == ProcessState::Idle {
            0
        } else {
            now_ms.saturating_sub(self.process_start_ms)
        };
        let step = self.current_step_ref();
        sk_protocol::StatusSnapshot {
            t_chamber: self.t_chamber,
            t_chamber1: self.t_chamber1,
            t_chamber2: self.t_chamber2,
            t_meat: self.t_meat,
            t_set: self.t_set,
            power_mode: self.power_mode,
            fan_mode: self.fan_mode as u8,
            smoke_pwm: self.manual_smoke_pwm,
            mode: self.last_run_mode.name().to_string(),
            state: self.current_state as u8,
            power_mode_text: self.power_mode_text(),
            fan_mode_text: self.fan_mode.name().to_string(),
            elapsed_time_sec: elapsed_ms / 1000,
            step_name: step.map(|s| s.name.clone()).unwrap_or_default(),
            step_total_time_sec: step.map(|s| s.min_time_ms / 1000).unwrap_or(0),
            active_profile: self.active_profile.clone(),
            remaining_process_time_sec: self.stats.remaining_sec,
            current_step: self.current_step,
            step_count: self.step_count(),
            door_open: self.door_open,
            error_sensor: self.error_sensor,
            error_overheat: self.error_overheat,
            error_profile: self.error_profile,
            fan_on_time_ms: self.fan_on_effective_ms,
            fan_off_time_ms: self.fan_off_effective_ms,
        }
    }
}
