//! Shared types crossing the boundary between the control core and the
//! boundary tasks (web server, local UI).
//!
//! The boundary tasks never mutate controller state directly: they enqueue
//! [`Command`]s that the control task consumes, and they read back a
//! [`StatusSnapshot`] serialized for the `/status` endpoint.

use serde::{Deserialize, Serialize};

/// Maximum HTTP request body size accepted by the web task (8 KB),
/// firmware upload excepted.
pub const MAX_BODY_SIZE: usize = 8 * 1024;

/// Maximum flash path length accepted from the boundary
const MAX_PATH_LENGTH: usize = 48;

const ALLOWED_PATH_PREFIXES: &[&str] = &["/profiles/", "/backup/", "/logs/"];

const FORBIDDEN_PATH_COMPONENTS: &[&str] = &[
    "..",   // Path traversal
    "//",   // Double slash (path normalization bypass)
    "\0",   // Null byte injection
    "\n",   // Newline injection
    "\r",   // Carriage return injection
];

/// Commands enqueued by boundary tasks (web, local UI) for the control task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "cmd", content = "data")]
pub enum Command {
    StartAuto,
    StartManual,
    Stop,
    /// Force-advance the step sequencer
    NextStep,
    /// Resume from a user-clearable pause (overheat, heater fault, user pause)
    Resume,
    /// Restart the step timer of the current step
    ResetTimer,
    SetManualSetpoint { celsius: f64 },
    SetManualPower { mode: u8 },
    SetManualSmoke { pwm: u8 },
    SetManualFan { mode: u8, on_ms: u64, off_ms: u64 },
    /// Load a profile by path; `github:`-prefixed paths go to the remote source
    SelectProfile { path: String },
}

impl Command {
    /// Validate command parameters before enqueueing
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Command::StartAuto
            | Command::StartManual
            | Command::Stop
            | Command::NextStep
            | Command::Resume
            | Command::ResetTimer => Ok(()),

            Command::SetManualSetpoint { celsius } => {
                if !celsius.is_finite() || !(20.0..=120.0).contains(celsius) {
                    return Err(format!("Setpoint out of range: {celsius}"));
                }
                Ok(())
            }
            Command::SetManualPower { mode } => {
                if !(1..=3).contains(mode) {
                    return Err(format!("Power mode out of range: {mode}"));
                }
                Ok(())
            }
            Command::SetManualSmoke { .. } => Ok(()),
            Command::SetManualFan { mode, on_ms, off_ms } => {
                if *mode > 2 {
                    return Err(format!("Fan mode out of range: {mode}"));
                }
                if *mode == 2 && (*on_ms < 1000 || *off_ms < 1000) {
                    return Err("Cyclic fan times must be >= 1000 ms".into());
                }
                Ok(())
            }
            Command::SelectProfile { path } => {
                if path.starts_with("github:") {
                    return Ok(());
                }
                validate_flash_path(path)
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Command::StartAuto => "StartAuto",
            Command::StartManual => "StartManual",
            Command::Stop => "Stop",
            Command::NextStep => "NextStep",
            Command::Resume => "Resume",
            Command::ResetTimer => "ResetTimer",
            Command::SetManualSetpoint { .. } => "SetManualSetpoint",
            Command::SetManualPower { .. } => "SetManualPower",
            Command::SetManualSmoke { .. } => "SetManualSmoke",
            Command::SetManualFan { .. } => "SetManualFan",
            Command::SelectProfile { .. } => "SelectProfile",
        }
    }
}

/// JSON snapshot served by `GET /status`.
///
/// Field names are part of the wire contract with the web pages; do not
/// rename without bumping them there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusSnapshot {
    #[serde(rename = "tChamber")]
    pub t_chamber: f64,
    #[serde(rename = "tChamber1")]
    pub t_chamber1: f64,
    #[serde(rename = "tChamber2")]
    pub t_chamber2: f64,
    #[serde(rename = "tMeat")]
    pub t_meat: f64,
    #[serde(rename = "tSet")]
    pub t_set: f64,
    #[serde(rename = "powerMode")]
    pub power_mode: u8,
    #[serde(rename = "fanMode")]
    pub fan_mode: u8,
    #[serde(rename = "smokePwm")]
    pub smoke_pwm: u8,
    /// Run mode name ("Auto" / "Manual")
    pub mode: String,
    /// Numeric process state discriminant
    pub state: u8,
    #[serde(rename = "powerModeText")]
    pub power_mode_text: String,
    #[serde(rename = "fanModeText")]
    pub fan_mode_text: String,
    #[serde(rename = "elapsedTimeSec")]
    pub elapsed_time_sec: u64,
    #[serde(rename = "stepName")]
    pub step_name: String,
    #[serde(rename = "stepTotalTimeSec")]
    pub step_total_time_sec: u64,
    #[serde(rename = "activeProfile")]
    pub active_profile: String,
    #[serde(rename = "remainingProcessTimeSec")]
    pub remaining_process_time_sec: u64,
    #[serde(rename = "currentStep")]
    pub current_step: usize,
    #[serde(rename = "stepCount")]
    pub step_count: usize,
    #[serde(rename = "doorOpen")]
    pub door_open: bool,
    #[serde(rename = "errorSensor")]
    pub error_sensor: bool,
    #[serde(rename = "errorOverheat")]
    pub error_overheat: bool,
    #[serde(rename = "errorProfile")]
    pub error_profile: bool,
    /// Effective cyclic fan times (the trend analyser may have adjusted
    /// these away from the configured values)
    #[serde(rename = "fanOnTimeMs")]
    pub fan_on_time_ms: u64,
    #[serde(rename = "fanOffTimeMs")]
    pub fan_off_time_ms: u64,
}

/// Report served by `GET /flash/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashInfo {
    #[serde(rename = "chipSizeBytes")]
    pub chip_size_bytes: u64,
    #[serde(rename = "sectorSize")]
    pub sector_size: u32,
    #[serde(rename = "liveEntries")]
    pub live_entries: usize,
    #[serde(rename = "profileSectorsFree")]
    pub profile_sectors_free: usize,
    #[serde(rename = "backupSectorsFree")]
    pub backup_sectors_free: usize,
    #[serde(rename = "logSectorsFree")]
    pub log_sectors_free: usize,
}

/// One entry of the `/files/list` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileEntryInfo {
    pub name: String,
    pub size: u32,
    pub sectors: u16,
}

/// Validate a flash filesystem path received over the boundary.
///
/// Paths must be absolute, short enough for a FAT slot, free of traversal
/// components, and rooted in one of the known partitions.
pub fn validate_flash_path(path: &str) -> Result<(), String> {
    if path.is_empty() {
        return Err("Path is empty".into());
    }
    if path.len() > MAX_PATH_LENGTH {
        return Err(format!(
            "Path too long: {} bytes (max {})",
            path.len(),
            MAX_PATH_LENGTH
        ));
    }
    if !path.starts_with('/') {
        return Err("Path must be absolute".into());
    }
    for forbidden in FORBIDDEN_PATH_COMPONENTS {
        if path.contains(forbidden) {
            return Err(format!("Path contains forbidden component {forbidden:?}"));
        }
    }
    if !path.is_ascii() {
        return Err("Path must be ASCII".into());
    }
    if !ALLOWED_PATH_PREFIXES.iter().any(|p| path.starts_with(p)) {
        return Err(format!("Path must be under one of {ALLOWED_PATH_PREFIXES:?}"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flash_path_accepts_partition_roots() {
        assert!(validate_flash_path("/profiles/kielbasa.txt").is_ok());
        assert!(validate_flash_path("/backup/config_1.bak").is_ok());
        assert!(validate_flash_path("/logs/run.log").is_ok());
    }

    #[test]
    fn test_flash_path_rejects_traversal_and_junk() {
        assert!(validate_flash_path("/profiles/../secret").is_err());
        assert!(validate_flash_path("profiles/x").is_err());
        assert!(validate_flash_path("/etc/passwd").is_err());
        assert!(validate_flash_path("").is_err());
        assert!(validate_flash_path("/profiles//x").is_err());
        let long = format!("/profiles/{}", "a".repeat(64));
        assert!(validate_flash_path(&long).is_err());
    }

    #[test]
    fn test_command_validation() {
        assert!(Command::StartAuto.validate().is_ok());
        assert!(Command::SetManualSetpoint { celsius: 70.0 }.validate().is_ok());
        assert!(Command::SetManualSetpoint { celsius: 300.0 }.validate().is_err());
        assert!(Command::SetManualPower { mode: 0 }.validate().is_err());
        assert!(Command::SetManualFan { mode: 2, on_ms: 500, off_ms: 5000 }
            .validate()
            .is_err());
        assert!(Command::SelectProfile { path: "github:boczek.txt".into() }
            .validate()
            .is_ok());
        assert!(Command::SelectProfile { path: "/profiles/boczek.txt".into() }
            .validate()
            .is_ok());
    }

    #[test]
    fn test_command_round_trip() {
        let cmd = Command::SetManualFan { mode: 2, on_ms: 10_000, off_ms: 60_000 };
        let json = serde_json::to_string(&cmd).unwrap();
        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cmd);
    }

    #[test]
    fn test_status_snapshot_field_names() {
        let snap = StatusSnapshot {
            t_chamber: 72.5,
            t_chamber1: 72.0,
            t_chamber2: 73.0,
            t_meat: 55.1,
            t_set: 80.0,
            power_mode: 2,
            fan_mode: 2,
            smoke_pwm: 128,
            mode: "Auto".into(),
            state: 1,
            power_mode_text: "2 heaters".into(),
            fan_mode_text: "Cyclic".into(),
            elapsed_time_sec: 600,
            step_name: "Drying".into(),
            step_total_time_sec: 3600,
            active_profile: "/profiles/kielbasa.txt".into(),
            remaining_process_time_sec: 7200,
            current_step: 0,
            step_count: 3,
            door_open: false,
            error_sensor: false,
            error_overheat: false,
            error_profile: false,
            fan_on_time_ms: 10_000,
            fan_off_time_ms: 60_000,
        };
        let json = serde_json::to_string(&snap).unwrap();
        for key in [
            "tChamber", "tChamber1", "tChamber2", "tMeat", "tSet", "powerMode",
            "fanMode", "smokePwm", "powerModeText", "fanModeText",
            "elapsedTimeSec", "stepName", "stepTotalTimeSec", "activeProfile",
            "remainingProcessTimeSec",
        ] {
            assert!(json.contains(key), "missing {key} in {json}");
        }
    }
}
