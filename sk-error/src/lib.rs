//! Unified error handling for the smokehouse controller
//!
//! This crate provides a single error type used across all controller
//! components. It uses thiserror for ergonomic error definitions with proper
//! Display and Error trait impls.

use std::io;

/// Result type alias using SmokehouseError
pub type Result<T> = std::result::Result<T, SmokehouseError>;

/// Unified error type for all controller operations
#[derive(thiserror::Error, Debug)]
pub enum SmokehouseError {
    // ============================================================================
    // I/O and Serialization Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    // ============================================================================
    // Sensor Errors
    // ============================================================================
    #[error("Chamber sensors invalid for {consecutive} consecutive cycles")]
    ChamberSensorFail { consecutive: u32 },

    #[error("Meat probe reading out of range: {value:.1}°C")]
    MeatSensorFail { value: f64 },

    #[error("Chamber overheat: {value:.1}°C (limit {limit:.1}°C)")]
    Overheat { value: f64, limit: f64 },

    // ============================================================================
    // Process Errors
    // ============================================================================
    #[error("Heater fault: chamber rose {rise:.1}°C in the supervision window")]
    HeaterFault { rise: f64 },

    #[error("Invalid profile: {0}")]
    ProfileInvalid(String),

    #[error("Operation not allowed in state {state}")]
    InvalidState { state: &'static str },

    // ============================================================================
    // Flash Filesystem Errors
    // ============================================================================
    #[error("Flash init failed: {0}")]
    FlashInitFail(String),

    #[error("Flash write failed for {path}: {reason}")]
    FlashWriteFail { path: String, reason: String },

    #[error("Flash file not found: {0}")]
    FlashFileNotFound(String),

    #[error("File too large for partition: {path} needs {sectors} sectors")]
    FlashNoSpace { path: String, sectors: usize },

    #[error("FAT table full ({max} entries)")]
    FatFull { max: usize },

    #[error("Invalid flash path {path}: {reason}")]
    InvalidFlashPath { path: String, reason: String },

    // ============================================================================
    // Concurrency Errors
    // ============================================================================
    #[error("Mutex '{name}' acquisition timed out after {waited_ms} ms")]
    MutexTimeout { name: &'static str, waited_ms: u64 },

    #[error("Task '{task}' liveness stale for {age_ms} ms")]
    TaskHang { task: &'static str, age_ms: u64 },

    // ============================================================================
    // Storage / NVS Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Missing NVS key: {0}")]
    MissingNvsKey(String),

    #[error("Remote profile source unavailable: {0}")]
    RemoteUnavailable(String),

    // ============================================================================
    // Web / Boundary Errors
    // ============================================================================
    #[error("Authentication failed")]
    WebAuthFail,

    #[error("Firmware upload error: {0}")]
    UploadError(String),

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),
}

impl SmokehouseError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a flash write error
    pub fn flash_write(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::FlashWriteFail {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid flash path error
    pub fn invalid_path(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidFlashPath {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for conditions that clear themselves (door, sensor recovery)
    /// as opposed to faults that latch until the user acknowledges them.
    pub fn is_auto_recoverable(&self) -> bool {
        matches!(
            self,
            Self::ChamberSensorFail { .. } | Self::MeatSensorFail { .. }
        )
    }
}

// Allow converting from String to SmokehouseError
impl From<String> for SmokehouseError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to SmokehouseError
impl From<&str> for SmokehouseError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
