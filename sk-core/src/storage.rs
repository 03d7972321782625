//! Persistent configuration (NVS) and profile loading
//!
//! NVS is a small key/value blob store; the host rendition persists it as
//! JSON under the user config directory. Profiles live as text files on
//! the flash filesystem, or come from a remote source when the path
//! carries the `github:` prefix; the remote client is an external
//! collaborator pinned behind the [`RemoteProfiles`] trait.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

use sk_error::{Result, SmokehouseError};

use crate::constants::{flash as flash_cfg, process, web};
use crate::controller::Controller;
use crate::data::profile::{parse_profile, planned_seconds};
use crate::data::types::{FanMode, Step};

/// Maximum backups retained by the rotation
const MAX_BACKUPS: usize = 5;

/// Persisted configuration blobs
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NvsData {
    #[serde(default)]
    pub wifi_ssid: Option<String>,
    #[serde(default)]
    pub wifi_pass: Option<String>,
    /// Last selected profile path (may carry a `github:` prefix)
    #[serde(default)]
    pub profile: Option<String>,
    #[serde(default)]
    pub auth_user: Option<String>,
    #[serde(default)]
    pub auth_pass: Option<String>,
    #[serde(default = "default_manual_tset")]
    pub manual_tset: f64,
    #[serde(default = "default_manual_pow")]
    pub manual_pow: u8,
    #[serde(default)]
    pub manual_smoke: u8,
    #[serde(default = "default_manual_fan")]
    pub manual_fan: u8,
}

fn default_manual_fan() -> u8 {
    1
}

fn default_manual_tset() -> f64 {
    process::MANUAL_DEFAULT_TSET
}

fn default_manual_pow() -> u8 {
    process::MANUAL_DEFAULT_POWER
}

/// NVS store bound to its backing file
#[derive(Debug, Clone)]
pub struct Nvs {
    path: Option<PathBuf>,
    pub data: NvsData,
}

/// Default NVS location under the user config directory
pub fn default_nvs_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("smokehouse").join("nvs.json"))
}

/// Default flash image location under the user config directory
pub fn default_flash_image_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("smokehouse").join("flash.img"))
}

impl Nvs {
    /// Load from disk, falling back to defaults on any failure
    pub fn load(path: PathBuf) -> Nvs {
        let data = match fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str(&text) {
                Ok(data) => data,
                Err(e) => {
                    warn!("NVS parse failed ({e}), using defaults");
                    NvsData::default()
                }
            },
            Err(_) => NvsData::default(),
        };
        Nvs {
            path: Some(path),
            data,
        }
    }

    /// In-memory store for tests and flashless fallback
    pub fn ephemeral() -> Nvs {
        Nvs {
            path: None,
            data: NvsData::default(),
        }
    }

    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.data)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Web credentials, falling back to the compiled-in defaults
    pub fn auth(&self) -> (String, String) {
        (
            self.data
                .auth_user
                .clone()
                .unwrap_or_else(|| web::DEFAULT_USER.to_string()),
            self.data
                .auth_pass
                .clone()
                .unwrap_or_else(|| web::DEFAULT_PASS.to_string()),
        )
    }

    /// Wipe the stored credentials; getters return defaults afterwards
    pub fn reset_auth(&mut self) -> Result<()> {
        self.data.auth_user = None;
        self.data.auth_pass = None;
        self.save()
    }
}

/// Remote profile source (external collaborator, e.g. a GitHub repo over
/// HTTPS). The firmware pins only this interface.
pub trait RemoteProfiles: Send + Sync {
    fn list(&self) -> Result<Vec<String>>;
    fn fetch(&self, name: &str) -> Result<String>;
}

/// Placeholder used when no remote client is wired up
pub struct NoRemote;

impl RemoteProfiles for NoRemote {
    fn list(&self) -> Result<Vec<String>> {
        Err(SmokehouseError::RemoteUnavailable("no remote client".into()))
    }

    fn fetch(&self, name: &str) -> Result<String> {
        Err(SmokehouseError::RemoteUnavailable(format!(
            "no remote client for {name}"
        )))
    }
}

/// Fetch profile text from flash or the remote source
fn fetch_profile_text(
    ctl: &Controller,
    path: &str,
    remote: &dyn RemoteProfiles,
) -> Result<String> {
    if let Some(name) = path.strip_prefix("github:") {
        return remote.fetch(name);
    }
    let Some(flash) = &ctl.flash else {
        return Err(SmokehouseError::FlashInitFail(
            "flash unavailable, manual mode only".into(),
        ));
    };
    let bytes = flash
        .try_lock_for(crate::constants::locks::TIMEOUT)
        .ok_or(SmokehouseError::MutexTimeout {
            name: "flash",
            waited_ms: crate::constants::locks::TIMEOUT.as_millis() as u64,
        })?
        .file_read(path, flash_cfg::MAX_FILE_SECTORS * flash_cfg::SECTOR_SIZE as usize)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Load a profile into controller state.
///
/// On success the step list, the planned totals and the active path are
/// swapped under one state lock. Zero parsed steps raises `error_profile`
/// and leaves the previous profile unloaded.
pub fn load_profile(ctl: &Controller, path: &str, remote: &dyn RemoteProfiles) -> Result<usize> {
    let text = match fetch_profile_text(ctl, path, remote) {
        Ok(text) => text,
        Err(e) => {
            ctl.lock_state()?.error_profile = true;
            return Err(e);
        }
    };
    let steps = parse_profile(&text);
    let count = steps.len();
    let planned = planned_seconds(&steps);

    let mut st = ctl.lock_state()?;
    if count == 0 {
        st.error_profile = true;
        return Err(SmokehouseError::ProfileInvalid(format!(
            "{path}: no valid steps"
        )));
    }
    st.profile = steps;
    st.current_step = 0;
    st.active_profile = path.to_string();
    st.error_profile = false;
    st.stats.total_planned_sec = planned;
    st.stats.remaining_sec = planned;
    drop(st);

    info!(path, steps = count, "Profile loaded");
    Ok(count)
}

/// Boot-time profile selection.
///
/// A saved `github:` path is routine to fail on a boot without network;
/// rather than latching a profile error, fall back to the first local
/// profile before giving up.
pub fn load_boot_profile(ctl: &Controller, remote: &dyn RemoteProfiles) -> Result<usize> {
    let saved = ctl.nvs.lock().data.profile.clone();
    if let Some(path) = saved {
        match load_profile(ctl, &path, remote) {
            Ok(n) => return Ok(n),
            Err(e) => warn!("Saved profile {path} failed to load: {e}"),
        }
    }

    let fallback = ctl.flash.as_ref().and_then(|flash| {
        flash
            .try_lock_for(crate::constants::locks::TIMEOUT)
            .and_then(|fs| fs.list("/profiles/").first().map(|f| f.name.clone()))
    });
    match fallback {
        Some(path) => {
            info!("Falling back to local profile {path}");
            let n = load_profile(ctl, &path, remote)?;
            // Clear the error latched by the failed primary attempt
            ctl.lock_state()?.error_profile = false;
            Ok(n)
        }
        None => {
            ctl.lock_state()?.error_profile = true;
            Err(SmokehouseError::ProfileInvalid("no profile available".into()))
        }
    }
}

/// Restore the persisted manual-mode settings into controller state
pub fn apply_manual_settings(ctl: &Controller) -> Result<()> {
    let data = ctl.nvs.lock().data.clone();
    let mut st = ctl.lock_state()?;
    st.t_set = data
        .manual_tset
        .clamp(process::T_SET_MIN, process::T_SET_MAX);
    st.power_mode = data.manual_pow.clamp(1, 3);
    st.manual_smoke_pwm = data.manual_smoke;
    st.fan_mode = FanMode::from_u8(data.manual_fan);
    Ok(())
}

/// Persist the current manual-mode settings
pub fn save_manual_settings(ctl: &Controller) -> Result<()> {
    let (tset, pow, smoke, fan) = {
        let st = ctl.lock_state()?;
        (
            st.t_set,
            st.power_mode,
            st.manual_smoke_pwm,
            st.fan_mode as u8,
        )
    };
    let mut nvs = ctl.nvs.lock();
    nvs.data.manual_tset = tset;
    nvs.data.manual_pow = pow;
    nvs.data.manual_smoke = smoke;
    nvs.data.manual_fan = fan;
    nvs.save()
}

/// Serialize steps for the `/profile/get` endpoint
pub fn profile_as_json(steps: &[Step]) -> Result<String> {
    Ok(serde_json::to_string(steps)?)
}

// ============================================================================
// Configuration backups
// ============================================================================

/// Write the current NVS blob to the backup partition, rotating old copies
pub fn backup_config(ctl: &Controller) -> Result<String> {
    let Some(flash) = &ctl.flash else {
        return Err(SmokehouseError::FlashInitFail("flash unavailable".into()));
    };
    let json = serde_json::to_string_pretty(&ctl.nvs.lock().data)?;

    let mut fs = flash
        .try_lock_for(crate::constants::locks::TIMEOUT)
        .ok_or(SmokehouseError::MutexTimeout {
            name: "flash",
            waited_ms: crate::constants::locks::TIMEOUT.as_millis() as u64,
        })?;

    let existing = fs.list("/backup/");
    let next_index = existing
        .iter()
        .filter_map(|f| {
            f.name
                .strip_prefix("/backup/config_")
                .and_then(|s| s.strip_suffix(".bak"))
                .and_then(|s| s.parse::<u32>().ok())
        })
        .max()
        .map_or(1, |n| n + 1);
    let path = format!("/backup/config_{next_index}.bak");
    fs.file_write(&path, json.as_bytes())?;

    // Rotation: keep the newest MAX_BACKUPS
    let mut backups: Vec<(u32, String)> = fs
        .list("/backup/")
        .into_iter()
        .filter_map(|f| {
            f.name
                .strip_prefix("/backup/config_")
                .and_then(|s| s.strip_suffix(".bak"))
                .and_then(|s| s.parse::<u32>().ok())
                .map(|n| (n, f.name))
        })
        .collect();
    backups.sort_by_key(|(n, _)| *n);
    while backups.len() > MAX_BACKUPS {
        let (_, victim) = backups.remove(0);
        if let Err(e) = fs.file_delete(&victim) {
            warn!("Backup rotation failed to delete {victim}: {e}");
            break;
        }
        info!("Rotated out old backup {victim}");
    }
    Ok(path)
}

/// Restore an NVS blob from a backup file
pub fn restore_backup(ctl: &Controller, path: &str) -> Result<()> {
    let Some(flash) = &ctl.flash else {
        return Err(SmokehouseError::FlashInitFail("flash unavailable".into()));
    };
    let bytes = flash
        .try_lock_for(crate::constants::locks::TIMEOUT)
        .ok_or(SmokehouseError::MutexTimeout {
            name: "flash",
            waited_ms: crate::constants::locks::TIMEOUT.as_millis() as u64,
        })?
        .file_read(path, flash_cfg::APPEND_LIMIT)?;
    let data: NvsData = serde_json::from_slice(&bytes)?;
    let mut nvs = ctl.nvs.lock();
    nvs.data = data;
    nvs.save()?;
    info!("Configuration restored from {path}");
    Ok(())
}

/// Names of available configuration backups
pub fn list_backups(ctl: &Controller) -> Vec<String> {
    let Some(flash) = &ctl.flash else {
        return Vec::new();
    };
    flash
        .try_lock_for(crate::constants::locks::TIMEOUT)
        .map(|fs| {
            fs.list("/backup/")
                .into_iter()
                .map(|f| f.name)
                .filter(|n| n.ends_with(".bak"))
                .collect()
        })
        .unwrap_or_default()
}
