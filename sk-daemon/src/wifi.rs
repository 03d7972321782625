//! Wi-Fi link maintenance
//!
//! Station/AP bring-up itself is platform plumbing outside this firmware's
//! core; the task tracks link state against the stored credentials and
//! keeps uptime/downtime statistics for the monitor log.

use tracing::{info, warn};

use sk_core::Controller;

#[derive(Debug, Clone, Copy, Default)]
pub struct WifiStats {
    pub total_uptime_ms: u64,
    pub total_downtime_ms: u64,
    pub disconnect_count: u32,
    pub connected: bool,
}

pub struct WifiLink {
    stats: WifiStats,
    last_check_ms: u64,
    reported_unconfigured: bool,
}

impl WifiLink {
    pub fn new() -> Self {
        WifiLink {
            stats: WifiStats::default(),
            last_check_ms: 0,
            reported_unconfigured: false,
        }
    }

    pub fn stats(&self) -> WifiStats {
        self.stats
    }

    /// Periodic link check. The host build considers the link up whenever
    /// credentials are configured; a real station driver slots in here.
    pub fn maintain(&mut self, ctl: &Controller, now_ms: u64) {
        let configured = ctl.nvs.lock().data.wifi_ssid.is_some();
        let up = configured;

        let dt = if self.last_check_ms == 0 {
            0
        } else {
            now_ms.saturating_sub(self.last_check_ms)
        };
        self.last_check_ms = now_ms;

        if up {
            self.stats.total_uptime_ms += dt;
        } else {
            self.stats.total_downtime_ms += dt;
        }

        if up != self.stats.connected {
            if up {
                info!("WiFi link up");
            } else {
                self.stats.disconnect_count += 1;
                warn!("WiFi link down");
            }
            self.stats.connected = up;
        }

        if !configured && !self.reported_unconfigured {
            self.reported_unconfigured = true;
            warn!("WiFi credentials not configured; local UI and web on AP fallback");
        }
    }
}

impl Default for WifiLink {
    fn default() -> Self {
        Self::new()
    }
}
