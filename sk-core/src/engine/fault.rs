//! Heater-efficiency supervisor
//!
//! Detects "heating is commanded but the chamber is not warming": with the
//! process running, the setpoint well above the chamber and the PID pushing
//! hard, the chamber must rise by a minimum amount within a 20-minute
//! window or the run is latched into a heater-fault pause.

use crate::constants::heater as cfg;

/// Verdict of one supervision step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultVerdict {
    /// Not monitoring, or window still open
    Ok,
    /// Window expired without the required rise
    Fault,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeaterFaultMonitor {
    monitoring: bool,
    temp_at_start: f64,
    window_start_ms: u64,
}

impl HeaterFaultMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_monitoring(&self) -> bool {
        self.monitoring
    }

    /// Explicit reset; called on every start, resume and step advance
    pub fn reset(&mut self) {
        self.monitoring = false;
        self.temp_at_start = 0.0;
        self.window_start_ms = 0;
    }

    /// One supervision step.
    ///
    /// `running` reflects the process state; activation additionally needs
    /// the setpoint more than 10 °C above the chamber and the PID output
    /// above 50 %. Leaving the activation condition clears monitoring
    /// without an alarm.
    pub fn update(
        &mut self,
        running: bool,
        t_set: f64,
        t_chamber: f64,
        pid_output: f64,
        now_ms: u64,
    ) -> FaultVerdict {
        let demanding =
            running && (t_set - t_chamber) > cfg::FAULT_DELTA_T && pid_output > cfg::FAULT_MIN_PID;

        if !demanding {
            if self.monitoring {
                tracing::debug!("Heater supervisor disarmed (demand condition cleared)");
            }
            self.monitoring = false;
            return FaultVerdict::Ok;
        }

        if !self.monitoring {
            self.monitoring = true;
            self.temp_at_start = t_chamber;
            self.window_start_ms = now_ms;
            tracing::debug!(
                t_chamber,
                t_set,
                "Heater supervisor armed, expecting >= {} °C rise in {} min",
                cfg::FAULT_MIN_RISE,
                cfg::FAULT_WINDOW_MS / 60_000
            );
            return FaultVerdict::Ok;
        }

        if now_ms.saturating_sub(self.window_start_ms) < cfg::FAULT_WINDOW_MS {
            return FaultVerdict::Ok;
        }

        let rise = t_chamber - self.temp_at_start;
        if rise < cfg::FAULT_MIN_RISE {
            tracing::error!(
                rise,
                window_min = cfg::FAULT_WINDOW_MS / 60_000,
                "Heater fault: chamber failed to warm under full demand"
            );
            self.monitoring = false;
            return FaultVerdict::Fault;
        }

        // Progress confirmed; slide the window forward
        self.temp_at_start = t_chamber;
        self.window_start_ms = now_ms;
        FaultVerdict::Ok
    }
}
