//! Discrete PID controller with adaptive gain scheduling
//!
//! The base controller is a textbook sample-aligned PID: proportional on
//! error, integral accumulated in output units (clamped against windup),
//! derivative on measurement. On top of it sits a variance-based adapter:
//! once a minute it inspects a 10-sample error history and either dampens
//! the gains (oscillation), tightens them (settled near setpoint), or
//! restores the compiled-in baseline.

use crate::constants::pid as cfg;

/// Sample-aligned discrete PID, direct acting, output clamped to [0, 100]
#[derive(Debug, Clone)]
pub struct Pid {
    kp: f64,
    ki: f64,
    kd: f64,
    pub setpoint: f64,
    sample_ms: u64,
    out_min: f64,
    out_max: f64,
    integral: f64,
    last_input: f64,
    last_compute_ms: Option<u64>,
    output: f64,
}

impl Pid {
    pub fn new(kp: f64, ki: f64, kd: f64, sample_ms: u64) -> Self {
        Pid {
            kp,
            ki,
            kd,
            setpoint: 0.0,
            sample_ms,
            out_min: cfg::OUT_MIN,
            out_max: cfg::OUT_MAX,
            integral: 0.0,
            last_input: 0.0,
            last_compute_ms: None,
            output: 0.0,
        }
    }

    pub fn with_output_limits(mut self, min: f64, max: f64) -> Self {
        self.out_min = min;
        self.out_max = max;
        self.integral = self.integral.clamp(min, max);
        self
    }

    pub fn set_tunings(&mut self, kp: f64, ki: f64, kd: f64) {
        if kp < 0.0 || ki < 0.0 || kd < 0.0 {
            return;
        }
        self.kp = kp;
        self.ki = ki;
        self.kd = kd;
    }

    pub fn tunings(&self) -> (f64, f64, f64) {
        (self.kp, self.ki, self.kd)
    }

    pub fn output(&self) -> f64 {
        self.output
    }

    /// Reset accumulated state for a bumpless start
    pub fn reset(&mut self, current_input: f64) {
        self.integral = 0.0;
        self.last_input = current_input;
        self.last_compute_ms = None;
        self.output = 0.0;
    }

    /// Compute a new output if a full sample period elapsed.
    ///
    /// Returns the current output either way; time alignment keeps the
    /// integral and derivative terms independent of tick jitter.
    pub fn compute(&mut self, input: f64, now_ms: u64) -> f64 {
        let due = match self.last_compute_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= self.sample_ms,
        };
        if !due {
            return self.output;
        }
        let dt_s = self.sample_ms as f64 / 1000.0;

        let error = self.setpoint - input;
        self.integral += self.ki * error * dt_s;
        self.integral = self.integral.clamp(self.out_min, self.out_max);

        // Derivative on measurement avoids setpoint-change kicks
        let d_input = if self.last_compute_ms.is_some() {
            (input - self.last_input) / dt_s
        } else {
            0.0
        };

        let raw = self.kp * error + self.integral - self.kd * d_input;
        self.output = raw.clamp(self.out_min, self.out_max);

        self.last_input = input;
        self.last_compute_ms = Some(now_ms);
        self.output
    }
}

/// Which gain set the adapter currently applies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GainProfile {
    Base,
    Dampened,
    Tightened,
}

/// Variance-based gain adapter around a compiled-in baseline
#[derive(Debug, Clone)]
pub struct AdaptivePid {
    history: [f64; cfg::ERROR_HISTORY],
    filled: usize,
    next_slot: usize,
    last_adapt_ms: Option<u64>,
    profile: GainProfile,
}

impl AdaptivePid {
    pub fn new() -> Self {
        AdaptivePid {
            history: [0.0; cfg::ERROR_HISTORY],
            filled: 0,
            next_slot: 0,
            last_adapt_ms: None,
            profile: GainProfile::Base,
        }
    }

    pub fn profile(&self) -> GainProfile {
        self.profile
    }

    /// Drop the history and return the gains to baseline
    pub fn reset(&mut self, pid: &mut Pid) {
        self.history = [0.0; cfg::ERROR_HISTORY];
        self.filled = 0;
        self.next_slot = 0;
        self.last_adapt_ms = None;
        self.profile = GainProfile::Base;
        pid.set_tunings(cfg::KP, cfg::KI, cfg::KD);
    }

    /// Seed the whole history (diagnostics/tests)
    pub fn seed_history(&mut self, samples: &[f64]) {
        for (slot, sample) in self.history.iter_mut().zip(samples.iter().cycle()) {
            *slot = *sample;
        }
        self.filled = cfg::ERROR_HISTORY;
        self.next_slot = 0;
    }

    /// Record the current error and, once a minute, re-derive the gain set.
    pub fn adapt(&mut self, pid: &mut Pid, error: f64, now_ms: u64) {
        let due = match self.last_adapt_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= cfg::ADAPT_INTERVAL_MS,
        };
        if !due {
            return;
        }
        self.last_adapt_ms = Some(now_ms);

        self.history[self.next_slot] = error;
        self.next_slot = (self.next_slot + 1) % cfg::ERROR_HISTORY;
        self.filled = (self.filled + 1).min(cfg::ERROR_HISTORY);
        if self.filled < cfg::ERROR_HISTORY {
            return;
        }

        let usable: Vec<f64> = self
            .history
            .iter()
            .copied()
            .filter(|e| e.abs() < cfg::ERROR_OUTLIER)
            .collect();
        if usable.is_empty() {
            return;
        }
        let mean = usable.iter().sum::<f64>() / usable.len() as f64;
        let variance =
            usable.iter().map(|e| (e - mean) * (e - mean)).sum::<f64>() / usable.len() as f64;

        let (profile, (mk, mi, md)) = if variance > cfg::VARIANCE_HIGH {
            (GainProfile::Dampened, cfg::DAMPEN)
        } else if variance < cfg::VARIANCE_LOW && error.abs() < cfg::ERROR_NEAR {
            (GainProfile::Tightened, cfg::TIGHTEN)
        } else {
            (GainProfile::Base, (1.0, 1.0, 1.0))
        };

        if profile != self.profile {
            tracing::debug!(
                ?profile,
                variance,
                error,
                "Adaptive PID switching gain profile"
            );
        }
        self.profile = profile;
        pid.set_tunings(cfg::KP * mk, cfg::KI * mi, cfg::KD * md);
    }

    /// Human-readable gain report for diagnostics
    pub fn parameters(&self, pid: &Pid) -> String {
        let (kp, ki, kd) = pid.tunings();
        format!("Kp={kp:.2} Ki={ki:.3} Kd={kd:.1} profile={:?}", self.profile)
    }
}

impl Default for AdaptivePid {
    fn default() -> Self {
        Self::new()
    }
}
