//! Trend-predicted cyclic fan duty
//!
//! A sliding window of chamber samples yields a short-horizon trend (mean
//! of first differences). In cyclic mode the trend stretches or shrinks the
//! on/off phases ahead of the temperature actually overshooting; the
//! operator-configured times are never overwritten, only the effective pair.

use crate::constants::fan as cfg;

/// Sliding-window trend analyser for the cyclic fan policy
#[derive(Debug, Clone)]
pub struct FanTrend {
    samples: Vec<f64>,
    last_sample_ms: Option<u64>,
}

impl FanTrend {
    pub fn new() -> Self {
        FanTrend {
            samples: Vec::with_capacity(cfg::TREND_SAMPLES),
            last_sample_ms: None,
        }
    }

    pub fn reset(&mut self) {
        self.samples.clear();
        self.last_sample_ms = None;
    }

    /// Record a chamber sample at the trend cadence
    pub fn record(&mut self, t_chamber: f64, now_ms: u64) {
        let due = match self.last_sample_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= cfg::TREND_SAMPLE_MS,
        };
        if !due || !t_chamber.is_finite() {
            return;
        }
        self.last_sample_ms = Some(now_ms);
        if self.samples.len() == cfg::TREND_SAMPLES {
            self.samples.remove(0);
        }
        self.samples.push(t_chamber);
    }

    /// Mean first-difference over the window, °C per sample.
    /// `None` until the window is full.
    pub fn trend(&self) -> Option<f64> {
        if self.samples.len() < cfg::TREND_SAMPLES {
            return None;
        }
        let diffs: f64 = self
            .samples
            .windows(2)
            .map(|pair| pair[1] - pair[0])
            .sum();
        Some(diffs / (self.samples.len() - 1) as f64)
    }

    /// Derive the effective cyclic times from the configured pair.
    pub fn effective_times(
        &self,
        configured_on_ms: u64,
        configured_off_ms: u64,
        t_chamber: f64,
        t_set: f64,
    ) -> (u64, u64) {
        let Some(trend) = self.trend() else {
            return (configured_on_ms, configured_off_ms);
        };

        if trend > cfg::TREND_RISING {
            // Heating too fast: move more air, rest less
            let on = ((configured_on_ms as f64 * cfg::ON_LENGTHEN) as u64).min(cfg::ON_CAP_MS);
            let off = ((configured_off_ms as f64 * cfg::OFF_SHORTEN) as u64).max(cfg::OFF_FLOOR_MS);
            (on, off)
        } else if trend < cfg::TREND_FALLING {
            // Cooling: conserve heat
            let on = ((configured_on_ms as f64 * cfg::OFF_SHORTEN) as u64).max(cfg::MIN_PHASE_MS);
            let off = ((configured_off_ms as f64 * cfg::ON_LENGTHEN) as u64).min(cfg::ON_CAP_MS * 4);
            (on, off)
        } else if trend.abs() < cfg::TREND_STABLE && (t_chamber - t_set).abs() < cfg::STABLE_DELTA_T
        {
            // Settled: lock to the quiet defaults
            (cfg::DEFAULT_ON_MS, cfg::DEFAULT_OFF_MS)
        } else {
            (configured_on_ms, configured_off_ms)
        }
    }
}

impl Default for FanTrend {
    fn default() -> Self {
        Self::new()
    }
}

/// Cyclic fan phase state, stepped every control tick
#[derive(Debug, Clone, Copy)]
pub struct FanCycle {
    pub on: bool,
    pub phase_start_ms: u64,
}

impl FanCycle {
    pub fn new() -> Self {
        FanCycle {
            on: true,
            phase_start_ms: 0,
        }
    }

    /// Advance the phase; returns the level the fan GPIO should carry
    pub fn tick(&mut self, on_ms: u64, off_ms: u64, now_ms: u64) -> bool {
        if self.on {
            if now_ms.saturating_sub(self.phase_start_ms) >= on_ms {
                self.on = false;
                self.phase_start_ms = now_ms;
            }
        } else if now_ms.saturating_sub(self.phase_start_ms) >= off_ms {
            self.on = true;
            self.phase_start_ms = now_ms;
        }
        self.on
    }
}

impl Default for FanCycle {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(trend: &mut FanTrend, values: &[f64]) {
        for (i, v) in values.iter().enumerate() {
            trend.record(*v, i as u64 * cfg::TREND_SAMPLE_MS);
        }
    }

    #[test]
    fn test_trend_needs_full_window() {
        let mut trend = FanTrend::new();
        fill(&mut trend, &[50.0, 51.0, 52.0]);
        assert!(trend.trend().is_none());
        assert_eq!(trend.effective_times(10_000, 60_000, 52.0, 80.0), (10_000, 60_000));
    }

    #[test]
    fn test_rising_trend_lengthens_on() {
        let mut trend = FanTrend::new();
        fill(&mut trend, &[50.0, 51.0, 52.0, 53.0, 54.0]);
        assert!((trend.trend().unwrap() - 1.0).abs() < 1e-9);
        let (on, off) = trend.effective_times(10_000, 60_000, 54.0, 80.0);
        assert_eq!(on, 15_000);
        assert_eq!(off, 42_000);
    }

    #[test]
    fn test_on_cap_and_off_floor() {
        let mut trend = FanTrend::new();
        fill(&mut trend, &[50.0, 52.0, 54.0, 56.0, 58.0]);
        let (on, off) = trend.effective_times(25_000, 12_000, 58.0, 90.0);
        assert_eq!(on, cfg::ON_CAP_MS);
        assert_eq!(off, cfg::OFF_FLOOR_MS);
    }

    #[test]
    fn test_falling_trend_conserves_heat() {
        let mut trend = FanTrend::new();
        fill(&mut trend, &[60.0, 59.5, 59.0, 58.5, 58.0]);
        let (on, off) = trend.effective_times(10_000, 60_000, 58.0, 80.0);
        assert!(on < 10_000);
        assert!(off > 60_000);
    }

    #[test]
    fn test_stable_near_setpoint_locks_defaults() {
        let mut trend = FanTrend::new();
        fill(&mut trend, &[79.9, 80.0, 79.95, 80.05, 80.0]);
        let (on, off) = trend.effective_times(20_000, 20_000, 80.0, 80.0);
        assert_eq!(on, cfg::DEFAULT_ON_MS);
        assert_eq!(off, cfg::DEFAULT_OFF_MS);
    }

    #[test]
    fn test_cycle_phases() {
        let mut cycle = FanCycle::new();
        assert!(cycle.tick(10_000, 60_000, 0));
        assert!(cycle.tick(10_000, 60_000, 9_999));
        // On phase expires
        assert!(!cycle.tick(10_000, 60_000, 10_000));
        assert!(!cycle.tick(10_000, 60_000, 69_999));
        // Off phase expires
        assert!(cycle.tick(10_000, 60_000, 70_000));
    }

    #[test]
    fn test_record_respects_cadence() {
        let mut trend = FanTrend::new();
        trend.record(50.0, 0);
        trend.record(99.0, 1000); // Ignored, too soon
        trend.record(51.0, cfg::TREND_SAMPLE_MS);
        assert_eq!(trend.samples, vec![50.0, 51.0]);
    }
}
