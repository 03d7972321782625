//! Temperature acquisition
//!
//! Chamber temperature comes from up to two digital one-wire probes with
//! non-blocking conversion pacing: a conversion is requested at most every
//! 1.2 s and read 850 ms later. Readings are filtered against the known
//! bogus values (the 85 °C power-on artifact, the 127 °C bus error, the
//! disconnect sentinel) and averaged; the last good value covers gaps.
//! The meat probe is an NTC divider on the ADC, oversampled, reduced via
//! the beta model and smoothed with an EMA.

use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

use crate::constants::{ntc, process as process_cfg, sensors as cfg};
use crate::controller::Controller;
use crate::data::types::CachedReading;
use crate::hw::Board;
use crate::process;

/// Acquisition state owned by the sensor task
pub struct SensorEngine {
    last_request_ms: Option<u64>,
    read_due_ms: Option<u64>,
    cached_probe: [CachedReading; 2],
    cached_chamber: CachedReading,
    cached_meat: CachedReading,
    miss_count: u32,
    ntc_filtered: f64,
    ntc_initialized: bool,
    /// Inter-sample ADC pacing; zero in tests
    ntc_gap_us: u64,
    door_last: bool,
}

impl SensorEngine {
    pub fn new() -> Self {
        SensorEngine {
            last_request_ms: None,
            read_due_ms: None,
            cached_probe: [CachedReading::default(); 2],
            cached_chamber: CachedReading::default(),
            cached_meat: CachedReading::default(),
            miss_count: 0,
            ntc_filtered: 0.0,
            ntc_initialized: false,
            ntc_gap_us: ntc::SAMPLE_GAP_US,
            door_last: false,
        }
    }

    /// Disable ADC pacing (tests)
    pub fn without_adc_pacing(mut self) -> Self {
        self.ntc_gap_us = 0;
        self
    }

    /// One sensor-task iteration
    pub fn tick(&mut self, ctl: &Controller, now_ms: u64) {
        self.pace_and_read_chamber(ctl, now_ms);
        self.read_meat(ctl, now_ms);
        self.check_door(ctl, now_ms);
        self.check_overheat(ctl);
    }

    // ------------------------------------------------------------------
    // Digital chamber probes
    // ------------------------------------------------------------------

    fn pace_and_read_chamber(&mut self, ctl: &Controller, now_ms: u64) {
        let request_due = match self.last_request_ms {
            None => true,
            Some(last) => now_ms.saturating_sub(last) >= cfg::REQUEST_INTERVAL_MS,
        };
        if request_due {
            ctl.board.onewire_request_conversion();
            self.last_request_ms = Some(now_ms);
            self.read_due_ms = Some(now_ms + cfg::CONVERSION_MS);
        }

        let Some(due) = self.read_due_ms else { return };
        if now_ms < due {
            return;
        }
        self.read_due_ms = None;

        let v1 = self.read_probe(ctl.board.as_ref(), 0, now_ms);
        let v2 = self.read_probe(ctl.board.as_ref(), 1, now_ms);

        let chamber = match (v1, v2) {
            (Some(a), Some(b)) => Some((a + b) / 2.0),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        };

        match chamber {
            Some(value) => {
                self.cached_chamber = CachedReading {
                    value,
                    timestamp_ms: now_ms,
                    valid: true,
                    attempts: 0,
                };
                let had_error = self.miss_count >= cfg::MAX_MISSES;
                self.miss_count = 0;
                if had_error {
                    process::chamber_sensors_recovered(ctl, now_ms);
                }
            }
            None => {
                self.miss_count += 1;
                debug!(miss = self.miss_count, "No valid chamber reading");
                if self.miss_count == cfg::MAX_MISSES {
                    process::chamber_sensors_failed(ctl);
                }
            }
        }

        if let Ok(mut st) = ctl.lock_state() {
            st.t_chamber1 = self.cached_probe[0].value;
            st.t_chamber2 = self.cached_probe[1].value;
            // Cached last-good covers read gaps
            st.t_chamber = self.cached_chamber.value;
        }
    }

    /// Read one probe with validity filtering and the 85 °C retry
    fn read_probe(&mut self, board: &dyn Board, index: usize, now_ms: u64) -> Option<f64> {
        let mut raw = board.onewire_read(index);

        // 85.0 is the power-on-reset artifact; a single re-read usually
        // returns the true conversion.
        if raw == Some(cfg::POWER_ON_RESET_C) {
            thread::sleep(Duration::from_millis(cfg::RETRY_85_MS));
            raw = board.onewire_read(index);
        }

        let slot = &mut self.cached_probe[index];
        match raw {
            Some(v)
                if v != cfg::POWER_ON_RESET_C
                    && v != cfg::BUS_ERROR_C
                    && (cfg::VALID_MIN..=cfg::VALID_MAX).contains(&v) =>
            {
                *slot = CachedReading {
                    value: v,
                    timestamp_ms: now_ms,
                    valid: true,
                    attempts: 0,
                };
                Some(v)
            }
            _ => {
                slot.attempts += 1;
                slot.valid = false;
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // NTC meat probe
    // ------------------------------------------------------------------

    fn read_meat(&mut self, ctl: &Controller, now_ms: u64) {
        let raw = self.oversample_adc(ctl.board.as_ref());

        // Rail guard: shorted or open divider
        if raw <= 0.0 || raw >= ntc::ADC_MAX {
            self.cached_meat.attempts += 1;
            warn!(raw, "NTC reading at the rail, keeping cached value");
            self.publish_meat(ctl, self.cached_meat.value);
            return;
        }

        let resistance = ntc::R_SERIES * raw / (ntc::ADC_MAX - raw + ntc::EPSILON);
        let t0_kelvin = ntc::T_NOMINAL + 273.15;
        let celsius = 1.0
            / ((resistance / ntc::R_NOMINAL).ln() / ntc::BETA + 1.0 / t0_kelvin)
            - 273.15;

        let filtered = if self.ntc_initialized {
            self.ntc_filtered * ntc::EMA_ALPHA + celsius * (1.0 - ntc::EMA_ALPHA)
        } else {
            self.ntc_initialized = true;
            celsius
        };
        self.ntc_filtered = filtered;

        if filtered > ntc::T_MIN && filtered < ntc::T_MAX {
            self.cached_meat = CachedReading {
                value: filtered,
                timestamp_ms: now_ms,
                valid: true,
                attempts: 0,
            };
            self.publish_meat(ctl, filtered);
        } else {
            self.cached_meat.attempts += 1;
            warn!(filtered, "NTC temperature out of range, keeping cached value");
            self.publish_meat(ctl, self.cached_meat.value);
        }
    }

    fn oversample_adc(&self, board: &dyn Board) -> f64 {
        let mut sum: u64 = 0;
        for _ in 0..ntc::OVERSAMPLE {
            sum += board.read_ntc_adc() as u64;
            if self.ntc_gap_us > 0 {
                thread::sleep(Duration::from_micros(self.ntc_gap_us));
            }
        }
        sum as f64 / ntc::OVERSAMPLE as f64
    }

    fn publish_meat(&self, ctl: &Controller, value: f64) {
        if let Ok(mut st) = ctl.lock_state() {
            st.t_meat = value;
        }
    }

    // ------------------------------------------------------------------
    // Door and overheat
    // ------------------------------------------------------------------

    fn check_door(&mut self, ctl: &Controller, now_ms: u64) {
        let open = ctl.board.door_open();
        if open == self.door_last {
            return;
        }
        self.door_last = open;
        if open {
            process::door_opened(ctl, now_ms);
        } else {
            process::door_closed(ctl, now_ms);
        }
    }

    fn check_overheat(&self, ctl: &Controller) {
        let too_hot = ctl
            .lock_state()
            .map(|st| st.t_chamber > process_cfg::T_MAX_SOFT)
            .unwrap_or(false);
        if too_hot {
            process::overheat(ctl);
        }
    }

    /// Diagnostics snapshot for the local UI and the web diagnostics page
    pub fn diagnostics(&self, now_ms: u64) -> String {
        let age = |r: &CachedReading| {
            if r.valid {
                format!("{} ms", now_ms.saturating_sub(r.timestamp_ms))
            } else {
                format!("invalid ({} attempts)", r.attempts)
            }
        };
        format!(
            "chamber1: {:.1}C {} | chamber2: {:.1}C {} | meat: {:.1}C {} | misses: {}",
            self.cached_probe[0].value,
            age(&self.cached_probe[0]),
            self.cached_probe[1].value,
            age(&self.cached_probe[1]),
            self.cached_meat.value,
            age(&self.cached_meat),
            self.miss_count,
        )
    }
}

impl Default for SensorEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::test_controller;
    use crate::data::types::ProcessState;
    use crate::hw::MockBoard;
    use std::sync::Arc;

    fn setup() -> (Arc<Controller>, Arc<MockBoard>, SensorEngine) {
        let board = Arc::new(MockBoard::new());
        let spi = Arc::new(crate::flash::SpiBus::new());
        let chip = Arc::new(crate::flash::MemFlash::new()) as Arc<dyn crate::flash::SpiFlash>;
        let fs = crate::flash::FlashFs::mount(chip, spi.clone()).unwrap();
        let ctl = crate::controller::Controller::new(
            board.clone(),
            spi,
            Some(fs),
            crate::storage::Nvs::ephemeral(),
        );
        (ctl, board, SensorEngine::new().without_adc_pacing())
    }

    /// Drive one full request/convert/read cycle
    fn read_cycle(eng: &mut SensorEngine, ctl: &Controller, start_ms: u64) -> u64 {
        eng.tick(ctl, start_ms);
        let after = start_ms + cfg::CONVERSION_MS;
        eng.tick(ctl, after);
        after
    }

    #[test]
    fn test_conversion_pacing() {
        let (ctl, board, mut eng) = setup();
        eng.tick(&ctl, 0);
        assert_eq!(board.conversion_requests(), 1);
        // Within the request interval: no new request
        eng.tick(&ctl, 500);
        eng.tick(&ctl, 1100);
        assert_eq!(board.conversion_requests(), 1);
        eng.tick(&ctl, 1300);
        assert_eq!(board.conversion_requests(), 2);
    }

    #[test]
    fn test_chamber_average_of_two() {
        let (ctl, board, mut eng) = setup();
        board.set_probe(0, Some(70.0));
        board.set_probe(1, Some(74.0));
        read_cycle(&mut eng, &ctl, 0);
        let st = ctl.lock_state().unwrap();
        assert_eq!(st.t_chamber, 72.0);
        assert_eq!(st.t_chamber1, 70.0);
        assert_eq!(st.t_chamber2, 74.0);
    }

    #[test]
    fn test_single_probe_fallback() {
        let (ctl, board, mut eng) = setup();
        board.set_probe(0, Some(68.0));
        board.set_probe(1, None);
        read_cycle(&mut eng, &ctl, 0);
        assert_eq!(ctl.lock_state().unwrap().t_chamber, 68.0);
    }

    #[test]
    fn test_bogus_values_rejected() {
        let (ctl, board, mut eng) = setup();
        board.set_probe(0, Some(85.0));
        board.set_probe(1, Some(127.0));
        read_cycle(&mut eng, &ctl, 0);
        // Both invalid: cached default remains
        assert_eq!(ctl.lock_state().unwrap().t_chamber, 25.0);

        board.set_probe(0, Some(250.0));
        board.set_probe(1, Some(-30.0));
        read_cycle(&mut eng, &ctl, 2000);
        assert_eq!(ctl.lock_state().unwrap().t_chamber, 25.0);
    }

    #[test]
    fn test_last_good_fallback() {
        let (ctl, board, mut eng) = setup();
        board.set_probe(0, Some(71.0));
        board.set_probe(1, Some(73.0));
        read_cycle(&mut eng, &ctl, 0);
        assert_eq!(ctl.lock_state().unwrap().t_chamber, 72.0);

        board.set_probe(0, None);
        board.set_probe(1, None);
        read_cycle(&mut eng, &ctl, 2000);
        // Cache carries the last average
        assert_eq!(ctl.lock_state().unwrap().t_chamber, 72.0);
    }

    #[test]
    fn test_three_misses_pause_and_recovery() {
        let (ctl, board, mut eng) = setup();
        board.set_probe(0, Some(60.0));
        board.set_probe(1, Some(60.0));
        read_cycle(&mut eng, &ctl, 0);

        // Put the process into a running state
        {
            let mut st = ctl.lock_state().unwrap();
            st.current_state = ProcessState::RunningAuto;
        }

        board.set_probe(0, None);
        board.set_probe(1, None);
        let mut t = 2000;
        for _ in 0..2 {
            t = read_cycle(&mut eng, &ctl, t) + 2000;
        }
        // Two misses: still running
        assert_eq!(
            ctl.lock_state().unwrap().current_state,
            ProcessState::RunningAuto
        );
        read_cycle(&mut eng, &ctl, t);
        // Third miss: sensor pause latched
        let st = ctl.lock_state().unwrap();
        assert_eq!(st.current_state, ProcessState::PauseSensor);
        assert!(st.error_sensor);
        drop(st);

        // Any valid reading recovers into SoftResume
        board.set_probe(0, Some(61.0));
        read_cycle(&mut eng, &ctl, t + 4000);
        let st = ctl.lock_state().unwrap();
        assert_eq!(st.current_state, ProcessState::SoftResume);
        assert!(!st.error_sensor);
    }

    #[test]
    fn test_door_edges_drive_state() {
        let (ctl, board, mut eng) = setup();
        {
            let mut st = ctl.lock_state().unwrap();
            st.current_state = ProcessState::RunningAuto;
        }
        board.set_door(true);
        eng.tick(&ctl, 100);
        {
            let st = ctl.lock_state().unwrap();
            assert_eq!(st.current_state, ProcessState::PauseDoor);
            assert!(st.door_open);
        }
        board.set_door(false);
        eng.tick(&ctl, 300);
        let st = ctl.lock_state().unwrap();
        assert_eq!(st.current_state, ProcessState::SoftResume);
        assert!(!st.door_open);
    }

    #[test]
    fn test_overheat_forces_pause() {
        let (ctl, board, mut eng) = setup();
        {
            let mut st = ctl.lock_state().unwrap();
            st.current_state = ProcessState::RunningManual;
        }
        board.set_probe(0, Some(135.0));
        board.set_probe(1, Some(135.0));
        read_cycle(&mut eng, &ctl, 0);
        let st = ctl.lock_state().unwrap();
        assert_eq!(st.current_state, ProcessState::PauseOverheat);
        assert!(st.error_overheat);
    }

    #[test]
    fn test_ntc_conversion_near_nominal() {
        let (ctl, board, mut eng) = setup();
        // At T0 the divider splits the rail exactly: adc = max/2
        board.set_ntc_adc((ntc::ADC_MAX / 2.0) as u16);
        eng.tick(&ctl, 0);
        let t_meat = ctl.lock_state().unwrap().t_meat;
        assert!((t_meat - ntc::T_NOMINAL).abs() < 1.0, "t_meat = {t_meat}");
    }

    #[test]
    fn test_ntc_rail_guard_keeps_cache() {
        let (ctl, board, mut eng) = setup();
        board.set_ntc_adc((ntc::ADC_MAX / 2.0) as u16);
        eng.tick(&ctl, 0);
        let good = ctl.lock_state().unwrap().t_meat;

        board.set_ntc_adc(4095);
        eng.tick(&ctl, 100);
        assert_eq!(ctl.lock_state().unwrap().t_meat, good);

        board.set_ntc_adc(0);
        eng.tick(&ctl, 200);
        assert_eq!(ctl.lock_state().unwrap().t_meat, good);
    }

    #[test]
    fn test_ntc_ema_smooths_steps() {
        let (ctl, board, mut eng) = setup();
        board.set_ntc_adc((ntc::ADC_MAX / 2.0) as u16);
        eng.tick(&ctl, 0);
        let before = ctl.lock_state().unwrap().t_meat;

        // A large step moves the filtered value only slightly per tick
        board.set_ntc_adc(1000);
        eng.tick(&ctl, 100);
        let after = ctl.lock_state().unwrap().t_meat;
        assert!(after > before);
        assert!(after - before < 10.0, "EMA jumped {before} -> {after}");
    }
}
