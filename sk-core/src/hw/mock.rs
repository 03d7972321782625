//! Scripted board for deterministic tests
//!
//! Inputs are set by the test, outputs are recorded for assertions.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};

use super::{Board, Button, HEATER_CHANNELS};

#[derive(Debug, Default, Clone, Copy)]
pub struct RecordedOutputs {
    pub heater_duty: [u8; HEATER_CHANNELS],
    pub fan_on: bool,
    pub smoke_pwm: u8,
    pub buzzer_on: bool,
}

/// Board whose inputs are scripted and whose outputs are recorded
#[derive(Default)]
pub struct MockBoard {
    outputs: Mutex<RecordedOutputs>,
    door: AtomicBool,
    buttons: Mutex<Vec<Button>>,
    ntc_adc: AtomicU16,
    probes: Mutex<Vec<Option<f64>>>,
    conversion_requests: AtomicUsize,
}

impl MockBoard {
    pub fn new() -> Self {
        let board = MockBoard::default();
        board.ntc_adc.store(2048, Ordering::SeqCst);
        *board.probes.lock() = vec![Some(25.0), Some(25.0)];
        board
    }

    // --- scripting -----------------------------------------------------

    pub fn set_door(&self, open: bool) {
        self.door.store(open, Ordering::SeqCst);
    }

    pub fn press(&self, button: Button) {
        self.buttons.lock().push(button);
    }

    pub fn release_all(&self) {
        self.buttons.lock().clear();
    }

    pub fn set_ntc_adc(&self, raw: u16) {
        self.ntc_adc.store(raw, Ordering::SeqCst);
    }

    /// Script probe `index`; `None` simulates a disconnected sensor
    pub fn set_probe(&self, index: usize, value: Option<f64>) {
        let mut probes = self.probes.lock();
        if probes.len() <= index {
            probes.resize(index + 1, None);
        }
        probes[index] = value;
    }

    pub fn set_probe_count(&self, count: usize) {
        self.probes.lock().resize(count, None);
    }

    // --- assertions ----------------------------------------------------

    pub fn outputs(&self) -> RecordedOutputs {
        *self.outputs.lock()
    }

    pub fn conversion_requests(&self) -> usize {
        self.conversion_requests.load(Ordering::SeqCst)
    }

    pub fn all_quiet(&self) -> bool {
        let o = *self.outputs.lock();
        o.heater_duty == [0; HEATER_CHANNELS] && !o.fan_on && o.smoke_pwm == 0
    }
}

impl Board for MockBoard {
    fn write_heater_duty(&self, channel: usize, duty: u8) {
        if channel < HEATER_CHANNELS {
            self.outputs.lock().heater_duty[channel] = duty;
        }
    }

    fn set_fan(&self, on: bool) {
        self.outputs.lock().fan_on = on;
    }

    fn set_smoke_pwm(&self, duty: u8) {
        self.outputs.lock().smoke_pwm = duty;
    }

    fn set_buzzer(&self, on: bool) {
        self.outputs.lock().buzzer_on = on;
    }

    fn door_open(&self) -> bool {
        self.door.load(Ordering::SeqCst)
    }

    fn button_pressed(&self, button: Button) -> bool {
        self.buttons.lock().contains(&button)
    }

    fn read_ntc_adc(&self) -> u16 {
        self.ntc_adc.load(Ordering::SeqCst)
    }

    fn onewire_request_conversion(&self) {
        self.conversion_requests.fetch_add(1, Ordering::SeqCst);
    }

    fn onewire_read(&self, index: usize) -> Option<f64> {
        self.probes.lock().get(index).copied().flatten()
    }

    fn onewire_device_count(&self) -> usize {
        self.probes.lock().len()
    }
}
