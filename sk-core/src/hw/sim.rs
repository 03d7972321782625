//! First-order thermal simulation board
//!
//! Lets the daemon run end-to-end on a workstation: heater duty warms the
//! chamber toward a power-dependent ceiling, the chamber leaks toward
//! ambient, and the meat probe follows the chamber with a long lag.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use super::{Board, Button, HEATER_CHANNELS};

/// Ambient temperature the chamber relaxes toward (°C)
const AMBIENT_C: f64 = 18.0;
/// Chamber temperature gain at full power of one heater (°C)
const HEATER_GAIN_C: f64 = 55.0;
/// Chamber time constant (s)
const CHAMBER_TAU_S: f64 = 180.0;
/// Meat time constant (s)
const MEAT_TAU_S: f64 = 900.0;
/// Extra leakage factor while the door is open
const DOOR_LOSS: f64 = 4.0;

struct Thermal {
    chamber: f64,
    meat: f64,
    last_update: Instant,
}

pub struct SimBoard {
    thermal: Mutex<Thermal>,
    heater_duty: Mutex<[u8; HEATER_CHANNELS]>,
    fan_on: AtomicBool,
    smoke_pwm: Mutex<u8>,
    buzzer_on: AtomicBool,
    door: AtomicBool,
}

impl SimBoard {
    pub fn new() -> Self {
        SimBoard {
            thermal: Mutex::new(Thermal {
                chamber: AMBIENT_C,
                meat: AMBIENT_C,
                last_update: Instant::now(),
            }),
            heater_duty: Mutex::new([0; HEATER_CHANNELS]),
            fan_on: AtomicBool::new(false),
            smoke_pwm: Mutex::new(0),
            buzzer_on: AtomicBool::new(false),
            door: AtomicBool::new(false),
        }
    }

    /// Toggle the simulated door (bench control)
    pub fn set_door(&self, open: bool) {
        self.door.store(open, Ordering::SeqCst);
    }

    fn advance(&self, thermal: &mut Thermal) {
        let dt = thermal.last_update.elapsed().as_secs_f64();
        if dt <= 0.0 {
            return;
        }
        thermal.last_update = Instant::now();

        let duty = self.heater_duty.lock();
        let power: f64 = duty.iter().map(|d| *d as f64 / 255.0).sum();
        drop(duty);

        let mut loss = 1.0;
        if self.door.load(Ordering::SeqCst) {
            loss += DOOR_LOSS;
        }
        let target = AMBIENT_C + power * HEATER_GAIN_C / loss;
        let k_chamber = 1.0 - (-dt / CHAMBER_TAU_S).exp();
        thermal.chamber += (target - thermal.chamber) * k_chamber;

        let k_meat = 1.0 - (-dt / MEAT_TAU_S).exp();
        thermal.meat += (thermal.chamber - thermal.meat) * k_meat;
    }
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new()
    }
}

impl Board for SimBoard {
    fn write_heater_duty(&self, channel: usize, duty: u8) {
        if channel < HEATER_CHANNELS {
            self.heater_duty.lock()[channel] = duty;
        }
    }

    fn set_fan(&self, _on: bool) {}

    fn set_smoke_pwm(&self, duty: u8) {
        *self.smoke_pwm.lock() = duty;
    }

    fn set_buzzer(&self, on: bool) {
        self.buzzer_on.store(on, Ordering::SeqCst);
    }

    fn door_open(&self) -> bool {
        self.door.load(Ordering::SeqCst)
    }

    fn button_pressed(&self, _button: Button) -> bool {
        false
    }

    fn read_ntc_adc(&self) -> u16 {
        // Invert the divider so the sensor path reproduces the meat
        // temperature within filter noise.
        let mut thermal = self.thermal.lock();
        self.advance(&mut thermal);
        let t_k = thermal.meat + 273.15;
        let t0_k = crate::constants::ntc::T_NOMINAL + 273.15;
        let r = crate::constants::ntc::R_NOMINAL
            * (crate::constants::ntc::BETA * (1.0 / t_k - 1.0 / t0_k)).exp();
        let adc = crate::constants::ntc::ADC_MAX * r
            / (crate::constants::ntc::R_SERIES + r);
        adc.clamp(1.0, crate::constants::ntc::ADC_MAX - 1.0) as u16
    }

    fn onewire_request_conversion(&self) {}

    fn onewire_read(&self, index: usize) -> Option<f64> {
        if index >= 2 {
            return None;
        }
        let mut thermal = self.thermal.lock();
        self.advance(&mut thermal);
        // Small fixed skew between the two probes
        Some(thermal.chamber + if index == 0 { -0.2 } else { 0.2 })
    }

    fn onewire_device_count(&self) -> usize {
        2
    }
}
