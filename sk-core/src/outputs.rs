//! Output drivers: heater SSRs, circulation fan, smoke fan, buzzer
//!
//! Heater power passes three gates before reaching the PWM registers:
//! the PID output is mapped across 1-3 heaters according to the power
//! mode, each heater is clamped to zero until its soft-enable stage has
//! elapsed, and the final register write runs under the output mutex.
//!
//! `all_outputs_off` is the safety trump card: it runs to completion even
//! when the output mutex cannot be acquired, because a stuck peer must
//! never keep the heaters energized.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

use sk_error::{Result, SmokehouseError};

use crate::constants::{heater as cfg, locks};
use crate::data::types::{FanMode, HeaterEnable};
use crate::engine::fan::FanCycle;
use crate::hw::{Board, HEATER_CHANNELS};

/// Non-blocking buzzer pattern state, stepped by the UI task tick
#[derive(Debug, Clone, Copy, Default)]
struct Buzzer {
    active: bool,
    remaining: u8,
    on_ms: u64,
    off_ms: u64,
    phase_on: bool,
    phase_end_ms: u64,
}

/// All board outputs behind their locking discipline
pub struct Outputs {
    board: Arc<dyn Board>,
    /// Serializes PWM register writes (the output mutex)
    output_lock: Mutex<()>,
    /// Heater soft-enable staging (the heater mutex)
    heater: Mutex<HeaterEnable>,
    buzzer: Mutex<Buzzer>,
    fan_cycle: Mutex<FanCycle>,
    /// Raised while the lock-free shutdown path is writing
    shutting_down: AtomicBool,
}

/// Map a PID output in [0, 100] onto up to three heater duties.
///
/// Mode 1 drives one heater proportionally; modes 2 and 3 fill heaters
/// sequentially so the first is saturated before the next engages.
pub fn map_power_to_heaters(pid_output: f64, power_mode: u8) -> (f64, f64, f64) {
    let p = pid_output.clamp(0.0, 100.0);
    match power_mode {
        1 => (p, 0.0, 0.0),
        2 => {
            if p <= 50.0 {
                (p * 2.0, 0.0, 0.0)
            } else {
                (100.0, (p - 50.0) * 2.0, 0.0)
            }
        }
        _ => {
            if p <= 33.0 {
                (p * 3.0, 0.0, 0.0)
            } else if p <= 66.0 {
                (100.0, (p - 33.0) * 3.0, 0.0)
            } else {
                (100.0, 100.0, (p - 66.0) * 3.0)
            }
        }
    }
}

impl Outputs {
    pub fn new(board: Arc<dyn Board>) -> Self {
        Outputs {
            board,
            output_lock: Mutex::new(()),
            heater: Mutex::new(HeaterEnable::default()),
            buzzer: Mutex::new(Buzzer::default()),
            fan_cycle: Mutex::new(FanCycle::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn lock_heater(&self) -> Result<parking_lot::MutexGuard<'_, HeaterEnable>> {
        self.heater.try_lock_for(locks::TIMEOUT).ok_or_else(|| {
            error!("Heater mutex acquisition timed out");
            SmokehouseError::MutexTimeout {
                name: "heater",
                waited_ms: locks::TIMEOUT.as_millis() as u64,
            }
        })
    }

    fn lock_output(&self) -> Result<parking_lot::MutexGuard<'_, ()>> {
        self.output_lock.try_lock_for(locks::TIMEOUT).ok_or_else(|| {
            error!("Output mutex acquisition timed out");
            SmokehouseError::MutexTimeout {
                name: "output",
                waited_ms: locks::TIMEOUT.as_millis() as u64,
            }
        })
    }

    // ------------------------------------------------------------------
    // Heater soft-enable
    // ------------------------------------------------------------------

    /// Restart staging; called on every start and resume
    pub fn reset_heater_stage(&self, now_ms: u64) -> Result<()> {
        self.lock_heater()?.reset(now_ms);
        debug!("Heater soft-enable staging restarted");
        Ok(())
    }

    /// Promote heaters whose stage delay has elapsed
    pub fn apply_soft_enable(&self, now_ms: u64) -> Result<()> {
        let mut he = self.lock_heater()?;
        if now_ms.saturating_sub(he.t1) > cfg::SOFT_ENABLE_MS[0] {
            he.h1 = true;
        }
        if now_ms.saturating_sub(he.t2) > cfg::SOFT_ENABLE_MS[1] {
            he.h2 = true;
        }
        if now_ms.saturating_sub(he.t3) > cfg::SOFT_ENABLE_MS[2] {
            he.h3 = true;
        }
        Ok(())
    }

    /// All three heaters staged?
    pub fn are_heaters_ready(&self) -> Result<bool> {
        let he = self.lock_heater()?;
        Ok(he.h1 && he.h2 && he.h3)
    }

    // ------------------------------------------------------------------
    // Power application
    // ------------------------------------------------------------------

    /// Map the PID output across the heaters and write the PWM registers.
    /// Heaters that are not yet soft-enabled are forced to zero duty.
    pub fn apply_heater_power(&self, pid_output: f64, power_mode: u8) -> Result<()> {
        let (mut p1, mut p2, mut p3) = map_power_to_heaters(pid_output, power_mode);

        {
            let he = self.lock_heater()?;
            if !he.h1 {
                p1 = 0.0;
            }
            if !he.h2 {
                p2 = 0.0;
            }
            if !he.h3 {
                p3 = 0.0;
            }
        }

        let _guard = self.lock_output()?;
        self.shutting_down.store(false, Ordering::SeqCst);
        self.board
            .write_heater_duty(0, (p1 * cfg::DUTY_SCALE).round() as u8);
        self.board
            .write_heater_duty(1, (p2 * cfg::DUTY_SCALE).round() as u8);
        self.board
            .write_heater_duty(2, (p3 * cfg::DUTY_SCALE).round() as u8);
        Ok(())
    }

    /// Duty sum currently commanded, for the heating-time statistics
    pub fn heating_active(&self, pid_output: f64, power_mode: u8) -> bool {
        let (p1, p2, p3) = map_power_to_heaters(pid_output, power_mode);
        p1 + p2 + p3 > 0.0
    }

    // ------------------------------------------------------------------
    // Fans
    // ------------------------------------------------------------------

    /// Drive the circulation fan according to the active policy
    pub fn drive_fan(&self, mode: FanMode, on_ms: u64, off_ms: u64, now_ms: u64) -> Result<()> {
        let level = match mode {
            FanMode::Off => false,
            FanMode::On => true,
            FanMode::Cyclic => self.fan_cycle.lock().tick(on_ms, off_ms, now_ms),
        };
        let _guard = self.lock_output()?;
        self.board.set_fan(level);
        Ok(())
    }

    /// Restart the cyclic phase (on a fresh start or step advance)
    pub fn reset_fan_cycle(&self, now_ms: u64) {
        let mut cycle = self.fan_cycle.lock();
        cycle.on = true;
        cycle.phase_start_ms = now_ms;
    }

    pub fn set_smoke(&self, duty: u8) -> Result<()> {
        let _guard = self.lock_output()?;
        self.board.set_smoke_pwm(duty);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Buzzer
    // ------------------------------------------------------------------

    /// Start a beep pattern; ignored while one is already playing
    pub fn buzzer_beep(&self, count: u8, on_ms: u64, off_ms: u64, now_ms: u64) {
        let mut bz = self.buzzer.lock();
        if bz.active || count == 0 {
            return;
        }
        *bz = Buzzer {
            active: true,
            remaining: count,
            on_ms,
            off_ms,
            phase_on: true,
            phase_end_ms: now_ms + on_ms,
        };
        self.board.set_buzzer(true);
    }

    /// Advance the beep pattern; cheap no-op while idle
    pub fn buzzer_tick(&self, now_ms: u64) {
        let mut bz = self.buzzer.lock();
        if !bz.active || now_ms < bz.phase_end_ms {
            return;
        }
        if bz.phase_on {
            self.board.set_buzzer(false);
            bz.remaining -= 1;
            if bz.remaining > 0 {
                bz.phase_on = false;
                bz.phase_end_ms = now_ms + bz.off_ms;
            } else {
                bz.active = false;
            }
        } else {
            bz.phase_on = true;
            bz.phase_end_ms = now_ms + bz.on_ms;
            self.board.set_buzzer(true);
        }
    }

    pub fn buzzer_active(&self) -> bool {
        self.buzzer.lock().active
    }

    // ------------------------------------------------------------------
    // Safety shutdown
    // ------------------------------------------------------------------

    /// Turn off every heater channel, the fan and the smoke fan.
    ///
    /// Runs to completion even when the output mutex cannot be acquired:
    /// the failure is logged and the registers are written anyway.
    pub fn all_outputs_off(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let guard = self.output_lock.try_lock_for(locks::TIMEOUT);
        if guard.is_none() {
            error!("all_outputs_off: output mutex timed out, writing registers anyway");
        }
        for channel in 0..HEATER_CHANNELS {
            self.board.write_heater_duty(channel, 0);
        }
        self.board.set_fan(false);
        self.board.set_smoke_pwm(0);
    }
}
