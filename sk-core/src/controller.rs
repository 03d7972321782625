//! The owned controller record
//!
//! All shared mutable state lives in one `Controller` handed to each task
//! as an `Arc` handle. Interior mutability is confined to a small number of
//! lock-protected regions: the controller state, the output registers, the
//! heater staging (both inside [`Outputs`]) and the recursive SPI bus.
//!
//! Boundary tasks (web, local UI) never mutate state directly; they enqueue
//! [`Command`]s that the control task drains once per tick.

use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

use sk_error::{Result, SmokehouseError};
use sk_protocol::Command;

use crate::constants::locks;
use crate::data::types::ControllerState;
use crate::flash::{FlashFs, SpiBus};
use crate::hw::Board;
use crate::outputs::Outputs;
use crate::storage::Nvs;

/// Monotonic milliseconds since boot
#[derive(Debug, Clone, Copy)]
pub struct Uptime {
    start: Instant,
}

impl Uptime {
    pub fn new() -> Self {
        Uptime {
            start: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Uptime {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide shared state and peripherals
pub struct Controller {
    state: Mutex<ControllerState>,
    pub outputs: Outputs,
    pub board: Arc<dyn Board>,
    pub spi: Arc<SpiBus>,
    /// Absent when the chip failed to initialize; the controller then runs
    /// in manual mode only.
    pub flash: Option<Mutex<FlashFs>>,
    pub nvs: Mutex<Nvs>,
    commands: Mutex<VecDeque<Command>>,
    pub uptime: Uptime,
}

impl Controller {
    pub fn new(
        board: Arc<dyn Board>,
        spi: Arc<SpiBus>,
        flash: Option<FlashFs>,
        nvs: Nvs,
    ) -> Arc<Controller> {
        Arc::new(Controller {
            state: Mutex::new(ControllerState::default()),
            outputs: Outputs::new(board.clone()),
            board,
            spi,
            flash: flash.map(Mutex::new),
            nvs: Mutex::new(nvs),
            commands: Mutex::new(VecDeque::new()),
            uptime: Uptime::new(),
        })
    }

    /// Bounded-wait acquisition of the state mutex. Critical sections must
    /// stay short: copy the needed fields into locals and release.
    pub fn lock_state(&self) -> Result<MutexGuard<'_, ControllerState>> {
        self.state.try_lock_for(locks::TIMEOUT).ok_or_else(|| {
            error!("State mutex acquisition timed out");
            SmokehouseError::MutexTimeout {
                name: "state",
                waited_ms: locks::TIMEOUT.as_millis() as u64,
            }
        })
    }

    /// Enqueue a boundary command after validating it
    pub fn push_command(&self, command: Command) -> std::result::Result<(), String> {
        command.validate()?;
        self.commands.lock().push_back(command);
        Ok(())
    }

    /// Drain all pending commands (control task, once per tick)
    pub fn drain_commands(&self) -> Vec<Command> {
        self.commands.lock().drain(..).collect()
    }

    /// Flash availability decides whether auto mode can load profiles
    pub fn flash_available(&self) -> bool {
        self.flash.is_some()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::flash::{MemFlash, SpiFlash};
    use crate::hw::MockBoard;

    pub(crate) fn test_controller() -> Arc<Controller> {
        let board = Arc::new(MockBoard::new());
        let spi = Arc::new(SpiBus::new());
        let chip = Arc::new(MemFlash::new()) as Arc<dyn SpiFlash>;
        let fs = FlashFs::mount(chip, spi.clone()).unwrap();
        Controller::new(board, spi, Some(fs), Nvs::ephemeral())
    }

    #[test]
    fn test_command_queue_order_and_validation() {
        let ctl = test_controller();
        ctl.push_command(Command::StartAuto).unwrap();
        ctl.push_command(Command::SetManualSetpoint { celsius: 75.0 })
            .unwrap();
        assert!(ctl
            .push_command(Command::SetManualSetpoint { celsius: 500.0 })
            .is_err());

        let drained = ctl.drain_commands();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0], Command::StartAuto);
        assert!(ctl.drain_commands().is_empty());
    }

    #[test]
    fn test_state_lock_round_trip() {
        let ctl = test_controller();
        {
            let mut st = ctl.lock_state().unwrap();
            st.t_set = 85.0;
        }
        assert_eq!(ctl.lock_state().unwrap().t_set, 85.0);
    }
}
