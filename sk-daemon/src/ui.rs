//! Local four-button menu
//!
//! The UI task owns a small finite-state menu driven by Up/Down/Enter/Exit
//! with a 200 ms debounce. Rendering targets a text frame (a list of
//! lines); the actual LCD driver consumes that frame elsewhere and is not
//! part of this firmware's core. All actions go through the command queue.
//!
//! Holding Enter for five seconds on the idle screen wipes the stored web
//! credentials back to the compiled-in defaults.

use std::sync::Arc;
use tracing::{info, warn};

use sk_core::constants::ui as cfg;
use sk_core::{Button, Controller, FanMode, ProcessState};
use sk_protocol::Command;

const BUTTONS: [Button; 4] = [Button::Up, Button::Down, Button::Enter, Button::Exit];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MenuState {
    Idle,
    MainMenu,
    SourceMenu,
    ProfileList,
    EditManual,
    ConfirmAction,
    ConfirmNextStep,
    SystemSettings,
    WiFiSettings,
    Diagnostics,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingAction {
    StartAuto,
    StartManual,
    Stop,
}

const MAIN_ITEMS: [&str; 8] = [
    "Start auto",
    "Next step",
    "Stop",
    "Manual settings",
    "Select profile",
    "System",
    "WiFi",
    "Diagnostics",
];

const EDIT_FIELDS: [&str; 4] = ["Setpoint", "Power", "Smoke", "Fan"];

pub struct UiTask {
    pub menu: MenuState,
    selection: usize,
    edit_field: usize,
    pending: Option<PendingAction>,
    source_github: bool,
    profiles: Vec<String>,
    prev_level: [bool; 4],
    last_accept_ms: [u64; 4],
    enter_down_since: Option<u64>,
    auth_reset_done: bool,
    /// Rendered text frame for the display driver
    pub frame: Vec<String>,
}

impl UiTask {
    pub fn new() -> Self {
        UiTask {
            menu: MenuState::Idle,
            selection: 0,
            edit_field: 0,
            pending: None,
            source_github: false,
            profiles: Vec::new(),
            prev_level: [false; 4],
            last_accept_ms: [0; 4],
            enter_down_since: None,
            auth_reset_done: false,
            frame: Vec::new(),
        }
    }

    /// One UI iteration: buttons, transitions, render
    pub fn tick(&mut self, ctl: &Controller, now_ms: u64) {
        let mut events = Vec::new();
        let mut enter_released = false;
        for (index, button) in BUTTONS.iter().enumerate() {
            let level = ctl.board.button_pressed(*button);
            let edge = level && !self.prev_level[index];
            if *button == Button::Enter && !level && self.prev_level[index] {
                enter_released = true;
            }
            self.prev_level[index] = level;
            if edge && now_ms.saturating_sub(self.last_accept_ms[index]) >= cfg::DEBOUNCE_MS {
                self.last_accept_ms[index] = now_ms;
                events.push(*button);
            }
        }

        // On the idle screen Enter acts on release: a short press opens
        // the menu, a five-second hold wipes the web credentials instead.
        if self.menu == MenuState::Idle {
            if events.contains(&Button::Enter) {
                self.enter_down_since = Some(now_ms);
            }
            if self.prev_level[2] {
                if let Some(since) = self.enter_down_since {
                    if !self.auth_reset_done
                        && now_ms.saturating_sub(since) >= cfg::AUTH_RESET_HOLD_MS
                    {
                        self.auth_reset_done = true;
                        match ctl.nvs.lock().reset_auth() {
                            Ok(()) => {
                                info!("Web credentials reset to defaults via button hold");
                                ctl.outputs.buzzer_beep(2, 100, 100, now_ms);
                            }
                            Err(e) => warn!("Auth reset failed: {e}"),
                        }
                    }
                }
            }
            if enter_released {
                if self.enter_down_since.take().is_some() && !self.auth_reset_done {
                    self.menu = MenuState::MainMenu;
                    self.selection = 0;
                }
                self.auth_reset_done = false;
            }
        } else {
            self.enter_down_since = None;
            self.auth_reset_done = false;
        }

        for button in events {
            if self.menu == MenuState::Idle && button == Button::Enter {
                continue; // Handled by the release path above
            }
            self.handle(ctl, button, now_ms);
        }
        self.render(ctl, now_ms);
    }

    fn handle(&mut self, ctl: &Controller, button: Button, _now_ms: u64) {
        match self.menu {
            MenuState::Idle => {}
            MenuState::MainMenu => match button {
                Button::Up => self.selection = self.selection.saturating_sub(1),
                Button::Down => {
                    self.selection = (self.selection + 1).min(MAIN_ITEMS.len() - 1)
                }
                Button::Enter => self.open_main_item(ctl),
                Button::Exit => self.menu = MenuState::Idle,
            },
            MenuState::SourceMenu => match button {
                Button::Up | Button::Down => self.source_github = !self.source_github,
                Button::Enter => {
                    self.profiles = if self.source_github {
                        // Remote enumeration belongs to the web path; the
                        // local list stays empty without a client.
                        Vec::new()
                    } else {
                        ctl.flash
                            .as_ref()
                            .and_then(|f| f.try_lock())
                            .map(|fs| fs.list("/profiles/").into_iter().map(|e| e.name).collect())
                            .unwrap_or_default()
                    };
                    self.selection = 0;
                    self.menu = MenuState::ProfileList;
                }
                Button::Exit => self.menu = MenuState::MainMenu,
            },
            MenuState::ProfileList => match button {
                Button::Up => self.selection = self.selection.saturating_sub(1),
                Button::Down => {
                    if !self.profiles.is_empty() {
                        self.selection = (self.selection + 1).min(self.profiles.len() - 1)
                    }
                }
                Button::Enter => {
                    if let Some(path) = self.profiles.get(self.selection) {
                        let _ = ctl.push_command(Command::SelectProfile { path: path.clone() });
                        self.menu = MenuState::MainMenu;
                    }
                }
                Button::Exit => self.menu = MenuState::SourceMenu,
            },
            MenuState::EditManual => match button {
                Button::Enter => self.edit_field = (self.edit_field + 1) % EDIT_FIELDS.len(),
                Button::Up => self.adjust_manual(ctl, 1),
                Button::Down => self.adjust_manual(ctl, -1),
                Button::Exit => self.menu = MenuState::MainMenu,
            },
            MenuState::ConfirmAction => match button {
                Button::Enter => {
                    match self.pending.take() {
                        Some(PendingAction::StartAuto) => {
                            let _ = ctl.push_command(Command::StartAuto);
                        }
                        Some(PendingAction::StartManual) => {
                            let _ = ctl.push_command(Command::StartManual);
                        }
                        Some(PendingAction::Stop) => {
                            let _ = ctl.push_command(Command::Stop);
                        }
                        None => {}
                    }
                    self.menu = MenuState::Idle;
                }
                Button::Exit => {
                    self.pending = None;
                    self.menu = MenuState::MainMenu;
                }
                _ => {}
            },
            MenuState::ConfirmNextStep => match button {
                Button::Enter => {
                    let _ = ctl.push_command(Command::NextStep);
                    self.menu = MenuState::Idle;
                }
                Button::Exit => self.menu = MenuState::MainMenu,
                _ => {}
            },
            MenuState::SystemSettings => match button {
                Button::Enter => match sk_core::backup_config(ctl) {
                    Ok(path) => info!("Configuration backed up to {path}"),
                    Err(e) => warn!("Backup failed: {e}"),
                },
                Button::Exit => self.menu = MenuState::MainMenu,
                _ => {}
            },
            MenuState::WiFiSettings | MenuState::Diagnostics => {
                if button == Button::Exit {
                    self.menu = MenuState::MainMenu;
                }
            }
        }
    }

    fn open_main_item(&mut self, _ctl: &Controller) {
        match self.selection {
            0 => {
                self.pending = Some(PendingAction::StartAuto);
                self.menu = MenuState::ConfirmAction;
            }
            1 => self.menu = MenuState::ConfirmNextStep,
            2 => {
                self.pending = Some(PendingAction::Stop);
                self.menu = MenuState::ConfirmAction;
            }
            3 => {
                self.edit_field = 0;
                self.menu = MenuState::EditManual;
            }
            4 => self.menu = MenuState::SourceMenu,
            5 => self.menu = MenuState::SystemSettings,
            6 => self.menu = MenuState::WiFiSettings,
            _ => self.menu = MenuState::Diagnostics,
        }
    }

    /// Nudge the selected manual field and enqueue the matching command
    fn adjust_manual(&mut self, ctl: &Controller, direction: i32) {
        let Ok(st) = ctl.lock_state() else { return };
        let (t_set, power, smoke, fan_mode, on_ms, off_ms) = (
            st.t_set,
            st.power_mode,
            st.manual_smoke_pwm,
            st.fan_mode,
            st.fan_on_time_ms,
            st.fan_off_time_ms,
        );
        drop(st);

        let delta = direction as f64;
        let command = match self.edit_field {
            0 => Command::SetManualSetpoint {
                celsius: (t_set + delta).clamp(20.0, 120.0),
            },
            1 => Command::SetManualPower {
                mode: (power as i32 + direction).clamp(1, 3) as u8,
            },
            2 => Command::SetManualSmoke {
                pwm: (smoke as i32 + direction * 16).clamp(0, 255) as u8,
            },
            _ => Command::SetManualFan {
                mode: ((fan_mode as u8 as i32 + direction).rem_euclid(3)) as u8,
                on_ms,
                off_ms,
            },
        };
        let _ = ctl.push_command(command);
    }

    fn render(&mut self, ctl: &Controller, now_ms: u64) {
        self.frame.clear();
        match self.menu {
            MenuState::Idle => {
                if let Ok(st) = ctl.lock_state() {
                    self.frame.push(format!(
                        "{:>5.1}C / {:>5.1}C",
                        st.t_chamber, st.t_set
                    ));
                    self.frame.push(format!("meat {:>5.1}C", st.t_meat));
                    self.frame.push(st.current_state.name().to_string());
                    if st.current_state == ProcessState::RunningAuto {
                        if let Some(step) = st.current_step_ref() {
                            self.frame.push(format!(
                                "step {}/{} {}",
                                st.current_step + 1,
                                st.step_count(),
                                step.name
                            ));
                        }
                    }
                }
            }
            MenuState::MainMenu => {
                for (index, item) in MAIN_ITEMS.iter().enumerate() {
                    let marker = if index == self.selection { ">" } else { " " };
                    self.frame.push(format!("{marker}{item}"));
                }
            }
            MenuState::SourceMenu => {
                self.frame.push("Profile source:".into());
                self.frame.push(format!(
                    "{} Local   {} GitHub",
                    if self.source_github { " " } else { ">" },
                    if self.source_github { ">" } else { " " },
                ));
            }
            MenuState::ProfileList => {
                if self.profiles.is_empty() {
                    self.frame.push("(no profiles)".into());
                }
                for (index, name) in self.profiles.iter().enumerate() {
                    let marker = if index == self.selection { ">" } else { " " };
                    self.frame.push(format!("{marker}{name}"));
                }
            }
            MenuState::EditManual => {
                if let Ok(st) = ctl.lock_state() {
                    let values = [
                        format!("{:.0}C", st.t_set),
                        format!("{}", st.power_mode),
                        format!("{}", st.manual_smoke_pwm),
                        match st.fan_mode {
                            FanMode::Off => "Off".to_string(),
                            FanMode::On => "On".to_string(),
                            FanMode::Cyclic => "Cyclic".to_string(),
                        },
                    ];
                    for (index, (field, value)) in
                        EDIT_FIELDS.iter().zip(values.iter()).enumerate()
                    {
                        let marker = if index == self.edit_field { ">" } else { " " };
                        self.frame.push(format!("{marker}{field}: {value}"));
                    }
                }
            }
            MenuState::ConfirmAction => {
                let label = match self.pending {
                    Some(PendingAction::StartAuto) => "start auto?",
                    Some(PendingAction::StartManual) => "start manual?",
                    Some(PendingAction::Stop) => "stop process?",
                    None => "?",
                };
                self.frame.push(format!("Confirm: {label}"));
                self.frame.push("Enter=yes Exit=no".into());
            }
            MenuState::ConfirmNextStep => {
                self.frame.push("Force next step?".into());
                self.frame.push("Enter=yes Exit=no".into());
            }
            MenuState::SystemSettings => {
                self.frame.push("System".into());
                if let Some(flash) = &ctl.flash {
                    if let Some(fs) = flash.try_lock() {
                        let info = fs.info();
                        self.frame.push(format!("files: {}", info.live_entries));
                        self.frame
                            .push(format!("free prof sectors: {}", info.profile_sectors_free));
                    }
                } else {
                    self.frame.push("flash: UNAVAILABLE".into());
                }
                self.frame.push("Enter=backup cfg".into());
            }
            MenuState::WiFiSettings => {
                let ssid = ctl
                    .nvs
                    .lock()
                    .data
                    .wifi_ssid
                    .clone()
                    .unwrap_or_else(|| "(unset)".into());
                self.frame.push(format!("SSID: {ssid}"));
                self.frame.push("configure via web".into());
            }
            MenuState::Diagnostics => {
                if let Ok(st) = ctl.lock_state() {
                    self.frame.push(format!(
                        "err s:{} o:{} p:{}",
                        st.error_sensor as u8, st.error_overheat as u8, st.error_profile as u8
                    ));
                    self.frame.push(format!(
                        "fan eff {}s/{}s",
                        st.fan_on_effective_ms / 1000,
                        st.fan_off_effective_ms / 1000
                    ));
                    self.frame
                        .push(format!("pauses: {}", st.stats.pause_count));
                }
                self.frame.push(format!("up {}s", now_ms / 1000));
            }
        }
    }
}

impl Default for UiTask {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sk_core::{FlashFs, MemFlash, MockBoard, Nvs, SpiBus, SpiFlash};

    fn setup() -> (Arc<Controller>, Arc<MockBoard>, UiTask) {
        let board = Arc::new(MockBoard::new());
        let spi = Arc::new(SpiBus::new());
        let chip = Arc::new(MemFlash::new()) as Arc<dyn SpiFlash>;
        let fs = FlashFs::mount(chip, spi.clone()).unwrap();
        let ctl = Controller::new(board.clone(), spi, Some(fs), Nvs::ephemeral());
        (ctl, board, UiTask::new())
    }

    /// Press and release one button across two ticks
    fn click(ui: &mut UiTask, ctl: &Controller, board: &MockBoard, button: Button, t: u64) -> u64 {
        board.press(button);
        ui.tick(ctl, t);
        board.release_all();
        ui.tick(ctl, t + 50);
        t + 50
    }

    #[test]
    fn test_enter_opens_main_menu() {
        let (ctl, board, mut ui) = setup();
        assert_eq!(ui.menu, MenuState::Idle);
        click(&mut ui, &ctl, &board, Button::Enter, 1000);
        assert_eq!(ui.menu, MenuState::MainMenu);
    }

    #[test]
    fn test_debounce_rejects_fast_repeats() {
        let (ctl, board, mut ui) = setup();
        click(&mut ui, &ctl, &board, Button::Enter, 1000);
        assert_eq!(ui.menu, MenuState::MainMenu);
        // Re-press 100 ms after the accepted edge: ignored
        board.press(Button::Down);
        ui.tick(&ctl, 1100);
        board.release_all();
        ui.tick(&ctl, 1120);
        board.press(Button::Down);
        ui.tick(&ctl, 1150);
        board.release_all();
        // Only the first Down moved the selection... which was also inside
        // the Enter debounce window but Down has its own timer.
        // The second Down at 1150 is within 200 ms of 1100 and is dropped.
        ui.tick(&ctl, 1400);
        assert_eq!(ui.selection, 1);
    }

    #[test]
    fn test_navigation_to_confirm_and_start() {
        let (ctl, board, mut ui) = setup();
        let t = click(&mut ui, &ctl, &board, Button::Enter, 1000);
        // Selection 0 = Start auto
        let t = click(&mut ui, &ctl, &board, Button::Enter, t + 300);
        assert_eq!(ui.menu, MenuState::ConfirmAction);
        click(&mut ui, &ctl, &board, Button::Enter, t + 300);
        assert_eq!(ui.menu, MenuState::Idle);
        assert_eq!(ctl.drain_commands(), vec![Command::StartAuto]);
    }

    #[test]
    fn test_confirm_can_be_cancelled() {
        let (ctl, board, mut ui) = setup();
        let t = click(&mut ui, &ctl, &board, Button::Enter, 1000);
        let t = click(&mut ui, &ctl, &board, Button::Enter, t + 300);
        click(&mut ui, &ctl, &board, Button::Exit, t + 300);
        assert_eq!(ui.menu, MenuState::MainMenu);
        assert!(ctl.drain_commands().is_empty());
    }

    #[test]
    fn test_profile_selection_flow() {
        let (ctl, board, mut ui) = setup();
        ctl.flash
            .as_ref()
            .unwrap()
            .lock()
            .file_write("/profiles/kabanosy.txt", b"A;70;0;10;1;0;0;10;60;0\n")
            .unwrap();

        let mut t = click(&mut ui, &ctl, &board, Button::Enter, 1000);
        // Move to "Select profile" (index 4)
        for _ in 0..4 {
            t = click(&mut ui, &ctl, &board, Button::Down, t + 300);
        }
        t = click(&mut ui, &ctl, &board, Button::Enter, t + 300);
        assert_eq!(ui.menu, MenuState::SourceMenu);
        t = click(&mut ui, &ctl, &board, Button::Enter, t + 300);
        assert_eq!(ui.menu, MenuState::ProfileList);
        click(&mut ui, &ctl, &board, Button::Enter, t + 300);
        assert_eq!(
            ctl.drain_commands(),
            vec![Command::SelectProfile {
                path: "/profiles/kabanosy.txt".into()
            }]
        );
    }

    #[test]
    fn test_edit_manual_pushes_commands() {
        let (ctl, board, mut ui) = setup();
        let mut t = click(&mut ui, &ctl, &board, Button::Enter, 1000);
        for _ in 0..3 {
            t = click(&mut ui, &ctl, &board, Button::Down, t + 300);
        }
        t = click(&mut ui, &ctl, &board, Button::Enter, t + 300);
        assert_eq!(ui.menu, MenuState::EditManual);
        click(&mut ui, &ctl, &board, Button::Up, t + 300);
        let drained = ctl.drain_commands();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0], Command::SetManualSetpoint { celsius: 71.0 });
    }

    #[test]
    fn test_auth_reset_hold() {
        let (ctl, board, mut ui) = setup();
        {
            let mut nvs = ctl.nvs.lock();
            nvs.data.auth_user = Some("custom".into());
            nvs.data.auth_pass = Some("secret".into());
        }

        // Hold Enter on the idle screen across the five-second threshold
        board.press(Button::Enter);
        for t in (1000..8000).step_by(100) {
            ui.tick(&ctl, t);
        }
        // Credentials back to defaults, still on the idle screen
        assert_eq!(ui.menu, MenuState::Idle);
        assert_eq!(
            ctl.nvs.lock().auth(),
            (
                sk_core::constants::web::DEFAULT_USER.to_string(),
                sk_core::constants::web::DEFAULT_PASS.to_string()
            )
        );

        // Releasing after the hold does not open the menu
        board.release_all();
        ui.tick(&ctl, 8100);
        assert_eq!(ui.menu, MenuState::Idle);

        // A subsequent short press does
        click(&mut ui, &ctl, &board, Button::Enter, 9000);
        assert_eq!(ui.menu, MenuState::MainMenu);
    }
}
