//! Task scheduler and watchdog supervision
//!
//! Six long-running tasks share the controller record: Control, Sensors
//! and UI form the compute-critical path (one core on the target board),
//! Web, WiFi and Monitor the network path (the other core). Each task
//! updates a per-task liveness timestamp every loop; Monitor inspects all
//! of them and a stalled Control task forces outputs off and Idle.
//!
//! The hardware watchdog is modeled faithfully: registered tasks must pet
//! it every loop or the firmware reboots. The Web task is deliberately
//! NOT registered - a long synchronous firmware upload may block it for
//! many seconds, and a reset mid-upload would brick the update. The
//! upload handler widens the timeout and pets the watchdog per chunk
//! instead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use sk_core::constants::tasks as cfg;
use sk_core::{
    ControlRuntime, Controller, ProcessState, RemoteProfiles, SensorEngine,
};

use crate::ui::UiTask;
use crate::wifi::WifiLink;

/// Task identifiers, indexing the watchdog tables
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum TaskId {
    Control = 0,
    Sensors = 1,
    Ui = 2,
    Web = 3,
    Wifi = 4,
    Monitor = 5,
}

pub const TASK_COUNT: usize = 6;

pub const TASK_NAMES: [&str; TASK_COUNT] = ["Control", "Sensors", "UI", "Web", "WiFi", "Monitor"];

/// Software (liveness) and hardware watchdog state
pub struct Watchdogs {
    soft_last: [AtomicU64; TASK_COUNT],
    soft_flagged: [AtomicBool; TASK_COUNT],
    hw_registered: [AtomicBool; TASK_COUNT],
    hw_last_pet: [AtomicU64; TASK_COUNT],
    hw_timeout_ms: AtomicU64,
}

impl Watchdogs {
    pub fn new() -> Arc<Watchdogs> {
        Arc::new(Watchdogs {
            soft_last: std::array::from_fn(|_| AtomicU64::new(0)),
            soft_flagged: std::array::from_fn(|_| AtomicBool::new(false)),
            hw_registered: std::array::from_fn(|_| AtomicBool::new(false)),
            hw_last_pet: std::array::from_fn(|_| AtomicU64::new(0)),
            hw_timeout_ms: AtomicU64::new(cfg::HW_WDT_TIMEOUT_MS),
        })
    }

    /// Register a task with the hardware watchdog
    pub fn hw_register(&self, task: TaskId, now_ms: u64) {
        self.hw_registered[task as usize].store(true, Ordering::SeqCst);
        self.hw_last_pet[task as usize].store(now_ms, Ordering::SeqCst);
    }

    pub fn hw_pet(&self, task: TaskId, now_ms: u64) {
        self.hw_last_pet[task as usize].store(now_ms, Ordering::SeqCst);
    }

    /// Returns the first registered task that missed the hardware timeout
    pub fn hw_check(&self, now_ms: u64) -> Option<TaskId> {
        let timeout = self.hw_timeout_ms.load(Ordering::SeqCst);
        for index in 0..TASK_COUNT {
            if !self.hw_registered[index].load(Ordering::SeqCst) {
                continue;
            }
            let last = self.hw_last_pet[index].load(Ordering::SeqCst);
            if now_ms.saturating_sub(last) > timeout {
                return Some(task_from_index(index));
            }
        }
        None
    }

    /// Widen the hardware timeout for a firmware upload
    pub fn hw_widen(&self, timeout_ms: u64) {
        self.hw_timeout_ms.store(timeout_ms, Ordering::SeqCst);
        info!("Hardware watchdog widened to {timeout_ms} ms");
    }

    pub fn hw_restore(&self) {
        self.hw_timeout_ms
            .store(cfg::HW_WDT_TIMEOUT_MS, Ordering::SeqCst);
        info!("Hardware watchdog timeout restored");
    }

    /// Per-loop liveness update
    pub fn touch(&self, task: TaskId, now_ms: u64) {
        self.soft_last[task as usize].store(now_ms, Ordering::SeqCst);
    }

    /// Liveness age of one task
    pub fn soft_age(&self, task: TaskId, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.soft_last[task as usize].load(Ordering::SeqCst))
    }

    /// Check one task's liveness; returns true on a fresh stall
    pub fn soft_check(&self, task: TaskId, now_ms: u64) -> bool {
        let stale = self.soft_age(task, now_ms) > cfg::TASK_WDT_TIMEOUT_MS;
        let flagged = &self.soft_flagged[task as usize];
        if stale {
            if !flagged.swap(true, Ordering::SeqCst) {
                error!("{} task liveness timeout detected!", TASK_NAMES[task as usize]);
                return true;
            }
        } else {
            flagged.store(false, Ordering::SeqCst);
        }
        false
    }

    pub fn is_flagged(&self, task: TaskId) -> bool {
        self.soft_flagged[task as usize].load(Ordering::SeqCst)
    }

    /// Human-readable report for the diagnostics screen/endpoint
    pub fn status_report(&self, now_ms: u64) -> String {
        let mut out = String::from("Task watchdogs:\n");
        for index in 0..TASK_COUNT {
            let task = task_from_index(index);
            out.push_str(&format!(
                "{}: {} (age: {} ms)\n",
                TASK_NAMES[index],
                if self.is_flagged(task) { "TIMEOUT" } else { "OK" },
                self.soft_age(task, now_ms),
            ));
        }
        out
    }
}

fn task_from_index(index: usize) -> TaskId {
    match index {
        0 => TaskId::Control,
        1 => TaskId::Sensors,
        2 => TaskId::Ui,
        3 => TaskId::Web,
        4 => TaskId::Wifi,
        _ => TaskId::Monitor,
    }
}

/// A hardware-watchdog trip is fatal: the real chip reboots, the host
/// process exits with a distinctive status.
fn hw_watchdog_trip(task: TaskId) -> ! {
    error!(
        "HARDWARE WATCHDOG: {} task missed its deadline, rebooting",
        TASK_NAMES[task as usize]
    );
    std::process::exit(86);
}

/// Spawn every task thread. Returns the join handles in task order.
pub fn spawn_all(
    ctl: Arc<Controller>,
    wdt: Arc<Watchdogs>,
    remote: Arc<dyn RemoteProfiles>,
    listen_addr: String,
    shutdown: Arc<AtomicBool>,
) -> Vec<thread::JoinHandle<()>> {
    let mut handles = Vec::new();

    // Hardware watchdog checker (stands in for the chip's WDT peripheral)
    {
        let ctl = ctl.clone();
        let wdt = wdt.clone();
        let shutdown = shutdown.clone();
        handles.push(
            thread::Builder::new()
                .name("hw-wdt".into())
                .spawn(move || {
                    while !shutdown.load(Ordering::SeqCst) {
                        if let Some(task) = wdt.hw_check(ctl.uptime.now_ms()) {
                            ctl.outputs.all_outputs_off();
                            hw_watchdog_trip(task);
                        }
                        thread::sleep(Duration::from_millis(1000));
                    }
                })
                .expect("spawn hw-wdt"),
        );
    }

    // Core 1: compute-critical path
    {
        let ctl = ctl.clone();
        let wdt = wdt.clone();
        let shutdown = shutdown.clone();
        let remote = remote.clone();
        handles.push(
            thread::Builder::new()
                .name("Control".into())
                .spawn(move || control_task(ctl, wdt, remote, shutdown))
                .expect("spawn Control"),
        );
    }
    {
        let ctl = ctl.clone();
        let wdt = wdt.clone();
        let shutdown = shutdown.clone();
        handles.push(
            thread::Builder::new()
                .name("Sensors".into())
                .spawn(move || sensors_task(ctl, wdt, shutdown))
                .expect("spawn Sensors"),
        );
    }
    {
        let ctl = ctl.clone();
        let wdt = wdt.clone();
        let shutdown = shutdown.clone();
        handles.push(
            thread::Builder::new()
                .name("UI".into())
                .spawn(move || ui_task(ctl, wdt, shutdown))
                .expect("spawn UI"),
        );
    }

    // Core 0: network and monitoring
    {
        let ctl = ctl.clone();
        let wdt = wdt.clone();
        let shutdown = shutdown.clone();
        let remote = remote.clone();
        handles.push(
            thread::Builder::new()
                .name("Web".into())
                .spawn(move || crate::web::web_task(ctl, wdt, remote, listen_addr, shutdown))
                .expect("spawn Web"),
        );
    }
    {
        let ctl = ctl.clone();
        let wdt = wdt.clone();
        let shutdown = shutdown.clone();
        handles.push(
            thread::Builder::new()
                .name("WiFi".into())
                .spawn(move || wifi_task(ctl, wdt, shutdown))
                .expect("spawn WiFi"),
        );
    }
    {
        let ctl = ctl.clone();
        let wdt = wdt.clone();
        let shutdown = shutdown.clone();
        handles.push(
            thread::Builder::new()
                .name("Monitor".into())
                .spawn(move || monitor_task(ctl, wdt, shutdown))
                .expect("spawn Monitor"),
        );
    }

    info!("All tasks created");
    handles
}

fn control_task(
    ctl: Arc<Controller>,
    wdt: Arc<Watchdogs>,
    remote: Arc<dyn RemoteProfiles>,
    shutdown: Arc<AtomicBool>,
) {
    let mut rt = ControlRuntime::new(remote);
    wdt.hw_register(TaskId::Control, ctl.uptime.now_ms());
    info!("Control task started");
    let mut last_pid_log: u64 = 0;
    while !shutdown.load(Ordering::SeqCst) {
        let now = ctl.uptime.now_ms();
        wdt.hw_pet(TaskId::Control, now);
        wdt.touch(TaskId::Control, now);
        sk_core::control_tick(&ctl, &mut rt, now);
        if now.saturating_sub(last_pid_log) > 300_000 {
            last_pid_log = now;
            tracing::debug!("PID: {}", rt.pid_parameters());
        }
        thread::sleep(Duration::from_millis(cfg::CONTROL_PERIOD_MS));
    }
    ctl.outputs.all_outputs_off();
    info!("Control task stopped");
}

fn sensors_task(ctl: Arc<Controller>, wdt: Arc<Watchdogs>, shutdown: Arc<AtomicBool>) {
    let mut engine = SensorEngine::new();
    wdt.hw_register(TaskId::Sensors, ctl.uptime.now_ms());
    info!("Sensors task started");
    let mut last_diag_log: u64 = 0;
    while !shutdown.load(Ordering::SeqCst) {
        let now = ctl.uptime.now_ms();
        wdt.hw_pet(TaskId::Sensors, now);
        wdt.touch(TaskId::Sensors, now);
        engine.tick(&ctl, now);
        if now.saturating_sub(last_diag_log) > 60_000 {
            last_diag_log = now;
            tracing::debug!("Sensors: {}", engine.diagnostics(now));
        }
        thread::sleep(Duration::from_millis(cfg::SENSORS_PERIOD_MS));
    }
    info!("Sensors task stopped");
}

fn ui_task(ctl: Arc<Controller>, wdt: Arc<Watchdogs>, shutdown: Arc<AtomicBool>) {
    let mut ui = UiTask::new();
    wdt.hw_register(TaskId::Ui, ctl.uptime.now_ms());
    info!("UI task started");
    while !shutdown.load(Ordering::SeqCst) {
        let now = ctl.uptime.now_ms();
        wdt.hw_pet(TaskId::Ui, now);
        wdt.touch(TaskId::Ui, now);
        ui.tick(&ctl, now);
        ctl.outputs.buzzer_tick(now);
        thread::sleep(Duration::from_millis(cfg::UI_PERIOD_MS));
    }
    info!("UI task stopped");
}

fn wifi_task(ctl: Arc<Controller>, wdt: Arc<Watchdogs>, shutdown: Arc<AtomicBool>) {
    let mut link = WifiLink::new();
    wdt.hw_register(TaskId::Wifi, ctl.uptime.now_ms());
    info!("WiFi task started");
    while !shutdown.load(Ordering::SeqCst) {
        let now = ctl.uptime.now_ms();
        wdt.hw_pet(TaskId::Wifi, now);
        wdt.touch(TaskId::Wifi, now);
        link.maintain(&ctl, now);
        thread::sleep(Duration::from_millis(cfg::WIFI_PERIOD_MS));
    }
    info!("WiFi task stopped");
}

fn monitor_task(ctl: Arc<Controller>, wdt: Arc<Watchdogs>, shutdown: Arc<AtomicBool>) {
    wdt.hw_register(TaskId::Monitor, ctl.uptime.now_ms());
    info!("Monitor task started");
    let mut last_stats_log: u64 = 0;
    let mut last_wdt_check: u64 = 0;
    while !shutdown.load(Ordering::SeqCst) {
        let now = ctl.uptime.now_ms();
        wdt.hw_pet(TaskId::Monitor, now);
        wdt.touch(TaskId::Monitor, now);

        if now.saturating_sub(last_wdt_check) > 10_000 {
            last_wdt_check = now;
            for index in 0..TASK_COUNT {
                let task = task_from_index(index);
                if wdt.soft_check(task, now) && task == TaskId::Control {
                    // A hung control task must not leave heat on
                    error!("Control task hung: forcing outputs off and Idle");
                    ctl.outputs.all_outputs_off();
                    if let Ok(mut st) = ctl.lock_state() {
                        st.current_state = ProcessState::Idle;
                    }
                    ctl.outputs.buzzer_beep(2, 100, 100, now);
                }
            }
        }

        if now.saturating_sub(last_stats_log) > 300_000 {
            last_stats_log = now;
            log_run_stats(&ctl);
        }

        thread::sleep(Duration::from_millis(cfg::MONITOR_PERIOD_MS));
    }
    info!("Monitor task stopped");
}

fn log_run_stats(ctl: &Controller) {
    let Ok(st) = ctl.lock_state() else { return };
    let stats = st.stats;
    drop(st);
    if stats.total_runtime_ms == 0 {
        return;
    }
    let hours = stats.total_runtime_ms / 3_600_000;
    let minutes = (stats.total_runtime_ms % 3_600_000) / 60_000;
    let heat_percent = stats.active_heating_ms * 100 / stats.total_runtime_ms;
    info!("[STATS] Runtime: {hours}h {minutes}m");
    info!(
        "[STATS] Heating: {heat_percent}%, Avg: {:.1} C",
        stats.avg_temp
    );
    info!(
        "[STATS] Steps: {}, Pauses: {}",
        stats.step_changes, stats.pause_count
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hw_watchdog_flags_missed_pet() {
        let wdt = Watchdogs::new();
        wdt.hw_register(TaskId::Control, 0);
        wdt.hw_register(TaskId::Sensors, 0);
        assert_eq!(wdt.hw_check(5000), None);
        wdt.hw_pet(TaskId::Control, 9000);
        // Sensors last pet at 0; 10 s timeout exceeded at 10_001
        assert_eq!(wdt.hw_check(10_001), Some(TaskId::Sensors));
    }

    #[test]
    fn test_web_task_is_not_a_hw_client() {
        let wdt = Watchdogs::new();
        wdt.hw_register(TaskId::Control, 0);
        // Web never registers; its silence can never trip the watchdog
        wdt.hw_pet(TaskId::Control, 50_000);
        assert_eq!(wdt.hw_check(50_000), None);
    }

    #[test]
    fn test_hw_widen_and_restore() {
        let wdt = Watchdogs::new();
        wdt.hw_register(TaskId::Control, 0);
        wdt.hw_widen(cfg::HW_WDT_UPLOAD_TIMEOUT_MS);
        assert_eq!(wdt.hw_check(30_000), None);
        wdt.hw_restore();
        assert_eq!(wdt.hw_check(30_000), Some(TaskId::Control));
    }

    #[test]
    fn test_soft_check_reports_once_per_stall() {
        let wdt = Watchdogs::new();
        wdt.touch(TaskId::Sensors, 0);
        assert!(!wdt.soft_check(TaskId::Sensors, 1000));
        // First stale detection reports
        assert!(wdt.soft_check(TaskId::Sensors, cfg::TASK_WDT_TIMEOUT_MS + 1));
        // Repeated checks stay flagged but do not re-report
        assert!(!wdt.soft_check(TaskId::Sensors, cfg::TASK_WDT_TIMEOUT_MS + 2000));
        assert!(wdt.is_flagged(TaskId::Sensors));
        // Recovery clears the flag
        wdt.touch(TaskId::Sensors, cfg::TASK_WDT_TIMEOUT_MS + 3000);
        assert!(!wdt.soft_check(TaskId::Sensors, cfg::TASK_WDT_TIMEOUT_MS + 3500));
        assert!(!wdt.is_flagged(TaskId::Sensors));
    }

    #[test]
    fn test_status_report_names_all_tasks() {
        let wdt = Watchdogs::new();
        let report = wdt.status_report(0);
        for name in TASK_NAMES {
            assert!(report.contains(name));
        }
    }
}
