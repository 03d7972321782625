//! Process controller: the 100 ms control tick and the lifecycle state
//! machine
//!
//! Each tick copies what it needs out of the state mutex, releases it, and
//! then computes: PID with adaptive gains, heater soft-enable and power
//! mapping, the step sequencer, the trend-predicted fan policy and the
//! heater-efficiency supervisor. Dangerous conditions call
//! `all_outputs_off` before anything else.

use std::sync::Arc;
use tracing::{info, warn};

use sk_error::Result;
use sk_protocol::Command;

use crate::constants::{fan as fan_cfg, process as cfg, stats as stats_cfg};
use crate::controller::Controller;
use crate::data::types::{ControllerState, FanMode, ProcessState, ProcessStats, RunMode};
use crate::engine::{AdaptivePid, FanTrend, FaultVerdict, HeaterFaultMonitor, Pid};
use crate::storage::{self, RemoteProfiles};

/// Per-run engine state owned by the control task
pub struct ControlRuntime {
    pub pid: Pid,
    pub adaptive: AdaptivePid,
    pub trend: FanTrend,
    pub fault: HeaterFaultMonitor,
    remote: Arc<dyn RemoteProfiles>,
}

impl ControlRuntime {
    pub fn new(remote: Arc<dyn RemoteProfiles>) -> Self {
        ControlRuntime {
            pid: Pid::new(
                crate::constants::pid::KP,
                crate::constants::pid::KI,
                crate::constants::pid::KD,
                cfg::CONTROL_TICK_MS,
            ),
            adaptive: AdaptivePid::new(),
            trend: FanTrend::new(),
            fault: HeaterFaultMonitor::new(),
            remote,
        }
    }

    /// Diagnostic gain report
    pub fn pid_parameters(&self) -> String {
        self.adaptive.parameters(&self.pid)
    }

    pub fn reset_adaptive_pid(&mut self) {
        self.adaptive.reset(&mut self.pid);
    }
}

/// Fields the tick copies out of one state critical section
struct TickView {
    state: ProcessState,
    last_run_mode: RunMode,
    t_chamber: f64,
    t_meat: f64,
    t_set: f64,
    power_mode: u8,
    smoke_pwm: u8,
    fan_mode: FanMode,
    fan_on_ms: u64,
    fan_off_ms: u64,
    process_start_ms: u64,
    door_open: bool,
}

fn view(st: &ControllerState) -> TickView {
    TickView {
        state: st.current_state,
        last_run_mode: st.last_run_mode,
        t_chamber: st.t_chamber,
        t_meat: st.t_meat,
        t_set: st.t_set,
        power_mode: st.power_mode,
        smoke_pwm: st.manual_smoke_pwm,
        fan_mode: st.fan_mode,
        fan_on_ms: st.fan_on_time_ms,
        fan_off_ms: st.fan_off_time_ms,
        process_start_ms: st.process_start_ms,
        door_open: st.door_open,
    }
}

/// One control-task iteration
pub fn control_tick(ctl: &Controller, rt: &mut ControlRuntime, now_ms: u64) {
    for command in ctl.drain_commands() {
        if let Err(e) = handle_command(ctl, rt, &command, now_ms) {
            warn!("Command {} failed: {e}", command.type_name());
        }
    }

    let v = match ctl.lock_state() {
        Ok(st) => view(&st),
        Err(_) => return, // Timed out: skip this tick, mutate nothing
    };

    // Hard cap on run length
    if (v.state.is_running() || v.state == ProcessState::SoftResume)
        && now_ms.saturating_sub(v.process_start_ms) > cfg::MAX_PROCESS_TIME_MS
    {
        warn!("Process exceeded the 24 h cap, pausing");
        enter_pause(ctl, ProcessState::PauseUser, false);
        ctl.outputs.all_outputs_off();
        ctl.outputs.buzzer_beep(1, 500, 0, now_ms);
        return;
    }

    match v.state {
        ProcessState::RunningAuto => {
            rt.pid.setpoint = v.t_set;
            rt.adaptive.adapt(&mut rt.pid, v.t_set - v.t_chamber, now_ms);
            let out = rt.pid.compute(v.t_chamber, now_ms);
            let _ = ctl.outputs.apply_soft_enable(now_ms);
            let _ = ctl.outputs.apply_heater_power(out, v.power_mode);
            let _ = ctl.outputs.set_smoke(v.smoke_pwm);
            run_fan_policy(ctl, rt, &v, now_ms);
            handle_auto_sequencer(ctl, rt, now_ms);
            update_stats(ctl, out, &v, now_ms);
            supervise_heaters(ctl, rt, &v, out, now_ms);
        }
        ProcessState::RunningManual => {
            rt.pid.setpoint = v.t_set;
            let out = rt.pid.compute(v.t_chamber, now_ms);
            let _ = ctl.outputs.apply_soft_enable(now_ms);
            let _ = ctl.outputs.apply_heater_power(out, v.power_mode);
            let _ = ctl.outputs.set_smoke(v.smoke_pwm);
            run_fan_policy(ctl, rt, &v, now_ms);
            update_stats(ctl, out, &v, now_ms);
            supervise_heaters(ctl, rt, &v, out, now_ms);
        }
        ProcessState::SoftResume => {
            rt.pid.setpoint = v.t_set;
            let out = rt.pid.compute(v.t_chamber, now_ms);
            let _ = ctl.outputs.apply_soft_enable(now_ms);
            let _ = ctl.outputs.apply_heater_power(out, v.power_mode);
            if ctl.outputs.are_heaters_ready().unwrap_or(false) {
                if v.door_open {
                    // Door reopened while staging: hold in the pause
                    enter_pause(ctl, ProcessState::PauseDoor, false);
                    ctl.outputs.all_outputs_off();
                } else {
                    let target = match v.last_run_mode {
                        RunMode::Auto => ProcessState::RunningAuto,
                        RunMode::Manual => ProcessState::RunningManual,
                    };
                    if let Ok(mut st) = ctl.lock_state() {
                        st.current_state = target;
                    }
                    info!("Soft resume complete, back to {}", target.name());
                }
            }
        }
        ProcessState::Idle
        | ProcessState::PauseDoor
        | ProcessState::PauseSensor
        | ProcessState::PauseOverheat
        | ProcessState::PauseUser
        | ProcessState::PauseHeaterFault
        | ProcessState::ErrorProfile => {
            ctl.outputs.all_outputs_off();
        }
    }
}

// ============================================================================
// Fan policy
// ============================================================================

fn run_fan_policy(ctl: &Controller, rt: &mut ControlRuntime, v: &TickView, now_ms: u64) {
    rt.trend.record(v.t_chamber, now_ms);
    let (on_eff, off_eff) = if v.fan_mode == FanMode::Cyclic {
        rt.trend
            .effective_times(v.fan_on_ms, v.fan_off_ms, v.t_chamber, v.t_set)
    } else {
        (v.fan_on_ms, v.fan_off_ms)
    };
    if let Ok(mut st) = ctl.lock_state() {
        st.fan_on_effective_ms = on_eff;
        st.fan_off_effective_ms = off_eff;
    }
    let _ = ctl.outputs.drive_fan(v.fan_mode, on_eff, off_eff, now_ms);
}

// ============================================================================
// Step sequencer (auto mode)
// ============================================================================

fn handle_auto_sequencer(ctl: &Controller, rt: &mut ControlRuntime, now_ms: u64) {
    let (step, step_start, t_meat) = {
        let Ok(st) = ctl.lock_state() else { return };
        let Some(step) = st.current_step_ref().cloned() else {
            return;
        };
        (step, st.step_start_ms, st.t_meat)
    };

    let elapsed = now_ms.saturating_sub(step_start);
    let time_done = elapsed >= step.min_time_ms;
    let meat_done = !step.use_meat_temp || t_meat >= step.t_meat_target;
    if time_done && meat_done {
        advance_step(ctl, rt, now_ms);
    }
}

/// Advance to the next step, or end the run after the last one
pub fn advance_step(ctl: &Controller, rt: &mut ControlRuntime, now_ms: u64) {
    let run_ended = {
        let Ok(mut st) = ctl.lock_state() else { return };
        if st.current_state != ProcessState::RunningAuto {
            return;
        }
        st.current_step += 1;
        st.stats.step_changes += 1;
        if st.current_step >= st.step_count() {
            st.current_state = ProcessState::PauseUser;
            true
        } else {
            apply_current_step(&mut st, now_ms);
            false
        }
    };

    if run_ended {
        info!("Profile complete");
        ctl.outputs.all_outputs_off();
        ctl.outputs.buzzer_beep(3, 200, 200, now_ms);
    } else {
        rt.fault.reset();
        ctl.outputs.reset_fan_cycle(now_ms);
        info!("Advanced to step {}", ctl.lock_state().map(|s| s.current_step).unwrap_or(0));
    }
}

/// Copy the current step's parameters into live state and restart its clock
pub fn apply_current_step(st: &mut ControllerState, now_ms: u64) {
    if let Some(step) = st.current_step_ref().cloned() {
        st.t_set = step.t_set;
        st.power_mode = step.power_mode;
        st.manual_smoke_pwm = step.smoke_pwm;
        st.fan_mode = step.fan_mode;
        st.fan_on_time_ms = step.fan_on_ms;
        st.fan_off_time_ms = step.fan_off_ms;
        st.fan_on_effective_ms = step.fan_on_ms;
        st.fan_off_effective_ms = step.fan_off_ms;
        st.step_start_ms = now_ms;
    }
}

// ============================================================================
// Statistics
// ============================================================================

fn update_stats(ctl: &Controller, pid_out: f64, v: &TickView, now_ms: u64) {
    let heating = ctl.outputs.heating_active(pid_out, v.power_mode);
    let Ok(mut st) = ctl.lock_state() else { return };
    let stats = &mut st.stats;
    if stats.last_update_ms > 0 {
        let dt = now_ms.saturating_sub(stats.last_update_ms);
        stats.total_runtime_ms += dt;
        if heating {
            stats.active_heating_ms += dt;
        }
    }
    stats.last_update_ms = now_ms;
    if stats.avg_temp == 0.0 {
        stats.avg_temp = v.t_chamber;
    } else {
        stats.avg_temp =
            stats.avg_temp * stats_cfg::AVG_TEMP_ALPHA + v.t_chamber * (1.0 - stats_cfg::AVG_TEMP_ALPHA);
    }

    // Remaining time: the rest of this step plus all later steps
    if v.state == ProcessState::RunningAuto {
        let step_start = st.step_start_ms;
        let current = st.current_step;
        let mut remaining_ms: u64 = 0;
        for (index, step) in st.profile.iter().enumerate().skip(current) {
            if index == current {
                remaining_ms += step.min_time_ms.saturating_sub(now_ms.saturating_sub(step_start));
            } else {
                remaining_ms += step.min_time_ms;
            }
        }
        st.stats.remaining_sec = remaining_ms / 1000;
    } else {
        st.stats.remaining_sec = 0;
    }
}

// ============================================================================
// Heater-efficiency supervision
// ============================================================================

fn supervise_heaters(
    ctl: &Controller,
    rt: &mut ControlRuntime,
    v: &TickView,
    pid_out: f64,
    now_ms: u64,
) {
    let verdict = rt
        .fault
        .update(v.state.is_running(), v.t_set, v.t_chamber, pid_out, now_ms);
    if verdict == FaultVerdict::Fault {
        enter_pause(ctl, ProcessState::PauseHeaterFault, true);
        ctl.outputs.all_outputs_off();
        ctl.outputs.buzzer_beep(5, 500, 300, now_ms);
    }
}

// ============================================================================
// Lifecycle transitions
// ============================================================================

fn enter_pause(ctl: &Controller, target: ProcessState, count_pause: bool) {
    if let Ok(mut st) = ctl.lock_state() {
        st.current_state = target;
        if count_pause {
            st.stats.pause_count += 1;
        }
    }
    info!("Process paused: {}", target.name());
}

/// Transition any pause into the heater re-staging state
fn soft_resume(ctl: &Controller, now_ms: u64) {
    if let Ok(mut st) = ctl.lock_state() {
        st.current_state = ProcessState::SoftResume;
    }
    let _ = ctl.outputs.reset_heater_stage(now_ms);
    info!("Soft resume: heaters re-staging");
}

/// Start an automatic run from Idle
pub fn start_auto(ctl: &Controller, rt: &mut ControlRuntime, now_ms: u64) -> Result<()> {
    let planned = {
        let mut st = ctl.lock_state()?;
        if st.current_state != ProcessState::Idle {
            return Err(sk_error::SmokehouseError::InvalidState {
                state: st.current_state.name(),
            });
        }
        if st.profile.is_empty() || st.error_profile {
            st.error_profile = true;
            return Err(sk_error::SmokehouseError::ProfileInvalid(
                "no profile loaded".into(),
            ));
        }
        st.current_step = 0;
        apply_current_step(&mut st, now_ms);
        let planned = crate::data::profile::planned_seconds(&st.profile);
        st.stats = ProcessStats {
            total_planned_sec: planned,
            remaining_sec: planned,
            ..ProcessStats::default()
        };
        st.process_start_ms = now_ms;
        st.step_start_ms = now_ms;
        st.last_run_mode = RunMode::Auto;
        st.current_state = ProcessState::RunningAuto;
        planned
    };

    rt.pid.reset(ctl.lock_state()?.t_chamber);
    rt.adaptive.reset(&mut rt.pid);
    rt.fault.reset();
    rt.trend.reset();
    let _ = ctl.outputs.reset_heater_stage(now_ms);
    ctl.outputs.reset_fan_cycle(now_ms);
    info!(planned_sec = planned, "Auto run started");
    Ok(())
}

/// Start a manual run from Idle with the persisted manual settings
pub fn start_manual(ctl: &Controller, rt: &mut ControlRuntime, now_ms: u64) -> Result<()> {
    {
        let st = ctl.lock_state()?;
        if st.current_state != ProcessState::Idle {
            return Err(sk_error::SmokehouseError::InvalidState {
                state: st.current_state.name(),
            });
        }
    }
    storage::apply_manual_settings(ctl)?;
    {
        let mut st = ctl.lock_state()?;
        st.profile.clear();
        st.active_profile.clear();
        st.current_step = 0;
        st.stats = ProcessStats::default();
        st.process_start_ms = now_ms;
        st.step_start_ms = now_ms;
        st.last_run_mode = RunMode::Manual;
        st.current_state = ProcessState::RunningManual;
    }
    rt.pid.reset(ctl.lock_state()?.t_chamber);
    rt.adaptive.reset(&mut rt.pid);
    rt.fault.reset();
    rt.trend.reset();
    let _ = ctl.outputs.reset_heater_stage(now_ms);
    ctl.outputs.reset_fan_cycle(now_ms);
    info!("Manual run started");
    Ok(())
}

/// User stop: any state back to Idle, everything off
pub fn stop(ctl: &Controller) {
    if let Ok(mut st) = ctl.lock_state() {
        st.current_state = ProcessState::Idle;
    }
    ctl.outputs.all_outputs_off();
    info!("Process stopped by user");
}

// ------------------------------------------------------------------
// Event entry points (called by the sensor task)
// ------------------------------------------------------------------

/// Door opened: pause a running process
pub fn door_opened(ctl: &Controller, now_ms: u64) {
    let was_running = {
        let Ok(mut st) = ctl.lock_state() else { return };
        st.door_open = true;
        st.current_state.is_running()
    };
    if was_running {
        enter_pause(ctl, ProcessState::PauseDoor, true);
        ctl.outputs.all_outputs_off();
        ctl.outputs.buzzer_beep(1, 200, 0, now_ms);
    }
}

/// Door closed: auto-resume a door pause
pub fn door_closed(ctl: &Controller, now_ms: u64) {
    let was_door_pause = {
        let Ok(mut st) = ctl.lock_state() else { return };
        st.door_open = false;
        st.current_state == ProcessState::PauseDoor
    };
    if was_door_pause {
        soft_resume(ctl, now_ms);
    }
}

/// Three consecutive cycles without a valid chamber reading
pub fn chamber_sensors_failed(ctl: &Controller) {
    let was_running = {
        let Ok(mut st) = ctl.lock_state() else { return };
        st.error_sensor = true;
        st.current_state.is_running()
    };
    if was_running {
        warn!("Chamber sensors failed, pausing");
        enter_pause(ctl, ProcessState::PauseSensor, false);
        ctl.outputs.all_outputs_off();
    }
}

/// A valid chamber reading arrived again
pub fn chamber_sensors_recovered(ctl: &Controller, now_ms: u64) {
    let was_sensor_pause = {
        let Ok(mut st) = ctl.lock_state() else { return };
        st.error_sensor = false;
        st.current_state == ProcessState::PauseSensor
    };
    if was_sensor_pause {
        info!("Chamber sensors recovered");
        soft_resume(ctl, now_ms);
    }
}

/// Chamber exceeded the soft cap: latch an overheat pause
pub fn overheat(ctl: &Controller) {
    let transition = {
        let Ok(mut st) = ctl.lock_state() else { return };
        st.error_overheat = true;
        let t = st.current_state.is_running() || st.current_state == ProcessState::SoftResume;
        if t {
            st.current_state = ProcessState::PauseOverheat;
        }
        t
    };
    if transition {
        warn!("Chamber overheat, outputs off");
        ctl.outputs.all_outputs_off();
    }
}

/// User acknowledgement of a latched pause (overheat, heater fault, user)
pub fn resume(ctl: &Controller, now_ms: u64) -> Result<()> {
    {
        let mut st = ctl.lock_state()?;
        match st.current_state {
            ProcessState::PauseUser | ProcessState::PauseHeaterFault => {}
            ProcessState::PauseOverheat => {
                if st.t_chamber > cfg::T_MAX_SOFT {
                    return Err(sk_error::SmokehouseError::Overheat {
                        value: st.t_chamber,
                        limit: cfg::T_MAX_SOFT,
                    });
                }
                st.error_overheat = false;
            }
            other => {
                return Err(sk_error::SmokehouseError::InvalidState {
                    state: other.name(),
                })
            }
        }
    }
    soft_resume(ctl, now_ms);
    Ok(())
}

// ------------------------------------------------------------------
// Command dispatch
// ------------------------------------------------------------------

fn handle_command(
    ctl: &Controller,
    rt: &mut ControlRuntime,
    command: &Command,
    now_ms: u64,
) -> Result<()> {
    match command {
        Command::StartAuto => start_auto(ctl, rt, now_ms),
        Command::StartManual => start_manual(ctl, rt, now_ms),
        Command::Stop => {
            stop(ctl);
            Ok(())
        }
        Command::NextStep => {
            advance_step(ctl, rt, now_ms);
            Ok(())
        }
        Command::Resume => resume(ctl, now_ms),
        Command::ResetTimer => {
            ctl.lock_state()?.step_start_ms = now_ms;
            Ok(())
        }
        Command::SetManualSetpoint { celsius } => {
            ctl.lock_state()?.t_set = celsius.clamp(cfg::T_SET_MIN, cfg::T_SET_MAX);
            storage::save_manual_settings(ctl)
        }
        Command::SetManualPower { mode } => {
            ctl.lock_state()?.power_mode = (*mode).clamp(1, 3);
            storage::save_manual_settings(ctl)
        }
        Command::SetManualSmoke { pwm } => {
            ctl.lock_state()?.manual_smoke_pwm = *pwm;
            storage::save_manual_settings(ctl)
        }
        Command::SetManualFan { mode, on_ms, off_ms } => {
            {
                let mut st = ctl.lock_state()?;
                st.fan_mode = FanMode::from_u8(*mode);
                if *mode == FanMode::Cyclic as u8 {
                    st.fan_on_time_ms = (*on_ms).max(fan_cfg::MIN_PHASE_MS);
                    st.fan_off_time_ms = (*off_ms).max(fan_cfg::MIN_PHASE_MS);
                    st.fan_on_effective_ms = st.fan_on_time_ms;
                    st.fan_off_effective_ms = st.fan_off_time_ms;
                }
            }
            storage::save_manual_settings(ctl)
        }
        Command::SelectProfile { path } => {
            storage::load_profile(ctl, path, rt.remote.as_ref())?;
            let mut nvs = ctl.nvs.lock();
            nvs.data.profile = Some(path.clone());
            nvs.save()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::tests::test_controller;
    use crate::storage::NoRemote;

    fn runtime() -> ControlRuntime {
        ControlRuntime::new(Arc::new(NoRemote))
    }

    fn load_two_step_profile(ctl: &Controller) {
        ctl.flash
            .as_ref()
            .unwrap()
            .lock()
            .file_write(
                "/profiles/test.txt",
                b"First;60;0;1;2;0;0;10;60;0\nSecond;80;0;1;2;0;0;10;60;0\n",
            )
            .unwrap();
        storage::load_profile(ctl, "/profiles/test.txt", &NoRemote).unwrap();
    }

    #[test]
    fn test_start_auto_requires_profile() {
        let ctl = test_controller();
        let mut rt = runtime();
        assert!(start_auto(&ctl, &mut rt, 0).is_err());
        assert!(ctl.lock_state().unwrap().error_profile);
    }

    #[test]
    fn test_start_auto_applies_first_step() {
        let ctl = test_controller();
        let mut rt = runtime();
        load_two_step_profile(&ctl);
        start_auto(&ctl, &mut rt, 1000).unwrap();
        let st = ctl.lock_state().unwrap();
        assert_eq!(st.current_state, ProcessState::RunningAuto);
        assert_eq!(st.current_step, 0);
        assert_eq!(st.t_set, 60.0);
        assert_eq!(st.process_start_ms, 1000);
        assert_eq!(st.stats.total_planned_sec, 120);
    }

    #[test]
    fn test_stop_from_any_state() {
        let ctl = test_controller();
        let mut rt = runtime();
        load_two_step_profile(&ctl);
        start_auto(&ctl, &mut rt, 0).unwrap();
        stop(&ctl);
        assert_eq!(ctl.lock_state().unwrap().current_state, ProcessState::Idle);
    }

    #[test]
    fn test_sequencer_advances_and_ends() {
        let ctl = test_controller();
        let mut rt = runtime();
        load_two_step_profile(&ctl);
        start_auto(&ctl, &mut rt, 0).unwrap();

        // Before minTime nothing advances
        control_tick(&ctl, &mut rt, 30_000);
        assert_eq!(ctl.lock_state().unwrap().current_step, 0);

        // First step (1 min) completes
        control_tick(&ctl, &mut rt, 61_000);
        {
            let st = ctl.lock_state().unwrap();
            assert_eq!(st.current_step, 1);
            assert_eq!(st.t_set, 80.0);
            assert_eq!(st.stats.step_changes, 1);
            assert_eq!(st.current_state, ProcessState::RunningAuto);
        }

        // Second (last) step completes; run ends in PauseUser
        control_tick(&ctl, &mut rt, 130_000);
        let st = ctl.lock_state().unwrap();
        assert_eq!(st.current_state, ProcessState::PauseUser);
        assert_eq!(st.current_step, 2);
    }

    #[test]
    fn test_meat_gate_requires_both_conditions() {
        let ctl = test_controller();
        let mut rt = runtime();
        ctl.flash
            .as_ref()
            .unwrap()
            .lock()
            .file_write("/profiles/meat.txt", b"Cook;80;60;1;2;0;0;10;60;1\n")
            .unwrap();
        storage::load_profile(&ctl, "/profiles/meat.txt", &NoRemote).unwrap();
        start_auto(&ctl, &mut rt, 0).unwrap();

        // Time satisfied, meat below target: keep running
        control_tick(&ctl, &mut rt, 61_000);
        assert_eq!(
            ctl.lock_state().unwrap().current_state,
            ProcessState::RunningAuto
        );

        // Meat reaches target
        ctl.lock_state().unwrap().t_meat = 65.0;
        control_tick(&ctl, &mut rt, 62_000);
        assert_eq!(
            ctl.lock_state().unwrap().current_state,
            ProcessState::PauseUser
        );
    }

    #[test]
    fn test_door_pause_and_soft_resume() {
        let ctl = test_controller();
        let mut rt = runtime();
        load_two_step_profile(&ctl);
        start_auto(&ctl, &mut rt, 0).unwrap();

        door_opened(&ctl, 5000);
        {
            let st = ctl.lock_state().unwrap();
            assert_eq!(st.current_state, ProcessState::PauseDoor);
            assert_eq!(st.stats.pause_count, 1);
        }

        door_closed(&ctl, 6000);
        assert_eq!(
            ctl.lock_state().unwrap().current_state,
            ProcessState::SoftResume
        );

        // Reopening during SoftResume does not re-pause (edge already consumed)
        door_opened(&ctl, 6100);
        assert_eq!(
            ctl.lock_state().unwrap().current_state,
            ProcessState::SoftResume
        );
        door_closed(&ctl, 6200);

        // Heaters stage over 3 s; after that the run resumes
        control_tick(&ctl, &mut rt, 6300);
        assert_eq!(
            ctl.lock_state().unwrap().current_state,
            ProcessState::SoftResume
        );
        control_tick(&ctl, &mut rt, 9500);
        assert_eq!(
            ctl.lock_state().unwrap().current_state,
            ProcessState::RunningAuto
        );
    }

    #[test]
    fn test_pause_states_force_outputs_off() {
        let ctl = test_controller();
        let mut rt = runtime();
        load_two_step_profile(&ctl);
        start_auto(&ctl, &mut rt, 0).unwrap();
        ctl.lock_state().unwrap().t_chamber = 20.0;

        // Let heaters stage and the PID saturate
        for t in [100, 1200, 2200, 3200, 3300] {
            control_tick(&ctl, &mut rt, t);
        }

        door_opened(&ctl, 3400);
        control_tick(&ctl, &mut rt, 3500);
        // MockBoard is reachable through the Board trait object only;
        // verify through the outputs invariant instead.
        assert!(ctl.outputs.is_shutting_down());
    }

    #[test]
    fn test_overheat_latches_until_resume() {
        let ctl = test_controller();
        let mut rt = runtime();
        load_two_step_profile(&ctl);
        start_auto(&ctl, &mut rt, 0).unwrap();

        ctl.lock_state().unwrap().t_chamber = 131.0;
        overheat(&ctl);
        assert_eq!(
            ctl.lock_state().unwrap().current_state,
            ProcessState::PauseOverheat
        );
        assert!(ctl.lock_state().unwrap().error_overheat);

        // Still too hot: resume refused
        assert!(resume(&ctl, 1000).is_err());

        ctl.lock_state().unwrap().t_chamber = 90.0;
        resume(&ctl, 2000).unwrap();
        let st = ctl.lock_state().unwrap();
        assert_eq!(st.current_state, ProcessState::SoftResume);
        assert!(!st.error_overheat);
    }

    #[test]
    fn test_24h_cap() {
        let ctl = test_controller();
        let mut rt = runtime();
        load_two_step_profile(&ctl);
        start_auto(&ctl, &mut rt, 0).unwrap();
        control_tick(&ctl, &mut rt, cfg::MAX_PROCESS_TIME_MS + 1000);
        assert_eq!(
            ctl.lock_state().unwrap().current_state,
            ProcessState::PauseUser
        );
    }

    #[test]
    fn test_step_advance_is_monotone() {
        let ctl = test_controller();
        let mut rt = runtime();
        load_two_step_profile(&ctl);
        start_auto(&ctl, &mut rt, 0).unwrap();
        let mut last = 0;
        for t in (0..200_000).step_by(10_000) {
            control_tick(&ctl, &mut rt, t);
            let step = ctl.lock_state().unwrap().current_step;
            assert!(step >= last);
            last = step;
        }
        // After the last step the state left Running*
        assert_ne!(
            ctl.lock_state().unwrap().current_state,
            ProcessState::RunningAuto
        );
    }

    #[test]
    fn test_manual_mode_commands() {
        let ctl = test_controller();
        let mut rt = runtime();
        start_manual(&ctl, &mut rt, 0).unwrap();
        assert_eq!(
            ctl.lock_state().unwrap().current_state,
            ProcessState::RunningManual
        );

        ctl.push_command(Command::SetManualSetpoint { celsius: 85.0 })
            .unwrap();
        ctl.push_command(Command::SetManualFan {
            mode: 2,
            on_ms: 5000,
            off_ms: 20_000,
        })
        .unwrap();
        control_tick(&ctl, &mut rt, 100);
        let st = ctl.lock_state().unwrap();
        assert_eq!(st.t_set, 85.0);
        assert_eq!(st.fan_mode, FanMode::Cyclic);
        assert_eq!(st.fan_on_time_ms, 5000);
    }

    #[test]
    fn test_force_next_step_command() {
        let ctl = test_controller();
        let mut rt = runtime();
        load_two_step_profile(&ctl);
        start_auto(&ctl, &mut rt, 0).unwrap();
        ctl.push_command(Command::NextStep).unwrap();
        control_tick(&ctl, &mut rt, 100);
        assert_eq!(ctl.lock_state().unwrap().current_step, 1);
    }
}
