//! Line-oriented profile wire format
//!
//! A profile file is UTF-8/ASCII text, one step per line, `#` for comments.
//! Each record has exactly 10 `;`-separated fields:
//!
//! `name;tSet;tMeat;minTime_minutes;powerMode;smokePwm;fanMode;fanOn_seconds;fanOff_seconds;useMeatTemp`
//!
//! Fields are trimmed and clamped to their documented ranges. Malformed
//! lines are skipped with a warning rather than failing the whole file.

use tracing::warn;

use crate::constants::{fan, process, profile as limits};
use crate::data::types::{FanMode, Step};

/// Parse a whole profile file. Returns the steps that parsed; the caller
/// decides whether zero steps constitutes a profile error.
pub fn parse_profile(text: &str) -> Vec<Step> {
    let mut steps = Vec::new();
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if steps.len() >= process::MAX_STEPS {
            warn!("Profile has more than {} steps, ignoring the rest", process::MAX_STEPS);
            break;
        }
        match parse_step_line(line) {
            Ok(step) => steps.push(step),
            Err(e) => warn!("Skipping malformed profile line {}: {}", lineno + 1, e),
        }
    }
    steps
}

/// Parse one record line into a Step
pub fn parse_step_line(line: &str) -> Result<Step, String> {
    let fields: Vec<&str> = line.split(';').map(str::trim).collect();
    if fields.len() != limits::FIELD_COUNT {
        return Err(format!(
            "expected {} fields, got {}",
            limits::FIELD_COUNT,
            fields.len()
        ));
    }

    let name = fields[0];
    if name.is_empty() {
        return Err("empty step name".into());
    }
    let mut name = name.to_string();
    name.truncate(limits::NAME_MAX);

    let t_set: f64 = fields[1].parse().map_err(|_| format!("bad tSet {:?}", fields[1]))?;
    let t_meat: f64 = fields[2].parse().map_err(|_| format!("bad tMeat {:?}", fields[2]))?;
    let minutes: u64 = fields[3]
        .parse()
        .map_err(|_| format!("bad minTime {:?}", fields[3]))?;
    let power: u8 = fields[4]
        .parse()
        .map_err(|_| format!("bad powerMode {:?}", fields[4]))?;
    let smoke: u16 = fields[5]
        .parse()
        .map_err(|_| format!("bad smokePwm {:?}", fields[5]))?;
    let fan_mode: u8 = fields[6]
        .parse()
        .map_err(|_| format!("bad fanMode {:?}", fields[6]))?;
    let fan_on_s: u64 = fields[7]
        .parse()
        .map_err(|_| format!("bad fanOn {:?}", fields[7]))?;
    let fan_off_s: u64 = fields[8]
        .parse()
        .map_err(|_| format!("bad fanOff {:?}", fields[8]))?;
    let use_meat = matches!(fields[9].to_ascii_lowercase().as_str(), "1" | "true");

    Ok(Step {
        name,
        t_set: t_set.clamp(process::T_SET_MIN, process::T_SET_MAX),
        t_meat_target: t_meat.clamp(process::T_MEAT_MIN, process::T_MEAT_MAX),
        min_time_ms: minutes * 60_000,
        power_mode: power.clamp(1, 3),
        smoke_pwm: smoke.min(255) as u8,
        fan_mode: FanMode::from_u8(fan_mode.min(2)),
        fan_on_ms: (fan_on_s * 1000).max(fan::MIN_PHASE_MS),
        fan_off_ms: (fan_off_s * 1000).max(fan::MIN_PHASE_MS),
        use_meat_temp: use_meat,
    })
}

/// Render a step back to its canonical record line.
///
/// For any in-range step, `parse_step_line(format_step(s)) == s`, and for
/// any canonical line, `format_step(parse_step_line(l)) == l`.
pub fn format_step(step: &Step) -> String {
    format!(
        "{};{};{};{};{};{};{};{};{};{}",
        step.name,
        step.t_set,
        step.t_meat_target,
        step.min_time_ms / 60_000,
        step.power_mode,
        step.smoke_pwm,
        step.fan_mode as u8,
        step.fan_on_ms / 1000,
        step.fan_off_ms / 1000,
        if step.use_meat_temp { 1 } else { 0 },
    )
}

/// Planned duration of a whole profile in seconds (sum of minimum times)
pub fn planned_seconds(steps: &[Step]) -> u64 {
    steps.iter().map(|s| s.min_time_ms / 1000).sum()
}
