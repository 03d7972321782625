//! Data types for the smokehouse controller
//!
//! - `types` - process state, steps, controller state, statistics
//! - `profile` - the line-oriented profile wire format

pub mod profile;
pub mod types;

pub use profile::{format_step, parse_profile, parse_step_line};
pub use types::{
    CachedReading, ControllerState, FanMode, HeaterEnable, ProcessState, ProcessStats, RunMode,
    Step,
};
