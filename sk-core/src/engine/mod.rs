//! Control engines driven by the 100 ms control tick
//!
//! - `pid` - discrete PID with variance-based adaptive gains
//! - `fan` - cyclic fan timer with trend-predicted duty adjustment
//! - `fault` - heater-efficiency supervisor

pub mod fan;
pub mod fault;
pub mod pid;

pub use fan::FanTrend;
pub use fault::{FaultVerdict, HeaterFaultMonitor};
pub use pid::{AdaptivePid, Pid};
