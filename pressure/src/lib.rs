//! Controllable memory and CPU pressure generation
//!
//! This crate grows a held memory region toward a configured ceiling and
//! keeps CPU workers busy according to a ramping duty cycle, under a single
//! session lifecycle that always tears everything down in a bounded time.
//! It is meant to exercise OOM killers, autoscalers, cgroup limits and
//! alerting thresholds, not to benchmark anything.

pub mod budget;
pub mod cgroup;
pub mod config;
pub mod cpu;
pub mod event;
pub mod io;
pub mod memory;
pub mod session;
pub mod sink;
pub mod stop;

use std::any::Any;

pub use self::{
    budget::{HumanBytes, SizeBudget},
    config::{ConfigError, PressureConfig},
    session::{
        run_session, PressureSession, SessionError, SessionHandle, SessionResult, SessionState,
        StopReason,
    },
    sink::{CsvSink, LogSink, StatusLine, StatusSink},
};

/// Extract a human-readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
