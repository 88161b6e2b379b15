//! Resolved pressure session configuration

use crate::budget::SizeBudget;
use serde::{Deserialize, Serialize};
use std::{path::PathBuf, time::Duration};
use thiserror::Error;

/// Fully resolved pressure session configuration
///
/// All sizes are in bytes and all durations are in seconds, human-readable
/// units are handled by the command line layer. Nothing is checked until
/// the configuration is resolved into plans by `resolve()`.
///
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PressureConfig {
    /// Amount of memory to hold once growth is over
    pub target_memory_bytes: u64,

    /// Size of each memory allocation step
    pub memory_block_bytes: u64,

    /// Pause between two memory allocation steps
    pub memory_interval_seconds: f64,

    /// Memory that must be left out of the target, and out of the cgroup
    /// memory limit when `respect_memory_limit` is set
    pub headroom_bytes: u64,

    /// Number of CPU pressure workers
    pub cpu_count: u32,

    /// Duration of the whole session
    pub cpu_duration_seconds: f64,

    /// Period of the CPU intensity ramp, zero disables the ramp
    pub cpu_ramp_every_seconds: f64,

    /// Fraction of the duty period moved from idle to busy time on each
    /// ramp tick
    pub ramp_step: f64,

    /// Initial busy time of each duty cycle
    pub duty_on_seconds: f64,

    /// Initial idle time of each duty cycle
    pub duty_off_seconds: f64,

    /// Amount of data written by the I/O pressure source, zero disables it
    pub io_burst_bytes: u64,

    /// Directory where the I/O pressure source writes its scratch file
    pub io_dir: PathBuf,

    /// Pin each CPU worker to its own CPU
    pub pin_workers: bool,

    /// Start CPU workers one ramp period apart instead of all at once
    pub stagger_workers: bool,

    /// Stop memory growth before the cgroup memory limit minus headroom
    pub respect_memory_limit: bool,

    /// Period of status reports
    pub status_every_seconds: f64,
}
//
impl Default for PressureConfig {
    fn default() -> Self {
        Self {
            target_memory_bytes: 8 * GIB,
            memory_block_bytes: 64 * MIB,
            memory_interval_seconds: 2.0,
            headroom_bytes: 0,
            cpu_count: 2,
            cpu_duration_seconds: 300.0,
            cpu_ramp_every_seconds: 15.0,
            ramp_step: 0.1,
            duty_on_seconds: 0.7,
            duty_off_seconds: 0.3,
            io_burst_bytes: 0,
            io_dir: std::env::temp_dir(),
            pin_workers: true,
            stagger_workers: true,
            respect_memory_limit: true,
            status_every_seconds: 5.0,
        }
    }
}
//
impl PressureConfig {
    /// Check the configuration and turn it into per-controller plans
    ///
    /// This is done before any resource is acquired, so that a bad
    /// configuration never results in a half-started session.
    ///
    pub fn resolve(&self) -> Result<SessionPlan, ConfigError> {
        if self.memory_block_bytes == 0 {
            return Err(ConfigError::ZeroBlockSize);
        }
        let memory = MemoryPlan {
            budget: SizeBudget::new(self.target_memory_bytes, self.headroom_bytes),
            block_bytes: self.memory_block_bytes,
            interval: duration("memory interval", self.memory_interval_seconds)?,
            respect_limit: self.respect_memory_limit,
        };

        let duty_on = duration("duty cycle busy time", self.duty_on_seconds)?;
        let duty_off = duration("duty cycle idle time", self.duty_off_seconds)?;
        let duty_period = duty_on
            .checked_add(duty_off)
            .ok_or(ConfigError::DutyPeriodTooLong)?;
        if duty_period.is_zero() {
            return Err(ConfigError::ZeroDutyPeriod);
        }
        if !(0.0..=1.0).contains(&self.ramp_step) {
            return Err(ConfigError::BadRampStep(self.ramp_step));
        }
        let ramp_every = duration("ramp period", self.cpu_ramp_every_seconds)?;
        let cpu = CpuPlan {
            workers: self.cpu_count as usize,
            duty_on,
            duty_off,
            ramp_every: (!ramp_every.is_zero()).then_some(ramp_every),
            ramp_step: self.ramp_step,
            pin_workers: self.pin_workers,
            stagger_workers: self.stagger_workers,
        };

        let io = (self.io_burst_bytes > 0).then(|| IoPlan {
            burst_bytes: self.io_burst_bytes,
            dir: self.io_dir.clone(),
        });

        let session_duration = duration("session duration", self.cpu_duration_seconds)?;
        if session_duration.is_zero() {
            return Err(ConfigError::ZeroDuration);
        }
        let status_every = duration("status period", self.status_every_seconds)?;
        if status_every.is_zero() {
            return Err(ConfigError::ZeroStatusPeriod);
        }

        Ok(SessionPlan {
            memory,
            cpu,
            io,
            duration: session_duration,
            status_every,
        })
    }
}

/// Convert a floating-point second count into a `Duration`
fn duration(what: &'static str, secs: f64) -> Result<Duration, ConfigError> {
    let duration =
        Duration::try_from_secs_f64(secs).map_err(|_| ConfigError::BadDuration { what, secs })?;
    if duration > MAX_DURATION {
        return Err(ConfigError::DurationTooLong { what, secs });
    }
    Ok(duration)
}

/// Longest accepted duration, about a century
///
/// Deadlines are computed as `Instant + Duration`, which must not overflow.
///
pub const MAX_DURATION: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

/// Invalid pressure session configuration
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ConfigError {
    /// Memory would be allocated in blocks of zero bytes
    #[error("memory block size must be nonzero")]
    ZeroBlockSize,

    /// A duration is negative, infinite or NaN
    #[error("{what} must be a finite nonnegative number of seconds, got {secs}")]
    BadDuration {
        /// What the duration configures
        what: &'static str,

        /// Faulty second count
        secs: f64,
    },

    /// A duration is too long to compute deadlines from
    #[error("{what} must be at most {} seconds, got {secs}", MAX_DURATION.as_secs())]
    DurationTooLong {
        /// What the duration configures
        what: &'static str,

        /// Faulty second count
        secs: f64,
    },

    /// Busy and idle times add up to more than a `Duration` can hold
    #[error("duty cycle period is too long")]
    DutyPeriodTooLong,

    /// Busy and idle times are both zero
    #[error("duty cycle period must be nonzero")]
    ZeroDutyPeriod,

    /// Ramp step is not a fraction
    #[error("ramp step must be between 0 and 1, got {0}")]
    BadRampStep(f64),

    /// The session would end before starting
    #[error("session duration must be nonzero")]
    ZeroDuration,

    /// Status would be reported in a busy loop
    #[error("status period must be nonzero")]
    ZeroStatusPeriod,
}

/// Checked configuration, split per controller
#[derive(Clone, Debug, PartialEq)]
pub struct SessionPlan {
    /// Memory pressure plan
    pub memory: MemoryPlan,

    /// CPU pressure plan
    pub cpu: CpuPlan,

    /// I/O pressure plan, if I/O pressure is enabled
    pub io: Option<IoPlan>,

    /// Duration of the whole session
    pub duration: Duration,

    /// Period of status reports
    pub status_every: Duration,
}

/// Memory pressure plan
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MemoryPlan {
    /// How much memory should be held
    pub budget: SizeBudget,

    /// Size of each allocation step (nonzero)
    pub block_bytes: u64,

    /// Pause between allocation steps
    pub interval: Duration,

    /// Also keep headroom below the cgroup memory limit
    pub respect_limit: bool,
}

/// CPU pressure plan
#[derive(Clone, Debug, PartialEq)]
pub struct CpuPlan {
    /// Number of worker threads
    pub workers: usize,

    /// Initial busy time per duty cycle
    pub duty_on: Duration,

    /// Initial idle time per duty cycle
    pub duty_off: Duration,

    /// Ramp period, if ramping is enabled
    pub ramp_every: Option<Duration>,

    /// Fraction of the duty period moved from idle to busy per ramp tick
    pub ramp_step: f64,

    /// Pin workers to CPUs
    pub pin_workers: bool,

    /// Start workers one ramp period apart
    pub stagger_workers: bool,
}

/// I/O pressure plan
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IoPlan {
    /// Number of bytes to write
    pub burst_bytes: u64,

    /// Where the scratch file goes
    pub dir: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn defaults_resolve() {
        let plan = PressureConfig::default().resolve().unwrap();
        assert_eq!(plan.memory.budget.ceiling_bytes(), 8 * GIB);
        assert_eq!(plan.memory.block_bytes, 64 * MIB);
        assert_eq!(plan.memory.interval, Duration::from_secs(2));
        assert_eq!(plan.cpu.workers, 2);
        assert_eq!(plan.cpu.duty_on, Duration::from_millis(700));
        assert_eq!(plan.cpu.duty_off, Duration::from_millis(300));
        assert_eq!(plan.cpu.ramp_every, Some(Duration::from_secs(15)));
        assert!(plan.cpu.stagger_workers);
        assert_eq!(plan.io, None);
        assert_eq!(plan.duration, Duration::from_secs(300));
    }

    #[test]
    fn zero_block() {
        let config = PressureConfig {
            memory_block_bytes: 0,
            ..Default::default()
        };
        assert_eq!(config.resolve(), Err(ConfigError::ZeroBlockSize));
    }

    #[test]
    fn bad_durations() {
        for secs in [-1.0, f64::NAN, f64::INFINITY] {
            let config = PressureConfig {
                memory_interval_seconds: secs,
                ..Default::default()
            };
            assert_matches!(
                config.resolve(),
                Err(ConfigError::BadDuration {
                    what: "memory interval",
                    ..
                })
            );
        }
        let config = PressureConfig {
            duty_off_seconds: -0.3,
            ..Default::default()
        };
        assert_matches!(config.resolve(), Err(ConfigError::BadDuration { .. }));
    }

    #[test]
    fn zero_durations() {
        let config = PressureConfig {
            duty_on_seconds: 0.0,
            duty_off_seconds: 0.0,
            ..Default::default()
        };
        assert_eq!(config.resolve(), Err(ConfigError::ZeroDutyPeriod));
        let config = PressureConfig {
            cpu_duration_seconds: 0.0,
            ..Default::default()
        };
        assert_eq!(config.resolve(), Err(ConfigError::ZeroDuration));
        let config = PressureConfig {
            status_every_seconds: 0.0,
            ..Default::default()
        };
        assert_eq!(config.resolve(), Err(ConfigError::ZeroStatusPeriod));
    }

    #[test]
    fn huge_durations() {
        let config = PressureConfig {
            duty_on_seconds: 1.8e19,
            duty_off_seconds: 1.8e19,
            ..Default::default()
        };
        assert_matches!(
            config.resolve(),
            Err(ConfigError::DurationTooLong {
                what: "duty cycle busy time",
                ..
            })
        );
        let config = PressureConfig {
            cpu_duration_seconds: 1.0e19,
            ..Default::default()
        };
        assert_matches!(
            config.resolve(),
            Err(ConfigError::DurationTooLong {
                what: "session duration",
                ..
            })
        );

        let longest = PressureConfig {
            duty_on_seconds: MAX_DURATION.as_secs_f64(),
            duty_off_seconds: MAX_DURATION.as_secs_f64(),
            cpu_duration_seconds: MAX_DURATION.as_secs_f64(),
            ..Default::default()
        };
        let plan = longest.resolve().unwrap();
        assert_eq!(plan.duration, MAX_DURATION);
        assert!(std::time::Instant::now().checked_add(plan.duration).is_some());
    }

    #[test]
    fn continuous_busy_is_valid() {
        let config = PressureConfig {
            duty_off_seconds: 0.0,
            cpu_ramp_every_seconds: 0.0,
            ..Default::default()
        };
        let plan = config.resolve().unwrap();
        assert!(plan.cpu.duty_off.is_zero());
        assert_eq!(plan.cpu.ramp_every, None);
    }

    #[test]
    fn ramp_step_range() {
        for ramp_step in [-0.1, 1.5, f64::NAN] {
            let config = PressureConfig {
                ramp_step,
                ..Default::default()
            };
            assert_matches!(config.resolve(), Err(ConfigError::BadRampStep(_)));
        }
    }

    #[test]
    fn io_burst() {
        let config = PressureConfig {
            io_burst_bytes: 128 * MIB,
            io_dir: PathBuf::from("/scratch"),
            ..Default::default()
        };
        assert_eq!(
            config.resolve().unwrap().io,
            Some(IoPlan {
                burst_bytes: 128 * MIB,
                dir: PathBuf::from("/scratch"),
            })
        );
    }
}
