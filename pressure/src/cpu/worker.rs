//! CPU pressure worker threads

use super::{ramp_ticks, Burner, DutyCycle, DutyPhase};
use crate::stop::{MustStop, StopSignal};
use crossbeam_utils::CachePadded;
use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

/// Everything a worker needs to know
pub(super) struct WorkerContext {
    /// CPU slot of this worker
    pub slot: usize,

    /// Duty cycle shared by all workers
    pub cycle: DutyCycle,

    /// Ramp period, if ramping is enabled
    pub ramp_every: Option<Duration>,

    /// Start of the ramp clock, shared by all workers
    pub epoch: Instant,

    /// When this worker should start spinning
    pub start_at: Instant,

    /// When all workers must be done
    pub deadline: Instant,

    /// CPU to pin this worker to, if any
    pub pin: Option<usize>,

    /// Request from the controller to stop
    pub stop: StopSignal,

    /// Busy fraction of each worker, as f64 bits
    pub busy: Arc<[CachePadded<AtomicU64>]>,
}
//
impl WorkerContext {
    /// Run duty cycles until the deadline or a stop request
    pub fn run(self, mut burner: Box<dyn Burner + Send>) {
        if let Some(cpu) = self.pin {
            match pin_current_thread(cpu) {
                Ok(()) => log::debug!("CPU worker #{} pinned to CPU {cpu}", self.slot),
                Err(e) => log::warn!("Failed to pin CPU worker #{} to CPU {cpu} ({e})", self.slot),
            }
        }
        if self.stop.sleep_until(self.start_at.min(self.deadline)).is_ok() {
            log::debug!("CPU worker #{} started", self.slot);
            let mut state = WorkerState::new(self.cycle);
            // MustStop only means that the worker was stopped early
            let _ = self.duty_cycles(&mut state, &mut *burner);
            log::debug!(
                "CPU worker #{} exiting after {:.2?} at busy fraction {:.2}",
                self.slot,
                state.elapsed,
                state.current.busy_fraction()
            );
        }
    }

    /// Alternate between spinning and sleeping
    fn duty_cycles(&self, state: &mut WorkerState, burner: &mut dyn Burner) -> Result<(), MustStop> {
        loop {
            let cycle_start = Instant::now();
            if cycle_start >= self.deadline {
                return Ok(());
            }
            self.stop.check()?;
            state.update(self.epoch, cycle_start, self.ramp_every);
            self.busy[self.slot].store(state.current.busy_fraction().to_bits(), Ordering::Relaxed);

            let spin_end = cycle_start
                .checked_add(state.current.on)
                .map_or(self.deadline, |end| end.min(self.deadline));
            while Instant::now() < spin_end {
                self.stop.check()?;
                burner.burn(SPIN_BATCH);
            }

            if !state.current.off.is_zero() {
                let sleep_end = Instant::now()
                    .checked_add(state.current.off)
                    .map_or(self.deadline, |end| end.min(self.deadline));
                self.stop.sleep_until(sleep_end)?;
            }
        }
    }
}

/// Number of burner iterations between two stop flag checks
///
/// This is a few tens of microseconds of work on current hardware, which
/// bounds the latency of stop requests during busy phases.
///
const SPIN_BATCH: u32 = 10_000;

/// Duty cycle state of one worker
#[derive(Debug)]
struct WorkerState {
    /// Duty cycle configuration
    cycle: DutyCycle,

    /// Time elapsed on the ramp clock
    elapsed: Duration,

    /// Duty cycle currently applied
    current: DutyPhase,
}
//
impl WorkerState {
    /// Set up a worker at the start of the ramp
    fn new(cycle: DutyCycle) -> Self {
        Self {
            cycle,
            elapsed: Duration::ZERO,
            current: cycle.after_ramp_ticks(0),
        }
    }

    /// Apply ramp ticks that occured since the last update
    fn update(&mut self, epoch: Instant, now: Instant, ramp_every: Option<Duration>) {
        self.elapsed = now.saturating_duration_since(epoch);
        let next = self.cycle.after_ramp_ticks(ramp_ticks(epoch, now, ramp_every));
        debug_assert!(next.on >= self.current.on, "Duty cycle should only ramp up");
        self.current = next;
    }
}

/// CPUs that the current process is allowed to run on
#[cfg(target_os = "linux")]
pub(super) fn allowed_cpus() -> io::Result<Vec<usize>> {
    // SAFETY: cpu_set_t is a plain bitmask for which all-zeroes is valid, and
    //         the kernel is told its exact size.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok((0..libc::CPU_SETSIZE as usize)
            .filter(|&cpu| libc::CPU_ISSET(cpu, &set))
            .collect())
    }
}

/// Pin the calling thread to a single CPU
#[cfg(target_os = "linux")]
fn pin_current_thread(cpu: usize) -> io::Result<()> {
    // SAFETY: Same as above, and pid 0 designates the calling thread
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub(super) fn allowed_cpus() -> io::Result<Vec<usize>> {
    Err(io::ErrorKind::Unsupported.into())
}

#[cfg(not(target_os = "linux"))]
fn pin_current_thread(_cpu: usize) -> io::Result<()> {
    Err(io::ErrorKind::Unsupported.into())
}
