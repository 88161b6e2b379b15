//! CPU pressure generation
//!
//! One worker thread per CPU slot alternates between busy spinning and
//! sleeping. The share of busy time grows on a ramp schedule that is shared
//! by all workers, but workers are otherwise independent and their duty
//! cycles are not phase-aligned.

mod worker;

use self::worker::WorkerContext;
use crate::{config::CpuPlan, event::PressureEvent, panic_message, stop::StopSignal};
use crossbeam_utils::CachePadded;
use std::{
    io,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        mpsc::Sender,
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Busy and idle times of a duty cycle after some ramping
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DutyPhase {
    /// Busy spinning time
    pub on: Duration,

    /// Sleeping time
    pub off: Duration,
}
//
impl DutyPhase {
    /// Share of the duty period that is spent spinning
    pub fn busy_fraction(&self) -> f64 {
        let period = (self.on + self.off).as_secs_f64();
        if period == 0.0 {
            1.0
        } else {
            self.on.as_secs_f64() / period
        }
    }
}

/// Ramping duty cycle
///
/// The duty period stays constant. Each ramp tick moves `ramp_step` times the
/// period from idle time to busy time, until no idle time is left.
///
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DutyCycle {
    /// Duty cycle before any ramping
    initial: DutyPhase,

    /// Fraction of the period moved to busy time per tick, within [0, 1]
    ramp_step: f64,
}
//
impl DutyCycle {
    /// Set up a duty cycle
    pub fn new(on: Duration, off: Duration, ramp_step: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&ramp_step));
        Self {
            initial: DutyPhase { on, off },
            ramp_step,
        }
    }

    /// Duty period
    pub fn period(&self) -> Duration {
        self.initial.on + self.initial.off
    }

    /// Duty cycle after a number of ramp ticks
    pub fn after_ramp_ticks(&self, ticks: u64) -> DutyPhase {
        if ticks == 0 || self.ramp_step == 0.0 {
            return self.initial;
        }
        let period = self.period();
        let period_secs = period.as_secs_f64();
        let on_secs = self.initial.on.as_secs_f64() + ticks as f64 * self.ramp_step * period_secs;
        if on_secs >= period_secs {
            return DutyPhase {
                on: period,
                off: Duration::ZERO,
            };
        }
        let on = Duration::from_secs_f64(on_secs).max(self.initial.on);
        DutyPhase {
            on,
            off: period.saturating_sub(on),
        }
    }
}

/// Number of ramp ticks that occured since `epoch`
pub fn ramp_ticks(epoch: Instant, now: Instant, ramp_every: Option<Duration>) -> u64 {
    let Some(ramp_every) = ramp_every else {
        return 0;
    };
    let elapsed = now.saturating_duration_since(epoch);
    (elapsed.as_nanos() / ramp_every.as_nanos().max(1))
        .try_into()
        .unwrap_or(u64::MAX)
}

/// Delay before a worker starts spinning
///
/// Workers start all at once, unless staggering is requested, in which case
/// worker N starts N ramp periods after the controller.
///
pub fn start_offset(slot: usize, ramp_every: Option<Duration>, stagger: bool) -> Duration {
    match (stagger, ramp_every) {
        (true, Some(ramp_every)) => ramp_every.saturating_mul(slot.try_into().unwrap_or(u32::MAX)),
        _ => Duration::ZERO,
    }
}

/// Pure computation used to keep a CPU busy
pub trait Burner {
    /// Perform a bounded amount of computation
    fn burn(&mut self, iterations: u32);
}

/// Floating-point multiply-add chain that the compiler can't elide
#[derive(Clone, Copy, Debug, Default)]
pub struct FloatBurner {
    /// Accumulator
    x: f64,
}
//
impl Burner for FloatBurner {
    fn burn(&mut self, iterations: u32) {
        let mut x = self.x;
        for _ in 0..iterations {
            x = (x + 1.0000001) * 1.0000002;
            if x > 1e12 {
                x %= 123456.789;
            }
        }
        self.x = std::hint::black_box(x);
    }
}

/// Builds the burner of each CPU slot
pub type BurnerFactory = Arc<dyn Fn(usize) -> Box<dyn Burner + Send> + Send + Sync>;

/// Optional collaborators of CPU workers
#[derive(Clone)]
pub struct CpuHooks {
    /// Source of busy computation, called once per CPU slot
    pub burner: BurnerFactory,

    /// Where worker termination is reported
    pub events: Option<Sender<PressureEvent>>,
}
//
impl Default for CpuHooks {
    fn default() -> Self {
        Self {
            burner: Arc::new(|_slot| -> Box<dyn Burner + Send> { Box::new(FloatBurner::default()) }),
            events: None,
        }
    }
}

/// A CPU worker had to be retired
#[derive(Debug, Error)]
pub enum WorkerFailure {
    /// The operating system refused to create the worker thread
    #[error("failed to spawn worker thread ({0})")]
    Spawn(#[from] io::Error),

    /// The worker panicked
    #[error("worker panicked ({0})")]
    Panicked(String),
}

/// Ongoing CPU pressure generation
pub struct CpuPressureController {
    /// Mechanism to tell all workers to stop
    stop: StopSignal,

    /// Worker threads, `None` for workers that could not be spawned or were
    /// already joined
    workers: Vec<Option<JoinHandle<()>>>,

    /// Current busy fraction of each worker, as f64 bits
    busy: Arc<[CachePadded<AtomicU64>]>,

    /// Number of workers that are still running
    live: Arc<AtomicUsize>,
}
//
impl CpuPressureController {
    /// Start CPU pressure workers with default hooks
    pub fn start(plan: &CpuPlan, duration: Duration) -> Self {
        Self::start_with(plan, duration, CpuHooks::default())
    }

    /// Start CPU pressure workers
    ///
    /// Workers run for `duration` unless stopped earlier. Workers that fail
    /// to spawn are reported through `hooks.events` and otherwise ignored.
    ///
    pub fn start_with(plan: &CpuPlan, duration: Duration, hooks: CpuHooks) -> Self {
        let epoch = Instant::now();
        let deadline = epoch + duration;
        let stop = StopSignal::new();
        let busy = std::iter::repeat_with(|| CachePadded::new(AtomicU64::new(0f64.to_bits())))
            .take(plan.workers)
            .collect::<Arc<[_]>>();
        let live = Arc::new(AtomicUsize::new(0));
        let cycle = DutyCycle::new(plan.duty_on, plan.duty_off, plan.ramp_step);
        log::info!(
            "Starting {} CPU worker(s) for {duration:?} with duty cycle {:?} on / {:?} off, ramp {} every {:?}",
            plan.workers,
            plan.duty_on,
            plan.duty_off,
            plan.ramp_step,
            plan.ramp_every,
        );

        let cpus = if plan.pin_workers {
            match worker::allowed_cpus() {
                Ok(cpus) if !cpus.is_empty() => Some(cpus),
                Ok(_) => None,
                Err(e) => {
                    log::warn!("Can't query CPU affinity, workers won't be pinned ({e})");
                    None
                }
            }
        } else {
            None
        };

        let workers = (0..plan.workers)
            .map(|slot| {
                let context = WorkerContext {
                    slot,
                    cycle,
                    ramp_every: plan.ramp_every,
                    epoch,
                    start_at: epoch
                        .checked_add(start_offset(slot, plan.ramp_every, plan.stagger_workers))
                        .map_or(deadline, |start_at| start_at.min(deadline)),
                    deadline,
                    pin: cpus.as_ref().map(|cpus| cpus[slot % cpus.len()]),
                    stop: stop.clone(),
                    busy: busy.clone(),
                };
                let burner = (hooks.burner)(slot);
                let events = hooks.events.clone();
                let live2 = live.clone();
                let busy2 = busy.clone();
                live.fetch_add(1, Ordering::Relaxed);
                let spawned = std::thread::Builder::new()
                    .name(format!("cpu-worker-{slot}"))
                    .spawn(move || {
                        let result =
                            std::panic::catch_unwind(AssertUnwindSafe(|| context.run(burner)))
                                .map_err(|payload| WorkerFailure::Panicked(panic_message(&*payload)));
                        busy2[slot].store(0f64.to_bits(), Ordering::Relaxed);
                        live2.fetch_sub(1, Ordering::Relaxed);
                        if let Err(failure) = &result {
                            log::error!("CPU worker #{slot} retired: {failure}");
                        }
                        if let Some(events) = events {
                            let _ = events.send(PressureEvent::CpuWorker { slot, result });
                        }
                    });
                match spawned {
                    Ok(handle) => Some(handle),
                    Err(e) => {
                        live.fetch_sub(1, Ordering::Relaxed);
                        let failure = WorkerFailure::Spawn(e);
                        log::error!("CPU worker #{slot} retired: {failure}");
                        if let Some(events) = &hooks.events {
                            let _ = events.send(PressureEvent::CpuWorker {
                                slot,
                                result: Err(failure),
                            });
                        }
                        None
                    }
                }
            })
            .collect();
        Self {
            stop,
            workers,
            busy,
            live,
        }
    }

    /// Number of CPU slots
    pub fn worker_count(&self) -> usize {
        self.busy.len()
    }

    /// Number of workers that are still running
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }

    /// Current busy fraction of each worker, zero for stopped workers
    pub fn busy_fractions(&self) -> impl Iterator<Item = f64> + '_ {
        self.busy
            .iter()
            .map(|slot| f64::from_bits(slot.load(Ordering::Relaxed)))
    }

    /// Average busy fraction across CPU slots
    pub fn mean_busy_fraction(&self) -> f64 {
        if self.busy.is_empty() {
            return 0.0;
        }
        self.busy_fractions().sum::<f64>() / self.busy.len() as f64
    }

    /// Tell all workers to stop and wait for them
    ///
    /// Workers notice the request between two spin batches or immediately if
    /// they are sleeping. Calling this again afterwards does nothing.
    ///
    pub fn stop(&mut self) {
        self.stop.raise();
        let mut joined = 0;
        for handle in self.workers.iter_mut().filter_map(Option::take) {
            // Panics are caught inside of the worker
            let _ = handle.join();
            joined += 1;
        }
        if joined > 0 {
            log::info!("Stopped {joined} CPU worker(s)");
        }
    }
}
//
impl Drop for CpuPressureController {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use proptest::prelude::*;
    use std::sync::mpsc;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn plan(workers: usize, on: Duration, off: Duration) -> CpuPlan {
        CpuPlan {
            workers,
            duty_on: on,
            duty_off: off,
            ramp_every: None,
            ramp_step: 0.0,
            pin_workers: false,
            stagger_workers: false,
        }
    }

    fn assert_close(actual: Duration, expected: Duration) {
        let diff = if actual > expected {
            actual - expected
        } else {
            expected - actual
        };
        assert!(
            diff < Duration::from_micros(1),
            "{actual:?} is not close to {expected:?}"
        );
    }

    #[test]
    fn ramp_scenario() {
        let cycle = DutyCycle::new(ms(700), ms(300), 0.05);
        assert_eq!(cycle.period(), ms(1000));
        assert_eq!(
            cycle.after_ramp_ticks(0),
            DutyPhase {
                on: ms(700),
                off: ms(300)
            }
        );
        let ramped = cycle.after_ramp_ticks(3);
        assert_close(ramped.on, ms(850));
        assert_close(ramped.off, ms(150));
        assert_eq!(ramped.on + ramped.off, ms(1000));
    }

    #[test]
    fn ramp_saturation() {
        let cycle = DutyCycle::new(ms(700), ms(300), 0.1);
        let saturated = DutyPhase {
            on: ms(1000),
            off: Duration::ZERO,
        };
        assert_eq!(cycle.after_ramp_ticks(3), saturated);
        assert_eq!(cycle.after_ramp_ticks(4), saturated);
        assert_eq!(cycle.after_ramp_ticks(u64::MAX), saturated);
        assert_eq!(saturated.busy_fraction(), 1.0);
    }

    #[test]
    fn no_ramp() {
        let cycle = DutyCycle::new(ms(700), ms(300), 0.0);
        assert_eq!(cycle.after_ramp_ticks(0), cycle.after_ramp_ticks(1000));
    }

    #[test]
    fn continuous_busy() {
        let cycle = DutyCycle::new(ms(10), Duration::ZERO, 0.5);
        assert_eq!(cycle.after_ramp_ticks(0).busy_fraction(), 1.0);
        assert_eq!(cycle.after_ramp_ticks(7).off, Duration::ZERO);
    }

    proptest! {
        #[test]
        fn busy_fraction_ramps_up(
            on_ms in 0..10_000u64,
            off_ms in 1..10_000u64,
            ramp_step in 0.0..=1.0f64,
        ) {
            let cycle = DutyCycle::new(ms(on_ms), ms(off_ms), ramp_step);
            let mut last_fraction = 0.0;
            for ticks in 0..50 {
                let phase = cycle.after_ramp_ticks(ticks);
                prop_assert_eq!(phase.on + phase.off, cycle.period());
                let fraction = phase.busy_fraction();
                prop_assert!(fraction >= last_fraction);
                prop_assert!((0.0..=1.0).contains(&fraction));
                last_fraction = fraction;
            }
        }
    }

    #[test]
    fn ramp_clock() {
        let epoch = Instant::now();
        let every = Some(Duration::from_secs(15));
        assert_eq!(ramp_ticks(epoch, epoch, every), 0);
        assert_eq!(ramp_ticks(epoch, epoch + ms(14_999), every), 0);
        assert_eq!(ramp_ticks(epoch, epoch + ms(15_000), every), 1);
        assert_eq!(ramp_ticks(epoch, epoch + ms(45_001), every), 3);
        assert_eq!(ramp_ticks(epoch, epoch + ms(45_001), None), 0);
        assert_eq!(ramp_ticks(epoch + ms(10), epoch, every), 0);
    }

    #[test]
    fn worker_start_offsets() {
        let every = Some(Duration::from_secs(15));
        assert_eq!(start_offset(0, every, true), Duration::ZERO);
        assert_eq!(start_offset(3, every, true), Duration::from_secs(45));
        assert_eq!(start_offset(3, every, false), Duration::ZERO);
        assert_eq!(start_offset(3, None, true), Duration::ZERO);
    }

    #[test]
    fn run_to_completion() {
        let (events_in, events_out) = mpsc::channel();
        let start = Instant::now();
        let mut controller = CpuPressureController::start_with(
            &plan(2, ms(20), ms(20)),
            ms(300),
            CpuHooks {
                events: Some(events_in),
                ..Default::default()
            },
        );
        assert_eq!(controller.worker_count(), 2);
        std::thread::sleep(ms(100));
        assert!(controller.busy_fractions().all(|fraction| fraction == 0.5));
        assert_eq!(controller.mean_busy_fraction(), 0.5);
        let mut slots = Vec::new();
        for _ in 0..2 {
            match events_out.recv_timeout(Duration::from_secs(5)) {
                Ok(PressureEvent::CpuWorker { slot, result }) => {
                    assert_matches!(result, Ok(()));
                    slots.push(slot);
                }
                other => panic!("Unexpected worker event {other:?}"),
            }
        }
        slots.sort_unstable();
        assert_eq!(slots, [0, 1]);
        assert!(start.elapsed() >= ms(300));
        assert_eq!(controller.live_workers(), 0);
        assert_eq!(controller.mean_busy_fraction(), 0.0);
        controller.stop();
    }

    #[test]
    fn stop_is_bounded() {
        for (on, off) in [(ms(50), ms(50)), (ms(500), Duration::ZERO), (ms(1), ms(900))] {
            let mut controller =
                CpuPressureController::start(&plan(2, on, off), Duration::from_secs(3600));
            std::thread::sleep(ms(100));
            assert_eq!(controller.live_workers(), 2);
            let start = Instant::now();
            controller.stop();
            assert!(
                start.elapsed() < Duration::from_secs(1),
                "Stopping took {:?}",
                start.elapsed()
            );
            assert_eq!(controller.live_workers(), 0);
            controller.stop();
        }
    }

    #[test]
    fn worker_failure_is_isolated() {
        struct Panicker;
        impl Burner for Panicker {
            fn burn(&mut self, _iterations: u32) {
                panic!("simulated scheduling failure");
            }
        }
        let (events_in, events_out) = mpsc::channel();
        let mut controller = CpuPressureController::start_with(
            &plan(2, ms(10), ms(10)),
            ms(200),
            CpuHooks {
                burner: Arc::new(|slot| -> Box<dyn Burner + Send> {
                    if slot == 0 {
                        Box::new(Panicker)
                    } else {
                        Box::new(FloatBurner::default())
                    }
                }),
                events: Some(events_in),
            },
        );
        assert_matches!(
            events_out.recv_timeout(Duration::from_secs(5)),
            Ok(PressureEvent::CpuWorker { slot: 0, result: Err(WorkerFailure::Panicked(message)) })
                if message == "simulated scheduling failure"
        );
        assert_matches!(
            events_out.recv_timeout(Duration::from_secs(5)),
            Ok(PressureEvent::CpuWorker {
                slot: 1,
                result: Ok(())
            })
        );
        controller.stop();
    }

    #[test]
    fn stagger_beyond_session_end() {
        let plan = CpuPlan {
            ramp_every: Some(crate::config::MAX_DURATION),
            stagger_workers: true,
            ..plan(3, ms(1), ms(1))
        };
        let mut controller = CpuPressureController::start(&plan, crate::config::MAX_DURATION);
        std::thread::sleep(ms(50));
        assert_eq!(controller.live_workers(), 3);
        let start = Instant::now();
        controller.stop();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(controller.live_workers(), 0);
    }

    #[test]
    fn no_workers() {
        let mut controller = CpuPressureController::start(&plan(0, ms(1), ms(1)), ms(10));
        assert_eq!(controller.worker_count(), 0);
        assert_eq!(controller.mean_busy_fraction(), 0.0);
        controller.stop();
    }
}
