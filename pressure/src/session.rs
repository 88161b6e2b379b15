//! Pressure session lifecycle
//!
//! A session starts memory, CPU and I/O pressure, watches them from the
//! caller's thread until something tells it to stop, then tears everything
//! down. Teardown happens on every exit path, including panics of the
//! monitoring code, so that memory is always released.

use crate::{
    budget::HumanBytes,
    cgroup::{CgroupProbe, LimitProbe},
    config::{ConfigError, PressureConfig, SessionPlan},
    cpu::{BurnerFactory, CpuHooks, CpuPressureController},
    event::PressureEvent,
    io::IoPressureController,
    memory::{
        BlockAllocator, GrowthHooks, MemoryEvent, MemoryPhase, MemoryPressureController,
        MemoryStartError,
    },
    panic_message,
    sink::{as_secs, StatusLine, StatusSink},
    stop::StopSignal,
};
use serde::Serialize;
use std::{
    io,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU8, Ordering},
        mpsc::{self, Receiver, RecvTimeoutError},
        Arc,
    },
    time::{Duration, Instant},
};
use thiserror::Error;

/// Run a pressure session to completion
///
/// This is a shorthand for `PressureSession::new(config)?.run(sink)`, for
/// callers that don't need to stop the session early.
///
pub fn run_session(
    config: &PressureConfig,
    sink: impl StatusSink,
) -> Result<SessionResult, SessionError> {
    PressureSession::new(config)?.run(sink)
}

/// Lifecycle state of a pressure session
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u8)]
pub enum SessionState {
    /// Configured, not started yet
    Idle = 0,

    /// Starting pressure controllers
    Starting = 1,

    /// Generating pressure
    Running = 2,

    /// Tearing pressure controllers down
    Stopping = 3,

    /// Everything was released
    Stopped = 4,
}
//
impl SessionState {
    /// Decode the atomic representation
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Idle,
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Stopping,
            4 => Self::Stopped,
            _ => unreachable!("Invalid session state {value}"),
        }
    }
}

/// State shared between a session and its handles
#[derive(Debug)]
struct SessionShared {
    /// Current `SessionState`
    state: AtomicU8,

    /// External stop request
    stop: StopSignal,
}
//
impl SessionShared {
    /// Move to a new lifecycle state
    fn enter(&self, state: SessionState) {
        log::debug!("Pressure session is now {state:?}");
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Remote control of a pressure session, usable from any thread
#[derive(Clone, Debug)]
pub struct SessionHandle(Arc<SessionShared>);
//
impl SessionHandle {
    /// Ask the session to stop
    ///
    /// The session notices within one monitoring poll period, then tears
    /// down its pressure controllers. Requesting a stop before the session
    /// is started makes it stop as soon as it is running.
    ///
    pub fn request_stop(&self) {
        if !self.0.stop.is_raised() {
            log::info!("Pressure session stop requested");
        }
        self.0.stop.raise();
    }

    /// Current lifecycle state of the session
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.0.state.load(Ordering::Acquire))
    }
}

/// Why a pressure session stopped
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub enum StopReason {
    /// The configured duration elapsed
    DurationElapsed,

    /// Someone requested a stop through a `SessionHandle`
    ExternalSignal,

    /// The host refused to provide more memory
    ResourceExhausted,

    /// Every CPU worker failed, or the memory growth thread crashed
    WorkerFailure,
}

/// Outcome of a pressure session
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SessionResult {
    /// Highest amount of memory held at once
    pub peak_memory_bytes: u64,

    /// Time from session start to the end of teardown, serialized as seconds
    #[serde(rename = "total_duration_observed_seconds", serialize_with = "as_secs")]
    pub total_duration_observed: Duration,

    /// Why the session stopped
    pub stop_reason: StopReason,

    /// Number of CPU workers that were retired because of a failure
    pub failed_workers: usize,

    /// Bytes written by the I/O burst
    pub io_bytes_written: u64,
}

/// Pressure session failure
#[derive(Debug, Error)]
pub enum SessionError {
    /// The configuration was rejected before anything was started
    #[error("invalid configuration ({0})")]
    InvalidConfig(#[from] ConfigError),

    /// A pressure thread could not be spawned
    #[error("failed to spawn pressure thread ({0})")]
    Spawn(#[source] io::Error),

    /// The session monitor panicked, resources were released anyway
    #[error("session monitor panicked ({0})")]
    Panicked(String),
}
//
impl From<MemoryStartError> for SessionError {
    fn from(e: MemoryStartError) -> Self {
        match e {
            MemoryStartError::InvalidConfig(e) => Self::InvalidConfig(e),
            MemoryStartError::Spawn(e) => Self::Spawn(e),
        }
    }
}

/// Single-use pressure session
pub struct PressureSession {
    /// Checked configuration
    plan: SessionPlan,

    /// Replacement memory allocator
    allocator: Option<Box<dyn BlockAllocator + Send>>,

    /// Replacement memory limit probe
    limit_probe: Option<Box<dyn LimitProbe + Send>>,

    /// Replacement CPU burner
    burner: Option<BurnerFactory>,

    /// State shared with handles
    shared: Arc<SessionShared>,
}
//
impl PressureSession {
    /// Check the configuration and prepare a session
    pub fn new(config: &PressureConfig) -> Result<Self, SessionError> {
        Ok(Self {
            plan: config.resolve()?,
            allocator: None,
            limit_probe: None,
            burner: None,
            shared: Arc::new(SessionShared {
                state: AtomicU8::new(SessionState::Idle as u8),
                stop: StopSignal::new(),
            }),
        })
    }

    /// Allocate memory blocks with a custom allocator
    pub fn with_allocator(mut self, allocator: impl BlockAllocator + Send + 'static) -> Self {
        self.allocator = Some(Box::new(allocator));
        self
    }

    /// Query memory usage and limit from a custom source
    ///
    /// The probe is only used if the configuration asks for the memory
    /// limit to be respected.
    ///
    pub fn with_limit_probe(mut self, probe: impl LimitProbe + Send + 'static) -> Self {
        self.limit_probe = Some(Box::new(probe));
        self
    }

    /// Keep CPUs busy with custom computations
    pub fn with_burner(mut self, burner: BurnerFactory) -> Self {
        self.burner = Some(burner);
        self
    }

    /// Get a handle to this session
    pub fn handle(&self) -> SessionHandle {
        SessionHandle(self.shared.clone())
    }

    /// Run the session until it stops, reporting status to `sink`
    pub fn run(self, mut sink: impl StatusSink) -> Result<SessionResult, SessionError> {
        let start = Instant::now();
        let shared = self.shared.clone();
        let (events_in, events_out) = mpsc::channel();
        let mut controllers = Controllers::default();

        shared.enter(SessionState::Starting);
        let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
            let plan = self.plan.clone();
            controllers.start(self, &events_in)?;
            shared.enter(SessionState::Running);
            let mut monitor = Monitor {
                plan: &plan,
                shared: &shared,
                controllers: &controllers,
                events: &events_out,
                start,
                failed_workers: 0,
            };
            let stop_reason = monitor.run(&mut sink);
            sink.record(&controllers.status(start));
            Ok::<_, SessionError>((stop_reason, monitor.failed_workers))
        }));

        shared.enter(SessionState::Stopping);
        let peak_memory_bytes = controllers.peak_memory_bytes();
        let io_bytes_written = controllers.io_bytes_written();
        controllers.teardown();
        shared.enter(SessionState::Stopped);

        let (stop_reason, failed_workers) = match outcome {
            Ok(result) => result?,
            Err(payload) => {
                let message = panic_message(&*payload);
                log::error!("Pressure session monitor panicked: {message}");
                return Err(SessionError::Panicked(message));
            }
        };
        let result = SessionResult {
            peak_memory_bytes,
            total_duration_observed: start.elapsed(),
            stop_reason,
            failed_workers,
            io_bytes_written,
        };
        log::info!(
            "Pressure session stopped ({:?}) after {:.2?}, peak memory {}",
            result.stop_reason,
            result.total_duration_observed,
            HumanBytes(result.peak_memory_bytes)
        );
        Ok(result)
    }
}

/// Pressure controllers of a session, in start order
#[derive(Default)]
struct Controllers {
    memory: Option<MemoryPressureController>,
    cpu: Option<CpuPressureController>,
    io: Option<IoPressureController>,
}
//
impl Controllers {
    /// Start memory, then CPU, then I/O pressure
    fn start(
        &mut self,
        session: PressureSession,
        events: &mpsc::Sender<PressureEvent>,
    ) -> Result<(), SessionError> {
        let PressureSession {
            plan,
            allocator,
            limit_probe,
            burner,
            ..
        } = session;

        let mut memory_hooks = GrowthHooks {
            events: Some(events.clone()),
            ..Default::default()
        };
        if let Some(allocator) = allocator {
            memory_hooks.allocator = allocator;
        }
        if plan.memory.respect_limit {
            memory_hooks.limit_probe =
                Some(limit_probe.unwrap_or_else(|| Box::new(CgroupProbe::new())));
        }
        self.memory = Some(MemoryPressureController::start_with(
            plan.memory.budget,
            plan.memory.block_bytes,
            plan.memory.interval,
            memory_hooks,
        )?);

        let mut cpu_hooks = CpuHooks {
            events: Some(events.clone()),
            ..Default::default()
        };
        if let Some(burner) = burner {
            cpu_hooks.burner = burner;
        }
        self.cpu = Some(CpuPressureController::start_with(
            &plan.cpu,
            plan.duration,
            cpu_hooks,
        ));

        match &plan.io {
            Some(io_plan) => match IoPressureController::start(io_plan, Some(events.clone())) {
                Ok(io) => self.io = Some(io),
                Err(e) => log::error!("Failed to start I/O pressure, going on without it ({e})"),
            },
            None => log::info!("I/O pressure is disabled"),
        }
        Ok(())
    }

    /// Current session status
    fn status(&self, start: Instant) -> StatusLine {
        let (allocated_bytes, memory_phase) = match &self.memory {
            Some(memory) => (memory.current_allocated_bytes(), memory.phase()),
            None => (0, MemoryPhase::Released),
        };
        StatusLine {
            elapsed: start.elapsed(),
            allocated_bytes,
            memory_phase,
            cpu_busy_fraction: self.cpu.as_ref().map_or(0.0, |cpu| cpu.mean_busy_fraction()),
            live_workers: self.cpu.as_ref().map_or(0, |cpu| cpu.live_workers()),
            io_bytes_written: self.io_bytes_written(),
        }
    }

    /// Highest amount of memory held so far
    fn peak_memory_bytes(&self) -> u64 {
        self.memory
            .as_ref()
            .map_or(0, |memory| memory.peak_allocated_bytes())
    }

    /// Bytes written by the I/O burst so far
    fn io_bytes_written(&self) -> u64 {
        self.io.as_ref().map_or(0, |io| io.bytes_written())
    }

    /// Stop CPU pressure, then I/O pressure, then release memory
    fn teardown(&mut self) {
        if let Some(mut cpu) = self.cpu.take() {
            cpu.stop();
        }
        if let Some(mut io) = self.io.take() {
            io.stop();
        }
        if let Some(mut memory) = self.memory.take() {
            memory.release();
        }
    }
}

/// Upper bound on the time it takes the monitor to notice a stop request
const POLL_PERIOD: Duration = Duration::from_millis(50);

/// Session monitoring loop
struct Monitor<'session> {
    plan: &'session SessionPlan,
    shared: &'session SessionShared,
    controllers: &'session Controllers,
    events: &'session Receiver<PressureEvent>,
    start: Instant,
    failed_workers: usize,
}
//
impl Monitor<'_> {
    /// Watch the session until it must stop
    fn run(&mut self, sink: &mut impl StatusSink) -> StopReason {
        let deadline = self.start + self.plan.duration;
        let mut next_status = self.start + self.plan.status_every;
        loop {
            if self.shared.stop.is_raised() {
                return StopReason::ExternalSignal;
            }
            let now = Instant::now();
            if now >= deadline {
                log::info!("Pressure session duration elapsed");
                return StopReason::DurationElapsed;
            }
            if now >= next_status {
                sink.record(&self.controllers.status(self.start));
                next_status = next_status_after(next_status, now, self.plan.status_every);
                continue;
            }

            let wakeup = deadline.min(next_status).min(now + POLL_PERIOD);
            match self.events.recv_timeout(wakeup.saturating_duration_since(now)) {
                Ok(event) => {
                    if let Some(reason) = self.handle_event(event) {
                        return reason;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    unreachable!("The session keeps its own event sender alive")
                }
            }
        }
    }

    /// Process a pressure controller event, tell if the session must stop
    fn handle_event(&mut self, event: PressureEvent) -> Option<StopReason> {
        match event {
            PressureEvent::Memory(MemoryEvent::SteadyState {
                allocated_bytes,
                reason,
            }) => {
                log::info!(
                    "Memory pressure is steady at {} ({reason:?})",
                    HumanBytes(allocated_bytes)
                );
                None
            }
            PressureEvent::Memory(MemoryEvent::Exhausted {
                allocated_bytes,
                error,
            }) => {
                log::error!(
                    "Stopping early, memory exhausted at {} ({error})",
                    HumanBytes(allocated_bytes)
                );
                Some(StopReason::ResourceExhausted)
            }
            PressureEvent::Memory(MemoryEvent::Failed(message)) => {
                log::error!("Stopping early, memory growth thread crashed ({message})");
                Some(StopReason::WorkerFailure)
            }
            PressureEvent::CpuWorker { result: Ok(()), .. } => None,
            PressureEvent::CpuWorker {
                slot,
                result: Err(failure),
            } => {
                self.failed_workers += 1;
                let workers = self.plan.cpu.workers;
                if self.failed_workers >= workers {
                    log::error!("Stopping early, all {workers} CPU worker(s) failed");
                    Some(StopReason::WorkerFailure)
                } else {
                    log::warn!(
                        "CPU worker #{slot} failed ({failure}), {} of {workers} worker(s) left",
                        workers - self.failed_workers
                    );
                    None
                }
            }
            PressureEvent::Io(Ok(_)) => None,
            PressureEvent::Io(Err(failure)) => {
                log::warn!("I/O pressure failed, going on without it ({failure})");
                None
            }
        }
    }
}

/// Schedule the status report that follows the one due at `due`
///
/// Reports that were missed because the monitor was held up are skipped,
/// rather than recorded in a burst.
///
fn next_status_after(due: Instant, now: Instant, every: Duration) -> Instant {
    let next = due + every;
    if next <= now {
        now + every
    } else {
        next
    }
}
