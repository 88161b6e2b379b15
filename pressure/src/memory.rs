//! Memory pressure generation
//!
//! A dedicated growth thread allocates memory blocks at a paced interval
//! until the budget ceiling is reached. Every block is fully written after
//! allocation, since memory that is merely reserved does not count towards
//! RSS and cgroup usage on overcommitting systems.
//!
//! The block list is owned by the growth thread alone. Other threads observe
//! the controller through atomic snapshots.

use crate::{
    budget::{HumanBytes, SizeBudget},
    cgroup::LimitProbe,
    config::ConfigError,
    event::PressureEvent,
    panic_message,
    stop::StopSignal,
};
use serde::Serialize;
use std::{
    io,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering},
        mpsc::Sender,
        Arc,
    },
    thread::JoinHandle,
    time::{Duration, Instant},
};
use thiserror::Error;

/// Owned memory block
pub type Block = Box<[u8]>;

/// Source of memory blocks
pub trait BlockAllocator {
    /// Allocate and populate a block of `len` bytes
    ///
    /// Failure to allocate must be reported as an error, not as a panic or
    /// process abort.
    ///
    fn allocate(&mut self, len: usize) -> Result<Block, AllocError>;
}

/// Allocator that writes every byte of the blocks it returns
#[derive(Clone, Copy, Debug, Default)]
pub struct TouchingAllocator;
//
impl BlockAllocator for TouchingAllocator {
    fn allocate(&mut self, len: usize) -> Result<Block, AllocError> {
        let mut block = Vec::new();
        block
            .try_reserve_exact(len)
            .map_err(|_| AllocError { requested: len as u64 })?;
        block.resize(len, FILL_BYTE);
        Ok(block.into_boxed_slice())
    }
}
//
/// Nonzero byte used to populate blocks, so that zero-page tricks can't help
const FILL_BYTE: u8 = 0xa5;

/// The host refused a memory allocation
#[derive(Clone, Copy, Debug, Error, Eq, PartialEq)]
#[error("host refused to allocate {requested} bytes")]
pub struct AllocError {
    /// Size of the allocation that failed
    pub requested: u64,
}

/// Failure to start memory pressure generation
#[derive(Debug, Error)]
pub enum MemoryStartError {
    /// Bad memory pressure parameters
    #[error("invalid memory pressure configuration ({0})")]
    InvalidConfig(#[from] ConfigError),

    /// Failed to spawn the growth thread
    #[error("failed to spawn memory growth thread ({0})")]
    Spawn(#[from] io::Error),
}

/// Optional collaborators of the memory growth thread
pub struct GrowthHooks {
    /// Where blocks come from
    pub allocator: Box<dyn BlockAllocator + Send>,

    /// Usage/limit source used to keep headroom below a memory limit
    pub limit_probe: Option<Box<dyn LimitProbe + Send>>,

    /// Where growth termination is reported
    pub events: Option<Sender<PressureEvent>>,
}
//
impl Default for GrowthHooks {
    fn default() -> Self {
        Self {
            allocator: Box::new(TouchingAllocator),
            limit_probe: None,
            events: None,
        }
    }
}

/// Lifecycle phase of memory growth
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MemoryPhase {
    /// Still allocating
    Growing = 0,

    /// Done allocating, holding memory
    Steady = 1,

    /// An allocation failed, holding what was allocated before
    Exhausted = 2,

    /// Stopped before reaching steady state, holding memory
    Interrupted = 3,

    /// All memory was freed
    Released = 4,

    /// The growth thread crashed, its memory was freed while unwinding
    Failed = 5,
}
//
impl MemoryPhase {
    /// Decode the atomic representation
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Growing,
            1 => Self::Steady,
            2 => Self::Exhausted,
            3 => Self::Interrupted,
            4 => Self::Released,
            5 => Self::Failed,
            _ => unreachable!("Invalid memory phase {value}"),
        }
    }
}

/// End of memory growth
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MemoryEvent {
    /// Growth stopped without error
    SteadyState {
        /// Memory held at that point
        allocated_bytes: u64,

        /// Why growth stopped
        reason: SteadyReason,
    },

    /// Growth stopped because the host refused an allocation
    Exhausted {
        /// Memory held at that point
        allocated_bytes: u64,

        /// Failed allocation
        error: AllocError,
    },

    /// The growth thread panicked
    Failed(String),
}

/// Reason why memory growth reached steady state
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SteadyReason {
    /// The budget ceiling has been reached
    CeilingReached,

    /// Memory usage came within headroom of the cgroup memory limit
    LimitHeadroom,
}

/// Size of the next block to allocate, if growth should go on
///
/// Blocks are `block_bytes` large, except for the last one which fills the
/// remaining space below `ceiling_bytes`.
///
pub fn next_block_bytes(allocated_bytes: u64, ceiling_bytes: u64, block_bytes: u64) -> Option<u64> {
    let remaining = ceiling_bytes.checked_sub(allocated_bytes)?;
    (remaining > 0 && block_bytes > 0).then(|| block_bytes.min(remaining))
}

/// Snapshots of the growth thread's state, readable from anywhere
#[derive(Debug)]
struct MemoryShared {
    /// Total size of the blocks held by the growth thread
    allocated: AtomicU64,

    /// Highest value of `allocated` so far
    peak: AtomicU64,

    /// Number of blocks held by the growth thread
    blocks: AtomicUsize,

    /// Current `MemoryPhase`
    phase: AtomicU8,
}

/// Ongoing memory pressure generation
#[derive(Debug)]
pub struct MemoryPressureController {
    /// Shared growth state
    shared: Arc<MemoryShared>,

    /// Mechanism to interrupt growth
    stop: StopSignal,

    /// Growth thread, which hands back its blocks when it exits
    growth_thread: Option<JoinHandle<Vec<Block>>>,

    /// Budget ceiling
    ceiling_bytes: u64,
}
//
impl MemoryPressureController {
    /// Start growing memory toward the budget ceiling with default hooks
    pub fn start(
        budget: SizeBudget,
        block_bytes: u64,
        interval: Duration,
    ) -> Result<Self, MemoryStartError> {
        Self::start_with(budget, block_bytes, interval, GrowthHooks::default())
    }

    /// Start growing memory toward the budget ceiling
    ///
    /// A block is allocated right away, then every `interval`, until the
    /// ceiling is reached, a memory limit gets close, or an allocation
    /// fails.
    ///
    pub fn start_with(
        budget: SizeBudget,
        block_bytes: u64,
        interval: Duration,
        hooks: GrowthHooks,
    ) -> Result<Self, MemoryStartError> {
        if block_bytes == 0 {
            return Err(ConfigError::ZeroBlockSize.into());
        }
        let ceiling_bytes = budget.ceiling_bytes();
        log::info!(
            "Growing memory to {} in blocks of {} every {interval:?} (target {}, headroom {})",
            HumanBytes(ceiling_bytes),
            HumanBytes(block_bytes),
            HumanBytes(budget.target_bytes),
            HumanBytes(budget.headroom_bytes),
        );

        let shared = Arc::new(MemoryShared {
            allocated: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            blocks: AtomicUsize::new(0),
            phase: AtomicU8::new(MemoryPhase::Growing as u8),
        });
        let stop = StopSignal::new();
        let growth = GrowthLoop {
            shared: shared.clone(),
            stop: stop.clone(),
            ceiling_bytes,
            headroom_bytes: budget.headroom_bytes,
            block_bytes,
            interval,
            hooks,
        };
        let growth_thread = std::thread::Builder::new()
            .name("memory-growth".into())
            .spawn(move || {
                let shared = growth.shared.clone();
                let events = growth.hooks.events.clone();
                std::panic::catch_unwind(AssertUnwindSafe(|| growth.run())).unwrap_or_else(
                    |payload| {
                        let message = panic_message(&*payload);
                        log::error!("Memory growth thread panicked: {message}");
                        shared.allocated.store(0, Ordering::Relaxed);
                        shared.blocks.store(0, Ordering::Relaxed);
                        shared
                            .phase
                            .store(MemoryPhase::Failed as u8, Ordering::Release);
                        if let Some(events) = events {
                            let _ = events.send(PressureEvent::Memory(MemoryEvent::Failed(message)));
                        }
                        Vec::new()
                    },
                )
            })?;
        Ok(Self {
            shared,
            stop,
            growth_thread: Some(growth_thread),
            ceiling_bytes,
        })
    }

    /// Amount of memory currently held, in bytes
    pub fn current_allocated_bytes(&self) -> u64 {
        self.shared.allocated.load(Ordering::Relaxed)
    }

    /// Highest amount of memory held so far, in bytes
    pub fn peak_allocated_bytes(&self) -> u64 {
        self.shared.peak.load(Ordering::Relaxed)
    }

    /// Number of memory blocks currently held
    pub fn block_count(&self) -> usize {
        self.shared.blocks.load(Ordering::Relaxed)
    }

    /// Current growth phase
    pub fn phase(&self) -> MemoryPhase {
        MemoryPhase::from_u8(self.shared.phase.load(Ordering::Acquire))
    }

    /// Allocation ceiling
    pub fn ceiling_bytes(&self) -> u64 {
        self.ceiling_bytes
    }

    /// Stop growing and free all memory, return how many bytes were freed
    ///
    /// Calling this again afterwards does nothing and returns 0.
    ///
    pub fn release(&mut self) -> u64 {
        let Some(growth_thread) = self.growth_thread.take() else {
            return 0;
        };
        self.stop.raise();
        let freed = match growth_thread.join() {
            Ok(blocks) => {
                let freed = blocks.iter().map(|block| block.len() as u64).sum();
                std::mem::drop(blocks);
                freed
            }
            // Blocks were freed while unwinding
            Err(_) => {
                log::error!("Memory growth thread panicked");
                self.current_allocated_bytes()
            }
        };
        self.shared.allocated.store(0, Ordering::Relaxed);
        self.shared.blocks.store(0, Ordering::Relaxed);
        self.shared
            .phase
            .store(MemoryPhase::Released as u8, Ordering::Release);
        log::info!("Released {} of memory", HumanBytes(freed));
        freed
    }
}
//
impl Drop for MemoryPressureController {
    fn drop(&mut self) {
        self.release();
    }
}

/// State of the memory growth thread
struct GrowthLoop {
    shared: Arc<MemoryShared>,
    stop: StopSignal,
    ceiling_bytes: u64,
    headroom_bytes: u64,
    block_bytes: u64,
    interval: Duration,
    hooks: GrowthHooks,
}
//
impl GrowthLoop {
    /// Grow memory, return the blocks once growth is over
    fn run(mut self) -> Vec<Block> {
        let mut blocks = Vec::new();
        let mut allocated = 0u64;
        let start = Instant::now();
        let outcome = loop {
            if self.stop.check().is_err() {
                break None;
            }
            let Some(len) = next_block_bytes(allocated, self.ceiling_bytes, self.block_bytes)
            else {
                break Some(Ok(SteadyReason::CeilingReached));
            };
            if self.near_limit() {
                break Some(Ok(SteadyReason::LimitHeadroom));
            }

            let block = match usize::try_from(len)
                .map_err(|_| AllocError { requested: len })
                .and_then(|len| self.hooks.allocator.allocate(len))
            {
                Ok(block) => block,
                Err(error) => break Some(Err(error)),
            };
            debug_assert_eq!(block.len() as u64, len);
            allocated += block.len() as u64;
            blocks.push(block);
            self.publish(allocated, blocks.len());
            log::debug!(
                "Allocated {} in {} block(s)",
                HumanBytes(allocated),
                blocks.len()
            );

            // No need to wait before noticing that the ceiling is reached
            if next_block_bytes(allocated, self.ceiling_bytes, self.block_bytes).is_none() {
                continue;
            }
            if self.stop.sleep(self.interval).is_err() {
                break None;
            }
        };
        self.finish(outcome, allocated, blocks.len(), start.elapsed());
        blocks
    }

    /// Truth that memory usage is within headroom of the memory limit
    fn near_limit(&mut self) -> bool {
        let Some(probe) = self.hooks.limit_probe.as_mut() else {
            return false;
        };
        let Some((usage, limit)) = probe.usage_and_limit() else {
            return false;
        };
        let threshold = limit.saturating_sub(self.headroom_bytes);
        if usage >= threshold {
            log::warn!(
                "Stopping memory growth before headroom breach: usage {} / limit {}",
                HumanBytes(usage),
                HumanBytes(limit)
            );
            true
        } else {
            false
        }
    }

    /// Make the growth state visible to other threads
    fn publish(&self, allocated: u64, num_blocks: usize) {
        self.shared.allocated.store(allocated, Ordering::Relaxed);
        self.shared.peak.fetch_max(allocated, Ordering::Relaxed);
        self.shared.blocks.store(num_blocks, Ordering::Relaxed);
    }

    /// Report how growth ended
    fn finish(
        &mut self,
        outcome: Option<Result<SteadyReason, AllocError>>,
        allocated_bytes: u64,
        num_blocks: usize,
        elapsed: Duration,
    ) {
        let (phase, event) = match outcome {
            Some(Ok(reason)) => {
                log::info!(
                    "Memory growth done: {} in {num_blocks} block(s) after {elapsed:.2?}",
                    HumanBytes(allocated_bytes)
                );
                (
                    MemoryPhase::Steady,
                    Some(MemoryEvent::SteadyState {
                        allocated_bytes,
                        reason,
                    }),
                )
            }
            Some(Err(error)) => {
                log::error!(
                    "Memory growth stopped at {} / {}: {error}",
                    HumanBytes(allocated_bytes),
                    HumanBytes(self.ceiling_bytes)
                );
                (
                    MemoryPhase::Exhausted,
                    Some(MemoryEvent::Exhausted {
                        allocated_bytes,
                        error,
                    }),
                )
            }
            None => {
                log::debug!("Memory growth interrupted at {}", HumanBytes(allocated_bytes));
                (MemoryPhase::Interrupted, None)
            }
        };
        self.shared.phase.store(phase as u8, Ordering::Release);
        if let (Some(event), Some(events)) = (event, &self.hooks.events) {
            // The session may already be gone, that's fine
            let _ = events.send(PressureEvent::Memory(event));
        }
    }
}
