//! Notifications sent by pressure controllers to the session

use crate::{cpu::WorkerFailure, io::IoFailure, memory::MemoryEvent};

/// Something noteworthy happened in a pressure controller
#[derive(Debug)]
pub enum PressureEvent {
    /// Memory growth is over, for better or worse
    Memory(MemoryEvent),

    /// A CPU worker exited
    CpuWorker {
        /// CPU slot of the worker
        slot: usize,

        /// How the worker exited
        result: Result<(), WorkerFailure>,
    },

    /// The I/O burst is over
    Io(Result<u64, IoFailure>),
}
