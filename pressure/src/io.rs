//! I/O pressure generation
//!
//! A single thread writes a burst of data to a scratch file, flushes it to
//! storage and removes the file. This runs once per session, alongside the
//! memory and CPU pressure.

use crate::{budget::HumanBytes, config::IoPlan, event::PressureEvent, stop::StopSignal};
use std::{
    io::{self, Write},
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc::Sender,
        Arc,
    },
    thread::JoinHandle,
    time::Instant,
};
use thiserror::Error;

/// The I/O burst could not be completed
#[derive(Debug, Error)]
pub enum IoFailure {
    /// The scratch file could not be created
    #[error("failed to create scratch file ({0})")]
    Create(#[source] io::Error),

    /// Writing or flushing the scratch file failed
    #[error("failed to write scratch file after {written} bytes ({source})")]
    Write {
        /// Bytes written before the failure
        written: u64,

        /// Underlying error
        source: io::Error,
    },
}

/// Ongoing I/O pressure generation
pub struct IoPressureController {
    /// Mechanism to interrupt the burst
    stop: StopSignal,

    /// Bytes written so far
    written: Arc<AtomicU64>,

    /// Writer thread
    writer: Option<JoinHandle<()>>,
}
//
impl IoPressureController {
    /// Start writing an I/O burst
    ///
    /// The outcome of the burst is reported through `events`.
    ///
    pub fn start(plan: &IoPlan, events: Option<Sender<PressureEvent>>) -> io::Result<Self> {
        log::info!(
            "Writing {} of scratch data to {}",
            HumanBytes(plan.burst_bytes),
            plan.dir.display()
        );
        let stop = StopSignal::new();
        let written = Arc::new(AtomicU64::new(0));
        let burst = Burst {
            plan: plan.clone(),
            stop: stop.clone(),
            written: written.clone(),
        };
        let writer = std::thread::Builder::new()
            .name("io-burst".into())
            .spawn(move || {
                let result = burst.run();
                if let Some(events) = events {
                    let _ = events.send(PressureEvent::Io(result));
                }
            })?;
        Ok(Self {
            stop,
            written,
            writer: Some(writer),
        })
    }

    /// Number of bytes written so far
    pub fn bytes_written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Interrupt the burst if needed and wait for the writer to exit
    pub fn stop(&mut self) {
        self.stop.raise();
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                log::error!("I/O burst thread panicked");
            }
        }
    }
}
//
impl Drop for IoPressureController {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Size of each write
const CHUNK_BYTES: usize = 1 << 20;

/// State of the I/O burst thread
struct Burst {
    plan: IoPlan,
    stop: StopSignal,
    written: Arc<AtomicU64>,
}
//
impl Burst {
    /// Write the burst, return the number of bytes that were written
    fn run(self) -> Result<u64, IoFailure> {
        let start = Instant::now();
        // Removed from disk on drop, whatever happens
        let mut file = tempfile::Builder::new()
            .prefix("pressure_")
            .suffix(".bin")
            .tempfile_in(&self.plan.dir)
            .map_err(IoFailure::Create)?;
        let chunk = vec![0u8; CHUNK_BYTES];
        let mut written = 0u64;
        let io_error = |written, source| IoFailure::Write { written, source };
        while written < self.plan.burst_bytes && !self.stop.is_raised() {
            let len = (self.plan.burst_bytes - written).min(CHUNK_BYTES as u64) as usize;
            file.write_all(&chunk[..len]).map_err(|e| io_error(written, e))?;
            written += len as u64;
            self.written.store(written, Ordering::Relaxed);
        }
        // The file is about to be deleted, flushing it would only delay the stop
        if !self.stop.is_raised() {
            file.as_file().sync_all().map_err(|e| io_error(written, e))?;
        }
        let elapsed = start.elapsed();
        log::info!(
            "I/O burst wrote {} in {elapsed:.2?}{}",
            HumanBytes(written),
            if written < self.plan.burst_bytes {
                " (interrupted)"
            } else {
                ""
            }
        );
        Ok(written)
    }
}
