//! Periodic status reporting

use crate::{budget::HumanBytes, memory::MemoryPhase};
use serde::{Serialize, Serializer};
use std::{io::Write, time::Duration};

/// Snapshot of an ongoing pressure session
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StatusLine {
    /// Time since the session started, serialized as seconds
    #[serde(rename = "elapsed_seconds", serialize_with = "as_secs")]
    pub elapsed: Duration,

    /// Memory currently held by the memory controller
    pub allocated_bytes: u64,

    /// Memory growth phase
    pub memory_phase: MemoryPhase,

    /// Average busy fraction of CPU workers
    pub cpu_busy_fraction: f64,

    /// Number of CPU workers that are still running
    pub live_workers: usize,

    /// Bytes written by the I/O burst so far
    pub io_bytes_written: u64,
}

/// Serialize a duration as floating-point seconds
pub(crate) fn as_secs<S: Serializer>(
    duration: &Duration,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Destination of status lines
pub trait StatusSink {
    /// Record a status line
    ///
    /// Sinks must not fail the session, so errors should be logged and
    /// otherwise ignored.
    ///
    fn record(&mut self, status: &StatusLine);
}

/// Log status lines at the info level
#[derive(Clone, Copy, Debug, Default)]
pub struct LogSink;
//
impl StatusSink for LogSink {
    fn record(&mut self, status: &StatusLine) {
        log::info!(
            "[{:>7.1}s] memory {} ({:?}), CPU busy {:.0}% on {} worker(s), I/O {}",
            status.elapsed.as_secs_f64(),
            HumanBytes(status.allocated_bytes),
            status.memory_phase,
            status.cpu_busy_fraction * 100.0,
            status.live_workers,
            HumanBytes(status.io_bytes_written),
        );
    }
}

/// Write status lines as CSV records
pub struct CsvSink<W: Write> {
    /// CSV writer
    writer: csv::Writer<W>,
}
//
impl<W: Write> CsvSink<W> {
    /// Start a CSV timeline, header included
    pub fn new(output: W) -> Self {
        Self {
            writer: csv::Writer::from_writer(output),
        }
    }

    /// Flush buffered records and get the output back
    pub fn into_inner(self) -> Result<W, csv::Error> {
        self.writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }
}
//
impl<W: Write> StatusSink for CsvSink<W> {
    fn record(&mut self, status: &StatusLine) {
        if let Err(e) = self
            .writer
            .serialize(status)
            .and_then(|()| self.writer.flush().map_err(csv::Error::from))
        {
            log::warn!("Failed to write status timeline ({e})");
        }
    }
}
//
impl StatusSink for Vec<StatusLine> {
    fn record(&mut self, status: &StatusLine) {
        self.push(status.clone());
    }
}
//
impl<A: StatusSink, B: StatusSink> StatusSink for (A, B) {
    fn record(&mut self, status: &StatusLine) {
        self.0.record(status);
        self.1.record(status);
    }
}
//
impl<S: StatusSink + ?Sized> StatusSink for &mut S {
    fn record(&mut self, status: &StatusLine) {
        (**self).record(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status(secs: u64, allocated_bytes: u64, memory_phase: MemoryPhase) -> StatusLine {
        StatusLine {
            elapsed: Duration::from_secs(secs),
            allocated_bytes,
            memory_phase,
            cpu_busy_fraction: 0.75,
            live_workers: 2,
            io_bytes_written: 0,
        }
    }

    #[test]
    fn csv_timeline() {
        let mut sink = CsvSink::new(Vec::new());
        sink.record(&status(5, 1024, MemoryPhase::Growing));
        sink.record(&status(10, 2048, MemoryPhase::Steady));
        let output = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert_eq!(
            output,
            "elapsed_seconds,allocated_bytes,memory_phase,cpu_busy_fraction,live_workers,io_bytes_written\n\
             5.0,1024,growing,0.75,2,0\n\
             10.0,2048,steady,0.75,2,0\n"
        );
    }

    #[test]
    fn tee() {
        let mut sink = (Vec::new(), LogSink);
        let line = status(1, 0, MemoryPhase::Released);
        sink.record(&line);
        (&mut sink).record(&line);
        assert_eq!(sink.0, [line.clone(), line]);
    }
}
