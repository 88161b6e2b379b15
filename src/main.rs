//! Controllable memory and CPU pressure, for exercising OOM killers,
//! autoscalers, cgroup limits and alerting thresholds

#![deny(missing_docs)]

mod report;
mod units;

use clap::Parser;
use pressure::{
    cgroup::CgroupProbe, CsvSink, LogSink, PressureConfig, PressureSession, SessionError,
};
use simplelog::{
    ColorChoice, CombinedLogger, ConfigBuilder, LevelFilter, TermLogger, TerminalMode, WriteLogger,
};
use std::{
    fs::{File, OpenOptions},
    io,
    path::PathBuf,
    process::ExitCode,
};
use thiserror::Error;

/// Grow memory and CPU usage on a slow ramp, then release everything
#[derive(Parser, Debug)]
#[clap(author, version, about, after_help = PRESETS)]
struct CliArgs {
    /// Amount of memory to hold once growth is over (e.g. 8Gi, 512Mi, 1.5G)
    #[clap(long, default_value = "8Gi", value_parser = units::parse_size)]
    mem: u64,

    /// Size of each memory allocation step
    #[clap(long, default_value = "64Mi", value_parser = units::parse_size)]
    block: u64,

    /// Seconds between two memory allocation steps
    #[clap(long, default_value = "2.0")]
    mem_interval: f64,

    /// Memory to keep free below the target, and below the cgroup memory limit
    #[clap(long, default_value = "0", value_parser = units::parse_size)]
    headroom: u64,

    /// Number of CPU pressure workers
    #[clap(long, default_value = "2")]
    cpus: u32,

    /// Duration of the whole session, in seconds
    #[clap(long, visible_alias = "duration", default_value = "300")]
    cpu_duration: f64,

    /// Seconds between two CPU intensity increases, 0 disables the ramp
    #[clap(long, default_value = "15.0")]
    cpu_ramp_every: f64,

    /// Fraction of the duty period turned from idle to busy on each ramp step
    #[clap(long, default_value = "0.1")]
    ramp_step: f64,

    /// Initial busy time of each CPU duty cycle, in milliseconds
    #[clap(long, default_value = "700")]
    duty_on: u64,

    /// Initial idle time of each CPU duty cycle, in milliseconds
    #[clap(long, default_value = "300")]
    duty_off: u64,

    /// Amount of data written to a scratch file, 0 disables I/O pressure
    #[clap(long, default_value = "0", value_parser = units::parse_size)]
    io_size: u64,

    /// Directory of the I/O scratch file [default: system temporary directory]
    #[clap(long)]
    io_dir: Option<PathBuf>,

    /// Don't pin CPU workers to CPUs
    #[clap(long)]
    no_affinity: bool,

    /// Start all CPU workers at once instead of one ramp period apart
    #[clap(long)]
    no_stagger: bool,

    /// Keep growing memory even when close to the cgroup memory limit
    #[clap(long)]
    ignore_cgroup_limit: bool,

    /// Seconds between two status reports
    #[clap(long, default_value = "5.0")]
    status_every: f64,

    /// Also log to this file, in append mode
    #[clap(long)]
    logfile: Option<PathBuf>,

    /// Write a CSV timeline of status reports to this file
    #[clap(long)]
    timeline: Option<PathBuf>,

    /// Write a JSON summary of the session to this file
    #[clap(long)]
    summary: Option<PathBuf>,

    /// Log more details (-v for debug output, -vv for trace output)
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}
//
impl CliArgs {
    /// Pressure session configuration
    fn config(&self) -> PressureConfig {
        PressureConfig {
            target_memory_bytes: self.mem,
            memory_block_bytes: self.block,
            memory_interval_seconds: self.mem_interval,
            headroom_bytes: self.headroom,
            cpu_count: self.cpus,
            cpu_duration_seconds: self.cpu_duration,
            cpu_ramp_every_seconds: self.cpu_ramp_every,
            ramp_step: self.ramp_step,
            duty_on_seconds: self.duty_on as f64 / 1000.0,
            duty_off_seconds: self.duty_off as f64 / 1000.0,
            io_burst_bytes: self.io_size,
            io_dir: self.io_dir.clone().unwrap_or_else(std::env::temp_dir),
            pin_workers: !self.no_affinity,
            stagger_workers: !self.no_stagger,
            respect_memory_limit: !self.ignore_cgroup_limit,
            status_every_seconds: self.status_every,
        }
    }

    /// Logging verbosity
    fn log_level(&self) -> LevelFilter {
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

/// Common flag combinations
const PRESETS: &str = "\
Presets:
  Slow ramp (the defaults):
    pressurize --mem 8Gi --block 64Mi --mem-interval 2 --cpus 2 \\
      --cpu-duration 300 --cpu-ramp-every 15 --duty-on 700 --duty-off 300
  Fast startup spike, with a scratch file write:
    pressurize --mem 2Gi --block 128Mi --mem-interval 0 --headroom 256Mi \\
      --cpus 2 --duration 30 --cpu-ramp-every 0 --duty-on 1000 --duty-off 0 \\
      --io-size 128Mi --io-dir /tmp";

/// Things that can go wrong in this program
#[derive(Debug, Error)]
enum CliError {
    /// Failed to open the logfile
    #[error("failed to open logfile {0:?} ({1})")]
    Logfile(PathBuf, #[source] io::Error),

    /// Failed to install the logger
    #[error("failed to set up logging ({0})")]
    Logger(#[from] log::SetLoggerError),

    /// Failed to install the SIGINT/SIGTERM handler
    #[error("failed to install signal handler ({0})")]
    Signal(#[from] ctrlc::Error),

    /// The pressure session failed
    #[error("pressure session failed ({0})")]
    Session(#[from] SessionError),

    /// Failed to create an output file
    #[error("failed to create {0:?} ({1})")]
    Output(PathBuf, #[source] io::Error),

    /// Failed to serialize the session summary
    #[error("failed to write session summary ({0})")]
    Summary(#[from] serde_json::Error),
}

fn main() -> ExitCode {
    let args = CliArgs::parse();
    if let Err(e) = init_logging(&args) {
        eprintln!("{e}");
        return ExitCode::FAILURE;
    }
    log::info!("=== start pid={} ===", std::process::id());
    let outcome = run(&args);
    if let Err(e) = &outcome {
        log::error!("{e}");
    }
    log::info!("=== graceful stop ===");
    log::logger().flush();
    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(_) => ExitCode::FAILURE,
    }
}

/// Log to the terminal, and also to the logfile if one was requested
fn init_logging(args: &CliArgs) -> Result<(), CliError> {
    let level = args.log_level();
    let Some(path) = &args.logfile else {
        let env = env_logger::Env::default().default_filter_or(level.to_string());
        env_logger::Builder::from_env(env).try_init()?;
        return Ok(());
    };
    let logfile = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| CliError::Logfile(path.clone(), e))?;
    let config = ConfigBuilder::new()
        .set_time_format_rfc3339()
        .set_target_level(LevelFilter::Off)
        .set_thread_level(LevelFilter::Off)
        .build();
    CombinedLogger::init(vec![
        TermLogger::new(level, config.clone(), TerminalMode::Stdout, ColorChoice::Auto),
        WriteLogger::new(level, config, logfile),
    ])?;
    Ok(())
}

/// Run a pressure session and report on it
fn run(args: &CliArgs) -> Result<(), CliError> {
    let session = PressureSession::new(&args.config())?;
    let handle = session.handle();
    ctrlc::set_handler(move || handle.request_stop())?;

    let probe = CgroupProbe::new();
    let baseline = report::log_startup(&probe);
    let result = match &args.timeline {
        Some(path) => {
            let file = File::create(path).map_err(|e| CliError::Output(path.clone(), e))?;
            let mut timeline = CsvSink::new(file);
            session.run((LogSink, &mut timeline))?
        }
        None => session.run(LogSink)?,
    };
    report::log_final(&probe, &baseline);

    log::info!("Session summary: {}", serde_json::to_string(&result)?);
    if let Some(path) = &args.summary {
        let file = File::create(path).map_err(|e| CliError::Output(path.clone(), e))?;
        serde_json::to_writer_pretty(file, &result)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition() {
        CliArgs::command().debug_assert();
    }

    #[test]
    fn defaults_match_library() {
        let args = CliArgs::try_parse_from(["pressurize"]).unwrap();
        let config = args.config();
        let defaults = PressureConfig::default();
        assert_eq!(config, defaults);
        assert_eq!(args.log_level(), LevelFilter::Info);
    }

    #[test]
    fn startup_spike_preset() {
        let args = CliArgs::try_parse_from([
            "pressurize",
            "--mem",
            "2Gi",
            "--block",
            "128Mi",
            "--mem-interval",
            "0",
            "--headroom",
            "256Mi",
            "--duration",
            "30",
            "--cpu-ramp-every",
            "0",
            "--duty-on",
            "1000",
            "--duty-off",
            "0",
            "--io-size",
            "128Mi",
            "--io-dir",
            "/scratch",
            "--no-affinity",
            "-vv",
        ])
        .unwrap();
        let config = args.config();
        assert_eq!(config.target_memory_bytes, 2 << 30);
        assert_eq!(config.memory_block_bytes, 128 << 20);
        assert_eq!(config.headroom_bytes, 256 << 20);
        assert_eq!(config.cpu_duration_seconds, 30.0);
        assert_eq!(config.duty_on_seconds, 1.0);
        assert_eq!(config.duty_off_seconds, 0.0);
        assert_eq!(config.io_burst_bytes, 128 << 20);
        assert_eq!(config.io_dir, PathBuf::from("/scratch"));
        assert!(!config.pin_workers);
        assert!(config.stagger_workers);
        assert!(config.respect_memory_limit);
        assert_eq!(args.log_level(), LevelFilter::Trace);

        let plan = config.resolve().unwrap();
        assert_eq!(plan.cpu.ramp_every, None);
        assert_eq!(plan.memory.budget.ceiling_bytes(), (2 << 30) - (256 << 20));
    }

    #[test]
    fn bad_size() {
        let error = CliArgs::try_parse_from(["pressurize", "--mem", "lots"]).unwrap_err();
        assert_eq!(error.kind(), clap::error::ErrorKind::ValueValidation);
    }
}
