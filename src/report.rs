//! Startup and final host resource reports

use pressure::{
    cgroup::{self, CgroupProbe, Stats},
    HumanBytes,
};
use sysinfo::System;

/// cgroup CPU statistics that are worth comparing before/after a session
const CPU_STAT_KEYS: [&str; 3] = ["nr_periods", "nr_throttled", "throttled_usec"];

/// Resource state at the start of a session, for later comparison
pub struct Baseline {
    /// cgroup CPU statistics
    cpu_stat: Stats,
}

/// Log cgroup limits and host memory, return a baseline for `log_final`
pub fn log_startup(probe: &CgroupProbe) -> Baseline {
    log::info!("=== cgroup limits ===");
    if probe.is_mounted() {
        match probe.memory_limit() {
            Some(limit) => log::info!("memory limit: {}", HumanBytes(limit)),
            None => log::info!("memory limit: unlimited"),
        }
        match probe.cpu_quota() {
            Some(quota) => log::info!(
                "CPU quota: {}/{} (~{:.2} CPUs)",
                quota.quota_us,
                quota.period_us,
                quota.effective_cpus()
            ),
            None => log::info!("CPU quota: unlimited"),
        }
    } else {
        log::warn!("No cgroup filesystem found, limits are unknown");
    }

    let mut system = System::new();
    system.refresh_memory();
    log::info!(
        "host memory: {} total, {} available",
        HumanBytes(system.total_memory()),
        HumanBytes(system.available_memory())
    );
    log::info!("=====================");

    Baseline {
        cpu_stat: probe.cpu_stat(),
    }
}

/// Log memory usage, memory events and CPU throttling at the end of a session
pub fn log_final(probe: &CgroupProbe, baseline: &Baseline) {
    let or_na = |bytes: Option<u64>| {
        bytes.map_or_else(|| "n/a".to_owned(), |bytes| HumanBytes(bytes).to_string())
    };
    log::info!(
        "[final] cgroup current={} peak={} rss={}",
        or_na(probe.memory_current()),
        or_na(probe.memory_peak()),
        or_na(cgroup::self_rss())
    );

    let events = probe.memory_events();
    if !events.is_empty() {
        let events = events
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect::<Vec<_>>()
            .join(" ");
        log::info!("[final] memory events: {events}");
    }

    let cpu_stat = probe.cpu_stat();
    let deltas = CPU_STAT_KEYS
        .iter()
        .filter_map(|&key| Some(format!("{key}+{}", cpu_stat.delta(&baseline.cpu_stat, key)?)))
        .collect::<Vec<_>>();
    if !deltas.is_empty() {
        log::info!("[final] CPU throttling: {}", deltas.join(" "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn startup_and_final() {
        let dir = TempDir::new().unwrap();
        let probe = CgroupProbe::with_root(dir.path());
        assert!(!probe.is_mounted());
        assert!(log_startup(&probe).cpu_stat.is_empty());

        fs::write(dir.path().join("cgroup.controllers"), "cpu memory\n").unwrap();
        fs::write(dir.path().join("cpu.stat"), "nr_periods 10\nnr_throttled 2\n").unwrap();
        assert!(probe.is_mounted());
        let baseline = log_startup(&probe);
        assert_eq!(baseline.cpu_stat.get("nr_periods"), Some(10));
        log_final(&probe, &baseline);
    }
}
