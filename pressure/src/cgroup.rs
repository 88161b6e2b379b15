//! cgroup v1/v2 introspection
//!
//! Everything here is best-effort: missing or unparseable files are reported
//! as `None` or as empty statistics, never as errors, since the host may not
//! be using cgroups at all.

use std::{
    collections::BTreeMap,
    fs,
    path::PathBuf,
};

/// Source of memory usage and limit measurements
///
/// Used by the memory pressure controller to stay clear of the memory limit.
///
pub trait LimitProbe {
    /// Current memory usage and memory limit in bytes, if both are known
    fn usage_and_limit(&mut self) -> Option<(u64, u64)>;
}

/// Reader of the cgroup pseudo-filesystem
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CgroupProbe {
    /// cgroup filesystem mount point
    root: PathBuf,
}
//
impl CgroupProbe {
    /// Read the cgroup hierarchy of the current process
    pub fn new() -> Self {
        Self::with_root(Self::DEFAULT_ROOT)
    }

    /// Read a cgroup hierarchy mounted at a nonstandard location
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Does the root look like a cgroup v2 or v1 mount?
    pub fn is_mounted(&self) -> bool {
        self.root.join("cgroup.controllers").exists() || self.root.join("memory").is_dir()
    }

    /// Memory limit in bytes, `None` if unlimited or unknown
    pub fn memory_limit(&self) -> Option<u64> {
        match self.read_trimmed("memory.max") {
            Some(v2) => v2.parse().ok(),
            None => self.first_u64(&["memory/memory.limit_in_bytes", "memory.limit_in_bytes"]),
        }
    }

    /// Current memory usage in bytes
    pub fn memory_current(&self) -> Option<u64> {
        self.first_u64(&[
            "memory.current",
            "memory/memory.usage_in_bytes",
            "memory.usage_in_bytes",
        ])
    }

    /// Peak memory usage in bytes
    pub fn memory_peak(&self) -> Option<u64> {
        self.first_u64(&[
            "memory.peak",
            "memory/memory.max_usage_in_bytes",
            "memory.max_usage_in_bytes",
        ])
    }

    /// CPU bandwidth limit, `None` if unlimited or unknown
    pub fn cpu_quota(&self) -> Option<CpuQuota> {
        if let Some(v2) = self.read_trimmed("cpu.max") {
            let mut fields = v2.split_whitespace();
            let quota_us = fields.next()?.parse().ok()?;
            let period_us = fields.next()?.parse().ok()?;
            return CpuQuota::new(quota_us, period_us);
        }
        let quota_us = self.read_trimmed("cpu/cpu.cfs_quota_us")?.parse::<i64>().ok()?;
        let period_us = self.read_trimmed("cpu/cpu.cfs_period_us")?.parse().ok()?;
        CpuQuota::new(u64::try_from(quota_us).ok()?, period_us)
    }

    /// Memory events (oom, oom_kill, high, max...) of cgroup v2
    pub fn memory_events(&self) -> Stats {
        ["memory.events.local", "memory.events"]
            .into_iter()
            .find_map(|name| self.read_trimmed(name))
            .map(|text| Stats::parse(&text))
            .unwrap_or_default()
    }

    /// CPU statistics (usage_usec, nr_throttled, throttled_usec...) of cgroup v2
    pub fn cpu_stat(&self) -> Stats {
        self.read_trimmed("cpu.stat")
            .map(|text| Stats::parse(&text))
            .unwrap_or_default()
    }

    /// Read a file from the hierarchy, trimming surrounding whitespace
    fn read_trimmed(&self, name: &str) -> Option<String> {
        fs::read_to_string(self.root.join(name))
            .ok()
            .map(|s| s.trim().to_owned())
    }

    /// Parse the first readable integer file among candidates
    fn first_u64(&self, names: &[&str]) -> Option<u64> {
        names
            .iter()
            .find_map(|name| self.read_trimmed(name))
            .and_then(|value| value.parse().ok())
    }

    /// Standard cgroup filesystem mount point
    const DEFAULT_ROOT: &'static str = "/sys/fs/cgroup";
}
//
impl Default for CgroupProbe {
    fn default() -> Self {
        Self::new()
    }
}
//
impl LimitProbe for CgroupProbe {
    fn usage_and_limit(&mut self) -> Option<(u64, u64)> {
        Some((self.memory_current()?, self.memory_limit()?))
    }
}

/// CPU bandwidth limit
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CpuQuota {
    /// CPU time allowed per period, in microseconds
    pub quota_us: u64,

    /// Accounting period, in microseconds
    pub period_us: u64,
}
//
impl CpuQuota {
    /// Build a quota, rejecting meaningless values
    fn new(quota_us: u64, period_us: u64) -> Option<Self> {
        (quota_us > 0 && period_us > 0).then_some(Self {
            quota_us,
            period_us,
        })
    }

    /// Number of CPUs worth of time that the cgroup may use
    pub fn effective_cpus(&self) -> f64 {
        self.quota_us as f64 / self.period_us as f64
    }
}

/// Flat "key value" statistics file
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Stats(BTreeMap<String, u64>);
//
impl Stats {
    /// Parse "key value" lines, ignoring malformed ones
    fn parse(text: &str) -> Self {
        Self(
            text.lines()
                .filter_map(|line| {
                    let (key, value) = line.split_once(' ')?;
                    Some((key.to_owned(), value.trim().parse().ok()?))
                })
                .collect(),
        )
    }

    /// Query a statistic
    pub fn get(&self, key: &str) -> Option<u64> {
        self.0.get(key).copied()
    }

    /// Truth that no statistic could be read
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over statistics in key order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> + '_ {
        self.0.iter().map(|(key, value)| (key.as_str(), *value))
    }

    /// Increase of a statistic since an earlier snapshot
    pub fn delta(&self, earlier: &Stats, key: &str) -> Option<u64> {
        Some(self.get(key)?.saturating_sub(earlier.get(key).unwrap_or(0)))
    }
}

/// Resident set size of the current process, in bytes
pub fn self_rss() -> Option<u64> {
    parse_vm_rss(&fs::read_to_string("/proc/self/status").ok()?)
}

/// Extract VmRSS from the contents of /proc/<pid>/status
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fake_hierarchy(files: &[(&str, &str)]) -> TempDir {
        let dir = TempDir::new().expect("Failed to create temporary directory");
        for (name, contents) in files {
            let path = dir.path().join(name);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, contents).unwrap();
        }
        dir
    }

    #[test]
    fn empty() {
        let dir = fake_hierarchy(&[]);
        let probe = CgroupProbe::with_root(dir.path());
        assert_eq!(probe.memory_limit(), None);
        assert_eq!(probe.memory_current(), None);
        assert_eq!(probe.memory_peak(), None);
        assert_eq!(probe.cpu_quota(), None);
        assert!(probe.memory_events().is_empty());
        assert!(probe.cpu_stat().is_empty());
        assert!(!probe.is_mounted());
    }

    #[test]
    fn v2() {
        let dir = fake_hierarchy(&[
            ("cgroup.controllers", "cpu memory\n"),
            ("memory.max", "1073741824\n"),
            ("memory.current", "52428800\n"),
            ("memory.peak", "104857600\n"),
            ("memory.events", "low 0\nhigh 3\nmax 1\noom 0\noom_kill 0\n"),
            ("cpu.max", "150000 100000\n"),
            ("cpu.stat", "usage_usec 1000\nnr_periods 10\nnr_throttled 2\nthrottled_usec 500\n"),
        ]);
        let mut probe = CgroupProbe::with_root(dir.path());
        assert!(probe.is_mounted());
        assert_eq!(probe.memory_limit(), Some(1 << 30));
        assert_eq!(probe.memory_current(), Some(50 << 20));
        assert_eq!(probe.memory_peak(), Some(100 << 20));
        assert_eq!(probe.usage_and_limit(), Some((50 << 20, 1 << 30)));
        assert_eq!(probe.memory_events().get("high"), Some(3));
        let quota = probe.cpu_quota().unwrap();
        assert_eq!(quota.effective_cpus(), 1.5);
        let stat = probe.cpu_stat();
        assert_eq!(stat.get("nr_throttled"), Some(2));
        assert_eq!(stat.iter().count(), 4);
    }

    #[test]
    fn v2_unlimited() {
        let dir = fake_hierarchy(&[("memory.max", "max\n"), ("cpu.max", "max 100000\n")]);
        let mut probe = CgroupProbe::with_root(dir.path());
        assert_eq!(probe.memory_limit(), None);
        assert_eq!(probe.cpu_quota(), None);
        assert_eq!(probe.usage_and_limit(), None);
    }

    #[test]
    fn v1() {
        let dir = fake_hierarchy(&[
            ("memory/memory.limit_in_bytes", "2147483648\n"),
            ("memory/memory.usage_in_bytes", "1048576\n"),
            ("memory/memory.max_usage_in_bytes", "2097152\n"),
            ("cpu/cpu.cfs_quota_us", "200000\n"),
            ("cpu/cpu.cfs_period_us", "100000\n"),
        ]);
        let probe = CgroupProbe::with_root(dir.path());
        assert!(probe.is_mounted());
        assert_eq!(probe.memory_limit(), Some(2 << 30));
        assert_eq!(probe.memory_current(), Some(1 << 20));
        assert_eq!(probe.memory_peak(), Some(2 << 20));
        assert_eq!(
            probe.cpu_quota(),
            Some(CpuQuota {
                quota_us: 200_000,
                period_us: 100_000
            })
        );
    }

    #[test]
    fn v1_unlimited_cpu() {
        let dir = fake_hierarchy(&[
            ("cpu/cpu.cfs_quota_us", "-1\n"),
            ("cpu/cpu.cfs_period_us", "100000\n"),
        ]);
        assert_eq!(CgroupProbe::with_root(dir.path()).cpu_quota(), None);
    }

    #[test]
    fn stats_delta() {
        let before = Stats::parse("nr_throttled 2\nthrottled_usec 500\ngarbage\n");
        let after = Stats::parse("nr_throttled 5\nthrottled_usec 400\nnr_periods 7\n");
        assert_eq!(before.iter().count(), 2);
        assert_eq!(after.delta(&before, "nr_throttled"), Some(3));
        assert_eq!(after.delta(&before, "throttled_usec"), Some(0));
        assert_eq!(after.delta(&before, "nr_periods"), Some(7));
        assert_eq!(after.delta(&before, "missing"), None);
    }

    #[test]
    fn vm_rss() {
        let status = "Name:\tpressure\nVmPeak:\t  10000 kB\nVmRSS:\t    2048 kB\nThreads:\t1\n";
        assert_eq!(parse_vm_rss(status), Some(2 << 20));
        assert_eq!(parse_vm_rss("Name:\tpressure\n"), None);
    }
}
