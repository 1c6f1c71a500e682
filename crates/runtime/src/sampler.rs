//! Host resource sampling from procfs

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use tunebridge_core::{BridgeError, ResourceReading, ResourceSampler};

/// Memory totals from `/proc/meminfo`, in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemInfo {
    pub total_bytes: u64,
    pub available_bytes: u64,
}

impl MemInfo {
    pub fn used_bytes(&self) -> u64 {
        self.total_bytes.saturating_sub(self.available_bytes)
    }
}

/// Aggregate CPU jiffies from the first line of `/proc/stat`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTimes {
    pub busy: u64,
    pub total: u64,
}

pub fn parse_meminfo(raw: &str) -> Option<MemInfo> {
    let mut total = None;
    let mut available = None;
    let mut free = None;

    for line in raw.lines() {
        let mut parts = line.split_whitespace();
        let key = parts.next();
        let kib = parts.next().and_then(|v| v.parse::<u64>().ok());
        match (key, kib) {
            (Some("MemTotal:"), Some(v)) => total = Some(v * 1024),
            (Some("MemAvailable:"), Some(v)) => available = Some(v * 1024),
            (Some("MemFree:"), Some(v)) => free = Some(v * 1024),
            _ => {}
        }
    }

    Some(MemInfo {
        total_bytes: total?,
        // Older kernels lack MemAvailable
        available_bytes: available.or(free)?,
    })
}

pub fn parse_proc_stat(raw: &str) -> Option<CpuTimes> {
    let line = raw.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|v| v.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }

    let total: u64 = fields.iter().sum();
    // idle + iowait
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// CPU usage between two readings, in percent
pub fn cpu_percent(previous: CpuTimes, current: CpuTimes) -> f64 {
    let total = current.total.saturating_sub(previous.total);
    if total == 0 {
        return 0.0;
    }
    let busy = current.busy.saturating_sub(previous.busy);
    (busy as f64 / total as f64 * 100.0).clamp(0.0, 100.0)
}

pub fn read_meminfo() -> Result<MemInfo> {
    let raw = std::fs::read_to_string("/proc/meminfo").context("reading /proc/meminfo")?;
    parse_meminfo(&raw).ok_or_else(|| anyhow!("unrecognised /proc/meminfo format"))
}

/// Sampler backed by `/proc/stat` and `/proc/meminfo`
///
/// CPU usage is a delta, so the first reading reports 0%.
pub struct ProcSampler {
    root: PathBuf,
    previous: Option<CpuTimes>,
}

impl ProcSampler {
    pub fn new() -> Self {
        Self::with_root("/proc")
    }

    /// Read from an alternative procfs mount
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            previous: None,
        }
    }
}

impl Default for ProcSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Read and parse one procfs file
fn read_proc<T>(path: &Path, parse: fn(&str) -> Option<T>) -> tunebridge_core::Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| BridgeError::ResourceSampling(format!("reading {}: {}", path.display(), e)))?;
    parse(&raw).ok_or_else(|| BridgeError::ResourceSampling(format!("unrecognised {} format", path.display())))
}

impl ResourceSampler for ProcSampler {
    fn sample(&mut self) -> Result<ResourceReading> {
        let times = read_proc(&self.root.join("stat"), parse_proc_stat)?;
        let mem = read_proc(&self.root.join("meminfo"), parse_meminfo)?;

        let cpu = self.previous.map(|prev| cpu_percent(prev, times)).unwrap_or(0.0);
        self.previous = Some(times);

        Ok(ResourceReading {
            cpu_percent: cpu,
            memory_bytes: mem.used_bytes(),
            memory_total_bytes: mem.total_bytes,
        })
    }
}
