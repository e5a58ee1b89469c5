//! Host resource probing.
//!
//! [`ProcProbe`] reads Linux procfs:
//!
//! | file               | used for                                  |
//! |--------------------|-------------------------------------------|
//! | `/proc/meminfo`    | `MemTotal`, `MemAvailable` (or `MemFree`) |
//! | `/proc/self/status`| `VmRSS` of this process                   |
//! | `/proc/stat`       | aggregate `cpu` line and per-core count   |
//!
//! CPU utilisation needs two readings: it is `1 − Δidle / Δtotal` between
//! consecutive samples, so the first sample after start-up carries no CPU
//! figure.

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("failed to read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{}: missing or malformed {field}", .path.display())]
    Parse { path: PathBuf, field: &'static str },
}

/// Memory figures in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryReading {
    pub total_bytes: u64,
    pub available_bytes: u64,
    pub process_rss_bytes: Option<u64>,
}

/// Cumulative CPU ticks across all cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuTimes {
    pub idle: u64,
    pub total: u64,
    pub cores: usize,
}

impl CpuTimes {
    /// Busy share of the interval since `previous`, or `None` when no ticks
    /// elapsed.
    pub fn usage_since(&self, previous: &CpuTimes) -> Option<f64> {
        let total = self.total.checked_sub(previous.total)?;
        let idle = self.idle.saturating_sub(previous.idle).min(total);
        if total == 0 {
            return None;
        }
        Some(1.0 - idle as f64 / total as f64)
    }
}

/// Source of host readings for the sampler.
pub trait SystemProbe: Send + Sync + 'static {
    fn memory(&self) -> Result<MemoryReading, ProbeError>;
    fn cpu_times(&self) -> Result<CpuTimes, ProbeError>;
}

/// [`SystemProbe`] over a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcProbe {
    root: PathBuf,
}

impl Default for ProcProbe {
    fn default() -> Self {
        Self::with_root("/proc")
    }
}

impl ProcProbe {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read(&self, relative: &str) -> Result<(PathBuf, String), ProbeError> {
        let path = self.root.join(relative);
        match fs::read_to_string(&path) {
            Ok(text) => Ok((path, text)),
            Err(source) => Err(ProbeError::Io { path, source }),
        }
    }
}

impl SystemProbe for ProcProbe {
    fn memory(&self) -> Result<MemoryReading, ProbeError> {
        let (path, meminfo) = self.read("meminfo")?;
        let (total_bytes, available_bytes) = parse_meminfo(&meminfo).ok_or(ProbeError::Parse {
            path,
            field: "MemTotal/MemAvailable",
        })?;
        // RSS is best-effort; some sandboxes hide /proc/self.
        let process_rss_bytes = self
            .read("self/status")
            .ok()
            .and_then(|(_, status)| parse_kib_field(&status, "VmRSS:"));
        Ok(MemoryReading {
            total_bytes,
            available_bytes,
            process_rss_bytes,
        })
    }

    fn cpu_times(&self) -> Result<CpuTimes, ProbeError> {
        let (path, stat) = self.read("stat")?;
        parse_stat(&stat).ok_or(ProbeError::Parse { path, field: "cpu" })
    }
}

fn parse_kib_field(text: &str, field: &str) -> Option<u64> {
    text.lines()
        .find_map(|line| line.strip_prefix(field))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kib| kib.parse::<u64>().ok())
        .map(|kib| kib * 1024)
}

fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let total = parse_kib_field(text, "MemTotal:")?;
    let available = parse_kib_field(text, "MemAvailable:")
        .or_else(|| parse_kib_field(text, "MemFree:"))?;
    Some((total, available))
}

fn parse_stat(text: &str) -> Option<CpuTimes> {
    let mut lines = text.lines();
    let aggregate = lines.next()?.strip_prefix("cpu ")?;
    let ticks: Vec<u64> = aggregate
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .ok()?;
    if ticks.len() < 4 {
        return None;
    }
    // user nice system idle iowait irq softirq steal [guest guest_nice]
    // guest time is already counted in user/nice.
    let total = ticks.iter().take(8).sum();
    let idle = ticks[3] + ticks.get(4).copied().unwrap_or(0);
    let cores = lines
        .take_while(|line| line.starts_with("cpu"))
        .count()
        .max(1);
    Some(CpuTimes { idle, total, cores })
}

/// One sampler reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSample {
    pub timestamp: u64,
    pub memory: Option<MemoryUsage>,
    pub cpu: Option<CpuUsage>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MemoryUsage {
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub process_rss_bytes: Option<u64>,
    pub usage_ratio: f64,
}

impl From<MemoryReading> for MemoryUsage {
    fn from(m: MemoryReading) -> Self {
        let used = m.total_bytes.saturating_sub(m.available_bytes);
        let usage_ratio = if m.total_bytes == 0 {
            0.0
        } else {
            used as f64 / m.total_bytes as f64
        };
        Self {
            total_bytes: m.total_bytes,
            free_bytes: m.available_bytes,
            process_rss_bytes: m.process_rss_bytes,
            usage_ratio,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CpuUsage {
    pub usage_ratio: f64,
    pub cores: usize,
}
