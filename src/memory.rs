//! Process memory sampling, recorded on records before and after execution.

/// Reports the current resident memory of the process, in megabytes.
pub trait MemoryMonitor: Send + Sync {
    fn mb(&self) -> f64;
}

/// Reads VmRSS from `/proc/self/status`. Reports 0 on platforms without
/// procfs; memory accounting is best-effort diagnostics, not an invariant.
#[derive(Debug, Default)]
pub struct ResidentSetMonitor;

impl MemoryMonitor for ResidentSetMonitor {
    fn mb(&self) -> f64 {
        vm_rss_kb().map(|kb| kb / 1024.0).unwrap_or(0.0)
    }
}

fn vm_rss_kb() -> Option<f64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    status
        .lines()
        .find(|line| line.starts_with("VmRSS:"))?
        .split_whitespace()
        .nth(1)?
        .parse()
        .ok()
}

/// Always reports the same value. For tests.
#[derive(Debug)]
pub struct FixedMemoryMonitor(pub f64);

impl MemoryMonitor for FixedMemoryMonitor {
    fn mb(&self) -> f64 {
        self.0
    }
}
