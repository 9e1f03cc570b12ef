//! Memory statistics collaborator.
//!
//! Command ID 1 answers with a fixed-shape memory record. The collaborator
//! is a trait so tests can pin the values; the production implementation
//! samples the platform's `sysinfo(2)` record, which is the shape
//! `MemoryInfo` mirrors field for field.

use hostlink_protocol::MemoryInfo;

/// Source of live memory statistics. The record is copied, never aliased.
pub trait MemStats: Send + Sync {
    /// Sample the current statistics.
    fn sample(&self) -> MemoryInfo;
}

/// Production source backed by `sysinfo(2)`.
#[derive(Debug, Default)]
pub struct SysinfoStats;

#[cfg(target_os = "linux")]
impl MemStats for SysinfoStats {
    fn sample(&self) -> MemoryInfo {
        // SAFETY: sysinfo writes into the zeroed struct we hand it and is
        // otherwise side-effect free.
        let mut info: libc::sysinfo = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::sysinfo(&mut info) };
        if rc != 0 {
            tracing::warn!(
                error = %std::io::Error::last_os_error(),
                "sysinfo sample failed, reporting zeroed record"
            );
            return MemoryInfo::default();
        }
        MemoryInfo {
            total: info.totalram as u64,
            free: info.freeram as u64,
            shared: info.sharedram as u64,
            buffer: info.bufferram as u64,
            total_high: info.totalhigh as u64,
            free_high: info.freehigh as u64,
            unit: info.mem_unit,
        }
    }
}

/// Stub for non-Linux hosts (the agent only ships on Linux guests).
#[cfg(not(target_os = "linux"))]
impl MemStats for SysinfoStats {
    fn sample(&self) -> MemoryInfo {
        MemoryInfo::default()
    }
}
