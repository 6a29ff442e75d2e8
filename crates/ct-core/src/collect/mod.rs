//! Process enumeration and resource collection.
//!
//! This module is the only place that talks to the OS process table. One
//! `ProcessSource::snapshot` call per sampling cycle produces a
//! `ProcessTable` that every downstream component shares - the table is
//! never re-queried within a cycle.
//!
//! Failure policy: only a *total* enumeration failure is an error. A failure
//! to read one process's detail (permission, or the process exiting between
//! enumeration and read) omits that process and records a warning.

#[cfg(target_os = "linux")]
pub mod proc_linux;
mod types;

pub use types::{ConnectionCounts, IoCounters, ProcState, ProcessTable, RawProcess};

use ct_common::ProcessId;
use thiserror::Error;
use tracing::debug;

/// System clock ticks per second.
#[cfg(target_os = "linux")]
pub fn clk_tck() -> u64 {
    proc_linux::clk_tck()
}

/// System clock ticks per second (fallback for unsupported platforms).
#[cfg(not(target_os = "linux"))]
pub fn clk_tck() -> u64 {
    100
}

/// Logical core count.
#[cfg(target_os = "linux")]
pub fn num_cores() -> u64 {
    proc_linux::num_cores()
}

/// Logical core count (fallback for unsupported platforms).
#[cfg(not(target_os = "linux"))]
pub fn num_cores() -> u64 {
    1
}

/// Errors from the resource query layer.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("process enumeration failed: {0}")]
    Enumeration(String),

    #[error("platform not supported: {0}")]
    UnsupportedPlatform(String),
}

impl From<QueryError> for ct_common::Error {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Enumeration(msg) => ct_common::Error::Enumeration(msg),
            QueryError::UnsupportedPlatform(msg) => ct_common::Error::UnsupportedPlatform(msg),
        }
    }
}

/// Source of raw process tables.
///
/// The engine is generic over this trait; tests inject scripted tables and
/// the binary uses [`ProcSource`].
pub trait ProcessSource {
    /// Take one snapshot of the process table.
    ///
    /// `include_io` selects whether the IO metric tier (io counters,
    /// connection counts) is collected this cycle; when false those fields
    /// are left at their markers and the sampler carries forward the
    /// previous values.
    fn snapshot(&mut self, include_io: bool) -> Result<ProcessTable, QueryError>;

    /// The monitor's own pid, excluded from classification and control.
    fn self_pid(&self) -> ProcessId;
}

/// Live /proc-backed process source.
#[derive(Debug, Default)]
pub struct ProcSource;

impl ProcSource {
    pub fn new() -> Self {
        ProcSource
    }
}

#[cfg(target_os = "linux")]
impl ProcessSource for ProcSource {
    fn snapshot(&mut self, include_io: bool) -> Result<ProcessTable, QueryError> {
        let pids =
            proc_linux::list_pids().map_err(|e| QueryError::Enumeration(e.to_string()))?;

        // The global TCP tables are read once and shared across all
        // per-process connection counts.
        let tcp_entries = if include_io {
            proc_linux::read_tcp_tables()
        } else {
            Vec::new()
        };

        let mut processes = Vec::with_capacity(pids.len());
        let mut warnings = Vec::new();

        for pid in pids {
            match proc_linux::read_process(pid, include_io, &tcp_entries) {
                Some(record) => processes.push(record),
                // Vanished or unreadable: gone, not an error.
                None => warnings.push(format!("pid {}: detail read failed", pid)),
            }
        }

        debug!(
            process_count = processes.len(),
            skipped = warnings.len(),
            include_io,
            "process table snapshot"
        );

        Ok(ProcessTable {
            processes,
            warnings,
        })
    }

    fn self_pid(&self) -> ProcessId {
        ProcessId(std::process::id())
    }
}

#[cfg(not(target_os = "linux"))]
impl ProcessSource for ProcSource {
    fn snapshot(&mut self, _include_io: bool) -> Result<ProcessTable, QueryError> {
        Err(QueryError::UnsupportedPlatform(
            std::env::consts::OS.to_string(),
        ))
    }

    fn self_pid(&self) -> ProcessId {
        ProcessId(std::process::id())
    }
}
