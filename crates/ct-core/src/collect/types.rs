//! Common types for the resource query layer.
//!
//! These types represent one raw OS process record as collected each cycle,
//! before classification and metric derivation.

use ct_common::{ProcessId, StartId};
use serde::{Deserialize, Serialize};

/// Process state from /proc/[pid]/stat.
///
/// Maps to standard Unix process states:
/// - R: Running or runnable
/// - S: Interruptible sleep (waiting for event)
/// - D: Uninterruptible sleep (usually I/O)
/// - Z: Zombie (terminated but not reaped)
/// - T: Stopped (by job control or trace)
/// - I: Idle (kernel thread, Linux)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcState {
    Running,
    Sleeping,
    DiskSleep,
    Zombie,
    Stopped,
    Idle,
    Dead,
    Unknown,
}

impl ProcState {
    /// Parse process state from single character.
    pub fn from_char(c: char) -> Self {
        match c {
            'R' => ProcState::Running,
            'S' => ProcState::Sleeping,
            'D' => ProcState::DiskSleep,
            'Z' => ProcState::Zombie,
            'T' | 't' => ProcState::Stopped,
            'I' => ProcState::Idle,
            'X' | 'x' => ProcState::Dead,
            _ => ProcState::Unknown,
        }
    }

    /// Whether this state means the process is suspended by job control.
    pub fn is_stopped(&self) -> bool {
        matches!(self, ProcState::Stopped)
    }
}

impl std::fmt::Display for ProcState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProcState::Running => "R",
            ProcState::Sleeping => "S",
            ProcState::DiskSleep => "D",
            ProcState::Zombie => "Z",
            ProcState::Stopped => "T",
            ProcState::Idle => "I",
            ProcState::Dead => "X",
            ProcState::Unknown => "?",
        };
        write!(f, "{}", s)
    }
}

/// Cumulative per-process IO counters.
///
/// `Unsupported` is an explicit marker for platforms or permission levels
/// where `/proc/[pid]/io` cannot be read, so the sampler can fall back to
/// estimation rather than reporting false zeros.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum IoCounters {
    Counters {
        /// Bytes read from storage.
        read_bytes: u64,
        /// Bytes written to storage.
        write_bytes: u64,
        /// Characters read (includes buffered and socket traffic).
        rchar: u64,
        /// Characters written (includes buffered and socket traffic).
        wchar: u64,
    },
    Unsupported,
}

impl IoCounters {
    pub fn is_supported(&self) -> bool {
        matches!(self, IoCounters::Counters { .. })
    }
}

/// Per-process connection counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionCounts {
    /// Open sockets of any kind.
    pub total: usize,
    /// Established loopback TCP connections, the auxiliary protocol
    /// channel heuristic (local MCP servers).
    pub aux: usize,
}

/// A single raw process record from one enumeration.
///
/// Optional fields may be unavailable at some permission levels; a missing
/// working directory is reported as `None`, never a fabricated path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawProcess {
    // === Identity ===
    /// Process ID.
    pub pid: ProcessId,

    /// Parent process ID.
    pub ppid: ProcessId,

    /// Start ID for PID reuse detection.
    pub start_id: StartId,

    // === Command info ===
    /// Command name (basename only).
    pub comm: String,

    /// Full argv vector.
    pub cmdline: Vec<String>,

    /// Working directory, if readable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,

    // === State and resources ===
    /// Current process state.
    pub state: ProcState,

    /// Combined utime + stime in clock ticks.
    pub cpu_ticks: u64,

    /// Number of threads.
    pub num_threads: u32,

    /// Resident set size in bytes.
    pub rss_bytes: u64,

    /// Process start time in clock ticks since boot.
    pub starttime: u64,

    /// Process start time (Unix timestamp, seconds).
    pub start_time_unix: i64,

    // === IO tier (may be absent when the tier was skipped this cycle) ===
    /// Cumulative IO counters, or an explicit unsupported marker.
    pub io: IoCounters,

    /// Socket counts.
    pub connections: ConnectionCounts,
}

impl RawProcess {
    /// Full command line joined for display and matching.
    pub fn cmdline_str(&self) -> String {
        self.cmdline.join(" ")
    }
}

/// Result of one enumeration pass.
#[derive(Debug, Clone)]
pub struct ProcessTable {
    /// Collected raw records, ordered by pid.
    pub processes: Vec<RawProcess>,

    /// Per-process detail failures swallowed during the pass.
    pub warnings: Vec<String>,
}

impl ProcessTable {
    /// Look up a record by pid.
    pub fn get(&self, pid: ProcessId) -> Option<&RawProcess> {
        self.processes.iter().find(|p| p.pid == pid)
    }
}
