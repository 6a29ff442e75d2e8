//! Monitored instance state and the per-cycle snapshot.
//!
//! An [`Instance`] is the engine's mutable record for one live Claude CLI
//! process. The [`Snapshot`] is the immutable point-in-time view built once
//! per cycle; it is the only artifact exposed across the engine boundary.

use crate::collect::ConnectionCounts;
use chrono::{DateTime, Utc};
use ct_common::{ProcessId, StartId};
use serde::{Deserialize, Serialize};

/// Activity state derived each cycle from CPU/IO patterns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    /// Actively processing: sustained CPU over the rolling window.
    Running,
    /// Mid-session, blocked on external input: low CPU with a recent burst
    /// or live connection activity.
    Waiting,
    /// No activity signal for longer than the session-end grace.
    Idle,
    /// Suspended by the controller; wins over every metric signal.
    Paused,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ActivityState::Running => "running",
            ActivityState::Waiting => "waiting",
            ActivityState::Idle => "idle",
            ActivityState::Paused => "paused",
        };
        write!(f, "{}", s)
    }
}

/// Fixed-capacity rolling metric history.
///
/// A circular buffer indexed by insertion count modulo capacity; insertion
/// evicts the oldest sample. Used for the burst-detection window and
/// sparkline display, never for the persisted record.
#[derive(Debug, Clone)]
pub struct MetricRing {
    buf: Vec<f64>,
    count: u64,
    capacity: usize,
}

impl MetricRing {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring capacity must be positive");
        MetricRing {
            buf: Vec::with_capacity(capacity),
            count: 0,
            capacity,
        }
    }

    pub fn push(&mut self, value: f64) {
        let idx = (self.count % self.capacity as u64) as usize;
        if self.buf.len() < self.capacity {
            self.buf.push(value);
        } else {
            self.buf[idx] = value;
        }
        self.count += 1;
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Samples ordered oldest to newest.
    pub fn ordered(&self) -> Vec<f64> {
        if self.buf.len() < self.capacity {
            return self.buf.clone();
        }
        let split = (self.count % self.capacity as u64) as usize;
        let mut out = Vec::with_capacity(self.capacity);
        out.extend_from_slice(&self.buf[split..]);
        out.extend_from_slice(&self.buf[..split]);
        out
    }

    pub fn latest(&self) -> Option<f64> {
        if self.buf.is_empty() {
            return None;
        }
        let idx = ((self.count - 1) % self.capacity as u64) as usize;
        Some(self.buf[idx])
    }

    pub fn mean(&self) -> f64 {
        if self.buf.is_empty() {
            return 0.0;
        }
        self.buf.iter().sum::<f64>() / self.buf.len() as f64
    }

    pub fn max(&self) -> f64 {
        self.buf.iter().copied().fold(0.0, f64::max)
    }
}

/// Sampler bookkeeping carried between cycles for one instance.
#[derive(Debug, Clone, Default)]
pub struct SampleBookkeeping {
    /// Whether a previous sample exists (first cycle has no delta basis).
    pub has_prev: bool,
    /// utime+stime at the previous cycle.
    pub prev_cpu_ticks: u64,
    /// Previous cumulative counters (read, write, rchar, wchar).
    pub prev_io: Option<(u64, u64, u64, u64)>,
    /// Previous RSS, for the estimation fallback.
    pub prev_rss_bytes: u64,
    /// Cycles since the last observed activity burst.
    pub cycles_since_burst: u64,
}

/// One monitored target process plus its derived state.
///
/// Exactly one `Instance` exists per live OS process id that passes
/// classification; it is created on first observation and removed (with a
/// final record flushed to the store) when the process disappears.
#[derive(Debug, Clone)]
pub struct Instance {
    // Identity
    pub pid: ProcessId,
    pub ppid: ProcessId,
    pub start_id: StartId,
    pub command: String,
    pub working_dir: Option<String>,
    pub started_at: DateTime<Utc>,

    // Live metrics
    pub cpu_percent: f64,
    pub memory_bytes: u64,
    pub net_sent_delta: u64,
    pub net_recv_delta: u64,
    pub disk_read_delta: u64,
    pub disk_write_delta: u64,
    pub connections: ConnectionCounts,
    /// Whether the IO figures above are activity-based estimates.
    pub io_estimated: bool,

    // Subprocess group aggregation
    pub group_cpu_percent: f64,
    pub group_memory_bytes: u64,
    pub group_size: usize,

    // Derived
    pub state: ActivityState,
    pub cpu_history: MetricRing,
    pub memory_history: MetricRing,
    pub net_history: MetricRing,
    pub disk_history: MetricRing,

    // Control
    pub paused: bool,
    pub selected: bool,

    // Lifecycle / sampler state
    pub last_seen_cycle: u64,
    pub bookkeeping: SampleBookkeeping,
}

impl Instance {
    pub fn new(
        pid: ProcessId,
        ppid: ProcessId,
        start_id: StartId,
        command: String,
        working_dir: Option<String>,
        started_at: DateTime<Utc>,
        ring_capacity: usize,
        cycle: u64,
    ) -> Self {
        Instance {
            pid,
            ppid,
            start_id,
            command,
            working_dir,
            started_at,
            cpu_percent: 0.0,
            memory_bytes: 0,
            net_sent_delta: 0,
            net_recv_delta: 0,
            disk_read_delta: 0,
            disk_write_delta: 0,
            connections: ConnectionCounts::default(),
            io_estimated: false,
            group_cpu_percent: 0.0,
            group_memory_bytes: 0,
            group_size: 0,
            state: ActivityState::Running,
            cpu_history: MetricRing::new(ring_capacity),
            memory_history: MetricRing::new(ring_capacity),
            net_history: MetricRing::new(ring_capacity),
            disk_history: MetricRing::new(ring_capacity),
            paused: false,
            selected: false,
            last_seen_cycle: cycle,
            bookkeeping: SampleBookkeeping::default(),
        }
    }

    /// Project grouping key: the working directory's final component.
    pub fn project_key(&self) -> String {
        match self.working_dir.as_deref() {
            Some(dir) => dir
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|s| !s.is_empty())
                .unwrap_or("root")
                .to_string(),
            None => "unknown".to_string(),
        }
    }

    /// Build the serializable view for the snapshot.
    pub fn view(&self) -> InstanceView {
        InstanceView {
            pid: self.pid,
            parent_pid: self.ppid,
            instance_id: self.start_id.clone(),
            command: self.command.clone(),
            working_dir: self
                .working_dir
                .clone()
                .unwrap_or_else(|| "unknown".to_string()),
            project: self.project_key(),
            started_at: self.started_at,
            status: self.state,
            cpu_percent: self.cpu_percent,
            memory_mb: self.memory_bytes as f64 / (1024.0 * 1024.0),
            net_bytes_sent: self.net_sent_delta,
            net_bytes_recv: self.net_recv_delta,
            disk_read_bytes: self.disk_read_delta,
            disk_write_bytes: self.disk_write_delta,
            connections: self.connections.total,
            mcp_connections: self.connections.aux,
            io_estimated: self.io_estimated,
            group_cpu_percent: self.group_cpu_percent,
            group_memory_mb: self.group_memory_bytes as f64 / (1024.0 * 1024.0),
            group_size: self.group_size,
            paused: self.paused,
            selected: self.selected,
            cpu_history: self.cpu_history.ordered(),
        }
    }
}

/// Immutable serializable view of one instance.
///
/// Field names are the stable machine-readable contract for the one-shot
/// mode and the editor integration - additive changes only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceView {
    pub pid: ProcessId,
    pub parent_pid: ProcessId,
    pub instance_id: StartId,
    pub command: String,
    pub working_dir: String,
    pub project: String,
    pub started_at: DateTime<Utc>,
    pub status: ActivityState,
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub net_bytes_sent: u64,
    pub net_bytes_recv: u64,
    pub disk_read_bytes: u64,
    pub disk_write_bytes: u64,
    pub connections: usize,
    pub mcp_connections: usize,
    pub io_estimated: bool,
    pub group_cpu_percent: f64,
    pub group_memory_mb: f64,
    pub group_size: usize,
    pub paused: bool,
    pub selected: bool,
    pub cpu_history: Vec<f64>,
}

/// Immutable point-in-time view of all instances, produced once per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: DateTime<Utc>,
    pub cycle: u64,
    pub instances: Vec<InstanceView>,
}

impl Snapshot {
    pub fn empty(cycle: u64) -> Self {
        Snapshot {
            timestamp: Utc::now(),
            cycle,
            instances: Vec::new(),
        }
    }
}
