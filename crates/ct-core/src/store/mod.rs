//! Historical store: append-only JSONL of per-cycle instance samples.
//!
//! One row per instance per cycle, keyed by (instance surrogate id,
//! timestamp). Rows are never updated in place; schema evolution is
//! additive only (missing fields deserialize to defaults), so old rows
//! never need rewriting.
//!
//! The store never blocks or aborts the sampling cycle: a write failure
//! degrades persistence to disabled for the remainder of the run and is
//! reported once, not on every cycle. Running with the store disabled is a
//! supported configuration - `query` then returns an empty sequence and no
//! error.

use crate::instance::{ActivityState, InstanceView, Snapshot};
use chrono::{DateTime, Utc};
use ct_common::{Result, StartId, SCHEMA_VERSION};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// One persisted (instance, timestamp) sample row.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryRecord {
    pub schema_version: String,
    pub instance_id: StartId,
    pub pid: u32,
    /// Project grouping key (working-directory basename).
    pub project: String,
    pub working_dir: String,
    pub timestamp: DateTime<Utc>,
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
    /// Set on the terminal row flushed when an instance disappears.
    pub final_record: bool,
}

impl Default for HistoryRecord {
    fn default() -> Self {
        HistoryRecord {
            schema_version: SCHEMA_VERSION.to_string(),
            instance_id: StartId(String::new()),
            pid: 0,
            project: String::new(),
            working_dir: String::new(),
            timestamp: Utc::now(),
            status: ActivityState::Idle,
            cpu_percent: 0.0,
            memory_mb: 0.0,
            net_bytes_sent: 0,
            net_bytes_recv: 0,
            disk_read_bytes: 0,
            disk_write_bytes: 0,
            connections: 0,
            mcp_connections: 0,
            io_estimated: false,
            final_record: false,
        }
    }
}

impl HistoryRecord {
    /// Build a row from an instance view.
    pub fn from_view(view: &InstanceView, timestamp: DateTime<Utc>, final_record: bool) -> Self {
        HistoryRecord {
            schema_version: SCHEMA_VERSION.to_string(),
            instance_id: view.instance_id.clone(),
            pid: view.pid.0,
            project: view.project.clone(),
            working_dir: view.working_dir.clone(),
            timestamp,
            status: view.status,
            cpu_percent: view.cpu_percent,
            memory_mb: view.memory_mb,
            net_bytes_sent: view.net_bytes_sent,
            net_bytes_recv: view.net_bytes_recv,
            disk_read_bytes: view.disk_read_bytes,
            disk_write_bytes: view.disk_write_bytes,
            connections: view.connections,
            mcp_connections: view.mcp_connections,
            io_estimated: view.io_estimated,
            final_record,
        }
    }
}

/// Time-range filter for queries. `None` bounds are open.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimeRange {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeRange {
    fn contains(&self, ts: DateTime<Utc>) -> bool {
        if let Some(since) = self.since {
            if ts < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if ts > until {
                return false;
            }
        }
        true
    }
}

/// The historical store.
pub struct HistoryStore {
    enabled: bool,
    path: Option<PathBuf>,
    writer: Option<BufWriter<File>>,
    /// Set after a write failure; persistence is off for the rest of the
    /// run and the failure has been reported.
    degraded: bool,
}

impl HistoryStore {
    /// Open the store, creating the file and parent directories as needed.
    ///
    /// Open failures degrade to in-memory-only operation with a single
    /// warning - they never fail the monitor.
    pub fn open(path: PathBuf) -> Self {
        let writer = match open_append(&path) {
            Ok(file) => Some(BufWriter::new(file)),
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "history store unavailable, running without persistence"
                );
                None
            }
        };
        let degraded = writer.is_none();
        HistoryStore {
            enabled: true,
            path: Some(path),
            writer,
            degraded,
        }
    }

    /// A store that persists nothing (`--no-store`).
    pub fn disabled() -> Self {
        HistoryStore {
            enabled: false,
            path: None,
            writer: None,
            degraded: false,
        }
    }

    /// Whether rows are currently being persisted.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.degraded && self.writer.is_some()
    }

    /// Append one row per instance for a completed snapshot.
    pub fn record_snapshot(&mut self, snapshot: &Snapshot) {
        if !self.is_active() {
            return;
        }
        for view in &snapshot.instances {
            let record = HistoryRecord::from_view(view, snapshot.timestamp, false);
            self.append(&record);
        }
        self.flush();
    }

    /// Flush the terminal row for an instance that disappeared.
    pub fn record_final(&mut self, view: &InstanceView, timestamp: DateTime<Utc>) {
        if !self.is_active() {
            return;
        }
        let record = HistoryRecord::from_view(view, timestamp, true);
        self.append(&record);
        self.flush();
    }

    /// Best-effort flush of buffered rows (also called on shutdown).
    pub fn flush(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.flush() {
                self.degrade(&e.to_string());
            }
        }
    }

    /// Query persisted rows, optionally filtered by project key and time
    /// range, ordered by timestamp.
    ///
    /// With persistence disabled this returns an empty sequence and no
    /// error. Corrupt lines are skipped, not fatal.
    pub fn query(&self, project: Option<&str>, range: TimeRange) -> Result<Vec<HistoryRecord>> {
        let Some(path) = self.path.as_ref().filter(|_| self.enabled) else {
            return Ok(Vec::new());
        };
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        let mut skipped = 0usize;

        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryRecord>(&line) {
                Ok(record) => {
                    if let Some(project) = project {
                        if record.project != project {
                            continue;
                        }
                    }
                    if range.contains(record.timestamp) {
                        records.push(record);
                    }
                }
                Err(_) => skipped += 1,
            }
        }

        if skipped > 0 {
            debug!(skipped, "skipped unparseable history rows");
        }

        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    fn append(&mut self, record: &HistoryRecord) {
        let Some(writer) = self.writer.as_mut() else {
            return;
        };
        let result = serde_json::to_string(record)
            .map_err(|e| e.to_string())
            .and_then(|line| writeln!(writer, "{}", line).map_err(|e| e.to_string()));
        if let Err(e) = result {
            self.degrade(&e);
        }
    }

    /// Report once, then stay silent and inactive for the rest of the run.
    fn degrade(&mut self, error: &str) {
        if !self.degraded {
            warn!(
                error = %error,
                "history write failed; persistence disabled for this run"
            );
        }
        self.degraded = true;
        self.writer = None;
    }
}

fn open_append(path: &Path) -> std::io::Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::Instance;
    use ct_common::ProcessId;

    fn view(pid: u32, project: &str) -> InstanceView {
        let inst = Instance::new(
            ProcessId(pid),
            ProcessId(1),
            StartId::new("boot", 100 + pid as u64, pid),
            "claude".into(),
            Some(format!("/home/u/{}", project)),
            Utc::now(),
            8,
            0,
        );
        inst.view()
    }

    fn snapshot_at(ts: DateTime<Utc>, views: Vec<InstanceView>) -> Snapshot {
        Snapshot {
            timestamp: ts,
            cycle: 1,
            instances: views,
        }
    }

    #[test]
    fn test_append_and_query_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");

        let mut store = HistoryStore::open(path);
        assert!(store.is_active());

        let ts = Utc::now();
        store.record_snapshot(&snapshot_at(ts, vec![view(100, "alpha"), view(101, "beta")]));

        let records = store.query(None, TimeRange::default()).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].schema_version, SCHEMA_VERSION);
        assert!(!records[0].final_record);
    }

    #[test]
    fn test_query_project_filter() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::open(dir.path().join("h.jsonl"));

        let ts = Utc::now();
        store.record_snapshot(&snapshot_at(ts, vec![view(100, "alpha"), view(101, "beta")]));

        let records = store.query(Some("alpha"), TimeRange::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, 100);
    }

    #[test]
    fn test_query_time_range() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::open(dir.path().join("h.jsonl"));

        let old = Utc::now() - chrono::Duration::hours(2);
        let new = Utc::now();
        store.record_snapshot(&snapshot_at(old, vec![view(100, "alpha")]));
        store.record_snapshot(&snapshot_at(new, vec![view(101, "alpha")]));

        let range = TimeRange {
            since: Some(Utc::now() - chrono::Duration::hours(1)),
            until: None,
        };
        let records = store.query(None, range).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].pid, 101);
    }

    #[test]
    fn test_query_ordered_by_timestamp() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::open(dir.path().join("h.jsonl"));

        let late = Utc::now();
        let early = late - chrono::Duration::minutes(30);
        // Written out of order.
        store.record_snapshot(&snapshot_at(late, vec![view(101, "p")]));
        store.record_snapshot(&snapshot_at(early, vec![view(100, "p")]));

        let records = store.query(None, TimeRange::default()).unwrap();
        assert_eq!(records[0].pid, 100);
        assert_eq!(records[1].pid, 101);
    }

    #[test]
    fn test_disabled_store_queries_empty_without_error() {
        let mut store = HistoryStore::disabled();
        assert!(!store.is_active());

        store.record_snapshot(&snapshot_at(Utc::now(), vec![view(100, "p")]));
        let records = store.query(None, TimeRange::default()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_final_record_flag() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = HistoryStore::open(dir.path().join("h.jsonl"));

        store.record_final(&view(100, "p"), Utc::now());
        let records = store.query(None, TimeRange::default()).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].final_record);
    }

    #[test]
    fn test_unwritable_path_degrades_without_error() {
        let dir = tempfile::tempdir().unwrap();
        // The parent "directory" is a regular file: open must fail.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();

        let mut store = HistoryStore::open(blocker.join("h.jsonl"));
        assert!(!store.is_active());

        // Recording is a no-op, never a panic or error.
        store.record_snapshot(&snapshot_at(Utc::now(), vec![view(100, "p")]));
        let records = store.query(None, TimeRange::default()).unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn test_corrupt_lines_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.jsonl");

        let mut store = HistoryStore::open(path.clone());
        store.record_snapshot(&snapshot_at(Utc::now(), vec![view(100, "p")]));

        // Corrupt the file with a bad line, then append another good row.
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            writeln!(f, "{{not json").unwrap();
        }
        store.record_snapshot(&snapshot_at(Utc::now(), vec![view(101, "p")]));

        let records = store.query(None, TimeRange::default()).unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_additive_schema_evolution() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("h.jsonl");

        // A row written by an older schema without the newer fields.
        let old_row = r#"{"schema_version":"0.9.0","instance_id":"boot:1:100","pid":100,"project":"p","working_dir":"/home/u/p","timestamp":"2026-01-15T14:30:22Z","status":"running","cpu_percent":12.5,"memory_mb":256.0}"#;
        std::fs::write(&path, format!("{}\n", old_row)).unwrap();

        let store = HistoryStore::open(path);
        let records = store.query(None, TimeRange::default()).unwrap();
        assert_eq!(records.len(), 1);
        // Absent fields take defaults.
        assert_eq!(records[0].net_bytes_sent, 0);
        assert!(!records[0].final_record);
    }
}
