//! Engine + history store integration over a real temp directory.

use ct_common::{ProcessId, StartId};
use ct_core::collect::{
    ConnectionCounts, IoCounters, ProcState, ProcessSource, ProcessTable, QueryError, RawProcess,
};
use ct_core::config::MonitorConfig;
use ct_core::control::{SendError, Signal, SignalBackend};
use ct_core::engine::MonitorEngine;
use ct_core::store::{HistoryStore, TimeRange};
use std::collections::VecDeque;

struct ScriptedSource {
    tables: VecDeque<Vec<RawProcess>>,
    current: Vec<RawProcess>,
}

impl ProcessSource for ScriptedSource {
    fn snapshot(&mut self, _include_io: bool) -> Result<ProcessTable, QueryError> {
        if let Some(next) = self.tables.pop_front() {
            self.current = next;
        }
        Ok(ProcessTable {
            processes: self.current.clone(),
            warnings: Vec::new(),
        })
    }

    fn self_pid(&self) -> ProcessId {
        ProcessId(999)
    }
}

struct NoopBackend;
impl SignalBackend for NoopBackend {
    fn send(&self, _pid: u32, _signal: Signal) -> Result<(), SendError> {
        Ok(())
    }
    fn exists(&self, _pid: u32) -> bool {
        false
    }
    fn is_stopped(&self, _pid: u32) -> Option<bool> {
        None
    }
}

fn claude(pid: u32, project: &str, ticks: u64) -> RawProcess {
    RawProcess {
        pid: ProcessId(pid),
        ppid: ProcessId(1),
        start_id: StartId::new("boot", 1000 + pid as u64, pid),
        comm: "claude".into(),
        cmdline: vec!["claude".into()],
        working_dir: Some(format!("/home/u/{}", project)),
        state: ProcState::Sleeping,
        cpu_ticks: ticks,
        num_threads: 1,
        rss_bytes: 32 * 1024 * 1024,
        starttime: 1000 + pid as u64,
        start_time_unix: 1_700_000_000,
        io: IoCounters::Unsupported,
        connections: ConnectionCounts::default(),
    }
}

fn engine_with_store(
    tables: Vec<Vec<RawProcess>>,
    store: HistoryStore,
) -> MonitorEngine<ScriptedSource, NoopBackend> {
    MonitorEngine::new(
        MonitorConfig::default(),
        ScriptedSource {
            tables: tables.into(),
            current: Vec::new(),
        },
        NoopBackend,
        store,
        1.0,
        100,
        1,
    )
}

#[test]
fn engine_appends_one_row_per_instance_per_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");

    let tables = vec![
        vec![claude(100, "alpha", 0), claude(101, "beta", 0)],
        vec![claude(100, "alpha", 10), claude(101, "beta", 10)],
    ];
    let mut eng = engine_with_store(tables, HistoryStore::open(path));
    eng.cycle();
    eng.cycle();

    let records = eng.query_history(None, TimeRange::default()).unwrap();
    assert_eq!(records.len(), 4);
    assert!(records.iter().all(|r| !r.final_record));

    let alpha = eng
        .query_history(Some("alpha"), TimeRange::default())
        .unwrap();
    assert_eq!(alpha.len(), 2);
    assert!(alpha.iter().all(|r| r.pid == 100));
    // Rows carry the instance surrogate, not just the pid.
    assert_eq!(alpha[0].instance_id, StartId::new("boot", 1100, 100));
}

#[test]
fn vanished_instance_flushes_final_record() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");

    let tables = vec![vec![claude(100, "alpha", 0)], vec![]];
    let mut eng = engine_with_store(tables, HistoryStore::open(path));
    eng.cycle();
    eng.cycle();

    let records = eng.query_history(None, TimeRange::default()).unwrap();
    let finals: Vec<_> = records.iter().filter(|r| r.final_record).collect();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].pid, 100);
}

#[test]
fn disabled_store_changes_nothing_but_persistence() {
    let tables = vec![
        vec![claude(100, "alpha", 0)],
        vec![claude(100, "alpha", 10)],
    ];
    let mut eng = engine_with_store(tables, HistoryStore::disabled());

    // Cycles, classification, and snapshots behave identically.
    assert_eq!(eng.cycle().instances.len(), 1);
    assert_eq!(eng.cycle().instances.len(), 1);

    // Queries return an empty sequence and no error.
    let records = eng.query_history(None, TimeRange::default()).unwrap();
    assert!(records.is_empty());
}

#[test]
fn rows_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("history.jsonl");

    {
        let tables = vec![vec![claude(100, "alpha", 0)]];
        let mut eng = engine_with_store(tables, HistoryStore::open(path.clone()));
        eng.cycle();
    }

    // A new run appends; earlier rows are still readable.
    let tables = vec![vec![claude(200, "beta", 0)]];
    let mut eng = engine_with_store(tables, HistoryStore::open(path));
    eng.cycle();

    let records = eng.query_history(None, TimeRange::default()).unwrap();
    let pids: Vec<u32> = records.iter().map(|r| r.pid).collect();
    assert!(pids.contains(&100));
    assert!(pids.contains(&200));
}
