//! The monitoring engine: one sampling loop, one cycle at a time.
//!
//! A cycle is: scheduler plan -> one process-table snapshot -> classify and
//! group -> sample and detect -> publish an immutable [`Snapshot`] -> append
//! to the history store -> retune the scheduler. The raw table is fetched
//! exactly once per cycle and shared by every step.
//!
//! Presentation and one-shot callers only ever read the latest completed
//! snapshot; nothing observes partially updated instance state. Control
//! operations are synchronous calls issued between cycles on user command.

use crate::classify::{self, Verdict};
use crate::collect::{ProcessSource, RawProcess};
use crate::config::MonitorConfig;
use crate::control::{
    ControlOp, ControlOutcome, Controller, SelectionSet, SignalBackend, TerminateMode,
};
use crate::instance::{ActivityState, Instance, Snapshot};
use crate::sample::Sampler;
use crate::sched::{AdaptiveScheduler, CycleStats};
use crate::store::{HistoryStore, TimeRange};
use chrono::{DateTime, Utc};
use ct_common::{ProcessId, Result, StartId};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// The monitoring engine.
pub struct MonitorEngine<S: ProcessSource, B: SignalBackend> {
    source: S,
    sampler: Sampler,
    scheduler: AdaptiveScheduler,
    controller: Controller<B>,
    store: HistoryStore,
    config: MonitorConfig,

    instances: BTreeMap<ProcessId, Instance>,
    /// Previous cpu ticks for every table process, for subprocess-group
    /// CPU attribution. Rebuilt each cycle.
    tick_cache: HashMap<ProcessId, (StartId, u64)>,
    /// Operator selection for batch operations.
    selection: SelectionSet,

    latest: Snapshot,
    last_cycle_at: Option<Instant>,
}

impl<S: ProcessSource, B: SignalBackend> MonitorEngine<S, B> {
    pub fn new(
        config: MonitorConfig,
        source: S,
        backend: B,
        store: HistoryStore,
        initial_interval_secs: f64,
        clk_tck: u64,
        num_cores: u64,
    ) -> Self {
        let self_pid = source.self_pid();
        let sampler = Sampler::new(config.detector.clone(), clk_tck, num_cores);
        let scheduler = AdaptiveScheduler::new(config.scheduler.clone(), initial_interval_secs);
        let controller = Controller::new(backend, self_pid, config.control.clone());

        MonitorEngine {
            source,
            sampler,
            scheduler,
            controller,
            store,
            config,
            instances: BTreeMap::new(),
            tick_cache: HashMap::new(),
            selection: SelectionSet::new(),
            latest: Snapshot::empty(0),
            last_cycle_at: None,
        }
    }

    /// Verify the enumeration backend works at all.
    ///
    /// A failure here is fatal: the monitor refuses to start when the
    /// process table cannot be read. Once running, the same failure only
    /// empties a cycle.
    pub fn verify_backend(&mut self) -> Result<()> {
        self.source.snapshot(false)?;
        Ok(())
    }

    /// The latest completed snapshot.
    pub fn latest(&self) -> &Snapshot {
        &self.latest
    }

    /// Current target interval between cycles.
    pub fn interval(&self) -> Duration {
        self.scheduler.interval()
    }

    /// Run one sampling cycle and return the published snapshot.
    pub fn cycle(&mut self) -> &Snapshot {
        let plan = self.scheduler.begin_cycle();
        let started = Instant::now();
        let dt_secs = self
            .last_cycle_at
            .map(|t| started.duration_since(t).as_secs_f64())
            .unwrap_or(0.0);
        self.last_cycle_at = Some(started);

        let table = match self.source.snapshot(plan.include_io) {
            Ok(table) => table,
            Err(e) => {
                // Transient mid-run failure: zero instances this cycle,
                // surfaced, never a crash. Instances survive one miss.
                warn!(error = %e, "enumeration failed; empty cycle");
                self.latest = Snapshot::empty(plan.cycle);
                self.scheduler.tune(&CycleStats {
                    latency_ms: started.elapsed().as_millis() as u64,
                    ..CycleStats::default()
                });
                return &self.latest;
            }
        };

        let self_pid = self.source.self_pid();
        let timestamp = Utc::now();

        // --- Classify ---
        let accepted: Vec<&RawProcess> = table
            .processes
            .iter()
            .filter(|p| classify::classify(p, self_pid) == Verdict::Accept)
            .collect();
        let roots: HashSet<ProcessId> = accepted.iter().map(|p| p.pid).collect();
        let groups = classify::build_subprocess_map(&table, &roots);

        // --- Sample accepted instances ---
        for raw in &accepted {
            let reused = self
                .instances
                .get(&raw.pid)
                .map(|inst| inst.start_id != raw.start_id)
                .unwrap_or(false);
            if reused {
                // The pid now belongs to a different process: close out the
                // old instance before tracking the new one.
                if let Some(old) = self.instances.remove(&raw.pid) {
                    self.store.record_final(&old.view(), timestamp);
                }
            }

            let inst = self.instances.entry(raw.pid).or_insert_with(|| {
                debug!(pid = raw.pid.0, cmd = %raw.cmdline_str(), "new instance");
                Instance::new(
                    raw.pid,
                    raw.ppid,
                    raw.start_id.clone(),
                    raw.cmdline_str(),
                    raw.working_dir.clone(),
                    start_time(raw, timestamp),
                    self.config.detector.ring_capacity,
                    plan.cycle,
                )
            });

            // Reparenting and late-readable details refresh every cycle.
            inst.ppid = raw.ppid;
            if raw.working_dir.is_some() {
                inst.working_dir = raw.working_dir.clone();
            }
            inst.last_seen_cycle = plan.cycle;

            self.sampler.sample_instance(inst, raw, dt_secs, plan.include_io);
        }

        // --- Subprocess-group aggregation ---
        for (&root, descendants) in &groups {
            let Some(inst) = self.instances.get_mut(&root) else {
                continue;
            };
            let mut delta_ticks = 0u64;
            let mut group_mem = 0u64;
            let mut present = 1usize;

            for pid in std::iter::once(root).chain(descendants.iter().copied()) {
                let Some(raw) = table.get(pid) else {
                    continue;
                };
                if pid != root {
                    group_mem += raw.rss_bytes;
                    present += 1;
                } else {
                    group_mem += raw.rss_bytes;
                }
                if let Some((cached_id, cached_ticks)) = self.tick_cache.get(&pid) {
                    if *cached_id == raw.start_id {
                        delta_ticks += raw.cpu_ticks.saturating_sub(*cached_ticks);
                    }
                }
            }

            inst.group_cpu_percent = self.sampler.cpu_percent(delta_ticks, dt_secs);
            inst.group_memory_bytes = group_mem;
            inst.group_size = present;
        }

        // Rebuild the tick cache from the full table.
        self.tick_cache = table
            .processes
            .iter()
            .map(|p| (p.pid, (p.start_id.clone(), p.cpu_ticks)))
            .collect();

        // --- Remove vanished instances, flushing final records ---
        let vanished: Vec<ProcessId> = self
            .instances
            .keys()
            .copied()
            .filter(|pid| !roots.contains(pid))
            .collect();
        for pid in vanished {
            if let Some(old) = self.instances.remove(&pid) {
                debug!(pid = pid.0, "instance gone");
                self.store.record_final(&old.view(), timestamp);
                self.selection_remove(pid);
            }
        }

        // --- Publish ---
        let selection = &self.selection;
        let views = self
            .instances
            .values_mut()
            .map(|inst| {
                inst.selected = selection.contains(inst.pid);
                inst.view()
            })
            .collect();
        self.latest = Snapshot {
            timestamp,
            cycle: plan.cycle,
            instances: views,
        };

        self.store.record_snapshot(&self.latest);

        // --- Retune ---
        let stats = self.cycle_stats(started);
        self.scheduler.tune(&stats);
        debug!(
            cycle = plan.cycle,
            instances = self.latest.instances.len(),
            running = stats.running,
            latency_ms = stats.latency_ms,
            interval_ms = self.scheduler.interval().as_millis() as u64,
            "cycle complete"
        );

        &self.latest
    }

    fn cycle_stats(&self, started: Instant) -> CycleStats {
        let mut stats = CycleStats {
            latency_ms: started.elapsed().as_millis() as u64,
            ..CycleStats::default()
        };
        for inst in self.instances.values() {
            match inst.state {
                ActivityState::Running => stats.running += 1,
                ActivityState::Waiting => stats.waiting += 1,
                ActivityState::Idle | ActivityState::Paused => stats.idle += 1,
            }
        }
        stats
    }

    /// Run cycles until the shutdown flag is set, then flush the store.
    pub fn run(&mut self, shutdown: &AtomicBool) {
        info!("monitor loop started");
        while !shutdown.load(Ordering::Relaxed) {
            self.cycle();

            // Sleep in short slices so an interrupt stops the loop promptly.
            let interval = self.scheduler.interval();
            let slice = Duration::from_millis(50);
            let mut slept = Duration::ZERO;
            while slept < interval && !shutdown.load(Ordering::Relaxed) {
                let step = slice.min(interval - slept);
                std::thread::sleep(step);
                slept += step;
            }
        }
        self.store.flush();
        info!("monitor loop stopped");
    }

    /// One-shot mode: two cycles one settle apart, so CPU deltas are real.
    pub fn one_shot(&mut self, settle: Duration) -> Snapshot {
        self.cycle();
        std::thread::sleep(settle);
        self.cycle().clone()
    }

    // --- Control surface ---

    /// Pause one instance; the paused flag wins over metrics next cycle.
    pub fn pause(&mut self, pid: ProcessId) -> ControlOutcome {
        let outcome = self.controller.pause(pid);
        if outcome == ControlOutcome::Success {
            if let Some(inst) = self.instances.get_mut(&pid) {
                inst.paused = true;
            }
        }
        outcome
    }

    /// Resume one instance, clearing the paused flag.
    pub fn resume(&mut self, pid: ProcessId) -> ControlOutcome {
        let outcome = self.controller.resume(pid);
        if outcome == ControlOutcome::Success {
            if let Some(inst) = self.instances.get_mut(&pid) {
                inst.paused = false;
            }
        }
        outcome
    }

    /// Terminate one instance. The caller is responsible for the two-step
    /// confirmation; the engine executes unconditionally.
    pub fn terminate(&mut self, pid: ProcessId, mode: TerminateMode) -> ControlOutcome {
        self.controller.terminate(pid, mode)
    }

    /// Apply an operation to the whole selection, collecting outcomes.
    pub fn apply_to_selection(&mut self, op: ControlOp) -> Vec<(ProcessId, ControlOutcome)> {
        let outcomes = self.controller.apply_batch(&self.selection, op);
        for (pid, outcome) in &outcomes {
            if *outcome == ControlOutcome::Success {
                if let Some(inst) = self.instances.get_mut(pid) {
                    match op {
                        ControlOp::Pause => inst.paused = true,
                        ControlOp::Resume => inst.paused = false,
                        ControlOp::Terminate(_) => {}
                    }
                }
            }
        }
        outcomes
    }

    /// Toggle selection of one instance for batch operations.
    pub fn toggle_select(&mut self, pid: ProcessId) -> bool {
        self.selection.toggle(pid)
    }

    /// Clear the selection (mode exit).
    pub fn clear_selection(&mut self) {
        self.selection.clear();
    }

    pub fn selection(&self) -> &SelectionSet {
        &self.selection
    }

    fn selection_remove(&mut self, pid: ProcessId) {
        if self.selection.contains(pid) {
            self.selection.toggle(pid);
        }
    }

    // --- History ---

    /// Query the historical store (empty when persistence is disabled).
    pub fn query_history(
        &self,
        project: Option<&str>,
        range: TimeRange,
    ) -> Result<Vec<crate::store::HistoryRecord>> {
        self.store.query(project, range)
    }
}

fn start_time(raw: &RawProcess, fallback: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp(raw.start_time_unix, 0)
        .filter(|_| raw.start_time_unix > 0)
        .unwrap_or(fallback)
}
