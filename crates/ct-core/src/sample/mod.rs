//! Metric sampling and activity-state detection.
//!
//! Per monitored instance, per cycle, the sampler computes:
//! - CPU percent from the utime+stime tick delta, normalized to logical
//!   core count
//! - memory from current RSS
//! - network/disk per-cycle deltas from cumulative counters, clamped to
//!   >= 0 (a negative raw delta is a counter reset and records 0)
//! - an activity-based IO estimate when direct counters are unsupported
//!
//! and then derives the 4-state activity classification
//! {running, waiting, idle, paused}.

use crate::collect::{IoCounters, RawProcess};
use crate::config::DetectorConfig;
use crate::instance::{ActivityState, Instance};
use tracing::trace;

/// Per-cycle IO deltas attributed to one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoDeltas {
    pub net_sent: u64,
    pub net_recv: u64,
    pub disk_read: u64,
    pub disk_write: u64,
    pub estimated: bool,
}

impl IoDeltas {
    fn total(&self) -> u64 {
        self.net_sent + self.net_recv + self.disk_read + self.disk_write
    }
}

/// Metric sampler and state detector.
///
/// `clk_tck` and `num_cores` are injected so tests run with fixed values
/// and the engine supplies the live sysconf numbers.
#[derive(Debug, Clone)]
pub struct Sampler {
    config: DetectorConfig,
    clk_tck: u64,
    num_cores: u64,
}

impl Sampler {
    pub fn new(config: DetectorConfig, clk_tck: u64, num_cores: u64) -> Self {
        Sampler {
            config,
            clk_tck: clk_tck.max(1),
            num_cores: num_cores.max(1),
        }
    }

    /// CPU percent for a tick delta over a wall-clock window, normalized to
    /// logical core count and expressed 0-100.
    pub fn cpu_percent(&self, delta_ticks: u64, dt_secs: f64) -> f64 {
        if dt_secs <= 0.0 {
            return 0.0;
        }
        let cores_worth = delta_ticks as f64 / (self.clk_tck as f64 * dt_secs);
        (cores_worth / self.num_cores as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Update one instance from its raw record for this cycle.
    ///
    /// `io_tier` is false on cycles where the scheduler skipped the IO
    /// metric tier; previous per-cycle IO figures are carried forward and
    /// counter bookkeeping is left untouched.
    pub fn sample_instance(
        &self,
        inst: &mut Instance,
        raw: &RawProcess,
        dt_secs: f64,
        io_tier: bool,
    ) {
        // PID reuse guard: a record with a different start id is a
        // different process and must not produce a delta.
        debug_assert_eq!(inst.start_id, raw.start_id);

        // --- CPU ---
        let cpu = if inst.bookkeeping.has_prev {
            let delta_ticks = raw.cpu_ticks.saturating_sub(inst.bookkeeping.prev_cpu_ticks);
            self.cpu_percent(delta_ticks, dt_secs)
        } else {
            0.0
        };
        inst.bookkeeping.prev_cpu_ticks = raw.cpu_ticks;
        inst.cpu_percent = cpu;

        // --- Memory ---
        inst.memory_bytes = raw.rss_bytes;

        // --- IO tier ---
        if io_tier {
            let deltas = match raw.io {
                IoCounters::Counters {
                    read_bytes,
                    write_bytes,
                    rchar,
                    wchar,
                } => self.counter_deltas(
                    &mut inst.bookkeeping,
                    read_bytes,
                    write_bytes,
                    rchar,
                    wchar,
                ),
                IoCounters::Unsupported => {
                    let burst_recent = cpu >= self.config.burst_cpu_floor
                        || inst.cpu_history.max() >= self.config.burst_cpu_floor;
                    self.estimate_deltas(&mut inst.bookkeeping, raw, burst_recent)
                }
            };
            inst.bookkeeping.prev_rss_bytes = raw.rss_bytes;

            inst.net_sent_delta = deltas.net_sent;
            inst.net_recv_delta = deltas.net_recv;
            inst.disk_read_delta = deltas.disk_read;
            inst.disk_write_delta = deltas.disk_write;
            inst.io_estimated = deltas.estimated;
            inst.connections = raw.connections;

            // Real per-cycle IO counts as an activity signal; estimated IO
            // does not, since it is itself derived from the burst.
            if !deltas.estimated && deltas.total() > 0 {
                inst.bookkeeping.cycles_since_burst = 0;
            }
        }

        // --- Burst recency ---
        if cpu >= self.config.burst_cpu_floor {
            inst.bookkeeping.cycles_since_burst = 0;
        } else {
            inst.bookkeeping.cycles_since_burst =
                inst.bookkeeping.cycles_since_burst.saturating_add(1);
        }

        // --- Rolling history ---
        inst.cpu_history.push(cpu);
        inst.memory_history
            .push(raw.rss_bytes as f64 / (1024.0 * 1024.0));
        inst.net_history
            .push((inst.net_sent_delta + inst.net_recv_delta) as f64);
        inst.disk_history
            .push((inst.disk_read_delta + inst.disk_write_delta) as f64);

        inst.bookkeeping.has_prev = true;

        // --- State ---
        inst.state = self.detect_state(inst, raw.state.is_stopped());

        trace!(
            pid = inst.pid.0,
            cpu = inst.cpu_percent,
            state = %inst.state,
            since_burst = inst.bookkeeping.cycles_since_burst,
            "sampled instance"
        );
    }

    /// Cumulative-counter deltas, clamped to >= 0.
    ///
    /// `rchar`/`wchar` include socket traffic while `read_bytes`/
    /// `write_bytes` are storage only, so the socket share is the excess of
    /// the char counters over the storage counters.
    fn counter_deltas(
        &self,
        book: &mut crate::instance::SampleBookkeeping,
        read_bytes: u64,
        write_bytes: u64,
        rchar: u64,
        wchar: u64,
    ) -> IoDeltas {
        let deltas = match book.prev_io {
            Some((prev_read, prev_write, prev_rchar, prev_wchar)) => {
                let disk_read = read_bytes.saturating_sub(prev_read);
                let disk_write = write_bytes.saturating_sub(prev_write);
                let rchar_delta = rchar.saturating_sub(prev_rchar);
                let wchar_delta = wchar.saturating_sub(prev_wchar);
                IoDeltas {
                    net_recv: rchar_delta.saturating_sub(disk_read),
                    net_sent: wchar_delta.saturating_sub(disk_write),
                    disk_read,
                    disk_write,
                    estimated: false,
                }
            }
            None => IoDeltas::default(),
        };
        book.prev_io = Some((read_bytes, write_bytes, rchar, wchar));
        deltas
    }

    /// Activity-based estimate when direct counters are unsupported.
    ///
    /// A recent CPU burst is read as likely IO activity; the synthetic rate
    /// is derived from connection count and RSS growth and bounded by
    /// `estimate_cap_bytes`, clearly flagged as estimated downstream.
    fn estimate_deltas(
        &self,
        book: &mut crate::instance::SampleBookkeeping,
        raw: &RawProcess,
        burst_recent: bool,
    ) -> IoDeltas {
        if !burst_recent || !book.has_prev {
            return IoDeltas {
                estimated: true,
                ..IoDeltas::default()
            };
        }

        let cap = self.config.estimate_cap_bytes;
        let net_activity = (raw.connections.total as u64 * 2048).min(cap);
        let rss_growth = raw.rss_bytes.saturating_sub(book.prev_rss_bytes);
        let disk_activity = (rss_growth / 10).min(cap);

        IoDeltas {
            net_sent: net_activity / 2,
            net_recv: net_activity / 2,
            disk_read: disk_activity,
            disk_write: disk_activity,
            estimated: true,
        }
    }

    /// Derive the activity state for one instance.
    ///
    /// Tie-break order: `paused` always wins (the controller flag, or the
    /// OS reporting the job-control stop state); `running` requires the
    /// recent window mean over the floor with the latest sample still
    /// bursting; between `waiting` and `idle`, `waiting` wins while the
    /// elapsed cycles since the last burst are within the grace. Monotone:
    /// a fresh burst resets the counter, so an idle instance reclassifies
    /// on the very next cycle.
    pub fn detect_state(&self, inst: &Instance, os_stopped: bool) -> ActivityState {
        if inst.paused || os_stopped {
            return ActivityState::Paused;
        }

        if inst.cpu_history.len() < self.config.warmup_samples {
            return ActivityState::Running;
        }

        let samples = inst.cpu_history.ordered();
        let recent_start = samples.len().saturating_sub(self.config.recent_window);
        let recent = &samples[recent_start..];
        let recent_mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let latest = *recent.last().unwrap_or(&0.0);

        if recent_mean >= self.config.running_cpu_floor && latest >= self.config.burst_cpu_floor {
            return ActivityState::Running;
        }

        if inst.bookkeeping.cycles_since_burst <= self.config.waiting_grace_cycles {
            ActivityState::Waiting
        } else {
            ActivityState::Idle
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collect::{ConnectionCounts, ProcState};
    use chrono::Utc;
    use ct_common::{ProcessId, StartId};

    fn sampler() -> Sampler {
        Sampler::new(DetectorConfig::default(), 100, 1)
    }

    fn instance() -> Instance {
        Instance::new(
            ProcessId(100),
            ProcessId(1),
            StartId::new("boot", 500, 100),
            "claude".into(),
            Some("/work/proj".into()),
            Utc::now(),
            DetectorConfig::default().ring_capacity,
            0,
        )
    }

    fn raw_with(cpu_ticks: u64, io: IoCounters) -> RawProcess {
        RawProcess {
            pid: ProcessId(100),
            ppid: ProcessId(1),
            start_id: StartId::new("boot", 500, 100),
            comm: "claude".into(),
            cmdline: vec!["claude".into()],
            working_dir: Some("/work/proj".into()),
            state: ProcState::Sleeping,
            cpu_ticks,
            num_threads: 4,
            rss_bytes: 256 * 1024 * 1024,
            starttime: 500,
            start_time_unix: 0,
            io,
            connections: ConnectionCounts { total: 3, aux: 1 },
        }
    }

    fn counters(read: u64, write: u64, rchar: u64, wchar: u64) -> IoCounters {
        IoCounters::Counters {
            read_bytes: read,
            write_bytes: write,
            rchar,
            wchar,
        }
    }

    /// Run one cycle at the given tick total; dt = 1s.
    fn cycle(s: &Sampler, inst: &mut Instance, ticks: u64, io: IoCounters) {
        s.sample_instance(inst, &raw_with(ticks, io), 1.0, true);
    }

    #[test]
    fn test_cpu_percent_normalized_to_cores() {
        let one_core = Sampler::new(DetectorConfig::default(), 100, 1);
        // 50 ticks over 1s at CLK_TCK=100 = half a core.
        assert!((one_core.cpu_percent(50, 1.0) - 50.0).abs() < 1e-9);

        let four_cores = Sampler::new(DetectorConfig::default(), 100, 4);
        assert!((four_cores.cpu_percent(50, 1.0) - 12.5).abs() < 1e-9);
    }

    #[test]
    fn test_first_cycle_has_no_delta() {
        let s = sampler();
        let mut inst = instance();
        cycle(&s, &mut inst, 100_000, counters(0, 0, 0, 0));
        assert_eq!(inst.cpu_percent, 0.0);
        assert!(inst.bookkeeping.has_prev);
    }

    #[test]
    fn test_counter_reset_records_zero() {
        let s = sampler();
        let mut inst = instance();

        cycle(&s, &mut inst, 0, counters(10_000, 20_000, 30_000, 40_000));
        // Counters went backwards (reset): every delta clamps to 0.
        cycle(&s, &mut inst, 10, counters(100, 200, 300, 400));

        assert_eq!(inst.disk_read_delta, 0);
        assert_eq!(inst.disk_write_delta, 0);
        assert_eq!(inst.net_sent_delta, 0);
        assert_eq!(inst.net_recv_delta, 0);
        assert!(!inst.io_estimated);
    }

    #[test]
    fn test_deltas_split_net_from_disk() {
        let s = sampler();
        let mut inst = instance();

        cycle(&s, &mut inst, 0, counters(1000, 2000, 5000, 6000));
        cycle(&s, &mut inst, 10, counters(1500, 2200, 6500, 7000));

        // Storage deltas: 500 read, 200 write.
        assert_eq!(inst.disk_read_delta, 500);
        assert_eq!(inst.disk_write_delta, 200);
        // Char deltas 1500/1000 minus storage = socket share.
        assert_eq!(inst.net_recv_delta, 1000);
        assert_eq!(inst.net_sent_delta, 800);
    }

    #[test]
    fn test_unsupported_counters_estimate_on_burst() {
        let s = sampler();
        let mut inst = instance();

        // Warm up with a burst in the window (500 ticks/s = 500% of one
        // core, clamped; well above the burst floor).
        cycle(&s, &mut inst, 0, IoCounters::Unsupported);
        cycle(&s, &mut inst, 500, IoCounters::Unsupported);

        assert!(inst.io_estimated);
        // 3 connections * 2048 / 2 each way.
        assert_eq!(inst.net_sent_delta, 3072);
        assert_eq!(inst.net_recv_delta, 3072);
    }

    #[test]
    fn test_unsupported_counters_no_burst_no_synthetic_rate() {
        let s = sampler();
        let mut inst = instance();

        cycle(&s, &mut inst, 0, IoCounters::Unsupported);
        cycle(&s, &mut inst, 0, IoCounters::Unsupported);

        assert!(inst.io_estimated);
        assert_eq!(inst.net_sent_delta, 0);
        assert_eq!(inst.disk_write_delta, 0);
    }

    #[test]
    fn test_estimate_bounded_by_cap() {
        let mut config = DetectorConfig::default();
        config.estimate_cap_bytes = 1000;
        let s = Sampler::new(config, 100, 1);
        let mut inst = instance();

        let mut raw = raw_with(0, IoCounters::Unsupported);
        raw.connections = ConnectionCounts {
            total: 10_000,
            aux: 0,
        };
        s.sample_instance(&mut inst, &raw, 1.0, true);

        let mut raw = raw_with(500, IoCounters::Unsupported);
        raw.connections = ConnectionCounts {
            total: 10_000,
            aux: 0,
        };
        s.sample_instance(&mut inst, &raw, 1.0, true);

        assert!(inst.net_sent_delta + inst.net_recv_delta <= 1000);
    }

    #[test]
    fn test_io_tier_skip_carries_forward() {
        let s = sampler();
        let mut inst = instance();

        cycle(&s, &mut inst, 0, counters(0, 0, 0, 0));
        cycle(&s, &mut inst, 10, counters(4096, 0, 4096, 0));
        assert_eq!(inst.disk_read_delta, 4096);

        // Tier skipped: previous figures carried, bookkeeping untouched.
        s.sample_instance(&mut inst, &raw_with(20, counters(0, 0, 0, 0)), 1.0, false);
        assert_eq!(inst.disk_read_delta, 4096);
        assert_eq!(inst.bookkeeping.prev_io, Some((4096, 0, 4096, 0)));
    }

    #[test]
    fn test_state_sequence_running_waiting_idle() {
        let s = sampler();
        let mut inst = instance();
        let mut states = Vec::new();

        // 10 cycles at 85% CPU (85 ticks/s, CLK_TCK 100, 1 core).
        let mut ticks = 0;
        for _ in 0..10 {
            ticks += 85;
            cycle(&s, &mut inst, ticks, counters(0, 0, 0, 0));
            states.push(inst.state);
        }
        // Then 2% CPU with no IO signal for 40 cycles.
        for _ in 0..40 {
            ticks += 2;
            cycle(&s, &mut inst, ticks, counters(0, 0, 0, 0));
            states.push(inst.state);
        }

        // High-CPU cycles all classify running (first cycles are warmup
        // which also reports running).
        assert!(states[..10].iter().all(|s| *s == ActivityState::Running));

        // Low-CPU cycles: waiting within the grace, then idle.
        let grace = DetectorConfig::default().waiting_grace_cycles as usize;
        let low = &states[10..];
        assert!(low[..grace].iter().all(|s| *s == ActivityState::Waiting));
        assert!(low[grace..].iter().all(|s| *s == ActivityState::Idle));

        // The waiting -> idle transition happens exactly once.
        let transitions = states
            .windows(2)
            .filter(|w| w[0] == ActivityState::Waiting && w[1] == ActivityState::Idle)
            .count();
        assert_eq!(transitions, 1);
    }

    #[test]
    fn test_idle_reclassifies_next_cycle_on_burst() {
        let s = sampler();
        let mut inst = instance();

        let mut ticks = 0;
        for _ in 0..40 {
            cycle(&s, &mut inst, ticks, counters(0, 0, 0, 0));
        }
        assert_eq!(inst.state, ActivityState::Idle);

        // One burst: no hysteresis lag beyond one cycle.
        ticks += 90;
        cycle(&s, &mut inst, ticks, counters(0, 0, 0, 0));
        assert_ne!(inst.state, ActivityState::Idle);
    }

    #[test]
    fn test_paused_wins_then_running_within_one_cycle() {
        let s = sampler();
        let mut inst = instance();

        // Sustained activity to fill the window.
        let mut ticks = 0;
        for _ in 0..5 {
            ticks += 85;
            cycle(&s, &mut inst, ticks, counters(0, 0, 0, 0));
        }
        assert_eq!(inst.state, ActivityState::Running);

        // Controller pauses: state must be paused regardless of metrics.
        inst.paused = true;
        cycle(&s, &mut inst, ticks, counters(0, 0, 0, 0));
        assert_eq!(inst.state, ActivityState::Paused);

        // Resume with sustained CPU: running within exactly one cycle.
        inst.paused = false;
        ticks += 85;
        cycle(&s, &mut inst, ticks, counters(0, 0, 0, 0));
        assert_eq!(inst.state, ActivityState::Running);
    }

    #[test]
    fn test_os_stop_state_shows_paused() {
        let s = sampler();
        let mut inst = instance();
        let mut raw = raw_with(0, counters(0, 0, 0, 0));
        raw.state = ProcState::Stopped;
        s.sample_instance(&mut inst, &raw, 1.0, true);
        assert_eq!(inst.state, ActivityState::Paused);
    }

    #[test]
    fn test_real_io_counts_as_activity_signal() {
        let s = sampler();
        let mut inst = instance();

        // Long idle.
        for _ in 0..40 {
            cycle(&s, &mut inst, 0, counters(0, 0, 0, 0));
        }
        assert_eq!(inst.state, ActivityState::Idle);

        // Zero CPU but real disk traffic: mid-session, so waiting.
        cycle(&s, &mut inst, 0, counters(8192, 0, 8192, 0));
        assert_eq!(inst.state, ActivityState::Waiting);
    }
}
