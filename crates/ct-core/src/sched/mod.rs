//! Adaptive sampling scheduler.
//!
//! The scheduler owns two decisions:
//! - the target sampling interval, tuned each cycle within the configured
//!   [min, max] bound from observed activity and cycle latency
//! - which metric tiers run this cycle: the Core tier (state/CPU/memory)
//!   runs every cycle, the Io tier (network/disk/connections) every Nth
//!   cycle, so a tier-N metric is stale by at most N * interval.
//!
//! Raw query results are fetched once per cycle and shared by every
//! consumer; the scheduler only plans, it never queries.

use crate::config::SchedulerConfig;
use std::time::Duration;

/// The plan for one sampling cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CyclePlan {
    /// 1-based cycle number.
    pub cycle: u64,
    /// Whether the Io metric tier is sampled this cycle.
    pub include_io: bool,
}

/// Observed outcome of one cycle, fed back into interval tuning.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleStats {
    pub running: usize,
    pub waiting: usize,
    pub idle: usize,
    pub latency_ms: u64,
}

impl CycleStats {
    fn total(&self) -> usize {
        self.running + self.waiting + self.idle
    }
}

/// Adaptive scheduler state. Process-lifetime scope, reset only at startup.
#[derive(Debug, Clone)]
pub struct AdaptiveScheduler {
    config: SchedulerConfig,
    interval_secs: f64,
    cycle: u64,
}

impl AdaptiveScheduler {
    pub fn new(config: SchedulerConfig, initial_interval_secs: f64) -> Self {
        let interval_secs =
            initial_interval_secs.clamp(config.min_interval_secs, config.max_interval_secs);
        AdaptiveScheduler {
            config,
            interval_secs,
            cycle: 0,
        }
    }

    /// Current target interval between cycles.
    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(self.interval_secs)
    }

    /// Cycles completed so far.
    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    /// Start the next cycle and return its plan.
    ///
    /// The Io tier runs on the first cycle (so instances get counters
    /// immediately) and every `io_every`th cycle after it - deterministic,
    /// never deferred, which is what bounds per-tier staleness.
    pub fn begin_cycle(&mut self) -> CyclePlan {
        self.cycle += 1;
        CyclePlan {
            cycle: self.cycle,
            include_io: (self.cycle - 1) % self.config.io_every == 0,
        }
    }

    /// Feed back one cycle's outcome and retune the interval.
    ///
    /// Grows under load (cycle latency over budget) and when there is
    /// nothing active to watch; shrinks while running instances exist and
    /// cycles are cheap.
    pub fn tune(&mut self, stats: &CycleStats) {
        let over_budget = stats.latency_ms > self.config.latency_budget_ms;
        let nothing_active = stats.total() == 0 || (stats.running == 0 && stats.waiting == 0);

        if over_budget || nothing_active {
            self.interval_secs *= self.config.grow_factor;
        } else if stats.running > 0 {
            self.interval_secs *= self.config.shrink_factor;
        }

        self.interval_secs = self
            .interval_secs
            .clamp(self.config.min_interval_secs, self.config.max_interval_secs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sched(io_every: u64) -> AdaptiveScheduler {
        let config = SchedulerConfig {
            io_every,
            ..Default::default()
        };
        AdaptiveScheduler::new(config, 1.0)
    }

    fn stats(running: usize, idle: usize, latency_ms: u64) -> CycleStats {
        CycleStats {
            running,
            waiting: 0,
            idle,
            latency_ms,
        }
    }

    #[test]
    fn test_initial_interval_clamped() {
        let s = AdaptiveScheduler::new(SchedulerConfig::default(), 100.0);
        assert_eq!(s.interval(), Duration::from_secs_f64(5.0));

        let s = AdaptiveScheduler::new(SchedulerConfig::default(), 0.0);
        assert_eq!(s.interval(), Duration::from_secs_f64(0.1));
    }

    #[test]
    fn test_io_tier_deterministic_schedule() {
        let mut s = sched(3);
        let included: Vec<bool> = (0..9).map(|_| s.begin_cycle().include_io).collect();
        assert_eq!(
            included,
            vec![true, false, false, true, false, false, true, false, false]
        );
    }

    #[test]
    fn test_io_tier_every_cycle_when_one() {
        let mut s = sched(1);
        assert!((0..5).all(|_| s.begin_cycle().include_io));
    }

    #[test]
    fn test_shrinks_while_running_and_cheap() {
        let mut s = sched(3);
        let before = s.interval();
        s.tune(&stats(2, 0, 10));
        assert!(s.interval() < before);
    }

    #[test]
    fn test_grows_over_latency_budget() {
        let mut s = sched(3);
        let before = s.interval();
        s.tune(&stats(2, 0, 10_000));
        assert!(s.interval() > before);
    }

    #[test]
    fn test_grows_when_all_idle() {
        let mut s = sched(3);
        let before = s.interval();
        s.tune(&stats(0, 4, 10));
        assert!(s.interval() > before);
    }

    #[test]
    fn test_interval_stays_within_bounds() {
        let mut s = sched(3);
        for _ in 0..100 {
            s.tune(&stats(0, 0, 10_000));
        }
        assert_eq!(s.interval(), Duration::from_secs_f64(5.0));

        for _ in 0..200 {
            s.tune(&stats(3, 0, 1));
        }
        assert_eq!(s.interval(), Duration::from_secs_f64(0.1));
    }

    #[test]
    fn test_cycle_counter_advances() {
        let mut s = sched(2);
        assert_eq!(s.begin_cycle().cycle, 1);
        assert_eq!(s.begin_cycle().cycle, 2);
        assert_eq!(s.cycle(), 2);
    }
}
