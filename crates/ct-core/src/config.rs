//! Monitor configuration.
//!
//! All heuristic thresholds (state detection, scheduler tuning, control
//! timeouts, store location) are configuration, not hard-coded constants.
//! Values load from an optional TOML file layered over built-in defaults;
//! unknown fields are ignored so old configs keep working.

use ct_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// State-detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Mean CPU% over the rolling window at or above which an instance is
    /// `running` (sustained, not a single spike).
    pub running_cpu_floor: f64,

    /// A single sample above this marks a CPU burst for the
    /// waiting-vs-idle recency check.
    pub burst_cpu_floor: f64,

    /// Cycles since the last burst within which a low-CPU instance is
    /// `waiting`; beyond it, `idle`.
    pub waiting_grace_cycles: u64,

    /// Number of newest window samples averaged for the `running` check.
    pub recent_window: usize,

    /// Samples required before state detection engages; newer instances
    /// default to `running`.
    pub warmup_samples: usize,

    /// Rolling history capacity per metric.
    pub ring_capacity: usize,

    /// Upper bound on per-cycle synthetic IO rates from the estimation
    /// fallback (bytes).
    pub estimate_cap_bytes: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            running_cpu_floor: 5.0,
            burst_cpu_floor: 3.0,
            waiting_grace_cycles: 30,
            recent_window: 5,
            warmup_samples: 3,
            ring_capacity: 60,
            estimate_cap_bytes: 1024 * 1024,
        }
    }
}

/// Adaptive scheduler tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Lower bound on the sampling interval (seconds).
    pub min_interval_secs: f64,

    /// Upper bound on the sampling interval (seconds).
    pub max_interval_secs: f64,

    /// Cycle latency above which the interval grows (milliseconds).
    pub latency_budget_ms: u64,

    /// Multiplier applied when shrinking the interval.
    pub shrink_factor: f64,

    /// Multiplier applied when growing the interval.
    pub grow_factor: f64,

    /// The IO metric tier (network/disk/connections) samples every Nth
    /// cycle; its worst-case staleness is N * interval.
    pub io_every: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            min_interval_secs: 0.1,
            max_interval_secs: 5.0,
            latency_budget_ms: 500,
            shrink_factor: 0.9,
            grow_factor: 1.2,
            io_every: 3,
        }
    }
}

/// Process controller timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    /// Polling interval while verifying a state change (milliseconds).
    pub poll_interval_ms: u64,

    /// Maximum wait for a signalled process to change state before the
    /// outcome is reported as timed out (milliseconds).
    pub verify_timeout_ms: u64,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            verify_timeout_ms: 2_000,
        }
    }
}

/// Historical store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Whether persistence is enabled at all. Every engine invariant holds
    /// identically when disabled.
    pub enabled: bool,

    /// Store file override; defaults to the platform data directory.
    pub path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}

/// Top-level monitor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub detector: DetectorConfig,
    pub scheduler: SchedulerConfig,
    pub control: ControlConfig,
    pub store: StoreConfig,
}

impl MonitorConfig {
    /// Load configuration from an optional TOML file over defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read {}: {}", path.display(), e))
                })?;
                toml::from_str(&content)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?
            }
            None => MonitorConfig::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.min_interval_secs <= 0.0 {
            return Err(Error::Config(
                "scheduler.min_interval_secs must be positive".into(),
            ));
        }
        if self.scheduler.max_interval_secs < self.scheduler.min_interval_secs {
            return Err(Error::Config(
                "scheduler.max_interval_secs must be >= min_interval_secs".into(),
            ));
        }
        if self.scheduler.io_every == 0 {
            return Err(Error::Config("scheduler.io_every must be >= 1".into()));
        }
        if !(self.scheduler.shrink_factor > 0.0 && self.scheduler.shrink_factor < 1.0) {
            return Err(Error::Config(
                "scheduler.shrink_factor must be in (0, 1)".into(),
            ));
        }
        if self.scheduler.grow_factor <= 1.0 {
            return Err(Error::Config("scheduler.grow_factor must be > 1".into()));
        }
        if self.detector.ring_capacity == 0 {
            return Err(Error::Config("detector.ring_capacity must be >= 1".into()));
        }
        if self.detector.recent_window == 0 {
            return Err(Error::Config("detector.recent_window must be >= 1".into()));
        }
        if self.detector.running_cpu_floor < 0.0 {
            return Err(Error::Config(
                "detector.running_cpu_floor must be >= 0".into(),
            ));
        }
        Ok(())
    }

    /// Resolved store path (config override or platform default).
    pub fn store_path(&self) -> PathBuf {
        self.store.path.clone().unwrap_or_else(default_store_path)
    }
}

/// Default store location under the platform data directory.
pub fn default_store_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("claude-top")
        .join("history.jsonl")
}
