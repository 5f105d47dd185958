//! Site configuration via `spectra.toml`
//!
//! Every option has a default, so an empty file (or no file at all) yields a
//! working two-partition site with speculation at `SP3_REMOTE` only.

use serde::{Deserialize, Serialize};
use spectra_concurrency::CheckerKind;
use spectra_core::{SpectraError, SpectraResult, SpeculationType};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file name
pub const CONFIG_FILE_NAME: &str = "spectra.toml";

/// Site configuration loaded from `spectra.toml`
///
/// # Example
///
/// ```toml
/// partitions = 2
/// specexec_enable = true
/// specexec_ignore_stallpoints = ["IDLE", "SP1_LOCAL", "SP2_REMOTE_BEFORE", "SP2_REMOTE_AFTER", "SP3_LOCAL"]
/// markov_enable = true
/// markov_path = "model.json"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SiteConfig {
    /// Number of partitions served by this site
    pub partitions: u32,
    /// Master switch for speculative execution
    pub specexec_enable: bool,
    /// Stall points at which no speculation happens
    pub specexec_ignore_stallpoints: Vec<SpeculationType>,
    /// Lock queue entries inspected per scheduling decision
    pub specexec_window: usize,
    /// Conflict checker installed at every partition
    pub specexec_checker: CheckerKind,
    /// Assume single-partition when nothing predicts otherwise
    pub exec_force_singlepartitioned: bool,
    /// Per-executor timing of idle, exclusive and speculative work
    pub exec_profiling: bool,
    /// Per-lock-queue admission statistics
    pub queue_profiling: bool,
    /// Enable the transaction counters
    pub txn_counters: bool,
    /// Attach execution details to every client response
    pub txn_client_debug: bool,
    /// Restarts allowed for mispredicted or timed-out transactions
    pub txn_restart_limit: u32,
    /// Per-partition lock queue capacity
    pub queue_capacity: usize,
    /// Bounded wait for remote work results and prepare acknowledgments
    pub remote_wait_timeout_ms: u64,
    /// Safety-net timeout of every condition-variable wait
    pub poll_interval_ms: u64,
    /// Enable the path estimator
    pub markov_enable: bool,
    /// Path model file (JSON)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub markov_path: Option<PathBuf>,
    /// Confidence required to declare a partition done
    pub markov_confidence: f64,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            partitions: 2,
            specexec_enable: true,
            specexec_ignore_stallpoints: SpeculationType::default_ignored(),
            specexec_window: 16,
            specexec_checker: CheckerKind::ReadWriteSet,
            exec_force_singlepartitioned: true,
            exec_profiling: false,
            queue_profiling: false,
            txn_counters: true,
            txn_client_debug: false,
            txn_restart_limit: 3,
            queue_capacity: 10_000,
            remote_wait_timeout_ms: 5_000,
            poll_interval_ms: 50,
            markov_enable: false,
            markov_path: None,
            markov_confidence: 0.95,
        }
    }
}

impl SiteConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# Spectra site configuration

# Number of partitions served by this site
partitions = 2

# Speculative execution while partitions wait inside the two-phase protocol
specexec_enable = true
# Stall points at which speculation is suppressed.
# Known values: IDLE, SP1_LOCAL, SP2_REMOTE_BEFORE, SP2_REMOTE_AFTER, SP3_LOCAL, SP3_REMOTE
specexec_ignore_stallpoints = ["IDLE", "SP1_LOCAL", "SP2_REMOTE_BEFORE", "SP2_REMOTE_AFTER", "SP3_LOCAL"]
# Lock queue entries inspected per scheduling decision
specexec_window = 16
# "read_write_set" (default) or "allow_all"
specexec_checker = "read_write_set"

# Treat transactions without a prediction as single-partition
exec_force_singlepartitioned = true
exec_profiling = false
queue_profiling = false

txn_counters = true
txn_client_debug = false
txn_restart_limit = 3

queue_capacity = 10000
remote_wait_timeout_ms = 5000
poll_interval_ms = 50

# Path estimator (Early 2PC)
markov_enable = false
# markov_path = "model.json"
markov_confidence = 0.95
"#
    }

    /// Check every value; called by `from_file` and at site start
    pub fn validate(&self) -> SpectraResult<()> {
        if self.partitions == 0 {
            return Err(SpectraError::InvalidConfig(
                "partitions must be at least 1".to_string(),
            ));
        }
        if self.queue_capacity == 0 {
            return Err(SpectraError::InvalidConfig(
                "queue_capacity must be at least 1".to_string(),
            ));
        }
        if self.specexec_window == 0 {
            return Err(SpectraError::InvalidConfig(
                "specexec_window must be at least 1".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 || self.remote_wait_timeout_ms == 0 {
            return Err(SpectraError::InvalidConfig(
                "poll_interval_ms and remote_wait_timeout_ms must be positive".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.markov_confidence) {
            return Err(SpectraError::InvalidConfig(format!(
                "markov_confidence {} is outside [0, 1]",
                self.markov_confidence
            )));
        }
        if self.markov_enable && self.markov_path.is_none() {
            return Err(SpectraError::InvalidConfig(
                "markov_enable requires markov_path".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether speculation may happen at `stall`
    pub fn speculation_allowed_at(&self, stall: SpeculationType) -> bool {
        self.specexec_enable && !self.specexec_ignore_stallpoints.contains(&stall)
    }

    /// Remote wait bound as a `Duration`
    pub fn remote_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_wait_timeout_ms)
    }

    /// Poll interval as a `Duration`
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> SpectraResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SpectraError::InvalidConfig(format!(
                "failed to read config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        let config: SiteConfig = toml::from_str(&content).map_err(|e| {
            SpectraError::InvalidConfig(format!(
                "failed to parse config file '{}': {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Write the default config file if it does not already exist.
    pub fn write_default_if_missing(path: &Path) -> SpectraResult<()> {
        if !path.exists() {
            std::fs::write(path, Self::default_toml())?;
        }
        Ok(())
    }

    /// Serialize this config to TOML and write it to the given path.
    pub fn write_to_file(&self, path: &Path) -> SpectraResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| SpectraError::Serialization(format!("failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
