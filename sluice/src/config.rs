//! Engine configuration.
//!
//! Settings are usually loaded from a TOML file; every section and field is optional and falls
//! back to its default. Durations are expressed in milliseconds.
use crate::Error;
use serde::Deserialize;
use std::{path::Path, time::Duration};
use tracing::{debug, info};

/// Root configuration structure.
#[derive(Clone, Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub submission: SubmissionConfig,
    pub interrupt: InterruptConfig,
    pub queries: QueryConfig,
    pub diagnostics: DiagnosticsConfig,
}

/// Submission engine settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SubmissionConfig {
    /// Run the submission engine on its own thread instead of on the enqueuing thread.
    pub dedicated_thread: bool,
    /// Maximum number of payloads folded into a single hardware submission.
    pub max_batched_payloads: usize,
    /// Wrap each payload in engine-recorded timestamps to measure GPU busy time.
    pub collect_timing: bool,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            dedicated_thread: false,
            max_batched_payloads: 128,
            collect_timing: false,
        }
    }
}

/// Interrupt engine settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct InterruptConfig {
    pub dedicated_thread: bool,
    /// Upper bound of a single blocking fence wait.
    pub poll_interval_ms: u64,
    /// A payload that has been signaled but not completed for this long is reported as hung.
    pub hang_timeout_ms: u64,
    /// Maximum time credited to the hang timer per poll; 0 disables clamping.
    ///
    /// Long gaps between polls (debugger breaks, suspended processes) would otherwise count
    /// against the payload.
    pub hang_tick_clamp_ms: u64,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            dedicated_thread: false,
            poll_interval_ms: 10,
            hang_timeout_ms: 5000,
            hang_tick_clamp_ms: 1000,
        }
    }
}

/// Query heap settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct QueryConfig {
    /// Number of queries in each hardware heap.
    pub heap_capacity: u32,
    /// Accumulated unresolved queries that force a resolve on the next payload.
    pub max_pending_queries: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            heap_capacity: 256,
            max_pending_queries: 4096,
        }
    }
}

/// Crash handling settings.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Abort the process after a device-lost report has been delivered.
    pub terminate_on_device_lost: bool,
    /// How long dropping the engine waits for in-flight work.
    pub shutdown_timeout_ms: u64,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            terminate_on_device_lost: true,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl InterruptConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn hang_timeout(&self) -> Duration {
        Duration::from_millis(self.hang_timeout_ms)
    }

    pub fn hang_tick_clamp(&self) -> Option<Duration> {
        (self.hang_tick_clamp_ms != 0).then(|| Duration::from_millis(self.hang_tick_clamp_ms))
    }
}

impl DiagnosticsConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

impl Config {
    /// Parses a configuration from TOML source.
    pub fn from_toml_str(source: &str) -> Result<Self, Error> {
        Ok(toml::from_str(source)?)
    }

    /// Loads the configuration at `path`, falling back to defaults if the file does not exist.
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref();
        if !path.exists() {
            info!("config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&content)?;
        info!("loaded configuration from {:?}", path);
        debug!("config: {:?}", config);
        Ok(config)
    }
}
