//! Load config from file and environment.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempsync_core::averaging::DEFAULT_TOLERANCE;
use tempsync_core::coordinator::DEFAULT_WORKER_COUNT;
use tempsync_core::worker::{seed_for, DEFAULT_SEED_TABLE};
use tempsync_core::{CoordinatorParams, SeedSource, WorkerId, DEFAULT_QUEUE_CAPACITY};
use tracing::warn;

use crate::coordinator::CoordinatorSettings;
use crate::worker::WorkerSettings;

/// Configuration. File: ~/.config/tempsync/config.toml or /etc/tempsync/config.toml.
/// Env overrides: TEMPSYNC_RUNTIME_DIR, TEMPSYNC_WORKERS, TEMPSYNC_TOLERANCE,
/// TEMPSYNC_QUEUE_CAPACITY.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Directory holding the channel sockets (default $TMPDIR/tempsync).
    #[serde(default = "default_runtime_dir")]
    pub runtime_dir: PathBuf,
    /// Pending messages per channel (default 10).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct CoordinatorConfig {
    pub workers: usize,
    pub seed_estimate: f64,
    pub tolerance: f64,
    /// First wait for a worker's ACK; doubled on every further attempt.
    pub handshake_timeout_ms: u64,
    pub handshake_attempts: u32,
    /// Fail when a round is not complete within this time. Unset: wait forever.
    pub round_timeout_ms: Option<u64>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKER_COUNT,
            seed_estimate: 0.0,
            tolerance: DEFAULT_TOLERANCE,
            handshake_timeout_ms: 1000,
            handshake_attempts: 3,
            round_timeout_ms: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    /// Wait for SYN_ACK per attempt.
    pub handshake_timeout_ms: u64,
    pub handshake_attempts: u32,
    /// Pause before re-sending SYN; doubled per attempt, plus jitter.
    pub backoff_ms: u64,
    /// Seed per worker class.
    pub seeds: Vec<f64>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: 2000,
            handshake_attempts: 5,
            backoff_ms: 200,
            seeds: DEFAULT_SEED_TABLE.to_vec(),
        }
    }
}

fn default_runtime_dir() -> PathBuf {
    std::env::temp_dir().join("tempsync")
}
fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            runtime_dir: default_runtime_dir(),
            queue_capacity: default_queue_capacity(),
            coordinator: CoordinatorConfig::default(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.workers == 0 {
            return Err(ConfigError::Invalid("coordinator.workers must be at least 1".into()));
        }
        if !self.coordinator.tolerance.is_finite() || self.coordinator.tolerance < 0.0 {
            return Err(ConfigError::Invalid(
                "coordinator.tolerance must be a non-negative number".into(),
            ));
        }
        if !self.coordinator.seed_estimate.is_finite() {
            return Err(ConfigError::Invalid("coordinator.seed_estimate must be finite".into()));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::Invalid("queue_capacity must be at least 1".into()));
        }
        if self.coordinator.handshake_attempts == 0 || self.worker.handshake_attempts == 0 {
            return Err(ConfigError::Invalid("handshake_attempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            params: CoordinatorParams {
                worker_count: self.coordinator.workers,
                seed_estimate: self.coordinator.seed_estimate,
                tolerance: self.coordinator.tolerance,
            },
            handshake_timeout: Duration::from_millis(self.coordinator.handshake_timeout_ms),
            handshake_attempts: self.coordinator.handshake_attempts,
            round_timeout: self.coordinator.round_timeout_ms.map(Duration::from_millis),
        }
    }

    /// Worker settings; `class` picks a seed from the table, `initial` overrides it,
    /// neither means the seed follows the index assigned by the coordinator.
    pub fn worker_settings(
        &self,
        worker_id: WorkerId,
        class: Option<usize>,
        initial: Option<f64>,
    ) -> WorkerSettings {
        let seed = match (initial, class) {
            (Some(v), _) => SeedSource::Fixed(v),
            (None, Some(c)) => SeedSource::Fixed(seed_for(&self.worker.seeds, c)),
            (None, None) => SeedSource::FromAssignedIndex(self.worker.seeds.clone()),
        };
        WorkerSettings {
            worker_id,
            seed,
            handshake_timeout: Duration::from_millis(self.worker.handshake_timeout_ms),
            handshake_attempts: self.worker.handshake_attempts,
            backoff: Duration::from_millis(self.worker.backoff_ms),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Load config: default, then config file (explicit path or first one found), then env vars.
pub fn load(explicit: Option<&Path>) -> Result<Config, ConfigError> {
    let mut c = match explicit {
        Some(p) => load_file(p)?,
        None => match config_paths().into_iter().find(|p| p.exists()) {
            Some(p) => load_file(&p)?,
            None => Config::default(),
        },
    };
    apply_env(&mut c, |k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/tempsync/config.toml"));
    }
    out.push(PathBuf::from("/etc/tempsync/config.toml"));
    out
}

fn load_file(path: &Path) -> Result<Config, ConfigError> {
    let s = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str::<Config>(&s).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

/// Apply environment overrides. Unparseable values are ignored with a warning.
fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("TEMPSYNC_RUNTIME_DIR") {
        c.runtime_dir = PathBuf::from(s);
    }
    if let Some(s) = var("TEMPSYNC_WORKERS") {
        match s.parse::<usize>() {
            Ok(n) => c.coordinator.workers = n,
            Err(_) => warn!(value = %s, "ignoring invalid TEMPSYNC_WORKERS"),
        }
    }
    if let Some(s) = var("TEMPSYNC_TOLERANCE") {
        match s.parse::<f64>() {
            Ok(t) => c.coordinator.tolerance = t,
            Err(_) => warn!(value = %s, "ignoring invalid TEMPSYNC_TOLERANCE"),
        }
    }
    if let Some(s) = var("TEMPSYNC_QUEUE_CAPACITY") {
        match s.parse::<usize>() {
            Ok(n) => c.queue_capacity = n,
            Err(_) => warn!(value = %s, "ignoring invalid TEMPSYNC_QUEUE_CAPACITY"),
        }
    }
}
