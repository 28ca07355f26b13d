//! Configuration management

use crate::error::{Result, TelemetryError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Largest channel a store will allocate, in cells.
pub const MAX_CAPACITY: u64 = 1 << 24;
/// Largest key a cell will hold, in bytes.
pub const MAX_KEY_SIZE: usize = 1024;

/// Which slot store backs the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Shared-memory cells, usable from a forked consumer.
    #[default]
    Shared,
    /// In-process bounded queue of whole records.
    Queue,
}

/// Which execution unit runs the consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerKind {
    #[default]
    Thread,
    Process,
}

impl FromStr for Backend {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "shared" | "shm" => Ok(Backend::Shared),
            "queue" => Ok(Backend::Queue),
            other => Err(TelemetryError::config(format!("unknown backend {:?}", other))),
        }
    }
}

impl FromStr for WorkerKind {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(WorkerKind::Thread),
            "process" => Ok(WorkerKind::Process),
            other => Err(TelemetryError::config(format!("unknown worker {:?}", other))),
        }
    }
}

/// Main channel configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub capacity: u64,
    pub key_size: usize,
    pub backend: Backend,
    pub worker: WorkerKind,
    pub startup_timeout_ms: u64,
    pub drain_timeout_ms: u64,
    pub poll: PollConfig,
    pub logging: LoggingConfig,
}

/// Backoff used by every polling loop (worker idle, startup, drain)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollConfig {
    pub spins: u32,
    pub min_sleep_us: u64,
    pub max_sleep_us: u64,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub directory: PathBuf,
    pub max_file_size: u64,
    pub max_files: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            capacity: 20_000,
            key_size: 64,
            backend: Backend::Shared,
            worker: WorkerKind::Thread,
            startup_timeout_ms: 5_000,
            drain_timeout_ms: 30_000,
            poll: PollConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            spins: 64,
            min_sleep_us: 10,
            max_sleep_us: 1_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            directory: PathBuf::from("/tmp"),
            max_file_size: 10_000_000, // 10MB
            max_files: 5,
        }
    }
}

fn env_override<T>(namespace: &str, name: &str, slot: &mut T) -> Result<()>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let key = format!(
        "{}_{}",
        namespace.to_uppercase(),
        name.to_uppercase().replace('.', "_")
    );
    if let Ok(raw) = std::env::var(&key) {
        *slot = raw
            .parse()
            .map_err(|e| TelemetryError::config(format!("{}={:?}: {}", key, raw, e)))?;
        log::debug!("Config override from {}", key);
    }
    Ok(())
}

impl TelemetryConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            TelemetryError::config(format!("Failed to read config file {:?}: {}", path, e))
        })?;
        let config = Self::from_toml_str(&content)?;
        log::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                TelemetryError::config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| TelemetryError::config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| TelemetryError::config(format!("Failed to write config file: {}", e)))?;

        log::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Applies `{NAMESPACE}_{FIELD}` environment variables, nested fields use
    /// `_` in place of `.` (e.g. `RING_POLL_MAX_SLEEP_US`).
    pub fn apply_env(&mut self, namespace: &str) -> Result<()> {
        env_override(namespace, "capacity", &mut self.capacity)?;
        env_override(namespace, "key_size", &mut self.key_size)?;
        env_override(namespace, "backend", &mut self.backend)?;
        env_override(namespace, "worker", &mut self.worker)?;
        env_override(namespace, "startup_timeout_ms", &mut self.startup_timeout_ms)?;
        env_override(namespace, "drain_timeout_ms", &mut self.drain_timeout_ms)?;
        env_override(namespace, "poll.spins", &mut self.poll.spins)?;
        env_override(namespace, "poll.min_sleep_us", &mut self.poll.min_sleep_us)?;
        env_override(namespace, "poll.max_sleep_us", &mut self.poll.max_sleep_us)?;
        env_override(namespace, "logging.level", &mut self.logging.level)?;
        env_override(namespace, "logging.directory", &mut self.logging.directory)?;
        env_override(namespace, "logging.max_file_size", &mut self.logging.max_file_size)?;
        env_override(namespace, "logging.max_files", &mut self.logging.max_files)?;
        Ok(())
    }

    /// Rejects unusable settings and clamps the tunables into range.
    pub fn validate(&mut self) -> Result<()> {
        if self.capacity == 0 {
            return Err(TelemetryError::config("capacity must be at least 1"));
        }
        if self.capacity > MAX_CAPACITY {
            return Err(TelemetryError::config(format!(
                "capacity {} exceeds the maximum of {}",
                self.capacity, MAX_CAPACITY
            )));
        }
        if self.key_size == 0 {
            return Err(TelemetryError::config("key_size must be at least 1"));
        }
        if self.key_size > MAX_KEY_SIZE {
            return Err(TelemetryError::config(format!(
                "key_size {} exceeds the maximum of {}",
                self.key_size, MAX_KEY_SIZE
            )));
        }
        if self.backend == Backend::Queue && self.worker == WorkerKind::Process {
            return Err(TelemetryError::config(
                "the queue backend lives in process memory and needs a thread worker",
            ));
        }

        // Sentinels must fit, otherwise framed records cannot be written
        self.key_size = self.key_size.max(2);

        self.startup_timeout_ms = self.startup_timeout_ms.max(10);
        self.drain_timeout_ms = self.drain_timeout_ms.max(10);

        self.poll.spins = self.poll.spins.min(100_000);
        self.poll.min_sleep_us = self.poll.min_sleep_us.clamp(1, 100_000);
        self.poll.max_sleep_us = self
            .poll
            .max_sleep_us
            .clamp(self.poll.min_sleep_us, 1_000_000);

        self.logging.max_file_size = self.logging.max_file_size.max(1_000_000); // At least 1MB
        self.logging.max_files = self.logging.max_files.clamp(1, 20);

        Ok(())
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
