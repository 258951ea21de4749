//! Engine configuration (spec.md §6.3), grounded on
//! `services::config::Config`: a single `#[serde(default)]` struct loadable
//! from TOML, validated, with environment overrides for the handful of
//! settings worth tweaking without touching a file.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scheduler::SchedulerConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),
    #[error("Failed to read configuration: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),
    #[error("Validation failed for {field}: {reason}")]
    ValidationError { field: String, reason: String },
}

fn default_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}

/// Top-level engine configuration (spec.md §6.3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    pub concurrency: usize,
    pub lease_ms: u64,
    pub poll_ms_idle: u64,
    pub poll_ms_busy: u64,
    pub log_tail_max: usize,
    pub stream_buffer_size: usize,
    pub max_logging_buffer: usize,
    pub logging_buffer_truncation: usize,
    pub graceful_shutdown_ms_timeout: u64,
    /// Worker-pool thread count (spec.md §6.3 `workerPool`). `None` (the
    /// default) dispatches handlers inline on the scheduler's own task.
    pub worker_pool: Option<usize>,
    pub database: DatabaseConfig,
    pub logging: LoggingConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let scheduler = SchedulerConfig::new(default_worker_id());
        Self {
            worker_id: scheduler.worker_id.clone(),
            concurrency: scheduler.concurrency,
            lease_ms: scheduler.lease_ms,
            poll_ms_idle: scheduler.poll_ms_idle,
            poll_ms_busy: scheduler.poll_ms_busy,
            log_tail_max: scheduler.log_tail_max,
            stream_buffer_size: scheduler.stream_buffer_size,
            max_logging_buffer: scheduler.max_logging_buffer,
            logging_buffer_truncation: scheduler.logging_buffer_truncation,
            graceful_shutdown_ms_timeout: scheduler.graceful_shutdown_ms_timeout,
            worker_pool: scheduler.worker_pool,
            database: DatabaseConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "sqlite://task-engine.db".to_string(),
            max_connections: 5,
            connect_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Json,
    Pretty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RotationPolicy {
    Daily,
    Hourly,
    Never,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
    pub log_dir: Option<String>,
    pub enable_stdout: bool,
    pub rotation: RotationPolicy,
    pub retention_days: u32,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            log_dir: None,
            enable_stdout: true,
            rotation: RotationPolicy::Daily,
            retention_days: 14,
        }
    }
}

impl EngineConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let mut config: EngineConfig = toml::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load from `task-engine.toml` in the working directory, falling back to
    /// defaults if it does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Path::new("task-engine.toml");
        if path.exists() {
            Self::from_file(path)
        } else {
            let mut config = Self::default();
            config.apply_env_overrides();
            config.validate()?;
            Ok(config)
        }
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("TASK_ENGINE_WORKER_ID") {
            self.worker_id = val;
        }
        if let Ok(val) = std::env::var("TASK_ENGINE_CONCURRENCY") {
            if let Ok(v) = val.parse() {
                self.concurrency = v;
            }
        }
        if let Ok(val) = std::env::var("TASK_ENGINE_DATABASE_PATH") {
            self.database.path = val;
        }
        if let Ok(val) = std::env::var("TASK_ENGINE_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::ValidationError {
                field: "concurrency".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.lease_ms == 0 {
            return Err(ConfigError::ValidationError {
                field: "lease_ms".to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        if self.logging_buffer_truncation > self.max_logging_buffer {
            return Err(ConfigError::ValidationError {
                field: "logging_buffer_truncation".to_string(),
                reason: "must not exceed max_logging_buffer".to_string(),
            });
        }
        Ok(())
    }

    pub fn to_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            worker_id: self.worker_id.clone(),
            concurrency: self.concurrency,
            lease_ms: self.lease_ms,
            poll_ms_idle: self.poll_ms_idle,
            poll_ms_busy: self.poll_ms_busy,
            log_tail_max: self.log_tail_max,
            stream_buffer_size: self.stream_buffer_size,
            max_logging_buffer: self.max_logging_buffer,
            logging_buffer_truncation: self.logging_buffer_truncation,
            graceful_shutdown_ms_timeout: self.graceful_shutdown_ms_timeout,
            worker_pool: self.worker_pool,
        }
    }

    pub fn sample_toml() -> String {
        toml::to_string_pretty(&EngineConfig::default()).unwrap_or_default()
    }
}
