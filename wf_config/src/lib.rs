//! ABOUTME: Configuration management with validation and environment loading
//! ABOUTME: Handles scheduler, logger, database, and flow-directory settings

use config::{Config as ConfigBuilder, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use validator::Validate;
use wf_core::{Error, Result};

/// Main configuration struct
#[derive(Debug, Clone, Deserialize, Serialize, Validate, Default)]
#[serde(default)]
pub struct Config {
    #[validate(nested)]
    pub scheduler: SchedulerConfig,
    #[validate(nested)]
    pub logger: LoggerConfig,
    #[validate(nested)]
    pub database: DatabaseConfig,
    #[validate(nested)]
    pub flows: FlowsConfig,
    pub keystore: KeystoreConfig,
}

/// One logical queue the scheduler pulls from, with its fair-share weight
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    pub payload_type: String,
    pub weight: u32,
}

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct SchedulerConfig {
    /// Number of parallel worker loops
    #[validate(range(min = 1, max = 256))]
    pub worker_count: usize,
    /// Lease duration granted on each job pull
    #[validate(range(min = 5, max = 3600))]
    pub lease_ttl_seconds: u64,
    /// How often expired leases are reclaimed
    #[validate(range(min = 1, max = 3600))]
    pub reclaim_interval_seconds: u64,
    /// Polling fallback interval when no NOTIFY arrives
    #[validate(range(min = 100, max = 60000))]
    pub poll_interval_ms: u64,
    /// Wall-clock timeout for a single flow execution
    #[validate(range(min = 1, max = 86400))]
    pub flow_execution_timeout_seconds: u64,
    /// Per-action retry budget (1 means no retry)
    #[validate(range(min = 1, max = 100))]
    pub max_action_retries: u32,
    /// Delay before a failed action's execution is requeued
    #[validate(range(min = 1, max = 3600))]
    pub action_backoff_seconds: u64,
    /// How long shutdown waits for running handlers
    #[validate(range(min = 1, max = 600))]
    pub shutdown_grace_seconds: u64,
    /// How often the cron syncer reconciles schedules
    #[validate(range(min = 5, max = 3600))]
    pub cron_sync_interval_seconds: u64,
    /// Fire missed cron instants after downtime (reserved; must stay false)
    pub cron_catch_up: bool,
    /// Done job rows older than this are purged
    #[validate(range(min = 1, max = 365))]
    pub job_retention_days: u32,
    /// Ordered queue list with weights
    pub queues: Vec<QueueConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_count: 8,
            lease_ttl_seconds: 60,
            reclaim_interval_seconds: 30,
            poll_interval_ms: 1000,
            flow_execution_timeout_seconds: 3600,
            max_action_retries: 1,
            action_backoff_seconds: 10,
            shutdown_grace_seconds: 30,
            cron_sync_interval_seconds: 60,
            cron_catch_up: false,
            job_retention_days: 30,
            queues: vec![
                QueueConfig {
                    payload_type: "flow_execution".to_string(),
                    weight: 8,
                },
                QueueConfig {
                    payload_type: "notification".to_string(),
                    weight: 2,
                },
            ],
        }
    }
}

impl SchedulerConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_secs(self.lease_ttl_seconds)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn flow_execution_timeout(&self) -> Duration {
        Duration::from_secs(self.flow_execution_timeout_seconds)
    }

    pub fn action_backoff(&self) -> Duration {
        Duration::from_secs(self.action_backoff_seconds)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }

    pub fn cron_sync_interval(&self) -> Duration {
        Duration::from_secs(self.cron_sync_interval_seconds)
    }
}

/// Execution log file settings
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct LoggerConfig {
    /// Directory holding per-execution log files
    #[validate(length(min = 1))]
    pub directory: String,
    /// Rotate the current file once it exceeds this size
    #[validate(range(min = 1, max = 1024))]
    pub max_size_mb: u64,
    /// Log files older than this are swept
    #[validate(range(min = 1, max = 8760))]
    pub retention_hours: u64,
    /// Retention sweep interval
    #[validate(range(min = 60, max = 86400))]
    pub scan_interval_seconds: u64,
    /// Buffer flush cadence
    #[validate(range(min = 10, max = 10000))]
    pub flush_interval_ms: u64,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            directory: "./data/logs".to_string(),
            max_size_mb: 16,
            retention_hours: 24 * 14,
            scan_interval_seconds: 3600,
            flush_interval_ms: 100,
        }
    }
}

impl LoggerConfig {
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb * 1024 * 1024
    }

    pub fn retention_time(&self) -> Duration {
        Duration::from_secs(self.retention_hours * 3600)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval_seconds)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}

/// Database configuration with secret redaction
#[derive(Clone, Deserialize, Serialize, Validate)]
pub struct DatabaseConfig {
    /// Postgres connection URL
    #[validate(length(min = 1))]
    pub url: String,
    #[validate(range(min = 1, max = 100))]
    pub pool_size: u32,
    #[validate(range(min = 1, max = 300))]
    pub acquire_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost/weft".to_string(),
            pool_size: 10,
            acquire_timeout_seconds: 30,
        }
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("url", &"[REDACTED]")
            .field("pool_size", &self.pool_size)
            .field("acquire_timeout_seconds", &self.acquire_timeout_seconds)
            .finish()
    }
}

/// Flow definition directory
#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct FlowsConfig {
    #[validate(length(min = 1))]
    pub directory: String,
}

impl Default for FlowsConfig {
    fn default() -> Self {
        Self {
            directory: "./flows".to_string(),
        }
    }
}

/// External secret keeper
#[derive(Clone, Deserialize, Serialize, Default)]
pub struct KeystoreConfig {
    pub keeper_url: Option<String>,
}

impl fmt::Debug for KeystoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeystoreConfig")
            .field("keeper_url", &self.keeper_url.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl Config {
    /// Load configuration from environment variables and optional config file
    pub fn load() -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        builder = builder
            .set_default("scheduler.worker_count", 8)?
            .set_default("scheduler.lease_ttl_seconds", 60)?
            .set_default("scheduler.reclaim_interval_seconds", 30)?
            .set_default("scheduler.poll_interval_ms", 1000)?
            .set_default("scheduler.flow_execution_timeout_seconds", 3600)?
            .set_default("scheduler.max_action_retries", 1)?
            .set_default("scheduler.action_backoff_seconds", 10)?
            .set_default("scheduler.shutdown_grace_seconds", 30)?
            .set_default("scheduler.cron_sync_interval_seconds", 60)?
            .set_default("scheduler.cron_catch_up", false)?
            .set_default("scheduler.job_retention_days", 30)?
            .set_default(
                "scheduler.queues",
                vec![
                    {
                        let mut q: config::Map<String, config::Value> = config::Map::new();
                        q.insert("payload_type".to_string(), "flow_execution".into());
                        q.insert("weight".to_string(), 8.into());
                        q
                    },
                    {
                        let mut q: config::Map<String, config::Value> = config::Map::new();
                        q.insert("payload_type".to_string(), "notification".into());
                        q.insert("weight".to_string(), 2.into());
                        q
                    },
                ],
            )?
            .set_default("logger.directory", "./data/logs")?
            .set_default("logger.max_size_mb", 16)?
            .set_default("logger.retention_hours", 336)?
            .set_default("logger.scan_interval_seconds", 3600)?
            .set_default("logger.flush_interval_ms", 100)?
            .set_default("database.url", "postgres://localhost/weft")?
            .set_default("database.pool_size", 10)?
            .set_default("database.acquire_timeout_seconds", 30)?
            .set_default("flows.directory", "./flows")?;

        // Nested overrides that do not survive the `_` separator
        if let Ok(url) = std::env::var("WEFT_DATABASE_URL") {
            builder = builder.set_override("database.url", url)?;
        }
        if let Ok(url) = std::env::var("WEFT_KEYSTORE_KEEPER_URL") {
            builder = builder.set_override("keystore.keeper_url", url)?;
        }
        if let Ok(dir) = std::env::var("WEFT_FLOWS_DIRECTORY") {
            builder = builder.set_override("flows.directory", dir)?;
        }
        if let Ok(dir) = std::env::var("WEFT_LOGGER_DIRECTORY") {
            builder = builder.set_override("logger.directory", dir)?;
        }

        if std::path::Path::new("weft.toml").exists() {
            builder = builder.add_source(File::with_name("weft.toml").required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("WEFT")
                .try_parsing(true)
                .separator("_"),
        );

        let config = builder
            .build()
            .map_err(|e| Error::Config(format!("Failed to build config: {}", e)))?;

        let parsed: Config = config
            .try_deserialize()
            .map_err(|e| Error::Config(format!("Failed to deserialize config: {}", e)))?;

        parsed
            .validate()
            .map_err(|e| Error::Config(format!("Config validation failed: {}", e)))?;

        parsed.validate_semantics()?;

        Ok(parsed)
    }

    /// Cross-field checks the derive cannot express
    pub fn validate_semantics(&self) -> Result<()> {
        if self.scheduler.queues.is_empty() {
            return Err(Error::Config(
                "scheduler.queues must list at least one payload type".to_string(),
            ));
        }
        for q in &self.scheduler.queues {
            if q.weight == 0 {
                return Err(Error::Config(format!(
                    "scheduler.queues entry '{}' has zero weight",
                    q.payload_type
                )));
            }
        }
        if self.scheduler.cron_catch_up {
            return Err(Error::Config(
                "scheduler.cron_catch_up is reserved; misfired schedules are never replayed"
                    .to_string(),
            ));
        }
        Ok(())
    }
}
