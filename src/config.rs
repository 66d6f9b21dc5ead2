use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

use crate::error::SchedulerError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub tracing: TracingConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TracingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
    /// Apply pending migrations when a node starts (default: true)
    #[serde(default = "default_run_migrations")]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Identity of this node in the farm. Instance-scoped executions are
    /// tagged with it and worker identities are derived from it.
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            scanner: ScannerConfig::default(),
            lease: LeaseConfig::default(),
            retry: RetryConfig::default(),
            archive: ArchiveConfig::default(),
            workers: WorkersConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Rejects settings that would break the lease protocol.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.node_id.trim().is_empty() {
            return Err(SchedulerError::Config("scheduler.node_id must not be empty".into()));
        }
        if self.node_id.contains('/') {
            return Err(SchedulerError::Config(
                "scheduler.node_id must not contain '/'".into(),
            ));
        }
        self.lease.validate()?;
        self.retry.validate()?;

        for (pool_name, pool) in &self.workers.pools {
            if pool.count == 0 || pool.batch_size == 0 {
                return Err(SchedulerError::Config(format!(
                    "worker pool '{pool_name}' needs a non-zero count and batch_size"
                )));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    /// Time between scans for due definitions in milliseconds (default: 2000)
    #[serde(default = "default_scan_interval_ms")]
    pub interval_ms: u64,
    /// Maximum number of due definitions handled per scan (default: 100)
    #[serde(default = "default_scan_batch_size")]
    pub batch_size: u64,
    /// How long an instance-scoped tick stays open for other nodes to enqueue
    /// their own execution before the schedule advances (default: 10)
    #[serde(default = "default_instance_fanout_seconds")]
    pub instance_fanout_seconds: u64,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_scan_interval_ms(),
            batch_size: default_scan_batch_size(),
            instance_fanout_seconds: default_instance_fanout_seconds(),
        }
    }
}

impl ScannerConfig {
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaseConfig {
    /// Lease granted on claim and on every heartbeat in seconds (default: 30)
    #[serde(default = "default_lease_seconds")]
    pub lease_seconds: u64,
    /// Time between heartbeats in seconds (default: 10)
    #[serde(default = "default_heartbeat_seconds")]
    pub heartbeat_seconds: u64,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_seconds: default_lease_seconds(),
            heartbeat_seconds: default_heartbeat_seconds(),
        }
    }
}

impl LeaseConfig {
    /// Minimum ratio between lease duration and heartbeat interval.
    pub const SAFETY_FACTOR: u64 = 3;

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.heartbeat_seconds == 0 {
            return Err(SchedulerError::Config(
                "scheduler.lease.heartbeat_seconds must be positive".into(),
            ));
        }
        if self.lease_seconds < self.heartbeat_seconds * Self::SAFETY_FACTOR {
            return Err(SchedulerError::Config(format!(
                "scheduler.lease.lease_seconds ({}) must be at least {}x heartbeat_seconds ({})",
                self.lease_seconds,
                Self::SAFETY_FACTOR,
                self.heartbeat_seconds
            )));
        }
        Ok(())
    }

    pub fn lease_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.lease_seconds).unwrap_or(i64::MAX / 1000))
    }

    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Base delay in seconds before the first retry (default: 60)
    #[serde(default = "default_base_retry_delay")]
    pub base_delay_seconds: u64,
    /// Exponential backoff multiplier (default: 5.0)
    #[serde(default = "default_retry_multiplier")]
    pub multiplier: f64,
    /// Upper bound for a single backoff delay in seconds (default: 21600 = 6 hours)
    #[serde(default = "default_max_retry_delay")]
    pub max_delay_seconds: u64,
    /// Random extra delay as a fraction of the computed delay (default: 0.2)
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_seconds: default_base_retry_delay(),
            multiplier: default_retry_multiplier(),
            max_delay_seconds: default_max_retry_delay(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(SchedulerError::Config(
                "scheduler.retry.multiplier must be a finite number >= 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(SchedulerError::Config(
                "scheduler.retry.jitter_ratio must be within 0.0..=1.0".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Interval between archival runs in seconds (default: 86400 = 1 day)
    #[serde(default = "default_archive_interval")]
    pub interval_seconds: u64,
    /// Age after completion before a terminal execution is archived (default: 604800 = 7 days)
    #[serde(default = "default_archive_retention")]
    pub retention_seconds: u64,
    /// Minimum time since lease expiry before a row may be archived (default: 3600)
    #[serde(default = "default_archive_lease_margin")]
    pub lease_margin_seconds: u64,
    /// Maximum number of executions moved in a single transaction (default: 1000)
    #[serde(default = "default_archive_batch_size")]
    pub batch_size: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_archive_interval(),
            retention_seconds: default_archive_retention(),
            lease_margin_seconds: default_archive_lease_margin(),
            batch_size: default_archive_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(flatten)]
    pub pools: HashMap<String, WorkerPoolConfig>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            pools: HashMap::from([("default".to_string(), WorkerPoolConfig::default())]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Job types served by this pool; empty serves every type
    #[serde(default)]
    pub jobs: Vec<String>,
    /// Number of concurrent workers in the pool (default: 4)
    #[serde(default = "default_worker_count")]
    pub count: u32,
    /// Executions claimed per claim round (default: 1)
    #[serde(default = "default_claim_batch_size")]
    pub batch_size: u64,
    /// Sleep between claim rounds when nothing was claimable in milliseconds (default: 1000)
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            jobs: Vec::new(),
            count: default_worker_count(),
            batch_size: default_claim_batch_size(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

const fn default_pool_size() -> u32 {
    10
}

const fn default_run_migrations() -> bool {
    true
}

fn default_node_id() -> String {
    format!("node-{}", uuid::Uuid::new_v4().simple())
}

const fn default_scan_interval_ms() -> u64 {
    2000
}

const fn default_scan_batch_size() -> u64 {
    100
}

const fn default_instance_fanout_seconds() -> u64 {
    10
}

const fn default_lease_seconds() -> u64 {
    30
}

const fn default_heartbeat_seconds() -> u64 {
    10
}

const fn default_base_retry_delay() -> u64 {
    60
}

const fn default_retry_multiplier() -> f64 {
    5.0
}

const fn default_max_retry_delay() -> u64 {
    21_600 // 6 hours
}

const fn default_jitter_ratio() -> f64 {
    0.2
}

const fn default_archive_interval() -> u64 {
    86_400 // 1 day
}

const fn default_archive_retention() -> u64 {
    604_800 // 7 days
}

const fn default_archive_lease_margin() -> u64 {
    3600 // 1 hour
}

const fn default_archive_batch_size() -> u64 {
    1000
}

const fn default_worker_count() -> u32 {
    4
}

const fn default_claim_batch_size() -> u64 {
    1
}

const fn default_poll_interval_ms() -> u64 {
    1000
}
