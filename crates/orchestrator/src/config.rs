#![forbid(unsafe_code)]

use crate::OrchestratorError;
use quarry_core::clock::duration_ms;
use quarry_storage::QueueDriverOptions;
use std::time::Duration;

pub const DEFAULT_CONCURRENCY: usize = 2;
pub const DEFAULT_CONTINUE_WAIT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_EXECUTION_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_ORPHANED_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_HEART_BEAT_INTERVAL: Duration = Duration::from_secs(30);
/// Reaper reclaims a stalled key this many times before failing it for good.
pub const DEFAULT_STALL_RETRY_BUDGET: u32 = 3;
pub const DEFAULT_RESULT_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub concurrency: usize,
    pub continue_wait_timeout: Duration,
    pub execution_timeout: Duration,
    pub orphaned_timeout: Duration,
    pub heart_beat_interval: Duration,
    pub heart_beat_timeout: Duration,
    pub stall_retry_budget: u32,
    pub result_ttl: Duration,
    pub poll_interval: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            continue_wait_timeout: DEFAULT_CONTINUE_WAIT_TIMEOUT,
            execution_timeout: DEFAULT_EXECUTION_TIMEOUT,
            orphaned_timeout: DEFAULT_ORPHANED_TIMEOUT,
            heart_beat_interval: DEFAULT_HEART_BEAT_INTERVAL,
            heart_beat_timeout: DEFAULT_HEART_BEAT_INTERVAL * 4,
            stall_retry_budget: DEFAULT_STALL_RETRY_BUDGET,
            result_ttl: DEFAULT_RESULT_TTL,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl QueueConfig {
    /// Defaults overridden by `QUARRY_*` environment variables.
    pub fn from_env() -> Result<Self, OrchestratorError> {
        let mut config = Self::default();
        if let Some(v) = env_parse::<usize>("QUARRY_CONCURRENCY") {
            config.concurrency = v;
        }
        if let Some(v) = env_secs("QUARRY_CONTINUE_WAIT_TIMEOUT_S") {
            config.continue_wait_timeout = v;
        }
        if let Some(v) = env_secs("QUARRY_EXECUTION_TIMEOUT_S") {
            config.execution_timeout = v;
        }
        if let Some(v) = env_secs("QUARRY_ORPHANED_TIMEOUT_S") {
            config.orphaned_timeout = v;
        }
        if let Some(v) = env_secs("QUARRY_HEARTBEAT_INTERVAL_S") {
            config.heart_beat_interval = v;
            config.heart_beat_timeout = v * 4;
        }
        if let Some(v) = env_secs("QUARRY_HEARTBEAT_TIMEOUT_S") {
            config.heart_beat_timeout = v;
        }
        if let Some(v) = env_parse::<u32>("QUARRY_STALL_RETRY_BUDGET") {
            config.stall_retry_budget = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if self.concurrency == 0 {
            return Err(OrchestratorError::Config("concurrency must be at least 1"));
        }
        if self.heart_beat_interval.is_zero() {
            return Err(OrchestratorError::Config("heart beat interval must be positive"));
        }
        if self.heart_beat_interval * 2 >= self.heart_beat_timeout {
            return Err(OrchestratorError::Config(
                "heart beat interval must be less than half of the heart beat timeout",
            ));
        }
        if self.continue_wait_timeout.is_zero() {
            return Err(OrchestratorError::Config("continue wait timeout must be positive"));
        }
        Ok(())
    }

    pub fn driver_options(&self, queue: impl Into<String>) -> QueueDriverOptions {
        QueueDriverOptions {
            queue: queue.into(),
            concurrency: self.concurrency,
            heart_beat_timeout_ms: duration_ms(self.heart_beat_timeout),
            result_ttl_ms: duration_ms(self.result_ttl),
        }
    }
}

pub fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

fn env_secs(name: &str) -> Option<Duration> {
    env_parse::<u64>(name).map(Duration::from_secs)
}
