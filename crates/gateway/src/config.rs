#![forbid(unsafe_code)]

use quarry_orchestrator::{OrchestratorError, env_var};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_BASE_PATH: &str = "/cubejs-api";
pub const DEFAULT_LISTEN: &str = "127.0.0.1:4000";
pub const DEFAULT_SUBSCRIPTION_HEART_BEAT_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SUBSCRIPTION_TICK: Duration = Duration::from_secs(5);
/// Only used outside production when `QUARRY_API_SECRET` is unset.
pub const DEV_API_SECRET: &str = "quarry-dev-secret";

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub base_path: String,
    pub api_secret: Option<String>,
    /// `production` enforces authentication.
    pub environment: String,
    pub listen: SocketAddr,
    pub storage_dir: PathBuf,
    pub warehouse: Option<PathBuf>,
    pub schema_path: Option<PathBuf>,
    pub queue: String,
    pub subscription_heart_beat_interval: Duration,
    pub subscription_tick: Duration,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_path: DEFAULT_BASE_PATH.to_string(),
            api_secret: None,
            environment: "development".to_string(),
            listen: SocketAddr::from(([127, 0, 0, 1], 4000)),
            storage_dir: PathBuf::from(".quarry"),
            warehouse: None,
            schema_path: None,
            queue: "default".to_string(),
            subscription_heart_beat_interval: DEFAULT_SUBSCRIPTION_HEART_BEAT_INTERVAL,
            subscription_tick: DEFAULT_SUBSCRIPTION_TICK,
        }
    }
}

impl GatewayConfig {
    /// Defaults overridden by `QUARRY_*` environment variables.
    pub fn from_env() -> Result<Self, OrchestratorError> {
        let mut config = Self::default();
        if let Some(v) = env_var("QUARRY_BASE_PATH") {
            config.base_path = v;
        }
        config.api_secret = env_var("QUARRY_API_SECRET");
        if let Some(v) = env_var("QUARRY_ENV") {
            config.environment = v;
        }
        if let Some(v) = env_var("QUARRY_LISTEN") {
            config.listen = v
                .parse()
                .map_err(|_| OrchestratorError::Config("QUARRY_LISTEN must be HOST:PORT"))?;
        }
        if let Some(v) = env_var("QUARRY_STORAGE_DIR") {
            config.storage_dir = PathBuf::from(v);
        }
        config.warehouse = env_var("QUARRY_WAREHOUSE").map(PathBuf::from);
        config.schema_path = env_var("QUARRY_SCHEMA").map(PathBuf::from);
        if let Some(v) = env_var("QUARRY_QUEUE") {
            config.queue = v;
        }
        if let Some(v) = env_var("QUARRY_SUBSCRIPTION_HEARTBEAT_S").and_then(|v| v.parse().ok()) {
            config.subscription_heart_beat_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_var("QUARRY_SUBSCRIPTION_TICK_MS").and_then(|v| v.parse().ok()) {
            config.subscription_tick = Duration::from_millis(v);
        }
        Ok(config)
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn validate(&self) -> Result<(), OrchestratorError> {
        if !self.base_path.starts_with('/') {
            return Err(OrchestratorError::Config("base path must start with '/'"));
        }
        if self.is_production() && self.api_secret.is_none() {
            return Err(OrchestratorError::Config(
                "QUARRY_API_SECRET is required in production",
            ));
        }
        if self.subscription_tick.is_zero() {
            return Err(OrchestratorError::Config("subscription tick must be positive"));
        }
        Ok(())
    }

    pub fn secret(&self) -> &str {
        self.api_secret.as_deref().unwrap_or(DEV_API_SECRET)
    }
}
