//! `main:`-rooted YAML configuration, per the upstream `openprocurement.edge`
//! config shape. Durations are written as humantime strings (`30s`, `5m`) in
//! the file and parsed via `humantime_serde`.

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MainConfig {
    pub resources_api_server: String,
    pub resources_api_version: String,
    pub resource: String,
    pub couch_url: String,
    pub public_db: String,
    pub logs_db: String,
    pub workers_min: usize,
    pub workers_max: usize,
    pub retry_workers_min: usize,
    pub retry_workers_max: usize,
    pub filter_workers_count: usize,
    #[serde(with = "humantime_serde")]
    pub watch_interval: Duration,
    pub resource_items_limit: u32,
    pub resource_items_queue_size: i64,
    pub retry_resource_items_queue_size: i64,
    pub workers_inc_threshold: f64,
    pub workers_dec_threshold: f64,
    #[serde(with = "humantime_serde")]
    pub queues_controller_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub client_inc_step_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub client_dec_step_timeout: Duration,
    pub drop_threshold_client_cookies: u32,
    #[serde(with = "humantime_serde")]
    pub worker_sleep: Duration,
    #[serde(with = "humantime_serde")]
    pub retry_default_timeout: Duration,
    pub retries_count: u32,
    #[serde(with = "humantime_serde")]
    pub queue_timeout: Duration,
    pub user_agent: String,
    #[serde(default = "default_shutdown_grace_period", with = "humantime_serde")]
    pub shutdown_grace_period: Duration,
    #[serde(default)]
    pub retrievers_params: Option<serde_yaml::Value>,
}

fn default_shutdown_grace_period() -> Duration {
    Duration::from_secs(10)
}

impl MainConfig {
    /// Loads, validates and applies the `DB_NAME` environment override.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let root: serde_yaml::Value = serde_yaml::from_str(&text)?;
        let main_value = root
            .as_mapping()
            .and_then(|m| m.get("main"))
            .cloned()
            .ok_or(ConfigError::MissingMainSection)?;
        let mut cfg: MainConfig = serde_yaml::from_value(main_value)?;
        cfg.validate()?;
        if let Ok(db) = std::env::var("DB_NAME") {
            cfg.public_db = db;
        }
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidApiServer(self.resources_api_server.clone());
        let url = reqwest::Url::parse(&self.resources_api_server).map_err(|_| invalid())?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(invalid());
        }
        Ok(())
    }

    /// `-1`/any non-positive value means the queue is unbounded.
    pub fn primary_queue_bound(&self) -> Option<usize> {
        (self.resource_items_queue_size > 0).then_some(self.resource_items_queue_size as usize)
    }

    pub fn retry_queue_bound(&self) -> Option<usize> {
        (self.retry_resource_items_queue_size > 0).then_some(self.retry_resource_items_queue_size as usize)
    }
}
