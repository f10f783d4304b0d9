use serde::Deserialize;

use crate::error::{AppError, AppResult};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    pub provider_base_url: String,
    pub notify_url: String,
    /// Shared secret for provider webhook signatures. Unset means signature
    /// verification is disabled (local development only).
    pub webhook_secret: Option<String>,
    pub provider_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub poll_interval_secs: u64,
    /// Pending events younger than this are not polled yet.
    pub poll_grace_secs: i64,
    pub lock_ttl_minutes: i64,
    pub sweep_concurrency: usize,
}

impl Config {
    pub fn from_env() -> AppResult<Self> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| AppError::Config("DATABASE_URL must be set".into()))?,
            bind_address: std::env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            provider_base_url: std::env::var("PROVIDER_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:9090".to_string()),
            notify_url: std::env::var("NOTIFY_URL")
                .unwrap_or_else(|_| "http://localhost:9091/notifications".to_string()),
            webhook_secret: std::env::var("PROVIDER_WEBHOOK_SECRET").ok(),
            provider_timeout_secs: env_parsed("PROVIDER_TIMEOUT_SECS", 10)?,
            sweep_interval_secs: env_parsed("SWEEP_INTERVAL_SECS", 300)?,
            poll_interval_secs: env_parsed("POLL_INTERVAL_SECS", 60)?,
            poll_grace_secs: env_parsed("POLL_GRACE_SECS", 120)?,
            lock_ttl_minutes: env_parsed("LOCK_TTL_MINUTES", 10)?,
            sweep_concurrency: env_parsed("SWEEP_CONCURRENCY", 8)?,
        })
    }
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> AppResult<T> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| AppError::Config(format!("{name} is not a valid value: {value}"))),
        Err(_) => Ok(default),
    }
}
