//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! unparseable. Sensitive values wrapped in secrecy::SecretString to prevent
//! log leaks.

pub mod secrets;

use std::str::FromStr;
use std::time::Duration;

use crate::db::StoreOptions;
use crate::error::{Error, Result};
use secrecy::SecretString;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    /// Retry ceiling passed to every claim.
    pub max_retries: u32,
    pub batch_timeout: Duration,
    pub retry_timeout: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        let defaults = StoreOptions::default();
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            db_max_connections: parsed_var("DB_MAX_CONNECTIONS", defaults.max_connections)?,
            db_min_connections: parsed_var("DB_MIN_CONNECTIONS", defaults.min_connections)?,
            max_retries: parsed_var("MAX_RETRIES", 3)?,
            batch_timeout: Duration::from_secs(parsed_var(
                "BATCH_TIMEOUT_SECS",
                defaults.batch_timeout.as_secs(),
            )?),
            retry_timeout: Duration::from_secs(parsed_var(
                "RETRY_TIMEOUT_SECS",
                defaults.retry_timeout.as_secs(),
            )?),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            max_connections: self.db_max_connections,
            min_connections: self.db_min_connections,
            batch_timeout: self.batch_timeout,
            retry_timeout: self.retry_timeout,
        }
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid value for {name} ({raw:?}): {e}"))),
        Err(_) => Ok(default),
    }
}
