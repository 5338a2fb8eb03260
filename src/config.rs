//! Configuration loader for the `codemetal-stationalert` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). By consolidating configuration logic here, we
//! avoid scattering `env::var` calls throughout the codebase.
//!
use std::env;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::pipeline::IngestLimits;

/// Parse an optional numeric variable with a default value.
macro_rules! parse_var {
    ($lookup:expr, $var_name:expr, $ty:ty, $default:expr) => {
        $lookup($var_name)
            .map(|v| v.parse::<$ty>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string variable.
macro_rules! require_var {
    ($lookup:expr, $var_name:expr) => {
        $lookup($var_name)
            .ok_or_else(|| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// HTTP listen port.
    pub listen_port: u16,

    /// Upstream station API; the poller is disabled when unset.
    pub station_api_url: Option<String>,

    /// Maximum number of API pages to fetch per poll (safety limit).
    pub api_max_pages: u32,

    /// Seconds between two upstream polls.
    pub poll_interval_secs: u64,

    pub calibration_timeout_ms: u64,
    pub storage_timeout_ms: u64,

    /// Parameters ingested in parallel within one batch.
    pub ingest_max_parallel: usize,
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `LISTEN_PORT` – HTTP port (default: 8080)
/// - `STATION_API_URL` – upstream station API base URL (default: unset)
/// - `API_MAX_PAGES` – max API pages per poll (default: 100)
/// - `POLL_INTERVAL_SECS` – seconds between polls (default: 60)
/// - `CALIBRATION_TIMEOUT_MS` – per-reading calibration bound (default: 2000)
/// - `STORAGE_TIMEOUT_MS` – per storage call bound (default: 5000)
/// - `INGEST_MAX_PARALLEL` – parallel parameter groups (default: 8)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    load_with(|name| env::var(name).ok())
}

/// Same as [`load_from_env`] with an explicit variable source.
pub fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Config> {
    // ---
    let db_url = require_var!(lookup, "DATABASE_URL");
    let db_pool_max = parse_var!(lookup, "DB_POOL_MAX", u32, 5);
    let listen_port = parse_var!(lookup, "LISTEN_PORT", u16, 8080);
    let station_api_url = lookup("STATION_API_URL").filter(|url| !url.trim().is_empty());
    let api_max_pages = parse_var!(lookup, "API_MAX_PAGES", u32, 100);
    let poll_interval_secs = parse_var!(lookup, "POLL_INTERVAL_SECS", u64, 60);
    let calibration_timeout_ms = parse_var!(lookup, "CALIBRATION_TIMEOUT_MS", u64, 2000);
    let storage_timeout_ms = parse_var!(lookup, "STORAGE_TIMEOUT_MS", u64, 5000);
    let ingest_max_parallel = parse_var!(lookup, "INGEST_MAX_PARALLEL", usize, 8);

    if ingest_max_parallel == 0 {
        return Err(anyhow!("Invalid INGEST_MAX_PARALLEL: must be at least 1"));
    }
    if poll_interval_secs == 0 {
        return Err(anyhow!("Invalid POLL_INTERVAL_SECS: must be at least 1"));
    }

    Ok(Config {
        db_url,
        db_pool_max,
        listen_port,
        station_api_url,
        api_max_pages,
        poll_interval_secs,
        calibration_timeout_ms,
        storage_timeout_ms,
        ingest_max_parallel,
    })
}

impl Config {
    // ---
    pub fn ingest_limits(&self) -> IngestLimits {
        // ---
        IngestLimits {
            calibration_timeout: Duration::from_millis(self.calibration_timeout_ms),
            storage_timeout: Duration::from_millis(self.storage_timeout_ms),
            max_parallel_parameters: self.ingest_max_parallel,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Database URL with the password replaced by `****`.
    pub fn masked_db_url(&self) -> String {
        // ---
        if let Some(at_pos) = self.db_url.rfind('@') {
            if let Some(colon_pos) = self.db_url[..at_pos].rfind(':') {
                return format!(
                    "{}:****{}",
                    &self.db_url[..colon_pos],
                    &self.db_url[at_pos..]
                );
            }
        }
        self.db_url.clone()
    }

    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL           : {}", self.masked_db_url());
        tracing::info!("  DB_POOL_MAX            : {}", self.db_pool_max);
        tracing::info!("  LISTEN_PORT            : {}", self.listen_port);
        tracing::info!(
            "  STATION_API_URL        : {}",
            self.station_api_url.as_deref().unwrap_or("(poller disabled)")
        );
        tracing::info!("  API_MAX_PAGES          : {}", self.api_max_pages);
        tracing::info!("  POLL_INTERVAL_SECS     : {}", self.poll_interval_secs);
        tracing::info!("  CALIBRATION_TIMEOUT_MS : {}", self.calibration_timeout_ms);
        tracing::info!("  STORAGE_TIMEOUT_MS     : {}", self.storage_timeout_ms);
        tracing::info!("  INGEST_MAX_PARALLEL    : {}", self.ingest_max_parallel);
    }
}
