//! Configuration handling.
//!
//! Connection settings and pool limits come from CLI arguments or `DB_*`
//! environment variables (optionally preloaded from a `.env` file by the
//! binary). Everything is resolved once at startup into immutable
//! [`ConnectionSettings`] and [`PoolConfig`] snapshots.

use crate::error::{DbError, DbResult};
use crate::models::{ConnectionSettings, DEFAULT_QUERY_TIMEOUT_MS, DatabaseType};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// Pool configuration defaults
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;
pub const DEFAULT_MAX_CONNECTIONS_SQLITE: u32 = 1;
pub const DEFAULT_MIN_CONNECTIONS: u32 = 1;
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_MAX_LIFETIME_SECS: u64 = 1800;
pub const DEFAULT_REAP_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 5;

/// Connection pool limits. Immutable once the pool is built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connections kept open even when idle
    pub min_size: u32,
    /// Hard upper bound on live connections
    pub max_size: u32,
    /// How long `acquire` waits for a free connection
    pub acquire_timeout: Duration,
    /// Idle connections older than this are closed by the reaper
    pub idle_timeout: Duration,
    /// Connections older than this are closed instead of reused
    pub max_lifetime: Duration,
    /// Ping idle connections before handing them out
    pub test_before_acquire: bool,
    pub reap_interval: Duration,
    /// Default wait for outstanding leases during shutdown
    pub shutdown_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: DEFAULT_MIN_CONNECTIONS,
            max_size: DEFAULT_MAX_CONNECTIONS,
            acquire_timeout: Duration::from_millis(DEFAULT_ACQUIRE_TIMEOUT_MS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECS),
            max_lifetime: Duration::from_secs(DEFAULT_MAX_LIFETIME_SECS),
            test_before_acquire: true,
            reap_interval: Duration::from_secs(DEFAULT_REAP_INTERVAL_SECS),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
        }
    }
}

impl PoolConfig {
    /// Validate pool limits.
    pub fn validate(&self) -> DbResult<()> {
        if self.max_size == 0 {
            return Err(DbError::config_invalid(
                "max_size must be greater than 0",
            ));
        }
        if self.min_size > self.max_size {
            return Err(DbError::config_invalid(format!(
                "min_size ({}) cannot exceed max_size ({})",
                self.min_size, self.max_size
            )));
        }
        for (name, value) in [
            ("acquire_timeout", self.acquire_timeout),
            ("idle_timeout", self.idle_timeout),
            ("max_lifetime", self.max_lifetime),
            ("reap_interval", self.reap_interval),
        ] {
            if value.is_zero() {
                return Err(DbError::config_invalid(format!(
                    "{} must be greater than 0",
                    name
                )));
            }
        }
        Ok(())
    }
}

/// Startup configuration.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "formstore-check",
    about = "Verify database connectivity and pool settings for formstore",
    version,
    author
)]
pub struct Config {
    /// Full connection URL; takes precedence over the individual fields
    #[arg(long = "db-url", env = "DB_URL", hide_env_values = true)]
    pub database_url: Option<String>,

    /// Backend when no URL is given (postgres or sqlite)
    #[arg(long = "db-backend", env = "DB_BACKEND")]
    pub backend: Option<String>,

    #[arg(long = "db-host", env = "DB_HOST")]
    pub host: Option<String>,

    #[arg(long = "db-port", env = "DB_PORT")]
    pub port: Option<u16>,

    /// Database name, or file path for SQLite
    #[arg(long = "db-name", env = "DB_NAME")]
    pub database: Option<String>,

    #[arg(long = "db-user", env = "DB_USER")]
    pub user: Option<String>,

    #[arg(long = "db-password", env = "DB_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,

    #[arg(long, default_value_t = DEFAULT_MIN_CONNECTIONS, env = "DB_POOL_MIN")]
    pub pool_min: u32,

    /// Default: 10 for PostgreSQL, 1 for SQLite
    #[arg(long, env = "DB_POOL_MAX")]
    pub pool_max: Option<u32>,

    #[arg(long, default_value_t = DEFAULT_ACQUIRE_TIMEOUT_MS, env = "DB_ACQUIRE_TIMEOUT_MS")]
    pub acquire_timeout_ms: u64,

    #[arg(long, default_value_t = DEFAULT_IDLE_TIMEOUT_SECS, env = "DB_IDLE_TIMEOUT_SECS")]
    pub idle_timeout_secs: u64,

    #[arg(long, default_value_t = DEFAULT_MAX_LIFETIME_SECS, env = "DB_MAX_LIFETIME_SECS")]
    pub max_lifetime_secs: u64,

    /// Default per-statement timeout
    #[arg(long, default_value_t = DEFAULT_QUERY_TIMEOUT_MS, env = "DB_QUERY_TIMEOUT_MS")]
    pub query_timeout_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DB_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "DB_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Parse configuration from command line arguments.
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            database_url: None,
            backend: None,
            host: None,
            port: None,
            database: None,
            user: None,
            password: None,
            pool_min: DEFAULT_MIN_CONNECTIONS,
            pool_max: None,
            acquire_timeout_ms: DEFAULT_ACQUIRE_TIMEOUT_MS,
            idle_timeout_secs: DEFAULT_IDLE_TIMEOUT_SECS,
            max_lifetime_secs: DEFAULT_MAX_LIFETIME_SECS,
            query_timeout_ms: DEFAULT_QUERY_TIMEOUT_MS,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Backend selected by the URL, then `DB_BACKEND`, then PostgreSQL.
    pub fn database_type(&self) -> DbResult<DatabaseType> {
        if let Some(url) = self.database_url.as_deref() {
            return DatabaseType::from_connection_string(url).ok_or_else(|| {
                DbError::config_invalid("DB_URL must start with postgres:// or sqlite:")
            });
        }
        match self.backend.as_deref() {
            None => Ok(DatabaseType::PostgreSQL),
            Some(name) => DatabaseType::from_name(name).ok_or_else(|| {
                DbError::config_invalid(format!(
                    "Unknown DB_BACKEND '{}': expected postgres or sqlite",
                    name
                ))
            }),
        }
    }

    /// Resolve where to connect.
    pub fn connection_settings(&self) -> DbResult<ConnectionSettings> {
        if let Some(url) = self.database_url.as_deref() {
            return ConnectionSettings::from_url(url)?.with_credentials(
                non_empty(self.user.as_deref()),
                self.password.as_deref().filter(|p| !p.is_empty()),
            );
        }

        let db_type = self.database_type()?;
        let database = required(self.database.as_deref(), "DB_NAME")?;
        match db_type {
            DatabaseType::SQLite => {
                ConnectionSettings::from_parts(db_type, "", None, database, "", None)
            }
            DatabaseType::PostgreSQL => ConnectionSettings::from_parts(
                db_type,
                required(self.host.as_deref(), "DB_HOST")?,
                self.port,
                database,
                required(self.user.as_deref(), "DB_USER")?,
                self.password.as_deref(),
            ),
        }
    }

    /// Resolve and validate pool limits.
    pub fn pool_config(&self) -> DbResult<PoolConfig> {
        let max_size = match self.pool_max {
            Some(max) => max,
            None if self.database_type()? == DatabaseType::SQLite => {
                DEFAULT_MAX_CONNECTIONS_SQLITE
            }
            None => DEFAULT_MAX_CONNECTIONS,
        };
        let config = PoolConfig {
            min_size: self.pool_min,
            max_size,
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            idle_timeout: Duration::from_secs(self.idle_timeout_secs),
            max_lifetime: Duration::from_secs(self.max_lifetime_secs),
            ..PoolConfig::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Get the default statement timeout as a Duration.
    pub fn query_timeout(&self) -> DbResult<Duration> {
        if self.query_timeout_ms == 0 {
            return Err(DbError::config_invalid(
                "query timeout must be greater than 0",
            ));
        }
        Ok(Duration::from_millis(self.query_timeout_ms))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::default_config()
    }
}

fn required<'a>(value: Option<&'a str>, name: &str) -> DbResult<&'a str> {
    non_empty(value).ok_or_else(|| DbError::config_invalid(format!("{} is required", name)))
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}
