//! Connection-related data models.
//!
//! This module defines the supported backends and the immutable connection
//! settings snapshot handed to the pool at startup.

use crate::error::{DbError, DbResult};
use serde::{Deserialize, Serialize};
use url::Url;

/// Supported database types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    /// Parse database type from a connection string.
    pub fn from_connection_string(connection_string: &str) -> Option<Self> {
        let lower = connection_string.to_lowercase();
        if lower.starts_with("postgres://") || lower.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if lower.starts_with("sqlite://") || lower.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }

    /// Parse a backend name as given in `DB_BACKEND`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "postgres" | "postgresql" | "pg" => Some(Self::PostgreSQL),
            "sqlite" => Some(Self::SQLite),
            _ => None,
        }
    }

    /// Get the display name for this database type.
    pub fn display_name(&self) -> &'static str {
        match self {
            Self::PostgreSQL => "PostgreSQL",
            Self::SQLite => "SQLite",
        }
    }

    /// Get the default port for this database type.
    pub fn default_port(&self) -> Option<u16> {
        match self {
            Self::PostgreSQL => Some(5432),
            Self::SQLite => None,
        }
    }

    /// Render the `index`-th (1-based) positional placeholder.
    pub fn placeholder(&self, index: usize) -> String {
        match self {
            Self::PostgreSQL => format!("${}", index),
            Self::SQLite => "?".to_string(),
        }
    }
}

impl std::fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.display_name())
    }
}

/// Where and how to connect. Built once at startup and never mutated.
#[derive(Clone)]
pub struct ConnectionSettings {
    pub db_type: DatabaseType,
    /// Contains credentials - never log
    connection_string: String,
}

impl ConnectionSettings {
    /// Use a complete connection URL as-is.
    pub fn from_url(connection_string: impl Into<String>) -> DbResult<Self> {
        let connection_string = connection_string.into();
        let db_type = DatabaseType::from_connection_string(&connection_string).ok_or_else(|| {
            DbError::config_invalid(format!(
                "Unknown database type in connection string: {}",
                mask_password(&connection_string)
            ))
        })?;
        Ok(Self {
            db_type,
            connection_string,
        })
    }

    /// Assemble a server URL from its parts.
    pub fn from_parts(
        db_type: DatabaseType,
        host: &str,
        port: Option<u16>,
        database: &str,
        user: &str,
        secret: Option<&str>,
    ) -> DbResult<Self> {
        if database.is_empty() {
            return Err(DbError::config_invalid("Database name cannot be empty"));
        }

        let connection_string = match db_type {
            DatabaseType::SQLite => format!("sqlite:{}", database),
            DatabaseType::PostgreSQL => {
                if host.is_empty() {
                    return Err(DbError::config_invalid("Database host cannot be empty"));
                }
                let mut url = Url::parse(&format!("postgres://{}", host))
                    .map_err(|e| DbError::config_invalid(format!("Invalid host: {e}")))?;
                let port = port.or(db_type.default_port());
                url.set_port(port)
                    .map_err(|_| DbError::config_invalid("Invalid port"))?;
                url.set_username(user)
                    .map_err(|_| DbError::config_invalid("Invalid user name"))?;
                url.set_password(secret)
                    .map_err(|_| DbError::config_invalid("Invalid password"))?;
                url.set_path(database);
                url.to_string()
            }
        };

        Ok(Self {
            db_type,
            connection_string,
        })
    }

    /// Override the user and password of a server URL. SQLite has no
    /// credentials, so its settings come back unchanged.
    pub fn with_credentials(self, user: Option<&str>, secret: Option<&str>) -> DbResult<Self> {
        if self.db_type == DatabaseType::SQLite || (user.is_none() && secret.is_none()) {
            return Ok(self);
        }
        let mut url = Url::parse(&self.connection_string).map_err(|e| {
            DbError::config_invalid(format!(
                "Invalid connection URL {}: {e}",
                mask_password(&self.connection_string)
            ))
        })?;
        if let Some(user) = user {
            url.set_username(user)
                .map_err(|_| DbError::config_invalid("Invalid user name"))?;
        }
        if let Some(secret) = secret {
            url.set_password(Some(secret))
                .map_err(|_| DbError::config_invalid("Invalid password"))?;
        }
        Ok(Self {
            db_type: self.db_type,
            connection_string: url.to_string(),
        })
    }

    /// The full connection string, including credentials.
    pub fn connection_string(&self) -> &str {
        &self.connection_string
    }

    /// Get a display-safe version of the connection string (credentials masked).
    pub fn masked_connection_string(&self) -> String {
        mask_password(&self.connection_string)
    }
}

impl std::fmt::Debug for ConnectionSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSettings")
            .field("db_type", &self.db_type)
            .field("connection_string", &self.masked_connection_string())
            .finish()
    }
}

fn mask_password(connection_string: &str) -> String {
    // Simple masking: replace password in URL
    if let Some(at_pos) = connection_string.find('@') {
        if let Some(colon_pos) = connection_string[..at_pos].rfind(':') {
            if connection_string[..colon_pos].ends_with('/') {
                return connection_string.to_string();
            }
            let prefix = &connection_string[..colon_pos + 1];
            let suffix = &connection_string[at_pos..];
            return format!("{}****{}", prefix, suffix);
        }
    }
    connection_string.to_string()
}
