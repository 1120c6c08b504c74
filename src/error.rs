//! Error types for the session layer.
//!
//! Every failure that crosses the core boundary is a [`DbError`]. Driver
//! errors are classified once, in `From<sqlx::Error>`, so the pool, executor
//! and session only ever reason about the taxonomy below.

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Classification of a failed statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryErrorKind {
    /// Malformed SQL or a reference to a missing object.
    SyntaxInvalid,
    /// Unique, foreign key, not-null or check constraint failure.
    ConstraintViolation,
    /// The caller's deadline expired before the statement finished.
    Timeout,
    /// The physical connection is gone or in an unknown state.
    ConnectionLost,
    /// Serialization failure, deadlock or busy database; safe to retry.
    SerializationConflict,
    /// Anything the driver reports that fits none of the above.
    Other,
}

impl fmt::Display for QueryErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::SyntaxInvalid => "syntax invalid",
            Self::ConstraintViolation => "constraint violation",
            Self::Timeout => "timeout",
            Self::ConnectionLost => "connection lost",
            Self::SerializationConflict => "serialization conflict",
            Self::Other => "other",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Pool exhausted: no connection became available within {waited_ms}ms (max size {max_size})")]
    PoolExhausted { waited_ms: u64, max_size: u32 },

    #[error("Connection pool is closed")]
    PoolClosed,

    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    #[error("Connection failed: {message}")]
    Connection { message: String, suggestion: String },

    #[error("Query error ({kind}): {message}")]
    Query {
        kind: QueryErrorKind,
        message: String,
        /// e.g., "23505" for a unique violation
        sql_state: Option<String>,
    },

    #[error("Mapping error at column {column}: {reason}")]
    Mapping { column: String, reason: String },

    #[error(
        "Parameter mismatch: statement has {expected} placeholder(s) but {supplied} parameter(s) were supplied"
    )]
    ParameterMismatch { expected: usize, supplied: usize },

    #[error("Transaction error: {message} (transaction: {transaction_id})")]
    Transaction {
        message: String,
        transaction_id: String,
    },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DbError {
    /// Create a pool exhausted error.
    pub fn pool_exhausted(waited: Duration, max_size: u32) -> Self {
        Self::PoolExhausted {
            waited_ms: waited.as_millis() as u64,
            max_size,
        }
    }

    /// Create a configuration error.
    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    /// Create a connection error with a helpful suggestion.
    pub fn connection(message: impl Into<String>, suggestion: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            suggestion: suggestion.into(),
        }
    }

    /// Create a classified query error.
    pub fn query(
        kind: QueryErrorKind,
        message: impl Into<String>,
        sql_state: Option<String>,
    ) -> Self {
        Self::Query {
            kind,
            message: message.into(),
            sql_state,
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl AsRef<str>, limit: Duration) -> Self {
        Self::query(
            QueryErrorKind::Timeout,
            format!(
                "{} exceeded {}ms",
                operation.as_ref(),
                limit.as_millis()
            ),
            None,
        )
    }

    /// Create a connection lost error.
    pub fn connection_lost(message: impl Into<String>) -> Self {
        Self::query(QueryErrorKind::ConnectionLost, message, None)
    }

    /// Create a mapping error.
    pub fn mapping(column: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Mapping {
            column: column.into(),
            reason: reason.into(),
        }
    }

    /// Create a parameter mismatch error.
    pub fn parameter_mismatch(expected: usize, supplied: usize) -> Self {
        Self::ParameterMismatch { expected, supplied }
    }

    /// Create a transaction error.
    pub fn transaction(message: impl Into<String>, transaction_id: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
            transaction_id: transaction_id.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// The query error kind, if this is a query error.
    pub fn kind(&self) -> Option<QueryErrorKind> {
        match self {
            Self::Query { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// SQLSTATE (or SQLite extended code) reported by the driver.
    pub fn sql_state(&self) -> Option<&str> {
        match self {
            Self::Query { sql_state, .. } => sql_state.as_deref(),
            _ => None,
        }
    }

    /// Check if this error is transient, i.e. the whole user action may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. } | Self::Connection { .. } => true,
            Self::Query { kind, .. } => matches!(
                kind,
                QueryErrorKind::ConnectionLost
                    | QueryErrorKind::Timeout
                    | QueryErrorKind::SerializationConflict
            ),
            _ => false,
        }
    }

    /// Check if the connection that produced this error must not be reused.
    pub fn invalidates_connection(&self) -> bool {
        matches!(
            self.kind(),
            Some(QueryErrorKind::ConnectionLost | QueryErrorKind::Timeout)
        )
    }

    /// True for duplicate-key failures (Postgres `23505`, SQLite
    /// `SQLITE_CONSTRAINT_UNIQUE` / `SQLITE_CONSTRAINT_PRIMARYKEY`).
    pub fn is_unique_violation(&self) -> bool {
        match self {
            Self::Query {
                kind: QueryErrorKind::ConstraintViolation,
                sql_state: Some(code),
                ..
            } => matches!(code.as_str(), "23505" | "2067" | "1555"),
            _ => false,
        }
    }

    /// Short hint the presentation layer can show next to the error.
    pub fn suggestion(&self) -> Option<&str> {
        match self {
            Self::Connection { suggestion, .. } => Some(suggestion),
            Self::PoolExhausted { .. } => Some("The database is busy; try the action again"),
            Self::PoolClosed => Some("The application is shutting down"),
            Self::ConfigInvalid { .. } => Some("Check the DB_* environment variables or .env file"),
            Self::Query { kind, .. } => match kind {
                QueryErrorKind::ConstraintViolation => {
                    Some("A record with the same key already exists or a reference is missing")
                }
                QueryErrorKind::Timeout | QueryErrorKind::ConnectionLost => {
                    Some("Check network connectivity and try the action again")
                }
                QueryErrorKind::SerializationConflict => {
                    Some("Another user changed the same data; try the action again")
                }
                QueryErrorKind::SyntaxInvalid | QueryErrorKind::Other => None,
            },
            _ => None,
        }
    }
}

/// Classify a Postgres SQLSTATE code.
pub(crate) fn classify_sql_state(code: &str) -> QueryErrorKind {
    match code {
        "40001" | "40P01" => QueryErrorKind::SerializationConflict,
        "57014" => QueryErrorKind::Timeout,
        c if c.starts_with("23") => QueryErrorKind::ConstraintViolation,
        c if c.starts_with("42") => QueryErrorKind::SyntaxInvalid,
        c if c.starts_with("08") || c.starts_with("57P0") => QueryErrorKind::ConnectionLost,
        _ => QueryErrorKind::Other,
    }
}

/// Classify a SQLite (extended) result code.
fn classify_sqlite_code(code: &str) -> QueryErrorKind {
    let Ok(code) = code.parse::<u32>() else {
        return QueryErrorKind::Other;
    };
    // The primary result code lives in the low byte.
    match code & 0xff {
        1 => QueryErrorKind::SyntaxInvalid,
        5 | 6 => QueryErrorKind::SerializationConflict,
        10 | 11 | 26 => QueryErrorKind::ConnectionLost,
        19 => QueryErrorKind::ConstraintViolation,
        _ => QueryErrorKind::Other,
    }
}

fn classify_database_error(db_err: &dyn sqlx::error::DatabaseError) -> QueryErrorKind {
    use sqlx::error::ErrorKind;

    match db_err.kind() {
        ErrorKind::UniqueViolation
        | ErrorKind::ForeignKeyViolation
        | ErrorKind::NotNullViolation
        | ErrorKind::CheckViolation => return QueryErrorKind::ConstraintViolation,
        _ => {}
    }

    let Some(code) = db_err.code() else {
        return QueryErrorKind::Other;
    };
    if db_err
        .try_downcast_ref::<sqlx::sqlite::SqliteError>()
        .is_some()
    {
        classify_sqlite_code(&code)
    } else {
        classify_sql_state(&code)
    }
}

/// Convert sqlx errors to DbError.
impl From<sqlx::Error> for DbError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Configuration(msg) => DbError::config_invalid(msg.to_string()),
            sqlx::Error::Database(db_err) => {
                let kind = classify_database_error(db_err.as_ref());
                let code = db_err.code().map(|c| c.to_string());
                DbError::query(kind, db_err.message(), code)
            }
            sqlx::Error::RowNotFound => {
                DbError::query(QueryErrorKind::Other, "No rows returned", None)
            }
            sqlx::Error::PoolTimedOut => DbError::timeout("driver pool acquire", Duration::ZERO),
            sqlx::Error::PoolClosed => DbError::PoolClosed,
            sqlx::Error::Io(io_err) => DbError::connection_lost(format!("I/O error: {}", io_err)),
            sqlx::Error::Tls(tls_err) => {
                DbError::connection_lost(format!("TLS error: {}", tls_err))
            }
            sqlx::Error::Protocol(msg) => {
                DbError::connection_lost(format!("Protocol error: {}", msg))
            }
            sqlx::Error::WorkerCrashed => DbError::connection_lost("Database worker crashed"),
            sqlx::Error::TypeNotFound { type_name } => {
                DbError::mapping(type_name.clone(), format!("Type not found: {}", type_name))
            }
            sqlx::Error::ColumnNotFound(col) => DbError::mapping(col, "Column not found"),
            sqlx::Error::ColumnIndexOutOfBounds { index, len } => DbError::mapping(
                format!("#{}", index),
                format!("Column index out of bounds (len: {})", len),
            ),
            sqlx::Error::ColumnDecode { index, source } => {
                DbError::mapping(index, format!("Failed to decode: {}", source))
            }
            sqlx::Error::Decode(source) => {
                DbError::mapping("?", format!("Decode error: {}", source))
            }
            _ => DbError::internal(format!("Unknown database error: {}", err)),
        }
    }
}

/// Result type alias for database operations.
pub type DbResult<T> = Result<T, DbError>;
