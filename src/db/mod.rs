//! Database access layer.
//!
//! This module provides:
//! - A connection seam over sqlx (`Connection` / `Connector`)
//! - A bounded connection pool with health checks and a background reaper
//! - Statement execution with deadlines and retry
//! - Positional row mapping into typed records
//! - Transactional sessions and a generic repository on top of them

pub mod connection;
pub mod executor;
pub mod inspect;
pub mod mapper;
pub mod pool;
pub mod repository;
pub mod session;

pub use connection::{Connection, Connector, SqlxConnection, SqlxConnector};
pub use executor::{ExecuteOutcome, QueryExecutor, RetryPolicy, RowStream, RunOutcome};
pub use mapper::{ColumnType, FieldReader, FieldSpec, RowMapper, RowSchema, map_row};
pub use pool::{Pool, PoolStatus, PooledConnection};
pub use repository::{Entity, Key, Repository};
pub use session::{Session, SessionState};
