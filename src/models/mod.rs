//! Data models for the session layer.
//!
//! This module re-exports all model types used throughout the crate.

pub mod connection;
pub mod paging;
pub mod query;

// Re-export commonly used types
pub use connection::{ConnectionSettings, DatabaseType};
pub use paging::{DEFAULT_PAGE_SIZE, Filter, Page, Pageable};
pub use query::{
    ColumnMetadata, DEFAULT_QUERY_TIMEOUT_MS, ResultRow, SqlValue, Statement, StatementKind,
};
