//! formstore
//!
//! Data-access and session layer for form-based desktop applications backed
//! by PostgreSQL or SQLite: pooled connections, statement execution with
//! deadlines and retry, typed row mapping and unit-of-work sessions.

pub mod config;
pub mod db;
pub mod error;
pub mod models;

pub use config::{Config, PoolConfig};
pub use db::{Pool, QueryExecutor, Repository, Session};
pub use error::{DbError, DbResult};
