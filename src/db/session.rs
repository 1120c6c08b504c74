//! Unit-of-work sessions.
//!
//! A [`Session`] owns one pooled connection between `begin` and
//! `commit`/`rollback`, so every statement it runs sees the writes issued
//! before it. Any failure while the transaction is open closes the physical
//! connection, which discards the transaction on the server.

use crate::db::connection::Connector;
use crate::db::executor::{QueryExecutor, no_rows};
use crate::db::inspect;
use crate::db::mapper::RowMapper;
use crate::db::pool::{Pool, PooledConnection};
use crate::error::{DbError, DbResult};
use crate::models::{DatabaseType, Statement};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Lifecycle of a [`Session`]. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Open,
    Committed,
    RolledBack,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Committed | SessionState::RolledBack | SessionState::Failed
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Open => "open",
            SessionState::Committed => "committed",
            SessionState::RolledBack => "rolled_back",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One transaction on one leased connection.
///
/// Every operation takes `&mut self`, so a session is confined to a single
/// task at a time.
pub struct Session<C: Connector> {
    id: String,
    pool: Pool<C>,
    executor: QueryExecutor,
    handle: Option<PooledConnection<C>>,
    state: SessionState,
    timeout: Option<Duration>,
    started_at: Option<Instant>,
}

impl<C: Connector> Session<C> {
    pub fn new(pool: &Pool<C>, executor: &QueryExecutor) -> Self {
        Self {
            id: format!("tx_{}", uuid::Uuid::new_v4().simple()),
            pool: pool.clone(),
            executor: executor.clone(),
            handle: None,
            state: SessionState::Idle,
            timeout: None,
            started_at: None,
        }
    }

    /// Bound the whole transaction, measured from `begin`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn database_type(&self) -> DatabaseType {
        self.pool.database_type()
    }

    /// Lease a connection and start the transaction.
    ///
    /// If no connection can be leased the session stays `Idle` and `begin`
    /// may be called again.
    pub async fn begin(&mut self) -> DbResult<()> {
        if self.state != SessionState::Idle {
            return Err(self.invalid_state("begin"));
        }

        let mut handle = self.pool.acquire_default().await?;
        let conn_id = handle.id();
        if let Err(e) = self
            .executor
            .write_once(&mut handle, &Statement::new("BEGIN"))
            .await
        {
            warn!(tx_id = %self.id, conn_id = conn_id, error = %e, "BEGIN failed");
            handle.invalidate();
            self.pool.release(handle).await;
            self.state = SessionState::Failed;
            return Err(e);
        }

        self.handle = Some(handle);
        self.started_at = Some(Instant::now());
        self.state = SessionState::Open;
        info!(
            tx_id = %self.id,
            conn_id = conn_id,
            timeout_ms = self.timeout.map(|t| t.as_millis() as u64),
            "Transaction started"
        );
        Ok(())
    }

    /// Run a statement and return the number of affected rows.
    pub async fn execute(&mut self, statement: &Statement) -> DbResult<u64> {
        self.ready("execute", Some(statement)).await?;
        let deadline = self.deadline();
        let result = match self.handle.as_mut() {
            Some(handle) => bounded(deadline, self.executor.write_once(handle, statement)).await,
            None => Err(missing_handle()),
        };
        self.settle(result).await
    }

    pub async fn fetch_all<T>(
        &mut self,
        statement: &Statement,
        mapper: &RowMapper<T>,
    ) -> DbResult<Vec<T>> {
        self.ready("fetch_all", Some(statement)).await?;
        let deadline = self.deadline();
        let result = match self.handle.as_mut() {
            Some(handle) => bounded(deadline, self.executor.collect_once(handle, statement))
                .await
                .and_then(|rows| mapper.map_all(&rows)),
            None => Err(missing_handle()),
        };
        self.settle(result).await
    }

    pub async fn fetch_optional<T>(
        &mut self,
        statement: &Statement,
        mapper: &RowMapper<T>,
    ) -> DbResult<Option<T>> {
        self.ready("fetch_optional", Some(statement)).await?;
        let deadline = self.deadline();
        let result = match self.handle.as_mut() {
            Some(handle) => bounded(deadline, self.executor.first_once(handle, statement))
                .await
                .and_then(|row| row.as_ref().map(|r| mapper.map(r)).transpose()),
            None => Err(missing_handle()),
        };
        self.settle(result).await
    }

    /// Like [`Session::fetch_optional`], but an empty result is an error.
    pub async fn fetch_one<T>(
        &mut self,
        statement: &Statement,
        mapper: &RowMapper<T>,
    ) -> DbResult<T> {
        match self.fetch_optional(statement, mapper).await? {
            Some(record) => Ok(record),
            None => Err(self.fail(no_rows()).await),
        }
    }

    /// Make the transaction's writes durable and return the connection.
    pub async fn commit(&mut self) -> DbResult<()> {
        self.finish("COMMIT", SessionState::Committed).await
    }

    /// Discard the transaction's writes and return the connection.
    pub async fn rollback(&mut self) -> DbResult<()> {
        self.finish("ROLLBACK", SessionState::RolledBack).await
    }

    async fn finish(&mut self, sql: &str, next: SessionState) -> DbResult<()> {
        self.ready(sql, None).await?;
        let deadline = self.deadline();
        let statement = Statement::new(sql);
        let result = match self.handle.as_mut() {
            Some(handle) => bounded(deadline, self.executor.write_once(handle, &statement)).await,
            None => Err(missing_handle()),
        };
        self.settle(result).await?;

        self.state = next;
        if let Some(handle) = self.handle.take() {
            self.pool.release(handle).await;
        }
        info!(tx_id = %self.id, state = %next, "Transaction finished");
        Ok(())
    }

    /// Check that the session can run another statement.
    async fn ready(&mut self, op: &str, statement: Option<&Statement>) -> DbResult<()> {
        if self.state != SessionState::Open {
            return Err(self.invalid_state(op));
        }
        if self.handle.as_ref().is_some_and(|h| !h.is_valid()) {
            let abandoned =
                DbError::connection_lost("an earlier statement was abandoned before it finished");
            return Err(self.fail(abandoned).await);
        }
        if let Some((deadline, limit)) = self.deadline() {
            if Instant::now() >= deadline {
                return Err(self.fail(DbError::timeout("transaction", limit)).await);
            }
        }
        if let Some(statement) = statement {
            if let Err(e) = inspect::check_parameters(statement) {
                return Err(self.fail(e).await);
            }
            debug!(tx_id = %self.id, op = op, sql = %statement.sql, "Session statement");
        }
        Ok(())
    }

    fn deadline(&self) -> Option<(Instant, Duration)> {
        let limit = self.timeout?;
        Some((self.started_at? + limit, limit))
    }

    async fn settle<T>(&mut self, result: DbResult<T>) -> DbResult<T> {
        match result {
            Ok(value) => Ok(value),
            Err(e) => Err(self.fail(e).await),
        }
    }

    /// Move to `Failed` and close the connection. Returns `error` unchanged.
    async fn fail(&mut self, error: DbError) -> DbError {
        self.state = SessionState::Failed;
        if let Some(mut handle) = self.handle.take() {
            warn!(
                tx_id = %self.id,
                conn_id = handle.id(),
                error = %error,
                "Transaction failed, discarding connection"
            );
            handle.invalidate();
            self.pool.release(handle).await;
        }
        error
    }

    fn invalid_state(&self, op: &str) -> DbError {
        DbError::transaction(
            format!("Cannot {} a session in state '{}'", op.to_lowercase(), self.state),
            self.id.clone(),
        )
    }
}

impl<C: Connector> fmt::Debug for Session<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("conn_id", &self.handle.as_ref().map(|h| h.id()))
            .finish()
    }
}

impl<C: Connector> Drop for Session<C> {
    fn drop(&mut self) {
        if let Some(mut handle) = self.handle.take() {
            warn!(tx_id = %self.id, conn_id = handle.id(), "Open session dropped, discarding transaction");
            handle.invalidate();
        }
    }
}

async fn bounded<T>(
    deadline: Option<(Instant, Duration)>,
    operation: impl Future<Output = DbResult<T>>,
) -> DbResult<T> {
    match deadline {
        Some((deadline, limit)) => tokio::time::timeout_at(deadline, operation)
            .await
            .unwrap_or_else(|_| Err(DbError::timeout("transaction", limit))),
        None => operation.await,
    }
}

fn missing_handle() -> DbError {
    DbError::internal("open session has no connection")
}
