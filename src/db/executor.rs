//! Query execution engine.
//!
//! This module runs [`Statement`]s against a leased connection with support for:
//! - Placeholder/parameter count checks before any I/O
//! - Per-statement deadlines (expiry invalidates the lease)
//! - Lazy, forward-only row streams
//! - Retry with exponential backoff for statements marked idempotent

use crate::db::connection::{Connection, Connector};
use crate::db::inspect;
use crate::db::mapper::RowMapper;
use crate::db::pool::{HandleState, Pool, PooledConnection};
use crate::error::{DbError, DbResult, QueryErrorKind};
use crate::models::{DEFAULT_QUERY_TIMEOUT_MS, ResultRow, Statement, StatementKind};
use futures_util::stream::BoxStream;
use futures_util::{Stream, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::{Instant, Sleep};
use tracing::{debug, warn};

/// Retry schedule for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Never retry.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (0-based): doubles each time,
    /// capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Result of [`QueryExecutor::execute`].
pub enum ExecuteOutcome<'h> {
    /// Rows affected by a write
    Affected(u64),
    Rows(RowStream<'h>),
}

impl std::fmt::Debug for ExecuteOutcome<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Affected(n) => f.debug_tuple("Affected").field(n).finish(),
            Self::Rows(_) => f.debug_tuple("Rows").finish(),
        }
    }
}

/// Materialized result of [`QueryExecutor::run`].
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Affected(u64),
    Rows(Vec<ResultRow>),
}

/// Lazy, forward-only rows of one query.
///
/// Borrows the lease for as long as it lives. Hitting the deadline or losing
/// the connection ends the stream with an error and invalidates the lease.
/// So does dropping the stream before its end: the connection may still be
/// mid-result, and is closed on release rather than reused.
pub struct RowStream<'h> {
    inner: BoxStream<'h, DbResult<ResultRow>>,
    state: &'h mut HandleState,
    sleep: Pin<Box<Sleep>>,
    limit: Duration,
    done: bool,
}

impl RowStream<'_> {
    /// Drain the stream into memory.
    pub async fn collect_rows(self) -> DbResult<Vec<ResultRow>> {
        self.try_collect().await
    }
}

impl Stream for RowStream<'_> {
    type Item = DbResult<ResultRow>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }

        match this.inner.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(row))) => Poll::Ready(Some(Ok(row))),
            Poll::Ready(Some(Err(e))) => {
                this.done = true;
                this.state.in_flight = false;
                if e.invalidates_connection() {
                    this.state.invalid = true;
                }
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.done = true;
                this.state.in_flight = false;
                Poll::Ready(None)
            }
            Poll::Pending => match this.sleep.as_mut().poll(cx) {
                Poll::Ready(()) => {
                    this.done = true;
                    this.state.in_flight = false;
                    this.state.invalid = true;
                    warn!(timeout_ms = this.limit.as_millis() as u64, "Query timed out");
                    Poll::Ready(Some(Err(DbError::timeout("query", this.limit))))
                }
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

impl Drop for RowStream<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.state.invalid = true;
        }
        self.state.in_flight = false;
    }
}

/// Runs statements against leased connections.
#[derive(Debug, Clone)]
pub struct QueryExecutor {
    default_timeout: Duration,
    retry: RetryPolicy,
}

impl QueryExecutor {
    /// Create a new query executor with default settings.
    pub fn new() -> Self {
        Self {
            default_timeout: Duration::from_millis(DEFAULT_QUERY_TIMEOUT_MS),
            retry: RetryPolicy::default(),
        }
    }

    /// Create a new query executor with custom settings.
    pub fn with_defaults(default_timeout: Duration, retry: RetryPolicy) -> Self {
        Self {
            default_timeout,
            retry,
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Run one statement on a leased connection.
    ///
    /// Writes report the number of affected rows; reads return a lazy row
    /// stream. Idempotent writes are retried on serialization conflicts.
    pub async fn execute<'h, C: Connector>(
        &self,
        handle: &'h mut PooledConnection<C>,
        statement: &'h Statement,
    ) -> DbResult<ExecuteOutcome<'h>> {
        inspect::check_parameters(statement)?;
        match statement.kind {
            StatementKind::Write => self
                .write_with_retry(handle, statement)
                .await
                .map(ExecuteOutcome::Affected),
            StatementKind::Read => self.stream(handle, statement).map(ExecuteOutcome::Rows),
        }
    }

    /// Run a statement for its affected-row count, whatever its kind.
    pub async fn execute_write<C: Connector>(
        &self,
        handle: &mut PooledConnection<C>,
        statement: &Statement,
    ) -> DbResult<u64> {
        inspect::check_parameters(statement)?;
        self.write_with_retry(handle, statement).await
    }

    /// Fetch every row and map it.
    pub async fn fetch_all<C: Connector, T>(
        &self,
        handle: &mut PooledConnection<C>,
        statement: &Statement,
        mapper: &RowMapper<T>,
    ) -> DbResult<Vec<T>> {
        inspect::check_parameters(statement)?;
        let mut attempt = 0;
        let rows = loop {
            let result = self.collect_once(handle, statement).await;
            match self.should_retry(&result, statement, handle, attempt) {
                Some(backoff) => {
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                None => break result?,
            }
        };
        mapper.map_all(&rows)
    }

    /// Fetch the first row, if any, and map it.
    pub async fn fetch_optional<C: Connector, T>(
        &self,
        handle: &mut PooledConnection<C>,
        statement: &Statement,
        mapper: &RowMapper<T>,
    ) -> DbResult<Option<T>> {
        inspect::check_parameters(statement)?;
        let mut attempt = 0;
        let row = loop {
            let result = self.first_once(handle, statement).await;
            match self.should_retry(&result, statement, handle, attempt) {
                Some(backoff) => {
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                None => break result?,
            }
        };
        row.as_ref().map(|r| mapper.map(r)).transpose()
    }

    /// Fetch exactly the first row; no rows is an error.
    pub async fn fetch_one<C: Connector, T>(
        &self,
        handle: &mut PooledConnection<C>,
        statement: &Statement,
        mapper: &RowMapper<T>,
    ) -> DbResult<T> {
        self.fetch_optional(handle, statement, mapper)
            .await?
            .ok_or_else(no_rows)
    }

    /// Auto-commit one-shot: acquire a lease, run, release.
    ///
    /// Idempotent statements are retried on any transient failure, each
    /// attempt on a freshly acquired lease.
    pub async fn run<C: Connector>(
        &self,
        pool: &Pool<C>,
        statement: &Statement,
    ) -> DbResult<RunOutcome> {
        inspect::check_parameters(statement)?;
        let mut attempt = 0;
        loop {
            match self.run_once(pool, statement).await {
                Err(e)
                    if statement.idempotent
                        && e.is_retryable()
                        && attempt < self.retry.max_retries =>
                {
                    let backoff = self.retry.backoff(attempt);
                    warn!(
                        error = %e,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Retrying idempotent statement"
                    );
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn run_once<C: Connector>(
        &self,
        pool: &Pool<C>,
        statement: &Statement,
    ) -> DbResult<RunOutcome> {
        let mut handle = pool.acquire_default().await?;
        let result = match statement.kind {
            StatementKind::Write => self
                .write_once(&mut handle, statement)
                .await
                .map(RunOutcome::Affected),
            StatementKind::Read => self
                .collect_once(&mut handle, statement)
                .await
                .map(RunOutcome::Rows),
        };
        pool.release(handle).await;
        result
    }

    // =========================================================================
    // Single attempts, also used inside transactions where retry is unsafe
    // =========================================================================

    pub(crate) async fn write_once<C: Connector>(
        &self,
        handle: &mut PooledConnection<C>,
        statement: &Statement,
    ) -> DbResult<u64> {
        let limit = statement.timeout.unwrap_or(self.default_timeout);
        let conn_id = handle.id();
        let (conn, state) = usable(handle)?;

        debug!(
            conn_id = conn_id,
            sql = %statement.sql,
            params = statement.params.len(),
            timeout_ms = limit.as_millis() as u64,
            "Executing statement"
        );

        state.in_flight = true;
        let result = match tokio::time::timeout(
            limit,
            conn.execute(&statement.sql, &statement.params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(DbError::timeout("statement", limit)),
        };
        state.in_flight = false;

        if let Err(e) = &result {
            if e.invalidates_connection() {
                warn!(conn_id = conn_id, error = %e, "Invalidating connection");
                state.invalid = true;
            }
        }
        result
    }

    pub(crate) fn stream<'h, C: Connector>(
        &self,
        handle: &'h mut PooledConnection<C>,
        statement: &'h Statement,
    ) -> DbResult<RowStream<'h>> {
        let limit = statement.timeout.unwrap_or(self.default_timeout);
        let conn_id = handle.id();
        let (conn, state) = usable(handle)?;

        debug!(
            conn_id = conn_id,
            sql = %statement.sql,
            params = statement.params.len(),
            timeout_ms = limit.as_millis() as u64,
            "Executing query"
        );

        state.in_flight = true;
        Ok(RowStream {
            inner: conn.fetch(&statement.sql, &statement.params),
            state,
            sleep: Box::pin(tokio::time::sleep_until(Instant::now() + limit)),
            limit,
            done: false,
        })
    }

    pub(crate) async fn collect_once<C: Connector>(
        &self,
        handle: &mut PooledConnection<C>,
        statement: &Statement,
    ) -> DbResult<Vec<ResultRow>> {
        self.stream(handle, statement)?.collect_rows().await
    }

    pub(crate) async fn first_once<C: Connector>(
        &self,
        handle: &mut PooledConnection<C>,
        statement: &Statement,
    ) -> DbResult<Option<ResultRow>> {
        let mut rows = self.stream(handle, statement)?;
        let first = rows.try_next().await?;
        while rows.try_next().await?.is_some() {}
        Ok(first)
    }

    async fn write_with_retry<C: Connector>(
        &self,
        handle: &mut PooledConnection<C>,
        statement: &Statement,
    ) -> DbResult<u64> {
        let mut attempt = 0;
        loop {
            let result = self.write_once(handle, statement).await;
            match self.should_retry(&result, statement, handle, attempt) {
                Some(backoff) => {
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                None => return result,
            }
        }
    }

    /// On a held lease only serialization conflicts are retried: the
    /// connection is still usable, unlike after a timeout or lost connection.
    fn should_retry<T, C: Connector>(
        &self,
        result: &DbResult<T>,
        statement: &Statement,
        handle: &PooledConnection<C>,
        attempt: u32,
    ) -> Option<Duration> {
        let Err(e) = result else {
            return None;
        };
        if !statement.idempotent
            || e.kind() != Some(QueryErrorKind::SerializationConflict)
            || attempt >= self.retry.max_retries
            || !handle.is_valid()
        {
            return None;
        }
        let backoff = self.retry.backoff(attempt);
        warn!(
            conn_id = handle.id(),
            attempt = attempt + 1,
            backoff_ms = backoff.as_millis() as u64,
            "Serialization conflict, retrying statement"
        );
        Some(backoff)
    }
}

impl Default for QueryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

/// The lease's connection, unless an earlier failure or an abandoned
/// statement left it in an unknown state.
fn usable<C: Connector>(
    handle: &mut PooledConnection<C>,
) -> DbResult<(&mut C::Conn, &mut HandleState)> {
    let (conn, state) = handle.parts()?;
    if state.in_flight {
        state.invalid = true;
        return Err(DbError::connection_lost(
            "connection was abandoned in the middle of a statement",
        ));
    }
    if state.invalid {
        return Err(DbError::connection_lost(
            "connection was invalidated by an earlier failure",
        ));
    }
    Ok((conn, state))
}

pub(crate) fn no_rows() -> DbError {
    DbError::query(QueryErrorKind::Other, "No rows returned", None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::db::connection::mock::MockConnector;
    use crate::db::mapper::{ColumnType, RowSchema};
    use std::sync::Arc;
    use std::sync::atomic::Ordering;

    async fn setup(max_size: u32) -> (Pool<MockConnector>, MockConnector) {
        let connector = MockConnector::new();
        let config = PoolConfig {
            min_size: 0,
            max_size,
            acquire_timeout: Duration::from_millis(100),
            ..PoolConfig::default()
        };
        let pool = Pool::connect(config, connector.clone()).await.unwrap();
        (pool, connector)
    }

    fn executor() -> QueryExecutor {
        QueryExecutor::with_defaults(
            Duration::from_secs(1),
            RetryPolicy {
                max_retries: 3,
                initial_backoff: Duration::from_millis(10),
                max_backoff: Duration::from_millis(40),
            },
        )
    }

    fn n_mapper() -> RowMapper<i64> {
        RowMapper::new(RowSchema::new().field("n", ColumnType::Integer), |r| r.int())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(500));
        assert_eq!(policy.backoff(40), Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parameter_mismatch_before_io() {
        let (pool, connector) = setup(1).await;
        let mut handle = pool.acquire_default().await.unwrap();

        let stmt = Statement::new("UPDATE t SET a = ? WHERE id = ?").bind(1);
        let err = executor().execute_write(&mut handle, &stmt).await.unwrap_err();
        assert!(matches!(
            err,
            DbError::ParameterMismatch {
                expected: 2,
                supplied: 1
            }
        ));
        assert!(connector.state.statements().is_empty());
        assert!(handle.is_valid());
        pool.release(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_write_and_read() {
        let (pool, _connector) = setup(1).await;
        let mut handle = pool.acquire_default().await.unwrap();
        let executor = executor();

        let write = Statement::new("DELETE FROM t");
        match executor.execute(&mut handle, &write).await.unwrap() {
            ExecuteOutcome::Affected(n) => assert_eq!(n, 1),
            other => panic!("expected Affected, got {:?}", other),
        }

        let read = Statement::new("SELECT n FROM t");
        let rows = match executor.execute(&mut handle, &read).await.unwrap() {
            ExecuteOutcome::Rows(rows) => rows.collect_rows().await.unwrap(),
            other => panic!("expected Rows, got {:?}", other),
        };
        assert_eq!(rows.len(), 2);
        assert!(Arc::ptr_eq(rows[0].columns(), rows[1].columns()));
        assert!(handle.is_valid());
        pool.release(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_statement_timeout_invalidates_handle() {
        let (pool, connector) = setup(1).await;
        let mut handle = pool.acquire_default().await.unwrap();

        let stmt = Statement::new("SLEEP 500").with_timeout(Duration::from_millis(100));
        let err = executor().execute_write(&mut handle, &stmt).await.unwrap_err();
        assert_eq!(err.kind(), Some(QueryErrorKind::Timeout));
        assert!(!handle.is_valid());

        pool.release(handle).await;
        assert_eq!(connector.state.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().size, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalidated_handle_rejects_statements() {
        let (pool, connector) = setup(1).await;
        let mut handle = pool.acquire_default().await.unwrap();
        handle.invalidate();

        let err = executor()
            .execute_write(&mut handle, &Statement::new("DELETE FROM t"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(QueryErrorKind::ConnectionLost));
        assert!(connector.state.statements().is_empty());
        pool.release(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_statement_rejects_handle() {
        let (pool, connector) = setup(1).await;
        let mut handle = pool.acquire_default().await.unwrap();
        let executor = executor();

        let abandoned = tokio::time::timeout(
            Duration::from_millis(50),
            executor.execute_write(&mut handle, &Statement::new("SLEEP 500")),
        )
        .await;
        assert!(abandoned.is_err());
        assert!(!handle.is_valid());

        let err = executor
            .execute_write(&mut handle, &Statement::new("DELETE FROM t"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(QueryErrorKind::ConnectionLost));
        assert_eq!(connector.state.statements(), vec!["SLEEP 500"]);

        pool.release(handle).await;
        assert_eq!(connector.state.closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().idle, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unfinished_stream_invalidates_handle() {
        let (pool, connector) = setup(1).await;
        let mut handle = pool.acquire_default().await.unwrap();
        let read = Statement::new("SELECT n FROM t");

        match executor().execute(&mut handle, &read).await.unwrap() {
            ExecuteOutcome::Rows(mut rows) => {
                assert!(rows.next().await.is_some());
            }
            other => panic!("expected Rows, got {:?}", other),
        }
        assert!(!handle.is_valid());

        pool.release(handle).await;
        assert_eq!(connector.state.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_lost_invalidates_handle() {
        let (pool, _connector) = setup(1).await;
        let mut handle = pool.acquire_default().await.unwrap();

        let err = executor()
            .fetch_all(&mut handle, &Statement::new("SELECT lost"), &n_mapper())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(QueryErrorKind::ConnectionLost));
        assert!(!handle.is_valid());
        pool.release(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_syntax_error_keeps_handle() {
        let (pool, _connector) = setup(1).await;
        let mut handle = pool.acquire_default().await.unwrap();

        let err = executor()
            .execute_write(&mut handle, &Statement::new("UPDATE syntax"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(QueryErrorKind::SyntaxInvalid));
        assert!(handle.is_valid());
        pool.release(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_retried_for_idempotent_only() {
        let (pool, connector) = setup(1).await;
        let mut handle = pool.acquire_default().await.unwrap();
        let executor = executor();

        connector.state.conflicts_remaining.store(2, Ordering::SeqCst);
        let stmt = Statement::new("UPDATE conflict").idempotent(true);
        assert_eq!(executor.execute_write(&mut handle, &stmt).await.unwrap(), 1);
        assert_eq!(connector.state.statements().len(), 3);

        connector.state.conflicts_remaining.store(1, Ordering::SeqCst);
        let stmt = Statement::new("UPDATE conflict");
        let err = executor.execute_write(&mut handle, &stmt).await.unwrap_err();
        assert_eq!(err.kind(), Some(QueryErrorKind::SerializationConflict));
        assert_eq!(connector.state.statements().len(), 4);

        pool.release(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_helpers() {
        let (pool, connector) = setup(1).await;
        let mut handle = pool.acquire_default().await.unwrap();
        let executor = executor();
        let mapper = n_mapper();
        let stmt = Statement::new("SELECT n FROM t");

        let all = executor.fetch_all(&mut handle, &stmt, &mapper).await.unwrap();
        assert_eq!(all, vec![0, 1]);

        let first = executor
            .fetch_optional(&mut handle, &stmt, &mapper)
            .await
            .unwrap();
        assert_eq!(first, Some(0));
        assert!(handle.is_valid());

        connector.state.fetch_rows.store(0, Ordering::SeqCst);
        let none = executor
            .fetch_optional(&mut handle, &stmt, &mapper)
            .await
            .unwrap();
        assert_eq!(none, None);
        assert!(executor.fetch_one(&mut handle, &stmt, &mapper).await.is_err());

        pool.release(handle).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_retries_on_fresh_connection() {
        let (pool, connector) = setup(1).await;
        let executor = executor();

        let stmt = Statement::new("SELECT lost");
        assert!(stmt.idempotent);
        let err = executor.run(&pool, &stmt).await.unwrap_err();
        assert_eq!(err.kind(), Some(QueryErrorKind::ConnectionLost));
        // One connection per attempt; each lost one is closed.
        assert_eq!(connector.state.opened.load(Ordering::SeqCst), 4);
        assert_eq!(connector.state.closed.load(Ordering::SeqCst), 4);

        let write = Statement::new("UPDATE lost");
        executor.run(&pool, &write).await.unwrap_err();
        assert_eq!(connector.state.opened.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_one_shot() {
        let (pool, _connector) = setup(1).await;
        let executor = executor();

        match executor.run(&pool, &Statement::new("SELECT n")).await.unwrap() {
            RunOutcome::Rows(rows) => assert_eq!(rows.len(), 2),
            other => panic!("expected rows, got {:?}", other),
        }
        assert_eq!(
            executor.run(&pool, &Statement::new("DELETE FROM t")).await.unwrap(),
            RunOutcome::Affected(1)
        );
        assert_eq!(pool.status().idle, 1);
    }
}
