//! Connection pool management.
//!
//! A bounded pool of physical connections handed out as exclusively-owned
//! [`PooledConnection`] leases.
//!
//! # Design
//!
//! - **One `std::sync::Mutex` around `{idle, size, closed}`**: never held across
//!   an `.await`; every I/O step (connect, ping, close) happens outside it
//! - **`Notify` for waiters**: a release wakes one waiting `acquire`; shutdown
//!   wakes all of them
//! - **Slots are reserved before connecting**: `size` counts idle, leased and
//!   connecting connections, so it never exceeds `max_size`
//! - **A slot is freed only after the connection is closed**, and every await
//!   that holds a reserved slot does so through a [`Slot`] guard, so a
//!   cancelled connect, ping or close still gives the slot back
//! - **Reaper task with a `Weak` pool reference**: exits once the pool is dropped
//!   or closed

use crate::config::PoolConfig;
use crate::db::connection::{Connection, Connector};
use crate::error::{DbError, DbResult};
use crate::models::DatabaseType;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    /// Live connections: idle, leased or being opened
    pub size: u32,
    pub idle: u32,
    pub in_use: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub closed: bool,
}

struct Idle<T> {
    conn: T,
    id: u64,
    created_at: Instant,
    idle_since: Instant,
}

struct State<T> {
    idle: VecDeque<Idle<T>>,
    size: u32,
    closed: bool,
}

struct Shared<C: Connector> {
    connector: C,
    config: PoolConfig,
    state: Mutex<State<C::Conn>>,
    /// Wakes `acquire` callers waiting for capacity
    available: Notify,
    /// Wakes `shutdown` whenever a slot is freed
    drained: Notify,
    next_id: AtomicU64,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

/// Health flags of a lease.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct HandleState {
    /// Must be closed on release
    pub invalid: bool,
    /// A statement was started and has not finished
    pub in_flight: bool,
}

/// An exclusively-owned lease on one physical connection.
///
/// Give it back with [`Pool::release`]. A lease that is dropped without
/// being released is treated as invalid and its connection is closed.
pub struct PooledConnection<C: Connector> {
    conn: Option<C::Conn>,
    id: u64,
    created_at: Instant,
    state: HandleState,
    pool: Arc<Shared<C>>,
}

/// Bounded connection pool. Cheap to clone; clones share the same pool.
pub struct Pool<C: Connector> {
    shared: Arc<Shared<C>>,
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: Connector> Pool<C> {
    /// Build a pool and open `min_size` connections eagerly.
    ///
    /// Fails fast with the connector's error if a connection cannot be opened.
    pub async fn connect(config: PoolConfig, connector: C) -> DbResult<Self> {
        config.validate()?;

        let shared = Arc::new(Shared {
            connector,
            config,
            state: Mutex::new(State {
                idle: VecDeque::new(),
                size: 0,
                closed: false,
            }),
            available: Notify::new(),
            drained: Notify::new(),
            next_id: AtomicU64::new(1),
            reaper: Mutex::new(None),
        });

        for _ in 0..shared.config.min_size {
            shared.lock().size += 1;
            let slot = Slot::new(&shared);
            match shared.open().await {
                Ok(idle) => {
                    shared.lock().idle.push_back(idle);
                    slot.keep();
                }
                Err(e) => {
                    drop(slot);
                    shared.close_idle_all().await;
                    return Err(e);
                }
            }
        }

        let handle = spawn_reaper(&shared);
        *shared
            .reaper
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(handle);

        info!(
            db_type = %shared.connector.database_type(),
            min_size = shared.config.min_size,
            max_size = shared.config.max_size,
            "Connection pool ready"
        );

        Ok(Self { shared })
    }

    /// Lease a connection, waiting up to `timeout` for capacity.
    pub async fn acquire(&self, timeout: Duration) -> DbResult<PooledConnection<C>> {
        let shared = &self.shared;
        let start = Instant::now();
        let deadline = start + timeout;

        loop {
            let notified = shared.available.notified();
            let mut notified = std::pin::pin!(notified);

            let step = {
                let mut state = shared.lock();
                if state.closed {
                    Step::Closed
                } else if let Some(idle) = state.idle.pop_front() {
                    Step::Reuse(idle)
                } else if state.size < shared.config.max_size {
                    state.size += 1;
                    Step::Open
                } else {
                    // Register before unlocking so a release cannot slip past.
                    notified.as_mut().enable();
                    Step::Wait
                }
            };

            match step {
                Step::Closed => return Err(DbError::PoolClosed),
                Step::Reuse(mut idle) => {
                    let slot = Slot::new(shared);
                    if idle.created_at.elapsed() >= shared.config.max_lifetime {
                        shared
                            .close_conn(idle.conn, idle.id, "max lifetime exceeded", slot)
                            .await;
                        continue;
                    }
                    if shared.config.test_before_acquire {
                        if let Err(e) = idle.conn.ping().await {
                            debug!(conn_id = idle.id, error = %e, "Idle connection failed ping");
                            shared
                                .close_conn(idle.conn, idle.id, "liveness check failed", slot)
                                .await;
                            continue;
                        }
                    }
                    slot.keep();
                    return Ok(shared.lease(idle.conn, idle.id, idle.created_at));
                }
                Step::Open => {
                    let slot = Slot::new(shared);
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    return match tokio::time::timeout(remaining, shared.open()).await {
                        Ok(Ok(idle)) => {
                            slot.keep();
                            Ok(shared.lease(idle.conn, idle.id, idle.created_at))
                        }
                        Ok(Err(e)) => Err(e),
                        Err(_) => Err(DbError::pool_exhausted(
                            start.elapsed(),
                            shared.config.max_size,
                        )),
                    };
                }
                Step::Wait => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        debug!(
                            waited_ms = start.elapsed().as_millis() as u64,
                            max_size = shared.config.max_size,
                            "Pool exhausted"
                        );
                        return Err(DbError::pool_exhausted(
                            start.elapsed(),
                            shared.config.max_size,
                        ));
                    }
                }
            }
        }
    }

    /// Lease a connection using the configured acquire timeout.
    pub async fn acquire_default(&self) -> DbResult<PooledConnection<C>> {
        self.acquire(self.shared.config.acquire_timeout).await
    }

    /// Return a lease.
    ///
    /// The connection goes back to the idle set unless it was invalidated,
    /// still had a statement in flight, outlived `max_lifetime`, fails a
    /// liveness ping or the pool is closed; in those cases it is closed and
    /// its slot freed for a replacement.
    pub async fn release(&self, handle: PooledConnection<C>) {
        handle.release().await;
    }

    /// Close the pool.
    ///
    /// New and waiting `acquire` calls fail with `PoolClosed`. Idle
    /// connections are closed immediately; outstanding leases are waited for
    /// up to `grace` and closed as they come back. Calling it again is a
    /// no-op apart from waiting for any leases still outstanding.
    pub async fn shutdown(&self, grace: Duration) {
        let shared = &self.shared;
        let first = {
            let mut state = shared.lock();
            let first = !state.closed;
            state.closed = true;
            first
        };

        if first {
            info!("Shutting down connection pool");
            if let Some(handle) = shared
                .reaper
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
            {
                handle.abort();
            }
        }
        shared.available.notify_waiters();
        shared.close_idle_all().await;

        let deadline = Instant::now() + grace;
        loop {
            let notified = shared.drained.notified();
            let mut notified = std::pin::pin!(notified);
            notified.as_mut().enable();

            let outstanding = shared.lock().size;
            if outstanding == 0 {
                break;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                warn!(
                    outstanding = outstanding,
                    "Shutdown grace period elapsed with connections still leased"
                );
                break;
            }
        }

        if first {
            info!("Connection pool closed");
        }
    }

    /// Shut down with the configured grace period.
    pub async fn shutdown_default(&self) {
        self.shutdown(self.shared.config.shutdown_grace).await;
    }

    /// Snapshot of the pool counters.
    pub fn status(&self) -> PoolStatus {
        let state = self.shared.lock();
        let idle = state.idle.len() as u32;
        PoolStatus {
            size: state.size,
            idle,
            in_use: state.size.saturating_sub(idle),
            min_size: self.shared.config.min_size,
            max_size: self.shared.config.max_size,
            closed: state.closed,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn database_type(&self) -> DatabaseType {
        self.shared.connector.database_type()
    }
}

impl<C: Connector> std::fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("db_type", &self.database_type())
            .field("status", &self.status())
            .finish()
    }
}

enum Step<T> {
    Closed,
    Reuse(Idle<T>),
    Open,
    Wait,
}

/// One unit of capacity already counted in `size`.
///
/// Dropping the guard frees the slot; [`Slot::keep`] hands it over to a
/// connection that now sits in the idle set or in a lease.
struct Slot<'a, C: Connector> {
    shared: &'a Shared<C>,
    armed: bool,
}

impl<'a, C: Connector> Slot<'a, C> {
    fn new(shared: &'a Shared<C>) -> Self {
        Self {
            shared,
            armed: true,
        }
    }

    fn keep(mut self) {
        self.armed = false;
    }
}

impl<C: Connector> Drop for Slot<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.free_slot();
        }
    }
}

impl<C: Connector> Shared<C> {
    fn lock(&self) -> MutexGuard<'_, State<C::Conn>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Open a connection for a slot the caller already reserved.
    async fn open(&self) -> DbResult<Idle<C::Conn>> {
        let conn = self.connector.connect().await?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let now = Instant::now();
        debug!(conn_id = id, "Opened connection");
        Ok(Idle {
            conn,
            id,
            created_at: now,
            idle_since: now,
        })
    }

    fn lease(self: &Arc<Self>, conn: C::Conn, id: u64, created_at: Instant) -> PooledConnection<C> {
        PooledConnection {
            conn: Some(conn),
            id,
            created_at,
            state: HandleState::default(),
            pool: Arc::clone(self),
        }
    }

    fn free_slot(&self) {
        {
            let mut state = self.lock();
            state.size = state.size.saturating_sub(1);
        }
        self.available.notify_one();
        self.drained.notify_waiters();
    }

    /// Close a connection and free its slot, even if the close is cancelled.
    async fn close_conn(&self, conn: C::Conn, id: u64, reason: &str, slot: Slot<'_, C>) {
        debug!(conn_id = id, reason = reason, "Closing connection");
        if let Err(e) = conn.close().await {
            debug!(conn_id = id, error = %e, "Error while closing connection");
        }
        drop(slot);
    }

    async fn close_idle_all(&self) {
        let drained: Vec<_> = self.lock().idle.drain(..).collect();
        let idle: Vec<_> = drained
            .into_iter()
            .map(|entry| (entry, Slot::new(self)))
            .collect();
        for (entry, slot) in idle {
            self.close_conn(entry.conn, entry.id, "pool closed", slot).await;
        }
    }

    async fn give_back(&self, mut conn: C::Conn, id: u64, created_at: Instant, state: HandleState) {
        let slot = Slot::new(self);
        let reason = if state.invalid || state.in_flight {
            Some("invalidated")
        } else if created_at.elapsed() >= self.config.max_lifetime {
            Some("max lifetime exceeded")
        } else if self.is_closed() {
            Some("pool closed")
        } else if let Err(e) = conn.ping().await {
            debug!(conn_id = id, error = %e, "Released connection failed ping");
            Some("liveness check failed")
        } else {
            None
        };

        if let Some(reason) = reason {
            if state.invalid || state.in_flight {
                warn!(conn_id = id, "Discarding invalidated connection");
            }
            self.close_conn(conn, id, reason, slot).await;
            return;
        }

        let rejected = {
            let mut guard = self.lock();
            if guard.closed {
                Some(conn)
            } else {
                guard.idle.push_back(Idle {
                    conn,
                    id,
                    created_at,
                    idle_since: Instant::now(),
                });
                None
            }
        };

        match rejected {
            Some(conn) => self.close_conn(conn, id, "pool closed", slot).await,
            None => {
                slot.keep();
                self.available.notify_one();
            }
        }
    }

    /// Evict idle connections past their lifetime or idle timeout, then top
    /// the pool back up to `min_size` with fresh ones.
    async fn reap(&self) {
        let expired: Vec<Idle<C::Conn>> = {
            let mut state = self.lock();
            let mut keep = VecDeque::with_capacity(state.idle.len());
            let mut expired = Vec::new();
            for idle in state.idle.drain(..) {
                if idle.created_at.elapsed() >= self.config.max_lifetime
                    || idle.idle_since.elapsed() >= self.config.idle_timeout
                {
                    expired.push(idle);
                } else {
                    keep.push_back(idle);
                }
            }
            state.idle = keep;
            expired
        };
        let expired: Vec<_> = expired
            .into_iter()
            .map(|idle| (idle, Slot::new(self)))
            .collect();

        for (idle, slot) in expired {
            self.close_conn(idle.conn, idle.id, "reaped", slot).await;
        }

        loop {
            let reserved = {
                let mut state = self.lock();
                if !state.closed && state.size < self.config.min_size {
                    state.size += 1;
                    true
                } else {
                    false
                }
            };
            if !reserved {
                break;
            }
            let slot = Slot::new(self);
            match self.open().await {
                Ok(idle) => {
                    let rejected = {
                        let mut state = self.lock();
                        if state.closed {
                            Some(idle)
                        } else {
                            state.idle.push_back(idle);
                            None
                        }
                    };
                    match rejected {
                        Some(idle) => {
                            self.close_conn(idle.conn, idle.id, "pool closed", slot)
                                .await
                        }
                        None => {
                            slot.keep();
                            self.available.notify_one();
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to replenish connection pool");
                    drop(slot);
                    break;
                }
            }
        }
    }
}

fn spawn_reaper<C: Connector>(shared: &Arc<Shared<C>>) -> JoinHandle<()> {
    let weak: Weak<Shared<C>> = Arc::downgrade(shared);
    let period = shared.config.reap_interval;

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately.
        interval.tick().await;
        loop {
            interval.tick().await;
            let Some(shared) = weak.upgrade() else {
                return;
            };
            if shared.is_closed() {
                return;
            }
            shared.reap().await;
        }
    })
}

impl<C: Connector> PooledConnection<C> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Time since the physical connection was opened.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Mark the connection as unusable; it will be closed on release.
    pub fn invalidate(&mut self) {
        self.state.invalid = true;
    }

    /// False once invalidated or while a statement is in flight.
    pub fn is_valid(&self) -> bool {
        !self.state.invalid && !self.state.in_flight
    }

    pub fn database_type(&self) -> DatabaseType {
        self.pool.connector.database_type()
    }

    /// The physical connection and the lease's health flags, borrowed apart.
    pub(crate) fn parts(&mut self) -> DbResult<(&mut C::Conn, &mut HandleState)> {
        match self.conn.as_mut() {
            Some(conn) => Ok((conn, &mut self.state)),
            None => Err(DbError::internal("connection already released")),
        }
    }

    /// Hand the connection back to its pool.
    pub async fn release(mut self) {
        if let Some(conn) = self.conn.take() {
            let pool = Arc::clone(&self.pool);
            pool.give_back(conn, self.id, self.created_at, self.state)
                .await;
        }
    }
}

impl<C: Connector> Drop for PooledConnection<C> {
    fn drop(&mut self) {
        let Some(conn) = self.conn.take() else {
            return;
        };
        warn!(conn_id = self.id, "Connection lease dropped without release");
        let pool = Arc::clone(&self.pool);
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    let slot = Slot::new(&pool);
                    pool.close_conn(conn, id, "dropped without release", slot)
                        .await;
                });
            }
            Err(_) => {
                drop(conn);
                pool.free_slot();
            }
        }
    }
}

impl<C: Connector> std::fmt::Debug for PooledConnection<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("valid", &self.is_valid())
            .finish()
    }
}
