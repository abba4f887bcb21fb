//! Pooled and unpooled data sources.
//!
//! [`PooledDataSource`] keeps physical connections in one of three places:
//! the idle list, the active list, or closed. Callers never see a physical
//! connection directly; they get a [`PooledConnection`] wrapper whose
//! `close()` hands the connection back. Every checkout gets a fresh wrapper
//! generation, so a wrapper that was returned, claimed by another caller or
//! force-closed fails fast on its next operation.
//!
//! # Concurrency
//!
//! - A fair `tokio::sync::Semaphore` with `max_active` permits bounds the
//!   active list; waiters are served in FIFO order
//! - Each active slot parks its permit; the permit is released only after the
//!   slot is back in the idle list or closed
//! - Pool bookkeeping lives under one `std::sync::Mutex` that is never held
//!   across an await; connect, ping, rollback and close run outside it
//! - When no permit is free, a waiter may claim the oldest active connection
//!   once it has been checked out longer than `max_checkout_time`
//!
//! # Cancellation
//!
//! Dropping an acquire future while it waits is clean. Dropping it while a
//! claimed or freshly created connection is in flight leaves that connection
//! to the drop path of its wrapper or closes it with the permit.

use crate::config::PoolOptions;
use crate::db::driver::{CallResult, Connection, Driver, StatementId};
use crate::error::{DbError, DbResult};
use crate::models::{ConnectionSpec, QueryParam, Row, StatementType};
use crate::sync::lock;
use async_trait::async_trait;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Source of connections for a transaction.
#[async_trait]
pub trait DataSource: Send + Sync + fmt::Debug {
    async fn get_connection(&self) -> DbResult<Box<dyn Connection>>;
}

// =============================================================================
// Unpooled
// =============================================================================

/// Opens a new physical connection for every request.
#[derive(Debug, Clone)]
pub struct UnpooledDataSource {
    driver: Arc<dyn Driver>,
    spec: ConnectionSpec,
}

impl UnpooledDataSource {
    pub fn new(driver: Arc<dyn Driver>, spec: ConnectionSpec) -> Self {
        Self { driver, spec }
    }
}

#[async_trait]
impl DataSource for UnpooledDataSource {
    async fn get_connection(&self) -> DbResult<Box<dyn Connection>> {
        self.driver.connect(&self.spec).await
    }
}

// =============================================================================
// Pool state
// =============================================================================

#[derive(Debug)]
struct SlotTimes {
    last_used: Instant,
    checked_out_at: Instant,
}

/// One physical connection owned by the pool.
struct Slot {
    id: u64,
    type_code: i32,
    created_at: Instant,
    /// `None` once physically closed.
    real: tokio::sync::Mutex<Option<Box<dyn Connection>>>,
    /// Wrapper generation currently allowed to use the connection.
    generation: AtomicU64,
    in_transaction: AtomicBool,
    times: Mutex<SlotTimes>,
    /// Capacity held while the slot is checked out.
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Slot {
    fn new(id: u64, type_code: i32, real: Box<dyn Connection>) -> Self {
        let now = Instant::now();
        Self {
            id,
            type_code,
            created_at: now,
            real: tokio::sync::Mutex::new(Some(real)),
            generation: AtomicU64::new(0),
            in_transaction: AtomicBool::new(false),
            times: Mutex::new(SlotTimes {
                last_used: now,
                checked_out_at: now,
            }),
            permit: Mutex::new(None),
        }
    }

    /// Invalidate every outstanding wrapper and return the new generation.
    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn checkout_age(&self) -> Duration {
        lock(&self.times).checked_out_at.elapsed()
    }

    fn idle_for(&self) -> Duration {
        lock(&self.times).last_used.elapsed()
    }

    fn mark_checked_out(&self) {
        let now = Instant::now();
        let mut times = lock(&self.times);
        times.checked_out_at = now;
        times.last_used = now;
    }

    fn after_use(&self, in_transaction: bool) {
        lock(&self.times).last_used = Instant::now();
        self.in_transaction.store(in_transaction, Ordering::SeqCst);
    }

    fn park_permit(&self, permit: OwnedSemaphorePermit) {
        *lock(&self.permit) = Some(permit);
    }

    fn take_permit(&self) -> Option<OwnedSemaphorePermit> {
        lock(&self.permit).take()
    }
}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("type_code", &self.type_code)
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
struct PoolStats {
    request_count: u64,
    accumulated_request_time: Duration,
    accumulated_checkout_time: Duration,
    claimed_overdue_count: u64,
    accumulated_checkout_time_of_overdue: Duration,
    accumulated_wait_time: Duration,
    had_to_wait_count: u64,
    bad_connection_count: u64,
}

#[derive(Debug)]
struct PoolState {
    spec: ConnectionSpec,
    expected_type_code: i32,
    idle: VecDeque<Arc<Slot>>,
    active: Vec<Arc<Slot>>,
    stats: PoolStats,
    next_slot_id: u64,
}

impl PoolState {
    fn remove_active(&mut self, slot: &Arc<Slot>) -> bool {
        match self.active.iter().position(|s| Arc::ptr_eq(s, slot)) {
            Some(idx) => {
                self.active.remove(idx);
                true
            }
            None => false,
        }
    }
}

/// Serializable snapshot of pool state and counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PoolStatus {
    pub url: String,
    pub active: usize,
    pub idle: usize,
    pub max_active: usize,
    pub max_idle: usize,
    pub request_count: u64,
    pub average_request_time_ms: u64,
    pub average_checkout_time_ms: u64,
    pub claimed_overdue_count: u64,
    pub average_overdue_checkout_time_ms: u64,
    pub had_to_wait_count: u64,
    pub average_wait_time_ms: u64,
    pub bad_connection_count: u64,
}

fn average_ms(total: Duration, count: u64) -> u64 {
    if count == 0 {
        0
    } else {
        (total.as_millis() / u128::from(count)) as u64
    }
}

struct PoolInner {
    driver: Arc<dyn Driver>,
    options: PoolOptions,
    semaphore: Arc<Semaphore>,
    state: Mutex<PoolState>,
}

impl fmt::Debug for PoolInner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("PoolInner")
            .field("url", &state.spec.masked_url())
            .field("active", &state.active.len())
            .field("idle", &state.idle.len())
            .field("options", &self.options)
            .finish()
    }
}

enum Checkout {
    Stale(Arc<Slot>),
    Idle(Arc<Slot>),
    Create(ConnectionSpec, i32, u64),
}

// =============================================================================
// PooledDataSource
// =============================================================================

/// Bounded pool of physical connections.
///
/// Must be created inside a tokio runtime when an eviction interval is
/// configured: the eviction task is spawned on construction.
pub struct PooledDataSource {
    inner: Arc<PoolInner>,
    eviction_handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for PooledDataSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledDataSource")
            .field("inner", &self.inner)
            .finish_non_exhaustive()
    }
}

impl PooledDataSource {
    pub fn new(driver: Arc<dyn Driver>, spec: ConnectionSpec, options: PoolOptions) -> Self {
        let max_active = options.max_active_or_default().max(1);
        info!(
            url = %spec.masked_url(),
            max_active,
            max_idle = options.max_idle_or_default(),
            ping_enabled = options.ping_enabled_or_default(),
            "Creating pooled data source"
        );
        let inner = Arc::new(PoolInner {
            driver,
            semaphore: Arc::new(Semaphore::new(max_active)),
            state: Mutex::new(PoolState {
                expected_type_code: spec.type_code(),
                spec,
                idle: VecDeque::new(),
                active: Vec::new(),
                stats: PoolStats::default(),
                next_slot_id: 1,
            }),
            options,
        });

        let eviction_handle = inner.options.eviction_interval().map(|interval| {
            // Weak reference: the task exits once the pool is dropped
            let weak_inner = Arc::downgrade(&inner);
            tokio::spawn(async move {
                PoolInner::eviction_task(weak_inner, interval).await;
            })
        });

        Self {
            inner,
            eviction_handle: Mutex::new(eviction_handle),
        }
    }

    /// Check out a connection, waiting up to `time_to_wait`.
    pub async fn acquire(&self) -> DbResult<PooledConnection> {
        PoolInner::pop_connection(&self.inner).await
    }

    pub fn options(&self) -> &PoolOptions {
        &self.inner.options
    }

    pub fn status(&self) -> PoolStatus {
        self.inner.status()
    }

    pub fn connection_spec(&self) -> ConnectionSpec {
        lock(&self.inner.state).spec.clone()
    }

    /// Point the pool at a different database or credentials. Every pooled
    /// connection (idle or checked out) is closed.
    pub async fn set_connection_spec(&self, spec: ConnectionSpec) {
        {
            let mut state = lock(&self.inner.state);
            state.expected_type_code = spec.type_code();
            state.spec = spec;
        }
        self.force_close_all().await;
    }

    /// Close every idle and active connection. Outstanding wrappers become
    /// invalid.
    pub async fn force_close_all(&self) {
        self.inner.force_close_all().await;
    }
}

impl Drop for PooledDataSource {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.eviction_handle).take() {
            handle.abort();
        }
    }
}

#[async_trait]
impl DataSource for PooledDataSource {
    async fn get_connection(&self) -> DbResult<Box<dyn Connection>> {
        Ok(Box::new(self.acquire().await?))
    }
}

impl PoolInner {
    fn pool_name(&self) -> String {
        lock(&self.state).spec.masked_url()
    }

    fn status(&self) -> PoolStatus {
        let state = lock(&self.state);
        let stats = &state.stats;
        PoolStatus {
            url: state.spec.masked_url(),
            active: state.active.len(),
            idle: state.idle.len(),
            max_active: self.options.max_active_or_default(),
            max_idle: self.options.max_idle_or_default(),
            request_count: stats.request_count,
            average_request_time_ms: average_ms(
                stats.accumulated_request_time,
                stats.request_count,
            ),
            average_checkout_time_ms: average_ms(
                stats.accumulated_checkout_time,
                stats.request_count,
            ),
            claimed_overdue_count: stats.claimed_overdue_count,
            average_overdue_checkout_time_ms: average_ms(
                stats.accumulated_checkout_time_of_overdue,
                stats.claimed_overdue_count,
            ),
            had_to_wait_count: stats.had_to_wait_count,
            average_wait_time_ms: average_ms(
                stats.accumulated_wait_time,
                stats.had_to_wait_count,
            ),
            bad_connection_count: stats.bad_connection_count,
        }
    }

    async fn pop_connection(self: &Arc<Self>) -> DbResult<PooledConnection> {
        let started = Instant::now();
        let time_to_wait = self.options.time_to_wait_or_default();
        let deadline = started + time_to_wait;
        let tolerance =
            self.options.max_idle_or_default() + self.options.bad_connection_tolerance_or_default();
        let mut local_bad = 0usize;
        let mut counted_wait = false;

        loop {
            let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(TryAcquireError::Closed) => return Err(DbError::closed("Connection pool")),
                Err(TryAcquireError::NoPermits) => {
                    if let Some(conn) = self.claim_overdue().await? {
                        self.record_request(started);
                        return Ok(conn);
                    }
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(self.exhausted(started, time_to_wait));
                    }
                    if !counted_wait {
                        counted_wait = true;
                        lock(&self.state).stats.had_to_wait_count += 1;
                        debug!(pool = %self.pool_name(), "Waiting for a connection");
                    }
                    // Wake early when the oldest checkout becomes claimable.
                    let wait = match self.next_overdue_in() {
                        Some(until_overdue) => (deadline - now).min(until_overdue),
                        None => deadline - now,
                    };
                    let wait_started = Instant::now();
                    let acquired = tokio::time::timeout(
                        wait,
                        Arc::clone(&self.semaphore).acquire_owned(),
                    )
                    .await;
                    lock(&self.state).stats.accumulated_wait_time += wait_started.elapsed();
                    match acquired {
                        Ok(Ok(permit)) => permit,
                        Ok(Err(_)) => return Err(DbError::closed("Connection pool")),
                        Err(_) => continue,
                    }
                }
            };

            match self.checkout(permit).await {
                Ok(Some(conn)) => {
                    self.record_request(started);
                    return Ok(conn);
                }
                Ok(None) => {
                    local_bad += 1;
                    lock(&self.state).stats.bad_connection_count += 1;
                    if local_bad > tolerance {
                        return Err(DbError::pool_exhausted(
                            self.pool_name(),
                            started.elapsed().as_millis() as u64,
                            "Could not get a good connection to the database",
                        ));
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn exhausted(&self, started: Instant, time_to_wait: Duration) -> DbError {
        let waited_ms = started.elapsed().as_millis() as u64;
        warn!(pool = %self.pool_name(), waited_ms, "Connection pool exhausted");
        DbError::pool_exhausted(
            self.pool_name(),
            waited_ms,
            format!(
                "no connection became available within {}ms",
                time_to_wait.as_millis()
            ),
        )
    }

    fn record_request(&self, started: Instant) {
        let mut state = lock(&self.state);
        state.stats.request_count += 1;
        state.stats.accumulated_request_time += started.elapsed();
    }

    /// Time until the oldest active connection may be claimed.
    fn next_overdue_in(&self) -> Option<Duration> {
        let max_checkout = self.options.max_checkout_time_or_default();
        let state = lock(&self.state);
        state
            .active
            .iter()
            .map(|slot| slot.checkout_age())
            .max()
            .map(|age| max_checkout.saturating_sub(age) + Duration::from_millis(1))
    }

    /// With a permit in hand: take an idle connection or open a new one.
    /// `Ok(None)` reports a bad connection that was discarded.
    async fn checkout(self: &Arc<Self>, permit: OwnedSemaphorePermit) -> DbResult<Option<PooledConnection>> {
        let slot = loop {
            let next = {
                let mut state = lock(&self.state);
                match state.idle.pop_front() {
                    Some(slot) if slot.type_code != state.expected_type_code => {
                        Checkout::Stale(slot)
                    }
                    Some(slot) => Checkout::Idle(slot),
                    None => {
                        let id = state.next_slot_id;
                        state.next_slot_id += 1;
                        Checkout::Create(state.spec.clone(), state.expected_type_code, id)
                    }
                }
            };

            break match next {
                Checkout::Stale(slot) => {
                    // Opened under a previous spec
                    Self::close_slot(&slot).await;
                    continue;
                }
                Checkout::Idle(slot) => {
                    if !self.validate(&slot, self.options.ping_on_checkout_or_default()).await {
                        warn!(connection = slot.id, "Discarding bad connection from idle list");
                        Self::close_slot(&slot).await;
                        return Ok(None);
                    }
                    debug!(connection = slot.id, "Checked out idle connection");
                    slot
                }
                Checkout::Create(spec, type_code, id) => {
                    let real = self.driver.connect(&spec).await?;
                    let slot = Arc::new(Slot::new(id, type_code, real));
                    if !self.validate(&slot, self.options.ping_on_checkout_or_default()).await {
                        warn!(connection = id, "Discarding new connection that failed validation");
                        Self::close_slot(&slot).await;
                        return Ok(None);
                    }
                    debug!(connection = id, "Created connection");
                    slot
                }
            };
        };

        slot.mark_checked_out();
        slot.park_permit(permit);
        let generation = slot.next_generation();
        lock(&self.state).active.push(Arc::clone(&slot));
        Ok(Some(PooledConnection::new(Arc::clone(self), slot, generation)))
    }

    /// Take over the oldest active connection if it is overdue.
    async fn claim_overdue(self: &Arc<Self>) -> DbResult<Option<PooledConnection>> {
        let max_checkout = self.options.max_checkout_time_or_default();
        let claimed = {
            let mut state = lock(&self.state);
            let oldest = state
                .active
                .iter()
                .enumerate()
                .map(|(idx, slot)| (idx, slot.checkout_age()))
                .max_by_key(|(_, age)| *age);
            match oldest {
                Some((idx, age)) if age > max_checkout => {
                    let slot = state.active.remove(idx);
                    // The previous holder's wrapper stops working from here on
                    slot.next_generation();
                    state.stats.claimed_overdue_count += 1;
                    state.stats.accumulated_checkout_time_of_overdue += age;
                    state.stats.accumulated_checkout_time += age;
                    Some((slot, age))
                }
                _ => None,
            }
        };
        let Some((slot, age)) = claimed else {
            return Ok(None);
        };

        warn!(
            connection = slot.id,
            checkout_ms = age.as_millis() as u64,
            "Claimed overdue connection"
        );
        {
            let mut real = slot.real.lock().await;
            match real.as_mut() {
                Some(conn) if conn.in_transaction() => {
                    if let Err(e) = conn.rollback().await {
                        warn!(connection = slot.id, error = %e, "Bad connection. Could not roll back");
                    }
                }
                Some(_) => {}
                None => {
                    drop(real);
                    // Nothing left to hand over; free its capacity
                    drop(slot.take_permit());
                    lock(&self.state).stats.bad_connection_count += 1;
                    return Ok(None);
                }
            }
        }

        slot.after_use(false);
        slot.mark_checked_out();
        let generation = slot.next_generation();
        lock(&self.state).active.push(Arc::clone(&slot));
        Ok(Some(PooledConnection::new(Arc::clone(self), slot, generation)))
    }

    /// Liveness and age checks. Pings only when enabled, requested and the
    /// connection has been unused for `ping_not_used_for`.
    async fn validate(&self, slot: &Slot, ping: bool) -> bool {
        if let Some(max_lifetime) = self.options.max_lifetime() {
            if slot.created_at.elapsed() > max_lifetime {
                debug!(connection = slot.id, "Connection exceeded max lifetime");
                return false;
            }
        }
        let mut real = slot.real.lock().await;
        let Some(conn) = real.as_mut() else {
            return false;
        };
        if conn.is_closed() {
            return false;
        }
        if !ping
            || !self.options.ping_enabled_or_default()
            || slot.idle_for() < self.options.ping_not_used_for_or_default()
        {
            return true;
        }
        match conn.ping(self.options.ping_query.as_deref()).await {
            Ok(()) => {
                debug!(connection = slot.id, "Ping succeeded");
                true
            }
            Err(e) => {
                warn!(connection = slot.id, error = %e, "Ping failed");
                false
            }
        }
    }

    /// Return a checked-out connection.
    async fn push_connection(self: Arc<Self>, slot: Arc<Slot>, generation: u64) {
        let accepted = {
            let mut state = lock(&self.state);
            if slot.generation.load(Ordering::SeqCst) != generation {
                state.stats.bad_connection_count += 1;
                false
            } else {
                state.stats.accumulated_checkout_time += slot.checkout_age();
                state.remove_active(&slot)
            }
        };
        if !accepted {
            warn!(connection = slot.id, "A bad connection attempted to return to the pool, discarding");
            return;
        }

        let mut healthy = self
            .validate(&slot, self.options.ping_on_return_or_default())
            .await;
        if healthy {
            let mut real = slot.real.lock().await;
            if let Some(conn) = real.as_mut() {
                if conn.in_transaction() {
                    if let Err(e) = conn.rollback().await {
                        warn!(connection = slot.id, error = %e, "Rollback on return failed");
                        healthy = false;
                    }
                }
            }
        }

        let back_to_idle = {
            let mut state = lock(&self.state);
            let keep = healthy
                && state.idle.len() < self.options.max_idle_or_default()
                && slot.type_code == state.expected_type_code;
            if keep {
                slot.next_generation();
                slot.after_use(false);
                state.idle.push_back(Arc::clone(&slot));
            }
            keep
        };

        if back_to_idle {
            debug!(connection = slot.id, "Returned connection to idle list");
        } else {
            slot.next_generation();
            debug!(connection = slot.id, healthy, "Closing returned connection");
            Self::close_slot(&slot).await;
        }
        // Capacity goes back only after the slot has settled
        drop(slot.take_permit());
    }

    async fn close_slot(slot: &Slot) {
        let taken = slot.real.lock().await.take();
        if let Some(mut conn) = taken {
            if conn.in_transaction() {
                if let Err(e) = conn.rollback().await {
                    debug!(connection = slot.id, error = %e, "Rollback before close failed");
                }
            }
            if let Err(e) = conn.close().await {
                debug!(connection = slot.id, error = %e, "Close failed");
            }
        }
    }

    async fn force_close_all(&self) {
        let slots: Vec<Arc<Slot>> = {
            let mut state = lock(&self.state);
            let mut slots: Vec<Arc<Slot>> = state.idle.drain(..).collect();
            slots.append(&mut state.active);
            slots
        };
        info!(count = slots.len(), "Force closing all pooled connections");
        join_all(slots.iter().map(|slot| async move {
            slot.next_generation();
            Self::close_slot(slot).await;
            drop(slot.take_permit());
        }))
        .await;
    }

    /// Background task closing idle connections past `max_idle_time` or
    /// `max_lifetime`.
    ///
    /// Holds a Weak reference and exits once the pool is dropped.
    async fn eviction_task(weak_inner: Weak<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;

        loop {
            ticker.tick().await;

            let Some(inner) = weak_inner.upgrade() else {
                info!("Connection pool dropped, eviction task exiting");
                return;
            };

            let max_idle_time = inner.options.max_idle_time();
            let max_lifetime = inner.options.max_lifetime();
            let evicted: Vec<Arc<Slot>> = {
                let mut state = lock(&inner.state);
                let (evicted, kept): (Vec<_>, Vec<_>) = state.idle.drain(..).partition(|slot| {
                    max_idle_time.is_some_and(|t| slot.idle_for() > t)
                        || max_lifetime.is_some_and(|t| slot.created_at.elapsed() > t)
                });
                state.idle = kept.into();
                evicted
            };

            for slot in &evicted {
                info!(connection = slot.id, "Evicting idle connection");
                Self::close_slot(slot).await;
            }

            drop(inner);
        }
    }
}

// =============================================================================
// PooledConnection
// =============================================================================

/// A checked-out connection. `close()` returns it to the pool.
///
/// # Drop
///
/// A wrapper dropped without `close()` is returned on a spawned task. If no
/// tokio runtime is available at that point, the physical connection stays
/// in the active list until claimed or force-closed.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    slot: Arc<Slot>,
    generation: u64,
    returned: bool,
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("connection", &self.slot.id)
            .field("generation", &self.generation)
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// Run `$body` against the physical connection after checking the wrapper
/// is still the current one.
macro_rules! with_real {
    ($self:ident, $conn:ident => $body:expr) => {{
        let mut guard = $self.slot.real.lock().await;
        if !$self.is_valid() {
            return Err(DbError::closed(format!(
                "Pooled connection {}",
                $self.slot.id
            )));
        }
        let $conn = guard
            .as_mut()
            .ok_or_else(|| DbError::closed(format!("Connection {}", $self.slot.id)))?;
        let result = $body;
        $self.slot.after_use($conn.in_transaction());
        result
    }};
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, slot: Arc<Slot>, generation: u64) -> Self {
        Self {
            pool,
            slot,
            generation,
            returned: false,
        }
    }

    /// Identifier of the physical connection behind this wrapper.
    pub fn connection_id(&self) -> u64 {
        self.slot.id
    }

    pub fn type_code(&self) -> i32 {
        self.slot.type_code
    }

    /// False once returned, claimed or force-closed.
    pub fn is_valid(&self) -> bool {
        !self.returned && self.slot.generation.load(Ordering::SeqCst) == self.generation
    }

    pub fn checkout_age(&self) -> Duration {
        self.slot.checkout_age()
    }
}

#[async_trait]
impl Connection for PooledConnection {
    async fn prepare(&mut self, sql: &str, statement_type: StatementType) -> DbResult<StatementId> {
        with_real!(self, conn => conn.prepare(sql, statement_type).await)
    }

    async fn query(&mut self, statement: StatementId, params: &[QueryParam]) -> DbResult<Vec<Row>> {
        with_real!(self, conn => conn.query(statement, params).await)
    }

    async fn update(&mut self, statement: StatementId, params: &[QueryParam]) -> DbResult<u64> {
        with_real!(self, conn => conn.update(statement, params).await)
    }

    async fn execute_batch(
        &mut self,
        statement: StatementId,
        batch: &[Vec<QueryParam>],
    ) -> DbResult<Vec<u64>> {
        with_real!(self, conn => conn.execute_batch(statement, batch).await)
    }

    async fn call(
        &mut self,
        statement: StatementId,
        params: &[QueryParam],
        out_count: usize,
    ) -> DbResult<CallResult> {
        with_real!(self, conn => conn.call(statement, params, out_count).await)
    }

    async fn close_statement(&mut self, statement: StatementId) -> DbResult<()> {
        with_real!(self, conn => conn.close_statement(statement).await)
    }

    async fn begin(&mut self) -> DbResult<()> {
        with_real!(self, conn => conn.begin().await)
    }

    async fn commit(&mut self) -> DbResult<()> {
        with_real!(self, conn => conn.commit().await)
    }

    async fn rollback(&mut self) -> DbResult<()> {
        with_real!(self, conn => conn.rollback().await)
    }

    fn in_transaction(&self) -> bool {
        self.is_valid() && self.slot.in_transaction.load(Ordering::SeqCst)
    }

    async fn ping(&mut self, query: Option<&str>) -> DbResult<()> {
        with_real!(self, conn => conn.ping(query).await)
    }

    fn is_closed(&self) -> bool {
        !self.is_valid()
    }

    /// Hand the connection back to the pool.
    async fn close(&mut self) -> DbResult<()> {
        if self.returned {
            return Ok(());
        }
        self.returned = true;
        Arc::clone(&self.pool)
            .push_connection(Arc::clone(&self.slot), self.generation)
            .await;
        Ok(())
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        self.returned = true;

        let pool = Arc::clone(&self.pool);
        let slot = Arc::clone(&self.slot);
        let generation = self.generation;
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let id = slot.id;
                    pool.push_connection(slot, generation).await;
                    warn!(
                        connection = id,
                        "Connection returned via Drop - consider calling close()"
                    );
                });
            }
            Err(_) => {
                warn!(connection = slot.id, "Connection dropped outside a runtime; not returned");
            }
        }
    }
}
