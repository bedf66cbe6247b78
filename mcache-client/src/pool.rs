//! # Connection Pool
//!
//! Purpose: Reuse server connections per address, bounding both the total
//! and the idle count, and retire connections that outlive their lifetime or
//! sit idle too long.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Checked-out connections are RAII guards that
//!    return themselves on drop.
//! 2. **Lock-Free Fast Path**: Idle connections live in a bounded channel, so
//!    a hit costs one `try_recv`.
//! 3. **Admission Under the Mutex**: Slots are reserved while holding the pool
//!    mutex; `num_open` is only read without it.
//! 4. **Backpressure via Context**: At capacity, callers wait until a
//!    connection comes back or their context ends.
//! 5. **Background Cleaner**: One thread per pool sweeps idle connections and
//!    never closes a connection while holding the mutex.
//!
//! ## Structure Overview
//!
//! ```text
//! ConnPool<C>
//!   └── shared: Arc<PoolShared<C>>
//!         ├── idle_tx / idle_rx: bounded channel of C
//!         ├── num_open: AtomicUsize
//!         ├── state: Mutex<PoolState { closed, cleaner, counters }>
//!         └── create: Fn(&Context) -> McResult<C>
//! PooledConn<C> { pool: Weak<PoolShared<C>>, conn, valid }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, warn};

use mcache_common::{McError, McResult};

use crate::context::Context;

/// Lower bound of the cleaner tick.
pub const MIN_CLEAN_INTERVAL: Duration = Duration::from_secs(1);

/// How often a caller blocked at capacity re-checks for a free slot.
const CAPACITY_RECHECK: Duration = Duration::from_millis(50);

/// What the pool needs from a connection.
pub trait PoolConn: Send + 'static {
    fn created_at(&self) -> Instant;
    fn returned_at(&self) -> Instant;
    /// Stamps the return time and drops per-request state.
    fn mark_returned(&mut self, at: Instant);
    fn close(&mut self);

    /// Lifetime check against `since = now - max_lifetime`.
    ///
    /// Returns the time left before expiry and whether it already expired.
    fn expired(&self, since: Instant) -> (Duration, bool) {
        remaining(self.created_at(), since)
    }

    /// Idle check against `since = now - max_idle_time`, same convention.
    fn idle(&self, since: Instant) -> (Duration, bool) {
        remaining(self.returned_at(), since)
    }
}

fn remaining(stamp: Instant, since: Instant) -> (Duration, bool) {
    if stamp < since {
        (Duration::ZERO, true)
    } else {
        (stamp - since, false)
    }
}

/// Pool limits. Zero durations disable the matching eviction.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_conns: usize,
    /// Zero keeps every returned connection up to `max_conns`.
    pub max_idle: usize,
    pub max_lifetime: Duration,
    pub max_idle_time: Duration,
}

impl PoolConfig {
    /// Cleaner tick: the shortest positive limit, floored at one second.
    pub fn clean_interval(&self) -> Option<Duration> {
        [self.max_lifetime, self.max_idle_time]
            .into_iter()
            .filter(|d| !d.is_zero())
            .min()
            .map(|d| d.max(MIN_CLEAN_INTERVAL))
    }
}

/// Snapshot of pool occupancy and eviction counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub max_conns: usize,
    pub max_idle: usize,
    pub max_idle_closed: u64,
    pub max_idle_time_closed: u64,
    pub max_lifetime_closed: u64,
}

/// Connection factory of a pool.
pub type CreateFn<C> = Box<dyn Fn(&Context) -> McResult<C> + Send + Sync>;

struct Cleaner {
    stop: Sender<()>,
    join: JoinHandle<()>,
}

impl Cleaner {
    fn stop(self) {
        drop(self.stop);
        if self.join.join().is_err() {
            warn!("pool cleaner panicked");
        }
    }
}

struct PoolState {
    closed: bool,
    cleaner: Option<Cleaner>,
    // Dropped on close to wake every waiter.
    shutdown: Option<Sender<()>>,
    max_idle_closed: u64,
    max_idle_time_closed: u64,
    max_lifetime_closed: u64,
}

struct PoolShared<C: PoolConn> {
    config: PoolConfig,
    idle_tx: Sender<C>,
    idle_rx: Receiver<C>,
    num_open: AtomicUsize,
    closed: AtomicBool,
    shutdown_rx: Receiver<()>,
    state: Mutex<PoolState>,
    create: CreateFn<C>,
}

/// Pool handle; clones share the same pool.
pub struct ConnPool<C: PoolConn> {
    shared: Arc<PoolShared<C>>,
}

impl<C: PoolConn> Clone for ConnPool<C> {
    fn clone(&self) -> Self {
        ConnPool {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<C: PoolConn> ConnPool<C> {
    pub fn new(config: PoolConfig, create: CreateFn<C>) -> Self {
        let config = PoolConfig {
            max_conns: config.max_conns.max(1),
            ..config
        };
        let (idle_tx, idle_rx) = crossbeam_channel::bounded(config.max_conns);
        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded(0);
        ConnPool {
            shared: Arc::new(PoolShared {
                config,
                idle_tx,
                idle_rx,
                num_open: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                shutdown_rx,
                state: Mutex::new(PoolState {
                    closed: false,
                    cleaner: None,
                    shutdown: Some(shutdown_tx),
                    max_idle_closed: 0,
                    max_idle_time_closed: 0,
                    max_lifetime_closed: 0,
                }),
                create,
            }),
        }
    }

    /// Checks out a connection, dialing a new one while under capacity.
    pub fn get(&self, ctx: &Context) -> McResult<PooledConn<C>> {
        let shared = &self.shared;
        loop {
            if shared.closed.load(Ordering::Acquire) {
                return Err(McError::PoolClosed);
            }
            ctx.check()?;

            if let Ok(conn) = shared.idle_rx.try_recv() {
                return Ok(self.wrap(conn));
            }

            if shared.reserve_slot()? {
                return match (shared.create)(ctx) {
                    Ok(conn) => Ok(self.wrap(conn)),
                    Err(err) => {
                        shared.release_slot();
                        Err(err)
                    }
                };
            }

            let done = ctx.done_chan();
            let deadline = ctx.deadline_chan();
            select! {
                recv(shared.idle_rx) -> conn => {
                    if let Ok(conn) = conn {
                        return Ok(self.wrap(conn));
                    }
                }
                recv(done) -> _ => return Err(McError::Canceled),
                recv(deadline) -> _ => return Err(McError::DeadlineExceeded),
                recv(shared.shutdown_rx) -> _ => return Err(McError::PoolClosed),
                default(CAPACITY_RECHECK) => {}
            }
        }
    }

    /// Closes idle connections and stops the cleaner.
    ///
    /// Connections still checked out are closed when they come back.
    pub fn close(&self) -> McResult<()> {
        let shared = &self.shared;
        let (cleaner, drained) = {
            let mut state = shared.state.lock();
            if state.closed {
                return Ok(());
            }
            state.closed = true;
            shared.closed.store(true, Ordering::Release);
            state.shutdown.take();

            let drained: Vec<C> = shared.idle_rx.try_iter().collect();
            shared.num_open.fetch_sub(drained.len(), Ordering::AcqRel);
            (state.cleaner.take(), drained)
        };

        let count = drained.len();
        for mut conn in drained {
            conn.close();
        }
        if let Some(cleaner) = cleaner {
            cleaner.stop();
        }
        debug!(idle_closed = count, "connection pool closed");
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let shared = &self.shared;
        let state = shared.state.lock();
        PoolStats {
            total: shared.num_open.load(Ordering::Acquire),
            idle: shared.idle_rx.len(),
            max_conns: shared.config.max_conns,
            max_idle: shared.config.max_idle,
            max_idle_closed: state.max_idle_closed,
            max_idle_time_closed: state.max_idle_time_closed,
            max_lifetime_closed: state.max_lifetime_closed,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    fn wrap(&self, conn: C) -> PooledConn<C> {
        PooledConn {
            pool: Arc::downgrade(&self.shared),
            conn: Some(conn),
            valid: true,
        }
    }
}

impl<C: PoolConn> PoolShared<C> {
    /// Reserves a slot for a new connection if under capacity.
    fn reserve_slot(&self) -> McResult<bool> {
        let state = self.state.lock();
        if state.closed {
            return Err(McError::PoolClosed);
        }
        if self.num_open.load(Ordering::Acquire) >= self.config.max_conns {
            return Ok(false);
        }
        self.num_open.fetch_add(1, Ordering::AcqRel);
        Ok(true)
    }

    fn release_slot(&self) {
        let _state = self.state.lock();
        self.num_open.fetch_sub(1, Ordering::AcqRel);
    }

    fn put(self: &Arc<Self>, mut conn: C) {
        conn.mark_returned(Instant::now());

        let mut state = self.state.lock();
        let idle_full = self.config.max_idle > 0 && self.idle_rx.len() >= self.config.max_idle;
        let over_cap = self.num_open.load(Ordering::Acquire) > self.config.max_conns;
        if state.closed || over_cap || idle_full {
            if idle_full && !state.closed {
                state.max_idle_closed += 1;
            }
            self.num_open.fetch_sub(1, Ordering::AcqRel);
            drop(state);
            conn.close();
            return;
        }

        match self.idle_tx.try_send(conn) {
            Ok(()) => self.start_cleaner_locked(&mut state),
            Err(err) => {
                self.num_open.fetch_sub(1, Ordering::AcqRel);
                drop(state);
                err.into_inner().close();
            }
        }
    }

    fn discard(&self, mut conn: C) {
        conn.close();
        self.release_slot();
    }

    fn start_cleaner_locked(self: &Arc<Self>, state: &mut PoolState) {
        if state.cleaner.is_some() || self.num_open.load(Ordering::Acquire) == 0 {
            return;
        }
        let Some(interval) = self.config.clean_interval() else {
            return;
        };

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(0);
        let pool = Arc::downgrade(self);
        let spawned = std::thread::Builder::new()
            .name("mcache-pool-cleaner".into())
            .spawn(move || run_cleaner(pool, stop_rx, interval));
        match spawned {
            Ok(join) => {
                debug!(interval_ms = interval.as_millis() as u64, "pool cleaner started");
                state.cleaner = Some(Cleaner { stop: stop_tx, join });
            }
            Err(err) => warn!(error = %err, "failed to spawn pool cleaner"),
        }
    }

    /// One cleaner tick. Returns the next delay, or `None` to stop.
    fn clean(&self) -> Option<Duration> {
        let now = Instant::now();
        let mut state = self.state.lock();
        let interval = match self.config.clean_interval() {
            Some(interval) if !state.closed && self.num_open.load(Ordering::Acquire) > 0 => interval,
            _ => {
                // Detach; a later put starts a fresh cleaner.
                state.cleaner = None;
                debug!("pool cleaner stopped");
                return None;
            }
        };

        let idle_since = checked_since(now, self.config.max_idle_time);
        let life_since = checked_since(now, self.config.max_lifetime);
        let mut next = interval;
        let mut closing = Vec::new();
        let (mut idle_closed, mut life_closed) = (0u64, 0u64);

        for _ in 0..self.idle_rx.len() {
            let Ok(conn) = self.idle_rx.try_recv() else {
                break;
            };
            if let Some(since) = idle_since {
                let (left, expired) = conn.idle(since);
                if expired {
                    idle_closed += 1;
                    closing.push(conn);
                    continue;
                }
                next = next.min(left);
            }
            if let Some(since) = life_since {
                let (left, expired) = conn.expired(since);
                if expired {
                    life_closed += 1;
                    closing.push(conn);
                    continue;
                }
                next = next.min(left);
            }
            if let Err(err) = self.idle_tx.try_send(conn) {
                closing.push(err.into_inner());
            }
        }

        state.max_idle_time_closed += idle_closed;
        state.max_lifetime_closed += life_closed;
        drop(state);

        let count = closing.len();
        for mut conn in closing {
            conn.close();
        }
        if count > 0 {
            self.num_open.fetch_sub(count, Ordering::AcqRel);
            debug!(idle_closed, life_closed, "pool cleaner closed expired connections");
        }
        Some(next.max(MIN_CLEAN_INTERVAL))
    }
}

fn checked_since(now: Instant, limit: Duration) -> Option<Instant> {
    if limit.is_zero() {
        None
    } else {
        now.checked_sub(limit)
    }
}

fn run_cleaner<C: PoolConn>(pool: Weak<PoolShared<C>>, stop: Receiver<()>, mut delay: Duration) {
    loop {
        select! {
            recv(stop) -> _ => return,
            default(delay) => {}
        }
        let Some(shared) = pool.upgrade() else {
            return;
        };
        match shared.clean() {
            Some(next) => delay = next,
            None => return,
        }
    }
}

/// RAII guard for a checked-out connection.
///
/// Dropping it returns the connection to its pool unless it was invalidated,
/// in which case the connection is closed and its slot released.
pub struct PooledConn<C: PoolConn> {
    pool: Weak<PoolShared<C>>,
    conn: Option<C>,
    valid: bool,
}

impl<C: PoolConn> PooledConn<C> {
    pub fn get_mut(&mut self) -> McResult<&mut C> {
        self.conn.as_mut().ok_or(McError::ConnClosed)
    }

    /// Marks the connection as unusable; it is closed instead of pooled.
    pub fn invalidate(&mut self) {
        self.valid = false;
    }
}

impl<C: PoolConn> Drop for PooledConn<C> {
    fn drop(&mut self) {
        let Some(mut conn) = self.conn.take() else {
            return;
        };
        match self.pool.upgrade() {
            Some(shared) if self.valid => shared.put(conn),
            Some(shared) => shared.discard(conn),
            None => conn.close(),
        }
    }
}
