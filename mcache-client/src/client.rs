//! # Memcached Client
//!
//! Purpose: Expose a blocking, thread-safe API over a cluster of memcached
//! servers speaking the ASCII protocol (classic and meta).
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `Client` hides resolution, routing, pooling and
//!    framing behind one method per command.
//! 2. **Lazy Pools**: A `ConnPool` is created for an address the first time a
//!    request routes to it; entries never change afterwards.
//! 3. **Connection Hygiene**: Only protocol-status errors return a connection
//!    to its pool. Anything that may leave a reply half read discards it.
//! 4. **Explicit Fan-Out**: Cluster-wide commands run on scoped threads and
//!    report every failing node.
//!
//! ## Request Flow
//!
//! ```text
//! Client::set(ctx, key, ..)
//!   ├── storage_command()        -> (Request, Response)
//!   ├── picker.pick(cmd, key)    -> Addr
//!   ├── pool(addr).get(ctx)      -> PooledConn<Connection>
//!   ├── conn.round_trip(..)      -> framed reply lines
//!   └── resp.expect("STORED")
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use ahash::RandomState;
use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use mcache_common::protocol::{DELETED, OK, STORED, TOUCHED};
use mcache_common::{
    arithmetic_command, delete_command, flush_all_command, meta_arithmetic_command, meta_delete_command,
    meta_get_command, meta_set_command, parse_arithmetic, parse_meta_item, parse_stats, parse_value_items,
    parse_version, retrieval_command, stats_command, storage_command, touch_command, version_command,
    ArithmeticCommand, Item, McError, McResult, MetaArithmeticFlags, MetaDeleteFlags, MetaGetFlags, MetaItem,
    MetaSetFlags, MultiError, Request, Response, RetrievalCommand, Statistic, StorageCommand,
};

use crate::addr::Addr;
use crate::config::ClientConfig;
use crate::conn::{Connection, IoTimeouts};
use crate::context::Context;
use crate::picker::{PickBuilder, Picker};
use crate::pool::{ConnPool, PoolStats};
use crate::resolver::{DefaultResolver, Resolver};

type PoolMap = HashMap<Addr, ConnPool<Connection>, RandomState>;

/// Memcached cluster client.
///
/// Every method takes a [`Context`] bounding the whole call. The client is
/// `Send + Sync` and meant to be shared.
pub struct Client {
    config: ClientConfig,
    addrs: Vec<Addr>,
    picker: Box<dyn Picker>,
    pools: Mutex<PoolMap>,
    closed: AtomicBool,
}

impl Client {
    /// Creates a client with default configuration.
    pub fn connect(addrs: &str) -> McResult<Self> {
        Self::new(addrs, ClientConfig::default())
    }

    /// Resolves `addrs` and prepares routing. No connection is opened yet.
    pub fn new(addrs: &str, config: ClientConfig) -> McResult<Self> {
        let config = config.normalized();
        let addrs = match &config.resolver {
            Some(resolver) => resolver.resolve(addrs)?,
            None => DefaultResolver::new(config.udp_enabled).resolve(addrs)?,
        };
        if addrs.is_empty() {
            return Err(McError::InvalidAddress("resolver returned no address".into()));
        }

        let picker = match &config.pick_builder {
            Some(builder) => builder.build(&addrs),
            None => config.pick_strategy.build(&addrs),
        };
        debug!(servers = addrs.len(), strategy = ?config.pick_strategy, "memcached client created");

        Ok(Client {
            config,
            addrs,
            picker,
            pools: Mutex::new(PoolMap::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn addrs(&self) -> &[Addr] {
        &self.addrs
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    // -- storage ------------------------------------------------------------

    /// Stores `value` under `key`. `expiry` is in seconds, 0 never expires.
    pub fn set(&self, ctx: &Context, key: &str, value: &[u8], flags: u32, expiry: u32) -> McResult<()> {
        self.store(ctx, StorageCommand::Set, key, value, flags, expiry)
    }

    /// Stores only if the key is absent.
    pub fn add(&self, ctx: &Context, key: &str, value: &[u8], flags: u32, expiry: u32) -> McResult<()> {
        self.store(ctx, StorageCommand::Add, key, value, flags, expiry)
    }

    /// Stores only if the key exists.
    pub fn replace(&self, ctx: &Context, key: &str, value: &[u8], flags: u32, expiry: u32) -> McResult<()> {
        self.store(ctx, StorageCommand::Replace, key, value, flags, expiry)
    }

    pub fn append(&self, ctx: &Context, key: &str, value: &[u8], flags: u32, expiry: u32) -> McResult<()> {
        self.store(ctx, StorageCommand::Append, key, value, flags, expiry)
    }

    pub fn prepend(&self, ctx: &Context, key: &str, value: &[u8], flags: u32, expiry: u32) -> McResult<()> {
        self.store(ctx, StorageCommand::Prepend, key, value, flags, expiry)
    }

    /// Check-and-set against the token returned by `gets`.
    ///
    /// A stale token fails with [`McError::Exists`].
    pub fn cas(&self, ctx: &Context, key: &str, value: &[u8], flags: u32, expiry: u32, cas: u64) -> McResult<()> {
        self.store(ctx, StorageCommand::Cas(cas), key, value, flags, expiry)
    }

    fn store(
        &self,
        ctx: &Context,
        cmd: StorageCommand,
        key: &str,
        value: &[u8],
        flags: u32,
        expiry: u32,
    ) -> McResult<()> {
        let (req, mut resp) = storage_command(cmd, key, value, flags, expiry as u64, self.config.no_reply)?;
        self.dispatch(ctx, &req, &mut resp)?;
        resp.expect(STORED)
    }

    // -- retrieval ----------------------------------------------------------

    /// Fetches one item; a miss is [`McError::NotFound`].
    pub fn get(&self, ctx: &Context, key: &str) -> McResult<Item> {
        first_item(self.retrieve(ctx, RetrievalCommand::Get, &[key])?)
    }

    /// Fetches items with their cas tokens.
    ///
    /// The request routes by the first key only, so keys stored on other
    /// servers are reported as missing.
    pub fn gets(&self, ctx: &Context, keys: &[&str]) -> McResult<Vec<Item>> {
        self.retrieve(ctx, RetrievalCommand::Gets, keys)
    }

    /// Get-and-touch: fetches `key` and resets its expiry.
    pub fn gat(&self, ctx: &Context, expiry: u32, key: &str) -> McResult<Item> {
        first_item(self.retrieve(ctx, RetrievalCommand::Gat(expiry as u64), &[key])?)
    }

    /// Multi-key get-and-touch with cas tokens. Routes like [`Client::gets`].
    pub fn gats(&self, ctx: &Context, expiry: u32, keys: &[&str]) -> McResult<Vec<Item>> {
        self.retrieve(ctx, RetrievalCommand::Gats(expiry as u64), keys)
    }

    fn retrieve(&self, ctx: &Context, cmd: RetrievalCommand, keys: &[&str]) -> McResult<Vec<Item>> {
        let (req, mut resp) = retrieval_command(cmd, keys)?;
        self.dispatch(ctx, &req, &mut resp)?;
        parse_value_items(resp.lines(), false, cmd.with_cas())
    }

    // -- other point commands -----------------------------------------------

    pub fn delete(&self, ctx: &Context, key: &str) -> McResult<()> {
        let (req, mut resp) = delete_command(key, self.config.no_reply)?;
        self.dispatch(ctx, &req, &mut resp)?;
        resp.expect(DELETED)
    }

    /// Resets the expiry of `key` without fetching it.
    pub fn touch(&self, ctx: &Context, key: &str, expiry: u32) -> McResult<()> {
        let (req, mut resp) = touch_command(key, expiry as u64, self.config.no_reply)?;
        self.dispatch(ctx, &req, &mut resp)?;
        resp.expect(TOUCHED)
    }

    /// Increments a counter. Returns 0 in no-reply mode.
    pub fn incr(&self, ctx: &Context, key: &str, delta: u64) -> McResult<u64> {
        self.arithmetic(ctx, ArithmeticCommand::Incr, key, delta)
    }

    /// Decrements a counter, saturating at 0. Returns 0 in no-reply mode.
    pub fn decr(&self, ctx: &Context, key: &str, delta: u64) -> McResult<u64> {
        self.arithmetic(ctx, ArithmeticCommand::Decr, key, delta)
    }

    fn arithmetic(&self, ctx: &Context, cmd: ArithmeticCommand, key: &str, delta: u64) -> McResult<u64> {
        let (req, mut resp) = arithmetic_command(cmd, key, delta, self.config.no_reply)?;
        self.dispatch(ctx, &req, &mut resp)?;
        parse_arithmetic(resp.lines())
    }

    /// `stats [group]` from the server the picker selects for an empty key.
    pub fn stats(&self, ctx: &Context, group: Option<&str>) -> McResult<Statistic> {
        let (req, mut resp) = stats_command(group)?;
        self.dispatch(ctx, &req, &mut resp)?;
        parse_stats(resp.lines())
    }

    // -- cluster commands ---------------------------------------------------

    /// Invalidates every item on every server.
    ///
    /// Fails with [`McError::Multi`] listing each node that did not reply `OK`.
    pub fn flush_all(&self, ctx: &Context) -> McResult<()> {
        let (req, resp) = flush_all_command(self.config.no_reply);
        let mut errors = MultiError::new();
        for (addr, result) in self.addrs.iter().zip(self.broadcast(ctx, &req, &resp)) {
            if let Err(err) = result.and_then(|resp| resp.expect(OK)) {
                warn!(addr = %addr, error = %err, "flush_all failed");
                errors.push(addr.to_string(), err);
            }
        }
        errors.into_result()
    }

    /// Asks every server for its version.
    ///
    /// Returns the first non-empty version, or [`McError::Multi`] when any
    /// node failed.
    pub fn version(&self, ctx: &Context) -> McResult<String> {
        let (req, resp) = version_command();
        let mut errors = MultiError::new();
        let mut version: Option<String> = None;
        for (addr, result) in self.addrs.iter().zip(self.broadcast(ctx, &req, &resp)) {
            match result.and_then(|resp| parse_version(resp.lines())) {
                Ok(v) => {
                    if version.is_none() && !v.is_empty() {
                        version = Some(v);
                    }
                }
                Err(err) => {
                    warn!(addr = %addr, error = %err, "version failed");
                    errors.push(addr.to_string(), err);
                }
            }
        }
        errors.into_result()?;
        Ok(version.unwrap_or_default())
    }

    // -- meta commands ------------------------------------------------------

    /// `ms`. With `no_reply` a successful store returns an empty item.
    pub fn meta_set(&self, ctx: &Context, key: &[u8], value: &[u8], flags: &MetaSetFlags) -> McResult<MetaItem> {
        let (req, resp) = meta_set_command(key, value, flags)?;
        self.meta(ctx, req, resp, flags.no_reply)
    }

    /// `mg`. A miss is [`McError::NotFound`].
    pub fn meta_get(&self, ctx: &Context, key: &[u8], flags: &MetaGetFlags) -> McResult<MetaItem> {
        let (req, resp) = meta_get_command(key, flags)?;
        self.meta(ctx, req, resp, flags.no_reply)
    }

    pub fn meta_delete(&self, ctx: &Context, key: &[u8], flags: &MetaDeleteFlags) -> McResult<MetaItem> {
        let (req, resp) = meta_delete_command(key, flags)?;
        self.meta(ctx, req, resp, flags.no_reply)
    }

    /// `ma`. With `v` the counter value is returned in `MetaItem::value`.
    pub fn meta_arithmetic(&self, ctx: &Context, key: &[u8], flags: &MetaArithmeticFlags) -> McResult<MetaItem> {
        let (req, resp) = meta_arithmetic_command(key, flags)?;
        self.meta(ctx, req, resp, flags.no_reply)
    }

    fn meta(&self, ctx: &Context, req: Request, mut resp: Response, no_reply: bool) -> McResult<MetaItem> {
        self.dispatch(ctx, &req, &mut resp)?;
        let mut item = MetaItem::default();
        parse_meta_item(resp.lines(), &mut item, no_reply)?;
        Ok(item)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Occupancy of every pool created so far.
    pub fn pool_stats(&self) -> Vec<(Addr, PoolStats)> {
        let pools = self.pools.lock();
        self.addrs
            .iter()
            .filter_map(|addr| pools.get(addr).map(|pool| (addr.clone(), pool.stats())))
            .collect()
    }

    /// Closes every pool; later calls fail with [`McError::PoolClosed`].
    ///
    /// Returns the first error encountered.
    pub fn close(&self) -> McResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let pools: Vec<ConnPool<Connection>> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        let mut first = None;
        for pool in pools {
            if let Err(err) = pool.close() {
                first.get_or_insert(err);
            }
        }
        debug!("memcached client closed");
        first.map_or(Ok(()), Err)
    }

    // -- dispatch -----------------------------------------------------------

    fn dispatch(&self, ctx: &Context, req: &Request, resp: &mut Response) -> McResult<()> {
        let addr = self.picker.pick(&self.addrs, req.cmd().as_bytes(), req.key())?;
        self.execute(ctx, addr, req, resp)
    }

    fn execute(&self, ctx: &Context, addr: &Addr, req: &Request, resp: &mut Response) -> McResult<()> {
        let pool = self.pool(addr)?;
        let mut conn = pool.get(ctx)?;
        let result = conn.get_mut()?.round_trip(ctx, req, resp, self.timeouts());
        if let Err(err) = &result {
            if !err.is_protocol_status() {
                debug!(addr = %addr, cmd = req.cmd(), error = %err, "discarding connection");
                conn.invalidate();
            }
        }
        result
    }

    /// Runs `req` on every server in parallel, results in address order.
    fn broadcast(&self, ctx: &Context, req: &Request, template: &Response) -> Vec<McResult<Response>> {
        std::thread::scope(|scope| {
            let workers: Vec<_> = self
                .addrs
                .iter()
                .map(|addr| {
                    scope.spawn(move || {
                        let mut resp = template.clone();
                        self.execute(ctx, addr, req, &mut resp).map(|()| resp)
                    })
                })
                .collect();
            workers
                .into_iter()
                .map(|worker| {
                    worker.join().unwrap_or_else(|_| {
                        Err(McError::Io(std::io::Error::other("broadcast worker panicked")))
                    })
                })
                .collect()
        })
    }

    fn pool(&self, addr: &Addr) -> McResult<ConnPool<Connection>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(McError::PoolClosed);
        }
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(addr) {
            return Ok(pool.clone());
        }
        // `close` flips the flag before draining, so a racing caller sees it here.
        if self.closed.load(Ordering::Acquire) {
            return Err(McError::PoolClosed);
        }

        let target = addr.clone();
        let dial_timeout = self.config.dial_timeout;
        let pool = ConnPool::new(
            self.config.pool_config(),
            Box::new(move |ctx: &Context| Connection::open(&target, dial_timeout, ctx)),
        );
        debug!(addr = %addr, max_conns = self.config.max_conns, "connection pool created");
        pools.insert(addr.clone(), pool.clone());
        Ok(pool)
    }

    fn timeouts(&self) -> IoTimeouts {
        IoTimeouts {
            read: self.config.read_timeout,
            write: self.config.write_timeout,
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "closing memcached client failed");
        }
    }
}

fn first_item(items: Vec<Item>) -> McResult<Item> {
    items.into_iter().next().ok_or(McError::NotFound)
}
