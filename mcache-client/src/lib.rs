//! # Memcached Cluster Client
//!
//! Purpose: A synchronous memcached client speaking the ASCII protocol
//! (classic and meta) to a cluster of servers, with per-server connection
//! pools and pluggable key routing.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Connections are reused per server and retired
//!    by a background cleaner.
//! 2. **Strategy Pattern**: Address resolution and server picking are traits
//!    with built-in implementations.
//! 3. **Context Everywhere**: Every call carries a deadline and cancellation
//!    scope that bounds pool waits, dials and socket I/O.
//! 4. **Protocol Clarity**: Wire encoding and framing live in
//!    `mcache-common` and are re-exported here.
//!
//! ```no_run
//! use mcache_client::{Client, Context};
//!
//! let client = Client::connect("127.0.0.1:11211,127.0.0.1:11212")?;
//! let ctx = Context::background().with_timeout(std::time::Duration::from_secs(1));
//! client.set(&ctx, "greeting", b"hello", 0, 60)?;
//! let item = client.get(&ctx, "greeting")?;
//! assert_eq!(item.value.as_ref(), b"hello");
//! # Ok::<(), mcache_client::McError>(())
//! ```

mod addr;
mod client;
mod config;
mod conn;
mod context;
mod hash;
mod picker;
mod pool;
mod resolver;

pub use addr::{Addr, Network};
pub use client::Client;
pub use config::ClientConfig;
pub use conn::{Connection, IoTimeouts};
pub use context::{CancelHandle, Context};
pub use hash::{crc32, murmur3};
pub use picker::{Crc32Picker, Murmur3Picker, PickBuilder, PickStrategy, Picker, RandomPicker, RendezvousPicker};
pub use pool::{ConnPool, CreateFn, PoolConfig, PoolConn, PoolStats, PooledConn};
pub use resolver::{DefaultResolver, Resolver};

pub use mcache_common::{
    Item, McError, McResult, MetaArithmeticFlags, MetaArithmeticMode, MetaDeleteFlags, MetaGetFlags, MetaItem,
    MetaSetFlags, MetaSetMode, MultiError, NodeError, Statistic,
};
