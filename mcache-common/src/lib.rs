//! # Memcached Protocol Codec
//!
//! Purpose: Shared types, errors and the ASCII protocol engine (classic and
//! meta) used by the memcached client.
//!
//! ## Design Principles
//! 1. **Codec Without Sockets**: Builders emit bytes and framing reads from any
//!    `BufRead`, so everything here is testable in memory.
//! 2. **Single Error Type**: `McError` carries the full taxonomy.
//! 3. **Zero-Copy Payloads**: Lines and values are `bytes::Bytes`.

pub mod builder;
pub mod error;
pub mod meta;
pub mod protocol;
pub mod stats;
pub mod types;

pub use builder::ProtocolBuilder;
pub use error::{McError, McResult, MultiError, NodeError};
pub use meta::{
    meta_arithmetic_command, meta_delete_command, meta_get_command, meta_set_command, parse_meta_item,
    MetaArithmeticFlags, MetaArithmeticMode, MetaDeleteFlags, MetaGetFlags, MetaSetFlags, MetaSetMode,
};
pub use protocol::{
    arithmetic_command, check_fault, delete_command, flush_all_command, parse_arithmetic, parse_value_items,
    parse_version, retrieval_command, stats_command, storage_command, touch_command, version_command,
    ArithmeticCommand, EndIndicator, Request, Response, RetrievalCommand, StorageCommand,
};
pub use stats::{parse_stats, Statistic};
pub use types::{validate_key, validate_value, Item, MetaItem, MAX_KEY_LEN, MAX_VALUE_LEN};
