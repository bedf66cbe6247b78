//! # Error Taxonomy
//!
//! Purpose: One error type shared by the codec and the client so every call
//! surfaces a single value drawn from a fixed set of kinds.
//!
//! ## Design Principles
//!
//! 1. **Kinds, Not Layers**: Protocol-status, malformed, transport, context and
//!    validation failures all live in `McError`.
//! 2. **Connection Hygiene**: `is_protocol_status` tells the dispatcher whether a
//!    connection is still positioned on a reply boundary.
//! 3. **Aggregation**: Broadcast failures are collected into `MultiError`.

use std::fmt;

use thiserror::Error;

/// Result alias used across the workspace.
pub type McResult<T> = Result<T, McError>;

/// Every failure a memcached call can report.
#[derive(Debug, Error)]
pub enum McError {
    /// `ERROR`: the server does not know the command.
    #[error("nonexistent command")]
    NonexistentCommand,
    /// `CLIENT_ERROR <msg>`.
    #[error("client error: {0}")]
    ClientError(String),
    /// `SERVER_ERROR <msg>`.
    #[error("server error: {0}")]
    ServerError(String),
    /// `NOT_FOUND`, or meta `NF` / `EN`.
    #[error("not found")]
    NotFound,
    /// `EXISTS`, or meta `EX`.
    #[error("exists")]
    Exists,
    /// `NOT_STORED`, or meta `NS`.
    #[error("not stored")]
    NotStored,
    #[error("authentication is not supported")]
    AuthenticationUnsupported,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("not supported: {0}")]
    NotSupported(String),
    /// The reply deviated from the grammar of the command.
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("unknown response indicator")]
    UnknownIndicator,
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("invalid key: empty, too long (over 65535 bytes) or contains whitespace/control bytes")]
    InvalidKey,
    #[error("invalid value: larger than 2^32-1 bytes")]
    InvalidValue,
    #[error("invalid binary protocol")]
    InvalidBinaryProtocol,
    /// Socket level failure while dialing, reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection is closed")]
    ConnClosed,
    #[error("connection pool is closed")]
    PoolClosed,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
    #[error("context canceled")]
    Canceled,
    /// Per-node failures of a broadcast command.
    #[error(transparent)]
    Multi(MultiError),
}

impl McError {
    /// Returns true for errors mapped from a well-formed server status line.
    ///
    /// After such an error the connection sits on a reply boundary and may be
    /// reused.
    pub fn is_protocol_status(&self) -> bool {
        matches!(
            self,
            McError::NonexistentCommand
                | McError::ClientError(_)
                | McError::ServerError(_)
                | McError::NotFound
                | McError::Exists
                | McError::NotStored
        )
    }

    /// Returns true for deadline and cancellation errors.
    pub fn is_context(&self) -> bool {
        matches!(self, McError::DeadlineExceeded | McError::Canceled)
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        McError::MalformedResponse(msg.into())
    }
}

/// A failure reported by one node of a broadcast.
#[derive(Debug)]
pub struct NodeError {
    /// Display form of the node address.
    pub addr: String,
    pub error: McError,
}

/// Aggregated per-node failures, kept in address order.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<NodeError>,
}

impl MultiError {
    pub fn new() -> Self {
        MultiError::default()
    }

    pub fn push(&mut self, addr: impl Into<String>, error: McError) {
        self.errors.push(NodeError {
            addr: addr.into(),
            error,
        });
    }

    pub fn errors(&self) -> &[NodeError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Converts into `Err(McError::Multi)` when at least one node failed.
    pub fn into_result(self) -> McResult<()> {
        if self.errors.is_empty() {
            Ok(())
        } else {
            Err(McError::Multi(self))
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.errors.len())?;
        for node in &self.errors {
            write!(f, "\n\t* {}: {}", node.addr, node.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}
