//! # Server Addresses
//!
//! An `Addr` names one server endpoint. Equality and hashing cover network,
//! address and priority; metadata rides along and is ignored by both.

use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Transport of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Network {
    Tcp,
    Udp,
    Unix,
}

impl Network {
    pub fn as_str(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Udp => "udp",
            Network::Unix => "unix",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resolved server endpoint.
#[derive(Debug, Clone)]
pub struct Addr {
    network: Network,
    address: String,
    priority: u32,
    metadata: HashMap<String, serde_json::Value>,
}

impl Addr {
    pub fn new(network: Network, address: impl Into<String>, priority: u32) -> Self {
        Addr {
            network,
            address: address.into(),
            priority,
            metadata: HashMap::new(),
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// `host:port` for tcp/udp, the socket path for unix.
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.metadata.get(key)
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    /// Stable identity used as the rendezvous hashing prefix:
    /// `network-addresspriority`.
    pub fn shortcut(&self) -> Vec<u8> {
        format!("{}-{}{}", self.network, self.address, self.priority).into_bytes()
    }
}

impl PartialEq for Addr {
    fn eq(&self, other: &Self) -> bool {
        self.network == other.network && self.address == other.address && self.priority == other.priority
    }
}

impl Eq for Addr {}

impl Hash for Addr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.network.hash(state);
        self.address.hash(state);
        self.priority.hash(state);
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.network, self.address)
    }
}
