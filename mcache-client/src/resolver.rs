//! # Address Resolution
//!
//! Purpose: Turn a user supplied address list into ordered `Addr`s.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `Resolver` is a small trait so deployments can
//!    plug in service discovery; `DefaultResolver` parses literal strings.
//! 2. **Validate Early**: Malformed entries fail construction instead of the
//!    first request.
//! 3. **No Lookups**: Hostnames are checked syntactically and resolved at dial.
//!
//! ## Grammar
//!
//! ```text
//! address-list := entry ("," entry)*
//! entry        := ["udp://" | "unix://"] host-spec
//! host-spec    := host ":" port | "[" ipv6 "]" ":" port | "/" path
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv6Addr};

use mcache_common::{McError, McResult};

use crate::addr::{Addr, Network};

const UDP_SCHEME: &str = "udp://";
const UNIX_SCHEME: &str = "unix://";

/// Parses an address string into the cluster's `Addr` list.
pub trait Resolver: Send + Sync + fmt::Debug {
    fn resolve(&self, addrs: &str) -> McResult<Vec<Addr>>;
}

/// Literal `host:port` / `udp://` / `unix://` parser.
///
/// Priorities follow input order.
#[derive(Debug, Clone, Default)]
pub struct DefaultResolver {
    udp_enabled: bool,
}

impl DefaultResolver {
    pub fn new(udp_enabled: bool) -> Self {
        DefaultResolver { udp_enabled }
    }
}

impl Resolver for DefaultResolver {
    fn resolve(&self, addrs: &str) -> McResult<Vec<Addr>> {
        if addrs.trim().is_empty() {
            return Err(McError::InvalidAddress("empty address".into()));
        }

        let mut resolved = Vec::new();
        for entry in addrs.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let priority = resolved.len() as u32;
            resolved.push(self.parse_entry(entry, priority)?);
        }

        if resolved.is_empty() {
            return Err(McError::InvalidAddress(format!("no valid address in {addrs:?}")));
        }
        Ok(resolved)
    }
}

impl DefaultResolver {
    fn parse_entry(&self, entry: &str, priority: u32) -> McResult<Addr> {
        if let Some(path) = entry.strip_prefix(UNIX_SCHEME) {
            if !path.starts_with('/') || path.len() < 2 {
                return Err(McError::InvalidAddress(format!("unix socket path must be absolute: {entry}")));
            }
            return Ok(Addr::new(Network::Unix, path, priority));
        }

        if let Some(rest) = entry.strip_prefix(UDP_SCHEME) {
            if !self.udp_enabled {
                return Err(McError::InvalidAddress(format!("udp is not enabled: {entry}")));
            }
            validate_host_port(rest)?;
            return Ok(Addr::new(Network::Udp, rest, priority));
        }

        if entry.contains("://") {
            return Err(McError::InvalidAddress(format!("unsupported scheme: {entry}")));
        }
        validate_host_port(entry)?;
        Ok(Addr::new(Network::Tcp, entry, priority))
    }
}

fn validate_host_port(host_port: &str) -> McResult<()> {
    let invalid = || McError::InvalidAddress(format!("expected host:port, got {host_port:?}"));

    let (host, port) = host_port.rsplit_once(':').ok_or_else(invalid)?;
    if port.is_empty() || port.parse::<u16>().is_err() {
        return Err(invalid());
    }

    if let Some(inner) = host.strip_prefix('[') {
        let inner = inner.strip_suffix(']').ok_or_else(invalid)?;
        return inner.parse::<Ipv6Addr>().map(|_| ()).map_err(|_| invalid());
    }
    if host.is_empty() || host.contains(':') {
        return Err(invalid());
    }
    if host.parse::<IpAddr>().is_ok() {
        return Ok(());
    }
    let hostname_ok = host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    });
    if hostname_ok {
        Ok(())
    } else {
        Err(invalid())
    }
}
