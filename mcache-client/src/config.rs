//! # Client Configuration
//!
//! Purpose: One plain struct with every tunable of the client, loadable from
//! any serde format.
//!
//! ## Design Principles
//! 1. **Defaults First**: `Default` carries the production defaults and
//!    `#[serde(default)]` fills whatever a document leaves out.
//! 2. **Strategies Out of Band**: Resolver and picker overrides are trait
//!    objects and never serialized; `pick_strategy` covers the built-ins.
//! 3. **Durations as Milliseconds**: Timeouts serialize as integers, zero
//!    meaning unbounded.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::picker::{PickBuilder, PickStrategy};
use crate::pool::PoolConfig;
use crate::resolver::Resolver;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_MAX_CONNS: usize = 100;
pub const DEFAULT_MAX_IDLE_CONNS: usize = 10;

/// Client options.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Overrides address parsing.
    #[serde(skip)]
    pub resolver: Option<Arc<dyn Resolver>>,
    /// Overrides `pick_strategy` when set.
    #[serde(skip)]
    pub pick_builder: Option<Arc<dyn PickBuilder>>,
    pub pick_strategy: PickStrategy,
    #[serde(with = "duration_ms")]
    pub dial_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub read_timeout: Duration,
    #[serde(with = "duration_ms")]
    pub write_timeout: Duration,
    /// Per server.
    pub max_conns: usize,
    /// Per server.
    pub max_idle_conns: usize,
    #[serde(with = "duration_ms")]
    pub max_lifetime: Duration,
    #[serde(with = "duration_ms")]
    pub max_idle_timeout: Duration,
    /// Sends `noreply` on classic mutations.
    pub no_reply: bool,
    /// Accepts `udp://` addresses.
    pub udp_enabled: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            resolver: None,
            pick_builder: None,
            pick_strategy: PickStrategy::default(),
            dial_timeout: DEFAULT_TIMEOUT,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            max_conns: DEFAULT_MAX_CONNS,
            max_idle_conns: DEFAULT_MAX_IDLE_CONNS,
            max_lifetime: Duration::ZERO,
            max_idle_timeout: Duration::ZERO,
            no_reply: false,
            udp_enabled: false,
        }
    }
}

impl ClientConfig {
    /// Replaces zero connection limits with the defaults.
    pub fn normalized(mut self) -> Self {
        if self.max_conns == 0 {
            self.max_conns = DEFAULT_MAX_CONNS;
        }
        if self.max_idle_conns == 0 {
            self.max_idle_conns = DEFAULT_MAX_IDLE_CONNS;
        }
        self
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_conns: self.max_conns,
            max_idle: self.max_idle_conns,
            max_lifetime: self.max_lifetime,
            max_idle_time: self.max_idle_timeout,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("resolver", &self.resolver)
            .field("pick_builder", &self.pick_builder)
            .field("pick_strategy", &self.pick_strategy)
            .field("dial_timeout", &self.dial_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("max_conns", &self.max_conns)
            .field("max_idle_conns", &self.max_idle_conns)
            .field("max_lifetime", &self.max_lifetime)
            .field("max_idle_timeout", &self.max_idle_timeout)
            .field("no_reply", &self.no_reply)
            .field("udp_enabled", &self.udp_enabled)
            .finish()
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
