//! # Server Pickers
//!
//! Purpose: Route each `(command, key)` to one server of the cluster.
//!
//! ## Design Principles
//! 1. **Strategy Pattern**: `Picker` routes, `PickBuilder` materializes a
//!    picker for an immutable address list.
//! 2. **Sum of Built-Ins**: `PickStrategy` enumerates random, CRC32,
//!    MurmurHash3 and rendezvous routing and is serde friendly for config.
//! 3. **Uniform Edge Cases**: Every picker rejects an empty list and returns
//!    the only address of a single-node list.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use mcache_common::{McError, McResult};

use crate::addr::Addr;
use crate::hash::{crc32, murmur3};

/// Selects the server for a request.
pub trait Picker: Send + Sync {
    fn pick<'a>(&self, addrs: &'a [Addr], cmd: &[u8], key: &[u8]) -> McResult<&'a Addr>;
}

/// Factory of pickers for a fixed address list.
pub trait PickBuilder: Send + Sync + fmt::Debug {
    fn build(&self, addrs: &[Addr]) -> Box<dyn Picker>;
}

/// Built-in routing strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PickStrategy {
    Random,
    #[default]
    Crc32,
    Murmur3 { seed: u64 },
    Rendezvous { seed: u64 },
}

impl PickBuilder for PickStrategy {
    fn build(&self, _addrs: &[Addr]) -> Box<dyn Picker> {
        match *self {
            PickStrategy::Random => Box::new(RandomPicker::new()),
            PickStrategy::Crc32 => Box::new(Crc32Picker),
            PickStrategy::Murmur3 { seed } => Box::new(Murmur3Picker::new(seed)),
            PickStrategy::Rendezvous { seed } => Box::new(RendezvousPicker::new(seed)),
        }
    }
}

/// Handles the empty and single-address cases shared by every picker.
fn trivial(addrs: &[Addr]) -> McResult<Option<&Addr>> {
    match addrs {
        [] => Err(McError::InvalidAddress("no server to pick from".into())),
        [only] => Ok(Some(only)),
        _ => Ok(None),
    }
}

/// Uniform choice, seeded from the wall clock.
pub struct RandomPicker {
    rng: Mutex<StdRng>,
}

impl RandomPicker {
    pub fn new() -> Self {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        RandomPicker {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for RandomPicker {
    fn default() -> Self {
        RandomPicker::new()
    }
}

impl Picker for RandomPicker {
    fn pick<'a>(&self, addrs: &'a [Addr], _cmd: &[u8], _key: &[u8]) -> McResult<&'a Addr> {
        if let Some(addr) = trivial(addrs)? {
            return Ok(addr);
        }
        let idx = self.rng.lock().gen_range(0..addrs.len());
        Ok(&addrs[idx])
    }
}

/// `addrs[crc32(key) % n]`
pub struct Crc32Picker;

impl Picker for Crc32Picker {
    fn pick<'a>(&self, addrs: &'a [Addr], _cmd: &[u8], key: &[u8]) -> McResult<&'a Addr> {
        if let Some(addr) = trivial(addrs)? {
            return Ok(addr);
        }
        Ok(&addrs[crc32(key) as usize % addrs.len()])
    }
}

/// `addrs[murmur3(key, seed) % n]`
pub struct Murmur3Picker {
    seed: u64,
}

impl Murmur3Picker {
    pub fn new(seed: u64) -> Self {
        Murmur3Picker { seed }
    }
}

impl Picker for Murmur3Picker {
    fn pick<'a>(&self, addrs: &'a [Addr], _cmd: &[u8], key: &[u8]) -> McResult<&'a Addr> {
        if let Some(addr) = trivial(addrs)? {
            return Ok(addr);
        }
        Ok(&addrs[(murmur3(key, self.seed) % addrs.len() as u64) as usize])
    }
}

/// Highest random weight: every address scores `murmur3(shortcut ++ key)`.
///
/// Removing a losing address never moves a key. Equal scores go to the
/// higher priority.
pub struct RendezvousPicker {
    seed: u64,
}

impl RendezvousPicker {
    pub fn new(seed: u64) -> Self {
        RendezvousPicker { seed }
    }

    fn score(&self, addr: &Addr, key: &[u8]) -> u64 {
        let mut input = addr.shortcut();
        input.extend_from_slice(key);
        murmur3(&input, self.seed)
    }
}

impl Picker for RendezvousPicker {
    fn pick<'a>(&self, addrs: &'a [Addr], _cmd: &[u8], key: &[u8]) -> McResult<&'a Addr> {
        if let Some(addr) = trivial(addrs)? {
            return Ok(addr);
        }

        let mut winner = &addrs[0];
        let mut highest = self.score(winner, key);
        for addr in &addrs[1..] {
            let score = self.score(addr, key);
            if score > highest || (score == highest && addr.priority() > winner.priority()) {
                highest = score;
                winner = addr;
            }
        }
        Ok(winner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::Network;

    fn cluster(n: u32) -> Vec<Addr> {
        (0..n)
            .map(|i| Addr::new(Network::Tcp, format!("127.0.0.1:{}", 11211 + i), i))
            .collect()
    }

    fn strategies() -> Vec<PickStrategy> {
        vec![
            PickStrategy::Random,
            PickStrategy::Crc32,
            PickStrategy::Murmur3 { seed: 0 },
            PickStrategy::Rendezvous { seed: 0 },
        ]
    }

    #[test]
    fn single_address_always_wins() {
        let addrs = cluster(1);
        for strategy in strategies() {
            let picker = strategy.build(&addrs);
            for key in ["", "a", "foo", "user:1001"] {
                assert_eq!(picker.pick(&addrs, b"get", key.as_bytes()).unwrap(), &addrs[0]);
            }
        }
    }

    #[test]
    fn empty_list_is_invalid() {
        for strategy in strategies() {
            let picker = strategy.build(&[]);
            assert!(matches!(picker.pick(&[], b"get", b"k"), Err(McError::InvalidAddress(_))));
        }
    }

    #[test]
    fn hash_pickers_are_deterministic() {
        let addrs = cluster(3);
        let crc = PickStrategy::Crc32.build(&addrs);
        let mm = PickStrategy::Murmur3 { seed: 0 }.build(&addrs);
        let hrw = PickStrategy::Rendezvous { seed: 0 }.build(&addrs);

        assert_eq!(crc.pick(&addrs, b"get", b"foo").unwrap(), &addrs[2]);
        assert_eq!(crc.pick(&addrs, b"get", b"baz").unwrap(), &addrs[0]);
        assert_eq!(mm.pick(&addrs, b"get", b"foo").unwrap(), &addrs[2]);
        assert_eq!(mm.pick(&addrs, b"get", b"baz").unwrap(), &addrs[0]);
        assert_eq!(hrw.pick(&addrs, b"get", b"foo").unwrap(), &addrs[0]);
        assert_eq!(hrw.pick(&addrs, b"get", b"baz").unwrap(), &addrs[1]);
        assert_eq!(hrw.pick(&addrs, b"get", b"user:1001").unwrap(), &addrs[2]);
    }

    #[test]
    fn rendezvous_winner_survives_losing_node_removal() {
        let addrs = cluster(5);
        let picker = PickStrategy::Rendezvous { seed: 7 }.build(&addrs);
        for i in 0..200 {
            let key = format!("key-{i}");
            let winner = picker.pick(&addrs, b"get", key.as_bytes()).unwrap().clone();
            for removed in addrs.iter().filter(|a| **a != winner) {
                let remaining: Vec<Addr> = addrs.iter().filter(|a| *a != removed).cloned().collect();
                assert_eq!(picker.pick(&remaining, b"get", key.as_bytes()).unwrap(), &winner);
            }
        }
    }

    #[test]
    fn rendezvous_equal_scores_go_to_higher_priority() {
        // Both render the shortcut "tcp-a11", so every key scores a tie.
        let low = Addr::new(Network::Tcp, "a1", 1);
        let high = Addr::new(Network::Tcp, "a", 11);
        assert_eq!(low.shortcut(), high.shortcut());

        let picker = RendezvousPicker::new(0);
        for addrs in [vec![low.clone(), high.clone()], vec![high.clone(), low.clone()]] {
            for key in ["foo", "bar", "user:1001"] {
                assert_eq!(picker.pick(&addrs, b"get", key.as_bytes()).unwrap(), &high);
            }
        }
    }

    #[test]
    fn random_picker_stays_in_range() {
        let addrs = cluster(4);
        let picker = RandomPicker::new();
        let mut seen = [false; 4];
        for _ in 0..400 {
            let addr = picker.pick(&addrs, b"get", b"k").unwrap();
            seen[addr.priority() as usize] = true;
        }
        assert!(seen.iter().all(|s| *s));
    }

    #[test]
    fn strategy_round_trips_through_json() {
        let json = serde_json::to_string(&PickStrategy::Rendezvous { seed: 3 }).unwrap();
        assert_eq!(json, r#"{"rendezvous":{"seed":3}}"#);
        let back: PickStrategy = serde_json::from_str(r#""crc32""#).unwrap();
        assert_eq!(back, PickStrategy::Crc32);
    }
}
