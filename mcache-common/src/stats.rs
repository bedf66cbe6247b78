//! # General-Purpose Statistics
//!
//! Decodes `STAT <name> <value>` lines of a plain `stats` reply into a typed
//! `Statistic`. Unknown names are ignored so newer servers stay readable;
//! values that fail to decode are logged and skipped.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{McError, McResult};
use crate::protocol::END;

macro_rules! statistic {
    ($($field:ident: $kind:ident),* $(,)?) => {
        /// Snapshot of a server's `stats` output.
        #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
        #[serde(default)]
        pub struct Statistic {
            $(pub $field: statistic!(@ty $kind),)*
        }

        impl Statistic {
            /// Stores one value; returns `Ok(false)` for names this struct does not know.
            fn apply(&mut self, name: &str, value: &str) -> Result<bool, String> {
                match name {
                    $(stringify!($field) => {
                        self.$field = statistic!(@parse $kind, value)?;
                        Ok(true)
                    })*
                    _ => Ok(false),
                }
            }
        }
    };
    (@ty int) => { i64 };
    (@ty float) => { f64 };
    (@ty flag) => { bool };
    (@ty text) => { String };
    (@parse int, $v:expr) => { $v.parse::<i64>().map_err(|e| e.to_string()) };
    (@parse float, $v:expr) => { $v.parse::<f64>().map_err(|e| e.to_string()) };
    (@parse flag, $v:expr) => { parse_flag($v) };
    (@parse text, $v:expr) => { Ok::<String, String>($v.to_string()) };
}

statistic! {
    pid: int,
    uptime: int,
    time: int,
    version: text,
    libevent: text,
    pointer_size: int,
    rusage_user: float,
    rusage_system: float,
    max_connections: int,
    curr_connections: int,
    total_connections: int,
    rejected_connections: int,
    connection_structures: int,
    response_obj_oom: int,
    response_obj_count: int,
    response_obj_bytes: int,
    read_buf_count: int,
    read_buf_bytes: int,
    read_buf_bytes_free: int,
    read_buf_oom: int,
    reserved_fds: int,
    cmd_get: int,
    cmd_set: int,
    cmd_flush: int,
    cmd_touch: int,
    cmd_meta: int,
    get_hits: int,
    get_misses: int,
    get_expired: int,
    get_flushed: int,
    delete_misses: int,
    delete_hits: int,
    incr_misses: int,
    incr_hits: int,
    decr_misses: int,
    decr_hits: int,
    cas_misses: int,
    cas_hits: int,
    cas_badval: int,
    touch_hits: int,
    touch_misses: int,
    store_too_large: int,
    store_no_memory: int,
    auth_cmds: int,
    auth_errors: int,
    bytes_read: int,
    bytes_written: int,
    limit_maxbytes: int,
    accepting_conns: flag,
    listen_disabled_num: int,
    time_in_listen_disabled_us: int,
    threads: int,
    conn_yields: int,
    hash_power_level: int,
    hash_bytes: int,
    hash_is_expanding: flag,
    slab_reassign_rescues: int,
    slab_reassign_chunk_rescues: int,
    slab_reassign_evictions_nomem: int,
    slab_reassign_inline_reclaim: int,
    slab_reassign_busy_items: int,
    slab_reassign_busy_deletes: int,
    slab_reassign_running: int,
    slabs_moved: int,
    lru_crawler_running: int,
    lru_crawler_starts: int,
    lru_maintainer_juggles: int,
    malloc_fails: int,
    log_worker_dropped: int,
    log_worker_written: int,
    log_watcher_skipped: int,
    log_watcher_sent: int,
    log_watchers: int,
    unexpected_napi_ids: int,
    round_robin_fallback: int,
    bytes: int,
    curr_items: int,
    total_items: int,
    slab_global_page_pool: int,
    expired_unfetched: int,
    evicted_unfetched: int,
    evicted_active: int,
    evictions: int,
    reclaimed: int,
    crawler_reclaimed: int,
    crawler_items_checked: int,
    lrutail_reflocked: int,
    moves_to_cold: int,
    moves_to_warm: int,
    moves_within_lru: int,
    direct_reclaims: int,
    lru_bumps_dropped: int,
}

fn parse_flag(value: &str) -> Result<bool, String> {
    match value {
        "1" | "yes" | "true" => Ok(true),
        "0" | "no" | "false" => Ok(false),
        other => Err(format!("not a boolean: {other}")),
    }
}

/// Parses the lines of a `stats` reply, with or without the `END` line.
pub fn parse_stats(lines: &[Bytes]) -> McResult<Statistic> {
    let mut stats = Statistic::default();
    for line in lines {
        let line = line.as_ref();
        if line == END {
            break;
        }
        let text = std::str::from_utf8(line).map_err(|_| McError::malformed("stats line is not utf-8"))?;
        let mut parts = text.splitn(3, ' ');
        let (Some("STAT"), Some(name), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(McError::malformed(format!("unexpected stats line {text:?}")));
        };
        if let Err(error) = stats.apply(name, value.trim()) {
            warn!(stat = name, value, %error, "skipping undecodable stat");
        }
    }
    Ok(stats)
}
