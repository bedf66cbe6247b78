//! # Meta Text Protocol
//!
//! Purpose: Build `ms`/`mg`/`md`/`ma` requests from typed flag records and
//! decode `HD`/`VA` replies into `MetaItem`.
//!
//! ## Design Principles
//!
//! 1. **Flag Records**: Each command takes a `Default`-able struct; callers
//!    override only what they need with struct update syntax.
//! 2. **Fixed Emission Order**: Tokens are written in a stable per-command
//!    order so the same flags always produce the same bytes.
//! 3. **Verbatim Keys**: With `b`, the key travels base64-encoded and the
//!    echoed `k` token is stored as received.
//! 4. **Fenced Quiet Mode**: `q` only hides the uninteresting replies, so a
//!    quiet command is followed by `mn` and its reply is read up to `MN`.
//!
//! ## Emission Order
//!
//! ```text
//! ms <key> <datalen> b c C E F I k O q s T M N
//! mg <key>           b c f h k l O q s t u v E N R T
//! md <key>           b C E I k O q T x
//! ma <key>           b C E N J D T M O q t c v k
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use bytes::Bytes;

use crate::builder::ProtocolBuilder;
use crate::error::{McError, McResult};
use crate::protocol::{parse_decimal, parse_signed, EndIndicator, Request, Response, MN};
use crate::types::{validate_binary_key, validate_key, validate_value, MetaItem};

/// `M` token of `ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaSetMode {
    Add,
    Append,
    Prepend,
    Replace,
    Set,
}

impl MetaSetMode {
    fn token(&self) -> &'static str {
        match self {
            MetaSetMode::Add => "E",
            MetaSetMode::Append => "A",
            MetaSetMode::Prepend => "P",
            MetaSetMode::Replace => "R",
            MetaSetMode::Set => "S",
        }
    }
}

/// `M` token of `ma`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetaArithmeticMode {
    Incr,
    Decr,
}

impl MetaArithmeticMode {
    fn token(&self) -> &'static str {
        match self {
            MetaArithmeticMode::Incr => "I",
            MetaArithmeticMode::Decr => "D",
        }
    }
}

/// Flags of `ms`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaSetFlags {
    /// `b`: base64-encode the key.
    pub binary_key: bool,
    /// `c`
    pub return_cas: bool,
    /// `C<n>`
    pub compare_cas: u64,
    /// `E<n>`
    pub new_cas: u64,
    /// `F<n>`
    pub client_flags: u32,
    /// `I`: invalidate, marking the item stale when the CAS is older.
    pub invalidate: bool,
    /// `k`
    pub return_key: bool,
    /// `O<n>`
    pub opaque: u64,
    /// `q`
    pub no_reply: bool,
    /// `s`
    pub return_size: bool,
    /// `T<n>`
    pub ttl: u64,
    /// `M<x>`
    pub mode: Option<MetaSetMode>,
    /// `N<n>`: auto-vivify on miss when appending.
    pub vivify_ttl: u64,
}

/// Flags of `mg`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaGetFlags {
    pub binary_key: bool,
    pub return_cas: bool,
    pub return_flags: bool,
    pub return_hit: bool,
    pub return_key: bool,
    pub return_last_access: bool,
    pub opaque: u64,
    pub no_reply: bool,
    pub return_size: bool,
    pub return_ttl: bool,
    /// `u`: do not bump the item in the LRU.
    pub no_lru_bump: bool,
    pub return_value: bool,
    pub new_cas: u64,
    pub vivify_ttl: u64,
    /// `R<n>`: win the recache when the remaining TTL drops below n.
    pub recache_ttl: u64,
    /// `T<n>`: update the TTL.
    pub ttl: u64,
}

/// Flags of `md`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaDeleteFlags {
    pub binary_key: bool,
    pub compare_cas: u64,
    pub new_cas: u64,
    pub invalidate: bool,
    pub return_key: bool,
    pub opaque: u64,
    pub no_reply: bool,
    /// `T<n>`: TTL applied when invalidating.
    pub ttl: u64,
    /// `x`: drop the value but keep the item.
    pub remove_value_only: bool,
}

/// Flags of `ma`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaArithmeticFlags {
    pub binary_key: bool,
    pub compare_cas: u64,
    pub new_cas: u64,
    /// `N<n>`: create the counter on miss with this TTL.
    pub vivify_ttl: u64,
    /// `J<n>`: initial value when vivifying.
    pub initial: u64,
    /// `D<n>`: delta, server default is 1.
    pub delta: u64,
    pub ttl: u64,
    pub mode: Option<MetaArithmeticMode>,
    pub opaque: u64,
    pub no_reply: bool,
    pub return_ttl: bool,
    pub return_cas: bool,
    pub return_value: bool,
    pub return_key: bool,
}

/// Validates the key and returns its wire form.
fn wire_key(key: &[u8], binary: bool) -> McResult<Bytes> {
    if binary {
        validate_binary_key(key)?;
        Ok(Bytes::from(STANDARD.encode(key)))
    } else {
        validate_key(key)?;
        Ok(Bytes::copy_from_slice(key))
    }
}

fn add_noop_fence(b: &mut ProtocolBuilder, no_reply: bool) {
    if no_reply {
        b.add_string("mn").add_crlf();
    }
}

fn reply_indicator(no_reply: bool, with_value: bool) -> EndIndicator {
    match (no_reply, with_value) {
        (true, _) => EndIndicator::SentinelLine(MN),
        (false, true) => EndIndicator::LimitedLines(2),
        (false, false) => EndIndicator::LimitedLines(1),
    }
}

/// `ms <key> <datalen> <flags>*\r\n<data>\r\n`
pub fn meta_set_command(key: &[u8], value: &[u8], flags: &MetaSetFlags) -> McResult<(Request, Response)> {
    let key = wire_key(key, flags.binary_key)?;
    validate_value(value)?;

    let mut b = ProtocolBuilder::with_capacity(key.len() + value.len() + 48);
    b.add_string("ms")
        .add_bytes(&key)
        .add_uint(value.len() as u64)
        .add_flag_bool(b'b', flags.binary_key)
        .add_flag_bool(b'c', flags.return_cas)
        .add_flag_uint(b'C', flags.compare_cas)
        .add_flag_uint(b'E', flags.new_cas)
        .add_flag_uint(b'F', flags.client_flags as u64)
        .add_flag_bool(b'I', flags.invalidate)
        .add_flag_bool(b'k', flags.return_key)
        .add_flag_uint(b'O', flags.opaque)
        .add_flag_bool(b'q', flags.no_reply)
        .add_flag_bool(b's', flags.return_size)
        .add_flag_uint(b'T', flags.ttl)
        .add_flag_string(b'M', flags.mode.map(|m| m.token()).unwrap_or_default())
        .add_flag_uint(b'N', flags.vivify_ttl)
        .add_crlf()
        .add_data_block(value);
    add_noop_fence(&mut b, flags.no_reply);

    Ok((
        Request::new("ms", key, b.build()),
        Response::new(reply_indicator(flags.no_reply, false)),
    ))
}

/// `mg <key> <flags>*`
pub fn meta_get_command(key: &[u8], flags: &MetaGetFlags) -> McResult<(Request, Response)> {
    let key = wire_key(key, flags.binary_key)?;

    let mut b = ProtocolBuilder::new();
    b.add_string("mg")
        .add_bytes(&key)
        .add_flag_bool(b'b', flags.binary_key)
        .add_flag_bool(b'c', flags.return_cas)
        .add_flag_bool(b'f', flags.return_flags)
        .add_flag_bool(b'h', flags.return_hit)
        .add_flag_bool(b'k', flags.return_key)
        .add_flag_bool(b'l', flags.return_last_access)
        .add_flag_uint(b'O', flags.opaque)
        .add_flag_bool(b'q', flags.no_reply)
        .add_flag_bool(b's', flags.return_size)
        .add_flag_bool(b't', flags.return_ttl)
        .add_flag_bool(b'u', flags.no_lru_bump)
        .add_flag_bool(b'v', flags.return_value)
        .add_flag_uint(b'E', flags.new_cas)
        .add_flag_uint(b'N', flags.vivify_ttl)
        .add_flag_uint(b'R', flags.recache_ttl)
        .add_flag_uint(b'T', flags.ttl)
        .add_crlf();
    add_noop_fence(&mut b, flags.no_reply);

    Ok((
        Request::new("mg", key, b.build()),
        Response::new(reply_indicator(flags.no_reply, flags.return_value)),
    ))
}

/// `md <key> <flags>*`
pub fn meta_delete_command(key: &[u8], flags: &MetaDeleteFlags) -> McResult<(Request, Response)> {
    let key = wire_key(key, flags.binary_key)?;

    let mut b = ProtocolBuilder::new();
    b.add_string("md")
        .add_bytes(&key)
        .add_flag_bool(b'b', flags.binary_key)
        .add_flag_uint(b'C', flags.compare_cas)
        .add_flag_uint(b'E', flags.new_cas)
        .add_flag_bool(b'I', flags.invalidate)
        .add_flag_bool(b'k', flags.return_key)
        .add_flag_uint(b'O', flags.opaque)
        .add_flag_bool(b'q', flags.no_reply)
        .add_flag_uint(b'T', flags.ttl)
        .add_flag_bool(b'x', flags.remove_value_only)
        .add_crlf();
    add_noop_fence(&mut b, flags.no_reply);

    Ok((
        Request::new("md", key, b.build()),
        Response::new(reply_indicator(flags.no_reply, false)),
    ))
}

/// `ma <key> <flags>*`
pub fn meta_arithmetic_command(key: &[u8], flags: &MetaArithmeticFlags) -> McResult<(Request, Response)> {
    let key = wire_key(key, flags.binary_key)?;

    let mut b = ProtocolBuilder::new();
    b.add_string("ma")
        .add_bytes(&key)
        .add_flag_bool(b'b', flags.binary_key)
        .add_flag_uint(b'C', flags.compare_cas)
        .add_flag_uint(b'E', flags.new_cas)
        .add_flag_uint(b'N', flags.vivify_ttl)
        .add_flag_uint(b'J', flags.initial)
        .add_flag_uint(b'D', flags.delta)
        .add_flag_uint(b'T', flags.ttl)
        .add_flag_string(b'M', flags.mode.map(|m| m.token()).unwrap_or_default())
        .add_flag_uint(b'O', flags.opaque)
        .add_flag_bool(b'q', flags.no_reply)
        .add_flag_bool(b't', flags.return_ttl)
        .add_flag_bool(b'c', flags.return_cas)
        .add_flag_bool(b'v', flags.return_value)
        .add_flag_bool(b'k', flags.return_key)
        .add_crlf();
    add_noop_fence(&mut b, flags.no_reply);

    Ok((
        Request::new("ma", key, b.build()),
        Response::new(reply_indicator(flags.no_reply, flags.return_value)),
    ))
}

/// Decodes a meta reply into `item`.
///
/// `NF`/`EN`/`NS`/`EX` map to their errors; any other code word than `HD`
/// or `VA` is malformed. With `no_reply` the trailing `MN` is dropped, and a
/// reply the server suppressed leaves the item untouched.
pub fn parse_meta_item(lines: &[Bytes], item: &mut MetaItem, no_reply: bool) -> McResult<()> {
    let lines = match lines.split_last() {
        Some((last, rest)) if no_reply && last.as_ref() == MN => rest,
        _ => lines,
    };
    if no_reply && lines.is_empty() {
        return Ok(());
    }
    let header = lines.first().ok_or_else(|| McError::malformed("empty meta reply"))?;
    let mut tokens = header.split(|b| *b == b' ').filter(|t| !t.is_empty());
    let code = tokens.next().unwrap_or_default();

    match code {
        b"HD" => apply_flag_tokens(tokens, item),
        b"VA" => {
            let size = tokens
                .next()
                .and_then(parse_decimal)
                .ok_or_else(|| McError::malformed("invalid VA size"))?;
            apply_flag_tokens(tokens, item)?;
            let data = lines
                .get(1)
                .ok_or_else(|| McError::malformed("VA without a data block"))?;
            if data.len() as u64 != size {
                return Err(McError::malformed(format!(
                    "VA announced {} bytes, got {}",
                    size,
                    data.len()
                )));
            }
            item.value = data.clone();
            Ok(())
        }
        b"NF" | b"EN" => Err(McError::NotFound),
        b"NS" => Err(McError::NotStored),
        b"EX" => Err(McError::Exists),
        other => Err(McError::malformed(format!(
            "unknown meta code {:?}",
            String::from_utf8_lossy(other)
        ))),
    }
}

fn apply_flag_tokens<'a>(tokens: impl Iterator<Item = &'a [u8]>, item: &mut MetaItem) -> McResult<()> {
    for token in tokens {
        let (flag, arg) = (token[0], &token[1..]);
        match flag {
            b'c' => item.cas = number(flag, arg)?,
            b'f' => {
                item.flags = u32::try_from(number(flag, arg)?)
                    .map_err(|_| McError::malformed("client flags overflow u32"))?
            }
            b's' => item.size = number(flag, arg)?,
            b'O' => item.opaque = number(flag, arg)?,
            b't' => item.ttl = signed(flag, arg)?,
            b'l' => item.last_accessed_time = signed(flag, arg)?,
            b'h' => item.hit_before = arg == b"1",
            b'k' => item.key = Bytes::copy_from_slice(arg),
            b'W' => item.won = true,
            b'X' => item.stale = true,
            b'Z' => item.win_sent = true,
            // b and anything newer than this client are ignored.
            _ => {}
        }
    }
    Ok(())
}

fn number(flag: u8, arg: &[u8]) -> McResult<u64> {
    parse_decimal(arg).ok_or_else(|| invalid_token(flag, arg))
}

fn signed(flag: u8, arg: &[u8]) -> McResult<i64> {
    parse_signed(arg).ok_or_else(|| invalid_token(flag, arg))
}

fn invalid_token(flag: u8, arg: &[u8]) -> McError {
    McError::malformed(format!(
        "invalid value for meta flag {}: {:?}",
        flag as char,
        String::from_utf8_lossy(arg)
    ))
}
