//! # Classic Text Protocol
//!
//! Purpose: Serialize classic memcached commands and frame their replies off
//! any buffered reader.
//!
//! ## Design Principles
//!
//! 1. **Request Declares Its Reply**: Every builder returns a `(Request,
//!    Response)` pair; the `EndIndicator` on the response decides how many
//!    lines to read.
//! 2. **Binary-Safe Blocks**: Data blocks announced by `VALUE`/`VA` headers are
//!    read by length, never by scanning for newlines.
//! 3. **Faults First**: Status lines such as `SERVER_ERROR` are mapped to
//!    `McError` before any per-command parsing.
//! 4. **Transport-Agnostic**: Framing only needs `std::io::BufRead`.
//!
//! ## Reply Shapes
//!
//! ```text
//! NoReply           nothing is read
//! LimitedLines(n)   one status line, plus the data block it announces (n <= 2)
//! SentinelLine(s)   lines and data blocks up to and including `s`;
//!                   with `MN` a status fault is held until the fence
//! ```

use std::io::{self, BufRead};

use bytes::Bytes;

use crate::builder::ProtocolBuilder;
use crate::error::{McError, McResult};
use crate::types::{validate_key, validate_value, Item, MAX_VALUE_LEN};

pub const END: &[u8] = b"END";
pub const STORED: &[u8] = b"STORED";
pub const DELETED: &[u8] = b"DELETED";
pub const TOUCHED: &[u8] = b"TOUCHED";
pub const OK: &[u8] = b"OK";
/// Reply to the `mn` no-op that fences quiet meta commands.
pub const MN: &[u8] = b"MN";

const VERSION_PREFIX: &[u8] = b"VERSION ";
const VALUE_PREFIX: &[u8] = b"VALUE ";

/// A fully serialized request.
#[derive(Debug, Clone)]
pub struct Request {
    cmd: &'static str,
    key: Bytes,
    raw: Bytes,
}

impl Request {
    pub fn new(cmd: &'static str, key: Bytes, raw: Bytes) -> Self {
        Request { cmd, key, raw }
    }

    pub fn cmd(&self) -> &'static str {
        self.cmd
    }

    /// Routing key; empty for keyless commands.
    pub fn key(&self) -> &[u8] {
        &self.key
    }

    /// Wire bytes, always CRLF terminated.
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }
}

/// How a reply is terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndIndicator {
    NoReply,
    LimitedLines(u8),
    SentinelLine(&'static [u8]),
}

/// Reply framing state: the indicator plus the lines read so far.
///
/// Lines are stored without their trailing CRLF.
#[derive(Debug, Clone)]
pub struct Response {
    indicator: EndIndicator,
    lines: Vec<Bytes>,
}

impl Response {
    pub fn new(indicator: EndIndicator) -> Self {
        Response {
            indicator,
            lines: Vec::new(),
        }
    }

    pub fn indicator(&self) -> EndIndicator {
        self.indicator
    }

    pub fn lines(&self) -> &[Bytes] {
        &self.lines
    }

    pub fn into_lines(self) -> Vec<Bytes> {
        self.lines
    }

    pub fn is_no_reply(&self) -> bool {
        self.indicator == EndIndicator::NoReply
    }

    /// Reads one complete reply according to the end indicator.
    pub fn recv<R: BufRead>(&mut self, reader: &mut R) -> McResult<()> {
        self.lines.clear();
        match self.indicator {
            EndIndicator::NoReply => Ok(()),
            EndIndicator::LimitedLines(n) => self.recv_limited(reader, n as usize),
            EndIndicator::SentinelLine(sentinel) => self.recv_until(reader, sentinel),
        }
    }

    /// Checks that the reply is exactly `expected`; no-reply requests pass.
    pub fn expect(&self, expected: &[u8]) -> McResult<()> {
        if self.is_no_reply() {
            return Ok(());
        }
        match self.lines.as_slice() {
            [line] if line.as_ref() == expected => Ok(()),
            [line] => Err(McError::malformed(format!(
                "unexpected response {:?}, want {:?}",
                String::from_utf8_lossy(line),
                String::from_utf8_lossy(expected)
            ))),
            lines => Err(McError::malformed(format!(
                "expected a single line, got {}",
                lines.len()
            ))),
        }
    }

    fn recv_limited<R: BufRead>(&mut self, reader: &mut R, limit: usize) -> McResult<()> {
        let first = read_line(reader)?;
        check_fault(&first)?;
        let block = announced_block_len(&first)?;
        self.lines.push(first);

        // A header without a block completes the reply; a block is drained
        // even when the limit is 1 so the stream stays aligned.
        if let Some(len) = block {
            if limit < 2 {
                tracing::debug!(len, "draining data block beyond the line limit");
            }
            self.lines.push(read_block(reader, len)?);
        }
        Ok(())
    }

    fn recv_until<R: BufRead>(&mut self, reader: &mut R, sentinel: &[u8]) -> McResult<()> {
        let mut fault = None;
        loop {
            let line = read_line(reader)?;
            if line.as_ref() == sentinel {
                self.lines.push(line);
                return fault.map_or(Ok(()), Err);
            }
            if let Err(err) = check_fault(&line) {
                // Behind an `mn` fence the stream continues until `MN`.
                if sentinel != MN {
                    return Err(err);
                }
                fault.get_or_insert(err);
                continue;
            }
            let block = announced_block_len(&line)?;
            self.lines.push(line);
            if let Some(len) = block {
                self.lines.push(read_block(reader, len)?);
            }
        }
    }
}

/// Maps a server status line to its error, if it is one.
pub fn check_fault(line: &[u8]) -> McResult<()> {
    let line = trim_ascii(line);
    if line == b"ERROR" {
        return Err(McError::NonexistentCommand);
    }
    if let Some(msg) = strip_status(line, b"CLIENT_ERROR") {
        return Err(McError::ClientError(msg));
    }
    if let Some(msg) = strip_status(line, b"SERVER_ERROR") {
        return Err(McError::ServerError(msg));
    }
    match line {
        b"NOT_FOUND" => return Err(McError::NotFound),
        b"EXISTS" => return Err(McError::Exists),
        b"NOT_STORED" => return Err(McError::NotStored),
        _ => {}
    }

    let code = line.split(|b| *b == b' ').next().unwrap_or_default();
    match code {
        b"NF" | b"EN" => Err(McError::NotFound),
        b"NS" => Err(McError::NotStored),
        b"EX" => Err(McError::Exists),
        _ => Ok(()),
    }
}

fn strip_status(line: &[u8], prefix: &[u8]) -> Option<String> {
    let rest = line.strip_prefix(prefix)?;
    if !rest.is_empty() && rest[0] != b' ' {
        return None;
    }
    Some(String::from_utf8_lossy(trim_ascii(rest)).into_owned())
}

/// Returns the length of the data block a header line announces.
fn announced_block_len(line: &[u8]) -> McResult<Option<usize>> {
    let token = if line.starts_with(VALUE_PREFIX) {
        // VALUE <key> <flags> <bytes> [cas]
        line.split(|b| *b == b' ').nth(3)
    } else if line.starts_with(b"VA ") {
        // VA <size> <flags>*
        line.split(|b| *b == b' ').nth(1)
    } else {
        return Ok(None);
    };
    let len = token
        .and_then(parse_decimal)
        .ok_or_else(|| McError::malformed("invalid data block length"))?;
    if len > MAX_VALUE_LEN {
        return Err(McError::malformed(format!("data block length {len} exceeds the value limit")));
    }
    usize::try_from(len)
        .map(Some)
        .map_err(|_| McError::malformed("data block length overflows"))
}

/// Reads one `\n` terminated line and trims the line ending.
fn read_line<R: BufRead>(reader: &mut R) -> McResult<Bytes> {
    let mut buf = Vec::with_capacity(64);
    let read = reader.read_until(b'\n', &mut buf)?;
    if read == 0 || buf.last() != Some(&b'\n') {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed mid-response").into());
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(Bytes::from(buf))
}

fn read_block<R: BufRead>(reader: &mut R, len: usize) -> McResult<Bytes> {
    let total = len
        .checked_add(2)
        .ok_or_else(|| McError::malformed("data block length overflows"))?;
    let mut data = vec![0u8; total];
    reader.read_exact(&mut data)?;
    if !data.ends_with(b"\r\n") {
        return Err(McError::malformed("data block length mismatch"));
    }
    data.truncate(len);
    Ok(Bytes::from(data))
}

pub(crate) fn parse_decimal(data: &[u8]) -> Option<u64> {
    if data.is_empty() {
        return None;
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as u64)?;
    }
    Some(value)
}

pub(crate) fn parse_signed(data: &[u8]) -> Option<i64> {
    match data.strip_prefix(b"-") {
        Some(rest) => parse_decimal(rest).and_then(|v| i64::try_from(v).ok()).map(|v| -v),
        None => parse_decimal(data).and_then(|v| i64::try_from(v).ok()),
    }
}

pub(crate) fn trim_ascii(mut data: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = data {
        if first.is_ascii_whitespace() {
            data = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = data {
        if last.is_ascii_whitespace() {
            data = rest;
        } else {
            break;
        }
    }
    data
}

// ---------------------------------------------------------------------------
// Command builders
// ---------------------------------------------------------------------------

/// Storage command verbs. `Cas` carries the compare token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageCommand {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas(u64),
}

impl StorageCommand {
    pub fn name(&self) -> &'static str {
        match self {
            StorageCommand::Set => "set",
            StorageCommand::Add => "add",
            StorageCommand::Replace => "replace",
            StorageCommand::Append => "append",
            StorageCommand::Prepend => "prepend",
            StorageCommand::Cas(_) => "cas",
        }
    }
}

/// `<cmd> <key> <flags> <exptime> <bytes> [cas] [noreply]\r\n<data>\r\n`
pub fn storage_command(
    cmd: StorageCommand,
    key: &str,
    value: &[u8],
    flags: u32,
    exptime: u64,
    no_reply: bool,
) -> McResult<(Request, Response)> {
    validate_key(key.as_bytes())?;
    validate_value(value)?;

    let mut b = ProtocolBuilder::with_capacity(key.len() + value.len() + 48);
    b.add_string(cmd.name())
        .add_string(key)
        .add_uint(flags as u64)
        .add_uint(exptime)
        .add_uint(value.len() as u64);
    if let StorageCommand::Cas(token) = cmd {
        b.add_uint(token);
    }
    if no_reply {
        b.add_string("noreply");
    }
    b.add_crlf().add_data_block(value);

    Ok((
        Request::new(cmd.name(), Bytes::copy_from_slice(key.as_bytes()), b.build()),
        Response::new(reply_indicator(no_reply)),
    ))
}

/// Retrieval verbs. `Gat`/`Gats` carry the new exptime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrievalCommand {
    Get,
    Gets,
    Gat(u64),
    Gats(u64),
}

impl RetrievalCommand {
    pub fn name(&self) -> &'static str {
        match self {
            RetrievalCommand::Get => "get",
            RetrievalCommand::Gets => "gets",
            RetrievalCommand::Gat(_) => "gat",
            RetrievalCommand::Gats(_) => "gats",
        }
    }

    pub fn with_cas(&self) -> bool {
        matches!(self, RetrievalCommand::Gets | RetrievalCommand::Gats(_))
    }
}

/// `get|gets <key>+` or `gat|gats <exptime> <key>+`.
///
/// The request routes by the first key.
pub fn retrieval_command(cmd: RetrievalCommand, keys: &[&str]) -> McResult<(Request, Response)> {
    let first = keys
        .first()
        .ok_or_else(|| McError::InvalidArgument("at least one key is required".into()))?;
    for key in keys {
        validate_key(key.as_bytes())?;
    }

    let mut b = ProtocolBuilder::new();
    b.add_string(cmd.name());
    if let RetrievalCommand::Gat(exptime) | RetrievalCommand::Gats(exptime) = cmd {
        b.add_uint(exptime);
    }
    for key in keys {
        b.add_string(key);
    }
    b.add_crlf();

    Ok((
        Request::new(cmd.name(), Bytes::copy_from_slice(first.as_bytes()), b.build()),
        Response::new(EndIndicator::SentinelLine(END)),
    ))
}

/// `delete <key> [noreply]`
pub fn delete_command(key: &str, no_reply: bool) -> McResult<(Request, Response)> {
    validate_key(key.as_bytes())?;
    let mut b = ProtocolBuilder::new();
    b.add_string("delete").add_string(key);
    if no_reply {
        b.add_string("noreply");
    }
    b.add_crlf();
    Ok((
        Request::new("delete", Bytes::copy_from_slice(key.as_bytes()), b.build()),
        Response::new(reply_indicator(no_reply)),
    ))
}

/// `touch <key> <exptime> [noreply]`
pub fn touch_command(key: &str, exptime: u64, no_reply: bool) -> McResult<(Request, Response)> {
    validate_key(key.as_bytes())?;
    let mut b = ProtocolBuilder::new();
    b.add_string("touch").add_string(key).add_uint(exptime);
    if no_reply {
        b.add_string("noreply");
    }
    b.add_crlf();
    Ok((
        Request::new("touch", Bytes::copy_from_slice(key.as_bytes()), b.build()),
        Response::new(reply_indicator(no_reply)),
    ))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithmeticCommand {
    Incr,
    Decr,
}

impl ArithmeticCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ArithmeticCommand::Incr => "incr",
            ArithmeticCommand::Decr => "decr",
        }
    }
}

/// `incr|decr <key> <delta> [noreply]`
pub fn arithmetic_command(
    cmd: ArithmeticCommand,
    key: &str,
    delta: u64,
    no_reply: bool,
) -> McResult<(Request, Response)> {
    validate_key(key.as_bytes())?;
    let mut b = ProtocolBuilder::new();
    b.add_string(cmd.name()).add_string(key).add_uint(delta);
    if no_reply {
        b.add_string("noreply");
    }
    b.add_crlf();
    Ok((
        Request::new(cmd.name(), Bytes::copy_from_slice(key.as_bytes()), b.build()),
        Response::new(reply_indicator(no_reply)),
    ))
}

/// `flush_all [noreply]`
pub fn flush_all_command(no_reply: bool) -> (Request, Response) {
    let mut b = ProtocolBuilder::new();
    b.add_string("flush_all");
    if no_reply {
        b.add_string("noreply");
    }
    b.add_crlf();
    (
        Request::new("flush_all", Bytes::new(), b.build()),
        Response::new(reply_indicator(no_reply)),
    )
}

/// `version`
pub fn version_command() -> (Request, Response) {
    (
        Request::new("version", Bytes::new(), Bytes::from_static(b"version\r\n")),
        Response::new(EndIndicator::LimitedLines(1)),
    )
}

/// `stats [group]`, terminated by `END`.
pub fn stats_command(group: Option<&str>) -> McResult<(Request, Response)> {
    let mut b = ProtocolBuilder::new();
    b.add_string("stats");
    if let Some(group) = group {
        validate_key(group.as_bytes()).map_err(|_| McError::InvalidArgument(format!("invalid stats group {group:?}")))?;
        b.add_string(group);
    }
    b.add_crlf();
    Ok((
        Request::new("stats", Bytes::new(), b.build()),
        Response::new(EndIndicator::SentinelLine(END)),
    ))
}

fn reply_indicator(no_reply: bool) -> EndIndicator {
    if no_reply {
        EndIndicator::NoReply
    } else {
        EndIndicator::LimitedLines(1)
    }
}

// ---------------------------------------------------------------------------
// Reply parsers
// ---------------------------------------------------------------------------

/// Parses `VALUE` / data pairs, optionally terminated by `END`.
///
/// Zero items is reported as `NotFound`.
pub fn parse_value_items(lines: &[Bytes], without_end_line: bool, with_cas: bool) -> McResult<Vec<Item>> {
    let body = if without_end_line {
        lines
    } else {
        match lines.split_last() {
            Some((last, rest)) if last.as_ref() == END => rest,
            _ => return Err(McError::malformed("missing END line")),
        }
    };
    if body.len() % 2 != 0 {
        return Err(McError::malformed("VALUE line without a data block"));
    }

    let mut items = Vec::with_capacity(body.len() / 2);
    for pair in body.chunks_exact(2) {
        let (mut item, len) = parse_value_line(&pair[0], with_cas)?;
        let data = &pair[1];
        if len != data.len() {
            return Err(McError::malformed(format!(
                "value length mismatch for {}: header {} bytes, got {}",
                item.key,
                len,
                data.len()
            )));
        }
        item.value = data.clone();
        items.push(item);
    }

    if items.is_empty() {
        return Err(McError::NotFound);
    }
    Ok(items)
}

/// Parses `VALUE <key> <flags> <bytes> [cas]` into an empty item and `<bytes>`.
fn parse_value_line(line: &[u8], with_cas: bool) -> McResult<(Item, usize)> {
    let rest = line
        .strip_prefix(VALUE_PREFIX)
        .ok_or_else(|| McError::malformed("expected VALUE line"))?;
    let fields: Vec<&[u8]> = rest.split(|b| *b == b' ').filter(|t| !t.is_empty()).collect();
    let max_fields = if with_cas { 4 } else { 3 };
    if fields.len() < 3 || fields.len() > max_fields {
        return Err(McError::malformed(format!(
            "VALUE line has {} fields",
            fields.len()
        )));
    }

    let key = std::str::from_utf8(fields[0])
        .map_err(|_| McError::malformed("key is not valid utf-8"))?
        .to_string();
    let flags = parse_decimal(fields[1])
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| McError::malformed("invalid flags"))?;
    let len = parse_decimal(fields[2])
        .and_then(|v| usize::try_from(v).ok())
        .ok_or_else(|| McError::malformed("invalid bytes"))?;
    let cas = match fields.get(3) {
        Some(token) => parse_decimal(token).ok_or_else(|| McError::malformed("invalid cas"))?,
        None => 0,
    };

    Ok((
        Item {
            key,
            value: Bytes::new(),
            flags,
            cas,
        },
        len,
    ))
}

/// Parses the reply of `incr`/`decr`. No-reply requests yield 0.
pub fn parse_arithmetic(lines: &[Bytes]) -> McResult<u64> {
    let Some(line) = lines.first() else {
        return Ok(0);
    };
    parse_decimal(trim_ascii(line)).ok_or_else(|| {
        McError::malformed(format!(
            "invalid counter value {:?}",
            String::from_utf8_lossy(line)
        ))
    })
}

/// Parses `VERSION <x>`.
pub fn parse_version(lines: &[Bytes]) -> McResult<String> {
    let line = lines.first().ok_or_else(|| McError::malformed("empty version reply"))?;
    let version = line
        .strip_prefix(VERSION_PREFIX)
        .ok_or_else(|| McError::malformed(format!("unexpected version reply {:?}", String::from_utf8_lossy(line))))?;
    Ok(String::from_utf8_lossy(trim_ascii(version)).into_owned())
}
