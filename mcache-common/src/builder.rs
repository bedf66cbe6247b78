//! # Protocol Builder
//!
//! Purpose: Assemble space-separated text protocol lines into a single
//! contiguous buffer that is written to the socket in one call.
//!
//! ## Design Principles
//!
//! 1. **Chaining**: Every `add_*` returns `&mut Self`.
//! 2. **Token Separation**: Each token is followed by one space; `add_crlf`
//!    swallows the trailing space before terminating the line.
//! 3. **Terminal CRLF**: `build` always returns a buffer ending in `\r\n`.
//! 4. **Allocation-Free Numbers**: Integers are formatted on a stack buffer.

use bytes::{BufMut, Bytes, BytesMut};

const CRLF: &[u8] = b"\r\n";

/// Line builder for text protocol requests.
#[derive(Debug, Default)]
pub struct ProtocolBuilder {
    buf: BytesMut,
}

impl ProtocolBuilder {
    pub fn new() -> Self {
        ProtocolBuilder::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        ProtocolBuilder {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn add_string(&mut self, token: &str) -> &mut Self {
        self.add_bytes(token.as_bytes())
    }

    pub fn add_bytes(&mut self, token: &[u8]) -> &mut Self {
        self.buf.put_slice(token);
        self.buf.put_u8(b' ');
        self
    }

    pub fn add_int(&mut self, value: i64) -> &mut Self {
        if value < 0 {
            self.buf.put_u8(b'-');
        }
        self.push_u64(value.unsigned_abs());
        self.buf.put_u8(b' ');
        self
    }

    pub fn add_uint(&mut self, value: u64) -> &mut Self {
        self.push_u64(value);
        self.buf.put_u8(b' ');
        self
    }

    /// Emits the bare flag letter when `on` is true.
    pub fn add_flag_bool(&mut self, flag: u8, on: bool) -> &mut Self {
        if on {
            self.buf.put_u8(flag);
            self.buf.put_u8(b' ');
        }
        self
    }

    /// Emits `<flag><value>`; zero emits nothing.
    pub fn add_flag_uint(&mut self, flag: u8, value: u64) -> &mut Self {
        if value != 0 {
            self.buf.put_u8(flag);
            self.push_u64(value);
            self.buf.put_u8(b' ');
        }
        self
    }

    /// Emits `<flag><token>`; an empty token emits nothing.
    pub fn add_flag_string(&mut self, flag: u8, token: &str) -> &mut Self {
        if !token.is_empty() {
            self.buf.put_u8(flag);
            self.buf.put_slice(token.as_bytes());
            self.buf.put_u8(b' ');
        }
        self
    }

    pub fn add_crlf(&mut self) -> &mut Self {
        self.trim_space();
        self.buf.put_slice(CRLF);
        self
    }

    /// Appends a data block verbatim followed by CRLF.
    ///
    /// Data blocks are length-delimited, so no separator is added or trimmed.
    pub fn add_data_block(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self.buf.put_slice(CRLF);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn build(mut self) -> Bytes {
        if !self.buf.ends_with(CRLF) {
            self.add_crlf();
        }
        self.buf.freeze()
    }

    fn trim_space(&mut self) {
        if self.buf.last() == Some(&b' ') {
            self.buf.truncate(self.buf.len() - 1);
        }
    }

    fn push_u64(&mut self, mut value: u64) {
        let mut digits = [0u8; 20];
        let mut len = 0;
        if value == 0 {
            self.buf.put_u8(b'0');
            return;
        }
        while value > 0 {
            digits[len] = b'0' + (value % 10) as u8;
            value /= 10;
            len += 1;
        }
        digits[..len].reverse();
        self.buf.put_slice(&digits[..len]);
    }
}
