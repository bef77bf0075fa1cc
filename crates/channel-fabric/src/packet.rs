//! # Packet Codec
//!
//! A self-describing binary buffer with a leading flags byte and a typed cursor.
//!
//! ## Layout
//!
//! ```text
//! [flags: u8][field][field]...
//! ```
//!
//! Byte 0 carries feature bits. The low three bits belong to the codec itself
//! ([`PACKET_DEBUG`]); the upper five are used by the ack layer to describe the envelope.
//!
//! ## Modes
//!
//! A packet starts in write mode. [`Packet::make_readable`] switches it to read mode
//! exactly once. Writing a readable packet, or reading a writable one, is a programming
//! error and panics. Truncated or corrupted input is *not* a programming error: every
//! `read_*` returns a [`PacketError`] so a bad frame from the network only drops that
//! connection.
//!
//! ## Integers
//!
//! [`Packet::write_int`] picks the smallest width class per value: one width byte then
//! 1, 2, 4 or 8 little-endian bytes. Small values cost two bytes instead of five.
//!
//! ## Pooling
//!
//! [`Packet::pool`] hands the backing buffer back to a process-wide free list, and
//! [`Packet::create`] reuses one when available.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Mutex;

/// Codec bit: every field is preceded by a type tag, checked on read.
pub const PACKET_DEBUG: u8 = 1 << 0;

/// Bits of the flags byte owned by the codec.
pub const CODEC_FLAGS_MASK: u8 = 0b0000_0111;

const POOL_MAX_BUFFERS: usize = 64;
const POOL_MAX_CAPACITY: usize = 64 * 1024;

static POOL: Mutex<Vec<Vec<u8>>> = Mutex::new(Vec::new());

const TAG_BOOL: u8 = 1;
const TAG_U8: u8 = 2;
const TAG_INT: u8 = 3;
const TAG_FLOAT: u8 = 4;
const TAG_STRING: u8 = 5;
const TAG_ANSI: u8 = 6;
const TAG_JSON: u8 = 7;
const TAG_BUFFER: u8 = 8;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PacketError {
    #[error("Packet truncated: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },
    #[error("Empty packet")]
    Empty,
    #[error("Invalid integer width {0}")]
    BadIntWidth(u8),
    #[error("Invalid UTF-8 in string field")]
    InvalidUtf8,
    #[error("Invalid JSON field: {0}")]
    InvalidJson(String),
    #[error("Type tag mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: u8, found: u8 },
    #[error("Negative length {0}")]
    NegativeLength(i64),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    buf: Vec<u8>,
    pos: usize,
    readable: bool,
}

impl Packet {
    /// Starts a writable packet with the given codec/envelope flags.
    pub fn create(flags: u8, size_hint: usize) -> Self {
        let mut buf = POOL
            .lock()
            .ok()
            .and_then(|mut pool| pool.pop())
            .unwrap_or_default();
        buf.clear();
        buf.reserve(size_hint.max(1));
        buf.push(flags);
        Self {
            buf,
            pos: 0,
            readable: false,
        }
    }

    /// Wraps bytes received from a transport. The result is already readable.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, PacketError> {
        if buf.is_empty() {
            return Err(PacketError::Empty);
        }
        Ok(Self {
            buf,
            pos: 1,
            readable: true,
        })
    }

    /// Returns the backing buffer to the shared pool.
    pub fn pool(self) {
        let mut buf = self.buf;
        if buf.capacity() > POOL_MAX_CAPACITY {
            return;
        }
        buf.clear();
        if let Ok(mut pool) = POOL.lock() {
            if pool.len() < POOL_MAX_BUFFERS {
                pool.push(buf);
            }
        }
    }

    pub fn flags(&self) -> u8 {
        self.buf[0]
    }

    /// ORs bits into the flags byte.
    pub fn update_flags(&mut self, bits: u8) {
        self.buf[0] |= bits;
    }

    pub fn is_readable(&self) -> bool {
        self.readable
    }

    pub fn total_size(&self) -> usize {
        self.buf.len()
    }

    /// Full encoded form, flags byte included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    /// Unread bytes left in a readable packet.
    pub fn remaining(&self) -> usize {
        assert!(self.readable, "remaining() on a writable packet");
        self.buf.len() - self.pos
    }

    pub fn ended(&self) -> bool {
        self.remaining() == 0
    }

    pub fn make_readable(&mut self) {
        assert!(!self.readable, "make_readable() called twice");
        self.readable = true;
        self.pos = 1;
    }

    /// Concatenates `other`'s payload: the unread bytes of a readable packet, or
    /// everything after the flags byte of a writable one.
    pub fn append(&mut self, other: &Packet) {
        self.assert_writable();
        let start = if other.readable { other.pos } else { 1 };
        self.buf.extend_from_slice(&other.buf[start..]);
    }

    /// Splits off the unread remainder as its own readable packet.
    pub fn split_remaining(&mut self) -> Packet {
        assert!(self.readable, "split_remaining() on a writable packet");
        let mut buf = Vec::with_capacity(self.buf.len() - self.pos + 1);
        buf.push(self.flags() & CODEC_FLAGS_MASK);
        buf.extend_from_slice(&self.buf[self.pos..]);
        self.pos = self.buf.len();
        Packet {
            buf,
            pos: 1,
            readable: true,
        }
    }

    fn debug(&self) -> bool {
        self.flags() & PACKET_DEBUG != 0
    }

    fn assert_writable(&self) {
        assert!(!self.readable, "write to a readable packet");
    }

    fn tag(&mut self, tag: u8) {
        if self.debug() {
            self.buf.push(tag);
        }
    }

    pub fn write_bool(&mut self, v: bool) {
        self.assert_writable();
        self.tag(TAG_BOOL);
        self.buf.push(u8::from(v));
    }

    pub fn write_u8(&mut self, v: u8) {
        self.assert_writable();
        self.tag(TAG_U8);
        self.buf.push(v);
    }

    pub fn write_int(&mut self, v: i64) {
        self.assert_writable();
        self.tag(TAG_INT);
        self.write_packed(v);
    }

    fn write_packed(&mut self, v: i64) {
        if let Ok(v) = i8::try_from(v) {
            self.buf.push(1);
            self.buf.extend_from_slice(&v.to_le_bytes());
        } else if let Ok(v) = i16::try_from(v) {
            self.buf.push(2);
            self.buf.extend_from_slice(&v.to_le_bytes());
        } else if let Ok(v) = i32::try_from(v) {
            self.buf.push(4);
            self.buf.extend_from_slice(&v.to_le_bytes());
        } else {
            self.buf.push(8);
            self.buf.extend_from_slice(&v.to_le_bytes());
        }
    }

    pub fn write_float(&mut self, v: f64) {
        self.assert_writable();
        self.tag(TAG_FLOAT);
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn write_string(&mut self, v: &str) {
        self.assert_writable();
        self.tag(TAG_STRING);
        self.write_packed(v.len() as i64);
        self.buf.extend_from_slice(v.as_bytes());
    }

    /// One byte per character. Characters outside Latin-1 are written as `?`.
    pub fn write_ansi_string(&mut self, v: &str) {
        self.assert_writable();
        self.tag(TAG_ANSI);
        let bytes: Vec<u8> = v
            .chars()
            .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
            .collect();
        self.write_packed(bytes.len() as i64);
        self.buf.extend_from_slice(&bytes);
    }

    pub fn write_json<T: Serialize + ?Sized>(&mut self, v: &T) {
        self.assert_writable();
        self.tag(TAG_JSON);
        // Value-shaped types never fail to serialize; fall back to null if one does.
        let text = serde_json::to_string(v).unwrap_or_else(|_| "null".to_string());
        self.write_packed(text.len() as i64);
        self.buf.extend_from_slice(text.as_bytes());
    }

    pub fn write_buffer(&mut self, v: &[u8]) {
        self.assert_writable();
        self.tag(TAG_BUFFER);
        self.write_packed(v.len() as i64);
        self.buf.extend_from_slice(v);
    }

    fn assert_readable(&self) {
        assert!(self.readable, "read from a writable packet");
    }

    fn take(&mut self, n: usize) -> Result<&[u8], PacketError> {
        let available = self.buf.len() - self.pos;
        if n > available {
            return Err(PacketError::Truncated {
                needed: n,
                available,
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..start + n])
    }

    fn check_tag(&mut self, expected: u8) -> Result<(), PacketError> {
        if self.debug() {
            let found = self.take(1)?[0];
            if found != expected {
                return Err(PacketError::TypeMismatch { expected, found });
            }
        }
        Ok(())
    }

    pub fn read_bool(&mut self) -> Result<bool, PacketError> {
        self.assert_readable();
        self.check_tag(TAG_BOOL)?;
        Ok(self.take(1)?[0] != 0)
    }

    pub fn read_u8(&mut self) -> Result<u8, PacketError> {
        self.assert_readable();
        self.check_tag(TAG_U8)?;
        Ok(self.take(1)?[0])
    }

    pub fn read_int(&mut self) -> Result<i64, PacketError> {
        self.assert_readable();
        self.check_tag(TAG_INT)?;
        self.read_packed()
    }

    fn read_packed(&mut self) -> Result<i64, PacketError> {
        let width = self.take(1)?[0];
        let bytes = match width {
            1 | 2 | 4 | 8 => self.take(width as usize)?,
            other => return Err(PacketError::BadIntWidth(other)),
        };
        let v = match width {
            1 => i64::from(i8::from_le_bytes([bytes[0]])),
            2 => i64::from(i16::from_le_bytes([bytes[0], bytes[1]])),
            4 => i64::from(i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])),
            _ => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(bytes);
                i64::from_le_bytes(raw)
            }
        };
        Ok(v)
    }

    fn read_len(&mut self) -> Result<usize, PacketError> {
        let len = self.read_packed()?;
        usize::try_from(len).map_err(|_| PacketError::NegativeLength(len))
    }

    pub fn read_float(&mut self) -> Result<f64, PacketError> {
        self.assert_readable();
        self.check_tag(TAG_FLOAT)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.take(8)?);
        Ok(f64::from_le_bytes(raw))
    }

    pub fn read_string(&mut self) -> Result<String, PacketError> {
        self.assert_readable();
        self.check_tag(TAG_STRING)?;
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| PacketError::InvalidUtf8)
    }

    pub fn read_ansi_string(&mut self) -> Result<String, PacketError> {
        self.assert_readable();
        self.check_tag(TAG_ANSI)?;
        let len = self.read_len()?;
        Ok(self.take(len)?.iter().map(|&b| char::from(b)).collect())
    }

    pub fn read_json<T: DeserializeOwned>(&mut self) -> Result<T, PacketError> {
        self.assert_readable();
        self.check_tag(TAG_JSON)?;
        let len = self.read_len()?;
        let bytes = self.take(len)?;
        serde_json::from_slice(bytes).map_err(|e| PacketError::InvalidJson(e.to_string()))
    }

    pub fn read_buffer(&mut self) -> Result<Vec<u8>, PacketError> {
        self.assert_readable();
        self.check_tag(TAG_BUFFER)?;
        let len = self.read_len()?;
        Ok(self.take(len)?.to_vec())
    }
}
