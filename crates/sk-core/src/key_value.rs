//! Key-value record model
//!
//! Records are stored inside chunks as `[key_size u8][value_size u32 BE]
//! [key bytes][value bytes]`. Key size is capped at 255 bytes.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Bytes of a record header preceding key and value
pub const RECORD_HEADER_SIZE: usize = 5;
/// Maximum key size in bytes
pub const MAX_KEY_SIZE: usize = 255;

/// An owned key (cheaply cloneable)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub Bytes);

impl Key {
    pub fn copy_from(data: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(data))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn size(&self) -> usize {
        self.0.len()
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// A full key-value record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: Key,
    pub value: Bytes,
}

impl KeyValue {
    pub fn new(key: Key, value: Bytes) -> Self {
        Self { key, value }
    }

    /// Size of the serialized record inside a chunk
    pub fn serialized_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.key.size() + self.value.len()
    }

    /// Write the record at `out[..self.serialized_size()]`.
    pub fn write_to(&self, out: &mut [u8]) {
        debug_assert!(self.key.size() <= MAX_KEY_SIZE);
        out[0] = self.key.size() as u8;
        out[1..5].copy_from_slice(&(self.value.len() as u32).to_be_bytes());
        let key_end = RECORD_HEADER_SIZE + self.key.size();
        out[RECORD_HEADER_SIZE..key_end].copy_from_slice(self.key.as_bytes());
        out[key_end..key_end + self.value.len()].copy_from_slice(&self.value);
    }

    /// Parse a record starting at `buf[offset..]`; returns the record and
    /// its serialized size, or None on a malformed/truncated record.
    pub fn parse_at(buf: &[u8], offset: usize) -> Option<(KeyValue, usize)> {
        let rest = buf.get(offset..)?;
        if rest.len() < RECORD_HEADER_SIZE {
            return None;
        }
        let key_size = rest[0] as usize;
        let value_size = u32::from_be_bytes([rest[1], rest[2], rest[3], rest[4]]) as usize;
        let total = RECORD_HEADER_SIZE + key_size + value_size;
        if rest.len() < total || key_size == 0 {
            return None;
        }
        let key = Key::copy_from(&rest[RECORD_HEADER_SIZE..RECORD_HEADER_SIZE + key_size]);
        let value = Bytes::copy_from_slice(&rest[RECORD_HEADER_SIZE + key_size..total]);
        Some((KeyValue { key, value }, total))
    }
}

/// A partial value update: `data` replaces `length` bytes of the value
/// starting at `offset`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueUpdate {
    pub key: Key,
    pub offset: u32,
    pub length: u32,
    pub data: Bytes,
}

impl KeyValueUpdate {
    pub fn new(key: Key, offset: u32, data: Bytes) -> Self {
        let length = data.len() as u32;
        Self {
            key,
            offset,
            length,
            data,
        }
    }

    /// Apply this update to a value in place. Fails if out of range.
    pub fn apply(&self, value: &mut Vec<u8>) -> bool {
        let start = self.offset as usize;
        let end = start + self.length as usize;
        if end > value.len() {
            return false;
        }
        value[start..end].copy_from_slice(&self.data);
        true
    }
}
