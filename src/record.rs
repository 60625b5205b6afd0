//! Records and serialization contracts
//!
//! ## Leaf Record Layout (path → key, hash, value store)
//! ```text
//! ┌─────────────┬────────────────────────┬────────────┬─────────────┬─────────┐
//! │ KeyVer (4)  │ [KeyLen (4)] Key bytes │ Hash (48)  │ ValVer (4)  │ Value   │
//! └─────────────┴────────────────────────┴────────────┴─────────────┴─────────┘
//! ```
//! `KeyLen` is only present when keys are variable width. The value runs to
//! the end of the record; its length comes from the segment's own record
//! framing. All integers are little-endian.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::config::DataSize;
use crate::error::{Result, StoreError};

/// Width of a merkle digest in bytes (SHA-384)
pub const HASH_SIZE: usize = 48;

/// Size of a format-version tag
pub const VERSION_TAG_SIZE: usize = 4;

// =============================================================================
// Hash
// =============================================================================

/// Fixed-width merkle digest
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    pub const fn new(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }

    /// Build a hash from a slice that must be exactly `HASH_SIZE` long
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; HASH_SIZE] = bytes.try_into().map_err(|_| {
            StoreError::Corruption(format!(
                "hash must be {} bytes, got {}",
                HASH_SIZE,
                bytes.len()
            ))
        })?;
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl From<[u8; HASH_SIZE]> for Hash {
    fn from(bytes: [u8; HASH_SIZE]) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash(")?;
        for b in &self.0[..6] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "..)")
    }
}

// =============================================================================
// Key / Value Contracts
// =============================================================================

/// A key that can be stored in a leaf record
pub trait StoreKey: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Serialization format version written in front of the key
    fn version(&self) -> u32;

    /// Append the serialized key to `out`
    fn serialize<B: BufMut>(&self, out: &mut B);

    /// Decode a key written with format `version`
    fn deserialize<B: Buf>(buf: &mut B, version: u32) -> Result<Self>;

    /// The key as a single u64, required in long-key mode
    fn as_long(&self) -> Option<u64> {
        None
    }
}

/// A value that can be stored in a leaf record
pub trait StoreValue: Clone + PartialEq + fmt::Debug + Send + Sync + 'static {
    /// Serialization format version written in front of the value
    fn version(&self) -> u32;

    /// Append the serialized value to `out`
    fn serialize<B: BufMut>(&self, out: &mut B);

    /// Decode a value written with format `version`
    fn deserialize<B: Buf>(buf: &mut B, version: u32) -> Result<Self>;
}

// =============================================================================
// Records
// =============================================================================

/// A leaf node: key, value and the hash covering them
#[derive(Debug, Clone, PartialEq)]
pub struct LeafRecord<K, V> {
    pub path: u64,
    pub hash: Hash,
    pub key: K,
    pub value: V,
}

impl<K, V> LeafRecord<K, V> {
    pub fn new(path: u64, hash: Hash, key: K, value: V) -> Self {
        Self {
            path,
            hash,
            key,
            value,
        }
    }
}

/// An internal node: only a hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InternalRecord {
    pub path: u64,
    pub hash: Hash,
}

impl InternalRecord {
    pub fn new(path: u64, hash: Hash) -> Self {
        Self { path, hash }
    }
}

// =============================================================================
// Leaf Codec
// =============================================================================

/// Encodes and decodes leaf records for a given key/value layout
#[derive(Debug, Clone, Copy)]
pub struct LeafCodec {
    key_size: DataSize,
    value_size: DataSize,
}

impl LeafCodec {
    pub fn new(key_size: DataSize, value_size: DataSize) -> Self {
        Self {
            key_size,
            value_size,
        }
    }

    /// Encoded size when both sides are fixed width
    pub fn fixed_record_size(&self) -> Option<usize> {
        match (self.key_size, self.value_size) {
            (DataSize::Fixed(k), DataSize::Fixed(v)) => {
                Some(VERSION_TAG_SIZE + k + HASH_SIZE + VERSION_TAG_SIZE + v)
            }
            _ => None,
        }
    }

    /// Serialize a key on its own, without version tag (hash map identity)
    pub fn key_bytes<K: StoreKey>(&self, key: &K) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        key.serialize(&mut buf);
        check_width("key", self.key_size, buf.len())?;
        Ok(buf.freeze())
    }

    pub fn encode<K: StoreKey, V: StoreValue>(&self, record: &LeafRecord<K, V>) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.fixed_record_size().unwrap_or(256));

        buf.put_u32_le(record.key.version());
        let key = self.key_bytes(&record.key)?;
        if self.key_size.is_variable() {
            buf.put_u32_le(key.len() as u32);
        }
        buf.put_slice(&key);

        buf.put_slice(record.hash.as_bytes());

        buf.put_u32_le(record.value.version());
        let value_start = buf.len();
        record.value.serialize(&mut buf);
        check_width("value", self.value_size, buf.len() - value_start)?;

        Ok(buf.freeze())
    }

    /// Decode a full record; `path` comes from the locator, not the payload
    pub fn decode<K: StoreKey, V: StoreValue>(&self, path: u64, bytes: &[u8]) -> Result<LeafRecord<K, V>> {
        let mut buf = bytes;
        let key = self.decode_key(&mut buf)?;
        let hash = read_hash(&mut buf)?;
        let value_version = read_u32(&mut buf, "value version")?;
        let value = V::deserialize(&mut buf, value_version)?;
        Ok(LeafRecord {
            path,
            hash,
            key,
            value,
        })
    }

    /// Decode only the key (index rebuild in long-key mode)
    pub fn decode_key_only<K: StoreKey>(&self, bytes: &[u8]) -> Result<K> {
        let mut buf = bytes;
        self.decode_key(&mut buf)
    }

    /// Decode only the hash, skipping the key without deserializing it
    pub fn decode_hash(&self, bytes: &[u8]) -> Result<Hash> {
        let mut buf = bytes;
        read_u32(&mut buf, "key version")?;
        let key_len = self.key_len(&mut buf)?;
        if buf.remaining() < key_len {
            return Err(truncated("key"));
        }
        buf.advance(key_len);
        read_hash(&mut buf)
    }

    fn decode_key<K: StoreKey>(&self, buf: &mut &[u8]) -> Result<K> {
        let version = read_u32(buf, "key version")?;
        let key_len = self.key_len(buf)?;
        if buf.remaining() < key_len {
            return Err(truncated("key"));
        }
        let mut key_buf = &buf[..key_len];
        let key = K::deserialize(&mut key_buf, version)?;
        buf.advance(key_len);
        Ok(key)
    }

    fn key_len(&self, buf: &mut &[u8]) -> Result<usize> {
        match self.key_size {
            DataSize::Fixed(n) => Ok(n),
            DataSize::Variable => Ok(read_u32(buf, "key length")? as usize),
        }
    }
}

// =============================================================================
// Private Helpers
// =============================================================================

fn check_width(what: &str, expected: DataSize, actual: usize) -> Result<()> {
    match expected {
        DataSize::Fixed(n) if n != actual => Err(StoreError::Serialization(format!(
            "{} serialized to {} bytes, configured width is {}",
            what, actual, n
        ))),
        _ => Ok(()),
    }
}

fn read_u32(buf: &mut &[u8], what: &str) -> Result<u32> {
    if buf.remaining() < 4 {
        return Err(truncated(what));
    }
    Ok(buf.get_u32_le())
}

fn read_hash(buf: &mut &[u8]) -> Result<Hash> {
    if buf.remaining() < HASH_SIZE {
        return Err(truncated("hash"));
    }
    let hash = Hash::from_slice(&buf[..HASH_SIZE])?;
    buf.advance(HASH_SIZE);
    Ok(hash)
}

fn truncated(what: &str) -> StoreError {
    StoreError::Corruption(format!("leaf record truncated while reading {}", what))
}
