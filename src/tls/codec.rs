//! Binary format of ticket keys stored in the networked cache.
//!
//! ```text
//! | version: u32 BE | (len: u16 BE | key record: len bytes)* |
//!
//! key record = | name: 16 | enc key: K | MAC key: K |   K = 16 (AES-128) or 32 (AES-256)
//! ```
//!
//! Records run until the buffer is exhausted. All reads go through
//! [`ByteCursor`], which never yields bytes past the end of its slice; the
//! buffer arrives from a semi-trusted peer.

use std::sync::Arc;

use thiserror::Error;

use crate::tls::key::{TicketCipher, TicketKey, TicketKeySet, KEY_NAME_LEN};

/// The only wire version understood.
pub const WIRE_VERSION: u32 = 1;

/// Errors produced while decoding a stored key set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unsupported ticket key version: want 1, got {0}")]
    UnsupportedVersion(u32),

    #[error("wrong ticket key record size: want {expected}, got {actual}")]
    MalformedRecord { expected: usize, actual: usize },

    #[error("ticket key data truncated: want {wanted} bytes, got {available}")]
    TruncatedInput { wanted: usize, available: usize },
}

/// Errors produced while encoding a key set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("key {name} uses {actual}, record is {expected}")]
    CipherMismatch {
        name: String,
        expected: TicketCipher,
        actual: TicketCipher,
    },

    #[error("key {name} has a {actual}-byte MAC key, record needs {expected}")]
    MacKeyLength {
        name: String,
        expected: usize,
        actual: usize,
    },
}

/// Forward-only reader over a byte slice.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a> {
    buf: &'a [u8],
}

impl<'a> ByteCursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Take exactly `n` bytes, or fail without advancing.
    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.buf.len() < n {
            return Err(DecodeError::TruncatedInput {
                wanted: n,
                available: self.buf.len(),
            });
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn read_u16_be(&mut self) -> Result<u16, DecodeError> {
        self.read_array::<2>().map(u16::from_be_bytes)
    }

    pub fn read_u32_be(&mut self) -> Result<u32, DecodeError> {
        self.read_array::<4>().map(u32::from_be_bytes)
    }
}

/// Decode already-framed key records.
///
/// Every record must be exactly `cipher.record_len()` bytes. An empty record
/// list yields an empty set; the caller decides what that means.
pub fn decode(
    version: u32,
    cipher: TicketCipher,
    records: &[&[u8]],
) -> Result<TicketKeySet, DecodeError> {
    if version != WIRE_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let expected = cipher.record_len();
    let mut keys = Vec::with_capacity(records.len());
    for record in records {
        if record.len() != expected {
            return Err(DecodeError::MalformedRecord {
                expected,
                actual: record.len(),
            });
        }
        keys.push(Arc::new(decode_record(cipher, record)?));
    }
    Ok(TicketKeySet::new(keys))
}

/// Decode a single record of `cipher.record_len()` bytes.
pub(crate) fn decode_record(cipher: TicketCipher, record: &[u8]) -> Result<TicketKey, DecodeError> {
    let mut cursor = ByteCursor::new(record);
    let name = cursor.read_array::<KEY_NAME_LEN>()?;
    let enc_key = cursor.take(cipher.key_len())?;
    let hmac_key = cursor.take(cipher.key_len())?;
    if !cursor.is_empty() {
        return Err(DecodeError::MalformedRecord {
            expected: cipher.record_len(),
            actual: record.len(),
        });
    }
    TicketKey::from_parts(cipher, name, enc_key, hmac_key).ok_or(DecodeError::MalformedRecord {
        expected: cipher.record_len(),
        actual: record.len(),
    })
}

/// Split the body following the version into length-prefixed records.
fn split_records<'a>(cursor: &mut ByteCursor<'a>) -> Result<Vec<&'a [u8]>, DecodeError> {
    let mut records = Vec::new();
    while !cursor.is_empty() {
        let len = cursor.read_u16_be()? as usize;
        records.push(cursor.take(len)?);
    }
    Ok(records)
}

/// Decode a complete value fetched from the cache.
pub fn decode_wire(buf: &[u8], cipher: TicketCipher) -> Result<TicketKeySet, DecodeError> {
    let mut cursor = ByteCursor::new(buf);
    let version = cursor.read_u32_be()?;
    if version != WIRE_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    let records = split_records(&mut cursor)?;
    decode(version, cipher, &records)
}

/// Encode a key set in the version 1 layout.
///
/// Every key must use `cipher` and carry a MAC key of the cipher's key length.
pub fn encode_wire(set: &TicketKeySet, cipher: TicketCipher) -> Result<Vec<u8>, EncodeError> {
    let record_len = cipher.record_len();
    let mut out = Vec::with_capacity(4 + set.len() * (2 + record_len));
    out.extend_from_slice(&WIRE_VERSION.to_be_bytes());

    for key in set.iter() {
        if key.cipher() != cipher {
            return Err(EncodeError::CipherMismatch {
                name: key.name_hex(),
                expected: cipher,
                actual: key.cipher(),
            });
        }
        if key.hmac_key().len() != cipher.key_len() {
            return Err(EncodeError::MacKeyLength {
                name: key.name_hex(),
                expected: cipher.key_len(),
                actual: key.hmac_key().len(),
            });
        }
        // record_len is at most 80, always within u16
        out.extend_from_slice(&(record_len as u16).to_be_bytes());
        out.extend_from_slice(key.name());
        out.extend_from_slice(key.enc_key());
        out.extend_from_slice(key.hmac_key());
    }
    Ok(out)
}
