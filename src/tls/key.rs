//! Ticket key material.
//!
//! # Responsibilities
//! - Represent one ticket key bundle (name, encryption key, MAC key)
//! - Represent an ordered key set (freshest first)
//! - Draw fresh key material from an injected random source
//!
//! # Design Decisions
//! - Keys are immutable once built and shared through `Arc`
//! - Key bytes are zeroized on drop; `Debug` never prints secrets

use std::fmt;
use std::sync::Arc;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of the opaque key name that tags issued tickets.
pub const KEY_NAME_LEN: usize = 16;

/// Largest encryption or MAC key any supported cipher uses.
pub const MAX_KEY_LEN: usize = 32;

/// Symmetric cipher used to encrypt session tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
pub enum TicketCipher {
    #[default]
    #[serde(rename = "aes-128-cbc")]
    Aes128Cbc,
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
}

impl TicketCipher {
    /// Encryption key length in bytes.
    pub fn key_len(self) -> usize {
        match self {
            TicketCipher::Aes128Cbc => 16,
            TicketCipher::Aes256Cbc => 32,
        }
    }

    /// Length of one serialized key record: name, encryption key, MAC key.
    ///
    /// Stored records carry a MAC key as long as the encryption key, so this
    /// is 48 for AES-128 and 80 for AES-256.
    pub fn record_len(self) -> usize {
        KEY_NAME_LEN + 2 * self.key_len()
    }

    pub fn name(self) -> &'static str {
        match self {
            TicketCipher::Aes128Cbc => "aes-128-cbc",
            TicketCipher::Aes256Cbc => "aes-256-cbc",
        }
    }
}

impl fmt::Display for TicketCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// MAC algorithm protecting ticket integrity. Fixed to HMAC-SHA256.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HmacAlgorithm {
    #[default]
    Sha256,
}

impl HmacAlgorithm {
    /// Digest size, which is also the MAC key length of generated keys.
    pub fn digest_len(self) -> usize {
        match self {
            HmacAlgorithm::Sha256 => 32,
        }
    }
}

/// The random source could not produce key material.
#[derive(Debug, Error)]
#[error("random source could not supply {wanted} bytes: {reason}")]
pub struct GenerationError {
    pub wanted: usize,
    pub reason: String,
}

/// Source of raw random bytes for key generation.
pub trait KeyMaterialSource: Send {
    /// Fill `buf` completely or fail.
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), GenerationError>;
}

/// Operating system CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRandom;

impl KeyMaterialSource for SystemRandom {
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), GenerationError> {
        rand::rngs::OsRng
            .try_fill_bytes(buf)
            .map_err(|e| GenerationError {
                wanted: buf.len(),
                reason: e.to_string(),
            })
    }
}

/// One ticket key bundle.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct TicketKey {
    #[zeroize(skip)]
    cipher: TicketCipher,
    #[zeroize(skip)]
    hmac: HmacAlgorithm,
    #[zeroize(skip)]
    hmac_key_len: usize,
    name: [u8; KEY_NAME_LEN],
    enc_key: [u8; MAX_KEY_LEN],
    hmac_key: [u8; MAX_KEY_LEN],
}

impl TicketKey {
    /// Generate a fresh key for `cipher` from a single draw of `rng`.
    ///
    /// The MAC key is always a full HMAC-SHA256 key, independent of cipher.
    pub fn generate(
        cipher: TicketCipher,
        rng: &mut dyn KeyMaterialSource,
    ) -> Result<Self, GenerationError> {
        let mut raw = Zeroizing::new([0u8; KEY_NAME_LEN + 2 * MAX_KEY_LEN]);
        rng.fill(&mut raw[..])?;

        let hmac = HmacAlgorithm::Sha256;
        let mut key = TicketKey {
            cipher,
            hmac,
            hmac_key_len: hmac.digest_len(),
            name: [0; KEY_NAME_LEN],
            enc_key: [0; MAX_KEY_LEN],
            hmac_key: [0; MAX_KEY_LEN],
        };
        key.name.copy_from_slice(&raw[..KEY_NAME_LEN]);
        key.enc_key
            .copy_from_slice(&raw[KEY_NAME_LEN..KEY_NAME_LEN + MAX_KEY_LEN]);
        key.hmac_key.copy_from_slice(&raw[KEY_NAME_LEN + MAX_KEY_LEN..]);

        tracing::debug!(
            enc_keylen = cipher.key_len(),
            hmac_keylen = key.hmac_key_len,
            "Generated ticket key"
        );
        Ok(key)
    }

    /// Build a key from stored parts.
    ///
    /// Returns `None` unless `enc_key` matches the cipher's key length and
    /// `hmac_key` fits the MAC key storage.
    pub fn from_parts(
        cipher: TicketCipher,
        name: [u8; KEY_NAME_LEN],
        enc_key: &[u8],
        hmac_key: &[u8],
    ) -> Option<Self> {
        if enc_key.len() != cipher.key_len() || hmac_key.len() > MAX_KEY_LEN {
            return None;
        }
        let mut key = TicketKey {
            cipher,
            hmac: HmacAlgorithm::Sha256,
            hmac_key_len: hmac_key.len(),
            name,
            enc_key: [0; MAX_KEY_LEN],
            hmac_key: [0; MAX_KEY_LEN],
        };
        key.enc_key[..enc_key.len()].copy_from_slice(enc_key);
        key.hmac_key[..hmac_key.len()].copy_from_slice(hmac_key);
        Some(key)
    }

    pub fn cipher(&self) -> TicketCipher {
        self.cipher
    }

    pub fn hmac(&self) -> HmacAlgorithm {
        self.hmac
    }

    /// Opaque name written into tickets encrypted with this key.
    pub fn name(&self) -> &[u8; KEY_NAME_LEN] {
        &self.name
    }

    pub fn enc_key(&self) -> &[u8] {
        &self.enc_key[..self.cipher.key_len()]
    }

    pub fn hmac_key(&self) -> &[u8] {
        &self.hmac_key[..self.hmac_key_len]
    }

    /// Hex form of the key name, for logs.
    pub fn name_hex(&self) -> String {
        hex::encode(self.name)
    }
}

impl fmt::Debug for TicketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TicketKey")
            .field("name", &self.name_hex())
            .field("cipher", &self.cipher)
            .field("hmac", &self.hmac)
            .field("hmac_key_len", &self.hmac_key_len)
            .finish_non_exhaustive()
    }
}

impl PartialEq for TicketKey {
    fn eq(&self, other: &Self) -> bool {
        self.cipher == other.cipher
            && self.hmac == other.hmac
            && self.name == other.name
            && self.enc_key() == other.enc_key()
            && self.hmac_key() == other.hmac_key()
    }
}

impl Eq for TicketKey {}

/// Ordered ticket keys, freshest first.
///
/// Index 0 encrypts new tickets; every key, index 0 included, may decrypt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TicketKeySet {
    keys: Vec<Arc<TicketKey>>,
}

impl TicketKeySet {
    pub fn new(keys: Vec<Arc<TicketKey>>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &[Arc<TicketKey>] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// The key used to encrypt new tickets.
    pub fn encryption_key(&self) -> Option<&TicketKey> {
        self.keys.first().map(Arc::as_ref)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TicketKey> {
        self.keys.iter().map(Arc::as_ref)
    }

    /// Log the set's layout: index 0 encrypts and decrypts, the rest decrypt.
    pub fn log_layout(&self) {
        for (i, key) in self.iter().enumerate() {
            let role = if i == 0 { "enc+dec" } else { "dec" };
            tracing::debug!(index = i, role, name = %key.name_hex(), "Ticket key");
        }
    }
}
