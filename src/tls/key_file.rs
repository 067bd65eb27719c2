//! Static ticket key files.
//!
//! Each file holds exactly one key record in the same layout the cache uses
//! (name, encryption key, MAC key): 48 bytes for aes-128-cbc, 80 bytes for
//! aes-256-cbc. The first file's key encrypts; the others only decrypt.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::tls::codec::decode_record;
use crate::tls::key::{TicketCipher, TicketKey, TicketKeySet};

#[derive(Debug, Error)]
pub enum KeyFileError {
    #[error("no ticket key files given")]
    Empty,

    #[error("failed to read ticket key file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("ticket key file {} has {actual} bytes, want {expected} for {cipher}", path.display())]
    Length {
        path: PathBuf,
        cipher: TicketCipher,
        expected: usize,
        actual: usize,
    },
}

/// Load all key files in order. Any bad file fails the whole load.
pub fn load_key_files(paths: &[PathBuf], cipher: TicketCipher) -> Result<TicketKeySet, KeyFileError> {
    if paths.is_empty() {
        return Err(KeyFileError::Empty);
    }

    let mut keys = Vec::with_capacity(paths.len());
    for path in paths {
        keys.push(Arc::new(load_one(path, cipher)?));
    }
    let set = TicketKeySet::new(keys);

    tracing::info!(files = paths.len(), cipher = %cipher, "Loaded ticket keys from files");
    set.log_layout();
    Ok(set)
}

fn load_one(path: &Path, cipher: TicketCipher) -> Result<TicketKey, KeyFileError> {
    let data = Zeroizing::new(fs::read(path).map_err(|source| KeyFileError::Io {
        path: path.to_path_buf(),
        source,
    })?);

    let length_error = || KeyFileError::Length {
        path: path.to_path_buf(),
        cipher,
        expected: cipher.record_len(),
        actual: data.len(),
    };
    if data.len() != cipher.record_len() {
        return Err(length_error());
    }
    decode_record(cipher, &data).map_err(|_| length_error())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn key_file(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file
    }

    #[test]
    fn first_file_encrypts() {
        let a = key_file(&[0xaa; 48]);
        let b = key_file(&[0xbb; 48]);
        let paths = vec![a.path().to_path_buf(), b.path().to_path_buf()];

        let set = load_key_files(&paths, TicketCipher::Aes128Cbc).unwrap();
        assert_eq!(set.len(), 2);
        assert_eq!(set.encryption_key().unwrap().name(), &[0xaa; 16]);
        assert_eq!(set.keys()[1].name(), &[0xbb; 16]);
        assert_eq!(set.keys()[1].hmac_key().len(), 16);
    }

    #[test]
    fn aes256_files_hold_80_bytes() {
        let a = key_file(&[0x11; 80]);
        let set = load_key_files(&[a.path().to_path_buf()], TicketCipher::Aes256Cbc).unwrap();
        assert_eq!(set.encryption_key().unwrap().enc_key().len(), 32);
    }

    #[test]
    fn wrong_length_fails_whole_load() {
        let good = key_file(&[0xaa; 48]);
        let bad = key_file(&[0xbb; 47]);
        let paths = vec![good.path().to_path_buf(), bad.path().to_path_buf()];

        let err = load_key_files(&paths, TicketCipher::Aes128Cbc).unwrap_err();
        assert!(matches!(err, KeyFileError::Length { expected: 48, actual: 47, .. }));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = load_key_files(&[PathBuf::from("/nonexistent/ticket.key")], TicketCipher::Aes128Cbc)
            .unwrap_err();
        assert!(matches!(err, KeyFileError::Io { .. }));
    }

    #[test]
    fn empty_list_is_rejected() {
        assert!(matches!(
            load_key_files(&[], TicketCipher::Aes128Cbc),
            Err(KeyFileError::Empty)
        ));
    }
}
