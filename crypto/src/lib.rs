// Copyright 2019-2021 Meridb Developers.
// This file is part of Meridb.

// Meridb is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// Meridb is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.

// You should have received a copy of the GNU General Public License
// along with Meridb.  If not, see <http://www.gnu.org/licenses/>.

//! Built-in block ciphers and key-prepared transform contexts.
//!
//! Encrypted data files are addressed in whole cipher blocks and every block
//! is transformed independently (ECB): the container format stores no IV
//! state, so random positional writes stay cheap. Contexts are immutable
//! after construction and freely shared between threads.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use lazy_static::lazy_static;

mod aes_impl;
mod camellia_impl;

pub use crate::aes_impl::{Aes128Cipher, Aes192Cipher, Aes256Cipher};
pub use crate::camellia_impl::{Camellia128Cipher, Camellia192Cipher, Camellia256Cipher};

/// Cipher id that disables encryption.
pub const NO_CIPHER_ID: &str = "none";

/// Shared cipher handle.
pub type CipherRef = Arc<dyn Cipher>;

/// Shared cipher context handle.
pub type CipherContextRef = Arc<dyn CipherContext>;

/// Cipher layer errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key length does not match the cipher.
    InvalidCipherKey {
        cipher_id: &'static str,
        expected_bytes: usize,
        actual_bytes: usize,
    },
    /// Cipher id is not registered.
    CipherUnknown(String),
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            CryptoError::InvalidCipherKey {
                cipher_id,
                expected_bytes,
                actual_bytes,
            } => write!(
                f,
                "invalid key size for cipher {}: expected {} bytes, received {} bytes",
                cipher_id, expected_bytes, actual_bytes
            ),
            CryptoError::CipherUnknown(ref id) => write!(f, "unknown cipher {}", id),
        }
    }
}

impl std::error::Error for CryptoError {}

/// A fixed-block symmetric cipher.
pub trait Cipher: Send + Sync {
    /// Cipher identification string, e.g. `aes128`.
    fn cipher_id(&self) -> &'static str;

    /// Cipher block size in bits.
    fn block_size_bits(&self) -> u32;

    /// Cipher key size in bits.
    fn key_size_bits(&self) -> u32;

    /// Creates an encryption context. Fails if the key length does not match
    /// [`Cipher::key_size_bits`].
    fn create_encryption_context(&self, key: &[u8]) -> Result<CipherContextRef, CryptoError>;

    /// Creates a decryption context. Fails if the key length does not match
    /// [`Cipher::key_size_bits`].
    fn create_decryption_context(&self, key: &[u8]) -> Result<CipherContextRef, CryptoError>;
}

/// A key-prepared transform. Purely CPU-bound, never fails.
pub trait CipherContext: Send + Sync + std::fmt::Debug {
    /// Block size in bytes.
    fn block_size(&self) -> usize;

    /// Transforms `data` in place. `data.len()` must be a whole number of
    /// cipher blocks.
    fn transform_in_place(&self, data: &mut [u8]);
}

pub(crate) fn validate_key(
    cipher_id: &'static str,
    key_size_bits: u32,
    key: &[u8],
) -> Result<(), CryptoError> {
    let expected_bytes = key_size_bits as usize / 8;
    if key.len() != expected_bytes {
        return Err(CryptoError::InvalidCipherKey {
            cipher_id,
            expected_bytes,
            actual_bytes: key.len(),
        });
    }
    Ok(())
}

lazy_static! {
    static ref CIPHERS: HashMap<&'static str, CipherRef> = {
        let mut m = HashMap::new();
        let all: Vec<CipherRef> = vec![
            Arc::new(Aes128Cipher),
            Arc::new(Aes192Cipher),
            Arc::new(Aes256Cipher),
            Arc::new(Camellia128Cipher),
            Arc::new(Camellia192Cipher),
            Arc::new(Camellia256Cipher),
        ];
        for cipher in all {
            m.insert(cipher.cipher_id(), cipher);
        }
        m
    };
}

/// Looks a cipher up by id. `Ok(None)` means encryption is disabled
/// (cipher id [`NO_CIPHER_ID`]).
pub fn get_cipher(cipher_id: &str) -> Result<Option<CipherRef>, CryptoError> {
    if cipher_id == NO_CIPHER_ID {
        return Ok(None);
    }
    CIPHERS
        .get(cipher_id)
        .cloned()
        .map(Some)
        .ok_or_else(|| CryptoError::CipherUnknown(cipher_id.to_owned()))
}

/// Ids of all built-in ciphers, excluding [`NO_CIPHER_ID`].
pub fn builtin_cipher_ids() -> Vec<&'static str> {
    let mut ids: Vec<_> = CIPHERS.keys().cloned().collect();
    ids.sort_unstable();
    ids
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hex::FromHex;

    fn key(hex: &str) -> Vec<u8> {
        hex.from_hex().unwrap()
    }

    #[test]
    fn registry_has_all_builtins() {
        let ids = builtin_cipher_ids();
        assert_eq!(
            ids,
            vec![
                "aes128",
                "aes192",
                "aes256",
                "camellia128",
                "camellia192",
                "camellia256"
            ]
        );
        assert!(get_cipher("none").unwrap().is_none());
        assert!(matches!(
            get_cipher("rot13"),
            Err(CryptoError::CipherUnknown(_))
        ));
    }

    #[test]
    fn key_length_is_validated() {
        let cipher = get_cipher("aes256").unwrap().unwrap();
        let err = cipher
            .create_encryption_context(&key("00112233445566778899aabbccddeeff"))
            .unwrap_err();
        assert_eq!(
            err,
            CryptoError::InvalidCipherKey {
                cipher_id: "aes256",
                expected_bytes: 32,
                actual_bytes: 16,
            }
        );
    }

    #[test]
    fn transform_roundtrips_for_every_builtin() {
        for id in builtin_cipher_ids() {
            let cipher = get_cipher(id).unwrap().unwrap();
            let key_bytes: Vec<u8> = (0..cipher.key_size_bits() / 8).map(|i| i as u8).collect();
            let enc = cipher.create_encryption_context(&key_bytes).unwrap();
            let dec = cipher.create_decryption_context(&key_bytes).unwrap();
            assert_eq!(enc.block_size(), cipher.block_size_bits() as usize / 8);

            let mut data: Vec<u8> = (0..enc.block_size() * 3).map(|i| (i * 7) as u8).collect();
            let original = data.clone();
            enc.transform_in_place(&mut data);
            assert_ne!(data, original, "cipher {} left data unchanged", id);
            dec.transform_in_place(&mut data);
            assert_eq!(data, original, "cipher {} did not round-trip", id);
        }
    }

    #[test]
    fn ecb_blocks_are_independent() {
        let cipher = get_cipher("aes128").unwrap().unwrap();
        let enc = cipher
            .create_encryption_context(&key("000102030405060708090a0b0c0d0e0f"))
            .unwrap();
        let mut twice = vec![0xabu8; 32];
        enc.transform_in_place(&mut twice);
        assert_eq!(&twice[..16], &twice[16..], "equal blocks must encrypt equal");
    }
}
