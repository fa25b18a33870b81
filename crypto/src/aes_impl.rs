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

//! AES cipher family.

use std::sync::Arc;

use aes::{Aes128, Aes192, Aes256};
use cipher::{Block, BlockDecrypt, BlockEncrypt, BlockSizeUser, KeyInit};

use crate::{validate_key, Cipher, CipherContext, CipherContextRef, CryptoError};

pub(crate) struct EncryptionContext<C> {
    cipher: C,
    block_size: usize,
}

impl<C> std::fmt::Debug for EncryptionContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionContext")
            .field("block_size", &self.block_size)
            .finish()
    }
}

pub(crate) struct DecryptionContext<C> {
    cipher: C,
    block_size: usize,
}

impl<C> std::fmt::Debug for DecryptionContext<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionContext")
            .field("block_size", &self.block_size)
            .finish()
    }
}

impl<C: BlockEncrypt + BlockSizeUser + Send + Sync> CipherContext for EncryptionContext<C> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn transform_in_place(&self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % self.block_size, 0);
        for chunk in data.chunks_exact_mut(self.block_size) {
            self.cipher.encrypt_block(Block::<C>::from_mut_slice(chunk));
        }
    }
}

impl<C: BlockDecrypt + BlockSizeUser + Send + Sync> CipherContext for DecryptionContext<C> {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn transform_in_place(&self, data: &mut [u8]) {
        debug_assert_eq!(data.len() % self.block_size, 0);
        for chunk in data.chunks_exact_mut(self.block_size) {
            self.cipher.decrypt_block(Block::<C>::from_mut_slice(chunk));
        }
    }
}

pub(crate) fn new_encryption_context<C>(
    cipher_id: &'static str,
    key_size_bits: u32,
    key: &[u8],
) -> Result<CipherContextRef, CryptoError>
where
    C: BlockEncrypt + BlockSizeUser + KeyInit + Send + Sync + 'static,
{
    validate_key(cipher_id, key_size_bits, key)?;
    let cipher = C::new_from_slice(key).expect("key length was validated above; qed");
    Ok(Arc::new(EncryptionContext {
        block_size: C::block_size(),
        cipher,
    }))
}

pub(crate) fn new_decryption_context<C>(
    cipher_id: &'static str,
    key_size_bits: u32,
    key: &[u8],
) -> Result<CipherContextRef, CryptoError>
where
    C: BlockDecrypt + BlockSizeUser + KeyInit + Send + Sync + 'static,
{
    validate_key(cipher_id, key_size_bits, key)?;
    let cipher = C::new_from_slice(key).expect("key length was validated above; qed");
    Ok(Arc::new(DecryptionContext {
        block_size: C::block_size(),
        cipher,
    }))
}

macro_rules! aes_cipher {
    ($name:ident, $core:ty, $id:expr, $key_bits:expr) => {
        pub struct $name;

        impl Cipher for $name {
            fn cipher_id(&self) -> &'static str {
                $id
            }

            fn block_size_bits(&self) -> u32 {
                128
            }

            fn key_size_bits(&self) -> u32 {
                $key_bits
            }

            fn create_encryption_context(
                &self,
                key: &[u8],
            ) -> Result<CipherContextRef, CryptoError> {
                new_encryption_context::<$core>($id, $key_bits, key)
            }

            fn create_decryption_context(
                &self,
                key: &[u8],
            ) -> Result<CipherContextRef, CryptoError> {
                new_decryption_context::<$core>($id, $key_bits, key)
            }
        }
    };
}

aes_cipher!(Aes128Cipher, Aes128, "aes128", 128);
aes_cipher!(Aes192Cipher, Aes192, "aes192", 192);
aes_cipher!(Aes256Cipher, Aes256, "aes256", 256);

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hex::FromHex;

    // FIPS-197 appendix C.1 vector.
    #[test]
    fn aes128_known_answer() {
        let key: Vec<u8> = "000102030405060708090a0b0c0d0e0f".from_hex().unwrap();
        let mut block: Vec<u8> = "00112233445566778899aabbccddeeff".from_hex().unwrap();
        let expected: Vec<u8> = "69c4e0d86a7b0430d8cdb78070b4c55a".from_hex().unwrap();

        let enc = Aes128Cipher.create_encryption_context(&key).unwrap();
        enc.transform_in_place(&mut block);
        assert_eq!(block, expected);

        let dec = Aes128Cipher.create_decryption_context(&key).unwrap();
        dec.transform_in_place(&mut block);
        assert_eq!(block, "00112233445566778899aabbccddeeff".from_hex::<Vec<u8>>().unwrap());
    }
}
