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

//! Camellia cipher family.

use camellia::{Camellia128, Camellia192, Camellia256};

use crate::aes_impl::{new_decryption_context, new_encryption_context};
use crate::{Cipher, CipherContextRef, CryptoError};

macro_rules! camellia_cipher {
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

camellia_cipher!(Camellia128Cipher, Camellia128, "camellia128", 128);
camellia_cipher!(Camellia192Cipher, Camellia192, "camellia192", 192);
camellia_cipher!(Camellia256Cipher, Camellia256, "camellia256", 256);

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hex::FromHex;

    // RFC 3713 reference vector.
    #[test]
    fn camellia128_known_answer() {
        let key: Vec<u8> = "0123456789abcdeffedcba9876543210".from_hex().unwrap();
        let mut block: Vec<u8> = "0123456789abcdeffedcba9876543210".from_hex().unwrap();
        let expected: Vec<u8> = "67673138549669730857065648eabe43".from_hex().unwrap();

        let enc = Camellia128Cipher.create_encryption_context(&key).unwrap();
        enc.transform_in_place(&mut block);
        assert_eq!(block, expected);

        let dec = Camellia128Cipher.create_decryption_context(&key).unwrap();
        dec.transform_in_place(&mut block);
        assert_eq!(
            block,
            "0123456789abcdeffedcba9876543210".from_hex::<Vec<u8>>().unwrap()
        );
    }
}
