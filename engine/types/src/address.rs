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

use std::fmt;

use crate::pbe;

/// Physical location of a record inside a column: data block id plus offset
/// within the block's data area. `{0, 0}` is the null address and stands for
/// an SQL NULL.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ColumnDataAddress {
    pub block_id: u64,
    pub offset: u32,
}

/// The null address.
pub const NULL_ADDRESS: ColumnDataAddress = ColumnDataAddress {
    block_id: 0,
    offset: 0,
};

impl ColumnDataAddress {
    /// Serialized size: 8-byte block id + 4-byte offset.
    pub const SERIALIZED_SIZE: usize = 12;

    pub fn new(block_id: u64, offset: u32) -> ColumnDataAddress {
        ColumnDataAddress { block_id, offset }
    }

    pub fn is_null(&self) -> bool {
        *self == NULL_ADDRESS
    }

    /// Encodes as fixed 12 bytes, block id first.
    pub fn serialize(&self, out: &mut [u8]) {
        pbe::encode_u64(self.block_id, &mut out[..8]);
        pbe::encode_u32(self.offset, &mut out[8..12]);
    }

    /// Decodes the fixed 12-byte form.
    pub fn deserialize(buf: &[u8]) -> ColumnDataAddress {
        ColumnDataAddress {
            block_id: pbe::decode_u64(&buf[..8]),
            offset: pbe::decode_u32(&buf[8..12]),
        }
    }
}

impl fmt::Display for ColumnDataAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.block_id, self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnDataAddress, NULL_ADDRESS};

    #[test]
    fn address_roundtrip() {
        let addr = ColumnDataAddress::new(0x0102_0304_0506_0708, 0xdead_beef);
        let mut buf = [0u8; ColumnDataAddress::SERIALIZED_SIZE];
        addr.serialize(&mut buf);
        assert_eq!(ColumnDataAddress::deserialize(&buf), addr);
    }

    #[test]
    fn null_address() {
        assert!(NULL_ADDRESS.is_null());
        assert!(!ColumnDataAddress::new(1, 0).is_null());
    }
}
