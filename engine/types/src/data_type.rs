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

/// Column data type. The discriminant is the persistent on-disk code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ColumnDataType {
    Bool = 0,
    Int8 = 1,
    UInt8 = 2,
    Int16 = 3,
    UInt16 = 4,
    Int32 = 5,
    UInt32 = 6,
    Int64 = 7,
    UInt64 = 8,
    Float = 9,
    Double = 10,
    Text = 11,
    Binary = 12,
    Timestamp = 13,
}

impl ColumnDataType {
    /// Decodes the persistent type code.
    pub fn from_code(code: u8) -> Option<ColumnDataType> {
        use self::ColumnDataType::*;
        Some(match code {
            0 => Bool,
            1 => Int8,
            2 => UInt8,
            3 => Int16,
            4 => UInt16,
            5 => Int32,
            6 => UInt32,
            7 => Int64,
            8 => UInt64,
            9 => Float,
            10 => Double,
            11 => Text,
            12 => Binary,
            13 => Timestamp,
            _ => return None,
        })
    }

    /// Minimum record width in a data block: the fixed width for scalar
    /// types, the LOB chunk header size for TEXT/BINARY, and the packed
    /// date-time maximum for TIMESTAMP.
    pub fn min_record_width(self) -> u32 {
        use self::ColumnDataType::*;
        match self {
            Bool | Int8 | UInt8 => 1,
            Int16 | UInt16 => 2,
            Int32 | UInt32 | Float => 4,
            Int64 | UInt64 | Double => 8,
            // LOB chunk header
            Text | Binary => 20,
            // date part + time part
            Timestamp => 12,
        }
    }

    /// SQL-ish display name.
    pub fn name(self) -> &'static str {
        use self::ColumnDataType::*;
        match self {
            Bool => "BOOL",
            Int8 => "INT8",
            UInt8 => "UINT8",
            Int16 => "INT16",
            UInt16 => "UINT16",
            Int32 => "INT32",
            UInt32 => "UINT32",
            Int64 => "INT64",
            UInt64 => "UINT64",
            Float => "FLOAT",
            Double => "DOUBLE",
            Text => "TEXT",
            Binary => "BINARY",
            Timestamp => "TIMESTAMP",
        }
    }
}

impl fmt::Display for ColumnDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::ColumnDataType;

    #[test]
    fn type_codes_roundtrip() {
        for code in 0..=13u8 {
            let ty = ColumnDataType::from_code(code).unwrap();
            assert_eq!(ty as u8, code);
        }
        assert!(ColumnDataType::from_code(14).is_none());
    }
}
