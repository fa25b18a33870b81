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

//! Common types shared between the storage engine, the wire protocol
//! and the server shell.

mod address;
mod data_type;
mod datetime;
mod object_name;
pub mod pbe;
mod txparams;
mod value;

pub use address::{ColumnDataAddress, NULL_ADDRESS};
pub use data_type::ColumnDataType;
pub use datetime::RawDateTime;
pub use object_name::is_valid_object_name;
pub use txparams::{unix_timestamp, TransactionParameters};
pub use value::{BlobStream, CastError, ClobStream, LobStream, Value, ValueKind};

/// Database UUID: 16 raw bytes rendered as canonical hex groups.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uuid(pub [u8; 16]);

impl std::fmt::Display for Uuid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if i == 4 || i == 6 || i == 8 || i == 10 {
                write!(f, "-")?;
            }
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::Uuid;

    #[test]
    fn uuid_display_is_canonical() {
        let uuid = Uuid([
            0x12, 0x34, 0x56, 0x78, 0x9a, 0xbc, 0xde, 0xf0, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66,
            0x77, 0x88,
        ]);
        assert_eq!(uuid.to_string(), "12345678-9abc-def0-1122-334455667788");
    }
}
