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

//! Memory-mapped database counters: endianness marker, format version,
//! last transaction and atomic operation ids, the initialization
//! transaction parameters and the schema version.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use memmap::MmapMut;

use meridb_types::{pbe, TransactionParameters};

use crate::defs::METADATA_MARKER;

const MARKER_OFFSET: usize = 0;
// The version field is always little-endian, regardless of host order.
const VERSION_OFFSET: usize = 8;
const LAST_TRANSACTION_ID_OFFSET: usize = 16;
const LAST_ATOMIC_OP_ID_OFFSET: usize = 24;
const INIT_TRANSACTION_ID_OFFSET: usize = 32;
const INIT_TIMESTAMP_OFFSET: usize = 40;
const INIT_USER_ID_OFFSET: usize = 48;
const SCHEMA_VERSION_OFFSET: usize = 56;

/// Metadata file size.
pub const METADATA_SIZE: u64 = 64;

/// Current metadata format version.
pub const CURRENT_VERSION: u64 = 0;

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: u64 = 0;

pub struct DatabaseMetadata {
    map: MmapMut,
}

impl DatabaseMetadata {
    /// Creates the metadata file, stamping the initialization transaction.
    pub fn create(path: &Path, init: &TransactionParameters) -> io::Result<DatabaseMetadata> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(METADATA_SIZE)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut metadata = DatabaseMetadata { map };
        metadata.put(MARKER_OFFSET, METADATA_MARKER);
        pbe::encode_u64(
            CURRENT_VERSION,
            &mut metadata.map[VERSION_OFFSET..VERSION_OFFSET + 8],
        );
        metadata.put(LAST_TRANSACTION_ID_OFFSET, init.transaction_id);
        metadata.put(LAST_ATOMIC_OP_ID_OFFSET, 0);
        metadata.put(INIT_TRANSACTION_ID_OFFSET, init.transaction_id);
        metadata.put(INIT_TIMESTAMP_OFFSET, init.timestamp as u64);
        metadata.put_u32(INIT_USER_ID_OFFSET, init.user_id);
        metadata.put(SCHEMA_VERSION_OFFSET, CURRENT_SCHEMA_VERSION);
        metadata.map.flush()?;
        Ok(metadata)
    }

    /// Opens the metadata file, adjusting byte order if it was written on
    /// a machine of the opposite endianness.
    pub fn open(path: &Path) -> io::Result<DatabaseMetadata> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() != METADATA_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "database metadata file has wrong size",
            ));
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut metadata = DatabaseMetadata { map };
        metadata.adjust_byte_order()?;
        Ok(metadata)
    }

    fn get(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map[offset..offset + 8]);
        u64::from_ne_bytes(buf)
    }

    fn put(&mut self, offset: usize, value: u64) {
        self.map[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn put_u32(&mut self, offset: usize, value: u32) {
        self.map[offset..offset + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn get_u32(&self, offset: usize) -> u32 {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.map[offset..offset + 4]);
        u32::from_ne_bytes(buf)
    }

    /// Detects and repairs a foreign byte order. Returns whether the data
    /// was flipped.
    pub fn adjust_byte_order(&mut self) -> io::Result<bool> {
        let marker = self.get(MARKER_OFFSET);
        if marker == METADATA_MARKER {
            return Ok(false);
        }
        if marker.swap_bytes() != METADATA_MARKER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "database metadata marker mismatch",
            ));
        }
        for &offset in &[
            MARKER_OFFSET,
            LAST_TRANSACTION_ID_OFFSET,
            LAST_ATOMIC_OP_ID_OFFSET,
            INIT_TRANSACTION_ID_OFFSET,
            INIT_TIMESTAMP_OFFSET,
            SCHEMA_VERSION_OFFSET,
        ] {
            let v = self.get(offset);
            self.put(offset, v.swap_bytes());
        }
        let user = self.get_u32(INIT_USER_ID_OFFSET);
        self.put_u32(INIT_USER_ID_OFFSET, user.swap_bytes());
        self.map.flush()?;
        Ok(true)
    }

    /// Metadata format version (always stored little-endian).
    pub fn version(&self) -> u64 {
        pbe::decode_u64(&self.map[VERSION_OFFSET..VERSION_OFFSET + 8])
    }

    pub fn schema_version(&self) -> u64 {
        self.get(SCHEMA_VERSION_OFFSET)
    }

    pub fn init_transaction_params(&self) -> TransactionParameters {
        TransactionParameters {
            transaction_id: self.get(INIT_TRANSACTION_ID_OFFSET),
            timestamp: self.get(INIT_TIMESTAMP_OFFSET) as i64,
            user_id: self.get_u32(INIT_USER_ID_OFFSET),
        }
    }

    pub fn last_transaction_id(&self) -> u64 {
        self.get(LAST_TRANSACTION_ID_OFFSET)
    }

    pub fn generate_next_transaction_id(&mut self) -> u64 {
        let next = self.get(LAST_TRANSACTION_ID_OFFSET) + 1;
        self.put(LAST_TRANSACTION_ID_OFFSET, next);
        next
    }

    pub fn generate_next_atomic_operation_id(&mut self) -> u64 {
        let next = self.get(LAST_ATOMIC_OP_ID_OFFSET) + 1;
        self.put(LAST_ATOMIC_OP_ID_OFFSET, next);
        next
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.map.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::DatabaseMetadata;
    use meridb_types::TransactionParameters;
    use tempdir::TempDir;

    #[test]
    fn counters_advance_and_persist() {
        let dir = TempDir::new("db_metadata").unwrap();
        let path = dir.path().join("db_metadata");
        let init = TransactionParameters {
            transaction_id: 1,
            timestamp: 1_600_000_000,
            user_id: 1,
        };
        {
            let mut metadata = DatabaseMetadata::create(&path, &init).unwrap();
            assert_eq!(metadata.generate_next_transaction_id(), 2);
            assert_eq!(metadata.generate_next_transaction_id(), 3);
            assert_eq!(metadata.generate_next_atomic_operation_id(), 1);
            metadata.flush().unwrap();
        }
        let metadata = DatabaseMetadata::open(&path).unwrap();
        assert_eq!(metadata.last_transaction_id(), 3);
        assert_eq!(metadata.version(), 0);
        assert_eq!(metadata.init_transaction_params(), init);
    }

    #[test]
    fn byte_order_flip_is_an_involution() {
        let dir = TempDir::new("db_metadata").unwrap();
        let path = dir.path().join("db_metadata");
        let init = TransactionParameters {
            transaction_id: 7,
            timestamp: 1234,
            user_id: 42,
        };
        {
            let mut metadata = DatabaseMetadata::create(&path, &init).unwrap();
            // Pretend the file came from a foreign-endian machine.
            let marker = metadata.get(0);
            metadata.put(0, marker.swap_bytes());
            let txn = metadata.get(16);
            metadata.put(16, txn.swap_bytes());
            let atomic = metadata.get(24);
            metadata.put(24, atomic.swap_bytes());
            let init_txn = metadata.get(32);
            metadata.put(32, init_txn.swap_bytes());
            let ts = metadata.get(40);
            metadata.put(40, ts.swap_bytes());
            let user = metadata.get_u32(48);
            metadata.put_u32(48, user.swap_bytes());
            let schema = metadata.get(56);
            metadata.put(56, schema.swap_bytes());
            metadata.flush().unwrap();
        }
        let metadata = DatabaseMetadata::open(&path).unwrap();
        assert_eq!(metadata.init_transaction_params(), init);
        assert_eq!(metadata.last_transaction_id(), 7);
    }
}
