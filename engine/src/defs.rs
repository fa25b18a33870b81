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

//! Engine-wide constants: identifier ranges, directory layout, sizing.

// --- identifier ranges -------------------------------------------------
//
// Every object kind splits its 64-bit id space into a system range
// [0, FIRST_USER_*) and a user range [FIRST_USER_*, 2^64).

pub const FIRST_USER_USER_ID: u32 = 0x1000;
pub const FIRST_USER_DATABASE_ID: u32 = 0x1000;
pub const FIRST_USER_TABLE_ID: u32 = 0x10000;
pub const FIRST_USER_COLUMN_SET_ID: u64 = 0x100_0000;
pub const FIRST_USER_COLUMN_ID: u64 = 0x10_0000;
pub const FIRST_USER_COLUMN_SET_COLUMN_ID: u64 = 0x1000_0000;
pub const FIRST_USER_CONSTRAINT_DEFINITION_ID: u64 = 0x10_0000;
pub const FIRST_USER_CONSTRAINT_ID: u64 = 0x100_0000;
pub const FIRST_USER_COLUMN_DEFINITION_ID: u64 = 0x100_0000;
pub const FIRST_USER_COLUMN_DEFINITION_CONSTRAINT_ID: u64 = 0x1000_0000;
pub const FIRST_USER_INDEX_ID: u64 = 0x100_0000;
pub const FIRST_USER_INDEX_COLUMN_ID: u64 = 0x1000_0000;

// --- on-disk layout ----------------------------------------------------

/// Flag file whose presence marks a directory as fully initialized.
pub const INIT_FLAG_FILE: &str = "initialized";

/// Memory-mapped database counters file.
pub const METADATA_FILE: &str = "db_metadata";

/// Serialized catalog snapshot.
pub const SYSTEM_OBJECTS_FILE: &str = "system_objects";

/// Memory-mapped TRID counters file inside a master column directory.
pub const TRID_COUNTERS_FILE: &str = "trid";

/// File storing the id of the master column main index.
pub const MAIN_INDEX_ID_FILE: &str = "main_index_id";

/// Per-column block registry file.
pub const BLOCK_REGISTRY_FILE: &str = "block_registry";

pub const TABLE_DIR_PREFIX: &str = "t";
pub const COLUMN_DIR_PREFIX: &str = "c";
pub const MASTER_COLUMN_DIR_PREFIX: &str = "mc";
pub const INDEX_DIR_PREFIX: &str = "i";
pub const BLOCK_FILE_PREFIX: &str = "b";
pub const INDEX_FILE_PREFIX: &str = "i";
pub const DATA_FILE_EXTENSION: &str = ".dat";

// --- sizing ------------------------------------------------------------

/// Data area size of user-table column blocks.
pub const DEFAULT_BLOCK_DATA_AREA_SIZE: u32 = 0x10_0000;

/// Data area size of system-table column blocks.
pub const SYSTEM_BLOCK_DATA_AREA_SIZE: u32 = 0x4_0000;

/// Size of one index data file for user tables.
pub const DEFAULT_INDEX_DATA_FILE_SIZE: u32 = 0x40_0000;

/// Size of one index data file for system tables.
pub const SYSTEM_INDEX_DATA_FILE_SIZE: u32 = 0x8_0000;

/// Largest serialized master column record, including its size tag.
pub const MAX_MCR_SIZE: usize = 0x3fff;

/// LOBs below this size are materialized, larger ones are streamed.
pub const SMALL_LOB_SIZE_LIMIT: usize = 0x10_0000;

/// Minimum usable space a block must offer for the next LOB chunk.
pub const BLOCK_FREE_SPACE_THRESHOLD_FOR_LOB: u32 = 0x100;

/// TRID counters file marker, native byte order.
pub const TRID_COUNTERS_MARKER: u64 = 0x1234_5678_90ab_cdef;

/// Database metadata file marker, native byte order.
pub const METADATA_MARKER: u64 = 0x0123_4567_89ab_cdef;

/// Master column name; required on every table, type UINT64.
pub const MASTER_COLUMN_NAME: &str = "TRID";

/// Name of the system database.
pub const SYSTEM_DATABASE_NAME: &str = "SYS";

/// Id of the system database.
pub const SYSTEM_DATABASE_ID: u32 = 1;

/// Id of the superuser.
pub const SUPER_USER_ID: u32 = 1;

/// Rounds `value` up to a multiple of `alignment` (a power of two).
pub fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

/// Rounds `value` down to a multiple of `alignment` (a power of two).
pub fn align_down(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    value & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::{align_down, align_up};

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0, 16), 0);
        assert_eq!(align_up(1, 16), 16);
        assert_eq!(align_up(16, 16), 16);
        assert_eq!(align_up(17, 16), 32);
        assert_eq!(align_down(0, 16), 0);
        assert_eq!(align_down(15, 16), 0);
        assert_eq!(align_down(16, 16), 16);
        assert_eq!(align_down(31, 16), 16);
    }
}
