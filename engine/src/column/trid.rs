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

//! Memory-mapped TRID counters of a master column: an endianness marker
//! followed by the last user and last system row ids. Updates are whole
//! native words performed under the owning column's lock.

use std::fs::OpenOptions;
use std::io;
use std::path::Path;

use memmap::MmapMut;

use crate::defs::TRID_COUNTERS_MARKER;

const MARKER_OFFSET: usize = 0;
const LAST_USER_TRID_OFFSET: usize = 8;
const LAST_SYSTEM_TRID_OFFSET: usize = 16;

/// Counters file size.
pub const TRID_COUNTERS_SIZE: u64 = 24;

pub struct TridCounters {
    map: MmapMut,
}

impl TridCounters {
    /// Creates the counters file for a master column.
    ///
    /// The user counter starts one before the first user TRID; the system
    /// counter starts at zero, or saturated when the table has no system
    /// range at all.
    pub fn create(path: &Path, first_user_trid: u64) -> io::Result<TridCounters> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        file.set_len(TRID_COUNTERS_SIZE)?;
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut counters = TridCounters { map };
        counters.put(MARKER_OFFSET, TRID_COUNTERS_MARKER);
        counters.put(
            LAST_USER_TRID_OFFSET,
            first_user_trid.saturating_sub(1),
        );
        counters.put(
            LAST_SYSTEM_TRID_OFFSET,
            if first_user_trid < 2 { u64::max_value() } else { 0 },
        );
        counters.map.flush()?;
        Ok(counters)
    }

    /// Opens an existing counters file, adjusting byte order when the file
    /// was written on a machine of the opposite endianness.
    pub fn open(path: &Path) -> io::Result<TridCounters> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        if file.metadata()?.len() != TRID_COUNTERS_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "TRID counters file has wrong size",
            ));
        }
        let map = unsafe { MmapMut::map_mut(&file)? };
        let mut counters = TridCounters { map };
        let marker = counters.get(MARKER_OFFSET);
        if marker != TRID_COUNTERS_MARKER {
            if marker.swap_bytes() != TRID_COUNTERS_MARKER {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "TRID counters file marker mismatch",
                ));
            }
            counters.flip_byte_order();
            counters.map.flush()?;
        }
        Ok(counters)
    }

    fn get(&self, offset: usize) -> u64 {
        let mut buf = [0u8; 8];
        buf.copy_from_slice(&self.map[offset..offset + 8]);
        u64::from_ne_bytes(buf)
    }

    fn put(&mut self, offset: usize, value: u64) {
        self.map[offset..offset + 8].copy_from_slice(&value.to_ne_bytes());
    }

    fn flip_byte_order(&mut self) {
        for &offset in &[MARKER_OFFSET, LAST_USER_TRID_OFFSET, LAST_SYSTEM_TRID_OFFSET] {
            let v = self.get(offset);
            self.put(offset, v.swap_bytes());
        }
    }

    pub fn last_user_trid(&self) -> u64 {
        self.get(LAST_USER_TRID_OFFSET)
    }

    pub fn last_system_trid(&self) -> u64 {
        self.get(LAST_SYSTEM_TRID_OFFSET)
    }

    pub fn set_last_user_trid(&mut self, value: u64) {
        self.put(LAST_USER_TRID_OFFSET, value);
    }

    pub fn set_last_system_trid(&mut self, value: u64) {
        self.put(LAST_SYSTEM_TRID_OFFSET, value);
    }

    /// Synchronizes the mapping with the file.
    pub fn flush(&mut self) -> io::Result<()> {
        self.map.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::TridCounters;
    use tempdir::TempDir;

    #[test]
    fn create_initializes_ranges() {
        let dir = TempDir::new("trid_counters").unwrap();
        let path = dir.path().join("trid");
        let counters = TridCounters::create(&path, 0x10000).unwrap();
        assert_eq!(counters.last_user_trid(), 0xffff);
        assert_eq!(counters.last_system_trid(), 0);
    }

    #[test]
    fn counters_persist_across_reopen() {
        let dir = TempDir::new("trid_counters").unwrap();
        let path = dir.path().join("trid");
        {
            let mut counters = TridCounters::create(&path, 1).unwrap();
            counters.set_last_user_trid(41);
            counters.flush().unwrap();
        }
        let counters = TridCounters::open(&path).unwrap();
        assert_eq!(counters.last_user_trid(), 41);
        // A table whose user range starts at 1 has no system range.
        assert_eq!(counters.last_system_trid(), u64::max_value());
    }

    #[test]
    fn byte_order_flip_is_an_involution() {
        let dir = TempDir::new("trid_counters").unwrap();
        let path = dir.path().join("trid");
        {
            let mut counters = TridCounters::create(&path, 100).unwrap();
            counters.set_last_user_trid(0x0102_0304_0506_0708);
            counters.set_last_system_trid(5);
            counters.flush().unwrap();
            // Simulate a file written with the opposite endianness.
            counters.flip_byte_order();
            counters.flush().unwrap();
        }
        let counters = TridCounters::open(&path).unwrap();
        assert_eq!(counters.last_user_trid(), 0x0102_0304_0506_0708);
        assert_eq!(counters.last_system_trid(), 5);
    }

    #[test]
    fn garbage_marker_is_rejected() {
        let dir = TempDir::new("trid_counters").unwrap();
        let path = dir.path().join("trid");
        std::fs::write(&path, vec![0u8; 24]).unwrap();
        assert!(TridCounters::open(&path).is_err());
    }
}
