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

//! Column data block: a fixed-size file holding a header and an append-only
//! record area.

use std::io;
use std::path::{Path, PathBuf};

use keccak_hash::keccak;

use meridb_types::pbe;

use crate::defs::{BLOCK_FILE_PREFIX, DATA_FILE_EXTENSION};
use crate::io::{FileBox, FileFactory};

/// Size of the on-disk block header.
pub const BLOCK_HEADER_SIZE: u32 = 64;

const BLOCK_MAGIC: u64 = 0x4d52_4442_424c_4b30; // "MRDBBLK0"

// Header layout: magic u64 | block_id u64 | prev_block_id u64 | state u8 |
// pad[3] | next_data_pos u32 | digest[32].
const DIGEST_OFFSET: usize = 32;

/// Block lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataBlockState {
    Creating = 0,
    Current = 1,
    Closed = 2,
    Deleted = 3,
}

impl DataBlockState {
    pub fn from_code(code: u8) -> Option<DataBlockState> {
        Some(match code {
            0 => DataBlockState::Creating,
            1 => DataBlockState::Current,
            2 => DataBlockState::Closed,
            3 => DataBlockState::Deleted,
            _ => return None,
        })
    }
}

/// An open column data block file.
pub struct DataBlock {
    file: FileBox,
    block_id: u64,
    prev_block_id: u64,
    state: DataBlockState,
    next_data_pos: u32,
    data_area_size: u32,
    header_dirty: bool,
}

/// Path of block `block_id` inside a column directory.
pub fn block_file_path(column_dir: &Path, block_id: u64) -> PathBuf {
    column_dir.join(format!("{}{}{}", BLOCK_FILE_PREFIX, block_id, DATA_FILE_EXTENSION))
}

impl DataBlock {
    /// Creates a new block file sized header + data area.
    pub fn create(
        factory: &FileFactory,
        column_dir: &Path,
        block_id: u64,
        prev_block_id: u64,
        state: DataBlockState,
        data_area_size: u32,
    ) -> io::Result<DataBlock> {
        let path = block_file_path(column_dir, block_id);
        let file = factory.create_file(&path, u64::from(BLOCK_HEADER_SIZE + data_area_size))?;
        let mut block = DataBlock {
            file,
            block_id,
            prev_block_id,
            state,
            next_data_pos: 0,
            data_area_size,
            header_dirty: true,
        };
        block.save_header()?;
        Ok(block)
    }

    /// Opens an existing block file and verifies its header.
    pub fn open(
        factory: &FileFactory,
        column_dir: &Path,
        block_id: u64,
        data_area_size: u32,
    ) -> io::Result<DataBlock> {
        let path = block_file_path(column_dir, block_id);
        let mut file = factory.open_file(&path)?;
        let mut header = [0u8; BLOCK_HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)?;

        let digest = keccak(&header[..DIGEST_OFFSET]);
        if digest.as_bytes() != &header[DIGEST_OFFSET..] {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("block {} header digest mismatch", block_id),
            ));
        }
        if pbe::decode_u64(&header[..8]) != BLOCK_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("block {} has invalid magic", block_id),
            ));
        }
        let stored_id = pbe::decode_u64(&header[8..16]);
        if stored_id != block_id {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("block file {} records block id {}", block_id, stored_id),
            ));
        }
        let state = DataBlockState::from_code(header[24]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("block {} has invalid state", block_id),
            )
        })?;
        let next_data_pos = pbe::decode_u32(&header[28..32]);
        if next_data_pos > data_area_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("block {} data position out of range", block_id),
            ));
        }

        Ok(DataBlock {
            file,
            block_id,
            prev_block_id: pbe::decode_u64(&header[16..24]),
            state,
            next_data_pos,
            data_area_size,
            header_dirty: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.block_id
    }

    pub fn prev_block_id(&self) -> u64 {
        self.prev_block_id
    }

    pub fn state(&self) -> DataBlockState {
        self.state
    }

    pub fn set_state(&mut self, state: DataBlockState) {
        if self.state != state {
            self.state = state;
            self.header_dirty = true;
        }
    }

    pub fn next_data_pos(&self) -> u32 {
        self.next_data_pos
    }

    /// Rolls the append position back; used only by rollback.
    pub fn set_next_data_pos(&mut self, pos: u32) {
        debug_assert!(pos <= self.data_area_size);
        if self.next_data_pos != pos {
            self.next_data_pos = pos;
            self.header_dirty = true;
        }
    }

    /// Advances the append position by `n` bytes.
    pub fn inc_next_data_pos(&mut self, n: u32) {
        debug_assert!(self.next_data_pos + n <= self.data_area_size);
        self.next_data_pos += n;
        self.header_dirty = true;
    }

    pub fn data_area_size(&self) -> u32 {
        self.data_area_size
    }

    pub fn free_data_space(&self) -> u32 {
        self.data_area_size - self.next_data_pos
    }

    /// Reads from the data area at `offset`.
    pub fn read_data(&mut self, buf: &mut [u8], offset: u32) -> io::Result<()> {
        if u64::from(offset) + buf.len() as u64 > u64::from(self.data_area_size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "read of {} bytes at {} beyond block {} data area",
                    buf.len(),
                    offset,
                    self.block_id
                ),
            ));
        }
        self.file
            .read_exact_at(buf, u64::from(BLOCK_HEADER_SIZE) + u64::from(offset))
    }

    /// Writes into the data area at `offset`. Does not advance the append
    /// position.
    pub fn write_data(&mut self, buf: &[u8], offset: u32) -> io::Result<()> {
        if u64::from(offset) + buf.len() as u64 > u64::from(self.data_area_size) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "write of {} bytes at {} beyond block {} data area",
                    buf.len(),
                    offset,
                    self.block_id
                ),
            ));
        }
        self.file
            .write_all_at(buf, u64::from(BLOCK_HEADER_SIZE) + u64::from(offset))
    }

    /// Appends at the current data position; the caller advances the
    /// position separately once the whole record went in.
    pub fn append_data(&mut self, buf: &[u8]) -> io::Result<()> {
        let pos = self.next_data_pos;
        self.write_data(buf, pos)
    }

    fn save_header(&mut self) -> io::Result<()> {
        let mut header = [0u8; BLOCK_HEADER_SIZE as usize];
        pbe::encode_u64(BLOCK_MAGIC, &mut header[..8]);
        pbe::encode_u64(self.block_id, &mut header[8..16]);
        pbe::encode_u64(self.prev_block_id, &mut header[16..24]);
        header[24] = self.state as u8;
        pbe::encode_u32(self.next_data_pos, &mut header[28..32]);
        let digest = keccak(&header[..DIGEST_OFFSET]);
        header[DIGEST_OFFSET..].copy_from_slice(digest.as_bytes());
        self.file.write_all_at(&header, 0)?;
        self.header_dirty = false;
        Ok(())
    }

    /// Persists the header if needed and flushes the file.
    pub fn flush(&mut self) -> io::Result<()> {
        if self.header_dirty {
            self.save_header()?;
        }
        self.file.flush()
    }

    /// Persists header changes without an fsync.
    pub fn save(&mut self) -> io::Result<()> {
        if self.header_dirty {
            self.save_header()?;
        }
        Ok(())
    }
}

// Blocks may be dropped by cache eviction; the header must not be lost.
impl Drop for DataBlock {
    fn drop(&mut self) {
        if self.header_dirty {
            if let Err(e) = self.save_header() {
                log::error!(target: "engine", "failed to save header of block {}: {}", self.block_id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{DataBlock, DataBlockState};
    use crate::io::FileFactory;
    use tempdir::TempDir;

    #[test]
    fn create_write_reopen() {
        let dir = TempDir::new("data_block").unwrap();
        let factory = FileFactory::plaintext();
        {
            let mut block = DataBlock::create(
                &factory,
                dir.path(),
                1,
                0,
                DataBlockState::Current,
                4096,
            )
            .unwrap();
            block.append_data(b"record-1").unwrap();
            block.inc_next_data_pos(8);
            block.append_data(b"record-2").unwrap();
            block.inc_next_data_pos(8);
            assert_eq!(block.free_data_space(), 4096 - 16);
            block.flush().unwrap();
        }
        let mut block = DataBlock::open(&factory, dir.path(), 1, 4096).unwrap();
        assert_eq!(block.next_data_pos(), 16);
        assert_eq!(block.state(), DataBlockState::Current);
        let mut buf = [0u8; 8];
        block.read_data(&mut buf, 8).unwrap();
        assert_eq!(&buf, b"record-2");
    }

    #[test]
    fn corrupted_header_is_rejected() {
        let dir = TempDir::new("data_block").unwrap();
        let factory = FileFactory::plaintext();
        {
            let mut block =
                DataBlock::create(&factory, dir.path(), 3, 2, DataBlockState::Creating, 512)
                    .unwrap();
            block.flush().unwrap();
        }
        // Flip one header byte on disk.
        let path = super::block_file_path(dir.path(), 3);
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[9] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();
        assert!(DataBlock::open(&factory, dir.path(), 3, 512).is_err());
    }

    #[test]
    fn out_of_area_access_fails() {
        let dir = TempDir::new("data_block").unwrap();
        let factory = FileFactory::plaintext();
        let mut block =
            DataBlock::create(&factory, dir.path(), 1, 0, DataBlockState::Current, 64).unwrap();
        assert!(block.write_data(&[0u8; 65], 0).is_err());
        let mut buf = [0u8; 16];
        assert!(block.read_data(&mut buf, 60).is_err());
    }
}
