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

//! Per-column persistent record of every data block: previous block in the
//! chain and lifecycle state, indexed by 1-based block id. Write-through;
//! this file is the source of truth for block history traversal.

use std::io;
use std::path::Path;

use meridb_types::pbe;

use crate::column::block::DataBlockState;
use crate::defs::BLOCK_REGISTRY_FILE;
use crate::io::{FileBox, FileFactory};

// Record: prev_block_id u64 | state u8 | pad[7].
const RECORD_SIZE: u64 = 16;

pub struct BlockRegistry {
    file: FileBox,
    block_count: u64,
}

impl BlockRegistry {
    pub fn create(factory: &FileFactory, column_dir: &Path) -> io::Result<BlockRegistry> {
        let file = factory.create_file(&column_dir.join(BLOCK_REGISTRY_FILE), 0)?;
        Ok(BlockRegistry {
            file,
            block_count: 0,
        })
    }

    pub fn open(factory: &FileFactory, column_dir: &Path) -> io::Result<BlockRegistry> {
        let mut file = factory.open_file(&column_dir.join(BLOCK_REGISTRY_FILE))?;
        let size = file.file_size()?;
        if size % RECORD_SIZE != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("block registry size {} is not a whole record count", size),
            ));
        }
        Ok(BlockRegistry {
            file,
            block_count: size / RECORD_SIZE,
        })
    }

    /// Highest registered block id; 0 when the column has no blocks.
    pub fn last_block_id(&self) -> u64 {
        self.block_count
    }

    /// Registers the next block. Ids are dense and 1-based.
    pub fn add_block(
        &mut self,
        block_id: u64,
        prev_block_id: u64,
        state: DataBlockState,
    ) -> io::Result<()> {
        if block_id != self.block_count + 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "block id {} breaks registry sequence (next is {})",
                    block_id,
                    self.block_count + 1
                ),
            ));
        }
        let mut record = [0u8; RECORD_SIZE as usize];
        pbe::encode_u64(prev_block_id, &mut record[..8]);
        record[8] = state as u8;
        self.file.write_all_at(&record, (block_id - 1) * RECORD_SIZE)?;
        self.block_count = block_id;
        Ok(())
    }

    fn read_record(&mut self, block_id: u64) -> io::Result<[u8; RECORD_SIZE as usize]> {
        if block_id == 0 || block_id > self.block_count {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block {} is not registered", block_id),
            ));
        }
        let mut record = [0u8; RECORD_SIZE as usize];
        self.file.read_exact_at(&mut record, (block_id - 1) * RECORD_SIZE)?;
        Ok(record)
    }

    pub fn find_prev_block_id(&mut self, block_id: u64) -> io::Result<u64> {
        let record = self.read_record(block_id)?;
        Ok(pbe::decode_u64(&record[..8]))
    }

    pub fn block_state(&mut self, block_id: u64) -> io::Result<DataBlockState> {
        let record = self.read_record(block_id)?;
        DataBlockState::from_code(record[8]).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("block {} has invalid registry state", block_id),
            )
        })
    }

    pub fn update_block_state(
        &mut self,
        block_id: u64,
        state: DataBlockState,
    ) -> io::Result<()> {
        let mut record = self.read_record(block_id)?;
        record[8] = state as u8;
        self.file.write_all_at(&record, (block_id - 1) * RECORD_SIZE)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::BlockRegistry;
    use crate::column::block::DataBlockState;
    use crate::io::FileFactory;
    use tempdir::TempDir;

    #[test]
    fn add_and_traverse() {
        let dir = TempDir::new("block_registry").unwrap();
        let factory = FileFactory::plaintext();
        {
            let mut reg = BlockRegistry::create(&factory, dir.path()).unwrap();
            reg.add_block(1, 0, DataBlockState::Current).unwrap();
            reg.add_block(2, 1, DataBlockState::Current).unwrap();
            reg.add_block(3, 2, DataBlockState::Creating).unwrap();
            assert_eq!(reg.last_block_id(), 3);
            // Gaps in the sequence are rejected.
            assert!(reg.add_block(5, 3, DataBlockState::Creating).is_err());
        }
        let mut reg = BlockRegistry::open(&factory, dir.path()).unwrap();
        assert_eq!(reg.last_block_id(), 3);
        assert_eq!(reg.find_prev_block_id(3).unwrap(), 2);
        assert_eq!(reg.find_prev_block_id(1).unwrap(), 0);
        assert_eq!(reg.block_state(3).unwrap(), DataBlockState::Creating);
        assert!(reg.find_prev_block_id(4).is_err());

        reg.update_block_state(3, DataBlockState::Deleted).unwrap();
        assert_eq!(reg.block_state(3).unwrap(), DataBlockState::Deleted);
    }
}
