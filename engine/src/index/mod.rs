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

//! Ordered key → value map over fixed-width keys, one directory per index.
//!
//! Keys order as unsigned big-endian lexicographic byte strings, which
//! matches plain-binary-encoded integer order. Mutations are applied to an
//! in-memory ordered map; `flush` bulk-loads a fresh B+ tree image into the
//! `i<n>.dat` data files (leaves chained left to right, internal levels
//! built bottom-up) and `open` restores the map by walking the leaf chain.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};

use meridb_types::pbe;

use crate::defs::{DATA_FILE_EXTENSION, INDEX_FILE_PREFIX, INIT_FLAG_FILE};
use crate::error::{Error, Result};
use crate::io::{FileBox, FileFactory};

/// Index page size in plaintext bytes.
pub const PAGE_SIZE: u32 = 8192;

const INDEX_MAGIC: u64 = 0x4d52_4442_4958_4430; // "MRDBIXD0"
const HEADER_PAGE: u64 = 0;
const LEAF_TAG: u8 = 1;
const INTERNAL_TAG: u8 = 2;
const LEAF_HEADER_SIZE: usize = 11; // tag + count u16 + next_leaf u64
const INTERNAL_HEADER_SIZE: usize = 3; // tag + count u16

/// Unique ordered index over fixed-width keys and values.
pub struct BTreeIndex {
    id: u64,
    name: String,
    unique: bool,
    key_size: usize,
    value_size: usize,
    data_file_size: u32,
    pages_per_file: u64,
    dir: PathBuf,
    factory: FileFactory,
    map: BTreeMap<Vec<u8>, Vec<Vec<u8>>>,
    files: HashMap<u64, FileBox>,
}

impl BTreeIndex {
    /// Creates a new index directory with an empty tree image.
    pub fn create(
        factory: FileFactory,
        dir: PathBuf,
        id: u64,
        name: String,
        key_size: usize,
        value_size: usize,
        data_file_size: u32,
        unique: bool,
    ) -> Result<BTreeIndex> {
        assert!(key_size > 0 && value_size > 0);
        assert!(
            key_size + value_size + LEAF_HEADER_SIZE + 2 <= PAGE_SIZE as usize,
            "key/value pair must fit one index page"
        );
        assert!(data_file_size >= 2 * PAGE_SIZE && data_file_size % PAGE_SIZE == 0);

        if dir.join(INIT_FLAG_FILE).exists() {
            return Err(Error::internal(format!(
                "index directory {} already initialized",
                dir.display()
            )));
        }
        if dir.exists() {
            std::fs::remove_dir_all(&dir)
                .map_err(|e| Error::io(format!("remove stale index dir {}", dir.display()), e))?;
        }
        std::fs::create_dir_all(&dir)
            .map_err(|e| Error::io(format!("create index dir {}", dir.display()), e))?;

        let mut index = BTreeIndex {
            id,
            name,
            unique,
            key_size,
            value_size,
            data_file_size,
            pages_per_file: u64::from(data_file_size / PAGE_SIZE),
            dir,
            factory,
            map: BTreeMap::new(),
            files: HashMap::new(),
        };
        index.write_image()?;
        crate::database::write_init_flag(&index.dir)?;
        Ok(index)
    }

    /// Opens an existing index and restores the key map from the leaf
    /// chain.
    pub fn open(
        factory: FileFactory,
        dir: PathBuf,
        id: u64,
        name: String,
        key_size: usize,
        value_size: usize,
        data_file_size: u32,
        unique: bool,
    ) -> Result<BTreeIndex> {
        if !dir.join(INIT_FLAG_FILE).exists() {
            return Err(Error::internal(format!(
                "index directory {} is not initialized",
                dir.display()
            )));
        }
        let mut index = BTreeIndex {
            id,
            name,
            unique,
            key_size,
            value_size,
            data_file_size,
            pages_per_file: u64::from(data_file_size / PAGE_SIZE),
            dir,
            factory,
            map: BTreeMap::new(),
            files: HashMap::new(),
        };
        index.load_image()?;
        Ok(index)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn data_file_size(&self) -> u32 {
        self.data_file_size
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> usize {
        self.map.len()
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() != self.key_size {
            return Err(Error::internal(format!(
                "index {}: key of {} bytes, expected {}",
                self.name,
                key.len(),
                self.key_size
            )));
        }
        Ok(())
    }

    fn check_value(&self, value: &[u8]) -> Result<()> {
        if value.len() != self.value_size {
            return Err(Error::internal(format!(
                "index {}: value of {} bytes, expected {}",
                self.name,
                value.len(),
                self.value_size
            )));
        }
        Ok(())
    }

    /// Ensures a slot for `key` exists. Returns whether it was newly
    /// created.
    pub fn preallocate(&mut self, key: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        if self.map.contains_key(key) {
            return Ok(false);
        }
        self.map.insert(key.to_vec(), Vec::new());
        Ok(true)
    }

    /// Inserts a key/value pair. For a unique index, returns false when a
    /// value for the key is already present.
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<bool> {
        self.check_key(key)?;
        self.check_value(value)?;
        let values = self.map.entry(key.to_vec()).or_insert_with(Vec::new);
        if self.unique && !values.is_empty() {
            return Ok(false);
        }
        values.push(value.to_vec());
        Ok(true)
    }

    /// Replaces all values of `key`. Returns the number of replaced
    /// values; 0 when the key is absent.
    pub fn update(&mut self, key: &[u8], value: &[u8]) -> Result<u64> {
        self.check_key(key)?;
        self.check_value(value)?;
        match self.map.get_mut(key) {
            Some(values) if !values.is_empty() => {
                let n = values.len() as u64;
                values.clear();
                values.push(value.to_vec());
                Ok(n)
            }
            _ => Ok(0),
        }
    }

    /// Removes `key`; returns the number of removed values.
    pub fn erase(&mut self, key: &[u8]) -> Result<u64> {
        self.check_key(key)?;
        Ok(self.map.remove(key).map(|v| v.len() as u64).unwrap_or(0))
    }

    /// Copies up to `max` values of `key` into the result.
    pub fn find(&self, key: &[u8], max: usize) -> Result<Vec<Vec<u8>>> {
        self.check_key(key)?;
        Ok(self
            .map
            .get(key)
            .map(|values| values.iter().take(max).cloned().collect())
            .unwrap_or_default())
    }

    /// Number of values stored under `key`.
    pub fn count(&self, key: &[u8]) -> Result<u64> {
        self.check_key(key)?;
        Ok(self.map.get(key).map(|v| v.len() as u64).unwrap_or(0))
    }

    /// Smallest key; may be served from the in-memory state.
    pub fn min_key(&self) -> Option<Vec<u8>> {
        self.map.keys().next().cloned()
    }

    /// Largest key; may be served from the in-memory state.
    pub fn max_key(&self) -> Option<Vec<u8>> {
        self.map.keys().next_back().cloned()
    }

    /// Smallest key of the on-disk image.
    pub fn first_key(&mut self) -> Result<Option<Vec<u8>>> {
        let header = self.read_header()?;
        if header.leaf_count == 0 {
            return Ok(None);
        }
        let page = self.read_page(1)?;
        let entries = self.parse_leaf(&page)?.1;
        Ok(entries.into_iter().next().map(|(k, _)| k))
    }

    /// Largest key of the on-disk image.
    pub fn last_key(&mut self) -> Result<Option<Vec<u8>>> {
        let header = self.read_header()?;
        if header.leaf_count == 0 {
            return Ok(None);
        }
        let page = self.read_page(header.leaf_count)?;
        let entries = self.parse_leaf(&page)?.1;
        Ok(entries.into_iter().next_back().map(|(k, _)| k))
    }

    /// Strictly preceding key.
    pub fn find_previous_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        Ok(self
            .map
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(k, _)| k.clone()))
    }

    /// Strictly following key.
    pub fn find_next_key(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.check_key(key)?;
        Ok(self
            .map
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.clone()))
    }

    /// Writes a fresh tree image and syncs the data files.
    pub fn flush(&mut self) -> Result<()> {
        self.write_image()?;
        let name = self.name.clone();
        for file in self.files.values_mut() {
            file.flush()
                .map_err(|e| Error::io(format!("flush index {}", name), e))?;
        }
        Ok(())
    }

    // --- paging ---------------------------------------------------------

    fn file_path(&self, file_id: u64) -> PathBuf {
        self.dir
            .join(format!("{}{}{}", INDEX_FILE_PREFIX, file_id, DATA_FILE_EXTENSION))
    }

    fn file_for_page(&mut self, page: u64, create: bool) -> Result<&mut FileBox> {
        let file_id = page / self.pages_per_file + 1;
        if !self.files.contains_key(&file_id) {
            let path = self.file_path(file_id);
            let file = if path.exists() {
                self.factory
                    .open_file(&path)
                    .map_err(|e| Error::io(format!("open index file {}", path.display()), e))?
            } else if create {
                self.factory
                    .create_file(&path, u64::from(self.data_file_size))
                    .map_err(|e| Error::io(format!("create index file {}", path.display()), e))?
            } else {
                return Err(Error::internal(format!(
                    "index file {} is missing",
                    path.display()
                )));
            };
            self.files.insert(file_id, file);
        }
        Ok(self.files.get_mut(&file_id).expect("file was just inserted; qed"))
    }

    fn read_page(&mut self, page: u64) -> Result<Vec<u8>> {
        let offset = (page % self.pages_per_file) * u64::from(PAGE_SIZE);
        let name = self.name.clone();
        let file = self.file_for_page(page, false)?;
        let mut buf = vec![0u8; PAGE_SIZE as usize];
        file.read_exact_at(&mut buf, offset)
            .map_err(|e| Error::io(format!("read index {} page {}", name, page), e))?;
        Ok(buf)
    }

    fn write_page(&mut self, page: u64, data: &[u8]) -> Result<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE as usize);
        let offset = (page % self.pages_per_file) * u64::from(PAGE_SIZE);
        let name = self.name.clone();
        let file = self.file_for_page(page, true)?;
        file.write_all_at(data, offset)
            .map_err(|e| Error::io(format!("write index {} page {}", name, page), e))
    }

    fn read_header(&mut self) -> Result<ImageHeader> {
        let page = self.read_page(HEADER_PAGE)?;
        let magic = pbe::decode_u64(&page[..8]);
        if magic != INDEX_MAGIC {
            return Err(Error::internal(format!(
                "index {} has invalid image magic",
                self.name
            )));
        }
        let key_size = pbe::decode_u32(&page[8..12]) as usize;
        let value_size = pbe::decode_u32(&page[12..16]) as usize;
        if key_size != self.key_size || value_size != self.value_size {
            return Err(Error::internal(format!(
                "index {} image geometry mismatch: {}+{} on disk, {}+{} expected",
                self.name, key_size, value_size, self.key_size, self.value_size
            )));
        }
        Ok(ImageHeader {
            key_count: pbe::decode_u64(&page[16..24]),
            leaf_count: pbe::decode_u64(&page[24..32]),
            root_page: pbe::decode_u64(&page[32..40]),
            page_count: pbe::decode_u64(&page[40..48]),
        })
    }

    fn parse_leaf(&self, page: &[u8]) -> Result<(u64, BTreeMap<Vec<u8>, Vec<Vec<u8>>>)> {
        if page[0] != LEAF_TAG {
            return Err(Error::internal(format!(
                "index {}: expected leaf page",
                self.name
            )));
        }
        let count = pbe::decode_u16(&page[1..3]) as usize;
        let next_leaf = pbe::decode_u64(&page[3..11]);
        let mut entries = BTreeMap::new();
        let mut pos = LEAF_HEADER_SIZE;
        for _ in 0..count {
            let key = page[pos..pos + self.key_size].to_vec();
            pos += self.key_size;
            let value_count = pbe::decode_u16(&page[pos..pos + 2]) as usize;
            pos += 2;
            let mut values = Vec::with_capacity(value_count);
            for _ in 0..value_count {
                values.push(page[pos..pos + self.value_size].to_vec());
                pos += self.value_size;
            }
            entries.insert(key, values);
        }
        Ok((next_leaf, entries))
    }

    fn load_image(&mut self) -> Result<()> {
        let header = self.read_header()?;
        self.map.clear();
        let mut page_no = if header.leaf_count > 0 { 1 } else { 0 };
        while page_no != 0 {
            let page = self.read_page(page_no)?;
            let (next_leaf, entries) = self.parse_leaf(&page)?;
            self.map.extend(entries);
            page_no = next_leaf;
        }
        if self.map.len() as u64 != header.key_count {
            return Err(Error::internal(format!(
                "index {}: image header records {} keys, found {}",
                self.name,
                header.key_count,
                self.map.len()
            )));
        }
        Ok(())
    }

    fn write_image(&mut self) -> Result<()> {
        // Build leaves.
        let mut leaves: Vec<Vec<u8>> = Vec::new();
        let mut leaf_separators: Vec<Vec<u8>> = Vec::new();
        {
            let mut page = vec![0u8; PAGE_SIZE as usize];
            let mut pos = LEAF_HEADER_SIZE;
            let mut count: u16 = 0;
            let mut last_key: Option<Vec<u8>> = None;
            for (key, values) in &self.map {
                let entry_size = self.key_size + 2 + values.len() * self.value_size;
                if pos + entry_size > PAGE_SIZE as usize {
                    page[0] = LEAF_TAG;
                    pbe::encode_u16(count, &mut page[1..3]);
                    leaves.push(std::mem::replace(&mut page, vec![0u8; PAGE_SIZE as usize]));
                    leaf_separators
                        .push(last_key.take().expect("non-empty leaf has a last key; qed"));
                    pos = LEAF_HEADER_SIZE;
                    count = 0;
                }
                page[pos..pos + self.key_size].copy_from_slice(key);
                pos += self.key_size;
                pbe::encode_u16(values.len() as u16, &mut page[pos..pos + 2]);
                pos += 2;
                for value in values {
                    page[pos..pos + self.value_size].copy_from_slice(value);
                    pos += self.value_size;
                }
                count += 1;
                last_key = Some(key.clone());
            }
            if count > 0 {
                page[0] = LEAF_TAG;
                pbe::encode_u16(count, &mut page[1..3]);
                leaves.push(page);
                leaf_separators.push(last_key.expect("non-empty leaf has a last key; qed"));
            }
        }

        // Chain leaves: leaf i lives on page i + 1.
        let leaf_count = leaves.len() as u64;
        for (i, leaf) in leaves.iter_mut().enumerate() {
            let next = if (i as u64) + 1 < leaf_count {
                i as u64 + 2
            } else {
                0
            };
            pbe::encode_u64(next, &mut leaf[3..11]);
        }

        // Build internal levels bottom-up over (separator key, child page).
        let mut next_page = leaf_count + 1;
        let mut level: Vec<(Vec<u8>, u64)> = leaf_separators
            .into_iter()
            .zip((1..=leaf_count).into_iter())
            .collect();
        let mut internal_pages: Vec<(u64, Vec<u8>)> = Vec::new();
        let entry_size = self.key_size + 8;
        let per_page = (PAGE_SIZE as usize - INTERNAL_HEADER_SIZE) / entry_size;
        while level.len() > 1 {
            let mut upper: Vec<(Vec<u8>, u64)> = Vec::new();
            for group in level.chunks(per_page) {
                let mut page = vec![0u8; PAGE_SIZE as usize];
                page[0] = INTERNAL_TAG;
                pbe::encode_u16(group.len() as u16, &mut page[1..3]);
                let mut pos = INTERNAL_HEADER_SIZE;
                for (key, child) in group {
                    page[pos..pos + self.key_size].copy_from_slice(key);
                    pos += self.key_size;
                    pbe::encode_u64(*child, &mut page[pos..pos + 8]);
                    pos += 8;
                }
                let page_no = next_page;
                next_page += 1;
                internal_pages.push((page_no, page));
                upper.push((
                    group.last().expect("chunks are non-empty; qed").0.clone(),
                    page_no,
                ));
            }
            level = upper;
        }
        let root_page = level.first().map(|&(_, page)| page).unwrap_or(0);

        // Write everything out.
        for (i, leaf) in leaves.iter().enumerate() {
            self.write_page(i as u64 + 1, leaf)?;
        }
        for (page_no, page) in &internal_pages {
            self.write_page(*page_no, page)?;
        }

        let mut header = vec![0u8; PAGE_SIZE as usize];
        pbe::encode_u64(INDEX_MAGIC, &mut header[..8]);
        pbe::encode_u32(self.key_size as u32, &mut header[8..12]);
        pbe::encode_u32(self.value_size as u32, &mut header[12..16]);
        pbe::encode_u64(self.map.len() as u64, &mut header[16..24]);
        pbe::encode_u64(leaf_count, &mut header[24..32]);
        pbe::encode_u64(root_page, &mut header[32..40]);
        pbe::encode_u64(next_page, &mut header[40..48]);
        self.write_page(HEADER_PAGE, &header)
    }
}

struct ImageHeader {
    key_count: u64,
    #[allow(dead_code)]
    root_page: u64,
    leaf_count: u64,
    #[allow(dead_code)]
    page_count: u64,
}

/// Index directory path under a table directory.
pub fn index_dir(table_dir: &Path, index_id: u64) -> PathBuf {
    table_dir.join(format!("{}{}", crate::defs::INDEX_DIR_PREFIX, index_id))
}

#[cfg(test)]
mod tests {
    use super::BTreeIndex;
    use crate::io::FileFactory;
    use tempdir::TempDir;

    fn key(v: u64) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }

    fn value(block: u64, offset: u32) -> Vec<u8> {
        let mut out = block.to_be_bytes().to_vec();
        out.extend_from_slice(&offset.to_be_bytes());
        out
    }

    fn new_index(dir: &TempDir, unique: bool) -> BTreeIndex {
        BTreeIndex::create(
            FileFactory::plaintext(),
            dir.path().join("i1"),
            1,
            "TEST_IDX".to_owned(),
            8,
            12,
            crate::index::PAGE_SIZE * 2,
            unique,
        )
        .unwrap()
    }

    #[test]
    fn unique_insert_find_erase() {
        let dir = TempDir::new("btree_index").unwrap();
        let mut index = new_index(&dir, true);

        assert!(index.insert(&key(10), &value(1, 0)).unwrap());
        assert!(!index.insert(&key(10), &value(1, 64)).unwrap());
        assert_eq!(index.find(&key(10), 1).unwrap(), vec![value(1, 0)]);
        assert_eq!(index.count(&key(10)).unwrap(), 1);

        assert_eq!(index.update(&key(10), &value(2, 8)).unwrap(), 1);
        assert_eq!(index.find(&key(10), 1).unwrap(), vec![value(2, 8)]);
        assert_eq!(index.update(&key(11), &value(2, 8)).unwrap(), 0);

        assert_eq!(index.erase(&key(10)).unwrap(), 1);
        assert_eq!(index.erase(&key(10)).unwrap(), 0);
        assert_eq!(index.count(&key(10)).unwrap(), 0);
    }

    #[test]
    fn ordering_and_neighbors() {
        let dir = TempDir::new("btree_index").unwrap();
        let mut index = new_index(&dir, true);
        for v in &[5u64, 1, 9, 3, 7] {
            index.insert(&key(*v), &value(*v, 0)).unwrap();
        }
        assert_eq!(index.min_key(), Some(key(1)));
        assert_eq!(index.max_key(), Some(key(9)));
        assert_eq!(index.find_next_key(&key(3)).unwrap(), Some(key(5)));
        assert_eq!(index.find_next_key(&key(4)).unwrap(), Some(key(5)));
        assert_eq!(index.find_next_key(&key(9)).unwrap(), None);
        assert_eq!(index.find_previous_key(&key(5)).unwrap(), Some(key(3)));
        assert_eq!(index.find_previous_key(&key(1)).unwrap(), None);
    }

    #[test]
    fn preallocate_reserves_slot() {
        let dir = TempDir::new("btree_index").unwrap();
        let mut index = new_index(&dir, true);
        assert!(index.preallocate(&key(4)).unwrap());
        assert!(!index.preallocate(&key(4)).unwrap());
        assert_eq!(index.count(&key(4)).unwrap(), 0);
        // A preallocated slot still accepts its first value.
        assert!(index.insert(&key(4), &value(4, 0)).unwrap());
    }

    #[test]
    fn flush_and_reopen_restores_entries() {
        let dir = TempDir::new("btree_index").unwrap();
        let path = dir.path().join("i1");
        {
            let mut index = new_index(&dir, true);
            // Enough keys to span several leaves.
            for v in 0..2000u64 {
                index.insert(&key(v), &value(v, (v % 97) as u32)).unwrap();
            }
            index.flush().unwrap();
        }
        let mut index = BTreeIndex::open(
            FileFactory::plaintext(),
            path,
            1,
            "TEST_IDX".to_owned(),
            8,
            12,
            crate::index::PAGE_SIZE * 2,
            true,
        )
        .unwrap();
        assert_eq!(index.key_count(), 2000);
        for v in &[0u64, 1, 999, 1999] {
            assert_eq!(
                index.find(&key(*v), 1).unwrap(),
                vec![value(*v, (*v % 97) as u32)]
            );
        }
        assert_eq!(index.first_key().unwrap(), Some(key(0)));
        assert_eq!(index.last_key().unwrap(), Some(key(1999)));
    }

    #[test]
    fn non_unique_keeps_insertion_order() {
        let dir = TempDir::new("btree_index").unwrap();
        let mut index = new_index(&dir, false);
        assert!(index.insert(&key(1), &value(1, 0)).unwrap());
        assert!(index.insert(&key(1), &value(2, 0)).unwrap());
        assert!(index.insert(&key(1), &value(3, 0)).unwrap());
        assert_eq!(
            index.find(&key(1), 10).unwrap(),
            vec![value(1, 0), value(2, 0), value(3, 0)]
        );
        assert_eq!(index.find(&key(1), 2).unwrap().len(), 2);
        assert_eq!(index.erase(&key(1)).unwrap(), 3);
    }

    #[test]
    fn disk_first_last_reflect_flushed_state() {
        let dir = TempDir::new("btree_index").unwrap();
        let mut index = new_index(&dir, true);
        index.insert(&key(5), &value(5, 0)).unwrap();
        index.flush().unwrap();
        index.insert(&key(1), &value(1, 0)).unwrap();
        // In-memory min sees the new key, the disk image does not yet.
        assert_eq!(index.min_key(), Some(key(1)));
        assert_eq!(index.first_key().unwrap(), Some(key(5)));
        index.flush().unwrap();
        assert_eq!(index.first_key().unwrap(), Some(key(1)));
    }
}
