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

//! Database table column: typed value codec over the block store, LOB
//! writer, available-block selection, and — for the master column — the
//! TRID counters and the main index.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::warn;
use parking_lot::Mutex;

use meridb_types::{
    pbe, ColumnDataAddress, ColumnDataType, LobStream, RawDateTime, Value, NULL_ADDRESS,
};
use object_cache::ObjectCache;

use crate::defs::{
    BLOCK_FREE_SPACE_THRESHOLD_FOR_LOB, COLUMN_DIR_PREFIX, MAIN_INDEX_ID_FILE,
    MASTER_COLUMN_DIR_PREFIX, MASTER_COLUMN_NAME, SMALL_LOB_SIZE_LIMIT, TRID_COUNTERS_FILE,
};
use crate::error::{Error, Result, UserError};
use crate::index::{index_dir, BTreeIndex};
use crate::io::FileFactory;
use crate::mcr::{DmlOperation, MasterColumnRecord};

pub mod block;
pub mod block_registry;
pub mod lob;
mod trid;

pub use self::block::{DataBlock, DataBlockState, BLOCK_HEADER_SIZE};
pub use self::block_registry::BlockRegistry;
pub use self::lob::{ColumnLobStream, LobChunkHeader, MemoryLobStream};
pub use self::trid::TridCounters;

/// How many open block files one column keeps cached.
const BLOCK_CACHE_CAPACITY: usize = 32;

/// Master column main index key size (big-endian TRID).
pub const MAIN_INDEX_KEY_SIZE: usize = 8;

/// Master column main index value size (block id + offset).
pub const MAIN_INDEX_VALUE_SIZE: usize = 12;

/// Specification of a column to create.
pub struct ColumnSpecification {
    pub name: String,
    pub data_type: ColumnDataType,
    pub block_data_area_size: u32,
    pub not_null: bool,
    pub default_value: Option<Value>,
    pub description: Option<String>,
}

// Constraint-derived state cached from the current column definition.
struct ColumnDefaults {
    definition_id: u64,
    not_null: bool,
    default_value: Option<Value>,
}

struct ColumnInner {
    registry: BlockRegistry,
    blocks: ObjectCache<u64, DataBlock>,
    /// Blocks still accepting appends: block id → free space. Ordered so
    /// that selection picks the smallest id first.
    available: BTreeMap<u64, u32>,
}

struct MasterData {
    first_user_trid: u64,
    counters: Mutex<TridCounters>,
    main_index: Mutex<Option<BTreeIndex>>,
}

/// A table column bound to its on-disk directory.
pub struct Column {
    id: u64,
    table_id: u32,
    database_name: String,
    table_name: String,
    name: String,
    data_type: ColumnDataType,
    data_area_size: u32,
    description: Option<String>,
    table_dir: PathBuf,
    data_dir: PathBuf,
    factory: FileFactory,
    defaults: Mutex<ColumnDefaults>,
    inner: Mutex<ColumnInner>,
    master: Option<MasterData>,
}

/// Identity of a column as known to its table; used on open.
pub struct ColumnOpenInfo {
    pub id: u64,
    pub name: String,
    pub data_type: ColumnDataType,
    pub data_area_size: u32,
    pub description: Option<String>,
}

impl Column {
    /// Master column data type.
    pub const MASTER_COLUMN_DATA_TYPE: ColumnDataType = ColumnDataType::UInt64;

    /// Creates a new column with its directory, block registry, and (for
    /// the master column) the TRID counters file.
    pub fn create(
        factory: FileFactory,
        table_dir: &Path,
        database_name: String,
        table_name: String,
        table_id: u32,
        id: u64,
        spec: ColumnSpecification,
        definition_id: u64,
        first_user_trid: u64,
    ) -> Result<Column> {
        let is_master = spec.name == MASTER_COLUMN_NAME;
        let prefix = if is_master {
            MASTER_COLUMN_DIR_PREFIX
        } else {
            COLUMN_DIR_PREFIX
        };
        let data_dir = table_dir.join(format!("{}{}", prefix, id));
        if data_dir.join(crate::defs::INIT_FLAG_FILE).exists() {
            return Err(Error::User(UserError::ColumnAlreadyExists {
                database: database_name,
                table: table_name,
                column: spec.name,
            }));
        }
        if data_dir.exists() {
            std::fs::remove_dir_all(&data_dir)
                .map_err(|e| Error::io(format!("remove stale column dir {}", data_dir.display()), e))?;
        }
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| Error::io(format!("create column dir {}", data_dir.display()), e))?;

        let registry = BlockRegistry::create(&factory, &data_dir)
            .map_err(|e| Error::io("create block registry", e))?;

        let master = if is_master {
            let counters = TridCounters::create(&data_dir.join(TRID_COUNTERS_FILE), first_user_trid)
                .map_err(|e| Error::io("create TRID counters", e))?;
            Some(MasterData {
                first_user_trid,
                counters: Mutex::new(counters),
                main_index: Mutex::new(None),
            })
        } else {
            None
        };

        let column = Column {
            id,
            table_id,
            database_name,
            table_name,
            name: spec.name,
            data_type: spec.data_type,
            data_area_size: spec.block_data_area_size,
            description: spec.description,
            table_dir: table_dir.to_owned(),
            data_dir,
            factory,
            defaults: Mutex::new(ColumnDefaults {
                definition_id,
                not_null: spec.not_null,
                default_value: spec.default_value,
            }),
            inner: Mutex::new(ColumnInner {
                registry,
                blocks: ObjectCache::new(BLOCK_CACHE_CAPACITY),
                available: BTreeMap::new(),
            }),
            master,
        };
        crate::database::write_init_flag(&column.data_dir)?;
        Ok(column)
    }

    /// Opens an existing column, restoring the available-block map from the
    /// block registry.
    pub fn open(
        factory: FileFactory,
        table_dir: &Path,
        database_name: String,
        table_name: String,
        table_id: u32,
        info: ColumnOpenInfo,
        first_user_trid: u64,
    ) -> Result<Column> {
        let is_master = info.name == MASTER_COLUMN_NAME;
        let prefix = if is_master {
            MASTER_COLUMN_DIR_PREFIX
        } else {
            COLUMN_DIR_PREFIX
        };
        let data_dir = table_dir.join(format!("{}{}", prefix, info.id));
        if !data_dir.join(crate::defs::INIT_FLAG_FILE).exists() {
            return Err(Error::internal(format!(
                "column directory {} is not initialized",
                data_dir.display()
            )));
        }

        let registry = BlockRegistry::open(&factory, &data_dir)
            .map_err(|e| Error::io("open block registry", e))?;

        let master = if is_master {
            let counters = TridCounters::open(&data_dir.join(TRID_COUNTERS_FILE))
                .map_err(|e| Error::io("open TRID counters", e))?;
            Some(MasterData {
                first_user_trid,
                counters: Mutex::new(counters),
                main_index: Mutex::new(None),
            })
        } else {
            None
        };

        let column = Column {
            id: info.id,
            table_id,
            database_name,
            table_name,
            name: info.name,
            data_type: info.data_type,
            data_area_size: info.data_area_size,
            description: info.description,
            table_dir: table_dir.to_owned(),
            data_dir,
            factory,
            defaults: Mutex::new(ColumnDefaults {
                definition_id: 0,
                not_null: is_master,
                default_value: None,
            }),
            inner: Mutex::new(ColumnInner {
                registry,
                blocks: ObjectCache::new(BLOCK_CACHE_CAPACITY),
                available: BTreeMap::new(),
            }),
            master,
        };
        column.rebuild_available_blocks()?;
        Ok(column)
    }

    fn rebuild_available_blocks(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let last = inner.registry.last_block_id();
        let min_free = self.min_required_free_space();
        for block_id in 1..=last {
            let state = inner
                .registry
                .block_state(block_id)
                .map_err(|e| Error::io("read block registry", e))?;
            if state == DataBlockState::Closed || state == DataBlockState::Deleted {
                continue;
            }
            let free = {
                let block = self.block_mut(&mut inner, block_id)?;
                block.free_data_space()
            };
            if free >= min_free {
                inner.available.insert(block_id, free);
            }
        }
        Ok(())
    }

    // --- accessors ------------------------------------------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn table_id(&self) -> u32 {
        self.table_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> ColumnDataType {
        self.data_type
    }

    pub fn data_area_size(&self) -> u32 {
        self.data_area_size
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn is_master(&self) -> bool {
        self.master.is_some()
    }

    pub fn is_not_null(&self) -> bool {
        self.defaults.lock().not_null
    }

    /// Copy of the current DEFAULT value, NULL when none is defined.
    pub fn default_value(&self) -> Value {
        self.defaults
            .lock()
            .default_value
            .as_ref()
            .and_then(Value::try_clone)
            .unwrap_or(Value::Null)
    }

    pub fn current_definition_id(&self) -> u64 {
        self.defaults.lock().definition_id
    }

    /// Replaces the cached constraint-derived state when the current column
    /// definition changes.
    pub fn set_current_definition(
        &self,
        definition_id: u64,
        not_null: bool,
        default_value: Option<Value>,
    ) {
        let mut defaults = self.defaults.lock();
        defaults.definition_id = definition_id;
        defaults.not_null = not_null;
        defaults.default_value = default_value;
    }

    pub fn first_user_trid(&self) -> u64 {
        self.master
            .as_ref()
            .map(|m| m.first_user_trid)
            .unwrap_or(0)
    }

    pub fn last_block_id(&self) -> u64 {
        self.inner.lock().registry.last_block_id()
    }

    pub fn find_prev_block_id(&self, block_id: u64) -> Result<u64> {
        self.inner
            .lock()
            .registry
            .find_prev_block_id(block_id)
            .map_err(|e| Error::io("read block registry", e))
    }

    fn master_data(&self) -> Result<&MasterData> {
        self.master.as_ref().ok_or_else(|| {
            Error::internal(format!(
                "column '{}'.'{}'.'{}' is not a master column",
                self.database_name, self.table_name, self.name
            ))
        })
    }

    fn min_required_free_space(&self) -> u32 {
        match self.data_type {
            ColumnDataType::Timestamp => RawDateTime::MAX_SERIALIZED_SIZE as u32,
            t => t.min_record_width(),
        }
    }

    // --- block management ----------------------------------------------

    fn block_mut<'a>(
        &self,
        inner: &'a mut ColumnInner,
        block_id: u64,
    ) -> Result<&'a mut DataBlock> {
        if block_id == 0 || block_id > inner.registry.last_block_id() {
            return Err(Error::internal(format!(
                "column '{}'.'{}'.'{}': block {} does not exist",
                self.database_name, self.table_name, self.name, block_id
            )));
        }
        if !inner.blocks.contains(&block_id) {
            let block = DataBlock::open(&self.factory, &self.data_dir, block_id, self.data_area_size)
                .map_err(|e| Error::io(format!("open block {}", block_id), e))?;
            inner.blocks.put(block_id, block, |_, _| true)?;
        }
        Ok(inner
            .blocks
            .get_mut(&block_id)
            .expect("block was just ensured in the cache; qed"))
    }

    // Creates a block chained after `prev_block_id` and registers it as
    // available.
    fn create_block(&self, inner: &mut ColumnInner, prev_block_id: u64) -> Result<u64> {
        let block_id = inner.registry.last_block_id() + 1;
        let block = DataBlock::create(
            &self.factory,
            &self.data_dir,
            block_id,
            prev_block_id,
            DataBlockState::Creating,
            self.data_area_size,
        )
        .map_err(|e| Error::io(format!("create block {}", block_id), e))?;
        inner
            .registry
            .add_block(block_id, prev_block_id, DataBlockState::Creating)
            .map_err(|e| Error::io("register block", e))?;
        let free = block.free_data_space();
        inner.blocks.put(block_id, block, |_, _| true)?;
        inner.available.insert(block_id, free);
        Ok(block_id)
    }

    // Picks the smallest available block that can fit `required` bytes,
    // creating a new one chained after the last block when none fits.
    fn select_available_block(&self, inner: &mut ColumnInner, required: u32) -> Result<u64> {
        let found = inner
            .available
            .iter()
            .find(|&(_, &free)| free >= required)
            .map(|(&id, _)| id);
        match found {
            Some(id) => Ok(id),
            None => {
                let prev = inner.registry.last_block_id();
                self.create_block(inner, prev)
            }
        }
    }

    // Refreshes available-space accounting after writing into a block.
    fn block_written(&self, inner: &mut ColumnInner, block_id: u64) -> Result<()> {
        let min_free = self.min_required_free_space();
        let (free, was_creating) = {
            let block = self.block_mut(inner, block_id)?;
            let was_creating = block.state() == DataBlockState::Creating;
            if was_creating {
                block.set_state(DataBlockState::Current);
            }
            (block.free_data_space(), was_creating)
        };
        if was_creating {
            inner
                .registry
                .update_block_state(block_id, DataBlockState::Current)
                .map_err(|e| Error::io("update block registry", e))?;
        }
        if free < min_free {
            inner.available.remove(&block_id);
            {
                let block = self.block_mut(inner, block_id)?;
                block.set_state(DataBlockState::Closed);
                block
                    .save()
                    .map_err(|e| Error::io(format!("save block {}", block_id), e))?;
            }
            inner
                .registry
                .update_block_state(block_id, DataBlockState::Closed)
                .map_err(|e| Error::io("update block registry", e))?;
        } else {
            inner.available.insert(block_id, free);
        }
        Ok(())
    }

    /// Reads raw bytes from a block's data area. Used by LOB streams.
    pub(crate) fn read_data(&self, block_id: u64, offset: u32, buf: &mut [u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        let name = self.name.clone();
        let block = self.block_mut(&mut inner, block_id)?;
        block
            .read_data(buf, offset)
            .map_err(|e| Error::io(format!("read column '{}' block {}", name, block_id), e))
    }

    /// Loads and validates a LOB chunk header. Returns the header and the
    /// offset of the chunk payload.
    pub(crate) fn load_lob_chunk_header(
        &self,
        block_id: u64,
        offset: u32,
    ) -> Result<(LobChunkHeader, u32)> {
        let mut inner = self.inner.lock();
        self.load_lob_chunk_header_locked(&mut inner, block_id, offset)
    }

    fn load_lob_chunk_header_locked(
        &self,
        inner: &mut ColumnInner,
        block_id: u64,
        offset: u32,
    ) -> Result<(LobChunkHeader, u32)> {
        let bad = |what: &str| {
            Error::internal(format!(
                "invalid LOB chunk header in column '{}'.'{}'.'{}' block {} offset {}: {}",
                self.database_name, self.table_name, self.name, block_id, offset, what
            ))
        };
        if self.data_area_size - offset.min(self.data_area_size) < LobChunkHeader::SERIALIZED_SIZE {
            return Err(bad("header does not fit the block"));
        }
        let mut buf = [0u8; LobChunkHeader::SERIALIZED_SIZE as usize];
        {
            let block = self.block_mut(inner, block_id)?;
            block
                .read_data(&mut buf, offset)
                .map_err(|e| Error::io("read LOB chunk header", e))?;
        }
        let header = LobChunkHeader::deserialize(&buf);
        let data_offset = offset + LobChunkHeader::SERIALIZED_SIZE;
        if header.chunk_length > header.remaining_lob_length {
            return Err(bad("chunk length exceeds remaining LOB length"));
        }
        if header.chunk_length > self.data_area_size - data_offset {
            return Err(bad("chunk length exceeds block data area"));
        }
        if header.next_chunk_block_id > inner.registry.last_block_id() {
            return Err(bad("next chunk block id out of range"));
        }
        if header.next_chunk_block_id != 0
            && header.next_chunk_offset > self.data_area_size - LobChunkHeader::SERIALIZED_SIZE
        {
            return Err(bad("next chunk offset out of range"));
        }
        Ok((header, data_offset))
    }

    // --- record read ----------------------------------------------------

    /// Reads the record at `addr`. The null address yields NULL. Large
    /// TEXT/BINARY values come back as streams; `hold_source` asks those
    /// streams to keep their source pinned.
    pub fn read_record(
        self: Arc<Column>,
        addr: ColumnDataAddress,
        hold_source: bool,
    ) -> Result<Value> {
        if addr.is_null() {
            return Ok(Value::Null);
        }
        let min_width = self.data_type.min_record_width();
        if u64::from(addr.offset) + u64::from(min_width) > u64::from(self.data_area_size) {
            return Err(Error::internal(format!(
                "invalid data block position {} in column '{}'.'{}'.'{}' block {}",
                addr.offset, self.database_name, self.table_name, self.name, addr.block_id
            )));
        }

        match self.data_type {
            ColumnDataType::Text => self.load_lob_value(addr, hold_source, true),
            ColumnDataType::Binary => self.load_lob_value(addr, hold_source, false),
            _ => {
                let mut inner = self.inner.lock();
                let mut buf = [0u8; 12];
                let data_type = self.data_type;
                let block = self.block_mut(&mut inner, addr.block_id)?;
                let value = match data_type {
                    ColumnDataType::Bool => {
                        block
                            .read_data(&mut buf[..1], addr.offset)
                            .map_err(|e| Error::io("read record", e))?;
                        Value::Bool(buf[0] != 0)
                    }
                    ColumnDataType::Int8 => {
                        block
                            .read_data(&mut buf[..1], addr.offset)
                            .map_err(|e| Error::io("read record", e))?;
                        Value::Int8(buf[0] as i8)
                    }
                    ColumnDataType::UInt8 => {
                        block
                            .read_data(&mut buf[..1], addr.offset)
                            .map_err(|e| Error::io("read record", e))?;
                        Value::UInt8(buf[0])
                    }
                    ColumnDataType::Int16 => {
                        block
                            .read_data(&mut buf[..2], addr.offset)
                            .map_err(|e| Error::io("read record", e))?;
                        Value::Int16(pbe::decode_u16(&buf[..2]) as i16)
                    }
                    ColumnDataType::UInt16 => {
                        block
                            .read_data(&mut buf[..2], addr.offset)
                            .map_err(|e| Error::io("read record", e))?;
                        Value::UInt16(pbe::decode_u16(&buf[..2]))
                    }
                    ColumnDataType::Int32 => {
                        block
                            .read_data(&mut buf[..4], addr.offset)
                            .map_err(|e| Error::io("read record", e))?;
                        Value::Int32(pbe::decode_u32(&buf[..4]) as i32)
                    }
                    ColumnDataType::UInt32 => {
                        block
                            .read_data(&mut buf[..4], addr.offset)
                            .map_err(|e| Error::io("read record", e))?;
                        Value::UInt32(pbe::decode_u32(&buf[..4]))
                    }
                    ColumnDataType::Int64 => {
                        block
                            .read_data(&mut buf[..8], addr.offset)
                            .map_err(|e| Error::io("read record", e))?;
                        Value::Int64(pbe::decode_i64(&buf[..8]))
                    }
                    ColumnDataType::UInt64 => {
                        block
                            .read_data(&mut buf[..8], addr.offset)
                            .map_err(|e| Error::io("read record", e))?;
                        Value::UInt64(pbe::decode_u64(&buf[..8]))
                    }
                    ColumnDataType::Float => {
                        block
                            .read_data(&mut buf[..4], addr.offset)
                            .map_err(|e| Error::io("read record", e))?;
                        Value::Float(pbe::decode_f32(&buf[..4]))
                    }
                    ColumnDataType::Double => {
                        block
                            .read_data(&mut buf[..8], addr.offset)
                            .map_err(|e| Error::io("read record", e))?;
                        Value::Double(pbe::decode_f64(&buf[..8]))
                    }
                    ColumnDataType::Timestamp => {
                        block
                            .read_data(
                                &mut buf[..RawDateTime::DATE_PART_SERIALIZED_SIZE],
                                addr.offset,
                            )
                            .map_err(|e| Error::io("read record", e))?;
                        let mut dt = RawDateTime::deserialize_date_part(&buf);
                        if dt.has_time_part {
                            block
                                .read_data(
                                    &mut buf[RawDateTime::DATE_PART_SERIALIZED_SIZE
                                        ..RawDateTime::MAX_SERIALIZED_SIZE],
                                    addr.offset + RawDateTime::DATE_PART_SERIALIZED_SIZE as u32,
                                )
                                .map_err(|e| Error::io("read record", e))?;
                            dt.deserialize_time_part(
                                &buf[RawDateTime::DATE_PART_SERIALIZED_SIZE..],
                            );
                        }
                        Value::DateTime(dt)
                    }
                    ColumnDataType::Text | ColumnDataType::Binary => unreachable!(),
                };
                Ok(value)
            }
        }
    }

    fn load_lob_value(
        self: Arc<Column>,
        addr: ColumnDataAddress,
        hold_source: bool,
        text: bool,
    ) -> Result<Value> {
        let (header, _) = self.load_lob_chunk_header(addr.block_id, addr.offset)?;
        let length = header.remaining_lob_length as usize;
        if length == 0 {
            return Ok(if text {
                Value::Text(String::new())
            } else {
                Value::Binary(Vec::new())
            });
        }
        if length < SMALL_LOB_SIZE_LIMIT {
            let mut stream = ColumnLobStream::open(self.clone(), addr, hold_source)?;
            let mut data = vec![0u8; length];
            let mut done = 0;
            while done < length {
                let n = stream
                    .read(&mut data[done..])
                    .map_err(|e| Error::io("read LOB", e))?;
                if n == 0 {
                    return Err(Error::internal(format!(
                        "LOB in column '{}'.'{}'.'{}' ended after {} of {} bytes",
                        self.database_name, self.table_name, self.name, done, length
                    )));
                }
                done += n;
            }
            if text {
                String::from_utf8(data)
                    .map(Value::Text)
                    .map_err(|_| Error::internal("stored TEXT value is not valid UTF-8"))
            } else {
                Ok(Value::Binary(data))
            }
        } else {
            let stream = Box::new(ColumnLobStream::open(self.clone(), addr, hold_source)?);
            Ok(if text {
                Value::Clob(stream)
            } else {
                Value::Blob(stream)
            })
        }
    }

    // --- record write ---------------------------------------------------

    fn incompatible(&self, cast: meridb_types::CastError) -> Error {
        Error::User(UserError::IncompatibleDataType {
            column: self.name.clone(),
            column_type: self.data_type,
            cast,
        })
    }

    /// Writes a value into the column. Returns the record address and the
    /// next free address after it.
    pub fn write_record(&self, value: Value) -> Result<(ColumnDataAddress, ColumnDataAddress)> {
        if value.is_null() {
            if self.is_not_null() {
                return Err(Error::User(UserError::CannotInsertNullValue {
                    database: self.database_name.clone(),
                    table: self.table_name.clone(),
                    column: self.name.clone(),
                }));
            }
            return Ok((NULL_ADDRESS, NULL_ADDRESS));
        }

        match self.data_type {
            ColumnDataType::Text => {
                match value {
                    Value::Text(s) => self.write_chunked_bytes(s.as_bytes()),
                    Value::Clob(stream) | Value::Blob(stream) => self.write_chunked_stream(stream),
                    other => {
                        let s = other.into_string().map_err(|e| self.incompatible(e))?;
                        self.write_chunked_bytes(s.as_bytes())
                    }
                }
            }
            ColumnDataType::Binary => match value {
                Value::Binary(b) => self.write_chunked_bytes(&b),
                Value::Blob(stream) | Value::Clob(stream) => self.write_chunked_stream(stream),
                other => {
                    let b = other.into_bytes().map_err(|e| self.incompatible(e))?;
                    self.write_chunked_bytes(&b)
                }
            },
            _ => {
                let mut buf = [0u8; 12];
                let written = self.encode_scalar(&value, &mut buf)?;
                let slot = self.min_required_free_space();
                let mut inner = self.inner.lock();
                let block_id = self.select_available_block(&mut inner, slot)?;
                let (pos, next_pos) = {
                    let block = self.block_mut(&mut inner, block_id)?;
                    let pos = block.next_data_pos();
                    block
                        .append_data(&buf[..written])
                        .map_err(|e| Error::io("write record", e))?;
                    block.inc_next_data_pos(slot);
                    (pos, block.next_data_pos())
                };
                self.block_written(&mut inner, block_id)?;
                Ok((
                    ColumnDataAddress::new(block_id, pos),
                    ColumnDataAddress::new(block_id, next_pos),
                ))
            }
        }
    }

    // Encodes a scalar value after coercion; returns the number of bytes
    // to write (the slot size may be larger).
    fn encode_scalar(&self, value: &Value, buf: &mut [u8; 12]) -> Result<usize> {
        Ok(match self.data_type {
            ColumnDataType::Bool => {
                buf[0] = value.to_bool().map_err(|e| self.incompatible(e))? as u8;
                1
            }
            ColumnDataType::Int8 => {
                buf[0] = value.to_i8().map_err(|e| self.incompatible(e))? as u8;
                1
            }
            ColumnDataType::UInt8 => {
                buf[0] = value.to_u8().map_err(|e| self.incompatible(e))?;
                1
            }
            ColumnDataType::Int16 => {
                let v = value.to_i16().map_err(|e| self.incompatible(e))?;
                pbe::encode_u16(v as u16, &mut buf[..2]);
                2
            }
            ColumnDataType::UInt16 => {
                let v = value.to_u16().map_err(|e| self.incompatible(e))?;
                pbe::encode_u16(v, &mut buf[..2]);
                2
            }
            ColumnDataType::Int32 => {
                let v = value.to_i32().map_err(|e| self.incompatible(e))?;
                pbe::encode_u32(v as u32, &mut buf[..4]);
                4
            }
            ColumnDataType::UInt32 => {
                let v = value.to_u32().map_err(|e| self.incompatible(e))?;
                pbe::encode_u32(v, &mut buf[..4]);
                4
            }
            ColumnDataType::Int64 => {
                let v = value.to_i64().map_err(|e| self.incompatible(e))?;
                pbe::encode_i64(v, &mut buf[..8]);
                8
            }
            ColumnDataType::UInt64 => {
                let v = value.to_u64().map_err(|e| self.incompatible(e))?;
                pbe::encode_u64(v, &mut buf[..8]);
                8
            }
            ColumnDataType::Float => {
                let v = value.to_f32().map_err(|e| self.incompatible(e))?;
                pbe::encode_f32(v, &mut buf[..4]);
                4
            }
            ColumnDataType::Double => {
                let v = value.to_f64().map_err(|e| self.incompatible(e))?;
                pbe::encode_f64(v, &mut buf[..8]);
                8
            }
            ColumnDataType::Timestamp => {
                let v = value.to_datetime().map_err(|e| self.incompatible(e))?;
                v.serialize(buf)
            }
            ColumnDataType::Text | ColumnDataType::Binary => {
                unreachable!("LOB types are handled by the chunked writer")
            }
        })
    }

    fn write_chunked_bytes(&self, bytes: &[u8]) -> Result<(ColumnDataAddress, ColumnDataAddress)> {
        let mut source = ChunkSource::Bytes(bytes);
        let mut inner = self.inner.lock();
        self.write_chunked(&mut inner, &mut source)
    }

    fn write_chunked_stream(
        &self,
        stream: Box<dyn LobStream>,
    ) -> Result<(ColumnDataAddress, ColumnDataAddress)> {
        let mut source = ChunkSource::Stream(stream, Vec::new());
        let mut inner = self.inner.lock();
        self.write_chunked(&mut inner, &mut source)
    }

    // Writes a LOB as a chain of header-prefixed chunks, back-patching the
    // previous chunk header whenever the chain moves to a new block.
    fn write_chunked(
        &self,
        inner: &mut ColumnInner,
        source: &mut ChunkSource<'_>,
    ) -> Result<(ColumnDataAddress, ColumnDataAddress)> {
        let header_size = LobChunkHeader::SERIALIZED_SIZE;
        if source.remaining() > u64::from(u32::max_value()) {
            return Err(Error::internal("LOB exceeds the 4 GiB limit"));
        }

        let mut block_id = self.select_available_block(inner, header_size)?;
        let mut first_addr: Option<ColumnDataAddress> = None;
        let mut last_header: Option<(u64, u32, LobChunkHeader)> = None;
        let mut header_buf = [0u8; LobChunkHeader::SERIALIZED_SIZE as usize];

        loop {
            let remaining = source.remaining() as u32;
            let free = self.block_mut(inner, block_id)?.free_data_space();
            if free < header_size {
                let new_block_id =
                    self.create_block_for_chunk(inner, block_id, header_size)?;
                if let Some((header_block, header_pos, mut header)) = last_header.take() {
                    header.next_chunk_block_id = new_block_id;
                    header.next_chunk_offset =
                        self.block_mut(inner, new_block_id)?.next_data_pos();
                    header.serialize(&mut header_buf);
                    self.block_mut(inner, header_block)?
                        .write_data(&header_buf, header_pos)
                        .map_err(|e| Error::io("back-patch LOB chunk header", e))?;
                }
                self.block_written(inner, block_id)?;
                block_id = new_block_id;
            }

            let (header_pos, chunk_len) = {
                let block = self.block_mut(inner, block_id)?;
                let available = block.free_data_space() - header_size;
                let chunk_len = available.min(remaining);
                let header = LobChunkHeader::new(remaining, chunk_len);
                header.serialize(&mut header_buf);
                let header_pos = block.next_data_pos();
                block
                    .append_data(&header_buf)
                    .map_err(|e| Error::io("write LOB chunk header", e))?;
                block.inc_next_data_pos(header_size);
                last_header = Some((block_id, header_pos, header));
                (header_pos, chunk_len)
            };
            if first_addr.is_none() {
                first_addr = Some(ColumnDataAddress::new(block_id, header_pos));
            }

            if chunk_len > 0 {
                let data = source.take(chunk_len as usize)?;
                let block = self.block_mut(inner, block_id)?;
                block
                    .append_data(data)
                    .map_err(|e| Error::io("write LOB chunk", e))?;
                block.inc_next_data_pos(chunk_len);
            }

            if source.remaining() == 0 {
                break;
            }
        }

        self.block_written(inner, block_id)?;
        let next_pos = self.block_mut(inner, block_id)?.next_data_pos();
        Ok((
            first_addr.expect("at least one chunk header was written; qed"),
            ColumnDataAddress::new(block_id, next_pos),
        ))
    }

    // New block for the next LOB chunk, chained after `current`, with at
    // least `required_free_space` usable bytes.
    fn create_block_for_chunk(
        &self,
        inner: &mut ColumnInner,
        current: u64,
        required_free_space: u32,
    ) -> Result<u64> {
        debug_assert!(
            required_free_space + BLOCK_FREE_SPACE_THRESHOLD_FOR_LOB <= self.data_area_size
        );
        self.create_block(inner, current)
    }

    // --- master column records ------------------------------------------

    /// Reads the master column record at `addr`.
    pub fn read_master_column_record(
        &self,
        addr: ColumnDataAddress,
    ) -> Result<MasterColumnRecord> {
        let mut inner = self.inner.lock();
        // Size tag is one or two bytes.
        let mut tag = [0u8; 2];
        {
            let block = self.block_mut(&mut inner, addr.block_id)?;
            block
                .read_data(&mut tag[..1], addr.offset)
                .map_err(|e| Error::io("read record size tag", e))?;
            if tag[0] >= 0x80 {
                block
                    .read_data(&mut tag[1..], addr.offset + 1)
                    .map_err(|e| Error::io("read record size tag", e))?;
            }
        }
        let (body_size, tag_len) = pbe::decode_varuint64(&tag)
            .ok_or_else(|| Error::internal("invalid master column record size tag"))?;
        if tag_len + body_size as usize > crate::defs::MAX_MCR_SIZE {
            return Err(Error::internal(format!(
                "master column record of {} bytes in '{}'.'{}' exceeds the size limit",
                body_size, self.database_name, self.table_name
            )));
        }
        let mut body = vec![0u8; body_size as usize];
        {
            let block = self.block_mut(&mut inner, addr.block_id)?;
            block
                .read_data(&mut body, addr.offset + tag_len as u32)
                .map_err(|e| Error::io("read master column record", e))?;
        }
        MasterColumnRecord::deserialize(&body)
            .map_err(|e| Error::internal(format!("{}", e)))
    }

    /// Writes a master column record and maintains the main index for the
    /// operation it describes.
    pub fn write_master_column_record(
        &self,
        record: &MasterColumnRecord,
    ) -> Result<(ColumnDataAddress, ColumnDataAddress)> {
        self.master_data()?;
        let bytes = record
            .serialize()
            .map_err(|_| {
                Error::User(UserError::TooManyColumnsToInsert {
                    actual: record.column_records.len(),
                    limit: crate::defs::MAX_MCR_SIZE / 4,
                })
            })?;

        let mut inner = self.inner.lock();
        let block_id = self.select_available_block(&mut inner, bytes.len() as u32)?;
        let (pos, next_pos) = {
            let block = self.block_mut(&mut inner, block_id)?;
            let pos = block.next_data_pos();
            block
                .append_data(&bytes)
                .map_err(|e| Error::io("write master column record", e))?;
            block.inc_next_data_pos(bytes.len() as u32);
            (pos, block.next_data_pos())
        };
        self.block_written(&mut inner, block_id)?;
        drop(inner);

        let mut key = [0u8; MAIN_INDEX_KEY_SIZE];
        key.copy_from_slice(&record.trid.to_be_bytes());
        let mut value = [0u8; MAIN_INDEX_VALUE_SIZE];
        value[..8].copy_from_slice(&block_id.to_be_bytes());
        value[8..].copy_from_slice(&pos.to_be_bytes());

        let master = self.master_data()?;
        let mut guard = master.main_index.lock();
        let index = guard
            .as_mut()
            .ok_or_else(|| Error::internal("master column main index is not loaded"))?;
        match record.operation {
            DmlOperation::Insert => {
                if !index.insert(&key, &value)? {
                    return Err(Error::User(UserError::CannotInsertDuplicateTrid(
                        record.trid,
                    )));
                }
            }
            DmlOperation::Update => {
                index.update(&key, &value)?;
            }
            DmlOperation::Delete => {
                index.erase(&key)?;
            }
        }

        Ok((
            ColumnDataAddress::new(block_id, pos),
            ColumnDataAddress::new(block_id, next_pos),
        ))
    }

    /// Removes a row id from the main index.
    pub fn erase_from_main_index(&self, trid: u64) -> Result<()> {
        let master = self.master_data()?;
        let mut guard = master.main_index.lock();
        let index = guard
            .as_mut()
            .ok_or_else(|| Error::internal("master column main index is not loaded"))?;
        index.erase(&trid.to_be_bytes())?;
        Ok(())
    }

    // --- main index -----------------------------------------------------

    /// Creates the main index of a master column and records its id.
    pub fn create_main_index(
        &self,
        index_id: u64,
        index_name: String,
        data_file_size: u32,
    ) -> Result<()> {
        let master = self.master_data()?;
        let index = BTreeIndex::create(
            self.factory.clone(),
            index_dir(&self.table_dir, index_id),
            index_id,
            index_name,
            MAIN_INDEX_KEY_SIZE,
            MAIN_INDEX_VALUE_SIZE,
            data_file_size,
            true,
        )?;
        let mut id_file = self
            .factory
            .create_file(&self.data_dir.join(MAIN_INDEX_ID_FILE), 0)
            .map_err(|e| Error::io("create main index id file", e))?;
        let mut buf = [0u8; 8];
        pbe::encode_u64(index_id, &mut buf);
        id_file
            .write_all_at(&buf, 0)
            .map_err(|e| Error::io("write main index id file", e))?;
        *master.main_index.lock() = Some(index);
        Ok(())
    }

    /// Loads the main index of a master column using the recorded index id.
    pub fn load_main_index(&self, index_name: String, data_file_size: u32) -> Result<()> {
        let master = self.master_data()?;
        let mut id_file = self
            .factory
            .open_file(&self.data_dir.join(MAIN_INDEX_ID_FILE))
            .map_err(|e| Error::io("open main index id file", e))?;
        let mut buf = [0u8; 8];
        id_file
            .read_exact_at(&mut buf, 0)
            .map_err(|e| Error::io("read main index id file", e))?;
        let index_id = pbe::decode_u64(&buf);
        let index = BTreeIndex::open(
            self.factory.clone(),
            index_dir(&self.table_dir, index_id),
            index_id,
            index_name,
            MAIN_INDEX_KEY_SIZE,
            MAIN_INDEX_VALUE_SIZE,
            data_file_size,
            true,
        )?;
        *master.main_index.lock() = Some(index);
        Ok(())
    }

    /// Id of the main index.
    pub fn main_index_id(&self) -> Result<u64> {
        let master = self.master_data()?;
        let guard = master.main_index.lock();
        guard
            .as_ref()
            .map(|i| i.id())
            .ok_or_else(|| Error::internal("master column main index is not loaded"))
    }

    fn with_main_index<R>(&self, f: impl FnOnce(&mut BTreeIndex) -> Result<R>) -> Result<R> {
        let master = self.master_data()?;
        let mut guard = master.main_index.lock();
        let index = guard
            .as_mut()
            .ok_or_else(|| Error::internal("master column main index is not loaded"))?;
        f(index)
    }

    /// Current record address of `trid`, if the row exists.
    pub fn main_index_find(&self, trid: u64) -> Result<Option<ColumnDataAddress>> {
        self.with_main_index(|index| {
            let values = index.find(&trid.to_be_bytes(), 1)?;
            Ok(values.first().map(|v| {
                let mut block = [0u8; 8];
                block.copy_from_slice(&v[..8]);
                let mut offset = [0u8; 4];
                offset.copy_from_slice(&v[8..]);
                ColumnDataAddress::new(u64::from_be_bytes(block), u32::from_be_bytes(offset))
            }))
        })
    }

    /// Smallest and largest row ids, when the table has any rows.
    pub fn main_index_min_max(&self) -> Result<Option<(u64, u64)>> {
        self.with_main_index(|index| {
            let min = index.min_key();
            let max = index.max_key();
            Ok(match (min, max) {
                (Some(min), Some(max)) => {
                    let mut a = [0u8; 8];
                    a.copy_from_slice(&min);
                    let mut b = [0u8; 8];
                    b.copy_from_slice(&max);
                    Some((u64::from_be_bytes(a), u64::from_be_bytes(b)))
                }
                _ => None,
            })
        })
    }

    /// Smallest row id strictly greater than `trid`.
    pub fn main_index_next_trid(&self, trid: u64) -> Result<Option<u64>> {
        self.with_main_index(|index| {
            Ok(index.find_next_key(&trid.to_be_bytes())?.map(|k| {
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&k);
                u64::from_be_bytes(buf)
            }))
        })
    }

    /// Flushes the main index image to disk.
    pub fn flush_main_index(&self) -> Result<()> {
        self.with_main_index(|index| index.flush())
    }

    // --- TRID counters --------------------------------------------------

    /// Allocates the next row id from the user range.
    pub fn generate_next_user_trid(&self) -> Result<u64> {
        let master = self.master_data()?;
        let mut counters = master.counters.lock();
        let last = counters.last_user_trid();
        let next = last.checked_add(1).ok_or_else(|| {
            Error::User(UserError::TridRangeExhausted {
                database: self.database_name.clone(),
                table: self.table_name.clone(),
            })
        })?;
        counters.set_last_user_trid(next);
        Ok(next)
    }

    /// Allocates the next row id from the system range.
    pub fn generate_next_system_trid(&self) -> Result<u64> {
        let master = self.master_data()?;
        let first_user_trid = master.first_user_trid;
        let mut counters = master.counters.lock();
        let last = counters.last_system_trid();
        let next = last.checked_add(1).filter(|&v| v < first_user_trid).ok_or_else(|| {
            Error::User(UserError::TridRangeExhausted {
                database: self.database_name.clone(),
                table: self.table_name.clone(),
            })
        })?;
        counters.set_last_system_trid(next);
        Ok(next)
    }

    pub fn last_user_trid(&self) -> Result<u64> {
        Ok(self.master_data()?.counters.lock().last_user_trid())
    }

    pub fn last_system_trid(&self) -> Result<u64> {
        Ok(self.master_data()?.counters.lock().last_system_trid())
    }

    /// Adjusts the user TRID counter; refuses decreases, equal value is a
    /// no-op.
    pub fn set_last_user_trid(&self, value: u64) -> Result<()> {
        let master = self.master_data()?;
        let mut counters = master.counters.lock();
        let current = counters.last_user_trid();
        if value < current {
            return Err(Error::User(UserError::InvalidNextTrid {
                current,
                requested: value,
            }));
        }
        if value > current {
            counters.set_last_user_trid(value);
        }
        Ok(())
    }

    /// Adjusts the system TRID counter; refuses decreases, equal value is
    /// a no-op.
    pub fn set_last_system_trid(&self, value: u64) -> Result<()> {
        let master = self.master_data()?;
        let mut counters = master.counters.lock();
        let current = counters.last_system_trid();
        if value < current {
            return Err(Error::User(UserError::InvalidNextTrid {
                current,
                requested: value,
            }));
        }
        if value > current {
            counters.set_last_system_trid(value);
        }
        Ok(())
    }

    // --- rollback -------------------------------------------------------

    /// Discards everything written strictly after `addr` in this column.
    /// Blocks newer than `first_available_block_id` return to the creating
    /// state with an empty data area.
    pub fn rollback_to_address(
        &self,
        addr: ColumnDataAddress,
        first_available_block_id: u64,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let last = inner.registry.last_block_id();
        for block_id in (first_available_block_id + 1)..=last {
            {
                let block = self.block_mut(&mut inner, block_id)?;
                block.set_next_data_pos(0);
                block.set_state(DataBlockState::Creating);
                block
                    .save()
                    .map_err(|e| Error::io(format!("roll back block {}", block_id), e))?;
            }
            inner
                .registry
                .update_block_state(block_id, DataBlockState::Creating)
                .map_err(|e| Error::io("update block registry", e))?;
            inner.available.insert(block_id, self.data_area_size);
        }
        if first_available_block_id > 0 && first_available_block_id <= last {
            let truncate_to = if addr.block_id == first_available_block_id {
                addr.offset
            } else {
                0
            };
            let free = {
                let block = self.block_mut(&mut inner, first_available_block_id)?;
                block.set_next_data_pos(truncate_to);
                if block.state() == DataBlockState::Closed {
                    block.set_state(DataBlockState::Current);
                }
                block.save().map_err(|e| {
                    Error::io(format!("roll back block {}", first_available_block_id), e)
                })?;
                block.free_data_space()
            };
            inner
                .registry
                .update_block_state(first_available_block_id, DataBlockState::Current)
                .map_err(|e| Error::io("update block registry", e))?;
            if free >= self.min_required_free_space() {
                inner.available.insert(first_available_block_id, free);
            }
        }
        Ok(())
    }

    /// Saves block headers and flushes column files.
    pub fn flush(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        let last = inner.registry.last_block_id();
        for block_id in 1..=last {
            if let Some(block) = inner.blocks.get_mut(&block_id) {
                if let Err(e) = block.flush() {
                    warn!(target: "engine", "column '{}': flush of block {} failed: {}", self.name, block_id, e);
                }
            }
        }
        inner
            .registry
            .flush()
            .map_err(|e| Error::io("flush block registry", e))?;
        if let Some(master) = self.master.as_ref() {
            master
                .counters
                .lock()
                .flush()
                .map_err(|e| Error::io("flush TRID counters", e))?;
        }
        Ok(())
    }
}

enum ChunkSource<'a> {
    Bytes(&'a [u8]),
    Stream(Box<dyn LobStream>, Vec<u8>),
}

impl<'a> ChunkSource<'a> {
    fn remaining(&self) -> u64 {
        match self {
            ChunkSource::Bytes(b) => b.len() as u64,
            ChunkSource::Stream(s, _) => s.remaining_size(),
        }
    }

    // Yields exactly `n` bytes of the source.
    fn take(&mut self, n: usize) -> Result<&[u8]> {
        match self {
            ChunkSource::Bytes(b) => {
                let (head, tail) = b.split_at(n);
                *b = tail;
                Ok(head)
            }
            ChunkSource::Stream(s, buf) => {
                buf.resize(n, 0);
                let mut done = 0;
                while done < n {
                    let read = s
                        .read(&mut buf[done..])
                        .map_err(|e| Error::io("read LOB source", e))?;
                    if read == 0 {
                        return Err(Error::internal("LOB source ended early"));
                    }
                    done += read;
                }
                Ok(&buf[..n])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridb_types::ColumnDataType;
    use tempdir::TempDir;

    fn new_column(
        dir: &TempDir,
        name: &str,
        data_type: ColumnDataType,
        area_size: u32,
        not_null: bool,
    ) -> Arc<Column> {
        Arc::new(
            Column::create(
                crate::io::FileFactory::plaintext(),
                dir.path(),
                "TESTDB".to_owned(),
                "T".to_owned(),
                0x10000,
                100,
                ColumnSpecification {
                    name: name.to_owned(),
                    data_type,
                    block_data_area_size: area_size,
                    not_null,
                    default_value: None,
                    description: None,
                },
                1,
                1,
            )
            .unwrap(),
        )
    }

    fn new_master_column(dir: &TempDir, first_user_trid: u64) -> Arc<Column> {
        let column = Arc::new(
            Column::create(
                crate::io::FileFactory::plaintext(),
                dir.path(),
                "TESTDB".to_owned(),
                "T".to_owned(),
                0x10000,
                1,
                ColumnSpecification {
                    name: crate::defs::MASTER_COLUMN_NAME.to_owned(),
                    data_type: Column::MASTER_COLUMN_DATA_TYPE,
                    block_data_area_size: 0x1_0000,
                    not_null: true,
                    default_value: None,
                    description: None,
                },
                1,
                first_user_trid,
            )
            .unwrap(),
        );
        column
            .create_main_index(1, "T_TRID_IDX".to_owned(), crate::index::PAGE_SIZE * 2)
            .unwrap();
        column
    }

    #[test]
    fn scalar_values_roundtrip() {
        let dir = TempDir::new("column").unwrap();
        let cases: Vec<(ColumnDataType, Value)> = vec![
            (ColumnDataType::Bool, Value::Bool(true)),
            (ColumnDataType::Int8, Value::Int8(-5)),
            (ColumnDataType::UInt8, Value::UInt8(200)),
            (ColumnDataType::Int16, Value::Int16(-30000)),
            (ColumnDataType::UInt16, Value::UInt16(65000)),
            (ColumnDataType::Int32, Value::Int32(-2_000_000_000)),
            (ColumnDataType::UInt32, Value::UInt32(4_000_000_000)),
            (ColumnDataType::Int64, Value::Int64(i64::min_value() + 1)),
            (ColumnDataType::UInt64, Value::UInt64(u64::max_value() - 1)),
            (ColumnDataType::Float, Value::Float(1.5)),
            (ColumnDataType::Double, Value::Double(-2.25)),
            (
                ColumnDataType::Timestamp,
                Value::DateTime(RawDateTime {
                    year: 2021,
                    month: 6,
                    day_of_month: 1,
                    has_time_part: true,
                    hours: 12,
                    minutes: 30,
                    seconds: 45,
                    nanos: 123,
                }),
            ),
        ];
        for (i, (data_type, value)) in cases.into_iter().enumerate() {
            let subdir = TempDir::new_in(dir.path(), &format!("c{}", i)).unwrap();
            let column = new_column(&subdir, "V", data_type, 4096, false);
            let expected = value.try_clone().unwrap();
            let (addr, next) = column.write_record(value).unwrap();
            assert!(!addr.is_null());
            assert!(next.offset > addr.offset);
            assert_eq!(column.clone().read_record(addr, false).unwrap(), expected);
        }
    }

    #[test]
    fn null_handling_honors_not_null() {
        let dir = TempDir::new("column").unwrap();
        let nullable = new_column(&dir, "A", ColumnDataType::Int32, 4096, false);
        let (addr, next) = nullable.write_record(Value::Null).unwrap();
        assert!(addr.is_null() && next.is_null());
        assert!(nullable.clone().read_record(addr, false).unwrap().is_null());

        let strict_dir = TempDir::new("column_nn").unwrap();
        let strict = new_column(&strict_dir, "B", ColumnDataType::Int32, 4096, true);
        match strict.write_record(Value::Null) {
            Err(Error::User(UserError::CannotInsertNullValue { .. })) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn incompatible_value_is_a_user_error() {
        let dir = TempDir::new("column").unwrap();
        let column = new_column(&dir, "A", ColumnDataType::Int32, 4096, false);
        match column.write_record(Value::Text("not-a-number".to_owned())) {
            Err(Error::User(UserError::IncompatibleDataType { .. })) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn small_text_roundtrip() {
        let dir = TempDir::new("column").unwrap();
        let column = new_column(&dir, "B", ColumnDataType::Text, 4096, false);
        let (addr, _) = column.write_record(Value::Text("hello".to_owned())).unwrap();
        assert_eq!(
            column.clone().read_record(addr, false).unwrap(),
            Value::Text("hello".to_owned())
        );

        let (empty_addr, _) = column.write_record(Value::Text(String::new())).unwrap();
        assert_eq!(
            column.clone().read_record(empty_addr, false).unwrap(),
            Value::Text(String::new())
        );
    }

    #[test]
    fn lob_splits_into_chained_chunks() {
        let dir = TempDir::new("column").unwrap();
        // Small data area so a 1000-byte value cannot fit one block.
        let column = new_column(&dir, "B", ColumnDataType::Binary, 512, false);
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let (addr, _) = column.write_record(Value::Binary(payload.clone())).unwrap();

        let (header, _) = column
            .load_lob_chunk_header(addr.block_id, addr.offset)
            .unwrap();
        assert_eq!(header.remaining_lob_length, 1000);
        assert!(header.chunk_length < 1000);
        assert_ne!(header.next_chunk_block_id, 0, "expected a chained chunk");

        assert_eq!(
            column.clone().read_record(addr, false).unwrap(),
            Value::Binary(payload)
        );
    }

    #[test]
    fn large_text_comes_back_as_a_stream() {
        let dir = TempDir::new("column").unwrap();
        let column = new_column(
            &dir,
            "B",
            ColumnDataType::Text,
            crate::defs::DEFAULT_BLOCK_DATA_AREA_SIZE,
            false,
        );
        let payload = "X".repeat(1_500_000);
        let (addr, _) = column.write_record(Value::Text(payload.clone())).unwrap();

        match column.clone().read_record(addr, false).unwrap() {
            Value::Clob(mut stream) => {
                assert_eq!(stream.remaining_size(), 1_500_000);
                let mut data = Vec::with_capacity(1_500_000);
                let mut buf = [0u8; 65536];
                loop {
                    let n = stream.read(&mut buf).unwrap();
                    if n == 0 {
                        break;
                    }
                    data.extend_from_slice(&buf[..n]);
                }
                assert_eq!(data.len(), 1_500_000);
                assert_eq!(data, payload.as_bytes());
            }
            other => panic!("expected a CLOB stream, got {:?}", other),
        }

        // A LOB of this size cannot fit one block.
        let (header, _) = column
            .load_lob_chunk_header(addr.block_id, addr.offset)
            .unwrap();
        assert_ne!(header.next_chunk_block_id, 0);
    }

    #[test]
    fn available_block_keeps_enough_space() {
        let dir = TempDir::new("column").unwrap();
        let column = new_column(&dir, "A", ColumnDataType::Int64, 64, false);
        // 8 records fill one 64-byte block exactly; the 9th must go to a
        // fresh block.
        for i in 0..9i64 {
            let (addr, _) = column.write_record(Value::Int64(i)).unwrap();
            assert_eq!(
                column.clone().read_record(addr, false).unwrap(),
                Value::Int64(i)
            );
        }
        assert_eq!(column.last_block_id(), 2);
        assert_eq!(column.find_prev_block_id(2).unwrap(), 1);
    }

    #[test]
    fn master_column_records_and_index() {
        let dir = TempDir::new("column").unwrap();
        let master = new_master_column(&dir, 1);

        let trid = master.generate_next_user_trid().unwrap();
        assert_eq!(trid, 1);
        let mcr = MasterColumnRecord {
            trid,
            transaction_id: 1,
            create_timestamp: 1000,
            update_timestamp: 1000,
            version: 0,
            atomic_op_id: 1,
            operation: DmlOperation::Insert,
            user_id: 1,
            column_set_id: 1,
            prev_mcr_address: meridb_types::NULL_ADDRESS,
            column_records: vec![],
        };
        let (addr, _) = master.write_master_column_record(&mcr).unwrap();
        assert_eq!(master.main_index_find(trid).unwrap(), Some(addr));
        assert_eq!(master.read_master_column_record(addr).unwrap(), mcr);

        // A duplicate TRID insert must be rejected.
        match master.write_master_column_record(&mcr) {
            Err(Error::User(UserError::CannotInsertDuplicateTrid(1))) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        // An update moves the index entry in place.
        let updated = MasterColumnRecord {
            version: 1,
            operation: DmlOperation::Update,
            prev_mcr_address: addr,
            atomic_op_id: 2,
            ..mcr.clone()
        };
        let (new_addr, _) = master.write_master_column_record(&updated).unwrap();
        assert_eq!(master.main_index_find(trid).unwrap(), Some(new_addr));
        assert_eq!(
            master.read_master_column_record(new_addr).unwrap().prev_mcr_address,
            addr
        );

        // A delete erases the index entry.
        let tombstone = MasterColumnRecord {
            version: 2,
            operation: DmlOperation::Delete,
            prev_mcr_address: new_addr,
            atomic_op_id: 3,
            ..mcr
        };
        master.write_master_column_record(&tombstone).unwrap();
        assert_eq!(master.main_index_find(trid).unwrap(), None);
    }

    #[test]
    fn user_trid_generation_is_dense_and_bounded() {
        let dir = TempDir::new("column").unwrap();
        let master = new_master_column(&dir, u64::max_value() - 1);
        assert_eq!(master.generate_next_user_trid().unwrap(), u64::max_value() - 1);
        assert_eq!(master.generate_next_user_trid().unwrap(), u64::max_value());
        match master.generate_next_user_trid() {
            Err(Error::User(UserError::TridRangeExhausted { .. })) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        // The failed attempt must not advance the counter.
        assert_eq!(master.last_user_trid().unwrap(), u64::max_value());
    }

    #[test]
    fn trid_setters_refuse_decreases() {
        let dir = TempDir::new("column").unwrap();
        let master = new_master_column(&dir, 0x10000);
        master.set_last_system_trid(10).unwrap();
        // Setting the same value again is a no-op.
        master.set_last_system_trid(10).unwrap();
        match master.set_last_system_trid(9) {
            Err(Error::User(UserError::InvalidNextTrid { current: 10, requested: 9 })) => {}
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(master.last_system_trid().unwrap(), 10);
    }

    #[test]
    fn rollback_discards_data_after_address() {
        let dir = TempDir::new("column").unwrap();
        let column = new_column(&dir, "A", ColumnDataType::Int32, 4096, false);
        let (first, _) = column.write_record(Value::Int32(1)).unwrap();
        let (second, next) = column.write_record(Value::Int32(2)).unwrap();

        column.rollback_to_address(second, next.block_id).unwrap();

        // The first record is intact and the next write lands where the
        // second one used to be.
        assert_eq!(
            column.clone().read_record(first, false).unwrap(),
            Value::Int32(1)
        );
        let (third, _) = column.write_record(Value::Int32(3)).unwrap();
        assert_eq!(third, second);
    }

    #[test]
    fn counters_and_blocks_survive_reopen() {
        let dir = TempDir::new("column").unwrap();
        let addr = {
            let master = new_master_column(&dir, 1);
            master.generate_next_user_trid().unwrap();
            let mcr = MasterColumnRecord {
                trid: 1,
                transaction_id: 1,
                create_timestamp: 5,
                update_timestamp: 5,
                version: 0,
                atomic_op_id: 1,
                operation: DmlOperation::Insert,
                user_id: 1,
                column_set_id: 1,
                prev_mcr_address: meridb_types::NULL_ADDRESS,
                column_records: vec![],
            };
            let (addr, _) = master.write_master_column_record(&mcr).unwrap();
            master.flush().unwrap();
            master.flush_main_index().unwrap();
            addr
        };

        let master = Arc::new(
            Column::open(
                crate::io::FileFactory::plaintext(),
                dir.path(),
                "TESTDB".to_owned(),
                "T".to_owned(),
                0x10000,
                ColumnOpenInfo {
                    id: 1,
                    name: crate::defs::MASTER_COLUMN_NAME.to_owned(),
                    data_type: Column::MASTER_COLUMN_DATA_TYPE,
                    data_area_size: 0x1_0000,
                    description: None,
                },
                1,
            )
            .unwrap(),
        );
        master
            .load_main_index("T_TRID_IDX".to_owned(), crate::index::PAGE_SIZE * 2)
            .unwrap();
        assert_eq!(master.last_user_trid().unwrap(), 1);
        assert_eq!(master.main_index_find(1).unwrap(), Some(addr));
    }
}
