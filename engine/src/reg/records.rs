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

//! Catalog record structs and their snapshot codecs. The binary form is a
//! varint/length-prefixed field sequence; nested member rows (column set
//! columns, column definition constraints, index columns) serialize inside
//! their parent record.

use std::fmt;

use meridb_types::{pbe, ColumnDataType, Uuid};

use super::CatalogRecord;

/// Snapshot decoding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordError(pub String);

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed catalog record: {}", self.0)
    }
}

impl std::error::Error for RecordError {}

type DecodeResult<T> = std::result::Result<T, RecordError>;

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    fn varuint(&mut self) -> DecodeResult<u64> {
        let (value, n) = pbe::decode_varuint64(&self.buf[self.pos..])
            .ok_or_else(|| RecordError("truncated varint".into()))?;
        self.pos += n;
        Ok(value)
    }

    fn byte(&mut self) -> DecodeResult<u8> {
        if self.pos >= self.buf.len() {
            return Err(RecordError("truncated record".into()));
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self) -> DecodeResult<Vec<u8>> {
        let len = self.varuint()? as usize;
        if self.pos + len > self.buf.len() {
            return Err(RecordError("truncated byte string".into()));
        }
        let out = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    fn string(&mut self) -> DecodeResult<String> {
        String::from_utf8(self.bytes()?).map_err(|_| RecordError("invalid UTF-8 string".into()))
    }

    fn opt_string(&mut self) -> DecodeResult<Option<String>> {
        Ok(if self.byte()? != 0 {
            Some(self.string()?)
        } else {
            None
        })
    }

    fn finish(self) -> DecodeResult<()> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(RecordError("trailing bytes after record".into()))
        }
    }
}

fn put_bytes(bytes: &[u8], out: &mut Vec<u8>) {
    pbe::encode_varuint64(bytes.len() as u64, out);
    out.extend_from_slice(bytes);
}

fn put_opt_string(value: &Option<String>, out: &mut Vec<u8>) {
    match value {
        Some(s) => {
            out.push(1);
            put_bytes(s.as_bytes(), out);
        }
        None => out.push(0),
    }
}

// --- tables -------------------------------------------------------------

/// Table storage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TableType {
    Disk = 0,
    Memory = 1,
}

impl TableType {
    pub fn from_code(code: u8) -> Option<TableType> {
        Some(match code {
            0 => TableType::Disk,
            1 => TableType::Memory,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TableRecord {
    pub id: u32,
    pub table_type: TableType,
    pub name: String,
    pub first_user_trid: u64,
    pub current_column_set_id: u64,
    pub description: Option<String>,
}

impl TableRecord {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        pbe::encode_varuint64(u64::from(self.id), out);
        out.push(self.table_type as u8);
        put_bytes(self.name.as_bytes(), out);
        pbe::encode_varuint64(self.first_user_trid, out);
        pbe::encode_varuint64(self.current_column_set_id, out);
        put_opt_string(&self.description, out);
    }

    pub fn deserialize(buf: &[u8]) -> DecodeResult<TableRecord> {
        let mut r = Reader::new(buf);
        let record = TableRecord {
            id: r.varuint()? as u32,
            table_type: TableType::from_code(r.byte()?)
                .ok_or_else(|| RecordError("invalid table type".into()))?,
            name: r.string()?,
            first_user_trid: r.varuint()?,
            current_column_set_id: r.varuint()?,
            description: r.opt_string()?,
        };
        r.finish()?;
        Ok(record)
    }
}

impl CatalogRecord for TableRecord {
    fn record_id(&self) -> u64 {
        u64::from(self.id)
    }

    fn record_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

// --- column sets --------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSetColumnRecord {
    pub id: u64,
    pub column_set_id: u64,
    pub column_definition_id: u64,
    pub column_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSetRecord {
    pub id: u64,
    pub table_id: u32,
    /// Member columns in table position order.
    pub columns: Vec<ColumnSetColumnRecord>,
}

impl ColumnSetRecord {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        pbe::encode_varuint64(self.id, out);
        pbe::encode_varuint64(u64::from(self.table_id), out);
        pbe::encode_varuint64(self.columns.len() as u64, out);
        for column in &self.columns {
            pbe::encode_varuint64(column.id, out);
            pbe::encode_varuint64(column.column_definition_id, out);
            pbe::encode_varuint64(column.column_id, out);
        }
    }

    pub fn deserialize(buf: &[u8]) -> DecodeResult<ColumnSetRecord> {
        let mut r = Reader::new(buf);
        let id = r.varuint()?;
        let table_id = r.varuint()? as u32;
        let count = r.varuint()? as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            columns.push(ColumnSetColumnRecord {
                id: r.varuint()?,
                column_set_id: id,
                column_definition_id: r.varuint()?,
                column_id: r.varuint()?,
            });
        }
        r.finish()?;
        Ok(ColumnSetRecord {
            id,
            table_id,
            columns,
        })
    }
}

impl CatalogRecord for ColumnSetRecord {
    fn record_id(&self) -> u64 {
        self.id
    }
}

// --- columns ------------------------------------------------------------

/// Column lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ColumnState {
    Creating = 0,
    Active = 1,
    Deleted = 2,
}

impl ColumnState {
    pub fn from_code(code: u8) -> Option<ColumnState> {
        Some(match code {
            0 => ColumnState::Creating,
            1 => ColumnState::Active,
            2 => ColumnState::Deleted,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnRecord {
    pub id: u64,
    pub table_id: u32,
    pub data_type: ColumnDataType,
    pub name: String,
    pub state: ColumnState,
    pub block_data_area_size: u32,
    pub description: Option<String>,
}

impl ColumnRecord {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        pbe::encode_varuint64(self.id, out);
        pbe::encode_varuint64(u64::from(self.table_id), out);
        out.push(self.data_type as u8);
        put_bytes(self.name.as_bytes(), out);
        out.push(self.state as u8);
        pbe::encode_varuint64(u64::from(self.block_data_area_size), out);
        put_opt_string(&self.description, out);
    }

    pub fn deserialize(buf: &[u8]) -> DecodeResult<ColumnRecord> {
        let mut r = Reader::new(buf);
        let record = ColumnRecord {
            id: r.varuint()?,
            table_id: r.varuint()? as u32,
            data_type: ColumnDataType::from_code(r.byte()?)
                .ok_or_else(|| RecordError("invalid column data type".into()))?,
            name: r.string()?,
            state: ColumnState::from_code(r.byte()?)
                .ok_or_else(|| RecordError("invalid column state".into()))?,
            block_data_area_size: r.varuint()? as u32,
            description: r.opt_string()?,
        };
        r.finish()?;
        Ok(record)
    }
}

impl CatalogRecord for ColumnRecord {
    fn record_id(&self) -> u64 {
        self.id
    }
}

// --- column definitions -------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinitionConstraintRecord {
    pub id: u64,
    pub column_definition_id: u64,
    pub constraint_id: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDefinitionRecord {
    pub id: u64,
    pub column_id: u64,
    pub constraints: Vec<ColumnDefinitionConstraintRecord>,
}

impl ColumnDefinitionRecord {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        pbe::encode_varuint64(self.id, out);
        pbe::encode_varuint64(self.column_id, out);
        pbe::encode_varuint64(self.constraints.len() as u64, out);
        for constraint in &self.constraints {
            pbe::encode_varuint64(constraint.id, out);
            pbe::encode_varuint64(constraint.constraint_id, out);
        }
    }

    pub fn deserialize(buf: &[u8]) -> DecodeResult<ColumnDefinitionRecord> {
        let mut r = Reader::new(buf);
        let id = r.varuint()?;
        let column_id = r.varuint()?;
        let count = r.varuint()? as usize;
        let mut constraints = Vec::with_capacity(count);
        for _ in 0..count {
            constraints.push(ColumnDefinitionConstraintRecord {
                id: r.varuint()?,
                column_definition_id: id,
                constraint_id: r.varuint()?,
            });
        }
        r.finish()?;
        Ok(ColumnDefinitionRecord {
            id,
            column_id,
            constraints,
        })
    }
}

impl CatalogRecord for ColumnDefinitionRecord {
    fn record_id(&self) -> u64 {
        self.id
    }
}

// --- constraints --------------------------------------------------------

/// Constraint kind; further kinds are reserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConstraintType {
    NotNull = 0,
    DefaultValue = 1,
}

impl ConstraintType {
    pub fn from_code(code: u8) -> Option<ConstraintType> {
        Some(match code {
            0 => ConstraintType::NotNull,
            1 => ConstraintType::DefaultValue,
            _ => return None,
        })
    }
}

/// Constraint lifecycle; transitions are forward-only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConstraintState {
    Creating = 0,
    Active = 1,
    Disabled = 2,
    Deleted = 3,
}

impl ConstraintState {
    pub fn from_code(code: u8) -> Option<ConstraintState> {
        Some(match code {
            0 => ConstraintState::Creating,
            1 => ConstraintState::Active,
            2 => ConstraintState::Disabled,
            3 => ConstraintState::Deleted,
            _ => return None,
        })
    }
}

/// Content-addressable constraint body shared between constraints.
#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintDefinitionRecord {
    pub id: u64,
    pub constraint_type: ConstraintType,
    pub expression: Vec<u8>,
}

impl ConstraintDefinitionRecord {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        pbe::encode_varuint64(self.id, out);
        out.push(self.constraint_type as u8);
        put_bytes(&self.expression, out);
    }

    pub fn deserialize(buf: &[u8]) -> DecodeResult<ConstraintDefinitionRecord> {
        let mut r = Reader::new(buf);
        let record = ConstraintDefinitionRecord {
            id: r.varuint()?,
            constraint_type: ConstraintType::from_code(r.byte()?)
                .ok_or_else(|| RecordError("invalid constraint type".into()))?,
            expression: r.bytes()?,
        };
        r.finish()?;
        Ok(record)
    }
}

impl CatalogRecord for ConstraintDefinitionRecord {
    fn record_id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintRecord {
    pub id: u64,
    pub name: String,
    pub state: ConstraintState,
    pub table_id: u32,
    /// Zero for table-level constraints.
    pub column_id: u64,
    pub definition_id: u64,
    pub description: Option<String>,
}

impl ConstraintRecord {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        pbe::encode_varuint64(self.id, out);
        put_bytes(self.name.as_bytes(), out);
        out.push(self.state as u8);
        pbe::encode_varuint64(u64::from(self.table_id), out);
        pbe::encode_varuint64(self.column_id, out);
        pbe::encode_varuint64(self.definition_id, out);
        put_opt_string(&self.description, out);
    }

    pub fn deserialize(buf: &[u8]) -> DecodeResult<ConstraintRecord> {
        let mut r = Reader::new(buf);
        let record = ConstraintRecord {
            id: r.varuint()?,
            name: r.string()?,
            state: ConstraintState::from_code(r.byte()?)
                .ok_or_else(|| RecordError("invalid constraint state".into()))?,
            table_id: r.varuint()? as u32,
            column_id: r.varuint()?,
            definition_id: r.varuint()?,
            description: r.opt_string()?,
        };
        r.finish()?;
        Ok(record)
    }
}

impl CatalogRecord for ConstraintRecord {
    fn record_id(&self) -> u64 {
        self.id
    }

    fn record_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

// --- indices ------------------------------------------------------------

/// Index implementation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndexType {
    BTree = 0,
}

impl IndexType {
    pub fn from_code(code: u8) -> Option<IndexType> {
        Some(match code {
            0 => IndexType::BTree,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexColumnRecord {
    pub id: u64,
    pub index_id: u64,
    pub column_definition_id: u64,
    pub sort_descending: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexRecord {
    pub id: u64,
    pub index_type: IndexType,
    pub unique: bool,
    pub name: String,
    pub table_id: u32,
    pub data_file_size: u32,
    pub description: Option<String>,
    pub columns: Vec<IndexColumnRecord>,
}

impl IndexRecord {
    pub fn serialize(&self, out: &mut Vec<u8>) {
        pbe::encode_varuint64(self.id, out);
        out.push(self.index_type as u8);
        out.push(self.unique as u8);
        put_bytes(self.name.as_bytes(), out);
        pbe::encode_varuint64(u64::from(self.table_id), out);
        pbe::encode_varuint64(u64::from(self.data_file_size), out);
        put_opt_string(&self.description, out);
        pbe::encode_varuint64(self.columns.len() as u64, out);
        for column in &self.columns {
            pbe::encode_varuint64(column.id, out);
            pbe::encode_varuint64(column.column_definition_id, out);
            out.push(column.sort_descending as u8);
        }
    }

    pub fn deserialize(buf: &[u8]) -> DecodeResult<IndexRecord> {
        let mut r = Reader::new(buf);
        let id = r.varuint()?;
        let index_type = IndexType::from_code(r.byte()?)
            .ok_or_else(|| RecordError("invalid index type".into()))?;
        let unique = r.byte()? != 0;
        let name = r.string()?;
        let table_id = r.varuint()? as u32;
        let data_file_size = r.varuint()? as u32;
        let description = r.opt_string()?;
        let count = r.varuint()? as usize;
        let mut columns = Vec::with_capacity(count);
        for _ in 0..count {
            columns.push(IndexColumnRecord {
                id: r.varuint()?,
                index_id: id,
                column_definition_id: r.varuint()?,
                sort_descending: r.byte()? != 0,
            });
        }
        r.finish()?;
        Ok(IndexRecord {
            id,
            index_type,
            unique,
            name,
            table_id,
            data_file_size,
            description,
            columns,
        })
    }
}

impl CatalogRecord for IndexRecord {
    fn record_id(&self) -> u64 {
        self.id
    }

    fn record_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

// --- databases (instance-level) ------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseRecord {
    pub id: u32,
    pub uuid: Uuid,
    pub name: String,
    pub cipher_id: String,
    pub cipher_key: Vec<u8>,
    pub description: Option<String>,
}

impl CatalogRecord for DatabaseRecord {
    fn record_id(&self) -> u64 {
        u64::from(self.id)
    }

    fn record_name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_record_roundtrip() {
        let record = TableRecord {
            id: 0x10000,
            table_type: TableType::Disk,
            name: "EVENTS".to_owned(),
            first_user_trid: 1,
            current_column_set_id: 0x100_0001,
            description: Some("user events".to_owned()),
        };
        let mut buf = Vec::new();
        record.serialize(&mut buf);
        assert_eq!(TableRecord::deserialize(&buf).unwrap(), record);
    }

    #[test]
    fn column_set_record_roundtrip() {
        let record = ColumnSetRecord {
            id: 9,
            table_id: 3,
            columns: vec![
                ColumnSetColumnRecord {
                    id: 1,
                    column_set_id: 9,
                    column_definition_id: 11,
                    column_id: 21,
                },
                ColumnSetColumnRecord {
                    id: 2,
                    column_set_id: 9,
                    column_definition_id: 12,
                    column_id: 22,
                },
            ],
        };
        let mut buf = Vec::new();
        record.serialize(&mut buf);
        assert_eq!(ColumnSetRecord::deserialize(&buf).unwrap(), record);
    }

    #[test]
    fn index_record_roundtrip() {
        let record = IndexRecord {
            id: 77,
            index_type: IndexType::BTree,
            unique: true,
            name: "T_TRID_IDX".to_owned(),
            table_id: 5,
            data_file_size: 0x40_0000,
            description: None,
            columns: vec![IndexColumnRecord {
                id: 1,
                index_id: 77,
                column_definition_id: 10,
                sort_descending: false,
            }],
        };
        let mut buf = Vec::new();
        record.serialize(&mut buf);
        assert_eq!(IndexRecord::deserialize(&buf).unwrap(), record);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let record = ConstraintDefinitionRecord {
            id: 5,
            constraint_type: ConstraintType::NotNull,
            expression: vec![1],
        };
        let mut buf = Vec::new();
        record.serialize(&mut buf);
        assert!(ConstraintDefinitionRecord::deserialize(&buf[..buf.len() - 1]).is_err());
    }
}
