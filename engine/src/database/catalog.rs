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

//! The self-describing system catalog: fixed schemas of the system tables,
//! and the codecs between catalog registry records and catalog table rows.
//! Row ids of catalog rows are the described objects' ids.

use meridb_types::{ColumnDataType, Value};

use crate::defs::{
    FIRST_USER_COLUMN_DEFINITION_CONSTRAINT_ID, FIRST_USER_COLUMN_DEFINITION_ID,
    FIRST_USER_COLUMN_ID, FIRST_USER_COLUMN_SET_COLUMN_ID, FIRST_USER_COLUMN_SET_ID,
    FIRST_USER_CONSTRAINT_DEFINITION_ID, FIRST_USER_CONSTRAINT_ID, FIRST_USER_DATABASE_ID,
    FIRST_USER_INDEX_COLUMN_ID, FIRST_USER_INDEX_ID, FIRST_USER_TABLE_ID,
};
use crate::error::{Error, Result};
use crate::reg::{
    ColumnDefinitionConstraintRecord, ColumnRecord, ColumnSetColumnRecord, ColumnSetRecord,
    ColumnState, ConstraintDefinitionRecord, ConstraintRecord, ConstraintState, ConstraintType,
    DatabaseRecord, IndexColumnRecord, IndexRecord, IndexType, TableRecord, TableType,
};

pub const SYS_TABLES: &str = "SYS_TABLES";
pub const SYS_COLUMN_SETS: &str = "SYS_COLUMN_SETS";
pub const SYS_COLUMNS: &str = "SYS_COLUMNS";
pub const SYS_COLUMN_DEFS: &str = "SYS_COLUMN_DEFS";
pub const SYS_COLUMN_SET_COLUMNS: &str = "SYS_COLUMN_SET_COLUMNS";
pub const SYS_CONSTRAINT_DEFS: &str = "SYS_CONSTRAINT_DEFS";
pub const SYS_CONSTRAINTS: &str = "SYS_CONSTRAINTS";
pub const SYS_COLUMN_DEF_CONSTRAINTS: &str = "SYS_COLUMN_DEF_CONSTRAINTS";
pub const SYS_INDICES: &str = "SYS_INDICES";
pub const SYS_INDEX_COLUMNS: &str = "SYS_INDEX_COLUMNS";
pub const SYS_DATABASES: &str = "SYS_DATABASES";

/// Column of a system table, not counting the master column.
pub struct SystemColumnDef {
    pub name: &'static str,
    pub data_type: ColumnDataType,
    pub not_null: bool,
    pub description: &'static str,
}

/// Fixed description of one system table.
pub struct SystemTableDef {
    pub id: u32,
    pub name: &'static str,
    pub description: &'static str,
    /// Row ids of this table are object ids; the user range starts at the
    /// described object kind's first user id.
    pub first_user_trid: u64,
    pub columns: &'static [SystemColumnDef],
}

use self::ColumnDataType::{Binary, Bool, Text, UInt32, UInt64, UInt8};

/// All system tables in creation order. `SYS_DATABASES` is last and exists
/// only in the system database, so the catalog layout of every database is
/// identical for the first ten tables.
pub const SYSTEM_TABLES: &[SystemTableDef] = &[
    SystemTableDef {
        id: 1,
        name: SYS_TABLES,
        description: "Tables of the database",
        first_user_trid: FIRST_USER_TABLE_ID as u64,
        columns: &[
            SystemColumnDef { name: "TYPE", data_type: UInt8, not_null: true, description: "Table storage type" },
            SystemColumnDef { name: "NAME", data_type: Text, not_null: true, description: "Table name" },
            SystemColumnDef { name: "FIRST_USER_TRID", data_type: UInt64, not_null: true, description: "First row identifier of the user range" },
            SystemColumnDef { name: "CURRENT_COLUMN_SET_ID", data_type: UInt64, not_null: true, description: "Current column set identifier" },
            SystemColumnDef { name: "DESCRIPTION", data_type: Text, not_null: false, description: "Table description" },
        ],
    },
    SystemTableDef {
        id: 2,
        name: SYS_COLUMN_SETS,
        description: "Column sets of the tables",
        first_user_trid: FIRST_USER_COLUMN_SET_ID,
        columns: &[
            SystemColumnDef { name: "TABLE_ID", data_type: UInt32, not_null: true, description: "Table identifier" },
            SystemColumnDef { name: "COLUMN_COUNT", data_type: UInt32, not_null: true, description: "Number of columns in the set" },
        ],
    },
    SystemTableDef {
        id: 3,
        name: SYS_COLUMNS,
        description: "Columns of the tables",
        first_user_trid: FIRST_USER_COLUMN_ID,
        columns: &[
            SystemColumnDef { name: "TABLE_ID", data_type: UInt32, not_null: true, description: "Table identifier" },
            SystemColumnDef { name: "DATA_TYPE", data_type: UInt8, not_null: true, description: "Column data type" },
            SystemColumnDef { name: "NAME", data_type: Text, not_null: true, description: "Column name" },
            SystemColumnDef { name: "STATE", data_type: UInt8, not_null: true, description: "Column state" },
            SystemColumnDef { name: "BLOCK_DATA_AREA_SIZE", data_type: UInt32, not_null: true, description: "Data area size of the column blocks" },
            SystemColumnDef { name: "DESCRIPTION", data_type: Text, not_null: false, description: "Column description" },
        ],
    },
    SystemTableDef {
        id: 4,
        name: SYS_COLUMN_DEFS,
        description: "Column definitions",
        first_user_trid: FIRST_USER_COLUMN_DEFINITION_ID,
        columns: &[
            SystemColumnDef { name: "COLUMN_ID", data_type: UInt64, not_null: true, description: "Column identifier" },
            SystemColumnDef { name: "CONSTRAINT_COUNT", data_type: UInt32, not_null: true, description: "Number of attached constraints" },
        ],
    },
    SystemTableDef {
        id: 5,
        name: SYS_COLUMN_SET_COLUMNS,
        description: "Member columns of the column sets",
        first_user_trid: FIRST_USER_COLUMN_SET_COLUMN_ID,
        columns: &[
            SystemColumnDef { name: "COLUMN_SET_ID", data_type: UInt64, not_null: true, description: "Column set identifier" },
            SystemColumnDef { name: "COLUMN_DEF_ID", data_type: UInt64, not_null: true, description: "Column definition identifier" },
            SystemColumnDef { name: "COLUMN_ID", data_type: UInt64, not_null: true, description: "Column identifier" },
        ],
    },
    SystemTableDef {
        id: 6,
        name: SYS_CONSTRAINT_DEFS,
        description: "Constraint definitions",
        first_user_trid: FIRST_USER_CONSTRAINT_DEFINITION_ID,
        columns: &[
            SystemColumnDef { name: "TYPE", data_type: UInt8, not_null: true, description: "Constraint type" },
            SystemColumnDef { name: "EXPR", data_type: Binary, not_null: false, description: "Constraint expression" },
        ],
    },
    SystemTableDef {
        id: 7,
        name: SYS_CONSTRAINTS,
        description: "Constraints of the tables",
        first_user_trid: FIRST_USER_CONSTRAINT_ID,
        columns: &[
            SystemColumnDef { name: "NAME", data_type: Text, not_null: true, description: "Constraint name" },
            SystemColumnDef { name: "STATE", data_type: UInt8, not_null: true, description: "Constraint state" },
            SystemColumnDef { name: "TABLE_ID", data_type: UInt32, not_null: true, description: "Table identifier" },
            SystemColumnDef { name: "COLUMN_ID", data_type: UInt64, not_null: false, description: "Column identifier, zero for table constraints" },
            SystemColumnDef { name: "DEF_ID", data_type: UInt64, not_null: true, description: "Constraint definition identifier" },
            SystemColumnDef { name: "DESCRIPTION", data_type: Text, not_null: false, description: "Constraint description" },
        ],
    },
    SystemTableDef {
        id: 8,
        name: SYS_COLUMN_DEF_CONSTRAINTS,
        description: "Constraints attached to column definitions",
        first_user_trid: FIRST_USER_COLUMN_DEFINITION_CONSTRAINT_ID,
        columns: &[
            SystemColumnDef { name: "COLUMN_DEF_ID", data_type: UInt64, not_null: true, description: "Column definition identifier" },
            SystemColumnDef { name: "CONSTRAINT_ID", data_type: UInt64, not_null: true, description: "Constraint identifier" },
        ],
    },
    SystemTableDef {
        id: 9,
        name: SYS_INDICES,
        description: "Indices of the tables",
        first_user_trid: FIRST_USER_INDEX_ID,
        columns: &[
            SystemColumnDef { name: "TYPE", data_type: UInt8, not_null: true, description: "Index type" },
            SystemColumnDef { name: "UNIQUE", data_type: Bool, not_null: true, description: "Uniqueness flag" },
            SystemColumnDef { name: "NAME", data_type: Text, not_null: true, description: "Index name" },
            SystemColumnDef { name: "TABLE_ID", data_type: UInt32, not_null: true, description: "Table identifier" },
            SystemColumnDef { name: "DATA_FILE_SIZE", data_type: UInt32, not_null: true, description: "Size of one index data file" },
            SystemColumnDef { name: "DESCRIPTION", data_type: Text, not_null: false, description: "Index description" },
        ],
    },
    SystemTableDef {
        id: 10,
        name: SYS_INDEX_COLUMNS,
        description: "Columns of the indices",
        first_user_trid: FIRST_USER_INDEX_COLUMN_ID,
        columns: &[
            SystemColumnDef { name: "INDEX_ID", data_type: UInt64, not_null: true, description: "Index identifier" },
            SystemColumnDef { name: "COLUMN_DEF_ID", data_type: UInt64, not_null: true, description: "Column definition identifier" },
            SystemColumnDef { name: "SORT_DESC", data_type: Bool, not_null: true, description: "Descending sort flag" },
        ],
    },
    SystemTableDef {
        id: 11,
        name: SYS_DATABASES,
        description: "Databases of the instance",
        first_user_trid: FIRST_USER_DATABASE_ID as u64,
        columns: &[
            SystemColumnDef { name: "UUID", data_type: Text, not_null: true, description: "Database UUID" },
            SystemColumnDef { name: "NAME", data_type: Text, not_null: true, description: "Database name" },
            SystemColumnDef { name: "CIPHER_ID", data_type: Text, not_null: true, description: "Cipher identifier" },
            SystemColumnDef { name: "CIPHER_KEY", data_type: Binary, not_null: false, description: "Encryption key" },
            SystemColumnDef { name: "DESCRIPTION", data_type: Text, not_null: false, description: "Database description" },
        ],
    },
];

/// Whether `name` is a system table name.
pub fn is_system_table(name: &str) -> bool {
    SYSTEM_TABLES.iter().any(|def| def.name == name)
}

pub fn system_table_def(name: &str) -> Option<&'static SystemTableDef> {
    SYSTEM_TABLES.iter().find(|def| def.name == name)
}

/// System tables present in every database (all but `SYS_DATABASES`).
pub fn per_database_system_tables() -> impl Iterator<Item = &'static SystemTableDef> {
    SYSTEM_TABLES.iter().filter(|def| def.name != SYS_DATABASES)
}

/// Deterministic column ids of the catalog tables.
///
/// Catalog tables are created in the fixed [`SYSTEM_TABLES`] order and
/// column ids are allocated sequentially, so the physical layout can be
/// reconstructed without reading the catalog itself.
pub fn catalog_column_ids(def: &SystemTableDef) -> Vec<u64> {
    let mut next_id = 1u64;
    for earlier in SYSTEM_TABLES.iter() {
        if earlier.id == def.id {
            break;
        }
        next_id += 1 + earlier.columns.len() as u64;
    }
    (next_id..next_id + 1 + def.columns.len() as u64).collect()
}

// --- row codecs ---------------------------------------------------------

fn opt_text(value: &Option<String>) -> Value {
    match value {
        Some(s) => Value::Text(s.clone()),
        None => Value::Null,
    }
}

fn row_u64(row: &[Value], i: usize) -> Result<u64> {
    row.get(i)
        .ok_or_else(|| Error::internal("catalog row is too short"))?
        .to_u64()
        .map_err(|e| Error::internal(format!("catalog row field {}: {}", i, e)))
}

fn row_u32(row: &[Value], i: usize) -> Result<u32> {
    Ok(row_u64(row, i)? as u32)
}

fn row_u8(row: &[Value], i: usize) -> Result<u8> {
    row.get(i)
        .ok_or_else(|| Error::internal("catalog row is too short"))?
        .to_u8()
        .map_err(|e| Error::internal(format!("catalog row field {}: {}", i, e)))
}

fn row_bool(row: &[Value], i: usize) -> Result<bool> {
    row.get(i)
        .ok_or_else(|| Error::internal("catalog row is too short"))?
        .to_bool()
        .map_err(|e| Error::internal(format!("catalog row field {}: {}", i, e)))
}

fn row_text(row: &[Value], i: usize) -> Result<String> {
    match row.get(i) {
        Some(Value::Text(s)) => Ok(s.clone()),
        _ => Err(Error::internal(format!(
            "catalog row field {} is not a text value",
            i
        ))),
    }
}

fn row_opt_text(row: &[Value], i: usize) -> Option<String> {
    match row.get(i) {
        Some(Value::Text(s)) => Some(s.clone()),
        _ => None,
    }
}

fn row_binary(row: &[Value], i: usize) -> Result<Vec<u8>> {
    match row.get(i) {
        Some(Value::Binary(b)) => Ok(b.clone()),
        Some(Value::Null) | None => Ok(Vec::new()),
        _ => Err(Error::internal(format!(
            "catalog row field {} is not a binary value",
            i
        ))),
    }
}

pub fn table_row(r: &TableRecord) -> Vec<Value> {
    vec![
        Value::UInt8(r.table_type as u8),
        Value::Text(r.name.clone()),
        Value::UInt64(r.first_user_trid),
        Value::UInt64(r.current_column_set_id),
        opt_text(&r.description),
    ]
}

pub fn table_from_row(trid: u64, row: &[Value]) -> Result<TableRecord> {
    Ok(TableRecord {
        id: trid as u32,
        table_type: TableType::from_code(row_u8(row, 0)?)
            .ok_or_else(|| Error::internal("invalid table type in catalog"))?,
        name: row_text(row, 1)?,
        first_user_trid: row_u64(row, 2)?,
        current_column_set_id: row_u64(row, 3)?,
        description: row_opt_text(row, 4),
    })
}

pub fn column_set_row(r: &ColumnSetRecord) -> Vec<Value> {
    vec![
        Value::UInt32(r.table_id),
        Value::UInt32(r.columns.len() as u32),
    ]
}

pub fn column_set_from_row(trid: u64, row: &[Value]) -> Result<ColumnSetRecord> {
    let _column_count = row_u32(row, 1)?;
    Ok(ColumnSetRecord {
        id: trid,
        table_id: row_u32(row, 0)?,
        columns: Vec::new(),
    })
}

pub fn column_set_column_row(r: &ColumnSetColumnRecord) -> Vec<Value> {
    vec![
        Value::UInt64(r.column_set_id),
        Value::UInt64(r.column_definition_id),
        Value::UInt64(r.column_id),
    ]
}

pub fn column_set_column_from_row(trid: u64, row: &[Value]) -> Result<ColumnSetColumnRecord> {
    Ok(ColumnSetColumnRecord {
        id: trid,
        column_set_id: row_u64(row, 0)?,
        column_definition_id: row_u64(row, 1)?,
        column_id: row_u64(row, 2)?,
    })
}

pub fn column_row(r: &ColumnRecord) -> Vec<Value> {
    vec![
        Value::UInt32(r.table_id),
        Value::UInt8(r.data_type as u8),
        Value::Text(r.name.clone()),
        Value::UInt8(r.state as u8),
        Value::UInt32(r.block_data_area_size),
        opt_text(&r.description),
    ]
}

pub fn column_from_row(trid: u64, row: &[Value]) -> Result<ColumnRecord> {
    Ok(ColumnRecord {
        id: trid,
        table_id: row_u32(row, 0)?,
        data_type: ColumnDataType::from_code(row_u8(row, 1)?)
            .ok_or_else(|| Error::internal("invalid column data type in catalog"))?,
        name: row_text(row, 2)?,
        state: ColumnState::from_code(row_u8(row, 3)?)
            .ok_or_else(|| Error::internal("invalid column state in catalog"))?,
        block_data_area_size: row_u32(row, 4)?,
        description: row_opt_text(row, 5),
    })
}

pub fn column_definition_row(r: &crate::reg::ColumnDefinitionRecord) -> Vec<Value> {
    vec![
        Value::UInt64(r.column_id),
        Value::UInt32(r.constraints.len() as u32),
    ]
}

pub fn column_definition_from_row(
    trid: u64,
    row: &[Value],
) -> Result<crate::reg::ColumnDefinitionRecord> {
    let _constraint_count = row_u32(row, 1)?;
    Ok(crate::reg::ColumnDefinitionRecord {
        id: trid,
        column_id: row_u64(row, 0)?,
        constraints: Vec::new(),
    })
}

pub fn column_definition_constraint_row(r: &ColumnDefinitionConstraintRecord) -> Vec<Value> {
    vec![
        Value::UInt64(r.column_definition_id),
        Value::UInt64(r.constraint_id),
    ]
}

pub fn column_definition_constraint_from_row(
    trid: u64,
    row: &[Value],
) -> Result<ColumnDefinitionConstraintRecord> {
    Ok(ColumnDefinitionConstraintRecord {
        id: trid,
        column_definition_id: row_u64(row, 0)?,
        constraint_id: row_u64(row, 1)?,
    })
}

pub fn constraint_definition_row(r: &ConstraintDefinitionRecord) -> Vec<Value> {
    vec![
        Value::UInt8(r.constraint_type as u8),
        Value::Binary(r.expression.clone()),
    ]
}

pub fn constraint_definition_from_row(
    trid: u64,
    row: &[Value],
) -> Result<ConstraintDefinitionRecord> {
    Ok(ConstraintDefinitionRecord {
        id: trid,
        constraint_type: ConstraintType::from_code(row_u8(row, 0)?)
            .ok_or_else(|| Error::internal("invalid constraint type in catalog"))?,
        expression: row_binary(row, 1)?,
    })
}

pub fn constraint_row(r: &ConstraintRecord) -> Vec<Value> {
    vec![
        Value::Text(r.name.clone()),
        Value::UInt8(r.state as u8),
        Value::UInt32(r.table_id),
        Value::UInt64(r.column_id),
        Value::UInt64(r.definition_id),
        opt_text(&r.description),
    ]
}

pub fn constraint_from_row(trid: u64, row: &[Value]) -> Result<ConstraintRecord> {
    Ok(ConstraintRecord {
        id: trid,
        name: row_text(row, 0)?,
        state: ConstraintState::from_code(row_u8(row, 1)?)
            .ok_or_else(|| Error::internal("invalid constraint state in catalog"))?,
        table_id: row_u32(row, 2)?,
        column_id: row_u64(row, 3)?,
        definition_id: row_u64(row, 4)?,
        description: row_opt_text(row, 5),
    })
}

pub fn index_row(r: &IndexRecord) -> Vec<Value> {
    vec![
        Value::UInt8(r.index_type as u8),
        Value::Bool(r.unique),
        Value::Text(r.name.clone()),
        Value::UInt32(r.table_id),
        Value::UInt32(r.data_file_size),
        opt_text(&r.description),
    ]
}

pub fn index_from_row(trid: u64, row: &[Value]) -> Result<IndexRecord> {
    Ok(IndexRecord {
        id: trid,
        index_type: IndexType::from_code(row_u8(row, 0)?)
            .ok_or_else(|| Error::internal("invalid index type in catalog"))?,
        unique: row_bool(row, 1)?,
        name: row_text(row, 2)?,
        table_id: row_u32(row, 3)?,
        data_file_size: row_u32(row, 4)?,
        description: row_opt_text(row, 5),
        columns: Vec::new(),
    })
}

pub fn index_column_row(r: &IndexColumnRecord) -> Vec<Value> {
    vec![
        Value::UInt64(r.index_id),
        Value::UInt64(r.column_definition_id),
        Value::Bool(r.sort_descending),
    ]
}

pub fn index_column_from_row(trid: u64, row: &[Value]) -> Result<IndexColumnRecord> {
    Ok(IndexColumnRecord {
        id: trid,
        index_id: row_u64(row, 0)?,
        column_definition_id: row_u64(row, 1)?,
        sort_descending: row_bool(row, 2)?,
    })
}

pub fn database_row(r: &DatabaseRecord) -> Vec<Value> {
    vec![
        Value::Text(r.uuid.to_string()),
        Value::Text(r.name.clone()),
        Value::Text(r.cipher_id.clone()),
        if r.cipher_key.is_empty() {
            Value::Null
        } else {
            Value::Binary(r.cipher_key.clone())
        },
        opt_text(&r.description),
    ]
}

pub fn database_from_row(trid: u64, row: &[Value]) -> Result<DatabaseRecord> {
    let uuid_text = row_text(row, 0)?;
    let mut uuid = meridb_types::Uuid::default();
    let hex: String = uuid_text.chars().filter(|c| *c != '-').collect();
    if hex.len() != 32 {
        return Err(Error::internal("invalid database UUID in catalog"));
    }
    for (i, chunk) in hex.as_bytes().chunks(2).enumerate() {
        let s = std::str::from_utf8(chunk).map_err(|_| Error::internal("invalid UUID"))?;
        uuid.0[i] =
            u8::from_str_radix(s, 16).map_err(|_| Error::internal("invalid database UUID"))?;
    }
    Ok(DatabaseRecord {
        id: trid as u32,
        uuid,
        name: row_text(row, 1)?,
        cipher_id: row_text(row, 2)?,
        cipher_key: row_binary(row, 3)?,
        description: row_opt_text(row, 4),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_table_list_is_complete_and_ordered() {
        assert_eq!(SYSTEM_TABLES.len(), 11);
        for (i, def) in SYSTEM_TABLES.iter().enumerate() {
            assert_eq!(def.id as usize, i + 1);
        }
        assert_eq!(SYSTEM_TABLES.last().unwrap().name, SYS_DATABASES);
        assert!(is_system_table("SYS_TABLES"));
        assert!(!is_system_table("MY_TABLE"));
    }

    #[test]
    fn catalog_column_ids_are_sequential() {
        let first = &SYSTEM_TABLES[0];
        assert_eq!(catalog_column_ids(first), vec![1, 2, 3, 4, 5, 6]);
        let second = &SYSTEM_TABLES[1];
        // SYS_TABLES has TRID + 5 columns, so SYS_COLUMN_SETS starts at 7.
        assert_eq!(catalog_column_ids(second), vec![7, 8, 9]);
    }

    #[test]
    fn table_row_roundtrip() {
        let record = TableRecord {
            id: 0x10000,
            table_type: TableType::Disk,
            name: "T".to_owned(),
            first_user_trid: 1,
            current_column_set_id: 0x100_0000,
            description: None,
        };
        let row = table_row(&record);
        assert_eq!(table_from_row(0x10000, &row).unwrap(), record);
    }

    #[test]
    fn database_row_roundtrip() {
        let record = DatabaseRecord {
            id: 0x1000,
            uuid: meridb_types::Uuid([0xab; 16]),
            name: "DB1".to_owned(),
            cipher_id: "aes128".to_owned(),
            cipher_key: (0u8..16).collect(),
            description: Some("first database".to_owned()),
        };
        let row = database_row(&record);
        assert_eq!(database_from_row(0x1000, &row).unwrap(), record);
    }
}
