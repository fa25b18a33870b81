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

//! Parsed engine requests. The SQL parser lives upstream; the engine
//! consumes these already-analyzed request structures. An empty database
//! name resolves against the connection's current database.

use meridb_types::{pbe, ColumnDataType, Value};

use crate::{put_bytes, put_string, Reader, WireError};

/// Row selector of UPDATE/DELETE/SELECT requests. Arbitrary predicate
/// evaluation belongs to the upstream expression evaluator; the engine
/// executes direct row-id selection and full scans.
#[derive(Debug, Clone, PartialEq)]
pub enum RowFilter {
    /// Match the single row with this id.
    ByTrid(u64),
}

/// Column of a CREATE TABLE request.
#[derive(Debug, PartialEq)]
pub struct ColumnDefinition {
    pub name: String,
    pub data_type: ColumnDataType,
    pub not_null: bool,
    pub default_value: Option<Value>,
}

#[derive(Debug, PartialEq)]
pub struct SelectRequest {
    pub database: String,
    pub table: String,
    /// Empty means all columns.
    pub columns: Vec<String>,
    pub filter: Option<RowFilter>,
}

#[derive(Debug, PartialEq)]
pub struct InsertRequest {
    pub database: String,
    pub table: String,
    /// Empty means positional values.
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

#[derive(Debug, PartialEq)]
pub struct UpdateRequest {
    pub database: String,
    pub table: String,
    pub columns: Vec<String>,
    pub values: Vec<Value>,
    pub filter: Option<RowFilter>,
}

#[derive(Debug, PartialEq)]
pub struct DeleteRequest {
    pub database: String,
    pub table: String,
    pub filter: Option<RowFilter>,
}

#[derive(Debug, PartialEq)]
pub struct CreateDatabaseRequest {
    pub name: String,
    pub cipher_id: String,
    pub cipher_key: Vec<u8>,
    pub description: Option<String>,
}

#[derive(Debug, PartialEq)]
pub struct CreateTableRequest {
    pub database: String,
    pub table: String,
    pub columns: Vec<ColumnDefinition>,
}

#[derive(Debug, PartialEq)]
pub struct SetNextTridRequest {
    pub database: String,
    pub table: String,
    pub next_trid: u64,
}

/// A parsed request for the engine.
#[derive(Debug, PartialEq)]
pub enum DbeRequest {
    Select(SelectRequest),
    Insert(InsertRequest),
    Update(UpdateRequest),
    Delete(DeleteRequest),
    CreateDatabase(CreateDatabaseRequest),
    CreateTable(CreateTableRequest),
    ShowDatabases,
    ShowTables,
    DescribeTable { database: String, table: String },
    UseDatabase { database: String },
    SetNextTrid(SetNextTridRequest),
}

const TAG_SELECT: u8 = 1;
const TAG_INSERT: u8 = 2;
const TAG_UPDATE: u8 = 3;
const TAG_DELETE: u8 = 4;
const TAG_CREATE_DATABASE: u8 = 5;
const TAG_CREATE_TABLE: u8 = 6;
const TAG_SHOW_DATABASES: u8 = 7;
const TAG_SHOW_TABLES: u8 = 8;
const TAG_DESCRIBE_TABLE: u8 = 9;
const TAG_USE_DATABASE: u8 = 10;
const TAG_SET_NEXT_TRID: u8 = 11;

fn put_filter(filter: &Option<RowFilter>, out: &mut Vec<u8>) {
    match filter {
        None => out.push(0),
        Some(RowFilter::ByTrid(trid)) => {
            out.push(1);
            pbe::encode_varuint64(*trid, out);
        }
    }
}

fn read_filter(r: &mut Reader<'_>) -> Result<Option<RowFilter>, WireError> {
    match r.byte()? {
        0 => Ok(None),
        1 => Ok(Some(RowFilter::ByTrid(r.varuint()?))),
        other => Err(WireError(format!("unknown row filter kind {}", other))),
    }
}

fn put_value(value: &Value, out: &mut Vec<u8>) -> Result<(), WireError> {
    if !value.encode_to(out) {
        return Err(WireError(
            "stream values cannot be sent in a request".to_owned(),
        ));
    }
    Ok(())
}

impl DbeRequest {
    /// Encodes the request into a `Command` message payload, prefixed by
    /// the request id.
    pub fn encode(&self, request_id: u64) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(64);
        pbe::encode_varuint64(request_id, &mut out);
        match self {
            DbeRequest::Select(r) => {
                out.push(TAG_SELECT);
                put_string(&r.database, &mut out);
                put_string(&r.table, &mut out);
                pbe::encode_varuint64(r.columns.len() as u64, &mut out);
                for column in &r.columns {
                    put_string(column, &mut out);
                }
                put_filter(&r.filter, &mut out);
            }
            DbeRequest::Insert(r) => {
                out.push(TAG_INSERT);
                put_string(&r.database, &mut out);
                put_string(&r.table, &mut out);
                pbe::encode_varuint64(r.columns.len() as u64, &mut out);
                for column in &r.columns {
                    put_string(column, &mut out);
                }
                pbe::encode_varuint64(r.rows.len() as u64, &mut out);
                for row in &r.rows {
                    pbe::encode_varuint64(row.len() as u64, &mut out);
                    for value in row {
                        put_value(value, &mut out)?;
                    }
                }
            }
            DbeRequest::Update(r) => {
                out.push(TAG_UPDATE);
                put_string(&r.database, &mut out);
                put_string(&r.table, &mut out);
                pbe::encode_varuint64(r.columns.len() as u64, &mut out);
                for column in &r.columns {
                    put_string(column, &mut out);
                }
                pbe::encode_varuint64(r.values.len() as u64, &mut out);
                for value in &r.values {
                    put_value(value, &mut out)?;
                }
                put_filter(&r.filter, &mut out);
            }
            DbeRequest::Delete(r) => {
                out.push(TAG_DELETE);
                put_string(&r.database, &mut out);
                put_string(&r.table, &mut out);
                put_filter(&r.filter, &mut out);
            }
            DbeRequest::CreateDatabase(r) => {
                out.push(TAG_CREATE_DATABASE);
                put_string(&r.name, &mut out);
                put_string(&r.cipher_id, &mut out);
                put_bytes(&r.cipher_key, &mut out);
                match &r.description {
                    Some(d) => {
                        out.push(1);
                        put_string(d, &mut out);
                    }
                    None => out.push(0),
                }
            }
            DbeRequest::CreateTable(r) => {
                out.push(TAG_CREATE_TABLE);
                put_string(&r.database, &mut out);
                put_string(&r.table, &mut out);
                pbe::encode_varuint64(r.columns.len() as u64, &mut out);
                for column in &r.columns {
                    put_string(&column.name, &mut out);
                    out.push(column.data_type as u8);
                    out.push(column.not_null as u8);
                    match &column.default_value {
                        Some(v) => {
                            out.push(1);
                            put_value(v, &mut out)?;
                        }
                        None => out.push(0),
                    }
                }
            }
            DbeRequest::ShowDatabases => out.push(TAG_SHOW_DATABASES),
            DbeRequest::ShowTables => out.push(TAG_SHOW_TABLES),
            DbeRequest::DescribeTable { database, table } => {
                out.push(TAG_DESCRIBE_TABLE);
                put_string(database, &mut out);
                put_string(table, &mut out);
            }
            DbeRequest::UseDatabase { database } => {
                out.push(TAG_USE_DATABASE);
                put_string(database, &mut out);
            }
            DbeRequest::SetNextTrid(r) => {
                out.push(TAG_SET_NEXT_TRID);
                put_string(&r.database, &mut out);
                put_string(&r.table, &mut out);
                pbe::encode_varuint64(r.next_trid, &mut out);
            }
        }
        Ok(out)
    }

    /// Decodes a `Command` payload. Returns the request id and the request.
    pub fn decode(payload: &[u8]) -> Result<(u64, DbeRequest), WireError> {
        let mut r = Reader::new(payload);
        let request_id = r.varuint()?;
        let request = match r.byte()? {
            TAG_SELECT => {
                let database = r.string()?;
                let table = r.string()?;
                let count = r.varuint()? as usize;
                let mut columns = Vec::with_capacity(count);
                for _ in 0..count {
                    columns.push(r.string()?);
                }
                let filter = read_filter(&mut r)?;
                DbeRequest::Select(SelectRequest {
                    database,
                    table,
                    columns,
                    filter,
                })
            }
            TAG_INSERT => {
                let database = r.string()?;
                let table = r.string()?;
                let count = r.varuint()? as usize;
                let mut columns = Vec::with_capacity(count);
                for _ in 0..count {
                    columns.push(r.string()?);
                }
                let row_count = r.varuint()? as usize;
                let mut rows = Vec::with_capacity(row_count);
                for _ in 0..row_count {
                    let value_count = r.varuint()? as usize;
                    let mut row = Vec::with_capacity(value_count);
                    for _ in 0..value_count {
                        row.push(r.value()?);
                    }
                    rows.push(row);
                }
                DbeRequest::Insert(InsertRequest {
                    database,
                    table,
                    columns,
                    rows,
                })
            }
            TAG_UPDATE => {
                let database = r.string()?;
                let table = r.string()?;
                let count = r.varuint()? as usize;
                let mut columns = Vec::with_capacity(count);
                for _ in 0..count {
                    columns.push(r.string()?);
                }
                let value_count = r.varuint()? as usize;
                let mut values = Vec::with_capacity(value_count);
                for _ in 0..value_count {
                    values.push(r.value()?);
                }
                let filter = read_filter(&mut r)?;
                DbeRequest::Update(UpdateRequest {
                    database,
                    table,
                    columns,
                    values,
                    filter,
                })
            }
            TAG_DELETE => DbeRequest::Delete(DeleteRequest {
                database: r.string()?,
                table: r.string()?,
                filter: read_filter(&mut r)?,
            }),
            TAG_CREATE_DATABASE => {
                let name = r.string()?;
                let cipher_id = r.string()?;
                let cipher_key = r.bytes()?;
                let description = if r.byte()? != 0 {
                    Some(r.string()?)
                } else {
                    None
                };
                DbeRequest::CreateDatabase(CreateDatabaseRequest {
                    name,
                    cipher_id,
                    cipher_key,
                    description,
                })
            }
            TAG_CREATE_TABLE => {
                let database = r.string()?;
                let table = r.string()?;
                let count = r.varuint()? as usize;
                let mut columns = Vec::with_capacity(count);
                for _ in 0..count {
                    let name = r.string()?;
                    let data_type = ColumnDataType::from_code(r.byte()?)
                        .ok_or_else(|| WireError("invalid column data type".to_owned()))?;
                    let not_null = r.byte()? != 0;
                    let default_value = if r.byte()? != 0 {
                        Some(r.value()?)
                    } else {
                        None
                    };
                    columns.push(ColumnDefinition {
                        name,
                        data_type,
                        not_null,
                        default_value,
                    });
                }
                DbeRequest::CreateTable(CreateTableRequest {
                    database,
                    table,
                    columns,
                })
            }
            TAG_SHOW_DATABASES => DbeRequest::ShowDatabases,
            TAG_SHOW_TABLES => DbeRequest::ShowTables,
            TAG_DESCRIBE_TABLE => DbeRequest::DescribeTable {
                database: r.string()?,
                table: r.string()?,
            },
            TAG_USE_DATABASE => DbeRequest::UseDatabase {
                database: r.string()?,
            },
            TAG_SET_NEXT_TRID => DbeRequest::SetNextTrid(SetNextTridRequest {
                database: r.string()?,
                table: r.string()?,
                next_trid: r.varuint()?,
            }),
            other => return Err(WireError(format!("unknown request tag {}", other))),
        };
        r.expect_end()?;
        Ok((request_id, request))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_roundtrip() {
        let request = DbeRequest::Insert(InsertRequest {
            database: "DB1".to_owned(),
            table: "T".to_owned(),
            columns: vec!["A".to_owned(), "B".to_owned()],
            rows: vec![
                vec![Value::Int32(1), Value::Text("hello".to_owned())],
                vec![Value::Int32(2), Value::Text("world".to_owned())],
            ],
        });
        let payload = request.encode(17).unwrap();
        let (request_id, decoded) = DbeRequest::decode(&payload).unwrap();
        assert_eq!(request_id, 17);
        assert_eq!(decoded, request);
    }

    #[test]
    fn select_with_filter_roundtrip() {
        let request = DbeRequest::Select(SelectRequest {
            database: String::new(),
            table: "T".to_owned(),
            columns: vec!["B".to_owned()],
            filter: Some(RowFilter::ByTrid(42)),
        });
        let payload = request.encode(1).unwrap();
        assert_eq!(DbeRequest::decode(&payload).unwrap().1, request);
    }

    #[test]
    fn create_table_roundtrip() {
        let request = DbeRequest::CreateTable(CreateTableRequest {
            database: "DB1".to_owned(),
            table: "U".to_owned(),
            columns: vec![
                ColumnDefinition {
                    name: "A".to_owned(),
                    data_type: ColumnDataType::Int32,
                    not_null: true,
                    default_value: Some(Value::Int32(7)),
                },
                ColumnDefinition {
                    name: "B".to_owned(),
                    data_type: ColumnDataType::Text,
                    not_null: false,
                    default_value: None,
                },
            ],
        });
        let payload = request.encode(3).unwrap();
        assert_eq!(DbeRequest::decode(&payload).unwrap().1, request);
    }

    #[test]
    fn garbage_request_is_rejected() {
        assert!(DbeRequest::decode(&[0x00, 0xfe]).is_err());
        assert!(DbeRequest::decode(&[]).is_err());
    }
}
