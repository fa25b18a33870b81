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

//! Request handler: translates parsed requests into storage operations
//! and emits framed responses. User errors travel back with their status
//! codes; I/O and internal errors are logged under a generated error id
//! and replaced with a generic message.

use std::io::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{error, info};

use meridb_proto::{ColumnDescription, DatabaseEngineResponse, DbeRequest, StatusMessage};
use meridb_types::{unix_timestamp, TransactionParameters, Value};

use crate::database::Database;
use crate::datasets::{DataSetColumn, TableDataSet};
use crate::defs::SYSTEM_DATABASE_NAME;
use crate::error::{Error, Result, UserError};
use crate::instance::Instance;
use crate::table::Table;

mod dml;
mod other;

/// Kinds of operations checked at request entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionType {
    Select,
    Insert,
    Update,
    Delete,
    Ddl,
}

static ERROR_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

// Token tying a generic client message to a detailed log line.
fn next_error_id() -> String {
    let counter = ERROR_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{:08x}-{:08x}", unix_timestamp() as u32, counter as u32)
}

/// Per-connection request handler.
pub struct RequestHandler<'a, W: Write> {
    instance: Arc<Instance>,
    connection: &'a mut W,
    user_id: u32,
    current_database: String,
}

impl<'a, W: Write> RequestHandler<'a, W> {
    pub fn new(
        instance: Arc<Instance>,
        connection: &'a mut W,
        user_id: u32,
    ) -> RequestHandler<'a, W> {
        instance.system_database().use_database();
        RequestHandler {
            instance,
            connection,
            user_id,
            current_database: SYSTEM_DATABASE_NAME.to_owned(),
        }
    }

    pub fn current_database(&self) -> &str {
        &self.current_database
    }

    /// Executes one request and writes its response(s) to the connection.
    pub fn execute_request(
        &mut self,
        request_id: u64,
        request: DbeRequest,
    ) -> std::io::Result<()> {
        let result = match request {
            DbeRequest::Select(r) => self.execute_select(request_id, r),
            DbeRequest::Insert(r) => self.execute_insert(request_id, r),
            DbeRequest::Update(r) => self.execute_update(request_id, r),
            DbeRequest::Delete(r) => self.execute_delete(request_id, r),
            DbeRequest::CreateDatabase(r) => self.execute_create_database(request_id, r),
            DbeRequest::CreateTable(r) => self.execute_create_table(request_id, r),
            DbeRequest::ShowDatabases => self.execute_show_databases(request_id),
            DbeRequest::ShowTables => self.execute_show_tables(request_id),
            DbeRequest::DescribeTable { database, table } => {
                self.execute_describe_table(request_id, database, table)
            }
            DbeRequest::UseDatabase { database } => self.execute_use_database(request_id, database),
            DbeRequest::SetNextTrid(r) => self.execute_set_next_trid(request_id, r),
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let response = self.translate_error(request_id, e);
                self.write_response(&response)
            }
        }
    }

    // --- shared plumbing ------------------------------------------------

    fn write_response(&mut self, response: &DatabaseEngineResponse) -> std::io::Result<()> {
        meridb_proto::write_message(
            self.connection,
            meridb_proto::MessageType::ServerResponse,
            &response.encode(),
        )
    }

    /// Writes a response outside the normal execution path, e.g. for
    /// requests that failed to decode.
    pub fn write_response_raw(&mut self, response: &DatabaseEngineResponse) -> std::io::Result<()> {
        self.write_response(response)
    }

    fn write_ok(&mut self, response: DatabaseEngineResponse) -> Result<()> {
        self.write_response(&response)
            .map_err(|e| Error::io("write response", e))
    }

    // Translates per the three response flavors: user errors verbatim,
    // everything else logged under an error id with a generic message.
    fn translate_error(&self, request_id: u64, e: Error) -> DatabaseEngineResponse {
        let mut response = DatabaseEngineResponse::new(request_id);
        match e {
            Error::User(user_error) => {
                response.messages.push(StatusMessage {
                    code: user_error.code(),
                    text: user_error.to_string(),
                });
            }
            Error::Compound(errors) => {
                for user_error in errors {
                    response.messages.push(StatusMessage {
                        code: user_error.code(),
                        text: user_error.to_string(),
                    });
                }
            }
            Error::Io { context, source } => {
                let error_id = next_error_id();
                error!(target: "engine", "[{}] I/O error: {}: {}", error_id, context, source);
                response.messages.push(StatusMessage {
                    code: u32::max_value(),
                    text: format!("IO error, see log, id {}", error_id),
                });
            }
            Error::Internal(message) => {
                let error_id = next_error_id();
                error!(target: "engine", "[{}] internal error: {}", error_id, message);
                response.messages.push(StatusMessage {
                    code: u32::max_value(),
                    text: format!("internal error, see log, id {}", error_id),
                });
            }
        }
        response
    }

    fn resolve_database(&self, requested: &str) -> Result<Arc<Database>> {
        let name = if requested.is_empty() {
            &self.current_database
        } else {
            requested
        };
        self.instance.find_database_checked(name)
    }

    // Permission check at DML entry. Writes to system tables are reserved
    // for internal catalog maintenance.
    fn check_operation_permitted(
        &self,
        database: &Database,
        table: &Table,
        permission: PermissionType,
    ) -> Result<()> {
        match permission {
            PermissionType::Select => Ok(()),
            PermissionType::Insert | PermissionType::Update | PermissionType::Delete
                if table.is_system() =>
            {
                Err(Error::User(UserError::CannotModifySystemTable {
                    database: database.name().to_owned(),
                    table: table.name().to_owned(),
                }))
            }
            _ => Ok(()),
        }
    }

    fn transaction_params(&self, database: &Database) -> TransactionParameters {
        TransactionParameters::new(self.user_id, database.generate_next_transaction_id())
    }

    // --- session state --------------------------------------------------

    fn execute_use_database(&mut self, request_id: u64, database: String) -> Result<()> {
        let db = self.instance.find_database_checked(&database)?;
        db.use_database();
        if let Ok(old) = self.instance.find_database_checked(&self.current_database) {
            old.release();
        }
        self.current_database = db.name().to_owned();
        info!(target: "engine", "connection switched to database '{}'", self.current_database);
        self.write_ok(DatabaseEngineResponse::new(request_id))
    }
}

impl<'a, W: Write> Drop for RequestHandler<'a, W> {
    fn drop(&mut self) {
        // Pairs with the use() taken at construction or at USE DATABASE.
        if let Ok(db) = self.instance.find_database_checked(&self.current_database) {
            db.release();
        }
    }
}

// Resolves selected column names to data set columns; unknown names are
// collected into one compound error.
pub(crate) fn resolve_columns(
    database: &Database,
    table: &Arc<Table>,
    names: &[String],
) -> Result<Vec<DataSetColumn>> {
    if names.is_empty() {
        return Ok(Vec::new());
    }
    let mut selected = Vec::with_capacity(names.len());
    let mut errors = Vec::new();
    for name in names {
        match table.find_column_position(name) {
            Some(position) => selected.push(DataSetColumn {
                position,
                name: name.clone(),
            }),
            None => errors.push(UserError::ColumnDoesNotExist {
                database: database.name().to_owned(),
                table: table.name().to_owned(),
                column: name.clone(),
            }),
        }
    }
    if !errors.is_empty() {
        return Err(Error::Compound(errors));
    }
    Ok(selected)
}

// Column descriptions of a data set, for the response header.
pub(crate) fn describe_columns(dataset: &TableDataSet) -> Vec<ColumnDescription> {
    let types = dataset.column_data_types();
    let columns = dataset.table().columns_ordered();
    dataset
        .selected_columns()
        .iter()
        .zip(types.into_iter())
        .map(|(c, data_type)| ColumnDescription {
            name: c.name.clone(),
            data_type,
            nullable: !columns[c.position].is_not_null(),
        })
        .collect()
}

// Clones values for repeated application across rows; stream values
// cannot be applied more than once.
pub(crate) fn clone_values(values: &[Value]) -> Result<Vec<Value>> {
    values
        .iter()
        .map(|v| {
            v.try_clone().ok_or_else(|| {
                Error::internal("stream values cannot be applied to multiple rows")
            })
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::open_instance;
    use meridb_proto::{
        decode_row, read_message, ColumnDefinition, CreateDatabaseRequest, CreateTableRequest,
        DeleteRequest, InsertRequest, MessageType, RowFilter, SelectRequest, SetNextTridRequest,
        UpdateRequest,
    };
    use meridb_types::ColumnDataType;
    use tempdir::TempDir;

    // Runs one request against a fresh handler and parses the framed
    // output: the response message plus any rowset that follows.
    fn run(
        instance: &Arc<Instance>,
        current_db: &str,
        request: DbeRequest,
    ) -> (DatabaseEngineResponse, Vec<Vec<Value>>) {
        let mut wire = Vec::new();
        {
            let mut handler = RequestHandler::new(instance.clone(), &mut wire, 1);
            if !current_db.is_empty() {
                handler.current_database = current_db.to_owned();
            }
            handler.execute_request(1, request).unwrap();
        }

        let mut cursor = std::io::Cursor::new(wire);
        let (message_type, payload) = read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(message_type, MessageType::ServerResponse);
        let response = DatabaseEngineResponse::decode(&payload).unwrap();

        let mut rows = Vec::new();
        if !response.columns.is_empty() && response.messages.is_empty() {
            let with_bitmask = response.has_null_bitmask();
            loop {
                let mut length: u64 = 0;
                let mut shift = 0;
                loop {
                    let mut byte = [0u8; 1];
                    use std::io::Read;
                    cursor.read_exact(&mut byte).unwrap();
                    length |= u64::from(byte[0] & 0x7f) << shift;
                    if byte[0] & 0x80 == 0 {
                        break;
                    }
                    shift += 7;
                }
                if length == 0 {
                    break;
                }
                use std::io::Read;
                let mut row = vec![0u8; length as usize];
                cursor.read_exact(&mut row).unwrap();
                rows.push(decode_row(&row, &response.columns, with_bitmask).unwrap());
            }
        }
        (response, rows)
    }

    fn setup_db1(instance: &Arc<Instance>) {
        let (response, _) = run(
            instance,
            "",
            DbeRequest::CreateDatabase(CreateDatabaseRequest {
                name: "DB1".to_owned(),
                cipher_id: "aes128".to_owned(),
                cipher_key: (0u8..16).collect(),
                description: None,
            }),
        );
        assert!(response.messages.is_empty(), "{:?}", response.messages);

        let (response, _) = run(
            instance,
            "DB1",
            DbeRequest::CreateTable(CreateTableRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                columns: vec![
                    ColumnDefinition {
                        name: "A".to_owned(),
                        data_type: ColumnDataType::Int32,
                        not_null: false,
                        default_value: None,
                    },
                    ColumnDefinition {
                        name: "B".to_owned(),
                        data_type: ColumnDataType::Text,
                        not_null: false,
                        default_value: None,
                    },
                ],
            }),
        );
        assert!(response.messages.is_empty(), "{:?}", response.messages);

        let (response, _) = run(
            instance,
            "DB1",
            DbeRequest::Insert(InsertRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                columns: vec![],
                rows: vec![
                    vec![Value::Int32(1), Value::Text("hello".to_owned())],
                    vec![Value::Int32(2), Value::Text("world".to_owned())],
                ],
            }),
        );
        assert_eq!(response.affected_row_count, Some(2));
    }

    #[test]
    fn insert_and_select_roundtrip() {
        let dir = TempDir::new("handler").unwrap();
        let instance = open_instance(dir.path());
        setup_db1(&instance);

        let (response, rows) = run(
            &instance,
            "DB1",
            DbeRequest::Select(SelectRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                columns: vec![],
                filter: None,
            }),
        );
        assert_eq!(response.columns.len(), 3);
        assert_eq!(response.columns[0].name, "TRID");
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0],
            vec![
                Value::UInt64(1),
                Value::Int32(1),
                Value::Text("hello".to_owned())
            ]
        );
        assert_eq!(
            rows[1],
            vec![
                Value::UInt64(2),
                Value::Int32(2),
                Value::Text("world".to_owned())
            ]
        );
    }

    #[test]
    fn update_with_bad_type_reports_and_preserves_row() {
        let dir = TempDir::new("handler").unwrap();
        let instance = open_instance(dir.path());
        setup_db1(&instance);

        let (response, _) = run(
            &instance,
            "DB1",
            DbeRequest::Update(UpdateRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                columns: vec!["A".to_owned()],
                values: vec![Value::Text("not-a-number".to_owned())],
                filter: Some(RowFilter::ByTrid(1)),
            }),
        );
        assert_eq!(response.messages.len(), 1);
        assert_eq!(
            response.messages[0].code,
            UserError::IncompatibleDataType {
                column: String::new(),
                column_type: ColumnDataType::Int32,
                cast: meridb_types::CastError {
                    from: meridb_types::ValueKind::Text,
                    to: meridb_types::ValueKind::Int32,
                },
            }
            .code()
        );

        let (_, rows) = run(
            &instance,
            "DB1",
            DbeRequest::Select(SelectRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                columns: vec![],
                filter: Some(RowFilter::ByTrid(1)),
            }),
        );
        assert_eq!(
            rows,
            vec![vec![
                Value::UInt64(1),
                Value::Int32(1),
                Value::Text("hello".to_owned())
            ]]
        );
    }

    #[test]
    fn large_clob_roundtrips_through_the_wire() {
        let dir = TempDir::new("handler").unwrap();
        let instance = open_instance(dir.path());
        setup_db1(&instance);

        let payload = "X".repeat(1_500_000);
        let (response, _) = run(
            &instance,
            "DB1",
            DbeRequest::Insert(InsertRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                columns: vec!["B".to_owned()],
                rows: vec![vec![Value::Text(payload.clone())]],
            }),
        );
        assert_eq!(response.affected_row_count, Some(1));

        let (_, rows) = run(
            &instance,
            "DB1",
            DbeRequest::Select(SelectRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                columns: vec!["B".to_owned()],
                filter: Some(RowFilter::ByTrid(3)),
            }),
        );
        assert_eq!(rows.len(), 1);
        match &rows[0][0] {
            Value::Text(s) => {
                assert_eq!(s.len(), 1_500_000);
                assert_eq!(*s, payload);
            }
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn catalog_persists_across_instance_restart() {
        let dir = TempDir::new("handler").unwrap();
        {
            let instance = open_instance(dir.path());
            setup_db1(&instance);
            let (response, _) = run(
                &instance,
                "DB1",
                DbeRequest::CreateTable(CreateTableRequest {
                    database: "DB1".to_owned(),
                    table: "U".to_owned(),
                    columns: vec![ColumnDefinition {
                        name: "A".to_owned(),
                        data_type: ColumnDataType::Int32,
                        not_null: false,
                        default_value: None,
                    }],
                }),
            );
            assert!(response.messages.is_empty());
            instance.flush().unwrap();
        }

        let instance = open_instance(dir.path());
        let (_, databases) = run(&instance, "", DbeRequest::ShowDatabases);
        let db_row = databases
            .iter()
            .find(|row| row[0] == Value::Text("DB1".to_owned()))
            .expect("DB1 is listed");
        assert_eq!(db_row[2], Value::Text("aes128".to_owned()));

        let (_, tables) = run(&instance, "DB1", DbeRequest::ShowTables);
        let names: Vec<&Value> = tables.iter().map(|row| &row[0]).collect();
        assert!(names.contains(&&Value::Text("T".to_owned())));
        assert!(names.contains(&&Value::Text("U".to_owned())));

        let (_, described) = run(
            &instance,
            "DB1",
            DbeRequest::DescribeTable {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
            },
        );
        assert_eq!(described.len(), 3);
        assert_eq!(described[1][0], Value::Text("A".to_owned()));
        assert_eq!(described[1][1], Value::Text("INT32".to_owned()));

        // Rows written before the restart are still there.
        let (_, rows) = run(
            &instance,
            "DB1",
            DbeRequest::Select(SelectRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                columns: vec![],
                filter: None,
            }),
        );
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn deleting_and_counting_rows() {
        let dir = TempDir::new("handler").unwrap();
        let instance = open_instance(dir.path());
        setup_db1(&instance);

        let (response, _) = run(
            &instance,
            "DB1",
            DbeRequest::Delete(DeleteRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                filter: Some(RowFilter::ByTrid(1)),
            }),
        );
        assert_eq!(response.affected_row_count, Some(1));

        let (_, rows) = run(
            &instance,
            "DB1",
            DbeRequest::Select(SelectRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                columns: vec![],
                filter: None,
            }),
        );
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0][0], Value::UInt64(2));
    }

    #[test]
    fn system_tables_reject_dml() {
        let dir = TempDir::new("handler").unwrap();
        let instance = open_instance(dir.path());

        let (response, _) = run(
            &instance,
            "",
            DbeRequest::Insert(InsertRequest {
                database: String::new(),
                table: "SYS_TABLES".to_owned(),
                columns: vec![],
                rows: vec![vec![Value::UInt8(0)]],
            }),
        );
        assert_eq!(response.messages.len(), 1);
        let expected = UserError::CannotModifySystemTable {
            database: String::new(),
            table: String::new(),
        }
        .code();
        assert_eq!(response.messages[0].code, expected);

        // Reading system tables is allowed.
        let (response, rows) = run(
            &instance,
            "",
            DbeRequest::Select(SelectRequest {
                database: String::new(),
                table: "SYS_TABLES".to_owned(),
                columns: vec!["NAME".to_owned()],
                filter: None,
            }),
        );
        assert!(response.messages.is_empty());
        assert!(!rows.is_empty());
    }

    #[test]
    fn compound_errors_travel_together() {
        let dir = TempDir::new("handler").unwrap();
        let instance = open_instance(dir.path());
        setup_db1(&instance);

        let (response, _) = run(
            &instance,
            "DB1",
            DbeRequest::Insert(InsertRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                columns: vec!["NOPE1".to_owned(), "NOPE2".to_owned()],
                rows: vec![vec![Value::Int32(1), Value::Int32(2)]],
            }),
        );
        assert_eq!(response.messages.len(), 2);
        assert!(response.messages.iter().all(|m| m.code != 0));
    }

    #[test]
    fn set_next_trid_controls_future_inserts() {
        let dir = TempDir::new("handler").unwrap();
        let instance = open_instance(dir.path());
        setup_db1(&instance);

        let (response, _) = run(
            &instance,
            "DB1",
            DbeRequest::SetNextTrid(SetNextTridRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                next_trid: 100,
            }),
        );
        assert!(response.messages.is_empty());

        let (response, _) = run(
            &instance,
            "DB1",
            DbeRequest::Insert(InsertRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                columns: vec![],
                rows: vec![vec![Value::Int32(3), Value::Text("later".to_owned())]],
            }),
        );
        assert!(response.messages.is_empty());

        let (_, rows) = run(
            &instance,
            "DB1",
            DbeRequest::Select(SelectRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                columns: vec![],
                filter: Some(RowFilter::ByTrid(100)),
            }),
        );
        assert_eq!(rows.len(), 1);

        // Moving the next TRID backwards is refused.
        let (response, _) = run(
            &instance,
            "DB1",
            DbeRequest::SetNextTrid(SetNextTridRequest {
                database: "DB1".to_owned(),
                table: "T".to_owned(),
                next_trid: 5,
            }),
        );
        assert_eq!(response.messages.len(), 1);
    }

    #[test]
    fn unknown_database_is_a_user_error() {
        let dir = TempDir::new("handler").unwrap();
        let instance = open_instance(dir.path());
        let (response, _) = run(
            &instance,
            "",
            DbeRequest::UseDatabase {
                database: "NO_SUCH_DB".to_owned(),
            },
        );
        assert_eq!(response.messages.len(), 1);
        assert_ne!(response.messages[0].code, 0);
    }
}
