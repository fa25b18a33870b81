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

//! DDL and introspection executors: CREATE DATABASE/TABLE, SHOW, DESCRIBE,
//! ALTER TABLE SET NEXT_TRID.

use std::io::Write;

use meridb_proto::{
    ColumnDescription, CreateDatabaseRequest, CreateTableRequest, DatabaseEngineResponse,
    RowsetWriter, SetNextTridRequest,
};
use meridb_types::{ColumnDataType, Value};

use crate::error::{Error, Result, UserError};
use crate::handlers::RequestHandler;
use crate::table::TableColumnSpec;

impl<'a, W: Write> RequestHandler<'a, W> {
    pub(super) fn execute_create_database(
        &mut self,
        request_id: u64,
        request: CreateDatabaseRequest,
    ) -> Result<()> {
        self.instance.create_database(
            request.name,
            request.cipher_id,
            request.cipher_key,
            request.description,
        )?;
        self.write_ok(DatabaseEngineResponse::new(request_id))
    }

    pub(super) fn execute_create_table(
        &mut self,
        request_id: u64,
        request: CreateTableRequest,
    ) -> Result<()> {
        let database = self.resolve_database(&request.database)?;
        let columns = request
            .columns
            .into_iter()
            .map(|c| TableColumnSpec {
                name: c.name,
                data_type: c.data_type,
                not_null: c.not_null,
                default_value: c.default_value,
                description: None,
            })
            .collect();
        database.create_user_table(request.table, 1, None, columns)?;
        self.write_ok(DatabaseEngineResponse::new(request_id))
    }

    pub(super) fn execute_show_databases(&mut self, request_id: u64) -> Result<()> {
        let mut response = DatabaseEngineResponse::new(request_id);
        response.columns = vec![
            ColumnDescription {
                name: "NAME".to_owned(),
                data_type: ColumnDataType::Text,
                nullable: false,
            },
            ColumnDescription {
                name: "UUID".to_owned(),
                data_type: ColumnDataType::Text,
                nullable: false,
            },
            ColumnDescription {
                name: "CIPHER_ID".to_owned(),
                data_type: ColumnDataType::Text,
                nullable: false,
            },
        ];
        let records = self.instance.database_records();
        let mut writer = RowsetWriter::begin(self.connection, &response)
            .map_err(|e| Error::io("write show databases response", e))?;
        for record in records {
            writer
                .write_row(vec![
                    Value::Text(record.name),
                    Value::Text(record.uuid.to_string()),
                    Value::Text(record.cipher_id),
                ])
                .map_err(|e| Error::io("write show databases row", e))?;
        }
        writer
            .finish()
            .map_err(|e| Error::io("finish show databases rowset", e))
    }

    pub(super) fn execute_show_tables(&mut self, request_id: u64) -> Result<()> {
        let database = self.resolve_database("")?;
        let mut response = DatabaseEngineResponse::new(request_id);
        response.columns = vec![
            ColumnDescription {
                name: "NAME".to_owned(),
                data_type: ColumnDataType::Text,
                nullable: false,
            },
            ColumnDescription {
                name: "DESCRIPTION".to_owned(),
                data_type: ColumnDataType::Text,
                nullable: true,
            },
        ];
        let records = database.table_records();
        let mut writer = RowsetWriter::begin(self.connection, &response)
            .map_err(|e| Error::io("write show tables response", e))?;
        for record in records {
            writer
                .write_row(vec![
                    Value::Text(record.name),
                    record
                        .description
                        .map(Value::Text)
                        .unwrap_or(Value::Null),
                ])
                .map_err(|e| Error::io("write show tables row", e))?;
        }
        writer
            .finish()
            .map_err(|e| Error::io("finish show tables rowset", e))
    }

    pub(super) fn execute_describe_table(
        &mut self,
        request_id: u64,
        database: String,
        table: String,
    ) -> Result<()> {
        let database = self.resolve_database(&database)?;
        let table = database.find_table_checked(&table)?;

        let mut response = DatabaseEngineResponse::new(request_id);
        response.columns = vec![
            ColumnDescription {
                name: "NAME".to_owned(),
                data_type: ColumnDataType::Text,
                nullable: false,
            },
            ColumnDescription {
                name: "DATA_TYPE".to_owned(),
                data_type: ColumnDataType::Text,
                nullable: false,
            },
            ColumnDescription {
                name: "NOT_NULL".to_owned(),
                data_type: ColumnDataType::Bool,
                nullable: false,
            },
        ];
        let columns = table.columns_ordered();
        let mut writer = RowsetWriter::begin(self.connection, &response)
            .map_err(|e| Error::io("write describe table response", e))?;
        for column in columns {
            writer
                .write_row(vec![
                    Value::Text(column.name().to_owned()),
                    Value::Text(column.data_type().name().to_owned()),
                    Value::Bool(column.is_not_null()),
                ])
                .map_err(|e| Error::io("write describe table row", e))?;
        }
        writer
            .finish()
            .map_err(|e| Error::io("finish describe table rowset", e))
    }

    pub(super) fn execute_set_next_trid(
        &mut self,
        request_id: u64,
        request: SetNextTridRequest,
    ) -> Result<()> {
        let database = self.resolve_database(&request.database)?;
        let table = database.find_table_checked(&request.table)?;
        if table.is_system() {
            return Err(Error::User(UserError::CannotModifySystemTable {
                database: database.name().to_owned(),
                table: table.name().to_owned(),
            }));
        }
        if request.next_trid == 0 {
            return Err(Error::User(UserError::InvalidNextTrid {
                current: table.master_column()?.last_user_trid()?,
                requested: 0,
            }));
        }
        // The setter records the last used id; NEXT_TRID is one past it.
        table.set_last_user_trid(request.next_trid - 1)?;
        self.write_ok(DatabaseEngineResponse::new(request_id))
    }
}
