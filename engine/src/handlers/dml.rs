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

//! DML executors: SELECT, INSERT, UPDATE, DELETE.

use std::io::Write;

use meridb_proto::{
    DatabaseEngineResponse, DeleteRequest, InsertRequest, RowFilter, RowsetWriter, SelectRequest,
    UpdateRequest,
};

use crate::datasets::TableDataSet;
use crate::error::{Error, Result};
use crate::handlers::{
    clone_values, describe_columns, resolve_columns, PermissionType, RequestHandler,
};

impl<'a, W: Write> RequestHandler<'a, W> {
    pub(super) fn execute_select(
        &mut self,
        request_id: u64,
        request: SelectRequest,
    ) -> Result<()> {
        let database = self.resolve_database(&request.database)?;
        let table = database.find_table_checked(&request.table)?;
        self.check_operation_permitted(&database, &table, PermissionType::Select)?;

        let selected = resolve_columns(&database, &table, &request.columns)?;
        let mut dataset = TableDataSet::new(table, selected);

        let mut response = DatabaseEngineResponse::new(request_id);
        response.columns = describe_columns(&dataset);
        let mut writer = RowsetWriter::begin(self.connection, &response)
            .map_err(|e| Error::io("write select response", e))?;

        match request.filter {
            Some(RowFilter::ByTrid(trid)) => {
                if dataset.position_at_trid(trid)? {
                    let row = dataset.current_row()?;
                    writer
                        .write_row(row)
                        .map_err(|e| Error::io("write select row", e))?;
                }
            }
            None => {
                let mut has_row = dataset.reset_cursor()?;
                while has_row {
                    let row = dataset.current_row()?;
                    writer
                        .write_row(row)
                        .map_err(|e| Error::io("write select row", e))?;
                    has_row = dataset.move_to_next_row()?;
                }
            }
        }
        writer
            .finish()
            .map_err(|e| Error::io("finish select rowset", e))
    }

    pub(super) fn execute_insert(
        &mut self,
        request_id: u64,
        request: InsertRequest,
    ) -> Result<()> {
        let database = self.resolve_database(&request.database)?;
        let table = database.find_table_checked(&request.table)?;
        self.check_operation_permitted(&database, &table, PermissionType::Insert)?;

        let tp = self.transaction_params(&database);
        let mut inserted = 0u64;
        for row in request.rows {
            if request.columns.is_empty() {
                table.insert_row(row, &tp, 0)?;
            } else {
                table.insert_row_named(&request.columns, row, &tp, 0)?;
            }
            inserted += 1;
        }
        table.flush_indices()?;

        let mut response = DatabaseEngineResponse::new(request_id);
        response.affected_row_count = Some(inserted);
        self.write_ok(response)
    }

    pub(super) fn execute_update(
        &mut self,
        request_id: u64,
        request: UpdateRequest,
    ) -> Result<()> {
        let database = self.resolve_database(&request.database)?;
        let table = database.find_table_checked(&request.table)?;
        self.check_operation_permitted(&database, &table, PermissionType::Update)?;

        let tp = self.transaction_params(&database);
        let mut updated = 0u64;
        match request.filter {
            Some(RowFilter::ByTrid(trid)) => {
                if table
                    .update_row_named(trid, &request.columns, request.values, &tp)?
                    .is_some()
                {
                    updated = 1;
                }
            }
            None => {
                for trid in collect_trids(&table)? {
                    let values = clone_values(&request.values)?;
                    if table
                        .update_row_named(trid, &request.columns, values, &tp)?
                        .is_some()
                    {
                        updated += 1;
                    }
                }
            }
        }
        table.flush_indices()?;

        let mut response = DatabaseEngineResponse::new(request_id);
        response.affected_row_count = Some(updated);
        self.write_ok(response)
    }

    pub(super) fn execute_delete(
        &mut self,
        request_id: u64,
        request: DeleteRequest,
    ) -> Result<()> {
        let database = self.resolve_database(&request.database)?;
        let table = database.find_table_checked(&request.table)?;
        self.check_operation_permitted(&database, &table, PermissionType::Delete)?;

        let tp = self.transaction_params(&database);
        let mut deleted = 0u64;
        match request.filter {
            Some(RowFilter::ByTrid(trid)) => {
                if table.delete_row(trid, &tp)?.is_some() {
                    deleted = 1;
                }
            }
            None => {
                for trid in collect_trids(&table)? {
                    if table.delete_row(trid, &tp)?.is_some() {
                        deleted += 1;
                    }
                }
            }
        }
        table.flush_indices()?;

        let mut response = DatabaseEngineResponse::new(request_id);
        response.affected_row_count = Some(deleted);
        self.write_ok(response)
    }
}

// Materializes the row id list before a scan-modify pass, so that the
// cursor is not disturbed by its own writes.
fn collect_trids(table: &std::sync::Arc<crate::table::Table>) -> Result<Vec<u64>> {
    let master = table.master_column()?;
    let mut trids = Vec::new();
    let min = match master.main_index_min_max()? {
        Some((min, _)) => min,
        None => return Ok(trids),
    };
    let mut current = Some(min);
    while let Some(trid) = current {
        trids.push(trid);
        current = master.main_index_next_trid(trid)?;
    }
    Ok(trids)
}
