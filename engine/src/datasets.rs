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

//! Table data set: a cursor over a table's rows in TRID order, reading
//! column values lazily from the current master column record.

use std::sync::Arc;

use meridb_types::{ColumnDataAddress, TransactionParameters, Value};

use crate::column::Column;
use crate::error::{Error, Result};
use crate::mcr::MasterColumnRecord;
use crate::table::Table;

/// One selected column of a data set.
pub struct DataSetColumn {
    /// Position of the column in the table, master column included.
    pub position: usize,
    pub name: String,
}

/// Cursor over the rows of one table, positioned by the master column
/// main index.
pub struct TableDataSet {
    table: Arc<Table>,
    columns: Vec<Arc<Column>>,
    selected: Vec<DataSetColumn>,
    current_trid: Option<u64>,
    current_mcr: Option<(MasterColumnRecord, ColumnDataAddress)>,
    values: Vec<Option<Value>>,
}

impl TableDataSet {
    /// Creates a data set over `selected` columns (all columns when the
    /// selection is empty).
    pub fn new(table: Arc<Table>, selected: Vec<DataSetColumn>) -> TableDataSet {
        let columns = table.columns_ordered();
        let selected = if selected.is_empty() {
            columns
                .iter()
                .enumerate()
                .map(|(position, c)| DataSetColumn {
                    position,
                    name: c.name().to_owned(),
                })
                .collect()
        } else {
            selected
        };
        let selected_len = selected.len();
        TableDataSet {
            table,
            columns,
            selected,
            current_trid: None,
            current_mcr: None,
            values: (0..selected_len).map(|_| None).collect(),
        }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    pub fn selected_columns(&self) -> &[DataSetColumn] {
        &self.selected
    }

    /// Data types of the selected columns.
    pub fn column_data_types(&self) -> Vec<meridb_types::ColumnDataType> {
        self.selected
            .iter()
            .map(|c| self.columns[c.position].data_type())
            .collect()
    }

    /// Whether any selected column may be NULL.
    pub fn any_column_nullable(&self) -> bool {
        self.selected
            .iter()
            .any(|c| !self.columns[c.position].is_not_null())
    }

    /// Positions the cursor at the smallest TRID. Returns whether a row
    /// exists.
    pub fn reset_cursor(&mut self) -> Result<bool> {
        let master = self.table.master_column()?;
        match master.main_index_min_max()? {
            Some((min, max)) => {
                if min > max {
                    return Err(Error::internal(
                        "master column record index corrupted: min key above max key",
                    ));
                }
                self.position_at(min)?;
                Ok(true)
            }
            None => {
                self.current_trid = None;
                self.current_mcr = None;
                Ok(false)
            }
        }
    }

    /// Advances to the next row. Returns whether a row exists.
    pub fn move_to_next_row(&mut self) -> Result<bool> {
        let current = match self.current_trid {
            Some(trid) => trid,
            None => return Ok(false),
        };
        let master = self.table.master_column()?;
        match master.main_index_next_trid(current)? {
            Some(next) => {
                self.position_at(next)?;
                Ok(true)
            }
            None => {
                self.current_trid = None;
                self.current_mcr = None;
                Ok(false)
            }
        }
    }

    /// Positions the cursor at `trid`. Returns whether the row exists.
    pub fn position_at_trid(&mut self, trid: u64) -> Result<bool> {
        if self.table.find_row(trid)?.is_none() {
            self.current_trid = None;
            self.current_mcr = None;
            return Ok(false);
        }
        self.position_at(trid)?;
        Ok(true)
    }

    fn position_at(&mut self, trid: u64) -> Result<()> {
        let (mcr, addr) = self.table.find_row(trid)?.ok_or_else(|| {
            Error::internal("master column record index corrupted: key without record")
        })?;
        if mcr.column_records.len() + 1 != self.columns.len() {
            return Err(Error::internal(format!(
                "master column record of row {} has {} column records, expected {}",
                trid,
                mcr.column_records.len(),
                self.columns.len() - 1
            )));
        }
        self.current_trid = Some(trid);
        self.current_mcr = Some((mcr, addr));
        for slot in &mut self.values {
            *slot = None;
        }
        Ok(())
    }

    pub fn has_current_row(&self) -> bool {
        self.current_trid.is_some()
    }

    pub fn current_trid(&self) -> Option<u64> {
        self.current_trid
    }

    /// Reads one selected column of the current row, caching the value.
    pub fn column_value(&mut self, index: usize) -> Result<&Value> {
        let (mcr, _) = self
            .current_mcr
            .as_ref()
            .ok_or_else(|| Error::internal("data set has no current row"))?;
        if self.values[index].is_none() {
            let position = self.selected[index].position;
            let column = &self.columns[position];
            let value = if column.is_master() {
                Value::UInt64(mcr.trid)
            } else {
                column
                    .clone()
                    .read_record(mcr.column_records[position - 1].address, false)?
            };
            self.values[index] = Some(value);
        }
        Ok(self.values[index]
            .as_ref()
            .expect("value was just cached; qed"))
    }

    /// Reads the whole current row in selection order.
    pub fn current_row(&mut self) -> Result<Vec<Value>> {
        let mut row = Vec::with_capacity(self.selected.len());
        for index in 0..self.selected.len() {
            self.column_value(index)?;
            row.push(
                self.values[index]
                    .take()
                    .expect("value was cached by column_value; qed"),
            );
        }
        Ok(row)
    }

    /// Deletes the current row.
    pub fn delete_current_row(&mut self, user_id: u32) -> Result<()> {
        let trid = self
            .current_trid
            .ok_or_else(|| Error::internal("data set has no current row"))?;
        let tp = TransactionParameters::new(
            user_id,
            self.table.generate_next_transaction_id(),
        );
        self.table.delete_row(trid, &tp)?;
        Ok(())
    }

    /// Updates columns of the current row.
    pub fn update_current_row(
        &mut self,
        column_positions: &[usize],
        values: Vec<Value>,
        user_id: u32,
    ) -> Result<()> {
        let trid = self
            .current_trid
            .ok_or_else(|| Error::internal("data set has no current row"))?;
        let tp = TransactionParameters::new(
            user_id,
            self.table.generate_next_transaction_id(),
        );
        self.table.update_row(trid, column_positions, values, &tp)?;
        Ok(())
    }
}
