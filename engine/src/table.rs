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

//! Table: a composition of columns in column-set order, the row
//! insert/update/delete path, and rollback of partially written rows.

use std::path::PathBuf;
use std::sync::Arc;

use log::error;
use parking_lot::Mutex;

use meridb_types::{
    is_valid_object_name, ColumnDataAddress, TransactionParameters, Value, NULL_ADDRESS,
};

use crate::column::{Column, ColumnOpenInfo, ColumnSpecification};
use crate::database::DatabaseCore;
use crate::defs::{
    DEFAULT_BLOCK_DATA_AREA_SIZE, DEFAULT_INDEX_DATA_FILE_SIZE, FIRST_USER_COLUMN_DEFINITION_ID,
    FIRST_USER_COLUMN_DEFINITION_CONSTRAINT_ID, FIRST_USER_COLUMN_ID,
    FIRST_USER_COLUMN_SET_COLUMN_ID, FIRST_USER_COLUMN_SET_ID,
    FIRST_USER_CONSTRAINT_DEFINITION_ID, FIRST_USER_CONSTRAINT_ID, FIRST_USER_INDEX_COLUMN_ID,
    FIRST_USER_INDEX_ID, INIT_FLAG_FILE, MASTER_COLUMN_NAME, SYSTEM_BLOCK_DATA_AREA_SIZE,
    SYSTEM_INDEX_DATA_FILE_SIZE, TABLE_DIR_PREFIX,
};
use crate::error::{Error, Result, UserError};
use crate::mcr::{ColumnRecord as McrColumnRecord, DmlOperation, MasterColumnRecord};
use crate::reg::{
    ColumnDefinitionConstraintRecord, ColumnDefinitionRecord, ColumnRecord, ColumnSetColumnRecord,
    ColumnSetRecord, ColumnState, ConstraintDefinitionRecord, ConstraintRecord, ConstraintState,
    ConstraintType, IndexColumnRecord, IndexRecord, IndexType, TableRecord, TableType,
};

/// Column description used when creating a table; the block data area size
/// is decided by the table.
pub struct TableColumnSpec {
    pub name: String,
    pub data_type: meridb_types::ColumnDataType,
    pub not_null: bool,
    pub default_value: Option<Value>,
    pub description: Option<String>,
}

struct TableInner {
    /// Columns in position order; position 0 is the master column.
    columns: Vec<Arc<Column>>,
    current_column_set_id: u64,
}

/// A database table bound to its `t<id>` directory.
pub struct Table {
    core: Arc<DatabaseCore>,
    id: u32,
    name: String,
    table_type: TableType,
    is_system: bool,
    first_user_trid: u64,
    description: Option<String>,
    data_dir: PathBuf,
    inner: Mutex<TableInner>,
}

impl Table {
    /// Creates a new table: directory, master column, user columns, column
    /// set, constraints, and the master column main index. All catalog
    /// registries are updated in memory; persisting catalog rows is the
    /// database's concern.
    pub fn create(
        core: Arc<DatabaseCore>,
        name: String,
        table_type: TableType,
        first_user_trid: u64,
        description: Option<String>,
        column_specs: Vec<TableColumnSpec>,
    ) -> Result<Arc<Table>> {
        if !is_valid_object_name(&name) {
            return Err(Error::User(UserError::InvalidTableName(name)));
        }
        let is_system = crate::database::is_system_table(&name);

        let (table_id, column_set_id) = {
            let mut registries = core.registries.lock();
            if registries.tables.get_by_name(&name).is_some() {
                return Err(Error::User(UserError::TableAlreadyExists {
                    database: core.name.clone(),
                    table: name,
                }));
            }
            let table_id =
                registries
                    .tables
                    .next_id(is_system, u64::from(crate::defs::FIRST_USER_TABLE_ID))
                    as u32;
            let column_set_id = registries
                .column_sets
                .next_id(is_system, FIRST_USER_COLUMN_SET_ID);
            (table_id, column_set_id)
        };

        let data_dir = core
            .data_dir
            .join(format!("{}{}", TABLE_DIR_PREFIX, table_id));
        if data_dir.join(INIT_FLAG_FILE).exists() {
            return Err(Error::User(UserError::TableAlreadyExists {
                database: core.name.clone(),
                table: name,
            }));
        }
        if data_dir.exists() {
            std::fs::remove_dir_all(&data_dir)
                .map_err(|e| Error::io(format!("remove stale table dir {}", data_dir.display()), e))?;
        }
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| Error::io(format!("create table dir {}", data_dir.display()), e))?;

        let table = Table {
            core: core.clone(),
            id: table_id,
            name,
            table_type,
            is_system,
            first_user_trid,
            description,
            data_dir,
            inner: Mutex::new(TableInner {
                columns: Vec::new(),
                current_column_set_id: column_set_id,
            }),
        };

        // Master column goes first, then the requested columns; every
        // created column also lands in the catalog registries.
        {
            let mut inner = table.inner.lock();
            table.create_column_locked(
                &mut inner,
                TableColumnSpec {
                    name: MASTER_COLUMN_NAME.to_owned(),
                    data_type: Column::MASTER_COLUMN_DATA_TYPE,
                    not_null: true,
                    default_value: None,
                    description: Some("Row identifier".to_owned()),
                },
            )?;
            for spec in column_specs {
                table.create_column_locked(&mut inner, spec)?;
            }
            table.create_master_column_index_locked(&inner)?;
        }

        // Register the table and its column set.
        {
            let mut registries = core.registries.lock();
            let inner = table.inner.lock();
            let columns = inner
                .columns
                .iter()
                .enumerate()
                .map(|(position, column)| ColumnSetColumnRecord {
                    id: registries
                        .next_column_set_column_id(is_system, FIRST_USER_COLUMN_SET_COLUMN_ID)
                        + position as u64,
                    column_set_id,
                    column_definition_id: column.current_definition_id(),
                    column_id: column.id(),
                })
                .collect();
            registries.column_sets.insert(ColumnSetRecord {
                id: column_set_id,
                table_id,
                columns,
            });
            registries.tables.insert(TableRecord {
                id: table_id,
                table_type,
                name: table.name.clone(),
                first_user_trid,
                current_column_set_id: column_set_id,
                description: table.description.clone(),
            });
        }

        crate::database::write_init_flag(&table.data_dir)?;
        Ok(Arc::new(table))
    }

    /// Opens an existing table from its catalog record, loading columns of
    /// the current column set and the master column main index.
    pub fn open(core: Arc<DatabaseCore>, record: &TableRecord) -> Result<Arc<Table>> {
        let data_dir = core
            .data_dir
            .join(format!("{}{}", TABLE_DIR_PREFIX, record.id));
        if !data_dir.join(INIT_FLAG_FILE).exists() {
            return Err(Error::internal(format!(
                "table directory {} is not initialized",
                data_dir.display()
            )));
        }
        let is_system = crate::database::is_system_table(&record.name);

        let mut columns = Vec::new();
        {
            let registries = core.registries.lock();
            let column_set = registries
                .column_sets
                .get(record.current_column_set_id)
                .ok_or_else(|| {
                    Error::internal(format!(
                        "table '{}' references missing column set {}",
                        record.name, record.current_column_set_id
                    ))
                })?;
            if column_set.columns.is_empty() {
                return Err(Error::internal(format!(
                    "column set {} of table '{}' has no columns",
                    column_set.id, record.name
                )));
            }
            for member in &column_set.columns {
                let definition = registries
                    .column_definitions
                    .get(member.column_definition_id)
                    .ok_or_else(|| {
                        Error::internal(format!(
                            "column set {} references missing column definition {}",
                            column_set.id, member.column_definition_id
                        ))
                    })?;
                let column_record = registries.columns.get(definition.column_id).ok_or_else(|| {
                    Error::internal(format!(
                        "column definition {} references missing column {}",
                        definition.id, definition.column_id
                    ))
                })?;
                let (not_null, default_value) =
                    constraint_flags(&registries, definition)?;
                let column = Column::open(
                    core.factory.clone(),
                    &data_dir,
                    core.name.clone(),
                    record.name.clone(),
                    record.id,
                    ColumnOpenInfo {
                        id: column_record.id,
                        name: column_record.name.clone(),
                        data_type: column_record.data_type,
                        data_area_size: column_record.block_data_area_size,
                        description: column_record.description.clone(),
                    },
                    record.first_user_trid,
                )?;
                column.set_current_definition(definition.id, not_null, default_value);
                columns.push(Arc::new(column));
            }
        }

        let table = Arc::new(Table {
            core,
            id: record.id,
            name: record.name.clone(),
            table_type: record.table_type,
            is_system,
            first_user_trid: record.first_user_trid,
            description: record.description.clone(),
            data_dir,
            inner: Mutex::new(TableInner {
                columns,
                current_column_set_id: record.current_column_set_id,
            }),
        });

        {
            let inner = table.inner.lock();
            let master = table.master_column_locked(&inner)?;
            master.load_main_index(
                table.main_index_name(),
                table.index_data_file_size(),
            )?;
        }
        Ok(table)
    }

    // Creates a column plus its definition and constraints, in memory and
    // on disk. The caller holds the table lock.
    fn create_column_locked(
        &self,
        inner: &mut TableInner,
        spec: TableColumnSpec,
    ) -> Result<Arc<Column>> {
        if inner
            .columns
            .iter()
            .any(|c| c.name() == spec.name)
        {
            return Err(Error::User(UserError::ColumnAlreadyExists {
                database: self.core.name.clone(),
                table: self.name.clone(),
                column: spec.name,
            }));
        }
        if !is_valid_object_name(&spec.name) {
            return Err(Error::User(UserError::InvalidColumnName(spec.name)));
        }

        let mut registries = self.core.registries.lock();
        let column_id = registries.columns.next_id(self.is_system, FIRST_USER_COLUMN_ID);
        let definition_id = registries
            .column_definitions
            .next_id(self.is_system, FIRST_USER_COLUMN_DEFINITION_ID);

        // Constraint definitions are content-addressed and deduplicated.
        let mut definition_constraints = Vec::new();
        let add_constraint =
            |registries: &mut crate::reg::Registries,
             constraint_type: ConstraintType,
             expression: Vec<u8>,
             name: String,
             description: Option<String>|
             -> Result<ColumnDefinitionConstraintRecord> {
                let def_id = match registries.find_constraint_definition(constraint_type, &expression)
                {
                    Some(id) => id,
                    None => {
                        let id = registries
                            .constraint_definitions
                            .next_id(self.is_system, FIRST_USER_CONSTRAINT_DEFINITION_ID);
                        registries.constraint_definitions.insert(ConstraintDefinitionRecord {
                            id,
                            constraint_type,
                            expression,
                        });
                        id
                    }
                };
                let constraint_id = registries
                    .constraints
                    .next_id(self.is_system, FIRST_USER_CONSTRAINT_ID);
                registries.constraints.insert(ConstraintRecord {
                    id: constraint_id,
                    name,
                    state: ConstraintState::Active,
                    table_id: self.id,
                    column_id,
                    definition_id: def_id,
                    description,
                });
                let cdc_id = registries.next_column_definition_constraint_id(
                    self.is_system,
                    FIRST_USER_COLUMN_DEFINITION_CONSTRAINT_ID,
                );
                Ok(ColumnDefinitionConstraintRecord {
                    id: cdc_id,
                    column_definition_id: definition_id,
                    constraint_id,
                })
            };

        if spec.not_null {
            definition_constraints.push(add_constraint(
                &mut registries,
                ConstraintType::NotNull,
                vec![1],
                format!("{}_{}_NOT_NULL", self.name, spec.name),
                None,
            )?);
        }
        if let Some(ref default) = spec.default_value {
            let mut expression = Vec::new();
            if !default.encode_to(&mut expression) {
                return Err(Error::internal(
                    "stream values cannot be used as column defaults",
                ));
            }
            definition_constraints.push(add_constraint(
                &mut registries,
                ConstraintType::DefaultValue,
                expression,
                format!("{}_{}_DEFAULT", self.name, spec.name),
                None,
            )?);
        }

        registries.columns.insert(ColumnRecord {
            id: column_id,
            table_id: self.id,
            data_type: spec.data_type,
            name: spec.name.clone(),
            state: ColumnState::Active,
            block_data_area_size: self.block_data_area_size(),
            description: spec.description.clone(),
        });
        registries.column_definitions.insert(ColumnDefinitionRecord {
            id: definition_id,
            column_id,
            constraints: definition_constraints,
        });
        drop(registries);

        let column = Arc::new(Column::create(
            self.core.factory.clone(),
            &self.data_dir,
            self.core.name.clone(),
            self.name.clone(),
            self.id,
            column_id,
            ColumnSpecification {
                name: spec.name,
                data_type: spec.data_type,
                block_data_area_size: self.block_data_area_size(),
                not_null: spec.not_null,
                default_value: spec.default_value,
                description: spec.description,
            },
            definition_id,
            self.first_user_trid,
        )?);
        inner.columns.push(column.clone());
        Ok(column)
    }

    fn create_master_column_index_locked(&self, inner: &TableInner) -> Result<()> {
        let master = self.master_column_locked(inner)?;
        let (index_id, index_column_id) = {
            let registries = self.core.registries.lock();
            (
                registries.indices.next_id(self.is_system, FIRST_USER_INDEX_ID),
                registries.next_index_column_id(self.is_system, FIRST_USER_INDEX_COLUMN_ID),
            )
        };
        master.create_main_index(
            index_id,
            self.main_index_name(),
            self.index_data_file_size(),
        )?;
        self.core.registries.lock().indices.insert(IndexRecord {
            id: index_id,
            index_type: IndexType::BTree,
            unique: true,
            name: self.main_index_name(),
            table_id: self.id,
            data_file_size: self.index_data_file_size(),
            description: Some("Maps row identifiers to master column records".to_owned()),
            columns: vec![IndexColumnRecord {
                id: index_column_id,
                index_id,
                column_definition_id: master.current_definition_id(),
                sort_descending: false,
            }],
        });
        Ok(())
    }

    fn block_data_area_size(&self) -> u32 {
        if self.is_system {
            SYSTEM_BLOCK_DATA_AREA_SIZE
        } else {
            DEFAULT_BLOCK_DATA_AREA_SIZE
        }
    }

    fn index_data_file_size(&self) -> u32 {
        if self.is_system {
            SYSTEM_INDEX_DATA_FILE_SIZE
        } else {
            DEFAULT_INDEX_DATA_FILE_SIZE
        }
    }

    fn main_index_name(&self) -> String {
        format!("{}_{}_IDX", self.name, MASTER_COLUMN_NAME)
    }

    // --- accessors ------------------------------------------------------

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn table_type(&self) -> TableType {
        self.table_type
    }

    pub fn is_system(&self) -> bool {
        self.is_system
    }

    pub fn first_user_trid(&self) -> u64 {
        self.first_user_trid
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn database_name(&self) -> &str {
        &self.core.name
    }

    pub fn column_count(&self) -> usize {
        self.inner.lock().columns.len()
    }

    pub fn current_column_set_id(&self) -> u64 {
        self.inner.lock().current_column_set_id
    }

    /// Columns in position order, master column first.
    pub fn columns_ordered(&self) -> Vec<Arc<Column>> {
        self.inner.lock().columns.clone()
    }

    pub fn find_column_position(&self, name: &str) -> Option<usize> {
        self.inner
            .lock()
            .columns
            .iter()
            .position(|c| c.name() == name)
    }

    fn master_column_locked(&self, inner: &TableInner) -> Result<Arc<Column>> {
        inner
            .columns
            .iter()
            .find(|c| c.is_master())
            .cloned()
            .ok_or_else(|| {
                Error::internal(format!(
                    "table '{}'.'{}' has no master column",
                    self.core.name, self.name
                ))
            })
    }

    pub fn master_column(&self) -> Result<Arc<Column>> {
        let inner = self.inner.lock();
        self.master_column_locked(&inner)
    }

    // --- row operations -------------------------------------------------

    /// Inserts a row with named columns. Missing columns receive their
    /// DEFAULT or NULL; `custom_trid == 0` allocates the next user TRID.
    pub fn insert_row_named(
        &self,
        column_names: &[String],
        column_values: Vec<Value>,
        tp: &TransactionParameters,
        custom_trid: u64,
    ) -> Result<(MasterColumnRecord, Vec<u64>)> {
        let inner = self.inner.lock();
        let column_count = inner.columns.len();

        if column_names.len() != column_values.len() {
            return Err(Error::User(UserError::ValuesCountMismatch {
                expected: column_names.len(),
                actual: column_values.len(),
            }));
        }
        if column_values.len() >= column_count {
            return Err(Error::User(UserError::TooManyColumnsToInsert {
                actual: column_values.len(),
                limit: column_count - 1,
            }));
        }

        let mut ordered: Vec<Option<Value>> = Vec::new();
        ordered.resize_with(column_count - 1, || None);
        let mut errors = Vec::new();
        for (name, value) in column_names.iter().zip(column_values.into_iter()) {
            if !is_valid_object_name(name) {
                errors.push(UserError::InvalidColumnName(name.clone()));
                continue;
            }
            let position = match inner.columns.iter().position(|c| c.name() == *name) {
                Some(p) => p,
                None => {
                    errors.push(UserError::ColumnDoesNotExist {
                        database: self.core.name.clone(),
                        table: self.name.clone(),
                        column: name.clone(),
                    });
                    continue;
                }
            };
            if inner.columns[position].is_master() {
                errors.push(UserError::CannotModifyMasterColumn);
                continue;
            }
            if ordered[position - 1].is_some() {
                errors.push(UserError::DuplicateColumnName(name.clone()));
                continue;
            }
            ordered[position - 1] = Some(value);
        }
        if !errors.is_empty() {
            return Err(Error::Compound(errors));
        }

        let values = ordered
            .into_iter()
            .enumerate()
            .map(|(i, v)| v.unwrap_or_else(|| inner.columns[i + 1].default_value()))
            .collect();
        self.insert_row_locked(&inner, values, tp, custom_trid)
    }

    /// Inserts a row with positional values; missing trailing columns
    /// receive their DEFAULT or NULL.
    pub fn insert_row(
        &self,
        column_values: Vec<Value>,
        tp: &TransactionParameters,
        custom_trid: u64,
    ) -> Result<(MasterColumnRecord, Vec<u64>)> {
        let inner = self.inner.lock();
        let column_count = inner.columns.len();
        if column_values.len() >= column_count {
            return Err(Error::User(UserError::TooManyColumnsToInsert {
                actual: column_values.len(),
                limit: column_count - 1,
            }));
        }
        let mut values = column_values;
        for position in values.len()..column_count - 1 {
            values.push(inner.columns[position + 1].default_value());
        }
        self.insert_row_locked(&inner, values, tp, custom_trid)
    }

    fn insert_row_locked(
        &self,
        inner: &TableInner,
        column_values: Vec<Value>,
        tp: &TransactionParameters,
        custom_trid: u64,
    ) -> Result<(MasterColumnRecord, Vec<u64>)> {
        debug_assert_eq!(column_values.len(), inner.columns.len() - 1);
        let master = self.master_column_locked(inner)?;
        let trid = if custom_trid == 0 {
            master.generate_next_user_trid()?
        } else {
            custom_trid
        };

        let mut mcr = MasterColumnRecord {
            trid,
            transaction_id: tp.transaction_id,
            create_timestamp: tp.timestamp,
            update_timestamp: tp.timestamp,
            version: 0,
            atomic_op_id: self.core.generate_next_atomic_operation_id(),
            operation: DmlOperation::Insert,
            user_id: tp.user_id,
            column_set_id: inner.current_column_set_id,
            prev_mcr_address: NULL_ADDRESS,
            column_records: Vec::with_capacity(column_values.len()),
        };
        let mut next_block_ids = Vec::with_capacity(column_values.len());

        let mut values = column_values.into_iter();
        let result = (|| -> Result<()> {
            for column in inner.columns.iter().filter(|c| !c.is_master()) {
                let value = values.next().expect("one value per non-master column; qed");
                let (addr, next) = column.write_record(value)?;
                mcr.column_records.push(McrColumnRecord {
                    address: addr,
                    create_timestamp: tp.timestamp,
                    update_timestamp: tp.timestamp,
                });
                next_block_ids.push(next.block_id);
            }
            master.write_master_column_record(&mcr)?;
            Ok(())
        })();
        if let Err(e) = result {
            self.rollback_row_locked(inner, &mcr.column_records, &next_block_ids);
            return Err(e);
        }

        // Custom TRIDs must keep the generators ahead of used ids.
        if custom_trid != 0 {
            if trid >= self.first_user_trid {
                if trid > master.last_user_trid()? {
                    master.set_last_user_trid(trid)?;
                }
            } else if trid > master.last_system_trid()? {
                master.set_last_system_trid(trid)?;
            }
        }

        Ok((mcr, next_block_ids))
    }

    /// Updates columns of the row identified by `trid`. Returns `None`
    /// when the row does not exist.
    pub fn update_row_named(
        &self,
        trid: u64,
        column_names: &[String],
        column_values: Vec<Value>,
        tp: &TransactionParameters,
    ) -> Result<Option<(MasterColumnRecord, Vec<u64>)>> {
        let positions = {
            let inner = self.inner.lock();
            let mut positions = Vec::with_capacity(column_names.len());
            for name in column_names {
                let position = inner
                    .columns
                    .iter()
                    .position(|c| c.name() == *name)
                    .ok_or_else(|| {
                        Error::User(UserError::ColumnDoesNotExist {
                            database: self.core.name.clone(),
                            table: self.name.clone(),
                            column: name.clone(),
                        })
                    })?;
                if inner.columns[position].is_master() {
                    return Err(Error::User(UserError::CannotModifyMasterColumn));
                }
                positions.push(position);
            }
            positions
        };
        self.update_row(trid, &positions, column_values, tp)
    }

    /// Updates columns (by position) of the row identified by `trid`.
    pub fn update_row(
        &self,
        trid: u64,
        column_positions: &[usize],
        column_values: Vec<Value>,
        tp: &TransactionParameters,
    ) -> Result<Option<(MasterColumnRecord, Vec<u64>)>> {
        let inner = self.inner.lock();
        if column_values.len() != column_positions.len() {
            return Err(Error::User(UserError::ValuesCountMismatch {
                expected: column_positions.len(),
                actual: column_values.len(),
            }));
        }

        let master = self.master_column_locked(&inner)?;
        let mcr_addr = match master.main_index_find(trid)? {
            Some(addr) => addr,
            None => return Ok(None),
        };
        let old_mcr = master.read_master_column_record(mcr_addr)?;
        self.update_row_at(&inner, &old_mcr, mcr_addr, column_positions, column_values, tp)
            .map(Some)
    }

    fn update_row_at(
        &self,
        inner: &TableInner,
        old_mcr: &MasterColumnRecord,
        old_mcr_addr: ColumnDataAddress,
        column_positions: &[usize],
        column_values: Vec<Value>,
        tp: &TransactionParameters,
    ) -> Result<(MasterColumnRecord, Vec<u64>)> {
        if old_mcr.column_records.len() + 1 != inner.columns.len() {
            return Err(Error::internal(format!(
                "master column record of row {} in '{}'.'{}' has {} column records, expected {}",
                old_mcr.trid,
                self.core.name,
                self.name,
                old_mcr.column_records.len(),
                inner.columns.len() - 1
            )));
        }
        let master = self.master_column_locked(inner)?;

        let mut column_records = old_mcr.column_records.clone();
        let mut new_mcr = MasterColumnRecord {
            trid: old_mcr.trid,
            transaction_id: tp.transaction_id,
            create_timestamp: old_mcr.create_timestamp,
            update_timestamp: tp.timestamp,
            version: old_mcr.version + 1,
            atomic_op_id: self.core.generate_next_atomic_operation_id(),
            operation: DmlOperation::Update,
            user_id: tp.user_id,
            column_set_id: inner.current_column_set_id,
            prev_mcr_address: old_mcr_addr,
            column_records: Vec::new(),
        };

        let mut written: Vec<(usize, ColumnDataAddress)> = Vec::new();
        let mut next_block_ids = Vec::with_capacity(column_positions.len());
        let mut values = column_values.into_iter();
        let result = (|| -> Result<()> {
            for &position in column_positions {
                let column = inner.columns.get(position).ok_or_else(|| {
                    Error::internal(format!("column position {} out of range", position))
                })?;
                if column.is_master() {
                    return Err(Error::User(UserError::CannotModifyMasterColumn));
                }
                let value = values.next().expect("one value per position; qed");
                let old_address = column_records[position - 1].address;
                let (addr, next) = column.write_record(value)?;
                column_records[position - 1].address = addr;
                column_records[position - 1].update_timestamp = tp.timestamp;
                written.push((position, old_address));
                next_block_ids.push(next.block_id);
            }
            new_mcr.column_records = column_records;
            master.write_master_column_record(&new_mcr)?;
            Ok(())
        })();

        if let Err(e) = result {
            // Undo the new column versions; the old record stays current.
            for ((position, old_address), next_block_id) in
                written.into_iter().zip(next_block_ids.iter())
            {
                if *next_block_id == 0 {
                    // The new value was NULL; nothing was written.
                    continue;
                }
                let column = &inner.columns[position];
                if let Err(rollback_error) =
                    column.rollback_to_address(old_address, *next_block_id)
                {
                    error!(target: "engine", "rollback of column '{}' failed: {}", column.name(), rollback_error);
                }
            }
            return Err(e);
        }

        Ok((new_mcr, next_block_ids))
    }

    /// Deletes the row identified by `trid` by writing a tombstone record
    /// and removing the row from the main index. Returns `None` when the
    /// row does not exist.
    pub fn delete_row(
        &self,
        trid: u64,
        tp: &TransactionParameters,
    ) -> Result<Option<MasterColumnRecord>> {
        let inner = self.inner.lock();
        let master = self.master_column_locked(&inner)?;
        let mcr_addr = match master.main_index_find(trid)? {
            Some(addr) => addr,
            None => return Ok(None),
        };
        let old_mcr = master.read_master_column_record(mcr_addr)?;

        let tombstone = MasterColumnRecord {
            trid,
            transaction_id: tp.transaction_id,
            create_timestamp: old_mcr.create_timestamp,
            update_timestamp: tp.timestamp,
            version: old_mcr.version + 1,
            atomic_op_id: self.core.generate_next_atomic_operation_id(),
            operation: DmlOperation::Delete,
            user_id: tp.user_id,
            column_set_id: inner.current_column_set_id,
            prev_mcr_address: mcr_addr,
            column_records: Vec::new(),
        };
        master.write_master_column_record(&tombstone)?;
        Ok(Some(tombstone))
    }

    // Best-effort rollback of column writes of an aborted row operation.
    fn rollback_row_locked(
        &self,
        inner: &TableInner,
        column_records: &[McrColumnRecord],
        next_block_ids: &[u64],
    ) {
        let non_master: Vec<&Arc<Column>> =
            inner.columns.iter().filter(|c| !c.is_master()).collect();
        for (i, record) in column_records.iter().enumerate() {
            if record.address.is_null() {
                continue;
            }
            let next_block_id = match next_block_ids.get(i) {
                Some(&id) => id,
                None => break,
            };
            if let Err(e) = non_master[i].rollback_to_address(record.address, next_block_id) {
                error!(target: "engine", "rollback of column '{}' failed: {}", non_master[i].name(), e);
            }
        }
    }

    /// Current master column record of `trid`, with its address.
    pub fn find_row(
        &self,
        trid: u64,
    ) -> Result<Option<(MasterColumnRecord, ColumnDataAddress)>> {
        let inner = self.inner.lock();
        let master = self.master_column_locked(&inner)?;
        let addr = match master.main_index_find(trid)? {
            Some(addr) => addr,
            None => return Ok(None),
        };
        let mcr = master.read_master_column_record(addr)?;
        Ok(Some((mcr, addr)))
    }

    /// Flushes the master column main index; called at commit boundaries.
    pub fn flush_indices(&self) -> Result<()> {
        let inner = self.inner.lock();
        let master = self.master_column_locked(&inner)?;
        master.flush_main_index()
    }

    /// Flushes all column data and the main index.
    pub fn flush(&self) -> Result<()> {
        let inner = self.inner.lock();
        for column in &inner.columns {
            column.flush()?;
        }
        let master = self.master_column_locked(&inner)?;
        master.flush_main_index()
    }

    /// Next transaction id from the owning database's counters.
    pub fn generate_next_transaction_id(&self) -> u64 {
        self.core.generate_next_transaction_id()
    }

    pub fn generate_next_system_trid(&self) -> Result<u64> {
        self.master_column()?.generate_next_system_trid()
    }

    pub fn generate_next_user_trid(&self) -> Result<u64> {
        self.master_column()?.generate_next_user_trid()
    }

    /// ALTER TABLE SET NEXT_TRID support; refuses decreases.
    pub fn set_last_user_trid(&self, value: u64) -> Result<()> {
        self.master_column()?.set_last_user_trid(value)
    }
}

// Derives NOT NULL and DEFAULT from a column definition's constraints.
fn constraint_flags(
    registries: &crate::reg::Registries,
    definition: &ColumnDefinitionRecord,
) -> Result<(bool, Option<Value>)> {
    let mut not_null = false;
    let mut default_value = None;
    for link in &definition.constraints {
        let constraint = registries.constraints.get(link.constraint_id).ok_or_else(|| {
            Error::internal(format!(
                "column definition {} references missing constraint {}",
                definition.id, link.constraint_id
            ))
        })?;
        if constraint.state != ConstraintState::Active {
            continue;
        }
        let def = registries
            .constraint_definitions
            .get(constraint.definition_id)
            .ok_or_else(|| {
                Error::internal(format!(
                    "constraint {} references missing definition {}",
                    constraint.id, constraint.definition_id
                ))
            })?;
        match def.constraint_type {
            ConstraintType::NotNull => {
                not_null = def.expression.first().copied().unwrap_or(0) != 0;
            }
            ConstraintType::DefaultValue => {
                default_value = Value::decode_from(&def.expression).map(|(v, _)| v);
            }
        }
    }
    Ok((not_null, default_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{column_spec, create_user_database};
    use meridb_types::ColumnDataType;
    use tempdir::TempDir;

    fn test_tp(table: &Table) -> TransactionParameters {
        TransactionParameters::new(1, table.generate_next_transaction_id())
    }

    #[test]
    fn insert_assigns_dense_trids() {
        let dir = TempDir::new("table").unwrap();
        let db = create_user_database(dir.path(), "TESTDB");
        let table = db
            .create_user_table(
                "T".to_owned(),
                1,
                None,
                vec![
                    column_spec("A", ColumnDataType::Int32, false),
                    column_spec("B", ColumnDataType::Text, false),
                ],
            )
            .unwrap();

        let tp = test_tp(&table);
        let (mcr1, _) = table
            .insert_row(
                vec![Value::Int32(1), Value::Text("hello".to_owned())],
                &tp,
                0,
            )
            .unwrap();
        let (mcr2, _) = table
            .insert_row(
                vec![Value::Int32(2), Value::Text("world".to_owned())],
                &tp,
                0,
            )
            .unwrap();
        assert_eq!(mcr1.trid, 1);
        assert_eq!(mcr2.trid, 2);
        assert_eq!(mcr1.column_records.len() + 1, table.column_count());

        let (found, _) = table.find_row(1).unwrap().unwrap();
        assert_eq!(found, mcr1);
        let columns = table.columns_ordered();
        assert_eq!(
            columns[1]
                .clone()
                .read_record(found.column_records[0].address, false)
                .unwrap(),
            Value::Int32(1)
        );
        assert_eq!(
            columns[2]
                .clone()
                .read_record(found.column_records[1].address, false)
                .unwrap(),
            Value::Text("hello".to_owned())
        );
    }

    #[test]
    fn named_insert_fills_defaults_and_reports_bad_columns() {
        let dir = TempDir::new("table").unwrap();
        let db = create_user_database(dir.path(), "TESTDB");
        let mut with_default = column_spec("A", ColumnDataType::Int32, false);
        with_default.default_value = Some(Value::Int32(42));
        let table = db
            .create_user_table(
                "T".to_owned(),
                1,
                None,
                vec![with_default, column_spec("B", ColumnDataType::Text, false)],
            )
            .unwrap();

        let tp = test_tp(&table);
        let (mcr, _) = table
            .insert_row_named(
                &["B".to_owned()],
                vec![Value::Text("only-b".to_owned())],
                &tp,
                0,
            )
            .unwrap();
        let columns = table.columns_ordered();
        assert_eq!(
            columns[1]
                .clone()
                .read_record(mcr.column_records[0].address, false)
                .unwrap(),
            Value::Int32(42)
        );

        // Unknown column, duplicate column and the master column are all
        // reported together.
        match table.insert_row_named(
            &["NO_SUCH".to_owned(), "B".to_owned(), "B".to_owned(), "TRID".to_owned()],
            vec![Value::Null, Value::Null, Value::Null, Value::Null],
            &tp,
            0,
        ) {
            Err(Error::Compound(errors)) => {
                assert_eq!(errors.len(), 3);
            }
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn update_failure_rolls_back_written_columns() {
        let dir = TempDir::new("table").unwrap();
        let db = create_user_database(dir.path(), "TESTDB");
        let table = db
            .create_user_table(
                "T".to_owned(),
                1,
                None,
                vec![
                    column_spec("A", ColumnDataType::Int32, false),
                    column_spec("B", ColumnDataType::Text, false),
                ],
            )
            .unwrap();
        let tp = test_tp(&table);
        table
            .insert_row(
                vec![Value::Int32(1), Value::Text("hello".to_owned())],
                &tp,
                0,
            )
            .unwrap();

        // Second assignment fails the cast; the whole row version must be
        // discarded.
        match table.update_row_named(
            1,
            &["B".to_owned(), "A".to_owned()],
            vec![
                Value::Text("patched".to_owned()),
                Value::Text("not-a-number".to_owned()),
            ],
            &tp,
        ) {
            Err(Error::User(UserError::IncompatibleDataType { .. })) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }

        let (mcr, _) = table.find_row(1).unwrap().unwrap();
        assert_eq!(mcr.version, 0);
        let columns = table.columns_ordered();
        assert_eq!(
            columns[1]
                .clone()
                .read_record(mcr.column_records[0].address, false)
                .unwrap(),
            Value::Int32(1)
        );
        assert_eq!(
            columns[2]
                .clone()
                .read_record(mcr.column_records[1].address, false)
                .unwrap(),
            Value::Text("hello".to_owned())
        );

        // A successful update advances the version and keeps history.
        let (updated, _) = table
            .update_row_named(1, &["A".to_owned()], vec![Value::Int32(7)], &tp)
            .unwrap()
            .unwrap();
        assert_eq!(updated.version, 1);
        assert!(!updated.prev_mcr_address.is_null());
        assert_eq!(updated.create_timestamp, mcr.create_timestamp);
    }

    #[test]
    fn delete_writes_tombstone_and_unindexes() {
        let dir = TempDir::new("table").unwrap();
        let db = create_user_database(dir.path(), "TESTDB");
        let table = db
            .create_user_table(
                "T".to_owned(),
                1,
                None,
                vec![column_spec("A", ColumnDataType::Int32, false)],
            )
            .unwrap();
        let tp = test_tp(&table);
        table.insert_row(vec![Value::Int32(5)], &tp, 0).unwrap();

        let tombstone = table.delete_row(1, &tp).unwrap().unwrap();
        assert_eq!(tombstone.operation, crate::mcr::DmlOperation::Delete);
        assert_eq!(tombstone.version, 1);
        assert!(tombstone.column_records.is_empty());
        assert!(table.find_row(1).unwrap().is_none());

        // Deleting again reports "not found".
        assert!(table.delete_row(1, &tp).unwrap().is_none());
        // A new insert takes the next TRID, not the freed one.
        let (mcr, _) = table.insert_row(vec![Value::Int32(6)], &tp, 0).unwrap();
        assert_eq!(mcr.trid, 2);
    }

    #[test]
    fn trid_exhaustion_at_the_top_of_the_range() {
        let dir = TempDir::new("table").unwrap();
        let db = create_user_database(dir.path(), "TESTDB");
        let table = db
            .create_user_table(
                "T".to_owned(),
                u64::max_value() - 1,
                None,
                vec![column_spec("A", ColumnDataType::Int32, false)],
            )
            .unwrap();
        let tp = test_tp(&table);

        let (first, _) = table.insert_row(vec![Value::Int32(1)], &tp, 0).unwrap();
        assert_eq!(first.trid, u64::max_value() - 1);
        let (second, _) = table.insert_row(vec![Value::Int32(2)], &tp, 0).unwrap();
        assert_eq!(second.trid, u64::max_value());

        match table.insert_row(vec![Value::Int32(3)], &tp, 0) {
            Err(Error::User(UserError::TridRangeExhausted { .. })) => {}
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
        // Counters are unchanged after the failure.
        assert_eq!(
            table.master_column().unwrap().last_user_trid().unwrap(),
            u64::max_value()
        );
    }

    #[test]
    fn concurrent_inserters_get_disjoint_trids() {
        let dir = TempDir::new("table").unwrap();
        let db = create_user_database(dir.path(), "TESTDB");
        let table = db
            .create_user_table(
                "T".to_owned(),
                1,
                None,
                vec![column_spec("A", ColumnDataType::Int32, false)],
            )
            .unwrap();

        const THREADS: usize = 8;
        const ROWS_PER_THREAD: usize = 10_000;
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let table = table.clone();
            handles.push(std::thread::spawn(move || {
                let mut trids = Vec::with_capacity(ROWS_PER_THREAD);
                for i in 0..ROWS_PER_THREAD {
                    let tp = TransactionParameters::new(
                        1,
                        table.generate_next_transaction_id(),
                    );
                    let (mcr, _) = table
                        .insert_row(vec![Value::Int32((t * ROWS_PER_THREAD + i) as i32)], &tp, 0)
                        .unwrap();
                    trids.push(mcr.trid);
                }
                trids
            }));
        }
        let mut all: Vec<u64> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<u64> = (1..=(THREADS * ROWS_PER_THREAD) as u64).collect();
        assert_eq!(all, expected);

        // All rows are visible through the index.
        let rows = crate::database::read_all_rows(&table).unwrap();
        assert_eq!(rows.len(), THREADS * ROWS_PER_THREAD);
    }

    #[test]
    fn set_last_user_trid_refuses_decreases() {
        let dir = TempDir::new("table").unwrap();
        let db = create_user_database(dir.path(), "TESTDB");
        let table = db
            .create_user_table(
                "T".to_owned(),
                1,
                None,
                vec![column_spec("A", ColumnDataType::Int32, false)],
            )
            .unwrap();
        table.set_last_user_trid(100).unwrap();
        table.set_last_user_trid(100).unwrap();
        assert!(table.set_last_user_trid(99).is_err());
        let tp = test_tp(&table);
        let (mcr, _) = table.insert_row(vec![Value::Int32(1)], &tp, 0).unwrap();
        assert_eq!(mcr.trid, 101);
    }
}
