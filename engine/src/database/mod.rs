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

//! Database: owns a data directory, the catalog registries, the metadata
//! counters and the table cache. The catalog describes itself: system
//! tables are stored with the same primitives as user tables and read back
//! on startup, either from the `system_objects` snapshot or by scanning
//! the catalog tables.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use keccak_hash::keccak;
use log::{info, warn};
use parking_lot::Mutex;

use meridb_types::{
    is_valid_object_name, unix_timestamp, TransactionParameters, Uuid, Value,
};
use object_cache::ObjectCache;

use crate::column::{Column, ColumnOpenInfo};
use crate::defs::{
    INIT_FLAG_FILE, MASTER_COLUMN_NAME, METADATA_FILE, SUPER_USER_ID,
    SYSTEM_BLOCK_DATA_AREA_SIZE, SYSTEM_INDEX_DATA_FILE_SIZE, SYSTEM_OBJECTS_FILE,
};
use crate::error::{Error, Result, UserError};
use crate::io::{FileEncryption, FileFactory};
use crate::reg::{
    load_system_objects, save_system_objects, DatabaseRecord, Registries, TableRecord, TableType,
};
use crate::table::{Table, TableColumnSpec};

pub mod catalog;
mod metadata;

pub use self::catalog::is_system_table;
pub use self::metadata::DatabaseMetadata;

/// Default capacity of the per-database table cache.
pub const DEFAULT_TABLE_CACHE_CAPACITY: usize = 32;

// System tables are never evictable, so the cache must at least hold all
// of them plus some user-table working set.
fn effective_cache_capacity(requested: usize) -> usize {
    requested.max(catalog::SYSTEM_TABLES.len() + 8)
}

/// Writes the initialization flag file; its presence is the sole criterion
/// for "exists and is consistent".
pub fn write_init_flag(dir: &Path) -> Result<()> {
    let path = dir.join(INIT_FLAG_FILE);
    std::fs::write(&path, format!("{}\n", unix_timestamp()))
        .map_err(|e| Error::io(format!("write init flag {}", path.display()), e))
}

/// Builds the file factory for a database from its cipher parameters.
pub fn make_file_factory(cipher_id: &str, cipher_key: &[u8]) -> Result<FileFactory> {
    match meridb_crypto::get_cipher(cipher_id)? {
        None => Ok(FileFactory::plaintext()),
        Some(cipher) => {
            let encryption = cipher.create_encryption_context(cipher_key)?;
            let decryption = cipher.create_decryption_context(cipher_key)?;
            Ok(FileFactory::encrypted(FileEncryption {
                encryption,
                decryption,
            }))
        }
    }
}

/// Deterministic database UUID from name and creation timestamp.
pub fn make_database_uuid(name: &str, timestamp: i64) -> Uuid {
    let mut input = Vec::with_capacity(name.len() + 8);
    input.extend_from_slice(name.as_bytes());
    input.extend_from_slice(&timestamp.to_le_bytes());
    let digest = keccak(&input);
    let mut uuid = Uuid::default();
    uuid.0.copy_from_slice(&digest.as_bytes()[..16]);
    uuid
}

/// Shared state of a database, referenced by its tables and columns.
pub struct DatabaseCore {
    pub id: u32,
    pub uuid: Uuid,
    pub name: String,
    pub cipher_id: String,
    pub data_dir: PathBuf,
    pub factory: FileFactory,
    metadata: Mutex<DatabaseMetadata>,
    pub registries: Mutex<Registries>,
}

impl DatabaseCore {
    pub fn generate_next_transaction_id(&self) -> u64 {
        self.metadata.lock().generate_next_transaction_id()
    }

    pub fn generate_next_atomic_operation_id(&self) -> u64 {
        self.metadata.lock().generate_next_atomic_operation_id()
    }

    pub fn schema_version(&self) -> u64 {
        self.metadata.lock().schema_version()
    }
}

/// An open database.
pub struct Database {
    core: Arc<DatabaseCore>,
    description: Option<String>,
    cipher_key: Vec<u8>,
    tables: Mutex<ObjectCache<u32, Arc<Table>>>,
    persisted_constraint_definitions: Mutex<HashSet<u64>>,
    // Serializes DDL so that id allocation and catalog row writes of one
    // statement are not interleaved with another.
    ddl_lock: Mutex<()>,
    use_count: AtomicUsize,
}

impl Database {
    /// Creates a new database: data directory, metadata file, and the full
    /// set of system tables, whose own definitions are recorded into the
    /// catalog they implement.
    pub fn create(
        id: u32,
        name: String,
        cipher_id: String,
        cipher_key: Vec<u8>,
        description: Option<String>,
        parent_dir: &Path,
        table_cache_capacity: usize,
        fixed_uuid: Option<Uuid>,
    ) -> Result<Database> {
        if !is_valid_object_name(&name) {
            return Err(Error::User(UserError::InvalidDatabaseName(name)));
        }
        let factory = make_file_factory(&cipher_id, &cipher_key)?;
        let timestamp = unix_timestamp();
        let uuid = fixed_uuid.unwrap_or_else(|| make_database_uuid(&name, timestamp));
        let data_dir = parent_dir.join(uuid.to_string());
        if data_dir.join(INIT_FLAG_FILE).exists() {
            return Err(Error::User(UserError::DatabaseAlreadyExists(name)));
        }
        if data_dir.exists() {
            std::fs::remove_dir_all(&data_dir)
                .map_err(|e| Error::io(format!("remove stale database dir {}", data_dir.display()), e))?;
        }
        std::fs::create_dir_all(&data_dir)
            .map_err(|e| Error::io(format!("create database dir {}", data_dir.display()), e))?;

        let init = TransactionParameters {
            transaction_id: 1,
            timestamp,
            user_id: SUPER_USER_ID,
        };
        let metadata = DatabaseMetadata::create(&data_dir.join(METADATA_FILE), &init)
            .map_err(|e| Error::io("create database metadata", e))?;

        let is_system_db = id == crate::defs::SYSTEM_DATABASE_ID;
        let core = Arc::new(DatabaseCore {
            id,
            uuid,
            name,
            cipher_id,
            data_dir,
            factory,
            metadata: Mutex::new(metadata),
            registries: Mutex::new(Registries::default()),
        });

        let database = Database {
            core: core.clone(),
            description,
            cipher_key,
            tables: Mutex::new(ObjectCache::new(effective_cache_capacity(
                table_cache_capacity,
            ))),
            persisted_constraint_definitions: Mutex::new(HashSet::new()),
            ddl_lock: Mutex::new(()),
            use_count: AtomicUsize::new(0),
        };

        // Create the catalog tables in their fixed order; the assigned ids
        // must match the fixed catalog layout.
        for def in catalog::SYSTEM_TABLES {
            if def.name == catalog::SYS_DATABASES && !is_system_db {
                continue;
            }
            let specs = def
                .columns
                .iter()
                .map(|c| TableColumnSpec {
                    name: c.name.to_owned(),
                    data_type: c.data_type,
                    not_null: c.not_null,
                    default_value: None,
                    description: Some(c.description.to_owned()),
                })
                .collect();
            let table = Table::create(
                core.clone(),
                def.name.to_owned(),
                TableType::Disk,
                def.first_user_trid,
                Some(def.description.to_owned()),
                specs,
            )?;
            if table.id() != def.id {
                return Err(Error::internal(format!(
                    "system table {} created with id {}, expected {}",
                    def.name,
                    table.id(),
                    def.id
                )));
            }
            database.cache_table(table)?;
        }

        database.record_catalog_objects(None)?;
        database.save_catalog()?;
        write_init_flag(&database.core.data_dir)?;
        info!(target: "db", "created database '{}' ({})", database.core.name, database.core.uuid);
        Ok(database)
    }

    /// Opens an existing database, restoring the catalog registries from
    /// the snapshot when present and by scanning the catalog tables
    /// otherwise.
    pub fn open(
        record: &DatabaseRecord,
        parent_dir: &Path,
        table_cache_capacity: usize,
    ) -> Result<Database> {
        let factory = make_file_factory(&record.cipher_id, &record.cipher_key)?;
        let data_dir = parent_dir.join(record.uuid.to_string());
        if !data_dir.join(INIT_FLAG_FILE).exists() {
            return Err(Error::User(UserError::DatabaseDoesNotExist(
                record.name.clone(),
            )));
        }
        let metadata = DatabaseMetadata::open(&data_dir.join(METADATA_FILE))
            .map_err(|e| Error::io("open database metadata", e))?;

        let core = Arc::new(DatabaseCore {
            id: record.id,
            uuid: record.uuid,
            name: record.name.clone(),
            cipher_id: record.cipher_id.clone(),
            data_dir,
            factory,
            metadata: Mutex::new(metadata),
            registries: Mutex::new(Registries::default()),
        });

        let snapshot_path = core.data_dir.join(SYSTEM_OBJECTS_FILE);
        let registries = if snapshot_path.exists() {
            let mut file = core
                .factory
                .open_file(&snapshot_path)
                .map_err(|e| Error::io("open system objects snapshot", e))?;
            load_system_objects(&mut file)?
        } else {
            info!(target: "db", "database '{}': no catalog snapshot, scanning system tables", core.name);
            scan_catalog_tables(&core)?
        };
        validate_catalog(&core.name, &registries)?;
        let persisted: HashSet<u64> = registries
            .constraint_definitions
            .iter()
            .map(|d| d.id)
            .collect();
        *core.registries.lock() = registries;

        Ok(Database {
            core,
            description: record.description.clone(),
            cipher_key: record.cipher_key.clone(),
            tables: Mutex::new(ObjectCache::new(effective_cache_capacity(
                table_cache_capacity,
            ))),
            persisted_constraint_definitions: Mutex::new(persisted),
            ddl_lock: Mutex::new(()),
            use_count: AtomicUsize::new(0),
        })
    }

    // --- accessors ------------------------------------------------------

    pub fn id(&self) -> u32 {
        self.core.id
    }

    pub fn name(&self) -> &str {
        &self.core.name
    }

    pub fn uuid(&self) -> Uuid {
        self.core.uuid
    }

    pub fn cipher_id(&self) -> &str {
        &self.core.cipher_id
    }

    pub fn cipher_key(&self) -> &[u8] {
        &self.cipher_key
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn core(&self) -> &Arc<DatabaseCore> {
        &self.core
    }

    pub fn is_system(&self) -> bool {
        self.core.id == crate::defs::SYSTEM_DATABASE_ID
    }

    pub fn generate_next_transaction_id(&self) -> u64 {
        self.core.generate_next_transaction_id()
    }

    /// Marks the database as used by a connection.
    pub fn use_database(&self) {
        self.use_count.fetch_add(1, Ordering::SeqCst);
    }

    /// Releases one connection's use of the database.
    pub fn release(&self) {
        self.use_count.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn is_in_use(&self) -> bool {
        self.use_count.load(Ordering::SeqCst) > 0
    }

    // --- tables ---------------------------------------------------------

    fn cache_table(&self, table: Arc<Table>) -> Result<()> {
        self.tables
            .lock()
            .put(table.id(), table, |_, table| {
                !table.is_system() && Arc::strong_count(table) == 1
            })
            .map_err(Error::from)
            .map(|_| ())
    }

    /// Looks a table up by name, opening it on a cache miss.
    pub fn find_table_checked(&self, name: &str) -> Result<Arc<Table>> {
        if !is_valid_object_name(name) {
            return Err(Error::User(UserError::InvalidTableName(name.to_owned())));
        }
        let record = {
            let registries = self.core.registries.lock();
            registries.tables.get_by_name(name).cloned()
        };
        let record = record.ok_or_else(|| {
            Error::User(UserError::TableDoesNotExist {
                database: self.core.name.clone(),
                table: name.to_owned(),
            })
        })?;
        self.find_table_by_record(&record)
    }

    fn find_table_by_record(&self, record: &TableRecord) -> Result<Arc<Table>> {
        if let Some(table) = self.tables.lock().get(&record.id) {
            return Ok(table.clone());
        }
        let table = Table::open(self.core.clone(), record)?;
        self.cache_table(table.clone())?;
        Ok(table)
    }

    /// Names of all tables, system tables included, ordered by id.
    pub fn table_names(&self) -> Vec<String> {
        self.core
            .registries
            .lock()
            .tables
            .iter()
            .map(|t| t.name.clone())
            .collect()
    }

    /// Table catalog records ordered by id.
    pub fn table_records(&self) -> Vec<TableRecord> {
        self.core.registries.lock().tables.iter().cloned().collect()
    }

    /// Creates a user table and persists its catalog rows.
    pub fn create_user_table(
        &self,
        name: String,
        first_user_trid: u64,
        description: Option<String>,
        columns: Vec<TableColumnSpec>,
    ) -> Result<Arc<Table>> {
        if is_system_table(&name) {
            return Err(Error::User(UserError::CannotModifySystemTable {
                database: self.core.name.clone(),
                table: name,
            }));
        }
        let _ddl = self.ddl_lock.lock();
        let table = Table::create(
            self.core.clone(),
            name,
            TableType::Disk,
            first_user_trid,
            description,
            columns,
        )?;
        self.cache_table(table.clone())?;
        self.record_catalog_objects(Some(table.id()))?;
        self.save_catalog()?;
        Ok(table)
    }

    // Writes catalog rows for registry objects: all of them during
    // bootstrap, or only the ones belonging to one table afterwards.
    // Row ids are the object ids.
    fn record_catalog_objects(&self, only_table: Option<u32>) -> Result<()> {
        struct CatalogRows {
            tables: Vec<(u64, Vec<Value>)>,
            column_sets: Vec<(u64, Vec<Value>)>,
            column_set_columns: Vec<(u64, Vec<Value>)>,
            columns: Vec<(u64, Vec<Value>)>,
            column_definitions: Vec<(u64, Vec<Value>)>,
            column_definition_constraints: Vec<(u64, Vec<Value>)>,
            constraints: Vec<(u64, Vec<Value>)>,
            constraint_definitions: Vec<(u64, Vec<Value>)>,
            indices: Vec<(u64, Vec<Value>)>,
            index_columns: Vec<(u64, Vec<Value>)>,
        }

        let rows = {
            let registries = self.core.registries.lock();
            let persisted = self.persisted_constraint_definitions.lock();
            let table_matches = |table_id: u32| match only_table {
                Some(id) => table_id == id,
                None => true,
            };

            let mut rows = CatalogRows {
                tables: Vec::new(),
                column_sets: Vec::new(),
                column_set_columns: Vec::new(),
                columns: Vec::new(),
                column_definitions: Vec::new(),
                column_definition_constraints: Vec::new(),
                constraints: Vec::new(),
                constraint_definitions: Vec::new(),
                indices: Vec::new(),
                index_columns: Vec::new(),
            };

            let mut wanted_columns = HashSet::new();
            for table in registries.tables.iter().filter(|t| table_matches(t.id)) {
                rows.tables
                    .push((u64::from(table.id), catalog::table_row(table)));
            }
            for column_set in registries
                .column_sets
                .iter()
                .filter(|cs| table_matches(cs.table_id))
            {
                rows.column_sets
                    .push((column_set.id, catalog::column_set_row(column_set)));
                for member in &column_set.columns {
                    wanted_columns.insert(member.column_id);
                    rows.column_set_columns
                        .push((member.id, catalog::column_set_column_row(member)));
                }
            }
            for column in registries
                .columns
                .iter()
                .filter(|c| table_matches(c.table_id))
            {
                rows.columns.push((column.id, catalog::column_row(column)));
            }
            let mut wanted_constraint_defs = HashSet::new();
            for definition in registries
                .column_definitions
                .iter()
                .filter(|d| only_table.is_none() || wanted_columns.contains(&d.column_id))
            {
                rows.column_definitions
                    .push((definition.id, catalog::column_definition_row(definition)));
                for link in &definition.constraints {
                    rows.column_definition_constraints
                        .push((link.id, catalog::column_definition_constraint_row(link)));
                }
            }
            for constraint in registries
                .constraints
                .iter()
                .filter(|c| table_matches(c.table_id))
            {
                rows.constraints
                    .push((constraint.id, catalog::constraint_row(constraint)));
                wanted_constraint_defs.insert(constraint.definition_id);
            }
            for definition in registries.constraint_definitions.iter().filter(|d| {
                (only_table.is_none() || wanted_constraint_defs.contains(&d.id))
                    && !persisted.contains(&d.id)
            }) {
                rows.constraint_definitions
                    .push((definition.id, catalog::constraint_definition_row(definition)));
            }
            for index in registries
                .indices
                .iter()
                .filter(|i| table_matches(i.table_id))
            {
                rows.indices.push((index.id, catalog::index_row(index)));
                for column in &index.columns {
                    rows.index_columns
                        .push((column.id, catalog::index_column_row(column)));
                }
            }
            rows
        };

        let tp = TransactionParameters::new(SUPER_USER_ID, self.core.generate_next_transaction_id());
        self.write_catalog_rows(catalog::SYS_TABLES, rows.tables, &tp)?;
        self.write_catalog_rows(catalog::SYS_COLUMN_SETS, rows.column_sets, &tp)?;
        self.write_catalog_rows(catalog::SYS_COLUMNS, rows.columns, &tp)?;
        self.write_catalog_rows(catalog::SYS_COLUMN_DEFS, rows.column_definitions, &tp)?;
        self.write_catalog_rows(
            catalog::SYS_COLUMN_SET_COLUMNS,
            rows.column_set_columns,
            &tp,
        )?;
        let constraint_definition_ids: Vec<u64> = rows
            .constraint_definitions
            .iter()
            .map(|(id, _)| *id)
            .collect();
        self.write_catalog_rows(
            catalog::SYS_CONSTRAINT_DEFS,
            rows.constraint_definitions,
            &tp,
        )?;
        self.write_catalog_rows(catalog::SYS_CONSTRAINTS, rows.constraints, &tp)?;
        self.write_catalog_rows(
            catalog::SYS_COLUMN_DEF_CONSTRAINTS,
            rows.column_definition_constraints,
            &tp,
        )?;
        self.write_catalog_rows(catalog::SYS_INDICES, rows.indices, &tp)?;
        self.write_catalog_rows(catalog::SYS_INDEX_COLUMNS, rows.index_columns, &tp)?;

        let mut persisted = self.persisted_constraint_definitions.lock();
        for id in constraint_definition_ids {
            persisted.insert(id);
        }
        Ok(())
    }

    fn write_catalog_rows(
        &self,
        table_name: &str,
        rows: Vec<(u64, Vec<Value>)>,
        tp: &TransactionParameters,
    ) -> Result<()> {
        if rows.is_empty() {
            return Ok(());
        }
        let table = self.find_table_checked(table_name)?;
        for (trid, row) in rows {
            table.insert_row(row, tp, trid)?;
        }
        table.flush()
    }

    /// Inserts a row into `SYS_DATABASES`; only meaningful on the system
    /// database.
    pub fn record_database(&self, record: &DatabaseRecord) -> Result<()> {
        let tp =
            TransactionParameters::new(SUPER_USER_ID, self.core.generate_next_transaction_id());
        let table = self.find_table_checked(catalog::SYS_DATABASES)?;
        table.insert_row(catalog::database_row(record), &tp, u64::from(record.id))?;
        table.flush()
    }

    /// Reads all database records from `SYS_DATABASES`.
    pub fn read_database_records(&self) -> Result<Vec<DatabaseRecord>> {
        let table = self.find_table_checked(catalog::SYS_DATABASES)?;
        let rows = read_all_rows(&table)?;
        let mut records = Vec::with_capacity(rows.len());
        for (trid, row) in rows {
            records.push(catalog::database_from_row(trid, &row)?);
        }
        Ok(records)
    }

    /// Atomically persists the catalog snapshot (temp file + rename).
    pub fn save_catalog(&self) -> Result<()> {
        let final_path = self.core.data_dir.join(SYSTEM_OBJECTS_FILE);
        let tmp_path = self.core.data_dir.join(format!("{}.tmp", SYSTEM_OBJECTS_FILE));
        if tmp_path.exists() {
            std::fs::remove_file(&tmp_path)
                .map_err(|e| Error::io("remove stale catalog snapshot", e))?;
        }
        {
            let mut file = self
                .core
                .factory
                .create_file(&tmp_path, 0)
                .map_err(|e| Error::io("create catalog snapshot", e))?;
            let registries = self.core.registries.lock();
            save_system_objects(&mut file, &registries)?;
            file.flush()
                .map_err(|e| Error::io("flush catalog snapshot", e))?;
        }
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|e| Error::io("rename catalog snapshot", e))?;
        Ok(())
    }

    /// Flushes metadata counters and every cached table.
    pub fn flush(&self) -> Result<()> {
        let tables: Vec<Arc<Table>> = self.tables.lock().iter().map(|(_, t)| t.clone()).collect();
        for table in tables {
            table.flush()?;
        }
        self.core
            .metadata
            .lock()
            .flush()
            .map_err(|e| Error::io("flush database metadata", e))
    }
}

// --- catalog read-back by scanning --------------------------------------

// Opens the columns of one catalog table directly from the fixed layout,
// without consulting the catalog being read.
fn open_catalog_table_columns(
    core: &Arc<DatabaseCore>,
    def: &catalog::SystemTableDef,
) -> Result<Vec<Arc<Column>>> {
    let table_dir = core
        .data_dir
        .join(format!("{}{}", crate::defs::TABLE_DIR_PREFIX, def.id));
    let column_ids = catalog::catalog_column_ids(def);
    let mut columns = Vec::with_capacity(column_ids.len());
    for (position, column_id) in column_ids.iter().enumerate() {
        let (name, data_type) = if position == 0 {
            (MASTER_COLUMN_NAME.to_owned(), Column::MASTER_COLUMN_DATA_TYPE)
        } else {
            let c = &def.columns[position - 1];
            (c.name.to_owned(), c.data_type)
        };
        let column = Column::open(
            core.factory.clone(),
            &table_dir,
            core.name.clone(),
            def.name.to_owned(),
            def.id,
            ColumnOpenInfo {
                id: *column_id,
                name,
                data_type,
                data_area_size: SYSTEM_BLOCK_DATA_AREA_SIZE,
                description: None,
            },
            def.first_user_trid,
        )?;
        columns.push(Arc::new(column));
    }
    columns[0].load_main_index(
        format!("{}_{}_IDX", def.name, MASTER_COLUMN_NAME),
        SYSTEM_INDEX_DATA_FILE_SIZE,
    )?;
    Ok(columns)
}

// Reads every row of an already opened catalog table, in ascending TRID
// order.
fn scan_rows(columns: &[Arc<Column>]) -> Result<Vec<(u64, Vec<Value>)>> {
    let master = &columns[0];
    let mut rows = Vec::new();
    let (min, max) = match master.main_index_min_max()? {
        Some(bounds) => bounds,
        None => return Ok(rows),
    };
    if min > max {
        return Err(Error::internal("master column index corrupted"));
    }
    let mut trid = Some(min);
    while let Some(current) = trid {
        let addr = master.main_index_find(current)?.ok_or_else(|| {
            Error::internal("master column index corrupted: key vanished during scan")
        })?;
        let mcr = master.read_master_column_record(addr)?;
        if mcr.column_records.len() + 1 != columns.len() {
            return Err(Error::internal(format!(
                "master column record of row {} has {} column records, expected {}",
                current,
                mcr.column_records.len(),
                columns.len() - 1
            )));
        }
        let mut row = Vec::with_capacity(columns.len() - 1);
        for (record, column) in mcr.column_records.iter().zip(columns[1..].iter()) {
            row.push(column.clone().read_record(record.address, false)?);
        }
        rows.push((current, row));
        trid = master.main_index_next_trid(current)?;
    }
    Ok(rows)
}

// Full catalog read-back from the catalog tables themselves.
fn scan_catalog_tables(core: &Arc<DatabaseCore>) -> Result<Registries> {
    let mut registries = Registries::default();

    for def in catalog::SYSTEM_TABLES {
        let table_dir = core
            .data_dir
            .join(format!("{}{}", crate::defs::TABLE_DIR_PREFIX, def.id));
        if !table_dir.join(INIT_FLAG_FILE).exists() {
            // SYS_DATABASES exists only in the system database.
            if def.name == catalog::SYS_DATABASES {
                continue;
            }
            return Err(Error::internal(format!(
                "catalog table {} is missing",
                def.name
            )));
        }
        if def.name == catalog::SYS_DATABASES {
            // Instance-level records; not part of the schema registries.
            continue;
        }
        let columns = open_catalog_table_columns(core, def)?;
        let rows = scan_rows(&columns)?;
        for (trid, row) in rows {
            match def.name {
                catalog::SYS_TABLES => {
                    registries.tables.insert(catalog::table_from_row(trid, &row)?);
                }
                catalog::SYS_COLUMN_SETS => {
                    registries
                        .column_sets
                        .insert(catalog::column_set_from_row(trid, &row)?);
                }
                catalog::SYS_COLUMNS => {
                    registries.columns.insert(catalog::column_from_row(trid, &row)?);
                }
                catalog::SYS_COLUMN_DEFS => {
                    registries
                        .column_definitions
                        .insert(catalog::column_definition_from_row(trid, &row)?);
                }
                catalog::SYS_COLUMN_SET_COLUMNS => {
                    let member = catalog::column_set_column_from_row(trid, &row)?;
                    match registries.column_sets.get_mut(member.column_set_id) {
                        Some(column_set) => column_set.columns.push(member),
                        None => {
                            return Err(Error::internal(format!(
                                "column set column {} references missing column set {}",
                                member.id, member.column_set_id
                            )))
                        }
                    }
                }
                catalog::SYS_CONSTRAINT_DEFS => {
                    registries
                        .constraint_definitions
                        .insert(catalog::constraint_definition_from_row(trid, &row)?);
                }
                catalog::SYS_CONSTRAINTS => {
                    registries
                        .constraints
                        .insert(catalog::constraint_from_row(trid, &row)?);
                }
                catalog::SYS_COLUMN_DEF_CONSTRAINTS => {
                    let link = catalog::column_definition_constraint_from_row(trid, &row)?;
                    match registries
                        .column_definitions
                        .get_mut(link.column_definition_id)
                    {
                        Some(definition) => definition.constraints.push(link),
                        None => {
                            return Err(Error::internal(format!(
                                "column definition constraint {} references missing definition {}",
                                link.id, link.column_definition_id
                            )))
                        }
                    }
                }
                catalog::SYS_INDICES => {
                    registries.indices.insert(catalog::index_from_row(trid, &row)?);
                }
                catalog::SYS_INDEX_COLUMNS => {
                    let column = catalog::index_column_from_row(trid, &row)?;
                    let no_indices = registries.indices.is_empty();
                    match registries.indices.get_mut(column.index_id) {
                        Some(index) => index.columns.push(column),
                        None if no_indices => {
                            warn!(target: "db", "dangling index column {} and no indices at all", column.id);
                        }
                        None => {
                            return Err(Error::internal(format!(
                                "index column {} references missing index {}",
                                column.id, column.index_id
                            )))
                        }
                    }
                }
                _ => unreachable!("all catalog tables are matched above"),
            }
        }
    }
    Ok(registries)
}

// Structural catalog validation; failures abort startup.
fn validate_catalog(database_name: &str, registries: &Registries) -> Result<()> {
    for table in registries.tables.iter() {
        if !is_valid_object_name(&table.name) {
            return Err(Error::internal(format!(
                "catalog of '{}': invalid table name '{}'",
                database_name, table.name
            )));
        }
        let column_set = registries
            .column_sets
            .get(table.current_column_set_id)
            .ok_or_else(|| {
                Error::internal(format!(
                    "catalog of '{}': table '{}' references missing column set {}",
                    database_name, table.name, table.current_column_set_id
                ))
            })?;

        let mut names = HashSet::new();
        let mut has_master = false;
        for member in &column_set.columns {
            let definition = registries
                .column_definitions
                .get(member.column_definition_id)
                .ok_or_else(|| {
                    Error::internal(format!(
                        "catalog of '{}': column set {} references missing column definition {}",
                        database_name, column_set.id, member.column_definition_id
                    ))
                })?;
            let column = registries.columns.get(definition.column_id).ok_or_else(|| {
                Error::internal(format!(
                    "catalog of '{}': column definition {} references missing column {}",
                    database_name, definition.id, definition.column_id
                ))
            })?;
            if !is_valid_object_name(&column.name) {
                return Err(Error::internal(format!(
                    "catalog of '{}': invalid column name '{}'",
                    database_name, column.name
                )));
            }
            if !names.insert(column.name.clone()) {
                return Err(Error::internal(format!(
                    "catalog of '{}': duplicate column '{}' in table '{}'",
                    database_name, column.name, table.name
                )));
            }
            if column.name == MASTER_COLUMN_NAME {
                if column.data_type != Column::MASTER_COLUMN_DATA_TYPE {
                    return Err(Error::internal(format!(
                        "catalog of '{}': master column of table '{}' has type {}",
                        database_name, table.name, column.data_type
                    )));
                }
                has_master = true;
            }
        }
        if !has_master {
            return Err(Error::internal(format!(
                "catalog of '{}': table '{}' has no master column",
                database_name, table.name
            )));
        }
    }

    for constraint in registries.constraints.iter() {
        if registries
            .constraint_definitions
            .get(constraint.definition_id)
            .is_none()
        {
            return Err(Error::internal(format!(
                "catalog of '{}': constraint '{}' references missing definition {}",
                database_name, constraint.name, constraint.definition_id
            )));
        }
    }

    for index in registries.indices.iter() {
        if registries.tables.get(u64::from(index.table_id)).is_none() {
            return Err(Error::internal(format!(
                "catalog of '{}': index '{}' references missing table {}",
                database_name, index.name, index.table_id
            )));
        }
        for column in &index.columns {
            let definition = registries
                .column_definitions
                .get(column.column_definition_id)
                .ok_or_else(|| {
                    Error::internal(format!(
                        "catalog of '{}': index '{}' references missing column definition {}",
                        database_name, index.name, column.column_definition_id
                    ))
                })?;
            let owner = registries.columns.get(definition.column_id).ok_or_else(|| {
                Error::internal(format!(
                    "catalog of '{}': index '{}' references missing column {}",
                    database_name, index.name, definition.column_id
                ))
            })?;
            if owner.table_id != index.table_id {
                return Err(Error::internal(format!(
                    "catalog of '{}': index '{}' indexes column '{}' of another table",
                    database_name, index.name, owner.name
                )));
            }
        }
    }
    Ok(())
}

/// Reads all rows of a table through its master index; row values are in
/// column position order, master column excluded.
pub fn read_all_rows(table: &Table) -> Result<Vec<(u64, Vec<Value>)>> {
    let columns = table.columns_ordered();
    scan_rows(&columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reg::DatabaseRecord;
    use crate::test_support::{column_spec, create_user_database};
    use meridb_types::ColumnDataType;
    use tempdir::TempDir;

    fn record_of(db: &Database) -> DatabaseRecord {
        DatabaseRecord {
            id: db.id(),
            uuid: db.uuid(),
            name: db.name().to_owned(),
            cipher_id: db.cipher_id().to_owned(),
            cipher_key: db.cipher_key().to_vec(),
            description: db.description().map(str::to_owned),
        }
    }

    #[test]
    fn bootstrap_creates_self_describing_catalog() {
        let dir = TempDir::new("database").unwrap();
        let db = create_user_database(dir.path(), "TESTDB");

        let names = db.table_names();
        for def in catalog::per_database_system_tables() {
            assert!(names.contains(&def.name.to_owned()), "missing {}", def.name);
        }
        // The catalog describes itself: SYS_TABLES contains its own row.
        let sys_tables = db.find_table_checked(catalog::SYS_TABLES).unwrap();
        let rows = read_all_rows(&sys_tables).unwrap();
        let recorded: Vec<u64> = rows.iter().map(|(trid, _)| *trid).collect();
        assert!(recorded.contains(&1), "SYS_TABLES row for SYS_TABLES");
        assert_eq!(
            rows.len(),
            catalog::per_database_system_tables().count()
        );
    }

    #[test]
    fn catalog_reflexivity_across_reopen() {
        let dir = TempDir::new("database").unwrap();
        let record = {
            let db = create_user_database(dir.path(), "TESTDB");
            db.create_user_table(
                "U".to_owned(),
                1,
                None,
                vec![column_spec("A", ColumnDataType::Int32, true)],
            )
            .unwrap();
            db.create_user_table(
                "V".to_owned(),
                1,
                None,
                vec![column_spec("B", ColumnDataType::Text, false)],
            )
            .unwrap();
            record_of(&db)
        };

        let db = Database::open(&record, dir.path(), 8).unwrap();
        let u = db.find_table_checked("U").unwrap();
        let columns = u.columns_ordered();
        assert_eq!(columns.len(), 2);
        assert_eq!(columns[0].name(), "TRID");
        assert_eq!(columns[1].name(), "A");
        assert_eq!(columns[1].data_type(), ColumnDataType::Int32);
        assert!(columns[1].is_not_null());

        let v = db.find_table_checked("V").unwrap();
        assert_eq!(v.columns_ordered()[1].data_type(), ColumnDataType::Text);
        assert!(!v.columns_ordered()[1].is_not_null());
    }

    #[test]
    fn reopen_without_snapshot_scans_catalog_tables() {
        let dir = TempDir::new("database").unwrap();
        let (record, data_dir) = {
            let db = create_user_database(dir.path(), "TESTDB");
            db.create_user_table(
                "U".to_owned(),
                1,
                None,
                vec![column_spec("A", ColumnDataType::Int32, false)],
            )
            .unwrap();
            (record_of(&db), db.core().data_dir.clone())
        };

        // Force the slow path: remove the snapshot.
        std::fs::remove_file(data_dir.join(crate::defs::SYSTEM_OBJECTS_FILE)).unwrap();
        let db = Database::open(&record, dir.path(), 8).unwrap();
        let u = db.find_table_checked("U").unwrap();
        assert_eq!(u.columns_ordered().len(), 2);
        assert_eq!(u.columns_ordered()[1].name(), "A");

        // Rows written before the reopen are still reachable.
        let tp = meridb_types::TransactionParameters::new(1, db.generate_next_transaction_id());
        let (mcr, _) = u.insert_row(vec![meridb_types::Value::Int32(9)], &tp, 0).unwrap();
        assert_eq!(mcr.trid, 1);
    }

    #[test]
    fn rows_survive_reopen() {
        let dir = TempDir::new("database").unwrap();
        let record = {
            let db = create_user_database(dir.path(), "TESTDB");
            let table = db
                .create_user_table(
                    "U".to_owned(),
                    1,
                    None,
                    vec![column_spec("A", ColumnDataType::Int32, false)],
                )
                .unwrap();
            let tp = meridb_types::TransactionParameters::new(1, db.generate_next_transaction_id());
            table
                .insert_row(vec![meridb_types::Value::Int32(11)], &tp, 0)
                .unwrap();
            table
                .insert_row(vec![meridb_types::Value::Int32(22)], &tp, 0)
                .unwrap();
            table.flush().unwrap();
            record_of(&db)
        };

        let db = Database::open(&record, dir.path(), 8).unwrap();
        let table = db.find_table_checked("U").unwrap();
        let rows = read_all_rows(&table).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].0, 1);
        assert_eq!(rows[0].1[0], meridb_types::Value::Int32(11));
        assert_eq!(rows[1].0, 2);
        assert_eq!(rows[1].1[0], meridb_types::Value::Int32(22));

        // TRID generation continues after the used range.
        let tp = meridb_types::TransactionParameters::new(1, db.generate_next_transaction_id());
        let (mcr, _) = table
            .insert_row(vec![meridb_types::Value::Int32(33)], &tp, 0)
            .unwrap();
        assert_eq!(mcr.trid, 3);
    }

    #[test]
    fn constraint_definitions_are_deduplicated() {
        let dir = TempDir::new("database").unwrap();
        let db = create_user_database(dir.path(), "TESTDB");
        db.create_user_table(
            "U".to_owned(),
            1,
            None,
            vec![column_spec("A", ColumnDataType::Int32, true)],
        )
        .unwrap();
        db.create_user_table(
            "V".to_owned(),
            1,
            None,
            vec![column_spec("B", ColumnDataType::Int32, true)],
        )
        .unwrap();

        // Both user NOT NULL constraints share the single definition that
        // the system tables already created.
        let registries = db.core().registries.lock();
        let not_null_defs: Vec<_> = registries
            .constraint_definitions
            .iter()
            .filter(|d| d.constraint_type == crate::reg::ConstraintType::NotNull)
            .collect();
        assert_eq!(not_null_defs.len(), 1);
    }

    #[test]
    fn encrypted_database_roundtrip() {
        let dir = TempDir::new("database").unwrap();
        let key: Vec<u8> = (0u8..16).collect();
        let record = {
            let db = Database::create(
                crate::defs::FIRST_USER_DATABASE_ID,
                "SECRET".to_owned(),
                "aes128".to_owned(),
                key.clone(),
                None,
                dir.path(),
                8,
                None,
            )
            .unwrap();
            let table = db
                .create_user_table(
                    "U".to_owned(),
                    1,
                    None,
                    vec![column_spec("B", ColumnDataType::Text, false)],
                )
                .unwrap();
            let tp = meridb_types::TransactionParameters::new(1, db.generate_next_transaction_id());
            table
                .insert_row(
                    vec![meridb_types::Value::Text("classified".to_owned())],
                    &tp,
                    0,
                )
                .unwrap();
            table.flush().unwrap();
            record_of(&db)
        };

        let db = Database::open(&record, dir.path(), 8).unwrap();
        let table = db.find_table_checked("U").unwrap();
        let rows = read_all_rows(&table).unwrap();
        assert_eq!(rows[0].1[0], meridb_types::Value::Text("classified".to_owned()));

        // The wrong key must not pass header verification.
        let mut bad = record.clone();
        bad.cipher_key = vec![0xau8; 16];
        assert!(Database::open(&bad, dir.path(), 8).is_err());
    }
}
