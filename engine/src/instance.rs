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

//! Instance: the database registry rooted at the system database, and the
//! per-database file encryption derived from each database's cipher.

use std::path::PathBuf;
use std::sync::Arc;

use log::info;
use parking_lot::Mutex;

use meridb_types::{is_valid_object_name, Uuid};
use object_cache::ObjectCache;

use crate::database::{make_database_uuid, Database, DEFAULT_TABLE_CACHE_CAPACITY};
use crate::defs::{
    FIRST_USER_DATABASE_ID, INIT_FLAG_FILE, SYSTEM_DATABASE_ID, SYSTEM_DATABASE_NAME,
};
use crate::error::{Error, Result, UserError};
use crate::reg::{DatabaseRecord, Registry};

/// Default capacity of the instance-level database cache.
pub const DEFAULT_DATABASE_CACHE_CAPACITY: usize = 16;

/// Instance configuration.
pub struct InstanceConfig {
    /// Root directory holding one subdirectory per database.
    pub data_dir: PathBuf,
    /// Cipher of the system database.
    pub system_cipher_id: String,
    pub system_cipher_key: Vec<u8>,
    pub table_cache_capacity: usize,
    pub database_cache_capacity: usize,
}

impl InstanceConfig {
    pub fn new(data_dir: PathBuf, system_cipher_id: String, system_cipher_key: Vec<u8>) -> Self {
        InstanceConfig {
            data_dir,
            system_cipher_id,
            system_cipher_key,
            table_cache_capacity: DEFAULT_TABLE_CACHE_CAPACITY,
            database_cache_capacity: DEFAULT_DATABASE_CACHE_CAPACITY,
        }
    }
}

/// An open engine instance.
pub struct Instance {
    config: InstanceConfig,
    system_database: Arc<Database>,
    registry: Mutex<Registry<DatabaseRecord>>,
    databases: Mutex<ObjectCache<u32, Arc<Database>>>,
}

impl Instance {
    /// Opens the instance, bootstrapping the system database on first
    /// start.
    pub fn open(config: InstanceConfig) -> Result<Instance> {
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| Error::io("create instance data dir", e))?;

        // The system database has a deterministic UUID so that it can be
        // located before any catalog is readable.
        let system_uuid = system_database_uuid();
        let system_record = DatabaseRecord {
            id: SYSTEM_DATABASE_ID,
            uuid: system_uuid,
            name: SYSTEM_DATABASE_NAME.to_owned(),
            cipher_id: config.system_cipher_id.clone(),
            cipher_key: config.system_cipher_key.clone(),
            description: Some("System database".to_owned()),
        };

        let system_dir = config.data_dir.join(system_uuid.to_string());
        let system_database = if system_dir.join(INIT_FLAG_FILE).exists() {
            Arc::new(Database::open(
                &system_record,
                &config.data_dir,
                config.table_cache_capacity,
            )?)
        } else {
            info!(target: "engine", "bootstrapping instance at {}", config.data_dir.display());
            let database = Database::create(
                SYSTEM_DATABASE_ID,
                SYSTEM_DATABASE_NAME.to_owned(),
                config.system_cipher_id.clone(),
                config.system_cipher_key.clone(),
                Some("System database".to_owned()),
                &config.data_dir,
                config.table_cache_capacity,
                Some(system_uuid),
            )?;
            database.record_database(&system_record)?;
            Arc::new(database)
        };

        let mut registry = Registry::default();
        for record in system_database.read_database_records()? {
            registry.insert(record);
        }

        let instance = Instance {
            databases: Mutex::new(ObjectCache::new(config.database_cache_capacity)),
            config,
            system_database,
            registry: Mutex::new(registry),
        };
        Ok(instance)
    }

    pub fn data_dir(&self) -> &PathBuf {
        &self.config.data_dir
    }

    pub fn system_database(&self) -> &Arc<Database> {
        &self.system_database
    }

    /// All known database records, ordered by id.
    pub fn database_records(&self) -> Vec<DatabaseRecord> {
        self.registry.lock().iter().cloned().collect()
    }

    /// Creates a user database and records it in `SYS_DATABASES`.
    pub fn create_database(
        &self,
        name: String,
        cipher_id: String,
        cipher_key: Vec<u8>,
        description: Option<String>,
    ) -> Result<Arc<Database>> {
        if !is_valid_object_name(&name) {
            return Err(Error::User(UserError::InvalidDatabaseName(name)));
        }
        let id = {
            let registry = self.registry.lock();
            if registry.get_by_name(&name).is_some() {
                return Err(Error::User(UserError::DatabaseAlreadyExists(name)));
            }
            registry.next_id(false, u64::from(FIRST_USER_DATABASE_ID)) as u32
        };

        let database = Arc::new(Database::create(
            id,
            name,
            cipher_id,
            cipher_key,
            description,
            &self.config.data_dir,
            self.config.table_cache_capacity,
            None,
        )?);
        let record = DatabaseRecord {
            id,
            uuid: database.uuid(),
            name: database.name().to_owned(),
            cipher_id: database.cipher_id().to_owned(),
            cipher_key: database.cipher_key().to_vec(),
            description: database.description().map(str::to_owned),
        };
        self.system_database.record_database(&record)?;
        self.registry.lock().insert(record);
        self.cache_database(database.clone())?;
        Ok(database)
    }

    fn cache_database(&self, database: Arc<Database>) -> Result<()> {
        self.databases
            .lock()
            .put(database.id(), database, |_, db| {
                !db.is_system() && !db.is_in_use() && Arc::strong_count(db) == 1
            })
            .map_err(Error::from)
            .map(|_| ())
    }

    /// Looks a database up by name, opening it on a cache miss.
    pub fn find_database_checked(&self, name: &str) -> Result<Arc<Database>> {
        if name == SYSTEM_DATABASE_NAME {
            return Ok(self.system_database.clone());
        }
        if !is_valid_object_name(name) {
            return Err(Error::User(UserError::InvalidDatabaseName(name.to_owned())));
        }
        let record = {
            let registry = self.registry.lock();
            registry.get_by_name(name).cloned()
        };
        let record = record
            .ok_or_else(|| Error::User(UserError::DatabaseDoesNotExist(name.to_owned())))?;
        if let Some(database) = self.databases.lock().get(&record.id) {
            return Ok(database.clone());
        }
        let database = Arc::new(Database::open(
            &record,
            &self.config.data_dir,
            self.config.table_cache_capacity,
        )?);
        self.cache_database(database.clone())?;
        Ok(database)
    }

    /// Flushes every cached database.
    pub fn flush(&self) -> Result<()> {
        self.system_database.flush()?;
        let databases: Vec<Arc<Database>> = self
            .databases
            .lock()
            .iter()
            .map(|(_, db)| db.clone())
            .collect();
        for database in databases {
            database.flush()?;
        }
        Ok(())
    }
}

/// Deterministic UUID of the system database.
pub fn system_database_uuid() -> Uuid {
    make_database_uuid(SYSTEM_DATABASE_NAME, 0)
}
