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

//! Catalog snapshot: the `system_objects` file holds every system-range
//! registry entry as a count-prefixed stream of size-prefixed records, one
//! stream per object kind in fixed order.

use meridb_types::pbe;

use crate::defs::{
    FIRST_USER_COLUMN_DEFINITION_ID, FIRST_USER_COLUMN_ID, FIRST_USER_COLUMN_SET_ID,
    FIRST_USER_CONSTRAINT_DEFINITION_ID, FIRST_USER_CONSTRAINT_ID, FIRST_USER_INDEX_ID,
    FIRST_USER_TABLE_ID,
};
use crate::error::{Error, Result};
use crate::io::FileBox;
use crate::reg::{CatalogRecord, Registries, Registry};

/// Largest serialized catalog object accepted on load.
const MAX_OBJECT_SERIALIZED_SIZE: usize = 0x10000;

struct SnapshotWriter<'f> {
    file: &'f mut FileBox,
    pos: u64,
    buf: Vec<u8>,
}

impl<'f> SnapshotWriter<'f> {
    fn write_collection<T, F>(
        &mut self,
        kind: &str,
        registry: &Registry<T>,
        first_user_id: u64,
        serialize: F,
    ) -> Result<()>
    where
        T: CatalogRecord,
        F: Fn(&T, &mut Vec<u8>),
    {
        let system: Vec<&T> = registry
            .iter()
            .filter(|r| r.record_id() < first_user_id)
            .collect();
        let mut count_buf = [0u8; 4];
        pbe::encode_u32(system.len() as u32, &mut count_buf);
        self.file
            .write_all_at(&count_buf, self.pos)
            .map_err(|e| Error::io(format!("write {} snapshot count", kind), e))?;
        self.pos += 4;

        for record in system {
            self.buf.clear();
            serialize(record, &mut self.buf);
            if self.buf.len() > MAX_OBJECT_SERIALIZED_SIZE {
                return Err(Error::internal(format!(
                    "{} object {} serializes to {} bytes, beyond the snapshot limit",
                    kind,
                    record.record_id(),
                    self.buf.len()
                )));
            }
            pbe::encode_u32(self.buf.len() as u32, &mut count_buf);
            self.file
                .write_all_at(&count_buf, self.pos)
                .map_err(|e| Error::io(format!("write {} snapshot record size", kind), e))?;
            self.pos += 4;
            self.file
                .write_all_at(&self.buf, self.pos)
                .map_err(|e| Error::io(format!("write {} snapshot record", kind), e))?;
            self.pos += self.buf.len() as u64;
        }
        Ok(())
    }
}

struct SnapshotReader<'f> {
    file: &'f mut FileBox,
    pos: u64,
}

impl<'f> SnapshotReader<'f> {
    fn read_collection<T, F>(&mut self, kind: &str, deserialize: F) -> Result<Vec<T>>
    where
        F: Fn(&[u8]) -> std::result::Result<T, crate::reg::RecordError>,
    {
        let mut count_buf = [0u8; 4];
        self.file
            .read_exact_at(&mut count_buf, self.pos)
            .map_err(|e| Error::io(format!("read {} snapshot count", kind), e))?;
        self.pos += 4;
        let count = pbe::decode_u32(&count_buf);

        let mut records = Vec::with_capacity(count as usize);
        for i in 0..count {
            self.file
                .read_exact_at(&mut count_buf, self.pos)
                .map_err(|e| Error::io(format!("read {} snapshot record size", kind), e))?;
            self.pos += 4;
            let size = pbe::decode_u32(&count_buf) as usize;
            if size > MAX_OBJECT_SERIALIZED_SIZE {
                return Err(Error::internal(format!(
                    "{} snapshot object #{} of {}: size {} is too big",
                    kind,
                    i + 1,
                    count,
                    size
                )));
            }
            let mut buf = vec![0u8; size];
            self.file
                .read_exact_at(&mut buf, self.pos)
                .map_err(|e| Error::io(format!("read {} snapshot record", kind), e))?;
            self.pos += size as u64;
            let record = deserialize(&buf).map_err(|e| {
                Error::internal(format!("{} snapshot object #{}: {}", kind, i + 1, e))
            })?;
            records.push(record);
        }
        Ok(records)
    }
}

/// Serializes the system-range registries into an open snapshot file.
pub fn save_system_objects(file: &mut FileBox, registries: &Registries) -> Result<()> {
    let mut w = SnapshotWriter {
        file,
        pos: 0,
        buf: Vec::with_capacity(512),
    };
    w.write_collection("Table", &registries.tables, u64::from(FIRST_USER_TABLE_ID), |r, out| {
        r.serialize(out)
    })?;
    w.write_collection(
        "ColumnSet",
        &registries.column_sets,
        FIRST_USER_COLUMN_SET_ID,
        |r, out| r.serialize(out),
    )?;
    w.write_collection("Column", &registries.columns, FIRST_USER_COLUMN_ID, |r, out| {
        r.serialize(out)
    })?;
    w.write_collection(
        "ColumnDefinition",
        &registries.column_definitions,
        FIRST_USER_COLUMN_DEFINITION_ID,
        |r, out| r.serialize(out),
    )?;
    w.write_collection(
        "Constraint",
        &registries.constraints,
        FIRST_USER_CONSTRAINT_ID,
        |r, out| r.serialize(out),
    )?;
    w.write_collection(
        "ConstraintDefinition",
        &registries.constraint_definitions,
        FIRST_USER_CONSTRAINT_DEFINITION_ID,
        |r, out| r.serialize(out),
    )?;
    w.write_collection("Index", &registries.indices, FIRST_USER_INDEX_ID, |r, out| {
        r.serialize(out)
    })?;
    Ok(())
}

/// Restores registries from an open snapshot file.
pub fn load_system_objects(file: &mut FileBox) -> Result<Registries> {
    let mut r = SnapshotReader { file, pos: 0 };
    let mut registries = Registries::default();
    for record in r.read_collection("Table", crate::reg::TableRecord::deserialize)? {
        registries.tables.insert(record);
    }
    for record in r.read_collection("ColumnSet", crate::reg::ColumnSetRecord::deserialize)? {
        registries.column_sets.insert(record);
    }
    for record in r.read_collection("Column", crate::reg::ColumnRecord::deserialize)? {
        registries.columns.insert(record);
    }
    for record in r.read_collection(
        "ColumnDefinition",
        crate::reg::ColumnDefinitionRecord::deserialize,
    )? {
        registries.column_definitions.insert(record);
    }
    for record in r.read_collection("Constraint", crate::reg::ConstraintRecord::deserialize)? {
        registries.constraints.insert(record);
    }
    for record in r.read_collection(
        "ConstraintDefinition",
        crate::reg::ConstraintDefinitionRecord::deserialize,
    )? {
        registries.constraint_definitions.insert(record);
    }
    for record in r.read_collection("Index", crate::reg::IndexRecord::deserialize)? {
        registries.indices.insert(record);
    }
    Ok(registries)
}

#[cfg(test)]
mod tests {
    use super::{load_system_objects, save_system_objects};
    use crate::io::{FileFactory, FileBox};
    use crate::reg::{
        ColumnRecord, ColumnState, Registries, TableRecord, TableType,
    };
    use tempdir::TempDir;

    #[test]
    fn snapshot_roundtrip_filters_user_objects() {
        let dir = TempDir::new("system_objects").unwrap();
        let factory = FileFactory::plaintext();
        let path = dir.path().join("system_objects");

        let mut registries = Registries::default();
        registries.tables.insert(TableRecord {
            id: 1,
            table_type: TableType::Disk,
            name: "SYS_TABLES".to_owned(),
            first_user_trid: 0x10000,
            current_column_set_id: 1,
            description: None,
        });
        // User-range table must not land in the snapshot.
        registries.tables.insert(TableRecord {
            id: 0x10000,
            table_type: TableType::Disk,
            name: "T".to_owned(),
            first_user_trid: 1,
            current_column_set_id: 0x100_0000,
            description: None,
        });
        registries.columns.insert(ColumnRecord {
            id: 1,
            table_id: 1,
            data_type: meridb_types::ColumnDataType::UInt64,
            name: "TRID".to_owned(),
            state: ColumnState::Active,
            block_data_area_size: 0x4_0000,
            description: None,
        });

        {
            let mut file: FileBox = factory.create_file(&path, 0).unwrap();
            save_system_objects(&mut file, &registries).unwrap();
        }
        let mut file: FileBox = factory.open_file(&path).unwrap();
        let loaded = load_system_objects(&mut file).unwrap();
        assert_eq!(loaded.tables.len(), 1);
        assert!(loaded.tables.get_by_name("SYS_TABLES").is_some());
        assert!(loaded.tables.get_by_name("T").is_none());
        assert_eq!(loaded.columns.len(), 1);
        assert_eq!(loaded.columns.get(1).unwrap().name, "TRID");
    }
}
