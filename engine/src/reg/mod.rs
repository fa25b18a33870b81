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

//! In-memory catalog registries: one record struct per schema object kind,
//! keyed by id with secondary name lookup where names exist. The same
//! records serialize into the `system_objects` snapshot.

mod records;
mod snapshot;

pub use self::records::{
    ColumnDefinitionConstraintRecord, ColumnDefinitionRecord, ColumnRecord, ColumnSetColumnRecord,
    ColumnSetRecord, ColumnState, ConstraintDefinitionRecord, ConstraintRecord, ConstraintState,
    ConstraintType, DatabaseRecord, IndexColumnRecord, IndexRecord, IndexType, RecordError,
    TableRecord, TableType,
};
pub use self::snapshot::{load_system_objects, save_system_objects};

use std::collections::{BTreeMap, HashMap};

/// A catalog object addressable by id and, optionally, by name.
pub trait CatalogRecord {
    fn record_id(&self) -> u64;

    fn record_name(&self) -> Option<&str> {
        None
    }
}

/// Ordered id → record map with name lookup.
pub struct Registry<T: CatalogRecord> {
    by_id: BTreeMap<u64, T>,
    by_name: HashMap<String, u64>,
}

impl<T: CatalogRecord> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            by_id: BTreeMap::new(),
            by_name: HashMap::new(),
        }
    }
}

impl<T: CatalogRecord> Registry<T> {
    pub fn insert(&mut self, record: T) -> Option<T> {
        if let Some(name) = record.record_name() {
            self.by_name.insert(name.to_owned(), record.record_id());
        }
        self.by_id.insert(record.record_id(), record)
    }

    pub fn get(&self, id: u64) -> Option<&T> {
        self.by_id.get(&id)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut T> {
        self.by_id.get_mut(&id)
    }

    pub fn get_by_name(&self, name: &str) -> Option<&T> {
        // Names may go stale after removal; revalidate on lookup.
        self.by_name
            .get(name)
            .and_then(|id| self.by_id.get(id))
            .filter(|r| r.record_name() == Some(name))
    }

    pub fn remove(&mut self, id: u64) -> Option<T> {
        let removed = self.by_id.remove(&id);
        if let Some(ref record) = removed {
            if let Some(name) = record.record_name() {
                self.by_name.remove(name);
            }
        }
        removed
    }

    pub fn contains(&self, id: u64) -> bool {
        self.by_id.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.by_id.values()
    }

    pub fn clear(&mut self) {
        self.by_id.clear();
        self.by_name.clear();
    }

    /// Next free id in the system (`[min_id, first_user_id)`) or user
    /// (`[first_user_id, …)`) range.
    pub fn next_id(&self, system: bool, first_user_id: u64) -> u64 {
        if system {
            self.by_id
                .range(..first_user_id)
                .next_back()
                .map(|(&id, _)| id + 1)
                .unwrap_or(1)
        } else {
            self.by_id
                .range(first_user_id..)
                .next_back()
                .map(|(&id, _)| id + 1)
                .unwrap_or(first_user_id)
        }
    }
}

/// All per-database catalog registries.
#[derive(Default)]
pub struct Registries {
    pub tables: Registry<TableRecord>,
    pub column_sets: Registry<ColumnSetRecord>,
    pub columns: Registry<ColumnRecord>,
    pub column_definitions: Registry<ColumnDefinitionRecord>,
    pub constraints: Registry<ConstraintRecord>,
    pub constraint_definitions: Registry<ConstraintDefinitionRecord>,
    pub indices: Registry<IndexRecord>,
}

impl Registries {
    /// Next id for column-set member rows, which have their own id space
    /// nested inside column sets.
    pub fn next_column_set_column_id(&self, system: bool, first_user_id: u64) -> u64 {
        let max = self
            .column_sets
            .iter()
            .flat_map(|cs| cs.columns.iter())
            .map(|c| c.id)
            .filter(|&id| (id < first_user_id) == system)
            .max();
        match max {
            Some(id) => id + 1,
            None if system => 1,
            None => first_user_id,
        }
    }

    /// Next id for column-definition constraint rows.
    pub fn next_column_definition_constraint_id(&self, system: bool, first_user_id: u64) -> u64 {
        let max = self
            .column_definitions
            .iter()
            .flat_map(|cd| cd.constraints.iter())
            .map(|c| c.id)
            .filter(|&id| (id < first_user_id) == system)
            .max();
        match max {
            Some(id) => id + 1,
            None if system => 1,
            None => first_user_id,
        }
    }

    /// Next id for index column rows.
    pub fn next_index_column_id(&self, system: bool, first_user_id: u64) -> u64 {
        let max = self
            .indices
            .iter()
            .flat_map(|i| i.columns.iter())
            .map(|c| c.id)
            .filter(|&id| (id < first_user_id) == system)
            .max();
        match max {
            Some(id) => id + 1,
            None if system => 1,
            None => first_user_id,
        }
    }

    /// Finds a constraint definition with identical content, enabling
    /// content-addressed deduplication.
    pub fn find_constraint_definition(
        &self,
        constraint_type: ConstraintType,
        expression: &[u8],
    ) -> Option<u64> {
        self.constraint_definitions
            .iter()
            .find(|d| d.constraint_type == constraint_type && d.expression == expression)
            .map(|d| d.id)
    }
}

#[cfg(test)]
mod tests {
    use super::records::{TableRecord, TableType};
    use super::Registry;

    fn table(id: u64, name: &str) -> TableRecord {
        TableRecord {
            id: id as u32,
            table_type: TableType::Disk,
            name: name.to_owned(),
            first_user_trid: 1,
            current_column_set_id: 1,
            description: None,
        }
    }

    #[test]
    fn name_lookup_revalidates() {
        let mut registry = Registry::default();
        registry.insert(table(1, "A"));
        registry.insert(table(2, "B"));
        assert_eq!(registry.get_by_name("A").unwrap().id, 1);
        registry.remove(1);
        assert!(registry.get_by_name("A").is_none());
        assert_eq!(registry.get_by_name("B").unwrap().id, 2);
    }

    #[test]
    fn next_id_respects_ranges() {
        let mut registry = Registry::default();
        assert_eq!(registry.next_id(true, 0x10000), 1);
        assert_eq!(registry.next_id(false, 0x10000), 0x10000);
        registry.insert(table(1, "S1"));
        registry.insert(table(2, "S2"));
        registry.insert(table(0x10000, "U1"));
        assert_eq!(registry.next_id(true, 0x10000), 3);
        assert_eq!(registry.next_id(false, 0x10000), 0x10001);
    }
}
