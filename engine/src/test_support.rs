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

//! Shared helpers for engine tests.

use std::path::Path;
use std::sync::Arc;

use meridb_types::ColumnDataType;

use crate::database::Database;
use crate::instance::{Instance, InstanceConfig};
use crate::table::TableColumnSpec;

/// Opens a plaintext instance rooted at `dir`.
pub fn open_instance(dir: &Path) -> Arc<Instance> {
    let config = InstanceConfig::new(dir.to_owned(), "none".to_owned(), Vec::new());
    Arc::new(Instance::open(config).expect("test instance opens"))
}

/// Creates a plaintext user database in `dir`.
pub fn create_user_database(dir: &Path, name: &str) -> Database {
    Database::create(
        crate::defs::FIRST_USER_DATABASE_ID,
        name.to_owned(),
        "none".to_owned(),
        Vec::new(),
        None,
        dir,
        8,
        None,
    )
    .expect("test database creates")
}

/// Column spec shorthand.
pub fn column_spec(name: &str, data_type: ColumnDataType, not_null: bool) -> TableColumnSpec {
    TableColumnSpec {
        name: name.to_owned(),
        data_type,
        not_null,
        default_value: None,
        description: None,
    }
}
