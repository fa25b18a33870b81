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

//! Meridb storage engine.
//!
//! Tables are persisted as per-column chains of fixed-size, optionally
//! block-encrypted data block files. Every logical row operation writes a
//! versioned master column record into the table's master column; the main
//! index maps row ids to the current record. The schema catalog is stored
//! with the same primitives and read back on startup.

pub mod column;
pub mod database;
pub mod datasets;
pub mod defs;
pub mod error;
pub mod handlers;
pub mod index;
pub mod instance;
pub mod io;
pub mod mcr;
pub mod reg;
pub mod table;

pub use crate::error::{Error, Result, UserError};
pub use crate::instance::Instance;

#[cfg(test)]
mod test_support;
