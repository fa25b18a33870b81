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

use std::time::{SystemTime, UNIX_EPOCH};

/// Parameters of the transaction a row operation belongs to.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransactionParameters {
    pub transaction_id: u64,
    pub timestamp: i64,
    pub user_id: u32,
}

impl TransactionParameters {
    /// New parameters stamped with the current wall-clock time.
    pub fn new(user_id: u32, transaction_id: u64) -> TransactionParameters {
        TransactionParameters {
            transaction_id,
            timestamp: unix_timestamp(),
            user_id,
        }
    }
}

/// Seconds since the Unix epoch.
pub fn unix_timestamp() -> i64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}
