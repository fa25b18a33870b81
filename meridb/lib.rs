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

//! Meridb server: configuration, logging, and the connection manager
//! around the storage engine.

pub mod config;
pub mod run;
pub mod server;

/// Process exit codes. Fatal codes mean a supervisor must not restart the
/// process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    Success = 0,
    InvalidConfig = 1,
    DatabaseEngineInitializationFailed = 2,
    ConnectionCreationFailed = 3,
    LogInitializationFailed = 4,
    InitializationFailed = 5,
}

impl ExitCode {
    /// Whether a supervisor must not restart the process.
    pub fn is_fatal(self) -> bool {
        matches!(
            self,
            ExitCode::InvalidConfig
                | ExitCode::DatabaseEngineInitializationFailed
                | ExitCode::LogInitializationFailed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::ExitCode;

    #[test]
    fn fatal_codes_prevent_restart() {
        assert!(!ExitCode::Success.is_fatal());
        assert!(!ExitCode::ConnectionCreationFailed.is_fatal());
        assert!(ExitCode::InvalidConfig.is_fatal());
        assert!(ExitCode::DatabaseEngineInitializationFailed.is_fatal());
        assert!(ExitCode::LogInitializationFailed.is_fatal());
    }
}
