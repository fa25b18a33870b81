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

//! Engine error taxonomy: user errors travel back to the client verbatim,
//! I/O and internal errors are logged and replaced with a generic message.

use std::fmt;
use std::io;

use meridb_types::{CastError, ColumnDataType};

pub type Result<T> = std::result::Result<T, Error>;

/// A user-visible error with a stable status code.
#[derive(Debug, Clone, PartialEq)]
pub enum UserError {
    InvalidDatabaseName(String),
    DatabaseDoesNotExist(String),
    DatabaseAlreadyExists(String),
    InvalidTableName(String),
    TableDoesNotExist { database: String, table: String },
    TableAlreadyExists { database: String, table: String },
    InvalidColumnName(String),
    ColumnDoesNotExist { database: String, table: String, column: String },
    ColumnAlreadyExists { database: String, table: String, column: String },
    DuplicateColumnName(String),
    CannotModifyMasterColumn,
    CannotModifySystemTable { database: String, table: String },
    ValuesCountMismatch { expected: usize, actual: usize },
    TooManyColumnsToInsert { actual: usize, limit: usize },
    CannotInsertNullValue { database: String, table: String, column: String },
    IncompatibleDataType { column: String, column_type: ColumnDataType, cast: CastError },
    CannotInsertDuplicateTrid(u64),
    TridRangeExhausted { database: String, table: String },
    InvalidNextTrid { current: u64, requested: u64 },
    InvalidCipherKey(String),
    CipherUnknown(String),
    PermissionDenied,
}

impl UserError {
    /// Stable non-zero status code for the wire protocol.
    pub fn code(&self) -> u32 {
        use self::UserError::*;
        match *self {
            InvalidDatabaseName(_) => 1001,
            DatabaseDoesNotExist(_) => 1002,
            DatabaseAlreadyExists(_) => 1003,
            InvalidTableName(_) => 1010,
            TableDoesNotExist { .. } => 1011,
            TableAlreadyExists { .. } => 1012,
            InvalidColumnName(_) => 1020,
            ColumnDoesNotExist { .. } => 1021,
            ColumnAlreadyExists { .. } => 1022,
            DuplicateColumnName(_) => 1023,
            CannotModifyMasterColumn => 1024,
            CannotModifySystemTable { .. } => 1025,
            ValuesCountMismatch { .. } => 1030,
            TooManyColumnsToInsert { .. } => 1031,
            CannotInsertNullValue { .. } => 1032,
            IncompatibleDataType { .. } => 1033,
            CannotInsertDuplicateTrid(_) => 1034,
            TridRangeExhausted { .. } => 1035,
            InvalidNextTrid { .. } => 1036,
            InvalidCipherKey(_) => 1040,
            CipherUnknown(_) => 1041,
            PermissionDenied => 1050,
        }
    }
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use self::UserError::*;
        match *self {
            InvalidDatabaseName(ref name) => write!(f, "invalid database name '{}'", name),
            DatabaseDoesNotExist(ref name) => write!(f, "database '{}' does not exist", name),
            DatabaseAlreadyExists(ref name) => write!(f, "database '{}' already exists", name),
            InvalidTableName(ref name) => write!(f, "invalid table name '{}'", name),
            TableDoesNotExist { ref database, ref table } => {
                write!(f, "table '{}'.'{}' does not exist", database, table)
            }
            TableAlreadyExists { ref database, ref table } => {
                write!(f, "table '{}'.'{}' already exists", database, table)
            }
            InvalidColumnName(ref name) => write!(f, "invalid column name '{}'", name),
            ColumnDoesNotExist { ref database, ref table, ref column } => {
                write!(f, "column '{}'.'{}'.'{}' does not exist", database, table, column)
            }
            ColumnAlreadyExists { ref database, ref table, ref column } => {
                write!(f, "column '{}'.'{}'.'{}' already exists", database, table, column)
            }
            DuplicateColumnName(ref name) => write!(f, "column '{}' specified more than once", name),
            CannotModifyMasterColumn => write!(f, "master column cannot be modified directly"),
            CannotModifySystemTable { ref database, ref table } => {
                write!(f, "system table '{}'.'{}' cannot be modified", database, table)
            }
            ValuesCountMismatch { expected, actual } => write!(
                f,
                "number of values ({}) does not match number of columns ({})",
                actual, expected
            ),
            TooManyColumnsToInsert { actual, limit } => write!(
                f,
                "too many columns or values ({}), at most {} allowed",
                actual, limit
            ),
            CannotInsertNullValue { ref database, ref table, ref column } => write!(
                f,
                "cannot insert NULL value into column '{}'.'{}'.'{}'",
                database, table, column
            ),
            IncompatibleDataType { ref column, column_type, ref cast } => write!(
                f,
                "incompatible value for column '{}' of type {}: {}",
                column, column_type, cast
            ),
            CannotInsertDuplicateTrid(trid) => {
                write!(f, "cannot insert duplicate row id {}", trid)
            }
            TridRangeExhausted { ref database, ref table } => {
                write!(f, "row id range exhausted in table '{}'.'{}'", database, table)
            }
            InvalidNextTrid { current, requested } => write!(
                f,
                "next row id {} must not be less than the current value {}",
                requested, current
            ),
            InvalidCipherKey(ref cipher) => write!(f, "invalid key for cipher {}", cipher),
            CipherUnknown(ref cipher) => write!(f, "unknown cipher {}", cipher),
            PermissionDenied => write!(f, "permission denied"),
        }
    }
}

/// Engine error.
#[derive(Debug)]
pub enum Error {
    /// User-visible; echoed to the client with its status code.
    User(UserError),
    /// Several user errors discovered by one request.
    Compound(Vec<UserError>),
    /// I/O failure; logged, client receives a generic message.
    Io { context: String, source: io::Error },
    /// Broken invariant or logic error; logged, client receives a generic
    /// message.
    Internal(String),
}

impl Error {
    pub fn io<C: Into<String>>(context: C, source: io::Error) -> Error {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn internal<M: Into<String>>(message: M) -> Error {
        Error::Internal(message.into())
    }

    pub fn is_user_error(&self) -> bool {
        matches!(*self, Error::User(_) | Error::Compound(_))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Error::User(ref e) => write!(f, "{}", e),
            Error::Compound(ref errors) => {
                for (i, e) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, "; ")?;
                    }
                    write!(f, "{}", e)?;
                }
                Ok(())
            }
            Error::Io {
                ref context,
                ref source,
            } => write!(f, "I/O error: {}: {}", context, source),
            Error::Internal(ref message) => write!(f, "internal error: {}", message),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match *self {
            Error::Io { ref source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<UserError> for Error {
    fn from(e: UserError) -> Error {
        Error::User(e)
    }
}

impl From<meridb_crypto::CryptoError> for Error {
    fn from(e: meridb_crypto::CryptoError) -> Error {
        match e {
            meridb_crypto::CryptoError::InvalidCipherKey { cipher_id, .. } => {
                Error::User(UserError::InvalidCipherKey(cipher_id.to_owned()))
            }
            meridb_crypto::CryptoError::CipherUnknown(id) => {
                Error::User(UserError::CipherUnknown(id))
            }
        }
    }
}

impl From<object_cache::CacheFull> for Error {
    fn from(_: object_cache::CacheFull) -> Error {
        Error::Internal("object cache is full and no entry can be evicted".to_owned())
    }
}
