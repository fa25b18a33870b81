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

use std::convert::TryFrom;
use std::fmt;
use std::io;

use crate::datetime::RawDateTime;

/// Forward-only stream of LOB bytes. CLOB streams yield UTF-8 text.
pub trait LobStream: Send {
    /// Number of bytes not yet consumed.
    fn remaining_size(&self) -> u64;

    /// Reads up to `buf.len()` bytes. Zero return at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Character large object stream.
pub type ClobStream = dyn LobStream;

/// Binary large object stream.
pub type BlobStream = dyn LobStream;

/// Kind discriminant of [`Value`], used in cast diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Null,
    Bool,
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Int64,
    UInt64,
    Float,
    Double,
    Text,
    Binary,
    DateTime,
    Clob,
    Blob,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Failed value coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CastError {
    pub from: ValueKind,
    pub to: ValueKind,
}

impl fmt::Display for CastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cannot cast {} value to {}", self.from, self.to)
    }
}

impl std::error::Error for CastError {}

/// A dynamically typed SQL value.
pub enum Value {
    Null,
    Bool(bool),
    Int8(i8),
    UInt8(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    Text(String),
    Binary(Vec<u8>),
    DateTime(RawDateTime),
    /// Large text, streamed.
    Clob(Box<ClobStream>),
    /// Large binary, streamed.
    Blob(Box<BlobStream>),
}

macro_rules! numeric_cast {
    ($name:ident, $ty:ty, $kind:ident) => {
        /// Coerces to the target integer type; fails on range overflow,
        /// unparsable text or non-numeric kinds.
        pub fn $name(&self) -> Result<$ty, CastError> {
            let err = CastError {
                from: self.kind(),
                to: ValueKind::$kind,
            };
            match *self {
                Value::Bool(v) => Ok(v as u8 as $ty),
                Value::Int8(v) => <$ty>::try_from(v).map_err(|_| err),
                Value::UInt8(v) => <$ty>::try_from(v).map_err(|_| err),
                Value::Int16(v) => <$ty>::try_from(v).map_err(|_| err),
                Value::UInt16(v) => <$ty>::try_from(v).map_err(|_| err),
                Value::Int32(v) => <$ty>::try_from(v).map_err(|_| err),
                Value::UInt32(v) => <$ty>::try_from(v).map_err(|_| err),
                Value::Int64(v) => <$ty>::try_from(v).map_err(|_| err),
                Value::UInt64(v) => <$ty>::try_from(v).map_err(|_| err),
                Value::Text(ref s) => s.trim().parse::<$ty>().map_err(|_| err),
                _ => Err(err),
            }
        }
    };
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match *self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int8(_) => ValueKind::Int8,
            Value::UInt8(_) => ValueKind::UInt8,
            Value::Int16(_) => ValueKind::Int16,
            Value::UInt16(_) => ValueKind::UInt16,
            Value::Int32(_) => ValueKind::Int32,
            Value::UInt32(_) => ValueKind::UInt32,
            Value::Int64(_) => ValueKind::Int64,
            Value::UInt64(_) => ValueKind::UInt64,
            Value::Float(_) => ValueKind::Float,
            Value::Double(_) => ValueKind::Double,
            Value::Text(_) => ValueKind::Text,
            Value::Binary(_) => ValueKind::Binary,
            Value::DateTime(_) => ValueKind::DateTime,
            Value::Clob(_) => ValueKind::Clob,
            Value::Blob(_) => ValueKind::Blob,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(*self, Value::Null)
    }

    numeric_cast!(to_i8, i8, Int8);
    numeric_cast!(to_u8, u8, UInt8);
    numeric_cast!(to_i16, i16, Int16);
    numeric_cast!(to_u16, u16, UInt16);
    numeric_cast!(to_i32, i32, Int32);
    numeric_cast!(to_u32, u32, UInt32);
    numeric_cast!(to_i64, i64, Int64);
    numeric_cast!(to_u64, u64, UInt64);

    /// Coerces to `bool`; accepts integers (non-zero is true).
    pub fn to_bool(&self) -> Result<bool, CastError> {
        let err = CastError {
            from: self.kind(),
            to: ValueKind::Bool,
        };
        match *self {
            Value::Bool(v) => Ok(v),
            Value::Int8(v) => Ok(v != 0),
            Value::UInt8(v) => Ok(v != 0),
            Value::Int16(v) => Ok(v != 0),
            Value::UInt16(v) => Ok(v != 0),
            Value::Int32(v) => Ok(v != 0),
            Value::UInt32(v) => Ok(v != 0),
            Value::Int64(v) => Ok(v != 0),
            Value::UInt64(v) => Ok(v != 0),
            _ => Err(err),
        }
    }

    pub fn to_f32(&self) -> Result<f32, CastError> {
        match *self {
            Value::Float(v) => Ok(v),
            Value::Double(v) => Ok(v as f32),
            Value::Text(ref s) => s.trim().parse::<f32>().map_err(|_| CastError {
                from: ValueKind::Text,
                to: ValueKind::Float,
            }),
            ref other => other.to_i64().map(|v| v as f32).map_err(|_| CastError {
                from: other.kind(),
                to: ValueKind::Float,
            }),
        }
    }

    pub fn to_f64(&self) -> Result<f64, CastError> {
        match *self {
            Value::Float(v) => Ok(f64::from(v)),
            Value::Double(v) => Ok(v),
            Value::Text(ref s) => s.trim().parse::<f64>().map_err(|_| CastError {
                from: ValueKind::Text,
                to: ValueKind::Double,
            }),
            ref other => other.to_i64().map(|v| v as f64).map_err(|_| CastError {
                from: other.kind(),
                to: ValueKind::Double,
            }),
        }
    }

    pub fn to_datetime(&self) -> Result<RawDateTime, CastError> {
        match *self {
            Value::DateTime(v) => Ok(v),
            ref other => Err(CastError {
                from: other.kind(),
                to: ValueKind::DateTime,
            }),
        }
    }

    /// Coerces into owned text. Scalars render with their display form,
    /// binary must be valid UTF-8.
    pub fn into_string(self) -> Result<String, CastError> {
        let from = self.kind();
        let err = CastError {
            from,
            to: ValueKind::Text,
        };
        match self {
            Value::Text(s) => Ok(s),
            Value::Bool(v) => Ok(v.to_string()),
            Value::Int8(v) => Ok(v.to_string()),
            Value::UInt8(v) => Ok(v.to_string()),
            Value::Int16(v) => Ok(v.to_string()),
            Value::UInt16(v) => Ok(v.to_string()),
            Value::Int32(v) => Ok(v.to_string()),
            Value::UInt32(v) => Ok(v.to_string()),
            Value::Int64(v) => Ok(v.to_string()),
            Value::UInt64(v) => Ok(v.to_string()),
            Value::Float(v) => Ok(v.to_string()),
            Value::Double(v) => Ok(v.to_string()),
            Value::DateTime(v) => Ok(v.to_string()),
            Value::Binary(v) => String::from_utf8(v).map_err(|_| err),
            _ => Err(err),
        }
    }

    /// Clones the value when it is not a stream; LOB streams are
    /// forward-only and cannot be duplicated.
    pub fn try_clone(&self) -> Option<Value> {
        Some(match *self {
            Value::Null => Value::Null,
            Value::Bool(v) => Value::Bool(v),
            Value::Int8(v) => Value::Int8(v),
            Value::UInt8(v) => Value::UInt8(v),
            Value::Int16(v) => Value::Int16(v),
            Value::UInt16(v) => Value::UInt16(v),
            Value::Int32(v) => Value::Int32(v),
            Value::UInt32(v) => Value::UInt32(v),
            Value::Int64(v) => Value::Int64(v),
            Value::UInt64(v) => Value::UInt64(v),
            Value::Float(v) => Value::Float(v),
            Value::Double(v) => Value::Double(v),
            Value::Text(ref v) => Value::Text(v.clone()),
            Value::Binary(ref v) => Value::Binary(v.clone()),
            Value::DateTime(v) => Value::DateTime(v),
            Value::Clob(_) | Value::Blob(_) => return None,
        })
    }

    /// Coerces into an owned byte buffer.
    pub fn into_bytes(self) -> Result<Vec<u8>, CastError> {
        let err = CastError {
            from: self.kind(),
            to: ValueKind::Binary,
        };
        match self {
            Value::Binary(v) => Ok(v),
            Value::Text(s) => Ok(s.into_bytes()),
            _ => Err(err),
        }
    }
}

impl Value {
    /// Appends a self-describing binary encoding: a kind tag followed by
    /// the payload. Stream values cannot be encoded and report `false`.
    pub fn encode_to(&self, out: &mut Vec<u8>) -> bool {
        use crate::pbe;
        match *self {
            Value::Null => out.push(0),
            Value::Bool(v) => {
                out.push(1);
                out.push(v as u8);
            }
            Value::Int8(v) => {
                out.push(2);
                out.push(v as u8);
            }
            Value::UInt8(v) => {
                out.push(3);
                out.push(v);
            }
            Value::Int16(v) => {
                out.push(4);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::UInt16(v) => {
                out.push(5);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Int32(v) => {
                out.push(6);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::UInt32(v) => {
                out.push(7);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Int64(v) => {
                out.push(8);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::UInt64(v) => {
                out.push(9);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Float(v) => {
                out.push(10);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Double(v) => {
                out.push(11);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Text(ref s) => {
                out.push(12);
                pbe::encode_varuint64(s.len() as u64, out);
                out.extend_from_slice(s.as_bytes());
            }
            Value::Binary(ref b) => {
                out.push(13);
                pbe::encode_varuint64(b.len() as u64, out);
                out.extend_from_slice(b);
            }
            Value::DateTime(ref dt) => {
                out.push(14);
                let mut buf = [0u8; RawDateTime::MAX_SERIALIZED_SIZE];
                let n = dt.serialize(&mut buf);
                out.extend_from_slice(&buf[..n]);
            }
            Value::Clob(_) | Value::Blob(_) => return false,
        }
        true
    }

    /// Decodes a value previously written by [`Value::encode_to`]. Returns
    /// the value and the number of consumed bytes.
    pub fn decode_from(buf: &[u8]) -> Option<(Value, usize)> {
        use crate::pbe;
        let tag = *buf.first()?;
        let body = &buf[1..];
        let fixed = |n: usize| -> Option<&[u8]> {
            if body.len() >= n {
                Some(&body[..n])
            } else {
                None
            }
        };
        Some(match tag {
            0 => (Value::Null, 1),
            1 => (Value::Bool(*body.first()? != 0), 2),
            2 => (Value::Int8(*body.first()? as i8), 2),
            3 => (Value::UInt8(*body.first()?), 2),
            4 => {
                let mut b = [0u8; 2];
                b.copy_from_slice(fixed(2)?);
                (Value::Int16(i16::from_le_bytes(b)), 3)
            }
            5 => {
                let mut b = [0u8; 2];
                b.copy_from_slice(fixed(2)?);
                (Value::UInt16(u16::from_le_bytes(b)), 3)
            }
            6 => {
                let mut b = [0u8; 4];
                b.copy_from_slice(fixed(4)?);
                (Value::Int32(i32::from_le_bytes(b)), 5)
            }
            7 => {
                let mut b = [0u8; 4];
                b.copy_from_slice(fixed(4)?);
                (Value::UInt32(u32::from_le_bytes(b)), 5)
            }
            8 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(fixed(8)?);
                (Value::Int64(i64::from_le_bytes(b)), 9)
            }
            9 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(fixed(8)?);
                (Value::UInt64(u64::from_le_bytes(b)), 9)
            }
            10 => {
                let mut b = [0u8; 4];
                b.copy_from_slice(fixed(4)?);
                (Value::Float(f32::from_le_bytes(b)), 5)
            }
            11 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(fixed(8)?);
                (Value::Double(f64::from_le_bytes(b)), 9)
            }
            12 => {
                let (len, n) = pbe::decode_varuint64(body)?;
                let len = len as usize;
                let bytes = body.get(n..n + len)?;
                (
                    Value::Text(String::from_utf8(bytes.to_vec()).ok()?),
                    1 + n + len,
                )
            }
            13 => {
                let (len, n) = pbe::decode_varuint64(body)?;
                let len = len as usize;
                let bytes = body.get(n..n + len)?;
                (Value::Binary(bytes.to_vec()), 1 + n + len)
            }
            14 => {
                let mut dt = RawDateTime::deserialize_date_part(fixed(4)?);
                if dt.has_time_part {
                    dt.deserialize_time_part(&fixed(12)?[4..]);
                    (Value::DateTime(dt), 13)
                } else {
                    (Value::DateTime(dt), 5)
                }
            }
            _ => return None,
        })
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Value::Null => write!(f, "Null"),
            Value::Bool(v) => write!(f, "Bool({})", v),
            Value::Int8(v) => write!(f, "Int8({})", v),
            Value::UInt8(v) => write!(f, "UInt8({})", v),
            Value::Int16(v) => write!(f, "Int16({})", v),
            Value::UInt16(v) => write!(f, "UInt16({})", v),
            Value::Int32(v) => write!(f, "Int32({})", v),
            Value::UInt32(v) => write!(f, "UInt32({})", v),
            Value::Int64(v) => write!(f, "Int64({})", v),
            Value::UInt64(v) => write!(f, "UInt64({})", v),
            Value::Float(v) => write!(f, "Float({})", v),
            Value::Double(v) => write!(f, "Double({})", v),
            Value::Text(ref v) => write!(f, "Text({:?})", v),
            Value::Binary(ref v) => write!(f, "Binary({} bytes)", v.len()),
            Value::DateTime(ref v) => write!(f, "DateTime({})", v),
            Value::Clob(ref v) => write!(f, "Clob({} bytes)", v.remaining_size()),
            Value::Blob(ref v) => write!(f, "Blob({} bytes)", v.remaining_size()),
        }
    }
}

// Stream variants never compare equal; everything else compares by content.
impl PartialEq for Value {
    fn eq(&self, other: &Value) -> bool {
        use self::Value::*;
        match (self, other) {
            (Null, Null) => true,
            (Bool(a), Bool(b)) => a == b,
            (Int8(a), Int8(b)) => a == b,
            (UInt8(a), UInt8(b)) => a == b,
            (Int16(a), Int16(b)) => a == b,
            (UInt16(a), UInt16(b)) => a == b,
            (Int32(a), Int32(b)) => a == b,
            (UInt32(a), UInt32(b)) => a == b,
            (Int64(a), Int64(b)) => a == b,
            (UInt64(a), UInt64(b)) => a == b,
            (Float(a), Float(b)) => a == b,
            (Double(a), Double(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Binary(a), Binary(b)) => a == b,
            (DateTime(a), DateTime(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Value, ValueKind};

    #[test]
    fn numeric_casts_check_range() {
        assert_eq!(Value::Int32(300).to_u8().unwrap_err().to, ValueKind::UInt8);
        assert_eq!(Value::Int32(255).to_u8().unwrap(), 255);
        assert_eq!(Value::UInt64(u64::max_value()).to_i64().is_err(), true);
    }

    #[test]
    fn text_parses_to_numbers() {
        assert_eq!(Value::Text("42".into()).to_i32().unwrap(), 42);
        assert!(Value::Text("not-a-number".into()).to_i32().is_err());
    }

    #[test]
    fn scalars_render_to_text() {
        assert_eq!(Value::Int32(-7).into_string().unwrap(), "-7");
        assert_eq!(Value::Bool(true).into_string().unwrap(), "true");
    }

    #[test]
    fn binary_text_coercions() {
        assert_eq!(
            Value::Text("abc".into()).into_bytes().unwrap(),
            b"abc".to_vec()
        );
        assert!(Value::Binary(vec![0xff, 0xfe]).into_string().is_err());
    }
}
