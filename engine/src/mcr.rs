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

//! Master column record: the versioned per-row header written into the
//! master column. Serialized with a varint size tag followed by
//! varint-encoded fields; older row versions are reachable through
//! `prev_mcr_address`, terminating at the null address.

use std::fmt;

use meridb_types::pbe;
use meridb_types::ColumnDataAddress;

use crate::defs::MAX_MCR_SIZE;

/// Row operation kind recorded in a master column record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DmlOperation {
    Insert = 0,
    Update = 1,
    Delete = 2,
}

impl DmlOperation {
    pub fn from_code(code: u8) -> Option<DmlOperation> {
        Some(match code {
            0 => DmlOperation::Insert,
            1 => DmlOperation::Update,
            2 => DmlOperation::Delete,
            _ => return None,
        })
    }
}

/// Location and timestamps of one column value of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnRecord {
    pub address: ColumnDataAddress,
    pub create_timestamp: i64,
    pub update_timestamp: i64,
}

/// Master column record.
#[derive(Debug, Clone, PartialEq)]
pub struct MasterColumnRecord {
    pub trid: u64,
    pub transaction_id: u64,
    pub create_timestamp: i64,
    pub update_timestamp: i64,
    pub version: u32,
    pub atomic_op_id: u64,
    pub operation: DmlOperation,
    pub user_id: u32,
    pub column_set_id: u64,
    pub prev_mcr_address: ColumnDataAddress,
    pub column_records: Vec<ColumnRecord>,
}

/// Serialization failed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McrFormatError(pub String);

impl fmt::Display for McrFormatError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed master column record: {}", self.0)
    }
}

impl std::error::Error for McrFormatError {}

fn put_address(addr: &ColumnDataAddress, out: &mut Vec<u8>) {
    pbe::encode_varuint64(addr.block_id, out);
    pbe::encode_varuint64(u64::from(addr.offset), out);
}

struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take_varuint(&mut self) -> Result<u64, McrFormatError> {
        let (value, n) = pbe::decode_varuint64(&self.buf[self.pos..])
            .ok_or_else(|| McrFormatError("truncated varint".into()))?;
        self.pos += n;
        Ok(value)
    }

    fn take_u8(&mut self) -> Result<u8, McrFormatError> {
        if self.pos >= self.buf.len() {
            return Err(McrFormatError("truncated record".into()));
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn take_address(&mut self) -> Result<ColumnDataAddress, McrFormatError> {
        let block_id = self.take_varuint()?;
        let offset = self.take_varuint()?;
        if offset > u64::from(u32::max_value()) {
            return Err(McrFormatError("address offset out of range".into()));
        }
        Ok(ColumnDataAddress::new(block_id, offset as u32))
    }
}

impl MasterColumnRecord {
    /// Size of the serialized body, without the size tag.
    pub fn serialized_size(&self) -> usize {
        let mut n = pbe::varuint64_size(self.trid)
            + pbe::varuint64_size(self.transaction_id)
            + pbe::varuint64_size(self.create_timestamp as u64)
            + pbe::varuint64_size(self.update_timestamp as u64)
            + pbe::varuint64_size(u64::from(self.version))
            + pbe::varuint64_size(self.atomic_op_id)
            + 1
            + pbe::varuint64_size(u64::from(self.user_id))
            + pbe::varuint64_size(self.column_set_id)
            + pbe::varuint64_size(self.prev_mcr_address.block_id)
            + pbe::varuint64_size(u64::from(self.prev_mcr_address.offset))
            + pbe::varuint64_size(self.column_records.len() as u64);
        for r in &self.column_records {
            n += pbe::varuint64_size(r.address.block_id)
                + pbe::varuint64_size(u64::from(r.address.offset))
                + pbe::varuint64_size(r.create_timestamp as u64)
                + pbe::varuint64_size(r.update_timestamp as u64);
        }
        n
    }

    /// Full size on disk: size tag plus body.
    pub fn serialized_size_with_tag(&self) -> usize {
        let body = self.serialized_size();
        pbe::varuint64_size(body as u64) + body
    }

    /// Serializes with the leading size tag. Fails if the record exceeds
    /// [`MAX_MCR_SIZE`].
    pub fn serialize(&self) -> Result<Vec<u8>, McrFormatError> {
        let body_size = self.serialized_size();
        if pbe::varuint64_size(body_size as u64) + body_size > MAX_MCR_SIZE {
            return Err(McrFormatError(format!(
                "record of {} bytes exceeds the {} byte limit",
                body_size, MAX_MCR_SIZE
            )));
        }
        let mut out = Vec::with_capacity(self.serialized_size_with_tag());
        pbe::encode_varuint64(body_size as u64, &mut out);
        pbe::encode_varuint64(self.trid, &mut out);
        pbe::encode_varuint64(self.transaction_id, &mut out);
        pbe::encode_varuint64(self.create_timestamp as u64, &mut out);
        pbe::encode_varuint64(self.update_timestamp as u64, &mut out);
        pbe::encode_varuint64(u64::from(self.version), &mut out);
        pbe::encode_varuint64(self.atomic_op_id, &mut out);
        out.push(self.operation as u8);
        pbe::encode_varuint64(u64::from(self.user_id), &mut out);
        pbe::encode_varuint64(self.column_set_id, &mut out);
        put_address(&self.prev_mcr_address, &mut out);
        pbe::encode_varuint64(self.column_records.len() as u64, &mut out);
        for r in &self.column_records {
            put_address(&r.address, &mut out);
            pbe::encode_varuint64(r.create_timestamp as u64, &mut out);
            pbe::encode_varuint64(r.update_timestamp as u64, &mut out);
        }
        debug_assert_eq!(out.len(), self.serialized_size_with_tag());
        Ok(out)
    }

    /// Deserializes a record body (the size tag has been consumed by the
    /// caller).
    pub fn deserialize(body: &[u8]) -> Result<MasterColumnRecord, McrFormatError> {
        let mut c = Cursor { buf: body, pos: 0 };
        let trid = c.take_varuint()?;
        let transaction_id = c.take_varuint()?;
        let create_timestamp = c.take_varuint()? as i64;
        let update_timestamp = c.take_varuint()? as i64;
        let version = c.take_varuint()?;
        if version > u64::from(u32::max_value()) {
            return Err(McrFormatError("version out of range".into()));
        }
        let atomic_op_id = c.take_varuint()?;
        let operation = DmlOperation::from_code(c.take_u8()?)
            .ok_or_else(|| McrFormatError("invalid operation code".into()))?;
        let user_id = c.take_varuint()?;
        if user_id > u64::from(u32::max_value()) {
            return Err(McrFormatError("user id out of range".into()));
        }
        let column_set_id = c.take_varuint()?;
        let prev_mcr_address = c.take_address()?;
        let count = c.take_varuint()? as usize;
        if count > MAX_MCR_SIZE {
            return Err(McrFormatError("column record count out of range".into()));
        }
        let mut column_records = Vec::with_capacity(count);
        for _ in 0..count {
            let address = c.take_address()?;
            let create_timestamp = c.take_varuint()? as i64;
            let update_timestamp = c.take_varuint()? as i64;
            column_records.push(ColumnRecord {
                address,
                create_timestamp,
                update_timestamp,
            });
        }
        if c.pos != body.len() {
            return Err(McrFormatError("trailing bytes after record".into()));
        }
        Ok(MasterColumnRecord {
            trid,
            transaction_id,
            create_timestamp,
            update_timestamp,
            version: version as u32,
            atomic_op_id,
            operation,
            user_id: user_id as u32,
            column_set_id,
            prev_mcr_address,
            column_records,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{ColumnRecord, DmlOperation, MasterColumnRecord};
    use meridb_types::pbe;
    use meridb_types::{ColumnDataAddress, NULL_ADDRESS};

    fn sample() -> MasterColumnRecord {
        MasterColumnRecord {
            trid: 42,
            transaction_id: 7,
            create_timestamp: 1_600_000_000,
            update_timestamp: 1_600_000_123,
            version: 3,
            atomic_op_id: 99,
            operation: DmlOperation::Update,
            user_id: 1,
            column_set_id: 2,
            prev_mcr_address: ColumnDataAddress::new(5, 1024),
            column_records: vec![
                ColumnRecord {
                    address: ColumnDataAddress::new(1, 0),
                    create_timestamp: 1_600_000_000,
                    update_timestamp: 1_600_000_000,
                },
                ColumnRecord {
                    address: NULL_ADDRESS,
                    create_timestamp: 1_600_000_000,
                    update_timestamp: 1_600_000_123,
                },
            ],
        }
    }

    #[test]
    fn serialize_roundtrip() {
        let record = sample();
        let bytes = record.serialize().unwrap();
        assert_eq!(bytes.len(), record.serialized_size_with_tag());

        let (body_size, tag_len) = pbe::decode_varuint64(&bytes).unwrap();
        assert_eq!(tag_len + body_size as usize, bytes.len());
        let decoded = MasterColumnRecord::deserialize(&bytes[tag_len..]).unwrap();
        assert_eq!(decoded, record);
    }

    #[test]
    fn truncated_record_is_rejected() {
        let bytes = sample().serialize().unwrap();
        let (_, tag_len) = pbe::decode_varuint64(&bytes).unwrap();
        let body = &bytes[tag_len..];
        assert!(MasterColumnRecord::deserialize(&body[..body.len() - 1]).is_err());
    }

    #[test]
    fn oversized_record_is_rejected() {
        let mut record = sample();
        record.column_records = (0..2000)
            .map(|i| ColumnRecord {
                address: ColumnDataAddress::new(u64::max_value() - i, u32::max_value()),
                create_timestamp: i64::max_value(),
                update_timestamp: i64::max_value(),
            })
            .collect();
        assert!(record.serialize().is_err());
    }
}
