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

//! Engine responses and the rowset encoding.
//!
//! A response message is followed by zero or more rows, each prefixed by a
//! varint row length (zero terminates the rowset). When any selected
//! column is nullable, each row starts with a null bitmask of
//! `ceil(column_count / 8)` bytes, LSB first; column values follow in
//! their plain binary record encodings, TEXT/BINARY with a varint length
//! prefix.

use std::io::{self, Write};

use meridb_types::{pbe, ColumnDataType, RawDateTime, Value};

use crate::{put_string, MessageType, Reader, WireError};

/// Description of one result set column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnDescription {
    pub name: String,
    pub data_type: ColumnDataType,
    pub nullable: bool,
}

/// One status line of a response; code zero is success.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusMessage {
    pub code: u32,
    pub text: String,
}

/// Response to one engine request.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseEngineResponse {
    pub request_id: u64,
    pub response_id: u32,
    pub response_count: u32,
    pub affected_row_count: Option<u64>,
    pub columns: Vec<ColumnDescription>,
    pub messages: Vec<StatusMessage>,
}

impl DatabaseEngineResponse {
    pub fn new(request_id: u64) -> DatabaseEngineResponse {
        DatabaseEngineResponse {
            request_id,
            response_count: 1,
            ..Default::default()
        }
    }

    /// Whether the rowset that follows carries a null bitmask.
    pub fn has_null_bitmask(&self) -> bool {
        self.columns.iter().any(|c| c.nullable)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(64);
        pbe::encode_varuint64(self.request_id, &mut out);
        pbe::encode_varuint64(u64::from(self.response_id), &mut out);
        pbe::encode_varuint64(u64::from(self.response_count), &mut out);
        match self.affected_row_count {
            Some(count) => {
                out.push(1);
                pbe::encode_varuint64(count, &mut out);
            }
            None => out.push(0),
        }
        pbe::encode_varuint64(self.columns.len() as u64, &mut out);
        for column in &self.columns {
            put_string(&column.name, &mut out);
            out.push(column.data_type as u8);
            out.push(column.nullable as u8);
        }
        pbe::encode_varuint64(self.messages.len() as u64, &mut out);
        for message in &self.messages {
            pbe::encode_varuint64(u64::from(message.code), &mut out);
            put_string(&message.text, &mut out);
        }
        out
    }

    pub fn decode(payload: &[u8]) -> Result<DatabaseEngineResponse, WireError> {
        let mut r = Reader::new(payload);
        let request_id = r.varuint()?;
        let response_id = r.varuint()? as u32;
        let response_count = r.varuint()? as u32;
        let affected_row_count = if r.byte()? != 0 {
            Some(r.varuint()?)
        } else {
            None
        };
        let column_count = r.varuint()? as usize;
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            let name = r.string()?;
            let data_type = ColumnDataType::from_code(r.byte()?)
                .ok_or_else(|| WireError("invalid column data type".to_owned()))?;
            let nullable = r.byte()? != 0;
            columns.push(ColumnDescription {
                name,
                data_type,
                nullable,
            });
        }
        let message_count = r.varuint()? as usize;
        let mut messages = Vec::with_capacity(message_count);
        for _ in 0..message_count {
            let code = r.varuint()? as u32;
            let text = r.string()?;
            messages.push(StatusMessage { code, text });
        }
        r.expect_end()?;
        Ok(DatabaseEngineResponse {
            request_id,
            response_id,
            response_count,
            affected_row_count,
            columns,
            messages,
        })
    }
}

/// Streams a rowset after its response message.
pub struct RowsetWriter<'a, W: Write> {
    out: &'a mut W,
    columns: Vec<ColumnDescription>,
    with_null_bitmask: bool,
    row_buf: Vec<u8>,
}

impl<'a, W: Write> RowsetWriter<'a, W> {
    /// Writes the `ServerResponse` message and prepares for rows.
    pub fn begin(out: &'a mut W, response: &DatabaseEngineResponse) -> io::Result<RowsetWriter<'a, W>> {
        crate::write_message(out, MessageType::ServerResponse, &response.encode())?;
        Ok(RowsetWriter {
            out,
            columns: response.columns.clone(),
            with_null_bitmask: response.has_null_bitmask(),
            row_buf: Vec::with_capacity(256),
        })
    }

    /// Writes one row; values must match the response's column list.
    pub fn write_row(&mut self, values: Vec<Value>) -> io::Result<()> {
        debug_assert_eq!(values.len(), self.columns.len());
        self.row_buf.clear();
        if self.with_null_bitmask {
            let mut bitmask = vec![0u8; (self.columns.len() + 7) / 8];
            for (i, value) in values.iter().enumerate() {
                if value.is_null() {
                    bitmask[i / 8] |= 1 << (i % 8);
                }
            }
            self.row_buf.extend_from_slice(&bitmask);
        }
        for (value, column) in values.into_iter().zip(self.columns.iter()) {
            if value.is_null() {
                continue;
            }
            encode_row_value(value, column.data_type, &mut self.row_buf)?;
        }

        let mut length = Vec::with_capacity(pbe::MAX_VARINT64_SIZE);
        pbe::encode_varuint64(self.row_buf.len() as u64, &mut length);
        self.out.write_all(&length)?;
        self.out.write_all(&self.row_buf)
    }

    /// Terminates the rowset with a zero row length.
    pub fn finish(self) -> io::Result<()> {
        self.out.write_all(&[0])?;
        self.out.flush()
    }
}

// Encodes one column value in its record format: little-endian scalars,
// varint-length-prefixed TEXT/BINARY, packed date-time.
fn encode_row_value(value: Value, data_type: ColumnDataType, out: &mut Vec<u8>) -> io::Result<()> {
    let mut buf = [0u8; 12];
    let cast_err =
        |e: meridb_types::CastError| io::Error::new(io::ErrorKind::InvalidInput, e.to_string());
    match data_type {
        ColumnDataType::Bool => out.push(value.to_bool().map_err(cast_err)? as u8),
        ColumnDataType::Int8 => out.push(value.to_i8().map_err(cast_err)? as u8),
        ColumnDataType::UInt8 => out.push(value.to_u8().map_err(cast_err)?),
        ColumnDataType::Int16 => {
            pbe::encode_u16(value.to_i16().map_err(cast_err)? as u16, &mut buf[..2]);
            out.extend_from_slice(&buf[..2]);
        }
        ColumnDataType::UInt16 => {
            pbe::encode_u16(value.to_u16().map_err(cast_err)?, &mut buf[..2]);
            out.extend_from_slice(&buf[..2]);
        }
        ColumnDataType::Int32 => {
            pbe::encode_u32(value.to_i32().map_err(cast_err)? as u32, &mut buf[..4]);
            out.extend_from_slice(&buf[..4]);
        }
        ColumnDataType::UInt32 => {
            pbe::encode_u32(value.to_u32().map_err(cast_err)?, &mut buf[..4]);
            out.extend_from_slice(&buf[..4]);
        }
        ColumnDataType::Int64 => {
            pbe::encode_i64(value.to_i64().map_err(cast_err)?, &mut buf[..8]);
            out.extend_from_slice(&buf[..8]);
        }
        ColumnDataType::UInt64 => {
            pbe::encode_u64(value.to_u64().map_err(cast_err)?, &mut buf[..8]);
            out.extend_from_slice(&buf[..8]);
        }
        ColumnDataType::Float => {
            pbe::encode_f32(value.to_f32().map_err(cast_err)?, &mut buf[..4]);
            out.extend_from_slice(&buf[..4]);
        }
        ColumnDataType::Double => {
            pbe::encode_f64(value.to_f64().map_err(cast_err)?, &mut buf[..8]);
            out.extend_from_slice(&buf[..8]);
        }
        ColumnDataType::Timestamp => {
            let dt = value.to_datetime().map_err(cast_err)?;
            let n = dt.serialize(&mut buf);
            out.extend_from_slice(&buf[..n]);
        }
        ColumnDataType::Text | ColumnDataType::Binary => match value {
            Value::Text(s) => crate::put_bytes(s.as_bytes(), out),
            Value::Binary(b) => crate::put_bytes(&b, out),
            Value::Clob(mut stream) | Value::Blob(mut stream) => {
                let total = stream.remaining_size();
                pbe::encode_varuint64(total, out);
                let start = out.len();
                out.resize(start + total as usize, 0);
                let mut done = 0usize;
                while (done as u64) < total {
                    let n = stream.read(&mut out[start + done..])?;
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "LOB stream ended early",
                        ));
                    }
                    done += n;
                }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot encode {:?} as a LOB column", other),
                ))
            }
        },
    }
    Ok(())
}

/// Decodes one row from a rowset payload. Intended for clients and tests.
pub fn decode_row(
    payload: &[u8],
    columns: &[ColumnDescription],
    with_null_bitmask: bool,
) -> Result<Vec<Value>, WireError> {
    let mut pos = 0usize;
    let mut nulls = vec![false; columns.len()];
    if with_null_bitmask {
        let mask_len = (columns.len() + 7) / 8;
        if payload.len() < mask_len {
            return Err(WireError("row shorter than its null bitmask".to_owned()));
        }
        for (i, is_null) in nulls.iter_mut().enumerate() {
            *is_null = payload[i / 8] & (1 << (i % 8)) != 0;
        }
        pos = mask_len;
    }

    let mut values = Vec::with_capacity(columns.len());
    for (column, &is_null) in columns.iter().zip(nulls.iter()) {
        if is_null {
            values.push(Value::Null);
            continue;
        }
        let remaining = &payload[pos..];
        let take = |n: usize| -> Result<&[u8], WireError> {
            remaining
                .get(..n)
                .ok_or_else(|| WireError("truncated row".to_owned()))
        };
        match column.data_type {
            ColumnDataType::Bool => {
                values.push(Value::Bool(take(1)?[0] != 0));
                pos += 1;
            }
            ColumnDataType::Int8 => {
                values.push(Value::Int8(take(1)?[0] as i8));
                pos += 1;
            }
            ColumnDataType::UInt8 => {
                values.push(Value::UInt8(take(1)?[0]));
                pos += 1;
            }
            ColumnDataType::Int16 => {
                values.push(Value::Int16(pbe::decode_u16(take(2)?) as i16));
                pos += 2;
            }
            ColumnDataType::UInt16 => {
                values.push(Value::UInt16(pbe::decode_u16(take(2)?)));
                pos += 2;
            }
            ColumnDataType::Int32 => {
                values.push(Value::Int32(pbe::decode_u32(take(4)?) as i32));
                pos += 4;
            }
            ColumnDataType::UInt32 => {
                values.push(Value::UInt32(pbe::decode_u32(take(4)?)));
                pos += 4;
            }
            ColumnDataType::Int64 => {
                values.push(Value::Int64(pbe::decode_i64(take(8)?)));
                pos += 8;
            }
            ColumnDataType::UInt64 => {
                values.push(Value::UInt64(pbe::decode_u64(take(8)?)));
                pos += 8;
            }
            ColumnDataType::Float => {
                values.push(Value::Float(pbe::decode_f32(take(4)?)));
                pos += 4;
            }
            ColumnDataType::Double => {
                values.push(Value::Double(pbe::decode_f64(take(8)?)));
                pos += 8;
            }
            ColumnDataType::Timestamp => {
                let mut dt = RawDateTime::deserialize_date_part(take(4)?);
                if dt.has_time_part {
                    dt.deserialize_time_part(&take(12)?[4..]);
                    pos += 12;
                } else {
                    pos += 4;
                }
                values.push(Value::DateTime(dt));
            }
            ColumnDataType::Text | ColumnDataType::Binary => {
                let (len, n) = pbe::decode_varuint64(remaining)
                    .ok_or_else(|| WireError("truncated row".to_owned()))?;
                let len = len as usize;
                let bytes = remaining
                    .get(n..n + len)
                    .ok_or_else(|| WireError("truncated row".to_owned()))?;
                if column.data_type == ColumnDataType::Text {
                    values.push(Value::Text(
                        String::from_utf8(bytes.to_vec())
                            .map_err(|_| WireError("row text is not UTF-8".to_owned()))?,
                    ));
                } else {
                    values.push(Value::Binary(bytes.to_vec()));
                }
                pos += n + len;
            }
        }
    }
    if pos != payload.len() {
        return Err(WireError("trailing bytes after row".to_owned()));
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn columns() -> Vec<ColumnDescription> {
        vec![
            ColumnDescription {
                name: "TRID".to_owned(),
                data_type: ColumnDataType::UInt64,
                nullable: false,
            },
            ColumnDescription {
                name: "A".to_owned(),
                data_type: ColumnDataType::Int32,
                nullable: true,
            },
            ColumnDescription {
                name: "B".to_owned(),
                data_type: ColumnDataType::Text,
                nullable: true,
            },
        ]
    }

    #[test]
    fn response_roundtrip() {
        let response = DatabaseEngineResponse {
            request_id: 5,
            response_id: 0,
            response_count: 1,
            affected_row_count: Some(2),
            columns: columns(),
            messages: vec![StatusMessage {
                code: 1033,
                text: "incompatible value".to_owned(),
            }],
        };
        let decoded = DatabaseEngineResponse::decode(&response.encode()).unwrap();
        assert_eq!(decoded, response);
    }

    #[test]
    fn rowset_roundtrip_with_nulls() {
        let response = DatabaseEngineResponse {
            request_id: 1,
            response_count: 1,
            columns: columns(),
            ..Default::default()
        };

        let mut wire = Vec::new();
        {
            let mut writer = RowsetWriter::begin(&mut wire, &response).unwrap();
            writer
                .write_row(vec![
                    Value::UInt64(1),
                    Value::Int32(-5),
                    Value::Text("hello".to_owned()),
                ])
                .unwrap();
            writer
                .write_row(vec![Value::UInt64(2), Value::Null, Value::Null])
                .unwrap();
            writer.finish().unwrap();
        }

        let mut cursor = std::io::Cursor::new(wire);
        let (message_type, payload) = crate::read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(message_type, MessageType::ServerResponse);
        let decoded = DatabaseEngineResponse::decode(&payload).unwrap();
        assert!(decoded.has_null_bitmask());

        // Row 1.
        use std::io::Read;
        let mut row_len = [0u8; 1];
        cursor.read_exact(&mut row_len).unwrap();
        let mut row = vec![0u8; row_len[0] as usize];
        cursor.read_exact(&mut row).unwrap();
        let values = decode_row(&row, &decoded.columns, true).unwrap();
        assert_eq!(values[0], Value::UInt64(1));
        assert_eq!(values[1], Value::Int32(-5));
        assert_eq!(values[2], Value::Text("hello".to_owned()));

        // Row 2 has nulls marked in the bitmask.
        cursor.read_exact(&mut row_len).unwrap();
        let mut row = vec![0u8; row_len[0] as usize];
        cursor.read_exact(&mut row).unwrap();
        let values = decode_row(&row, &decoded.columns, true).unwrap();
        assert_eq!(values[0], Value::UInt64(2));
        assert!(values[1].is_null());
        assert!(values[2].is_null());

        // End-of-rows marker.
        cursor.read_exact(&mut row_len).unwrap();
        assert_eq!(row_len[0], 0);
    }
}
