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

//! Wire protocol: length-prefixed framed messages (1-byte type tag plus a
//! varint length), the parsed request model produced by the upstream SQL
//! layer, and the response/rowset encoding.

use std::fmt;
use std::io::{self, Read, Write};

use meridb_types::pbe;

mod requests;
mod responses;

pub use crate::requests::{
    ColumnDefinition, CreateDatabaseRequest, CreateTableRequest, DbeRequest, DeleteRequest,
    InsertRequest, RowFilter, SelectRequest, SetNextTridRequest, UpdateRequest,
};
pub use crate::responses::{
    decode_row, ColumnDescription, DatabaseEngineResponse, RowsetWriter, StatusMessage,
};

/// Largest accepted message payload.
pub const MAX_MESSAGE_SIZE: usize = 0x100_0000;

/// Framed message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    Command = 1,
    ServerResponse = 2,
    BeginSessionRequest = 3,
    BeginSessionResponse = 4,
    ClientAuthenticationRequest = 5,
    ClientAuthenticationResponse = 6,
}

impl MessageType {
    pub fn from_tag(tag: u8) -> Option<MessageType> {
        Some(match tag {
            1 => MessageType::Command,
            2 => MessageType::ServerResponse,
            3 => MessageType::BeginSessionRequest,
            4 => MessageType::BeginSessionResponse,
            5 => MessageType::ClientAuthenticationRequest,
            6 => MessageType::ClientAuthenticationResponse,
            _ => return None,
        })
    }
}

/// Wire decoding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireError(pub String);

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire protocol error: {}", self.0)
    }
}

impl std::error::Error for WireError {}

impl From<WireError> for io::Error {
    fn from(e: WireError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Writes one framed message: type tag, varint payload length, payload.
pub fn write_message<W: Write>(
    out: &mut W,
    message_type: MessageType,
    payload: &[u8],
) -> io::Result<()> {
    let mut header = Vec::with_capacity(1 + pbe::MAX_VARINT64_SIZE);
    header.push(message_type as u8);
    pbe::encode_varuint64(payload.len() as u64, &mut header);
    out.write_all(&header)?;
    out.write_all(payload)?;
    out.flush()
}

/// Reads one framed message. `Ok(None)` means a clean end of stream.
pub fn read_message<R: Read>(input: &mut R) -> io::Result<Option<(MessageType, Vec<u8>)>> {
    let mut tag = [0u8; 1];
    match input.read(&mut tag)? {
        0 => return Ok(None),
        _ => {}
    }
    let message_type = MessageType::from_tag(tag[0])
        .ok_or_else(|| WireError(format!("unknown message type {}", tag[0])))?;

    // Varint length, one byte at a time.
    let mut length: u64 = 0;
    let mut shift = 0u32;
    loop {
        let mut byte = [0u8; 1];
        input.read_exact(&mut byte)?;
        length |= u64::from(byte[0] & 0x7f) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 63 {
            return Err(WireError("message length varint is too long".to_owned()).into());
        }
    }
    if length as usize > MAX_MESSAGE_SIZE {
        return Err(WireError(format!("message of {} bytes is too large", length)).into());
    }
    let mut payload = vec![0u8; length as usize];
    input.read_exact(&mut payload)?;
    Ok(Some((message_type, payload)))
}

// --- shared codec helpers ------------------------------------------------

pub(crate) struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Reader<'a> {
        Reader { buf, pos: 0 }
    }

    pub fn varuint(&mut self) -> Result<u64, WireError> {
        let (value, n) = pbe::decode_varuint64(&self.buf[self.pos..])
            .ok_or_else(|| WireError("truncated varint".to_owned()))?;
        self.pos += n;
        Ok(value)
    }

    pub fn byte(&mut self) -> Result<u8, WireError> {
        if self.pos >= self.buf.len() {
            return Err(WireError("truncated message".to_owned()));
        }
        let b = self.buf[self.pos];
        self.pos += 1;
        Ok(b)
    }

    pub fn string(&mut self) -> Result<String, WireError> {
        let len = self.varuint()? as usize;
        if self.pos + len > self.buf.len() {
            return Err(WireError("truncated string".to_owned()));
        }
        let s = std::str::from_utf8(&self.buf[self.pos..self.pos + len])
            .map_err(|_| WireError("invalid UTF-8 string".to_owned()))?
            .to_owned();
        self.pos += len;
        Ok(s)
    }

    pub fn bytes(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.varuint()? as usize;
        if self.pos + len > self.buf.len() {
            return Err(WireError("truncated byte string".to_owned()));
        }
        let out = self.buf[self.pos..self.pos + len].to_vec();
        self.pos += len;
        Ok(out)
    }

    pub fn value(&mut self) -> Result<meridb_types::Value, WireError> {
        let (value, n) = meridb_types::Value::decode_from(&self.buf[self.pos..])
            .ok_or_else(|| WireError("malformed value".to_owned()))?;
        self.pos += n;
        Ok(value)
    }

    pub fn expect_end(self) -> Result<(), WireError> {
        if self.pos == self.buf.len() {
            Ok(())
        } else {
            Err(WireError("trailing bytes after message".to_owned()))
        }
    }
}

pub(crate) fn put_string(s: &str, out: &mut Vec<u8>) {
    pbe::encode_varuint64(s.len() as u64, out);
    out.extend_from_slice(s.as_bytes());
}

pub(crate) fn put_bytes(b: &[u8], out: &mut Vec<u8>) {
    pbe::encode_varuint64(b.len() as u64, out);
    out.extend_from_slice(b);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_roundtrip() {
        let mut wire = Vec::new();
        write_message(&mut wire, MessageType::Command, b"payload-1").unwrap();
        write_message(&mut wire, MessageType::ServerResponse, &[]).unwrap();

        let mut cursor = std::io::Cursor::new(wire);
        let (t1, p1) = read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(t1, MessageType::Command);
        assert_eq!(p1, b"payload-1");
        let (t2, p2) = read_message(&mut cursor).unwrap().unwrap();
        assert_eq!(t2, MessageType::ServerResponse);
        assert!(p2.is_empty());
        assert!(read_message(&mut cursor).unwrap().is_none());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let mut cursor = std::io::Cursor::new(vec![0xffu8, 0]);
        assert!(read_message(&mut cursor).is_err());
    }
}
