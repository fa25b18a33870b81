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

//! Large objects: chunk chain headers and forward-only column streams.

use std::io;
use std::sync::Arc;

use meridb_types::pbe;
use meridb_types::{ColumnDataAddress, LobStream};

use crate::column::Column;

/// Header preceding every LOB chunk in a block.
///
/// `next_chunk_block_id == 0` marks the end of the chain.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LobChunkHeader {
    pub remaining_lob_length: u32,
    pub chunk_length: u32,
    pub next_chunk_block_id: u64,
    pub next_chunk_offset: u32,
}

impl LobChunkHeader {
    /// Fixed serialized size.
    pub const SERIALIZED_SIZE: u32 = 20;

    pub fn new(remaining_lob_length: u32, chunk_length: u32) -> LobChunkHeader {
        LobChunkHeader {
            remaining_lob_length,
            chunk_length,
            next_chunk_block_id: 0,
            next_chunk_offset: 0,
        }
    }

    pub fn serialize(&self, out: &mut [u8]) {
        pbe::encode_u32(self.remaining_lob_length, &mut out[..4]);
        pbe::encode_u32(self.chunk_length, &mut out[4..8]);
        pbe::encode_u64(self.next_chunk_block_id, &mut out[8..16]);
        pbe::encode_u32(self.next_chunk_offset, &mut out[16..20]);
    }

    pub fn deserialize(buf: &[u8]) -> LobChunkHeader {
        LobChunkHeader {
            remaining_lob_length: pbe::decode_u32(&buf[..4]),
            chunk_length: pbe::decode_u32(&buf[4..8]),
            next_chunk_block_id: pbe::decode_u64(&buf[8..16]),
            next_chunk_offset: pbe::decode_u32(&buf[16..20]),
        }
    }
}

/// Forward-only reader over a column LOB chunk chain. Holds its source
/// column alive for the stream lifetime; `holds_source` records whether the
/// anchor requested owning semantics.
pub struct ColumnLobStream {
    column: Arc<Column>,
    #[allow(dead_code)]
    holds_source: bool,
    /// Bytes of the whole LOB not yet returned.
    remaining: u64,
    /// Bytes left in the current chunk.
    chunk_remaining: u32,
    /// Position of the next unread byte of the current chunk.
    block_id: u64,
    offset: u32,
    /// Location of the next chunk header, if the chain continues.
    next_chunk: ColumnDataAddress,
}

impl ColumnLobStream {
    /// Opens the stream anchored at the first chunk header of a LOB.
    pub fn open(
        column: Arc<Column>,
        addr: ColumnDataAddress,
        holds_source: bool,
    ) -> crate::error::Result<ColumnLobStream> {
        let (header, data_offset) = column.load_lob_chunk_header(addr.block_id, addr.offset)?;
        Ok(ColumnLobStream {
            column,
            holds_source,
            remaining: u64::from(header.remaining_lob_length),
            chunk_remaining: header.chunk_length,
            block_id: addr.block_id,
            offset: data_offset,
            next_chunk: ColumnDataAddress::new(
                header.next_chunk_block_id,
                header.next_chunk_offset,
            ),
        })
    }

    fn advance_chunk(&mut self) -> io::Result<()> {
        if self.next_chunk.block_id == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "LOB chunk chain ended early",
            ));
        }
        let (header, data_offset) = self
            .column
            .load_lob_chunk_header(self.next_chunk.block_id, self.next_chunk.offset)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        self.chunk_remaining = header.chunk_length;
        self.block_id = self.next_chunk.block_id;
        self.offset = data_offset;
        self.next_chunk =
            ColumnDataAddress::new(header.next_chunk_block_id, header.next_chunk_offset);
        Ok(())
    }
}

impl LobStream for ColumnLobStream {
    fn remaining_size(&self) -> u64 {
        self.remaining
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 || buf.is_empty() {
            return Ok(0);
        }
        let mut done = 0;
        while done < buf.len() && self.remaining > 0 {
            if self.chunk_remaining == 0 {
                self.advance_chunk()?;
                continue;
            }
            let n = (buf.len() - done)
                .min(self.chunk_remaining as usize)
                .min(self.remaining as usize);
            self.column
                .read_data(self.block_id, self.offset, &mut buf[done..done + n])
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
            done += n;
            self.offset += n as u32;
            self.chunk_remaining -= n as u32;
            self.remaining -= n as u64;
        }
        Ok(done)
    }
}

/// An in-memory LOB source used when a caller writes an owned buffer
/// through the streamed path.
pub struct MemoryLobStream {
    data: Vec<u8>,
    pos: usize,
}

impl MemoryLobStream {
    pub fn new(data: Vec<u8>) -> MemoryLobStream {
        MemoryLobStream { data, pos: 0 }
    }
}

impl LobStream for MemoryLobStream {
    fn remaining_size(&self) -> u64 {
        (self.data.len() - self.pos) as u64
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::{LobChunkHeader, MemoryLobStream};
    use meridb_types::LobStream;

    #[test]
    fn chunk_header_roundtrip() {
        let header = LobChunkHeader {
            remaining_lob_length: 1_500_000,
            chunk_length: 65_000,
            next_chunk_block_id: 7,
            next_chunk_offset: 1234,
        };
        let mut buf = [0u8; LobChunkHeader::SERIALIZED_SIZE as usize];
        header.serialize(&mut buf);
        assert_eq!(LobChunkHeader::deserialize(&buf), header);
    }

    #[test]
    fn memory_stream_drains() {
        let mut stream = MemoryLobStream::new((0..100u8).collect());
        assert_eq!(stream.remaining_size(), 100);
        let mut buf = [0u8; 64];
        assert_eq!(stream.read(&mut buf).unwrap(), 64);
        assert_eq!(stream.read(&mut buf).unwrap(), 36);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
        assert_eq!(stream.remaining_size(), 0);
    }
}
