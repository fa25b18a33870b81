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

//! Plain binary encoding: little-endian fixed-width codecs and LEB128-style
//! variable-length unsigned integers. All on-disk and on-wire integers in
//! meridb go through these helpers.

use byteorder::{ByteOrder, LittleEndian};

/// Maximum encoded size of a varint u64.
pub const MAX_VARINT64_SIZE: usize = 10;

/// Maximum encoded size of a varint u32.
pub const MAX_VARINT32_SIZE: usize = 5;

pub fn encode_u16(value: u16, out: &mut [u8]) {
    LittleEndian::write_u16(out, value)
}

pub fn decode_u16(buf: &[u8]) -> u16 {
    LittleEndian::read_u16(buf)
}

pub fn encode_u32(value: u32, out: &mut [u8]) {
    LittleEndian::write_u32(out, value)
}

pub fn decode_u32(buf: &[u8]) -> u32 {
    LittleEndian::read_u32(buf)
}

pub fn encode_u64(value: u64, out: &mut [u8]) {
    LittleEndian::write_u64(out, value)
}

pub fn decode_u64(buf: &[u8]) -> u64 {
    LittleEndian::read_u64(buf)
}

pub fn encode_i64(value: i64, out: &mut [u8]) {
    LittleEndian::write_i64(out, value)
}

pub fn decode_i64(buf: &[u8]) -> i64 {
    LittleEndian::read_i64(buf)
}

pub fn encode_f32(value: f32, out: &mut [u8]) {
    LittleEndian::write_f32(out, value)
}

pub fn decode_f32(buf: &[u8]) -> f32 {
    LittleEndian::read_f32(buf)
}

pub fn encode_f64(value: f64, out: &mut [u8]) {
    LittleEndian::write_f64(out, value)
}

pub fn decode_f64(buf: &[u8]) -> f64 {
    LittleEndian::read_f64(buf)
}

/// Encodes `value` as a varint, appending to `out`. Returns encoded length.
pub fn encode_varuint64(mut value: u64, out: &mut Vec<u8>) -> usize {
    let mut n = 0;
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        n += 1;
        if value == 0 {
            out.push(byte);
            return n;
        }
        out.push(byte | 0x80);
    }
}

/// Decodes a varint u64 from the head of `buf`.
/// Returns the value and the number of bytes consumed, or `None` when the
/// input is truncated or longer than [`MAX_VARINT64_SIZE`].
pub fn decode_varuint64(buf: &[u8]) -> Option<(u64, usize)> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if i >= MAX_VARINT64_SIZE {
            return None;
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some((value, i + 1));
        }
        shift += 7;
    }
    None
}

/// Number of bytes `value` occupies when varint-encoded.
pub fn varuint64_size(mut value: u64) -> usize {
    let mut n = 1;
    while value >= 0x80 {
        value >>= 7;
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_roundtrip() {
        for &v in &[
            0u64,
            1,
            0x7f,
            0x80,
            0x3fff,
            0x4000,
            0xffff_ffff,
            u64::max_value(),
        ] {
            let mut buf = Vec::new();
            let n = encode_varuint64(v, &mut buf);
            assert_eq!(n, buf.len());
            assert_eq!(n, varuint64_size(v));
            assert_eq!(decode_varuint64(&buf), Some((v, n)));
        }
    }

    #[test]
    fn varint_rejects_truncated_input() {
        assert_eq!(decode_varuint64(&[0x80]), None);
        assert_eq!(decode_varuint64(&[]), None);
    }

    #[test]
    fn fixed_width_roundtrip() {
        let mut buf = [0u8; 8];
        encode_u64(0x0123_4567_89ab_cdef, &mut buf);
        assert_eq!(decode_u64(&buf), 0x0123_4567_89ab_cdef);
        encode_f64(2.5, &mut buf);
        assert_eq!(decode_f64(&buf), 2.5);
    }
}
