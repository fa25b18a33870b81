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

use std::fmt;

use crate::pbe;

/// Packed calendar timestamp.
///
/// The date part serializes to 4 bytes:
/// bit 0 — time part present, bits 1..6 — day of month (1-based),
/// bits 6..10 — month (1-based), bits 10..32 — year + 262144 offset.
/// The optional time part serializes to 8 bytes:
/// bits 0..30 — nanoseconds, bits 30..36 — seconds, bits 36..42 — minutes,
/// bits 42..47 — hours.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RawDateTime {
    pub year: i32,
    pub month: u8,
    pub day_of_month: u8,
    pub has_time_part: bool,
    pub hours: u8,
    pub minutes: u8,
    pub seconds: u8,
    pub nanos: u32,
}

/// Year bias making the packed year field non-negative.
const YEAR_BIAS: i32 = 262_144;

impl RawDateTime {
    /// Serialized size of the date part.
    pub const DATE_PART_SERIALIZED_SIZE: usize = 4;

    /// Serialized size of the time part.
    pub const TIME_PART_SERIALIZED_SIZE: usize = 8;

    /// Maximum serialized size (date part + time part).
    pub const MAX_SERIALIZED_SIZE: usize =
        Self::DATE_PART_SERIALIZED_SIZE + Self::TIME_PART_SERIALIZED_SIZE;

    /// Serializes into `out`, returns the number of bytes written.
    pub fn serialize(&self, out: &mut [u8]) -> usize {
        let date = (self.has_time_part as u32)
            | (u32::from(self.day_of_month) & 0x1f) << 1
            | (u32::from(self.month) & 0x0f) << 6
            | (((self.year + YEAR_BIAS) as u32) & 0x3f_ffff) << 10;
        pbe::encode_u32(date, &mut out[..4]);
        if !self.has_time_part {
            return Self::DATE_PART_SERIALIZED_SIZE;
        }
        let time = u64::from(self.nanos & 0x3fff_ffff)
            | (u64::from(self.seconds) & 0x3f) << 30
            | (u64::from(self.minutes) & 0x3f) << 36
            | (u64::from(self.hours) & 0x1f) << 42;
        pbe::encode_u64(time, &mut out[4..12]);
        Self::MAX_SERIALIZED_SIZE
    }

    /// Decodes the 4-byte date part. The time part, when indicated by
    /// `has_time_part`, must be supplied via [`deserialize_time_part`].
    pub fn deserialize_date_part(buf: &[u8]) -> RawDateTime {
        let date = pbe::decode_u32(buf);
        RawDateTime {
            has_time_part: date & 1 != 0,
            day_of_month: ((date >> 1) & 0x1f) as u8,
            month: ((date >> 6) & 0x0f) as u8,
            year: ((date >> 10) & 0x3f_ffff) as i32 - YEAR_BIAS,
            ..Default::default()
        }
    }

    /// Decodes the 8-byte time part into an already decoded date part.
    pub fn deserialize_time_part(&mut self, buf: &[u8]) {
        let time = pbe::decode_u64(buf);
        self.nanos = (time & 0x3fff_ffff) as u32;
        self.seconds = ((time >> 30) & 0x3f) as u8;
        self.minutes = ((time >> 36) & 0x3f) as u8;
        self.hours = ((time >> 42) & 0x1f) as u8;
    }

    /// Serialized size of this value.
    pub fn serialized_size(&self) -> usize {
        if self.has_time_part {
            Self::MAX_SERIALIZED_SIZE
        } else {
            Self::DATE_PART_SERIALIZED_SIZE
        }
    }
}

impl fmt::Display for RawDateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day_of_month)?;
        if self.has_time_part {
            write!(
                f,
                " {:02}:{:02}:{:02}.{:09}",
                self.hours, self.minutes, self.seconds, self.nanos
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::RawDateTime;

    #[test]
    fn date_only_roundtrip() {
        let dt = RawDateTime {
            year: 2021,
            month: 3,
            day_of_month: 14,
            ..Default::default()
        };
        let mut buf = [0u8; RawDateTime::MAX_SERIALIZED_SIZE];
        assert_eq!(dt.serialize(&mut buf), 4);
        let decoded = RawDateTime::deserialize_date_part(&buf);
        assert_eq!(decoded, dt);
    }

    #[test]
    fn datetime_roundtrip() {
        let dt = RawDateTime {
            year: -44,
            month: 12,
            day_of_month: 31,
            has_time_part: true,
            hours: 23,
            minutes: 59,
            seconds: 58,
            nanos: 999_999_999,
        };
        let mut buf = [0u8; RawDateTime::MAX_SERIALIZED_SIZE];
        assert_eq!(dt.serialize(&mut buf), 12);
        let mut decoded = RawDateTime::deserialize_date_part(&buf);
        assert!(decoded.has_time_part);
        decoded.deserialize_time_part(&buf[4..]);
        assert_eq!(decoded, dt);
    }
}
