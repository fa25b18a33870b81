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

//! Positional file I/O with optional transparent block encryption.
//!
//! Both variants address *plaintext* offsets; the encrypted variant maps
//! them onto an ECB-transformed container whose first blocks store the
//! encrypted plaintext size.

use std::io;
use std::path::Path;

use meridb_crypto::CipherContextRef;

mod encrypted;
mod plain;

pub use self::encrypted::EncryptedFile;
pub use self::plain::PlainFile;

/// Positional file I/O over plaintext offsets.
pub trait FileIo: Send {
    /// Reads up to `buf.len()` bytes at `offset`. A return value smaller
    /// than the buffer means end of file.
    fn read(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Writes `buf` at `offset`. A return value smaller than the buffer
    /// means an underlying error after some bytes became durable.
    fn write(&mut self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Current plaintext size.
    fn file_size(&mut self) -> io::Result<u64>;

    /// Grows the logical size by `length` bytes.
    fn extend(&mut self, length: u64) -> io::Result<()>;

    /// Flushes pending writes to durable storage.
    fn flush(&mut self) -> io::Result<()>;

    /// Reads exactly `buf.len()` bytes or fails.
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> io::Result<()> {
        let n = self.read(buf, offset)?;
        if n == buf.len() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read: {} of {} bytes at offset {}", n, buf.len(), offset),
            ))
        }
    }

    /// Writes all of `buf` or fails.
    fn write_all_at(&mut self, buf: &[u8], offset: u64) -> io::Result<()> {
        let n = self.write(buf, offset)?;
        if n == buf.len() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes at offset {}", n, buf.len(), offset),
            ))
        }
    }
}

/// Owned file handle.
pub type FileBox = Box<dyn FileIo>;

/// Cipher contexts shared by every file of one database.
#[derive(Clone)]
pub struct FileEncryption {
    pub encryption: CipherContextRef,
    pub decryption: CipherContextRef,
}

/// Creates plain or encrypted files for one database directory.
#[derive(Clone, Default)]
pub struct FileFactory {
    encryption: Option<FileEncryption>,
}

impl FileFactory {
    pub fn plaintext() -> FileFactory {
        FileFactory { encryption: None }
    }

    pub fn encrypted(encryption: FileEncryption) -> FileFactory {
        FileFactory {
            encryption: Some(encryption),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    /// Creates a new file of `initial_size` plaintext bytes. Fails if the
    /// file exists.
    pub fn create_file(&self, path: &Path, initial_size: u64) -> io::Result<FileBox> {
        match self.encryption {
            None => Ok(Box::new(PlainFile::create(path, initial_size)?)),
            Some(ref e) => Ok(Box::new(EncryptedFile::create(
                path,
                e.encryption.clone(),
                e.decryption.clone(),
                initial_size,
            )?)),
        }
    }

    /// Opens an existing file.
    pub fn open_file(&self, path: &Path) -> io::Result<FileBox> {
        match self.encryption {
            None => Ok(Box::new(PlainFile::open(path)?)),
            Some(ref e) => Ok(Box::new(EncryptedFile::open(
                path,
                e.encryption.clone(),
                e.decryption.clone(),
            )?)),
        }
    }
}
