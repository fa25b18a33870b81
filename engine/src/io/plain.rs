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

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::io::FileIo;

/// Thin wrapper over positional file I/O. Reads and writes retry until the
/// full count is transferred or a hard error occurs.
pub struct PlainFile {
    file: File,
}

impl PlainFile {
    /// Creates a new file preallocated to `initial_size` bytes. Fails if
    /// the file already exists.
    pub fn create(path: &Path, initial_size: u64) -> io::Result<PlainFile> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        if initial_size > 0 {
            file.set_len(initial_size)?;
        }
        Ok(PlainFile { file })
    }

    /// Opens an existing file for read/write.
    pub fn open(path: &Path) -> io::Result<PlainFile> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(PlainFile { file })
    }
}

impl FileIo for PlainFile {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.read_at(&mut buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if done > 0 {
                        return Ok(done);
                    }
                    return Err(e);
                }
            }
        }
        Ok(done)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let mut done = 0;
        while done < buf.len() {
            match self.file.write_at(&buf[done..], offset + done as u64) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    if done > 0 {
                        return Ok(done);
                    }
                    return Err(e);
                }
            }
        }
        Ok(done)
    }

    fn file_size(&mut self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn extend(&mut self, length: u64) -> io::Result<()> {
        let size = self.file.metadata()?.len();
        self.file.set_len(size + length)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::PlainFile;
    use crate::io::FileIo;
    use tempdir::TempDir;

    #[test]
    fn create_open_read_write() {
        let dir = TempDir::new("plain_file").unwrap();
        let path = dir.path().join("f.dat");

        let mut file = PlainFile::create(&path, 64).unwrap();
        assert_eq!(file.file_size().unwrap(), 64);
        file.write_all_at(b"hello", 10).unwrap();

        // Create over an existing file must fail.
        assert!(PlainFile::create(&path, 0).is_err());

        let mut reopened = PlainFile::open(&path).unwrap();
        let mut buf = [0u8; 5];
        reopened.read_exact_at(&mut buf, 10).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn read_past_eof_is_short() {
        let dir = TempDir::new("plain_file").unwrap();
        let mut file = PlainFile::create(&dir.path().join("f.dat"), 8).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(file.read(&mut buf, 0).unwrap(), 8);
        assert_eq!(file.read(&mut buf, 8).unwrap(), 0);
        assert_eq!(file.read(&mut buf, 100).unwrap(), 0);
    }

    #[test]
    fn extend_grows_by_length() {
        let dir = TempDir::new("plain_file").unwrap();
        let mut file = PlainFile::create(&dir.path().join("f.dat"), 16).unwrap();
        file.extend(16).unwrap();
        assert_eq!(file.file_size().unwrap(), 32);
    }
}
