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

use std::io;
use std::path::Path;

use meridb_crypto::CipherContextRef;

use crate::defs::{align_down, align_up};
use crate::io::{FileIo, PlainFile};

/// Plaintext size of the container header.
const HEADER_PLAINTEXT_SIZE: u64 = 8;

/// Scratch buffer size; must hold a whole number of cipher blocks.
const DATA_BUFFER_SIZE: usize = 8192;

/// Encrypted positional file.
///
/// Layout: `align_up(8, block_size)` header bytes holding the encrypted
/// little-endian plaintext size, then `align_up(plaintext_size, block_size)`
/// bytes of data, every block transformed independently. Callers address
/// plaintext offsets; the stored plaintext size is authoritative.
pub struct EncryptedFile {
    inner: PlainFile,
    encryption: CipherContextRef,
    decryption: CipherContextRef,
    block_size: u64,
    header_size: u64,
    plaintext_size: u64,
    scratch: Vec<u8>,
}

impl EncryptedFile {
    /// Creates a new encrypted file with `initial_size` plaintext bytes
    /// (all zero). Fails if the file exists.
    pub fn create(
        path: &Path,
        encryption: CipherContextRef,
        decryption: CipherContextRef,
        initial_size: u64,
    ) -> io::Result<EncryptedFile> {
        let block_size = encryption.block_size() as u64;
        let header_size = align_up(HEADER_PLAINTEXT_SIZE, block_size);
        let raw_size = header_size + align_up(initial_size, block_size);
        let inner = PlainFile::create(path, raw_size)?;
        let mut file = EncryptedFile {
            inner,
            encryption,
            decryption,
            block_size,
            header_size,
            plaintext_size: initial_size,
            scratch: vec![0u8; DATA_BUFFER_SIZE],
        };
        file.write_header()?;
        if initial_size > 0 {
            file.write_zero_blocks(file.header_size, raw_size)?;
        }
        Ok(file)
    }

    /// Opens an existing encrypted file and verifies its geometry.
    pub fn open(
        path: &Path,
        encryption: CipherContextRef,
        decryption: CipherContextRef,
    ) -> io::Result<EncryptedFile> {
        let block_size = encryption.block_size() as u64;
        let header_size = align_up(HEADER_PLAINTEXT_SIZE, block_size);
        let mut inner = PlainFile::open(path)?;
        let raw_size = inner.file_size()?;
        if raw_size % block_size != 0 || raw_size < header_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("invalid encrypted file size {}", raw_size),
            ));
        }
        let mut file = EncryptedFile {
            inner,
            encryption,
            decryption,
            block_size,
            header_size,
            plaintext_size: 0,
            scratch: vec![0u8; DATA_BUFFER_SIZE],
        };
        file.read_header()?;
        let expected = file.header_size + align_up(file.plaintext_size, block_size);
        if expected != raw_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "encrypted file size mismatch: header says {} plaintext bytes, \
                     raw size is {}",
                    file.plaintext_size, raw_size
                ),
            ));
        }
        Ok(file)
    }

    /// Cipher block size in bytes.
    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    // Raw offset one past the last ciphertext data block.
    fn eof_offset(&self) -> u64 {
        self.header_size + align_up(self.plaintext_size, self.block_size)
    }

    fn read_header(&mut self) -> io::Result<()> {
        let mut buf = vec![0u8; self.header_size as usize];
        self.inner.read_exact_at(&mut buf, 0)?;
        self.decryption.transform_in_place(&mut buf);
        self.plaintext_size = meridb_types::pbe::decode_u64(&buf[..8]);
        Ok(())
    }

    fn write_header(&mut self) -> io::Result<()> {
        let mut buf = vec![0u8; self.header_size as usize];
        meridb_types::pbe::encode_u64(self.plaintext_size, &mut buf[..8]);
        self.encryption.transform_in_place(&mut buf);
        self.inner.write_all_at(&buf, 0)
    }

    // Fills [from, to) raw range with encrypted zero blocks.
    fn write_zero_blocks(&mut self, from: u64, to: u64) -> io::Result<()> {
        let bs = self.block_size as usize;
        let mut zero = vec![0u8; bs];
        self.encryption.transform_in_place(&mut zero);
        let mut at = from;
        while at < to {
            self.inner.write_all_at(&zero, at)?;
            at += self.block_size;
        }
        Ok(())
    }

    // Makes sure every block before `raw_block_offset` exists, encrypting
    // zero padding for any hole between the current EOF and the target.
    fn fill_gap(&mut self, raw_block_offset: u64) -> io::Result<()> {
        let eof = self.eof_offset();
        if raw_block_offset > eof {
            self.write_zero_blocks(eof, raw_block_offset)?;
        }
        Ok(())
    }

    // Read-modify-write of one existing block.
    fn update_block(&mut self, data: &[u8], offset: u64) -> io::Result<()> {
        let bs = self.block_size as usize;
        debug_assert!(!data.is_empty() && data.len() <= bs);
        let block_raw = self.header_size + align_down(offset, self.block_size);
        let in_block = (offset - align_down(offset, self.block_size)) as usize;

        let mut block = vec![0u8; bs];
        self.inner.read_exact_at(&mut block, block_raw)?;
        self.decryption.transform_in_place(&mut block);
        block[in_block..in_block + data.len()].copy_from_slice(data);
        self.encryption.transform_in_place(&mut block);
        self.inner.write_all_at(&block, block_raw)
    }

    // Writes a block that does not exist yet; the gap before `offset`
    // within the block is zero-padded, as is the tail after the data.
    fn write_fresh_block(&mut self, data: &[u8], offset: u64) -> io::Result<()> {
        let bs = self.block_size as usize;
        debug_assert!(!data.is_empty() && data.len() <= bs);
        let block_raw = self.header_size + align_down(offset, self.block_size);
        self.fill_gap(block_raw)?;
        let in_block = (offset - align_down(offset, self.block_size)) as usize;

        let mut block = vec![0u8; bs];
        block[in_block..in_block + data.len()].copy_from_slice(data);
        self.encryption.transform_in_place(&mut block);
        self.inner.write_all_at(&block, block_raw)
    }

    // Grows the recorded plaintext size and re-encrypts the header.
    fn commit_size(&mut self, end: u64) -> io::Result<()> {
        if end > self.plaintext_size {
            self.plaintext_size = end;
            self.write_header()?;
        }
        Ok(())
    }

    fn block_exists(&self, offset: u64) -> bool {
        self.header_size + align_down(offset, self.block_size) < self.eof_offset()
    }
}

impl FileIo for EncryptedFile {
    fn read(&mut self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.plaintext_size || buf.is_empty() {
            return Ok(0);
        }
        let len = buf.len().min((self.plaintext_size - offset) as usize);
        let bs = self.block_size as usize;
        let mut done = 0usize;

        // Partially touched first block.
        let in_block = (offset % self.block_size) as usize;
        if in_block != 0 {
            let block_raw = self.header_size + align_down(offset, self.block_size);
            let mut block = vec![0u8; bs];
            self.inner.read_exact_at(&mut block, block_raw)?;
            self.decryption.transform_in_place(&mut block);
            let n = (bs - in_block).min(len);
            buf[..n].copy_from_slice(&block[in_block..in_block + n]);
            done = n;
            if done == len {
                return Ok(done);
            }
        }

        // Whole blocks straight into the caller buffer.
        let mid = align_down((len - done) as u64, self.block_size) as usize;
        if mid > 0 {
            let raw = self.header_size + offset + done as u64;
            let n = self.inner.read(&mut buf[done..done + mid], raw)?;
            let usable = align_down(n as u64, self.block_size) as usize;
            if usable > 0 {
                self.decryption
                    .transform_in_place(&mut buf[done..done + usable]);
            }
            if n != mid {
                return Ok(done + usable);
            }
            done += mid;
        }

        // Trailing partial block.
        if done < len {
            let raw = self.header_size + offset + done as u64;
            let mut block = vec![0u8; bs];
            if self.inner.read(&mut block, raw)? != bs {
                return Ok(done);
            }
            self.decryption.transform_in_place(&mut block);
            buf[done..len].copy_from_slice(&block[..len - done]);
            done = len;
        }

        Ok(done)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let bs = self.block_size as usize;
        let len = buf.len();
        let mut done = 0usize;

        // Partially touched first block.
        let in_block = (offset % self.block_size) as usize;
        if in_block != 0 {
            let n = (bs - in_block).min(len);
            if self.block_exists(offset) {
                self.update_block(&buf[..n], offset)?;
            } else {
                self.write_fresh_block(&buf[..n], offset)?;
            }
            self.commit_size(offset + n as u64)?;
            done = n;
        }

        // Whole blocks through the scratch buffer.
        while len - done >= bs {
            let at = offset + done as u64;
            let chunk = (align_down((len - done) as u64, self.block_size) as usize)
                .min(self.scratch.len());
            self.scratch[..chunk].copy_from_slice(&buf[done..done + chunk]);
            self.encryption.transform_in_place(&mut self.scratch[..chunk]);
            self.fill_gap(self.header_size + at)?;
            let written = self
                .inner
                .write(&self.scratch[..chunk], self.header_size + at)?;
            let durable = align_down(written as u64, self.block_size) as usize;
            done += durable;
            self.commit_size(offset + done as u64)?;
            if written != chunk {
                return Ok(done);
            }
        }

        // Trailing partial block at an aligned offset.
        if done < len {
            let at = offset + done as u64;
            if self.block_exists(at) {
                self.update_block(&buf[done..], at)?;
            } else {
                self.write_fresh_block(&buf[done..], at)?;
            }
            self.commit_size(offset + len as u64)?;
            done = len;
        }

        Ok(done)
    }

    fn file_size(&mut self) -> io::Result<u64> {
        Ok(self.plaintext_size)
    }

    fn extend(&mut self, length: u64) -> io::Result<()> {
        if length == 0 {
            return Ok(());
        }
        let free_in_last_block =
            align_up(self.plaintext_size, self.block_size) - self.plaintext_size;
        if length > free_in_last_block {
            let extra = align_up(length - free_in_last_block, self.block_size);
            let old_eof = self.eof_offset();
            self.inner.extend(extra)?;
            self.write_zero_blocks(old_eof, old_eof + extra)?;
        }
        self.plaintext_size += length;
        self.write_header()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::EncryptedFile;
    use crate::io::FileIo;
    use meridb_crypto::{get_cipher, CipherContextRef};
    use tempdir::TempDir;

    fn contexts() -> (CipherContextRef, CipherContextRef) {
        let cipher = get_cipher("aes128").unwrap().unwrap();
        let key: Vec<u8> = (0u8..16).collect();
        (
            cipher.create_encryption_context(&key).unwrap(),
            cipher.create_decryption_context(&key).unwrap(),
        )
    }

    fn new_file(dir: &TempDir, name: &str, initial: u64) -> EncryptedFile {
        let (enc, dec) = contexts();
        EncryptedFile::create(&dir.path().join(name), enc, dec, initial).unwrap()
    }

    #[test]
    fn append_and_read_back() {
        let dir = TempDir::new("encrypted_file").unwrap();
        let mut file = new_file(&dir, "f.dat", 0);

        let data: Vec<u8> = (0..100u32).map(|i| (i * 3) as u8).collect();
        assert_eq!(file.write(&data, 0).unwrap(), data.len());
        assert_eq!(file.file_size().unwrap(), 100);

        let mut out = vec![0u8; 100];
        assert_eq!(file.read(&mut out, 0).unwrap(), 100);
        assert_eq!(out, data);
    }

    #[test]
    fn unaligned_overwrites_roundtrip() {
        let dir = TempDir::new("encrypted_file").unwrap();
        let mut file = new_file(&dir, "f.dat", 0);

        let mut shadow = vec![0u8; 300];
        file.write(&vec![0u8; 300], 0).unwrap();
        for &(off, len, fill) in &[(3usize, 7usize, 0xa1u8), (15, 40, 0xb2), (250, 50, 0xc3)] {
            let patch = vec![fill; len];
            assert_eq!(file.write(&patch, off as u64).unwrap(), len);
            shadow[off..off + len].copy_from_slice(&patch);
        }

        let mut out = vec![0u8; 300];
        assert_eq!(file.read(&mut out, 0).unwrap(), 300);
        assert_eq!(out, shadow);

        // Unaligned read in the middle.
        let mut mid = vec![0u8; 33];
        assert_eq!(file.read(&mut mid, 11).unwrap(), 33);
        assert_eq!(&mid[..], &shadow[11..44]);
    }

    #[test]
    fn append_with_gap_zero_pads() {
        let dir = TempDir::new("encrypted_file").unwrap();
        let mut file = new_file(&dir, "f.dat", 0);
        file.write(b"head", 0).unwrap();
        // Write two cipher blocks past the end.
        file.write(b"tail", 40).unwrap();
        assert_eq!(file.file_size().unwrap(), 44);

        let mut out = vec![0u8; 44];
        assert_eq!(file.read(&mut out, 0).unwrap(), 44);
        assert_eq!(&out[..4], b"head");
        assert!(out[4..40].iter().all(|&b| b == 0));
        assert_eq!(&out[40..], b"tail");
    }

    #[test]
    fn read_past_eof_returns_zero() {
        let dir = TempDir::new("encrypted_file").unwrap();
        let mut file = new_file(&dir, "f.dat", 0);
        file.write(b"12345", 0).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(file.read(&mut buf, 5).unwrap(), 0);
        assert_eq!(file.read(&mut buf, 500).unwrap(), 0);
        // Read straddling EOF is clamped.
        assert_eq!(file.read(&mut buf, 3).unwrap(), 2);
        assert_eq!(&buf[..2], b"45");
    }

    #[test]
    fn reopen_verifies_and_preserves_content() {
        let dir = TempDir::new("encrypted_file").unwrap();
        let path = dir.path().join("f.dat");
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        {
            let (enc, dec) = contexts();
            let mut file = EncryptedFile::create(&path, enc, dec, 0).unwrap();
            file.write(&data, 17).unwrap();
            file.flush().unwrap();
        }
        let (enc, dec) = contexts();
        let mut file = EncryptedFile::open(&path, enc, dec).unwrap();
        assert_eq!(file.file_size().unwrap(), 17 + 1000);
        let mut out = vec![0u8; 1000];
        assert_eq!(file.read(&mut out, 17).unwrap(), 1000);
        assert_eq!(out, data);
    }

    #[test]
    fn open_with_wrong_key_fails() {
        let dir = TempDir::new("encrypted_file").unwrap();
        let path = dir.path().join("f.dat");
        {
            let mut file = new_file(&dir, "f.dat", 0);
            file.write(b"payload", 0).unwrap();
        }
        let cipher = get_cipher("aes128").unwrap().unwrap();
        let bad_key = vec![0xffu8; 16];
        let enc = cipher.create_encryption_context(&bad_key).unwrap();
        let dec = cipher.create_decryption_context(&bad_key).unwrap();
        assert!(EncryptedFile::open(&path, enc, dec).is_err());
    }

    #[test]
    fn extend_grows_logical_size_with_zeros() {
        let dir = TempDir::new("encrypted_file").unwrap();
        let mut file = new_file(&dir, "f.dat", 0);
        file.write(b"abc", 0).unwrap();
        file.extend(5).unwrap();
        // Fits into the current last block.
        assert_eq!(file.file_size().unwrap(), 8);
        file.extend(100).unwrap();
        assert_eq!(file.file_size().unwrap(), 108);
        let mut out = vec![0u8; 108];
        assert_eq!(file.read(&mut out, 0).unwrap(), 108);
        assert_eq!(&out[..3], b"abc");
        assert!(out[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn initial_size_reads_as_zeros() {
        let dir = TempDir::new("encrypted_file").unwrap();
        let mut file = new_file(&dir, "f.dat", 50);
        assert_eq!(file.file_size().unwrap(), 50);
        let mut out = vec![0u8; 50];
        assert_eq!(file.read(&mut out, 0).unwrap(), 50);
        assert!(out.iter().all(|&b| b == 0));
    }
}
