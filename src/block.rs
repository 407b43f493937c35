//! Raw block-device abstraction shared by the formatter, checker, and
//! journal engine.
//!
//! A volume is always manipulated through a [`BlockDevice`], either a real
//! file/device ([`FileDevice`], which holds an exclusive advisory lock for
//! its whole lifetime) or an in-memory image ([`MemDevice`], used by tests
//! and image assembly).

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use fs2::FileExt;

use crate::error::Result;

/// Byte-addressed storage underneath a volume.
///
/// All operations are blocking and sequential; a single device must never be
/// targeted by two operations at once. `FileDevice` enforces this with an
/// exclusive advisory lock held from open to drop.
pub trait BlockDevice: Send {
    /// Total device size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read exactly `buf.len()` bytes starting at `offset`.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all of `buf` starting at `offset`.
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;

    /// Flush pending writes to durable storage.
    fn flush(&mut self) -> Result<()>;
}

impl<D: BlockDevice + ?Sized> BlockDevice for &mut D {
    fn len(&self) -> u64 {
        (**self).len()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// A volume image or raw device backed by a file.
///
/// The exclusive advisory lock is acquired before any read and released when
/// the device is dropped, on every exit path.
pub struct FileDevice {
    file: File,
    len: u64,
}

impl FileDevice {
    /// Open an existing image or device read-write and lock it exclusively.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        file.try_lock_exclusive()?;
        let len = file.metadata()?.len();
        Ok(FileDevice { file, len })
    }

    /// Create (or truncate) an image file of `size` bytes and lock it.
    pub fn create(path: impl AsRef<Path>, size: u64) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.try_lock_exclusive()?;
        file.set_len(size)?;
        Ok(FileDevice { file, len: size })
    }
}

impl BlockDevice for FileDevice {
    fn len(&self) -> u64 {
        self.len
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

impl Drop for FileDevice {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

/// An in-memory volume image.
#[derive(Debug)]
pub struct MemDevice {
    data: Vec<u8>,
}

impl MemDevice {
    pub fn new(size: u64) -> Self {
        MemDevice {
            data: vec![0u8; size as usize],
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        MemDevice { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }

    fn range(&self, offset: u64, len: usize) -> Result<std::ops::Range<usize>> {
        let start = offset as usize;
        let end = start.checked_add(len).filter(|&e| e <= self.data.len());
        match end {
            Some(end) => Ok(start..end),
            None => Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "access at {offset}+{len} beyond device size {}",
                    self.data.len()
                ),
            )
            .into()),
        }
    }
}

impl BlockDevice for MemDevice {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let range = self.range(offset, buf.len())?;
        buf.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let range = self.range(offset, buf.len())?;
        self.data[range].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}
