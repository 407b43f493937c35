//! Range-checked big-endian field access over raw structure buffers.
//!
//! Every multi-byte read or write in the superblock, B-tree, and journal
//! modules goes through this layer, so an out-of-bounds field access becomes
//! a recoverable error instead of a panic or silent corruption.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Result, VolumeError};

fn check(len: usize, offset: usize, width: usize) -> Result<()> {
    let end = offset
        .checked_add(width)
        .ok_or_else(|| VolumeError::InvalidVolume(format!("field offset {offset} overflows")))?;
    if end > len {
        return Err(VolumeError::InvalidVolume(format!(
            "field at {offset}+{width} exceeds structure size {len}"
        )));
    }
    Ok(())
}

/// Read-only view over a fixed-size on-disk structure.
pub struct Buf<'a> {
    data: &'a [u8],
}

impl<'a> Buf<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Buf { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn get_u8(&self, offset: usize) -> Result<u8> {
        check(self.data.len(), offset, 1)?;
        Ok(self.data[offset])
    }

    pub fn get_u16(&self, offset: usize) -> Result<u16> {
        check(self.data.len(), offset, 2)?;
        Ok(BigEndian::read_u16(&self.data[offset..offset + 2]))
    }

    pub fn get_u32(&self, offset: usize) -> Result<u32> {
        check(self.data.len(), offset, 4)?;
        Ok(BigEndian::read_u32(&self.data[offset..offset + 4]))
    }

    pub fn get_u64(&self, offset: usize) -> Result<u64> {
        check(self.data.len(), offset, 8)?;
        Ok(BigEndian::read_u64(&self.data[offset..offset + 8]))
    }

    pub fn get_bytes(&self, offset: usize, len: usize) -> Result<&'a [u8]> {
        check(self.data.len(), offset, len)?;
        Ok(&self.data[offset..offset + len])
    }
}

/// Mutable view over a fixed-size on-disk structure.
pub struct BufMut<'a> {
    data: &'a mut [u8],
}

impl<'a> BufMut<'a> {
    pub fn new(data: &'a mut [u8]) -> Self {
        BufMut { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn put_u8(&mut self, offset: usize, value: u8) -> Result<()> {
        check(self.data.len(), offset, 1)?;
        self.data[offset] = value;
        Ok(())
    }

    pub fn put_u16(&mut self, offset: usize, value: u16) -> Result<()> {
        check(self.data.len(), offset, 2)?;
        BigEndian::write_u16(&mut self.data[offset..offset + 2], value);
        Ok(())
    }

    pub fn put_u32(&mut self, offset: usize, value: u32) -> Result<()> {
        check(self.data.len(), offset, 4)?;
        BigEndian::write_u32(&mut self.data[offset..offset + 4], value);
        Ok(())
    }

    pub fn put_u64(&mut self, offset: usize, value: u64) -> Result<()> {
        check(self.data.len(), offset, 8)?;
        BigEndian::write_u64(&mut self.data[offset..offset + 8], value);
        Ok(())
    }

    pub fn put_bytes(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        check(self.data.len(), offset, bytes.len())?;
        self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}
