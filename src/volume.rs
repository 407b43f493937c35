//! An open volume handle.
//!
//! Every operation takes a [`Volume`] value explicitly; there is no global
//! registry of mounted volumes. The handle owns its device, so the advisory
//! lock a [`FileDevice`](crate::block::FileDevice) holds lives exactly as
//! long as the handle.

use log::debug;

use crate::block::BlockDevice;
use crate::error::{Result, VolumeError};
use crate::geometry::VolumeKind;
use crate::superblock::{Superblock, read_superblock, write_superblock};

/// A validated, open volume bound to its backing device.
#[derive(Debug)]
pub struct Volume<D: BlockDevice> {
    device: D,
    superblock: Superblock,
    size_bytes: u64,
}

impl<D: BlockDevice> Volume<D> {
    /// Read and validate the superblock, then bind the device.
    ///
    /// The volume size is taken from the superblock, not the device: a
    /// device larger than its volume is fine (e.g. an image with slack),
    /// but a volume claiming more blocks than the device holds is not.
    pub fn open(mut device: D) -> Result<Self> {
        let superblock = read_superblock(&mut device)?;
        let size_bytes =
            superblock.total_blocks() as u64 * superblock.block_size() as u64;
        if size_bytes > device.len() {
            return Err(VolumeError::InvalidVolume(format!(
                "superblock claims {} bytes but the device holds {}",
                size_bytes,
                device.len()
            )));
        }
        debug!(
            "opened {} volume: {} blocks of {} bytes",
            superblock.kind().name(),
            superblock.total_blocks(),
            superblock.block_size()
        );
        Ok(Volume {
            device,
            superblock,
            size_bytes,
        })
    }

    pub fn kind(&self) -> VolumeKind {
        self.superblock.kind()
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn block_size(&self) -> u32 {
        self.superblock.block_size()
    }

    pub fn total_blocks(&self) -> u32 {
        self.superblock.total_blocks()
    }

    pub fn superblock(&self) -> &Superblock {
        &self.superblock
    }

    pub fn superblock_mut(&mut self) -> &mut Superblock {
        &mut self.superblock
    }

    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// Byte offset of allocation block `block`, range-checked.
    pub fn block_offset(&self, block: u32) -> Result<u64> {
        if block >= self.total_blocks() {
            return Err(VolumeError::BlockOutOfRange {
                block: block as u64,
                total: self.total_blocks() as u64,
            });
        }
        Ok(block as u64 * self.block_size() as u64)
    }

    /// Read one allocation block.
    pub fn read_block(&mut self, block: u32) -> Result<Vec<u8>> {
        let offset = self.block_offset(block)?;
        let mut buf = vec![0u8; self.block_size() as usize];
        self.device.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Write one allocation block; `data` must be exactly one block long.
    pub fn write_block(&mut self, block: u32, data: &[u8]) -> Result<()> {
        let offset = self.block_offset(block)?;
        if data.len() != self.block_size() as usize {
            return Err(VolumeError::InvalidVolume(format!(
                "block write of {} bytes does not match the {}-byte block size",
                data.len(),
                self.block_size()
            )));
        }
        self.device.write_at(offset, data)?;
        Ok(())
    }

    /// Persist the in-memory superblock to both on-disk copies and flush.
    pub fn write_superblocks(&mut self) -> Result<()> {
        write_superblock(&mut self.device, &self.superblock, self.size_bytes)
    }

    /// Release the handle, returning the device (and with it the lock).
    pub fn into_device(self) -> D {
        self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;
    use crate::format::{FormatOptions, format};
    use crate::geometry::GeometryRequest;

    fn formatted_hfs() -> MemDevice {
        let size = 800 * 1024u64;
        let mut dev = MemDevice::new(size);
        format(
            &mut dev,
            &GeometryRequest {
                size_bytes: size,
                kind: VolumeKind::Hfs,
                block_size: None,
            },
            "Handle",
            &FormatOptions::default(),
        )
        .unwrap();
        dev
    }

    #[test]
    fn test_open_formatted_volume() {
        let mut vol = Volume::open(formatted_hfs()).unwrap();
        assert_eq!(vol.kind(), VolumeKind::Hfs);
        assert_eq!(vol.total_blocks(), 1600);
        assert_eq!(vol.block_size(), 512);
        assert_eq!(vol.size_bytes(), 800 * 1024);

        let block = vol.read_block(100).unwrap();
        assert_eq!(block.len(), 512);
    }

    #[test]
    fn test_open_blank_device_fails() {
        let dev = MemDevice::new(1024 * 1024);
        assert!(matches!(
            Volume::open(dev).unwrap_err(),
            VolumeError::InvalidSignature { found: 0 }
        ));
    }

    #[test]
    fn test_open_rejects_volume_larger_than_device() {
        let dev = formatted_hfs();
        // Truncate the image below what the superblock claims.
        let truncated = MemDevice::from_vec(dev.as_slice()[..700 * 1024].to_vec());
        assert!(Volume::open(truncated).is_err());
    }

    #[test]
    fn test_block_io_is_range_checked() {
        let mut vol = Volume::open(formatted_hfs()).unwrap();
        assert!(matches!(
            vol.read_block(1600).unwrap_err(),
            VolumeError::BlockOutOfRange { block: 1600, .. }
        ));
        assert!(vol.write_block(10, &[0u8; 100]).is_err());
    }

    #[test]
    fn test_superblock_edit_round_trips() {
        let mut vol = Volume::open(formatted_hfs()).unwrap();
        vol.superblock_mut().set_unmounted_cleanly(false);
        vol.write_superblocks().unwrap();

        let vol = Volume::open(vol.into_device()).unwrap();
        assert!(!vol.superblock().is_unmounted_cleanly());
    }
}
