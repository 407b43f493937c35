//! HFS+ Volume Header, 512 bytes at offset 1024.

use crate::codec::{Buf, BufMut};
use crate::error::{Result, VolumeError};
use crate::superblock::{FIRST_USER_CATALOG_ID, HFSPLUS_SIGNATURE, HFSPLUS_VERSION, HFSX_SIGNATURE, HFSX_VERSION};

/// HFS+ extent descriptor: 32-bit start block + 32-bit block count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl ExtentDescriptor {
    pub fn is_empty(&self) -> bool {
        self.block_count == 0
    }
}

/// Fork descriptor: 80 bytes embedded in the Volume Header for each system
/// file. Up to eight initial extents; overflow lives in the Extents Overflow
/// B-tree, not here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: [ExtentDescriptor; 8],
}

impl ForkData {
    pub const SIZE: usize = 80;

    /// A fork occupying one contiguous run of blocks.
    pub fn contiguous(start_block: u32, block_count: u32, block_size: u32, clump_size: u32) -> Self {
        let mut extents = [ExtentDescriptor::default(); 8];
        extents[0] = ExtentDescriptor {
            start_block,
            block_count,
        };
        ForkData {
            logical_size: block_count as u64 * block_size as u64,
            clump_size,
            total_blocks: block_count,
            extents,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.total_blocks == 0
    }

    /// Start of the first extent; `None` for an empty fork.
    pub fn first_block(&self) -> Option<u32> {
        if self.extents[0].is_empty() {
            None
        } else {
            Some(self.extents[0].start_block)
        }
    }

    fn parse(buf: &Buf<'_>, base: usize) -> Result<Self> {
        let mut extents = [ExtentDescriptor::default(); 8];
        for (i, ext) in extents.iter_mut().enumerate() {
            ext.start_block = buf.get_u32(base + 16 + i * 8)?;
            ext.block_count = buf.get_u32(base + 16 + i * 8 + 4)?;
        }
        Ok(ForkData {
            logical_size: buf.get_u64(base)?,
            clump_size: buf.get_u32(base + 8)?,
            total_blocks: buf.get_u32(base + 12)?,
            extents,
        })
    }

    fn write(&self, buf: &mut BufMut<'_>, base: usize) -> Result<()> {
        buf.put_u64(base, self.logical_size)?;
        buf.put_u32(base + 8, self.clump_size)?;
        buf.put_u32(base + 12, self.total_blocks)?;
        for (i, ext) in self.extents.iter().enumerate() {
            buf.put_u32(base + 16 + i * 8, ext.start_block)?;
            buf.put_u32(base + 16 + i * 8 + 4, ext.block_count)?;
        }
        Ok(())
    }
}

/// HFS+ / HFSX Volume Header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHeader {
    pub signature: u16,
    /// 4 for HFS+, 5 for HFSX.
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    /// Allocation block holding the journal info block; 0 when not journaled.
    pub journal_info_block: u32,
    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,
    pub file_count: u32,
    pub folder_count: u32,
    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,
    pub next_allocation: u32,
    /// Mandated non-zero; a zero clump size is a structural error.
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    /// Always >= 16; IDs 0-15 are permanently reserved.
    pub next_catalog_id: u32,
    pub write_count: u32,
    pub encodings_bitmap: u64,
    pub finder_info: [u32; 8],
    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

impl VolumeHeader {
    /// Parse and validate a Volume Header from the 512-byte record.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let buf = Buf::new(data);
        let signature = buf.get_u16(0)?;
        let version = buf.get_u16(2)?;
        match (signature, version) {
            (HFSPLUS_SIGNATURE, HFSPLUS_VERSION) | (HFSX_SIGNATURE, HFSX_VERSION) => {}
            (HFSPLUS_SIGNATURE, v) | (HFSX_SIGNATURE, v) => {
                return Err(VolumeError::InvalidVolume(format!(
                    "volume header version {v} does not match signature 0x{signature:04X}"
                )));
            }
            (found, _) => return Err(VolumeError::InvalidSignature { found }),
        }

        let block_size = buf.get_u32(40)?;
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(VolumeError::InvalidVolume(format!(
                "allocation block size {block_size} is not a power of two"
            )));
        }
        let total_blocks = buf.get_u32(44)?;
        if total_blocks == 0 {
            return Err(VolumeError::InvalidVolume("zero total blocks".into()));
        }

        let rsrc_clump_size = buf.get_u32(56)?;
        let data_clump_size = buf.get_u32(60)?;
        if rsrc_clump_size == 0 || data_clump_size == 0 {
            return Err(VolumeError::InvalidVolume(
                "fork clump sizes must be non-zero".into(),
            ));
        }

        let next_catalog_id = buf.get_u32(64)?;
        if next_catalog_id < FIRST_USER_CATALOG_ID {
            return Err(VolumeError::InvalidVolume(format!(
                "next catalog ID {next_catalog_id} is inside the reserved range 0-15"
            )));
        }

        let mut finder_info = [0u32; 8];
        for (i, word) in finder_info.iter_mut().enumerate() {
            *word = buf.get_u32(80 + i * 4)?;
        }

        Ok(VolumeHeader {
            signature,
            version,
            attributes: buf.get_u32(4)?,
            last_mounted_version: buf.get_u32(8)?,
            journal_info_block: buf.get_u32(12)?,
            create_date: buf.get_u32(16)?,
            modify_date: buf.get_u32(20)?,
            backup_date: buf.get_u32(24)?,
            checked_date: buf.get_u32(28)?,
            file_count: buf.get_u32(32)?,
            folder_count: buf.get_u32(36)?,
            block_size,
            total_blocks,
            free_blocks: buf.get_u32(48)?,
            next_allocation: buf.get_u32(52)?,
            rsrc_clump_size,
            data_clump_size,
            next_catalog_id,
            write_count: buf.get_u32(68)?,
            encodings_bitmap: buf.get_u64(72)?,
            finder_info,
            allocation_file: ForkData::parse(&buf, 112)?,
            extents_file: ForkData::parse(&buf, 192)?,
            catalog_file: ForkData::parse(&buf, 272)?,
            attributes_file: ForkData::parse(&buf, 352)?,
            startup_file: ForkData::parse(&buf, 432)?,
        })
    }

    /// Serialize into a 512-byte superblock record.
    pub fn write(&self, out: &mut [u8]) -> Result<()> {
        if self.rsrc_clump_size == 0 || self.data_clump_size == 0 {
            return Err(VolumeError::InvalidVolume(
                "refusing to write zero fork clump sizes".into(),
            ));
        }
        if self.next_catalog_id < FIRST_USER_CATALOG_ID {
            return Err(VolumeError::InvalidVolume(format!(
                "refusing to write next catalog ID {} below reserved floor {FIRST_USER_CATALOG_ID}",
                self.next_catalog_id
            )));
        }

        let mut buf = BufMut::new(out);
        buf.put_u16(0, self.signature)?;
        buf.put_u16(2, self.version)?;
        buf.put_u32(4, self.attributes)?;
        buf.put_u32(8, self.last_mounted_version)?;
        buf.put_u32(12, self.journal_info_block)?;
        buf.put_u32(16, self.create_date)?;
        buf.put_u32(20, self.modify_date)?;
        buf.put_u32(24, self.backup_date)?;
        buf.put_u32(28, self.checked_date)?;
        buf.put_u32(32, self.file_count)?;
        buf.put_u32(36, self.folder_count)?;
        buf.put_u32(40, self.block_size)?;
        buf.put_u32(44, self.total_blocks)?;
        buf.put_u32(48, self.free_blocks)?;
        buf.put_u32(52, self.next_allocation)?;
        buf.put_u32(56, self.rsrc_clump_size)?;
        buf.put_u32(60, self.data_clump_size)?;
        buf.put_u32(64, self.next_catalog_id)?;
        buf.put_u32(68, self.write_count)?;
        buf.put_u64(72, self.encodings_bitmap)?;
        for (i, word) in self.finder_info.iter().enumerate() {
            buf.put_u32(80 + i * 4, *word)?;
        }
        self.allocation_file.write(&mut buf, 112)?;
        self.extents_file.write(&mut buf, 192)?;
        self.catalog_file.write(&mut buf, 272)?;
        self.attributes_file.write(&mut buf, 352)?;
        self.startup_file.write(&mut buf, 432)?;
        Ok(())
    }

    pub fn is_hfsx(&self) -> bool {
        self.signature == HFSX_SIGNATURE
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        VolumeHeader {
            signature: HFSPLUS_SIGNATURE,
            version: HFSPLUS_VERSION,
            attributes: crate::superblock::VH_ATTR_UNMOUNTED,
            last_mounted_version: u32::from_be_bytes(*b"10.0"),
            journal_info_block: 0,
            create_date: 0xB0000000,
            modify_date: 0xB0000001,
            backup_date: 0,
            checked_date: 0xB0000000,
            file_count: 0,
            folder_count: 0,
            block_size: 4096,
            total_blocks: 2560,
            free_blocks: 2500,
            next_allocation: 30,
            rsrc_clump_size: 16384,
            data_clump_size: 16384,
            next_catalog_id: FIRST_USER_CATALOG_ID,
            write_count: 0,
            encodings_bitmap: 1,
            finder_info: [0u32; 8],
            allocation_file: ForkData::contiguous(1, 1, 4096, 4096),
            extents_file: ForkData::contiguous(2, 8, 4096, 32768),
            catalog_file: ForkData::contiguous(10, 8, 4096, 32768),
            attributes_file: ForkData::contiguous(18, 8, 4096, 32768),
            startup_file: ForkData::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_volume_header_round_trip() {
        let vh = VolumeHeader::for_tests();
        let mut out = [0u8; 512];
        vh.write(&mut out).unwrap();
        let parsed = VolumeHeader::parse(&out).unwrap();
        assert_eq!(parsed, vh);
    }

    #[test]
    fn test_fixed_field_offsets() {
        let vh = VolumeHeader::for_tests();
        let mut out = [0u8; 512];
        vh.write(&mut out).unwrap();
        assert_eq!(&out[0..2], b"H+");
        assert_eq!(u32::from_be_bytes([out[40], out[41], out[42], out[43]]), 4096);
        assert_eq!(u32::from_be_bytes([out[44], out[45], out[46], out[47]]), 2560);
        assert_eq!(u32::from_be_bytes([out[64], out[65], out[66], out[67]]), 16);
    }

    #[test]
    fn test_zero_clump_size_rejected_both_ways() {
        let mut vh = VolumeHeader::for_tests();
        vh.data_clump_size = 0;
        let mut out = [0u8; 512];
        assert!(vh.write(&mut out).is_err());

        let good = VolumeHeader::for_tests();
        good.write(&mut out).unwrap();
        out[56..60].copy_from_slice(&0u32.to_be_bytes());
        assert!(VolumeHeader::parse(&out).is_err());
    }

    #[test]
    fn test_version_signature_pairing() {
        let mut vh = VolumeHeader::for_tests();
        vh.version = HFSX_VERSION;
        let mut out = [0u8; 512];
        vh.write(&mut out).unwrap();
        // H+ signature with HFSX version is rejected.
        assert!(VolumeHeader::parse(&out).is_err());

        vh.signature = HFSX_SIGNATURE;
        vh.write(&mut out).unwrap();
        let parsed = VolumeHeader::parse(&out).unwrap();
        assert!(parsed.is_hfsx());
    }

    #[test]
    fn test_reserved_catalog_id_rejected_on_read() {
        let vh = VolumeHeader::for_tests();
        let mut out = [0u8; 512];
        vh.write(&mut out).unwrap();
        out[64..68].copy_from_slice(&2u32.to_be_bytes());
        assert!(VolumeHeader::parse(&out).is_err());
    }
}
