//! Classic HFS Master Directory Block, 162 significant bytes at offset 1024.
//!
//! All multi-byte fields are big-endian and positionally fixed; third-party
//! tools parse this structure by offset, so field order and width must never
//! change.

use crate::codec::{Buf, BufMut};
use crate::error::{Result, VolumeError};
use crate::superblock::{FIRST_USER_CATALOG_ID, HFS_SIGNATURE};

/// Volume names are Pascal strings of 1-27 MacRoman bytes.
pub const MAX_VOLUME_NAME_LEN: usize = 27;

/// Mac Roman to Unicode lookup table for bytes 0x80-0xFF.
static MAC_ROMAN_TABLE: [char; 128] = [
    '\u{00C4}', '\u{00C5}', '\u{00C7}', '\u{00C9}', '\u{00D1}', '\u{00D6}', '\u{00DC}', '\u{00E1}',
    '\u{00E0}', '\u{00E2}', '\u{00E4}', '\u{00E3}', '\u{00E5}', '\u{00E7}', '\u{00E9}', '\u{00E8}',
    '\u{00EA}', '\u{00EB}', '\u{00ED}', '\u{00EC}', '\u{00EE}', '\u{00EF}', '\u{00F1}', '\u{00F3}',
    '\u{00F2}', '\u{00F4}', '\u{00F6}', '\u{00F5}', '\u{00FA}', '\u{00F9}', '\u{00FB}', '\u{00FC}',
    '\u{2020}', '\u{00B0}', '\u{00A2}', '\u{00A3}', '\u{00A7}', '\u{2022}', '\u{00B6}', '\u{00DF}',
    '\u{00AE}', '\u{00A9}', '\u{2122}', '\u{00B4}', '\u{00A8}', '\u{2260}', '\u{00C6}', '\u{00D8}',
    '\u{221E}', '\u{00B1}', '\u{2264}', '\u{2265}', '\u{00A5}', '\u{00B5}', '\u{2202}', '\u{2211}',
    '\u{220F}', '\u{03C0}', '\u{222B}', '\u{00AA}', '\u{00BA}', '\u{03A9}', '\u{00E6}', '\u{00F8}',
    '\u{00BF}', '\u{00A1}', '\u{00AC}', '\u{221A}', '\u{0192}', '\u{2248}', '\u{2206}', '\u{00AB}',
    '\u{00BB}', '\u{2026}', '\u{00A0}', '\u{00C0}', '\u{00C3}', '\u{00D5}', '\u{0152}', '\u{0153}',
    '\u{2013}', '\u{2014}', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}', '\u{00F7}', '\u{25CA}',
    '\u{00FF}', '\u{0178}', '\u{2044}', '\u{20AC}', '\u{2039}', '\u{203A}', '\u{FB01}', '\u{FB02}',
    '\u{2021}', '\u{00B7}', '\u{201A}', '\u{201E}', '\u{2030}', '\u{00C2}', '\u{00CA}', '\u{00C1}',
    '\u{00CB}', '\u{00C8}', '\u{00CD}', '\u{00CE}', '\u{00CF}', '\u{00CC}', '\u{00D3}', '\u{00D4}',
    '\u{F8FF}', '\u{00D2}', '\u{00DA}', '\u{00DB}', '\u{00D9}', '\u{0131}', '\u{02C6}', '\u{02DC}',
    '\u{00AF}', '\u{02D8}', '\u{02D9}', '\u{02DA}', '\u{00B8}', '\u{02DD}', '\u{02DB}', '\u{02C7}',
];

/// Decode a Mac Roman byte string to UTF-8.
pub fn mac_roman_to_utf8(data: &[u8]) -> String {
    data.iter()
        .map(|&b| {
            if b < 0x80 {
                b as char
            } else {
                MAC_ROMAN_TABLE[(b - 0x80) as usize]
            }
        })
        .collect()
}

/// Encode a UTF-8 string as Mac Roman, failing on unmappable characters.
pub fn utf8_to_mac_roman(s: &str) -> Result<Vec<u8>> {
    s.chars()
        .map(|c| {
            if (c as u32) < 0x80 {
                Ok(c as u8)
            } else {
                MAC_ROMAN_TABLE
                    .iter()
                    .position(|&m| m == c)
                    .map(|i| 0x80 + i as u8)
                    .ok_or_else(|| {
                        VolumeError::InvalidVolume(format!(
                            "character {c:?} has no MacRoman encoding"
                        ))
                    })
            }
        })
        .collect()
}

/// HFS extent descriptor: 16-bit start block + 16-bit block count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HfsExtent {
    pub start_block: u16,
    pub block_count: u16,
}

/// HFS Master Directory Block.
///
/// Every on-disk field is retained through a parse/write round trip, so
/// rewriting a populated volume's superblock (e.g. after a free-count
/// repair) preserves its counts and Finder info.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mdb {
    /// Seconds since 1904-01-01; wraps at 2040-02-06.
    pub create_date: u32,
    pub modify_date: u32,
    pub attributes: u16,
    /// Files in the root folder (drNmFls).
    pub root_file_count: u16,
    /// First sector of the volume bitmap (drVBMSt).
    pub bitmap_start: u16,
    /// Start of the next allocation search (drAllocPtr).
    pub alloc_ptr: u16,
    pub total_blocks: u16,
    pub block_size: u32,
    pub clump_size: u32,
    /// Sector of allocation block 0 (drAlBlSt).
    pub first_alloc_block: u16,
    /// Always >= 16; IDs 0-15 are permanently reserved.
    pub next_catalog_id: u32,
    pub free_blocks: u16,
    /// 1-27 MacRoman-encodable bytes.
    pub volume_name: String,
    pub backup_date: u32,
    pub backup_seq: u16,
    pub write_count: u32,
    pub extents_clump_size: u32,
    pub catalog_clump_size: u32,
    /// Folders in the root folder (drNmRtDirs).
    pub root_dir_count: u16,
    pub file_count: u32,
    pub folder_count: u32,
    pub finder_info: [u32; 8],
    /// Embedded-volume signature and extent (drEmbedSigWord/drEmbedExtent),
    /// non-zero only on HFS+ wrapper volumes.
    pub embed_signature: u16,
    pub embed_extent: HfsExtent,
    pub extents_file_size: u32,
    pub extents_extents: [HfsExtent; 3],
    pub catalog_file_size: u32,
    pub catalog_extents: [HfsExtent; 3],
}

impl Mdb {
    /// Parse and validate an MDB from the 512-byte superblock record.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let buf = Buf::new(data);
        let signature = buf.get_u16(0)?;
        if signature != HFS_SIGNATURE {
            return Err(VolumeError::InvalidSignature { found: signature });
        }

        let block_size = buf.get_u32(20)?;
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(VolumeError::InvalidVolume(format!(
                "MDB allocation block size {block_size} is not a power of two"
            )));
        }

        let next_catalog_id = buf.get_u32(30)?;
        if next_catalog_id < FIRST_USER_CATALOG_ID {
            return Err(VolumeError::InvalidVolume(format!(
                "next catalog ID {next_catalog_id} is inside the reserved range 0-15"
            )));
        }

        let name_len = buf.get_u8(36)? as usize;
        if name_len == 0 || name_len > MAX_VOLUME_NAME_LEN {
            return Err(VolumeError::InvalidVolume(format!(
                "volume name length {name_len} outside 1-{MAX_VOLUME_NAME_LEN}"
            )));
        }
        let volume_name = mac_roman_to_utf8(buf.get_bytes(37, name_len)?);

        let read_extents = |base: usize| -> Result<[HfsExtent; 3]> {
            let mut extents = [HfsExtent::default(); 3];
            for (i, ext) in extents.iter_mut().enumerate() {
                ext.start_block = buf.get_u16(base + i * 4)?;
                ext.block_count = buf.get_u16(base + i * 4 + 2)?;
            }
            Ok(extents)
        };

        let mut finder_info = [0u32; 8];
        for (i, word) in finder_info.iter_mut().enumerate() {
            *word = buf.get_u32(92 + i * 4)?;
        }

        Ok(Mdb {
            create_date: buf.get_u32(2)?,
            modify_date: buf.get_u32(6)?,
            attributes: buf.get_u16(10)?,
            root_file_count: buf.get_u16(12)?,
            bitmap_start: buf.get_u16(14)?,
            alloc_ptr: buf.get_u16(16)?,
            total_blocks: buf.get_u16(18)?,
            block_size,
            clump_size: buf.get_u32(24)?,
            first_alloc_block: buf.get_u16(28)?,
            next_catalog_id,
            free_blocks: buf.get_u16(34)?,
            volume_name,
            backup_date: buf.get_u32(64)?,
            backup_seq: buf.get_u16(68)?,
            write_count: buf.get_u32(70)?,
            extents_clump_size: buf.get_u32(74)?,
            catalog_clump_size: buf.get_u32(78)?,
            root_dir_count: buf.get_u16(82)?,
            file_count: buf.get_u32(84)?,
            folder_count: buf.get_u32(88)?,
            finder_info,
            embed_signature: buf.get_u16(124)?,
            embed_extent: HfsExtent {
                start_block: buf.get_u16(126)?,
                block_count: buf.get_u16(128)?,
            },
            extents_file_size: buf.get_u32(130)?,
            extents_extents: read_extents(134)?,
            catalog_file_size: buf.get_u32(146)?,
            catalog_extents: read_extents(150)?,
        })
    }

    /// Serialize into a 512-byte superblock record.
    pub fn write(&self, out: &mut [u8]) -> Result<()> {
        let name = utf8_to_mac_roman(&self.volume_name)?;
        if name.is_empty() || name.len() > MAX_VOLUME_NAME_LEN {
            return Err(VolumeError::InvalidVolume(format!(
                "volume name must encode to 1-{MAX_VOLUME_NAME_LEN} MacRoman bytes, got {}",
                name.len()
            )));
        }
        if self.next_catalog_id < FIRST_USER_CATALOG_ID {
            return Err(VolumeError::InvalidVolume(format!(
                "refusing to write next catalog ID {} below reserved floor {FIRST_USER_CATALOG_ID}",
                self.next_catalog_id
            )));
        }

        let mut buf = BufMut::new(out);
        buf.put_u16(0, HFS_SIGNATURE)?;
        buf.put_u32(2, self.create_date)?;
        buf.put_u32(6, self.modify_date)?;
        buf.put_u16(10, self.attributes)?;
        buf.put_u16(12, self.root_file_count)?;
        buf.put_u16(14, self.bitmap_start)?;
        buf.put_u16(16, self.alloc_ptr)?;
        buf.put_u16(18, self.total_blocks)?;
        buf.put_u32(20, self.block_size)?;
        buf.put_u32(24, self.clump_size)?;
        buf.put_u16(28, self.first_alloc_block)?;
        buf.put_u32(30, self.next_catalog_id)?;
        buf.put_u16(34, self.free_blocks)?;
        buf.put_u8(36, name.len() as u8)?;
        buf.put_bytes(37, &name)?;
        buf.put_u32(64, self.backup_date)?;
        buf.put_u16(68, self.backup_seq)?;
        buf.put_u32(70, self.write_count)?;
        buf.put_u32(74, self.extents_clump_size)?;
        buf.put_u32(78, self.catalog_clump_size)?;
        buf.put_u16(82, self.root_dir_count)?;
        buf.put_u32(84, self.file_count)?;
        buf.put_u32(88, self.folder_count)?;
        for (i, word) in self.finder_info.iter().enumerate() {
            buf.put_u32(92 + i * 4, *word)?;
        }
        buf.put_u16(124, self.embed_signature)?;
        buf.put_u16(126, self.embed_extent.start_block)?;
        buf.put_u16(128, self.embed_extent.block_count)?;
        buf.put_u32(130, self.extents_file_size)?;
        for (i, ext) in self.extents_extents.iter().enumerate() {
            buf.put_u16(134 + i * 4, ext.start_block)?;
            buf.put_u16(134 + i * 4 + 2, ext.block_count)?;
        }
        buf.put_u32(146, self.catalog_file_size)?;
        for (i, ext) in self.catalog_extents.iter().enumerate() {
            buf.put_u16(150 + i * 4, ext.start_block)?;
            buf.put_u16(150 + i * 4 + 2, ext.block_count)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Mdb {
            create_date: 0xB0000000,
            modify_date: 0xB0000001,
            attributes: crate::superblock::MDB_ATTR_UNMOUNTED,
            root_file_count: 0,
            bitmap_start: 3,
            alloc_ptr: 0,
            total_blocks: 1600,
            block_size: 512,
            clump_size: 2048,
            first_alloc_block: 0,
            next_catalog_id: FIRST_USER_CATALOG_ID,
            free_blocks: 1500,
            volume_name: "Untitled".into(),
            backup_date: 0,
            backup_seq: 0,
            write_count: 0,
            extents_clump_size: 4096,
            catalog_clump_size: 4096,
            root_dir_count: 0,
            file_count: 0,
            folder_count: 0,
            finder_info: [0u32; 8],
            embed_signature: 0,
            embed_extent: HfsExtent::default(),
            extents_file_size: 4096,
            extents_extents: [
                HfsExtent {
                    start_block: 10,
                    block_count: 8,
                },
                HfsExtent::default(),
                HfsExtent::default(),
            ],
            catalog_file_size: 4096,
            catalog_extents: [
                HfsExtent {
                    start_block: 18,
                    block_count: 8,
                },
                HfsExtent::default(),
                HfsExtent::default(),
            ],
        }
    }
}
