//! Superblock (Master Directory Block / Volume Header) serialization.
//!
//! A primary copy lives at byte 1024, immediately after the boot area, and a
//! byte-identical backup at exactly `volume_size - 1024` — never at the last
//! physical sector, which is a separate reserved area. Both copies agree
//! whenever the volume is clean.

pub mod mdb;
pub mod volume_header;

use chrono::{DateTime, TimeZone, Utc};
use log::debug;

pub use mdb::Mdb;
pub use volume_header::{ExtentDescriptor, ForkData, VolumeHeader};

use crate::block::BlockDevice;
use crate::error::{Result, VolumeError};
use crate::geometry::{PRIMARY_SUPERBLOCK_OFFSET, SUPERBLOCK_SIZE, VolumeKind};

pub const HFS_SIGNATURE: u16 = 0x4244; // 'BD'
pub const HFSPLUS_SIGNATURE: u16 = 0x482B; // 'H+'
pub const HFSX_SIGNATURE: u16 = 0x4858; // 'HX'

pub const HFSPLUS_VERSION: u16 = 4;
pub const HFSX_VERSION: u16 = 5;

/// Catalog IDs 0-15 are permanently reserved; a fresh volume always starts
/// handing out IDs at 16.
pub const FIRST_USER_CATALOG_ID: u32 = 16;

// MDB attribute bits (u16).
pub const MDB_ATTR_HARDWARE_LOCKED: u16 = 1 << 7;
pub const MDB_ATTR_UNMOUNTED: u16 = 1 << 8;
pub const MDB_ATTR_SOFTWARE_LOCKED: u16 = 1 << 15;

// Volume Header attribute bits (u32).
pub const VH_ATTR_HARDWARE_LOCKED: u32 = 1 << 7;
pub const VH_ATTR_UNMOUNTED: u32 = 1 << 8;
pub const VH_ATTR_SPARED_BLOCKS: u32 = 1 << 9;
pub const VH_ATTR_NO_CACHE_REQUIRED: u32 = 1 << 10;
pub const VH_ATTR_BOOT_INCONSISTENT: u32 = 1 << 11;
pub const VH_ATTR_CATALOG_IDS_REUSED: u32 = 1 << 12;
pub const VH_ATTR_JOURNALED: u32 = 1 << 13;
pub const VH_ATTR_SOFTWARE_LOCKED: u32 = 1 << 15;

/// Seconds between the Mac epoch (1904-01-01) and the Unix epoch.
pub const MAC_TO_UNIX_OFFSET: i64 = 2_082_844_800;

/// Current time as seconds since 1904-01-01. Wraps at 2040-02-06, like the
/// on-disk field itself.
pub fn mac_timestamp_now() -> u32 {
    (Utc::now().timestamp() + MAC_TO_UNIX_OFFSET) as u32
}

pub fn mac_timestamp_to_datetime(ts: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(ts as i64 - MAC_TO_UNIX_OFFSET, 0)
        .single()
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// The volume's superblock record, one of two variants selected by format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Superblock {
    Hfs(Mdb),
    HfsPlus(VolumeHeader),
}

impl Superblock {
    pub fn kind(&self) -> VolumeKind {
        match self {
            Superblock::Hfs(_) => VolumeKind::Hfs,
            Superblock::HfsPlus(_) => VolumeKind::HfsPlus,
        }
    }

    pub fn block_size(&self) -> u32 {
        match self {
            Superblock::Hfs(mdb) => mdb.block_size,
            Superblock::HfsPlus(vh) => vh.block_size,
        }
    }

    pub fn total_blocks(&self) -> u32 {
        match self {
            Superblock::Hfs(mdb) => mdb.total_blocks as u32,
            Superblock::HfsPlus(vh) => vh.total_blocks,
        }
    }

    pub fn free_blocks(&self) -> u32 {
        match self {
            Superblock::Hfs(mdb) => mdb.free_blocks as u32,
            Superblock::HfsPlus(vh) => vh.free_blocks,
        }
    }

    pub fn next_catalog_id(&self) -> u32 {
        match self {
            Superblock::Hfs(mdb) => mdb.next_catalog_id,
            Superblock::HfsPlus(vh) => vh.next_catalog_id,
        }
    }

    pub fn is_unmounted_cleanly(&self) -> bool {
        match self {
            Superblock::Hfs(mdb) => mdb.attributes & MDB_ATTR_UNMOUNTED != 0,
            Superblock::HfsPlus(vh) => vh.attributes & VH_ATTR_UNMOUNTED != 0,
        }
    }

    pub fn set_unmounted_cleanly(&mut self, clean: bool) {
        match self {
            Superblock::Hfs(mdb) => {
                if clean {
                    mdb.attributes |= MDB_ATTR_UNMOUNTED;
                } else {
                    mdb.attributes &= !MDB_ATTR_UNMOUNTED;
                }
            }
            Superblock::HfsPlus(vh) => {
                if clean {
                    vh.attributes |= VH_ATTR_UNMOUNTED;
                } else {
                    vh.attributes &= !VH_ATTR_UNMOUNTED;
                }
            }
        }
    }

    pub fn is_journaled(&self) -> bool {
        match self {
            Superblock::Hfs(_) => false,
            Superblock::HfsPlus(vh) => vh.attributes & VH_ATTR_JOURNALED != 0,
        }
    }

    /// Serialize to the 512-byte on-disk record.
    pub fn to_bytes(&self) -> Result<[u8; SUPERBLOCK_SIZE as usize]> {
        let mut out = [0u8; SUPERBLOCK_SIZE as usize];
        match self {
            Superblock::Hfs(mdb) => mdb.write(&mut out)?,
            Superblock::HfsPlus(vh) => vh.write(&mut out)?,
        }
        Ok(out)
    }
}

/// Read and validate the primary superblock at byte 1024.
///
/// Rejects any signature other than the recognized values, and fails rather
/// than defaulting fields that are mandated non-zero (clump sizes, next
/// catalog ID, block size).
pub fn read_superblock<D: BlockDevice>(device: &mut D) -> Result<Superblock> {
    let mut buf = [0u8; SUPERBLOCK_SIZE as usize];
    device.read_at(PRIMARY_SUPERBLOCK_OFFSET, &mut buf)?;
    parse_superblock(&buf)
}

pub fn parse_superblock(buf: &[u8]) -> Result<Superblock> {
    if buf.len() < 2 {
        return Err(VolumeError::InvalidVolume(
            "superblock buffer too short".into(),
        ));
    }
    let signature = u16::from_be_bytes([buf[0], buf[1]]);
    match signature {
        HFS_SIGNATURE => Ok(Superblock::Hfs(Mdb::parse(buf)?)),
        HFSPLUS_SIGNATURE | HFSX_SIGNATURE => Ok(Superblock::HfsPlus(VolumeHeader::parse(buf)?)),
        found => Err(VolumeError::InvalidSignature { found }),
    }
}

/// Write byte-identical primary and backup superblock copies and flush.
///
/// The backup lands at exactly `volume_size - 1024`; computing it as "last
/// sector minus one" is a different (wrong) location.
pub fn write_superblock<D: BlockDevice>(
    device: &mut D,
    superblock: &Superblock,
    volume_size: u64,
) -> Result<()> {
    let bytes = superblock.to_bytes()?;
    device.write_at(PRIMARY_SUPERBLOCK_OFFSET, &bytes)?;
    device.write_at(volume_size - 1024, &bytes)?;
    device.flush()?;
    debug!(
        "wrote {} superblock copies at {} and {}",
        superblock.kind().name(),
        PRIMARY_SUPERBLOCK_OFFSET,
        volume_size - 1024
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;

    #[test]
    fn test_unknown_signature_rejected() {
        let buf = [0xEBu8; 512];
        let err = parse_superblock(&buf).unwrap_err();
        assert!(matches!(
            err,
            VolumeError::InvalidSignature { found: 0xEBEB }
        ));
    }

    #[test]
    fn test_mac_timestamp_round_trip() {
        // 2004-01-01T00:00:00Z is 100 years after the Mac epoch.
        let dt = mac_timestamp_to_datetime(0);
        assert_eq!(dt.timestamp(), -MAC_TO_UNIX_OFFSET);
        let now = mac_timestamp_now();
        assert!(now > 0);
    }

    #[test]
    fn test_write_places_backup_at_size_minus_1024() {
        let size = 900 * 1024u64;
        let mut dev = MemDevice::new(size);
        let mdb = Mdb::for_tests();
        write_superblock(&mut dev, &Superblock::Hfs(mdb), size).unwrap();

        let img = dev.as_slice();
        assert_eq!(&img[1024..1026], &HFS_SIGNATURE.to_be_bytes());
        let backup = (size - 1024) as usize;
        assert_eq!(&img[backup..backup + 2], &HFS_SIGNATURE.to_be_bytes());
        // Both copies byte-identical.
        assert_eq!(&img[1024..1024 + 512], &img[backup..backup + 512]);
    }
}
