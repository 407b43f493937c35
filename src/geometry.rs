//! Volume geometry planning.
//!
//! Given a target byte size and format variant, derives the allocation-block
//! size and total block count, and the fixed offsets of the superblock
//! copies. The block-size choice bounds the smallest addressable file, so it
//! is deterministic and documented: the smallest power-of-two multiple of
//! the 512-byte sector that keeps the block count within the format's
//! addressing width, floored at 512 bytes for HFS and 4 KiB for HFS+.

use crate::error::{Result, VolumeError};

pub const SECTOR_SIZE: u64 = 512;
/// Opaque boot area at the front of every volume.
pub const BOOT_AREA_SIZE: u64 = 1024;
/// Size of the MDB / Volume Header record on disk.
pub const SUPERBLOCK_SIZE: u64 = 512;
/// Byte offset of the primary superblock, immediately after the boot area.
pub const PRIMARY_SUPERBLOCK_OFFSET: u64 = 1024;

/// Smallest supported HFS volume.
pub const HFS_MIN_BYTES: u64 = 800 * 1024;
/// Practical floor for HFS+; anything smaller forces unreasonable block sizes.
pub const HFSPLUS_MIN_BYTES: u64 = 10 * 1024 * 1024;

/// Largest allocation block the planner will choose before giving up.
const MAX_BLOCK_SIZE: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeKind {
    Hfs,
    HfsPlus,
}

impl VolumeKind {
    pub fn name(&self) -> &'static str {
        match self {
            VolumeKind::Hfs => "HFS",
            VolumeKind::HfsPlus => "HFS+",
        }
    }

    pub fn min_bytes(&self) -> u64 {
        match self {
            VolumeKind::Hfs => HFS_MIN_BYTES,
            VolumeKind::HfsPlus => HFSPLUS_MIN_BYTES,
        }
    }

    /// Block counts are 16-bit in the MDB and 32-bit in the Volume Header.
    pub fn max_blocks(&self) -> u64 {
        match self {
            VolumeKind::Hfs => u16::MAX as u64,
            VolumeKind::HfsPlus => u32::MAX as u64,
        }
    }

    pub fn addressing_width(&self) -> u32 {
        match self {
            VolumeKind::Hfs => 16,
            VolumeKind::HfsPlus => 32,
        }
    }

    pub fn min_block_size(&self) -> u32 {
        match self {
            VolumeKind::Hfs => 512,
            VolumeKind::HfsPlus => 4096,
        }
    }
}

/// What the caller wants formatted.
#[derive(Debug, Clone)]
pub struct GeometryRequest {
    pub size_bytes: u64,
    pub kind: VolumeKind,
    /// Explicit allocation-block size; `None` selects the smallest valid one.
    pub block_size: Option<u32>,
}

/// Derived volume geometry. Not persisted; every field is recomputable from
/// the size and format variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumeGeometry {
    pub kind: VolumeKind,
    pub size_bytes: u64,
    pub block_size: u32,
    pub total_blocks: u32,
    pub primary_superblock_offset: u64,
    pub backup_superblock_offset: u64,
}

impl VolumeGeometry {
    /// Plan geometry for a request, or fail if the size is below the
    /// format's minimum or cannot fit the addressing width.
    pub fn plan(req: &GeometryRequest) -> Result<Self> {
        let kind = req.kind;
        if req.size_bytes < kind.min_bytes() {
            return Err(VolumeError::SizeBelowMinimum {
                requested: req.size_bytes,
                minimum: kind.min_bytes(),
                kind: kind.name(),
            });
        }
        if req.size_bytes % SECTOR_SIZE != 0 {
            return Err(VolumeError::InvalidVolume(format!(
                "volume size {} is not a multiple of the {SECTOR_SIZE}-byte sector",
                req.size_bytes
            )));
        }

        let block_size = match req.block_size {
            Some(explicit) => {
                validate_block_size(kind, req.size_bytes, explicit)?;
                explicit
            }
            None => choose_block_size(kind, req.size_bytes)?,
        };

        let total_blocks = (req.size_bytes / block_size as u64) as u32;
        Ok(VolumeGeometry {
            kind,
            size_bytes: req.size_bytes,
            block_size,
            total_blocks,
            primary_superblock_offset: PRIMARY_SUPERBLOCK_OFFSET,
            // Always `size - 1024`, never "last sector minus one".
            backup_superblock_offset: req.size_bytes - 1024,
        })
    }

    /// Byte offset of allocation block `block`.
    pub fn block_offset(&self, block: u32) -> u64 {
        block as u64 * self.block_size as u64
    }

    /// Number of allocation blocks needed to hold `bytes`.
    pub fn blocks_for_bytes(&self, bytes: u64) -> u32 {
        bytes.div_ceil(self.block_size as u64) as u32
    }
}

/// Smallest power-of-two block size that keeps the block count within the
/// format's addressing width.
fn choose_block_size(kind: VolumeKind, size_bytes: u64) -> Result<u32> {
    let mut block_size = kind.min_block_size() as u64;
    while size_bytes / block_size > kind.max_blocks() {
        block_size *= 2;
        if block_size > MAX_BLOCK_SIZE {
            return Err(VolumeError::GeometryOverflow {
                blocks: size_bytes / MAX_BLOCK_SIZE,
                width: kind.addressing_width(),
            });
        }
    }
    Ok(block_size as u32)
}

fn validate_block_size(kind: VolumeKind, size_bytes: u64, block_size: u32) -> Result<()> {
    if block_size == 0
        || !block_size.is_power_of_two()
        || (block_size as u64) % SECTOR_SIZE != 0
        || (block_size as u64) < kind.min_block_size() as u64
    {
        return Err(VolumeError::InvalidVolume(format!(
            "block size {block_size} must be a power-of-two multiple of {SECTOR_SIZE} \
             and at least {} for {}",
            kind.min_block_size(),
            kind.name()
        )));
    }
    let blocks = size_bytes / block_size as u64;
    if blocks > kind.max_blocks() {
        return Err(VolumeError::GeometryOverflow {
            blocks,
            width: kind.addressing_width(),
        });
    }
    Ok(())
}
