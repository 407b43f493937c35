//! Volume creation: layout planning and system-file initialization.
//!
//! Formatting never commits a byte until the whole layout is confirmed to
//! fit. The superblock copies are written last, so an I/O failure partway
//! through leaves no volume that parses as valid.

use log::{debug, info};

use crate::bitmap::AllocationBitmap;
use crate::block::BlockDevice;
use crate::btree::{TreeKind, build_header_node};
use crate::error::{Result, VolumeError};
use crate::geometry::{BOOT_AREA_SIZE, GeometryRequest, VolumeGeometry, VolumeKind};
use crate::journal;
use crate::superblock::mdb::{HfsExtent, Mdb, utf8_to_mac_roman, MAX_VOLUME_NAME_LEN};
use crate::superblock::volume_header::{ForkData, VolumeHeader};
use crate::superblock::{
    FIRST_USER_CATALOG_ID, HFSPLUS_SIGNATURE, HFSPLUS_VERSION, HFSX_SIGNATURE, HFSX_VERSION,
    MDB_ATTR_UNMOUNTED, Superblock, VH_ATTR_JOURNALED, VH_ATTR_UNMOUNTED, mac_timestamp_now,
    write_superblock,
};

/// Number of nodes each freshly initialized B-tree file spans.
const INITIAL_TREE_NODES: u32 = 8;

/// Default fork clump size for user files on HFS+.
const DEFAULT_FORK_CLUMP: u32 = 65536;

/// Journal size bounds when the caller does not pick one: 1% of the volume,
/// clamped to [512 KiB, 8 MiB].
const MIN_JOURNAL_SIZE: u64 = 512 * 1024;
const MAX_JOURNAL_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone, Default)]
pub struct FormatOptions {
    /// Enable journaling (HFS+ only).
    pub journaled: bool,
    /// Explicit journal region size; `None` derives one from the volume size.
    pub journal_size: Option<u64>,
    /// Format as case-sensitive HFSX instead of HFS+.
    pub case_sensitive: bool,
}

/// A contiguous run of allocation blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Run {
    start: u32,
    blocks: u32,
}

impl Run {
    fn end(&self) -> u32 {
        self.start + self.blocks
    }
}

/// The complete placement of every system structure, computed before any
/// write. Either everything fits or formatting fails up front.
#[derive(Debug, Clone)]
pub struct VolumeLayout {
    geometry: VolumeGeometry,
    /// Boot area, superblock, and (for HFS) the bitmap sectors.
    head: Run,
    bitmap_bytes: u64,
    /// HFS+ allocation file; the HFS bitmap lives inside `head` instead.
    allocation: Option<Run>,
    extents: Run,
    catalog: Run,
    attributes: Option<Run>,
    journal_info: Option<u32>,
    journal: Option<Run>,
    /// Backup superblock and trailing reserved bytes.
    tail: Run,
    free_blocks: u32,
}

impl VolumeLayout {
    /// Place every system structure for the given geometry, or fail with
    /// [`VolumeError::GeometryOverflow`] if they do not all fit.
    pub fn plan(geometry: VolumeGeometry, options: &FormatOptions) -> Result<Self> {
        if options.journaled && geometry.kind == VolumeKind::Hfs {
            return Err(VolumeError::UnsupportedJournalConfiguration(
                "classic HFS has no journal".into(),
            ));
        }

        let bitmap_bytes = (geometry.total_blocks as u64).div_ceil(8);
        let head_bytes = match geometry.kind {
            // Boot area + MDB + bitmap, packed from sector 3.
            VolumeKind::Hfs => BOOT_AREA_SIZE + 512 + bitmap_bytes,
            VolumeKind::HfsPlus => BOOT_AREA_SIZE + 512,
        };
        let head = Run {
            start: 0,
            blocks: geometry.blocks_for_bytes(head_bytes),
        };
        let mut next = head.end();

        let mut take = |bytes: u64| -> Run {
            let run = Run {
                start: next,
                blocks: geometry.blocks_for_bytes(bytes),
            };
            next = run.end();
            run
        };

        let (allocation, extents, catalog, attributes) = match geometry.kind {
            VolumeKind::Hfs => {
                let tree_bytes = INITIAL_TREE_NODES as u64 * 512;
                (None, take(tree_bytes), take(tree_bytes), None)
            }
            VolumeKind::HfsPlus => {
                let tree_bytes = INITIAL_TREE_NODES as u64 * 4096;
                (
                    Some(take(bitmap_bytes)),
                    take(tree_bytes),
                    take(tree_bytes),
                    Some(take(tree_bytes)),
                )
            }
        };

        let (journal_info, journal) = if options.journaled {
            let size = options
                .journal_size
                .unwrap_or_else(|| (geometry.size_bytes / 100).clamp(MIN_JOURNAL_SIZE, MAX_JOURNAL_SIZE));
            let info_block = take(geometry.block_size as u64).start;
            (Some(info_block), Some(take(size)))
        } else {
            (None, None)
        };

        let tail_blocks = geometry.blocks_for_bytes(BOOT_AREA_SIZE);
        let used = next as u64 + tail_blocks as u64;
        if used > geometry.total_blocks as u64 {
            return Err(VolumeError::GeometryOverflow {
                blocks: used,
                width: geometry.kind.addressing_width(),
            });
        }
        let tail = Run {
            start: geometry.total_blocks - tail_blocks,
            blocks: tail_blocks,
        };

        Ok(VolumeLayout {
            geometry,
            head,
            bitmap_bytes,
            allocation,
            extents,
            catalog,
            attributes,
            journal_info,
            journal,
            tail,
            free_blocks: tail.start - next,
        })
    }

    pub fn free_blocks(&self) -> u32 {
        self.free_blocks
    }

    /// The allocation bitmap with exactly the metadata blocks set.
    fn build_bitmap(&self) -> Result<AllocationBitmap> {
        let mut bitmap = AllocationBitmap::new(self.geometry.total_blocks as u64);
        let mut used: Vec<Run> = vec![self.head];
        used.extend(self.allocation);
        used.push(self.extents);
        used.push(self.catalog);
        used.extend(self.attributes);
        if let Some(info) = self.journal_info {
            used.push(Run {
                start: info,
                blocks: 1,
            });
        }
        used.extend(self.journal);
        used.push(self.tail);
        for run in used {
            bitmap.set_range(run.start as u64, run.blocks as u64)?;
        }
        Ok(bitmap)
    }

    fn build_mdb(&self, name: &str) -> Result<Mdb> {
        let encoded = utf8_to_mac_roman(name)?;
        if encoded.is_empty() || encoded.len() > MAX_VOLUME_NAME_LEN {
            return Err(VolumeError::InvalidVolume(format!(
                "volume name must encode to 1-{MAX_VOLUME_NAME_LEN} MacRoman bytes, got {}",
                encoded.len()
            )));
        }
        let now = mac_timestamp_now();
        let tree_size = INITIAL_TREE_NODES * 512;
        let extent_for = |run: Run| {
            [
                HfsExtent {
                    start_block: run.start as u16,
                    block_count: run.blocks as u16,
                },
                HfsExtent::default(),
                HfsExtent::default(),
            ]
        };
        Ok(Mdb {
            create_date: now,
            modify_date: now,
            attributes: MDB_ATTR_UNMOUNTED,
            root_file_count: 0,
            bitmap_start: 3, // first sector past the boot area and MDB
            alloc_ptr: 0,
            total_blocks: self.geometry.total_blocks as u16,
            block_size: self.geometry.block_size,
            clump_size: self.geometry.block_size * 4,
            first_alloc_block: 0,
            next_catalog_id: FIRST_USER_CATALOG_ID,
            free_blocks: self.free_blocks as u16,
            volume_name: name.to_string(),
            backup_date: 0,
            backup_seq: 0,
            write_count: 0,
            extents_clump_size: tree_size,
            catalog_clump_size: tree_size,
            root_dir_count: 0,
            file_count: 0,
            folder_count: 0,
            finder_info: [0u32; 8],
            embed_signature: 0,
            embed_extent: HfsExtent::default(),
            extents_file_size: tree_size,
            extents_extents: extent_for(self.extents),
            catalog_file_size: tree_size,
            catalog_extents: extent_for(self.catalog),
        })
    }

    fn build_volume_header(&self, options: &FormatOptions) -> VolumeHeader {
        let now = mac_timestamp_now();
        let bs = self.geometry.block_size;
        let tree_clump = INITIAL_TREE_NODES * 4096;
        let fork = |run: Run| ForkData::contiguous(run.start, run.blocks, bs, tree_clump);
        let allocation = self.allocation.expect("HFS+ layout has an allocation file");
        let attributes_file = self.attributes.expect("HFS+ layout has an attributes file");

        let (signature, version) = if options.case_sensitive {
            (HFSX_SIGNATURE, HFSX_VERSION)
        } else {
            (HFSPLUS_SIGNATURE, HFSPLUS_VERSION)
        };
        let mut attributes = VH_ATTR_UNMOUNTED;
        if options.journaled {
            attributes |= VH_ATTR_JOURNALED;
        }

        VolumeHeader {
            signature,
            version,
            attributes,
            last_mounted_version: u32::from_be_bytes(*b"10.0"),
            journal_info_block: self.journal_info.unwrap_or(0),
            create_date: now,
            modify_date: now,
            backup_date: 0,
            checked_date: now,
            file_count: 0,
            folder_count: 0,
            block_size: bs,
            total_blocks: self.geometry.total_blocks,
            free_blocks: self.free_blocks,
            next_allocation: self.tail.start - self.free_blocks,
            rsrc_clump_size: DEFAULT_FORK_CLUMP.max(bs),
            data_clump_size: DEFAULT_FORK_CLUMP.max(bs),
            next_catalog_id: FIRST_USER_CATALOG_ID,
            write_count: 0,
            encodings_bitmap: 1, // MacRoman
            finder_info: [0u32; 8],
            allocation_file: ForkData {
                logical_size: self.bitmap_bytes,
                ..fork(allocation)
            },
            extents_file: fork(self.extents),
            catalog_file: fork(self.catalog),
            attributes_file: fork(attributes_file),
            startup_file: ForkData::default(),
        }
    }
}

/// Format a device: plan geometry and layout, write the system files, and
/// commit the superblock copies last.
///
/// The fresh volume is marked unmounted-cleanly and its next catalog ID is
/// 16 regardless of anything the caller might prefer; lower IDs are
/// permanently reserved.
pub fn format<D: BlockDevice>(
    device: &mut D,
    request: &GeometryRequest,
    name: &str,
    options: &FormatOptions,
) -> Result<VolumeGeometry> {
    let geometry = VolumeGeometry::plan(request)?;
    if geometry.size_bytes > device.len() {
        return Err(VolumeError::InvalidVolume(format!(
            "volume of {} bytes does not fit device of {} bytes",
            geometry.size_bytes,
            device.len()
        )));
    }
    let layout = VolumeLayout::plan(geometry, options)?;
    let bitmap = layout.build_bitmap()?;
    debug!(
        "layout: {} blocks of {} bytes, {} free",
        geometry.total_blocks, geometry.block_size, layout.free_blocks
    );

    // Superblock records are built (and therefore validated) before any
    // write reaches the device.
    let superblock = match geometry.kind {
        VolumeKind::Hfs => Superblock::Hfs(layout.build_mdb(name)?),
        VolumeKind::HfsPlus => Superblock::HfsPlus(layout.build_volume_header(options)),
    };

    device.write_at(0, &[0u8; BOOT_AREA_SIZE as usize])?;

    match geometry.kind {
        VolumeKind::Hfs => {
            // Bitmap packed right after the MDB, at sector 3.
            device.write_at(1536, bitmap.as_bytes())?;
            let tree_clump = INITIAL_TREE_NODES * 512;
            let extents = build_header_node(TreeKind::HfsExtents, INITIAL_TREE_NODES, tree_clump)?;
            device.write_at(geometry.block_offset(layout.extents.start), &extents)?;
            let catalog = build_header_node(TreeKind::HfsCatalog, INITIAL_TREE_NODES, tree_clump)?;
            device.write_at(geometry.block_offset(layout.catalog.start), &catalog)?;
        }
        VolumeKind::HfsPlus => {
            let allocation = layout.allocation.expect("planned above");
            device.write_at(geometry.block_offset(allocation.start), bitmap.as_bytes())?;

            let tree_clump = INITIAL_TREE_NODES * 4096;
            for (kind, run) in [
                (TreeKind::PlusExtents, layout.extents),
                (TreeKind::PlusCatalog, layout.catalog),
                (
                    TreeKind::PlusAttributes,
                    layout.attributes.expect("planned above"),
                ),
            ] {
                let node = build_header_node(kind, INITIAL_TREE_NODES, tree_clump)?;
                device.write_at(geometry.block_offset(run.start), &node)?;
            }

            if let (Some(info), Some(region)) = (layout.journal_info, layout.journal) {
                journal::initialize(
                    device,
                    geometry.block_offset(info),
                    geometry.block_offset(region.start),
                    region.blocks as u64 * geometry.block_size as u64,
                    geometry.block_size,
                )?;
            }
        }
    }

    write_superblock(device, &superblock, geometry.size_bytes)?;
    info!(
        "formatted {} volume \"{}\": {} blocks of {} bytes",
        geometry.kind.name(),
        name,
        geometry.total_blocks,
        geometry.block_size
    );
    Ok(geometry)
}
