//! Volume consistency checking and repair.
//!
//! Order matters: for a journaled HFS+ volume the journal is validated and
//! replayed before any structural check, since pending transactions may
//! rewrite the very structures being checked. Structural findings are
//! accumulated, not thrown; the caller reads the final report.

use log::{info, warn};

use crate::bitmap::AllocationBitmap;
use crate::block::BlockDevice;
use crate::btree::parse_header_node;
use crate::error::{Result, VolumeError};
use crate::geometry::PRIMARY_SUPERBLOCK_OFFSET;
use crate::journal::{self, JournalStatus};
use crate::superblock::{Superblock, read_superblock, write_superblock};

/// Outcome of a consistency check.
#[derive(Debug, Default)]
pub struct Report {
    /// Journal transactions applied (0 on a dry run or a clean journal).
    pub transactions_replayed: u32,
    /// Inconsistencies that were repaired, or informational notes.
    pub warnings: Vec<String>,
    /// Uncorrected inconsistencies.
    pub errors: Vec<String>,
}

impl Report {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        warn!("check: {msg}");
        self.errors.push(msg);
    }

    fn warning(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        info!("check: {msg}");
        self.warnings.push(msg);
    }
}

/// Check a volume and optionally repair what can be repaired.
///
/// With `dry_run` true, nothing is written and every inconsistency lands in
/// `errors`. With `dry_run` false, repairable findings (pending journal,
/// stale backup superblock, free-count drift) are fixed and recorded as
/// warnings; anything unfixable stays an error.
///
/// An unreadable or unparseable primary superblock is a hard failure, as is
/// a journal on a separate device; there is nothing meaningful to check.
pub fn check_and_repair<D: BlockDevice>(device: &mut D, dry_run: bool) -> Result<Report> {
    let mut report = Report::default();
    let mut superblock = read_superblock(device)?;

    let journaled_vh = match &superblock {
        Superblock::HfsPlus(vh) if superblock.is_journaled() => Some(vh.clone()),
        _ => None,
    };
    if let Some(vh) = journaled_vh {
        match journal::validate(device, &vh)? {
            JournalStatus::Absent | JournalStatus::Clean => {}
            JournalStatus::PendingReplay => match journal::replay(device, &vh, !dry_run) {
                Ok(count) => {
                    report.transactions_replayed = count;
                    if dry_run {
                        report.error(format!("{count} journal transactions pending replay"));
                    } else {
                        report.warning(format!("replayed {count} journal transactions"));
                        // Replay may have rewritten the superblock.
                        superblock = read_superblock(device)?;
                    }
                }
                Err(e @ VolumeError::Io(_)) => return Err(e),
                Err(e) => {
                    report.error(format!("journal replay failed: {e}"));
                    return Ok(report);
                }
            },
            JournalStatus::Invalid => {
                report.error("journal fails validation; reinitialize or disable journaling");
                return Ok(report);
            }
            JournalStatus::NeedsInit => {
                report.error("journal is marked for reinitialization");
                return Ok(report);
            }
        }
    }

    check_structure(device, &mut superblock, dry_run, &mut report)?;
    info!(
        "check complete: {} errors, {} warnings",
        report.errors.len(),
        report.warnings.len()
    );
    Ok(report)
}

fn check_structure<D: BlockDevice>(
    device: &mut D,
    superblock: &mut Superblock,
    dry_run: bool,
    report: &mut Report,
) -> Result<()> {
    let block_size = superblock.block_size() as u64;
    let total_blocks = superblock.total_blocks() as u64;
    let volume_size = total_blocks * block_size;

    if volume_size > device.len() {
        report.error(format!(
            "superblock claims {volume_size} bytes but the device holds {}",
            device.len()
        ));
        // Every other check would chase offsets past the device end.
        return Ok(());
    }

    // Backup superblock agreement.
    let mut primary = [0u8; 512];
    let mut backup = [0u8; 512];
    device.read_at(PRIMARY_SUPERBLOCK_OFFSET, &mut primary)?;
    device.read_at(volume_size - 1024, &mut backup)?;
    if primary != backup {
        if dry_run {
            report.error("backup superblock does not match the primary");
        } else {
            device.write_at(volume_size - 1024, &primary)?;
            device.flush()?;
            report.warning("rewrote stale backup superblock from the primary");
        }
    }

    // Bitmap free-count agreement.
    match read_bitmap(device, superblock)? {
        Some(bitmap) => {
            let counted = bitmap.count_clear();
            let recorded = superblock.free_blocks() as u64;
            if counted != recorded {
                if dry_run {
                    report.error(format!(
                        "superblock records {recorded} free blocks, bitmap counts {counted}"
                    ));
                } else {
                    set_free_blocks(superblock, counted);
                    write_superblock(device, superblock, volume_size)?;
                    report.warning(format!(
                        "corrected free-block count {recorded} -> {counted}"
                    ));
                }
            }
        }
        None => report.error("allocation bitmap location is unreadable"),
    }

    // B-tree header sanity for each system tree file.
    for (label, start_block, node_size) in tree_files(superblock) {
        let Some(start_block) = start_block else {
            report.error(format!("{label} file has no extents"));
            continue;
        };
        if start_block as u64 >= total_blocks {
            report.error(format!(
                "{label} file starts at block {start_block}, past {total_blocks}"
            ));
            continue;
        }
        let mut node = vec![0u8; node_size as usize];
        device.read_at(start_block as u64 * block_size, &mut node)?;
        match parse_header_node(&node) {
            Ok(header) => {
                if header.node_size != node_size {
                    report.error(format!(
                        "{label} tree declares {}-byte nodes, expected {node_size}",
                        header.node_size
                    ));
                }
            }
            Err(e) => report.error(format!("{label} tree header: {e}")),
        }
    }

    Ok(())
}

/// Load the allocation bitmap for either format. `None` when its recorded
/// location cannot be read.
fn read_bitmap<D: BlockDevice>(
    device: &mut D,
    superblock: &Superblock,
) -> Result<Option<AllocationBitmap>> {
    let total_blocks = superblock.total_blocks() as u64;
    let bytes = total_blocks.div_ceil(8) as usize;
    let offset = match superblock {
        Superblock::Hfs(mdb) => mdb.bitmap_start as u64 * 512,
        Superblock::HfsPlus(vh) => match vh.allocation_file.first_block() {
            Some(block) => block as u64 * vh.block_size as u64,
            None => return Ok(None),
        },
    };
    let mut data = vec![0u8; bytes];
    if device.read_at(offset, &mut data).is_err() {
        return Ok(None);
    }
    Ok(Some(AllocationBitmap::from_bytes(data, total_blocks)))
}

fn set_free_blocks(superblock: &mut Superblock, free: u64) {
    match superblock {
        Superblock::Hfs(mdb) => mdb.free_blocks = free as u16,
        Superblock::HfsPlus(vh) => vh.free_blocks = free as u32,
    }
}

/// (label, first block, expected node size) for every tree file the format
/// carries.
fn tree_files(superblock: &Superblock) -> Vec<(&'static str, Option<u32>, u16)> {
    match superblock {
        Superblock::Hfs(mdb) => vec![
            (
                "extents overflow",
                (mdb.extents_extents[0].block_count > 0)
                    .then_some(mdb.extents_extents[0].start_block as u32),
                512,
            ),
            (
                "catalog",
                (mdb.catalog_extents[0].block_count > 0)
                    .then_some(mdb.catalog_extents[0].start_block as u32),
                512,
            ),
        ],
        Superblock::HfsPlus(vh) => vec![
            ("extents overflow", vh.extents_file.first_block(), 4096),
            ("catalog", vh.catalog_file.first_block(), 4096),
            ("attributes", vh.attributes_file.first_block(), 4096),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::MemDevice;
    use crate::format::{FormatOptions, format};
    use crate::geometry::{GeometryRequest, VolumeKind};

    fn formatted(kind: VolumeKind, size: u64, options: &FormatOptions) -> MemDevice {
        let mut dev = MemDevice::new(size);
        format(
            &mut dev,
            &GeometryRequest {
                size_bytes: size,
                kind,
                block_size: None,
            },
            "Checked",
            options,
        )
        .unwrap();
        dev
    }

    #[test]
    fn test_fresh_volumes_check_clean() {
        for (kind, size) in [
            (VolumeKind::Hfs, 800 * 1024u64),
            (VolumeKind::HfsPlus, 10 * 1024 * 1024),
        ] {
            let mut dev = formatted(kind, size, &FormatOptions::default());
            let report = check_and_repair(&mut dev, true).unwrap();
            assert!(report.is_clean(), "{kind:?}: {:?}", report.errors);
            assert_eq!(report.transactions_replayed, 0);
        }
    }

    #[test]
    fn test_fresh_journaled_volume_checks_clean() {
        let mut dev = formatted(
            VolumeKind::HfsPlus,
            64 * 1024 * 1024,
            &FormatOptions {
                journaled: true,
                ..Default::default()
            },
        );
        let report = check_and_repair(&mut dev, true).unwrap();
        assert!(report.is_clean(), "{:?}", report.errors);
    }

    #[test]
    fn test_stale_backup_detected_and_repaired() {
        let size = 800 * 1024u64;
        let mut dev = formatted(VolumeKind::Hfs, size, &FormatOptions::default());
        // Clobber one byte of the backup copy.
        let backup_off = size - 1024;
        dev.write_at(backup_off + 100, &[0xFF]).unwrap();

        let report = check_and_repair(&mut dev, true).unwrap();
        assert!(!report.is_clean());

        let report = check_and_repair(&mut dev, false).unwrap();
        assert!(report.is_clean());
        assert_eq!(report.warnings.len(), 1);

        // Repaired: a second dry run is clean.
        let report = check_and_repair(&mut dev, true).unwrap();
        assert!(report.is_clean());
    }

    #[test]
    fn test_free_count_drift_detected_and_repaired() {
        let size = 800 * 1024u64;
        let mut dev = formatted(VolumeKind::Hfs, size, &FormatOptions::default());
        // Corrupt the recorded free-block count in both copies.
        let mut primary = [0u8; 512];
        dev.read_at(1024, &mut primary).unwrap();
        primary[34..36].copy_from_slice(&9u16.to_be_bytes());
        dev.write_at(1024, &primary).unwrap();
        dev.write_at(size - 1024, &primary).unwrap();

        let report = check_and_repair(&mut dev, true).unwrap();
        assert!(report.errors.iter().any(|e| e.contains("free blocks")));

        let report = check_and_repair(&mut dev, false).unwrap();
        assert!(report.is_clean());
        assert!(check_and_repair(&mut dev, true).unwrap().is_clean());
    }

    #[test]
    fn test_repair_preserves_populated_mdb_fields() {
        let size = 800 * 1024u64;
        let mut dev = formatted(VolumeKind::Hfs, size, &FormatOptions::default());
        // A volume with content: non-zero file count alongside a free-count
        // drift that repair will rewrite the superblock to correct.
        let mut primary = [0u8; 512];
        dev.read_at(1024, &mut primary).unwrap();
        primary[84..88].copy_from_slice(&5u32.to_be_bytes()); // drFilCnt
        primary[88..92].copy_from_slice(&2u32.to_be_bytes()); // drDirCnt
        primary[34..36].copy_from_slice(&9u16.to_be_bytes()); // stale free count
        dev.write_at(1024, &primary).unwrap();
        dev.write_at(size - 1024, &primary).unwrap();

        let report = check_and_repair(&mut dev, false).unwrap();
        assert!(report.is_clean(), "{:?}", report.errors);

        let mdb = match read_superblock(&mut dev).unwrap() {
            Superblock::Hfs(mdb) => mdb,
            _ => unreachable!(),
        };
        assert_eq!(mdb.file_count, 5);
        assert_eq!(mdb.folder_count, 2);
        assert_ne!(mdb.free_blocks, 9);
    }

    #[test]
    fn test_smashed_tree_header_reported() {
        let size = 10 * 1024 * 1024u64;
        let mut dev = formatted(VolumeKind::HfsPlus, size, &FormatOptions::default());
        let sb = read_superblock(&mut dev).unwrap();
        let vh = match sb {
            Superblock::HfsPlus(vh) => vh,
            _ => unreachable!(),
        };
        let catalog_start = vh.catalog_file.first_block().unwrap();
        dev.write_at(
            catalog_start as u64 * vh.block_size as u64,
            &[0u8; 4096],
        )
        .unwrap();

        let report = check_and_repair(&mut dev, true).unwrap();
        assert!(report.errors.iter().any(|e| e.contains("catalog")));
    }

    #[test]
    fn test_unformatted_device_is_hard_error() {
        let mut dev = MemDevice::new(1024 * 1024);
        assert!(matches!(
            check_and_repair(&mut dev, true).unwrap_err(),
            VolumeError::InvalidSignature { .. }
        ));
    }
}
