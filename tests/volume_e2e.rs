//! End-to-end tests: format, reopen, check, and journal recovery against
//! in-memory and file-backed images.

use anyhow::Result;

use hfskit::journal::{self, JOURNAL_HEADER_SIZE, JournalHeader, JournalInfoBlock, checksum};
use hfskit::superblock::{
    FIRST_USER_CATALOG_ID, Superblock, VH_ATTR_JOURNALED, VH_ATTR_UNMOUNTED, read_superblock,
};
use hfskit::{
    BlockDevice, FileDevice, FormatOptions, GeometryRequest, MemDevice, Volume, VolumeKind,
    check_and_repair, format,
};

fn request(size: u64, kind: VolumeKind) -> GeometryRequest {
    GeometryRequest {
        size_bytes: size,
        kind,
        block_size: None,
    }
}

/// An 800 KiB HFS image gets 512-byte blocks, 1600 total blocks, the HFS
/// signature at byte 1024, and the backup signature at 818176.
#[test]
fn test_format_800k_hfs_image() -> Result<()> {
    let size = 800 * 1024u64;
    let mut dev = MemDevice::new(size);
    let geometry = format(
        &mut dev,
        &request(size, VolumeKind::Hfs),
        "Classic",
        &FormatOptions::default(),
    )?;
    assert_eq!(geometry.block_size, 512);
    assert_eq!(geometry.total_blocks, 1600);

    let img = dev.as_slice();
    assert_eq!(&img[1024..1026], &[0x42, 0x44]);
    assert_eq!(&img[818176..818178], &[0x42, 0x44]);
    Ok(())
}

/// A fresh 10 MiB HFS+ volume reads back unmounted-cleanly with the
/// journaled bit clear, and journaled only when requested.
#[test]
fn test_format_10m_hfsplus_attributes() -> Result<()> {
    let size = 10 * 1024 * 1024u64;
    let mut dev = MemDevice::new(size);
    format(
        &mut dev,
        &request(size, VolumeKind::HfsPlus),
        "Modern",
        &FormatOptions::default(),
    )?;

    let sb = read_superblock(&mut dev)?;
    assert!(sb.is_unmounted_cleanly());
    assert!(!sb.is_journaled());

    let mut dev = MemDevice::new(size);
    format(
        &mut dev,
        &request(size, VolumeKind::HfsPlus),
        "Modern",
        &FormatOptions {
            journaled: true,
            ..Default::default()
        },
    )?;
    assert!(read_superblock(&mut dev)?.is_journaled());
    Ok(())
}

/// Superblock round-trip: every field except timestamps survives
/// write-then-read, and timestamps are sane.
#[test]
fn test_superblock_round_trip_all_geometries() -> Result<()> {
    for (size, kind) in [
        (800 * 1024u64, VolumeKind::Hfs),
        (4 * 1024 * 1024, VolumeKind::Hfs),
        (10 * 1024 * 1024, VolumeKind::HfsPlus),
        (64 * 1024 * 1024, VolumeKind::HfsPlus),
    ] {
        let mut dev = MemDevice::new(size);
        format(&mut dev, &request(size, kind), "Roundtrip", &FormatOptions::default())?;

        let sb = read_superblock(&mut dev)?;
        assert_eq!(sb.kind(), kind);
        assert_eq!(
            sb.total_blocks() as u64 * sb.block_size() as u64,
            size,
            "blocks must cover the whole volume"
        );
        assert!(sb.next_catalog_id() >= FIRST_USER_CATALOG_ID);

        match &sb {
            Superblock::Hfs(mdb) => {
                assert_eq!(mdb.volume_name, "Roundtrip");
                assert!(mdb.create_date > 0);
                assert!(mdb.modify_date >= mdb.create_date);
            }
            Superblock::HfsPlus(vh) => {
                assert!(vh.create_date > 0);
                assert!(vh.modify_date >= vh.create_date);
            }
        }

        // Backup copy sits at exactly size - 1024 and matches the primary.
        let img = dev.as_slice();
        let backup = (size - 1024) as usize;
        assert_eq!(&img[1024..1536], &img[backup..backup + 512]);
    }
    Ok(())
}

/// The whole flow also works through a real file with its advisory lock.
#[test]
fn test_format_and_reopen_file_image() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("volume.img");
    let size = 10 * 1024 * 1024u64;

    let mut dev = FileDevice::create(&path, size)?;
    format(
        &mut dev,
        &request(size, VolumeKind::HfsPlus),
        "OnDisk",
        &FormatOptions::default(),
    )?;
    drop(dev);

    let vol = Volume::open(FileDevice::open(&path)?)?;
    assert_eq!(vol.kind(), VolumeKind::HfsPlus);
    assert_eq!(vol.size_bytes(), size);
    Ok(())
}

/// Build a journaled volume whose journal holds one pending transaction:
/// `start = 0`, `end = 512`, a 508-byte block list plus 4 payload bytes
/// destined for block 100.
fn volume_with_pending_transaction(payload: &[u8; 4]) -> Result<(MemDevice, u64)> {
    let size = 10 * 1024 * 1024u64;
    let mut dev = MemDevice::new(size);
    format(
        &mut dev,
        &request(size, VolumeKind::HfsPlus),
        "Crashed",
        &FormatOptions::default(),
    )?;

    // Enable journaling by hand so the header geometry is ours to pick.
    let mut vh = match read_superblock(&mut dev)? {
        Superblock::HfsPlus(vh) => vh,
        _ => unreachable!(),
    };
    let info_block = 2000u32;
    let journal_offset = 2001u64 * vh.block_size as u64;
    vh.attributes = VH_ATTR_UNMOUNTED | VH_ATTR_JOURNALED;
    vh.journal_info_block = info_block;
    hfskit::write_superblock(&mut dev, &Superblock::HfsPlus(vh.clone()), size)?;

    let info = JournalInfoBlock {
        flags: journal::JIB_FLAG_IN_FS,
        offset: journal_offset,
        size: 64 * 1024,
    };
    let mut info_buf = [0u8; JournalInfoBlock::SIZE];
    info.write(&mut info_buf)?;
    dev.write_at(info_block as u64 * vh.block_size as u64, &info_buf)?;

    let header = JournalHeader {
        start: 0,
        end: 512,
        size: 64 * 1024,
        blhdr_size: 508,
        jhdr_size: 512,
    };
    dev.write_at(journal_offset, &header.to_bytes())?;

    // One transaction: 508-byte block list + 4 payload bytes = 512 used.
    let mut blhdr = [0u8; 508];
    blhdr[0..2].copy_from_slice(&8u16.to_be_bytes()); // max_blocks
    blhdr[2..4].copy_from_slice(&1u16.to_be_bytes()); // num_blocks
    blhdr[4..8].copy_from_slice(&512u32.to_be_bytes()); // bytes_used
    blhdr[16..24].copy_from_slice(&100u64.to_be_bytes()); // destination
    blhdr[24..28].copy_from_slice(&4u32.to_be_bytes()); // payload size
    let sum = checksum(&blhdr);
    blhdr[8..12].copy_from_slice(&sum.to_be_bytes());

    let tx_offset = journal_offset + 512;
    dev.write_at(tx_offset, &blhdr)?;
    dev.write_at(tx_offset + 508, payload)?;
    Ok((dev, journal_offset))
}

/// Replay applies the pending transaction to block 100 and advances the
/// journal header's start to 512.
#[test]
fn test_journal_replay_recovers_pending_transaction() -> Result<()> {
    let payload = *b"\x11\x22\x33\x44";
    let (mut dev, journal_offset) = volume_with_pending_transaction(&payload)?;
    let vh = match read_superblock(&mut dev)? {
        Superblock::HfsPlus(vh) => vh,
        _ => unreachable!(),
    };

    assert_eq!(
        journal::validate(&mut dev, &vh)?,
        journal::JournalStatus::PendingReplay
    );
    assert_eq!(journal::replay(&mut dev, &vh, true)?, 1);

    let mut block = [0u8; 4];
    dev.read_at(100 * vh.block_size as u64, &mut block)?;
    assert_eq!(block, payload);

    let mut header_buf = [0u8; JOURNAL_HEADER_SIZE];
    dev.read_at(journal_offset, &mut header_buf)?;
    let header = JournalHeader::parse(&header_buf)?;
    assert_eq!(header.start, 512);
    assert_eq!(header.start, header.end);
    Ok(())
}

/// Replay on a clean journal is a cheap no-op, twice in a row.
#[test]
fn test_journal_replay_is_idempotent() -> Result<()> {
    let payload = *b"\xAB\xCD\xEF\x01";
    let (mut dev, _) = volume_with_pending_transaction(&payload)?;
    let vh = match read_superblock(&mut dev)? {
        Superblock::HfsPlus(vh) => vh,
        _ => unreachable!(),
    };

    assert_eq!(journal::replay(&mut dev, &vh, true)?, 1);
    let snapshot = dev.as_slice().to_vec();
    assert_eq!(journal::replay(&mut dev, &vh, true)?, 0);
    assert_eq!(journal::replay(&mut dev, &vh, true)?, 0);
    assert_eq!(dev.as_slice(), &snapshot[..]);
    Ok(())
}

/// Flipping any byte of the block list's checksummed region makes replay
/// fail with a checksum error and write nothing.
#[test]
fn test_journal_corruption_is_contained() -> Result<()> {
    for corrupt_at in [0u64, 3, 17, 507] {
        let payload = *b"\x99\x99\x99\x99";
        let (mut dev, journal_offset) = volume_with_pending_transaction(&payload)?;
        let vh = match read_superblock(&mut dev)? {
            Superblock::HfsPlus(vh) => vh,
            _ => unreachable!(),
        };

        let pos = journal_offset + 512 + corrupt_at;
        let mut byte = [0u8; 1];
        dev.read_at(pos, &mut byte)?;
        dev.write_at(pos, &[byte[0] ^ 0x40])?;

        let before = dev.as_slice().to_vec();
        let err = journal::replay(&mut dev, &vh, true);
        assert!(err.is_err(), "corruption at +{corrupt_at} must abort replay");
        assert_eq!(dev.as_slice(), &before[..], "no destination writes");
    }
    Ok(())
}

/// `check_and_repair` drives journal recovery end to end: a dry run reports
/// the pending transaction, a repair run replays it and leaves the volume
/// clean.
#[test]
fn test_check_and_repair_recovers_journaled_volume() -> Result<()> {
    let payload = *b"\x5A\x5A\x5A\x5A";
    let (mut dev, _) = volume_with_pending_transaction(&payload)?;

    let report = check_and_repair(&mut dev, true)?;
    assert!(!report.is_clean());
    assert_eq!(report.transactions_replayed, 1);

    let report = check_and_repair(&mut dev, false)?;
    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(report.transactions_replayed, 1);

    let vh = match read_superblock(&mut dev)? {
        Superblock::HfsPlus(vh) => vh,
        _ => unreachable!(),
    };
    let mut block = [0u8; 4];
    dev.read_at(100 * vh.block_size as u64, &mut block)?;
    assert_eq!(block, payload);

    assert!(check_and_repair(&mut dev, true)?.is_clean());
    Ok(())
}
