//! HFS+ write-ahead journal validation and replay.
//!
//! The Volume Header's `journal_info_block` field names the allocation block
//! holding the journal info block, which in turn gives the byte offset and
//! size of the journal region. The region starts with a 44-byte header;
//! the remainder is a circular transaction area. Each transaction is a
//! block-list header followed by its block payloads, replayed in order
//! against the volume before it may be considered clean.

use log::{debug, info, warn};

use crate::block::BlockDevice;
use crate::codec::{Buf, BufMut};
use crate::error::{Result, VolumeError};
use crate::superblock::{
    Superblock, VH_ATTR_JOURNALED, VolumeHeader, write_superblock,
};

/// "JNLx" in big-endian.
pub const JOURNAL_HEADER_MAGIC: u32 = 0x4A4E_4C78;
/// Written in native order at creation; a match means no byte swapping.
pub const ENDIAN_MAGIC: u32 = 0x1234_5678;

pub const JOURNAL_HEADER_SIZE: usize = 44;
pub const BLOCK_LIST_HEADER_SIZE: usize = 16;
pub const BLOCK_INFO_SIZE: usize = 16;

// Journal info block flags.
pub const JIB_FLAG_IN_FS: u32 = 0x0000_0001;
pub const JIB_FLAG_ON_OTHER_DEVICE: u32 = 0x0000_0002;
pub const JIB_FLAG_NEEDS_INIT: u32 = 0x0000_0004;

/// A corrupt circular pointer must not spin forever.
const MAX_TRANSACTIONS_PER_REPLAY: u32 = 1000;
/// Reject block counts no sane transaction reaches.
const MAX_BLOCKS_PER_TRANSACTION: u16 = 2048;

/// Destination marker for a block-list entry that must not be replayed.
const BLOCK_SKIP_SENTINEL: u64 = u64::MAX;

/// Outcome of journal validation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JournalStatus {
    /// Journaling attribute clear or no info block pointer.
    Absent,
    /// Valid header with `start == end`; nothing to replay.
    Clean,
    /// Valid header with pending transactions.
    PendingReplay,
    /// Header or info block fails structural checks.
    Invalid,
    /// Info block flagged for reinitialization; terminal until reformatted.
    NeedsInit,
}

/// The info block the Volume Header points at. Lives in its own allocation
/// block; only the leading fields are meaningful.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalInfoBlock {
    pub flags: u32,
    /// Absolute byte offset of the journal region on this device.
    pub offset: u64,
    pub size: u64,
}

impl JournalInfoBlock {
    pub const SIZE: usize = 52;

    pub fn parse(data: &[u8]) -> Result<Self> {
        let buf = Buf::new(data);
        Ok(JournalInfoBlock {
            flags: buf.get_u32(0)?,
            // 32 bytes of device signature sit between flags and offset.
            offset: buf.get_u64(36)?,
            size: buf.get_u64(44)?,
        })
    }

    pub fn write(&self, out: &mut [u8]) -> Result<()> {
        let mut buf = BufMut::new(out);
        buf.put_u32(0, self.flags)?;
        buf.put_u64(36, self.offset)?;
        buf.put_u64(44, self.size)?;
        Ok(())
    }

    pub fn needs_init(&self) -> bool {
        self.flags & JIB_FLAG_NEEDS_INIT != 0
    }

    pub fn on_other_device(&self) -> bool {
        self.flags & JIB_FLAG_ON_OTHER_DEVICE != 0
    }
}

/// The 44-byte record at the start of the journal region.
///
/// `start` and `end` are circular offsets into the transaction area, which
/// begins `jhdr_size` bytes into the region. The checksum covers the header
/// with its own checksum field zeroed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JournalHeader {
    pub start: u64,
    pub end: u64,
    /// Total journal region size, header included.
    pub size: u64,
    pub blhdr_size: u32,
    pub jhdr_size: u32,
}

impl JournalHeader {
    /// Parse a header, checking magic, endian tag, checksum, and offsets.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let buf = Buf::new(data);
        let magic = buf.get_u32(0)?;
        if magic != JOURNAL_HEADER_MAGIC {
            return Err(VolumeError::CorruptJournalHeader(format!(
                "bad magic 0x{magic:08X}"
            )));
        }
        let endian = buf.get_u32(4)?;
        if endian != ENDIAN_MAGIC {
            return Err(VolumeError::CorruptJournalHeader(format!(
                "bad endian tag 0x{endian:08X}"
            )));
        }

        let stored = buf.get_u32(36)?;
        let actual = {
            let mut copy = [0u8; JOURNAL_HEADER_SIZE];
            copy.copy_from_slice(buf.get_bytes(0, JOURNAL_HEADER_SIZE)?);
            copy[36..40].fill(0);
            checksum(&copy)
        };
        if stored != actual {
            return Err(VolumeError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }

        let header = JournalHeader {
            start: buf.get_u64(8)?,
            end: buf.get_u64(16)?,
            size: buf.get_u64(24)?,
            blhdr_size: buf.get_u32(32)?,
            jhdr_size: buf.get_u32(40)?,
        };

        if (header.jhdr_size as usize) < JOURNAL_HEADER_SIZE
            || header.jhdr_size as u64 >= header.size
        {
            return Err(VolumeError::CorruptJournalHeader(format!(
                "header size {} inconsistent with journal size {}",
                header.jhdr_size, header.size
            )));
        }
        let tx_size = header.size - header.jhdr_size as u64;
        if header.start > tx_size || header.end > tx_size {
            return Err(VolumeError::CorruptJournalHeader(format!(
                "start {} / end {} outside transaction area of {} bytes",
                header.start, header.end, tx_size
            )));
        }
        if (header.blhdr_size as usize) < BLOCK_LIST_HEADER_SIZE + BLOCK_INFO_SIZE
            || header.blhdr_size as u64 > tx_size
        {
            return Err(VolumeError::CorruptJournalHeader(format!(
                "block-list header size {} unusable",
                header.blhdr_size
            )));
        }
        Ok(header)
    }

    /// Serialize with a freshly computed checksum.
    pub fn to_bytes(&self) -> [u8; JOURNAL_HEADER_SIZE] {
        let mut out = [0u8; JOURNAL_HEADER_SIZE];
        {
            let mut buf = BufMut::new(&mut out);
            // Infallible at these offsets; the buffer is exactly header-sized.
            let _ = buf.put_u32(0, JOURNAL_HEADER_MAGIC);
            let _ = buf.put_u32(4, ENDIAN_MAGIC);
            let _ = buf.put_u64(8, self.start);
            let _ = buf.put_u64(16, self.end);
            let _ = buf.put_u64(24, self.size);
            let _ = buf.put_u32(32, self.blhdr_size);
            let _ = buf.put_u32(40, self.jhdr_size);
        }
        let sum = checksum(&out);
        out[36..40].copy_from_slice(&sum.to_be_bytes());
        out
    }

    /// Bytes of the circular transaction area following the header.
    pub fn tx_size(&self) -> u64 {
        self.size - self.jhdr_size as u64
    }
}

/// Journal checksum, shared by the header and block-list headers. Always
/// computed with the structure's own checksum field zeroed.
pub fn checksum(data: &[u8]) -> u32 {
    let mut sum: u32 = 0;
    for &b in data {
        sum = sum.wrapping_shl(8) ^ sum.wrapping_add(b as u32);
    }
    !sum
}

/// One entry of a block-list transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockInfo {
    /// Destination allocation block, or the skip sentinel.
    bnum: u64,
    bsize: u32,
    next: u32,
}

/// Resolved journal placement on a device.
struct JournalRegion {
    info: JournalInfoBlock,
    header: JournalHeader,
}

impl JournalRegion {
    fn tx_offset(&self) -> u64 {
        self.info.offset + self.header.jhdr_size as u64
    }

    /// Read `buf.len()` bytes at circular offset `pos` in the transaction
    /// area, wrapping at its end.
    fn read_circular<D: BlockDevice>(
        &self,
        device: &mut D,
        pos: u64,
        buf: &mut [u8],
    ) -> Result<()> {
        let tx_size = self.header.tx_size();
        let pos = pos % tx_size;
        let first = ((tx_size - pos) as usize).min(buf.len());
        device.read_at(self.tx_offset() + pos, &mut buf[..first])?;
        if first < buf.len() {
            device.read_at(self.tx_offset(), &mut buf[first..])?;
        }
        Ok(())
    }
}

fn read_info_block<D: BlockDevice>(
    device: &mut D,
    vh: &VolumeHeader,
) -> Result<JournalInfoBlock> {
    let offset = vh.journal_info_block as u64 * vh.block_size as u64;
    let mut buf = [0u8; JournalInfoBlock::SIZE];
    device.read_at(offset, &mut buf)?;
    JournalInfoBlock::parse(&buf)
}

fn read_region<D: BlockDevice>(device: &mut D, vh: &VolumeHeader) -> Result<JournalRegion> {
    let info = read_info_block(device, vh)?;
    if info.on_other_device() {
        return Err(VolumeError::UnsupportedJournalConfiguration(
            "journal lives on a separate device".into(),
        ));
    }
    if info.offset
        .checked_add(info.size)
        .map_or(true, |end| end > device.len())
        || info.size < JOURNAL_HEADER_SIZE as u64
    {
        return Err(VolumeError::CorruptJournalHeader(format!(
            "journal region at {}+{} exceeds device size {}",
            info.offset,
            info.size,
            device.len()
        )));
    }
    let mut buf = [0u8; JOURNAL_HEADER_SIZE];
    device.read_at(info.offset, &mut buf)?;
    let header = JournalHeader::parse(&buf)?;
    if header.size != info.size {
        return Err(VolumeError::CorruptJournalHeader(format!(
            "header claims {} journal bytes, info block allocated {}",
            header.size, info.size
        )));
    }
    Ok(JournalRegion { info, header })
}

/// Inspect the journal without modifying anything.
///
/// Structural mismatches yield [`JournalStatus::Invalid`] rather than an
/// error; callers decide whether to mark the journal for reinitialization.
/// A journal on a separate device is the one hard error, since no local
/// replay can ever make such a volume consistent.
pub fn validate<D: BlockDevice>(device: &mut D, vh: &VolumeHeader) -> Result<JournalStatus> {
    if vh.attributes & VH_ATTR_JOURNALED == 0 || vh.journal_info_block == 0 {
        return Ok(JournalStatus::Absent);
    }
    let info = read_info_block(device, vh)?;
    if info.on_other_device() {
        return Err(VolumeError::UnsupportedJournalConfiguration(
            "journal lives on a separate device".into(),
        ));
    }
    if info.needs_init() {
        return Ok(JournalStatus::NeedsInit);
    }
    match read_region(device, vh) {
        Ok(region) => {
            if region.header.start == region.header.end {
                Ok(JournalStatus::Clean)
            } else {
                Ok(JournalStatus::PendingReplay)
            }
        }
        Err(VolumeError::UnsupportedJournalConfiguration(msg)) => {
            Err(VolumeError::UnsupportedJournalConfiguration(msg))
        }
        Err(VolumeError::Io(e)) => Err(VolumeError::Io(e)),
        Err(e) => {
            warn!("journal validation failed: {e}");
            Ok(JournalStatus::Invalid)
        }
    }
}

/// Replay pending transactions.
///
/// With `repair` false this is a read-only walk that verifies every
/// checksum and bound but writes nothing. With `repair` true each block
/// payload is written to its destination and, after all transactions
/// apply, `start` is advanced to `end` and flushed durably; a crash before
/// that final header write leaves the journal pending and replay can be
/// re-run from the beginning.
///
/// Returns the number of transactions walked. Any checksum or bounds
/// failure aborts the whole replay with an error; destination writes from
/// the failing transaction onward are never issued.
pub fn replay<D: BlockDevice>(device: &mut D, vh: &VolumeHeader, repair: bool) -> Result<u32> {
    match validate(device, vh)? {
        JournalStatus::Absent | JournalStatus::Clean => return Ok(0),
        JournalStatus::NeedsInit => {
            return Err(VolumeError::CorruptJournalHeader(
                "journal is marked for reinitialization".into(),
            ));
        }
        JournalStatus::Invalid => {
            return Err(VolumeError::CorruptJournalHeader(
                "journal failed validation".into(),
            ));
        }
        JournalStatus::PendingReplay => {}
    }

    let region = read_region(device, vh)?;
    let header = region.header;
    let tx_size = header.tx_size();
    let blhdr_size = header.blhdr_size as usize;
    let total_blocks = vh.total_blocks as u64;

    // start/end may legally sit at exactly tx_size; fold both onto the
    // circular space so a transaction ending on the wrap boundary matches.
    let end = header.end % tx_size;
    let mut pos = header.start % tx_size;
    let mut transactions = 0u32;
    let mut blhdr = vec![0u8; blhdr_size];

    while pos != end {
        if transactions >= MAX_TRANSACTIONS_PER_REPLAY {
            return Err(VolumeError::CorruptJournalHeader(format!(
                "more than {MAX_TRANSACTIONS_PER_REPLAY} transactions without reaching end; \
                 circular pointers look corrupt"
            )));
        }

        region.read_circular(device, pos, &mut blhdr)?;
        let buf = Buf::new(&blhdr);
        let max_blocks = buf.get_u16(0)?;
        let num_blocks = buf.get_u16(2)?;
        let bytes_used = buf.get_u32(4)?;
        let stored = buf.get_u32(8)?;

        let actual = {
            let mut copy = blhdr.clone();
            copy[8..12].fill(0);
            checksum(&copy)
        };
        if stored != actual {
            return Err(VolumeError::ChecksumMismatch {
                expected: stored,
                actual,
            });
        }

        if num_blocks == 0
            || num_blocks > max_blocks
            || num_blocks > MAX_BLOCKS_PER_TRANSACTION
            || BLOCK_LIST_HEADER_SIZE + num_blocks as usize * BLOCK_INFO_SIZE > blhdr_size
        {
            return Err(VolumeError::CorruptJournalHeader(format!(
                "transaction {transactions}: block count {num_blocks} (max {max_blocks}) \
                 does not fit a {blhdr_size}-byte block list"
            )));
        }
        if (bytes_used as usize) < blhdr_size || bytes_used as u64 > tx_size {
            return Err(VolumeError::CorruptJournalHeader(format!(
                "transaction {transactions}: {bytes_used} bytes used outside \
                 [{blhdr_size}, {tx_size}]"
            )));
        }

        // Payloads follow the block list back to back.
        let mut payload_pos = (pos + blhdr_size as u64) % tx_size;
        let mut payload_total = blhdr_size as u64;
        for i in 0..num_blocks as usize {
            let base = BLOCK_LIST_HEADER_SIZE + i * BLOCK_INFO_SIZE;
            let entry = BlockInfo {
                bnum: buf.get_u64(base)?,
                bsize: buf.get_u32(base + 8)?,
                next: buf.get_u32(base + 12)?,
            };
            let _ = entry.next; // sequential layout makes the link redundant

            payload_total += entry.bsize as u64;
            if payload_total > bytes_used as u64 {
                return Err(VolumeError::CorruptJournalHeader(format!(
                    "transaction {transactions}: payloads overrun the {bytes_used} \
                     bytes the block list claims"
                )));
            }

            if entry.bnum != BLOCK_SKIP_SENTINEL {
                if entry.bnum >= total_blocks {
                    return Err(VolumeError::BlockOutOfRange {
                        block: entry.bnum,
                        total: total_blocks,
                    });
                }
                let mut payload = vec![0u8; entry.bsize as usize];
                region.read_circular(device, payload_pos, &mut payload)?;
                if repair {
                    let dest = entry.bnum * vh.block_size as u64;
                    device.write_at(dest, &payload)?;
                    debug!(
                        "replayed {} bytes to block {} (transaction {transactions})",
                        entry.bsize, entry.bnum
                    );
                }
            }
            payload_pos = (payload_pos + entry.bsize as u64) % tx_size;
        }

        pos = (pos + bytes_used as u64) % tx_size;
        transactions += 1;
    }

    if repair {
        let updated = JournalHeader {
            start: header.end,
            ..header
        };
        device.write_at(region.info.offset, &updated.to_bytes())?;
        device.flush()?;
        info!("journal replay complete: {transactions} transactions applied");
    } else {
        info!("journal dry run: {transactions} transactions pending");
    }
    Ok(transactions)
}

/// Clear the journaled attribute and info-block pointer in both superblock
/// copies, for targets whose drivers do not understand journal semantics.
pub fn disable<D: BlockDevice>(
    device: &mut D,
    vh: &mut VolumeHeader,
    volume_size: u64,
) -> Result<()> {
    vh.attributes &= !VH_ATTR_JOURNALED;
    vh.journal_info_block = 0;
    write_superblock(device, &Superblock::HfsPlus(vh.clone()), volume_size)?;
    info!("journaling disabled");
    Ok(())
}

/// Flip the info block to needs-init. An explicit caller action after
/// validation reports an invalid journal; never done implicitly.
pub fn mark_needs_init<D: BlockDevice>(device: &mut D, vh: &VolumeHeader) -> Result<()> {
    let offset = vh.journal_info_block as u64 * vh.block_size as u64;
    let mut buf = [0u8; JournalInfoBlock::SIZE];
    device.read_at(offset, &mut buf)?;
    let mut info = JournalInfoBlock::parse(&buf)?;
    info.flags |= JIB_FLAG_NEEDS_INIT;
    info.write(&mut buf)?;
    device.write_at(offset, &buf)?;
    device.flush()?;
    warn!("journal marked for reinitialization");
    Ok(())
}

/// Write a fresh info block and empty journal header, used at format time
/// when journaling is requested.
pub fn initialize<D: BlockDevice>(
    device: &mut D,
    info_block_offset: u64,
    journal_offset: u64,
    journal_size: u64,
    block_size: u32,
) -> Result<()> {
    let info = JournalInfoBlock {
        flags: JIB_FLAG_IN_FS,
        offset: journal_offset,
        size: journal_size,
    };
    let mut buf = [0u8; JournalInfoBlock::SIZE];
    info.write(&mut buf)?;
    device.write_at(info_block_offset, &buf)?;

    let header = JournalHeader {
        start: 0,
        end: 0,
        size: journal_size,
        blhdr_size: block_size.max(4096),
        jhdr_size: 512,
    };
    device.write_at(journal_offset, &header.to_bytes())?;
    debug!("initialized {journal_size}-byte journal at offset {journal_offset}");
    Ok(())
}
