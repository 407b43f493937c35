//! Allocation bitmap for HFS and HFS+ volumes.
//!
//! One bit per allocation block, MSB-first within each byte (bit 0 of the
//! volume is the high bit of byte 0) — the classic Mac convention, opposite
//! of the Linux ext-family bit order.

use crate::error::{Result, VolumeError};

/// An in-memory allocation bitmap, built during format and inspected during
/// consistency checks.
pub struct AllocationBitmap {
    data: Vec<u8>,
    bit_count: u64,
}

impl AllocationBitmap {
    /// Create an all-clear bitmap covering `bit_count` allocation blocks.
    pub fn new(bit_count: u64) -> Self {
        let bytes = bit_count.div_ceil(8) as usize;
        AllocationBitmap {
            data: vec![0u8; bytes],
            bit_count,
        }
    }

    /// Wrap on-disk bitmap bytes. `bit_count` may be less than
    /// `data.len() * 8` when the last byte is only partially used.
    pub fn from_bytes(data: Vec<u8>, bit_count: u64) -> Self {
        AllocationBitmap { data, bit_count }
    }

    pub fn bit_count(&self) -> u64 {
        self.bit_count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Test whether block `index` is marked allocated.
    ///
    /// Returns `false` for out-of-range indices.
    #[inline]
    pub fn is_set(&self, index: u64) -> bool {
        if index >= self.bit_count {
            return false;
        }
        let byte_idx = (index / 8) as usize;
        let bit_idx = 7 - (index % 8) as u32;
        byte_idx < self.data.len() && self.data[byte_idx] & (1u8 << bit_idx) != 0
    }

    /// Mark blocks `start..start + count` allocated.
    pub fn set_range(&mut self, start: u64, count: u64) -> Result<()> {
        let end = start.checked_add(count).ok_or(VolumeError::BlockOutOfRange {
            block: start,
            total: self.bit_count,
        })?;
        if end > self.bit_count {
            return Err(VolumeError::BlockOutOfRange {
                block: end - 1,
                total: self.bit_count,
            });
        }
        for bit in start..end {
            let byte_idx = (bit / 8) as usize;
            let bit_idx = 7 - (bit % 8) as u32;
            self.data[byte_idx] |= 1u8 << bit_idx;
        }
        Ok(())
    }

    /// Count allocated blocks in the valid range.
    pub fn count_set(&self) -> u64 {
        if self.bit_count == 0 {
            return 0;
        }
        let full_bytes = (self.bit_count / 8) as usize;
        let remaining_bits = (self.bit_count % 8) as u32;

        let mut count: u64 = 0;
        for &byte in &self.data[..full_bytes.min(self.data.len())] {
            count += byte.count_ones() as u64;
        }
        // Partial last byte: valid bits live in the high end (MSB-first).
        if remaining_bits > 0 && full_bytes < self.data.len() {
            let mask = !(0xFFu8 >> remaining_bits);
            count += (self.data[full_bytes] & mask).count_ones() as u64;
        }
        count
    }

    pub fn count_clear(&self) -> u64 {
        self.bit_count - self.count_set()
    }

    /// Index of the highest allocated block, scanning from the end.
    pub fn highest_set(&self) -> Option<u64> {
        for byte_idx in (0..self.data.len()).rev() {
            if self.data[byte_idx] == 0 {
                continue;
            }
            for bit in (0..8).rev() {
                let index = byte_idx as u64 * 8 + bit;
                if index < self.bit_count && self.is_set(index) {
                    return Some(index);
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msb_first_bit_order() {
        let mut bm = AllocationBitmap::new(16);
        bm.set_range(0, 1).unwrap();
        bm.set_range(12, 1).unwrap();
        // Bit 0 is the high bit of byte 0; bit 12 is bit 3 (from MSB) of byte 1.
        assert_eq!(bm.as_bytes(), &[0b1000_0000, 0b0000_1000]);
        assert!(bm.is_set(0));
        assert!(!bm.is_set(1));
        assert!(bm.is_set(12));
    }

    #[test]
    fn test_set_range_and_counts() {
        let mut bm = AllocationBitmap::new(100);
        bm.set_range(0, 10).unwrap();
        bm.set_range(90, 10).unwrap();
        assert_eq!(bm.count_set(), 20);
        assert_eq!(bm.count_clear(), 80);
        assert_eq!(bm.highest_set(), Some(99));
    }

    #[test]
    fn test_set_range_out_of_bounds() {
        let mut bm = AllocationBitmap::new(64);
        assert!(bm.set_range(60, 5).is_err());
        assert!(bm.set_range(u64::MAX, 2).is_err());
        // Failed range must not have been partially applied past the check.
        assert_eq!(bm.count_set(), 0);
    }

    #[test]
    fn test_partial_last_byte() {
        let mut bm = AllocationBitmap::new(12);
        bm.set_range(8, 4).unwrap();
        assert_eq!(bm.count_set(), 4);
        assert_eq!(bm.highest_set(), Some(11));
        assert!(!bm.is_set(12));
    }

    #[test]
    fn test_empty_bitmap() {
        let bm = AllocationBitmap::new(0);
        assert_eq!(bm.count_set(), 0);
        assert_eq!(bm.highest_set(), None);
    }
}
