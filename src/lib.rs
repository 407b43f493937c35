//! Byte-level creation, validation, and recovery of Macintosh HFS and HFS+
//! volumes.
//!
//! This is a disk-format engine, not a file-access library: it plans volume
//! geometry, writes the primary and backup superblocks with exact big-endian
//! layout, initializes the B-tree system files so a conforming reader can
//! traverse them, and validates and replays the HFS+ write-ahead journal
//! after an unclean shutdown.
//!
//! Entry points: [`format::format`] to create a volume, [`Volume::open`] to
//! bind an existing one, and [`check::check_and_repair`] to verify and
//! recover it.

pub mod bitmap;
pub mod block;
pub mod btree;
pub mod check;
pub mod codec;
pub mod error;
pub mod format;
pub mod geometry;
pub mod journal;
pub mod superblock;
pub mod volume;

pub use block::{BlockDevice, FileDevice, MemDevice};
pub use check::{Report, check_and_repair};
pub use error::{Result, VolumeError};
pub use format::{FormatOptions, format};
pub use geometry::{GeometryRequest, VolumeGeometry, VolumeKind};
pub use journal::JournalStatus;
pub use superblock::{Superblock, read_superblock, write_superblock};
pub use volume::Volume;
