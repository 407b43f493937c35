use thiserror::Error;

/// Errors produced by volume creation, validation, and journal recovery.
///
/// Structural failures (signature, checksum, range) are never silently
/// corrected; they are returned to the caller, who decides whether to mark
/// the volume for reinitialization or abort.
#[derive(Error, Debug)]
pub enum VolumeError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid superblock signature: 0x{found:04X}")]
    InvalidSignature { found: u16 },

    #[error("volume size {requested} below the {kind} minimum of {minimum} bytes")]
    SizeBelowMinimum {
        requested: u64,
        minimum: u64,
        kind: &'static str,
    },

    #[error("layout does not fit: {blocks} blocks exceeds the {width}-bit block addressing limit")]
    GeometryOverflow { blocks: u64, width: u32 },

    #[error("checksum mismatch: expected 0x{expected:08X}, computed 0x{actual:08X}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    #[error("corrupt journal header: {0}")]
    CorruptJournalHeader(String),

    #[error("unsupported journal configuration: {0}")]
    UnsupportedJournalConfiguration(String),

    #[error("block {block} out of range (volume has {total} blocks)")]
    BlockOutOfRange { block: u64, total: u64 },

    #[error("invalid volume structure: {0}")]
    InvalidVolume(String),
}

pub type Result<T> = std::result::Result<T, VolumeError>;
