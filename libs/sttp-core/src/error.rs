//! Error types for the protocol data model and codecs

use thiserror::Error;

/// Errors raised while encoding or decoding protocol payloads
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("buffer underrun: needed {needed} more byte(s), {remaining} remaining")]
    BufferUnderrun { needed: usize, remaining: usize },

    #[error("unknown command code 0x{0:02X}")]
    UnknownCommand(u8),

    #[error("unknown response code 0x{0:02X}")]
    UnknownResponse(u8),

    #[error("unsupported string encoding 0x{0:08X}")]
    UnsupportedEncoding(u32),

    #[error("invalid string payload: {0}")]
    InvalidString(String),

    #[error("unknown compression version {0}")]
    UnknownCompressionVersion(u8),

    #[error("compressed stream out of sync: expected sequence {expected}, got {actual}")]
    SequenceMismatch { expected: u16, actual: u16 },

    #[error("compressed stream corrupt: {0}")]
    StreamCorrupt(String),

    #[error("signal index {0} not present in cache")]
    UnknownSignalIndex(u32),

    #[error("duplicate runtime index {0} in cache")]
    DuplicateIndex(u32),

    #[error("invalid filter expression: {0}")]
    InvalidFilter(String),

    #[error("unknown table '{0}'")]
    UnknownTable(String),

    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error("metadata serialization failed: {0}")]
    Metadata(#[from] serde_json::Error),
}

/// Convenience result alias used throughout the codec layer
pub type Result<T> = std::result::Result<T, CodecError>;
