//! QPACK header compression, RFC 9204.
//!
//! The encoder compresses header lists against the static table and a FIFO
//! dynamic table fed over the encoder stream; the decoder mirrors that state
//! and reports progress back over the decoder stream.

mod decoder;
mod dynamic_table;
mod encoder;
pub mod huffman;
mod prefix;
pub mod static_table;

pub use decoder::*;
pub use dynamic_table::*;
pub use encoder::*;

use thiserror::Error;

use crate::ErrorCode;
use huffman::HuffmanError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QpackError {
    /// The input ended before a complete field or instruction was read.
    #[error("short read: truncated field section")]
    ShortRead,

    /// A prefix integer overflowed the platform word.
    #[error("prefix integer bounds exceeded")]
    BoundsExceeded,

    #[error("huffman error: {0}")]
    Huffman(#[from] HuffmanError),

    #[error("invalid utf8 in header field")]
    Utf8,

    #[error("static table index {0} out of range")]
    InvalidStaticIndex(usize),

    #[error("dynamic table index {0} not present")]
    InvalidDynamicIndex(u64),

    #[error("invalid required insert count")]
    InvalidRequiredInsertCount,

    /// The block references inserts the table has not seen yet.
    #[error("blocked: requires insert count {required}, have {have}")]
    Blocked { required: u64, have: u64 },

    /// An insert would not fit the table even when empty.
    #[error("dynamic table capacity exceeded")]
    CapacityExceeded,

    #[error("unknown instruction byte {0:#04x}")]
    UnknownInstruction(u8),
}

impl QpackError {
    /// The wire code to close the connection with when this error comes from
    /// decoding a field section.
    pub fn decompression_code(&self) -> ErrorCode {
        ErrorCode::QPACK_DECOMPRESSION_FAILED
    }

    /// The wire code when this error comes from the encoder stream.
    pub fn encoder_stream_code(&self) -> ErrorCode {
        ErrorCode::QPACK_ENCODER_STREAM_ERROR
    }

    /// The wire code when this error comes from the decoder stream.
    pub fn decoder_stream_code(&self) -> ErrorCode {
        ErrorCode::QPACK_DECODER_STREAM_ERROR
    }
}

impl From<std::string::FromUtf8Error> for QpackError {
    fn from(_: std::string::FromUtf8Error) -> Self {
        QpackError::Utf8
    }
}
