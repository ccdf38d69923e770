//! Error types for the framing layer.
//!
//! The taxonomy separates framing errors (frame boundary issues on the
//! wire), wire errors (a known message's payload failed to parse), I/O
//! errors, and EOF conditions. EOF variants distinguish a clean close at a
//! frame boundary from a connection lost mid-header or mid-frame, which is
//! what the reconnect logic keys off.

use std::io;

use thiserror::Error;

use crate::wire::WireError;

/// Framing-level errors occurring during frame boundary detection.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum FramingError {
    /// Frame length prefix indicates a size exceeding the configured
    /// maximum.
    #[error("frame exceeds max length: {size} > {max}")]
    OversizedFrame {
        /// Frame size indicated by the length prefix.
        size: usize,
        /// Maximum allowed frame size.
        max: usize,
    },
}

/// EOF variants distinguishing normal from premature closure.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum EofError {
    /// Clean EOF at a frame boundary; no data was lost.
    #[error("connection closed cleanly at frame boundary")]
    CleanClose,

    /// The peer closed the connection while a payload was being read.
    #[error("premature EOF: {bytes_received} bytes of {expected} byte frame received")]
    MidFrame {
        /// Payload bytes received before EOF.
        bytes_received: usize,
        /// Expected payload size from the length prefix.
        expected: usize,
    },

    /// The peer closed the connection while the length prefix was being
    /// read.
    #[error("premature EOF during header: {bytes_received} of {header_size} header bytes")]
    MidHeader {
        /// Header bytes received before EOF.
        bytes_received: usize,
        /// Expected header size.
        header_size: usize,
    },
}

/// Top-level framing-layer error.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame boundary error.
    #[error("framing error: {0}")]
    Framing(#[from] FramingError),

    /// A known message's payload failed to parse.
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Transport-layer I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// End-of-stream condition.
    #[error("EOF: {0}")]
    Eof(#[from] EofError),
}

impl CodecError {
    /// Returns true if this error represents a clean connection close.
    #[must_use]
    pub fn is_clean_close(&self) -> bool { matches!(self, Self::Eof(EofError::CleanClose)) }
}

impl From<CodecError> for io::Error {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => e,
            CodecError::Framing(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CodecError::Wire(e) => io::Error::new(io::ErrorKind::InvalidData, e),
            CodecError::Eof(e) => io::Error::new(io::ErrorKind::UnexpectedEof, e),
        }
    }
}
