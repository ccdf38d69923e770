//! Error taxonomy for the source connection engine.

use std::io;

use thiserror::Error;

use crate::{codec::CodecError, stream::ValidationError};

/// Errors produced by a source connection.
///
/// The variants map directly onto the engine's handling policy: protocol
/// and application errors are fatal to the connection, transport errors are
/// retried inside the reconnect loop, and validation errors are raised at
/// the call site without touching the connection.
#[derive(Debug, Error)]
pub enum SourceError {
    /// A frame arrived in the wrong direction or the wrong state. Fatal to
    /// the connection.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Socket-level failure. Retried with fixed backoff while inside a
    /// reconnect loop; fatal on the very first connection attempt.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// The peer sent an Error frame. Returned as the terminal result of
    /// `join`.
    #[error("peer reported an error: {0}")]
    Application(String),

    /// A call-site mistake; the connection is unaffected.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// A frame could not be encoded locally; the connection is unaffected.
    #[error("could not encode frame: {0}")]
    Encode(#[from] CodecError),

    /// The handshake was rejected or produced an unusable reply.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// An operation requires a live connection; call `connect` first.
    #[error("connection is not established")]
    NotConnected,

    /// `connect` was called on a connector that already ran one.
    #[error("connector already connected")]
    AlreadyConnected,

    /// The connection reached its terminal state.
    #[error("connection is closed")]
    Closed,
}

impl SourceError {
    /// Whether the reconnect loop should sleep and retry after this error.
    ///
    /// Only connection-refused and connection-reset qualify; every other
    /// failure ends the loop and propagates.
    #[must_use]
    pub fn is_reconnectable(&self) -> bool {
        matches!(
            self,
            Self::Transport(e) if matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::ConnectionReset
            )
        )
    }
}
