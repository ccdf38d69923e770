//! Application-facing traits for the source connection engine.
//!
//! [`SourceHandler`] is the capability surface a hosting application must
//! implement: the stream lifecycle callbacks the engine invokes as
//! acknowledgements arrive. The three required methods have no default
//! bodies, so an unimplemented hook is a compile error rather than a
//! runtime surprise.
//!
//! [`RecordSource`] supplies records for the engine's opportunistic
//! credit-gated pull. It is polled on the connection's driver task:
//! implementations should return [`Pull::Pending`] when no record is ready
//! instead of awaiting indefinitely, since a stalled pull also stalls
//! inbound acknowledgement processing.

use async_trait::async_trait;
use tracing::warn;

use crate::{stream::Stream, wire::Record};

/// Outcome of one record pull.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Pull {
    /// A record ready to transmit. Records must target streams the peer has
    /// opened; a record for a closed stream is a fatal validation error.
    Record(Record),
    /// No record ready yet; the engine retries shortly.
    Pending,
    /// The source is exhausted; the engine flushes and closes cleanly.
    Exhausted,
}

/// Supplies records to a source connection.
#[async_trait]
pub trait RecordSource: Send + 'static {
    /// Produce the next record, if any.
    async fn next_record(&mut self) -> Pull;
}

/// Stream lifecycle callbacks invoked by the source connection engine.
///
/// Callbacks run on the connection's driver task with the send lock
/// released, and receive snapshots of the stream state at the moment the
/// triggering acknowledgement was applied. They must not block for long and
/// cannot call back into the connection.
pub trait SourceHandler: Send + Sync + 'static {
    /// A stream was added to (or re-registered in) the local registry.
    ///
    /// Fires on the optimistic local update a `notify` call performs before
    /// the peer acknowledges, so the state seen here is eventually
    /// consistent with the engine.
    fn stream_added(&self, _stream: &Stream) {}

    /// A stream was removed from the registry at connection teardown.
    fn stream_removed(&self, _stream: &Stream) {}

    /// A stream's status changed from closed to open.
    fn stream_opened(&self, stream: &Stream);

    /// A stream's status changed from open to closed.
    fn stream_closed(&self, stream: &Stream);

    /// The peer acknowledged progress on a stream.
    fn stream_acked(&self, stream: &Stream);

    /// Choose which streams to re-notify after a completed reconnect.
    ///
    /// Receives the full pre-teardown stream set. The default returns it
    /// unchanged, so every stream is re-notified with its last known point
    /// of reference and none is silently dropped.
    fn restart_streams(&self, streams: Vec<Stream>) -> Vec<Stream> { streams }

    /// An unrecognised message arrived and was ignored.
    fn invalid_message(&self, tag: u8, payload: &[u8]) {
        warn!(tag, len = payload.len(), "ignoring unrecognised message");
    }
}
