//! Mutable send-side state for one source connection.
//!
//! Everything here lives behind the connection's single send mutex: the
//! write half of the socket, the FIFO queue of encoded frames, the stream
//! registry, and the byte accounting used to make shutdown losses explicit.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use tokio::{io::AsyncWriteExt, net::tcp::OwnedWriteHalf};
use tracing::warn;

use crate::stream::StreamRegistry;

/// Upper bound on bytes coalesced into one socket write.
pub(crate) const MAX_WRITE_BATCH: usize = 64 * 1024;

/// Observable lifecycle state of a source connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// No connection has been attempted yet.
    Disconnected,
    /// A connect/handshake is in progress.
    Handshaking,
    /// Steady state: frames flow in both directions.
    Connected,
    /// The connection was lost and is being re-established.
    Reconnecting,
    /// Terminal: the connection will never transmit again.
    Closed,
}

/// Byte accounting for the outbound path.
///
/// `bytes_accepted` counts everything appended to the queue;
/// `bytes_written` what reached the socket; `bytes_discarded` what an
/// error-triggered abort dropped. Discards are always logged, never silent,
/// so `accepted == written + discarded` holds at terminal state.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SendStats {
    /// Bytes accepted into the outbound queue.
    pub bytes_accepted: u64,
    /// Bytes written to the socket.
    pub bytes_written: u64,
    /// Bytes discarded by teardown or error shutdown.
    pub bytes_discarded: u64,
    /// Frames accepted for transmission.
    pub frames_sent: u64,
}

/// Send-side state guarded by the connection's send mutex.
pub(crate) struct SendState {
    pub(crate) writer: Option<OwnedWriteHalf>,
    queue: VecDeque<Bytes>,
    queued_bytes: usize,
    pub(crate) registry: StreamRegistry,
    pub(crate) stats: SendStats,
}

impl SendState {
    pub(crate) fn new() -> Self {
        Self {
            writer: None,
            queue: VecDeque::new(),
            queued_bytes: 0,
            registry: StreamRegistry::new(),
            stats: SendStats::default(),
        }
    }

    /// Append one encoded frame to the outbound queue.
    pub(crate) fn enqueue(&mut self, frame: Bytes) {
        self.stats.bytes_accepted += frame.len() as u64;
        self.stats.frames_sent += 1;
        self.queued_bytes += frame.len();
        self.queue.push_back(frame);
    }

    /// Whether encoded frames are waiting to reach the socket.
    pub(crate) fn has_pending(&self) -> bool { !self.queue.is_empty() }

    /// Drain the queue in FIFO order, coalescing up to
    /// [`MAX_WRITE_BATCH`] bytes per socket write.
    ///
    /// Frames are never reordered: bytes hit the wire in append order. With
    /// no writer installed the queue is left untouched; it will drain after
    /// the next successful handshake or be discarded at teardown.
    pub(crate) async fn flush(&mut self) -> std::io::Result<()> {
        let Some(writer) = self.writer.as_mut() else {
            return Ok(());
        };
        while !self.queue.is_empty() {
            let mut batch = BytesMut::with_capacity(self.queued_bytes.min(MAX_WRITE_BATCH));
            while let Some(frame) = self.queue.pop_front() {
                if !batch.is_empty() && batch.len() + frame.len() > MAX_WRITE_BATCH {
                    self.queue.push_front(frame);
                    break;
                }
                batch.extend_from_slice(&frame);
            }
            self.queued_bytes -= batch.len();
            match writer.write_all(&batch).await {
                Ok(()) => self.stats.bytes_written += batch.len() as u64,
                Err(e) => {
                    self.stats.bytes_discarded += batch.len() as u64;
                    warn!(bytes = batch.len(), error = %e, "write failed; batch discarded");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Drop every queued frame, returning the number of bytes discarded.
    pub(crate) fn discard_queue(&mut self) -> usize {
        let dropped = self.queued_bytes;
        self.stats.bytes_discarded += dropped as u64;
        self.queue.clear();
        self.queued_bytes = 0;
        dropped
    }
}
