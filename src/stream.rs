//! Per-connection stream identity and lifecycle state.
//!
//! A [`StreamRegistry`] maps stream identifiers to their current lifecycle
//! state for exactly one source connection, alongside the retry-notify set
//! of streams whose Notify the peer rejected. The registry is owned by that
//! connection and accessed only behind its send mutex, so no concurrent map
//! is needed.

use std::collections::HashMap;

use thiserror::Error;

/// Identifier of one logical substream of records.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl From<u64> for StreamId {
    fn from(value: u64) -> Self { Self(value) }
}

impl StreamId {
    /// Create a new [`StreamId`] with the provided value.
    #[must_use]
    pub fn new(id: u64) -> Self { Self(id) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream {}", self.0)
    }
}

/// Opaque progress marker for a stream.
///
/// The protocol engine compares points of reference for equality only; it
/// never orders or interprets them. Their meaning belongs entirely to the
/// application that produced them, which is why this type deliberately does
/// not implement `Ord`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct PointOfRef(u64);

impl From<u64> for PointOfRef {
    fn from(value: u64) -> Self { Self(value) }
}

impl PointOfRef {
    /// Create a new [`PointOfRef`] with the provided value.
    #[must_use]
    pub fn new(value: u64) -> Self { Self(value) }

    /// Return the inner `u64` representation.
    #[must_use]
    pub fn as_u64(&self) -> u64 { self.0 }
}

impl std::fmt::Display for PointOfRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of one logical stream within a connection.
///
/// `id` is immutable once assigned and `name` is immutable once first set.
/// `point_of_ref` and `is_open` are updated exclusively by acknowledgement
/// processing, never directly by the application.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Stream {
    /// Identifier, unique within the connection's lifetime.
    pub id: StreamId,
    /// Human-readable label, assigned at first notification.
    pub name: String,
    /// Last known progress marker for the stream.
    pub point_of_ref: PointOfRef,
    /// True only after the peer acknowledged a Notify with success.
    pub is_open: bool,
}

/// Errors raised synchronously at the call site; the connection is
/// unaffected.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    /// A Message was written to a stream the peer has not opened.
    #[error("{id} is not open; call notify() before writing to it")]
    StreamNotOpen {
        /// Stream the write targeted.
        id: StreamId,
    },

    /// A new stream was notified without a name.
    #[error("cannot notify new {id} without a stream name")]
    MissingStreamName {
        /// Stream the notify targeted.
        id: StreamId,
    },

    /// An existing stream was re-notified without a point of reference.
    #[error("cannot update {id} without a point of reference")]
    MissingPointOfRef {
        /// Stream the notify targeted.
        id: StreamId,
    },
}

/// Map of stream state owned by a single source connection.
#[derive(Debug, Default)]
pub struct StreamRegistry {
    streams: HashMap<StreamId, Stream>,
    retry_notify: HashMap<StreamId, Stream>,
}

impl StreamRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Look up a stream by id.
    #[must_use]
    pub fn get(&self, id: StreamId) -> Option<&Stream> { self.streams.get(&id) }

    /// Whether the stream exists and the peer has opened it.
    #[must_use]
    pub fn is_open(&self, id: StreamId) -> bool {
        self.streams.get(&id).is_some_and(|s| s.is_open)
    }

    /// Number of known streams.
    #[must_use]
    pub fn len(&self) -> usize { self.streams.len() }

    /// Whether the registry knows no streams.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.streams.is_empty() }

    /// Apply a `notify` call's optimistic local update and return the
    /// resulting stream snapshot.
    ///
    /// A new stream requires a name and defaults its point of reference to
    /// zero; an existing stream keeps its name and requires an explicit
    /// point of reference. The stream's open flag is untouched: only a
    /// NotifyAck may change it.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingStreamName`] or
    /// [`ValidationError::MissingPointOfRef`] when the merge rules above are
    /// violated.
    pub fn prepare_notify(
        &mut self,
        id: StreamId,
        name: Option<&str>,
        point_of_ref: Option<PointOfRef>,
    ) -> Result<Stream, ValidationError> {
        let stream = match self.streams.get(&id) {
            Some(existing) => {
                let point_of_ref =
                    point_of_ref.ok_or(ValidationError::MissingPointOfRef { id })?;
                Stream {
                    id,
                    name: existing.name.clone(),
                    point_of_ref,
                    is_open: existing.is_open,
                }
            }
            None => {
                let name = name.ok_or(ValidationError::MissingStreamName { id })?;
                Stream {
                    id,
                    name: name.to_owned(),
                    point_of_ref: point_of_ref.unwrap_or_default(),
                    is_open: false,
                }
            }
        };
        self.streams.insert(id, stream.clone());
        Ok(stream)
    }

    /// Apply a NotifyAck and return the updated snapshot.
    ///
    /// On success the stream opens; on failure it closes and enters the
    /// retry-notify set. Returns `None` for a stream that was never
    /// notified, which the caller logs rather than treats as fatal.
    pub fn apply_notify_ack(
        &mut self,
        id: StreamId,
        point_of_ref: PointOfRef,
        success: bool,
    ) -> Option<Stream> {
        let stream = self.streams.get_mut(&id)?;
        stream.point_of_ref = point_of_ref;
        stream.is_open = success;
        let snapshot = stream.clone();
        if !success {
            self.retry_notify.insert(id, snapshot.clone());
        }
        Some(snapshot)
    }

    /// Apply one Ack entry and return the post-update snapshot.
    ///
    /// The new point of reference is applied unconditionally: the marker is
    /// opaque and equality-only, so the registry cannot (and does not try
    /// to) enforce monotonicity. Returns `None` for unknown streams.
    pub fn apply_ack(&mut self, id: StreamId, point_of_ref: PointOfRef) -> Option<Stream> {
        let stream = self.streams.get_mut(&id)?;
        stream.point_of_ref = point_of_ref;
        Some(stream.clone())
    }

    /// Queue a stream for re-notification on the next Ack.
    pub fn queue_retry(&mut self, stream: Stream) {
        self.retry_notify.insert(stream.id, stream);
    }

    /// Take every stream awaiting re-notification.
    pub fn drain_retries(&mut self) -> Vec<Stream> {
        self.retry_notify.drain().map(|(_, s)| s).collect()
    }

    /// Discard the retry-notify set without re-sending.
    pub fn clear_retries(&mut self) { self.retry_notify.clear(); }

    /// Mark every open stream closed and return the affected snapshots.
    pub fn close_all_open(&mut self) -> Vec<Stream> {
        let mut closed = Vec::new();
        for stream in self.streams.values_mut() {
            if stream.is_open {
                stream.is_open = false;
                closed.push(stream.clone());
            }
        }
        closed
    }

    /// Snapshot of every known stream.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Stream> { self.streams.values().cloned().collect() }
}
