//! Metric helpers for `streamgate`.
//!
//! This module defines metric names and simple helper functions wrapping the
//! [`metrics`](https://docs.rs/metrics) crate. With the `metrics` feature
//! disabled the helpers compile to no-ops, so call sites stay unconditional.

/// Name of the gauge tracking active connections.
pub const CONNECTIONS_ACTIVE: &str = "streamgate_connections_active";
/// Name of the counter tracking processed frames.
pub const FRAMES_PROCESSED: &str = "streamgate_frames_processed_total";
/// Name of the counter tracking error occurrences.
pub const ERRORS_TOTAL: &str = "streamgate_errors_total";

/// Direction of frame processing.
#[derive(Clone, Copy)]
pub enum Direction {
    /// Inbound frames received from the peer.
    Inbound,
    /// Outbound frames sent to the peer.
    Outbound,
}

impl Direction {
    #[cfg(feature = "metrics")]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

/// Increment the active connections gauge.
#[cfg(feature = "metrics")]
pub fn inc_connections() { metrics::gauge!(CONNECTIONS_ACTIVE).increment(1.0); }

/// Decrement the active connections gauge.
#[cfg(feature = "metrics")]
pub fn dec_connections() { metrics::gauge!(CONNECTIONS_ACTIVE).decrement(1.0); }

/// Record a processed frame for the given direction.
#[cfg(feature = "metrics")]
pub fn inc_frames(direction: Direction) {
    metrics::counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(1);
}

/// Record an error occurrence.
#[cfg(feature = "metrics")]
pub fn inc_errors() { metrics::counter!(ERRORS_TOTAL).increment(1); }

/// Increment the active connections gauge.
#[cfg(not(feature = "metrics"))]
pub fn inc_connections() {}

/// Decrement the active connections gauge.
#[cfg(not(feature = "metrics"))]
pub fn dec_connections() {}

/// Record a processed frame for the given direction.
#[cfg(not(feature = "metrics"))]
pub fn inc_frames(_direction: Direction) {}

/// Record an error occurrence.
#[cfg(not(feature = "metrics"))]
pub fn inc_errors() {}
