#![doc(html_root_url = "https://docs.rs/streamgate/latest")]
//! Public API for the `streamgate` library.
//!
//! This crate implements the bidirectional wire protocol connecting
//! external data producers and consumers to a distributed
//! stream-processing engine: length-prefixed framing, the credit-gated
//! source connection state machine with at-least-once stream resumption,
//! and the multi-socket sink demultiplexer.

pub mod codec;
pub mod config;
pub mod metrics;
pub mod sink;
pub mod source;
pub mod stream;
pub mod wire;

pub use codec::{CodecError, EofError, FrameCodec, FramingError};
pub use config::{PROTOCOL_VERSION, SinkConfig, SourceConfig};
pub use sink::{SinkConnector, SinkDecoder, SinkError, WireDecoder};
pub use source::{
    ConnState,
    Pull,
    RecordSource,
    SendStats,
    SourceConnector,
    SourceError,
    SourceHandler,
};
pub use stream::{PointOfRef, Stream, StreamId, ValidationError};
pub use wire::{Decoded, Record, WireError, WireMessage};
