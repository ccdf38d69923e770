//! Length-prefixed framing over the wire message set.
//!
//! Every frame is a 4-byte unsigned big-endian length followed by that many
//! bytes of tagged payload. [`FrameCodec`] implements the Tokio
//! [`Decoder`]/[`Encoder`] pair over that format: decoding is a resumable
//! two-phase parse (read the header, then read exactly the declared payload)
//! that buffers partial data and picks up where it left off, so a byte
//! stream split at arbitrary boundaries decodes to the same message
//! sequence.
//!
//! Unrecognised message tags surface as [`Decoded::Unknown`] items rather
//! than errors; see [`crate::wire`] for the tolerance rule.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::wire::{Decoded, WireMessage};

pub mod error;

pub use error::{CodecError, EofError, FramingError};

/// Length prefix header size (4 bytes for a big-endian u32).
pub const LENGTH_HEADER_SIZE: usize = 4;

/// Maximum frame length accepted by default (16 MiB).
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// Framing codec for the connector protocol.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    max_frame_length: usize,
}

impl FrameCodec {
    /// Construct a codec with a maximum frame length.
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self { Self { max_frame_length } }

    /// Return the maximum frame length this codec will accept.
    #[must_use]
    pub fn max_frame_length(&self) -> usize { self.max_frame_length }
}

impl Default for FrameCodec {
    fn default() -> Self { Self::new(DEFAULT_MAX_FRAME_LENGTH) }
}

impl Decoder for FrameCodec {
    type Item = Decoded;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_HEADER_SIZE {
            return Ok(None);
        }
        let mut header = [0_u8; LENGTH_HEADER_SIZE];
        header.copy_from_slice(&src[..LENGTH_HEADER_SIZE]);
        let len = u32::from_be_bytes(header) as usize;
        if len > self.max_frame_length {
            return Err(CodecError::Framing(FramingError::OversizedFrame {
                size: len,
                max: self.max_frame_length,
            })
            .into());
        }
        if src.len() < LENGTH_HEADER_SIZE + len {
            // Reserve for the rest of the frame so the next read can land in
            // one allocation.
            src.reserve(LENGTH_HEADER_SIZE + len - src.len());
            return Ok(None);
        }
        src.advance(LENGTH_HEADER_SIZE);
        let payload = src.split_to(len).freeze();
        let decoded = WireMessage::decode(payload).map_err(CodecError::Wire)?;
        Ok(Some(decoded))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Clean close: no data remaining at a frame boundary.
        if src.is_empty() {
            return Ok(None);
        }
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => Err(build_eof_error(src)),
        }
    }
}

impl<'a> Encoder<&'a WireMessage> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, item: &'a WireMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let frame = encode_frame(item, self.max_frame_length)?;
        dst.extend_from_slice(&frame);
        Ok(())
    }
}

/// Encode one message as a complete length-prefixed frame.
///
/// # Errors
///
/// Returns [`CodecError::Wire`] when a field exceeds its wire limits and
/// [`CodecError::Framing`] when the encoded payload exceeds
/// `max_frame_length`.
pub fn encode_frame(message: &WireMessage, max_frame_length: usize) -> Result<Bytes, CodecError> {
    let mut payload = BytesMut::new();
    message.encode(&mut payload)?;
    if payload.len() > max_frame_length {
        return Err(CodecError::Framing(FramingError::OversizedFrame {
            size: payload.len(),
            max: max_frame_length,
        }));
    }
    let mut frame = BytesMut::with_capacity(LENGTH_HEADER_SIZE + payload.len());
    frame.extend_from_slice(
        &u32::try_from(payload.len())
            .map_err(|_| {
                CodecError::Framing(FramingError::OversizedFrame {
                    size: payload.len(),
                    max: max_frame_length,
                })
            })?
            .to_be_bytes(),
    );
    frame.extend_from_slice(&payload);
    Ok(frame.freeze())
}

/// Build the appropriate EOF error for a connection that closed with
/// residual bytes buffered: mid-header when less than a length prefix
/// arrived, mid-frame when the prefix was read but the payload was cut
/// short.
fn build_eof_error(src: &BytesMut) -> io::Error {
    let expected = src
        .get(..LENGTH_HEADER_SIZE)
        .and_then(|slice| <[u8; LENGTH_HEADER_SIZE]>::try_from(slice).ok())
        .map(|bytes| u32::from_be_bytes(bytes) as usize);

    match expected {
        Some(expected) => CodecError::Eof(EofError::MidFrame {
            bytes_received: src.len().saturating_sub(LENGTH_HEADER_SIZE),
            expected,
        })
        .into(),
        None => CodecError::Eof(EofError::MidHeader {
            bytes_received: src.len(),
            header_size: LENGTH_HEADER_SIZE,
        })
        .into(),
    }
}
