//! Wire message set for the connector protocol.
//!
//! [`WireMessage`] is the closed set of protocol messages exchanged between
//! a connector and the engine, together with their binary encodings. Every
//! payload starts with a one-byte tag; integers are big-endian and strings
//! are a `u16` length followed by UTF-8 bytes. The framing layer in
//! [`crate::codec`] wraps each encoded payload in a 4-byte length prefix.
//!
//! Decoding an unrecognised tag yields [`Decoded::Unknown`] rather than an
//! error so that forward-compatible peers can add message types without
//! breaking older connectors. A malformed payload for a *known* tag is a
//! hard [`WireError`].

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::stream::{PointOfRef, StreamId};

mod tag {
    pub const HELLO: u8 = 0x01;
    pub const OK: u8 = 0x02;
    pub const ERROR: u8 = 0x03;
    pub const NOTIFY: u8 = 0x04;
    pub const NOTIFY_ACK: u8 = 0x05;
    pub const MESSAGE: u8 = 0x06;
    pub const EOS_MESSAGE: u8 = 0x07;
    pub const ACK: u8 = 0x08;
    pub const RESTART: u8 = 0x09;
}

/// Flag bit on Message payloads indicating a routing key is present.
const FLAG_HAS_KEY: u8 = 0x01;

/// Errors produced while encoding or decoding a message payload.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// The payload ended before the field being read was complete.
    #[error("truncated payload while reading {field}")]
    Truncated {
        /// Field that could not be read in full.
        field: &'static str,
    },

    /// A string field held invalid UTF-8.
    #[error("invalid UTF-8 in {field}")]
    InvalidUtf8 {
        /// Field that failed UTF-8 validation.
        field: &'static str,
    },

    /// A string or key exceeded the `u16` length prefix.
    #[error("{field} is {len} bytes; the wire format caps it at {max}")]
    FieldTooLong {
        /// Field that exceeded the cap.
        field: &'static str,
        /// Actual length in bytes.
        len: usize,
        /// Maximum encodable length.
        max: usize,
    },

    /// The payload carried no tag byte at all.
    #[error("empty frame payload")]
    EmptyPayload,

    /// Bytes remained after the final field of a fixed-layout message.
    #[error("{extra} trailing bytes after {message} payload")]
    TrailingBytes {
        /// Message variant that was being decoded.
        message: &'static str,
        /// Number of unconsumed bytes.
        extra: usize,
    },
}

/// One data record bound for the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Stream the record belongs to.
    pub stream_id: StreamId,
    /// Application-defined event timestamp.
    pub event_time: i64,
    /// Optional routing key; opaque to the protocol engine.
    pub key: Option<Bytes>,
    /// Opaque payload produced by the application's encoder.
    pub payload: Bytes,
}

impl Record {
    /// Build a keyless record.
    #[must_use]
    pub fn new(stream_id: StreamId, event_time: i64, payload: Bytes) -> Self {
        Self {
            stream_id,
            event_time,
            key: None,
            payload,
        }
    }

    /// Attach a routing key.
    #[must_use]
    pub fn with_key(mut self, key: Bytes) -> Self {
        self.key = Some(key);
        self
    }
}

/// The closed set of protocol messages.
///
/// Adding a variant here is a compile-time decision: every `match` over the
/// set is exhaustive, so a tenth message type cannot slip in unhandled.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WireMessage {
    /// Handshake opener (connector to engine).
    Hello {
        /// Protocol version the connector speaks.
        version: String,
        /// Shared-secret cookie for the engine to validate.
        cookie: String,
        /// Name of the hosting program.
        program: String,
        /// Name of this connector instance.
        instance: String,
    },
    /// Handshake acceptance (engine to connector).
    Ok {
        /// Credits granted for the new connection.
        initial_credits: u32,
    },
    /// Fatal protocol or application error (either direction).
    Error {
        /// Human-readable description.
        message: String,
    },
    /// Request to open or resume a stream (connector to engine).
    Notify {
        /// Stream to open or resume.
        stream_id: StreamId,
        /// Stream label.
        stream_name: String,
        /// Progress marker to resume from.
        point_of_ref: PointOfRef,
    },
    /// Accept or reject a Notify (engine to connector).
    NotifyAck {
        /// Whether the stream was opened.
        success: bool,
        /// Stream the ack refers to.
        stream_id: StreamId,
        /// Progress marker the engine will resume from.
        point_of_ref: PointOfRef,
    },
    /// One data record (connector to engine).
    Message(Record),
    /// End-of-stream marker (connector to engine); consumes no credit.
    EosMessage {
        /// Stream that has ended.
        stream_id: StreamId,
    },
    /// Credit replenishment and progress confirmation (engine to connector).
    Ack {
        /// Credits to add to the connection's balance.
        credits: u32,
        /// Acknowledged progress per stream, in engine order.
        acks: Vec<(StreamId, PointOfRef)>,
    },
    /// Order to drop the connection and reconnect (engine to connector).
    Restart {
        /// Optional replacement `host:port` to reconnect to.
        address: Option<String>,
    },
}

/// Direction a message is valid in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// Only the connector may send it.
    ToEngine,
    /// Only the engine may send it.
    ToConnector,
    /// Either side may send it.
    Either,
}

/// Outcome of decoding one frame payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A recognised protocol message.
    Message(WireMessage),
    /// An unrecognised tag, tolerated for forward compatibility.
    Unknown {
        /// Tag byte that was not recognised.
        tag: u8,
        /// Raw payload after the tag.
        payload: Bytes,
    },
}

impl WireMessage {
    /// Short variant name for logs and error messages.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "Hello",
            Self::Ok { .. } => "Ok",
            Self::Error { .. } => "Error",
            Self::Notify { .. } => "Notify",
            Self::NotifyAck { .. } => "NotifyAck",
            Self::Message(_) => "Message",
            Self::EosMessage { .. } => "EosMessage",
            Self::Ack { .. } => "Ack",
            Self::Restart { .. } => "Restart",
        }
    }

    /// Which side of the connection may legally send this message.
    #[must_use]
    pub fn direction(&self) -> Direction {
        match self {
            Self::Hello { .. }
            | Self::Notify { .. }
            | Self::Message(_)
            | Self::EosMessage { .. } => Direction::ToEngine,
            Self::Ok { .. } | Self::NotifyAck { .. } | Self::Ack { .. } | Self::Restart { .. } => {
                Direction::ToConnector
            }
            Self::Error { .. } => Direction::Either,
        }
    }

    /// Whether sending this message consumes one credit.
    #[must_use]
    pub fn consumes_credit(&self) -> bool {
        matches!(self, Self::Message(_) | Self::Notify { .. })
    }

    /// Append this message's tagged payload to `dst`.
    ///
    /// The output excludes the frame length prefix; see
    /// [`crate::codec::encode_frame`] for the full frame.
    ///
    /// # Errors
    ///
    /// Returns [`WireError::FieldTooLong`] when a string or key exceeds the
    /// `u16` length prefix.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), WireError> {
        match self {
            Self::Hello {
                version,
                cookie,
                program,
                instance,
            } => {
                dst.put_u8(tag::HELLO);
                put_str(dst, "version", version)?;
                put_str(dst, "cookie", cookie)?;
                put_str(dst, "program", program)?;
                put_str(dst, "instance", instance)?;
            }
            Self::Ok { initial_credits } => {
                dst.put_u8(tag::OK);
                dst.put_u32(*initial_credits);
            }
            Self::Error { message } => {
                dst.put_u8(tag::ERROR);
                dst.put_slice(message.as_bytes());
            }
            Self::Notify {
                stream_id,
                stream_name,
                point_of_ref,
            } => {
                dst.put_u8(tag::NOTIFY);
                dst.put_u64(stream_id.as_u64());
                put_str(dst, "stream_name", stream_name)?;
                dst.put_u64(point_of_ref.as_u64());
            }
            Self::NotifyAck {
                success,
                stream_id,
                point_of_ref,
            } => {
                dst.put_u8(tag::NOTIFY_ACK);
                dst.put_u8(u8::from(*success));
                dst.put_u64(stream_id.as_u64());
                dst.put_u64(point_of_ref.as_u64());
            }
            Self::Message(record) => {
                dst.put_u8(tag::MESSAGE);
                let flags = record.key.as_ref().map_or(0, |_| FLAG_HAS_KEY);
                dst.put_u8(flags);
                dst.put_u64(record.stream_id.as_u64());
                dst.put_i64(record.event_time);
                if let Some(key) = &record.key {
                    let len = u16::try_from(key.len()).map_err(|_| WireError::FieldTooLong {
                        field: "key",
                        len: key.len(),
                        max: usize::from(u16::MAX),
                    })?;
                    dst.put_u16(len);
                    dst.put_slice(key);
                }
                dst.put_slice(&record.payload);
            }
            Self::EosMessage { stream_id } => {
                dst.put_u8(tag::EOS_MESSAGE);
                dst.put_u64(stream_id.as_u64());
            }
            Self::Ack { credits, acks } => {
                dst.put_u8(tag::ACK);
                dst.put_u32(*credits);
                let count = u32::try_from(acks.len()).map_err(|_| WireError::FieldTooLong {
                    field: "acks",
                    len: acks.len(),
                    max: u32::MAX as usize,
                })?;
                dst.put_u32(count);
                for (stream_id, point_of_ref) in acks {
                    dst.put_u64(stream_id.as_u64());
                    dst.put_u64(point_of_ref.as_u64());
                }
            }
            Self::Restart { address } => {
                dst.put_u8(tag::RESTART);
                if let Some(address) = address {
                    put_str(dst, "address", address)?;
                }
            }
        }
        Ok(())
    }

    /// Decode one tagged frame payload.
    ///
    /// # Errors
    ///
    /// Returns a [`WireError`] when the payload is empty or a known tag's
    /// fields are malformed. Unknown tags are *not* errors; they surface as
    /// [`Decoded::Unknown`].
    pub fn decode(mut payload: Bytes) -> Result<Decoded, WireError> {
        if payload.is_empty() {
            return Err(WireError::EmptyPayload);
        }
        let tag = payload.get_u8();
        let message = match tag {
            tag::HELLO => WireMessage::Hello {
                version: take_str(&mut payload, "version")?,
                cookie: take_str(&mut payload, "cookie")?,
                program: take_str(&mut payload, "program")?,
                instance: take_str(&mut payload, "instance")?,
            },
            tag::OK => WireMessage::Ok {
                initial_credits: take_u32(&mut payload, "initial_credits")?,
            },
            tag::ERROR => {
                let raw = payload.split_to(payload.len());
                WireMessage::Error {
                    message: String::from_utf8(raw.to_vec())
                        .map_err(|_| WireError::InvalidUtf8 { field: "message" })?,
                }
            }
            tag::NOTIFY => WireMessage::Notify {
                stream_id: StreamId::new(take_u64(&mut payload, "stream_id")?),
                stream_name: take_str(&mut payload, "stream_name")?,
                point_of_ref: PointOfRef::new(take_u64(&mut payload, "point_of_ref")?),
            },
            tag::NOTIFY_ACK => WireMessage::NotifyAck {
                success: take_u8(&mut payload, "success")? != 0,
                stream_id: StreamId::new(take_u64(&mut payload, "stream_id")?),
                point_of_ref: PointOfRef::new(take_u64(&mut payload, "point_of_ref")?),
            },
            tag::MESSAGE => {
                let flags = take_u8(&mut payload, "flags")?;
                let stream_id = StreamId::new(take_u64(&mut payload, "stream_id")?);
                let event_time = take_i64(&mut payload, "event_time")?;
                let key = if flags & FLAG_HAS_KEY == 0 {
                    None
                } else {
                    let len = usize::from(take_u16(&mut payload, "key length")?);
                    if payload.remaining() < len {
                        return Err(WireError::Truncated { field: "key" });
                    }
                    Some(payload.split_to(len))
                };
                let payload = payload.split_to(payload.len());
                WireMessage::Message(Record {
                    stream_id,
                    event_time,
                    key,
                    payload,
                })
            }
            tag::EOS_MESSAGE => WireMessage::EosMessage {
                stream_id: StreamId::new(take_u64(&mut payload, "stream_id")?),
            },
            tag::ACK => {
                let credits = take_u32(&mut payload, "credits")?;
                let count = take_u32(&mut payload, "ack count")? as usize;
                let mut acks = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    acks.push((
                        StreamId::new(take_u64(&mut payload, "ack stream_id")?),
                        PointOfRef::new(take_u64(&mut payload, "ack point_of_ref")?),
                    ));
                }
                WireMessage::Ack { credits, acks }
            }
            tag::RESTART => WireMessage::Restart {
                address: if payload.is_empty() {
                    None
                } else {
                    Some(take_str(&mut payload, "address")?)
                },
            },
            other => {
                return Ok(Decoded::Unknown {
                    tag: other,
                    payload,
                });
            }
        };
        // Error and Message consume the remainder by construction; everything
        // else must leave the payload exhausted.
        if !payload.is_empty() {
            return Err(WireError::TrailingBytes {
                message: message.name(),
                extra: payload.len(),
            });
        }
        Ok(Decoded::Message(message))
    }
}

fn put_str(dst: &mut BytesMut, field: &'static str, value: &str) -> Result<(), WireError> {
    let len = u16::try_from(value.len()).map_err(|_| WireError::FieldTooLong {
        field,
        len: value.len(),
        max: usize::from(u16::MAX),
    })?;
    dst.put_u16(len);
    dst.put_slice(value.as_bytes());
    Ok(())
}

fn take_str(src: &mut Bytes, field: &'static str) -> Result<String, WireError> {
    let len = usize::from(take_u16(src, field)?);
    if src.remaining() < len {
        return Err(WireError::Truncated { field });
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|_| WireError::InvalidUtf8 { field })
}

fn take_u8(src: &mut Bytes, field: &'static str) -> Result<u8, WireError> {
    if src.remaining() < 1 {
        return Err(WireError::Truncated { field });
    }
    Ok(src.get_u8())
}

fn take_u16(src: &mut Bytes, field: &'static str) -> Result<u16, WireError> {
    if src.remaining() < 2 {
        return Err(WireError::Truncated { field });
    }
    Ok(src.get_u16())
}

fn take_u32(src: &mut Bytes, field: &'static str) -> Result<u32, WireError> {
    if src.remaining() < 4 {
        return Err(WireError::Truncated { field });
    }
    Ok(src.get_u32())
}

fn take_u64(src: &mut Bytes, field: &'static str) -> Result<u64, WireError> {
    if src.remaining() < 8 {
        return Err(WireError::Truncated { field });
    }
    Ok(src.get_u64())
}

fn take_i64(src: &mut Bytes, field: &'static str) -> Result<i64, WireError> {
    if src.remaining() < 8 {
        return Err(WireError::Truncated { field });
    }
    Ok(src.get_i64())
}
