//! Sink multiplexer: many inbound connections, one stream of messages.
//!
//! A [`SinkConnector`] owns a listening socket and any number of accepted
//! connections from the engine's output workers. A single readiness-driven
//! loop (no locks, no per-connection tasks) buffers partial frames per
//! connection and [`read`](SinkConnector::read) yields fully decoded items
//! in arrival order across all connections. Within one connection frames
//! are decoded strictly in byte-arrival order; across connections no
//! relative order is guaranteed.
//!
//! Framing is delegated to a [`SinkDecoder`]: a fixed-size header declares
//! each payload's length. The provided [`WireDecoder`] reads the protocol's
//! 4-byte big-endian prefix and decodes [`WireMessage`]s, surfacing
//! Message, EosMessage, and Notify frames to the host.

use std::{io, net::SocketAddr};

use bytes::{Buf, Bytes, BytesMut};
use log::info;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::{
    codec::{CodecError, FramingError, LENGTH_HEADER_SIZE},
    config::SinkConfig,
    metrics,
    wire::{Decoded, WireMessage},
};

/// Frame extraction contract for sink connections.
///
/// `payload_length` is always called with exactly
/// [`header_length`](Self::header_length) bytes, and `decode` with exactly
/// the payload the header declared.
pub trait SinkDecoder: Send {
    /// Item produced by decoding one frame.
    type Item;
    /// Error type for malformed headers or payloads.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Fixed number of bytes in a frame header.
    fn header_length(&self) -> usize;

    /// Payload length declared by a complete header.
    ///
    /// # Errors
    ///
    /// Returns an error for headers declaring an unacceptable length; the
    /// offending connection is torn down.
    fn payload_length(&self, header: &[u8]) -> Result<usize, Self::Error>;

    /// Decode one complete payload.
    ///
    /// # Errors
    ///
    /// Returns an error for undecodable payloads; the offending connection
    /// is torn down.
    fn decode(&self, payload: Bytes) -> Result<Self::Item, Self::Error>;
}

/// [`SinkDecoder`] for the protocol's length-prefixed wire messages.
#[derive(Clone, Debug)]
pub struct WireDecoder {
    max_frame_length: usize,
}

impl WireDecoder {
    /// Construct a decoder with a maximum frame length.
    #[must_use]
    pub fn new(max_frame_length: usize) -> Self { Self { max_frame_length } }
}

impl SinkDecoder for WireDecoder {
    type Item = Decoded;
    type Error = CodecError;

    fn header_length(&self) -> usize { LENGTH_HEADER_SIZE }

    fn payload_length(&self, header: &[u8]) -> Result<usize, CodecError> {
        let bytes: [u8; LENGTH_HEADER_SIZE] = header
            .get(..LENGTH_HEADER_SIZE)
            .and_then(|slice| slice.try_into().ok())
            .ok_or_else(|| {
                CodecError::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "short frame header",
                ))
            })?;
        let len = u32::from_be_bytes(bytes) as usize;
        if len > self.max_frame_length {
            return Err(CodecError::Framing(FramingError::OversizedFrame {
                size: len,
                max: self.max_frame_length,
            }));
        }
        Ok(len)
    }

    fn decode(&self, payload: Bytes) -> Result<Decoded, CodecError> {
        WireMessage::decode(payload).map_err(CodecError::Wire)
    }
}

/// Errors surfaced by the sink multiplexer.
///
/// Per-connection failures are not errors at this level: the offending
/// connection is torn down (logged) and the rest keep flowing. Only the
/// listening socket is load-bearing.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Binding the listening socket failed.
    #[error("failed to bind the sink listener: {0}")]
    Bind(#[source] io::Error),

    /// The listening socket itself failed; the sink cannot continue.
    #[error("acceptor socket failed: {0}")]
    Acceptor(#[source] io::Error),

    /// `read` was called before `listen`.
    #[error("sink is not listening; call listen() first")]
    NotListening,
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    buffer: BytesMut,
    /// Whether the buffer may hold at least one complete frame worth
    /// checking; cleared once less than a header remains.
    pending: bool,
}

impl Connection {
    fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            buffer: BytesMut::new(),
            pending: false,
        }
    }
}

enum Wakeup {
    Accepted(TcpStream, SocketAddr),
    AcceptFailed(io::Error),
    Readable(usize),
    SocketFailed(usize, io::Error),
}

/// Sink connector accepting framed results from the engine's workers.
pub struct SinkConnector<D: SinkDecoder = WireDecoder> {
    config: SinkConfig,
    decoder: D,
    acceptor: Option<TcpListener>,
    conns: Vec<Connection>,
}

impl SinkConnector<WireDecoder> {
    /// Build a sink speaking the protocol's wire message format.
    #[must_use]
    pub fn new(config: SinkConfig) -> Self {
        let decoder = WireDecoder::new(config.max_frame_length);
        Self::with_decoder(config, decoder)
    }
}

impl<D: SinkDecoder> SinkConnector<D> {
    /// Build a sink with a custom frame decoder.
    #[must_use]
    pub fn with_decoder(config: SinkConfig, decoder: D) -> Self {
        Self {
            config,
            decoder,
            acceptor: None,
            conns: Vec::new(),
        }
    }

    /// Bind the listening socket at the configured address.
    ///
    /// Returns the bound address, which differs from the configuration when
    /// port zero requested an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Bind`] when the socket cannot be bound.
    pub async fn listen(&mut self) -> Result<SocketAddr, SinkError> {
        let address = self.config.address();
        self.bind(&address).await
    }

    /// Bind the listening socket at an explicit address, overriding the
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Bind`] when the socket cannot be bound.
    pub async fn listen_on(&mut self, host: &str, port: u16) -> Result<SocketAddr, SinkError> {
        self.bind(&format!("{host}:{port}")).await
    }

    async fn bind(&mut self, address: &str) -> Result<SocketAddr, SinkError> {
        let listener = TcpListener::bind(address).await.map_err(SinkError::Bind)?;
        let local = listener.local_addr().map_err(SinkError::Bind)?;
        info!("sink listening: name={}, local={local}", self.config.name);
        self.acceptor = Some(listener);
        Ok(local)
    }

    /// Address the sink is listening on, if bound.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.as_ref().and_then(|l| l.local_addr().ok())
    }

    /// Number of live accepted connections.
    #[must_use]
    pub fn connection_count(&self) -> usize { self.conns.len() }

    /// Block until one fully decoded item is available and return it.
    ///
    /// Runs readiness cycles (accepting new connections, appending bytes
    /// to per-connection buffers, extracting complete frames) until a
    /// frame decodes. Never returns partially decoded data.
    ///
    /// # Errors
    ///
    /// Returns [`SinkError::Acceptor`] when the listening socket fails and
    /// [`SinkError::NotListening`] before [`listen`](Self::listen).
    pub async fn read(&mut self) -> Result<D::Item, SinkError> {
        loop {
            if let Some(item) = self.extract_one() {
                return Ok(item);
            }
            self.poll_once().await?;
        }
    }

    /// [`read`](Self::read) bounded by a timeout; `None` when it elapses.
    ///
    /// # Errors
    ///
    /// As [`read`](Self::read).
    pub async fn read_timeout(&mut self, limit: Duration) -> Result<Option<D::Item>, SinkError> {
        match tokio::time::timeout(limit, self.read()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Try to slice one complete frame out of a pending connection buffer.
    ///
    /// A connection leaves the pending set only when less than a header's
    /// worth of bytes remains, so a buffer holding several complete frames
    /// yields them across consecutive calls without waiting for new
    /// readiness.
    fn extract_one(&mut self) -> Option<D::Item> {
        let header_len = self.decoder.header_length();
        let mut idx = 0;
        while idx < self.conns.len() {
            if !self.conns[idx].pending {
                idx += 1;
                continue;
            }
            if self.conns[idx].buffer.len() < header_len {
                self.conns[idx].pending = false;
                idx += 1;
                continue;
            }
            let payload_len = match self
                .decoder
                .payload_length(&self.conns[idx].buffer[..header_len])
            {
                Ok(len) => len,
                Err(e) => {
                    warn!(peer = %self.conns[idx].peer, error = %e,
                        "undecodable frame header; dropping connection");
                    metrics::inc_errors();
                    self.teardown(idx);
                    continue;
                }
            };
            if self.conns[idx].buffer.len() < header_len + payload_len {
                idx += 1;
                continue;
            }
            let conn = &mut self.conns[idx];
            let mut frame = conn.buffer.split_to(header_len + payload_len);
            frame.advance(header_len);
            if conn.buffer.len() < header_len {
                conn.pending = false;
            }
            match self.decoder.decode(frame.freeze()) {
                Ok(item) => {
                    metrics::inc_frames(metrics::Direction::Inbound);
                    return Some(item);
                }
                Err(e) => {
                    warn!(peer = %self.conns[idx].peer, error = %e,
                        "undecodable frame payload; dropping connection");
                    metrics::inc_errors();
                    self.teardown(idx);
                }
            }
        }
        None
    }

    /// Wait for one readiness event and apply it.
    async fn poll_once(&mut self) -> Result<(), SinkError> {
        let Some(acceptor) = self.acceptor.as_ref() else {
            return Err(SinkError::NotListening);
        };
        let wakeup = if self.conns.is_empty() {
            match acceptor.accept().await {
                Ok((stream, peer)) => Wakeup::Accepted(stream, peer),
                Err(e) => Wakeup::AcceptFailed(e),
            }
        } else {
            let readiness =
                futures::future::select_all(self.conns.iter().enumerate().map(|(idx, conn)| {
                    let stream = &conn.stream;
                    Box::pin(async move { (idx, stream.readable().await) })
                }));
            tokio::select! {
                accepted = acceptor.accept() => match accepted {
                    Ok((stream, peer)) => Wakeup::Accepted(stream, peer),
                    Err(e) => Wakeup::AcceptFailed(e),
                },
                ((idx, ready), _, _) = readiness => match ready {
                    Ok(()) => Wakeup::Readable(idx),
                    Err(e) => Wakeup::SocketFailed(idx, e),
                },
            }
        };
        match wakeup {
            Wakeup::Accepted(stream, peer) => {
                info!("connection accepted: peer={peer}");
                metrics::inc_connections();
                self.conns.push(Connection::new(stream, peer));
            }
            Wakeup::AcceptFailed(e) => return Err(SinkError::Acceptor(e)),
            Wakeup::Readable(idx) => self.fill(idx),
            Wakeup::SocketFailed(idx, e) => {
                warn!(peer = %self.conns[idx].peer, error = %e,
                    "socket failed; dropping connection");
                metrics::inc_errors();
                self.teardown(idx);
            }
        }
        Ok(())
    }

    /// Drain readable bytes into one connection's buffer.
    fn fill(&mut self, idx: usize) {
        let mut dead = false;
        {
            let conn = &mut self.conns[idx];
            loop {
                match conn.stream.try_read_buf(&mut conn.buffer) {
                    Ok(0) => {
                        // EOF. Complete frames already buffered must still
                        // surface; the teardown finishes on a later cycle
                        // once extraction has drained them.
                        if buffer_has_frame(&self.decoder, &conn.buffer) {
                            conn.pending = true;
                            debug!(peer = %conn.peer,
                                "connection closed with complete frames buffered");
                        } else {
                            if !conn.buffer.is_empty() {
                                warn!(peer = %conn.peer, residual = conn.buffer.len(),
                                    "connection closed with a partial frame buffered");
                            }
                            dead = true;
                        }
                        break;
                    }
                    Ok(_) => conn.pending = true,
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                    Err(e) => {
                        warn!(peer = %conn.peer, error = %e,
                            "read failed; dropping connection");
                        dead = true;
                        break;
                    }
                }
            }
        }
        if dead {
            self.teardown(idx);
        }
    }

    /// Remove one connection; its buffer is discarded and the socket
    /// closed. Other connections are unaffected.
    fn teardown(&mut self, idx: usize) {
        let conn = self.conns.swap_remove(idx);
        metrics::dec_connections();
        debug!(peer = %conn.peer, "connection removed");
    }
}

/// Whether `buffer` holds at least one complete frame. Undecodable headers
/// count as no: the connection is poisoned either way.
fn buffer_has_frame<D: SinkDecoder>(decoder: &D, buffer: &BytesMut) -> bool {
    let header_len = decoder.header_length();
    if buffer.len() < header_len {
        return false;
    }
    match decoder.payload_length(&buffer[..header_len]) {
        Ok(payload_len) => buffer.len() >= header_len + payload_len,
        Err(_) => false,
    }
}
