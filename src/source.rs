//! Source connection engine.
//!
//! A [`SourceConnector`] drives one outbound TCP connection to the engine:
//! a blocking connect-and-handshake, then a background driver task that
//! dispatches inbound acknowledgements and opportunistically pulls records
//! from an optional [`RecordSource`], gated by the credit semaphore.
//! Foreground callers may invoke [`write`](SourceConnector::write),
//! [`notify`](SourceConnector::notify), and
//! [`end_of_stream`](SourceConnector::end_of_stream) concurrently; every
//! path that touches the outbound queue serializes on a single send mutex
//! scoped to the connection.
//!
//! Delivery is at-least-once: records may be retransmitted after a
//! reconnect, but streams are never silently dropped. On restart every
//! known stream is re-notified with its last acknowledged point of
//! reference.

use std::sync::{
    Arc,
    Mutex as StdMutex,
    MutexGuard,
    PoisonError,
    atomic::{AtomicBool, Ordering},
};
use std::time::Duration;

use leaky_bucket::RateLimiter;
use tokio::{
    io::AsyncWriteExt,
    sync::{Mutex, Semaphore},
    time::error::Elapsed,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    codec::encode_frame,
    config::SourceConfig,
    metrics,
    stream::{PointOfRef, StreamId, ValidationError},
    wire::{Record, WireMessage},
};

mod driver;
pub mod error;
pub mod handler;
mod state;

pub use error::SourceError;
pub use handler::{Pull, RecordSource, SourceHandler};
pub use state::{ConnState, SendStats};

use state::SendState;

/// Source connector speaking the credit-gated protocol to the engine.
///
/// Cheap to clone; all clones share the same underlying connection.
pub struct SourceConnector<H: SourceHandler> {
    shared: Arc<Shared<H>>,
}

impl<H: SourceHandler> Clone for SourceConnector<H> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// State shared between the public API and the driver task.
pub(crate) struct Shared<H> {
    pub(crate) config: SourceConfig,
    pub(crate) handler: H,
    /// Credit semaphore: one permit per data-bearing frame the peer allows.
    pub(crate) credits: Semaphore,
    /// The single mutex serializing every send-state access.
    pub(crate) send: Mutex<SendState>,
    meta: StdMutex<Meta>,
    records: StdMutex<Option<Box<dyn RecordSource>>>,
    pub(crate) pacer: Option<RateLimiter>,
    /// Terminal signal; cancelled exactly when the connection is Closed.
    pub(crate) stopped: CancellationToken,
    closing: AtomicBool,
}

struct Meta {
    state: ConnState,
    target: (String, u16),
    error: Option<Arc<SourceError>>,
}

impl<H: SourceHandler> SourceConnector<H> {
    /// Build a connector from its configuration and lifecycle handler.
    #[must_use]
    pub fn new(config: SourceConfig, handler: H) -> Self {
        let pacer = config.send_delay.map(|delay| {
            RateLimiter::builder()
                .initial(1)
                .max(1)
                .refill(1)
                .interval(delay)
                .build()
        });
        let target = (config.host.clone(), config.port);
        Self {
            shared: Arc::new(Shared {
                config,
                handler,
                credits: Semaphore::new(0),
                send: Mutex::new(SendState::new()),
                meta: StdMutex::new(Meta {
                    state: ConnState::Disconnected,
                    target,
                    error: None,
                }),
                records: StdMutex::new(None),
                pacer,
                stopped: CancellationToken::new(),
                closing: AtomicBool::new(false),
            }),
        }
    }

    /// Install the record source pulled by the driver task.
    ///
    /// Must be called before [`connect`](Self::connect); the driver takes
    /// the source once at startup.
    pub fn set_record_source(&self, source: impl RecordSource) {
        *self.shared.lock_records() = Some(Box::new(source));
    }

    /// Open the connection and perform the handshake.
    ///
    /// Sends Hello and reads exactly one reply frame before any background
    /// activity starts. On Ok the granted credits are deposited, the driver
    /// task is spawned, and the connection enters steady state.
    ///
    /// # Errors
    ///
    /// A transport failure on this first attempt is fatal: the connector is
    /// closed and the error surfaces here rather than being retried. An
    /// Error reply leaves the connector Disconnected; the caller may try
    /// `connect` again.
    pub async fn connect(&self) -> Result<(), SourceError> {
        {
            let mut meta = self.shared.meta();
            if meta.state != ConnState::Disconnected {
                return Err(SourceError::AlreadyConnected);
            }
            meta.state = ConnState::Handshaking;
        }
        match driver::establish(&self.shared).await {
            Ok(reader) => {
                self.shared.set_state(ConnState::Connected);
                let shared = Arc::clone(&self.shared);
                let records = self.shared.lock_records().take();
                tokio::spawn(driver::run(shared, reader, records));
                Ok(())
            }
            Err(e) => {
                if matches!(e, SourceError::Transport(_)) {
                    self.shared.set_state(ConnState::Closed);
                    self.shared.stopped.cancel();
                } else {
                    self.shared.set_state(ConnState::Disconnected);
                }
                Err(e)
            }
        }
    }

    /// Transmit one record as a Message frame, consuming one credit.
    ///
    /// Awaits credit replenishment when the balance is zero, so a
    /// data-bearing frame is never transmitted at zero credits.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::StreamNotOpen`] when the target stream
    /// has not been opened by the peer; call [`notify`](Self::notify)
    /// first. The frame never reaches the wire in that case.
    pub async fn write(&self, record: Record) -> Result<(), SourceError> {
        if self.shared.stopped.is_cancelled() {
            return Err(SourceError::Closed);
        }
        let stream_id = record.stream_id;
        {
            let send = self.shared.send.lock().await;
            if send.writer.is_none() {
                return Err(SourceError::NotConnected);
            }
            if !send.registry.is_open(stream_id) {
                return Err(ValidationError::StreamNotOpen { id: stream_id }.into());
            }
        }
        let frame = encode_frame(
            &WireMessage::Message(record),
            self.shared.config.max_frame_length,
        )?;
        self.shared.acquire_credit().await?;
        let mut send = self.shared.send.lock().await;
        if !send.registry.is_open(stream_id) {
            // The stream closed while we waited for a credit; hand it back.
            self.shared.deposit_credits(1);
            return Err(ValidationError::StreamNotOpen { id: stream_id }.into());
        }
        send.enqueue(frame);
        metrics::inc_frames(metrics::Direction::Outbound);
        send.flush().await?;
        Ok(())
    }

    /// Register a stream locally and ask the peer to open or resume it.
    ///
    /// The registry is updated (and `stream_added` invoked) *before* the
    /// Notify frame is sent: the local view is eventually consistent with
    /// the peer, which confirms or rejects via NotifyAck. Notify always
    /// succeeds validation-wise but consumes one credit.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingStreamName`] for a new stream
    /// without a name, or [`ValidationError::MissingPointOfRef`] when
    /// re-notifying an existing stream without a point of reference.
    pub async fn notify(
        &self,
        id: StreamId,
        name: Option<&str>,
        point_of_ref: Option<PointOfRef>,
    ) -> Result<(), SourceError> {
        if self.shared.stopped.is_cancelled() {
            return Err(SourceError::Closed);
        }
        let snapshot = {
            let mut send = self.shared.send.lock().await;
            if send.writer.is_none() {
                return Err(SourceError::NotConnected);
            }
            send.registry.prepare_notify(id, name, point_of_ref)?
        };
        self.shared.handler.stream_added(&snapshot);
        let message = WireMessage::Notify {
            stream_id: id,
            stream_name: snapshot.name.clone(),
            point_of_ref: snapshot.point_of_ref,
        };
        let frame = encode_frame(&message, self.shared.config.max_frame_length)?;
        self.shared.acquire_credit().await?;
        let mut send = self.shared.send.lock().await;
        send.enqueue(frame);
        metrics::inc_frames(metrics::Direction::Outbound);
        send.flush().await?;
        Ok(())
    }

    /// Send an end-of-stream marker; consumes no credit.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::NotConnected`] before `connect` or
    /// [`SourceError::Transport`] when the socket write fails.
    pub async fn end_of_stream(&self, id: StreamId) -> Result<(), SourceError> {
        // TODO: have the engine ack EOS so the tail of a stream cannot be
        // lost when a restart rolls back past an already-sent marker.
        if self.shared.stopped.is_cancelled() {
            return Err(SourceError::Closed);
        }
        let frame = encode_frame(
            &WireMessage::EosMessage { stream_id: id },
            self.shared.config.max_frame_length,
        )?;
        let mut send = self.shared.send.lock().await;
        if send.writer.is_none() {
            return Err(SourceError::NotConnected);
        }
        debug!(%id, "sending end of stream");
        send.enqueue(frame);
        metrics::inc_frames(metrics::Direction::Outbound);
        send.flush().await?;
        Ok(())
    }

    /// Close the connection, flushing queued frames best-effort.
    ///
    /// With `error` set, an Error frame is sent synchronously (bypassing
    /// the queue, whose contents are discarded and logged) before the
    /// socket closes. Idempotent: repeated calls are no-ops, and blocked
    /// [`join`](Self::join) callers always unblock.
    pub async fn shutdown(&self, error: Option<&str>) {
        self.shared.close(error.map(str::to_owned)).await;
    }

    /// Block until the connection reaches its terminal state and return
    /// the terminal error, if any.
    pub async fn join(&self) -> Option<Arc<SourceError>> {
        self.shared.stopped.cancelled().await;
        self.shared.meta().error.clone()
    }

    /// [`join`](Self::join) bounded by a timeout.
    ///
    /// # Errors
    ///
    /// Returns [`Elapsed`] when the connection is still live after `limit`.
    pub async fn join_timeout(
        &self,
        limit: Duration,
    ) -> Result<Option<Arc<SourceError>>, Elapsed> {
        tokio::time::timeout(limit, self.join()).await
    }

    /// Current credit balance.
    #[must_use]
    pub fn credits(&self) -> usize { self.shared.credits.available_permits() }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> ConnState { self.shared.meta().state }

    /// Whether encoded frames are queued but not yet on the wire.
    pub async fn has_pending_sends(&self) -> bool {
        self.shared.send.lock().await.has_pending()
    }

    /// Outbound byte accounting for this connection.
    pub async fn send_stats(&self) -> SendStats { self.shared.send.lock().await.stats }
}

impl<H> Shared<H> {
    /// Lock the metadata, recovering from a poisoned mutex.
    fn meta(&self) -> MutexGuard<'_, Meta> {
        self.meta.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_records(&self) -> MutexGuard<'_, Option<Box<dyn RecordSource>>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set_state(&self, state: ConnState) { self.meta().state = state; }

    pub(crate) fn target(&self) -> (String, u16) { self.meta().target.clone() }

    pub(crate) fn set_target(&self, host: String, port: u16) {
        self.meta().target = (host, port);
    }

    /// Record the terminal error, keeping the first one observed.
    pub(crate) fn record_error(&self, error: SourceError) {
        let mut meta = self.meta();
        if meta.error.is_none() {
            meta.error = Some(Arc::new(error));
        }
    }

    /// Add credits, saturating at the semaphore's ceiling.
    pub(crate) fn deposit_credits(&self, credits: u32) {
        let room = Semaphore::MAX_PERMITS - self.credits.available_permits();
        self.credits.add_permits((credits as usize).min(room));
    }

    /// Remove every available credit.
    pub(crate) fn drain_credits(&self) {
        while let Ok(permit) = self.credits.try_acquire() {
            permit.forget();
        }
    }

    /// Consume one credit, waiting for replenishment if none is available.
    pub(crate) async fn acquire_credit(&self) -> Result<(), SourceError> {
        tokio::select! {
            () = self.stopped.cancelled() => Err(SourceError::Closed),
            permit = self.credits.acquire() => match permit {
                Ok(permit) => {
                    permit.forget();
                    Ok(())
                }
                Err(_) => Err(SourceError::Closed),
            },
        }
    }
}

impl<H: SourceHandler> Shared<H> {
    /// Fatal-error path used by the driver task: record the error, then
    /// close.
    pub(crate) async fn fail(&self, error: SourceError) {
        warn!(error = %error, "source connection failed");
        metrics::inc_errors();
        self.record_error(error);
        self.close(None).await;
    }

    /// Tear the connection down to its terminal state. Idempotent.
    pub(crate) async fn close(&self, error_frame: Option<String>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            self.stopped.cancel();
            return;
        }
        self.drain_credits();
        let (was_connected, closed, removed) = {
            let mut send = self.send.lock().await;
            if error_frame.is_none() {
                if let Err(e) = send.flush().await {
                    debug!(error = %e, "final flush failed");
                }
            } else {
                let discarded = send.discard_queue();
                if discarded > 0 {
                    warn!(bytes = discarded, "discarding queued outbound bytes on error shutdown");
                }
            }
            if let Some(message) = &error_frame {
                // Error frames bypass the queued send path.
                if let Some(writer) = send.writer.as_mut() {
                    if let Ok(frame) = encode_frame(
                        &WireMessage::Error {
                            message: message.clone(),
                        },
                        self.config.max_frame_length,
                    ) {
                        let _ = writer.write_all(&frame).await;
                    }
                }
            }
            let was_connected = match send.writer.take() {
                Some(mut writer) => {
                    let _ = writer.shutdown().await;
                    true
                }
                None => false,
            };
            let closed = send.registry.close_all_open();
            let removed = send.registry.snapshot();
            (was_connected, closed, removed)
        };
        for stream in &closed {
            self.handler.stream_closed(stream);
        }
        for stream in &removed {
            self.handler.stream_removed(stream);
        }
        if was_connected {
            metrics::dec_connections();
        }
        self.set_state(ConnState::Closed);
        self.stopped.cancel();
    }
}
