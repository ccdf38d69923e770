//! Background driver task for a source connection.
//!
//! One task per connection owns the read half of the socket and runs a
//! biased select loop over the terminal signal, inbound frames, and the
//! credit-gated record pull. Reconnection happens inside the same task: on
//! a Restart order or a socket error the connection is torn down and the
//! handshake repeated at a fixed backoff, after which every previously
//! known stream is re-notified.

use std::{io, sync::Arc};

use bytes::Bytes;
use futures::StreamExt;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpStream, tcp::OwnedReadHalf},
    time::{Duration, Instant, sleep, sleep_until},
};
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

use super::{
    Pull,
    RecordSource,
    Shared,
    SourceError,
    SourceHandler,
    state::ConnState,
};
use crate::{
    codec::{FrameCodec, LENGTH_HEADER_SIZE, encode_frame},
    metrics,
    stream::Stream,
    wire::{Decoded, Record, WireMessage},
};

/// How long to wait before re-polling a record source that reported
/// [`Pull::Pending`].
const PULL_RETRY_INTERVAL: Duration = Duration::from_millis(10);

/// Control flow decisions bubbling out of the steady-state loop.
enum Flow {
    /// Clean exit: shutdown requested or record source exhausted.
    Stop,
    /// Drop the connection and re-run the handshake, optionally against a
    /// new target address.
    Reconnect { address: Option<String> },
}

/// Open a TCP connection and perform the handshake.
///
/// Exactly one reply frame is read sequentially, before any background
/// activity starts; on Ok the granted credits are deposited and the write
/// half installed. Used both for the first connect and by the reconnect
/// loop.
pub(super) async fn establish<H: SourceHandler>(
    shared: &Shared<H>,
) -> Result<OwnedReadHalf, SourceError> {
    let (host, port) = shared.target();
    debug!(%host, port, "connecting");
    let stream = TcpStream::connect((host.as_str(), port)).await?;
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = stream.into_split();

    let hello = WireMessage::Hello {
        version: shared.config.version.clone(),
        cookie: shared.config.cookie.clone(),
        program: shared.config.program_name.clone(),
        instance: shared.config.instance_name.clone(),
    };
    let frame = encode_frame(&hello, shared.config.max_frame_length)?;
    writer.write_all(&frame).await?;

    let mut header = [0_u8; LENGTH_HEADER_SIZE];
    reader.read_exact(&mut header).await?;
    let len = u32::from_be_bytes(header) as usize;
    if len > shared.config.max_frame_length {
        return Err(SourceError::Handshake(format!(
            "handshake reply of {len} bytes exceeds the frame limit"
        )));
    }
    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload).await?;

    match WireMessage::decode(Bytes::from(payload)) {
        Ok(Decoded::Message(WireMessage::Ok { initial_credits })) => {
            shared.deposit_credits(initial_credits);
            shared.send.lock().await.writer = Some(writer);
            info!(credits = initial_credits, "handshake complete");
            metrics::inc_connections();
            Ok(reader)
        }
        Ok(Decoded::Message(WireMessage::Error { message })) => {
            Err(SourceError::Handshake(message))
        }
        Ok(Decoded::Message(other)) => Err(SourceError::Protocol(format!(
            "{} received during handshake",
            other.name()
        ))),
        Ok(Decoded::Unknown { tag, .. }) => Err(SourceError::Handshake(format!(
            "unrecognised handshake reply (tag {tag:#04x})"
        ))),
        Err(e) => Err(SourceError::Handshake(e.to_string())),
    }
}

/// Entry point of the driver task spawned by `connect`.
pub(super) async fn run<H: SourceHandler>(
    shared: Arc<Shared<H>>,
    reader: OwnedReadHalf,
    mut records: Option<Box<dyn RecordSource>>,
) {
    match drive(&shared, reader, &mut records).await {
        Ok(()) | Err(SourceError::Closed) => shared.close(None).await,
        Err(error) => shared.fail(error).await,
    }
}

/// Run steady-state loops across reconnects until a terminal condition.
async fn drive<H: SourceHandler>(
    shared: &Arc<Shared<H>>,
    mut reader: OwnedReadHalf,
    records: &mut Option<Box<dyn RecordSource>>,
) -> Result<(), SourceError> {
    loop {
        let mut framed = FramedRead::new(
            reader,
            FrameCodec::new(shared.config.max_frame_length),
        );
        let flow = steady_loop(shared, &mut framed, records).await?;
        drop(framed);
        match flow {
            Flow::Stop => return Ok(()),
            Flow::Reconnect { address } => {
                reader = reconnect(shared, address).await?;
            }
        }
    }
}

/// The biased select loop for one live connection.
async fn steady_loop<H: SourceHandler>(
    shared: &Arc<Shared<H>>,
    framed: &mut FramedRead<OwnedReadHalf, FrameCodec>,
    records: &mut Option<Box<dyn RecordSource>>,
) -> Result<Flow, SourceError> {
    let mut retry_at: Option<Instant> = None;
    loop {
        let has_source = records.is_some();
        tokio::select! {
            biased;

            () = shared.stopped.cancelled() => return Ok(Flow::Stop),

            item = framed.next() => match item {
                Some(Ok(decoded)) => {
                    metrics::inc_frames(metrics::Direction::Inbound);
                    match dispatch(shared, decoded).await {
                        Ok(None) => {}
                        Ok(Some(flow)) => return Ok(flow),
                        Err(SourceError::Transport(e)) => {
                            warn!(error = %e, "socket error during dispatch; reconnecting");
                            return Ok(Flow::Reconnect { address: None });
                        }
                        Err(e) => return Err(e),
                    }
                }
                Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                    return Err(SourceError::Protocol(e.to_string()));
                }
                Some(Err(e)) => {
                    warn!(error = %e, "socket error; reconnecting");
                    return Ok(Flow::Reconnect { address: None });
                }
                None => {
                    info!("connection closed by peer; reconnecting");
                    return Ok(Flow::Reconnect { address: None });
                }
            },

            permit = wait_for_pull(shared, retry_at), if has_source => {
                let Ok(permit) = permit else {
                    return Ok(Flow::Stop);
                };
                let Some(source) = records.as_mut() else {
                    continue;
                };
                match source.next_record().await {
                    Pull::Record(record) => {
                        permit.forget();
                        retry_at = None;
                        match send_record(shared, record).await {
                            Ok(()) => {}
                            Err(SourceError::Transport(e)) => {
                                warn!(error = %e, "socket error during send; reconnecting");
                                return Ok(Flow::Reconnect { address: None });
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    Pull::Pending => {
                        drop(permit);
                        retry_at = Some(Instant::now() + PULL_RETRY_INTERVAL);
                    }
                    Pull::Exhausted => {
                        drop(permit);
                        info!("record source exhausted; closing");
                        *records = None;
                        return Ok(Flow::Stop);
                    }
                }
            },
        }
    }
}

/// Wait until the pull path may run: past any pending-retry delay and
/// holding one credit. Cancellation returns the credit untouched.
async fn wait_for_pull<'a, H>(
    shared: &'a Shared<H>,
    retry_at: Option<Instant>,
) -> Result<tokio::sync::SemaphorePermit<'a>, tokio::sync::AcquireError> {
    if let Some(at) = retry_at {
        sleep_until(at).await;
    }
    shared.credits.acquire().await
}

/// Transmit one pulled record. The credit was already consumed.
async fn send_record<H: SourceHandler>(
    shared: &Shared<H>,
    record: Record,
) -> Result<(), SourceError> {
    if let Some(pacer) = &shared.pacer {
        pacer.acquire(1).await;
    }
    if shared.stopped.is_cancelled() {
        return Err(SourceError::Closed);
    }
    let stream_id = record.stream_id;
    let frame = encode_frame(
        &WireMessage::Message(record),
        shared.config.max_frame_length,
    )?;
    let mut send = shared.send.lock().await;
    if !send.registry.is_open(stream_id) {
        metrics::inc_errors();
        shared.deposit_credits(1);
        return Err(crate::stream::ValidationError::StreamNotOpen { id: stream_id }.into());
    }
    send.enqueue(frame);
    metrics::inc_frames(metrics::Direction::Outbound);
    send.flush().await?;
    Ok(())
}

/// Dispatch one inbound frame.
///
/// Returns `Ok(Some(flow))` when the frame changes control flow (Restart),
/// `Ok(None)` to continue, and `Err` for fatal conditions.
async fn dispatch<H: SourceHandler>(
    shared: &Shared<H>,
    decoded: Decoded,
) -> Result<Option<Flow>, SourceError> {
    let message = match decoded {
        Decoded::Unknown { tag, payload } => {
            // Forward-compatible peers may speak newer message types.
            warn!(tag, "ignoring unrecognised message");
            shared.handler.invalid_message(tag, &payload);
            return Ok(None);
        }
        Decoded::Message(message) => message,
    };
    match message {
        WireMessage::Ok { .. } => Err(SourceError::Protocol(
            "Ok received outside of a handshake".into(),
        )),
        WireMessage::Error { message } => Err(SourceError::Application(message)),
        WireMessage::NotifyAck {
            success,
            stream_id,
            point_of_ref,
        } => {
            let snapshot = {
                let mut send = shared.send.lock().await;
                send.registry.apply_notify_ack(stream_id, point_of_ref, success)
            };
            match snapshot {
                Some(stream) if stream.is_open => shared.handler.stream_opened(&stream),
                Some(stream) => {
                    info!(%stream_id, name = %stream.name, "notify rejected; queued for retry");
                }
                None => warn!(%stream_id, "NotifyAck for a stream that was never notified"),
            }
            Ok(None)
        }
        WireMessage::Ack { credits, acks } => {
            shared.deposit_credits(credits);
            let (acked, retries) = {
                let mut send = shared.send.lock().await;
                let mut acked = Vec::with_capacity(acks.len());
                for (id, point_of_ref) in acks {
                    match send.registry.apply_ack(id, point_of_ref) {
                        Some(stream) => acked.push(stream),
                        None => debug!(%id, "Ack for unknown stream"),
                    }
                }
                (acked, send.registry.drain_retries())
            };
            for stream in &acked {
                shared.handler.stream_acked(stream);
            }
            // The periodic Ack doubles as the retry timer for rejected
            // notifies.
            resend_notifies(shared, retries).await?;
            Ok(None)
        }
        WireMessage::Restart { address } => {
            warn!(?address, "restart requested by peer");
            Ok(Some(Flow::Reconnect { address }))
        }
        other @ (WireMessage::Hello { .. }
        | WireMessage::Notify { .. }
        | WireMessage::Message(_)
        | WireMessage::EosMessage { .. }) => {
            let description = format!("{} is not valid on the connector side", other.name());
            send_error_best_effort(shared, &description).await;
            Err(SourceError::Protocol(description))
        }
    }
}

/// Re-send a Notify for each stream, consuming credits opportunistically.
///
/// Driver-side sends must not wait on credits: an Ack cannot be processed
/// while its own dispatch is blocked on one. A stream that finds no credit
/// goes (back) to the retry set and waits for the next Ack.
async fn resend_notifies<H: SourceHandler>(
    shared: &Shared<H>,
    streams: Vec<Stream>,
) -> Result<(), SourceError> {
    if streams.is_empty() {
        return Ok(());
    }
    let mut announced = Vec::new();
    {
        let mut send = shared.send.lock().await;
        for stream in streams {
            match shared.credits.try_acquire() {
                Ok(permit) => {
                    permit.forget();
                    let message = WireMessage::Notify {
                        stream_id: stream.id,
                        stream_name: stream.name.clone(),
                        point_of_ref: stream.point_of_ref,
                    };
                    let frame = encode_frame(&message, shared.config.max_frame_length)?;
                    let snapshot = send.registry.prepare_notify(
                        stream.id,
                        Some(&stream.name),
                        Some(stream.point_of_ref),
                    )?;
                    send.enqueue(frame);
                    metrics::inc_frames(metrics::Direction::Outbound);
                    announced.push(snapshot);
                }
                Err(_) => send.registry.queue_retry(stream),
            }
        }
        send.flush().await?;
    }
    for stream in &announced {
        shared.handler.stream_added(stream);
    }
    Ok(())
}

/// Best-effort Error frame ahead of a fatal protocol teardown.
async fn send_error_best_effort<H>(shared: &Shared<H>, description: &str) {
    let mut send = shared.send.lock().await;
    if let Some(writer) = send.writer.as_mut() {
        if let Ok(frame) = encode_frame(
            &WireMessage::Error {
                message: description.to_owned(),
            },
            shared.config.max_frame_length,
        ) {
            let _ = writer.write_all(&frame).await;
        }
    }
}

/// Drop connection state ahead of a reconnect: credits to zero, open
/// streams closed (with callbacks), queued bytes discarded, socket
/// released.
async fn teardown<H: SourceHandler>(shared: &Shared<H>) {
    shared.drain_credits();
    let closed = {
        let mut send = shared.send.lock().await;
        let was_connected = send.writer.take().is_some();
        let discarded = send.discard_queue();
        if discarded > 0 {
            warn!(bytes = discarded, "discarding queued outbound bytes for reconnect");
        }
        send.registry.clear_retries();
        if was_connected {
            metrics::dec_connections();
        }
        send.registry.close_all_open()
    };
    for stream in &closed {
        shared.handler.stream_closed(stream);
    }
}

/// Tear down and re-establish the connection.
///
/// Retries connection-refused and connection-reset at the configured fixed
/// backoff; any other failure is fatal and ends the loop. On success the
/// restart hook chooses which of the pre-teardown streams to re-notify
/// (all of them by default).
async fn reconnect<H: SourceHandler>(
    shared: &Arc<Shared<H>>,
    address: Option<String>,
) -> Result<OwnedReadHalf, SourceError> {
    teardown(shared).await;
    if let Some(address) = address {
        let (host, port) = parse_address(&address)?;
        info!(%host, port, "restart re-pointed the connection");
        shared.set_target(host, port);
    }
    shared.set_state(ConnState::Reconnecting);
    let previous = { shared.send.lock().await.registry.snapshot() };
    loop {
        if shared.stopped.is_cancelled() {
            return Err(SourceError::Closed);
        }
        match establish(shared).await {
            Ok(reader) => {
                shared.set_state(ConnState::Connected);
                let keep = shared.handler.restart_streams(previous.clone());
                resend_notifies(shared, keep).await?;
                return Ok(reader);
            }
            Err(e) if e.is_reconnectable() => {
                debug!(error = %e, "reconnect attempt failed; retrying");
                sleep(shared.config.reconnect_backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn parse_address(address: &str) -> Result<(String, u16), SourceError> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| SourceError::Protocol(format!("unusable restart address {address:?}")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| SourceError::Protocol(format!("unusable restart address {address:?}")))?;
    Ok((host.to_owned(), port))
}

#[cfg(test)]
mod tests {
    use super::parse_address;

    #[test]
    fn parse_address_accepts_host_port() {
        let (host, port) = parse_address("10.0.0.2:7100").expect("valid address");
        assert_eq!(host, "10.0.0.2");
        assert_eq!(port, 7100);
    }

    #[test]
    fn parse_address_rejects_garbage() {
        assert!(parse_address("no-port-here").is_err());
        assert!(parse_address("host:notaport").is_err());
    }
}
