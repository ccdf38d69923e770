//! Shared fixtures for the integration suites: an in-process engine stub
//! speaking the engine side of the protocol over real TCP sockets, a
//! recording lifecycle handler, and a scriptable record source.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{
        Arc,
        Mutex,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::{
    net::{TcpListener, TcpStream},
    time::{Duration, sleep, timeout},
};
use tokio_util::codec::Framed;
use streamgate::{
    FrameCodec,
    Pull,
    RecordSource,
    SourceHandler,
    Stream,
    wire::{Decoded, Record, WireMessage},
};

/// Accept-side stand-in for the engine.
pub struct EngineStub {
    listener: TcpListener,
    addr: SocketAddr,
}

/// Install a subscriber once so failing tests print their traces.
fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

impl EngineStub {
    pub async fn bind() -> Self {
        init_tracing();
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let addr = listener.local_addr().expect("stub local addr");
        Self { listener, addr }
    }

    pub fn port(&self) -> u16 { self.addr.port() }

    /// Accept one connection, consume its Hello, and grant credits.
    pub async fn accept(&self, initial_credits: u32) -> (EngineConn, WireMessage) {
        let (stream, _) = timeout(Duration::from_secs(5), self.listener.accept())
            .await
            .expect("timed out waiting for a connection")
            .expect("accept");
        let mut conn = EngineConn {
            framed: Framed::new(stream, FrameCodec::default()),
        };
        let hello = conn.recv().await;
        assert!(
            matches!(hello, WireMessage::Hello { .. }),
            "expected Hello, got {hello:?}"
        );
        conn.send(WireMessage::Ok { initial_credits }).await;
        (conn, hello)
    }
}

/// One accepted engine-side connection.
pub struct EngineConn {
    framed: Framed<TcpStream, FrameCodec>,
}

impl EngineConn {
    pub async fn send(&mut self, message: WireMessage) {
        self.framed.send(&message).await.expect("stub send");
    }

    /// Receive the next protocol message, failing the test on timeout,
    /// EOF, or an unknown tag.
    pub async fn recv(&mut self) -> WireMessage {
        let item = timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed while a frame was expected")
            .expect("frame decode failed");
        match item {
            Decoded::Message(message) => message,
            Decoded::Unknown { tag, .. } => panic!("unexpected unknown tag {tag:#04x}"),
        }
    }

    /// Send a raw tagged payload wrapped in a length prefix, bypassing the
    /// message encoder.
    pub async fn send_raw_frame(&mut self, payload: &[u8]) {
        use tokio::io::AsyncWriteExt;
        let len = u32::try_from(payload.len()).expect("payload fits a frame");
        let stream = self.framed.get_mut();
        stream.write_all(&len.to_be_bytes()).await.expect("raw send");
        stream.write_all(payload).await.expect("raw send");
    }

    /// Assert the connector closed its side of the connection.
    pub async fn recv_closed(&mut self) {
        let item = timeout(Duration::from_secs(5), self.framed.next())
            .await
            .expect("timed out waiting for EOF");
        assert!(item.is_none(), "expected EOF, got {item:?}");
    }
}

/// Lifecycle callbacks observed by a test.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Event {
    Added(u64),
    Removed(u64),
    Opened(u64),
    Closed(u64),
    Acked(u64, u64),
    Invalid(u8),
}

/// Handler recording every callback invocation.
pub struct RecordingHandler {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingHandler {
    pub fn new() -> (Self, Arc<Mutex<Vec<Event>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: Arc::clone(&events),
            },
            events,
        )
    }

    fn push(&self, event: Event) {
        self.events.lock().expect("events lock").push(event);
    }
}

impl SourceHandler for RecordingHandler {
    fn stream_added(&self, stream: &Stream) { self.push(Event::Added(stream.id.as_u64())); }

    fn stream_removed(&self, stream: &Stream) { self.push(Event::Removed(stream.id.as_u64())); }

    fn stream_opened(&self, stream: &Stream) { self.push(Event::Opened(stream.id.as_u64())); }

    fn stream_closed(&self, stream: &Stream) { self.push(Event::Closed(stream.id.as_u64())); }

    fn stream_acked(&self, stream: &Stream) {
        self.push(Event::Acked(stream.id.as_u64(), stream.point_of_ref.as_u64()));
    }

    fn invalid_message(&self, tag: u8, _payload: &[u8]) { self.push(Event::Invalid(tag)); }
}

/// Record source gated on a flag: pending until the gate opens, then
/// yields its scripted records, then reports exhaustion.
pub struct ScriptedSource {
    gate: Arc<AtomicBool>,
    records: VecDeque<Record>,
}

impl ScriptedSource {
    pub fn new(records: impl IntoIterator<Item = Record>) -> (Self, Arc<AtomicBool>) {
        let gate = Arc::new(AtomicBool::new(false));
        (
            Self {
                gate: Arc::clone(&gate),
                records: records.into_iter().collect(),
            },
            gate,
        )
    }
}

#[async_trait]
impl RecordSource for ScriptedSource {
    async fn next_record(&mut self) -> Pull {
        if !self.gate.load(Ordering::Acquire) {
            return Pull::Pending;
        }
        match self.records.pop_front() {
            Some(record) => Pull::Record(record),
            None => Pull::Exhausted,
        }
    }
}

/// Poll `condition` until it holds, failing the test after five seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
