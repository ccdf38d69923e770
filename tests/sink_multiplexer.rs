//! Integration coverage for the sink multiplexer: interleaved connections,
//! arbitrary chunking, per-connection teardown isolation, and timeouts.

use bytes::Bytes;
use streamgate::{
    SinkConfig,
    SinkConnector,
    SinkError,
    StreamId,
    codec::{DEFAULT_MAX_FRAME_LENGTH, encode_frame},
    wire::{Decoded, Record, WireMessage},
};
use tokio::{
    io::AsyncWriteExt,
    net::TcpStream,
    time::{Duration, sleep},
};

fn sink_config() -> SinkConfig { SinkConfig::new("results-sink", "127.0.0.1", 0, "cookie") }

fn message_frame(stream: u64, payload: Vec<u8>) -> Bytes {
    encode_frame(
        &WireMessage::Message(Record::new(StreamId::new(stream), 0, Bytes::from(payload))),
        DEFAULT_MAX_FRAME_LENGTH,
    )
    .expect("encode frame")
}

fn payload_of(item: Decoded) -> (u64, Bytes) {
    match item {
        Decoded::Message(WireMessage::Message(record)) => {
            (record.stream_id.as_u64(), record.payload)
        }
        other => panic!("expected a Message frame, got {other:?}"),
    }
}

#[tokio::test]
async fn two_interleaved_connections_demultiplex_regardless_of_chunking() {
    let mut sink = SinkConnector::new(sink_config());
    let addr = sink.listen().await.expect("listen");

    let frame_one = message_frame(1, vec![0xAA; 100]);
    let frame_two = message_frame(2, vec![0xBB; 100]);

    // Connection one dribbles its frame a byte at a time; connection two
    // sends it whole.
    let dribble = tokio::spawn(async move {
        let mut conn = TcpStream::connect(addr).await.expect("connect");
        for byte in frame_one.as_ref() {
            conn.write_all(&[*byte]).await.expect("write");
            sleep(Duration::from_millis(1)).await;
        }
        conn
    });
    let whole = tokio::spawn(async move {
        let mut conn = TcpStream::connect(addr).await.expect("connect");
        conn.write_all(&frame_two).await.expect("write");
        conn
    });

    let first = payload_of(sink.read().await.expect("read"));
    let second = payload_of(sink.read().await.expect("read"));

    let mut by_stream = [first, second];
    by_stream.sort_by_key(|(stream, _)| *stream);
    assert_eq!(by_stream[0], (1, Bytes::from(vec![0xAA; 100])));
    assert_eq!(by_stream[1], (2, Bytes::from(vec![0xBB; 100])));
    assert_eq!(sink.connection_count(), 2);

    drop(dribble.await.expect("dribble writer"));
    drop(whole.await.expect("whole writer"));
}

#[tokio::test]
async fn several_frames_in_one_segment_all_surface() {
    let mut sink = SinkConnector::new(sink_config());
    let addr = sink.listen().await.expect("listen");

    let mut conn = TcpStream::connect(addr).await.expect("connect");
    let mut burst = Vec::new();
    for n in 0..3_u8 {
        burst.extend_from_slice(&message_frame(7, vec![n; 8]));
    }
    conn.write_all(&burst).await.expect("write");

    for n in 0..3_u8 {
        let (stream, payload) = payload_of(sink.read().await.expect("read"));
        assert_eq!(stream, 7);
        assert_eq!(payload, Bytes::from(vec![n; 8]));
    }
}

#[tokio::test]
async fn a_bad_connection_is_torn_down_without_affecting_the_rest() {
    let mut sink = SinkConnector::new(sink_config());
    let addr = sink.listen().await.expect("listen");

    let mut bad = TcpStream::connect(addr).await.expect("connect");
    let mut good = TcpStream::connect(addr).await.expect("connect");

    // A header declaring a frame far beyond the limit.
    bad.write_all(&[0xff, 0xff, 0xff, 0xff]).await.expect("write");
    good.write_all(&message_frame(3, b"still fine".to_vec()))
        .await
        .expect("write");

    let (stream, payload) = payload_of(sink.read().await.expect("read"));
    assert_eq!(stream, 3);
    assert_eq!(payload, Bytes::from_static(b"still fine"));

    // Give the loop a cycle to process the poisoned header, then confirm
    // only the good connection survived.
    let extra = sink
        .read_timeout(Duration::from_millis(100))
        .await
        .expect("read_timeout");
    assert!(extra.is_none());
    assert_eq!(sink.connection_count(), 1);
}

#[tokio::test]
async fn clean_disconnect_removes_the_connection() {
    let mut sink = SinkConnector::new(sink_config());
    let addr = sink.listen().await.expect("listen");

    let mut conn = TcpStream::connect(addr).await.expect("connect");
    conn.write_all(&message_frame(9, b"last words".to_vec()))
        .await
        .expect("write");
    conn.shutdown().await.expect("shutdown");
    drop(conn);

    let (stream, payload) = payload_of(sink.read().await.expect("read"));
    assert_eq!((stream, payload), (9, Bytes::from_static(b"last words")));

    let extra = sink
        .read_timeout(Duration::from_millis(100))
        .await
        .expect("read_timeout");
    assert!(extra.is_none());
    assert_eq!(sink.connection_count(), 0);
}

#[tokio::test]
async fn unknown_tags_surface_as_unknown_items() {
    let mut sink = SinkConnector::new(sink_config());
    let addr = sink.listen().await.expect("listen");

    let mut conn = TcpStream::connect(addr).await.expect("connect");
    // length prefix + unrecognised tag + opaque body
    conn.write_all(&[0, 0, 0, 4, 0x7f, 1, 2, 3]).await.expect("write");

    match sink.read().await.expect("read") {
        Decoded::Unknown { tag, payload } => {
            assert_eq!(tag, 0x7f);
            assert_eq!(payload, Bytes::from_static(&[1, 2, 3]));
        }
        other => panic!("expected an unknown item, got {other:?}"),
    }
}

#[tokio::test]
async fn read_times_out_when_nothing_arrives() {
    let mut sink = SinkConnector::new(sink_config());
    sink.listen().await.expect("listen");

    let got = sink
        .read_timeout(Duration::from_millis(50))
        .await
        .expect("read_timeout");
    assert!(got.is_none());
}

#[tokio::test]
async fn read_before_listen_is_an_error() {
    let mut sink = SinkConnector::new(sink_config());
    let err = sink.read().await.expect_err("read must fail before listen");
    assert!(matches!(err, SinkError::NotListening));
}
