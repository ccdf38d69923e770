//! Integration coverage for the source connection engine, exercised
//! against an in-process engine stub over real TCP sockets.

mod support;

use bytes::Bytes;
use streamgate::{
    ConnState,
    PointOfRef,
    SourceConfig,
    SourceConnector,
    SourceError,
    StreamId,
    ValidationError,
    wire::{Record, WireMessage},
};
use support::{EngineStub, Event, RecordingHandler, ScriptedSource, wait_until};
use tokio::{net::TcpListener, time::Duration};

fn config_for(port: u16) -> SourceConfig {
    SourceConfig::new("orders-source", "127.0.0.1", port, "cookie", "app", "app-1")
        .with_reconnect_backoff(Duration::from_millis(50))
}

fn record(stream: u64, payload: &'static [u8]) -> Record {
    Record::new(StreamId::new(stream), 0, Bytes::from_static(payload))
}

#[tokio::test]
async fn handshake_grants_credits_and_write_requires_an_open_stream() {
    let stub = EngineStub::bind().await;
    let (handler, events) = RecordingHandler::new();
    let connector = SourceConnector::new(config_for(stub.port()), handler);

    let (connected, (mut engine, hello)) = tokio::join!(connector.connect(), stub.accept(5));
    connected.expect("connect should succeed");
    assert_eq!(connector.credits(), 5);
    assert_eq!(connector.state(), ConnState::Connected);
    assert!(matches!(
        hello,
        WireMessage::Hello { cookie, .. } if cookie == "cookie"
    ));

    // A Message for a stream the peer has not opened is rejected at the
    // call site and never reaches the wire.
    let err = connector
        .write(record(1, b"too early"))
        .await
        .expect_err("write before notify must fail");
    assert!(matches!(
        err,
        SourceError::Validation(ValidationError::StreamNotOpen { .. })
    ));
    assert_eq!(connector.credits(), 5, "rejected writes cost no credit");

    connector
        .notify(StreamId::new(1), Some("orders"), None)
        .await
        .expect("notify should succeed");
    assert_eq!(connector.credits(), 4, "notify consumes one credit");
    assert_eq!(
        engine.recv().await,
        WireMessage::Notify {
            stream_id: StreamId::new(1),
            stream_name: "orders".into(),
            point_of_ref: PointOfRef::new(0),
        },
        "the rejected write must not precede the notify on the wire"
    );

    engine
        .send(WireMessage::NotifyAck {
            success: true,
            stream_id: StreamId::new(1),
            point_of_ref: PointOfRef::new(0),
        })
        .await;
    wait_until(|| events.lock().unwrap().contains(&Event::Opened(1))).await;

    connector
        .write(record(1, b"first"))
        .await
        .expect("write to an open stream should succeed");
    assert_eq!(connector.credits(), 3);
    match engine.recv().await {
        WireMessage::Message(received) => {
            assert_eq!(received.stream_id, StreamId::new(1));
            assert_eq!(received.payload, Bytes::from_static(b"first"));
        }
        other => panic!("expected Message, got {other:?}"),
    }

    // Ack replenishes credits and confirms progress.
    engine
        .send(WireMessage::Ack {
            credits: 2,
            acks: vec![(StreamId::new(1), PointOfRef::new(42))],
        })
        .await;
    wait_until(|| connector.credits() == 5).await;
    wait_until(|| events.lock().unwrap().contains(&Event::Acked(1, 42))).await;

    // End-of-stream is free of charge.
    connector
        .end_of_stream(StreamId::new(1))
        .await
        .expect("eos should succeed");
    assert_eq!(connector.credits(), 5, "EosMessage consumes no credit");
    assert_eq!(
        engine.recv().await,
        WireMessage::EosMessage { stream_id: StreamId::new(1) }
    );

    connector.shutdown(None).await;
    assert!(connector.join().await.is_none());
}

#[tokio::test]
async fn rejected_notify_retries_on_the_next_ack() {
    let stub = EngineStub::bind().await;
    let (handler, events) = RecordingHandler::new();
    let connector = SourceConnector::new(config_for(stub.port()), handler);

    let (connected, (mut engine, _)) = tokio::join!(connector.connect(), stub.accept(5));
    connected.expect("connect should succeed");

    connector
        .notify(StreamId::new(1), Some("orders"), None)
        .await
        .expect("notify should succeed");
    assert!(matches!(engine.recv().await, WireMessage::Notify { .. }));

    engine
        .send(WireMessage::NotifyAck {
            success: false,
            stream_id: StreamId::new(1),
            point_of_ref: PointOfRef::new(7),
        })
        .await;

    // The next Ack doubles as the retry timer: the rejected stream is
    // re-notified with the point of reference the peer reported.
    engine.send(WireMessage::Ack { credits: 1, acks: vec![] }).await;
    assert_eq!(
        engine.recv().await,
        WireMessage::Notify {
            stream_id: StreamId::new(1),
            stream_name: "orders".into(),
            point_of_ref: PointOfRef::new(7),
        }
    );
    assert!(
        !events.lock().unwrap().contains(&Event::Opened(1)),
        "a rejected stream must not open"
    );

    connector.shutdown(None).await;
    connector.join().await;
}

#[tokio::test]
async fn restart_reconnects_and_renotifies_every_stream() {
    let stub = EngineStub::bind().await;
    let (handler, events) = RecordingHandler::new();
    let connector = SourceConnector::new(config_for(stub.port()), handler);

    let (connected, (mut engine, _)) = tokio::join!(connector.connect(), stub.accept(5));
    connected.expect("connect should succeed");

    for (id, name) in [(1_u64, "orders"), (2, "payments")] {
        connector
            .notify(StreamId::new(id), Some(name), None)
            .await
            .expect("notify should succeed");
        assert!(matches!(engine.recv().await, WireMessage::Notify { .. }));
        engine
            .send(WireMessage::NotifyAck {
                success: true,
                stream_id: StreamId::new(id),
                point_of_ref: PointOfRef::new(0),
            })
            .await;
    }
    wait_until(|| {
        let events = events.lock().unwrap();
        events.contains(&Event::Opened(1)) && events.contains(&Event::Opened(2))
    })
    .await;

    // Advance both points of reference so the restart has something to
    // resume from.
    engine
        .send(WireMessage::Ack {
            credits: 0,
            acks: vec![
                (StreamId::new(1), PointOfRef::new(11)),
                (StreamId::new(2), PointOfRef::new(22)),
            ],
        })
        .await;
    wait_until(|| events.lock().unwrap().contains(&Event::Acked(2, 22))).await;

    engine.send(WireMessage::Restart { address: None }).await;

    // The connector tears down (closing both streams) and reconnects.
    let (mut engine2, _) = stub.accept(5).await;
    wait_until(|| {
        let events = events.lock().unwrap();
        events.contains(&Event::Closed(1)) && events.contains(&Event::Closed(2))
    })
    .await;

    let mut resumed = vec![engine2.recv().await, engine2.recv().await];
    resumed.sort_by_key(|m| match m {
        WireMessage::Notify { stream_id, .. } => stream_id.as_u64(),
        other => panic!("expected Notify after restart, got {other:?}"),
    });
    assert_eq!(
        resumed,
        vec![
            WireMessage::Notify {
                stream_id: StreamId::new(1),
                stream_name: "orders".into(),
                point_of_ref: PointOfRef::new(11),
            },
            WireMessage::Notify {
                stream_id: StreamId::new(2),
                stream_name: "payments".into(),
                point_of_ref: PointOfRef::new(22),
            },
        ],
        "every stream resumes from its last acknowledged point of reference"
    );

    connector.shutdown(None).await;
    connector.join().await;
}

#[tokio::test]
async fn connection_reset_mid_stream_drops_no_stream() {
    let stub = EngineStub::bind().await;
    let (handler, events) = RecordingHandler::new();
    let connector = SourceConnector::new(config_for(stub.port()), handler);

    let (connected, (mut engine, _)) = tokio::join!(connector.connect(), stub.accept(3));
    connected.expect("connect should succeed");

    for (id, name) in [(1_u64, "orders"), (2, "payments")] {
        connector
            .notify(StreamId::new(id), Some(name), None)
            .await
            .expect("notify should succeed");
        assert!(matches!(engine.recv().await, WireMessage::Notify { .. }));
        engine
            .send(WireMessage::NotifyAck {
                success: true,
                stream_id: StreamId::new(id),
                point_of_ref: PointOfRef::new(id * 10),
            })
            .await;
    }
    wait_until(|| {
        let events = events.lock().unwrap();
        events.contains(&Event::Opened(1)) && events.contains(&Event::Opened(2))
    })
    .await;

    // Simulate the engine dying mid-stream.
    drop(engine);

    let (mut engine2, _) = stub.accept(3).await;
    let mut resumed: Vec<u64> = vec![];
    for _ in 0..2 {
        match engine2.recv().await {
            WireMessage::Notify { stream_id, point_of_ref, .. } => {
                assert_eq!(point_of_ref, PointOfRef::new(stream_id.as_u64() * 10));
                resumed.push(stream_id.as_u64());
            }
            other => panic!("expected Notify after reconnect, got {other:?}"),
        }
    }
    resumed.sort_unstable();
    assert_eq!(resumed, vec![1, 2], "neither stream was silently dropped");

    connector.shutdown(None).await;
    connector.join().await;
}

#[tokio::test]
async fn peer_error_surfaces_through_join() {
    let stub = EngineStub::bind().await;
    let (handler, _events) = RecordingHandler::new();
    let connector = SourceConnector::new(config_for(stub.port()), handler);

    let (connected, (mut engine, _)) = tokio::join!(connector.connect(), stub.accept(1));
    connected.expect("connect should succeed");

    engine
        .send(WireMessage::Error { message: "boom".into() })
        .await;

    let error = connector.join().await.expect("join must report the peer error");
    assert!(matches!(&*error, SourceError::Application(m) if m == "boom"));
    assert_eq!(connector.state(), ConnState::Closed);
}

#[tokio::test]
async fn wrong_direction_message_is_a_protocol_error_with_best_effort_notice() {
    let stub = EngineStub::bind().await;
    let (handler, _events) = RecordingHandler::new();
    let connector = SourceConnector::new(config_for(stub.port()), handler);

    let (connected, (mut engine, _)) = tokio::join!(connector.connect(), stub.accept(1));
    connected.expect("connect should succeed");

    // Hello is only ever valid connector-to-engine.
    engine
        .send(WireMessage::Hello {
            version: "0.1.0".into(),
            cookie: "cookie".into(),
            program: "app".into(),
            instance: "app-1".into(),
        })
        .await;

    match engine.recv().await {
        WireMessage::Error { message } => {
            assert!(message.contains("Hello"), "got notice: {message}");
        }
        other => panic!("expected an Error notice, got {other:?}"),
    }
    engine.recv_closed().await;

    let error = connector.join().await.expect("join must report the violation");
    assert!(matches!(&*error, SourceError::Protocol(_)));
}

#[tokio::test]
async fn unknown_messages_are_ignored_not_fatal() {
    let stub = EngineStub::bind().await;
    let (handler, events) = RecordingHandler::new();
    let connector = SourceConnector::new(config_for(stub.port()), handler);

    let (connected, (mut engine, _)) = tokio::join!(connector.connect(), stub.accept(2));
    connected.expect("connect should succeed");

    // A tag from some future protocol revision.
    engine.send_raw_frame(&[0x7f, 1, 2, 3]).await;
    wait_until(|| events.lock().unwrap().contains(&Event::Invalid(0x7f))).await;

    // The connection keeps working afterwards.
    engine.send(WireMessage::Ack { credits: 3, acks: vec![] }).await;
    wait_until(|| connector.credits() == 5).await;

    connector.shutdown(None).await;
    connector.join().await;
}

#[tokio::test]
async fn record_source_drains_then_closes_cleanly() {
    let stub = EngineStub::bind().await;
    let (handler, events) = RecordingHandler::new();
    let connector = SourceConnector::new(config_for(stub.port()), handler);

    let (source, gate) = ScriptedSource::new([
        record(1, b"one"),
        record(1, b"two"),
        record(1, b"three"),
    ]);
    connector.set_record_source(source);

    let (connected, (mut engine, _)) = tokio::join!(connector.connect(), stub.accept(10));
    connected.expect("connect should succeed");

    connector
        .notify(StreamId::new(1), Some("orders"), None)
        .await
        .expect("notify should succeed");
    assert!(matches!(engine.recv().await, WireMessage::Notify { .. }));
    engine
        .send(WireMessage::NotifyAck {
            success: true,
            stream_id: StreamId::new(1),
            point_of_ref: PointOfRef::new(0),
        })
        .await;
    wait_until(|| events.lock().unwrap().contains(&Event::Opened(1))).await;

    // Release the scripted records only once the stream is open.
    gate.store(true, std::sync::atomic::Ordering::Release);

    for expected in [b"one".as_slice(), b"two", b"three"] {
        match engine.recv().await {
            WireMessage::Message(received) => {
                assert_eq!(received.payload, Bytes::copy_from_slice(expected));
            }
            other => panic!("expected Message, got {other:?}"),
        }
    }

    // Exhaustion triggers a clean flush-and-close.
    engine.recv_closed().await;
    assert!(connector.join().await.is_none());

    let stats = connector.send_stats().await;
    assert_eq!(stats.bytes_accepted, stats.bytes_written, "no byte gaps");
    assert_eq!(stats.bytes_discarded, 0);
    assert_eq!(stats.frames_sent, 4, "one notify plus three records");
}

#[tokio::test]
async fn shutdown_with_error_sends_the_error_frame_synchronously() {
    let stub = EngineStub::bind().await;
    let (handler, _events) = RecordingHandler::new();
    let connector = SourceConnector::new(config_for(stub.port()), handler);

    let (connected, (mut engine, _)) = tokio::join!(connector.connect(), stub.accept(1));
    connected.expect("connect should succeed");

    connector.shutdown(Some("operator abort")).await;
    assert_eq!(
        engine.recv().await,
        WireMessage::Error { message: "operator abort".into() }
    );
    engine.recv_closed().await;
    assert!(
        connector.join().await.is_none(),
        "a locally originated error is not a terminal failure"
    );
}

#[tokio::test]
async fn first_connection_attempt_is_not_retried() {
    // Reserve a port with nothing listening behind it.
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("local addr").port()
    };
    let (handler, _events) = RecordingHandler::new();
    let connector = SourceConnector::new(config_for(port), handler);

    let err = connector.connect().await.expect_err("connect must fail");
    assert!(matches!(err, SourceError::Transport(_)));
    assert_eq!(connector.state(), ConnState::Closed);
    assert!(connector.join().await.is_none(), "the caller already has the error");
}
