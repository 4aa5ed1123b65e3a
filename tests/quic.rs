//! Multiplexed transport over the in-process loopback fabric.

use std::time::Duration;

use bytes::Bytes;
use gatehouse::quic::{
    ConnectionState, LoopbackFabric, QuicConnection, QuicConnectionOptions, QuicError,
    QuicListener, QuicListenerOptions, ReadState, SendState, TransportStatus,
};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;

/// Wait until `condition` holds, polling for up to two seconds.
async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

/// A listener plus both ends of one handshaked connection.
async fn connected_pair(
    fabric: &LoopbackFabric,
    options: QuicListenerOptions,
) -> (QuicListener, QuicConnection, QuicConnection) {
    let listener = QuicListener::bind(fabric, options).unwrap();
    let connect = QuicConnection::connect(fabric, QuicConnectionOptions::new(listener.local_address()));
    let (client, server) = tokio::join!(connect, listener.accept_connection());
    (listener, client.unwrap(), server.unwrap())
}

#[tokio::test]
async fn streams_deliver_their_own_bytes_in_order() {
    let fabric = LoopbackFabric::new();
    let (_listener, client, server) = connected_pair(&fabric, QuicListenerOptions::default()).await;
    assert_eq!(client.negotiated_application_protocol(), Some(b"h3".to_vec()));
    assert_eq!(server.negotiated_application_protocol(), Some(b"h3".to_vec()));

    let mut first = client.open_bidirectional_stream().await.unwrap();
    let mut second = client.open_bidirectional_stream().await.unwrap();
    assert_eq!((first.id(), second.id()), (Some(0), Some(4)));

    let mut first_in = server.accept_stream().await.unwrap();
    let mut second_in = server.accept_stream().await.unwrap();
    assert_eq!((first_in.id(), second_in.id()), (Some(0), Some(4)));

    first.write(Bytes::from_static(b"one:a "), false).await.unwrap();
    second.write(Bytes::from_static(b"two:a "), false).await.unwrap();
    second.write(Bytes::from_static(b"two:b "), false).await.unwrap();
    first.write(Bytes::from_static(b"one:b "), false).await.unwrap();
    first
        .write_gather(&[Bytes::from_static(b"one:c"), Bytes::new()], true)
        .await
        .unwrap();
    second.write(Bytes::from_static(b"two:c"), true).await.unwrap();

    let mut received = Vec::new();
    second_in.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"two:a two:b two:c");
    received.clear();
    first_in.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"one:a one:b one:c");
    assert_eq!(first_in.read_state(), ReadState::ReadsCompleted);

    // Replies travel back on the same streams.
    first_in.write(Bytes::from_static(b"ack"), true).await.unwrap();
    received.clear();
    first.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"ack");
}

#[tokio::test]
async fn unidirectional_streams_are_one_way() {
    let fabric = LoopbackFabric::new();
    let (_listener, client, server) = connected_pair(&fabric, QuicListenerOptions::default()).await;

    let mut outbound = client.open_unidirectional_stream().await.unwrap();
    assert_eq!(outbound.id(), Some(2));
    assert!(!outbound.can_read());
    outbound.write(Bytes::from_static(b"log line"), true).await.unwrap();

    let mut inbound = server.accept_stream().await.unwrap();
    assert!(inbound.can_read());
    assert!(!inbound.can_write());
    assert!(matches!(
        inbound.write(Bytes::from_static(b"nope"), false).await,
        Err(QuicError::InvalidOperation(_))
    ));

    let mut received = Vec::new();
    inbound.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"log line");
}

#[tokio::test]
async fn graceful_shutdown_completes_both_directions() {
    let fabric = LoopbackFabric::new();
    let (_listener, client, server) = connected_pair(&fabric, QuicListenerOptions::default()).await;

    let mut outbound = client.open_bidirectional_stream().await.unwrap();
    let token = CancellationToken::new();
    outbound
        .write_cancellable(Bytes::from_static(b"request"), false, &token)
        .await
        .unwrap();
    outbound.shutdown_write_completed().await.unwrap();
    // The FIN is not a send of its own; the send side is idle and closed.
    assert_eq!(outbound.send_state(), SendState::None);
    assert_eq!(
        outbound.write(Bytes::from_static(b"more"), false).await,
        Err(QuicError::InvalidOperation("stream has already been finished"))
    );

    let mut inbound = server.accept_stream().await.unwrap();
    let mut received = Vec::new();
    inbound.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"request");
    inbound.write(Bytes::from_static(b"response"), false).await.unwrap();
    inbound.shutdown_write_completed().await.unwrap();

    received.clear();
    outbound.read_to_end(&mut received).await.unwrap();
    assert_eq!(received, b"response");

    let both = async {
        outbound.shutdown_completed().await.unwrap();
        inbound.shutdown_completed().await.unwrap();
    };
    tokio::time::timeout(Duration::from_secs(2), both)
        .await
        .expect("both directions closed");
}

#[tokio::test]
async fn write_abort_code_fails_the_pending_peer_read() {
    let fabric = LoopbackFabric::new();
    let (_listener, client, server) = connected_pair(&fabric, QuicListenerOptions::default()).await;

    let mut outbound = client.open_bidirectional_stream().await.unwrap();
    outbound.write(Bytes::from_static(b"partial"), false).await.unwrap();
    let mut inbound = server.accept_stream().await.unwrap();

    let mut buf = [0u8; 64];
    assert_eq!(inbound.read(&mut buf).await.unwrap(), 7);

    // This read is in flight when the abort lands.
    let pending = tokio::spawn(async move {
        let mut buf = [0u8; 64];
        inbound.read(&mut buf).await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!pending.is_finished());

    outbound.shutdown_write(42).unwrap();
    let result = tokio::time::timeout(Duration::from_secs(2), pending)
        .await
        .expect("read woken by abort")
        .unwrap();
    assert_eq!(result, Err(QuicError::StreamAborted { error_code: Some(42) }));

    // A second abort is a no-op, and the local write side reports a local abort.
    outbound.shutdown_write(43).unwrap();
    assert_eq!(
        outbound.write(Bytes::from_static(b"late"), false).await,
        Err(QuicError::StreamAborted { error_code: None })
    );
}

#[tokio::test]
async fn read_abort_code_fails_peer_writes() {
    let fabric = LoopbackFabric::new();
    let (_listener, client, server) = connected_pair(&fabric, QuicListenerOptions::default()).await;

    let mut outbound = client.open_bidirectional_stream().await.unwrap();
    let inbound = server.accept_stream().await.unwrap();
    inbound.abort_handle().shutdown_read(7);

    let mut error = None;
    for _ in 0..200 {
        match outbound.write(Bytes::from_static(b"data"), false).await {
            Ok(()) => tokio::time::sleep(Duration::from_millis(10)).await,
            Err(e) => {
                error = Some(e);
                break;
            }
        }
    }
    assert_eq!(error, Some(QuicError::StreamAborted { error_code: Some(7) }));
}

#[tokio::test]
async fn dispose_twice_releases_every_handle_once() {
    let fabric = LoopbackFabric::new();
    let (listener, client, server) = connected_pair(&fabric, QuicListenerOptions::default()).await;

    let mut outbound = client.open_bidirectional_stream().await.unwrap();
    outbound.write(Bytes::from_static(b"x"), false).await.unwrap();
    let inbound = server.accept_stream().await.unwrap();
    assert_eq!(client.live_stream_count(), 1);

    outbound.dispose();
    outbound.dispose();
    assert_eq!(client.live_stream_count(), 0);
    drop(outbound);
    drop(inbound);

    client.dispose();
    client.dispose();
    drop(client);
    server.dispose();
    drop(server);
    listener.dispose();
    listener.dispose();
    drop(listener);

    eventually(|| fabric.open_handle_count() == 0).await;
    assert_eq!(fabric.opened_handle_count(), fabric.closed_handle_count());
    assert_eq!(fabric.listener_count(), 0);
}

#[tokio::test]
async fn backlog_of_one_hands_out_connections_in_order() {
    let fabric = LoopbackFabric::new();
    let options = QuicListenerOptions {
        backlog: 1,
        ..QuicListenerOptions::default()
    };
    let listener = QuicListener::bind(&fabric, options).unwrap();
    let address = listener.local_address();

    let first = QuicConnection::connect(&fabric, QuicConnectionOptions::new(address))
        .await
        .unwrap();

    let second_fabric = fabric.clone();
    let second = tokio::spawn(async move {
        QuicConnection::connect(&second_fabric, QuicConnectionOptions::new(address)).await
    });

    // The backlog is full, so the second handshake cannot finish yet.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!second.is_finished());

    let first_accepted = listener.accept_connection().await.unwrap();
    assert_eq!(first_accepted.remote_address(), first.local_address());

    let second = tokio::time::timeout(Duration::from_secs(2), second)
        .await
        .expect("second handshake completes once the backlog drains")
        .unwrap()
        .unwrap();
    let second_accepted = listener.accept_connection().await.unwrap();
    assert_eq!(second_accepted.remote_address(), second.local_address());
    assert_ne!(first.local_address(), second.local_address());
}

#[tokio::test]
async fn peer_close_code_reaches_accept_stream() {
    let fabric = LoopbackFabric::new();
    let (_listener, client, server) = connected_pair(&fabric, QuicListenerOptions::default()).await;

    server.close(9).await;
    assert_eq!(server.state(), ConnectionState::ShutdownComplete);
    assert_eq!(
        server.accept_stream().await.unwrap_err(),
        QuicError::OperationAborted
    );

    assert_eq!(
        client.accept_stream().await.unwrap_err(),
        QuicError::ConnectionAborted { error_code: 9 }
    );
    eventually(|| client.is_shutting_down()).await;
    assert_eq!(
        client.open_bidirectional_stream().await.unwrap_err(),
        QuicError::ConnectionAborted { error_code: 9 }
    );
}

#[tokio::test]
async fn streams_queued_before_close_are_still_accepted() {
    let fabric = LoopbackFabric::new();
    let (_listener, client, server) = connected_pair(&fabric, QuicListenerOptions::default()).await;

    let mut outbound = client.open_bidirectional_stream().await.unwrap();
    outbound.write(Bytes::from_static(b"last words"), true).await.unwrap();
    client.close(3).await;

    let inbound = server.accept_stream().await.unwrap();
    assert_eq!(inbound.id(), Some(0));
    assert_eq!(
        server.accept_stream().await.unwrap_err(),
        QuicError::ConnectionAborted { error_code: 3 }
    );
}

#[tokio::test]
async fn idle_connections_are_shut_down_on_both_ends() {
    let fabric = LoopbackFabric::new();
    let options = QuicListenerOptions {
        idle_timeout: Some(Duration::from_millis(50)),
        ..QuicListenerOptions::default()
    };
    let listener = QuicListener::bind(&fabric, options).unwrap();
    // Only the server side times out.
    let connect = QuicConnection::connect(
        &fabric,
        QuicConnectionOptions::new(listener.local_address()).with_idle_timeout(None),
    );
    let (client, server) = tokio::join!(connect, listener.accept_connection());
    let (client, server) = (client.unwrap(), server.unwrap());

    let accepted = tokio::time::timeout(Duration::from_secs(2), server.accept_stream())
        .await
        .expect("idle timeout fires");
    assert_eq!(accepted.unwrap_err(), QuicError::ConnectionIdle);
    assert_eq!(client.accept_stream().await.unwrap_err(), QuicError::ConnectionIdle);
    eventually(|| client.state() == ConnectionState::ShutdownComplete).await;
}

#[tokio::test]
async fn stream_limit_is_enforced_at_open() {
    let fabric = LoopbackFabric::new();
    let options = QuicListenerOptions {
        max_bidirectional_streams: 1,
        ..QuicListenerOptions::default()
    };
    let (_listener, client, _server) = connected_pair(&fabric, options).await;
    eventually(|| client.remote_available_bidirectional_stream_count() == 1).await;
    assert_eq!(client.remote_available_unidirectional_stream_count(), 10);

    let open = client.open_bidirectional_stream().await.unwrap();
    assert_eq!(
        client.open_bidirectional_stream().await.unwrap_err(),
        QuicError::Transport(TransportStatus::StreamLimitReached)
    );

    // Closing the stream gives the slot back.
    drop(open);
    eventually(|| client.remote_available_bidirectional_stream_count() == 1).await;
    assert!(client.open_bidirectional_stream().await.is_ok());
}

#[tokio::test]
async fn mismatched_protocols_fail_the_connect() {
    let fabric = LoopbackFabric::new();
    let listener = QuicListener::bind(&fabric, QuicListenerOptions::default()).unwrap();
    let options = QuicConnectionOptions::new(listener.local_address())
        .with_application_protocols(["smtp"]);

    assert_eq!(
        QuicConnection::connect(&fabric, options).await.unwrap_err(),
        QuicError::Transport(TransportStatus::AlpnNegotiationFailure)
    );
}
