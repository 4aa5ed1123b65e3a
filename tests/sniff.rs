//! TLS detection on real client traffic.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use gatehouse::middleware::{
    handler_fn, ConnectionBuilder, ConnectionDelegate, SniffOutcome, SniffPolicy,
    TlsSniffMiddleware,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

mod common;

type Seen = (Option<SniffOutcome>, Vec<u8>);

/// A chain that reports what the handler sees. `read_all` drains the
/// transport to EOF; otherwise the handler reports without reading.
fn sniffing_chain(
    middleware: TlsSniffMiddleware,
    read_all: bool,
) -> (ConnectionDelegate, mpsc::UnboundedReceiver<Seen>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let delegate = ConnectionBuilder::new()
        .use_middleware(middleware)
        .run(handler_fn(move |conn| {
            let tx = tx.clone();
            Box::pin(async move {
                let outcome = conn.features().get::<SniffOutcome>().copied();
                let mut data = Vec::new();
                if read_all {
                    conn.transport_mut().read_to_end(&mut data).await.unwrap();
                }
                let _ = tx.send((outcome, data));
            })
        }));
    (delegate, rx)
}

/// Split `data` at random points into non-empty chunks.
fn random_chunks(data: &[u8], rng: &mut fastrand::Rng) -> Vec<Vec<u8>> {
    let mut chunks = Vec::new();
    let mut rest = data;
    while !rest.is_empty() {
        let take = rng.usize(1..=rest.len().min(64));
        chunks.push(rest[..take].to_vec());
        rest = &rest[take..];
    }
    chunks
}

#[tokio::test]
async fn real_client_hello_survives_arbitrary_splits() {
    let hello = common::client_hello_bytes();
    let record_len = 5 + u16::from_be_bytes([hello[3], hello[4]]) as usize;
    assert_eq!(record_len, hello.len(), "one record in the first flight");

    let mut stream = hello.clone();
    stream.extend_from_slice(b"application data follows");

    let mut rng = fastrand::Rng::with_seed(0x5eed);
    for round in 0..20 {
        let chunks = if round == 0 {
            stream.iter().map(|b| vec![*b]).collect()
        } else {
            random_chunks(&stream, &mut rng)
        };

        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&observed);
        let middleware = TlsSniffMiddleware::new(SniffPolicy::Detect).on_client_hello(
            move |_conn, record| sink.lock().unwrap().push(record.to_vec()),
        );
        let (delegate, mut seen) = sniffing_chain(middleware, true);
        let (mut client, task) = common::run_chain(&delegate);

        for chunk in chunks {
            client.write_all(&chunk).await.unwrap();
            tokio::task::yield_now().await;
        }
        client.shutdown().await.unwrap();
        task.await.unwrap();

        let (outcome, data) = seen.recv().await.unwrap();
        assert_eq!(outcome, Some(SniffOutcome::Tls), "round {round}");
        assert_eq!(data, stream, "round {round}");
        assert_eq!(*observed.lock().unwrap(), vec![hello.clone()], "round {round}");
    }
}

#[tokio::test]
async fn non_tls_first_byte_is_classified_without_waiting() {
    for opening in [&b"G"[..], &[0x16, 0x05, 0x00][..]] {
        let middleware =
            TlsSniffMiddleware::new(SniffPolicy::Detect).with_timeout(Duration::from_secs(30));
        let (delegate, mut seen) = sniffing_chain(middleware, false);
        let (mut client, task) = common::run_chain(&delegate);

        // The client keeps the connection open; only the bytes decide.
        client.write_all(opening).await.unwrap();
        let (outcome, _) = tokio::time::timeout(Duration::from_secs(2), seen.recv())
            .await
            .expect("classified without more data")
            .unwrap();
        assert_eq!(outcome, Some(SniffOutcome::Plaintext), "{opening:02x?}");

        drop(client);
        task.await.unwrap();
    }
}

#[tokio::test]
async fn short_stream_that_ends_is_plaintext() {
    for short in [&b""[..], &[0x16][..], &[0x16, 0x03, 0x01, 0x00, 0x10][..]] {
        let (delegate, mut seen) = sniffing_chain(TlsSniffMiddleware::default(), true);
        let (mut client, task) = common::run_chain(&delegate);

        client.write_all(short).await.unwrap();
        client.shutdown().await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("short stream must not hang")
            .unwrap();

        let (outcome, data) = seen.recv().await.unwrap();
        assert_eq!(outcome, Some(SniffOutcome::Plaintext));
        assert_eq!(data, short);
    }
}
