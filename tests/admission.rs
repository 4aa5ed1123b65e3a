//! Admission control through the composed chain and the TCP accept loop.

use std::sync::Arc;
use std::time::Duration;

use gatehouse::config::ListenerConfig;
use gatehouse::lifecycle::Shutdown;
use gatehouse::middleware::{handler_fn, ConnectionBuilder, ConnectionLimitMiddleware};
use gatehouse::net::Listener;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Semaphore;

mod common;

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

#[tokio::test]
async fn exactly_n_of_n_plus_one_are_admitted() {
    for quota in 0..4usize {
        let middleware = ConnectionLimitMiddleware::with_limit(Some(quota));
        let limiter = middleware.limiter().clone();
        // Handlers hold their slot until the gate opens.
        let gate = Arc::new(Semaphore::new(0));
        let handler_gate = Arc::clone(&gate);

        let delegate = ConnectionBuilder::new()
            .use_middleware(middleware)
            .run(handler_fn(move |conn| {
                let gate = Arc::clone(&handler_gate);
                Box::pin(async move {
                    conn.transport_mut().write_all(b"ok").await.unwrap();
                    let _permit = gate.acquire().await.unwrap();
                })
            }));

        let mut clients = Vec::new();
        for _ in 0..=quota {
            clients.push(common::run_chain(&delegate));
        }

        let mut admitted = 0;
        let mut rejected = 0;
        for (client, _) in &mut clients {
            let mut buf = [0u8; 2];
            match client.read(&mut buf).await.unwrap() {
                0 => rejected += 1,
                _ => admitted += 1,
            }
        }
        assert_eq!((admitted, rejected), (quota, 1), "quota {quota}");
        assert_eq!(limiter.active(), quota);

        gate.add_permits(quota);
        for (_, task) in clients {
            task.await.unwrap();
        }
        assert_eq!(limiter.active(), 0);
    }
}

#[tokio::test]
async fn tcp_quota_is_reusable_after_release() {
    let config = ListenerConfig {
        bind_address: "127.0.0.1:0".to_string(),
        max_connections: Some(2),
        backlog: 64,
    };
    let listener = Listener::bind(&config).await.unwrap();
    let addr = listener.local_addr().unwrap();

    let middleware = ConnectionLimitMiddleware::with_limit(config.max_connections);
    let limiter = middleware.limiter().clone();
    // Admitted connections greet, then stay until the client hangs up.
    let delegate = ConnectionBuilder::new()
        .use_middleware(middleware)
        .run(handler_fn(|conn| {
            Box::pin(async move {
                let transport = conn.transport_mut();
                if transport.write_all(b"ok").await.is_err() {
                    return;
                }
                let mut sink = Vec::new();
                let _ = transport.read_to_end(&mut sink).await;
            })
        }));

    let shutdown = Shutdown::new();
    let server = tokio::spawn(listener.serve(delegate, shutdown.subscribe()));

    async fn greet(addr: std::net::SocketAddr) -> (TcpStream, Vec<u8>) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 2];
        let n = stream.read(&mut buf).await.unwrap();
        (stream, buf[..n].to_vec())
    }

    let (first, greeting) = greet(addr).await;
    assert_eq!(greeting, b"ok");
    let (second, greeting) = greet(addr).await;
    assert_eq!(greeting, b"ok");

    let (_third, greeting) = greet(addr).await;
    assert!(greeting.is_empty(), "third connection must be closed");
    assert_eq!(limiter.active(), 2);

    drop(first);
    eventually(|| limiter.active() == 1).await;

    let (fourth, greeting) = greet(addr).await;
    assert_eq!(greeting, b"ok");

    drop(second);
    drop(fourth);
    eventually(|| limiter.active() == 0).await;

    shutdown.trigger();
    server.await.unwrap().unwrap();
}
