//! Liveness integration tests: ping/pong and dead-peer detection.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tcpms::protocol::{client_join, PackageHandler};
use tcpms::{Client, ClientHooks, Server, ServerHooks, ServerSettings};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[serial_test::serial]
async fn dead_socket_is_detected_within_the_ping_budget() {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let hook_counter = Arc::clone(&disconnects);

    let server = Server::bind(
        "127.0.0.1:0",
        ServerSettings::default()
            .without_encryption()
            .with_ping(Duration::from_millis(1000), Duration::from_millis(500)),
        ServerHooks::new().on_client_disconnected(move |_id| {
            hook_counter.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .await
    .unwrap();

    // A bare protocol endpoint: joins, then dies without a word.
    let stream = TcpStream::connect(server.local_addr()).await.unwrap();
    let handler = PackageHandler::new(stream, Duration::from_millis(500));
    let cancel = CancellationToken::new();
    client_join(&handler, None, &cancel).await.unwrap();

    let joined_at = Instant::now();
    handler.close().await;
    drop(handler);

    while disconnects.load(Ordering::SeqCst) == 0 {
        assert!(
            joined_at.elapsed() < Duration::from_millis(1500),
            "disconnect not detected within interval + timeout"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(disconnects.load(Ordering::SeqCst), 1);

    server.shutdown().await;
}

#[tokio::test]
#[serial_test::serial]
async fn pong_responder_keeps_the_session_alive() {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let hook_counter = Arc::clone(&disconnects);

    let server = Server::bind(
        "127.0.0.1:0",
        ServerSettings::default()
            .without_encryption()
            .with_ping(Duration::from_millis(300), Duration::from_millis(150)),
        ServerHooks::new().on_client_disconnected(move |_id| {
            hook_counter.fetch_add(1, Ordering::SeqCst);
        }),
    )
    .await
    .unwrap();

    let client = Client::new(ClientHooks::new());
    let cancel = CancellationToken::new();
    assert!(client
        .connect(server.local_addr(), None, &cancel)
        .await
        .unwrap());

    // Several full ping cycles pass; the client answers every probe.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    assert!(client.is_connected().await);
    assert_eq!(server.client_count().await, 1);

    client.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn steady_data_counts_as_liveness() {
    let disconnects = Arc::new(AtomicUsize::new(0));
    let hook_counter = Arc::clone(&disconnects);
    let blobs = Arc::new(AtomicUsize::new(0));
    let blob_counter = Arc::clone(&blobs);

    let server = Server::bind(
        "127.0.0.1:0",
        ServerSettings::default()
            .without_encryption()
            .with_ping(Duration::from_millis(400), Duration::from_millis(200)),
        ServerHooks::new()
            .on_client_disconnected(move |_id| {
                hook_counter.fetch_add(1, Ordering::SeqCst);
            })
            .on_blob_received(move |_id, _blob| {
                blob_counter.fetch_add(1, Ordering::SeqCst);
            }),
    )
    .await
    .unwrap();

    let client = Client::new(ClientHooks::new());
    let cancel = CancellationToken::new();
    assert!(client
        .connect(server.local_addr(), None, &cancel)
        .await
        .unwrap());

    for _ in 0..10 {
        client.send_blob(&[0x55]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(disconnects.load(Ordering::SeqCst), 0);
    assert!(blobs.load(Ordering::SeqCst) >= 10);

    client.disconnect().await.unwrap();
    server.shutdown().await;
}
