//! Settings validation and endpoint state-machine tests.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::time::Duration;

use tcpms::{Client, ClientHooks, Server, ServerHooks, ServerSettings, TransportError};
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn bind_rejects_encryption_without_password() {
    let result = Server::bind("127.0.0.1:0", ServerSettings::default(), ServerHooks::new()).await;
    assert!(matches!(result, Err(TransportError::Config(_))));
}

#[tokio::test]
async fn bind_rejects_ping_timeout_at_or_above_interval() {
    let settings = ServerSettings::default()
        .without_encryption()
        .with_ping(Duration::from_millis(500), Duration::from_millis(500));
    let result = Server::bind("127.0.0.1:0", settings, ServerHooks::new()).await;
    assert!(matches!(result, Err(TransportError::Config(_))));
}

#[tokio::test]
async fn client_without_password_cannot_join_an_encrypted_server() {
    let server = Server::bind(
        "127.0.0.1:0",
        ServerSettings::default().with_password("password"),
        ServerHooks::new(),
    )
    .await
    .unwrap();

    let client = Client::new(ClientHooks::new());
    let cancel = CancellationToken::new();
    let joined = client
        .connect(server.local_addr(), None, &cancel)
        .await
        .unwrap();
    assert!(!joined);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(server.client_count().await, 0);

    server.shutdown().await;
}

#[tokio::test]
async fn connecting_twice_is_a_state_error() {
    let server = Server::bind(
        "127.0.0.1:0",
        ServerSettings::default().without_encryption(),
        ServerHooks::new(),
    )
    .await
    .unwrap();

    let client = Client::new(ClientHooks::new());
    let cancel = CancellationToken::new();
    assert!(client
        .connect(server.local_addr(), None, &cancel)
        .await
        .unwrap());

    let again = client.connect(server.local_addr(), None, &cancel).await;
    assert!(matches!(again, Err(TransportError::State(_))));

    client.disconnect().await.unwrap();
    server.shutdown().await;
}

#[tokio::test]
async fn endpoint_misuse_without_a_connection() {
    let client = Client::new(ClientHooks::new());
    assert!(matches!(
        client.send_blob(&[1]).await,
        Err(TransportError::State(_))
    ));
    assert!(matches!(
        client.disconnect().await,
        Err(TransportError::State(_))
    ));
    assert!(!client.is_connected().await);
}

#[tokio::test]
async fn dial_failure_reports_false_not_error() {
    let client = Client::new(ClientHooks::new());
    let cancel = CancellationToken::new();
    // Port 1 on localhost is essentially never listening.
    let joined = client.connect("127.0.0.1:1", None, &cancel).await.unwrap();
    assert!(!joined);
}

#[tokio::test]
async fn exported_settings_drive_the_validation_round_count() {
    let mut settings = ServerSettings::default().without_encryption();
    settings.connection_test_tries = 7;

    let server = Server::bind("127.0.0.1:0", settings, ServerHooks::new())
        .await
        .unwrap();

    // A join with seven validation rounds still completes.
    let client = Client::new(ClientHooks::new());
    let cancel = CancellationToken::new();
    assert!(client
        .connect(server.local_addr(), None, &cancel)
        .await
        .unwrap());

    client.disconnect().await.unwrap();
    server.shutdown().await;
}
