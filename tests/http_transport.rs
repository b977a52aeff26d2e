//! End-to-end coverage of the HTTP Snapshot Transport (spec.md §4.6, §8):
//! drives the real `axum::Router` over a real `TcpListener` with
//! `reqwest`, the same way `HttpPeerClient` talks to a peer in production,
//! backed by the in-memory `FakeZfsWrapper` instead of a real `zfs(8)`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use zrepd::config::Config;
use zrepd::events::TracingEventSink;
use zrepd::transport::{router, AppState};
use zrepd::zfs::fake::FakeZfsWrapper;

/// Spawns the router on an ephemeral localhost port and returns its base
/// URL plus a `CancellationToken` the caller drops/cancels to tear it down.
async fn spawn_server(config: Config, zfs: FakeZfsWrapper) -> (String, CancellationToken) {
    let state = AppState::new(config, Arc::new(zfs), Arc::new(TracingEventSink));
    let app = router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let server_cancel = cancel.clone();
    tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_cancel.cancelled().await })
            .await
            .unwrap();
    });
    (format!("http://{addr}"), cancel)
}

fn test_config() -> Config {
    Config {
        parent_dataset: "tank_test".to_string(),
        ..Config::default()
    }
}

#[tokio::test]
async fn full_snapshot_lifecycle_over_http() {
    let fake = FakeZfsWrapper::new().with_dataset("tank_test");
    let (base, _cancel) = spawn_server(test_config(), fake).await;
    let client = reqwest::Client::new();

    let created = client
        .post(format!("{base}/filesystems/tank_test/snapshots/backup1"))
        .send()
        .await
        .unwrap();
    assert_eq!(created.status(), reqwest::StatusCode::CREATED);

    let listed = client
        .get(format!("{base}/filesystems/tank_test/snapshots"))
        .send()
        .await
        .unwrap();
    assert_eq!(listed.status(), reqwest::StatusCode::OK);
    let body: serde_json::Value = listed.json().await.unwrap();
    assert_eq!(body[0]["name"], "backup1");

    let sent = client
        .get(format!("{base}/filesystems/tank_test/snapshots/backup1"))
        .send()
        .await
        .unwrap();
    assert_eq!(sent.status(), reqwest::StatusCode::OK);
    let payload = sent.bytes().await.unwrap();
    assert_eq!(payload.as_ref(), b"tank_test@backup1".as_slice());

    let patched = client
        .patch(format!("{base}/filesystems/tank_test/snapshots/backup1"))
        .json(&json!({"set": {"sent-at": "2024-01-01T00:00:00Z"}, "unset": []}))
        .send()
        .await
        .unwrap();
    assert_eq!(patched.status(), reqwest::StatusCode::OK);

    let deleted = client
        .delete(format!("{base}/filesystems/tank_test/snapshots/backup1"))
        .send()
        .await
        .unwrap();
    assert_eq!(deleted.status(), reqwest::StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn auth_rejects_missing_token() {
    let mut config = test_config();
    config.authentication_tokens = vec!["s3cret".to_string()];
    let fake = FakeZfsWrapper::new().with_dataset("tank_test");
    let (base, _cancel) = spawn_server(config, fake).await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/filesystems/tank_test/snapshots"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::UNAUTHORIZED);

    let resp = client
        .get(format!("{base}/filesystems/tank_test/snapshots"))
        .header("X-Authentication-Token", "s3cret")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn destroying_nonempty_filesystem_is_refused() {
    let fake = FakeZfsWrapper::new()
        .with_dataset("tank_test")
        .with_dataset("tank_test/child");
    let mut config = test_config();
    config.permissions.allow_destroy_filesystems = true;
    let (base, _cancel) = spawn_server(config, fake).await;
    let client = reqwest::Client::new();

    // Flat identifiers only (spec.md §4.6 path validation), so exercise
    // this against the top-level dataset via its children listing rather
    // than a nested path segment.
    let resp = client
        .delete(format!("{base}/filesystems/tank_test"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn receive_snapshot_round_trip() {
    let fake = FakeZfsWrapper::new().with_dataset("tank_test");
    let (base, _cancel) = spawn_server(test_config(), fake).await;
    let client = reqwest::Client::new();

    let resp = client
        .put(format!("{base}/filesystems/tank_test/snapshots/mirrored"))
        .body("a zfs send stream's worth of bytes")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
    assert!(resp.headers().contains_key("X-Bytes-Received"));

    let listed = client
        .get(format!("{base}/filesystems/tank_test/snapshots"))
        .send()
        .await
        .unwrap();
    let body: serde_json::Value = listed.json().await.unwrap();
    assert!(body
        .as_array()
        .unwrap()
        .iter()
        .any(|s| s["name"] == "mirrored"));
}

#[tokio::test]
async fn receive_props_round_trip_through_base64_json() {
    use base64::Engine;

    let fake = FakeZfsWrapper::new().with_dataset("tank_test");
    let (base, _cancel) = spawn_server(test_config(), fake).await;
    let client = reqwest::Client::new();

    let mut props = HashMap::new();
    props.insert("compression".to_string(), "lz4".to_string());
    let encoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .encode(serde_json::to_vec(&props).unwrap());

    let resp = client
        .put(format!(
            "{base}/filesystems/tank_test/snapshots/withprops?receiveProps={encoded}"
        ))
        .body("stream bytes")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::CREATED);
}
