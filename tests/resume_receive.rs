//! Covers the resumable-receive handshake (spec.md §4.6 "resumable
//! receive"): a first `PUT` that leaves partial state reports a resume
//! token, `GET .../resume-token` hands that same token back, and a
//! second `PUT` carrying it completes the transfer.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use zrepd::config::Config;
use zrepd::error::{Error, Result};
use zrepd::events::TracingEventSink;
use zrepd::transport::{router, AppState};
use zrepd::zfs::fake::FakeZfsWrapper;
use zrepd::zfs::wrapper::{ReceiveOptions, SendOptions, TransferResult, ZfsWrapper};
use zrepd::zfs::{Dataset, Snapshot};

/// Flunks the first `receive_snapshot` call with a resumable error, then
/// delegates to the wrapped fake on every call after -- a test stand-in
/// for a `zfs receive` that got interrupted partway through a real stream.
struct FlakyZfsWrapper {
    inner: FakeZfsWrapper,
    receive_attempts: AtomicUsize,
}

fn resume_token() -> String {
    "r".repeat(100)
}

impl FlakyZfsWrapper {
    fn new(inner: FakeZfsWrapper) -> Self {
        Self {
            inner,
            receive_attempts: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ZfsWrapper for FlakyZfsWrapper {
    async fn list_datasets(&self, parent: &str, kinds: &str) -> Result<Vec<Dataset>> {
        self.inner.list_datasets(parent, kinds).await
    }
    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<Snapshot>> {
        self.inner.list_snapshots(dataset).await
    }
    async fn list_with_property(&self, parent: &str, property: &str) -> Result<Vec<Dataset>> {
        self.inner.list_with_property(parent, property).await
    }
    async fn get_dataset(&self, name: &str) -> Result<Dataset> {
        self.inner.get_dataset(name).await
    }
    async fn create_filesystem(&self, name: &str) -> Result<()> {
        self.inner.create_filesystem(name).await
    }
    async fn create_volume(&self, name: &str, size_bytes: u64) -> Result<()> {
        self.inner.create_volume(name, size_bytes).await
    }
    async fn snapshot(&self, dataset: &str, snap_name: &str) -> Result<Snapshot> {
        self.inner.snapshot(dataset, snap_name).await
    }
    async fn clone_dataset(&self, snapshot: &str, target: &str) -> Result<()> {
        self.inner.clone_dataset(snapshot, target).await
    }
    async fn destroy(&self, name: &str) -> Result<()> {
        self.inner.destroy(name).await
    }
    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.inner.rename(from, to).await
    }
    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()> {
        self.inner.set_property(dataset, key, value).await
    }
    async fn get_property(&self, dataset: &str, key: &str) -> Result<Option<String>> {
        self.inner.get_property(dataset, key).await
    }
    async fn inherit_property(&self, dataset: &str, key: &str) -> Result<()> {
        self.inner.inherit_property(dataset, key).await
    }
    async fn send_snapshot(
        &self,
        snapshot: &str,
        opts: &SendOptions,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<TransferResult> {
        self.inner.send_snapshot(snapshot, opts, sink).await
    }
    async fn receive_snapshot(
        &self,
        target: &str,
        opts: &ReceiveOptions,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<TransferResult> {
        if self.receive_attempts.fetch_add(1, Ordering::SeqCst) == 0 {
            return Err(Error::ResumableStream {
                token: resume_token(),
            });
        }
        self.inner.receive_snapshot(target, opts, source).await
    }
    async fn resume_send(
        &self,
        token: &str,
        opts: &SendOptions,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<TransferResult> {
        self.inner.resume_send(token, opts, sink).await
    }
    async fn rollback(&self, snapshot: &str) -> Result<()> {
        self.inner.rollback(snapshot).await
    }
    async fn mount(&self, dataset: &str) -> Result<()> {
        self.inner.mount(dataset).await
    }
    async fn unmount(&self, dataset: &str) -> Result<()> {
        self.inner.unmount(dataset).await
    }
    async fn load_key(&self, dataset: &str) -> Result<()> {
        self.inner.load_key(dataset).await
    }
    async fn unload_key(&self, dataset: &str) -> Result<()> {
        self.inner.unload_key(dataset).await
    }
    async fn children(&self, dataset: &str) -> Result<Vec<String>> {
        self.inner.children(dataset).await
    }
}

async fn spawn_server(config: Config, zfs: FlakyZfsWrapper) -> String {
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
    std::mem::forget(cancel);
    format!("http://{addr}")
}

#[tokio::test]
async fn interrupted_receive_resumes_with_matching_token() {
    let fake = FakeZfsWrapper::new().with_dataset("tank_test");
    let base = spawn_server(
        Config {
            parent_dataset: "tank_test".to_string(),
            ..Config::default()
        },
        FlakyZfsWrapper::new(fake),
    )
    .await;
    let client = reqwest::Client::new();

    let first = client
        .put(format!("{base}/filesystems/tank_test/snapshots/mirrored"))
        .body("first, interrupted, attempt")
        .send()
        .await
        .unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::PRECONDITION_FAILED);
    let token = first
        .headers()
        .get("X-Receive-Resume-Token")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_eq!(token, resume_token());

    let polled = client
        .get(format!("{base}/filesystems/tank_test/resume-token"))
        .send()
        .await
        .unwrap();
    assert_eq!(polled.status(), reqwest::StatusCode::NO_CONTENT);
    assert_eq!(
        polled
            .headers()
            .get("X-Receive-Resume-Token")
            .unwrap()
            .to_str()
            .unwrap(),
        resume_token()
    );
    assert!(polled.headers().contains_key("X-Received-Bytes"));

    let retried = client
        .put(format!("{base}/filesystems/tank_test/snapshots/mirrored"))
        .header("X-Receive-Resume-Token", token)
        .body("rest of the stream")
        .send()
        .await
        .unwrap();
    assert_eq!(retried.status(), reqwest::StatusCode::CREATED);
    assert!(retried.headers().contains_key("X-Bytes-Received"));
}

#[tokio::test]
async fn resume_token_without_prior_failure_is_rejected() {
    let fake = FakeZfsWrapper::new().with_dataset("tank_test");
    let base = spawn_server(
        Config {
            parent_dataset: "tank_test".to_string(),
            ..Config::default()
        },
        FlakyZfsWrapper::new(fake),
    )
    .await;
    let client = reqwest::Client::new();

    let resp = client
        .get(format!("{base}/filesystems/tank_test/resume-token"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::PRECONDITION_FAILED);
}
