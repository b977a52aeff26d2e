//! `HttpPeerClient`: the client half of the HTTP Snapshot Transport
//! (spec.md §4.3.1/§4.3.3/§4.6), realizing the Resumer and Sender against
//! a remote peer's axum router (`transport::server`).
//!
//! Grounded on `clockworklabs-SpacetimeDB`'s streaming-body idioms
//! (`routes/database.rs`), mirrored client-side with `reqwest`: uploads
//! stream from a `tokio_util::io::ReaderStream`, downloads are read back
//! as an `AsyncRead` via `tokio_util::io::StreamReader`, so neither side
//! ever buffers a whole snapshot in memory.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::io::{ReaderStream, StreamReader};

use crate::error::{Error, Result};
use crate::replication::reconcile::RemoteSnap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSnapshotInfo {
    pub name: String,
}

/// Outcome of a send/receive attempt, mirroring spec.md §4.3.3's outcome
/// table so the dispatcher can match on it directly instead of inspecting
/// status codes again.
#[derive(Debug)]
pub enum TransferOutcome {
    Success { bytes_sent: u64 },
    DatasetExists,
    TooManyRequests,
}

pub struct HttpPeerClient {
    base_url: String,
    http: Client,
    auth_token: Option<String>,
}

impl HttpPeerClient {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            http: Client::new(),
            auth_token,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        // Correlates this request with the peer's `TraceLayer` span in its
        // own logs, independent of whatever reverse proxy sits in between.
        let builder = builder.header("X-Request-Id", uuid::Uuid::new_v4().to_string());
        match &self.auth_token {
            Some(token) => builder.header("X-Authentication-Token", token),
            None => builder,
        }
    }

    /// `GET /filesystems/:fs/snapshots`, spec.md §4.6.
    pub async fn list_remote_snapshots(&self, dataset: &str) -> Result<Vec<RemoteSnap>> {
        let resp = self
            .authed(self.http.get(self.url(&format!("/filesystems/{dataset}/snapshots"))))
            .send()
            .await?;
        match resp.status() {
            StatusCode::NOT_FOUND => Ok(Vec::new()),
            status if status.is_success() => {
                let snaps: Vec<RemoteSnapshotInfo> = resp.json().await?;
                Ok(snaps
                    .into_iter()
                    .map(|s| RemoteSnap { snap_name: s.name })
                    .collect())
            }
            status => Err(Error::Other(format!("list snapshots failed: {status}"))),
        }
    }

    /// `GET /filesystems/:fs/resume-token`, spec.md §4.6: 204 with
    /// `X-Receive-Resume-Token` header (and an `X-Received-Bytes` header
    /// this crate adds so the Resumer can report progress without a
    /// second round trip), or 412 if there is no resumable state.
    pub async fn resume_token(&self, dataset: &str) -> Result<Option<(String, u64)>> {
        let resp = self
            .authed(self.http.get(self.url(&format!("/filesystems/{dataset}/resume-token"))))
            .send()
            .await?;
        match resp.status() {
            StatusCode::PRECONDITION_FAILED => Ok(None),
            StatusCode::NO_CONTENT => {
                let token = resp
                    .headers()
                    .get("X-Receive-Resume-Token")
                    .and_then(|v| v.to_str().ok())
                    .ok_or(Error::ResumeStateAbsent)?
                    .to_string();
                let bytes_received = resp
                    .headers()
                    .get("X-Received-Bytes")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                Ok(Some((token, bytes_received)))
            }
            status => Err(Error::Other(format!("resume-token query failed: {status}"))),
        }
    }

    /// `PUT /filesystems/:fs/snapshots[/:snap]` with a resume token
    /// header, continuing a partial receive (spec.md §4.3.1).
    pub async fn resume_send<R>(
        &self,
        dataset: &str,
        token: &str,
        source: R,
    ) -> Result<TransferOutcome>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let body = reqwest::Body::wrap_stream(ReaderStream::new(source));
        let resp = self
            .authed(
                self.http
                    .put(self.url(&format!("/filesystems/{dataset}/snapshots?resumable=true")))
                    .header("X-Receive-Resume-Token", token)
                    .body(body),
            )
            .send()
            .await?;
        Self::interpret_put(resp).await
    }

    /// `PUT /filesystems/:fs/snapshots/:snap`, the full or incremental
    /// send path (spec.md §4.3.3). Whether the stream is full or
    /// incremental is implicit in the `zfs send` payload itself -- the
    /// receive side doesn't need `incremental_base` on the wire, only the
    /// local sender did, to pick which stream to produce.
    pub async fn send_snapshot<R>(
        &self,
        dataset: &str,
        snap: &str,
        incremental_base: Option<&str>,
        resumable: bool,
        source: R,
    ) -> Result<TransferOutcome>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let _ = incremental_base;
        let mut path = format!("/filesystems/{dataset}/snapshots/{snap}");
        if resumable {
            path.push_str("?resumable=true");
        }

        let body = reqwest::Body::wrap_stream(ReaderStream::new(source));
        let resp = self
            .authed(self.http.put(self.url(&path)).body(body))
            .send()
            .await?;
        Self::interpret_put(resp).await
    }

    async fn interpret_put(resp: reqwest::Response) -> Result<TransferOutcome> {
        match resp.status() {
            StatusCode::CREATED | StatusCode::OK => {
                let bytes_sent = resp
                    .headers()
                    .get("X-Bytes-Received")
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0);
                Ok(TransferOutcome::Success { bytes_sent })
            }
            StatusCode::CONFLICT => Ok(TransferOutcome::DatasetExists),
            StatusCode::TOO_MANY_REQUESTS => Ok(TransferOutcome::TooManyRequests),
            status => Err(Error::Other(format!("receive failed: {status}"))),
        }
    }

    /// Streams a `GET` snapshot/incremental response into `sink`, used by
    /// a receive-only peer pulling rather than being pushed to. Not on
    /// the primary send path (spec.md's Sender always `PUT`s) but
    /// required to implement the full client surface of spec.md §4.6.
    pub async fn fetch_snapshot(
        &self,
        dataset: &str,
        snap: &str,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let resp = self
            .authed(
                self.http
                    .get(self.url(&format!("/filesystems/{dataset}/snapshots/{snap}"))),
            )
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Error::Other(format!("fetch snapshot failed: {}", resp.status())));
        }
        let stream = resp
            .bytes_stream()
            .map(|r| r.map_err(std::io::Error::other));
        let mut reader = StreamReader::new(stream);
        Ok(tokio::io::copy(&mut reader, sink).await?)
    }

    /// `PATCH /filesystems/:fs/snapshots/:snap`, applying the configured
    /// copy/set properties after a successful send (spec.md §4.3 step 7).
    pub async fn set_snapshot_properties(
        &self,
        dataset: &str,
        snap: &str,
        properties: &HashMap<String, String>,
    ) -> Result<()> {
        #[derive(Serialize)]
        struct PatchBody<'a> {
            set: &'a HashMap<String, String>,
            unset: Vec<String>,
        }
        let resp = self
            .authed(
                self.http
                    .patch(self.url(&format!("/filesystems/{dataset}/snapshots/{snap}")))
                    .json(&PatchBody {
                        set: properties,
                        unset: Vec::new(),
                    }),
            )
            .send()
            .await?;
        if resp.status().is_success() {
            Ok(())
        } else {
            Err(Error::Other(format!(
                "set properties failed: {}",
                resp.status()
            )))
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(12 * 60 * 60)
    }
}

use futures::StreamExt;
