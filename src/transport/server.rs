//! axum `Router` for the HTTP Snapshot Transport (spec.md §4.6).
//!
//! Handler shape -- typed extractors, `impl IntoResponse` error returns,
//! streaming response bodies via `axum::body::Body::from_stream` -- is
//! grounded on `clockworklabs-SpacetimeDB/crates/client-api/src/routes/
//! database.rs`'s log-tailing handler, which streams a growing byte
//! source the same way a `zfs send` stream is streamed here.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch};
use axum::Router;
use axum_extra::TypedHeader;
use futures::StreamExt;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::io::StreamReader;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{Event, EventSink};
use crate::transport::auth::require_token;
use crate::transport::stream::{
    limiter, parse_compression_level, zstd_decoder, zstd_encoder, Counting, RateLimited,
};
use crate::transport::typed_header::ReceiveResumeToken;
use crate::transport::validate::{validate_identifier, validate_resume_token};
use crate::zfs::wrapper::{ReceiveOptions, SendOptions};
use crate::zfs::ZfsWrapper;

pub struct AppState<W> {
    pub config: Config,
    pub zfs: Arc<W>,
    pub events: Arc<dyn EventSink>,
    /// Per-dataset resume token left by a previously interrupted
    /// receive, keyed by target dataset name.
    pub pending_resume: Mutex<HashMap<String, String>>,
    pub receive_admission: Arc<Semaphore>,
}

impl<W> AppState<W> {
    pub fn new(config: Config, zfs: Arc<W>, events: Arc<dyn EventSink>) -> Arc<Self> {
        let permits = config.maximum_concurrent_receives;
        Arc::new(Self {
            config,
            zfs,
            events,
            pending_resume: Mutex::new(HashMap::new()),
            receive_admission: Arc::new(Semaphore::new(permits)),
        })
    }
}

pub fn router<W: ZfsWrapper + 'static>(state: Arc<AppState<W>>) -> Router {
    let routes = Router::new()
        .route("/filesystems", get(list_filesystems::<W>))
        .route(
            "/filesystems/:fs",
            patch(patch_filesystem::<W>).delete(delete_filesystem::<W>),
        )
        .route("/filesystems/:fs/snapshots", get(list_snapshots::<W>))
        .route("/filesystems/:fs/resume-token", get(resume_token::<W>))
        .route(
            "/filesystems/:fs/snapshots/:snap",
            get(stream_full_send::<W>)
                .post(create_snapshot::<W>)
                .put(receive_snapshot::<W>)
                .patch(patch_snapshot::<W>)
                .delete(delete_snapshot::<W>),
        )
        .route(
            "/filesystems/:fs/snapshots/:snap/incremental/:base",
            get(stream_incremental_send::<W>),
        )
        .route("/snapshot/resume/:token", get(stream_resumed_send::<W>));

    let routes = if let Some(prefix) = state.config.path_prefix.clone() {
        Router::new().nest(&prefix, routes)
    } else {
        routes
    };

    routes
        .route_layer(axum::middleware::from_fn_with_state(
            Arc::clone(&state),
            require_token::<W>,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct DatasetJson {
    name: String,
    kind: &'static str,
}

async fn list_filesystems<W: ZfsWrapper>(State(state): State<Arc<AppState<W>>>) -> Result<Response> {
    let datasets = state
        .zfs
        .list_datasets(&state.config.parent_dataset, "filesystem,volume")
        .await?;
    let json: Vec<DatasetJson> = datasets
        .into_iter()
        .map(|d| DatasetJson {
            name: d.name().to_string(),
            kind: match d.kind {
                crate::zfs::DatasetKind::Filesystem => "filesystem",
                crate::zfs::DatasetKind::Volume => "volume",
                crate::zfs::DatasetKind::Snapshot => "snapshot",
            },
        })
        // Deterministic ordering for API consumers, not guaranteed by the
        // underlying `zfs list -r` call alone once extra properties vary.
        .sorted_by(|a, b| a.name.cmp(&b.name))
        .collect();
    Ok((StatusCode::OK, axum::Json(json)).into_response())
}

#[derive(Deserialize)]
struct PatchBody {
    #[serde(default)]
    set: HashMap<String, String>,
    #[serde(default)]
    unset: Vec<String>,
}

async fn patch_filesystem<W: ZfsWrapper>(
    State(state): State<Arc<AppState<W>>>,
    Path(fs): Path<String>,
    axum::Json(body): axum::Json<PatchBody>,
) -> Result<Response> {
    validate_identifier(&fs)?;
    apply_patch(&*state.zfs, &fs, &body).await?;
    Ok(StatusCode::OK.into_response())
}

async fn apply_patch<W: ZfsWrapper>(zfs: &W, entity: &str, body: &PatchBody) -> Result<()> {
    for (key, value) in &body.set {
        zfs.set_property(entity, key, value).await?;
    }
    for key in &body.unset {
        zfs.inherit_property(entity, key).await?;
    }
    Ok(())
}

async fn delete_filesystem<W: ZfsWrapper>(
    State(state): State<Arc<AppState<W>>>,
    Path(fs): Path<String>,
) -> Result<Response> {
    validate_identifier(&fs)?;
    if !state.config.permissions.allow_destroy_filesystems {
        return Err(Error::DestroyForbidden);
    }
    if !state.zfs.children(&fs).await?.is_empty() {
        return Err(Error::DestroyForbidden);
    }
    state.zfs.destroy(&fs).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

async fn list_snapshots<W: ZfsWrapper>(
    State(state): State<Arc<AppState<W>>>,
    Path(fs): Path<String>,
) -> Result<Response> {
    validate_identifier(&fs)?;
    let snaps = state.zfs.list_snapshots(&fs).await?;
    #[derive(Serialize)]
    struct SnapJson {
        name: String,
    }
    let json: Vec<SnapJson> = snaps
        .into_iter()
        .map(|s| SnapJson {
            name: s.snap_name().to_string(),
        })
        .collect();
    Ok((StatusCode::OK, axum::Json(json)).into_response())
}

async fn resume_token<W: ZfsWrapper>(
    State(state): State<Arc<AppState<W>>>,
    Path(fs): Path<String>,
) -> Result<Response> {
    validate_identifier(&fs)?;
    let tokens = state.pending_resume.lock().await;
    match tokens.get(&fs) {
        Some(token) => {
            let mut response = (
                StatusCode::NO_CONTENT,
                TypedHeader(ReceiveResumeToken(token.clone())),
            )
                .into_response();
            response
                .headers_mut()
                .insert("X-Received-Bytes", "0".parse().unwrap());
            Ok(response)
        }
        None => Err(Error::ResumeStateAbsent),
    }
}

#[derive(Deserialize)]
struct SendQuery {
    #[serde(rename = "includeProps")]
    include_props: Option<String>,
    raw: Option<bool>,
    #[serde(rename = "bytesPerSecond")]
    bytes_per_second: Option<u64>,
    #[serde(rename = "compressionLevel")]
    compression_level: Option<String>,
}

async fn stream_full_send<W: ZfsWrapper + 'static>(
    State(state): State<Arc<AppState<W>>>,
    Path((fs, snap)): Path<(String, String)>,
    Query(query): Query<SendQuery>,
) -> Result<Response> {
    stream_send(state, fs, snap, None, query).await
}

async fn stream_incremental_send<W: ZfsWrapper + 'static>(
    State(state): State<Arc<AppState<W>>>,
    Path((fs, snap, base)): Path<(String, String, String)>,
    Query(query): Query<SendQuery>,
) -> Result<Response> {
    stream_send(state, fs, snap, Some(base), query).await
}

async fn stream_resumed_send<W: ZfsWrapper + 'static>(
    State(state): State<Arc<AppState<W>>>,
    Path(token): Path<String>,
) -> Result<Response> {
    validate_resume_token(&token)?;
    let (body, mut writer) = piped_body();
    let zfs = Arc::clone(&state.zfs);
    tokio::spawn(async move {
        let opts = SendOptions::default();
        let _ = zfs.resume_send(&token, &opts, &mut writer).await;
    });
    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(body)
        .expect("static response parts"))
}

async fn stream_send<W: ZfsWrapper + 'static>(
    state: Arc<AppState<W>>,
    fs: String,
    snap: String,
    base: Option<String>,
    query: SendQuery,
) -> Result<Response> {
    validate_identifier(&fs)?;
    validate_identifier(&snap)?;

    let bytes_per_second = if state.config.permissions.allow_speed_override {
        query.bytes_per_second.or(state.config.send_speed_bytes_per_second)
    } else {
        state.config.send_speed_bytes_per_second
    };
    let raw = if state.config.permissions.allow_non_raw {
        query.raw.unwrap_or(state.config.send_raw)
    } else {
        true
    };
    let include_properties = if state.config.permissions.allow_include_properties {
        query
            .include_props
            .map(|s| s.split(',').map(String::from).collect())
            .unwrap_or_default()
    } else {
        Vec::new()
    };

    let compression_level = query.compression_level.clone();
    let opts = SendOptions {
        raw,
        resumable: false,
        include_properties,
        incremental_base: base.map(|b| format!("{fs}@{b}")),
        compression_level: query.compression_level,
    };

    let (body, writer) = piped_body();
    let zfs = Arc::clone(&state.zfs);
    let full_snap = format!("{fs}@{snap}");
    let progress_interval = state.config.send_progress_event_interval;
    let events = Arc::clone(&state.events);
    let progress_dataset = crate::zfs::Dataset::new(fs.clone()).ok();
    let progress_snap = full_snap.clone();
    tokio::spawn(async move {
        let writer = Counting::new(writer, progress_interval, move |bytes_sent| {
            if let Some(dataset) = &progress_dataset {
                events.emit(Event::SendProgress {
                    dataset: dataset.clone(),
                    snapshot: crate::zfs::Snapshot {
                        name: progress_snap.clone(),
                        guid: 0,
                        created: chrono::Utc::now(),
                        used_bytes: 0,
                    },
                    bytes_sent,
                });
            }
        });
        let writer: Box<dyn tokio::io::AsyncWrite + Unpin + Send> =
            match bytes_per_second.filter(|b| *b > 0) {
                Some(rate) => Box::new(RateLimited::new(writer, limiter(rate))),
                None => Box::new(writer),
            };
        // zfs send writes into the zstd encoder first (when requested), which
        // in turn feeds the rate limiter -> counter -> HTTP body chain above.
        let mut writer: Box<dyn tokio::io::AsyncWrite + Unpin + Send> = match compression_level {
            Some(level) => Box::new(zstd_encoder(writer, parse_compression_level(&level))),
            None => writer,
        };
        let _ = zfs.send_snapshot(&full_snap, &opts, writer.as_mut()).await;
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(body)
        .expect("static response parts"))
}

#[derive(Serialize)]
struct CreatedSnapshotJson {
    name: String,
}

async fn create_snapshot<W: ZfsWrapper>(
    State(state): State<Arc<AppState<W>>>,
    Path((fs, snap)): Path<(String, String)>,
) -> Result<Response> {
    validate_identifier(&fs)?;
    validate_identifier(&snap)?;
    let created = state.zfs.snapshot(&fs, &snap).await?;
    Ok((
        StatusCode::CREATED,
        axum::Json(CreatedSnapshotJson {
            name: created.snap_name().to_string(),
        }),
    )
        .into_response())
}

#[derive(Deserialize)]
struct ReceiveQuery {
    resumable: Option<bool>,
    #[serde(rename = "receiveProps")]
    receive_props: Option<String>,
    #[serde(rename = "enableDecompression")]
    enable_decompression: Option<bool>,
    #[serde(rename = "compressionLevel")]
    compression_level: Option<String>,
    #[serde(rename = "bytesPerSecond")]
    bytes_per_second: Option<u64>,
}

async fn receive_snapshot<W: ZfsWrapper>(
    State(state): State<Arc<AppState<W>>>,
    Path((fs, snap)): Path<(String, String)>,
    Query(query): Query<ReceiveQuery>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    validate_identifier(&fs)?;
    validate_identifier(&snap)?;

    let _permit = state
        .receive_admission
        .try_acquire()
        .map_err(|_| Error::TooManyRequests)?;

    let target = format!("{fs}@{snap}");

    if let Some(token) = headers.get("X-Receive-Resume-Token") {
        let provided = token.to_str().map_err(|_| Error::InvalidIdentifier("token".into()))?;
        validate_resume_token(provided)?;
        let mut pending = state.pending_resume.lock().await;
        match pending.get(&target) {
            Some(expected) if expected == provided => {}
            Some(_) => return Err(Error::ResumeTokenMismatch),
            None => return Err(Error::ResumeStateAbsent),
        }
        pending.remove(&target);
    } else if query.resumable == Some(true) && state.pending_resume.lock().await.contains_key(&target) {
        return Err(Error::ResumeTokenMismatch);
    }

    let properties = query
        .receive_props
        .as_deref()
        .map(decode_receive_props)
        .transpose()?
        .unwrap_or_default();

    let stream = body.into_data_stream().map(|r| r.map_err(std::io::Error::other));
    let reader = StreamReader::new(stream);

    let bytes_per_second = if state.config.permissions.allow_speed_override {
        query.bytes_per_second.or(state.config.send_speed_bytes_per_second)
    } else {
        state.config.send_speed_bytes_per_second
    };
    let reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> =
        match bytes_per_second.filter(|b| *b > 0) {
            Some(rate) => Box::new(RateLimited::new(reader, limiter(rate))),
            None => Box::new(reader),
        };
    // The inbound stream is decompressed before it reaches `zfs receive`,
    // the mirror of the zstd encode stage on the send side. Compression
    // level only matters to the encoder; the decoder reads the zstd frame
    // header and needs no level hint.
    let mut reader: Box<dyn tokio::io::AsyncRead + Unpin + Send> =
        if query.enable_decompression.unwrap_or(false) {
            Box::new(zstd_decoder(BufReader::new(reader)))
        } else {
            reader
        };

    let opts = ReceiveOptions {
        resumable: query.resumable.unwrap_or(false),
        properties,
    };

    match state.zfs.receive_snapshot(&target, &opts, &mut reader).await {
        Ok(result) => {
            let mut response = (
                StatusCode::CREATED,
                axum::Json(CreatedSnapshotJson { name: snap }),
            )
                .into_response();
            response.headers_mut().insert(
                "X-Bytes-Received",
                result.bytes.to_string().parse().unwrap(),
            );
            Ok(response)
        }
        Err(Error::ResumableStream { token }) => {
            state
                .pending_resume
                .lock()
                .await
                .insert(target, token.clone());
            let mut response = StatusCode::PRECONDITION_FAILED.into_response();
            response
                .headers_mut()
                .insert("X-Receive-Resume-Token", token.parse().unwrap());
            Ok(response)
        }
        Err(err) => Err(err),
    }
}

fn decode_receive_props(encoded: &str) -> Result<HashMap<String, String>> {
    use base64::Engine;
    let decoded = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|_| Error::InvalidIdentifier("receiveProps".to_string()))?;
    serde_json::from_slice(&decoded).map_err(|_| Error::InvalidIdentifier("receiveProps".to_string()))
}

async fn patch_snapshot<W: ZfsWrapper>(
    State(state): State<Arc<AppState<W>>>,
    Path((fs, snap)): Path<(String, String)>,
    axum::Json(body): axum::Json<PatchBody>,
) -> Result<Response> {
    validate_identifier(&fs)?;
    validate_identifier(&snap)?;
    let full = format!("{fs}@{snap}");
    apply_patch(&*state.zfs, &full, &body).await?;
    Ok(StatusCode::OK.into_response())
}

async fn delete_snapshot<W: ZfsWrapper>(
    State(state): State<Arc<AppState<W>>>,
    Path((fs, snap)): Path<(String, String)>,
) -> Result<Response> {
    validate_identifier(&fs)?;
    validate_identifier(&snap)?;
    if !state.config.permissions.allow_destroy_snapshots {
        return Err(Error::DestroyForbidden);
    }
    state.zfs.destroy(&format!("{fs}@{snap}")).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Pairs a streaming `axum::body::Body` with the `AsyncWrite` half that
/// feeds it, via a `tokio::io::duplex` pipe -- the same primitive
/// `replication/mod.rs` uses to hand a send stream from the `ZfsWrapper`
/// task to the HTTP client task, generalized here to the server's own
/// send handlers. A duplex pipe backpressures correctly under a pending
/// write the way a hand-rolled `poll_write` over a channel future cannot:
/// there's no boxed future to drop and lose a wakeup on.
fn piped_body() -> (Body, tokio::io::DuplexStream) {
    let (reader, writer) = tokio::io::duplex(64 * 1024);
    let stream = tokio_util::io::ReaderStream::new(reader);
    (Body::from_stream(stream), writer)
}
