//! Replication Engine (spec.md §4.3): the dispatcher that walks datasets
//! tagged `send-to`, and `send_dataset_snapshots`, which reconciles and
//! sends for one dataset under its exclusion lock.
//!
//! Grounded on `DanielArmengod-zfs-rs/src/replicate.rs`'s
//! `replicate_dataset` (full-send-then-incremental flow, `anyhow::Context`
//! error plumbing) for the overall shape, generalized to the
//! resume-first / reconcile / send-each-plan-item flow spec.md §4.3
//! specifies.

pub mod client;
pub mod reconcile;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::events::Event;
use crate::replication::client::{HttpPeerClient, TransferOutcome};
use crate::replication::reconcile::{reconcile, LocalSnap, PlanItem};
use crate::runner::{Runner, SendRecord};
use crate::transport::stream::Counting;
use crate::zfs::wrapper::SendOptions;
use crate::zfs::{PropertyName, ZfsWrapper};

/// Builds the `Event::SendFailed` record and emits it, returning `err`
/// unchanged so callers can `return Err(emit_send_failed(...))` inline
/// at the point a send attempt gives up, per spec.md §4.3.3's "any other
/// error" row of the Sender outcome table.
fn emit_send_failed<W: ZfsWrapper>(
    runner: &Runner<W>,
    dataset: &str,
    full_snap: &str,
    err: Error,
) -> Error {
    if let Ok(dataset) = crate::zfs::Dataset::new(dataset) {
        runner.emit(Event::SendFailed {
            dataset,
            snapshot: crate::zfs::Snapshot {
                name: full_snap.to_string(),
                guid: 0,
                created: Utc::now(),
                used_bytes: 0,
            },
            error: err.to_string(),
        });
    }
    err
}

/// Enumerates datasets with a locally-set `send-to`, per spec.md §4.3's
/// dispatcher. Returns dataset names for the send worker pool to consume;
/// does not itself hold any lock, since locking happens per-dataset inside
/// [`send_dataset_snapshots`].
pub async fn datasets_to_send<W: ZfsWrapper>(runner: &Runner<W>) -> Result<Vec<String>> {
    let send_to_prop = PropertyName::SendTo.qualified(&runner.config.property_namespace);
    let datasets = runner
        .zfs
        .list_with_property(&runner.config.parent_dataset, &send_to_prop)
        .await?;
    Ok(datasets.into_iter().map(|d| d.name().to_string()).collect())
}

/// `sendDatasetSnapshots(ds)` (spec.md §4.3): holds the per-dataset lock
/// for the full body. A lock collision is not an error -- the caller
/// (the send worker) simply returns without doing anything and the next
/// discovery tick re-enqueues the dataset.
pub async fn send_dataset_snapshots<W: ZfsWrapper>(runner: &Runner<W>, dataset: &str) -> Result<()> {
    let Some(_guard) = runner.try_lock_dataset(dataset) else {
        return Ok(());
    };

    let namespace = &runner.config.property_namespace;
    let send_to_prop = PropertyName::SendTo.qualified(namespace);
    let delete_at_prop = PropertyName::DeleteAt.qualified(namespace);
    let sending_prop = PropertyName::Sending.qualified(namespace);
    let sent_at_prop = PropertyName::SentAt.qualified(namespace);
    let created_at_prop = PropertyName::CreatedAt.qualified(namespace);

    // Guard: don't send data about to be destroyed (spec.md §4.3).
    if let Some(delete_at) = runner.zfs.get_property(dataset, &delete_at_prop).await? {
        if let Ok(at) = chrono::DateTime::parse_from_rfc3339(&delete_at) {
            let at = at.with_timezone(&Utc);
            if at - Utc::now() < runner.config.stop_sending_before_delete {
                return Ok(());
            }
        }
    }

    let server = match runner.zfs.get_property(dataset, &send_to_prop).await? {
        Some(server) => server,
        None => return Ok(()),
    };
    let client = HttpPeerClient::new(&server, runner.config.authentication_tokens.first().cloned());

    let local_snapshots = runner.zfs.list_snapshots(dataset).await?;
    if local_snapshots.is_empty() {
        return Err(Error::NoLocalSnapshots);
    }

    // Resume-first path (spec.md §4.3.1).
    if let Some(sending_snap) = runner.zfs.get_property(dataset, &sending_prop).await? {
        if resume_pending_send(runner, &client, dataset, &server, &sending_snap).await? {
            runner.invalidate_remote_cache(&server, dataset);
            return Ok(());
        }
    }

    let remote_snapshots = match runner.cached_remote_snapshots(&server, dataset) {
        Some(snaps) => snaps,
        None => {
            let fetched = client.list_remote_snapshots(dataset).await.unwrap_or_default();
            let as_snapshot = fetched
                .iter()
                .map(|r| crate::zfs::Snapshot {
                    name: format!("{dataset}@{}", r.snap_name),
                    guid: 0,
                    created: Utc::now(),
                    used_bytes: 0,
                })
                .collect();
            runner.cache_remote_snapshots(&server, dataset, as_snapshot);
            fetched
                .into_iter()
                .map(|r| crate::zfs::Snapshot {
                    name: format!("{dataset}@{}", r.snap_name),
                    guid: 0,
                    created: Utc::now(),
                    used_bytes: 0,
                })
                .collect()
        }
    };
    let remote_plan_input: Vec<reconcile::RemoteSnap> = remote_snapshots
        .iter()
        .map(|s| reconcile::RemoteSnap {
            snap_name: s.snap_name().to_string(),
        })
        .collect();

    let mut local_plan_input = Vec::with_capacity(local_snapshots.len());
    for snap in &local_snapshots {
        if runner.zfs.get_property(&snap.name, &created_at_prop).await?.is_none() {
            // ignore-send-equivalent: snapshots without created-at are dropped from the plan.
            continue;
        }
        let has_sent_at = runner.zfs.get_property(&snap.name, &sent_at_prop).await?.is_some();
        local_plan_input.push(LocalSnap {
            snap_name: snap.snap_name().to_string(),
            has_sent_at,
        });
    }

    let mut copy_props = std::collections::HashMap::new();
    for name in &runner.config.send_copy_properties {
        if let Some(value) = runner.zfs.get_property(dataset, name).await? {
            copy_props.insert(name.clone(), value);
        }
    }

    let plan = reconcile(
        &local_plan_input,
        &remote_plan_input,
        &copy_props,
        &runner.config.send_set_properties,
    )?;

    for item in plan {
        match item {
            PlanItem::BackfillSentAt { snap_name } => {
                let full = format!("{dataset}@{snap_name}");
                runner
                    .zfs
                    .set_property(&full, &sent_at_prop, &Utc::now().to_rfc3339())
                    .await?;
            }
            PlanItem::Send {
                snap_name,
                incremental_base,
                properties,
            } => {
                send_one(
                    runner,
                    &client,
                    dataset,
                    &server,
                    &snap_name,
                    incremental_base.as_deref(),
                    &properties,
                    &sending_prop,
                    &sent_at_prop,
                )
                .await?;
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn send_one<W: ZfsWrapper>(
    runner: &Runner<W>,
    client: &HttpPeerClient,
    dataset: &str,
    server: &str,
    snap_name: &str,
    incremental_base: Option<&str>,
    properties: &std::collections::HashMap<String, String>,
    sending_prop: &str,
    sent_at_prop: &str,
) -> Result<()> {
    let full_snap = format!("{dataset}@{snap_name}");
    runner
        .zfs
        .set_property(dataset, sending_prop, snap_name)
        .await?;
    runner.set_sending(SendRecord {
        dataset: dataset.to_string(),
        server: server.to_string(),
        bytes_sent: 0,
        started: Utc::now(),
        updated: Utc::now(),
    });
    runner.emit(Event::SendStarted {
        dataset: crate::zfs::Dataset::new(dataset)?,
        snapshot: crate::zfs::Snapshot {
            name: full_snap.clone(),
            guid: 0,
            created: Utc::now(),
            used_bytes: 0,
        },
        incremental_from: incremental_base.map(|base| crate::zfs::Snapshot {
            name: format!("{dataset}@{base}"),
            guid: 0,
            created: Utc::now(),
            used_bytes: 0,
        }),
    });

    let opts = SendOptions {
        raw: runner.config.send_raw,
        resumable: runner.config.send_resumable,
        include_properties: runner.config.send_include_properties.clone(),
        incremental_base: incremental_base.map(|b| format!("{dataset}@{b}")),
        compression_level: runner.config.send_compression_level.clone(),
    };

    let (writer, reader) = tokio::io::duplex(64 * 1024);
    let events = Arc::clone(&runner.events);
    let progress_interval = runner.config.send_progress_event_interval;
    let progress_dataset = dataset.to_string();
    let progress_snap = full_snap.clone();
    let mut writer = Counting::new(writer, progress_interval, move |bytes_sent| {
        if let Ok(dataset) = crate::zfs::Dataset::new(progress_dataset.clone()) {
            events.emit(Event::SendProgress {
                dataset,
                snapshot: crate::zfs::Snapshot {
                    name: progress_snap.clone(),
                    guid: 0,
                    created: Utc::now(),
                    used_bytes: 0,
                },
                bytes_sent,
            });
        }
    });
    let zfs = Arc::clone(&runner.zfs);
    let full_snap_for_send = full_snap.clone();
    let send_task = tokio::spawn(async move { zfs.send_snapshot(&full_snap_for_send, &opts, &mut writer).await });

    let timeout = runner.config.maximum_send_time;
    let outcome = match tokio::time::timeout(
        timeout,
        client.send_snapshot(dataset, snap_name, incremental_base, runner.config.send_resumable, reader),
    )
    .await
    {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => {
            runner.clear_sending(dataset, server);
            return Err(emit_send_failed(runner, dataset, &full_snap, err));
        }
        Err(_) => {
            runner.clear_sending(dataset, server);
            return Err(emit_send_failed(
                runner,
                dataset,
                &full_snap,
                Error::Other("send timed out".to_string()),
            ));
        }
    };

    let transfer = match send_task.await {
        Ok(Ok(transfer)) => transfer,
        Ok(Err(err)) => {
            runner.clear_sending(dataset, server);
            return Err(emit_send_failed(runner, dataset, &full_snap, err));
        }
        Err(_) => {
            runner.clear_sending(dataset, server);
            return Err(emit_send_failed(
                runner,
                dataset,
                &full_snap,
                Error::Other("zfs send task panicked".to_string()),
            ));
        }
    };

    runner.clear_sending(dataset, server);

    match outcome {
        TransferOutcome::Success { .. } => {
            runner.emit(Event::SendFinished {
                dataset: crate::zfs::Dataset::new(dataset)?,
                snapshot: crate::zfs::Snapshot {
                    name: full_snap,
                    guid: 0,
                    created: Utc::now(),
                    used_bytes: 0,
                },
                bytes_sent: transfer.bytes,
            });
            client
                .set_snapshot_properties(dataset, snap_name, properties)
                .await
                .ok();
            runner
                .zfs
                .set_property(&full_snap, sent_at_prop, &Utc::now().to_rfc3339())
                .await?;
            runner.zfs.inherit_property(dataset, sending_prop).await.ok();
            runner.invalidate_remote_cache(server, dataset);
        }
        TransferOutcome::DatasetExists => {
            runner.invalidate_remote_cache(server, dataset);
            runner.zfs.inherit_property(dataset, sending_prop).await.ok();
        }
        TransferOutcome::TooManyRequests => {
            info!(dataset, "peer too busy, backing off until next tick");
        }
    }

    Ok(())
}

/// Resumer (spec.md §4.3.1): asks the peer for a resume token; if present,
/// continues the send. Returns `Ok(true)` when progress was made (caller
/// must invalidate the remote cache and return, letting the next tick
/// continue), `Ok(false)` when there was nothing to resume.
async fn resume_pending_send<W: ZfsWrapper>(
    runner: &Runner<W>,
    client: &HttpPeerClient,
    dataset: &str,
    server: &str,
    sending_snap: &str,
) -> Result<bool> {
    let Some((token, bytes_already_received)) = client.resume_token(dataset).await? else {
        return Ok(false);
    };

    runner.set_sending(SendRecord {
        dataset: dataset.to_string(),
        server: server.to_string(),
        bytes_sent: bytes_already_received,
        started: Utc::now(),
        updated: Utc::now(),
    });
    runner.emit(Event::SendStarted {
        dataset: crate::zfs::Dataset::new(dataset)?,
        snapshot: crate::zfs::Snapshot {
            name: format!("{dataset}@{sending_snap}"),
            guid: 0,
            created: Utc::now(),
            used_bytes: 0,
        },
        incremental_from: None,
    });

    let opts = SendOptions {
        raw: runner.config.send_raw,
        resumable: true,
        ..Default::default()
    };
    let (mut writer, reader) = tokio::io::duplex(64 * 1024);
    let zfs = Arc::clone(&runner.zfs);
    let token_for_send = token.clone();
    let send_task = tokio::spawn(async move { zfs.resume_send(&token_for_send, &opts, &mut writer).await });

    let outcome = client.resume_send(dataset, &token, reader).await;
    let full_snap = format!("{dataset}@{sending_snap}");
    let transfer = match send_task.await {
        Ok(Ok(transfer)) => transfer,
        Ok(Err(err)) => {
            runner.clear_sending(dataset, server);
            return Err(emit_send_failed(runner, dataset, &full_snap, err));
        }
        Err(_) => {
            runner.clear_sending(dataset, server);
            return Err(emit_send_failed(
                runner,
                dataset,
                &full_snap,
                Error::Other("zfs resume send task panicked".to_string()),
            ));
        }
    };

    runner.clear_sending(dataset, server);

    match outcome {
        Ok(TransferOutcome::TooManyRequests) => Ok(true),
        Ok(TransferOutcome::Success { .. } | TransferOutcome::DatasetExists) => {
            let total = bytes_already_received + transfer.bytes;
            runner.emit(Event::SendFinished {
                dataset: crate::zfs::Dataset::new(dataset)?,
                snapshot: crate::zfs::Snapshot {
                    name: format!("{dataset}@{sending_snap}"),
                    guid: 0,
                    created: Utc::now(),
                    used_bytes: 0,
                },
                bytes_sent: total,
            });
            let sending_prop = PropertyName::Sending.qualified(&runner.config.property_namespace);
            runner.zfs.inherit_property(dataset, &sending_prop).await.ok();
            Ok(true)
        }
        Err(err) => {
            warn!(dataset, %err, "resume send failed");
            Err(emit_send_failed(runner, dataset, &full_snap, err))
        }
    }
}

/// Small helper the dispatcher job uses to avoid busy-looping when the
/// send queue briefly runs dry.
pub fn backoff_delay() -> Duration {
    Duration::from_secs(1)
}
