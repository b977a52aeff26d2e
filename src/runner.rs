//! The Runner (spec.md §4.1): owns lifecycle, schedules the periodic jobs,
//! and hosts the shared state every job reads -- the per-dataset lock
//! table, in-flight send registry, and remote-snapshot cache.
//!
//! Grounded on `zfs2s3`'s `main.rs` (other_examples): one `tokio::spawn`
//! per job, a shared `tokio_util::sync::CancellationToken`, and
//! `JoinHandle`s collected and awaited at the end. That source spawns a
//! fixed set of named jobs and waits for all of them on shutdown; this
//! generalizes it to the five jobs spec.md §4.1 names plus a send worker
//! pool.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Config;
use crate::events::{Event, EventSink};
use crate::zfs::{Snapshot, ZfsWrapper};

/// RAII guard returned by [`Runner::try_lock_dataset`]. Drop releases the
/// lock; there is no blocking acquire, per spec.md §9's "try next tick"
/// design -- a collision means the caller skips this dataset this tick,
/// it never waits.
pub struct DatasetGuard {
    name: String,
    locks: Arc<Mutex<HashSet<String>>>,
}

impl Drop for DatasetGuard {
    fn drop(&mut self) {
        self.locks.lock().expect("lock table poisoned").remove(&self.name);
    }
}

#[derive(Debug, Clone)]
pub struct SendRecord {
    pub dataset: String,
    pub server: String,
    pub bytes_sent: u64,
    pub started: chrono::DateTime<chrono::Utc>,
    pub updated: chrono::DateTime<chrono::Utc>,
}

struct CachedSnapshots {
    cached_at: std::time::Instant,
    snapshots: Vec<Snapshot>,
}

/// Shared runner state: lock table, in-flight registry, remote cache. A
/// fresh `Arc<Runner>` is cloned into every spawned job task, matching the
/// `Arc::clone(&config)` / `Arc::clone(&op_lock)` pattern `zfs2s3::main`
/// uses to hand each job its own handle to shared state.
pub struct Runner<W: ZfsWrapper> {
    pub config: Config,
    pub zfs: Arc<W>,
    pub events: Arc<dyn EventSink>,
    locks: Arc<Mutex<HashSet<String>>>,
    sends: RwLock<Vec<SendRecord>>,
    remote_cache: RwLock<HashMap<String, HashMap<String, CachedSnapshots>>>,
}

impl<W: ZfsWrapper + 'static> Runner<W> {
    pub fn new(config: Config, zfs: Arc<W>, events: Arc<dyn EventSink>) -> Arc<Self> {
        Arc::new(Self {
            config,
            zfs,
            events,
            locks: Arc::new(Mutex::new(HashSet::new())),
            sends: RwLock::new(Vec::new()),
            remote_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Non-blocking try-lock: `Some(guard)` on success, `None` on
    /// collision. Callers must skip the dataset this tick rather than
    /// wait, per spec.md §4.1.
    pub fn try_lock_dataset(&self, name: &str) -> Option<DatasetGuard> {
        let mut locks = self.locks.lock().expect("lock table poisoned");
        if locks.insert(name.to_string()) {
            Some(DatasetGuard {
                name: name.to_string(),
                locks: Arc::clone(&self.locks),
            })
        } else {
            None
        }
    }

    pub fn set_sending(&self, record: SendRecord) {
        self.sends.write().expect("send registry poisoned").push(record);
    }

    pub fn clear_sending(&self, dataset: &str, server: &str) {
        self.sends
            .write()
            .expect("send registry poisoned")
            .retain(|r| !(r.dataset == dataset && r.server == server));
    }

    /// Defensive copy, per spec.md §4.1's `ListCurrentSends` contract.
    pub fn list_current_sends(&self) -> Vec<SendRecord> {
        self.sends.read().expect("send registry poisoned").clone()
    }

    pub fn emit(&self, event: Event) {
        self.events.emit(event);
    }

    /// Returns a cached remote snapshot list if it's younger than
    /// `MaximumRemoteSnapshotCacheAgeSeconds`, else `None` so the caller
    /// fetches and calls [`Runner::cache_remote_snapshots`].
    pub fn cached_remote_snapshots(&self, server: &str, dataset: &str) -> Option<Vec<Snapshot>> {
        let cache = self.remote_cache.read().expect("remote cache poisoned");
        let entry = cache.get(server)?.get(dataset)?;
        if entry.cached_at.elapsed() < self.config.maximum_remote_snapshot_cache_age {
            Some(entry.snapshots.clone())
        } else {
            None
        }
    }

    pub fn cache_remote_snapshots(&self, server: &str, dataset: &str, snapshots: Vec<Snapshot>) {
        self.remote_cache
            .write()
            .expect("remote cache poisoned")
            .entry(server.to_string())
            .or_default()
            .insert(
                dataset.to_string(),
                CachedSnapshots {
                    cached_at: std::time::Instant::now(),
                    snapshots,
                },
            );
    }

    /// Invalidates a single (server, dataset) entry. Called after any
    /// successful send or receive, per spec.md §4.1/§9.
    pub fn invalidate_remote_cache(&self, server: &str, dataset: &str) {
        if let Some(per_server) = self
            .remote_cache
            .write()
            .expect("remote cache poisoned")
            .get_mut(server)
        {
            per_server.remove(dataset);
        }
    }

    /// Sweeps every entry older than the configured TTL. Run on the same
    /// cadence family as the other periodic jobs.
    pub fn prune_remote_cache(&self) {
        let ttl = self.config.maximum_remote_snapshot_cache_age;
        let mut cache = self.remote_cache.write().expect("remote cache poisoned");
        for per_server in cache.values_mut() {
            per_server.retain(|_, entry| entry.cached_at.elapsed() < ttl);
        }
        cache.retain(|_, per_server| !per_server.is_empty());
    }
}

/// Jitters a cadence by up to ±10%, per spec.md §4.1 ("all randomized
/// ±10% to avoid thundering herds"). Mirrors the teacher's use of `rand`
/// for scheduling jitter.
fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}

/// Runs `tick` on `interval` (jittered each time) until `cancel` fires.
async fn run_periodic<F, Fut>(name: &'static str, interval: Duration, cancel: CancellationToken, mut tick: F)
where
    F: FnMut() -> Fut + Send,
    Fut: std::future::Future<Output = ()> + Send,
{
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                info!(job = name, "job stopped on cancellation");
                return;
            }
            _ = tokio::time::sleep(jittered(interval)) => {
                tick().await;
            }
        }
    }
}

/// Spawns the five periodic jobs plus `SendRoutines` send workers, and
/// returns their `JoinHandle`s. The caller (typically `main.rs`) awaits
/// every handle after cancelling, matching `zfs2s3::main`'s
/// `handles: Vec<JoinHandle<...>>` collection pattern.
pub fn spawn_jobs<W: ZfsWrapper + 'static>(
    runner: Arc<Runner<W>>,
    cancel: CancellationToken,
) -> (Vec<JoinHandle<()>>, mpsc::Sender<String>) {
    let mut handles = Vec::new();
    let (send_tx, send_rx) = mpsc::channel::<String>(256);
    let send_rx = Arc::new(tokio::sync::Mutex::new(send_rx));

    if runner.config.enable_snapshot_create {
        let r = Arc::clone(&runner);
        let c = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_periodic("createSnapshots", Duration::from_secs(60), c, || {
                let r = Arc::clone(&r);
                async move {
                    if let Err(err) = crate::creator::create_snapshots(&r).await {
                        warn!(job = "createSnapshots", %err, "job failed, retrying next tick");
                    }
                }
            })
            .await;
        }));
    }

    if runner.config.enable_snapshot_send {
        let r = Arc::clone(&runner);
        let c = cancel.clone();
        let enqueue_tx = send_tx.clone();
        handles.push(tokio::spawn(async move {
            run_periodic("discoverSendTargets", Duration::from_secs(60), c, || {
                let r = Arc::clone(&r);
                let enqueue_tx = enqueue_tx.clone();
                async move {
                    match crate::replication::datasets_to_send(&r).await {
                        Ok(names) => {
                            for name in names {
                                let _ = enqueue_tx.send(name).await;
                            }
                        }
                        Err(err) => warn!(job = "discoverSendTargets", %err, "listing failed"),
                    }
                }
            })
            .await;
        }));

        for routine_id in 0..runner.config.send_routines {
            let r = Arc::clone(&runner);
            let c = cancel.clone();
            let rx = Arc::clone(&send_rx);
            handles.push(tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = c.cancelled() => return,
                        item = async { rx.lock().await.recv().await } => item,
                    };
                    let Some(dataset) = next else { return };
                    if let Err(err) = crate::replication::send_dataset_snapshots(&r, &dataset).await {
                        if err.is_fatal_to_run() {
                            return;
                        }
                        warn!(job = "sendSnapshots", routine_id, dataset, %err, "send failed");
                    }
                }
            }));
        }
    }

    if runner.config.enable_snapshot_mark {
        let r = Arc::clone(&runner);
        let c = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_periodic("markPrunableSnapshots", Duration::from_secs(5 * 60), c, || {
                let r = Arc::clone(&r);
                async move {
                    if let Err(err) = crate::retention::mark_prunable_snapshots(&r).await {
                        warn!(job = "markPrunableSnapshots", %err, "job failed, retrying next tick");
                    }
                }
            })
            .await;
        }));
    }

    if runner.config.enable_snapshot_prune {
        let r = Arc::clone(&runner);
        let c = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_periodic("pruneSnapshots", Duration::from_secs(5 * 60), c, || {
                let r = Arc::clone(&r);
                async move {
                    if let Err(err) = crate::pruner::prune_snapshots(&r).await {
                        warn!(job = "pruneSnapshots", %err, "job failed, retrying next tick");
                    }
                }
            })
            .await;
        }));

        let r = Arc::clone(&runner);
        let c = cancel.clone();
        handles.push(tokio::spawn(async move {
            run_periodic("pruneFilesystems", Duration::from_secs(5 * 60), c, || {
                let r = Arc::clone(&r);
                async move {
                    if let Err(err) = crate::pruner::prune_filesystems(&r).await {
                        warn!(job = "pruneFilesystems", %err, "job failed, retrying next tick");
                    }
                }
            })
            .await;
        }));
    }

    let r = Arc::clone(&runner);
    let c = cancel.clone();
    handles.push(tokio::spawn(async move {
        run_periodic(
            "pruneRemoteSnapshotCache",
            Duration::from_secs(10 * 60),
            c,
            || {
                let r = Arc::clone(&r);
                async move { r.prune_remote_cache() }
            },
        )
        .await;
    }));

    (handles, send_tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RecordingEventSink;
    use crate::zfs::fake::FakeZfsWrapper;

    fn test_runner() -> Arc<Runner<FakeZfsWrapper>> {
        Runner::new(
            Config::default(),
            Arc::new(FakeZfsWrapper::new()),
            Arc::new(RecordingEventSink::new()),
        )
    }

    #[test]
    fn lock_is_exclusive() {
        let runner = test_runner();
        let guard = runner.try_lock_dataset("tank/data").unwrap();
        assert!(runner.try_lock_dataset("tank/data").is_none());
        drop(guard);
        assert!(runner.try_lock_dataset("tank/data").is_some());
    }

    #[test]
    fn remote_cache_round_trip() {
        let runner = test_runner();
        assert!(runner.cached_remote_snapshots("peer", "tank/data").is_none());
        runner.cache_remote_snapshots("peer", "tank/data", Vec::new());
        assert!(runner.cached_remote_snapshots("peer", "tank/data").is_some());
        runner.invalidate_remote_cache("peer", "tank/data");
        assert!(runner.cached_remote_snapshots("peer", "tank/data").is_none());
    }
}
