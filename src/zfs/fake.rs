//! In-memory `ZfsWrapper` fake, in the teacher's table-driven test style
//! (`#[cfg(test)] mod tests` fixtures in `zfs.rs`/`tomato.rs`/`policy.rs`),
//! generalized into something the rest of the crate's tests can share
//! rather than each module inventing its own mock.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::zfs::wrapper::{ReceiveOptions, SendOptions, TransferResult, ZfsWrapper};
use crate::zfs::{Dataset, Snapshot};

#[derive(Debug, Clone, Default)]
struct FakeDataset {
    dataset: Dataset,
    snapshots: Vec<Snapshot>,
}

/// Backed by a `Mutex<HashMap<..>>` rather than `RwLock` -- tests never
/// hold the lock across an `.await`, and a plain mutex keeps the fake
/// trivially `Send + Sync` without extra ceremony.
///
/// Properties are keyed by *entity* name (dataset or `fs@snap`), separate
/// from the dataset/snapshot registry itself -- real ZFS lets you
/// `set`/`get` a property on a snapshot just as on a filesystem, and
/// several callers (the Retention Marker, the Replication Engine) do
/// exactly that.
#[derive(Default)]
pub struct FakeZfsWrapper {
    datasets: Mutex<HashMap<String, FakeDataset>>,
    properties: Mutex<HashMap<String, HashMap<String, String>>>,
    next_guid: Mutex<u64>,
}

impl FakeZfsWrapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(self, name: &str) -> Self {
        let dataset = Dataset::new(name).expect("valid test dataset name");
        self.datasets.lock().unwrap().insert(
            name.to_string(),
            FakeDataset {
                dataset,
                snapshots: Vec::new(),
            },
        );
        self
    }

    pub fn set_property(&self, entity: &str, key: &str, value: &str) {
        self.properties
            .lock()
            .unwrap()
            .entry(entity.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    pub fn add_snapshot(&self, dataset: &str, name: &str, created: chrono::DateTime<Utc>) {
        let mut guard = self.next_guid.lock().unwrap();
        let guid = *guard;
        *guard += 1;
        drop(guard);
        if let Some(ds) = self.datasets.lock().unwrap().get_mut(dataset) {
            ds.snapshots.push(Snapshot {
                name: format!("{dataset}@{name}"),
                guid,
                created,
                used_bytes: 0,
            });
            ds.snapshots.sort();
        }
    }

    pub fn snapshots_of(&self, dataset: &str) -> Vec<Snapshot> {
        self.datasets
            .lock()
            .unwrap()
            .get(dataset)
            .map(|ds| ds.snapshots.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl ZfsWrapper for FakeZfsWrapper {
    async fn list_datasets(&self, parent: &str, _kinds: &str) -> Result<Vec<Dataset>> {
        Ok(self
            .datasets
            .lock()
            .unwrap()
            .values()
            .filter(|ds| ds.dataset.name().starts_with(parent))
            .map(|ds| ds.dataset.clone())
            .collect())
    }

    async fn list_snapshots(&self, dataset: &str) -> Result<Vec<Snapshot>> {
        Ok(self.snapshots_of(dataset))
    }

    async fn list_with_property(&self, parent: &str, property: &str) -> Result<Vec<Dataset>> {
        let properties = self.properties.lock().unwrap();
        Ok(self
            .datasets
            .lock()
            .unwrap()
            .values()
            .filter(|ds| {
                ds.dataset.name().starts_with(parent)
                    && properties
                        .get(ds.dataset.name())
                        .is_some_and(|props| props.contains_key(property))
            })
            .map(|ds| ds.dataset.clone())
            .collect())
    }

    async fn get_dataset(&self, name: &str) -> Result<Dataset> {
        self.datasets
            .lock()
            .unwrap()
            .get(name)
            .map(|ds| ds.dataset.clone())
            .ok_or_else(|| Error::DatasetNotFound(name.to_string()))
    }

    async fn create_filesystem(&self, name: &str) -> Result<()> {
        let mut guard = self.datasets.lock().unwrap();
        if guard.contains_key(name) {
            return Err(Error::DatasetExists(name.to_string()));
        }
        guard.insert(
            name.to_string(),
            FakeDataset {
                dataset: Dataset::new(name)?,
                snapshots: Vec::new(),
            },
        );
        Ok(())
    }

    async fn create_volume(&self, name: &str, _size_bytes: u64) -> Result<()> {
        self.create_filesystem(name).await
    }

    async fn snapshot(&self, dataset: &str, snap_name: &str) -> Result<Snapshot> {
        if !self.datasets.lock().unwrap().contains_key(dataset) {
            return Err(Error::DatasetNotFound(dataset.to_string()));
        }
        self.add_snapshot(dataset, snap_name, Utc::now());
        self.snapshots_of(dataset)
            .into_iter()
            .find(|s| s.snap_name() == snap_name)
            .ok_or_else(|| Error::DatasetNotFound(dataset.to_string()))
    }

    async fn clone_dataset(&self, _snapshot: &str, target: &str) -> Result<()> {
        self.create_filesystem(target).await
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        if let Some((dataset, snap)) = name.split_once('@') {
            if let Some(ds) = self.datasets.lock().unwrap().get_mut(dataset) {
                ds.snapshots.retain(|s| s.snap_name() != snap);
                return Ok(());
            }
            return Err(Error::DatasetNotFound(name.to_string()));
        }
        self.datasets
            .lock()
            .unwrap()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::DatasetNotFound(name.to_string()))
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut guard = self.datasets.lock().unwrap();
        let mut ds = guard
            .remove(from)
            .ok_or_else(|| Error::DatasetNotFound(from.to_string()))?;
        ds.dataset = Dataset::new(to)?;
        guard.insert(to.to_string(), ds);
        Ok(())
    }

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()> {
        self.set_property(dataset, key, value);
        Ok(())
    }

    async fn get_property(&self, dataset: &str, key: &str) -> Result<Option<String>> {
        Ok(self
            .properties
            .lock()
            .unwrap()
            .get(dataset)
            .and_then(|props| props.get(key).cloned()))
    }

    async fn inherit_property(&self, dataset: &str, key: &str) -> Result<()> {
        if let Some(props) = self.properties.lock().unwrap().get_mut(dataset) {
            props.remove(key);
        }
        Ok(())
    }

    async fn send_snapshot(
        &self,
        snapshot: &str,
        _opts: &SendOptions,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<TransferResult> {
        let payload = snapshot.as_bytes();
        sink.write_all(payload).await?;
        Ok(TransferResult {
            bytes: payload.len() as u64,
            resume_token: None,
        })
    }

    async fn receive_snapshot(
        &self,
        target: &str,
        _opts: &ReceiveOptions,
        source: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<TransferResult> {
        let mut buf = Vec::new();
        let bytes = source.read_to_end(&mut buf).await? as u64;
        let (dataset, snap) = target
            .split_once('@')
            .ok_or_else(|| Error::InvalidIdentifier(target.to_string()))?;
        if !self.datasets.lock().unwrap().contains_key(dataset) {
            self.create_filesystem(dataset).await?;
        }
        self.add_snapshot(dataset, snap, Utc::now());
        Ok(TransferResult {
            bytes,
            resume_token: None,
        })
    }

    async fn resume_send(
        &self,
        token: &str,
        opts: &SendOptions,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<TransferResult> {
        self.send_snapshot(token, opts, sink).await
    }

    async fn rollback(&self, _snapshot: &str) -> Result<()> {
        Ok(())
    }

    async fn mount(&self, _dataset: &str) -> Result<()> {
        Ok(())
    }

    async fn unmount(&self, _dataset: &str) -> Result<()> {
        Ok(())
    }

    async fn load_key(&self, _dataset: &str) -> Result<()> {
        Ok(())
    }

    async fn unload_key(&self, _dataset: &str) -> Result<()> {
        Ok(())
    }

    async fn children(&self, dataset: &str) -> Result<Vec<String>> {
        Ok(self
            .datasets
            .lock()
            .unwrap()
            .keys()
            .filter(|name| name.starts_with(&format!("{dataset}/")))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_and_snapshot_round_trip() {
        let fake = FakeZfsWrapper::new().with_dataset("tank/data");
        let snap = fake.snapshot("tank/data", "backup_1").await.unwrap();
        assert_eq!(snap.name, "tank/data@backup_1");
        assert_eq!(fake.list_snapshots("tank/data").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn destroy_missing_dataset_errors() {
        let fake = FakeZfsWrapper::new();
        assert!(fake.destroy("tank/missing").await.is_err());
    }
}
