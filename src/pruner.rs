//! Pruner (spec.md §4.5): destroys snapshots and filesystems whose
//! `delete-at` has elapsed. Both passes re-fetch the property immediately
//! before destroying rather than trusting the listing read, and both
//! refuse to recurse into children -- spec.md §9's open question,
//! preserved rather than guessed away.
//!
//! Grounded on the teacher's `zfs.rs::destroy_snapshot`, which likewise
//! re-reads state before calling `zfs destroy` instead of acting on a
//! possibly-stale listing.

use chrono::Utc;

use crate::error::Result;
use crate::events::Event;
use crate::runner::Runner;
use crate::zfs::{PropertyName, ZfsWrapper};

async fn is_due<W: ZfsWrapper>(zfs: &W, entity: &str, delete_at_prop: &str) -> Result<bool> {
    let Some(value) = zfs.get_property(entity, delete_at_prop).await? else {
        return Ok(false);
    };
    let Ok(at) = chrono::DateTime::parse_from_rfc3339(&value) else {
        return Ok(false);
    };
    Ok(at.with_timezone(&Utc) <= Utc::now())
}

/// `pruneSnapshots` (spec.md §4.5): list snapshots with `delete-at` set
/// locally or inherited, take the per-parent-dataset lock, re-confirm,
/// destroy if due.
pub async fn prune_snapshots<W: ZfsWrapper>(runner: &Runner<W>) -> Result<()> {
    let delete_at_prop = PropertyName::DeleteAt.qualified(&runner.config.property_namespace);

    let datasets = runner
        .zfs
        .list_datasets(&runner.config.parent_dataset, "filesystem,volume")
        .await?;

    for dataset in datasets {
        let Some(_guard) = runner.try_lock_dataset(dataset.name()) else {
            continue;
        };
        let snapshots = runner.zfs.list_snapshots(dataset.name()).await?;
        for snap in snapshots {
            // Re-fetch to confirm rather than trusting the listing read
            // (spec.md §4.5: "re-fetch to confirm").
            if !is_due(&*runner.zfs, &snap.name, &delete_at_prop).await? {
                continue;
            }
            runner.zfs.destroy(&snap.name).await?;
            runner.emit(Event::SnapshotDestroyed {
                dataset: dataset.clone(),
                snapshot: snap,
            });
        }
    }
    Ok(())
}

/// `pruneFilesystems` (spec.md §4.5): two variants -- `delete-at` past,
/// or `delete-without-snapshots = true` with no children. Both skip
/// datasets that have children; recursive destroy is intentionally not
/// implemented (spec.md §9 Open Question).
pub async fn prune_filesystems<W: ZfsWrapper>(runner: &Runner<W>) -> Result<()> {
    let delete_at_prop = PropertyName::DeleteAt.qualified(&runner.config.property_namespace);
    let delete_without_snapshots_prop =
        PropertyName::DeleteWithoutSnapshots.qualified(&runner.config.property_namespace);

    let datasets = runner
        .zfs
        .list_datasets(&runner.config.parent_dataset, "filesystem,volume")
        .await?;

    for dataset in datasets {
        let Some(_guard) = runner.try_lock_dataset(dataset.name()) else {
            continue;
        };

        let children = runner.zfs.children(dataset.name()).await?;
        if !children.is_empty() {
            runner.emit(Event::DestroyRefused {
                dataset: dataset.clone(),
                reason: "dataset has children; recursive destroy is not implemented".to_string(),
            });
            continue;
        }

        let due_by_age = is_due(&*runner.zfs, dataset.name(), &delete_at_prop).await?;
        let due_empty = if due_by_age {
            false
        } else {
            wants_delete_without_snapshots(&*runner.zfs, dataset.name(), &delete_without_snapshots_prop)
                .await?
                && runner.zfs.list_snapshots(dataset.name()).await?.is_empty()
        };
        if !due_by_age && !due_empty {
            continue;
        }

        runner.zfs.destroy(dataset.name()).await?;
        runner.emit(Event::FilesystemDestroyed {
            dataset: dataset.clone(),
        });
    }
    Ok(())
}

async fn wants_delete_without_snapshots<W: ZfsWrapper>(
    zfs: &W,
    entity: &str,
    prop: &str,
) -> Result<bool> {
    Ok(zfs.get_property(entity, prop).await?.as_deref() == Some("true"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::{Event, RecordingEventSink};
    use crate::zfs::fake::FakeZfsWrapper;
    use std::sync::Arc;

    fn runner_with(fake: FakeZfsWrapper) -> (Arc<Runner<FakeZfsWrapper>>, RecordingEventSink) {
        let sink = RecordingEventSink::new();
        let runner = Runner::new(Config::default(), Arc::new(fake), Arc::new(sink.clone()));
        (runner, sink)
    }

    #[tokio::test]
    async fn destroys_snapshot_past_delete_at() {
        let fake = FakeZfsWrapper::new().with_dataset("tank/data");
        fake.add_snapshot("tank/data", "s1", Utc::now());
        fake.set_property(
            "tank/data@s1",
            "zrepd:delete-at",
            &(Utc::now() - chrono::Duration::minutes(1)).to_rfc3339(),
        );
        let (runner, sink) = runner_with(fake);

        prune_snapshots(&runner).await.unwrap();

        assert!(runner.zfs.list_snapshots("tank/data").await.unwrap().is_empty());
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, Event::SnapshotDestroyed { .. })));
    }

    #[tokio::test]
    async fn leaves_snapshot_before_delete_at() {
        let fake = FakeZfsWrapper::new().with_dataset("tank/data");
        fake.add_snapshot("tank/data", "s1", Utc::now());
        fake.set_property(
            "tank/data@s1",
            "zrepd:delete-at",
            &(Utc::now() + chrono::Duration::minutes(5)).to_rfc3339(),
        );
        let (runner, _sink) = runner_with(fake);

        prune_snapshots(&runner).await.unwrap();

        assert_eq!(runner.zfs.list_snapshots("tank/data").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn destroys_empty_filesystem_marked_delete_without_snapshots() {
        let fake = FakeZfsWrapper::new().with_dataset("tank/data");
        fake.set_property("tank/data", "zrepd:delete-without-snapshots", "true");
        let (runner, sink) = runner_with(fake);

        prune_filesystems(&runner).await.unwrap();

        assert!(runner.zfs.get_dataset("tank/data").await.is_err());
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, Event::FilesystemDestroyed { .. })));
    }

    #[tokio::test]
    async fn leaves_filesystem_with_snapshots_even_if_marked_delete_without_snapshots() {
        let fake = FakeZfsWrapper::new().with_dataset("tank/data");
        fake.add_snapshot("tank/data", "s1", Utc::now());
        fake.set_property("tank/data", "zrepd:delete-without-snapshots", "true");
        let (runner, _sink) = runner_with(fake);

        prune_filesystems(&runner).await.unwrap();

        assert!(runner.zfs.get_dataset("tank/data").await.is_ok());
    }

    #[tokio::test]
    async fn refuses_to_destroy_filesystem_with_children() {
        let fake = FakeZfsWrapper::new()
            .with_dataset("tank/data")
            .with_dataset("tank/data/child");
        fake.set_property(
            "tank/data",
            "zrepd:delete-at",
            &(Utc::now() - chrono::Duration::minutes(1)).to_rfc3339(),
        );
        let (runner, sink) = runner_with(fake);

        prune_filesystems(&runner).await.unwrap();

        assert!(runner.zfs.get_dataset("tank/data").await.is_ok());
        assert!(sink
            .events()
            .iter()
            .any(|e| matches!(e, Event::DestroyRefused { .. })));
    }
}
