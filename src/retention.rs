//! Retention Marker (spec.md §4.4): two sub-passes that set `delete-at`
//! on snapshots exceeding a count- or age-based policy. Never lowers an
//! existing `delete-at` to an earlier value -- spec.md §3's
//! "`delete-at` is never overwritten to a *later* value" invariant, read
//! the other way: it also never gets overwritten *earlier* by this code,
//! since both sub-passes only ever set a *sooner* grace deadline than
//! "unset".
//!
//! This is **not** the teacher's `policy.rs`/`tomato.rs` tiered
//! `RetentionPolicy` (`"10m2:1h48"`-style rules keeping N copies per
//! time-bucket) -- spec.md's `retention-count`/`retention-minutes`
//! properties are simpler flat semantics, so this module implements them
//! directly. It borrows the teacher's `FromStr`-on-property idiom for
//! parsing the integer properties and its table-driven test style.

use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::events::Event;
use crate::runner::Runner;
use crate::zfs::{PropertyName, Snapshot, ZfsWrapper};

/// `now + 5 min`, spec.md §4.4's grace window.
fn grace_deadline(runner_grace: chrono::Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    now + runner_grace
}

/// `true` if `delete_at` should be set to `candidate`: either nothing is
/// set yet, or what's set is later than `candidate` (never push the
/// deadline further out, per spec.md §3).
fn should_set(existing: Option<DateTime<Utc>>, candidate: DateTime<Utc>) -> bool {
    match existing {
        None => true,
        Some(existing) => existing > candidate,
    }
}

async fn parse_delete_at<W: ZfsWrapper>(
    zfs: &W,
    snap: &str,
    delete_at_prop: &str,
) -> Result<Option<DateTime<Utc>>> {
    Ok(zfs
        .get_property(snap, delete_at_prop)
        .await?
        .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
        .map(|dt| dt.with_timezone(&Utc)))
}

async fn mark_delete_at<W: ZfsWrapper>(
    runner: &Runner<W>,
    dataset: &crate::zfs::Dataset,
    snap: &Snapshot,
    delete_at_prop: &str,
    deadline: DateTime<Utc>,
) -> Result<()> {
    runner
        .zfs
        .set_property(&snap.name, delete_at_prop, &deadline.to_rfc3339())
        .await?;
    runner.emit(Event::RetentionMarked {
        dataset: dataset.clone(),
        snapshot: snap.clone(),
        keep: false,
    });

    if runner.config.enable_snapshot_mark_remote {
        let send_to_prop = PropertyName::SendTo.qualified(&runner.config.property_namespace);
        if let Some(server) = runner.zfs.get_property(dataset.name(), &send_to_prop).await? {
            let client = crate::replication::client::HttpPeerClient::new(
                &server,
                runner.config.authentication_tokens.first().cloned(),
            );
            let mut props = std::collections::HashMap::new();
            props.insert(delete_at_prop.to_string(), deadline.to_rfc3339());
            let _ = client
                .set_snapshot_properties(dataset.name(), snap.snap_name(), &props)
                .await;
        }
    }
    Ok(())
}

/// `markPrunableExcessSnapshots` (spec.md §4.4, "By count"): keep at most
/// `retention-count` snapshots, newest first.
pub async fn mark_prunable_excess_snapshots<W: ZfsWrapper>(runner: &Runner<W>) -> Result<()> {
    let namespace = &runner.config.property_namespace;
    let count_prop = PropertyName::RetentionCount.qualified(namespace);
    let delete_at_prop = PropertyName::DeleteAt.qualified(namespace);
    let created_at_prop = PropertyName::CreatedAt.qualified(namespace);

    let datasets = runner
        .zfs
        .list_with_property(&runner.config.parent_dataset, &count_prop)
        .await?;

    for dataset in datasets {
        let Some(_guard) = runner.try_lock_dataset(dataset.name()) else {
            continue;
        };
        let retention_count: i64 = match runner.zfs.get_property(dataset.name(), &count_prop).await? {
            Some(v) => v.parse().unwrap_or(0),
            None => continue,
        };
        if retention_count <= 0 {
            continue;
        }

        let mut snapshots = runner.zfs.list_snapshots(dataset.name()).await?;
        // Already ascending by created-at (our `Ord`); keep only those
        // with created-at set, matching spec.md's configurable ignore.
        let mut kept = Vec::new();
        for snap in snapshots.drain(..) {
            if runner.zfs.get_property(&snap.name, &created_at_prop).await?.is_some() {
                kept.push(snap);
            }
        }
        kept.reverse(); // newest-first walk, per spec.md §4.4.

        let now = Utc::now();
        let deadline = grace_deadline(runner.config.retention_grace_period, now);
        for (index, snap) in kept.iter().enumerate() {
            if (index as i64) < retention_count {
                continue;
            }
            let existing = parse_delete_at(&*runner.zfs, &snap.name, &delete_at_prop).await?;
            if should_set(existing, deadline) {
                mark_delete_at(runner, &dataset, snap, &delete_at_prop, deadline).await?;
            }
        }
    }
    Ok(())
}

/// `markPrunableSnapshotsByAge` (spec.md §4.4, "By age").
pub async fn mark_prunable_snapshots_by_age<W: ZfsWrapper>(runner: &Runner<W>) -> Result<()> {
    let namespace = &runner.config.property_namespace;
    let minutes_prop = PropertyName::RetentionMinutes.qualified(namespace);
    let delete_at_prop = PropertyName::DeleteAt.qualified(namespace);
    let created_at_prop = PropertyName::CreatedAt.qualified(namespace);

    let datasets = runner
        .zfs
        .list_with_property(&runner.config.parent_dataset, &minutes_prop)
        .await?;

    for dataset in datasets {
        let Some(_guard) = runner.try_lock_dataset(dataset.name()) else {
            continue;
        };
        let retention_minutes: i64 = match runner.zfs.get_property(dataset.name(), &minutes_prop).await? {
            Some(v) => v.parse().unwrap_or(0),
            None => continue,
        };
        if retention_minutes <= 0 {
            continue;
        }

        let snapshots = runner.zfs.list_snapshots(dataset.name()).await?;
        let now = Utc::now();
        let deadline = grace_deadline(runner.config.retention_grace_period, now);

        for snap in &snapshots {
            let Some(created_at) = runner
                .zfs
                .get_property(&snap.name, &created_at_prop)
                .await?
                .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
                .map(|dt| dt.with_timezone(&Utc))
            else {
                continue;
            };
            if created_at + chrono::Duration::minutes(retention_minutes) >= now {
                continue;
            }
            let existing = parse_delete_at(&*runner.zfs, &snap.name, &delete_at_prop).await?;
            if should_set(existing, deadline) {
                mark_delete_at(runner, &dataset, snap, &delete_at_prop, deadline).await?;
            }
        }
    }
    Ok(())
}

/// Runs both sub-passes; this is what the Runner's `markPrunableSnapshots`
/// job cadence invokes.
pub async fn mark_prunable_snapshots<W: ZfsWrapper>(runner: &Runner<W>) -> Result<()> {
    mark_prunable_excess_snapshots(runner).await?;
    mark_prunable_snapshots_by_age(runner).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::events::RecordingEventSink;
    use crate::zfs::fake::FakeZfsWrapper;
    use std::sync::Arc;

    fn runner_with(fake: FakeZfsWrapper) -> Arc<Runner<FakeZfsWrapper>> {
        Runner::new(Config::default(), Arc::new(fake), Arc::new(RecordingEventSink::new()))
    }

    fn stamp_created_at(fake: &FakeZfsWrapper, snap: &str, when: DateTime<Utc>) {
        fake.set_property(snap, "zrepd:created-at", &when.to_rfc3339());
    }

    #[tokio::test]
    async fn retention_by_count_marks_oldest_excess() {
        let fake = FakeZfsWrapper::new().with_dataset("tank/data");
        fake.set_property("tank/data", "zrepd:retention-count", "2");
        let t0 = Utc::now() - chrono::Duration::minutes(30);
        for (i, offset) in [20, 10, 0].into_iter().enumerate() {
            let created = t0 + chrono::Duration::minutes(offset);
            fake.add_snapshot("tank/data", &format!("s{i}"), created);
            stamp_created_at(&fake, &format!("tank/data@s{i}"), created);
        }
        let runner = runner_with(fake);

        mark_prunable_excess_snapshots(&runner).await.unwrap();

        let delete_at_prop = "zrepd:delete-at";
        assert!(runner
            .zfs
            .get_property("tank/data@s0", delete_at_prop)
            .await
            .unwrap()
            .is_some());
        assert!(runner
            .zfs
            .get_property("tank/data@s1", delete_at_prop)
            .await
            .unwrap()
            .is_none());
        assert!(runner
            .zfs
            .get_property("tank/data@s2", delete_at_prop)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn retention_by_age_marks_only_older_than_window() {
        let fake = FakeZfsWrapper::new().with_dataset("tank/data");
        fake.set_property("tank/data", "zrepd:retention-minutes", "2");
        let now = Utc::now();
        for (name, offset_minutes) in [("old", -3), ("recent", -1), ("future", 1)] {
            let created = now + chrono::Duration::minutes(offset_minutes);
            fake.add_snapshot("tank/data", name, created);
            stamp_created_at(&fake, &format!("tank/data@{name}"), created);
        }
        let runner = runner_with(fake);

        mark_prunable_snapshots_by_age(&runner).await.unwrap();

        let delete_at_prop = "zrepd:delete-at";
        assert!(runner
            .zfs
            .get_property("tank/data@old", delete_at_prop)
            .await
            .unwrap()
            .is_some());
        assert!(runner
            .zfs
            .get_property("tank/data@recent", delete_at_prop)
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn never_moves_deadline_later() {
        let now = Utc::now();
        let existing = Some(now);
        let candidate = now + chrono::Duration::minutes(10);
        assert!(!should_set(existing, candidate));
    }

    #[test]
    fn sets_when_nothing_marked_yet() {
        assert!(should_set(None, Utc::now()));
    }
}
