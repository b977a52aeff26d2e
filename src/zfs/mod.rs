//! Dataset and snapshot types, the `ZfsWrapper` contract, and its
//! implementations.
//!
//! Mirrors the teacher's `zfs.rs` shape (a handful of plain structs plus
//! free functions that shell out and parse), generalized so the shelling
//! out lives behind a trait (`ZfsWrapper`) instead of being called
//! directly -- the replication/retention/pruning code never needs to know
//! whether it's talking to a real `zfs(8)` binary or a test fixture.

pub mod fake;
pub mod properties;
pub mod wrapper;

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use properties::PropertyName;
pub use wrapper::{SubprocessZfsWrapper, ZfsWrapper};

/// The ZFS sentinel for "property not set / inherited", spec.md §3.
pub const UNSET: &str = "-";

/// Centralizes the sentinel check so nobody compares against `"-"` ad hoc.
pub fn is_unset(value: &str) -> bool {
    value == UNSET
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    Filesystem,
    Volume,
    Snapshot,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceUsage {
    pub used: u64,
    pub available: u64,
    pub referenced: u64,
    pub logical_used: u64,
    pub used_by_dataset: u64,
    pub written: u64,
    pub volsize: u64,
    pub quota: u64,
    pub refquota: u64,
}

/// A ZFS dataset: filesystem or volume. Snapshots are a distinct, lighter
/// type (`Snapshot`) rather than a `Dataset` with `kind == Snapshot`,
/// because nothing in this crate needs a filesystem and a snapshot to be
/// interchangeable -- every call site already knows which one it has.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dataset {
    name: String,
    pub kind: DatasetKind,
    pub origin: Option<String>,
    pub space: SpaceUsage,
    pub mountpoint: Option<String>,
    pub compression: Option<String>,
    pub extra_props: HashMap<String, String>,
}

impl Dataset {
    /// Validates `name` against the path-component rules in spec.md §3.
    /// Kept deliberately permissive beyond that: ZFS itself is the source
    /// of truth for what a legal dataset name is once it reaches the
    /// wrapper; this just rejects the empty/root case that every caller
    /// would otherwise special-case.
    pub fn new(name: impl Into<String>) -> Result<Self, crate::error::Error> {
        let name = name.into();
        if name.is_empty() || name.contains('@') {
            return Err(crate::error::Error::InvalidIdentifier(name));
        }
        Ok(Self {
            name,
            kind: DatasetKind::Filesystem,
            origin: None,
            space: SpaceUsage::default(),
            mountpoint: None,
            compression: None,
            extra_props: HashMap::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The dataset's last path component, per spec.md §3's first invariant.
    pub fn leaf_name(&self) -> &str {
        self.name.rsplit('/').next().unwrap_or(&self.name)
    }

    pub fn snapshot(&self, snap_name: &str) -> Snapshot {
        Snapshot {
            name: format!("{}@{snap_name}", self.name),
            guid: 0,
            created: Utc::now(),
            used_bytes: 0,
        }
    }
}

impl fmt::Display for Dataset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

/// A point-in-time snapshot. `name` is always `fs@snap`; `dataset_name`/
/// `snap_name` split it on demand rather than storing the split eagerly,
/// mirroring `SnapshotMetadata::dataset()` in the teacher's `zfs.rs`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub name: String,
    pub guid: u64,
    pub created: DateTime<Utc>,
    pub used_bytes: u64,
}

impl Snapshot {
    pub fn dataset_name(&self) -> &str {
        self.name.split('@').next().unwrap_or(&self.name)
    }

    /// The part after the last `@`, spec.md §3: "a snapshot name is the
    /// text after the last `@`".
    pub fn snap_name(&self) -> &str {
        self.name.rsplit('@').next().unwrap_or(&self.name)
    }
}

impl PartialOrd for Snapshot {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Snapshot {
    /// Ordered by creation time, ascending, matching the `created-at`
    /// ascending order the reconciliation algorithm (spec.md §4.3.2)
    /// requires its input in.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.created.cmp(&other.created)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_name_split() {
        let ds = Dataset::new("tank/a/b").unwrap();
        let snap = ds.snapshot("backup_1");
        assert_eq!(snap.dataset_name(), "tank/a/b");
        assert_eq!(snap.snap_name(), "backup_1");
    }

    #[test]
    fn leaf_name_is_last_component() {
        let ds = Dataset::new("tank/a/b").unwrap();
        assert_eq!(ds.leaf_name(), "b");
    }

    #[test]
    fn rejects_empty_name() {
        assert!(Dataset::new("").is_err());
    }

    #[test]
    fn unset_sentinel() {
        assert!(is_unset("-"));
        assert!(!is_unset("2024-01-01T00:00:00Z"));
    }
}
