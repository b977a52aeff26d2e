//! The reconciliation algorithm (spec.md §4.3.2): a pure function with no
//! I/O, so it can be exhaustively unit-tested -- this is the one function
//! spec.md calls out as having a stability requirement (tie-break on equal
//! `created-at`).
//!
//! Grounded on `DanielArmengod-zfs-rs/src/dataset.rs`'s `comm`/`find_mrcud`
//! merge-walk of two sorted snapshot histories, generalized from "classify
//! the relationship between two histories" to "produce the ordered list of
//! sends that makes the remote history equal the local one".

use std::collections::HashMap;

use crate::error::{Error, Result};

/// A local snapshot as seen by the reconciler: just enough to decide
/// order and naming, not the full `Snapshot` type (no guid/size needed
/// here).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSnap {
    pub snap_name: String,
    pub has_sent_at: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteSnap {
    pub snap_name: String,
}

/// One unit of reconciler output: either a plan to send `snap_name`
/// (optionally incremental against `incremental_base`), or a pure
/// metadata back-fill when the snapshot already exists on the remote but
/// the local `sent-at` property was never set (spec.md §3's back-fill
/// invariant).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanItem {
    Send {
        snap_name: String,
        incremental_base: Option<String>,
        properties: HashMap<String, String>,
    },
    BackfillSentAt {
        snap_name: String,
    },
}

/// Computes the effective property map for a planned send: the
/// configured `set_properties` merged over any `copy_properties` whose
/// current local value is present, per spec.md §4.3.2 step 3.
fn effective_properties(
    copy_properties: &HashMap<String, String>,
    set_properties: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut props = copy_properties.clone();
    props.extend(set_properties.clone());
    props
}

/// `local` must be ordered ascending by `created-at` (spec.md §4.3.2's
/// tie-break requirement: ties preserve the input order, i.e. the ZFS
/// wrapper's creation-txg order -- this function never re-sorts).
pub fn reconcile(
    local: &[LocalSnap],
    remote: &[RemoteSnap],
    copy_properties: &HashMap<String, String>,
    set_properties: &HashMap<String, String>,
) -> Result<Vec<PlanItem>> {
    let remote_names: std::collections::HashSet<&str> =
        remote.iter().map(|s| s.snap_name.as_str()).collect();

    let mut plan = Vec::new();
    let mut prev_remote_snap: Option<String> = None;

    for snap in local {
        if remote_names.contains(snap.snap_name.as_str()) {
            if !snap.has_sent_at {
                plan.push(PlanItem::BackfillSentAt {
                    snap_name: snap.snap_name.clone(),
                });
            }
            prev_remote_snap = Some(snap.snap_name.clone());
            continue;
        }

        if !remote.is_empty() && prev_remote_snap.is_none() {
            // Still searching for the common ancestor.
            continue;
        }

        plan.push(PlanItem::Send {
            snap_name: snap.snap_name.clone(),
            incremental_base: prev_remote_snap.clone(),
            properties: effective_properties(copy_properties, set_properties),
        });
        prev_remote_snap = Some(snap.snap_name.clone());
    }

    if !remote.is_empty() && prev_remote_snap.is_none() {
        return Err(Error::NoCommonSnapshots);
    }

    Ok(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn local(names: &[&str]) -> Vec<LocalSnap> {
        names
            .iter()
            .map(|n| LocalSnap {
                snap_name: n.to_string(),
                has_sent_at: false,
            })
            .collect()
    }

    fn remote(names: &[&str]) -> Vec<RemoteSnap> {
        names
            .iter()
            .map(|n| RemoteSnap {
                snap_name: n.to_string(),
            })
            .collect()
    }

    #[test]
    fn full_then_incremental_against_empty_remote() {
        let plan = reconcile(&local(&["s1", "s2", "s3"]), &remote(&[]), &HashMap::new(), &HashMap::new())
            .unwrap();
        assert_eq!(
            plan,
            vec![
                PlanItem::Send {
                    snap_name: "s1".into(),
                    incremental_base: None,
                    properties: HashMap::new(),
                },
                PlanItem::Send {
                    snap_name: "s2".into(),
                    incremental_base: Some("s1".into()),
                    properties: HashMap::new(),
                },
                PlanItem::Send {
                    snap_name: "s3".into(),
                    incremental_base: Some("s2".into()),
                    properties: HashMap::new(),
                },
            ]
        );
    }

    #[test]
    fn backfills_sent_at_without_resending() {
        let mut locals = local(&["s1", "s2"]);
        locals[0].has_sent_at = false;
        let plan = reconcile(&locals, &remote(&["s1"]), &HashMap::new(), &HashMap::new()).unwrap();
        assert_eq!(
            plan,
            vec![
                PlanItem::BackfillSentAt { snap_name: "s1".into() },
                PlanItem::Send {
                    snap_name: "s2".into(),
                    incremental_base: Some("s1".into()),
                    properties: HashMap::new(),
                },
            ]
        );
    }

    #[test]
    fn already_sent_snapshot_is_not_backfilled_or_resent() {
        let mut locals = local(&["s1"]);
        locals[0].has_sent_at = true;
        let plan = reconcile(&locals, &remote(&["s1"]), &HashMap::new(), &HashMap::new()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn no_common_ancestor_is_an_error() {
        let result = reconcile(&local(&["s1"]), &remote(&["unrelated"]), &HashMap::new(), &HashMap::new());
        assert!(matches!(result, Err(Error::NoCommonSnapshots)));
    }

    #[test]
    fn idempotent_when_histories_already_match() {
        let mut locals = local(&["s1", "s2"]);
        locals.iter_mut().for_each(|s| s.has_sent_at = true);
        let plan = reconcile(&locals, &remote(&["s1", "s2"]), &HashMap::new(), &HashMap::new()).unwrap();
        assert!(plan.is_empty());
    }

    #[test]
    fn copy_properties_merge_under_set_properties() {
        let mut copy = HashMap::new();
        copy.insert("compression".to_string(), "lz4".to_string());
        let mut set = HashMap::new();
        set.insert("compression".to_string(), "zstd".to_string());

        let plan = reconcile(&local(&["s1"]), &remote(&[]), &copy, &set).unwrap();
        let PlanItem::Send { properties, .. } = &plan[0] else {
            panic!("expected Send");
        };
        assert_eq!(properties.get("compression"), Some(&"zstd".to_string()));
    }
}
