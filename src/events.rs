//! Observability boundary for the replication pipeline.
//!
//! Every component that does work worth knowing about (a snapshot taken, a
//! send started/progressed/finished, a prune decision) reports through this
//! trait instead of calling `tracing` directly. That keeps the domain code
//! decoupled from how events ultimately surface, and lets tests assert on
//! what happened without scraping log output.

use std::sync::{Arc, Mutex};

use byte_unit::Byte;
use tracing::{info, warn};

use crate::zfs::{Dataset, Snapshot};

/// Renders a byte count the way an operator reads a log line, e.g.
/// `"4.20 GiB"`, matching the teacher's `zfs.rs` usage of `byte_unit::Byte`
/// for dataset space accounting.
fn human_bytes(bytes: u64) -> String {
    Byte::from_bytes(bytes as u128)
        .get_appropriate_unit(true)
        .to_string()
}

/// One thing worth reporting. Deliberately flat rather than a trait-object
/// hierarchy per event kind -- there are few enough kinds that a single enum
/// read better than a family of structs, and it's what gets matched on in
/// `TracingEventSink` anyway.
#[derive(Debug, Clone)]
pub enum Event {
    SnapshotCreated {
        dataset: Dataset,
        snapshot: Snapshot,
    },
    SnapshotCreateSkipped {
        dataset: Dataset,
        reason: String,
    },
    SendStarted {
        dataset: Dataset,
        snapshot: Snapshot,
        incremental_from: Option<Snapshot>,
    },
    SendProgress {
        dataset: Dataset,
        snapshot: Snapshot,
        bytes_sent: u64,
    },
    SendFinished {
        dataset: Dataset,
        snapshot: Snapshot,
        bytes_sent: u64,
    },
    SendFailed {
        dataset: Dataset,
        snapshot: Snapshot,
        error: String,
    },
    RetentionMarked {
        dataset: Dataset,
        snapshot: Snapshot,
        keep: bool,
    },
    SnapshotDestroyed {
        dataset: Dataset,
        snapshot: Snapshot,
    },
    FilesystemDestroyed {
        dataset: Dataset,
    },
    DestroyRefused {
        dataset: Dataset,
        reason: String,
    },
}

/// Where `Event`s go. `Send + Sync` because the dispatcher fans work out
/// across `tokio::spawn`ed tasks, each holding a clone of the sink.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: Event);
}

/// Production sink: every event becomes a structured `tracing` record.
/// Fields are attached directly rather than interpolated into the message
/// so they stay queryable by whatever collects the logs.
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: Event) {
        match event {
            Event::SnapshotCreated { dataset, snapshot } => {
                info!(dataset = %dataset, snapshot = %snapshot.name, "snapshot created");
            }
            Event::SnapshotCreateSkipped { dataset, reason } => {
                info!(dataset = %dataset, reason, "snapshot creation skipped");
            }
            Event::SendStarted {
                dataset,
                snapshot,
                incremental_from,
            } => {
                info!(
                    dataset = %dataset,
                    snapshot = %snapshot.name,
                    incremental_from = incremental_from.as_ref().map(|s| s.name.as_str()),
                    "send started"
                );
            }
            Event::SendProgress {
                dataset,
                snapshot,
                bytes_sent,
            } => {
                info!(
                    dataset = %dataset,
                    snapshot = %snapshot.name,
                    bytes_sent,
                    human = %human_bytes(bytes_sent),
                    "send progress"
                );
            }
            Event::SendFinished {
                dataset,
                snapshot,
                bytes_sent,
            } => {
                info!(
                    dataset = %dataset,
                    snapshot = %snapshot.name,
                    bytes_sent,
                    human = %human_bytes(bytes_sent),
                    "send finished"
                );
            }
            Event::SendFailed {
                dataset,
                snapshot,
                error,
            } => {
                warn!(dataset = %dataset, snapshot = %snapshot.name, error, "send failed");
            }
            Event::RetentionMarked {
                dataset,
                snapshot,
                keep,
            } => {
                info!(dataset = %dataset, snapshot = %snapshot.name, keep, "retention decided");
            }
            Event::SnapshotDestroyed { dataset, snapshot } => {
                info!(dataset = %dataset, snapshot = %snapshot.name, "snapshot destroyed");
            }
            Event::FilesystemDestroyed { dataset } => {
                info!(dataset = %dataset, "filesystem destroyed");
            }
            Event::DestroyRefused { dataset, reason } => {
                warn!(dataset = %dataset, reason, "destroy refused");
            }
        }
    }
}

/// Test sink: records everything in order, for assertions. `Mutex` rather
/// than a channel -- tests want to inspect the full history synchronously
/// after the fact, not stream it.
#[derive(Default, Clone)]
pub struct RecordingEventSink {
    events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("event log poisoned").clone()
    }
}

impl EventSink for RecordingEventSink {
    fn emit(&self, event: Event) {
        self.events.lock().expect("event log poisoned").push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snap(name: &str) -> Snapshot {
        Snapshot {
            name: name.to_string(),
            guid: 1,
            created: Utc::now(),
            used_bytes: 0,
        }
    }

    #[test]
    fn human_bytes_uses_binary_units() {
        assert_eq!(human_bytes(0), "0 B");
        assert!(human_bytes(5 * 1024 * 1024 * 1024).starts_with("5"));
    }

    #[test]
    fn records_events_in_order() {
        let sink = RecordingEventSink::new();
        sink.emit(Event::SnapshotCreated {
            dataset: Dataset::new("tank/data").unwrap(),
            snapshot: snap("backup_1"),
        });
        sink.emit(Event::SnapshotCreateSkipped {
            dataset: Dataset::new("tank/data").unwrap(),
            reason: "too soon".to_string(),
        });
        assert_eq!(sink.events().len(), 2);
    }
}
