//! ZFS snapshot replication orchestrator.
//!
//! [`runner`] wires the periodic jobs (Snapshot Creator, Replication
//! Engine, Retention Marker, Pruner) around a shared [`zfs::ZfsWrapper`];
//! [`transport`] exposes the HTTP Snapshot Transport both ends of a
//! replication pair speak.

pub mod config;
pub mod creator;
pub mod error;
pub mod events;
pub mod pruner;
pub mod replication;
pub mod retention;
pub mod runner;
pub mod transport;
pub mod zfs;
