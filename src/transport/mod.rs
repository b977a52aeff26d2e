//! HTTP Snapshot Transport (spec.md §4.6): client and server halves of the
//! bidirectional snapshot-streaming protocol. The server lives here as an
//! `axum::Router`; the client half (`HttpPeerClient`) lives under
//! `crate::replication::client` since it's only ever used by the
//! Replication Engine, not by anything transport-internal.

pub mod auth;
pub mod server;
pub mod stream;
pub mod typed_header;
pub mod validate;

pub use server::{router, AppState};
