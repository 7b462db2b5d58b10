//! # StudySync Sync Engine
//!
//! Outbox, conflict store and sync engine for StudySync.
//!
//! This crate provides:
//! - A durable outbox of local mutations with per-record ordering
//! - Conditional push with retry, exponential backoff and escalation
//! - Paged pull since a persisted cursor
//! - Durable conflicts with local/remote resolution
//! - Connectivity monitoring and automatic sync on reconnect
//! - HTTP transport abstraction and an in-memory remote for tests
//!
//! ## Architecture
//!
//! The engine implements a **push-then-pull** cycle:
//! 1. Drain the outbox: each change is pushed with the revision it was based on
//! 2. Accepted changes update the local revision; rejected ones become conflicts
//! 3. Pull remote changes since the cursor, skipping records with pending edits
//!
//! Engine state lives in reserved `_`-prefixed tables of the same
//! [`LocalStore`](studysync_store::LocalStore) that holds app data.
//!
//! ## Key Invariants
//!
//! - Changes for one record reach the remote in the order they were made
//! - A change leaves the outbox only when acknowledged or retired by a resolution
//! - A pending local edit is never overwritten by a pull
//! - Equal revisions are never merged silently

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod auto_sync;
mod clock;
mod config;
mod conflict_store;
mod error;
mod http;
mod listeners;
mod network;
mod outbox;
mod remote;
mod state;
mod system;
mod transport;

pub use auto_sync::AutoSync;
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{NetworkConfig, RetryConfig, SyncConfig};
pub use conflict_store::ConflictStore;
pub use error::{SyncError, SyncResult};
pub use http::{HttpClient, HttpError, HttpTransport, LoopbackClient, LoopbackServer};
pub use listeners::{ListenerId, Listeners};
pub use network::{
    effective_type_for, ConnectionType, ConnectivityProbe, NetworkEvent, NetworkStatus,
    NetworkStatusService, ProbeResult, StaticProbe, TransportProbe,
};
pub use outbox::Outbox;
pub use remote::InMemoryRemote;
pub use state::{SyncEngine, SyncEvent, SyncEventKind, SyncHealth, SyncReport, SyncStatus};
pub use system::{CONFLICTS_TABLE, META_TABLE, OUTBOX_TABLE};
pub use transport::{MockReply, MockTransport, SyncTransport};
