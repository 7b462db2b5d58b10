//! # StudySync Sync Protocol
//!
//! Sync protocol types and JSON codecs for StudySync.
//!
//! This crate provides:
//! - `PendingChange` for outbox entries and their push state machine
//! - `SyncConflict` for durable conflict records
//! - Protocol messages (conditional push, pull since cursor)
//! - JSON encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod messages;
mod operation;

pub use conflict::{ConflictKind, Resolution, ResolutionStrategy, SyncConflict};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    PullRequest, PullResponse, PushRequest, PushResponse, RemoteChange, RemoteVersion,
    WireMessage,
};
pub use operation::{ChangeOp, FailOutcome, PendingChange, PushState};
