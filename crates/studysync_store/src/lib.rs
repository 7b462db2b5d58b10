//! # StudySync Store
//!
//! The local record store contract the sync and backup engines rely on.
//!
//! Every piece of app data lives in a per-table key/value store keyed by
//! record id. Each [`Record`] carries an `updated_at` revision marker which the
//! sync engine and the merge classifier compare; the store itself never
//! interprets payloads.
//!
//! ## Available Stores
//!
//! - [`InMemoryStore`] - For tests and ephemeral sessions
//! - [`FileStore`] - One JSON file per table in a locked directory
//!
//! ## System tables
//!
//! Tables whose name starts with [`SYSTEM_TABLE_PREFIX`] hold engine state
//! (outbox, conflicts, cursors). They are excluded from backups, table counts
//! and replace imports. Use [`user_tables`] to list only app tables.
//!
//! ## Example
//!
//! ```rust
//! use studysync_store::{InMemoryStore, LocalStore, Record};
//!
//! let store = InMemoryStore::new();
//! store.put(Record::new("tasks", "t1", 10)).unwrap();
//! assert_eq!(store.get("tasks", "t1").unwrap().unwrap().updated_at, 10);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod record;
mod store;

pub use error::{StoreError, StoreResult};
pub use file::FileStore;
pub use memory::InMemoryStore;
pub use record::{is_system_table, Payload, Record, SYSTEM_TABLE_PREFIX};
pub use store::{user_tables, LocalStore};
