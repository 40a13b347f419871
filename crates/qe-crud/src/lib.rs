//! qe-crud: server-side write path for encrypted collections
//!
//! The server never holds a key. It works from the tokens clients send:
//! - `existence`: one row per stored occurrence of an encrypted value
//! - `tombstone`: one row per removed occurrence
//! - `journal`: append-only token log for the offline compactor
//! - `safety`: keeps clients away from the safe-content array
//! - `crud`: insert / update / delete orchestration over the above
//! - `store`: the storage collaborator trait and an in-memory implementation

pub mod crud;
pub mod existence;
mod index;
pub mod journal;
pub mod safety;
pub mod store;
pub mod tombstone;

pub use crud::{
    process_delete, process_insert, process_update, DeleteOpEntry, DeleteOutcome, DeleteRequest,
    InsertOutcome, UpdateOpEntry, UpdateOutcome, UpdateRequest,
};
pub use existence::{ExistenceEntry, ExistenceIndex};
pub use journal::{CompactionJournal, JournalRecord};
pub use safety::strip_safe_content;
pub use store::{MemoryStore, QueryInterface, StoreError, StoreResult};
pub use tombstone::{TombstoneEntry, TombstoneIndex, TombstoneValueType};
