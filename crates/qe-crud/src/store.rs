//! Storage collaborator
//!
//! The write path never talks to a database directly. It goes through
//! [`QueryInterface`], which offers the handful of single-document primitives
//! the protocols need. Every call is atomic with respect to other calls on the
//! same store; nothing stronger is assumed.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use qe_core::{Document, QeError, UpdateModifier, Value, ID_FIELD};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Unique `_id` constraint violated
    #[error("duplicate key in collection {collection}")]
    DuplicateKey { collection: String },

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl From<StoreError> for QeError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::DuplicateKey { collection } => QeError::DuplicateKey {
                collection,
                code: None,
            },
            StoreError::Backend(msg) => QeError::StorageFailure(msg),
        }
    }
}

/// Single-document storage primitives used by the write path.
pub trait QueryInterface: Send + Sync {
    fn get_by_id(&self, collection: &str, id: &Value) -> StoreResult<Option<Document>>;

    fn count_documents(&self, collection: &str) -> StoreResult<u64>;

    /// Insert `doc`. A duplicate `_id` is reported as [`StoreError::DuplicateKey`]
    /// when `translate_duplicate_key` is set, and as a backend error otherwise.
    fn insert_document(
        &self,
        collection: &str,
        doc: Document,
        translate_duplicate_key: bool,
    ) -> StoreResult<()>;

    /// Delete the document with `_id == id`, returning it.
    fn delete_with_preimage(&self, collection: &str, id: &Value) -> StoreResult<Option<Document>>;

    /// Apply `modifier` to the document with `_id == id`, returning the
    /// document as it was before the update.
    fn update_with_preimage(
        &self,
        collection: &str,
        id: &Value,
        modifier: &UpdateModifier,
    ) -> StoreResult<Option<Document>>;
}

type Collection = BTreeMap<Vec<u8>, Document>;

/// In-memory store: one ordered map per collection, keyed by the canonical
/// bytes of `_id`, behind a single lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Collection>>,
}

fn id_key(id: &Value) -> StoreResult<Vec<u8>> {
    id.to_canonical_bytes()
        .map_err(|e| StoreError::Backend(format!("unsupported _id: {e}")))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, HashMap<String, Collection>>> {
        self.collections
            .lock()
            .map_err(|_| StoreError::Backend("store lock poisoned".into()))
    }

    /// All documents of a collection in `_id` order.
    pub fn documents(&self, collection: &str) -> StoreResult<Vec<Document>> {
        Ok(self
            .lock()?
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }
}

impl QueryInterface for MemoryStore {
    fn get_by_id(&self, collection: &str, id: &Value) -> StoreResult<Option<Document>> {
        let key = id_key(id)?;
        Ok(self
            .lock()?
            .get(collection)
            .and_then(|docs| docs.get(&key))
            .cloned())
    }

    fn count_documents(&self, collection: &str) -> StoreResult<u64> {
        Ok(self.lock()?.get(collection).map_or(0, |docs| docs.len() as u64))
    }

    fn insert_document(
        &self,
        collection: &str,
        doc: Document,
        translate_duplicate_key: bool,
    ) -> StoreResult<()> {
        let id = doc
            .id()
            .ok_or_else(|| StoreError::Backend(format!("document for {collection} has no {ID_FIELD}")))?;
        let key = id_key(id)?;

        let mut collections = self.lock()?;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(&key) {
            return Err(if translate_duplicate_key {
                StoreError::DuplicateKey {
                    collection: collection.to_string(),
                }
            } else {
                StoreError::Backend(format!("E11000 duplicate key error in {collection}"))
            });
        }
        docs.insert(key, doc);
        Ok(())
    }

    fn delete_with_preimage(&self, collection: &str, id: &Value) -> StoreResult<Option<Document>> {
        let key = id_key(id)?;
        Ok(self
            .lock()?
            .get_mut(collection)
            .and_then(|docs| docs.remove(&key)))
    }

    fn update_with_preimage(
        &self,
        collection: &str,
        id: &Value,
        modifier: &UpdateModifier,
    ) -> StoreResult<Option<Document>> {
        let key = id_key(id)?;
        let mut collections = self.lock()?;
        let Some(current) = collections.get_mut(collection).and_then(|docs| docs.get_mut(&key)) else {
            return Ok(None);
        };
        let updated = modifier
            .apply(current)
            .map_err(|e| StoreError::Backend(format!("update failed: {e}")))?;
        Ok(Some(std::mem::replace(current, updated)))
    }
}
