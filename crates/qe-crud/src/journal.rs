//! Compaction journal
//!
//! Append-only log of the tokens touched by every write, one row per
//! encrypted field instance. The offline compactor replays it to merge
//! index rows; the write path only ever appends.

use qe_core::{Document, QeError, QeResult, Value, ID_FIELD};
use qe_crypto::{CompactionRecord, CompactionToken, ContentionToken, Tombstone};
use uuid::Uuid;

use crate::index::VALUE_FIELD;
use crate::store::QueryInterface;

const FIELD_NAME: &str = "fieldName";

pub struct CompactionJournal<'a> {
    store: &'a dyn QueryInterface,
    collection: &'a str,
}

impl<'a> CompactionJournal<'a> {
    pub fn new(store: &'a dyn QueryInterface, collection: &'a str) -> Self {
        Self { store, collection }
    }

    /// Record an inserted value. The token pair was already encrypted by the
    /// client under the field's compaction token.
    pub fn append_insert(&self, path: &str, encrypted_tokens: &[u8]) -> QeResult<()> {
        self.append(path, encrypted_tokens.to_vec())
    }

    /// Record a removed value.
    pub fn append_delete(
        &self,
        path: &str,
        compaction: &CompactionToken,
        tombstone_token: &ContentionToken<Tombstone>,
    ) -> QeResult<()> {
        let record = CompactionRecord {
            existence_token: None,
            tombstone_token: tombstone_token.clone(),
        };
        self.append(path, record.encrypt(compaction)?)
    }

    fn append(&self, path: &str, value: Vec<u8>) -> QeResult<()> {
        let row = Document::new()
            .with(ID_FIELD, Uuid::new_v4().to_string())
            .with(FIELD_NAME, path)
            .with(VALUE_FIELD, Value::Binary(value));
        self.store.insert_document(self.collection, row, true)?;
        tracing::debug!(collection = self.collection, path, "appended journal record");
        Ok(())
    }
}

/// A journal row read back from storage.
#[derive(Debug, Clone, PartialEq)]
pub struct JournalRecord {
    pub id: String,
    pub field_name: String,
    pub value: Vec<u8>,
}

impl JournalRecord {
    pub fn from_document(doc: &Document) -> QeResult<Self> {
        let malformed = |what: &str| QeError::invalid(format!("journal row has no {what}"));
        Ok(Self {
            id: match doc.id() {
                Some(Value::String(id)) => id.clone(),
                _ => return Err(malformed("string _id")),
            },
            field_name: match doc.get(FIELD_NAME) {
                Some(Value::String(name)) => name.clone(),
                _ => return Err(malformed(FIELD_NAME)),
            },
            value: match doc.get(VALUE_FIELD) {
                Some(Value::Binary(bytes)) => bytes.clone(),
                _ => return Err(malformed("binary value")),
            },
        })
    }

    pub fn decrypt(&self, compaction: &CompactionToken) -> QeResult<CompactionRecord> {
        CompactionRecord::decrypt(compaction, &self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use qe_crypto::{derive_contention_token, CollectionsLevel1Token, KeyMaterial};

    #[test]
    fn test_delete_record_roundtrip() {
        let key = KeyMaterial::from_bytes([4u8; 96]);
        let compaction = CollectionsLevel1Token::derive(&key).unwrap().compaction().unwrap();
        let tombstone = derive_contention_token::<Tombstone>(&key, b"\x02secret", 0).unwrap();

        let store = MemoryStore::new();
        let journal = CompactionJournal::new(&store, "ecoc");
        journal.append_delete("encrypted", &compaction, &tombstone).unwrap();
        journal.append_insert("other", b"opaque").unwrap();

        let rows = store.documents("ecoc").unwrap();
        assert_eq!(rows.len(), 2);
        let records: Vec<_> = rows
            .iter()
            .map(|doc| JournalRecord::from_document(doc).unwrap())
            .collect();

        let delete = records.iter().find(|r| r.field_name == "encrypted").unwrap();
        assert!(Uuid::parse_str(&delete.id).is_ok());
        let decrypted = delete.decrypt(&compaction).unwrap();
        assert_eq!(decrypted.existence_token, None);
        assert_eq!(decrypted.tombstone_token, tombstone);

        let insert = records.iter().find(|r| r.field_name == "other").unwrap();
        assert_eq!(insert.value, b"opaque");
        assert!(insert.decrypt(&compaction).is_err());
    }

    #[test]
    fn test_malformed_row() {
        let doc = Document::new().with("_id", 1);
        assert!(JournalRecord::from_document(&doc).is_err());
    }
}
