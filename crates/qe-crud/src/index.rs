//! Shared mechanics of the auxiliary indexes
//!
//! Both the existence and the tombstone index store rows whose `_id` is
//! `PRF(tag, position)` for positions `1, 2, 3, ...` with no gaps. The
//! per-tag count is therefore recoverable from the rows alone: probe
//! exponentially for the first missing position, then binary-search the last
//! gap. Appends race through the unique `_id` constraint: a loser recounts and
//! tries the next position.

use qe_core::{Document, QeError, QeResult, Value, ID_FIELD};
use qe_crypto::{IndexKind, TagToken, ValueToken};

use crate::store::{QueryInterface, StoreError};

pub(crate) const VALUE_FIELD: &str = "value";

pub(crate) struct IndexCollection<'a> {
    pub store: &'a dyn QueryInterface,
    pub name: &'a str,
    pub max_retries: u32,
}

impl<'a> IndexCollection<'a> {
    fn exists<K: IndexKind>(&self, tag: &TagToken<K>, position: u64) -> QeResult<bool> {
        let id = Value::Binary(tag.row_id(position)?.to_vec());
        Ok(self.store.get_by_id(self.name, &id)?.is_some())
    }

    /// Highest occupied position for `tag`, 0 when there are none.
    pub fn count<K: IndexKind>(&self, tag: &TagToken<K>) -> QeResult<u64> {
        if !self.exists(tag, 1)? {
            return Ok(0);
        }

        let (mut lo, mut hi) = (1u64, 2u64);
        while self.exists(tag, hi)? {
            lo = hi;
            hi = hi
                .checked_mul(2)
                .ok_or_else(|| QeError::StorageFailure(format!("{} count overflow", self.name)))?;
        }

        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            if self.exists(tag, mid)? {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Write the row built by `make_row` at the hinted position (or
    /// `count + 1`), recounting after every id collision.
    pub fn append<K: IndexKind>(
        &self,
        tag: &TagToken<K>,
        hint: Option<u64>,
        make_row: impl Fn(u64) -> QeResult<Document>,
    ) -> QeResult<u64> {
        let mut position = match hint {
            Some(position) => position,
            None => self.count(tag)? + 1,
        };

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                position = self.count(tag)? + 1;
            }
            match self.store.insert_document(self.name, make_row(position)?, true) {
                Ok(()) => {
                    tracing::debug!(collection = self.name, kind = K::NAME, position, attempt, "appended index row");
                    return Ok(position);
                }
                Err(StoreError::DuplicateKey { .. }) => {
                    tracing::warn!(
                        collection = self.name,
                        kind = K::NAME,
                        position,
                        attempt,
                        "index row id taken, recounting"
                    );
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(QeError::StorageFailure(format!(
            "{}: no free position after {} retries",
            self.name, self.max_retries
        )))
    }

    /// Fetch the row at `position` and decrypt its value field.
    pub fn read_value<K: IndexKind>(
        &self,
        tag: &TagToken<K>,
        value_token: &ValueToken<K>,
        position: u64,
    ) -> QeResult<Option<Vec<u8>>> {
        let row_id = tag.row_id(position)?;
        let Some(row) = self.store.get_by_id(self.name, &Value::Binary(row_id.to_vec()))? else {
            return Ok(None);
        };
        let encrypted = match row.get(VALUE_FIELD) {
            Some(Value::Binary(bytes)) => bytes,
            _ => {
                return Err(QeError::DecryptionFailed(format!(
                    "{} row at position {position} has no binary value",
                    self.name
                )))
            }
        };
        qe_crypto::aead::decrypt_deterministic(value_token.as_bytes(), encrypted, &row_id).map(Some)
    }
}

/// `{ _id: Binary(rowId), value: Binary(AEAD(valueToken, aad = rowId, plaintext)) }`
pub(crate) fn encrypted_row<K: IndexKind>(
    tag: &TagToken<K>,
    value_token: &ValueToken<K>,
    position: u64,
    plaintext: &[u8],
) -> QeResult<Document> {
    let row_id = tag.row_id(position)?;
    let value = qe_crypto::aead::encrypt_deterministic(value_token.as_bytes(), plaintext, &row_id)?;
    Ok(Document::new()
        .with(ID_FIELD, Value::Binary(row_id.to_vec()))
        .with(VALUE_FIELD, Value::Binary(value)))
}

pub(crate) fn read_u64(bytes: &[u8], index: usize) -> QeResult<u64> {
    bytes
        .get(index * 8..index * 8 + 8)
        .and_then(|b| b.try_into().ok())
        .map(u64::from_le_bytes)
        .ok_or_else(|| QeError::DecryptionFailed("index row content truncated".into()))
}
