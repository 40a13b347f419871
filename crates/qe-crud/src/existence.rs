//! Existence index
//!
//! One row per stored occurrence of a (field, value, contention slot) tag.
//! Rows are created on insert and never touched again by the write path.

use qe_core::{QeError, QeResult};
use qe_crypto::{Existence, TagToken, ValueToken};

use crate::index::{encrypted_row, read_u64, IndexCollection};
use crate::store::QueryInterface;

/// Row content type. Only `Normal` rows are written here; the compactor
/// owns the others.
const NORMAL_ROW: u64 = 0;

/// Decrypted content of an existence row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExistenceEntry {
    pub position: u64,
}

pub struct ExistenceIndex<'a> {
    rows: IndexCollection<'a>,
}

impl<'a> ExistenceIndex<'a> {
    pub fn new(store: &'a dyn QueryInterface, collection: &'a str, max_retries: u32) -> Self {
        Self {
            rows: IndexCollection {
                store,
                name: collection,
                max_retries,
            },
        }
    }

    /// Number of occurrences recorded for `tag`.
    pub fn count(&self, tag: &TagToken<Existence>) -> QeResult<u64> {
        self.rows.count(tag)
    }

    /// Append an occurrence and return its position. `hint` is tried first;
    /// collisions fall back to `count + 1`.
    pub fn insert(
        &self,
        tag: &TagToken<Existence>,
        value: &ValueToken<Existence>,
        hint: Option<u64>,
    ) -> QeResult<u64> {
        self.rows.append(tag, hint, |position| {
            let mut plaintext = NORMAL_ROW.to_le_bytes().to_vec();
            plaintext.extend_from_slice(&position.to_le_bytes());
            encrypted_row(tag, value, position, &plaintext)
        })
    }

    /// `None` when no row exists at `position`.
    pub fn read(
        &self,
        tag: &TagToken<Existence>,
        value: &ValueToken<Existence>,
        position: u64,
    ) -> QeResult<Option<ExistenceEntry>> {
        let Some(plaintext) = self.rows.read_value(tag, value, position)? else {
            return Ok(None);
        };
        let row_type = read_u64(&plaintext, 0)?;
        let stored = read_u64(&plaintext, 1)?;
        if row_type != NORMAL_ROW || stored != position {
            return Err(QeError::DecryptionFailed(format!(
                "existence row at position {position} holds type {row_type} position {stored}"
            )));
        }
        Ok(Some(ExistenceEntry { position }))
    }
}
