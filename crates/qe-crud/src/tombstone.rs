//! Tombstone index
//!
//! Records that the occurrence at some existence position is gone. Tombstones
//! have their own per-tag positions, counted the same way as existence rows.
//! Each delete writes a single-position range; merging ranges is left to the
//! compactor.

use qe_core::{QeError, QeResult};
use qe_crypto::{TagToken, Tombstone, ValueToken};

use crate::index::{encrypted_row, read_u64, IndexCollection};
use crate::store::QueryInterface;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TombstoneValueType {
    Normal,
    /// Written by the compactor in place of a merged range
    CompactionPlaceholder,
}

impl TombstoneValueType {
    fn code(self) -> u64 {
        match self {
            TombstoneValueType::Normal => 0,
            TombstoneValueType::CompactionPlaceholder => 1,
        }
    }

    fn from_code(code: u64) -> QeResult<Self> {
        match code {
            0 => Ok(TombstoneValueType::Normal),
            1 => Ok(TombstoneValueType::CompactionPlaceholder),
            other => Err(QeError::DecryptionFailed(format!("unknown tombstone type {other}"))),
        }
    }
}

/// Decrypted content of a tombstone row: the deleted existence positions
/// `start..=end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TombstoneEntry {
    pub value_type: TombstoneValueType,
    pub start: u64,
    pub end: u64,
}

impl TombstoneEntry {
    fn encode(&self) -> Vec<u8> {
        [self.value_type.code(), self.start, self.end]
            .iter()
            .flat_map(|n| n.to_le_bytes())
            .collect()
    }

    fn decode(bytes: &[u8]) -> QeResult<Self> {
        Ok(Self {
            value_type: TombstoneValueType::from_code(read_u64(bytes, 0)?)?,
            start: read_u64(bytes, 1)?,
            end: read_u64(bytes, 2)?,
        })
    }
}

pub struct TombstoneIndex<'a> {
    rows: IndexCollection<'a>,
}

impl<'a> TombstoneIndex<'a> {
    pub fn new(store: &'a dyn QueryInterface, collection: &'a str, max_retries: u32) -> Self {
        Self {
            rows: IndexCollection {
                store,
                name: collection,
                max_retries,
            },
        }
    }

    pub fn count(&self, tag: &TagToken<Tombstone>) -> QeResult<u64> {
        self.rows.count(tag)
    }

    /// Record the deletion of the occurrence at `existence_position`; returns
    /// the tombstone's own position.
    pub fn tombstone(
        &self,
        tag: &TagToken<Tombstone>,
        value: &ValueToken<Tombstone>,
        existence_position: u64,
    ) -> QeResult<u64> {
        let entry = TombstoneEntry {
            value_type: TombstoneValueType::Normal,
            start: existence_position,
            end: existence_position,
        };
        self.rows.append(tag, None, |position| {
            encrypted_row(tag, value, position, &entry.encode())
        })
    }

    pub fn read(
        &self,
        tag: &TagToken<Tombstone>,
        value: &ValueToken<Tombstone>,
        position: u64,
    ) -> QeResult<Option<TombstoneEntry>> {
        self.rows
            .read_value(tag, value, position)?
            .map(|plaintext| TombstoneEntry::decode(&plaintext))
            .transpose()
    }
}
