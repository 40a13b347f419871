//! Encrypted field payloads
//!
//! Every encrypted value travels as `Value::Encrypted(blob)`; the first byte
//! of the blob is its subtype:
//!
//! ```text
//! 3  placeholder         [3][json body]
//! 4  insert/update       [4][index key id 16][user key id 16][type 1][slot 8]
//!                        [data 32][existence 32][tombstone 32][server 32]
//!                        [u32 len][encrypted compaction tokens][ciphertext ...]
//! 7  stored (indexed)    [7][index key id 16][type 1]
//!                        [XChaCha20-Poly1305(server token, aad = id‖type,
//!                           user key id‖position‖slot‖data‖existence‖tombstone‖ciphertext)]
//! ```
//!
//! The server only ever sees subtypes 4 and 7. It can derive index tags from a
//! type-4 payload, and with a delete token it can open a type-7 value to find
//! the tombstone token and existence position of what it is deleting, but it
//! never holds the user key needed to read the ciphertext.

use qe_core::config::QueryType;
use qe_core::{Document, QeError, QeResult, Value, ValueType};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::aead::{decrypt_randomized, encrypt_randomized};
use crate::tokens::{
    CompactionToken, ContentionToken, Data, Existence, SafeContentMarker, ServerDataLevel1Token,
    TagToken, Tombstone, ValueToken,
};
use crate::wire::{Reader, Writer};

/// Leading byte of an encrypted blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EncryptedSubtype {
    Placeholder = 3,
    InsertUpdate = 4,
    IndexedEquality = 7,
}

impl EncryptedSubtype {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn of(blob: &[u8]) -> QeResult<Self> {
        match blob.first() {
            Some(3) => Ok(EncryptedSubtype::Placeholder),
            Some(4) => Ok(EncryptedSubtype::InsertUpdate),
            Some(7) => Ok(EncryptedSubtype::IndexedEquality),
            Some(other) => Err(QeError::invalid(format!("unknown encrypted subtype {other}"))),
            None => Err(QeError::invalid("empty encrypted value")),
        }
    }

    fn body_of(self, blob: &[u8]) -> QeResult<&[u8]> {
        let found = Self::of(blob)?;
        if found != self {
            return Err(QeError::invalid(format!("expected {self:?} payload, found {found:?}")));
        }
        Ok(&blob[1..])
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlaceholderKind {
    Insert,
    Find,
}

/// Intent-to-encrypt marker written by the client application in place of
/// a plaintext value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionPlaceholder {
    pub kind: PlaceholderKind,
    pub algorithm: QueryType,
    pub index_key_id: Uuid,
    pub user_key_id: Uuid,
    pub value: Value,
    #[serde(default)]
    pub max_contention: u64,
}

impl EncryptionPlaceholder {
    pub fn insert(index_key_id: Uuid, user_key_id: Uuid, value: impl Into<Value>, max_contention: u64) -> Self {
        Self {
            kind: PlaceholderKind::Insert,
            algorithm: QueryType::Equality,
            index_key_id,
            user_key_id,
            value: value.into(),
            max_contention,
        }
    }

    pub fn to_blob(&self) -> QeResult<Vec<u8>> {
        let body = serde_json::to_vec(self)
            .map_err(|e| QeError::invalid(format!("serializing placeholder: {e}")))?;
        Ok(Writer::new()
            .u8(EncryptedSubtype::Placeholder.code())
            .bytes(&body)
            .finish())
    }

    pub fn from_blob(blob: &[u8]) -> QeResult<Self> {
        let body = EncryptedSubtype::Placeholder.body_of(blob)?;
        serde_json::from_slice(body).map_err(|e| QeError::invalid(format!("malformed placeholder: {e}")))
    }

    pub fn to_value(&self) -> QeResult<Value> {
        Ok(Value::Encrypted(self.to_blob()?))
    }
}

/// What the client sends for one encrypted field of an insert or update.
#[derive(Debug, Clone, PartialEq)]
pub struct InsertUpdatePayload {
    pub index_key_id: Uuid,
    pub user_key_id: Uuid,
    pub value_type: ValueType,
    pub contention_slot: u64,
    pub data_token: ContentionToken<Data>,
    pub existence_token: ContentionToken<Existence>,
    pub tombstone_token: ContentionToken<Tombstone>,
    pub server_token: ServerDataLevel1Token,
    /// Existence + tombstone contention tokens under the compaction token
    pub encrypted_tokens: Vec<u8>,
    /// Field value under the user key
    pub ciphertext: Vec<u8>,
}

impl InsertUpdatePayload {
    pub fn to_blob(&self) -> QeResult<Vec<u8>> {
        let mut w = Writer::new();
        w.u8(EncryptedSubtype::InsertUpdate.code())
            .uuid(&self.index_key_id)
            .uuid(&self.user_key_id)
            .u8(self.value_type.code())
            .u64(self.contention_slot)
            .bytes(self.data_token.as_bytes())
            .bytes(self.existence_token.as_bytes())
            .bytes(self.tombstone_token.as_bytes())
            .bytes(self.server_token.as_bytes())
            .prefixed(&self.encrypted_tokens)?
            .bytes(&self.ciphertext);
        Ok(w.finish())
    }

    pub fn from_blob(blob: &[u8]) -> QeResult<Self> {
        let mut r = Reader::new(EncryptedSubtype::InsertUpdate.body_of(blob)?, "insert/update payload");
        let payload = Self {
            index_key_id: r.uuid()?,
            user_key_id: r.uuid()?,
            value_type: ValueType::from_code(r.u8()?)?,
            contention_slot: r.u64()?,
            data_token: ContentionToken::from_bytes(r.token()?),
            existence_token: ContentionToken::from_bytes(r.token()?),
            tombstone_token: ContentionToken::from_bytes(r.token()?),
            server_token: ServerDataLevel1Token::from_bytes(r.token()?),
            encrypted_tokens: r.prefixed()?.to_vec(),
            ciphertext: r.rest().to_vec(),
        };
        if payload.ciphertext.is_empty() {
            return Err(QeError::invalid("insert/update payload carries no ciphertext"));
        }
        Ok(payload)
    }

    pub fn to_value(&self) -> QeResult<Value> {
        Ok(Value::Encrypted(self.to_blob()?))
    }

    pub fn existence_tag(&self) -> QeResult<TagToken<Existence>> {
        self.existence_token.tag()
    }

    pub fn existence_value(&self) -> QeResult<ValueToken<Existence>> {
        self.existence_token.value()
    }

    pub fn safe_content_marker(&self, position: u64) -> QeResult<SafeContentMarker> {
        self.data_token.tag()?.safe_content_marker(position)
    }
}

/// A field value as stored in the primary collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedValue {
    pub index_key_id: Uuid,
    pub value_type: ValueType,
    sealed: Vec<u8>,
}

/// Contents of an [`IndexedValue`] once opened with the server token.
#[derive(Debug, Clone, PartialEq)]
pub struct SealedFields {
    pub user_key_id: Uuid,
    /// Existence-index position assigned when the value was written
    pub position: u64,
    pub contention_slot: u64,
    pub data_token: ContentionToken<Data>,
    pub existence_token: ContentionToken<Existence>,
    pub tombstone_token: ContentionToken<Tombstone>,
    pub ciphertext: Vec<u8>,
}

impl SealedFields {
    pub fn safe_content_marker(&self) -> QeResult<SafeContentMarker> {
        self.data_token.tag()?.safe_content_marker(self.position)
    }

    pub fn existence_tag(&self) -> QeResult<TagToken<Existence>> {
        self.existence_token.tag()
    }

    pub fn tombstone_tag(&self) -> QeResult<TagToken<Tombstone>> {
        self.tombstone_token.tag()
    }

    pub fn tombstone_value(&self) -> QeResult<ValueToken<Tombstone>> {
        self.tombstone_token.value()
    }
}

impl IndexedValue {
    /// Bind a payload to the existence position the server assigned it.
    pub fn seal(payload: &InsertUpdatePayload, position: u64) -> QeResult<Self> {
        let plaintext = Writer::new()
            .uuid(&payload.user_key_id)
            .u64(position)
            .u64(payload.contention_slot)
            .bytes(payload.data_token.as_bytes())
            .bytes(payload.existence_token.as_bytes())
            .bytes(payload.tombstone_token.as_bytes())
            .bytes(&payload.ciphertext)
            .finish();
        let aad = Self::aad(&payload.index_key_id, payload.value_type);
        let sealed = encrypt_randomized(payload.server_token.as_bytes(), &plaintext, &aad)?;
        Ok(Self {
            index_key_id: payload.index_key_id,
            value_type: payload.value_type,
            sealed,
        })
    }

    pub fn open(&self, server_token: &ServerDataLevel1Token) -> QeResult<SealedFields> {
        let aad = Self::aad(&self.index_key_id, self.value_type);
        let plaintext = decrypt_randomized(server_token.as_bytes(), &self.sealed, &aad)?;
        let mut r = Reader::new(&plaintext, "stored value");
        Ok(SealedFields {
            user_key_id: r.uuid()?,
            position: r.u64()?,
            contention_slot: r.u64()?,
            data_token: ContentionToken::from_bytes(r.token()?),
            existence_token: ContentionToken::from_bytes(r.token()?),
            tombstone_token: ContentionToken::from_bytes(r.token()?),
            ciphertext: r.rest().to_vec(),
        })
    }

    pub fn to_blob(&self) -> Vec<u8> {
        Writer::new()
            .u8(EncryptedSubtype::IndexedEquality.code())
            .uuid(&self.index_key_id)
            .u8(self.value_type.code())
            .bytes(&self.sealed)
            .finish()
    }

    pub fn from_blob(blob: &[u8]) -> QeResult<Self> {
        let mut r = Reader::new(EncryptedSubtype::IndexedEquality.body_of(blob)?, "stored value");
        let index_key_id = r.uuid()?;
        let value_type = ValueType::from_code(r.u8()?)?;
        let sealed = r.rest().to_vec();
        if sealed.is_empty() {
            return Err(QeError::invalid("stored value has no sealed body"));
        }
        Ok(Self {
            index_key_id,
            value_type,
            sealed,
        })
    }

    pub fn to_value(&self) -> Value {
        Value::Encrypted(self.to_blob())
    }

    fn aad(index_key_id: &Uuid, value_type: ValueType) -> Vec<u8> {
        Writer::new().uuid(index_key_id).u8(value_type.code()).finish()
    }
}

/// Token material recorded in the compaction journal for one field instance.
///
/// Insert records carry both contention tokens; delete records only the
/// tombstone one.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactionRecord {
    pub existence_token: Option<ContentionToken<Existence>>,
    pub tombstone_token: ContentionToken<Tombstone>,
}

const COMPACTION_AAD: &[u8] = b"qe-compaction-record";

impl CompactionRecord {
    pub fn encrypt(&self, compaction: &CompactionToken) -> QeResult<Vec<u8>> {
        let mut w = Writer::new();
        match &self.existence_token {
            Some(existence) => w.u8(1).bytes(existence.as_bytes()),
            None => w.u8(0),
        };
        w.bytes(self.tombstone_token.as_bytes());
        encrypt_randomized(compaction.as_bytes(), &w.finish(), COMPACTION_AAD)
    }

    pub fn decrypt(compaction: &CompactionToken, encrypted: &[u8]) -> QeResult<Self> {
        let plaintext = decrypt_randomized(compaction.as_bytes(), encrypted, COMPACTION_AAD)?;
        let mut r = Reader::new(&plaintext, "compaction record");
        let existence_token = match r.u8()? {
            0 => None,
            1 => Some(ContentionToken::from_bytes(r.token()?)),
            other => return Err(QeError::invalid(format!("bad compaction record flag {other}"))),
        };
        let tombstone_token = ContentionToken::from_bytes(r.token()?);
        r.expect_end()?;
        Ok(Self {
            existence_token,
            tombstone_token,
        })
    }
}

/// An insert/update payload found at `path` in a client document.
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedFieldValue {
    pub path: String,
    pub payload: InsertUpdatePayload,
}

/// Extract every insert/update payload from a client document.
///
/// Any other encrypted subtype is rejected: placeholders must be transformed
/// by the client first, and stored values cannot be written back verbatim.
pub fn collect_insert_payloads(doc: &Document) -> QeResult<Vec<EncryptedFieldValue>> {
    doc.encrypted_fields()
        .into_iter()
        .map(|(path, blob)| match EncryptedSubtype::of(blob)? {
            EncryptedSubtype::InsertUpdate => Ok(EncryptedFieldValue {
                payload: InsertUpdatePayload::from_blob(blob)?,
                path,
            }),
            other => Err(QeError::invalid(format!(
                "field '{path}' carries a {other:?} value; only insert/update payloads can be written"
            ))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyMaterial;
    use crate::tokens::{derive_contention_token, CollectionsLevel1Token};

    fn payload() -> InsertUpdatePayload {
        let key = KeyMaterial::from_bytes([3u8; 96]);
        let value = b"\x02secret";
        InsertUpdatePayload {
            index_key_id: Uuid::from_u128(1),
            user_key_id: Uuid::from_u128(2),
            value_type: ValueType::String,
            contention_slot: 0,
            data_token: derive_contention_token(&key, value, 0).unwrap(),
            existence_token: derive_contention_token(&key, value, 0).unwrap(),
            tombstone_token: derive_contention_token(&key, value, 0).unwrap(),
            server_token: ServerDataLevel1Token::derive(&key).unwrap(),
            encrypted_tokens: vec![9; 40],
            ciphertext: vec![1, 2, 3, 4],
        }
    }

    #[test]
    fn test_subtype_dispatch() {
        assert_eq!(EncryptedSubtype::of(&[4, 0]).unwrap(), EncryptedSubtype::InsertUpdate);
        assert!(EncryptedSubtype::of(&[]).is_err());
        assert!(EncryptedSubtype::of(&[5]).is_err());
    }

    #[test]
    fn test_placeholder_blob() {
        let placeholder = EncryptionPlaceholder::insert(Uuid::from_u128(1), Uuid::from_u128(2), "secret", 4);
        let blob = placeholder.to_blob().unwrap();
        assert_eq!(blob[0], 3);
        assert_eq!(EncryptionPlaceholder::from_blob(&blob).unwrap(), placeholder);
        assert!(InsertUpdatePayload::from_blob(&blob).is_err());
    }

    #[test]
    fn test_payload_blob() {
        let original = payload();
        let blob = original.to_blob().unwrap();
        assert_eq!(blob[0], 4);
        assert_eq!(InsertUpdatePayload::from_blob(&blob).unwrap(), original);
        assert!(InsertUpdatePayload::from_blob(&blob[..60]).is_err());
    }

    #[test]
    fn test_seal_and_open() {
        let payload = payload();
        let stored = IndexedValue::seal(&payload, 5).unwrap();
        let reparsed = IndexedValue::from_blob(&stored.to_blob()).unwrap();
        assert_eq!(reparsed, stored);

        let fields = reparsed.open(&payload.server_token).unwrap();
        assert_eq!(fields.position, 5);
        assert_eq!(fields.user_key_id, payload.user_key_id);
        assert_eq!(fields.ciphertext, payload.ciphertext);
        assert_eq!(fields.tombstone_token, payload.tombstone_token);
        assert_eq!(
            fields.safe_content_marker().unwrap(),
            payload.safe_content_marker(5).unwrap()
        );
    }

    #[test]
    fn test_open_with_wrong_server_token_fails() {
        let stored = IndexedValue::seal(&payload(), 1).unwrap();
        let other = ServerDataLevel1Token::derive(&KeyMaterial::from_bytes([4u8; 96])).unwrap();
        assert!(matches!(stored.open(&other), Err(QeError::DecryptionFailed(_))));
    }

    #[test]
    fn test_compaction_record() {
        let key = KeyMaterial::from_bytes([5u8; 96]);
        let compaction = CollectionsLevel1Token::derive(&key).unwrap().compaction().unwrap();
        let p = payload();

        let insert = CompactionRecord {
            existence_token: Some(p.existence_token.clone()),
            tombstone_token: p.tombstone_token.clone(),
        };
        let delete = CompactionRecord {
            existence_token: None,
            tombstone_token: p.tombstone_token.clone(),
        };
        for record in [insert, delete] {
            let encrypted = record.encrypt(&compaction).unwrap();
            assert_eq!(CompactionRecord::decrypt(&compaction, &encrypted).unwrap(), record);
        }
    }

    #[test]
    fn test_collect_rejects_non_payloads() {
        let p = payload();
        let doc = Document::new()
            .with("_id", 1)
            .with("plain", "x")
            .with("nested", Document::new().with("enc", p.to_value().unwrap()));
        let found = collect_insert_payloads(&doc).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].path, "nested.enc");

        let placeholder = EncryptionPlaceholder::insert(Uuid::nil(), Uuid::nil(), 1, 0);
        let bad = Document::new().with("enc", placeholder.to_value().unwrap());
        assert!(collect_insert_payloads(&bad).is_err());

        let stored = Document::new().with("enc", IndexedValue::seal(&p, 1).unwrap().to_value());
        assert!(collect_insert_payloads(&stored).is_err());
    }
}
