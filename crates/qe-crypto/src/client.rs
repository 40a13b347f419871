//! Client-side encryption helpers
//!
//! These run where the keys live: they turn placeholders into insert/update
//! payloads, decrypt stored values, check a document's safe-content array,
//! and hand the server the per-field delete tokens it needs.

use std::collections::{HashMap, HashSet};

use qe_core::config::EncryptionConfig;
use qe_core::{
    Document, EncryptedFieldConfig, QeError, QeResult, UpdateModifier, UpdateOperator, Value,
    ValueType, SAFE_CONTENT_FIELD,
};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use uuid::Uuid;

use crate::aead::{decrypt_randomized, encrypt_randomized};
use crate::keys::{KeyMaterial, KeyVault};
use crate::payload::{
    CompactionRecord, EncryptedSubtype, EncryptionPlaceholder, IndexedValue, InsertUpdatePayload,
    PlaceholderKind,
};
use crate::prf::hkdf_derive;
use crate::tokens::{
    CollectionsLevel1Token, CompactionToken, ContentionToken, Data, DataToken, Existence,
    IndexKind, SafeContentMarker, ServerDataLevel1Token, Tombstone,
};
use crate::KEY_SIZE;

/// Per-session client state: the contention-slot RNG.
pub struct EncryptionContext {
    rng: StdRng,
}

impl EncryptionContext {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_config(config: &EncryptionConfig) -> Self {
        Self::new(config.contention_seed)
    }

    /// Uniform slot in `[0, max_contention]`.
    pub fn contention_slot(&mut self, max_contention: u64) -> u64 {
        match max_contention {
            0 => 0,
            u64::MAX => self.rng.next_u64(),
            max => self.rng.next_u64() % (max + 1),
        }
    }
}

fn value_key(user_key: &KeyMaterial) -> QeResult<[u8; KEY_SIZE]> {
    hkdf_derive(user_key.encryption_key(), b"qe-field-value")
}

fn value_aad(user_key_id: &Uuid, value_type: ValueType) -> Vec<u8> {
    let mut aad = user_key_id.as_bytes().to_vec();
    aad.push(value_type.code());
    aad
}

fn contention_token<K: IndexKind>(
    level1: &CollectionsLevel1Token,
    value: &[u8],
    slot: u64,
) -> QeResult<ContentionToken<K>> {
    let data = DataToken::derive(&level1.collection::<K>()?, value)?;
    ContentionToken::derive(&data, slot)
}

/// Turn an insert placeholder into the payload the server indexes.
pub fn encode_placeholder(
    placeholder: &EncryptionPlaceholder,
    vault: &dyn KeyVault,
    ctx: &mut EncryptionContext,
) -> QeResult<InsertUpdatePayload> {
    if placeholder.kind != PlaceholderKind::Insert {
        return Err(QeError::invalid(format!(
            "{:?} placeholders cannot be written",
            placeholder.kind
        )));
    }
    let value_type = placeholder.value.value_type();
    if !value_type.is_equality_indexable() {
        return Err(QeError::invalid(format!(
            "{value_type:?} values cannot be equality-indexed"
        )));
    }
    let value_bytes = placeholder.value.to_canonical_bytes()?;

    let index_key = vault.resolve_key(&placeholder.index_key_id)?;
    let user_key = vault.resolve_key(&placeholder.user_key_id)?;
    let slot = ctx.contention_slot(placeholder.max_contention);

    let level1 = CollectionsLevel1Token::derive(&index_key)?;
    let data_token = contention_token::<Data>(&level1, &value_bytes, slot)?;
    let existence_token = contention_token::<Existence>(&level1, &value_bytes, slot)?;
    let tombstone_token = contention_token::<Tombstone>(&level1, &value_bytes, slot)?;

    let encrypted_tokens = CompactionRecord {
        existence_token: Some(existence_token.clone()),
        tombstone_token: tombstone_token.clone(),
    }
    .encrypt(&level1.compaction()?)?;

    let ciphertext = encrypt_randomized(
        &value_key(&user_key)?,
        &value_bytes,
        &value_aad(&placeholder.user_key_id, value_type),
    )?;

    tracing::debug!(
        index_key_id = %placeholder.index_key_id,
        value_type = ?value_type,
        slot,
        "encoded insert placeholder"
    );

    Ok(InsertUpdatePayload {
        index_key_id: placeholder.index_key_id,
        user_key_id: placeholder.user_key_id,
        value_type,
        contention_slot: slot,
        data_token,
        existence_token,
        tombstone_token,
        server_token: ServerDataLevel1Token::derive(&index_key)?,
        encrypted_tokens,
        ciphertext,
    })
}

/// Replace every placeholder in `doc` (including nested documents) with an
/// encoded insert/update payload. Placeholders inside arrays are rejected.
pub fn transform_placeholders(
    doc: &Document,
    vault: &dyn KeyVault,
    ctx: &mut EncryptionContext,
) -> QeResult<Document> {
    let mut out = Document::new();
    for (name, value) in doc.iter() {
        let transformed = match value {
            Value::Encrypted(blob) if EncryptedSubtype::of(blob)? == EncryptedSubtype::Placeholder => {
                let placeholder = EncryptionPlaceholder::from_blob(blob)?;
                encode_placeholder(&placeholder, vault, ctx)?.to_value()?
            }
            Value::Document(child) => Value::Document(transform_placeholders(child, vault, ctx)?),
            Value::Array(items) => {
                reject_placeholders_in_array(name, items)?;
                value.clone()
            }
            other => other.clone(),
        };
        out.insert(name, transformed);
    }
    Ok(out)
}

fn reject_placeholders_in_array(name: &str, items: &[Value]) -> QeResult<()> {
    for item in items {
        match item {
            Value::Encrypted(blob) if EncryptedSubtype::of(blob)? == EncryptedSubtype::Placeholder => {
                return Err(QeError::invalid(format!(
                    "cannot encrypt values inside array '{name}'"
                )))
            }
            Value::Array(nested) => reject_placeholders_in_array(name, nested)?,
            _ => {}
        }
    }
    Ok(())
}

/// Transform the placeholders of an update: the replacement document, or the
/// values of every `$set`.
pub fn transform_modifier(
    modifier: &UpdateModifier,
    vault: &dyn KeyVault,
    ctx: &mut EncryptionContext,
) -> QeResult<UpdateModifier> {
    Ok(match modifier {
        UpdateModifier::Replacement(doc) => {
            UpdateModifier::Replacement(transform_placeholders(doc, vault, ctx)?)
        }
        UpdateModifier::Operators(ops) => UpdateModifier::Operators(
            ops.iter()
                .map(|op| match op {
                    UpdateOperator::Set(fields) => {
                        Ok(UpdateOperator::Set(transform_placeholders(fields, vault, ctx)?))
                    }
                    other => Ok(other.clone()),
                })
                .collect::<QeResult<Vec<_>>>()?,
        ),
    })
}

/// Decrypt one stored (subtype 7) value.
pub fn decrypt_value(blob: &[u8], vault: &dyn KeyVault) -> QeResult<Value> {
    let stored = IndexedValue::from_blob(blob)?;
    let index_key = vault.resolve_key(&stored.index_key_id)?;
    let fields = stored.open(&ServerDataLevel1Token::derive(&index_key)?)?;
    let user_key = vault.resolve_key(&fields.user_key_id)?;

    let plaintext = decrypt_randomized(
        &value_key(&user_key)?,
        &fields.ciphertext,
        &value_aad(&fields.user_key_id, stored.value_type),
    )?;
    let value = Value::from_canonical_bytes(&plaintext)?;
    if value.value_type() != stored.value_type {
        return Err(QeError::DecryptionFailed(format!(
            "stored value claims {:?} but decrypts to {:?}",
            stored.value_type,
            value.value_type()
        )));
    }
    Ok(value)
}

/// Decrypt every stored value of a document read back from the server. The
/// safe-content array is returned as-is.
pub fn decrypt_document(doc: &Document, vault: &dyn KeyVault) -> QeResult<Document> {
    let mut out = Document::new();
    for (name, value) in doc.iter() {
        let plain = match value {
            Value::Encrypted(blob) => decrypt_value(blob, vault)?,
            Value::Document(child) => Value::Document(decrypt_document(child, vault)?),
            other => other.clone(),
        };
        out.insert(name, plain);
    }
    Ok(out)
}

/// Check a stored document against its schema: every encrypted field is a
/// stored value under the configured key, and the safe-content array holds
/// exactly one marker per encrypted field.
pub fn validate_document(
    doc: &Document,
    schema: &EncryptedFieldConfig,
    vault: &dyn KeyVault,
) -> QeResult<()> {
    let mut expected = HashSet::new();
    for (path, blob) in doc.encrypted_fields() {
        let field = schema
            .field(&path)
            .ok_or_else(|| QeError::invalid(format!("field '{path}' is encrypted but not in the schema")))?;
        let stored = IndexedValue::from_blob(blob)?;
        if stored.index_key_id != field.key_id {
            return Err(QeError::invalid(format!(
                "field '{path}' is encrypted under {} but the schema names {}",
                stored.index_key_id, field.key_id
            )));
        }
        if stored.value_type != field.value_type {
            return Err(QeError::invalid(format!(
                "field '{path}' holds {:?}, schema says {:?}",
                stored.value_type, field.value_type
            )));
        }
        let index_key = vault.resolve_key(&field.key_id)?;
        let fields = stored.open(&ServerDataLevel1Token::derive(&index_key)?)?;
        expected.insert(fields.safe_content_marker()?);
    }

    let present = match doc.get(SAFE_CONTENT_FIELD) {
        None => Vec::new(),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                SafeContentMarker::from_value(item)
                    .ok_or_else(|| QeError::invalid("malformed safe-content entry"))
            })
            .collect::<QeResult<Vec<_>>>()?,
        Some(other) => {
            return Err(QeError::invalid(format!(
                "safe-content field is {:?}, not an array",
                other.value_type()
            )))
        }
    };

    if present.len() != expected.len() || present.iter().any(|m| !expected.contains(m)) {
        return Err(QeError::invalid(format!(
            "safe-content array has {} markers, document has {} encrypted fields",
            present.len(),
            expected.len()
        )));
    }
    Ok(())
}

/// Tokens the server needs to tombstone one field's stored values.
#[derive(Debug, Clone, PartialEq)]
pub struct DeleteTokens {
    pub compaction: CompactionToken,
    pub server: ServerDataLevel1Token,
}

impl DeleteTokens {
    pub fn derive(index_key: &KeyMaterial) -> QeResult<Self> {
        Ok(Self {
            compaction: CollectionsLevel1Token::derive(index_key)?.compaction()?,
            server: ServerDataLevel1Token::derive(index_key)?,
        })
    }
}

/// Encryption metadata attached by the client to deletes and updates.
#[derive(Debug, Clone)]
pub struct EncryptionInformation {
    pub schema: EncryptedFieldConfig,
    /// Field path → delete tokens
    pub delete_tokens: HashMap<String, DeleteTokens>,
}

impl EncryptionInformation {
    /// Derive delete tokens for every field of `schema`.
    pub fn for_delete(schema: &EncryptedFieldConfig, vault: &dyn KeyVault) -> QeResult<Self> {
        let delete_tokens = schema
            .fields
            .iter()
            .map(|field| {
                let key = vault.resolve_key(&field.key_id)?;
                Ok((field.path.clone(), DeleteTokens::derive(&key)?))
            })
            .collect::<QeResult<HashMap<_, _>>>()?;
        Ok(Self {
            schema: schema.clone(),
            delete_tokens,
        })
    }

    /// Information with only the schema; no stored value can be tombstoned.
    pub fn without_tokens(schema: &EncryptedFieldConfig) -> Self {
        Self {
            schema: schema.clone(),
            delete_tokens: HashMap::new(),
        }
    }

    pub fn tokens_for(&self, path: &str) -> QeResult<&DeleteTokens> {
        self.delete_tokens
            .get(path)
            .ok_or_else(|| QeError::invalid(format!("no delete tokens for encrypted field '{path}'")))
    }

    /// Fails unless every configured field has delete tokens.
    pub fn require_all(&self) -> QeResult<()> {
        for field in &self.schema.fields {
            self.tokens_for(&field.path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::MemoryKeyVault;
    use crate::payload::collect_insert_payloads;
    use qe_core::config::{QueryConfig, QueryType};
    use qe_core::EncryptedField;

    const INDEX_KEY: Uuid = Uuid::from_u128(0x1234_5678_1234_9876_1234_1234_5678_9012);
    const USER_KEY: Uuid = Uuid::from_u128(0xABCD_EFAB_1234_9876_1234_1234_5678_9012);

    fn vault() -> MemoryKeyVault {
        let mut vault = MemoryKeyVault::new();
        vault.insert(INDEX_KEY, KeyMaterial::from_bytes([1u8; 96]));
        vault.insert(USER_KEY, KeyMaterial::from_bytes([2u8; 96]));
        vault
    }

    fn schema() -> EncryptedFieldConfig {
        EncryptedFieldConfig {
            fields: vec![EncryptedField {
                key_id: INDEX_KEY,
                path: "encrypted".into(),
                value_type: ValueType::String,
                queries: Some(QueryConfig {
                    query_type: QueryType::Equality,
                    contention: 0,
                }),
            }],
            ..Default::default()
        }
    }

    fn placeholder(value: &str) -> EncryptionPlaceholder {
        EncryptionPlaceholder::insert(INDEX_KEY, USER_KEY, value, 0)
    }

    #[test]
    fn test_contention_slot_range() {
        let mut ctx = EncryptionContext::new(123456);
        assert_eq!(ctx.contention_slot(0), 0);
        for _ in 0..200 {
            assert!(ctx.contention_slot(3) <= 3);
        }
    }

    #[test]
    fn test_contention_slot_is_seeded() {
        let mut a = EncryptionContext::new(7);
        let mut b = EncryptionContext::new(7);
        let xs: Vec<_> = (0..16).map(|_| a.contention_slot(100)).collect();
        let ys: Vec<_> = (0..16).map(|_| b.contention_slot(100)).collect();
        assert_eq!(xs, ys);
    }

    #[test]
    fn test_same_value_same_tag_different_ciphertext() {
        let vault = vault();
        let mut ctx = EncryptionContext::new(0);
        let a = encode_placeholder(&placeholder("secret"), &vault, &mut ctx).unwrap();
        let b = encode_placeholder(&placeholder("secret"), &vault, &mut ctx).unwrap();
        let c = encode_placeholder(&placeholder("other"), &vault, &mut ctx).unwrap();

        assert_eq!(a.existence_tag().unwrap(), b.existence_tag().unwrap());
        assert_ne!(a.ciphertext, b.ciphertext);
        assert_ne!(a.existence_tag().unwrap(), c.existence_tag().unwrap());
    }

    #[test]
    fn test_find_placeholder_rejected() {
        let mut find = placeholder("secret");
        find.kind = PlaceholderKind::Find;
        let result = encode_placeholder(&find, &vault(), &mut EncryptionContext::new(0));
        assert!(matches!(result, Err(QeError::InvalidInput(_))));
    }

    #[test]
    fn test_unknown_key_fails() {
        let missing = EncryptionPlaceholder::insert(Uuid::from_u128(9), USER_KEY, "x", 0);
        let result = encode_placeholder(&missing, &vault(), &mut EncryptionContext::new(0));
        assert!(matches!(result, Err(QeError::KeyNotFound(_))));
    }

    #[test]
    fn test_encrypted_tokens_decrypt_with_compaction_token() {
        let vault = vault();
        let payload =
            encode_placeholder(&placeholder("secret"), &vault, &mut EncryptionContext::new(0)).unwrap();
        let tokens = DeleteTokens::derive(&vault.resolve_key(&INDEX_KEY).unwrap()).unwrap();
        let record = CompactionRecord::decrypt(&tokens.compaction, &payload.encrypted_tokens).unwrap();
        assert_eq!(record.existence_token, Some(payload.existence_token.clone()));
        assert_eq!(record.tombstone_token, payload.tombstone_token);
    }

    #[test]
    fn test_transform_and_decrypt_roundtrip() {
        let vault = vault();
        let mut ctx = EncryptionContext::new(0);
        let doc = Document::new()
            .with("_id", 1)
            .with("plainText", "sample")
            .with("encrypted", placeholder("secret").to_value().unwrap());

        let transformed = transform_placeholders(&doc, &vault, &mut ctx).unwrap();
        let payloads = collect_insert_payloads(&transformed).unwrap();
        assert_eq!(payloads.len(), 1);

        // what the server would store
        let payload = &payloads[0].payload;
        let marker = payload.safe_content_marker(1).unwrap();
        let mut stored = transformed.clone();
        stored.insert("encrypted", IndexedValue::seal(payload, 1).unwrap().to_value());
        stored.insert(SAFE_CONTENT_FIELD, Value::Array(vec![marker.to_value()]));

        validate_document(&stored, &schema(), &vault).unwrap();
        let decrypted = decrypt_document(&stored.without(SAFE_CONTENT_FIELD), &vault).unwrap();
        assert_eq!(decrypted, doc.clone().with("encrypted", "secret"));
    }

    #[test]
    fn test_validate_rejects_missing_marker() {
        let vault = vault();
        let payload =
            encode_placeholder(&placeholder("secret"), &vault, &mut EncryptionContext::new(0)).unwrap();
        let stored = Document::new()
            .with("_id", 1)
            .with("encrypted", IndexedValue::seal(&payload, 1).unwrap().to_value())
            .with(SAFE_CONTENT_FIELD, Value::Array(vec![]));
        assert!(validate_document(&stored, &schema(), &vault).is_err());
    }

    #[test]
    fn test_placeholder_in_array_rejected() {
        let doc = Document::new().with(
            "list",
            vec![placeholder("secret").to_value().unwrap()],
        );
        let result = transform_placeholders(&doc, &vault(), &mut EncryptionContext::new(0));
        assert!(result.is_err());
    }

    #[test]
    fn test_transform_modifier_set() {
        let vault = vault();
        let modifier = UpdateModifier::Operators(vec![
            UpdateOperator::Set(
                Document::new().with("encrypted", placeholder("top secret").to_value().unwrap()),
            ),
            UpdateOperator::Unset(vec!["plainText".into()]),
        ]);
        let out = transform_modifier(&modifier, &vault, &mut EncryptionContext::new(0)).unwrap();
        let UpdateModifier::Operators(ops) = out else {
            panic!("operators expected");
        };
        let UpdateOperator::Set(fields) = &ops[0] else {
            panic!("$set expected");
        };
        assert_eq!(collect_insert_payloads(fields).unwrap().len(), 1);
        assert_eq!(ops[1], UpdateOperator::Unset(vec!["plainText".into()]));
    }

    #[test]
    fn test_encryption_information() {
        let info = EncryptionInformation::for_delete(&schema(), &vault()).unwrap();
        info.require_all().unwrap();
        assert!(info.tokens_for("encrypted").is_ok());
        assert!(info.tokens_for("other").is_err());

        let bare = EncryptionInformation::without_tokens(&schema());
        assert!(matches!(bare.require_all(), Err(QeError::InvalidInput(_))));
    }
}
