//! Shared fixture for the write-path integration tests: an in-memory store,
//! a key vault that invents deterministic keys, and client-side helpers that
//! go through the same placeholder → payload path a driver would.

#![allow(dead_code)]

use qe_core::config::{CrudConfig, QueryConfig, QueryType};
use qe_core::{
    Document, EncryptedField, EncryptedFieldConfig, QeResult, UpdateModifier, UpdateOperator,
    Value, ValueType,
};
use qe_crud::{
    process_delete, process_insert, process_update, DeleteOpEntry, DeleteOutcome, DeleteRequest,
    InsertOutcome, QueryInterface, TombstoneEntry, TombstoneIndex, UpdateOpEntry, UpdateOutcome,
    UpdateRequest,
};
use qe_crypto::{
    collect_insert_payloads, decrypt_document, derive_contention_token, transform_modifier,
    transform_placeholders, validate_document, EncryptionContext, EncryptionInformation,
    EncryptionPlaceholder, Existence, KeyMaterial, KeyVault, TagToken, Tombstone,
};
use uuid::Uuid;

pub const EDC: &str = "coll";
pub const ESC: &str = "esc";
pub const ECC: &str = "ecc";
pub const ECOC: &str = "ecoc";

pub const INDEX_KEY_ID: Uuid = Uuid::from_u128(0x12345678_1234_9876_1234_123456789012);
pub const USER_KEY_ID: Uuid = Uuid::from_u128(0xABCDEFAB_1234_9876_1234_123456789012);

/// Key vault that derives key material for any id from a fixed seed.
/// Test-only: real vaults fail with `KeyNotFound` for unknown ids.
pub struct SynthesizingKeyVault {
    seed: u64,
}

impl SynthesizingKeyVault {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }
}

impl KeyVault for SynthesizingKeyVault {
    fn resolve_key(&self, id: &Uuid) -> QeResult<KeyMaterial> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&self.seed.to_le_bytes());
        hasher.update(id.as_bytes());
        let mut bytes = [0u8; 96];
        hasher.finalize_xof().fill(&mut bytes);
        Ok(KeyMaterial::from_bytes(bytes))
    }
}

/// Stable key id for a generated field name.
pub fn field_key_id(name: &str) -> Uuid {
    let hash = blake3::hash(name.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[..16]);
    Uuid::from_bytes(bytes)
}

pub fn field_name(i: u64) -> String {
    format!("field{i:05}")
}

pub fn equality_field(path: &str, key_id: Uuid) -> EncryptedField {
    EncryptedField {
        key_id,
        path: path.to_string(),
        value_type: ValueType::String,
        queries: Some(QueryConfig {
            query_type: QueryType::Equality,
            contention: 0,
        }),
    }
}

pub fn test_schema() -> EncryptedFieldConfig {
    EncryptedFieldConfig {
        existence_collection: ESC.into(),
        tombstone_collection: ECC.into(),
        compaction_collection: ECOC.into(),
        fields: vec![equality_field("encrypted", INDEX_KEY_ID)],
    }
}

pub fn wide_schema(field_count: u64) -> EncryptedFieldConfig {
    EncryptedFieldConfig {
        fields: (0..field_count)
            .map(|i| {
                let name = field_name(i);
                equality_field(&name, field_key_id(&name))
            })
            .collect(),
        ..test_schema()
    }
}

pub fn placeholder(value: &str) -> Value {
    EncryptionPlaceholder::insert(INDEX_KEY_ID, USER_KEY_ID, value, 0)
        .to_value()
        .unwrap()
}

pub struct Fixture<S: QueryInterface> {
    pub store: S,
    pub vault: SynthesizingKeyVault,
    pub schema: EncryptedFieldConfig,
    pub options: CrudConfig,
    pub ctx: EncryptionContext,
}

impl Fixture<qe_crud::MemoryStore> {
    pub fn new() -> Self {
        Self::with_store(qe_crud::MemoryStore::new())
    }
}

impl<S: QueryInterface> Fixture<S> {
    pub fn with_store(store: S) -> Self {
        Self {
            store,
            vault: SynthesizingKeyVault::new(123456),
            schema: test_schema(),
            options: CrudConfig::default(),
            ctx: EncryptionContext::new(123456),
        }
    }

    fn index_key(&self, id: &Uuid) -> KeyMaterial {
        self.vault.resolve_key(id).unwrap()
    }

    /// `{ _id, counter: 1, plainText: "sample", encrypted: <value> }`
    pub fn client_document(&self, id: i32, value: &str) -> Document {
        Document::new()
            .with("_id", id)
            .with("counter", 1)
            .with("plainText", "sample")
            .with("encrypted", placeholder(value))
    }

    pub fn try_insert(&mut self, client_doc: &Document) -> QeResult<InsertOutcome> {
        let doc = transform_placeholders(client_doc, &self.vault, &mut self.ctx)?;
        let payloads = collect_insert_payloads(&doc)?;
        process_insert(&self.store, EDC, &payloads, &self.schema, &self.options, &doc)
    }

    pub fn do_single_insert(&mut self, id: i32, value: &str) -> InsertOutcome {
        let doc = self.client_document(id, value);
        self.try_insert(&doc).unwrap()
    }

    /// One document with `field_count` encrypted fields, each under its own key.
    pub fn do_single_wide_insert(&mut self, id: i32, field_count: u64, value: impl Fn(&str, i32) -> String) {
        let mut doc = Document::new().with("_id", id).with("plainText", "sample");
        for i in 0..field_count {
            let name = field_name(i);
            let key_id = field_key_id(&name);
            let ph = EncryptionPlaceholder::insert(key_id, key_id, value(&name, id), 0);
            doc.insert(name, ph.to_value().unwrap());
        }
        self.try_insert(&doc).unwrap();
    }

    pub fn encryption_information(&self) -> EncryptionInformation {
        EncryptionInformation::for_delete(&self.schema, &self.vault).unwrap()
    }

    pub fn try_update_with(&mut self, id: i32, modifier: UpdateModifier) -> QeResult<UpdateOutcome> {
        let modifier = transform_modifier(&modifier, &self.vault, &mut self.ctx)?;
        let request = UpdateRequest {
            collection: EDC.into(),
            updates: vec![UpdateOpEntry {
                filter: Document::new().with("_id", id),
                modifier,
                multi: false,
            }],
            encryption_information: self.encryption_information(),
        };
        process_update(&self.store, &request, &self.options)
    }

    /// `$inc counter` + `$set encrypted`
    pub fn do_single_update(&mut self, id: i32, value: &str) -> UpdateOutcome {
        let modifier = UpdateModifier::Operators(vec![
            UpdateOperator::Inc(Document::new().with("counter", 1)),
            UpdateOperator::Set(Document::new().with("encrypted", placeholder(value))),
        ]);
        self.try_update_with(id, modifier).unwrap()
    }

    pub fn delete_request(&self, id: i32) -> DeleteRequest {
        DeleteRequest {
            collection: EDC.into(),
            deletes: vec![DeleteOpEntry {
                filter: Document::new().with("_id", id),
                multi: false,
            }],
            encryption_information: self.encryption_information(),
        }
    }

    pub fn do_single_delete(&mut self, id: i32) -> DeleteOutcome {
        process_delete(&self.store, &self.delete_request(id), &self.options).unwrap()
    }

    #[track_caller]
    pub fn assert_counts(&self, edc: u64, esc: u64, ecc: u64, ecoc: u64) {
        let counts = [EDC, ESC, ECC, ECOC].map(|c| self.store.count_documents(c).unwrap());
        assert_eq!(counts, [edc, esc, ecc, ecoc], "counts (edc, esc, ecc, ecoc)");
    }

    pub fn esc_tag_for(&self, key_id: &Uuid, value: &str) -> TagToken<Existence> {
        let bytes = Value::from(value).to_canonical_bytes().unwrap();
        derive_contention_token::<Existence>(&self.index_key(key_id), &bytes, 0)
            .unwrap()
            .tag()
            .unwrap()
    }

    pub fn esc_tag(&self, value: &str) -> TagToken<Existence> {
        self.esc_tag_for(&INDEX_KEY_ID, value)
    }

    pub fn esc_row_exists_for(&self, key_id: &Uuid, value: &str, position: u64) -> bool {
        let id = Value::Binary(self.esc_tag_for(key_id, value).row_id(position).unwrap().to_vec());
        self.store.get_by_id(ESC, &id).unwrap().is_some()
    }

    pub fn esc_row_exists(&self, value: &str, position: u64) -> bool {
        self.esc_row_exists_for(&INDEX_KEY_ID, value, position)
    }

    #[track_caller]
    pub fn ecc_entry(&self, value: &str, position: u64) -> TombstoneEntry {
        let bytes = Value::from(value).to_canonical_bytes().unwrap();
        let token = derive_contention_token::<Tombstone>(&self.index_key(&INDEX_KEY_ID), &bytes, 0).unwrap();
        TombstoneIndex::new(&self.store, ECC, 0)
            .read(&token.tag().unwrap(), &token.value().unwrap(), position)
            .unwrap()
            .expect("tombstone row present")
    }

    pub fn stored(&self, id: i32) -> Option<Document> {
        self.store.get_by_id(EDC, &Value::Int32(id)).unwrap()
    }

    /// Check the stored document's safe-content array and decrypt it.
    #[track_caller]
    pub fn validate_document(&self, id: i32, expected: Option<&Document>) {
        let stored = self.stored(id).expect("document present");
        validate_document(&stored, &self.schema, &self.vault).unwrap();
        let decrypted = decrypt_document(&stored, &self.vault).unwrap();
        if let Some(expected) = expected {
            assert_eq!(&qe_crud::strip_safe_content(&decrypted), expected);
        }
    }
}
