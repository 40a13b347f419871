//! qe-crypto: client-side queryable encryption
//!
//! Token hierarchy (every arrow is HMAC-SHA256 keyed by the left-hand side):
//! ```text
//! Index Key (96 bytes, from the key vault)
//!   ├── CollectionsLevel1Token
//!   │   ├── CollectionToken<Data | Existence | Tombstone>
//!   │   │   └── DataToken<K>          (binds the field value)
//!   │   │       └── ContentionToken<K> (binds the contention slot)
//!   │   │           ├── TagToken<K>    (row ids, safe-content markers)
//!   │   │           └── ValueToken<K>  (row contents)
//!   │   └── CompactionToken           (compaction journal records)
//!   └── ServerDataLevel1Token         (seals the stored field value)
//! User Key (96 bytes)
//!   └── Value Key (HKDF, domain="qe-field-value"): XChaCha20-Poly1305 over the field value
//! ```

pub mod aead;
pub mod client;
pub mod keys;
pub mod payload;
pub mod prf;
pub mod tokens;
mod wire;

pub use client::{
    decrypt_document, decrypt_value, encode_placeholder, transform_modifier,
    transform_placeholders, validate_document, DeleteTokens, EncryptionContext,
    EncryptionInformation,
};
pub use keys::{KeyMaterial, KeyVault, MemoryKeyVault};
pub use payload::{
    collect_insert_payloads, CompactionRecord, EncryptedFieldValue, EncryptedSubtype,
    EncryptionPlaceholder, IndexedValue, InsertUpdatePayload, PlaceholderKind, SealedFields,
};
pub use tokens::{
    derive_contention_token, CollectionToken, CollectionsLevel1Token, CompactionToken,
    ContentionToken, Data, DataToken, Existence, IndexKind, SafeContentMarker,
    ServerDataLevel1Token, TagToken, Tombstone, ValueToken,
};

/// Size of raw key material held by the key vault
pub const KEY_MATERIAL_SIZE: usize = 96;

/// Size of a symmetric key and of every derived token (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;
