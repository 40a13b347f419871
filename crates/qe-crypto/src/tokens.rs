//! Token derivation chain
//!
//! Every stage is its own type and each auxiliary index is a type parameter,
//! so an existence token can never be handed to the tombstone index and a
//! data token can never stand in for a contention token:
//!
//! ```text
//! CollectionsLevel1Token = PRF(indexKey.prf, 1)
//! ServerDataLevel1Token  = PRF(indexKey.prf, 3)
//! CollectionToken<K>     = PRF(CollectionsLevel1Token, K::LABEL)   Data=1, Existence=2, Tombstone=3
//! CompactionToken        = PRF(CollectionsLevel1Token, 4)
//! DataToken<K>           = PRF(CollectionToken<K>, valueBytes)
//! ContentionToken<K>     = PRF(DataToken<K>, slot)
//! TagToken<K>            = PRF(ContentionToken<K>, 1)
//! ValueToken<K>          = PRF(ContentionToken<K>, 2)
//! ```
//!
//! A tag token computes row ids (`PRF(tag, position)`) but cannot read row
//! contents; only the value token can.

use std::fmt;
use std::marker::PhantomData;

use qe_core::{QeError, QeResult, Value};
use zeroize::Zeroize;

use crate::keys::KeyMaterial;
use crate::prf::{prf, prf_u64};
use crate::KEY_SIZE;

mod sealed {
    pub trait Sealed {}
}

/// One of the token families: primary data (safe-content markers), existence
/// index, tombstone index.
pub trait IndexKind: sealed::Sealed + 'static {
    const LABEL: u64;
    const NAME: &'static str;
}

/// Primary-collection family; feeds safe-content markers.
#[derive(Debug)]
pub enum Data {}

/// Existence-index family.
#[derive(Debug)]
pub enum Existence {}

/// Tombstone-index family.
#[derive(Debug)]
pub enum Tombstone {}

impl sealed::Sealed for Data {}
impl sealed::Sealed for Existence {}
impl sealed::Sealed for Tombstone {}

impl IndexKind for Data {
    const LABEL: u64 = 1;
    const NAME: &'static str = "data";
}

impl IndexKind for Existence {
    const LABEL: u64 = 2;
    const NAME: &'static str = "existence";
}

impl IndexKind for Tombstone {
    const LABEL: u64 = 3;
    const NAME: &'static str = "tombstone";
}

macro_rules! token {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, PartialEq, Eq)]
        pub struct $name {
            bytes: [u8; KEY_SIZE],
        }

        impl $name {
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self { bytes }
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }
        }

        impl Drop for $name {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

macro_rules! kinded_token {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        pub struct $name<K: IndexKind> {
            bytes: [u8; KEY_SIZE],
            _kind: PhantomData<fn() -> K>,
        }

        impl<K: IndexKind> $name<K> {
            pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
                Self {
                    bytes,
                    _kind: PhantomData,
                }
            }

            pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
                &self.bytes
            }
        }

        impl<K: IndexKind> Clone for $name<K> {
            fn clone(&self) -> Self {
                Self::from_bytes(self.bytes)
            }
        }

        impl<K: IndexKind> PartialEq for $name<K> {
            fn eq(&self, other: &Self) -> bool {
                self.bytes == other.bytes
            }
        }

        impl<K: IndexKind> Eq for $name<K> {}

        impl<K: IndexKind> Drop for $name<K> {
            fn drop(&mut self) {
                self.bytes.zeroize();
            }
        }

        impl<K: IndexKind> fmt::Debug for $name<K> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("kind", &K::NAME)
                    .field("bytes", &"[REDACTED]")
                    .finish()
            }
        }
    };
}

token!(
    /// First derivation from an index key; root of every collection token.
    CollectionsLevel1Token
);
token!(
    /// Seals the stored field value so only holders of the index key can open it.
    ServerDataLevel1Token
);
token!(
    /// Encrypts compaction-journal records.
    CompactionToken
);
kinded_token!(
    /// Per-collection-family token.
    CollectionToken
);
kinded_token!(
    /// Binds the chain to one cleartext value.
    DataToken
);
kinded_token!(
    /// Binds a data token to one contention slot.
    ContentionToken
);
kinded_token!(
    /// Computes row ids and safe-content markers.
    TagToken
);
kinded_token!(
    /// Decrypts index-row contents.
    ValueToken
);

impl CollectionsLevel1Token {
    pub fn derive(index_key: &KeyMaterial) -> QeResult<Self> {
        Ok(Self::from_bytes(prf_u64(index_key.prf_key(), 1)?))
    }

    pub fn collection<K: IndexKind>(&self) -> QeResult<CollectionToken<K>> {
        CollectionToken::derive(self)
    }

    pub fn compaction(&self) -> QeResult<CompactionToken> {
        CompactionToken::derive(self)
    }
}

impl ServerDataLevel1Token {
    pub fn derive(index_key: &KeyMaterial) -> QeResult<Self> {
        Ok(Self::from_bytes(prf_u64(index_key.prf_key(), 3)?))
    }
}

impl CompactionToken {
    pub fn derive(level1: &CollectionsLevel1Token) -> QeResult<Self> {
        Ok(Self::from_bytes(prf_u64(level1.as_bytes(), 4)?))
    }
}

impl<K: IndexKind> CollectionToken<K> {
    pub fn derive(level1: &CollectionsLevel1Token) -> QeResult<Self> {
        Ok(Self::from_bytes(prf_u64(level1.as_bytes(), K::LABEL)?))
    }
}

impl<K: IndexKind> DataToken<K> {
    /// Fails with `InvalidInput` for zero-length value bytes.
    pub fn derive(collection: &CollectionToken<K>, value: &[u8]) -> QeResult<Self> {
        if value.is_empty() {
            return Err(QeError::invalid("cannot derive a data token from an empty value"));
        }
        Ok(Self::from_bytes(prf(collection.as_bytes(), value)?))
    }
}

impl<K: IndexKind> ContentionToken<K> {
    pub fn derive(data: &DataToken<K>, slot: u64) -> QeResult<Self> {
        Ok(Self::from_bytes(prf_u64(data.as_bytes(), slot)?))
    }

    pub fn tag(&self) -> QeResult<TagToken<K>> {
        TagToken::derive(self)
    }

    pub fn value(&self) -> QeResult<ValueToken<K>> {
        ValueToken::derive(self)
    }
}

impl<K: IndexKind> TagToken<K> {
    pub fn derive(contention: &ContentionToken<K>) -> QeResult<Self> {
        Ok(Self::from_bytes(prf_u64(contention.as_bytes(), 1)?))
    }

    /// Id of the index row at `position` for this tag.
    pub fn row_id(&self, position: u64) -> QeResult<[u8; KEY_SIZE]> {
        prf_u64(&self.bytes, position)
    }
}

impl<K: IndexKind> ValueToken<K> {
    pub fn derive(contention: &ContentionToken<K>) -> QeResult<Self> {
        Ok(Self::from_bytes(prf_u64(contention.as_bytes(), 2)?))
    }
}

impl TagToken<Data> {
    /// Marker recorded in the safe-content array for the occurrence at `position`.
    pub fn safe_content_marker(&self, position: u64) -> QeResult<SafeContentMarker> {
        Ok(SafeContentMarker(prf_u64(&self.bytes, position)?))
    }
}

/// Entry of the safe-content array. Public by construction: it is stored in
/// the primary document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SafeContentMarker(pub [u8; KEY_SIZE]);

impl SafeContentMarker {
    pub fn to_value(self) -> Value {
        Value::Binary(self.0.to_vec())
    }

    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Binary(bytes) => bytes.as_slice().try_into().ok().map(SafeContentMarker),
            _ => None,
        }
    }
}

/// Run the whole chain for one family: index key + value + slot → contention token.
pub fn derive_contention_token<K: IndexKind>(
    index_key: &KeyMaterial,
    value: &[u8],
    slot: u64,
) -> QeResult<ContentionToken<K>> {
    let level1 = CollectionsLevel1Token::derive(index_key)?;
    let collection = level1.collection::<K>()?;
    let data = DataToken::derive(&collection, value)?;
    ContentionToken::derive(&data, slot)
}
