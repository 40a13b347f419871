//! Key material and the key vault capability
//!
//! The core never persists key material: it asks a [`KeyVault`] for the bytes
//! behind a key id and holds them only for the duration of one derivation.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use qe_core::{QeError, QeResult};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use uuid::Uuid;
use zeroize::Zeroize;

use crate::{KEY_MATERIAL_SIZE, KEY_SIZE};

/// 96 bytes of key material: `[0..32)` encryption half, `[64..96)` PRF half.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct KeyMaterial {
    bytes: [u8; KEY_MATERIAL_SIZE],
}

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_MATERIAL_SIZE]) -> Self {
        Self { bytes }
    }

    /// Fails with `InvalidInput` unless `bytes` is exactly 96 bytes long.
    pub fn from_slice(bytes: &[u8]) -> QeResult<Self> {
        let bytes: [u8; KEY_MATERIAL_SIZE] = bytes.try_into().map_err(|_| {
            QeError::invalid(format!(
                "key material is {} bytes (expected {KEY_MATERIAL_SIZE})",
                bytes.len()
            ))
        })?;
        Ok(Self { bytes })
    }

    /// Fresh random key material.
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_MATERIAL_SIZE];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_MATERIAL_SIZE] {
        &self.bytes
    }

    /// Key half used for authenticated encryption.
    pub fn encryption_key(&self) -> &[u8] {
        &self.bytes[..KEY_SIZE]
    }

    /// Key half used to seed the PRF chain.
    pub fn prf_key(&self) -> &[u8] {
        &self.bytes[KEY_MATERIAL_SIZE - KEY_SIZE..]
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Resolves a key id to raw key material.
///
/// Implementations must fail with `KeyNotFound` for unknown ids; they never
/// invent keys on lookup.
pub trait KeyVault: Send + Sync {
    fn resolve_key(&self, id: &Uuid) -> QeResult<KeyMaterial>;
}

/// In-memory key vault, optionally loaded from a TOML key file.
#[derive(Debug, Default, Clone)]
pub struct MemoryKeyVault {
    keys: HashMap<Uuid, KeyMaterial>,
}

/// On-disk key file format
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KeyFile {
    #[serde(default)]
    pub keys: Vec<KeyFileEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct KeyFileEntry {
    pub id: Uuid,
    /// Base64 of the 96-byte key material
    pub material: String,
}

impl KeyFileEntry {
    pub fn new(id: Uuid, material: &KeyMaterial) -> Self {
        Self {
            id,
            material: STANDARD.encode(material.as_bytes()),
        }
    }
}

impl MemoryKeyVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: Uuid, material: KeyMaterial) {
        self.keys.insert(id, material);
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn from_toml_str(content: &str) -> QeResult<Self> {
        let file: KeyFile = toml::from_str(content)
            .map_err(|e| QeError::Config(format!("parsing key file: {e}")))?;
        let mut vault = Self::new();
        for entry in file.keys {
            let mut raw = STANDARD
                .decode(&entry.material)
                .map_err(|e| QeError::Config(format!("key {}: base64 decode: {e}", entry.id)))?;
            let material = KeyMaterial::from_slice(&raw);
            raw.zeroize();
            vault.insert(entry.id, material?);
        }
        Ok(vault)
    }

    pub fn load(path: &Path) -> QeResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| QeError::Config(format!("reading key file {}: {e}", path.display())))?;
        let vault = Self::from_toml_str(&content)?;
        tracing::debug!(path = %path.display(), keys = vault.len(), "loaded key vault");
        Ok(vault)
    }
}

impl KeyVault for MemoryKeyVault {
    fn resolve_key(&self, id: &Uuid) -> QeResult<KeyMaterial> {
        self.keys.get(id).cloned().ok_or(QeError::KeyNotFound(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_key_material_length_checked() {
        assert!(KeyMaterial::from_slice(&[0u8; 95]).is_err());
        assert!(KeyMaterial::from_slice(&[0u8; 97]).is_err());
        assert!(KeyMaterial::from_slice(&[0u8; 96]).is_ok());
    }

    #[test]
    fn test_key_halves() {
        let mut bytes = [0u8; KEY_MATERIAL_SIZE];
        bytes[..32].fill(1);
        bytes[64..].fill(3);
        let key = KeyMaterial::from_bytes(bytes);
        assert_eq!(key.encryption_key(), &[1u8; 32]);
        assert_eq!(key.prf_key(), &[3u8; 32]);
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = KeyMaterial::from_bytes([0x42; KEY_MATERIAL_SIZE]);
        let shown = format!("{key:?}");
        assert!(shown.contains("REDACTED"));
        assert!(!shown.contains("66"));
    }

    #[test]
    fn test_unknown_key_not_found() {
        let vault = MemoryKeyVault::new();
        let id = Uuid::new_v4();
        match vault.resolve_key(&id) {
            Err(QeError::KeyNotFound(missing)) => assert_eq!(missing, id),
            other => panic!("expected KeyNotFound, got {other:?}"),
        }
        assert!(vault.is_empty(), "lookup must not synthesize keys");
    }

    #[test]
    fn test_key_file_roundtrip() {
        let id = Uuid::new_v4();
        let material = KeyMaterial::generate();
        let file = KeyFile {
            keys: vec![KeyFileEntry::new(id, &material)],
        };

        let mut tmp = tempfile::NamedTempFile::new().unwrap();
        tmp.write_all(toml::to_string(&file).unwrap().as_bytes())
            .unwrap();

        let vault = MemoryKeyVault::load(tmp.path()).unwrap();
        let resolved = vault.resolve_key(&id).unwrap();
        assert_eq!(resolved.as_bytes(), material.as_bytes());
    }

    #[test]
    fn test_key_file_rejects_short_material() {
        let content = format!(
            "[[keys]]\nid = \"{}\"\nmaterial = \"{}\"\n",
            Uuid::new_v4(),
            STANDARD.encode([0u8; 32])
        );
        assert!(MemoryKeyVault::from_toml_str(&content).is_err());
    }
}
