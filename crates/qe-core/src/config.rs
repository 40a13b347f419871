use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use uuid::Uuid;

use crate::document::ValueType;
use crate::error::{QeError, QeResult};
use crate::update::touches;
use crate::SAFE_CONTENT_FIELD;

/// Top-level configuration (loaded from qe.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct QeConfig {
    pub crud: CrudConfig,
    pub encryption: EncryptionConfig,
    pub log: LogConfig,
    pub schema: EncryptedFieldConfig,
}

impl QeConfig {
    /// Load a config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> QeResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| QeError::Config(format!("reading {}: {e}", path.display())))?;
        let config: QeConfig = toml::from_str(&content)
            .map_err(|e| QeError::Config(format!("parsing {}: {e}", path.display())))?;
        config.schema.validate()?;
        Ok(config)
    }
}

/// Write-path tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrudConfig {
    /// Extra attempts after an index-row id collision (default: 10)
    pub max_index_retries: u32,
    /// Report a duplicate primary `_id` as a typed duplicate-key error (default: true)
    pub translate_duplicate_key: bool,
    /// Code reported for a translated duplicate primary `_id`
    pub duplicate_key_code: Option<i32>,
}

impl Default for CrudConfig {
    fn default() -> Self {
        Self {
            max_index_retries: 10,
            translate_duplicate_key: true,
            duplicate_key_code: None,
        }
    }
}

/// Client-side encryption settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    /// Seed for contention-slot selection
    pub contention_seed: u64,
    /// Path to the key vault file
    pub key_file: Option<std::path::PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueryType {
    Equality,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryConfig {
    pub query_type: QueryType,
    /// Largest contention slot a value may be assigned (0 disables contention)
    #[serde(default)]
    pub contention: u64,
}

/// One encrypted field of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedField {
    /// Index key for this field
    pub key_id: Uuid,
    /// Dotted path of the field
    pub path: String,
    pub value_type: ValueType,
    /// Absent for unindexed fields
    #[serde(default)]
    pub queries: Option<QueryConfig>,
}

/// Encrypted schema of a collection family: the auxiliary collection names
/// and the fields that are encrypted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptedFieldConfig {
    pub existence_collection: String,
    pub tombstone_collection: String,
    pub compaction_collection: String,
    pub fields: Vec<EncryptedField>,
}

impl Default for EncryptedFieldConfig {
    fn default() -> Self {
        Self {
            existence_collection: "esc".into(),
            tombstone_collection: "ecc".into(),
            compaction_collection: "ecoc".into(),
            fields: Vec::new(),
        }
    }
}

impl EncryptedFieldConfig {
    pub fn field(&self, path: &str) -> Option<&EncryptedField> {
        self.fields.iter().find(|f| f.path == path)
    }

    pub fn validate(&self) -> QeResult<()> {
        let names = [
            &self.existence_collection,
            &self.tombstone_collection,
            &self.compaction_collection,
        ];
        if names.iter().any(|n| n.is_empty()) {
            return Err(QeError::Config("auxiliary collection names must not be empty".into()));
        }
        if names.iter().collect::<HashSet<_>>().len() != names.len() {
            return Err(QeError::Config("auxiliary collection names must be distinct".into()));
        }

        let mut seen = HashSet::new();
        for field in &self.fields {
            if field.path.is_empty() || field.path.split('.').any(str::is_empty) {
                return Err(QeError::Config(format!("malformed field path '{}'", field.path)));
            }
            if touches(&field.path, SAFE_CONTENT_FIELD) || touches(&field.path, crate::ID_FIELD) {
                return Err(QeError::Config(format!("field '{}' cannot be encrypted", field.path)));
            }
            if !seen.insert(field.path.as_str()) {
                return Err(QeError::Config(format!("duplicate encrypted field '{}'", field.path)));
            }
            if field.queries.is_some() && !field.value_type.is_equality_indexable() {
                return Err(QeError::Config(format!(
                    "field '{}' of type {:?} cannot be equality-indexed",
                    field.path, field.value_type
                )));
            }
        }
        for a in &self.fields {
            for b in &self.fields {
                if a.path != b.path && touches(&b.path, &a.path) {
                    return Err(QeError::Config(format!(
                        "encrypted fields '{}' and '{}' overlap",
                        a.path, b.path
                    )));
                }
            }
        }
        Ok(())
    }
}
