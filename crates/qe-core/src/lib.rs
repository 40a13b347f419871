//! qe-core: shared types for the queryable-encryption write path
//!
//! - `document`: ordered documents with tagged values (plaintext or encrypted blob)
//! - `update`: client update modifiers and their application to a document
//! - `config`: encrypted field schema + TOML configuration
//! - `error`: the error taxonomy every crate in the workspace reports through

pub mod config;
pub mod document;
pub mod error;
pub mod update;

pub use config::{EncryptedField, EncryptedFieldConfig, QeConfig};
pub use document::{Document, Value, ValueType};
pub use error::{ErrorCode, QeError, QeResult, SafetyViolation};
pub use update::{UpdateModifier, UpdateOperator};

/// Name of the server-maintained array listing the markers of every encrypted field
pub const SAFE_CONTENT_FIELD: &str = "__safeContent__";

/// Primary key field name
pub const ID_FIELD: &str = "_id";
