//! Ordered documents
//!
//! A `Document` is an ordered list of `(name, Value)` pairs. Field order is
//! preserved across inserts and replacements so that a decrypted document can
//! be compared field-by-field with what the client originally wrote.
//!
//! Dotted paths (`a.b.c`) address fields of nested documents. Arrays are
//! leaves: paths never descend into them.
//!
//! Scalars have a canonical byte encoding, `[type code][payload]`, which is
//! what the token derivation chain binds to and what the client encrypts.

use serde::{Deserialize, Serialize};

use crate::error::{QeError, QeResult};

/// Type of a value, with the code used in canonical encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    Double,
    String,
    Document,
    Array,
    Binary,
    Encrypted,
    Bool,
    Null,
    Int32,
    Int64,
}

impl ValueType {
    pub fn code(self) -> u8 {
        match self {
            ValueType::Double => 0x01,
            ValueType::String => 0x02,
            ValueType::Document => 0x03,
            ValueType::Array => 0x04,
            ValueType::Binary => 0x05,
            ValueType::Encrypted => 0x06,
            ValueType::Bool => 0x08,
            ValueType::Null => 0x0A,
            ValueType::Int32 => 0x10,
            ValueType::Int64 => 0x12,
        }
    }

    pub fn from_code(code: u8) -> QeResult<Self> {
        Ok(match code {
            0x01 => ValueType::Double,
            0x02 => ValueType::String,
            0x03 => ValueType::Document,
            0x04 => ValueType::Array,
            0x05 => ValueType::Binary,
            0x06 => ValueType::Encrypted,
            0x08 => ValueType::Bool,
            0x0A => ValueType::Null,
            0x10 => ValueType::Int32,
            0x12 => ValueType::Int64,
            other => return Err(QeError::invalid(format!("unknown value type code {other:#04x}"))),
        })
    }

    /// Whether values of this type may back an equality index.
    pub fn is_equality_indexable(self) -> bool {
        matches!(
            self,
            ValueType::String | ValueType::Binary | ValueType::Bool | ValueType::Int32 | ValueType::Int64
        )
    }
}

/// A tagged document value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Double(f64),
    String(String),
    Binary(Vec<u8>),
    Array(Vec<Value>),
    Document(Document),
    /// Opaque encrypted blob; the first byte identifies the payload subtype
    Encrypted(Vec<u8>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Null,
            Value::Bool(_) => ValueType::Bool,
            Value::Int32(_) => ValueType::Int32,
            Value::Int64(_) => ValueType::Int64,
            Value::Double(_) => ValueType::Double,
            Value::String(_) => ValueType::String,
            Value::Binary(_) => ValueType::Binary,
            Value::Array(_) => ValueType::Array,
            Value::Document(_) => ValueType::Document,
            Value::Encrypted(_) => ValueType::Encrypted,
        }
    }

    pub fn as_document(&self) -> Option<&Document> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(values) => Some(values),
            _ => None,
        }
    }

    pub fn as_encrypted(&self) -> Option<&[u8]> {
        match self {
            Value::Encrypted(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Canonical `[type code][payload]` encoding of a scalar.
    ///
    /// Arrays and documents have no canonical form and are rejected.
    pub fn to_canonical_bytes(&self) -> QeResult<Vec<u8>> {
        let mut out = vec![self.value_type().code()];
        match self {
            Value::Null => {}
            Value::Bool(b) => out.push(u8::from(*b)),
            Value::Int32(n) => out.extend_from_slice(&n.to_le_bytes()),
            Value::Int64(n) => out.extend_from_slice(&n.to_le_bytes()),
            Value::Double(d) => out.extend_from_slice(&d.to_bits().to_le_bytes()),
            Value::String(s) => out.extend_from_slice(s.as_bytes()),
            Value::Binary(b) | Value::Encrypted(b) => out.extend_from_slice(b),
            Value::Array(_) | Value::Document(_) => {
                return Err(QeError::invalid(format!(
                    "{:?} values have no canonical encoding",
                    self.value_type()
                )))
            }
        }
        Ok(out)
    }

    /// Inverse of [`Value::to_canonical_bytes`].
    pub fn from_canonical_bytes(bytes: &[u8]) -> QeResult<Value> {
        let (&code, payload) = bytes
            .split_first()
            .ok_or_else(|| QeError::invalid("empty canonical value"))?;
        let fixed = |len: usize| fixed_len(payload, len);

        Ok(match ValueType::from_code(code)? {
            ValueType::Null => {
                fixed(0)?;
                Value::Null
            }
            ValueType::Bool => Value::Bool(fixed(1)?[0] != 0),
            ValueType::Int32 => Value::Int32(i32::from_le_bytes(array(fixed(4)?)?)),
            ValueType::Int64 => Value::Int64(i64::from_le_bytes(array(fixed(8)?)?)),
            ValueType::Double => Value::Double(f64::from_bits(u64::from_le_bytes(array(fixed(8)?)?))),
            ValueType::String => Value::String(
                String::from_utf8(payload.to_vec())
                    .map_err(|e| QeError::invalid(format!("canonical string is not UTF-8: {e}")))?,
            ),
            ValueType::Binary => Value::Binary(payload.to_vec()),
            ValueType::Encrypted => Value::Encrypted(payload.to_vec()),
            ValueType::Array | ValueType::Document => {
                return Err(QeError::invalid("nested values have no canonical encoding"))
            }
        })
    }
}

fn fixed_len(payload: &[u8], len: usize) -> QeResult<&[u8]> {
    if payload.len() != len {
        return Err(QeError::invalid(format!(
            "canonical value has {} payload bytes (expected {len})",
            payload.len()
        )));
    }
    Ok(payload)
}

fn array<const N: usize>(bytes: &[u8]) -> QeResult<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| QeError::invalid(format!("expected {N} bytes, got {}", bytes.len())))
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Int32(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int64(n)
    }
}

impl From<f64> for Value {
    fn from(d: f64) -> Self {
        Value::Double(d)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Document> for Value {
    fn from(doc: Document) -> Self {
        Value::Document(doc)
    }
}

impl From<Vec<Value>> for Value {
    fn from(values: Vec<Value>) -> Self {
        Value::Array(values)
    }
}

/// An ordered mapping from field name to value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    fields: Vec<(String, Value)>,
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style append (replaces an existing field in place).
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    /// Set a top-level field, keeping its position if it already exists.
    /// Returns the previous value.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        let name = name.into();
        let value = value.into();
        match self.fields.iter_mut().find(|(n, _)| *n == name) {
            Some((_, slot)) => Some(std::mem::replace(slot, value)),
            None => {
                self.fields.push((name, value));
                None
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields.iter_mut().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.fields.iter().position(|(n, _)| n == name)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The `_id` field, if present
    pub fn id(&self) -> Option<&Value> {
        self.get(crate::ID_FIELD)
    }

    /// A copy of this document without the named top-level field.
    pub fn without(&self, name: &str) -> Document {
        let mut doc = self.clone();
        doc.remove(name);
        doc
    }

    pub fn get_path(&self, path: &str) -> Option<&Value> {
        match path.split_once('.') {
            None => self.get(path),
            Some((head, rest)) => self.get(head)?.as_document()?.get_path(rest),
        }
    }

    /// Set a value at a dotted path, creating intermediate documents.
    ///
    /// Fails if an intermediate path component exists and is not a document.
    pub fn set_path(&mut self, path: &str, value: Value) -> QeResult<Option<Value>> {
        match path.split_once('.') {
            None => Ok(self.insert(path, value)),
            Some((head, rest)) => {
                if !self.contains_key(head) {
                    self.insert(head, Document::new());
                }
                match self.get_mut(head) {
                    Some(Value::Document(child)) => child.set_path(rest, value),
                    _ => Err(QeError::invalid(format!(
                        "cannot create field '{rest}' inside non-document '{head}'"
                    ))),
                }
            }
        }
    }

    pub fn remove_path(&mut self, path: &str) -> Option<Value> {
        match path.split_once('.') {
            None => self.remove(path),
            Some((head, rest)) => match self.get_mut(head)? {
                Value::Document(child) => child.remove_path(rest),
                _ => None,
            },
        }
    }

    /// Every encrypted blob in the document with its dotted path, in field order.
    ///
    /// Recurses into nested documents but not into arrays.
    pub fn encrypted_fields(&self) -> Vec<(String, &[u8])> {
        let mut out = Vec::new();
        self.collect_encrypted("", &mut out);
        out
    }

    fn collect_encrypted<'a>(&'a self, prefix: &str, out: &mut Vec<(String, &'a [u8])>) {
        for (name, value) in &self.fields {
            let path = if prefix.is_empty() {
                name.clone()
            } else {
                format!("{prefix}.{name}")
            };
            match value {
                Value::Encrypted(bytes) => out.push((path, bytes)),
                Value::Document(child) => child.collect_encrypted(&path, out),
                _ => {}
            }
        }
    }
}

impl FromIterator<(String, Value)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut doc = Document::new();
        for (name, value) in iter {
            doc.insert(name, value);
        }
        doc
    }
}
