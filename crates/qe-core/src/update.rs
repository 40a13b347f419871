//! Update modifiers
//!
//! An update is either a full replacement document or an ordered list of
//! field operators. Operators are applied in order against a copy of the
//! original document; `_id` can never change.

use serde::{Deserialize, Serialize};

use crate::document::{Document, Value};
use crate::error::{QeError, QeResult};
use crate::ID_FIELD;

/// A single update operator. Paths may be dotted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateOperator {
    /// `$set`: field path → new value
    Set(Document),
    /// `$unset`: remove the listed paths
    Unset(Vec<String>),
    /// `$inc`: field path → numeric increment
    Inc(Document),
    /// `$rename`: (from, to) pairs
    Rename(Vec<(String, String)>),
    /// `$push` with `$each`: append values to the array at a path
    Push(Vec<(String, Vec<Value>)>),
    /// `$pull` with `$in`: remove every element equal to one of the values
    Pull(Vec<(String, Vec<Value>)>),
}

impl UpdateOperator {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateOperator::Set(_) => "$set",
            UpdateOperator::Unset(_) => "$unset",
            UpdateOperator::Inc(_) => "$inc",
            UpdateOperator::Rename(_) => "$rename",
            UpdateOperator::Push(_) => "$push",
            UpdateOperator::Pull(_) => "$pull",
        }
    }

    /// Every path this operator writes to (both ends of a rename).
    pub fn target_paths(&self) -> Vec<&str> {
        match self {
            UpdateOperator::Set(doc) | UpdateOperator::Inc(doc) => doc.keys().collect(),
            UpdateOperator::Unset(paths) => paths.iter().map(String::as_str).collect(),
            UpdateOperator::Rename(pairs) => pairs
                .iter()
                .flat_map(|(from, to)| [from.as_str(), to.as_str()])
                .collect(),
            UpdateOperator::Push(entries) | UpdateOperator::Pull(entries) => {
                entries.iter().map(|(path, _)| path.as_str()).collect()
            }
        }
    }

    fn apply(&self, doc: &mut Document) -> QeResult<()> {
        if self.target_paths().iter().any(|p| touches(p, ID_FIELD)) {
            return Err(QeError::invalid(format!(
                "{} cannot modify the immutable field '{ID_FIELD}'",
                self.name()
            )));
        }

        match self {
            UpdateOperator::Set(fields) => {
                for (path, value) in fields.iter() {
                    doc.set_path(path, value.clone())?;
                }
            }
            UpdateOperator::Unset(paths) => {
                for path in paths {
                    doc.remove_path(path);
                }
            }
            UpdateOperator::Inc(fields) => {
                for (path, delta) in fields.iter() {
                    let next = match doc.get_path(path) {
                        None => check_numeric(path, delta)?.clone(),
                        Some(current) => add_numeric(path, current, delta)?,
                    };
                    doc.set_path(path, next)?;
                }
            }
            UpdateOperator::Rename(pairs) => {
                for (from, to) in pairs {
                    if from == to {
                        return Err(QeError::invalid(format!(
                            "$rename source and target are the same: '{from}'"
                        )));
                    }
                    if let Some(value) = doc.remove_path(from) {
                        doc.set_path(to, value)?;
                    }
                }
            }
            UpdateOperator::Push(entries) => {
                for (path, values) in entries {
                    let mut array = match doc.get_path(path) {
                        None => Vec::new(),
                        Some(Value::Array(existing)) => existing.clone(),
                        Some(other) => {
                            return Err(QeError::invalid(format!(
                                "$push target '{path}' is {:?}, not an array",
                                other.value_type()
                            )))
                        }
                    };
                    array.extend(values.iter().cloned());
                    doc.set_path(path, Value::Array(array))?;
                }
            }
            UpdateOperator::Pull(entries) => {
                for (path, values) in entries {
                    match doc.get_path(path) {
                        None => {}
                        Some(Value::Array(existing)) => {
                            let kept: Vec<Value> = existing
                                .iter()
                                .filter(|v| !values.contains(v))
                                .cloned()
                                .collect();
                            doc.set_path(path, Value::Array(kept))?;
                        }
                        Some(other) => {
                            return Err(QeError::invalid(format!(
                                "$pull target '{path}' is {:?}, not an array",
                                other.value_type()
                            )))
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// A client update: replacement document or operator list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum UpdateModifier {
    Replacement(Document),
    Operators(Vec<UpdateOperator>),
}

impl UpdateModifier {
    /// Apply this modifier to `original`, returning the post-image.
    pub fn apply(&self, original: &Document) -> QeResult<Document> {
        match self {
            UpdateModifier::Replacement(replacement) => {
                if let (Some(new_id), Some(old_id)) = (replacement.id(), original.id()) {
                    if new_id != old_id {
                        return Err(QeError::invalid(format!(
                            "replacement cannot change the immutable field '{ID_FIELD}'"
                        )));
                    }
                }
                let mut doc = Document::new();
                if let Some(id) = original.id() {
                    doc.insert(ID_FIELD, id.clone());
                }
                for (name, value) in replacement.iter().filter(|(n, _)| *n != ID_FIELD) {
                    doc.insert(name, value.clone());
                }
                Ok(doc)
            }
            UpdateModifier::Operators(ops) => {
                let mut doc = original.clone();
                for op in ops {
                    op.apply(&mut doc)?;
                }
                Ok(doc)
            }
        }
    }
}

/// True if `path` is `field` or lies inside it.
pub fn touches(path: &str, field: &str) -> bool {
    path == field
        || path
            .strip_prefix(field)
            .is_some_and(|rest| rest.starts_with('.'))
}

fn check_numeric<'a>(path: &str, value: &'a Value) -> QeResult<&'a Value> {
    match value {
        Value::Int32(_) | Value::Int64(_) | Value::Double(_) => Ok(value),
        other => Err(QeError::invalid(format!(
            "$inc of '{path}' requires a numeric amount, got {:?}",
            other.value_type()
        ))),
    }
}

fn add_numeric(path: &str, current: &Value, delta: &Value) -> QeResult<Value> {
    check_numeric(path, delta)?;
    Ok(match (current, delta) {
        (Value::Int32(a), Value::Int32(b)) => match a.checked_add(*b) {
            Some(sum) => Value::Int32(sum),
            None => Value::Int64(i64::from(*a) + i64::from(*b)),
        },
        (Value::Int32(a), Value::Int64(b)) => Value::Int64(i64::from(*a).wrapping_add(*b)),
        (Value::Int64(a), Value::Int32(b)) => Value::Int64(a.wrapping_add(i64::from(*b))),
        (Value::Int64(a), Value::Int64(b)) => Value::Int64(a.wrapping_add(*b)),
        (Value::Double(a), Value::Double(b)) => Value::Double(a + b),
        (Value::Double(a), Value::Int32(b)) => Value::Double(a + f64::from(*b)),
        (Value::Double(a), Value::Int64(b)) => Value::Double(a + *b as f64),
        (Value::Int32(a), Value::Double(b)) => Value::Double(f64::from(*a) + b),
        (Value::Int64(a), Value::Double(b)) => Value::Double(*a as f64 + b),
        (other, _) => {
            return Err(QeError::invalid(format!(
                "cannot $inc non-numeric field '{path}' of type {:?}",
                other.value_type()
            )))
        }
    })
}
