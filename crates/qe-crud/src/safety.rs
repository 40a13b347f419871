//! Safe-content enforcement
//!
//! `__safeContent__` is owned by the server. Clients may read it but every
//! attempt to write it, directly or through a rename, is refused before any
//! storage call is made.

use qe_core::update::touches;
use qe_core::{
    Document, QeError, QeResult, SafetyViolation, UpdateModifier, UpdateOperator,
    SAFE_CONTENT_FIELD,
};
use qe_crypto::SafeContentMarker;

/// Refuse a client insert that already carries a safe-content array.
pub fn check_insert(doc: &Document) -> QeResult<()> {
    if doc.contains_key(SAFE_CONTENT_FIELD) {
        return Err(QeError::SafetyViolation(SafetyViolation::Modify));
    }
    Ok(())
}

/// Refuse a client update that writes the safe-content array. Renames are
/// reported separately from every other kind of write.
pub fn check_update(modifier: &UpdateModifier) -> QeResult<()> {
    match modifier {
        UpdateModifier::Replacement(doc) => check_insert(doc),
        UpdateModifier::Operators(ops) => {
            for op in ops {
                if let Some(violation) = operator_violation(op) {
                    tracing::warn!(operator = op.name(), "refused write to safe-content field");
                    return Err(QeError::SafetyViolation(violation));
                }
            }
            Ok(())
        }
    }
}

fn operator_violation(op: &UpdateOperator) -> Option<SafetyViolation> {
    let hits = |path: &str| touches(path, SAFE_CONTENT_FIELD);
    match op {
        UpdateOperator::Rename(pairs) => pairs
            .iter()
            .any(|(from, to)| hits(from) || hits(to))
            .then_some(SafetyViolation::Rename),
        other => other
            .target_paths()
            .into_iter()
            .any(hits)
            .then_some(SafetyViolation::Modify),
    }
}

/// A copy of `doc` without its safe-content array.
pub fn strip_safe_content(doc: &Document) -> Document {
    doc.without(SAFE_CONTENT_FIELD)
}

/// The markers currently recorded in `doc`.
pub fn safe_content_markers(doc: &Document) -> QeResult<Vec<SafeContentMarker>> {
    match doc.get(SAFE_CONTENT_FIELD) {
        None => Ok(Vec::new()),
        Some(value) => value
            .as_array()
            .ok_or_else(|| QeError::invalid("safe-content field is not an array"))?
            .iter()
            .map(|item| {
                SafeContentMarker::from_value(item)
                    .ok_or_else(|| QeError::invalid("malformed safe-content entry"))
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qe_core::{ErrorCode, Value};

    fn ops(op: UpdateOperator) -> UpdateModifier {
        UpdateModifier::Operators(vec![op])
    }

    fn code(result: QeResult<()>) -> ErrorCode {
        result.unwrap_err().code()
    }

    #[test]
    fn test_rename_rejected_both_ways() {
        let from = ops(UpdateOperator::Rename(vec![(SAFE_CONTENT_FIELD.into(), "x".into())]));
        let to = ops(UpdateOperator::Rename(vec![("x".into(), SAFE_CONTENT_FIELD.into())]));
        assert_eq!(code(check_update(&from)), ErrorCode::SAFE_CONTENT_RENAME);
        assert_eq!(code(check_update(&to)), ErrorCode::SAFE_CONTENT_RENAME);
    }

    #[test]
    fn test_other_writes_rejected() {
        let cases = [
            ops(UpdateOperator::Set(Document::new().with(SAFE_CONTENT_FIELD, vec![Value::Int32(123)]))),
            ops(UpdateOperator::Set(Document::new().with("__safeContent__.0", 1))),
            ops(UpdateOperator::Unset(vec![SAFE_CONTENT_FIELD.into()])),
            ops(UpdateOperator::Inc(Document::new().with("__safeContent__.0", 1))),
            ops(UpdateOperator::Push(vec![(SAFE_CONTENT_FIELD.into(), vec![Value::Null])])),
            ops(UpdateOperator::Pull(vec![(SAFE_CONTENT_FIELD.into(), vec![Value::Null])])),
            UpdateModifier::Replacement(Document::new().with(SAFE_CONTENT_FIELD, Vec::<Value>::new())),
        ];
        for modifier in cases {
            assert_eq!(code(check_update(&modifier)), ErrorCode::SAFE_CONTENT_MODIFY, "{modifier:?}");
        }
    }

    #[test]
    fn test_unrelated_writes_allowed() {
        let modifier = UpdateModifier::Operators(vec![
            UpdateOperator::Set(Document::new().with("__safeContentX", 1)),
            UpdateOperator::Rename(vec![("a".into(), "b".into())]),
        ]);
        check_update(&modifier).unwrap();
        check_insert(&Document::new().with("_id", 1)).unwrap();
    }

    #[test]
    fn test_insert_with_safe_content_rejected() {
        let doc = Document::new().with("_id", 1).with(SAFE_CONTENT_FIELD, Vec::<Value>::new());
        assert_eq!(code(check_insert(&doc)), ErrorCode::SAFE_CONTENT_MODIFY);
    }

    #[test]
    fn test_markers_and_strip() {
        let marker = SafeContentMarker([1u8; 32]);
        let doc = Document::new()
            .with("_id", 1)
            .with(SAFE_CONTENT_FIELD, vec![marker.to_value()]);
        assert_eq!(safe_content_markers(&doc).unwrap(), vec![marker]);
        assert_eq!(strip_safe_content(&doc), Document::new().with("_id", 1));

        let bad = Document::new().with(SAFE_CONTENT_FIELD, vec![Value::Int32(1)]);
        assert!(safe_content_markers(&bad).is_err());
    }
}
