//! Write-path orchestration for encrypted collections
//!
//! Every write follows the same order: validate, write the primary document,
//! then append index rows. An index position is reserved before the primary
//! write so the stored value can carry it; if a concurrent writer takes that
//! position first, the index append moves to the next free one and the
//! primary document is patched to match.
//!
//! Insert:  enforce → reserve → seal values + markers → insert primary →
//!          existence rows + journal → reconcile moved positions
//! Delete:  single-document check → delete primary (preimage) →
//!          tombstone + journal every stored value
//! Update:  single-document check → enforce → reserve → seal → update primary
//!          (preimage) → tombstone + journal superseded values →
//!          existence rows + journal → drop stale markers, reconcile

use std::collections::HashMap;

use qe_core::config::CrudConfig;
use qe_core::{
    Document, EncryptedFieldConfig, QeError, QeResult, UpdateModifier, UpdateOperator, Value,
    ID_FIELD, SAFE_CONTENT_FIELD,
};
use qe_crypto::{
    collect_insert_payloads, EncryptedFieldValue, EncryptionInformation, IndexedValue,
    SafeContentMarker, KEY_SIZE,
};

use crate::existence::ExistenceIndex;
use crate::journal::CompactionJournal;
use crate::safety;
use crate::store::{QueryInterface, StoreError};
use crate::tombstone::TombstoneIndex;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertOutcome {
    pub inserted: u64,
    pub existence_rows: u64,
    pub journal_rows: u64,
    /// Fields whose reserved position was lost to a concurrent writer
    pub reconciled: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteOpEntry {
    /// Must be exactly `{ _id: <value> }`
    pub filter: Document,
    pub multi: bool,
}

#[derive(Debug, Clone)]
pub struct DeleteRequest {
    pub collection: String,
    pub deletes: Vec<DeleteOpEntry>,
    pub encryption_information: EncryptionInformation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOutcome {
    pub deleted: u64,
    pub tombstones: u64,
    pub journal_rows: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOpEntry {
    /// Must be exactly `{ _id: <value> }`
    pub filter: Document,
    pub modifier: UpdateModifier,
    pub multi: bool,
}

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub collection: String,
    pub updates: Vec<UpdateOpEntry>,
    pub encryption_information: EncryptionInformation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    pub matched: u64,
    pub tombstones: u64,
    pub existence_rows: u64,
    pub journal_rows: u64,
    pub reconciled: u64,
}

/// Handles on the three auxiliary collections for one write.
struct Indexes<'a> {
    existence: ExistenceIndex<'a>,
    tombstone: TombstoneIndex<'a>,
    journal: CompactionJournal<'a>,
}

impl<'a> Indexes<'a> {
    fn new(store: &'a dyn QueryInterface, schema: &'a EncryptedFieldConfig, options: &CrudConfig) -> Self {
        Self {
            existence: ExistenceIndex::new(store, &schema.existence_collection, options.max_index_retries),
            tombstone: TombstoneIndex::new(store, &schema.tombstone_collection, options.max_index_retries),
            journal: CompactionJournal::new(store, &schema.compaction_collection),
        }
    }
}

/// A payload with the existence position reserved for it.
struct Reservation<'p> {
    field: &'p EncryptedFieldValue,
    position: u64,
}

impl Reservation<'_> {
    fn sealed(&self) -> QeResult<Value> {
        Ok(IndexedValue::seal(&self.field.payload, self.position)?.to_value())
    }

    fn marker(&self) -> QeResult<SafeContentMarker> {
        self.field.payload.safe_content_marker(self.position)
    }
}

/// Pick `count + 1` for each payload. Payloads sharing a tag within one write
/// get consecutive positions.
fn reserve<'p>(
    existence: &ExistenceIndex<'_>,
    fields: &'p [EncryptedFieldValue],
) -> QeResult<Vec<Reservation<'p>>> {
    let mut last: HashMap<[u8; KEY_SIZE], u64> = HashMap::new();
    fields
        .iter()
        .map(|field| {
            let tag = field.payload.existence_tag()?;
            let position = match last.get(tag.as_bytes()) {
                Some(previous) => previous + 1,
                None => existence.count(&tag)? + 1,
            };
            last.insert(*tag.as_bytes(), position);
            Ok(Reservation { field, position })
        })
        .collect()
}

/// Check payloads against the schema: known path, matching key and type, and
/// an equality index to maintain.
fn validate_payloads(schema: &EncryptedFieldConfig, fields: &[EncryptedFieldValue]) -> QeResult<()> {
    for EncryptedFieldValue { path, payload } in fields {
        let field = schema
            .field(path)
            .ok_or_else(|| QeError::invalid(format!("field '{path}' is not an encrypted field")))?;
        if field.queries.is_none() {
            return Err(QeError::invalid(format!("field '{path}' has no equality index")));
        }
        if payload.index_key_id != field.key_id {
            return Err(QeError::invalid(format!(
                "field '{path}' payload uses key {} but the schema names {}",
                payload.index_key_id, field.key_id
            )));
        }
        if payload.value_type != field.value_type {
            return Err(QeError::invalid(format!(
                "field '{path}' payload is {:?}, schema says {:?}",
                payload.value_type, field.value_type
            )));
        }
    }
    Ok(())
}

/// Rebuild `doc` with the encrypted values at the given paths replaced.
fn replace_encrypted(doc: &Document, prefix: &str, replacements: &HashMap<String, Value>) -> Document {
    doc.iter()
        .map(|(name, value)| {
            let path = if prefix.is_empty() {
                name.to_string()
            } else {
                format!("{prefix}.{name}")
            };
            let replaced = match value {
                Value::Encrypted(_) => replacements.get(&path).cloned().unwrap_or_else(|| value.clone()),
                Value::Document(child) => Value::Document(replace_encrypted(child, &path, replacements)),
                other => other.clone(),
            };
            (name.to_string(), replaced)
        })
        .collect()
}

fn sealed_values(reservations: &[Reservation<'_>]) -> QeResult<HashMap<String, Value>> {
    reservations
        .iter()
        .map(|r| Ok((r.field.path.clone(), r.sealed()?)))
        .collect()
}

fn markers_value(markers: &[SafeContentMarker]) -> Vec<Value> {
    markers.iter().map(|m| m.to_value()).collect()
}

/// The id of a `{ _id: v }` filter; anything else could match several documents.
fn single_document_id(filter: &Document, multi: bool) -> QeResult<&Value> {
    match (multi, filter.len(), filter.id()) {
        (false, 1, Some(id)) => Ok(id),
        _ => Err(QeError::MultiDocumentUnsupported),
    }
}

fn map_primary_error(err: StoreError, options: &CrudConfig) -> QeError {
    match err {
        StoreError::DuplicateKey { collection } => QeError::DuplicateKey {
            collection,
            code: options.duplicate_key_code,
        },
        StoreError::Backend(msg) => QeError::StorageFailure(msg),
    }
}

/// Append existence and journal rows for every reservation. Returns the
/// server-side fixes needed on the primary document for positions that moved.
fn append_existence(
    indexes: &Indexes<'_>,
    reservations: &[Reservation<'_>],
) -> QeResult<Vec<PositionFix>> {
    let mut fixes = Vec::new();
    for reservation in reservations {
        let payload = &reservation.field.payload;
        let position = indexes.existence.insert(
            &payload.existence_tag()?,
            &payload.existence_value()?,
            Some(reservation.position),
        )?;
        indexes
            .journal
            .append_insert(&reservation.field.path, &payload.encrypted_tokens)?;

        if position != reservation.position {
            tracing::warn!(
                path = %reservation.field.path,
                reserved = reservation.position,
                position,
                "reserved position taken, reconciling"
            );
            let moved = Reservation {
                field: reservation.field,
                position,
            };
            fixes.push(PositionFix {
                path: reservation.field.path.clone(),
                sealed: moved.sealed()?,
                stale: reservation.marker()?,
                fresh: moved.marker()?,
            });
        }
    }
    Ok(fixes)
}

struct PositionFix {
    path: String,
    sealed: Value,
    stale: SafeContentMarker,
    fresh: SafeContentMarker,
}

/// Server-generated follow-up update: rewrite moved values, drop stale markers,
/// add the markers of the moved values.
fn follow_up(fixes: &[PositionFix], mut stale: Vec<SafeContentMarker>) -> Option<UpdateModifier> {
    if fixes.is_empty() && stale.is_empty() {
        return None;
    }
    let mut ops = Vec::new();
    if !fixes.is_empty() {
        ops.push(UpdateOperator::Set(
            fixes.iter().map(|f| (f.path.clone(), f.sealed.clone())).collect(),
        ));
    }
    stale.extend(fixes.iter().map(|f| f.stale));
    ops.push(UpdateOperator::Pull(vec![(SAFE_CONTENT_FIELD.to_string(), markers_value(&stale))]));
    if !fixes.is_empty() {
        let fresh: Vec<_> = fixes.iter().map(|f| f.fresh).collect();
        ops.push(UpdateOperator::Push(vec![(SAFE_CONTENT_FIELD.to_string(), markers_value(&fresh))]));
    }
    Some(UpdateModifier::Operators(ops))
}

/// Insert one client document carrying insert/update payloads.
///
/// `payloads` are the payloads extracted from `doc` (see
/// [`collect_insert_payloads`]); every encrypted value in `doc` must have one.
pub fn process_insert(
    store: &dyn QueryInterface,
    collection: &str,
    payloads: &[EncryptedFieldValue],
    schema: &EncryptedFieldConfig,
    options: &CrudConfig,
    doc: &Document,
) -> QeResult<InsertOutcome> {
    schema.validate()?;
    safety::check_insert(doc)?;
    let id = doc
        .id()
        .ok_or_else(|| QeError::invalid(format!("document has no {ID_FIELD}")))?
        .clone();

    let in_doc = doc.encrypted_fields();
    if in_doc.len() != payloads.len()
        || in_doc
            .iter()
            .zip(payloads)
            .any(|((path, _), field)| *path != field.path)
    {
        return Err(QeError::invalid("payloads do not match the encrypted fields of the document"));
    }
    validate_payloads(schema, payloads)?;

    let indexes = Indexes::new(store, schema, options);
    let reservations = reserve(&indexes.existence, payloads)?;

    let mut stored = replace_encrypted(doc, "", &sealed_values(&reservations)?);
    if !reservations.is_empty() {
        let markers = reservations
            .iter()
            .map(Reservation::marker)
            .collect::<QeResult<Vec<_>>>()?;
        stored.insert(SAFE_CONTENT_FIELD, markers_value(&markers));
    }

    store
        .insert_document(collection, stored, options.translate_duplicate_key)
        .map_err(|e| map_primary_error(e, options))?;

    let fixes = append_existence(&indexes, &reservations)?;
    if let Some(modifier) = follow_up(&fixes, Vec::new()) {
        store.update_with_preimage(collection, &id, &modifier)?;
    }

    let outcome = InsertOutcome {
        inserted: 1,
        existence_rows: reservations.len() as u64,
        journal_rows: reservations.len() as u64,
        reconciled: fixes.len() as u64,
    };
    tracing::info!(
        collection,
        fields = reservations.len(),
        reconciled = outcome.reconciled,
        "processed encrypted insert"
    );
    Ok(outcome)
}

/// Tombstone and journal one stored value removed from the primary
/// collection. Returns its safe-content marker.
fn retire_value(
    indexes: &Indexes<'_>,
    info: &EncryptionInformation,
    path: &str,
    blob: &[u8],
) -> QeResult<SafeContentMarker> {
    let tokens = info.tokens_for(path)?;
    let fields = IndexedValue::from_blob(blob)?.open(&tokens.server)?;
    let tombstone_position = indexes.tombstone.tombstone(
        &fields.tombstone_tag()?,
        &fields.tombstone_value()?,
        fields.position,
    )?;
    indexes
        .journal
        .append_delete(path, &tokens.compaction, &fields.tombstone_token)?;
    tracing::debug!(
        path,
        position = fields.position,
        tombstone_position,
        "tombstoned stored value"
    );
    fields.safe_content_marker()
}

/// Delete one document by `_id`, tombstoning every encrypted value it held.
pub fn process_delete(
    store: &dyn QueryInterface,
    request: &DeleteRequest,
    options: &CrudConfig,
) -> QeResult<DeleteOutcome> {
    let [entry] = request.deletes.as_slice() else {
        return Err(QeError::MultiDocumentUnsupported);
    };
    let id = single_document_id(&entry.filter, entry.multi)?;
    let info = &request.encryption_information;
    info.schema.validate()?;
    info.require_all()?;

    let Some(preimage) = store.delete_with_preimage(&request.collection, id)? else {
        tracing::debug!(collection = %request.collection, "delete matched nothing");
        return Ok(DeleteOutcome::default());
    };

    let indexes = Indexes::new(store, &info.schema, options);
    let mut outcome = DeleteOutcome {
        deleted: 1,
        ..Default::default()
    };
    for (path, blob) in preimage.encrypted_fields() {
        retire_value(&indexes, info, &path, blob)?;
        outcome.tombstones += 1;
        outcome.journal_rows += 1;
    }

    tracing::info!(
        collection = %request.collection,
        tombstones = outcome.tombstones,
        "processed encrypted delete"
    );
    Ok(outcome)
}

/// Payloads carried by a client modifier: the whole replacement document, or
/// the values of `$set`. Encrypted values anywhere else are refused.
fn modifier_payloads(modifier: &UpdateModifier) -> QeResult<Vec<EncryptedFieldValue>> {
    match modifier {
        UpdateModifier::Replacement(doc) => collect_insert_payloads(doc),
        UpdateModifier::Operators(ops) => {
            let mut out = Vec::new();
            for op in ops {
                match op {
                    UpdateOperator::Set(fields) => out.extend(collect_insert_payloads(fields)?),
                    UpdateOperator::Inc(fields) if !fields.encrypted_fields().is_empty() => {
                        return Err(QeError::invalid("$inc cannot carry encrypted values"))
                    }
                    UpdateOperator::Push(entries) | UpdateOperator::Pull(entries)
                        if entries
                            .iter()
                            .flat_map(|(_, values)| values)
                            .any(|v| matches!(v, Value::Encrypted(_))) =>
                    {
                        return Err(QeError::invalid(format!(
                            "{} cannot carry encrypted values",
                            op.name()
                        )))
                    }
                    _ => {}
                }
            }
            Ok(out)
        }
    }
}

/// The modifier actually applied to the primary document: client values
/// replaced by sealed ones plus the new safe-content markers.
fn server_modifier(
    modifier: &UpdateModifier,
    sealed: &HashMap<String, Value>,
    markers: Vec<Value>,
) -> UpdateModifier {
    match modifier {
        UpdateModifier::Replacement(doc) => {
            let mut replacement = replace_encrypted(doc, "", sealed);
            if !markers.is_empty() {
                replacement.insert(SAFE_CONTENT_FIELD, markers);
            }
            UpdateModifier::Replacement(replacement)
        }
        UpdateModifier::Operators(ops) => {
            let mut ops: Vec<UpdateOperator> = ops
                .iter()
                .map(|op| match op {
                    UpdateOperator::Set(fields) => UpdateOperator::Set(replace_encrypted(fields, "", sealed)),
                    other => other.clone(),
                })
                .collect();
            if !markers.is_empty() {
                ops.push(UpdateOperator::Push(vec![(SAFE_CONTENT_FIELD.to_string(), markers)]));
            }
            UpdateModifier::Operators(ops)
        }
    }
}

/// Update one document by `_id`.
///
/// Every stored value that does not survive unchanged into the post-image is
/// tombstoned, including values overwritten with the same plaintext.
pub fn process_update(
    store: &dyn QueryInterface,
    request: &UpdateRequest,
    options: &CrudConfig,
) -> QeResult<UpdateOutcome> {
    let [entry] = request.updates.as_slice() else {
        return Err(QeError::MultiDocumentUnsupported);
    };
    let id = single_document_id(&entry.filter, entry.multi)?;
    safety::check_update(&entry.modifier)?;

    let info = &request.encryption_information;
    let schema = &info.schema;
    schema.validate()?;
    info.require_all()?;

    if let UpdateModifier::Operators(ops) = &entry.modifier {
        for op in ops {
            if let UpdateOperator::Rename(pairs) = op {
                if let Some(field) = schema.fields.iter().find(|f| {
                    pairs.iter().any(|(from, to)| {
                        qe_core::update::touches(from, &f.path) || qe_core::update::touches(to, &f.path)
                    })
                }) {
                    return Err(QeError::invalid(format!(
                        "cannot rename encrypted field '{}'",
                        field.path
                    )));
                }
            }
        }
    }

    let payloads = modifier_payloads(&entry.modifier)?;
    validate_payloads(schema, &payloads)?;

    let indexes = Indexes::new(store, schema, options);
    let reservations = reserve(&indexes.existence, &payloads)?;
    let markers = reservations
        .iter()
        .map(Reservation::marker)
        .collect::<QeResult<Vec<_>>>()?;
    let modifier = server_modifier(&entry.modifier, &sealed_values(&reservations)?, markers_value(&markers));

    let Some(preimage) = store.update_with_preimage(&request.collection, id, &modifier)? else {
        tracing::debug!(collection = %request.collection, "update matched nothing");
        return Ok(UpdateOutcome::default());
    };
    // A concurrent delete leaves no post-image; every old value is then gone.
    let postimage = store.get_by_id(&request.collection, id)?.unwrap_or_default();

    let mut outcome = UpdateOutcome {
        matched: 1,
        ..Default::default()
    };
    let mut stale = Vec::new();
    for (path, blob) in preimage.encrypted_fields() {
        let unchanged = matches!(
            postimage.get_path(&path),
            Some(Value::Encrypted(current)) if current.as_slice() == blob
        );
        if unchanged {
            continue;
        }
        stale.push(retire_value(&indexes, info, &path, blob)?);
        outcome.tombstones += 1;
        outcome.journal_rows += 1;
    }

    let fixes = append_existence(&indexes, &reservations)?;
    outcome.existence_rows = reservations.len() as u64;
    outcome.journal_rows += reservations.len() as u64;
    outcome.reconciled = fixes.len() as u64;

    // Replacements already carry a fresh array; only moved positions need fixing.
    if matches!(entry.modifier, UpdateModifier::Replacement(_)) {
        stale.clear();
    }
    if let Some(follow) = follow_up(&fixes, stale) {
        store.update_with_preimage(&request.collection, id, &follow)?;
    }

    tracing::info!(
        collection = %request.collection,
        tombstones = outcome.tombstones,
        existence_rows = outcome.existence_rows,
        reconciled = outcome.reconciled,
        "processed encrypted update"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_document_filter() {
        let by_id = Document::new().with("_id", 1);
        assert_eq!(single_document_id(&by_id, false).unwrap(), &Value::Int32(1));

        assert!(matches!(
            single_document_id(&by_id, true),
            Err(QeError::MultiDocumentUnsupported)
        ));
        let by_other = Document::new().with("name", "x");
        assert!(single_document_id(&by_other, false).is_err());
        let compound = Document::new().with("_id", 1).with("name", "x");
        assert!(single_document_id(&compound, false).is_err());
    }

    #[test]
    fn test_replace_encrypted_by_path() {
        let doc = Document::new()
            .with("_id", 1)
            .with("a", Value::Encrypted(vec![4, 1]))
            .with("nested", Document::new().with("b", Value::Encrypted(vec![4, 2])))
            .with("keep", Value::Encrypted(vec![4, 3]));
        let mut replacements = HashMap::new();
        replacements.insert("a".to_string(), Value::Encrypted(vec![7, 1]));
        replacements.insert("nested.b".to_string(), Value::Encrypted(vec![7, 2]));

        let out = replace_encrypted(&doc, "", &replacements);
        assert_eq!(out.get("a"), Some(&Value::Encrypted(vec![7, 1])));
        assert_eq!(out.get_path("nested.b"), Some(&Value::Encrypted(vec![7, 2])));
        assert_eq!(out.get("keep"), Some(&Value::Encrypted(vec![4, 3])));
        assert_eq!(out.keys().collect::<Vec<_>>(), vec!["_id", "a", "nested", "keep"]);
    }

    #[test]
    fn test_follow_up_shape() {
        assert!(follow_up(&[], Vec::new()).is_none());

        let stale = SafeContentMarker([1u8; 32]);
        let Some(UpdateModifier::Operators(ops)) = follow_up(&[], vec![stale]) else {
            panic!("expected operators");
        };
        assert_eq!(
            ops,
            vec![UpdateOperator::Pull(vec![(
                SAFE_CONTENT_FIELD.to_string(),
                vec![stale.to_value()]
            )])]
        );
    }

    #[test]
    fn test_encrypted_values_outside_set_refused() {
        let modifier = UpdateModifier::Operators(vec![UpdateOperator::Push(vec![(
            "list".into(),
            vec![Value::Encrypted(vec![4, 0])],
        )])]);
        assert!(modifier_payloads(&modifier).is_err());

        let plain = UpdateModifier::Operators(vec![UpdateOperator::Set(Document::new().with("x", 1))]);
        assert!(modifier_payloads(&plain).unwrap().is_empty());
    }
}
