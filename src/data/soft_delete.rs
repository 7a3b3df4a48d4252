//! Soft-delete read filtering and result shaping.
//!
//! Pure argument/record rewriting. Injects the `deleted = false`
//! predicate into default-mode reads, honors the `includeDeleted`
//! opt-out (stripping the flag before it reaches an engine), and strips
//! deletion bookkeeping fields from records handed back to default-mode
//! callers.

use serde_json::{json, Value};

use crate::data::capabilities::EntityCapabilities;
use crate::database::engine::{JsonMap, QueryArgs};

/// Rewrite list/aggregate query arguments. Consumes the `includeDeleted`
/// flag and returns whether it was requested, so result shaping can honor
/// the same choice.
pub fn apply_read_filter(caps: &EntityCapabilities, args: &mut QueryArgs) -> bool {
    let include_deleted = std::mem::take(&mut args.include_deleted);
    if !caps.has_soft_delete || include_deleted {
        return include_deleted;
    }
    if constrains_deleted(args.where_clause.as_ref()) {
        return false;
    }
    args.where_clause = Some(match args.where_clause.take() {
        Some(existing) if existing != Value::Null && existing != json!({}) => {
            json!({ "$and": [existing, { "deleted": false }] })
        }
        _ => json!({ "deleted": false }),
    });
    false
}

/// Rewrite a unique-lookup key. Unique predicates are equality-only maps
/// with no boolean grouping, so the deletion constraint is merged into
/// the key directly.
pub fn apply_unique_filter(caps: &EntityCapabilities, key: &mut JsonMap, include_deleted: bool) {
    if !caps.has_soft_delete || include_deleted || key.contains_key("deleted") {
        return;
    }
    key.insert("deleted".to_string(), Value::Bool(false));
}

fn constrains_deleted(where_clause: Option<&Value>) -> bool {
    where_clause
        .and_then(Value::as_object)
        .is_some_and(|obj| obj.contains_key("deleted"))
}

/// Strip deletion bookkeeping from a record handed to a default-mode
/// caller. No-op when soft delete is off or inclusion was requested.
pub fn shape_record(record: &mut JsonMap, caps: &EntityCapabilities, include_deleted: bool) {
    if !caps.has_soft_delete || include_deleted {
        return;
    }
    record.remove("deleted");
    record.remove("deletedAt");
    record.remove("deletedBy");
}

pub fn shape_records(records: &mut [JsonMap], caps: &EntityCapabilities, include_deleted: bool) {
    for record in records {
        shape_record(record, caps, include_deleted);
    }
}
