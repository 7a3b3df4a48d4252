//! Audit field filling.
//!
//! Pure payload rewriting: given an entity's capabilities, an operation
//! kind, and the acting identity, merge the bookkeeping fields into a
//! write payload. Caller-supplied values are never overwritten.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::data::capabilities::EntityCapabilities;
use crate::database::engine::JsonMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditOp {
    Create,
    Update,
    /// Synthesizes a soft delete; the dispatcher redirects the result to
    /// a bare update.
    Delete,
}

pub fn fill_audit_fields(
    payload: &mut JsonMap,
    caps: &EntityCapabilities,
    op: AuditOp,
    actor: &str,
) {
    fill_at(payload, caps, op, actor, Utc::now());
}

fn fill_at(
    payload: &mut JsonMap,
    caps: &EntityCapabilities,
    op: AuditOp,
    actor: &str,
    now: DateTime<Utc>,
) {
    let timestamp = Value::String(now.to_rfc3339());
    match op {
        AuditOp::Create => {
            if caps.has_created_at {
                set_if_absent(payload, "createdAt", timestamp.clone());
            }
            if caps.has_created_by {
                set_if_absent(payload, "createdBy", Value::String(actor.to_string()));
            }
            if caps.has_soft_delete {
                set_if_absent(payload, "deleted", Value::Bool(false));
            }
        }
        AuditOp::Update => {
            if caps.has_updated_at {
                set_if_absent(payload, "updatedAt", timestamp.clone());
            }
            if caps.has_updated_by {
                set_if_absent(payload, "updatedBy", Value::String(actor.to_string()));
            }
        }
        AuditOp::Delete => {
            if caps.has_soft_delete {
                payload.insert("deleted".to_string(), Value::Bool(true));
            }
            if caps.has_deleted_at {
                set_if_absent(payload, "deletedAt", timestamp.clone());
            }
            if caps.has_deleted_by {
                set_if_absent(payload, "deletedBy", Value::String(actor.to_string()));
            }
            // A soft delete is also an update
            if caps.has_updated_at {
                set_if_absent(payload, "updatedAt", timestamp);
            }
            if caps.has_updated_by {
                set_if_absent(payload, "updatedBy", Value::String(actor.to_string()));
            }
        }
    }
}

fn set_if_absent(payload: &mut JsonMap, key: &str, value: Value) {
    if !payload.contains_key(key) {
        payload.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn full_caps() -> EntityCapabilities {
        EntityCapabilities {
            has_soft_delete: true,
            has_created_at: true,
            has_created_by: true,
            has_updated_at: true,
            has_updated_by: true,
            has_deleted_at: true,
            has_deleted_by: true,
        }
    }

    fn fixed_now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-06-01T12:00:00Z").unwrap().with_timezone(&Utc)
    }

    #[test]
    fn create_fills_audit_and_soft_delete_default() {
        let mut payload = JsonMap::new();
        payload.insert("name".into(), json!("hello"));
        fill_at(&mut payload, &full_caps(), AuditOp::Create, "alice", fixed_now());
        assert_eq!(payload["createdBy"], json!("alice"));
        assert_eq!(payload["deleted"], json!(false));
        assert!(payload.contains_key("createdAt"));
        assert!(!payload.contains_key("updatedBy"));
    }

    #[test]
    fn update_never_touches_creation_fields() {
        let mut payload = JsonMap::new();
        fill_at(&mut payload, &full_caps(), AuditOp::Update, "bob", fixed_now());
        assert_eq!(payload["updatedBy"], json!("bob"));
        assert!(payload.contains_key("updatedAt"));
        assert!(!payload.contains_key("createdAt"));
        assert!(!payload.contains_key("deleted"));
    }

    #[test]
    fn delete_marks_deleted_and_updates() {
        let mut payload = JsonMap::new();
        fill_at(&mut payload, &full_caps(), AuditOp::Delete, "carol", fixed_now());
        assert_eq!(payload["deleted"], json!(true));
        assert_eq!(payload["deletedBy"], json!("carol"));
        assert!(payload.contains_key("deletedAt"));
        assert_eq!(payload["updatedBy"], json!("carol"));
    }

    #[test]
    fn caller_supplied_values_win() {
        let mut payload = JsonMap::new();
        payload.insert("createdBy".into(), json!("importer"));
        fill_at(&mut payload, &full_caps(), AuditOp::Create, "alice", fixed_now());
        assert_eq!(payload["createdBy"], json!("importer"));
    }

    #[test]
    fn no_capabilities_means_no_mutation() {
        let mut payload = JsonMap::new();
        payload.insert("name".into(), json!("x"));
        fill_at(&mut payload, &EntityCapabilities::default(), AuditOp::Create, "a", fixed_now());
        assert_eq!(payload.len(), 1);
    }

    #[test]
    fn deterministic_given_fixed_clock() {
        let mut a = JsonMap::new();
        let mut b = JsonMap::new();
        fill_at(&mut a, &full_caps(), AuditOp::Create, "x", fixed_now());
        fill_at(&mut b, &full_caps(), AuditOp::Create, "x", fixed_now());
        assert_eq!(a, b);
    }
}
