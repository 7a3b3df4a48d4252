//! Entity capability map.
//!
//! Entity definitions are plain text files containing blocks of the shape
//! `entity Name { ... }`. At startup the bodies are scanned for the
//! audit/soft-delete bookkeeping fields, producing one capability
//! descriptor per entity. The map is built once per process and cached;
//! an unreadable schema degrades to an empty map, which disables all
//! audit and soft-delete behavior instead of crashing.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;
use tracing::warn;

use crate::config::config;

/// Which bookkeeping fields an entity actually declares. Everything
/// defaults to off, so an unknown entity is a plain passthrough.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EntityCapabilities {
    pub has_soft_delete: bool,
    pub has_created_at: bool,
    pub has_created_by: bool,
    pub has_updated_at: bool,
    pub has_updated_by: bool,
    pub has_deleted_at: bool,
    pub has_deleted_by: bool,
}

/// Process-wide capability map, built on first access.
pub fn capabilities_map() -> &'static HashMap<String, EntityCapabilities> {
    static MAP: OnceLock<HashMap<String, EntityCapabilities>> = OnceLock::new();
    MAP.get_or_init(build_capabilities)
}

/// Descriptor for one entity; unknown entities get the empty descriptor.
pub fn capabilities_for(entity: &str) -> EntityCapabilities {
    capabilities_map().get(entity).copied().unwrap_or_default()
}

fn build_capabilities() -> HashMap<String, EntityCapabilities> {
    let sources = read_schema_sources();
    let map = parse_entities(&sources.join("\n"));
    if map.is_empty() {
        warn!("No entity definitions found; audit/soft-delete behavior is disabled");
    }
    map
}

/// Every `.entity` fragment under the models directory (recursive, in
/// filesystem order), falling back to the root schema file when the
/// directory yields nothing. Unreadable fragments are logged and skipped.
fn read_schema_sources() -> Vec<String> {
    let schema = &config().schema;
    let mut sources = Vec::new();
    collect_fragments(Path::new(&schema.models_dir), &mut sources);
    if sources.is_empty() {
        match fs::read_to_string(&schema.root_file) {
            Ok(text) => sources.push(text),
            Err(e) => warn!("Failed to read schema root file {}: {}", schema.root_file, e),
        }
    }
    sources
}

fn collect_fragments(dir: &Path, out: &mut Vec<String>) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("Failed to read schema directory {}: {}", dir.display(), e);
            return;
        }
    };
    let mut paths: Vec<_> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    paths.sort();
    for path in paths {
        if path.is_dir() {
            collect_fragments(&path, out);
        } else if path.extension().is_some_and(|ext| ext == "entity") {
            match fs::read_to_string(&path) {
                Ok(text) => out.push(text),
                Err(e) => warn!("Failed to read schema fragment {}: {}", path.display(), e),
            }
        }
    }
}

/// Scan schema text for `entity Name { ... }` blocks. A field is present
/// when a body line begins with the field name followed by whitespace;
/// soft delete additionally requires the `deleted` field to be a Boolean.
pub fn parse_entities(source: &str) -> HashMap<String, EntityCapabilities> {
    let mut out = HashMap::new();
    let mut lines = source.lines();
    while let Some(line) = lines.next() {
        let trimmed = line.trim();
        let Some(rest) = trimmed.strip_prefix("entity ") else { continue };
        let Some(name) = rest
            .split(|c: char| c == '{' || c.is_whitespace())
            .next()
            .filter(|s| !s.is_empty())
        else {
            continue;
        };

        let mut body = Vec::new();
        for body_line in lines.by_ref() {
            if body_line.trim_start().starts_with('}') {
                break;
            }
            body.push(body_line.trim().to_string());
        }

        out.insert(name.to_string(), caps_from_body(&body));
    }
    out
}

fn caps_from_body(body: &[String]) -> EntityCapabilities {
    EntityCapabilities {
        has_soft_delete: field_type(body, "deleted").is_some_and(|t| t == "Boolean"),
        has_created_at: has_field(body, "createdAt"),
        has_created_by: has_field(body, "createdBy"),
        has_updated_at: has_field(body, "updatedAt"),
        has_updated_by: has_field(body, "updatedBy"),
        has_deleted_at: has_field(body, "deletedAt"),
        has_deleted_by: has_field(body, "deletedBy"),
    }
}

fn has_field(body: &[String], field: &str) -> bool {
    body.iter().any(|line| {
        line.strip_prefix(field)
            .is_some_and(|rest| rest.starts_with(|c: char| c.is_whitespace()))
    })
}

fn field_type<'a>(body: &'a [String], field: &str) -> Option<&'a str> {
    body.iter().find_map(|line| {
        let rest = line.strip_prefix(field)?;
        if !rest.starts_with(|c: char| c.is_whitespace()) {
            return None;
        }
        rest.split_whitespace().next()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMA: &str = r#"
entity Conversation {
  id            String   @id
  name          String
  messageCount  Int
  deleted       Boolean  @default(false)
  deletedAt     DateTime?
  deletedBy     String?
  createdAt     DateTime @default(now())
  createdBy     String
  updatedAt     DateTime @updatedAt
  updatedBy     String
}

entity AuditLog {
  id        String @id
  createdAt DateTime
}
"#;

    #[test]
    fn parses_capability_fields() {
        let map = parse_entities(SCHEMA);
        let conv = map["Conversation"];
        assert!(conv.has_soft_delete);
        assert!(conv.has_created_at && conv.has_created_by);
        assert!(conv.has_updated_at && conv.has_updated_by);
        assert!(conv.has_deleted_at && conv.has_deleted_by);

        let log = map["AuditLog"];
        assert!(!log.has_soft_delete);
        assert!(log.has_created_at);
        assert!(!log.has_created_by);
    }

    #[test]
    fn soft_delete_requires_boolean_type() {
        let map = parse_entities("entity X {\n  deleted String\n  deletedAt DateTime\n}\n");
        assert!(!map["X"].has_soft_delete);
        assert!(map["X"].has_deleted_at);
    }

    #[test]
    fn field_name_must_be_followed_by_whitespace() {
        let map = parse_entities("entity Y {\n  deletedReason String\n  createdAtHint Int\n}\n");
        assert!(!map["Y"].has_soft_delete);
        assert!(!map["Y"].has_created_at);
    }

    #[test]
    fn empty_or_garbage_source_yields_empty_map() {
        assert!(parse_entities("").is_empty());
        assert!(parse_entities("not a schema at all").is_empty());
    }

    #[test]
    fn map_is_built_once() {
        let first = capabilities_map() as *const _;
        let second = capabilities_map() as *const _;
        assert!(std::ptr::eq(first, second));
    }
}
