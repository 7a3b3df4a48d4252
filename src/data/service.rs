//! Query interception dispatcher.
//!
//! One facade serves every entity: each operation looks up the target
//! entity's capability descriptor, runs the audit filler or soft-delete
//! filter, and delegates to the bare storage connection. Soft deletes are
//! synthesized as updates and sent straight to the bare engine, never
//! back through this facade, so update-audit semantics are applied
//! exactly once and the dispatcher cannot loop.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::data::actor::current_actor;
use crate::data::audit::{fill_audit_fields, AuditOp};
use crate::data::capabilities::{capabilities_map, EntityCapabilities};
use crate::data::error::DataError;
use crate::data::soft_delete::{
    apply_read_filter, apply_unique_filter, shape_record, shape_records,
};
use crate::database::engine::{
    AggregateOp, JsonMap, QueryArgs, StorageConn, StorageEngine, StorageTransaction,
};

/// Entry point for all intercepted data access. Cheap to clone.
#[derive(Clone)]
pub struct DataService {
    engine: Arc<dyn StorageEngine>,
    caps: Arc<HashMap<String, EntityCapabilities>>,
}

impl DataService {
    /// Service backed by the process-wide capability map.
    pub fn new(engine: Arc<dyn StorageEngine>) -> Self {
        Self { engine, caps: Arc::new(capabilities_map().clone()) }
    }

    /// Service with an explicit capability map (tests, tooling).
    pub fn with_capabilities(
        engine: Arc<dyn StorageEngine>,
        caps: HashMap<String, EntityCapabilities>,
    ) -> Self {
        Self { engine, caps: Arc::new(caps) }
    }

    /// Intercepted operations against one entity, auto-commit mode.
    pub fn entity(&self, name: &str) -> EntitySet<'_> {
        EntitySet {
            conn: self.engine.as_ref(),
            entity: name.to_string(),
            caps: self.caps.get(name).copied().unwrap_or_default(),
        }
    }

    /// Open a transaction; operations on the returned handle see the same
    /// interception semantics and commit or roll back as one unit.
    pub async fn begin(&self) -> Result<DataTransaction, DataError> {
        let tx = self.engine.begin().await?;
        Ok(DataTransaction { tx, caps: Arc::clone(&self.caps) })
    }

    /// Raw escapes, no interception.
    pub async fn raw_query(
        &self,
        sql: &str,
        params: Vec<Value>,
    ) -> Result<Vec<JsonMap>, DataError> {
        Ok(self.engine.raw_query(sql, params).await?)
    }

    pub async fn raw_execute(&self, sql: &str, params: Vec<Value>) -> Result<u64, DataError> {
        Ok(self.engine.raw_execute(sql, params).await?)
    }
}

/// A live transaction with the same per-entity facade.
pub struct DataTransaction {
    tx: Box<dyn StorageTransaction>,
    caps: Arc<HashMap<String, EntityCapabilities>>,
}

impl DataTransaction {
    pub fn entity(&self, name: &str) -> EntitySet<'_> {
        EntitySet {
            conn: self.tx.as_ref(),
            entity: name.to_string(),
            caps: self.caps.get(name).copied().unwrap_or_default(),
        }
    }

    pub async fn commit(self) -> Result<(), DataError> {
        Ok(self.tx.commit().await?)
    }

    pub async fn rollback(self) -> Result<(), DataError> {
        Ok(self.tx.rollback().await?)
    }
}

/// Intercepted operation set for one entity over one connection.
pub struct EntitySet<'a> {
    conn: &'a dyn StorageConn,
    entity: String,
    caps: EntityCapabilities,
}

impl<'a> EntitySet<'a> {
    pub async fn create(&self, mut payload: JsonMap) -> Result<JsonMap, DataError> {
        fill_audit_fields(&mut payload, &self.caps, AuditOp::Create, &current_actor());
        Ok(self.conn.insert(&self.entity, payload).await?)
    }

    pub async fn create_many(&self, mut rows: Vec<JsonMap>) -> Result<u64, DataError> {
        let actor = current_actor();
        for row in &mut rows {
            fill_audit_fields(row, &self.caps, AuditOp::Create, &actor);
        }
        Ok(self.conn.insert_many(&self.entity, rows).await?)
    }

    pub async fn update(&self, where_clause: &Value, mut set: JsonMap) -> Result<JsonMap, DataError> {
        fill_audit_fields(&mut set, &self.caps, AuditOp::Update, &current_actor());
        Ok(self.conn.update(&self.entity, where_clause, set).await?)
    }

    pub async fn update_many(&self, where_clause: &Value, mut set: JsonMap) -> Result<u64, DataError> {
        fill_audit_fields(&mut set, &self.caps, AuditOp::Update, &current_actor());
        Ok(self.conn.update_many(&self.entity, where_clause, set).await?)
    }

    /// Soft delete when the entity supports it (synthesized as a bare
    /// update), physical delete otherwise.
    pub async fn delete(&self, where_clause: &Value) -> Result<JsonMap, DataError> {
        if !self.caps.has_soft_delete {
            return Ok(self.conn.delete(&self.entity, where_clause).await?);
        }
        let mut set = JsonMap::new();
        fill_audit_fields(&mut set, &self.caps, AuditOp::Delete, &current_actor());
        Ok(self.conn.update(&self.entity, where_clause, set).await?)
    }

    pub async fn delete_many(&self, where_clause: &Value) -> Result<u64, DataError> {
        if !self.caps.has_soft_delete {
            return Ok(self.conn.delete_many(&self.entity, where_clause).await?);
        }
        let mut set = JsonMap::new();
        fill_audit_fields(&mut set, &self.caps, AuditOp::Delete, &current_actor());
        Ok(self.conn.update_many(&self.entity, where_clause, set).await?)
    }

    /// Physical delete, regardless of soft-delete capability.
    pub async fn hard_delete(&self, where_clause: &Value) -> Result<JsonMap, DataError> {
        Ok(self.conn.delete(&self.entity, where_clause).await?)
    }

    pub async fn hard_delete_many(&self, where_clause: &Value) -> Result<u64, DataError> {
        Ok(self.conn.delete_many(&self.entity, where_clause).await?)
    }

    pub async fn find_many(&self, mut args: QueryArgs) -> Result<Vec<JsonMap>, DataError> {
        let include_deleted = apply_read_filter(&self.caps, &mut args);
        let mut rows = self.conn.find_many(&self.entity, &args).await?;
        shape_records(&mut rows, &self.caps, include_deleted);
        Ok(rows)
    }

    pub async fn find_first(&self, mut args: QueryArgs) -> Result<Option<JsonMap>, DataError> {
        let include_deleted = apply_read_filter(&self.caps, &mut args);
        let mut row = self.conn.find_first(&self.entity, &args).await?;
        if let Some(record) = row.as_mut() {
            shape_record(record, &self.caps, include_deleted);
        }
        Ok(row)
    }

    pub async fn find_unique(
        &self,
        mut key: JsonMap,
        include_deleted: bool,
    ) -> Result<Option<JsonMap>, DataError> {
        apply_unique_filter(&self.caps, &mut key, include_deleted);
        let mut row = self.conn.find_unique(&self.entity, &key).await?;
        if let Some(record) = row.as_mut() {
            shape_record(record, &self.caps, include_deleted);
        }
        Ok(row)
    }

    /// Unique lookup that errors on absence. When the target exists but
    /// is soft-deleted and inclusion was not requested, the error says so.
    pub async fn find_unique_or_throw(
        &self,
        key: JsonMap,
        include_deleted: bool,
    ) -> Result<JsonMap, DataError> {
        let bare_key = key.clone();
        if let Some(row) = self.find_unique(key, include_deleted).await? {
            return Ok(row);
        }
        let soft_deleted = self.caps.has_soft_delete
            && !include_deleted
            && self.conn.find_unique(&self.entity, &bare_key).await?.is_some();
        Err(DataError::NotFound { entity: self.entity.clone(), soft_deleted })
    }

    pub async fn count(&self, mut args: QueryArgs) -> Result<i64, DataError> {
        apply_read_filter(&self.caps, &mut args);
        Ok(self.conn.count(&self.entity, &args).await?)
    }

    pub async fn aggregate(
        &self,
        mut args: QueryArgs,
        aggs: &[AggregateOp],
    ) -> Result<JsonMap, DataError> {
        apply_read_filter(&self.caps, &mut args);
        Ok(self.conn.aggregate(&self.entity, &args, aggs).await?)
    }

    pub async fn group_by(
        &self,
        mut args: QueryArgs,
        by: &[String],
        aggs: &[AggregateOp],
    ) -> Result<Vec<JsonMap>, DataError> {
        apply_read_filter(&self.caps, &mut args);
        Ok(self.conn.group_by(&self.entity, &args, by, aggs).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::memory::MemoryEngine;
    use serde_json::json;

    fn soft_caps() -> HashMap<String, EntityCapabilities> {
        let mut map = HashMap::new();
        map.insert(
            "Conversation".to_string(),
            EntityCapabilities {
                has_soft_delete: true,
                has_created_at: true,
                has_created_by: true,
                has_updated_at: true,
                has_updated_by: true,
                has_deleted_at: true,
                has_deleted_by: true,
            },
        );
        map
    }

    fn service() -> (DataService, MemoryEngine) {
        let engine = MemoryEngine::new();
        let svc = DataService::with_capabilities(Arc::new(engine.clone()), soft_caps());
        (svc, engine)
    }

    fn row(v: Value) -> JsonMap {
        v.as_object().cloned().unwrap_or_default()
    }

    #[tokio::test]
    async fn delete_redirects_to_update_for_soft_entities() {
        let (svc, engine) = service();
        let set = svc.entity("Conversation");
        set.create(row(json!({ "id": "c1" }))).await.unwrap();
        set.delete(&json!({ "id": "c1" })).await.unwrap();

        let physical = engine.table_snapshot("Conversation").await;
        assert_eq!(physical.len(), 1);
        assert_eq!(physical[0]["deleted"], json!(true));
        assert!(physical[0].contains_key("deletedAt"));
    }

    #[tokio::test]
    async fn unknown_entity_is_a_passthrough() {
        let (svc, engine) = service();
        let set = svc.entity("Session");
        set.create(row(json!({ "id": "s1" }))).await.unwrap();

        let physical = engine.table_snapshot("Session").await;
        assert_eq!(physical[0].len(), 1); // no audit fields added

        set.delete(&json!({ "id": "s1" })).await.unwrap();
        assert!(engine.table_snapshot("Session").await.is_empty()); // physical delete
    }

    #[tokio::test]
    async fn unique_miss_vs_soft_deleted_error() {
        let (svc, _) = service();
        let set = svc.entity("Conversation");
        set.create(row(json!({ "id": "c1" }))).await.unwrap();
        set.delete(&json!({ "id": "c1" })).await.unwrap();

        let missing = set.find_unique_or_throw(row(json!({ "id": "zzz" })), false).await;
        assert_eq!(missing.unwrap_err().to_string(), "Conversation not found");

        let soft = set.find_unique_or_throw(row(json!({ "id": "c1" })), false).await;
        assert_eq!(soft.unwrap_err().to_string(), "Conversation not found (soft-deleted)");

        let opted_in = set.find_unique_or_throw(row(json!({ "id": "c1" })), true).await.unwrap();
        assert_eq!(opted_in["deleted"], json!(true));
    }

    #[tokio::test]
    async fn count_excludes_soft_deleted() {
        let (svc, _) = service();
        let set = svc.entity("Conversation");
        set.create(row(json!({ "id": "a" }))).await.unwrap();
        set.create(row(json!({ "id": "b" }))).await.unwrap();
        set.delete(&json!({ "id": "a" })).await.unwrap();

        assert_eq!(set.count(QueryArgs::default()).await.unwrap(), 1);
        assert_eq!(set.count(QueryArgs::default().with_deleted()).await.unwrap(), 2);
    }
}
