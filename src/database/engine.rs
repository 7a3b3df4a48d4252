//! Storage engine boundary.
//!
//! Everything above this seam works with dynamic records
//! (`serde_json::Map`) and the JSON where grammar from
//! [`crate::database::filter`]. Engines execute bare CRUD; they apply no
//! audit or soft-delete policy of their own — that is the interception
//! layer's job.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::database::filter::FilterError;

pub type JsonMap = serde_json::Map<String, Value>;

/// Errors surfaced by storage engines. Interception never wraps or
/// swallows these; they propagate to the caller verbatim.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A single-row update/delete matched nothing.
    #[error("{entity}: target row not found")]
    TargetNotFound { entity: String },

    #[error("Query error: {0}")]
    Query(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}

/// Arguments accepted by every read/aggregate operation on the public
/// surface. `include_deleted` is consumed by the interception layer and
/// reset before the query reaches an engine.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct QueryArgs {
    pub select: Option<Vec<String>>,
    #[serde(rename = "where")]
    pub where_clause: Option<Value>,
    pub order: Option<Value>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    #[serde(rename = "includeDeleted")]
    pub include_deleted: bool,
}

impl QueryArgs {
    pub fn filtered(where_clause: Value) -> Self {
        Self { where_clause: Some(where_clause), ..Self::default() }
    }

    pub fn with_order(mut self, order: Value) -> Self {
        self.order = Some(order);
        self
    }

    pub fn with_limit(mut self, limit: i64, offset: Option<i64>) -> Self {
        self.limit = Some(limit);
        self.offset = offset;
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }
}

/// Aggregate computations for `aggregate`/`group_by`. Result keys follow
/// the `_count` / `_sum_<field>` convention.
#[derive(Debug, Clone)]
pub enum AggregateOp {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
}

impl AggregateOp {
    pub fn result_key(&self) -> String {
        match self {
            AggregateOp::Count => "_count".to_string(),
            AggregateOp::Sum(f) => format!("_sum_{f}"),
            AggregateOp::Avg(f) => format!("_avg_{f}"),
            AggregateOp::Min(f) => format!("_min_{f}"),
            AggregateOp::Max(f) => format!("_max_{f}"),
        }
    }

    pub fn field(&self) -> Option<&str> {
        match self {
            AggregateOp::Count => None,
            AggregateOp::Sum(f) | AggregateOp::Avg(f) | AggregateOp::Min(f)
            | AggregateOp::Max(f) => Some(f),
        }
    }
}

/// In an update payload, a value of the shape `{"$inc": n}` is applied as
/// an atomic in-place increment rather than an assignment.
pub fn increment_of(value: &Value) -> Option<f64> {
    value.as_object().filter(|o| o.len() == 1)?.get("$inc")?.as_f64()
}

/// One connection-like handle: either an engine executing each operation
/// in auto-commit mode, or a live transaction. Object safe so the
/// dispatcher can serve both through the same facade.
#[async_trait]
pub trait StorageConn: Send + Sync {
    async fn insert(&self, entity: &str, row: JsonMap) -> Result<JsonMap, EngineError>;
    async fn insert_many(&self, entity: &str, rows: Vec<JsonMap>) -> Result<u64, EngineError>;

    /// Update the single row matching `where_clause`; errors with
    /// [`EngineError::TargetNotFound`] when nothing matches.
    async fn update(
        &self,
        entity: &str,
        where_clause: &Value,
        set: JsonMap,
    ) -> Result<JsonMap, EngineError>;
    async fn update_many(
        &self,
        entity: &str,
        where_clause: &Value,
        set: JsonMap,
    ) -> Result<u64, EngineError>;

    /// Physical single-row delete, returning the removed row.
    async fn delete(&self, entity: &str, where_clause: &Value) -> Result<JsonMap, EngineError>;
    async fn delete_many(&self, entity: &str, where_clause: &Value) -> Result<u64, EngineError>;

    async fn find_many(&self, entity: &str, args: &QueryArgs) -> Result<Vec<JsonMap>, EngineError>;
    async fn find_first(
        &self,
        entity: &str,
        args: &QueryArgs,
    ) -> Result<Option<JsonMap>, EngineError>;

    /// Unique lookup: `key` is an equality-only predicate map.
    async fn find_unique(&self, entity: &str, key: &JsonMap)
        -> Result<Option<JsonMap>, EngineError>;

    async fn count(&self, entity: &str, args: &QueryArgs) -> Result<i64, EngineError>;
    async fn aggregate(
        &self,
        entity: &str,
        args: &QueryArgs,
        aggs: &[AggregateOp],
    ) -> Result<JsonMap, EngineError>;
    async fn group_by(
        &self,
        entity: &str,
        args: &QueryArgs,
        by: &[String],
        aggs: &[AggregateOp],
    ) -> Result<Vec<JsonMap>, EngineError>;

    /// Raw escapes. Parameter placeholders use the engine's native syntax.
    async fn raw_query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<JsonMap>, EngineError>;
    async fn raw_execute(&self, sql: &str, params: Vec<Value>) -> Result<u64, EngineError>;
}

/// A storage engine: a connection that can also open transactions.
#[async_trait]
pub trait StorageEngine: StorageConn {
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, EngineError>;
}

/// A live transaction. Dropping without commit rolls back.
#[async_trait]
pub trait StorageTransaction: StorageConn {
    async fn commit(self: Box<Self>) -> Result<(), EngineError>;
    async fn rollback(self: Box<Self>) -> Result<(), EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_args_accept_include_deleted_json() {
        let args: QueryArgs = serde_json::from_value(json!({
            "where": { "userId": "u1" },
            "order": "updatedAt desc",
            "limit": 10,
            "includeDeleted": true
        }))
        .unwrap();
        assert!(args.include_deleted);
        assert_eq!(args.limit, Some(10));
        assert!(args.where_clause.is_some());
    }

    #[test]
    fn increment_detection() {
        assert_eq!(increment_of(&json!({ "$inc": 2 })), Some(2.0));
        assert_eq!(increment_of(&json!({ "$inc": 2, "other": 1 })), None);
        assert_eq!(increment_of(&json!(5)), None);
    }

    #[test]
    fn aggregate_result_keys() {
        assert_eq!(AggregateOp::Count.result_key(), "_count");
        assert_eq!(AggregateOp::Sum("messageCount".into()).result_key(), "_sum_messageCount");
    }
}
