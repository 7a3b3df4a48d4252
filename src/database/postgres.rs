//! Postgres implementation of the storage engine boundary.
//!
//! Records are dynamic `serde_json::Map`s; rows are converted column by
//! column with typed fallbacks. Statements are assembled from validated,
//! quoted identifiers plus positional bind parameters.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgArguments, PgRow};
use sqlx::{Column, PgConnection, PgPool, Postgres, Row, Transaction};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::database::engine::{
    increment_of, AggregateOp, EngineError, JsonMap, QueryArgs, StorageConn, StorageEngine,
    StorageTransaction,
};
use crate::database::filter::{order_sql, quote_identifier, validate_identifier, where_sql};

pub struct PgEngine {
    pool: PgPool,
}

impl PgEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StorageConn for PgEngine {
    async fn insert(&self, entity: &str, row: JsonMap) -> Result<JsonMap, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_insert(&mut conn, entity, row).await
    }

    async fn insert_many(&self, entity: &str, rows: Vec<JsonMap>) -> Result<u64, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_insert_many(&mut conn, entity, rows).await
    }

    async fn update(
        &self,
        entity: &str,
        where_clause: &Value,
        set: JsonMap,
    ) -> Result<JsonMap, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_update(&mut conn, entity, where_clause, set).await
    }

    async fn update_many(
        &self,
        entity: &str,
        where_clause: &Value,
        set: JsonMap,
    ) -> Result<u64, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_update_many(&mut conn, entity, where_clause, set).await
    }

    async fn delete(&self, entity: &str, where_clause: &Value) -> Result<JsonMap, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_delete(&mut conn, entity, where_clause).await
    }

    async fn delete_many(&self, entity: &str, where_clause: &Value) -> Result<u64, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_delete_many(&mut conn, entity, where_clause).await
    }

    async fn find_many(&self, entity: &str, args: &QueryArgs) -> Result<Vec<JsonMap>, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_find_many(&mut conn, entity, args).await
    }

    async fn find_first(
        &self,
        entity: &str,
        args: &QueryArgs,
    ) -> Result<Option<JsonMap>, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_find_first(&mut conn, entity, args).await
    }

    async fn find_unique(
        &self,
        entity: &str,
        key: &JsonMap,
    ) -> Result<Option<JsonMap>, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_find_unique(&mut conn, entity, key).await
    }

    async fn count(&self, entity: &str, args: &QueryArgs) -> Result<i64, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_count(&mut conn, entity, args).await
    }

    async fn aggregate(
        &self,
        entity: &str,
        args: &QueryArgs,
        aggs: &[AggregateOp],
    ) -> Result<JsonMap, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_aggregate(&mut conn, entity, args, aggs).await
    }

    async fn group_by(
        &self,
        entity: &str,
        args: &QueryArgs,
        by: &[String],
        aggs: &[AggregateOp],
    ) -> Result<Vec<JsonMap>, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_group_by(&mut conn, entity, args, by, aggs).await
    }

    async fn raw_query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<JsonMap>, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_raw_query(&mut conn, sql, params).await
    }

    async fn raw_execute(&self, sql: &str, params: Vec<Value>) -> Result<u64, EngineError> {
        let mut conn = self.pool.acquire().await?;
        exec_raw_execute(&mut conn, sql, params).await
    }
}

#[async_trait]
impl StorageEngine for PgEngine {
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, EngineError> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgTransactionHandle { tx: Mutex::new(Some(tx)) }))
    }
}

/// One open sqlx transaction behind a lock so the object-safe `&self`
/// connection methods can borrow it mutably. Dropping the handle without
/// commit rolls the transaction back (sqlx semantics).
pub struct PgTransactionHandle {
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
}

impl PgTransactionHandle {
    async fn with_conn<'a>(
        guard: &'a mut Option<Transaction<'static, Postgres>>,
    ) -> Result<&'a mut PgConnection, EngineError> {
        let tx = guard.as_mut().ok_or(EngineError::Unsupported("transaction already closed"))?;
        Ok(&mut **tx)
    }
}

#[async_trait]
impl StorageConn for PgTransactionHandle {
    async fn insert(&self, entity: &str, row: JsonMap) -> Result<JsonMap, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_insert(conn, entity, row).await
    }

    async fn insert_many(&self, entity: &str, rows: Vec<JsonMap>) -> Result<u64, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_insert_many(conn, entity, rows).await
    }

    async fn update(
        &self,
        entity: &str,
        where_clause: &Value,
        set: JsonMap,
    ) -> Result<JsonMap, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_update(conn, entity, where_clause, set).await
    }

    async fn update_many(
        &self,
        entity: &str,
        where_clause: &Value,
        set: JsonMap,
    ) -> Result<u64, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_update_many(conn, entity, where_clause, set).await
    }

    async fn delete(&self, entity: &str, where_clause: &Value) -> Result<JsonMap, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_delete(conn, entity, where_clause).await
    }

    async fn delete_many(&self, entity: &str, where_clause: &Value) -> Result<u64, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_delete_many(conn, entity, where_clause).await
    }

    async fn find_many(&self, entity: &str, args: &QueryArgs) -> Result<Vec<JsonMap>, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_find_many(conn, entity, args).await
    }

    async fn find_first(
        &self,
        entity: &str,
        args: &QueryArgs,
    ) -> Result<Option<JsonMap>, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_find_first(conn, entity, args).await
    }

    async fn find_unique(
        &self,
        entity: &str,
        key: &JsonMap,
    ) -> Result<Option<JsonMap>, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_find_unique(conn, entity, key).await
    }

    async fn count(&self, entity: &str, args: &QueryArgs) -> Result<i64, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_count(conn, entity, args).await
    }

    async fn aggregate(
        &self,
        entity: &str,
        args: &QueryArgs,
        aggs: &[AggregateOp],
    ) -> Result<JsonMap, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_aggregate(conn, entity, args, aggs).await
    }

    async fn group_by(
        &self,
        entity: &str,
        args: &QueryArgs,
        by: &[String],
        aggs: &[AggregateOp],
    ) -> Result<Vec<JsonMap>, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_group_by(conn, entity, args, by, aggs).await
    }

    async fn raw_query(&self, sql: &str, params: Vec<Value>) -> Result<Vec<JsonMap>, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_raw_query(conn, sql, params).await
    }

    async fn raw_execute(&self, sql: &str, params: Vec<Value>) -> Result<u64, EngineError> {
        let mut guard = self.tx.lock().await;
        let conn = Self::with_conn(&mut guard).await?;
        exec_raw_execute(conn, sql, params).await
    }
}

#[async_trait]
impl StorageTransaction for PgTransactionHandle {
    async fn commit(self: Box<Self>) -> Result<(), EngineError> {
        match self.tx.into_inner() {
            Some(tx) => Ok(tx.commit().await?),
            None => Err(EngineError::Unsupported("transaction already closed")),
        }
    }

    async fn rollback(self: Box<Self>) -> Result<(), EngineError> {
        match self.tx.into_inner() {
            Some(tx) => Ok(tx.rollback().await?),
            None => Err(EngineError::Unsupported("transaction already closed")),
        }
    }
}

// ========================================
// Statement builders and executors
// ========================================

async fn exec_insert(
    conn: &mut PgConnection,
    entity: &str,
    row: JsonMap,
) -> Result<JsonMap, EngineError> {
    validate_identifier(entity)?;
    if row.is_empty() {
        return Err(EngineError::Query("insert payload is empty".to_string()));
    }
    let mut columns = Vec::new();
    let mut placeholders = Vec::new();
    let mut params = Vec::new();
    for (i, (column, value)) in row.into_iter().enumerate() {
        validate_identifier(&column)?;
        columns.push(quote_identifier(&column));
        placeholders.push(format!("${}", i + 1));
        params.push(value);
    }
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({}) RETURNING *",
        quote_identifier(entity),
        columns.join(", "),
        placeholders.join(", ")
    );
    let pg_row = bind_all(sqlx::query(&sql), &params).fetch_one(conn).await?;
    Ok(row_to_map(&pg_row))
}

async fn exec_insert_many(
    conn: &mut PgConnection,
    entity: &str,
    rows: Vec<JsonMap>,
) -> Result<u64, EngineError> {
    validate_identifier(entity)?;
    if rows.is_empty() {
        return Ok(0);
    }
    // Column set is taken from the first row; later rows fill gaps with NULL.
    let columns: Vec<String> = rows[0].keys().cloned().collect();
    for column in &columns {
        validate_identifier(column)?;
    }
    let mut params = Vec::new();
    let mut tuples = Vec::new();
    for row in &rows {
        let mut placeholders = Vec::new();
        for column in &columns {
            params.push(row.get(column).cloned().unwrap_or(Value::Null));
            placeholders.push(format!("${}", params.len()));
        }
        tuples.push(format!("({})", placeholders.join(", ")));
    }
    let quoted: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    let sql = format!(
        "INSERT INTO {} ({}) VALUES {}",
        quote_identifier(entity),
        quoted.join(", "),
        tuples.join(", ")
    );
    let result = bind_all(sqlx::query(&sql), &params).execute(conn).await?;
    Ok(result.rows_affected())
}

fn build_set_clause(
    set: JsonMap,
    params: &mut Vec<Value>,
) -> Result<String, EngineError> {
    if set.is_empty() {
        return Err(EngineError::Query("update payload is empty".to_string()));
    }
    let mut parts = Vec::new();
    for (column, value) in set {
        validate_identifier(&column)?;
        let quoted = quote_identifier(&column);
        if let Some(amount) = increment_of(&value) {
            params.push(Value::from(amount));
            parts.push(format!("{quoted} = {quoted} + ${}", params.len()));
        } else {
            params.push(value);
            parts.push(format!("{quoted} = ${}", params.len()));
        }
    }
    Ok(parts.join(", "))
}

async fn exec_update(
    conn: &mut PgConnection,
    entity: &str,
    where_clause: &Value,
    set: JsonMap,
) -> Result<JsonMap, EngineError> {
    validate_identifier(entity)?;
    let mut params = Vec::new();
    let set_sql = build_set_clause(set, &mut params)?;
    let frag = where_sql(where_clause, params.len())?;
    params.extend(frag.params);
    let sql = format!(
        "UPDATE {} SET {} WHERE {} RETURNING *",
        quote_identifier(entity),
        set_sql,
        frag.sql
    );
    match bind_all(sqlx::query(&sql), &params).fetch_optional(conn).await? {
        Some(pg_row) => Ok(row_to_map(&pg_row)),
        None => Err(EngineError::TargetNotFound { entity: entity.to_string() }),
    }
}

async fn exec_update_many(
    conn: &mut PgConnection,
    entity: &str,
    where_clause: &Value,
    set: JsonMap,
) -> Result<u64, EngineError> {
    validate_identifier(entity)?;
    let mut params = Vec::new();
    let set_sql = build_set_clause(set, &mut params)?;
    let frag = where_sql(where_clause, params.len())?;
    params.extend(frag.params);
    let sql =
        format!("UPDATE {} SET {} WHERE {}", quote_identifier(entity), set_sql, frag.sql);
    let result = bind_all(sqlx::query(&sql), &params).execute(conn).await?;
    Ok(result.rows_affected())
}

async fn exec_delete(
    conn: &mut PgConnection,
    entity: &str,
    where_clause: &Value,
) -> Result<JsonMap, EngineError> {
    validate_identifier(entity)?;
    let frag = where_sql(where_clause, 0)?;
    let sql = format!("DELETE FROM {} WHERE {} RETURNING *", quote_identifier(entity), frag.sql);
    match bind_all(sqlx::query(&sql), &frag.params).fetch_optional(conn).await? {
        Some(pg_row) => Ok(row_to_map(&pg_row)),
        None => Err(EngineError::TargetNotFound { entity: entity.to_string() }),
    }
}

async fn exec_delete_many(
    conn: &mut PgConnection,
    entity: &str,
    where_clause: &Value,
) -> Result<u64, EngineError> {
    validate_identifier(entity)?;
    let frag = where_sql(where_clause, 0)?;
    let sql = format!("DELETE FROM {} WHERE {}", quote_identifier(entity), frag.sql);
    let result = bind_all(sqlx::query(&sql), &frag.params).execute(conn).await?;
    Ok(result.rows_affected())
}

fn build_select(entity: &str, args: &QueryArgs) -> Result<(String, Vec<Value>), EngineError> {
    validate_identifier(entity)?;
    let select = match &args.select {
        Some(columns) if !columns.is_empty() => {
            for column in columns {
                validate_identifier(column)?;
            }
            columns.iter().map(|c| quote_identifier(c)).collect::<Vec<_>>().join(", ")
        }
        _ => "*".to_string(),
    };
    let frag = where_sql(args.where_clause.as_ref().unwrap_or(&Value::Null), 0)?;
    let order = order_sql(args.order.as_ref().unwrap_or(&Value::Null))?;
    let mut sql = format!("SELECT {} FROM {} WHERE {}", select, quote_identifier(entity), frag.sql);
    if !order.is_empty() {
        sql.push(' ');
        sql.push_str(&order);
    }
    match (args.limit, args.offset) {
        (Some(limit), Some(offset)) => sql.push_str(&format!(" LIMIT {limit} OFFSET {offset}")),
        (Some(limit), None) => sql.push_str(&format!(" LIMIT {limit}")),
        (None, Some(offset)) => sql.push_str(&format!(" OFFSET {offset}")),
        (None, None) => {}
    }
    Ok((sql, frag.params))
}

async fn exec_find_many(
    conn: &mut PgConnection,
    entity: &str,
    args: &QueryArgs,
) -> Result<Vec<JsonMap>, EngineError> {
    let (sql, params) = build_select(entity, args)?;
    let rows = bind_all(sqlx::query(&sql), &params).fetch_all(conn).await?;
    Ok(rows.iter().map(row_to_map).collect())
}

async fn exec_find_first(
    conn: &mut PgConnection,
    entity: &str,
    args: &QueryArgs,
) -> Result<Option<JsonMap>, EngineError> {
    let mut limited = args.clone();
    limited.limit = Some(1);
    let (sql, params) = build_select(entity, &limited)?;
    let row = bind_all(sqlx::query(&sql), &params).fetch_optional(conn).await?;
    Ok(row.as_ref().map(row_to_map))
}

async fn exec_find_unique(
    conn: &mut PgConnection,
    entity: &str,
    key: &JsonMap,
) -> Result<Option<JsonMap>, EngineError> {
    let args = QueryArgs::filtered(Value::Object(key.clone()));
    exec_find_first(conn, entity, &args).await
}

async fn exec_count(
    conn: &mut PgConnection,
    entity: &str,
    args: &QueryArgs,
) -> Result<i64, EngineError> {
    validate_identifier(entity)?;
    let frag = where_sql(args.where_clause.as_ref().unwrap_or(&Value::Null), 0)?;
    let sql =
        format!("SELECT COUNT(*) AS count FROM {} WHERE {}", quote_identifier(entity), frag.sql);
    let row = bind_all(sqlx::query(&sql), &frag.params).fetch_one(conn).await?;
    Ok(row.try_get("count")?)
}

fn aggregate_select(aggs: &[AggregateOp]) -> Result<String, EngineError> {
    let mut parts = Vec::new();
    for agg in aggs {
        if let Some(field) = agg.field() {
            validate_identifier(field)?;
        }
        let expr = match agg {
            AggregateOp::Count => "COUNT(*)".to_string(),
            AggregateOp::Sum(f) => format!("SUM({})", quote_identifier(f)),
            AggregateOp::Avg(f) => format!("AVG({})", quote_identifier(f)),
            AggregateOp::Min(f) => format!("MIN({})", quote_identifier(f)),
            AggregateOp::Max(f) => format!("MAX({})", quote_identifier(f)),
        };
        parts.push(format!("{} AS {}", expr, quote_identifier(&agg.result_key())));
    }
    Ok(parts.join(", "))
}

async fn exec_aggregate(
    conn: &mut PgConnection,
    entity: &str,
    args: &QueryArgs,
    aggs: &[AggregateOp],
) -> Result<JsonMap, EngineError> {
    validate_identifier(entity)?;
    let select = aggregate_select(aggs)?;
    let frag = where_sql(args.where_clause.as_ref().unwrap_or(&Value::Null), 0)?;
    let sql = format!("SELECT {} FROM {} WHERE {}", select, quote_identifier(entity), frag.sql);
    let row = bind_all(sqlx::query(&sql), &frag.params).fetch_one(conn).await?;
    Ok(row_to_map(&row))
}

async fn exec_group_by(
    conn: &mut PgConnection,
    entity: &str,
    args: &QueryArgs,
    by: &[String],
    aggs: &[AggregateOp],
) -> Result<Vec<JsonMap>, EngineError> {
    validate_identifier(entity)?;
    for column in by {
        validate_identifier(column)?;
    }
    let group_cols: Vec<String> = by.iter().map(|c| quote_identifier(c)).collect();
    let mut select = group_cols.join(", ");
    let agg_select = aggregate_select(aggs)?;
    if !agg_select.is_empty() {
        if !select.is_empty() {
            select.push_str(", ");
        }
        select.push_str(&agg_select);
    }
    let frag = where_sql(args.where_clause.as_ref().unwrap_or(&Value::Null), 0)?;
    let sql = format!(
        "SELECT {} FROM {} WHERE {} GROUP BY {}",
        select,
        quote_identifier(entity),
        frag.sql,
        group_cols.join(", ")
    );
    let rows = bind_all(sqlx::query(&sql), &frag.params).fetch_all(conn).await?;
    Ok(rows.iter().map(row_to_map).collect())
}

async fn exec_raw_query(
    conn: &mut PgConnection,
    sql: &str,
    params: Vec<Value>,
) -> Result<Vec<JsonMap>, EngineError> {
    let rows = bind_all(sqlx::query(sql), &params).fetch_all(conn).await?;
    Ok(rows.iter().map(row_to_map).collect())
}

async fn exec_raw_execute(
    conn: &mut PgConnection,
    sql: &str,
    params: Vec<Value>,
) -> Result<u64, EngineError> {
    let result = bind_all(sqlx::query(sql), &params).execute(conn).await?;
    Ok(result.rows_affected())
}

// ========================================
// Value binding and row conversion
// ========================================

fn bind_all<'q>(
    mut q: sqlx::query::Query<'q, Postgres, PgArguments>,
    params: &'q [Value],
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    for p in params {
        q = bind_param(q, p);
    }
    q
}

fn bind_param<'q>(
    q: sqlx::query::Query<'q, Postgres, PgArguments>,
    v: &'q Value,
) -> sqlx::query::Query<'q, Postgres, PgArguments> {
    match v {
        Value::Null => {
            let none: Option<String> = None;
            q.bind(none)
        }
        Value::Bool(b) => q.bind(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                q.bind(i)
            } else if let Some(u) = n.as_u64() {
                // Postgres doesn't have u64; cast down if safe
                q.bind(u as i64)
            } else if let Some(f) = n.as_f64() {
                q.bind(f)
            } else {
                q.bind(n.to_string())
            }
        }
        Value::String(s) => {
            // Timestamps and uuids travel as strings inside dynamic
            // records; rebind them natively so typed columns accept them.
            if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
                q.bind(ts.with_timezone(&Utc))
            } else if let Ok(id) = Uuid::parse_str(s) {
                q.bind(id)
            } else {
                q.bind(s)
            }
        }
        Value::Array(_) | Value::Object(_) => q.bind(v.clone()), // JSONB
    }
}

/// Convert a dynamic row to a JSON map, trying typed extraction per column.
fn row_to_map(row: &PgRow) -> JsonMap {
    let mut map = JsonMap::new();
    for i in 0..row.len() {
        let column_name = row.column(i).name();
        let value: Result<Option<Value>, _> = row.try_get(i);

        let json_value = match value {
            Ok(Some(v)) => v,
            Ok(None) => Value::Null,
            Err(_) => {
                // Try different types if direct JSON extraction fails
                if let Ok(s) = row.try_get::<String, _>(i) {
                    Value::String(s)
                } else if let Ok(i64_val) = row.try_get::<i64, _>(i) {
                    Value::Number(i64_val.into())
                } else if let Ok(i32_val) = row.try_get::<i32, _>(i) {
                    Value::Number(i32_val.into())
                } else if let Ok(f64_val) = row.try_get::<f64, _>(i) {
                    Value::Number(serde_json::Number::from_f64(f64_val).unwrap_or_else(|| 0.into()))
                } else if let Ok(bool_val) = row.try_get::<bool, _>(i) {
                    Value::Bool(bool_val)
                } else if let Ok(ts) = row.try_get::<DateTime<Utc>, _>(i) {
                    Value::String(ts.to_rfc3339())
                } else if let Ok(id) = row.try_get::<Uuid, _>(i) {
                    Value::String(id.to_string())
                } else {
                    Value::Null
                }
            }
        };

        map.insert(column_name.to_string(), json_value);
    }
    map
}
