//! In-memory storage engine.
//!
//! Evaluates the same JSON where grammar as the SQL translator, against
//! `Vec<JsonMap>` tables. Used by the test suites and by local tooling
//! that runs without Postgres. Transactions are snapshot-based: `begin`
//! clones the table set, `commit` swaps it back in.

use async_trait::async_trait;
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::database::engine::{
    increment_of, AggregateOp, EngineError, JsonMap, QueryArgs, StorageConn, StorageEngine,
    StorageTransaction,
};

type Tables = HashMap<String, Vec<JsonMap>>;

#[derive(Clone, Default)]
pub struct MemoryEngine {
    tables: Arc<Mutex<Tables>>,
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw physical view of a table, bypassing every query path. Lets
    /// tests assert what is actually stored (soft-deleted rows included).
    pub async fn table_snapshot(&self, entity: &str) -> Vec<JsonMap> {
        self.tables.lock().await.get(entity).cloned().unwrap_or_default()
    }

    /// Seed a table directly, bypassing audit filling.
    pub async fn seed(&self, entity: &str, rows: Vec<JsonMap>) {
        self.tables.lock().await.entry(entity.to_string()).or_default().extend(rows);
    }
}

#[async_trait]
impl StorageConn for MemoryEngine {
    async fn insert(&self, entity: &str, row: JsonMap) -> Result<JsonMap, EngineError> {
        let mut tables = self.tables.lock().await;
        op_insert(&mut tables, entity, row)
    }

    async fn insert_many(&self, entity: &str, rows: Vec<JsonMap>) -> Result<u64, EngineError> {
        let mut tables = self.tables.lock().await;
        op_insert_many(&mut tables, entity, rows)
    }

    async fn update(
        &self,
        entity: &str,
        where_clause: &Value,
        set: JsonMap,
    ) -> Result<JsonMap, EngineError> {
        let mut tables = self.tables.lock().await;
        op_update(&mut tables, entity, where_clause, set)
    }

    async fn update_many(
        &self,
        entity: &str,
        where_clause: &Value,
        set: JsonMap,
    ) -> Result<u64, EngineError> {
        let mut tables = self.tables.lock().await;
        op_update_many(&mut tables, entity, where_clause, set)
    }

    async fn delete(&self, entity: &str, where_clause: &Value) -> Result<JsonMap, EngineError> {
        let mut tables = self.tables.lock().await;
        op_delete(&mut tables, entity, where_clause)
    }

    async fn delete_many(&self, entity: &str, where_clause: &Value) -> Result<u64, EngineError> {
        let mut tables = self.tables.lock().await;
        op_delete_many(&mut tables, entity, where_clause)
    }

    async fn find_many(&self, entity: &str, args: &QueryArgs) -> Result<Vec<JsonMap>, EngineError> {
        let tables = self.tables.lock().await;
        op_find_many(&tables, entity, args)
    }

    async fn find_first(
        &self,
        entity: &str,
        args: &QueryArgs,
    ) -> Result<Option<JsonMap>, EngineError> {
        let tables = self.tables.lock().await;
        Ok(op_find_many(&tables, entity, args)?.into_iter().next())
    }

    async fn find_unique(
        &self,
        entity: &str,
        key: &JsonMap,
    ) -> Result<Option<JsonMap>, EngineError> {
        let args = QueryArgs::filtered(Value::Object(key.clone()));
        let tables = self.tables.lock().await;
        Ok(op_find_many(&tables, entity, &args)?.into_iter().next())
    }

    async fn count(&self, entity: &str, args: &QueryArgs) -> Result<i64, EngineError> {
        let tables = self.tables.lock().await;
        Ok(op_find_many(&tables, entity, args)?.len() as i64)
    }

    async fn aggregate(
        &self,
        entity: &str,
        args: &QueryArgs,
        aggs: &[AggregateOp],
    ) -> Result<JsonMap, EngineError> {
        let tables = self.tables.lock().await;
        let rows = op_find_many(&tables, entity, args)?;
        Ok(compute_aggregates(&rows, aggs))
    }

    async fn group_by(
        &self,
        entity: &str,
        args: &QueryArgs,
        by: &[String],
        aggs: &[AggregateOp],
    ) -> Result<Vec<JsonMap>, EngineError> {
        let tables = self.tables.lock().await;
        let rows = op_find_many(&tables, entity, args)?;
        let mut groups: Vec<(Vec<Value>, Vec<JsonMap>)> = Vec::new();
        for row in rows {
            let key: Vec<Value> =
                by.iter().map(|c| row.get(c).cloned().unwrap_or(Value::Null)).collect();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(row),
                None => groups.push((key, vec![row])),
            }
        }
        let mut out = Vec::new();
        for (key, members) in groups {
            let mut result = JsonMap::new();
            for (column, value) in by.iter().zip(key) {
                result.insert(column.clone(), value);
            }
            result.extend(compute_aggregates(&members, aggs));
            out.push(result);
        }
        Ok(out)
    }

    async fn raw_query(&self, _sql: &str, _params: Vec<Value>) -> Result<Vec<JsonMap>, EngineError> {
        Err(EngineError::Unsupported("raw SQL on the in-memory engine"))
    }

    async fn raw_execute(&self, _sql: &str, _params: Vec<Value>) -> Result<u64, EngineError> {
        Err(EngineError::Unsupported("raw SQL on the in-memory engine"))
    }
}

#[async_trait]
impl StorageEngine for MemoryEngine {
    async fn begin(&self) -> Result<Box<dyn StorageTransaction>, EngineError> {
        let snapshot = self.tables.lock().await.clone();
        Ok(Box::new(MemoryTransaction {
            shared: Arc::clone(&self.tables),
            working: Mutex::new(snapshot),
        }))
    }
}

/// Snapshot transaction: operations run against a private copy of the
/// tables; commit replaces the shared state wholesale. Serializable but
/// last-commit-wins; good enough for tests and local tooling.
pub struct MemoryTransaction {
    shared: Arc<Mutex<Tables>>,
    working: Mutex<Tables>,
}

#[async_trait]
impl StorageConn for MemoryTransaction {
    async fn insert(&self, entity: &str, row: JsonMap) -> Result<JsonMap, EngineError> {
        let mut tables = self.working.lock().await;
        op_insert(&mut tables, entity, row)
    }

    async fn insert_many(&self, entity: &str, rows: Vec<JsonMap>) -> Result<u64, EngineError> {
        let mut tables = self.working.lock().await;
        op_insert_many(&mut tables, entity, rows)
    }

    async fn update(
        &self,
        entity: &str,
        where_clause: &Value,
        set: JsonMap,
    ) -> Result<JsonMap, EngineError> {
        let mut tables = self.working.lock().await;
        op_update(&mut tables, entity, where_clause, set)
    }

    async fn update_many(
        &self,
        entity: &str,
        where_clause: &Value,
        set: JsonMap,
    ) -> Result<u64, EngineError> {
        let mut tables = self.working.lock().await;
        op_update_many(&mut tables, entity, where_clause, set)
    }

    async fn delete(&self, entity: &str, where_clause: &Value) -> Result<JsonMap, EngineError> {
        let mut tables = self.working.lock().await;
        op_delete(&mut tables, entity, where_clause)
    }

    async fn delete_many(&self, entity: &str, where_clause: &Value) -> Result<u64, EngineError> {
        let mut tables = self.working.lock().await;
        op_delete_many(&mut tables, entity, where_clause)
    }

    async fn find_many(&self, entity: &str, args: &QueryArgs) -> Result<Vec<JsonMap>, EngineError> {
        let tables = self.working.lock().await;
        op_find_many(&tables, entity, args)
    }

    async fn find_first(
        &self,
        entity: &str,
        args: &QueryArgs,
    ) -> Result<Option<JsonMap>, EngineError> {
        let tables = self.working.lock().await;
        Ok(op_find_many(&tables, entity, args)?.into_iter().next())
    }

    async fn find_unique(
        &self,
        entity: &str,
        key: &JsonMap,
    ) -> Result<Option<JsonMap>, EngineError> {
        let args = QueryArgs::filtered(Value::Object(key.clone()));
        let tables = self.working.lock().await;
        Ok(op_find_many(&tables, entity, &args)?.into_iter().next())
    }

    async fn count(&self, entity: &str, args: &QueryArgs) -> Result<i64, EngineError> {
        let tables = self.working.lock().await;
        Ok(op_find_many(&tables, entity, args)?.len() as i64)
    }

    async fn aggregate(
        &self,
        entity: &str,
        args: &QueryArgs,
        aggs: &[AggregateOp],
    ) -> Result<JsonMap, EngineError> {
        let tables = self.working.lock().await;
        let rows = op_find_many(&tables, entity, args)?;
        Ok(compute_aggregates(&rows, aggs))
    }

    async fn group_by(
        &self,
        entity: &str,
        args: &QueryArgs,
        by: &[String],
        aggs: &[AggregateOp],
    ) -> Result<Vec<JsonMap>, EngineError> {
        let tables = self.working.lock().await;
        let rows = op_find_many(&tables, entity, args)?;
        drop(tables);
        let mut groups: Vec<(Vec<Value>, Vec<JsonMap>)> = Vec::new();
        for row in rows {
            let key: Vec<Value> =
                by.iter().map(|c| row.get(c).cloned().unwrap_or(Value::Null)).collect();
            match groups.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(row),
                None => groups.push((key, vec![row])),
            }
        }
        let mut out = Vec::new();
        for (key, members) in groups {
            let mut result = JsonMap::new();
            for (column, value) in by.iter().zip(key) {
                result.insert(column.clone(), value);
            }
            result.extend(compute_aggregates(&members, aggs));
            out.push(result);
        }
        Ok(out)
    }

    async fn raw_query(&self, _sql: &str, _params: Vec<Value>) -> Result<Vec<JsonMap>, EngineError> {
        Err(EngineError::Unsupported("raw SQL on the in-memory engine"))
    }

    async fn raw_execute(&self, _sql: &str, _params: Vec<Value>) -> Result<u64, EngineError> {
        Err(EngineError::Unsupported("raw SQL on the in-memory engine"))
    }
}

#[async_trait]
impl StorageTransaction for MemoryTransaction {
    async fn commit(self: Box<Self>) -> Result<(), EngineError> {
        let working = self.working.into_inner();
        *self.shared.lock().await = working;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<(), EngineError> {
        // Working copy is simply discarded.
        Ok(())
    }
}

// ========================================
// Table operations
// ========================================

fn op_insert(tables: &mut Tables, entity: &str, row: JsonMap) -> Result<JsonMap, EngineError> {
    tables.entry(entity.to_string()).or_default().push(row.clone());
    Ok(row)
}

fn op_insert_many(
    tables: &mut Tables,
    entity: &str,
    rows: Vec<JsonMap>,
) -> Result<u64, EngineError> {
    let n = rows.len() as u64;
    tables.entry(entity.to_string()).or_default().extend(rows);
    Ok(n)
}

fn apply_set(row: &mut JsonMap, set: &JsonMap) {
    for (key, value) in set {
        if let Some(amount) = increment_of(value) {
            let current = row.get(key).and_then(Value::as_f64).unwrap_or(0.0);
            let next = current + amount;
            // Keep integers integral
            if next.fract() == 0.0 {
                row.insert(key.clone(), Value::from(next as i64));
            } else {
                row.insert(key.clone(), Value::from(next));
            }
        } else {
            row.insert(key.clone(), value.clone());
        }
    }
}

fn op_update(
    tables: &mut Tables,
    entity: &str,
    where_clause: &Value,
    set: JsonMap,
) -> Result<JsonMap, EngineError> {
    let rows = tables.entry(entity.to_string()).or_default();
    for row in rows.iter_mut() {
        if matches_where(row, where_clause)? {
            apply_set(row, &set);
            return Ok(row.clone());
        }
    }
    Err(EngineError::TargetNotFound { entity: entity.to_string() })
}

fn op_update_many(
    tables: &mut Tables,
    entity: &str,
    where_clause: &Value,
    set: JsonMap,
) -> Result<u64, EngineError> {
    let rows = tables.entry(entity.to_string()).or_default();
    let mut affected = 0;
    for row in rows.iter_mut() {
        if matches_where(row, where_clause)? {
            apply_set(row, &set);
            affected += 1;
        }
    }
    Ok(affected)
}

fn op_delete(
    tables: &mut Tables,
    entity: &str,
    where_clause: &Value,
) -> Result<JsonMap, EngineError> {
    let rows = tables.entry(entity.to_string()).or_default();
    for (i, row) in rows.iter().enumerate() {
        if matches_where(row, where_clause)? {
            return Ok(rows.remove(i));
        }
    }
    Err(EngineError::TargetNotFound { entity: entity.to_string() })
}

fn op_delete_many(
    tables: &mut Tables,
    entity: &str,
    where_clause: &Value,
) -> Result<u64, EngineError> {
    let rows = tables.entry(entity.to_string()).or_default();
    let before = rows.len();
    let mut err = None;
    rows.retain(|row| match matches_where(row, where_clause) {
        Ok(matched) => !matched,
        Err(e) => {
            err = Some(e);
            true
        }
    });
    match err {
        Some(e) => Err(e),
        None => Ok((before - rows.len()) as u64),
    }
}

fn op_find_many(
    tables: &Tables,
    entity: &str,
    args: &QueryArgs,
) -> Result<Vec<JsonMap>, EngineError> {
    let empty = Vec::new();
    let rows = tables.get(entity).unwrap_or(&empty);
    let where_clause = args.where_clause.as_ref().unwrap_or(&Value::Null);
    let mut matched = Vec::new();
    for row in rows {
        if matches_where(row, where_clause)? {
            matched.push(row.clone());
        }
    }
    if let Some(order) = &args.order {
        sort_rows(&mut matched, order);
    }
    let offset = args.offset.unwrap_or(0).max(0) as usize;
    let matched: Vec<JsonMap> = matched.into_iter().skip(offset).collect();
    let matched: Vec<JsonMap> = match args.limit {
        Some(limit) => matched.into_iter().take(limit.max(0) as usize).collect(),
        None => matched,
    };
    match &args.select {
        Some(columns) if !columns.is_empty() => Ok(matched
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                    .collect()
            })
            .collect()),
        _ => Ok(matched),
    }
}

// ========================================
// Where evaluation
// ========================================

fn matches_where(row: &JsonMap, where_clause: &Value) -> Result<bool, EngineError> {
    let obj = match where_clause {
        Value::Null => return Ok(true),
        Value::Object(obj) => obj,
        _ => return Err(EngineError::Query("WHERE must be a JSON object".to_string())),
    };
    for (key, value) in obj {
        let matched = match key.as_str() {
            "$and" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| EngineError::Query("$and requires an array".to_string()))?;
                let mut all = true;
                for sub in arr {
                    if !matches_where(row, sub)? {
                        all = false;
                        break;
                    }
                }
                all
            }
            "$or" => {
                let arr = value
                    .as_array()
                    .ok_or_else(|| EngineError::Query("$or requires an array".to_string()))?;
                let mut any = arr.is_empty();
                for sub in arr {
                    if matches_where(row, sub)? {
                        any = true;
                        break;
                    }
                }
                any
            }
            "$not" => !matches_where(row, value)?,
            field => matches_field(row.get(field).unwrap_or(&Value::Null), value)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_field(actual: &Value, expected: &Value) -> Result<bool, EngineError> {
    if let Value::Object(ops) = expected {
        for (op, operand) in ops {
            let matched = match op.as_str() {
                "$eq" => values_equal(actual, operand),
                "$ne" | "$neq" => !values_equal(actual, operand),
                "$gt" => compare(actual, operand) == Some(Ordering::Greater),
                "$gte" => matches!(
                    compare(actual, operand),
                    Some(Ordering::Greater) | Some(Ordering::Equal)
                ),
                "$lt" => compare(actual, operand) == Some(Ordering::Less),
                "$lte" => {
                    matches!(compare(actual, operand), Some(Ordering::Less) | Some(Ordering::Equal))
                }
                "$like" => like_match(actual, operand, false),
                "$ilike" => like_match(actual, operand, true),
                "$in" => operand
                    .as_array()
                    .ok_or_else(|| EngineError::Query("$in requires an array".to_string()))?
                    .iter()
                    .any(|v| values_equal(actual, v)),
                "$between" => {
                    let bounds = operand.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                        EngineError::Query("$between requires exactly 2 values".to_string())
                    })?;
                    matches!(
                        compare(actual, &bounds[0]),
                        Some(Ordering::Greater) | Some(Ordering::Equal)
                    ) && matches!(
                        compare(actual, &bounds[1]),
                        Some(Ordering::Less) | Some(Ordering::Equal)
                    )
                }
                other => {
                    return Err(EngineError::Query(format!("unsupported operator: {other}")))
                }
            };
            if !matched {
                return Ok(false);
            }
        }
        return Ok(true);
    }
    Ok(values_equal(actual, expected))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    // Numeric equality across integer/float representations
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn like_match(actual: &Value, pattern: &Value, case_insensitive: bool) -> bool {
    let (Some(mut text), Some(mut pat)) =
        (actual.as_str().map(String::from), pattern.as_str().map(String::from))
    else {
        return false;
    };
    if case_insensitive {
        text = text.to_lowercase();
        pat = pat.to_lowercase();
    }
    // SQL LIKE with % wildcards only (no _ support needed here)
    let parts: Vec<&str> = pat.split('%').collect();
    let mut rest = text.as_str();
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() {
            continue;
        }
        if i == 0 {
            if !rest.starts_with(part) {
                return false;
            }
            rest = &rest[part.len()..];
        } else if i == parts.len() - 1 && !pat.ends_with('%') {
            if !rest.ends_with(part) {
                return false;
            }
        } else {
            match rest.find(part) {
                Some(pos) => rest = &rest[pos + part.len()..],
                None => return false,
            }
        }
    }
    true
}

fn sort_rows(rows: &mut [JsonMap], order: &Value) {
    let mut keys: Vec<(String, bool)> = Vec::new();
    match order {
        Value::String(s) => collect_order_string(s, &mut keys),
        Value::Array(arr) => {
            for v in arr {
                if let Value::String(s) = v {
                    collect_order_string(s, &mut keys);
                }
            }
        }
        Value::Object(obj) => {
            for (col, dir) in obj {
                let desc = dir.as_str().is_some_and(|s| s.eq_ignore_ascii_case("desc"));
                keys.push((col.clone(), desc));
            }
        }
        _ => {}
    }
    if keys.is_empty() {
        return;
    }
    rows.sort_by(|a, b| {
        for (col, desc) in &keys {
            let av = a.get(col).unwrap_or(&Value::Null);
            let bv = b.get(col).unwrap_or(&Value::Null);
            let ord = compare(av, bv).unwrap_or(Ordering::Equal);
            if ord != Ordering::Equal {
                return if *desc { ord.reverse() } else { ord };
            }
        }
        Ordering::Equal
    });
}

fn collect_order_string(s: &str, out: &mut Vec<(String, bool)>) {
    for part in s.split(',') {
        let mut it = part.trim().split_whitespace();
        if let Some(col) = it.next() {
            let desc = it.next().is_some_and(|d| d.eq_ignore_ascii_case("desc"));
            out.push((col.to_string(), desc));
        }
    }
}

fn compute_aggregates(rows: &[JsonMap], aggs: &[AggregateOp]) -> JsonMap {
    let mut out = JsonMap::new();
    for agg in aggs {
        let key = agg.result_key();
        let value = match agg {
            AggregateOp::Count => Value::from(rows.len() as i64),
            AggregateOp::Sum(f) => {
                let sum: f64 = rows.iter().filter_map(|r| r.get(f)?.as_f64()).sum();
                number_value(sum)
            }
            AggregateOp::Avg(f) => {
                let values: Vec<f64> = rows.iter().filter_map(|r| r.get(f)?.as_f64()).collect();
                if values.is_empty() {
                    Value::Null
                } else {
                    Value::from(values.iter().sum::<f64>() / values.len() as f64)
                }
            }
            AggregateOp::Min(f) => fold_extreme(rows, f, Ordering::Less),
            AggregateOp::Max(f) => fold_extreme(rows, f, Ordering::Greater),
        };
        out.insert(key, value);
    }
    out
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Value::from(n)
    }
}

fn fold_extreme(rows: &[JsonMap], field: &str, keep: Ordering) -> Value {
    let mut best: Option<&Value> = None;
    for row in rows {
        let Some(v) = row.get(field) else { continue };
        if v.is_null() {
            continue;
        }
        match best {
            None => best = Some(v),
            Some(current) => {
                if compare(v, current) == Some(keep) {
                    best = Some(v);
                }
            }
        }
    }
    best.cloned().unwrap_or(Value::Null)
}
