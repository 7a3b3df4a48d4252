//! JSON query grammar -> parameterized SQL.
//!
//! The public API accepts `$`-operator where-clauses (implicit equality,
//! comparison operators, `$and`/`$or`/`$not` grouping) and simple order
//! specs. This module turns them into `WHERE`/`ORDER BY` fragments with
//! positional parameters. It knows nothing about soft deletion; predicate
//! injection happens a layer up.

use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FilterError {
    #[error("Invalid table name: {0}")]
    InvalidTableName(String),

    #[error("Invalid column name: {0}")]
    InvalidColumn(String),

    #[error("Invalid WHERE clause: {0}")]
    InvalidWhereClause(String),

    #[error("Unsupported operator: {0}")]
    UnsupportedOperator(String),

    #[error("Invalid operator data: {0}")]
    InvalidOperatorData(String),
}

/// A SQL fragment plus its bind parameters, in order.
#[derive(Debug, Clone)]
pub struct SqlFragment {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Validate a table/entity or column identifier before it is quoted into SQL.
pub fn validate_identifier(name: &str) -> Result<(), FilterError> {
    let mut chars = name.chars();
    let valid_head = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    if name.is_empty() || !valid_head || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return Err(FilterError::InvalidColumn(format!("invalid identifier: {name}")));
    }
    Ok(())
}

pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name)
}

/// Translate a where-clause JSON value into a `WHERE` body.
///
/// `starting_index` is the index of the last already-allocated `$n`
/// placeholder (0 when the fragment starts a statement).
pub fn where_sql(where_data: &Value, starting_index: usize) -> Result<SqlFragment, FilterError> {
    let mut builder = WhereBuilder { params: Vec::new(), index: starting_index };
    let sql = builder.condition(where_data)?;
    let sql = if sql.is_empty() { "1=1".to_string() } else { sql };
    Ok(SqlFragment { sql, params: builder.params })
}

struct WhereBuilder {
    params: Vec<Value>,
    index: usize,
}

impl WhereBuilder {
    fn condition(&mut self, data: &Value) -> Result<String, FilterError> {
        let obj = match data {
            Value::Null => return Ok(String::new()),
            Value::Object(obj) => obj,
            _ => {
                return Err(FilterError::InvalidWhereClause(
                    "WHERE must be a JSON object".to_string(),
                ))
            }
        };

        let mut parts = Vec::new();
        for (key, value) in obj {
            if key.starts_with('$') {
                parts.push(self.logical(key, value)?);
            } else {
                parts.push(self.field(key, value)?);
            }
        }
        Ok(parts.join(" AND "))
    }

    fn logical(&mut self, op: &str, value: &Value) -> Result<String, FilterError> {
        match op {
            "$and" | "$or" => {
                let arr = value.as_array().ok_or_else(|| {
                    FilterError::InvalidOperatorData(format!("{op} requires an array"))
                })?;
                let mut parts = Vec::new();
                for sub in arr {
                    let sql = self.condition(sub)?;
                    if !sql.is_empty() {
                        parts.push(format!("({sql})"));
                    }
                }
                if parts.is_empty() {
                    return Ok("1=1".to_string());
                }
                let joiner = if op == "$and" { " AND " } else { " OR " };
                Ok(format!("({})", parts.join(joiner)))
            }
            "$not" => {
                let sql = self.condition(value)?;
                if sql.is_empty() {
                    return Ok("1=1".to_string());
                }
                Ok(format!("NOT ({sql})"))
            }
            other => Err(FilterError::UnsupportedOperator(other.to_string())),
        }
    }

    fn field(&mut self, column: &str, value: &Value) -> Result<String, FilterError> {
        validate_identifier(column)?;
        let quoted = quote_identifier(column);

        // Operator object: { "$gte": 5, "$lt": 10 }
        if let Value::Object(ops) = value {
            let mut parts = Vec::new();
            for (op, operand) in ops {
                parts.push(self.operator(&quoted, op, operand)?);
            }
            return Ok(parts.join(" AND "));
        }

        // Implicit equality: { field: value }
        if value.is_null() {
            Ok(format!("{quoted} IS NULL"))
        } else {
            Ok(format!("{quoted} = {}", self.param(value.clone())))
        }
    }

    fn operator(&mut self, column: &str, op: &str, operand: &Value) -> Result<String, FilterError> {
        match op {
            "$eq" => {
                if operand.is_null() {
                    Ok(format!("{column} IS NULL"))
                } else {
                    Ok(format!("{column} = {}", self.param(operand.clone())))
                }
            }
            "$ne" | "$neq" => {
                if operand.is_null() {
                    Ok(format!("{column} IS NOT NULL"))
                } else {
                    Ok(format!("{column} <> {}", self.param(operand.clone())))
                }
            }
            "$gt" => Ok(format!("{column} > {}", self.param(operand.clone()))),
            "$gte" => Ok(format!("{column} >= {}", self.param(operand.clone()))),
            "$lt" => Ok(format!("{column} < {}", self.param(operand.clone()))),
            "$lte" => Ok(format!("{column} <= {}", self.param(operand.clone()))),
            "$like" => Ok(format!("{column} LIKE {}", self.param(operand.clone()))),
            "$ilike" => Ok(format!("{column} ILIKE {}", self.param(operand.clone()))),
            "$in" => {
                let values = operand.as_array().ok_or_else(|| {
                    FilterError::InvalidOperatorData("$in requires an array".to_string())
                })?;
                if values.is_empty() {
                    return Ok("1=0".to_string());
                }
                let params: Vec<String> =
                    values.iter().map(|v| self.param(v.clone())).collect();
                Ok(format!("{column} IN ({})", params.join(", ")))
            }
            "$between" => {
                let values = operand.as_array().filter(|a| a.len() == 2).ok_or_else(|| {
                    FilterError::InvalidOperatorData(
                        "$between requires an array of exactly 2 values".to_string(),
                    )
                })?;
                let low = self.param(values[0].clone());
                let high = self.param(values[1].clone());
                Ok(format!("{column} BETWEEN {low} AND {high}"))
            }
            other => Err(FilterError::UnsupportedOperator(other.to_string())),
        }
    }

    fn param(&mut self, value: Value) -> String {
        self.params.push(value);
        self.index += 1;
        format!("${}", self.index)
    }
}

/// Translate an order spec into an `ORDER BY` clause (empty string if none).
///
/// Accepted shapes: `"createdAt desc"`, `["updatedAt desc", "name"]`,
/// `{ "updatedAt": "desc" }`.
pub fn order_sql(order: &Value) -> Result<String, FilterError> {
    let pairs = parse_order(order)?;
    if pairs.is_empty() {
        return Ok(String::new());
    }
    let parts: Vec<String> = pairs
        .iter()
        .map(|(col, desc)| {
            format!("{} {}", quote_identifier(col), if *desc { "DESC" } else { "ASC" })
        })
        .collect();
    Ok(format!("ORDER BY {}", parts.join(", ")))
}

fn parse_order(order: &Value) -> Result<Vec<(String, bool)>, FilterError> {
    let mut out = Vec::new();
    match order {
        Value::Null => {}
        Value::String(s) => parse_order_string(s, &mut out)?,
        Value::Array(arr) => {
            for v in arr {
                if let Value::String(s) = v {
                    parse_order_string(s, &mut out)?;
                }
            }
        }
        Value::Object(obj) => {
            for (col, dir) in obj {
                validate_identifier(col)?;
                let desc = dir.as_str().is_some_and(|s| s.eq_ignore_ascii_case("desc"));
                out.push((col.clone(), desc));
            }
        }
        _ => {}
    }
    Ok(out)
}

fn parse_order_string(s: &str, out: &mut Vec<(String, bool)>) -> Result<(), FilterError> {
    for part in s.split(',') {
        let trimmed = part.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut it = trimmed.split_whitespace();
        if let Some(col) = it.next() {
            validate_identifier(col)?;
            let desc = it.next().is_some_and(|d| d.eq_ignore_ascii_case("desc"));
            out.push((col.to_string(), desc));
        }
    }
    Ok(())
}
