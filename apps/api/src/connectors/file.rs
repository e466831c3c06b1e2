//! CSV-backed data sources, plus the in-process table planner that the
//! spreadsheet connector shares.
//!
//! Queries are answered without a SQL engine: only plain projections of a
//! single table are supported, optionally filtered by `col = literal`
//! conditions joined with AND.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime};
use serde_json::{Number, Value};
use sqlparser::ast::{
    BinaryOperator, Expr, GroupByExpr, Query, SelectItem, SetExpr, TableFactor,
    Value as SqlValue,
};

use crate::models::data_source::{ColumnDef, DiscoveredSchema};
use crate::safety::analysis::{object_name, parse_query};
use crate::safety::ApprovedSql;

use super::config::FileConfig;
use super::{Connector, ConnectorError, QueryOutput, Row};

const INFERENCE_ROWS: usize = 100;
const SAMPLE_VALUES: usize = 5;
/// Share of non-empty values that must agree on a type.
const TYPE_AGREEMENT: f64 = 0.7;

pub struct CsvConnector {
    config: FileConfig,
}

/// Header row plus raw cell text. Short records read as empty cells.
pub(super) struct Table {
    pub(super) headers: Vec<String>,
    pub(super) records: Vec<Vec<String>>,
}

impl CsvConnector {
    pub fn new(config: FileConfig) -> Self {
        Self { config }
    }

    /// Reads the whole file on a blocking thread.
    async fn load(&self) -> Result<Table, ConnectorError> {
        let config = self.config.clone();
        tokio::task::spawn_blocking(move || read_table(&config))
            .await
            .map_err(|e| ConnectorError::Query(format!("file reader task failed: {e}")))?
    }
}

fn read_table(config: &FileConfig) -> Result<Table, ConnectorError> {
    let mut delimiter = [0u8; 4];
    let delimiter = config.delimiter.encode_utf8(&mut delimiter).as_bytes()[0];
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_path(&config.path)?;

    let headers = reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();
    let mut records = Vec::new();
    for record in reader.records() {
        records.push(record?.iter().map(str::to_string).collect());
    }
    Ok(Table { headers, records })
}

// ────────────────────────────────────────────────────────────────────────────
// Type inference
// ────────────────────────────────────────────────────────────────────────────

fn detect_type(value: &str) -> Option<&'static str> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let lower = value.to_ascii_lowercase();
    if matches!(lower.as_str(), "true" | "false" | "yes" | "no") {
        return Some("boolean");
    }
    if value.parse::<i64>().is_ok() {
        return Some("integer");
    }
    if value.parse::<f64>().is_ok() {
        return Some("float");
    }
    if NaiveDate::parse_from_str(value, "%Y-%m-%d").is_ok()
        || NaiveDate::parse_from_str(value, "%Y/%m/%d").is_ok()
    {
        return Some("date");
    }
    if DateTime::parse_from_rfc3339(value).is_ok()
        || NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S").is_ok()
    {
        return Some("datetime");
    }
    Some("string")
}

/// Most common detected type if it covers enough of the non-empty values.
/// Integers count towards `float` when the two are mixed.
pub fn infer_column_type<'a>(values: impl IntoIterator<Item = &'a str>) -> &'static str {
    let mut counts: HashMap<&'static str, usize> = HashMap::new();
    let mut total = 0usize;
    for ty in values.into_iter().filter_map(detect_type) {
        *counts.entry(ty).or_default() += 1;
        total += 1;
    }
    if total == 0 {
        return "string";
    }

    let integers = counts.get("integer").copied().unwrap_or(0);
    let floats = counts.get("float").copied().unwrap_or(0);
    if floats > 0 {
        counts.insert("float", floats + integers);
    }

    let threshold = total as f64 * TYPE_AGREEMENT;
    let mut ranked: Vec<_> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    match ranked.first() {
        Some((ty, count)) if *count as f64 >= threshold => *ty,
        _ => "string",
    }
}

fn typed_value(column_type: &str, raw: &str) -> Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return Value::Null;
    }
    let parsed = match column_type {
        "integer" => raw.parse::<i64>().ok().map(|n| Value::Number(n.into())),
        "float" => raw
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number),
        "boolean" => match raw.to_ascii_lowercase().as_str() {
            "true" | "yes" => Some(Value::Bool(true)),
            "false" | "no" => Some(Value::Bool(false)),
            _ => None,
        },
        _ => None,
    };
    parsed.unwrap_or_else(|| Value::String(raw.to_string()))
}

impl Table {
    fn column(&self, index: usize) -> impl Iterator<Item = &str> {
        self.records
            .iter()
            .map(move |r| r.get(index).map(String::as_str).unwrap_or(""))
    }

    pub(super) fn column_defs(&self) -> Vec<ColumnDef> {
        self.headers
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let mut column = ColumnDef::new(
                    name.clone(),
                    infer_column_type(self.column(i).take(INFERENCE_ROWS)),
                );
                let mut samples: Vec<Value> = Vec::new();
                for raw in self.column(i) {
                    let value = typed_value(&column.data_type, raw);
                    if !value.is_null() && !samples.contains(&value) {
                        samples.push(value);
                    }
                    if samples.len() == SAMPLE_VALUES {
                        break;
                    }
                }
                column.sample_values = samples;
                column
            })
            .collect()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Query planning
// ────────────────────────────────────────────────────────────────────────────

/// A projection over the file's single table.
#[derive(Debug, PartialEq)]
pub(super) struct Plan {
    /// `None` selects every column.
    columns: Option<Vec<(String, String)>>,
    filters: Vec<(String, Value)>,
}

impl Plan {
    pub(super) fn has_filters(&self) -> bool {
        !self.filters.is_empty()
    }
}

fn unsupported(what: &str) -> ConnectorError {
    ConnectorError::Query(format!("file and spreadsheet sources do not support {what}"))
}

/// Lowercased name of the single table in FROM, if there is exactly one.
pub(super) fn target_table(query: &Query) -> Option<String> {
    let SetExpr::Select(select) = query.body.as_ref() else {
        return None;
    };
    let [from] = select.from.as_slice() else {
        return None;
    };
    match &from.relation {
        TableFactor::Table { name, .. } => object_name(name)
            .to_lowercase()
            .rsplit('.')
            .next()
            .map(str::to_string),
        _ => None,
    }
}

fn ident_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => parts.last().map(|i| i.value.clone()),
        _ => None,
    }
}

fn literal(expr: &Expr) -> Option<Value> {
    match expr {
        Expr::Value(SqlValue::SingleQuotedString(s)) => Some(Value::String(s.clone())),
        Expr::Value(SqlValue::Number(n, _)) => {
            let n: f64 = n.parse().ok()?;
            Number::from_f64(n).map(Value::Number)
        }
        Expr::Value(SqlValue::Boolean(b)) => Some(Value::Bool(*b)),
        _ => None,
    }
}

fn collect_filters(expr: &Expr, out: &mut Vec<(String, Value)>) -> Result<(), ConnectorError> {
    match expr {
        Expr::Nested(inner) => collect_filters(inner, out),
        Expr::BinaryOp {
            left,
            op: BinaryOperator::And,
            right,
        } => {
            collect_filters(left, out)?;
            collect_filters(right, out)
        }
        Expr::BinaryOp {
            left,
            op: BinaryOperator::Eq,
            right,
        } => {
            let (column, value) = match (ident_name(left), literal(right)) {
                (Some(c), Some(v)) => (c, v),
                _ => match (ident_name(right), literal(left)) {
                    (Some(c), Some(v)) => (c, v),
                    _ => return Err(unsupported("this filter")),
                },
            };
            out.push((column, value));
            Ok(())
        }
        _ => Err(unsupported("this filter")),
    }
}

pub(super) fn plan(query: &Query, table_name: &str) -> Result<Plan, ConnectorError> {
    if query.with.is_some() {
        return Err(unsupported("WITH clauses"));
    }
    if !query.order_by.is_empty() {
        return Err(unsupported("ORDER BY"));
    }
    if query.offset.is_some() {
        return Err(unsupported("OFFSET"));
    }
    let SetExpr::Select(select) = query.body.as_ref() else {
        return Err(unsupported("set operations"));
    };
    if select.distinct.is_some() {
        return Err(unsupported("DISTINCT"));
    }
    if !matches!(&select.group_by, GroupByExpr::Expressions(e) if e.is_empty())
        || select.having.is_some()
    {
        return Err(unsupported("aggregation"));
    }

    let [from] = select.from.as_slice() else {
        return Err(unsupported("multiple tables"));
    };
    if !from.joins.is_empty() {
        return Err(unsupported("joins"));
    }
    let TableFactor::Table { name, .. } = &from.relation else {
        return Err(unsupported("subqueries"));
    };
    let requested = object_name(name).to_lowercase();
    if requested.rsplit('.').next() != Some(table_name) {
        return Err(ConnectorError::Query(format!(
            "unknown table '{requested}', this source exposes '{table_name}'"
        )));
    }

    let mut columns = Some(Vec::new());
    for item in &select.projection {
        match item {
            SelectItem::Wildcard(_) | SelectItem::QualifiedWildcard(..) => columns = None,
            SelectItem::UnnamedExpr(expr) => {
                let name = ident_name(expr).ok_or_else(|| unsupported("computed columns"))?;
                if let Some(cols) = columns.as_mut() {
                    cols.push((name.clone(), name));
                }
            }
            SelectItem::ExprWithAlias { expr, alias } => {
                let name = ident_name(expr).ok_or_else(|| unsupported("computed columns"))?;
                if let Some(cols) = columns.as_mut() {
                    cols.push((name, alias.value.clone()));
                }
            }
        }
    }

    let mut filters = Vec::new();
    if let Some(selection) = &select.selection {
        collect_filters(selection, &mut filters)?;
    }
    Ok(Plan { columns, filters })
}

fn matches_filter(cell: &Value, wanted: &Value) -> bool {
    match (cell, wanted) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (a, b) => a == b,
    }
}

pub(super) fn run_plan(
    table: &Table,
    plan: &Plan,
    limit: i64,
) -> Result<QueryOutput, ConnectorError> {
    let defs = table.column_defs();
    let index_of = |name: &str| -> Result<usize, ConnectorError> {
        table
            .headers
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .ok_or_else(|| ConnectorError::Query(format!("unknown column '{name}'")))
    };

    let selected: Vec<(usize, String)> = match &plan.columns {
        None => table.headers.iter().cloned().enumerate().collect(),
        Some(cols) => cols
            .iter()
            .map(|(name, alias)| Ok((index_of(name)?, alias.clone())))
            .collect::<Result<_, ConnectorError>>()?,
    };
    let filters: Vec<(usize, &Value)> = plan
        .filters
        .iter()
        .map(|(name, value)| Ok((index_of(name)?, value)))
        .collect::<Result<_, ConnectorError>>()?;

    let mut output = QueryOutput {
        columns: selected
            .iter()
            .map(|(i, alias)| ColumnDef {
                name: alias.clone(),
                sample_values: Vec::new(),
                ..defs[*i].clone()
            })
            .collect(),
        rows: Vec::new(),
    };

    let cell = |record: &[String], i: usize| {
        typed_value(&defs[i].data_type, record.get(i).map(String::as_str).unwrap_or(""))
    };
    for record in &table.records {
        if output.rows.len() as i64 >= limit {
            break;
        }
        if !filters
            .iter()
            .all(|(i, wanted)| matches_filter(&cell(record, *i), wanted))
        {
            continue;
        }
        let row: Row = selected
            .iter()
            .map(|(i, alias)| (alias.clone(), cell(record, *i)))
            .collect();
        output.rows.push(row);
    }
    Ok(output)
}

#[async_trait]
impl Connector for CsvConnector {
    async fn test_connection(&self) -> Result<(), ConnectorError> {
        tokio::fs::metadata(&self.config.path).await?;
        Ok(())
    }

    async fn get_schema(&self) -> Result<Vec<DiscoveredSchema>, ConnectorError> {
        let table = self.load().await?;
        let name = self.config.table_name();
        Ok(vec![DiscoveredSchema {
            display_name: self
                .config
                .path
                .file_name()
                .map(|f| f.to_string_lossy().into_owned()),
            description: Some(format!("CSV file: {}", self.config.path.display())),
            columns: table.column_defs(),
            row_count: table.records.len() as i64,
            name,
        }])
    }

    async fn execute(&self, sql: &ApprovedSql, limit: i64) -> Result<QueryOutput, ConnectorError> {
        let query = parse_query(sql.as_str()).map_err(|e| ConnectorError::Query(e.to_string()))?;
        let plan = plan(&query, &self.config.table_name())?;
        let table = self.load().await?;
        run_plan(&table, &plan, limit)
    }
}
