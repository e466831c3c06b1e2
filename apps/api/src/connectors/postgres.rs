use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Number, Value};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow, PgSslMode};
use sqlx::{Column, PgPool, Row, TypeInfo};
use tracing::{debug, info};

use crate::models::data_source::{ColumnDef, DiscoveredSchema};
use crate::safety::ApprovedSql;

use super::config::PostgresConfig;
use super::{Connector, ConnectorError, QueryOutput};

const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_CONNECTIONS: u32 = 2;

/// Connector for an external PostgreSQL database. Every statement runs in a
/// READ ONLY transaction that is rolled back afterwards.
pub struct PostgresConnector {
    pool: PgPool,
}

fn ssl_mode(mode: &str) -> PgSslMode {
    match mode {
        "disable" => PgSslMode::Disable,
        "allow" => PgSslMode::Allow,
        "require" => PgSslMode::Require,
        "verify-ca" => PgSslMode::VerifyCa,
        "verify-full" => PgSslMode::VerifyFull,
        _ => PgSslMode::Prefer,
    }
}

impl PostgresConnector {
    pub async fn connect(config: &PostgresConfig) -> Result<Self, ConnectorError> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .password(&config.password)
            .ssl_mode(ssl_mode(&config.ssl_mode));

        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_with(options)
            .await
            .map_err(|e| ConnectorError::Connection(e.to_string()))?;

        info!(host = %config.host, database = %config.database, "connected to PostgreSQL source");
        Ok(Self { pool })
    }
}

#[async_trait]
impl Connector for PostgresConnector {
    async fn test_connection(&self) -> Result<(), ConnectorError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn get_schema(&self) -> Result<Vec<DiscoveredSchema>, ConnectorError> {
        let rows = sqlx::query(
            r#"
            SELECT
                c.table_name,
                c.column_name,
                c.data_type,
                c.is_nullable = 'YES' AS is_nullable,
                EXISTS (
                    SELECT 1 FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                    WHERE tc.table_schema = 'public'
                        AND tc.table_name = c.table_name
                        AND kcu.column_name = c.column_name
                        AND tc.constraint_type = 'PRIMARY KEY'
                ) AS is_primary_key,
                COALESCE(pc.reltuples, 0)::bigint AS row_count
            FROM information_schema.columns c
            JOIN information_schema.tables t
                ON t.table_name = c.table_name AND t.table_schema = c.table_schema
            LEFT JOIN pg_class pc ON pc.relname = c.table_name
            WHERE c.table_schema = 'public' AND t.table_type = 'BASE TABLE'
            ORDER BY c.table_name, c.ordinal_position
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut tables: BTreeMap<String, DiscoveredSchema> = BTreeMap::new();
        for row in rows {
            let table: String = row.try_get("table_name")?;
            let mut column = ColumnDef::new(
                row.try_get::<String, _>("column_name")?,
                row.try_get::<String, _>("data_type")?,
            );
            column.nullable = row.try_get("is_nullable")?;
            column.primary_key = row.try_get("is_primary_key")?;
            let row_count: i64 = row.try_get("row_count")?;

            let entry = tables.entry(table.clone()).or_insert_with(|| DiscoveredSchema {
                name: table,
                row_count: row_count.max(0),
                ..Default::default()
            });
            entry.columns.push(column);
        }

        debug!(tables = tables.len(), "PostgreSQL schema discovered");
        Ok(tables.into_values().collect())
    }

    async fn execute(&self, sql: &ApprovedSql, limit: i64) -> Result<QueryOutput, ConnectorError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await?;
        let rows = sqlx::query(sql.as_str())
            .fetch_all(&mut *tx)
            .await
            .map_err(|e| ConnectorError::Query(e.to_string()))?;
        tx.rollback().await?;

        let mut output = QueryOutput::default();
        if let Some(first) = rows.first() {
            output.columns = first
                .columns()
                .iter()
                .map(|c| ColumnDef::new(c.name(), c.type_info().name().to_lowercase()))
                .collect();
        }
        for row in rows.iter().take(limit.max(0) as usize) {
            let mut map = super::Row::new();
            for (i, column) in row.columns().iter().enumerate() {
                map.insert(column.name().to_string(), column_value(row, i));
            }
            output.rows.push(map);
        }
        Ok(output)
    }
}

/// Decodes one cell into JSON, trying the common Postgres types in turn.
/// Unknown types become `null`.
fn column_value(row: &PgRow, index: usize) -> Value {
    if let Ok(v) = row.try_get::<Option<String>, _>(index) {
        return v.map(Value::String).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i64>, _>(index) {
        return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i32>, _>(index) {
        return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<i16>, _>(index) {
        return v.map(|n| Value::Number(n.into())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f64>, _>(index) {
        return v
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<f32>, _>(index) {
        return v
            .and_then(|f| Number::from_f64(f as f64))
            .map(Value::Number)
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<sqlx::types::Decimal>, _>(index) {
        return v.map(decimal_value).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<bool>, _>(index) {
        return v.map(Value::Bool).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::DateTime<chrono::Utc>>, _>(index) {
        return v
            .map(|dt| Value::String(dt.to_rfc3339()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDateTime>, _>(index) {
        return v
            .map(|dt| Value::String(dt.to_string()))
            .unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<chrono::NaiveDate>, _>(index) {
        return v.map(|d| Value::String(d.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<uuid::Uuid>, _>(index) {
        return v.map(|u| Value::String(u.to_string())).unwrap_or(Value::Null);
    }
    if let Ok(v) = row.try_get::<Option<Value>, _>(index) {
        return v.unwrap_or(Value::Null);
    }
    Value::Null
}

fn decimal_value(d: sqlx::types::Decimal) -> Value {
    let text = d.to_string();
    text.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
        .unwrap_or(Value::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_ssl_mode_parsing() {
        assert!(matches!(ssl_mode("require"), PgSslMode::Require));
        assert!(matches!(ssl_mode("verify-full"), PgSslMode::VerifyFull));
        assert!(matches!(ssl_mode("bogus"), PgSslMode::Prefer));
    }

    #[test]
    fn test_decimal_becomes_number() {
        let d = sqlx::types::Decimal::from_str("1250.75").unwrap();
        assert_eq!(decimal_value(d), serde_json::json!(1250.75));
    }
}
