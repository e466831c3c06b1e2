#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::query::{
    ConversionOutcome, ExecutionOutcome, NewQuery, QueryRecord, QueryResultRow, QueryStatus,
};

/// Persistence for query records and their stored results. Deleted rows are
/// tombstoned and never returned again.
#[async_trait]
pub trait QueryStore: Send + Sync {
    async fn create(&self, query: NewQuery) -> Result<QueryRecord, StoreError>;

    /// Writes the conversion outcome onto a `pending` record.
    async fn record_conversion(
        &self,
        id: i64,
        outcome: ConversionOutcome,
    ) -> Result<QueryRecord, StoreError>;

    /// Moves the record to `to` only if its status is one of `from`.
    /// Returns false when another writer got there first.
    async fn transition(
        &self,
        id: i64,
        from: &[QueryStatus],
        to: QueryStatus,
    ) -> Result<bool, StoreError>;

    async fn record_execution(
        &self,
        id: i64,
        outcome: ExecutionOutcome,
    ) -> Result<QueryRecord, StoreError>;

    async fn save_result(
        &self,
        query_id: i64,
        columns: Value,
        data: Value,
        row_count: i64,
    ) -> Result<QueryResultRow, StoreError>;

    async fn latest_result(&self, query_id: i64) -> Result<Option<QueryResultRow>, StoreError>;

    async fn get_owned(&self, id: i64, user_id: Uuid) -> Result<Option<QueryRecord>, StoreError>;

    async fn delete_results(&self, query_id: i64) -> Result<u64, StoreError>;

    async fn delete(&self, id: i64) -> Result<bool, StoreError>;

    /// Newest first.
    async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueryRecord>, StoreError>;
}

fn status_strings(statuses: &[QueryStatus]) -> Vec<String> {
    statuses.iter().map(|s| s.as_str().to_string()).collect()
}

// ────────────────────────────────────────────────────────────────────────────
// PostgreSQL
// ────────────────────────────────────────────────────────────────────────────

pub struct PgQueryStore {
    pool: PgPool,
}

impl PgQueryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const QUERY_COLUMNS: &str = "id, user_id, data_source_id, nl_query, generated_sql, status, \
     query_type, context, metadata, error_message, execution_time_ms, rows_returned, \
     created_at, updated_at";

const RESULT_COLUMNS: &str = "id, query_id, columns, data, row_count, created_at";

#[async_trait]
impl QueryStore for PgQueryStore {
    async fn create(&self, query: NewQuery) -> Result<QueryRecord, StoreError> {
        let row: QueryRecord = sqlx::query_as(&format!(
            "INSERT INTO nl2sql_queries (user_id, data_source_id, nl_query, status, query_type, context) \
             VALUES ($1, $2, $3, 'pending', $4, $5) \
             RETURNING {QUERY_COLUMNS}"
        ))
        .bind(query.user_id)
        .bind(query.data_source_id)
        .bind(&query.nl_query)
        .bind(query.query_type.as_str())
        .bind(&query.context)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn record_conversion(
        &self,
        id: i64,
        outcome: ConversionOutcome,
    ) -> Result<QueryRecord, StoreError> {
        let row: Option<QueryRecord> = sqlx::query_as(&format!(
            "UPDATE nl2sql_queries \
             SET generated_sql = $2, status = $3, metadata = $4, error_message = $5, updated_at = NOW() \
             WHERE id = $1 AND status = 'pending' AND deleted_at IS NULL \
             RETURNING {QUERY_COLUMNS}"
        ))
        .bind(id)
        .bind(&outcome.generated_sql)
        .bind(outcome.status.as_str())
        .bind(&outcome.metadata)
        .bind(&outcome.error_message)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::Corrupt(format!("query {id} is no longer pending")))
    }

    async fn transition(
        &self,
        id: i64,
        from: &[QueryStatus],
        to: QueryStatus,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE nl2sql_queries SET status = $2, updated_at = NOW() \
             WHERE id = $1 AND status = ANY($3) AND deleted_at IS NULL",
        )
        .bind(id)
        .bind(to.as_str())
        .bind(status_strings(from))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_execution(
        &self,
        id: i64,
        outcome: ExecutionOutcome,
    ) -> Result<QueryRecord, StoreError> {
        let row: Option<QueryRecord> = sqlx::query_as(&format!(
            "UPDATE nl2sql_queries \
             SET status = $2, execution_time_ms = $3, rows_returned = $4, error_message = $5, \
                 updated_at = NOW() \
             WHERE id = $1 AND status = 'running' AND deleted_at IS NULL \
             RETURNING {QUERY_COLUMNS}"
        ))
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(outcome.execution_time_ms)
        .bind(outcome.rows_returned)
        .bind(&outcome.error_message)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| StoreError::Corrupt(format!("query {id} is not running")))
    }

    async fn save_result(
        &self,
        query_id: i64,
        columns: Value,
        data: Value,
        row_count: i64,
    ) -> Result<QueryResultRow, StoreError> {
        let row: QueryResultRow = sqlx::query_as(&format!(
            "INSERT INTO query_results (query_id, columns, data, row_count) \
             VALUES ($1, $2, $3, $4) RETURNING {RESULT_COLUMNS}"
        ))
        .bind(query_id)
        .bind(columns)
        .bind(data)
        .bind(row_count)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    async fn latest_result(&self, query_id: i64) -> Result<Option<QueryResultRow>, StoreError> {
        let row: Option<QueryResultRow> = sqlx::query_as(&format!(
            "SELECT {RESULT_COLUMNS} FROM query_results \
             WHERE query_id = $1 AND deleted_at IS NULL ORDER BY id DESC LIMIT 1"
        ))
        .bind(query_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get_owned(&self, id: i64, user_id: Uuid) -> Result<Option<QueryRecord>, StoreError> {
        let row: Option<QueryRecord> = sqlx::query_as(&format!(
            "SELECT {QUERY_COLUMNS} FROM nl2sql_queries \
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn delete_results(&self, query_id: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE query_results SET deleted_at = NOW() \
             WHERE query_id = $1 AND deleted_at IS NULL",
        )
        .bind(query_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE nl2sql_queries SET deleted_at = NOW() WHERE id = $1 AND deleted_at IS NULL",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueryRecord>, StoreError> {
        let rows: Vec<QueryRecord> = sqlx::query_as(&format!(
            "SELECT {QUERY_COLUMNS} FROM nl2sql_queries \
             WHERE user_id = $1 AND deleted_at IS NULL \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        ))
        .bind(user_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    queries: Vec<QueryRecord>,
    results: Vec<QueryResultRow>,
    next_query_id: i64,
    next_result_id: i64,
}

#[derive(Default)]
pub struct MemoryQueryStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryQueryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn missing(id: i64, state: &str) -> StoreError {
    StoreError::Corrupt(format!("query {id} is {state}"))
}

#[async_trait]
impl QueryStore for MemoryQueryStore {
    async fn create(&self, query: NewQuery) -> Result<QueryRecord, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_query_id += 1;
        let now = Utc::now();
        let record = QueryRecord {
            id: inner.next_query_id,
            user_id: query.user_id,
            data_source_id: query.data_source_id,
            nl_query: query.nl_query,
            generated_sql: None,
            status: QueryStatus::Pending,
            query_type: query.query_type,
            context: query.context,
            metadata: Value::Object(Default::default()),
            error_message: None,
            execution_time_ms: 0,
            rows_returned: 0,
            created_at: now,
            updated_at: now,
        };
        inner.queries.push(record.clone());
        Ok(record)
    }

    async fn record_conversion(
        &self,
        id: i64,
        outcome: ConversionOutcome,
    ) -> Result<QueryRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .queries
            .iter_mut()
            .find(|q| q.id == id && q.status == QueryStatus::Pending)
            .ok_or_else(|| missing(id, "no longer pending"))?;
        record.generated_sql = outcome.generated_sql;
        record.status = outcome.status;
        record.metadata = outcome.metadata;
        record.error_message = outcome.error_message;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn transition(
        &self,
        id: i64,
        from: &[QueryStatus],
        to: QueryStatus,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        match inner
            .queries
            .iter_mut()
            .find(|q| q.id == id && from.contains(&q.status))
        {
            Some(record) => {
                record.status = to;
                record.updated_at = Utc::now();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn record_execution(
        &self,
        id: i64,
        outcome: ExecutionOutcome,
    ) -> Result<QueryRecord, StoreError> {
        let mut inner = self.inner.write().await;
        let record = inner
            .queries
            .iter_mut()
            .find(|q| q.id == id && q.status == QueryStatus::Running)
            .ok_or_else(|| missing(id, "not running"))?;
        record.status = outcome.status;
        record.execution_time_ms = outcome.execution_time_ms;
        record.rows_returned = outcome.rows_returned;
        record.error_message = outcome.error_message;
        record.updated_at = Utc::now();
        Ok(record.clone())
    }

    async fn save_result(
        &self,
        query_id: i64,
        columns: Value,
        data: Value,
        row_count: i64,
    ) -> Result<QueryResultRow, StoreError> {
        let mut inner = self.inner.write().await;
        inner.next_result_id += 1;
        let row = QueryResultRow {
            id: inner.next_result_id,
            query_id,
            columns,
            data,
            row_count,
            created_at: Utc::now(),
        };
        inner.results.push(row.clone());
        Ok(row)
    }

    async fn latest_result(&self, query_id: i64) -> Result<Option<QueryResultRow>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .results
            .iter()
            .rev()
            .find(|r| r.query_id == query_id)
            .cloned())
    }

    async fn get_owned(&self, id: i64, user_id: Uuid) -> Result<Option<QueryRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .queries
            .iter()
            .find(|q| q.id == id && q.user_id == user_id)
            .cloned())
    }

    async fn delete_results(&self, query_id: i64) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.results.len();
        inner.results.retain(|r| r.query_id != query_id);
        Ok((before - inner.results.len()) as u64)
    }

    async fn delete(&self, id: i64) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.queries.len();
        inner.queries.retain(|q| q.id != id);
        Ok(inner.queries.len() < before)
    }

    async fn history(
        &self,
        user_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<QueryRecord>, StoreError> {
        let inner = self.inner.read().await;
        let mut rows: Vec<QueryRecord> = inner
            .queries
            .iter()
            .filter(|q| q.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(rows
            .into_iter()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .collect())
    }
}
