#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tokio::sync::RwLock;
use tracing::debug;

use crate::errors::StoreError;
use crate::models::embedding::{ElementType, EmbeddingRecord, NewEmbedding, GLOBAL_SCOPE};
use crate::rag::similarity::SearchFilter;

/// The set of records a replace or delete acts on.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplaceScope {
    /// Every record owned by one data source.
    DataSource(i64),
    Schema { data_source_id: i64, schema_id: i64 },
    /// A single global KPI or glossary record.
    Definition {
        element_type: ElementType,
        element_name: String,
    },
}

impl ReplaceScope {
    fn matches(&self, record: &EmbeddingRecord) -> bool {
        match self {
            ReplaceScope::DataSource(id) => record.data_source_id == *id,
            ReplaceScope::Schema {
                data_source_id,
                schema_id,
            } => record.data_source_id == *data_source_id && record.schema_id == *schema_id,
            ReplaceScope::Definition {
                element_type,
                element_name,
            } => {
                record.data_source_id == GLOBAL_SCOPE
                    && record.element_type == *element_type
                    && record.element_name == *element_name
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EmbeddingStats {
    pub embedding_count: i64,
    pub last_updated: Option<DateTime<Utc>>,
}

/// Persistence for embedding records.
///
/// `replace` must be atomic from a reader's point of view: a concurrent
/// `candidates` call sees either the old records for the scope or the new
/// ones, never a mix.
#[async_trait]
pub trait EmbeddingStore: Send + Sync {
    async fn replace(
        &self,
        scope: &ReplaceScope,
        records: Vec<NewEmbedding>,
    ) -> Result<usize, StoreError>;

    /// Live records visible to `filter`, in id order.
    async fn candidates(&self, filter: &SearchFilter) -> Result<Vec<EmbeddingRecord>, StoreError>;

    async fn delete(&self, scope: &ReplaceScope) -> Result<u64, StoreError>;

    async fn stats(&self, data_source_id: i64) -> Result<EmbeddingStats, StoreError>;
}

// ────────────────────────────────────────────────────────────────────────────
// PostgreSQL
// ────────────────────────────────────────────────────────────────────────────

pub struct PgEmbeddingStore {
    pool: PgPool,
}

impl PgEmbeddingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn push_scope(qb: &mut QueryBuilder<'_, Postgres>, scope: &ReplaceScope) {
    match scope {
        ReplaceScope::DataSource(id) => {
            qb.push(" AND data_source_id = ").push_bind(*id);
        }
        ReplaceScope::Schema {
            data_source_id,
            schema_id,
        } => {
            qb.push(" AND data_source_id = ")
                .push_bind(*data_source_id)
                .push(" AND schema_id = ")
                .push_bind(*schema_id);
        }
        ReplaceScope::Definition {
            element_type,
            element_name,
        } => {
            qb.push(" AND data_source_id = ")
                .push_bind(GLOBAL_SCOPE)
                .push(" AND element_type = ")
                .push_bind(element_type.as_str())
                .push(" AND element_name = ")
                .push_bind(element_name.clone());
        }
    }
}

#[async_trait]
impl EmbeddingStore for PgEmbeddingStore {
    async fn replace(
        &self,
        scope: &ReplaceScope,
        records: Vec<NewEmbedding>,
    ) -> Result<usize, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Tombstone the old scope, then insert; both land in one commit.
        let mut qb = QueryBuilder::<Postgres>::new(
            "UPDATE schema_embeddings SET deleted_at = NOW() WHERE deleted_at IS NULL",
        );
        push_scope(&mut qb, scope);
        let tombstoned = qb.build().execute(&mut *tx).await?.rows_affected();

        for record in &records {
            sqlx::query(
                r#"
                INSERT INTO schema_embeddings
                    (data_source_id, schema_id, element_type, element_name, content, embedding, metadata)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(record.data_source_id)
            .bind(record.schema_id)
            .bind(record.element_type.as_str())
            .bind(&record.element_name)
            .bind(&record.content)
            .bind(&record.embedding)
            .bind(&record.metadata)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!(?scope, tombstoned, inserted = records.len(), "embedding scope replaced");
        Ok(records.len())
    }

    async fn candidates(&self, filter: &SearchFilter) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let types: Vec<String> = filter
            .element_types
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();

        let rows: Vec<EmbeddingRecord> = sqlx::query_as(
            r#"
            SELECT id, data_source_id, schema_id, element_type, element_name,
                   content, embedding, metadata, created_at, updated_at
            FROM schema_embeddings
            WHERE deleted_at IS NULL
              AND (data_source_id = $1 OR data_source_id = 0)
              AND (cardinality($2::text[]) = 0 OR element_type = ANY($2))
            ORDER BY id
            "#,
        )
        .bind(filter.data_source_id)
        .bind(&types)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn delete(&self, scope: &ReplaceScope) -> Result<u64, StoreError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "UPDATE schema_embeddings SET deleted_at = NOW() WHERE deleted_at IS NULL",
        );
        push_scope(&mut qb, scope);
        Ok(qb.build().execute(&self.pool).await?.rows_affected())
    }

    async fn stats(&self, data_source_id: i64) -> Result<EmbeddingStats, StoreError> {
        let (embedding_count, last_updated): (i64, Option<DateTime<Utc>>) = sqlx::query_as(
            r#"
            SELECT COUNT(*), MAX(updated_at)
            FROM schema_embeddings
            WHERE deleted_at IS NULL AND data_source_id = $1
            "#,
        )
        .bind(data_source_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(EmbeddingStats {
            embedding_count,
            last_updated,
        })
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    next_id: i64,
    records: Vec<EmbeddingRecord>,
}

/// Process-local store. A single write lock covers delete + insert.
#[derive(Default)]
pub struct MemoryEmbeddingStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryEmbeddingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn visible(filter: &SearchFilter, record: &EmbeddingRecord) -> bool {
    let source_ok =
        record.data_source_id == GLOBAL_SCOPE || record.data_source_id == filter.data_source_id;
    let type_ok =
        filter.element_types.is_empty() || filter.element_types.contains(&record.element_type);
    source_ok && type_ok
}

#[async_trait]
impl EmbeddingStore for MemoryEmbeddingStore {
    async fn replace(
        &self,
        scope: &ReplaceScope,
        records: Vec<NewEmbedding>,
    ) -> Result<usize, StoreError> {
        let mut inner = self.inner.write().await;
        inner.records.retain(|r| !scope.matches(r));

        let count = records.len();
        let now = Utc::now();
        for record in records {
            inner.next_id += 1;
            let id = inner.next_id;
            inner.records.push(EmbeddingRecord {
                id,
                data_source_id: record.data_source_id,
                schema_id: record.schema_id,
                element_type: record.element_type,
                element_name: record.element_name,
                content: record.content,
                embedding: record.embedding,
                metadata: record.metadata,
                created_at: now,
                updated_at: now,
            });
        }
        Ok(count)
    }

    async fn candidates(&self, filter: &SearchFilter) -> Result<Vec<EmbeddingRecord>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .records
            .iter()
            .filter(|r| visible(filter, r))
            .cloned()
            .collect())
    }

    async fn delete(&self, scope: &ReplaceScope) -> Result<u64, StoreError> {
        let mut inner = self.inner.write().await;
        let before = inner.records.len();
        inner.records.retain(|r| !scope.matches(r));
        Ok((before - inner.records.len()) as u64)
    }

    async fn stats(&self, data_source_id: i64) -> Result<EmbeddingStats, StoreError> {
        let inner = self.inner.read().await;
        let owned = inner
            .records
            .iter()
            .filter(|r| r.data_source_id == data_source_id);
        let mut stats = EmbeddingStats::default();
        for record in owned {
            stats.embedding_count += 1;
            stats.last_updated = stats.last_updated.max(Some(record.updated_at));
        }
        Ok(stats)
    }
}
