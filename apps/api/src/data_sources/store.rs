#![allow(dead_code)]

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::errors::StoreError;
use crate::models::data_source::{ConnectionStatus, DataSourceRow, DiscoveredSchema, SchemaRow};

#[async_trait]
pub trait DataSourceStore: Send + Sync {
    /// The source if it exists and belongs to `user_id`.
    async fn get_owned(&self, id: i64, user_id: Uuid) -> Result<Option<DataSourceRow>, StoreError>;

    async fn get(&self, id: i64) -> Result<Option<DataSourceRow>, StoreError>;

    async fn list_active(&self) -> Result<Vec<DataSourceRow>, StoreError>;

    async fn active_schemas(&self, data_source_id: i64) -> Result<Vec<SchemaRow>, StoreError>;

    /// Replaces every schema row of a source with freshly discovered ones.
    async fn replace_schemas(
        &self,
        data_source_id: i64,
        schemas: Vec<DiscoveredSchema>,
    ) -> Result<Vec<SchemaRow>, StoreError>;

    async fn last_schema_update(
        &self,
        data_source_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Records the outcome of a connection test or discovery run.
    async fn set_status(
        &self,
        data_source_id: i64,
        status: ConnectionStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError>;

    async fn names(&self, ids: &[i64]) -> Result<HashMap<i64, String>, StoreError>;
}

// ────────────────────────────────────────────────────────────────────────────
// PostgreSQL
// ────────────────────────────────────────────────────────────────────────────

pub struct PgDataSourceStore {
    pool: PgPool,
}

impl PgDataSourceStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

const SOURCE_COLUMNS: &str = "id, user_id, name, description, kind, status, config, \
     last_tested, error_message, created_at, updated_at";

const SCHEMA_COLUMNS: &str = "id, data_source_id, name, display_name, description, columns, \
     row_count, is_active, created_at, updated_at";

#[async_trait]
impl DataSourceStore for PgDataSourceStore {
    async fn get_owned(&self, id: i64, user_id: Uuid) -> Result<Option<DataSourceRow>, StoreError> {
        let row: Option<DataSourceRow> = sqlx::query_as(&format!(
            "SELECT {SOURCE_COLUMNS} FROM data_sources \
             WHERE id = $1 AND user_id = $2 AND deleted_at IS NULL"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get(&self, id: i64) -> Result<Option<DataSourceRow>, StoreError> {
        let row: Option<DataSourceRow> = sqlx::query_as(&format!(
            "SELECT {SOURCE_COLUMNS} FROM data_sources WHERE id = $1 AND deleted_at IS NULL"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn list_active(&self) -> Result<Vec<DataSourceRow>, StoreError> {
        let rows: Vec<DataSourceRow> = sqlx::query_as(&format!(
            "SELECT {SOURCE_COLUMNS} FROM data_sources \
             WHERE status = 'active' AND deleted_at IS NULL ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn active_schemas(&self, data_source_id: i64) -> Result<Vec<SchemaRow>, StoreError> {
        let rows: Vec<SchemaRow> = sqlx::query_as(&format!(
            "SELECT {SCHEMA_COLUMNS} FROM schemas \
             WHERE data_source_id = $1 AND is_active AND deleted_at IS NULL ORDER BY id"
        ))
        .bind(data_source_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn replace_schemas(
        &self,
        data_source_id: i64,
        schemas: Vec<DiscoveredSchema>,
    ) -> Result<Vec<SchemaRow>, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "UPDATE schemas SET deleted_at = NOW(), is_active = FALSE \
             WHERE data_source_id = $1 AND deleted_at IS NULL",
        )
        .bind(data_source_id)
        .execute(&mut *tx)
        .await?;

        let mut rows = Vec::with_capacity(schemas.len());
        for schema in schemas {
            let row: SchemaRow = sqlx::query_as(&format!(
                "INSERT INTO schemas \
                     (data_source_id, name, display_name, description, columns, row_count) \
                 VALUES ($1, $2, $3, $4, $5, $6) \
                 RETURNING {SCHEMA_COLUMNS}"
            ))
            .bind(data_source_id)
            .bind(&schema.name)
            .bind(&schema.display_name)
            .bind(&schema.description)
            .bind(Json(&schema.columns))
            .bind(schema.row_count)
            .fetch_one(&mut *tx)
            .await?;
            rows.push(row);
        }

        tx.commit().await?;
        info!(data_source_id, schemas = rows.len(), "schemas replaced");
        Ok(rows)
    }

    async fn last_schema_update(
        &self,
        data_source_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let ts: Option<DateTime<Utc>> = sqlx::query_scalar(
            "SELECT MAX(updated_at) FROM schemas \
             WHERE data_source_id = $1 AND is_active AND deleted_at IS NULL",
        )
        .bind(data_source_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(ts)
    }

    async fn set_status(
        &self,
        data_source_id: i64,
        status: ConnectionStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE data_sources \
             SET status = $2, error_message = $3, last_tested = NOW(), updated_at = NOW() \
             WHERE id = $1",
        )
        .bind(data_source_id)
        .bind(status.as_str())
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn names(&self, ids: &[i64]) -> Result<HashMap<i64, String>, StoreError> {
        let rows: Vec<(i64, String)> =
            sqlx::query_as("SELECT id, name FROM data_sources WHERE id = ANY($1)")
                .bind(ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }
}

// ────────────────────────────────────────────────────────────────────────────
// In-memory
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct MemoryInner {
    sources: Vec<DataSourceRow>,
    schemas: Vec<SchemaRow>,
    next_schema_id: i64,
}

#[derive(Default)]
pub struct MemoryDataSourceStore {
    inner: RwLock<MemoryInner>,
}

impl MemoryDataSourceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_source(&self, row: DataSourceRow) {
        let mut inner = self.inner.write().await;
        inner.sources.retain(|s| s.id != row.id);
        inner.sources.push(row);
    }
}

#[async_trait]
impl DataSourceStore for MemoryDataSourceStore {
    async fn get_owned(&self, id: i64, user_id: Uuid) -> Result<Option<DataSourceRow>, StoreError> {
        Ok(self.get(id).await?.filter(|s| s.user_id == user_id))
    }

    async fn get(&self, id: i64) -> Result<Option<DataSourceRow>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.sources.iter().find(|s| s.id == id).cloned())
    }

    async fn list_active(&self) -> Result<Vec<DataSourceRow>, StoreError> {
        let inner = self.inner.read().await;
        let mut active: Vec<_> = inner.sources.iter().filter(|s| s.is_active()).cloned().collect();
        active.sort_by_key(|s| s.id);
        Ok(active)
    }

    async fn active_schemas(&self, data_source_id: i64) -> Result<Vec<SchemaRow>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .schemas
            .iter()
            .filter(|s| s.data_source_id == data_source_id && s.is_active)
            .cloned()
            .collect())
    }

    async fn replace_schemas(
        &self,
        data_source_id: i64,
        schemas: Vec<DiscoveredSchema>,
    ) -> Result<Vec<SchemaRow>, StoreError> {
        let mut inner = self.inner.write().await;
        inner.schemas.retain(|s| s.data_source_id != data_source_id);

        let now = Utc::now();
        let mut rows = Vec::with_capacity(schemas.len());
        for schema in schemas {
            inner.next_schema_id += 1;
            let row = SchemaRow {
                id: inner.next_schema_id,
                data_source_id,
                name: schema.name,
                display_name: schema.display_name,
                description: schema.description,
                columns: Json(schema.columns),
                row_count: schema.row_count,
                is_active: true,
                created_at: now,
                updated_at: now,
            };
            inner.schemas.push(row.clone());
            rows.push(row);
        }
        Ok(rows)
    }

    async fn last_schema_update(
        &self,
        data_source_id: i64,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .schemas
            .iter()
            .filter(|s| s.data_source_id == data_source_id && s.is_active)
            .map(|s| s.updated_at)
            .max())
    }

    async fn set_status(
        &self,
        data_source_id: i64,
        status: ConnectionStatus,
        error_message: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(source) = inner.sources.iter_mut().find(|s| s.id == data_source_id) {
            source.status = status;
            source.error_message = error_message;
            source.last_tested = Some(Utc::now());
            source.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn names(&self, ids: &[i64]) -> Result<HashMap<i64, String>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner
            .sources
            .iter()
            .filter(|s| ids.contains(&s.id))
            .map(|s| (s.id, s.name.clone()))
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use serde_json::json;

    use crate::models::data_source::{ColumnDef, DataSourceKind};

    pub fn source(id: i64, user_id: Uuid, status: ConnectionStatus) -> DataSourceRow {
        DataSourceRow {
            id,
            user_id,
            name: format!("source-{id}"),
            description: None,
            kind: DataSourceKind::Postgresql,
            status,
            config: json!({"host": "localhost", "database": "shop", "username": "reader"}),
            last_tested: None,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    pub fn sales_schema() -> DiscoveredSchema {
        DiscoveredSchema {
            name: "sales".into(),
            display_name: Some("Sales".into()),
            description: Some("Daily sales".into()),
            columns: vec![
                ColumnDef::new("amount", "numeric"),
                ColumnDef::new("region", "text"),
            ],
            row_count: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[tokio::test]
    async fn test_ownership_hides_foreign_sources() {
        let store = MemoryDataSourceStore::new();
        let owner = Uuid::new_v4();
        store.insert_source(source(1, owner, ConnectionStatus::Active)).await;

        assert!(store.get_owned(1, owner).await.unwrap().is_some());
        assert!(store.get_owned(1, Uuid::new_v4()).await.unwrap().is_none());
        assert!(store.get_owned(2, owner).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_replace_schemas_drops_previous_rows() {
        let store = MemoryDataSourceStore::new();
        let owner = Uuid::new_v4();
        store.insert_source(source(1, owner, ConnectionStatus::Active)).await;
        store.insert_source(source(2, owner, ConnectionStatus::Inactive)).await;

        store.replace_schemas(1, vec![sales_schema()]).await.unwrap();
        let second = store.replace_schemas(1, vec![sales_schema()]).await.unwrap();

        let schemas = store.active_schemas(1).await.unwrap();
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].id, second[0].id);
        assert!(store.last_schema_update(1).await.unwrap().is_some());

        let active: Vec<_> = store.list_active().await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(active, vec![1]);
    }
}
