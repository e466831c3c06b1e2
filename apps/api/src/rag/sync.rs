//! Keeps the similarity index in step with discovered schemas.
//!
//! A source sync builds every schema's records first and then swaps the
//! whole `DataSource` scope in one store call, so a concurrent search sees
//! either the old records or the new ones. Background discovery is handed
//! back as a `SyncTask` the caller owns.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::connectors::{ConnectorError, Dispatcher};
use crate::data_sources::DataSourceStore;
use crate::errors::{AppError, StoreError};
use crate::models::data_source::{ConnectionStatus, DataSourceRow};
use crate::models::embedding::ElementType;
use crate::rag::indexing::{Indexer, IndexingError};
use crate::rag::similarity::{IndexError, SearchFilter};
use crate::rag::store::ReplaceScope;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("data source {0} not found")]
    NotFound(i64),

    #[error("schema {schema_id} not found in data source {data_source_id}")]
    SchemaNotFound { data_source_id: i64, schema_id: i64 },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Indexing(#[from] IndexingError),

    #[error("schema discovery failed: {0}")]
    Discovery(#[from] ConnectorError),

    #[error("sync task did not finish: {0}")]
    Aborted(String),

    #[error("discovery did not finish within {0:?}")]
    TimedOut(Duration),
}

impl From<SyncError> for AppError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::NotFound(id) => AppError::not_found("Data source", id),
            SyncError::SchemaNotFound { schema_id, .. } => AppError::not_found("Schema", schema_id),
            SyncError::Store(e) => e.into(),
            SyncError::Index(e) => e.into(),
            SyncError::Indexing(e) => e.into(),
            SyncError::Discovery(e) => e.into(),
            SyncError::TimedOut(_) => AppError::Timeout(err.to_string()),
            other => AppError::Internal(anyhow::Error::new(other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    pub data_source_id: i64,
    pub schemas_synced: usize,
    pub schemas_failed: usize,
    pub embeddings_written: usize,
}

/// Result of one source within a sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceOutcome {
    pub data_source_id: i64,
    pub report: Option<SyncReport>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncStatus {
    pub data_source_id: i64,
    pub name: String,
    pub schema_count: usize,
    pub embedding_count: i64,
    pub last_sync: Option<DateTime<Utc>>,
    pub need_sync: bool,
}

/// Outcome of a connection check, with the source as stored afterwards.
#[derive(Debug, Clone)]
pub struct ConnectionCheck {
    pub success: bool,
    pub message: String,
    pub source: DataSourceRow,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailableSchema {
    pub schema_id: i64,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub row_count: i64,
    pub content: String,
}

// ────────────────────────────────────────────────────────────────────────────
// SyncTask
// ────────────────────────────────────────────────────────────────────────────

/// Handle to a spawned discovery + sync run.
pub struct SyncTask {
    data_source_id: i64,
    handle: JoinHandle<Result<SyncReport, SyncError>>,
}

impl SyncTask {
    /// Waits up to `deadline`. A run still going at the deadline is aborted
    /// so it cannot write schemas after the caller has given up.
    pub async fn wait_for(mut self, deadline: Duration) -> Result<SyncReport, SyncError> {
        match tokio::time::timeout(deadline, &mut self.handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SyncError::Aborted(e.to_string())),
            Err(_) => {
                warn!(data_source_id = self.data_source_id, ?deadline, "discovery overran its deadline");
                self.handle.abort();
                Err(SyncError::TimedOut(deadline))
            }
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SchemaSync
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct SchemaSync {
    data_sources: Arc<dyn DataSourceStore>,
    indexer: Indexer,
    dispatcher: Dispatcher,
}

impl SchemaSync {
    pub fn new(
        data_sources: Arc<dyn DataSourceStore>,
        indexer: Indexer,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            data_sources,
            indexer,
            dispatcher,
        }
    }

    /// Deletes and recreates every embedding of one source. A schema whose
    /// table embedding fails is skipped and counted in `schemas_failed`.
    pub async fn sync_data_source(&self, data_source_id: i64) -> Result<SyncReport, SyncError> {
        if self.data_sources.get(data_source_id).await?.is_none() {
            return Err(SyncError::NotFound(data_source_id));
        }
        let schemas = self.data_sources.active_schemas(data_source_id).await?;

        let mut report = SyncReport {
            data_source_id,
            ..Default::default()
        };
        let mut records = Vec::new();
        for schema in &schemas {
            match self.indexer.schema_records(data_source_id, schema).await {
                Ok(mut built) => {
                    report.schemas_synced += 1;
                    records.append(&mut built);
                }
                Err(e) => {
                    report.schemas_failed += 1;
                    warn!(data_source_id, schema = %schema.name, error = %e, "schema skipped during sync");
                }
            }
        }

        report.embeddings_written = self
            .indexer
            .index()
            .upsert(&ReplaceScope::DataSource(data_source_id), records)
            .await?;

        info!(
            data_source_id,
            synced = report.schemas_synced,
            failed = report.schemas_failed,
            written = report.embeddings_written,
            "schema embeddings synced"
        );
        Ok(report)
    }

    /// Re-embeds a single active schema, leaving the rest of the source's
    /// records untouched.
    pub async fn sync_schema(
        &self,
        data_source_id: i64,
        schema_id: i64,
    ) -> Result<SyncReport, SyncError> {
        if self.data_sources.get(data_source_id).await?.is_none() {
            return Err(SyncError::NotFound(data_source_id));
        }
        let schema = self
            .data_sources
            .active_schemas(data_source_id)
            .await?
            .into_iter()
            .find(|s| s.id == schema_id)
            .ok_or(SyncError::SchemaNotFound {
                data_source_id,
                schema_id,
            })?;

        let embeddings_written = self.indexer.embed_schema(data_source_id, &schema).await?;
        Ok(SyncReport {
            data_source_id,
            schemas_synced: 1,
            schemas_failed: 0,
            embeddings_written,
        })
    }

    /// Syncs every active source in turn. One source failing does not stop
    /// the sweep.
    pub async fn sync_all(&self) -> Result<Vec<SourceOutcome>, SyncError> {
        let sources = self.data_sources.list_active().await?;
        let mut outcomes = Vec::with_capacity(sources.len());
        for source in sources {
            let outcome = match self.sync_data_source(source.id).await {
                Ok(report) => SourceOutcome {
                    data_source_id: source.id,
                    report: Some(report),
                    error: None,
                },
                Err(e) => {
                    error!(data_source_id = source.id, error = %e, "sync failed");
                    SourceOutcome {
                        data_source_id: source.id,
                        report: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    pub async fn sync_status(&self) -> Result<Vec<SyncStatus>, SyncError> {
        let store = self.indexer.index().store();
        let mut statuses = Vec::new();
        for source in self.data_sources.list_active().await? {
            let schemas = self.data_sources.active_schemas(source.id).await?;
            let stats = store.stats(source.id).await?;
            let schema_updated = self.data_sources.last_schema_update(source.id).await?;

            let need_sync = stats.embedding_count == 0
                || match (schema_updated, stats.last_updated) {
                    (Some(schema), Some(synced)) => schema > synced,
                    (Some(_), None) => true,
                    (None, _) => false,
                };

            statuses.push(SyncStatus {
                data_source_id: source.id,
                name: source.name,
                schema_count: schemas.len(),
                embedding_count: stats.embedding_count,
                last_sync: stats.last_updated,
                need_sync,
            });
        }
        Ok(statuses)
    }

    /// Table-level records of one source, in index order.
    pub async fn available_schemas(
        &self,
        data_source_id: i64,
    ) -> Result<Vec<AvailableSchema>, SyncError> {
        let filter = SearchFilter::new(data_source_id, &[ElementType::Table]);
        let records = self.indexer.index().store().candidates(&filter).await?;
        Ok(records
            .into_iter()
            .filter(|r| r.data_source_id == data_source_id)
            .map(|r| AvailableSchema {
                schema_id: r.schema_id,
                display_name: r.metadata["display_name"].as_str().map(str::to_string),
                description: r.metadata["description"].as_str().map(str::to_string),
                row_count: r.metadata["row_count"].as_i64().unwrap_or(0),
                name: r.element_name,
                content: r.content,
            })
            .collect())
    }

    /// Asks the connector for its tables, stores them, then re-syncs the
    /// source's embeddings. A discovery failure is recorded on the source.
    pub async fn discover(&self, data_source_id: i64) -> Result<SyncReport, SyncError> {
        let source = self
            .data_sources
            .get(data_source_id)
            .await?
            .ok_or(SyncError::NotFound(data_source_id))?;

        let discovered = match self.dispatcher.discover(&source).await {
            Ok(schemas) => schemas,
            Err(e) => {
                self.data_sources
                    .set_status(data_source_id, ConnectionStatus::Error, Some(e.to_string()))
                    .await?;
                return Err(e.into());
            }
        };
        let stored = self.data_sources.replace_schemas(data_source_id, discovered).await?;
        self.data_sources
            .set_status(data_source_id, ConnectionStatus::Active, None)
            .await?;
        info!(data_source_id, schemas = stored.len(), "schemas discovered");

        self.sync_data_source(data_source_id).await
    }

    /// Checks the source's connection and records the outcome: `active` on
    /// success, `error` with the message otherwise. `last_tested` is
    /// stamped either way.
    pub async fn test_connection(&self, data_source_id: i64) -> Result<ConnectionCheck, SyncError> {
        let source = self
            .data_sources
            .get(data_source_id)
            .await?
            .ok_or(SyncError::NotFound(data_source_id))?;

        let failure = self.dispatcher.test(&source).await.err().map(|e| e.to_string());
        let status = match failure {
            None => ConnectionStatus::Active,
            Some(_) => ConnectionStatus::Error,
        };
        self.data_sources
            .set_status(data_source_id, status, failure.clone())
            .await?;
        info!(data_source_id, status = status.as_str(), "connection tested");

        let source = self
            .data_sources
            .get(data_source_id)
            .await?
            .ok_or(SyncError::NotFound(data_source_id))?;
        Ok(ConnectionCheck {
            success: failure.is_none(),
            message: failure.unwrap_or_else(|| "Connection successful".to_string()),
            source,
        })
    }

    pub fn spawn_discovery(&self, data_source_id: i64) -> SyncTask {
        let this = self.clone();
        SyncTask {
            data_source_id,
            handle: tokio::spawn(async move { this.discover(data_source_id).await }),
        }
    }
}
