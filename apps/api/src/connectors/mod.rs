// Execution dispatcher and per-kind connectors.
// Connectors only ever receive `ApprovedSql`, which the safety gate alone can
// construct.

pub mod bigquery;
pub mod config;
pub mod file;
pub mod postgres;
pub mod sheets;

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::data_source::{ColumnDef, DataSourceKind, DataSourceRow, DiscoveredSchema};
use crate::safety::ApprovedSql;

use self::config::{ConfigError, ConnectionConfig};

pub type Row = Map<String, Value>;

#[derive(Debug, Error)]
pub enum ConnectorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("connector call exceeded {0:?}")]
    Timeout(Duration),

    #[error("{} sources cannot be queried", .0.as_str())]
    Unsupported(DataSourceKind),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("upstream API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tabular output of one execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    pub columns: Vec<ColumnDef>,
    pub rows: Vec<Row>,
}

impl QueryOutput {
    pub fn row_count(&self) -> i64 {
        self.rows.len() as i64
    }

    /// Caps the row count; connectors call this after fetching.
    pub fn truncate(&mut self, limit: i64) {
        if limit > 0 {
            self.rows.truncate(limit as usize);
        }
    }
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn test_connection(&self) -> Result<(), ConnectorError>;

    async fn get_schema(&self) -> Result<Vec<DiscoveredSchema>, ConnectorError>;

    /// Runs gate-approved SQL, returning at most `limit` rows.
    async fn execute(&self, sql: &ApprovedSql, limit: i64) -> Result<QueryOutput, ConnectorError>;
}

/// Builds a connector for a stored data source.
#[async_trait]
pub trait ConnectorFactory: Send + Sync {
    async fn connect(&self, source: &DataSourceRow) -> Result<Box<dyn Connector>, ConnectorError>;
}

/// Routes to the built-in connector for each data source kind.
#[derive(Clone)]
pub struct DefaultConnectorFactory {
    http: reqwest::Client,
}

impl DefaultConnectorFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ConnectorFactory for DefaultConnectorFactory {
    async fn connect(&self, source: &DataSourceRow) -> Result<Box<dyn Connector>, ConnectorError> {
        if source.kind == DataSourceKind::Excel {
            return Err(ConnectorError::Unsupported(source.kind));
        }
        let connector: Box<dyn Connector> = match ConnectionConfig::parse(source.kind, &source.config)? {
            ConnectionConfig::Postgres(c) => Box::new(postgres::PostgresConnector::connect(&c).await?),
            ConnectionConfig::BigQuery(c) => {
                Box::new(bigquery::BigQueryConnector::new(self.http.clone(), c))
            }
            ConnectionConfig::File(c) => Box::new(file::CsvConnector::new(c)),
            ConnectionConfig::GoogleSheets(c) => {
                Box::new(sheets::GoogleSheetsConnector::new(self.http.clone(), c))
            }
        };
        Ok(connector)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Dispatcher
// ────────────────────────────────────────────────────────────────────────────

/// Outcome of a dispatched execution, timed from connect to last row.
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub output: QueryOutput,
    pub elapsed: Duration,
}

/// Every connector call runs under `timeout`; a slow backend surfaces as
/// `ConnectorError::Timeout`.
#[derive(Clone)]
pub struct Dispatcher {
    factory: Arc<dyn ConnectorFactory>,
    timeout: Duration,
}

impl Dispatcher {
    pub fn new(factory: Arc<dyn ConnectorFactory>, timeout: Duration) -> Self {
        Self { factory, timeout }
    }

    pub async fn execute(
        &self,
        source: &DataSourceRow,
        sql: &ApprovedSql,
        limit: i64,
    ) -> Result<Dispatched, ConnectorError> {
        let started = Instant::now();
        let run = async {
            let connector = self.factory.connect(source).await?;
            connector.execute(sql, limit).await
        };
        let mut output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ConnectorError::Timeout(self.timeout))??;
        output.truncate(limit);

        let elapsed = started.elapsed();
        info!(
            data_source_id = source.id,
            kind = source.kind.as_str(),
            rows = output.rows.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "query executed"
        );
        Ok(Dispatched { output, elapsed })
    }

    pub async fn discover(
        &self,
        source: &DataSourceRow,
    ) -> Result<Vec<DiscoveredSchema>, ConnectorError> {
        let run = async {
            let connector = self.factory.connect(source).await?;
            connector.get_schema().await
        };
        tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ConnectorError::Timeout(self.timeout))?
    }

    pub async fn test(&self, source: &DataSourceRow) -> Result<(), ConnectorError> {
        let run = async {
            let connector = self.factory.connect(source).await?;
            connector.test_connection().await
        };
        let result = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| ConnectorError::Timeout(self.timeout))?;
        if let Err(e) = &result {
            warn!(data_source_id = source.id, error = %e, "connection test failed");
        }
        result
    }
}
