use axum::{
    extract::{Path, State},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::connectors::config::ConnectionConfig;
use crate::errors::AppError;
use crate::models::data_source::{ConnectionStatus, DataSourceKind, DataSourceRow};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct TestConnectionRequest {
    pub user_id: Uuid,
}

/// A data source as shown to its owner. Secret config fields are masked.
#[derive(Debug, Serialize)]
pub struct DataSourceView {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: DataSourceKind,
    pub status: ConnectionStatus,
    pub config: Value,
    pub last_tested: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl From<DataSourceRow> for DataSourceView {
    fn from(row: DataSourceRow) -> Self {
        // A config that no longer parses is shown as null rather than raw.
        let config = ConnectionConfig::parse(row.kind, &row.config)
            .map(|c| c.masked())
            .unwrap_or(Value::Null);
        Self {
            id: row.id,
            name: row.name,
            description: row.description,
            kind: row.kind,
            status: row.status,
            config,
            last_tested: row.last_tested,
            error_message: row.error_message,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TestConnectionResponse {
    pub success: bool,
    pub message: String,
    pub data_source: DataSourceView,
}

/// POST /api/v1/data-sources/:data_source_id/test
pub async fn handle_test_connection(
    State(state): State<AppState>,
    Path(data_source_id): Path<i64>,
    Json(req): Json<TestConnectionRequest>,
) -> Result<Json<TestConnectionResponse>, AppError> {
    state
        .data_sources
        .get_owned(data_source_id, req.user_id)
        .await?
        .ok_or_else(|| AppError::not_found("Data source", data_source_id))?;

    let check = state.sync.test_connection(data_source_id).await?;
    Ok(Json(TestConnectionResponse {
        success: check.success,
        message: check.message,
        data_source: check.source.into(),
    }))
}
