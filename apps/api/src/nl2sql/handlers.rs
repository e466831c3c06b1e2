use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::errors::AppError;
use crate::nl2sql::service::{
    ConvertRequest, ConvertResponse, ExecuteResponse, HistoryEntry, QueryDetail,
};
use crate::safety::ValidationResult;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
}

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub user_id: Uuid,
    pub query_id: i64,
    pub limit: Option<i64>,
}

#[derive(Deserialize)]
pub struct ValidateRequest {
    pub sql: String,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub user_id: Uuid,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// POST /api/v1/nl2sql/convert
pub async fn handle_convert(
    State(state): State<AppState>,
    Json(req): Json<ConvertRequest>,
) -> Result<Json<ConvertResponse>, AppError> {
    Ok(Json(state.orchestrator.convert(req).await?))
}

/// POST /api/v1/nl2sql/execute
pub async fn handle_execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<ExecuteResponse>, AppError> {
    let response = state
        .orchestrator
        .execute(req.user_id, req.query_id, req.limit)
        .await?;
    Ok(Json(response))
}

/// POST /api/v1/nl2sql/validate
pub async fn handle_validate(
    State(state): State<AppState>,
    Json(req): Json<ValidateRequest>,
) -> Json<ValidationResult> {
    Json(state.orchestrator.validate_sql(&req.sql))
}

/// GET /api/v1/nl2sql/history
pub async fn handle_history(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<Vec<HistoryEntry>>, AppError> {
    let history = state
        .orchestrator
        .history(params.user_id, params.limit, params.offset)
        .await?;
    Ok(Json(history))
}

/// GET /api/v1/nl2sql/queries/:id
pub async fn handle_get_query(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<QueryDetail>, AppError> {
    Ok(Json(state.orchestrator.get_query(params.user_id, id).await?))
}

/// DELETE /api/v1/nl2sql/queries/:id
pub async fn handle_delete_query(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(params): Query<UserIdQuery>,
) -> Result<StatusCode, AppError> {
    state.orchestrator.delete_query(params.user_id, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
