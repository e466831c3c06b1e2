use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::AppError;
use crate::models::definitions::{GlossaryTerm, KpiDefinition};
use crate::models::embedding::{ElementType, GLOBAL_SCOPE};
use crate::rag::context_builder::SearchResponse;
use crate::rag::sync::{AvailableSchema, SourceOutcome, SyncReport, SyncStatus};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct UserIdQuery {
    pub user_id: Uuid,
}

#[derive(Deserialize)]
pub struct SearchRequest {
    pub user_id: Uuid,
    pub query: String,
    #[serde(default)]
    pub data_source_id: i64,
    pub top_k: Option<i64>,
    #[serde(default)]
    pub element_types: Vec<ElementType>,
}

#[derive(Serialize)]
pub struct SchemasResponse {
    pub data_source_id: i64,
    pub schemas: Vec<AvailableSchema>,
}

#[derive(Serialize)]
pub struct SweepResponse {
    pub sources: Vec<SourceOutcome>,
}

async fn require_owned(state: &AppState, data_source_id: i64, user_id: Uuid) -> Result<(), AppError> {
    state
        .data_sources
        .get_owned(data_source_id, user_id)
        .await?
        .map(|_| ())
        .ok_or_else(|| AppError::not_found("Data source", data_source_id))
}

/// POST /api/v1/rag/search
pub async fn handle_search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<SearchResponse>, AppError> {
    if req.query.trim().is_empty() {
        return Err(AppError::Validation("query must not be empty".into()));
    }
    if req.data_source_id != GLOBAL_SCOPE {
        require_owned(&state, req.data_source_id, req.user_id).await?;
    }
    let response = state
        .context
        .search_similar(&req.query, req.data_source_id, req.top_k, &req.element_types)
        .await?;
    Ok(Json(response))
}

/// GET /api/v1/rag/schemas/:data_source_id
pub async fn handle_available_schemas(
    State(state): State<AppState>,
    Path(data_source_id): Path<i64>,
    Query(params): Query<UserIdQuery>,
) -> Result<Json<SchemasResponse>, AppError> {
    require_owned(&state, data_source_id, params.user_id).await?;
    let schemas = state.sync.available_schemas(data_source_id).await?;
    Ok(Json(SchemasResponse {
        data_source_id,
        schemas,
    }))
}

/// POST /api/v1/rag/sync/:data_source_id
pub async fn handle_sync_source(
    State(state): State<AppState>,
    Path(data_source_id): Path<i64>,
    Json(req): Json<UserIdQuery>,
) -> Result<Json<SyncReport>, AppError> {
    require_owned(&state, data_source_id, req.user_id).await?;
    Ok(Json(state.sync.sync_data_source(data_source_id).await?))
}

/// POST /api/v1/rag/sync
pub async fn handle_sync_all(
    State(state): State<AppState>,
) -> Result<Json<SweepResponse>, AppError> {
    let sources = state.sync.sync_all().await?;
    Ok(Json(SweepResponse { sources }))
}

/// GET /api/v1/rag/sync/status
pub async fn handle_sync_status(
    State(state): State<AppState>,
) -> Result<Json<Vec<SyncStatus>>, AppError> {
    Ok(Json(state.sync.sync_status().await?))
}

/// POST /api/v1/rag/sync/:data_source_id/schemas/:schema_id
pub async fn handle_sync_schema(
    State(state): State<AppState>,
    Path((data_source_id, schema_id)): Path<(i64, i64)>,
    Json(req): Json<UserIdQuery>,
) -> Result<Json<SyncReport>, AppError> {
    require_owned(&state, data_source_id, req.user_id).await?;
    Ok(Json(state.sync.sync_schema(data_source_id, schema_id).await?))
}

/// POST /api/v1/data-sources/:data_source_id/discover
/// Discovery keeps running if the client goes away, up to the query timeout.
pub async fn handle_discover(
    State(state): State<AppState>,
    Path(data_source_id): Path<i64>,
    Json(req): Json<UserIdQuery>,
) -> Result<Json<SyncReport>, AppError> {
    require_owned(&state, data_source_id, req.user_id).await?;
    let task = state.sync.spawn_discovery(data_source_id);
    Ok(Json(task.wait_for(state.config.query_timeout).await?))
}

/// POST /api/v1/rag/kpis
pub async fn handle_embed_kpi(
    State(state): State<AppState>,
    Json(kpi): Json<KpiDefinition>,
) -> Result<StatusCode, AppError> {
    state.indexer.embed_kpi(&kpi).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/v1/rag/glossary
pub async fn handle_embed_glossary_term(
    State(state): State<AppState>,
    Json(term): Json<GlossaryTerm>,
) -> Result<StatusCode, AppError> {
    state.indexer.embed_glossary_term(&term).await?;
    Ok(StatusCode::NO_CONTENT)
}
