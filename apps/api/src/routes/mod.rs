pub mod health;

use axum::{
    routing::{get, post},
    Router,
};

use crate::data_sources::handlers as data_sources;
use crate::nl2sql::handlers as nl2sql;
use crate::rag::handlers as rag;
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        // NL2SQL
        .route("/api/v1/nl2sql/convert", post(nl2sql::handle_convert))
        .route("/api/v1/nl2sql/execute", post(nl2sql::handle_execute))
        .route("/api/v1/nl2sql/validate", post(nl2sql::handle_validate))
        .route("/api/v1/nl2sql/history", get(nl2sql::handle_history))
        .route(
            "/api/v1/nl2sql/queries/:id",
            get(nl2sql::handle_get_query).delete(nl2sql::handle_delete_query),
        )
        // Retrieval
        .route("/api/v1/rag/search", post(rag::handle_search))
        .route(
            "/api/v1/rag/schemas/:data_source_id",
            get(rag::handle_available_schemas),
        )
        .route("/api/v1/rag/sync", post(rag::handle_sync_all))
        .route("/api/v1/rag/sync/status", get(rag::handle_sync_status))
        .route(
            "/api/v1/rag/sync/:data_source_id",
            post(rag::handle_sync_source),
        )
        .route(
            "/api/v1/rag/sync/:data_source_id/schemas/:schema_id",
            post(rag::handle_sync_schema),
        )
        .route("/api/v1/rag/kpis", post(rag::handle_embed_kpi))
        .route("/api/v1/rag/glossary", post(rag::handle_embed_glossary_term))
        // Data sources
        .route(
            "/api/v1/data-sources/:data_source_id/test",
            post(data_sources::handle_test_connection),
        )
        .route(
            "/api/v1/data-sources/:data_source_id/discover",
            post(rag::handle_discover),
        )
        .with_state(state)
}
