use std::sync::Arc;

use crate::config::Config;
use crate::data_sources::DataSourceStore;
use crate::nl2sql::Orchestrator;
use crate::rag::{ContextBuilder, Indexer, SchemaSync};

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub data_sources: Arc<dyn DataSourceStore>,
    /// Retrieval over the similarity index; backs `/rag/search`.
    pub context: ContextBuilder,
    /// Writes KPI and glossary embeddings.
    pub indexer: Indexer,
    pub sync: SchemaSync,
    pub orchestrator: Orchestrator,
}
