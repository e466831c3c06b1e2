mod config;
mod connectors;
mod data_sources;
mod db;
mod errors;
mod generation;
mod llm_client;
mod models;
mod nl2sql;
mod rag;
mod routes;
mod safety;
mod state;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::connectors::{DefaultConnectorFactory, Dispatcher};
use crate::data_sources::PgDataSourceStore;
use crate::db::create_pool;
use crate::generation::{LlmSqlGenerator, PatternSqlGenerator, SqlGenerator};
use crate::llm_client::LlmClient;
use crate::nl2sql::{Orchestrator, PgQueryStore};
use crate::rag::embedder::OpenAiEmbedder;
use crate::rag::store::PgEmbeddingStore;
use crate::rag::{ContextBuilder, Indexer, SchemaSync, SimilarityIndex};
use crate::routes::build_router;
use crate::safety::{GateConfig, SafetyGate};
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Narapulse API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config).await?;

    // Similarity index + embedder
    let embedder = Arc::new(OpenAiEmbedder::new(
        config.embedding_api_key.clone(),
        config.embedding_model.clone(),
        config.embedding_dimension,
    )?);
    let index = SimilarityIndex::new(
        Arc::new(PgEmbeddingStore::new(db.clone())),
        config.embedding_dimension,
    );
    info!(
        "Embedder initialized (model: {}, dimension: {})",
        config.embedding_model, config.embedding_dimension
    );

    let context = ContextBuilder::new(index.clone(), embedder.clone(), config.embed_timeout);
    let indexer = Indexer::new(index, embedder, config.embed_timeout);

    // SQL generator: LLM when a key is configured, keyword patterns otherwise
    let generator: Arc<dyn SqlGenerator> = match &config.anthropic_api_key {
        Some(key) => {
            let llm = LlmClient::new(key.clone())?;
            info!("LLM SQL generator enabled (model: {})", llm_client::MODEL);
            Arc::new(LlmSqlGenerator::new(llm))
        }
        None => {
            info!("ANTHROPIC_API_KEY not set, using pattern SQL generator");
            Arc::new(PatternSqlGenerator)
        }
    };

    let gate = Arc::new(SafetyGate::new(GateConfig::default()));
    let dispatcher = Dispatcher::new(
        Arc::new(DefaultConnectorFactory::new(reqwest::Client::new())),
        config.query_timeout,
    );

    let data_sources = Arc::new(PgDataSourceStore::new(db.clone()));
    let sync = SchemaSync::new(data_sources.clone(), indexer.clone(), dispatcher.clone());
    let orchestrator = Orchestrator::new(
        Arc::new(PgQueryStore::new(db)),
        data_sources.clone(),
        context.clone(),
        generator,
        gate,
        dispatcher,
        config.default_row_limit,
    );

    // Build app state
    let state = AppState {
        config: config.clone(),
        data_sources,
        context,
        indexer,
        sync,
        orchestrator,
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: tighten CORS in production

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
