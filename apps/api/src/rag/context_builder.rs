//! Retrieval context for SQL generation.
//!
//! The query is embedded once; the schema, KPI and glossary searches then run
//! concurrently over the same vector and are joined before assembly.
//! Failure policy: an embedding failure or a schema search failure aborts
//! the build. KPI and glossary search failures degrade to empty sections and
//! are listed in `QueryContext::degraded`.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::models::embedding::{ElementType, GLOBAL_SCOPE};
use crate::rag::embedder::{embed_with_deadline, EmbedError, Embedder};
use crate::rag::prompts::build_sql_prompt;
use crate::rag::similarity::{clamp_top_k, IndexError, SearchFilter, SearchResult, SimilarityIndex};

pub const SCHEMA_TOP_K: usize = 10;
pub const KPI_TOP_K: usize = 5;
pub const GLOSSARY_TOP_K: usize = 5;

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("failed to embed query: {0}")]
    Embed(#[from] EmbedError),

    #[error("schema search failed: {0}")]
    SchemaSearch(IndexError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnContext {
    pub name: String,
    pub data_type: Option<String>,
    pub score: f64,
    pub metadata: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableContext {
    pub name: String,
    pub description: Option<String>,
    pub score: f64,
    pub metadata: Value,
    pub columns: Vec<ColumnContext>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchemaContext {
    /// Retrieved tables in rank order, each with its retrieved columns.
    pub tables: Vec<TableContext>,
}

impl SchemaContext {
    /// Groups table and column hits. Columns attach to the table named in
    /// their `table` metadata; a column whose table was not itself retrieved
    /// adds that table without a description. Columns without a table are
    /// dropped.
    pub fn from_results(results: &[SearchResult]) -> Self {
        let mut tables: Vec<TableContext> = Vec::new();

        for hit in results.iter().filter(|r| r.element_type == ElementType::Table) {
            if tables.iter().any(|t| t.name == hit.element_name) {
                continue;
            }
            tables.push(TableContext {
                name: hit.element_name.clone(),
                description: meta_str(&hit.metadata, "description"),
                score: hit.score,
                metadata: hit.metadata.clone(),
                columns: Vec::new(),
            });
        }

        for hit in results.iter().filter(|r| r.element_type == ElementType::Column) {
            let Some(table_name) = meta_str(&hit.metadata, "table") else {
                continue;
            };
            let column = ColumnContext {
                name: hit.element_name.clone(),
                data_type: meta_str(&hit.metadata, "type"),
                score: hit.score,
                metadata: hit.metadata.clone(),
            };
            match tables.iter_mut().find(|t| t.name == table_name) {
                Some(table) => table.columns.push(column),
                None => tables.push(TableContext {
                    name: table_name,
                    description: None,
                    score: hit.score,
                    metadata: Value::Null,
                    columns: vec![column],
                }),
            }
        }

        Self { tables }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KpiContext {
    pub name: String,
    pub description: String,
    pub formula: Option<String>,
    pub score: f64,
    pub metadata: Value,
}

impl From<SearchResult> for KpiContext {
    fn from(hit: SearchResult) -> Self {
        Self {
            description: meta_str(&hit.metadata, "description").unwrap_or(hit.content),
            formula: meta_str(&hit.metadata, "formula"),
            name: hit.element_name,
            score: hit.score,
            metadata: hit.metadata,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlossaryContext {
    pub term: String,
    pub definition: String,
    pub score: f64,
    pub metadata: Value,
}

impl From<SearchResult> for GlossaryContext {
    fn from(hit: SearchResult) -> Self {
        Self {
            definition: meta_str(&hit.metadata, "definition").unwrap_or(hit.content),
            term: hit.element_name,
            score: hit.score,
            metadata: hit.metadata,
        }
    }
}

/// Everything retrieved for one NL query. Rebuilt per request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryContext {
    pub query: String,
    pub data_source_id: i64,
    pub schema_context: SchemaContext,
    pub kpi_context: Vec<KpiContext>,
    pub glossary_context: Vec<GlossaryContext>,
    pub prompt: String,
    /// Sub-contexts that failed and were replaced with empty lists.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub query: String,
    pub top_k: usize,
}

#[derive(Clone)]
pub struct ContextBuilder {
    index: SimilarityIndex,
    embedder: Arc<dyn Embedder>,
    embed_timeout: Duration,
}

impl ContextBuilder {
    pub fn new(index: SimilarityIndex, embedder: Arc<dyn Embedder>, embed_timeout: Duration) -> Self {
        Self {
            index,
            embedder,
            embed_timeout,
        }
    }

    /// Nearest records to `query`, scoped like `SearchFilter`.
    pub async fn search_similar(
        &self,
        query: &str,
        data_source_id: i64,
        top_k: Option<i64>,
        element_types: &[ElementType],
    ) -> Result<SearchResponse, ContextError> {
        let top_k = clamp_top_k(top_k);
        let vector = embed_with_deadline(self.embedder.as_ref(), query, self.embed_timeout).await?;
        let results = self
            .index
            .search(&vector, &SearchFilter::new(data_source_id, element_types), top_k)
            .await
            .map_err(ContextError::SchemaSearch)?;
        Ok(SearchResponse {
            results,
            query: query.to_string(),
            top_k,
        })
    }

    pub async fn build(&self, query: &str, data_source_id: i64) -> Result<QueryContext, ContextError> {
        let vector = embed_with_deadline(self.embedder.as_ref(), query, self.embed_timeout).await?;

        let schema_filter =
            SearchFilter::new(data_source_id, &[ElementType::Table, ElementType::Column]);
        let kpi_filter = SearchFilter::new(GLOBAL_SCOPE, &[ElementType::Kpi]);
        let glossary_filter = SearchFilter::new(GLOBAL_SCOPE, &[ElementType::Glossary]);

        let (schema_hits, kpi_hits, glossary_hits) = tokio::join!(
            self.index.search(&vector, &schema_filter, SCHEMA_TOP_K),
            self.index.search(&vector, &kpi_filter, KPI_TOP_K),
            self.index.search(&vector, &glossary_filter, GLOSSARY_TOP_K),
        );

        let schema_hits = schema_hits.map_err(ContextError::SchemaSearch)?;

        let mut degraded = Vec::new();
        let kpi_hits = kpi_hits.unwrap_or_else(|e| {
            warn!(data_source_id, error = %e, "KPI search failed, continuing without KPIs");
            degraded.push("kpi".to_string());
            Vec::new()
        });
        let glossary_hits = glossary_hits.unwrap_or_else(|e| {
            warn!(data_source_id, error = %e, "glossary search failed, continuing without terms");
            degraded.push("glossary".to_string());
            Vec::new()
        });

        let schema_context = SchemaContext::from_results(&schema_hits);
        let kpi_context: Vec<KpiContext> = kpi_hits.into_iter().map(Into::into).collect();
        let glossary_context: Vec<GlossaryContext> =
            glossary_hits.into_iter().map(Into::into).collect();
        let prompt = build_sql_prompt(query, &schema_context, &kpi_context, &glossary_context);

        debug!(
            data_source_id,
            tables = schema_context.tables.len(),
            kpis = kpi_context.len(),
            terms = glossary_context.len(),
            "query context built"
        );

        Ok(QueryContext {
            query: query.to_string(),
            data_source_id,
            schema_context,
            kpi_context,
            glossary_context,
            prompt,
            degraded,
        })
    }
}

fn meta_str(metadata: &Value, key: &str) -> Option<String> {
    metadata
        .get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;

    use crate::errors::StoreError;
    use crate::models::embedding::{EmbeddingRecord, NewEmbedding};
    use crate::rag::store::{EmbeddingStats, EmbeddingStore, MemoryEmbeddingStore, ReplaceScope};

    /// Bag-of-keywords embedder: one dimension per vocabulary word.
    pub struct KeywordEmbedder {
        pub vocabulary: Vec<&'static str>,
    }

    impl KeywordEmbedder {
        pub fn sales_vocabulary() -> Self {
            Self {
                vocabulary: vec![
                    "sales", "amount", "region", "customer", "revenue", "churn", "count", "date",
                ],
            }
        }
    }

    #[async_trait]
    impl Embedder for KeywordEmbedder {
        fn dimension(&self) -> usize {
            self.vocabulary.len()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
            let lower = text.to_lowercase();
            Ok(self
                .vocabulary
                .iter()
                .map(|w| lower.matches(w).count() as f32)
                .collect())
        }
    }

    pub struct FailingEmbedder;

    #[async_trait]
    impl Embedder for FailingEmbedder {
        fn dimension(&self) -> usize {
            8
        }

        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbedError> {
            Err(EmbedError::Api {
                status: 429,
                message: "quota exceeded".into(),
            })
        }
    }

    /// Delegates to a memory store but fails searches for chosen types.
    pub struct FlakyStore {
        pub inner: MemoryEmbeddingStore,
        pub fail_on: Vec<ElementType>,
    }

    #[async_trait]
    impl EmbeddingStore for FlakyStore {
        async fn replace(
            &self,
            scope: &ReplaceScope,
            records: Vec<NewEmbedding>,
        ) -> Result<usize, StoreError> {
            self.inner.replace(scope, records).await
        }

        async fn candidates(
            &self,
            filter: &SearchFilter,
        ) -> Result<Vec<EmbeddingRecord>, StoreError> {
            if filter.element_types.iter().any(|t| self.fail_on.contains(t)) {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.candidates(filter).await
        }

        async fn delete(&self, scope: &ReplaceScope) -> Result<u64, StoreError> {
            self.inner.delete(scope).await
        }

        async fn stats(&self, data_source_id: i64) -> Result<EmbeddingStats, StoreError> {
            self.inner.stats(data_source_id).await
        }
    }

    /// Seeds one data source (id 1) with a sales table plus global KPI and
    /// glossary records.
    pub async fn seed(index: &SimilarityIndex, embedder: &dyn Embedder) {
        use serde_json::json;

        async fn rec(
            embedder: &dyn Embedder,
            ds: i64,
            kind: ElementType,
            name: &str,
            text: &str,
            metadata: Value,
        ) -> NewEmbedding {
            NewEmbedding {
                data_source_id: ds,
                schema_id: if ds == GLOBAL_SCOPE { 0 } else { 1 },
                element_type: kind,
                element_name: name.into(),
                content: text.into(),
                embedding: embedder.embed(text).await.unwrap(),
                metadata,
            }
        }

        let schema = vec![
            rec(
                embedder,
                1,
                ElementType::Table,
                "sales",
                "Table: sales amount region date",
                json!({"description": "Daily sales", "display_name": "Sales", "row_count": 10}),
            )
            .await,
            rec(
                embedder,
                1,
                ElementType::Column,
                "amount",
                "Column: sales.amount",
                json!({"table": "sales", "type": "numeric"}),
            )
            .await,
            rec(
                embedder,
                1,
                ElementType::Column,
                "region",
                "Column: sales.region",
                json!({"table": "sales", "type": "text"}),
            )
            .await,
        ];
        index
            .upsert(&ReplaceScope::DataSource(1), schema)
            .await
            .unwrap();

        let kpi = rec(
            embedder,
            GLOBAL_SCOPE,
            ElementType::Kpi,
            "revenue",
            "KPI: revenue sales amount",
            json!({
                "formula": "SELECT SUM(amount) AS revenue FROM sales",
                "description": "Total revenue"
            }),
        )
        .await;
        index
            .upsert(
                &ReplaceScope::Definition {
                    element_type: ElementType::Kpi,
                    element_name: "revenue".into(),
                },
                vec![kpi],
            )
            .await
            .unwrap();

        let term = rec(
            embedder,
            GLOBAL_SCOPE,
            ElementType::Glossary,
            "churn",
            "Term: churn customer",
            json!({"definition": "Customers lost"}),
        )
        .await;
        index
            .upsert(
                &ReplaceScope::Definition {
                    element_type: ElementType::Glossary,
                    element_name: "churn".into(),
                },
                vec![term],
            )
            .await
            .unwrap();
    }
}
