//! Embedding content for schema elements and global definitions.

use std::fmt::Write;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::models::data_source::{ColumnDef, SchemaRow};
use crate::models::definitions::{GlossaryTerm, KpiDefinition};
use crate::models::embedding::{ElementType, NewEmbedding, GLOBAL_SCOPE};
use crate::rag::embedder::{embed_with_deadline, EmbedError, Embedder};
use crate::rag::similarity::{IndexError, SimilarityIndex};
use crate::rag::store::ReplaceScope;

const MAX_SAMPLE_VALUES: usize = 5;

#[derive(Debug, Error)]
pub enum IndexingError {
    #[error("failed to embed {element}: {source}")]
    Embed {
        element: String,
        #[source]
        source: EmbedError,
    },

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error("{0} must not be empty")]
    MissingField(&'static str),
}

// ────────────────────────────────────────────────────────────────────────────
// Content builders
// ────────────────────────────────────────────────────────────────────────────

pub fn table_content(schema: &SchemaRow) -> String {
    let columns = &schema.columns.0;
    let mut out = format!("Table: {}", schema.name);
    if let Some(display) = non_empty(&schema.display_name) {
        let _ = write!(out, " ({display})");
    }
    if let Some(desc) = non_empty(&schema.description) {
        let _ = write!(out, "\nDescription: {desc}");
    }
    let _ = write!(out, "\nColumns: {}", columns.len());
    let _ = write!(out, "\nRow count: {}", schema.row_count);
    out.push_str("\nColumn details:");
    for col in columns {
        let _ = write!(out, "\n- {} ({})", col.name, col.data_type);
        if !col.description.is_empty() {
            let _ = write!(out, ": {}", col.description);
        }
    }
    out
}

pub fn column_content(table: &str, column: &ColumnDef) -> String {
    let mut out = format!("Column: {table}.{}", column.name);
    let _ = write!(out, "\nType: {}", column.data_type);
    if !column.description.is_empty() {
        let _ = write!(out, "\nDescription: {}", column.description);
    }
    if column.primary_key {
        out.push_str("\nPrimary Key: true");
    }
    if !column.nullable {
        out.push_str("\nNullable: false");
    }
    if !column.sample_values.is_empty() {
        let samples: Vec<String> = column
            .sample_values
            .iter()
            .take(MAX_SAMPLE_VALUES)
            .map(display_value)
            .collect();
        let _ = write!(out, "\nSample values: {}", samples.join(", "));
    }
    out
}

pub fn kpi_content(kpi: &KpiDefinition) -> String {
    let mut out = format!("KPI: {}", kpi.name);
    if !kpi.display_name.is_empty() {
        let _ = write!(out, " ({})", kpi.display_name);
    }
    if !kpi.description.is_empty() {
        let _ = write!(out, "\nDescription: {}", kpi.description);
    }
    let _ = write!(out, "\nFormula: {}", kpi.formula);
    for (label, value) in [
        ("Category", &kpi.category),
        ("Unit", &kpi.unit),
        ("Grain", &kpi.grain),
    ] {
        if !value.is_empty() {
            let _ = write!(out, "\n{label}: {value}");
        }
    }
    out
}

pub fn glossary_content(term: &GlossaryTerm) -> String {
    let mut out = format!("Term: {}\nDefinition: {}", term.term, term.definition);
    if !term.category.is_empty() {
        let _ = write!(out, "\nCategory: {}", term.category);
    }
    if !term.domain.is_empty() {
        let _ = write!(out, "\nDomain: {}", term.domain);
    }
    if !term.synonyms.is_empty() {
        let _ = write!(out, "\nSynonyms: {}", term.synonyms.join(", "));
    }
    if !term.examples.is_empty() {
        let _ = write!(out, "\nExamples: {}", term.examples.join("; "));
    }
    out
}

pub fn table_metadata(schema: &SchemaRow) -> Value {
    json!({
        "display_name": schema.display_name.clone().unwrap_or_default(),
        "description": schema.description.clone().unwrap_or_default(),
        "row_count": schema.row_count,
    })
}

pub fn column_metadata(table: &str, column: &ColumnDef) -> Value {
    json!({
        "table": table,
        "type": column.data_type,
        "nullable": column.nullable,
        "primary_key": column.primary_key,
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.is_empty())
}

fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Indexer
// ────────────────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct Indexer {
    index: SimilarityIndex,
    embedder: Arc<dyn Embedder>,
    embed_timeout: Duration,
}

impl Indexer {
    pub fn new(index: SimilarityIndex, embedder: Arc<dyn Embedder>, embed_timeout: Duration) -> Self {
        Self {
            index,
            embedder,
            embed_timeout,
        }
    }

    pub fn index(&self) -> &SimilarityIndex {
        &self.index
    }

    async fn embed(&self, element: &str, text: &str) -> Result<Vec<f32>, IndexingError> {
        embed_with_deadline(self.embedder.as_ref(), text, self.embed_timeout)
            .await
            .map_err(|source| IndexingError::Embed {
                element: element.to_string(),
                source,
            })
    }

    /// Table record plus one record per column. A column that fails to embed
    /// is skipped; a failing table embedding fails the schema.
    pub async fn schema_records(
        &self,
        data_source_id: i64,
        schema: &SchemaRow,
    ) -> Result<Vec<NewEmbedding>, IndexingError> {
        let content = table_content(schema);
        let vector = self.embed(&schema.name, &content).await?;

        let mut records = vec![NewEmbedding {
            data_source_id,
            schema_id: schema.id,
            element_type: ElementType::Table,
            element_name: schema.name.clone(),
            content,
            embedding: vector,
            metadata: table_metadata(schema),
        }];

        for column in &schema.columns.0 {
            let content = column_content(&schema.name, column);
            let element = format!("{}.{}", schema.name, column.name);
            match self.embed(&element, &content).await {
                Ok(vector) => records.push(NewEmbedding {
                    data_source_id,
                    schema_id: schema.id,
                    element_type: ElementType::Column,
                    element_name: column.name.clone(),
                    content,
                    embedding: vector,
                    metadata: column_metadata(&schema.name, column),
                }),
                Err(e) => warn!(data_source_id, schema_id = schema.id, error = %e, "skipping column embedding"),
            }
        }

        Ok(records)
    }

    /// Re-embeds one schema, replacing its previous records.
    pub async fn embed_schema(
        &self,
        data_source_id: i64,
        schema: &SchemaRow,
    ) -> Result<usize, IndexingError> {
        let records = self.schema_records(data_source_id, schema).await?;
        let scope = ReplaceScope::Schema {
            data_source_id,
            schema_id: schema.id,
        };
        let written = self.index.upsert(&scope, records).await?;
        info!(data_source_id, schema_id = schema.id, written, "schema embedded");
        Ok(written)
    }

    pub async fn embed_kpi(&self, kpi: &KpiDefinition) -> Result<(), IndexingError> {
        if kpi.name.trim().is_empty() {
            return Err(IndexingError::MissingField("KPI name"));
        }
        if kpi.formula.trim().is_empty() {
            return Err(IndexingError::MissingField("KPI formula"));
        }
        let content = kpi_content(kpi);
        let vector = self.embed(&kpi.name, &content).await?;
        let record = NewEmbedding {
            data_source_id: GLOBAL_SCOPE,
            schema_id: 0,
            element_type: ElementType::Kpi,
            element_name: kpi.name.clone(),
            content,
            embedding: vector,
            metadata: json!({
                "description": kpi.description,
                "formula": kpi.formula,
                "category": kpi.category,
                "unit": kpi.unit,
                "grain": kpi.grain,
                "user_id": kpi.user_id,
            }),
        };
        let scope = ReplaceScope::Definition {
            element_type: ElementType::Kpi,
            element_name: kpi.name.clone(),
        };
        self.index.upsert(&scope, vec![record]).await?;
        info!(kpi = %kpi.name, "KPI embedded");
        Ok(())
    }

    pub async fn embed_glossary_term(&self, term: &GlossaryTerm) -> Result<(), IndexingError> {
        if term.term.trim().is_empty() {
            return Err(IndexingError::MissingField("term"));
        }
        if term.definition.trim().is_empty() {
            return Err(IndexingError::MissingField("definition"));
        }
        let content = glossary_content(term);
        let vector = self.embed(&term.term, &content).await?;
        let record = NewEmbedding {
            data_source_id: GLOBAL_SCOPE,
            schema_id: 0,
            element_type: ElementType::Glossary,
            element_name: term.term.clone(),
            content,
            embedding: vector,
            metadata: json!({
                "definition": term.definition,
                "category": term.category,
                "domain": term.domain,
                "user_id": term.user_id,
            }),
        };
        let scope = ReplaceScope::Definition {
            element_type: ElementType::Glossary,
            element_name: term.term.clone(),
        };
        self.index.upsert(&scope, vec![record]).await?;
        info!(term = %term.term, "glossary term embedded");
        Ok(())
    }
}
