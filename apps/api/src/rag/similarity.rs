//! Cosine-similarity index over stored embedding records.
//!
//! Scoring is a linear scan over the candidates the store returns for a
//! filter; the store keeps candidates in id order so equal scores keep
//! insertion order after the stable sort.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::errors::StoreError;
use crate::models::embedding::{ElementType, NewEmbedding};
use crate::rag::store::{EmbeddingStore, ReplaceScope};

pub const DEFAULT_TOP_K: usize = 5;
pub const MAX_TOP_K: usize = 20;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("embedding for '{element}' has {actual} dimensions, index expects {expected}")]
    DimensionMismatch {
        element: String,
        expected: usize,
        actual: usize,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Which records a search may see.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilter {
    /// 0 restricts to global records; any other id means that source plus
    /// global records.
    pub data_source_id: i64,
    /// Empty means every element type.
    pub element_types: Vec<ElementType>,
}

impl SearchFilter {
    pub fn new(data_source_id: i64, element_types: &[ElementType]) -> Self {
        Self {
            data_source_id,
            element_types: element_types.to_vec(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult {
    pub element_type: ElementType,
    pub element_name: String,
    pub data_source_id: i64,
    pub schema_id: i64,
    pub content: String,
    pub score: f64,
    pub metadata: Value,
}

/// Cosine similarity in `[-1, 1]`. Mismatched lengths, empty vectors and
/// zero-magnitude vectors all score 0.0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let (mut dot, mut norm_a, mut norm_b) = (0.0f64, 0.0f64, 0.0f64);
    for (x, y) in a.iter().zip(b.iter()) {
        let (x, y) = (f64::from(*x), f64::from(*y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    if score.is_nan() {
        0.0
    } else {
        score.clamp(-1.0, 1.0)
    }
}

/// Resolves a caller-supplied `top_k` to `[1, MAX_TOP_K]`, defaulting when
/// absent or non-positive.
pub fn clamp_top_k(top_k: Option<i64>) -> usize {
    match top_k {
        Some(k) if k > MAX_TOP_K as i64 => MAX_TOP_K,
        Some(k) if k > 0 => k as usize,
        _ => DEFAULT_TOP_K,
    }
}

#[derive(Clone)]
pub struct SimilarityIndex {
    store: Arc<dyn EmbeddingStore>,
    dimension: usize,
}

impl SimilarityIndex {
    pub fn new(store: Arc<dyn EmbeddingStore>, dimension: usize) -> Self {
        Self { store, dimension }
    }

    pub fn store(&self) -> &Arc<dyn EmbeddingStore> {
        &self.store
    }

    /// Replaces every record in `scope` with `records`. Nothing is written if
    /// any record has the wrong dimensionality.
    pub async fn upsert(
        &self,
        scope: &ReplaceScope,
        records: Vec<NewEmbedding>,
    ) -> Result<usize, IndexError> {
        if let Some(bad) = records.iter().find(|r| r.embedding.len() != self.dimension) {
            return Err(IndexError::DimensionMismatch {
                element: bad.element_name.clone(),
                expected: self.dimension,
                actual: bad.embedding.len(),
            });
        }
        Ok(self.store.replace(scope, records).await?)
    }

    /// Top `top_k` records by cosine similarity, best first.
    pub async fn search(
        &self,
        query_vector: &[f32],
        filter: &SearchFilter,
        top_k: usize,
    ) -> Result<Vec<SearchResult>, IndexError> {
        let top_k = top_k.clamp(1, MAX_TOP_K);
        let candidates = self.store.candidates(filter).await?;

        let mut results: Vec<SearchResult> = candidates
            .into_iter()
            .map(|record| SearchResult {
                score: cosine_similarity(query_vector, &record.embedding),
                element_type: record.element_type,
                element_name: record.element_name,
                data_source_id: record.data_source_id,
                schema_id: record.schema_id,
                content: record.content,
                metadata: record.metadata,
            })
            .collect();

        // Stable: ties keep store (id) order.
        results.sort_by(|a, b| b.score.total_cmp(&a.score));
        results.truncate(top_k);
        Ok(results)
    }
}
