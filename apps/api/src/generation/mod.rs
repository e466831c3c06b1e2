// SQL candidate generation.
// Generators are untrusted: whatever they return still goes through the
// safety gate before it is stored as executable.

pub mod llm;
pub mod pattern;
pub mod prompts;

use async_trait::async_trait;
use thiserror::Error;

use crate::llm_client::LlmError;
use crate::rag::context_builder::QueryContext;

pub use llm::LlmSqlGenerator;
pub use pattern::PatternSqlGenerator;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("LLM generation failed: {0}")]
    Llm(#[from] LlmError),

    #[error("generator produced no SQL")]
    Empty,
}

/// Turns a natural-language question plus retrieved context into one SQL
/// candidate.
#[async_trait]
pub trait SqlGenerator: Send + Sync {
    /// Short backend name, recorded in query metadata.
    fn name(&self) -> &'static str;

    async fn generate(&self, query: &str, context: &QueryContext)
        -> Result<String, GenerationError>;
}

/// Trims whitespace and trailing semicolons from generator output.
pub fn normalize_sql(raw: &str) -> Result<String, GenerationError> {
    let sql = raw.trim().trim_end_matches(';').trim_end();
    if sql.is_empty() {
        return Err(GenerationError::Empty);
    }
    Ok(sql.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_trailing_semicolons() {
        assert_eq!(
            normalize_sql("  SELECT a FROM t LIMIT 5;; \n").unwrap(),
            "SELECT a FROM t LIMIT 5"
        );
        assert!(matches!(normalize_sql(" ; "), Err(GenerationError::Empty)));
    }
}
