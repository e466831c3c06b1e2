use async_trait::async_trait;
use tracing::debug;

use crate::llm_client::{LlmClient, MODEL};
use crate::rag::context_builder::QueryContext;

use super::prompts::SQL_GENERATION_SYSTEM;
use super::{normalize_sql, GenerationError, SqlGenerator};

/// Sends the retrieval prompt to the LLM and returns its SQL verbatim.
pub struct LlmSqlGenerator {
    llm: LlmClient,
}

impl LlmSqlGenerator {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl SqlGenerator for LlmSqlGenerator {
    fn name(&self) -> &'static str {
        "llm"
    }

    async fn generate(
        &self,
        _query: &str,
        context: &QueryContext,
    ) -> Result<String, GenerationError> {
        let text = self.llm.call_text(&context.prompt, SQL_GENERATION_SYSTEM).await?;
        debug!(model = MODEL, data_source_id = context.data_source_id, "SQL candidate generated");
        normalize_sql(&text)
    }
}
