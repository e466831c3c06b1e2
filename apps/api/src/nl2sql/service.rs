//! Query orchestration: convert a question into gated SQL, execute approved
//! SQL, and manage the stored query records.
//!
//! Conversion: `pending` → context → generation → gate → `completed` (with
//! `can_execute` true or false) or `failed`. Execution is a separate call:
//! `completed|failed` → `running` → `completed|failed`, guarded by a
//! compare-and-set so two executions of one record cannot overlap.

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::connectors::{Dispatcher, QueryOutput, Row};
use crate::data_sources::DataSourceStore;
use crate::errors::AppError;
use crate::generation::SqlGenerator;
use crate::models::data_source::ColumnDef;
use crate::models::query::{
    ConversionOutcome, ExecutionOutcome, NewQuery, QueryRecord, QueryResultRow, QueryStatus,
    QueryType,
};
use crate::nl2sql::store::QueryStore;
use crate::rag::ContextBuilder;
use crate::safety::{SafetyGate, ValidationResult};

pub const DEFAULT_HISTORY_LIMIT: i64 = 20;
pub const MAX_HISTORY_LIMIT: i64 = 100;

const MSG_VIOLATIONS: &str = "Query has validation violations";
const MSG_WARNINGS: &str = "Query has warnings";
const MSG_READY: &str = "Query is ready for execution";
const MSG_EXECUTED: &str = "Query executed successfully";

#[derive(Debug, Clone, Deserialize)]
pub struct ConvertRequest {
    pub user_id: Uuid,
    pub nl_query: String,
    pub data_source_id: i64,
    #[serde(default)]
    pub context: Option<Value>,
    #[serde(default)]
    pub query_type: Option<QueryType>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConvertResponse {
    pub query_id: i64,
    pub status: QueryStatus,
    pub generated_sql: Option<String>,
    pub validation: ValidationResult,
    pub estimated_cost: f64,
    pub safety_score: f64,
    pub can_execute: bool,
    pub messages: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecuteResponse {
    pub query_id: i64,
    pub columns: Vec<ColumnDef>,
    pub data: Vec<Row>,
    pub row_count: i64,
    pub execution_time_ms: i64,
    pub status: QueryStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueryDetail {
    #[serde(flatten)]
    pub query: QueryRecord,
    pub data_source_name: Option<String>,
    pub result: Option<QueryResultRow>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub query: QueryRecord,
    pub data_source_name: Option<String>,
}

/// User-facing notes for a validation result, in a fixed order.
pub fn validation_messages(validation: &ValidationResult, can_execute: bool) -> Vec<String> {
    let mut messages = Vec::new();
    if !validation.violations.is_empty() {
        messages.push(MSG_VIOLATIONS.to_string());
    }
    if !validation.warnings.is_empty() {
        messages.push(MSG_WARNINGS.to_string());
    }
    if can_execute {
        messages.push(MSG_READY.to_string());
    }
    messages
}

#[derive(Clone)]
pub struct Orchestrator {
    queries: Arc<dyn QueryStore>,
    data_sources: Arc<dyn DataSourceStore>,
    context: ContextBuilder,
    generator: Arc<dyn SqlGenerator>,
    gate: Arc<SafetyGate>,
    dispatcher: Dispatcher,
    default_limit: i64,
}

impl Orchestrator {
    pub fn new(
        queries: Arc<dyn QueryStore>,
        data_sources: Arc<dyn DataSourceStore>,
        context: ContextBuilder,
        generator: Arc<dyn SqlGenerator>,
        gate: Arc<SafetyGate>,
        dispatcher: Dispatcher,
        default_limit: i64,
    ) -> Self {
        Self {
            queries,
            data_sources,
            context,
            generator,
            gate,
            dispatcher,
            default_limit,
        }
    }

    pub fn generator_name(&self) -> &'static str {
        self.generator.name()
    }

    async fn fail_conversion(&self, id: i64, message: String) -> Result<(), AppError> {
        warn!(query_id = id, error = %message, "conversion failed");
        self.queries
            .record_conversion(
                id,
                ConversionOutcome {
                    generated_sql: None,
                    status: QueryStatus::Failed,
                    metadata: json!({ "can_execute": false, "failed_at": Utc::now() }),
                    error_message: Some(message),
                },
            )
            .await?;
        Ok(())
    }

    pub async fn convert(&self, req: ConvertRequest) -> Result<ConvertResponse, AppError> {
        let nl_query = req.nl_query.trim();
        if nl_query.is_empty() {
            return Err(AppError::Validation("nl_query must not be empty".into()));
        }
        if req.data_source_id <= 0 {
            return Err(AppError::Validation("data_source_id is required".into()));
        }

        let source = self
            .data_sources
            .get_owned(req.data_source_id, req.user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Data source", req.data_source_id))?;
        if !source.is_active() {
            return Err(AppError::Validation(format!(
                "data source {} is not active",
                source.id
            )));
        }

        let record = self
            .queries
            .create(NewQuery {
                user_id: req.user_id,
                data_source_id: source.id,
                nl_query: nl_query.to_string(),
                query_type: req.query_type.unwrap_or_default(),
                context: req.context.unwrap_or_else(|| json!({})),
            })
            .await?;

        let context = match self.context.build(nl_query, source.id).await {
            Ok(context) => context,
            Err(e) => {
                self.fail_conversion(record.id, e.to_string()).await?;
                return Err(e.into());
            }
        };

        let candidate = match self.generator.generate(nl_query, &context).await {
            Ok(sql) => sql,
            Err(e) => {
                self.fail_conversion(record.id, e.to_string()).await?;
                return Err(e.into());
            }
        };

        let mut sql = candidate;
        let mut validation = self.gate.evaluate(&sql);
        if validation.is_valid && !validation.has_limit {
            let limited = match self.gate.enforce_limit(&sql, self.default_limit) {
                Ok(limited) => limited,
                Err(e) => {
                    self.fail_conversion(record.id, e.to_string()).await?;
                    return Err(e.into());
                }
            };
            sql = limited.sql;
            validation = limited.validation;
        }

        let can_execute = self.gate.is_safe(&validation);
        let messages = validation_messages(&validation, can_execute);
        let (status, error_message) = if validation.is_valid {
            (QueryStatus::Completed, None)
        } else {
            (QueryStatus::Failed, Some(validation.violations.join("; ")))
        };

        let metadata = json!({
            "validation_result": validation,
            "enhanced_context": context,
            "generator": self.generator.name(),
            "can_execute": can_execute,
            "generated_at": Utc::now(),
        });
        let stored = self
            .queries
            .record_conversion(
                record.id,
                ConversionOutcome {
                    generated_sql: Some(sql.clone()),
                    status,
                    metadata,
                    error_message,
                },
            )
            .await?;

        info!(
            query_id = stored.id,
            data_source_id = source.id,
            generator = self.generator.name(),
            status = stored.status.as_str(),
            can_execute,
            safety_score = validation.safety_score,
            "query converted"
        );

        Ok(ConvertResponse {
            query_id: stored.id,
            status: stored.status,
            generated_sql: Some(sql),
            estimated_cost: validation.estimated_cost,
            safety_score: validation.safety_score,
            validation,
            can_execute,
            messages,
        })
    }

    pub async fn execute(
        &self,
        user_id: Uuid,
        query_id: i64,
        limit: Option<i64>,
    ) -> Result<ExecuteResponse, AppError> {
        let record = self
            .queries
            .get_owned(query_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Query", query_id))?;

        let sql = match (&record.generated_sql, record.can_execute()) {
            (Some(sql), true) => sql.clone(),
            _ => return Err(AppError::Validation("query is not executable".into())),
        };
        let limit = match limit {
            Some(n) if n > 0 => n,
            _ => self.default_limit,
        };

        let limited = self.gate.enforce_limit(&sql, limit)?;
        let approved = self.gate.approve(&limited.sql)?;

        let source = self
            .data_sources
            .get_owned(record.data_source_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Data source", record.data_source_id))?;

        let claimed = self
            .queries
            .transition(
                query_id,
                &[QueryStatus::Completed, QueryStatus::Failed],
                QueryStatus::Running,
            )
            .await?;
        if !claimed {
            return Err(AppError::Conflict(format!("query {query_id} is already running")));
        }

        let started = Instant::now();
        match self.dispatcher.execute(&source, &approved, limited.limit).await {
            Ok(dispatched) => {
                let execution_time_ms = dispatched.elapsed.as_millis() as i64;
                let output = dispatched.output;
                let row_count = output.row_count();

                if let Err(e) = self.store_success(query_id, &output, execution_time_ms).await {
                    return Err(self.fail_claimed(query_id, execution_time_ms, e).await);
                }

                Ok(ExecuteResponse {
                    query_id,
                    columns: output.columns,
                    data: output.rows,
                    row_count,
                    execution_time_ms,
                    status: QueryStatus::Completed,
                    message: MSG_EXECUTED.to_string(),
                })
            }
            Err(e) => {
                let execution_time_ms = started.elapsed().as_millis() as i64;
                warn!(query_id, data_source_id = source.id, error = %e, "query execution failed");
                let outcome = ExecutionOutcome {
                    status: QueryStatus::Failed,
                    execution_time_ms,
                    rows_returned: 0,
                    error_message: Some(e.to_string()),
                };
                if let Err(store_err) = self.queries.record_execution(query_id, outcome).await {
                    warn!(query_id, error = %store_err, "could not record failed execution");
                    self.release_claim(query_id).await;
                    return Err(store_err.into());
                }
                Ok(ExecuteResponse {
                    query_id,
                    columns: Vec::new(),
                    data: Vec::new(),
                    row_count: 0,
                    execution_time_ms,
                    status: QueryStatus::Failed,
                    message: e.to_string(),
                })
            }
        }
    }

    /// Result row first, then the status flip, so a `completed` record always
    /// has its result stored.
    async fn store_success(
        &self,
        query_id: i64,
        output: &QueryOutput,
        execution_time_ms: i64,
    ) -> Result<(), AppError> {
        let row_count = output.row_count();
        let columns = serde_json::to_value(&output.columns)
            .map_err(|e| AppError::Internal(anyhow::Error::new(e).context("encoding result columns")))?;
        let data = Value::Array(output.rows.iter().cloned().map(Value::Object).collect());

        self.queries.save_result(query_id, columns, data, row_count).await?;
        self.queries
            .record_execution(
                query_id,
                ExecutionOutcome {
                    status: QueryStatus::Completed,
                    execution_time_ms,
                    rows_returned: row_count,
                    error_message: None,
                },
            )
            .await?;
        Ok(())
    }

    /// Moves a claimed record out of `running` after a post-execution store
    /// failure and hands back the original error.
    async fn fail_claimed(&self, query_id: i64, execution_time_ms: i64, err: AppError) -> AppError {
        warn!(query_id, error = %err, "storing execution result failed");
        let outcome = ExecutionOutcome {
            status: QueryStatus::Failed,
            execution_time_ms,
            rows_returned: 0,
            error_message: Some(err.to_string()),
        };
        if let Err(store_err) = self.queries.record_execution(query_id, outcome).await {
            warn!(query_id, error = %store_err, "could not record failed execution");
            self.release_claim(query_id).await;
        }
        err
    }

    async fn release_claim(&self, query_id: i64) {
        if let Err(e) = self
            .queries
            .transition(query_id, &[QueryStatus::Running], QueryStatus::Failed)
            .await
        {
            warn!(query_id, error = %e, "query left in running state");
        }
    }

    /// Stateless check; nothing is stored.
    pub fn validate_sql(&self, sql: &str) -> ValidationResult {
        self.gate.evaluate(sql)
    }

    pub async fn get_query(&self, user_id: Uuid, query_id: i64) -> Result<QueryDetail, AppError> {
        let query = self
            .queries
            .get_owned(query_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Query", query_id))?;
        let names = self.data_sources.names(&[query.data_source_id]).await?;
        let result = self.queries.latest_result(query_id).await?;
        Ok(QueryDetail {
            data_source_name: names.get(&query.data_source_id).cloned(),
            query,
            result,
        })
    }

    /// Removes stored results, then the record. Either step failing is
    /// returned to the caller.
    pub async fn delete_query(&self, user_id: Uuid, query_id: i64) -> Result<(), AppError> {
        self.queries
            .get_owned(query_id, user_id)
            .await?
            .ok_or_else(|| AppError::not_found("Query", query_id))?;

        let results = self.queries.delete_results(query_id).await?;
        if !self.queries.delete(query_id).await? {
            return Err(AppError::Internal(anyhow::anyhow!(
                "query {query_id} results removed but the record was not deleted"
            )));
        }
        info!(query_id, results, "query deleted");
        Ok(())
    }

    pub async fn history(
        &self,
        user_id: Uuid,
        limit: Option<i64>,
        offset: Option<i64>,
    ) -> Result<Vec<HistoryEntry>, AppError> {
        let limit = limit
            .filter(|n| *n > 0)
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .min(MAX_HISTORY_LIMIT);
        let offset = offset.unwrap_or(0).max(0);

        let queries = self.queries.history(user_id, limit, offset).await?;
        let mut ids: Vec<i64> = queries.iter().map(|q| q.data_source_id).collect();
        ids.sort_unstable();
        ids.dedup();
        let names = self.data_sources.names(&ids).await?;

        Ok(queries
            .into_iter()
            .map(|query| HistoryEntry {
                data_source_name: names.get(&query.data_source_id).cloned(),
                query,
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::connectors::testing::StubFactory;
    use crate::data_sources::store::testing::source;
    use crate::data_sources::store::MemoryDataSourceStore;
    use crate::errors::StoreError;
    use crate::generation::{GenerationError, PatternSqlGenerator};
    use crate::models::data_source::ConnectionStatus;
    use crate::nl2sql::store::MemoryQueryStore;
    use crate::rag::context_builder::testing::{seed, KeywordEmbedder};
    use crate::rag::embedder::Embedder;
    use crate::rag::store::MemoryEmbeddingStore;
    use crate::rag::SimilarityIndex;
    use crate::rag::context_builder::QueryContext;
    use crate::safety::GateConfig;

    /// Returns the same SQL for every question.
    struct FixedGenerator(&'static str);

    #[async_trait]
    impl SqlGenerator for FixedGenerator {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn generate(&self, _q: &str, _c: &QueryContext) -> Result<String, GenerationError> {
            Ok(self.0.to_string())
        }
    }

    struct EmptyGenerator;

    #[async_trait]
    impl SqlGenerator for EmptyGenerator {
        fn name(&self) -> &'static str {
            "empty"
        }

        async fn generate(&self, _q: &str, _c: &QueryContext) -> Result<String, GenerationError> {
            Err(GenerationError::Empty)
        }
    }

    /// Memory store with switchable write failures.
    #[derive(Default)]
    struct FaultyStore {
        inner: MemoryQueryStore,
        fail_delete: bool,
        fail_save_result: bool,
    }

    #[async_trait]
    impl QueryStore for FaultyStore {
        async fn create(&self, q: NewQuery) -> Result<QueryRecord, StoreError> {
            self.inner.create(q).await
        }
        async fn record_conversion(
            &self,
            id: i64,
            o: ConversionOutcome,
        ) -> Result<QueryRecord, StoreError> {
            self.inner.record_conversion(id, o).await
        }
        async fn transition(
            &self,
            id: i64,
            from: &[QueryStatus],
            to: QueryStatus,
        ) -> Result<bool, StoreError> {
            self.inner.transition(id, from, to).await
        }
        async fn record_execution(
            &self,
            id: i64,
            o: ExecutionOutcome,
        ) -> Result<QueryRecord, StoreError> {
            self.inner.record_execution(id, o).await
        }
        async fn save_result(
            &self,
            id: i64,
            c: Value,
            d: Value,
            n: i64,
        ) -> Result<QueryResultRow, StoreError> {
            if self.fail_save_result {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.inner.save_result(id, c, d, n).await
        }
        async fn latest_result(&self, id: i64) -> Result<Option<QueryResultRow>, StoreError> {
            self.inner.latest_result(id).await
        }
        async fn get_owned(&self, id: i64, u: Uuid) -> Result<Option<QueryRecord>, StoreError> {
            self.inner.get_owned(id, u).await
        }
        async fn delete_results(&self, id: i64) -> Result<u64, StoreError> {
            self.inner.delete_results(id).await
        }
        async fn delete(&self, id: i64) -> Result<bool, StoreError> {
            if self.fail_delete {
                return Err(StoreError::Unavailable("connection reset".into()));
            }
            self.inner.delete(id).await
        }
        async fn history(
            &self,
            u: Uuid,
            limit: i64,
            offset: i64,
        ) -> Result<Vec<QueryRecord>, StoreError> {
            self.inner.history(u, limit, offset).await
        }
    }

    struct Harness {
        user: Uuid,
        queries: Arc<dyn QueryStore>,
        sources: Arc<MemoryDataSourceStore>,
        orchestrator: Orchestrator,
    }

    async fn harness_with(
        generator: Arc<dyn SqlGenerator>,
        factory: StubFactory,
        queries: Arc<dyn QueryStore>,
        gate: GateConfig,
    ) -> Harness {
        let user = Uuid::new_v4();
        let sources = Arc::new(MemoryDataSourceStore::new());
        sources.insert_source(source(1, user, ConnectionStatus::Active)).await;
        sources.insert_source(source(2, user, ConnectionStatus::Inactive)).await;

        let embedder = Arc::new(KeywordEmbedder::sales_vocabulary());
        let index = SimilarityIndex::new(Arc::new(MemoryEmbeddingStore::new()), embedder.dimension());
        seed(&index, embedder.as_ref()).await;
        let context = ContextBuilder::new(index, embedder, Duration::from_secs(5));

        let gate = Arc::new(SafetyGate::new(gate));
        let dispatcher = Dispatcher::new(Arc::new(factory), Duration::from_secs(5));
        let orchestrator = Orchestrator::new(
            queries.clone(),
            sources.clone(),
            context,
            generator,
            gate,
            dispatcher,
            1000,
        );
        Harness {
            user,
            queries,
            sources,
            orchestrator,
        }
    }

    async fn harness(generator: Arc<dyn SqlGenerator>, factory: StubFactory) -> Harness {
        harness_with(
            generator,
            factory,
            Arc::new(MemoryQueryStore::new()),
            GateConfig::default(),
        )
        .await
    }

    fn convert_req(user: Uuid, text: &str) -> ConvertRequest {
        ConvertRequest {
            user_id: user,
            nl_query: text.into(),
            data_source_id: 1,
            context: None,
            query_type: None,
        }
    }

    #[tokio::test]
    async fn test_convert_then_execute() {
        let h = harness(Arc::new(PatternSqlGenerator), StubFactory::returning(3)).await;
        let converted = h
            .orchestrator
            .convert(convert_req(h.user, "total sales by region"))
            .await
            .unwrap();

        assert_eq!(converted.status, QueryStatus::Completed);
        assert!(converted.can_execute);
        assert!(converted.validation.has_limit);
        assert!(converted
            .generated_sql
            .as_deref()
            .unwrap()
            .starts_with("SELECT SUM(amount)"));
        assert_eq!(converted.messages.last().unwrap(), MSG_READY);

        let stored = h.queries.get_owned(converted.query_id, h.user).await.unwrap().unwrap();
        assert_eq!(stored.metadata["generator"], "pattern");
        assert!(stored.metadata["validation_result"]["is_valid"].as_bool().unwrap());
        assert!(stored.metadata["enhanced_context"]["prompt"].is_string());

        let executed = h
            .orchestrator
            .execute(h.user, converted.query_id, Some(2))
            .await
            .unwrap();
        assert_eq!(executed.status, QueryStatus::Completed);
        assert_eq!(executed.row_count, 2);
        assert_eq!(executed.message, MSG_EXECUTED);

        let detail = h.orchestrator.get_query(h.user, converted.query_id).await.unwrap();
        assert_eq!(detail.query.rows_returned, 2);
        assert_eq!(detail.data_source_name.as_deref(), Some("source-1"));
        assert_eq!(detail.result.unwrap().row_count, 2);
    }

    #[tokio::test]
    async fn test_missing_limit_is_added() {
        let h = harness(
            Arc::new(FixedGenerator("SELECT region FROM sales")),
            StubFactory::returning(1),
        )
        .await;
        let converted = h.orchestrator.convert(convert_req(h.user, "regions")).await.unwrap();
        assert_eq!(
            converted.generated_sql.as_deref(),
            Some("SELECT region FROM sales LIMIT 1000")
        );
        assert!(converted.validation.has_limit);
    }

    #[tokio::test]
    async fn test_rejected_sql_recorded_as_failed() {
        let h = harness(
            Arc::new(FixedGenerator("DROP TABLE sales")),
            StubFactory::returning(1),
        )
        .await;
        let converted = h.orchestrator.convert(convert_req(h.user, "wipe it")).await.unwrap();
        assert_eq!(converted.status, QueryStatus::Failed);
        assert!(!converted.can_execute);
        assert_eq!(converted.messages[0], MSG_VIOLATIONS);

        let stored = h.queries.get_owned(converted.query_id, h.user).await.unwrap().unwrap();
        assert_eq!(stored.status, QueryStatus::Failed);
        assert!(stored.error_message.unwrap().contains("DROP"));

        let err = h
            .orchestrator
            .execute(h.user, converted.query_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_low_score_sql_is_stored_but_not_executable() {
        // Four suspicious-pattern warnings score 0.9, under a 0.95 threshold.
        let strict = GateConfig {
            min_safety_score: 0.95,
            ..GateConfig::default()
        };
        let h = harness_with(
            Arc::new(FixedGenerator(
                "SELECT amount FROM sales /* a */ UNION SELECT amount FROM sales -- b\nLIMIT 10",
            )),
            StubFactory::returning(1),
            Arc::new(MemoryQueryStore::new()),
            strict,
        )
        .await;
        let converted = h.orchestrator.convert(convert_req(h.user, "amounts")).await.unwrap();
        assert!(converted.validation.is_valid);
        assert_eq!(converted.status, QueryStatus::Completed);
        assert!(!converted.can_execute);
        assert!(!converted.messages.contains(&MSG_READY.to_string()));

        let err = h
            .orchestrator
            .execute(h.user, converted.query_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        let stored = h.queries.get_owned(converted.query_id, h.user).await.unwrap().unwrap();
        assert_eq!(stored.status, QueryStatus::Completed);
    }

    #[tokio::test]
    async fn test_generation_failure_recorded() {
        let h = harness(Arc::new(EmptyGenerator), StubFactory::returning(1)).await;
        let err = h.orchestrator.convert(convert_req(h.user, "sales")).await.unwrap_err();
        assert!(matches!(err, AppError::Upstream(_)));

        let history = h.orchestrator.history(h.user, None, None).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].query.status, QueryStatus::Failed);
        assert!(history[0].query.error_message.is_some());
    }

    #[tokio::test]
    async fn test_convert_checks_source_before_writing() {
        let h = harness(Arc::new(PatternSqlGenerator), StubFactory::returning(1)).await;

        let mut foreign = convert_req(Uuid::new_v4(), "sales");
        foreign.data_source_id = 1;
        assert!(matches!(
            h.orchestrator.convert(foreign).await.unwrap_err(),
            AppError::NotFound(_)
        ));

        let mut inactive = convert_req(h.user, "sales");
        inactive.data_source_id = 2;
        assert!(matches!(
            h.orchestrator.convert(inactive).await.unwrap_err(),
            AppError::Validation(_)
        ));

        assert!(matches!(
            h.orchestrator.convert(convert_req(h.user, "   ")).await.unwrap_err(),
            AppError::Validation(_)
        ));
        assert!(h.orchestrator.history(h.user, None, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_connector_failure_marks_record_failed() {
        let mut factory = StubFactory::returning(1);
        factory.fail = Some("relation \"sales\" does not exist".into());
        let h = harness(Arc::new(PatternSqlGenerator), factory).await;
        let converted = h.orchestrator.convert(convert_req(h.user, "sales")).await.unwrap();

        let executed = h
            .orchestrator
            .execute(h.user, converted.query_id, None)
            .await
            .unwrap();
        assert_eq!(executed.status, QueryStatus::Failed);
        assert!(executed.message.contains("does not exist"));

        let stored = h.queries.get_owned(converted.query_id, h.user).await.unwrap().unwrap();
        assert_eq!(stored.status, QueryStatus::Failed);
        assert!(stored.error_message.is_some());
        assert!(h.queries.latest_result(converted.query_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_executions_race_for_one_claim() {
        let factory = StubFactory {
            delay: Duration::from_millis(200),
            ..StubFactory::returning(2)
        };
        let h = harness(Arc::new(PatternSqlGenerator), factory).await;
        let converted = h.orchestrator.convert(convert_req(h.user, "sales")).await.unwrap();

        let (first, second) = tokio::join!(
            h.orchestrator.execute(h.user, converted.query_id, None),
            h.orchestrator.execute(h.user, converted.query_id, None),
        );
        let results = [first, second];
        let completed = results
            .iter()
            .filter(|r| matches!(r, Ok(resp) if resp.status == QueryStatus::Completed))
            .count();
        let conflicts = results
            .iter()
            .filter(|r| matches!(r, Err(AppError::Conflict(_))))
            .count();
        assert_eq!((completed, conflicts), (1, 1));

        let stored = h.queries.get_owned(converted.query_id, h.user).await.unwrap().unwrap();
        assert_eq!(stored.status, QueryStatus::Completed);
        assert_eq!(stored.rows_returned, 2);
    }

    #[tokio::test]
    async fn test_result_store_failure_releases_claim() {
        let h = harness_with(
            Arc::new(PatternSqlGenerator),
            StubFactory::returning(2),
            Arc::new(FaultyStore {
                fail_save_result: true,
                ..Default::default()
            }),
            GateConfig::default(),
        )
        .await;
        let converted = h.orchestrator.convert(convert_req(h.user, "sales")).await.unwrap();

        let err = h
            .orchestrator
            .execute(h.user, converted.query_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Internal(_)));

        let stored = h.queries.get_owned(converted.query_id, h.user).await.unwrap().unwrap();
        assert_eq!(stored.status, QueryStatus::Failed);
        assert!(stored.error_message.unwrap().contains("disk full"));
        assert!(h.queries.latest_result(converted.query_id).await.unwrap().is_none());

        // Not stuck in `running`: another attempt gets past the claim.
        let again = h.orchestrator.execute(h.user, converted.query_id, None).await;
        assert!(!matches!(again, Err(AppError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_running_query_cannot_be_started_twice() {
        let h = harness(Arc::new(PatternSqlGenerator), StubFactory::returning(1)).await;
        let converted = h.orchestrator.convert(convert_req(h.user, "sales")).await.unwrap();
        h.queries
            .transition(converted.query_id, &[QueryStatus::Completed], QueryStatus::Running)
            .await
            .unwrap();

        let err = h
            .orchestrator
            .execute(h.user, converted.query_id, None)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_foreign_query_is_not_found() {
        let h = harness(Arc::new(PatternSqlGenerator), StubFactory::returning(1)).await;
        let converted = h.orchestrator.convert(convert_req(h.user, "sales")).await.unwrap();
        let stranger = Uuid::new_v4();

        assert!(matches!(
            h.orchestrator.get_query(stranger, converted.query_id).await.unwrap_err(),
            AppError::NotFound(_)
        ));
        assert!(matches!(
            h.orchestrator.execute(stranger, converted.query_id, None).await.unwrap_err(),
            AppError::NotFound(_)
        ));
        assert!(matches!(
            h.orchestrator.delete_query(stranger, converted.query_id).await.unwrap_err(),
            AppError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_cascades_results() {
        let h = harness(Arc::new(PatternSqlGenerator), StubFactory::returning(2)).await;
        let converted = h.orchestrator.convert(convert_req(h.user, "sales")).await.unwrap();
        h.orchestrator.execute(h.user, converted.query_id, None).await.unwrap();

        h.orchestrator.delete_query(h.user, converted.query_id).await.unwrap();
        assert!(h.queries.latest_result(converted.query_id).await.unwrap().is_none());
        assert!(h.queries.get_owned(converted.query_id, h.user).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_failure_is_surfaced() {
        let h = harness_with(
            Arc::new(PatternSqlGenerator),
            StubFactory::returning(2),
            Arc::new(FaultyStore {
                fail_delete: true,
                ..Default::default()
            }),
            GateConfig::default(),
        )
        .await;
        let converted = h.orchestrator.convert(convert_req(h.user, "sales")).await.unwrap();
        h.orchestrator.execute(h.user, converted.query_id, None).await.unwrap();

        assert!(h.orchestrator.delete_query(h.user, converted.query_id).await.is_err());
        assert!(h.queries.latest_result(converted.query_id).await.unwrap().is_none());
        assert!(h.queries.get_owned(converted.query_id, h.user).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_history_enriched_with_source_name() {
        let h = harness(Arc::new(PatternSqlGenerator), StubFactory::returning(1)).await;
        for text in ["count orders", "average amount", "total sales"] {
            h.orchestrator.convert(convert_req(h.user, text)).await.unwrap();
        }
        let history = h.orchestrator.history(h.user, Some(2), None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].query.nl_query, "total sales");
        assert_eq!(history[0].data_source_name.as_deref(), Some("source-1"));
        assert!(h.sources.get(1).await.unwrap().is_some());
    }

    #[test]
    fn test_validation_messages_order() {
        let validation = ValidationResult {
            violations: vec!["x".into()],
            warnings: vec!["y".into()],
            ..Default::default()
        };
        assert_eq!(
            validation_messages(&validation, false),
            vec![MSG_VIOLATIONS, MSG_WARNINGS]
        );
        assert_eq!(
            validation_messages(&ValidationResult::default(), true),
            vec![MSG_READY]
        );
    }
}
