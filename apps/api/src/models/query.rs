#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl QueryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryStatus::Pending => "pending",
            QueryStatus::Running => "running",
            QueryStatus::Completed => "completed",
            QueryStatus::Failed => "failed",
        }
    }
}

impl TryFrom<String> for QueryStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(QueryStatus::Pending),
            "running" => Ok(QueryStatus::Running),
            "completed" => Ok(QueryStatus::Completed),
            "failed" => Ok(QueryStatus::Failed),
            _ => Err(UnknownVariant {
                kind: "query status",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryType {
    #[default]
    Analytics,
    Report,
    Explore,
}

impl QueryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryType::Analytics => "analytics",
            QueryType::Report => "report",
            QueryType::Explore => "explore",
        }
    }
}

impl TryFrom<String> for QueryType {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "analytics" => Ok(QueryType::Analytics),
            "report" => Ok(QueryType::Report),
            "explore" => Ok(QueryType::Explore),
            _ => Err(UnknownVariant {
                kind: "query type",
                value,
            }),
        }
    }
}

/// One NL→SQL conversion and its execution outcome.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueryRecord {
    pub id: i64,
    pub user_id: Uuid,
    pub data_source_id: i64,
    pub nl_query: String,
    pub generated_sql: Option<String>,
    #[sqlx(try_from = "String")]
    pub status: QueryStatus,
    #[sqlx(try_from = "String")]
    pub query_type: QueryType,
    /// Caller-supplied context at conversion time.
    pub context: Value,
    /// Validation result, retrieval context and timestamps for audit.
    pub metadata: Value,
    pub error_message: Option<String>,
    pub execution_time_ms: i64,
    pub rows_returned: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueryRecord {
    /// Whether the conversion marked this record as executable.
    pub fn can_execute(&self) -> bool {
        self.metadata
            .get("can_execute")
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct QueryResultRow {
    pub id: i64,
    pub query_id: i64,
    pub columns: Value,
    pub data: Value,
    pub row_count: i64,
    pub created_at: DateTime<Utc>,
}

/// Fields written when a record is first created.
#[derive(Debug, Clone)]
pub struct NewQuery {
    pub user_id: Uuid,
    pub data_source_id: i64,
    pub nl_query: String,
    pub query_type: QueryType,
    pub context: Value,
}

/// Terminal update written after generation and validation.
#[derive(Debug, Clone)]
pub struct ConversionOutcome {
    pub generated_sql: Option<String>,
    pub status: QueryStatus,
    pub metadata: Value,
    pub error_message: Option<String>,
}

/// Terminal update written after an execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub status: QueryStatus,
    pub execution_time_ms: i64,
    pub rows_returned: i64,
    pub error_message: Option<String>,
}
