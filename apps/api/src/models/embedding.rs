#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

use super::UnknownVariant;

/// Data source id used for records shared across all sources.
pub const GLOBAL_SCOPE: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
    Table,
    Column,
    Kpi,
    Glossary,
}

impl ElementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElementType::Table => "table",
            ElementType::Column => "column",
            ElementType::Kpi => "kpi",
            ElementType::Glossary => "glossary",
        }
    }
}

impl TryFrom<String> for ElementType {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "table" => Ok(ElementType::Table),
            "column" => Ok(ElementType::Column),
            "kpi" => Ok(ElementType::Kpi),
            "glossary" => Ok(ElementType::Glossary),
            _ => Err(UnknownVariant {
                kind: "element type",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct EmbeddingRecord {
    pub id: i64,
    pub data_source_id: i64,
    pub schema_id: i64,
    #[sqlx(try_from = "String")]
    pub element_type: ElementType,
    pub element_name: String,
    pub content: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An embedding waiting to be written.
#[derive(Debug, Clone)]
pub struct NewEmbedding {
    pub data_source_id: i64,
    pub schema_id: i64,
    pub element_type: ElementType,
    pub element_name: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub metadata: Value,
}
