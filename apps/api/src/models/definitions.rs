use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A business metric with the SQL expression that computes it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KpiDefinition {
    pub name: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub formula: String,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub unit: String,
    #[serde(default)]
    pub grain: String,
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlossaryTerm {
    pub term: String,
    pub definition: String,
    #[serde(default)]
    pub synonyms: Vec<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub examples: Vec<String>,
    pub user_id: Option<Uuid>,
}
