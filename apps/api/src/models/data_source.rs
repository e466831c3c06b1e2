#![allow(dead_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

use super::UnknownVariant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSourceKind {
    Csv,
    Excel,
    Postgresql,
    Bigquery,
    GoogleSheets,
}

impl DataSourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataSourceKind::Csv => "csv",
            DataSourceKind::Excel => "excel",
            DataSourceKind::Postgresql => "postgresql",
            DataSourceKind::Bigquery => "bigquery",
            DataSourceKind::GoogleSheets => "google_sheets",
        }
    }
}

impl TryFrom<String> for DataSourceKind {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "csv" => Ok(DataSourceKind::Csv),
            "excel" => Ok(DataSourceKind::Excel),
            "postgresql" => Ok(DataSourceKind::Postgresql),
            "bigquery" => Ok(DataSourceKind::Bigquery),
            "google_sheets" => Ok(DataSourceKind::GoogleSheets),
            _ => Err(UnknownVariant {
                kind: "data source kind",
                value,
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Active,
    Inactive,
    Error,
    Connecting,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Active => "active",
            ConnectionStatus::Inactive => "inactive",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Connecting => "connecting",
        }
    }
}

impl TryFrom<String> for ConnectionStatus {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, <ConnectionStatus as TryFrom<String>>::Error> {
        match value.as_str() {
            "active" => Ok(ConnectionStatus::Active),
            "inactive" => Ok(ConnectionStatus::Inactive),
            "error" => Ok(ConnectionStatus::Error),
            "connecting" => Ok(ConnectionStatus::Connecting),
            _ => Err(UnknownVariant {
                kind: "connection status",
                value,
            }),
        }
    }
}

/// A registered external system. `config` is the stored JSON; parse it with
/// `ConnectionConfig::from_row` before use.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DataSourceRow {
    pub id: i64,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    #[sqlx(try_from = "String")]
    pub kind: DataSourceKind,
    #[sqlx(try_from = "String")]
    pub status: ConnectionStatus,
    #[serde(skip_serializing)]
    pub config: Value,
    pub last_tested: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DataSourceRow {
    pub fn is_active(&self) -> bool {
        self.status == ConnectionStatus::Active
    }
}

/// One table (or sheet) discovered inside a data source.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SchemaRow {
    pub id: i64,
    pub data_source_id: i64,
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub columns: Json<Vec<ColumnDef>>,
    pub row_count: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type", default)]
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sample_values: Vec<Value>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            ..Default::default()
        }
    }
}

/// Schema discovered by a connector, before it has a row id.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DiscoveredSchema {
    pub name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    pub columns: Vec<ColumnDef>,
    pub row_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_round_trips_through_storage_string() {
        for kind in [
            DataSourceKind::Csv,
            DataSourceKind::Excel,
            DataSourceKind::Postgresql,
            DataSourceKind::Bigquery,
            DataSourceKind::GoogleSheets,
        ] {
            let parsed = DataSourceKind::try_from(kind.as_str().to_string()).unwrap();
            assert_eq!(parsed, kind);
        }
        assert!(DataSourceKind::try_from("oracle".to_string()).is_err());
    }

    #[test]
    fn test_column_def_reads_type_key() {
        let col: ColumnDef =
            serde_json::from_str(r#"{"name":"amount","type":"numeric","primary_key":false}"#)
                .unwrap();
        assert_eq!(col.data_type, "numeric");
        assert!(!col.nullable);
        assert!(col.sample_values.is_empty());
    }
}
