//! Typed connection settings per data source kind.
//!
//! The stored `data_sources.config` JSON is parsed into one of these structs
//! and validated before any connector is built from it. Secrets never leave
//! the process unmasked: use `masked()` for anything user-facing.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::data_source::DataSourceKind;

const MASK: &str = "********";
const SECRET_KEYS: &[&str] = &[
    "password",
    "credentials_json",
    "access_token",
    "refresh_token",
    "client_secret",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {kind} connection config: {source}")]
    Malformed {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{0} is required")]
    Missing(&'static str),

    #[error("invalid value for {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: String,
    },
}

fn default_pg_port() -> u16 {
    5432
}

fn default_ssl_mode() -> String {
    "prefer".to_string()
}

fn default_sheet_name() -> String {
    "Sheet1".to_string()
}

fn default_delimiter() -> char {
    ','
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostgresConfig {
    pub host: String,
    #[serde(default = "default_pg_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_ssl_mode")]
    pub ssl_mode: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BigQueryConfig {
    pub project_id: String,
    pub dataset_id: String,
    /// OAuth bearer token for the BigQuery REST API.
    pub access_token: String,
    #[serde(default)]
    pub location: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GoogleSheetsConfig {
    pub spreadsheet_id: String,
    /// Sheet checked by `test_connection`. Every sheet is discovered.
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,
    #[serde(default)]
    pub access_token: Option<String>,
    /// Exchanged for an access token when `access_token` is absent.
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    /// Service-account key. Stored and masked, but the connector cannot sign
    /// with it and reports a connection error.
    #[serde(default)]
    pub credentials_json: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileConfig {
    pub path: PathBuf,
    /// Name the file is queried as. Defaults to the file stem.
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default = "default_delimiter")]
    pub delimiter: char,
}

impl FileConfig {
    pub fn table_name(&self) -> String {
        self.table_name.clone().unwrap_or_else(|| {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().to_lowercase())
                .unwrap_or_else(|| "data".to_string())
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionConfig {
    File(FileConfig),
    Postgres(PostgresConfig),
    BigQuery(BigQueryConfig),
    GoogleSheets(GoogleSheetsConfig),
}

impl ConnectionConfig {
    /// Parses and validates the stored JSON for `kind`.
    pub fn parse(kind: DataSourceKind, raw: &Value) -> Result<Self, ConfigError> {
        fn typed<T: serde::de::DeserializeOwned>(
            kind: DataSourceKind,
            raw: &Value,
        ) -> Result<T, ConfigError> {
            T::deserialize(raw).map_err(|source| ConfigError::Malformed {
                kind: kind.as_str(),
                source,
            })
        }

        let config = match kind {
            DataSourceKind::Csv | DataSourceKind::Excel => {
                ConnectionConfig::File(typed(kind, raw)?)
            }
            DataSourceKind::Postgresql => ConnectionConfig::Postgres(typed(kind, raw)?),
            DataSourceKind::Bigquery => ConnectionConfig::BigQuery(typed(kind, raw)?),
            DataSourceKind::GoogleSheets => ConnectionConfig::GoogleSheets(typed(kind, raw)?),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            ConnectionConfig::File(c) => {
                if c.path.as_os_str().is_empty() {
                    return Err(ConfigError::Missing("path"));
                }
            }
            ConnectionConfig::Postgres(c) => {
                require("host", &c.host)?;
                require("database", &c.database)?;
                require("username", &c.username)?;
                if c.port == 0 {
                    return Err(ConfigError::Invalid {
                        field: "port",
                        reason: "must be between 1 and 65535".into(),
                    });
                }
                if !matches!(
                    c.ssl_mode.as_str(),
                    "disable" | "allow" | "prefer" | "require" | "verify-ca" | "verify-full"
                ) {
                    return Err(ConfigError::Invalid {
                        field: "ssl_mode",
                        reason: format!("unknown mode '{}'", c.ssl_mode),
                    });
                }
            }
            ConnectionConfig::BigQuery(c) => {
                require("project_id", &c.project_id)?;
                require("dataset_id", &c.dataset_id)?;
                require("access_token", &c.access_token)?;
                if !is_valid_identifier(&c.dataset_id) {
                    return Err(ConfigError::Invalid {
                        field: "dataset_id",
                        reason: "only letters, digits, '_' and '-' are allowed".into(),
                    });
                }
            }
            ConnectionConfig::GoogleSheets(c) => {
                require("spreadsheet_id", &c.spreadsheet_id)?;
                require("sheet_name", &c.sheet_name)?;
                let has_auth = [&c.access_token, &c.refresh_token, &c.credentials_json]
                    .iter()
                    .any(|v| v.as_deref().is_some_and(|s| !s.is_empty()));
                if !has_auth {
                    return Err(ConfigError::Missing(
                        "access_token, refresh_token or credentials_json",
                    ));
                }
            }
        }
        Ok(())
    }

    /// JSON view with secret fields replaced by a fixed mask.
    pub fn masked(&self) -> Value {
        let value = match self {
            ConnectionConfig::File(c) => serde_json::to_value(c),
            ConnectionConfig::Postgres(c) => serde_json::to_value(c),
            ConnectionConfig::BigQuery(c) => serde_json::to_value(c),
            ConnectionConfig::GoogleSheets(c) => serde_json::to_value(c),
        }
        .unwrap_or(Value::Null);
        mask_secrets(value)
    }
}

fn require(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        return Err(ConfigError::Missing(field));
    }
    Ok(())
}

/// BigQuery dataset and table names: letters, digits, `_` and `-`, at most 1024 chars.
pub fn is_valid_identifier(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 1024
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn mask_secrets(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    let present = !(v.is_null() || v.as_str().is_some_and(str::is_empty));
                    if SECRET_KEYS.contains(&k.as_str()) && present {
                        (k, Value::String(MASK.to_string()))
                    } else {
                        (k, v)
                    }
                })
                .collect::<Map<_, _>>(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_postgres_defaults_and_masking() {
        let raw = json!({
            "host": "db.internal",
            "database": "shop",
            "username": "reader",
            "password": "hunter2"
        });
        let config = ConnectionConfig::parse(DataSourceKind::Postgresql, &raw).unwrap();
        let ConnectionConfig::Postgres(pg) = &config else {
            panic!("expected postgres config");
        };
        assert_eq!(pg.port, 5432);
        assert_eq!(pg.ssl_mode, "prefer");

        let masked = config.masked();
        assert_eq!(masked["password"], MASK);
        assert_eq!(masked["host"], "db.internal");
    }

    #[test]
    fn test_missing_required_field_rejected() {
        let raw = json!({"host": "db", "database": "", "username": "u"});
        let err = ConnectionConfig::parse(DataSourceKind::Postgresql, &raw).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("database")));

        let err = ConnectionConfig::parse(DataSourceKind::Bigquery, &json!({"project_id": "p"}))
            .unwrap_err();
        assert!(matches!(err, ConfigError::Malformed { kind: "bigquery", .. }));
    }

    #[test]
    fn test_sheets_requires_some_credential() {
        let raw = json!({"spreadsheet_id": "abc", "sheet_name": "Sheet1"});
        let err = ConnectionConfig::parse(DataSourceKind::GoogleSheets, &raw).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(_)));

        let raw = json!({
            "spreadsheet_id": "abc",
            "refresh_token": "r-123",
            "client_id": "app",
            "client_secret": "s3cret"
        });
        let config = ConnectionConfig::parse(DataSourceKind::GoogleSheets, &raw).unwrap();
        let ConnectionConfig::GoogleSheets(sheets) = &config else {
            panic!("expected sheets config");
        };
        assert_eq!(sheets.sheet_name, "Sheet1");

        let masked = config.masked();
        assert_eq!(masked["refresh_token"], MASK);
        assert_eq!(masked["client_secret"], MASK);
        assert_eq!(masked["client_id"], "app");
        assert!(masked["access_token"].is_null());
    }

    #[test]
    fn test_bigquery_dataset_name_checked() {
        let raw = json!({
            "project_id": "acme",
            "dataset_id": "sales; DROP",
            "access_token": "tok"
        });
        let err = ConnectionConfig::parse(DataSourceKind::Bigquery, &raw).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: "dataset_id", .. }));
    }

    #[test]
    fn test_file_table_name_defaults_to_stem() {
        let raw = json!({"path": "/data/Orders.csv"});
        let ConnectionConfig::File(file) = ConnectionConfig::parse(DataSourceKind::Csv, &raw).unwrap()
        else {
            panic!("expected file config");
        };
        assert_eq!(file.table_name(), "orders");
        assert_eq!(file.delimiter, ',');
    }
}
