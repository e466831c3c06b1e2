//! BigQuery over the v2 REST API (`jobs.query`, `tables.list`, `tables.get`).

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Number, Value};
use tracing::debug;

use crate::models::data_source::{ColumnDef, DiscoveredSchema};
use crate::safety::ApprovedSql;

use super::config::{is_valid_identifier, BigQueryConfig};
use super::{Connector, ConnectorError, QueryOutput, Row};

const BIGQUERY_API: &str = "https://bigquery.googleapis.com/bigquery/v2";
const QUERY_TIMEOUT_MS: u64 = 60_000;

pub struct BigQueryConnector {
    http: Client,
    config: BigQueryConfig,
    base_url: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct QueryRequest<'a> {
    query: &'a str,
    use_legacy_sql: bool,
    max_results: i64,
    timeout_ms: u64,
    default_dataset: DatasetReference<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    location: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasetReference<'a> {
    project_id: &'a str,
    dataset_id: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct TableSchema {
    #[serde(default)]
    fields: Vec<FieldSchema>,
}

#[derive(Debug, Deserialize)]
struct FieldSchema {
    name: String,
    #[serde(rename = "type")]
    field_type: String,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse {
    #[serde(default)]
    schema: TableSchema,
    #[serde(default)]
    rows: Vec<TableRow>,
    #[serde(default)]
    job_complete: bool,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    f: Vec<TableCell>,
}

#[derive(Debug, Deserialize)]
struct TableCell {
    v: Value,
}

#[derive(Debug, Deserialize)]
struct TableList {
    #[serde(default)]
    tables: Vec<TableListEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableListEntry {
    table_reference: TableReference,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableReference {
    table_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TableResource {
    #[serde(default)]
    schema: TableSchema,
    #[serde(default)]
    num_rows: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    friendly_name: Option<String>,
}

impl BigQueryConnector {
    pub fn new(http: Client, config: BigQueryConfig) -> Self {
        Self {
            http,
            config,
            base_url: BIGQUERY_API.to_string(),
        }
    }

    fn dataset_url(&self) -> String {
        format!(
            "{}/projects/{}/datasets/{}",
            self.base_url, self.config.project_id, self.config.dataset_id
        )
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ConnectorError> {
        let response = request.bearer_auth(&self.config.access_token).send().await?;
        Ok(check(response).await?.json().await?)
    }
}

pub(super) async fn check(response: Response) -> Result<Response, ConnectorError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(ConnectorError::Api {
        status: status.as_u16(),
        message,
    })
}

#[async_trait]
impl Connector for BigQueryConnector {
    async fn test_connection(&self) -> Result<(), ConnectorError> {
        let _: Value = self.send(self.http.get(self.dataset_url())).await?;
        Ok(())
    }

    async fn get_schema(&self) -> Result<Vec<DiscoveredSchema>, ConnectorError> {
        let list: TableList = self
            .send(self.http.get(format!("{}/tables", self.dataset_url())))
            .await?;

        let mut schemas = Vec::with_capacity(list.tables.len());
        for entry in list.tables {
            let table_id = entry.table_reference.table_id;
            if !is_valid_identifier(&table_id) {
                continue;
            }
            let table: TableResource = self
                .send(
                    self.http
                        .get(format!("{}/tables/{}", self.dataset_url(), table_id)),
                )
                .await?;
            schemas.push(DiscoveredSchema {
                name: table_id,
                display_name: table.friendly_name,
                description: table.description,
                columns: table.schema.fields.iter().map(column_def).collect(),
                row_count: table
                    .num_rows
                    .and_then(|n| n.parse().ok())
                    .unwrap_or_default(),
            });
        }
        debug!(tables = schemas.len(), dataset = %self.config.dataset_id, "BigQuery schema discovered");
        Ok(schemas)
    }

    async fn execute(&self, sql: &ApprovedSql, limit: i64) -> Result<QueryOutput, ConnectorError> {
        let body = QueryRequest {
            query: sql.as_str(),
            use_legacy_sql: false,
            max_results: limit,
            timeout_ms: QUERY_TIMEOUT_MS,
            default_dataset: DatasetReference {
                project_id: &self.config.project_id,
                dataset_id: &self.config.dataset_id,
            },
            location: self.config.location.as_deref(),
        };
        let url = format!("{}/projects/{}/queries", self.base_url, self.config.project_id);
        let response: QueryResponse = self.send(self.http.post(url).json(&body)).await?;
        if !response.job_complete {
            return Err(ConnectorError::Query(
                "BigQuery job did not complete before the request timeout".into(),
            ));
        }
        Ok(decode_rows(&response.schema, response.rows))
    }
}

/// Maps BigQuery field types onto the names stored in schema records.
fn normalize_type(bq_type: &str) -> &'static str {
    match bq_type.to_ascii_uppercase().as_str() {
        "STRING" => "string",
        "BYTES" => "bytes",
        "INTEGER" | "INT64" => "integer",
        "FLOAT" | "FLOAT64" => "float",
        "BOOLEAN" | "BOOL" => "boolean",
        "TIMESTAMP" => "timestamp",
        "DATE" => "date",
        "TIME" => "time",
        "DATETIME" => "datetime",
        "NUMERIC" | "BIGNUMERIC" => "decimal",
        "GEOGRAPHY" => "geography",
        "JSON" => "json",
        "RECORD" | "STRUCT" => "record",
        _ => "string",
    }
}

fn column_def(field: &FieldSchema) -> ColumnDef {
    let mut column = ColumnDef::new(field.name.clone(), normalize_type(&field.field_type));
    column.nullable = field.mode.as_deref() != Some("REQUIRED");
    column.description = field.description.clone().unwrap_or_default();
    column
}

/// BigQuery returns every scalar as a string; convert by declared type.
fn cell_value(field_type: &str, raw: Value) -> Value {
    let Value::String(text) = raw else {
        return raw;
    };
    match normalize_type(field_type) {
        "integer" => text
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .unwrap_or(Value::String(text)),
        "float" | "decimal" => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or(Value::String(text)),
        "boolean" => match text.as_str() {
            "true" => Value::Bool(true),
            "false" => Value::Bool(false),
            _ => Value::String(text),
        },
        _ => Value::String(text),
    }
}

fn decode_rows(schema: &TableSchema, rows: Vec<TableRow>) -> QueryOutput {
    let columns: Vec<ColumnDef> = schema.fields.iter().map(column_def).collect();
    let rows = rows
        .into_iter()
        .map(|row| {
            schema
                .fields
                .iter()
                .zip(row.f)
                .map(|(field, cell)| (field.name.clone(), cell_value(&field.field_type, cell.v)))
                .collect::<Row>()
        })
        .collect();
    QueryOutput { columns, rows }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_response_rows_typed_by_schema() {
        let response: QueryResponse = serde_json::from_value(json!({
            "jobComplete": true,
            "schema": {"fields": [
                {"name": "region", "type": "STRING", "mode": "REQUIRED"},
                {"name": "orders", "type": "INTEGER"},
                {"name": "total", "type": "NUMERIC"},
                {"name": "active", "type": "BOOLEAN"}
            ]},
            "rows": [
                {"f": [{"v": "EMEA"}, {"v": "42"}, {"v": "1050.5"}, {"v": "true"}]},
                {"f": [{"v": "APAC"}, {"v": null}, {"v": "7"}, {"v": "false"}]}
            ]
        }))
        .unwrap();

        let output = decode_rows(&response.schema, response.rows);
        assert_eq!(output.columns[0].data_type, "string");
        assert!(!output.columns[0].nullable);
        assert_eq!(output.columns[2].data_type, "decimal");
        assert_eq!(output.rows[0]["orders"], json!(42));
        assert_eq!(output.rows[0]["total"], json!(1050.5));
        assert_eq!(output.rows[0]["active"], json!(true));
        assert_eq!(output.rows[1]["orders"], Value::Null);
    }

    #[test]
    fn test_unknown_type_falls_back_to_string() {
        assert_eq!(normalize_type("INTERVAL"), "string");
        assert_eq!(cell_value("INTERVAL", json!("1-2")), json!("1-2"));
    }
}
