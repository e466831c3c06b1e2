//! Google Sheets over the v4 REST API. Every tab of the spreadsheet is one
//! table whose first row holds the headers; queries run through the same
//! projection planner as CSV files.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::{de::DeserializeOwned, Deserialize};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::models::data_source::DiscoveredSchema;
use crate::safety::analysis::parse_query;
use crate::safety::ApprovedSql;

use super::bigquery::check;
use super::config::GoogleSheetsConfig;
use super::file::{plan, run_plan, target_table, Table};
use super::{Connector, ConnectorError, QueryOutput};

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

pub struct GoogleSheetsConnector {
    http: Client,
    config: GoogleSheetsConfig,
    base_url: String,
    token_url: String,
    token: OnceCell<String>,
}

#[derive(Debug, Deserialize)]
struct Spreadsheet {
    #[serde(default)]
    sheets: Vec<Sheet>,
}

#[derive(Debug, Deserialize)]
struct Sheet {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug, Default, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

impl GoogleSheetsConnector {
    pub fn new(http: Client, config: GoogleSheetsConfig) -> Self {
        Self {
            http,
            config,
            base_url: SHEETS_API.to_string(),
            token_url: TOKEN_URL.to_string(),
            token: OnceCell::new(),
        }
    }

    /// Bearer token for this connector's lifetime. A refresh token is
    /// exchanged at most once.
    async fn token(&self) -> Result<&str, ConnectorError> {
        self.token
            .get_or_try_init(|| self.obtain_token())
            .await
            .map(String::as_str)
    }

    async fn obtain_token(&self) -> Result<String, ConnectorError> {
        if let Some(token) = present(&self.config.access_token) {
            return Ok(token.to_string());
        }
        let Some(refresh) = present(&self.config.refresh_token) else {
            return Err(ConnectorError::Connection(
                "service-account credentials are not supported, configure access_token or refresh_token"
                    .into(),
            ));
        };

        let mut form = vec![("grant_type", "refresh_token"), ("refresh_token", refresh)];
        if let Some(id) = present(&self.config.client_id) {
            form.push(("client_id", id));
        }
        if let Some(secret) = present(&self.config.client_secret) {
            form.push(("client_secret", secret));
        }
        let response = self.http.post(&self.token_url).form(&form).send().await?;
        let token: TokenResponse = check(response).await?.json().await?;
        debug!(spreadsheet = %self.config.spreadsheet_id, "Sheets access token refreshed");
        Ok(token.access_token)
    }

    fn spreadsheet_url(&self, tail: &[&str]) -> Result<Url, ConnectorError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ConnectorError::Connection(format!("invalid Sheets API URL: {e}")))?;
        url.path_segments_mut()
            .map_err(|_| ConnectorError::Connection("Sheets API URL cannot take a path".into()))?
            .push(&self.config.spreadsheet_id)
            .extend(tail);
        Ok(url)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ConnectorError> {
        let response = request.bearer_auth(self.token().await?).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn sheet_titles(&self) -> Result<Vec<String>, ConnectorError> {
        let url = self.spreadsheet_url(&[])?;
        let spreadsheet: Spreadsheet = self
            .send(self.http.get(url).query(&[("fields", "sheets.properties.title")]))
            .await?;
        Ok(spreadsheet
            .sheets
            .into_iter()
            .map(|s| s.properties.title)
            .collect())
    }

    async fn read(&self, range: &str) -> Result<Vec<Vec<Value>>, ConnectorError> {
        let url = self.spreadsheet_url(&["values", range])?;
        let values: ValueRange = self.send(self.http.get(url)).await?;
        Ok(values.values)
    }
}

fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|s| !s.trim().is_empty())
}

/// Queryable name of a tab: lowercased, anything but letters and digits
/// replaced by `_`.
fn table_name(title: &str) -> String {
    title
        .trim()
        .chars()
        .map(|c| {
            if c.is_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// A1 sheet reference, quoted so titles with spaces or quotes survive.
fn sheet_range(title: &str, rows: Option<i64>) -> String {
    let quoted = format!("'{}'", title.replace('\'', "''"));
    match rows {
        Some(n) => format!("{quoted}!1:{}", n + 1),
        None => quoted,
    }
}

fn cell_text(cell: Value) -> String {
    match cell {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// First row becomes the headers; blank or non-text headers are named
/// `Column_<n>`. `None` for an empty tab.
fn table_from_values(values: Vec<Vec<Value>>) -> Option<Table> {
    let mut rows = values.into_iter();
    let headers: Vec<String> = rows
        .next()?
        .into_iter()
        .enumerate()
        .map(|(i, cell)| match cell {
            Value::String(s) if !s.trim().is_empty() => s.trim().to_string(),
            _ => format!("Column_{}", i + 1),
        })
        .collect();
    if headers.is_empty() {
        return None;
    }
    let records = rows
        .map(|row| row.into_iter().map(cell_text).collect())
        .collect();
    Some(Table { headers, records })
}

fn discovered(spreadsheet_id: &str, title: &str, table: &Table) -> DiscoveredSchema {
    DiscoveredSchema {
        name: table_name(title),
        display_name: Some(title.to_string()),
        description: Some(format!("Google Sheets tab '{title}' of spreadsheet {spreadsheet_id}")),
        columns: table.column_defs(),
        row_count: table.records.len() as i64,
    }
}

#[async_trait]
impl Connector for GoogleSheetsConnector {
    async fn test_connection(&self) -> Result<(), ConnectorError> {
        let titles = self.sheet_titles().await?;
        if !titles.iter().any(|t| t == &self.config.sheet_name) {
            return Err(ConnectorError::Connection(format!(
                "sheet '{}' not found in spreadsheet",
                self.config.sheet_name
            )));
        }
        Ok(())
    }

    async fn get_schema(&self) -> Result<Vec<DiscoveredSchema>, ConnectorError> {
        let mut schemas = Vec::new();
        for title in self.sheet_titles().await? {
            let values = match self.read(&sheet_range(&title, None)).await {
                Ok(values) => values,
                Err(e) => {
                    warn!(sheet = %title, error = %e, "unreadable sheet skipped");
                    continue;
                }
            };
            if let Some(table) = table_from_values(values) {
                schemas.push(discovered(&self.config.spreadsheet_id, &title, &table));
            }
        }
        debug!(sheets = schemas.len(), spreadsheet = %self.config.spreadsheet_id, "Sheets schema discovered");
        Ok(schemas)
    }

    async fn execute(&self, sql: &ApprovedSql, limit: i64) -> Result<QueryOutput, ConnectorError> {
        let query = parse_query(sql.as_str()).map_err(|e| ConnectorError::Query(e.to_string()))?;
        let requested = target_table(&query)
            .ok_or_else(|| ConnectorError::Query("expected exactly one sheet in FROM".into()))?;
        let plan = plan(&query, &requested)?;

        let title = self
            .sheet_titles()
            .await?
            .into_iter()
            .find(|t| table_name(t) == requested)
            .ok_or_else(|| ConnectorError::Query(format!("unknown table '{requested}'")))?;

        // Filters can match anywhere, so only unfiltered reads stop early.
        let rows = (!plan.has_filters()).then_some(limit);
        let values = self.read(&sheet_range(&title, rows)).await?;
        let table = table_from_values(values).unwrap_or(Table {
            headers: Vec::new(),
            records: Vec::new(),
        });
        run_plan(&table, &plan, limit)
    }
}
