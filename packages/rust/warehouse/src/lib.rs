//! ClickHouse HTTP client implementing [`WarehouseSink`].
//!
//! All statements go to the server's HTTP interface as `POST /?query=...`.
//! Inserts stream a CSV body; lookups bind values through server-side query
//! parameters (`{key:String}` with `param_key=...`) so no user data is ever
//! spliced into SQL text.

pub mod csv;

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use reqwest::{Client, Response};
use tracing::{debug, instrument, warn};
use url::Url;

use aspects_core::adapters::WarehouseSink;
use aspects_shared::{
    AspectsError, BulkInsertOptions, ClickHouseConfig, FlatRow, InsertSummary, Result,
};

const USER_AGENT: &str = concat!("aspects/", env!("CARGO_PKG_VERSION"));

/// Header carrying the per-query progress summary.
const SUMMARY_HEADER: &str = "X-ClickHouse-Summary";

static IDENTIFIER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("identifier regex"));

/// Quote a table or column name, rejecting anything that is not a plain
/// identifier.
fn quote_identifier(name: &str) -> Result<String> {
    if IDENTIFIER_RE.is_match(name) {
        Ok(format!("`{name}`"))
    } else {
        Err(AspectsError::validation(format!(
            "invalid ClickHouse identifier {name:?}"
        )))
    }
}

/// Rows written according to the summary header, if the server sent one.
fn written_rows(response: &Response) -> Option<u64> {
    let header = response.headers().get(SUMMARY_HEADER)?.to_str().ok()?;
    let summary: serde_json::Value = serde_json::from_str(header).ok()?;
    // ClickHouse encodes the counters as JSON strings.
    match &summary["written_rows"] {
        serde_json::Value::String(s) => s.parse().ok(),
        v => v.as_u64(),
    }
}

/// Client for one ClickHouse database.
pub struct ClickHouseClient {
    client: Client,
    base_url: Url,
    database: String,
    username: String,
    password: String,
}

impl ClickHouseClient {
    /// Build a client from `[clickhouse]` settings. The password is read from
    /// the configured environment variable.
    pub fn new(config: &ClickHouseConfig) -> Result<Self> {
        let base_url = Url::parse(&config.url)
            .map_err(|e| AspectsError::config(format!("invalid ClickHouse URL: {e}")))?;
        quote_identifier(&config.database)?;

        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AspectsError::Warehouse(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            database: config.database.clone(),
            username: config.username.clone(),
            password: config.password(),
        })
    }

    /// `db`.`table`, both quoted.
    fn qualified(&self, table: &str) -> Result<String> {
        Ok(format!(
            "{}.{}",
            quote_identifier(&self.database)?,
            quote_identifier(table)?
        ))
    }

    /// Send one statement. Non-2xx responses are returned, not turned into
    /// errors, so callers can map them to the right variant.
    async fn send(&self, params: &[(&str, String)], body: String) -> Result<Response> {
        let password = (!self.password.is_empty()).then_some(&self.password);
        self.client
            .post(self.base_url.clone())
            .query(params)
            .basic_auth(&self.username, password)
            .body(body)
            .send()
            .await
            .map_err(|e| AspectsError::Warehouse(format!("request failed: {e}")))
    }

    /// Send a statement whose failure is a plain warehouse error; returns the
    /// response body.
    async fn query(&self, params: &[(&str, String)]) -> Result<String> {
        let response = self.send(params, String::new()).await?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| AspectsError::Warehouse(format!("failed to read response: {e}")))?;
        if !status.is_success() {
            return Err(AspectsError::Warehouse(format!(
                "HTTP {status}: {}",
                text.trim()
            )));
        }
        Ok(text)
    }
}

#[async_trait]
impl WarehouseSink for ClickHouseClient {
    #[instrument(skip_all, fields(table = %table, rows = rows.len()))]
    async fn bulk_insert(
        &self,
        table: &str,
        rows: &[FlatRow],
        options: &BulkInsertOptions,
    ) -> Result<InsertSummary> {
        if rows.is_empty() {
            return Ok(InsertSummary {
                table: table.to_string(),
                rows_sent: 0,
                written_rows: 0,
            });
        }

        let query = format!("INSERT INTO {} FORMAT CSV", self.qualified(table)?);
        let params = [
            ("query", query),
            (
                "input_format_allow_errors_num",
                options.max_error_count.to_string(),
            ),
            (
                "input_format_allow_errors_ratio",
                options.max_error_ratio.to_string(),
            ),
            ("date_time_input_format", "best_effort".to_string()),
        ];

        let response = self.send(&params, csv::encode_rows(rows)).await?;
        let status = response.status();
        let written = written_rows(&response);

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            warn!(status = %status, "bulk insert rejected");
            return Err(AspectsError::BulkInsert {
                table: table.to_string(),
                written_rows: written.unwrap_or(0),
                message: format!("HTTP {status}: {}", message.trim()),
            });
        }

        let written_rows = written.unwrap_or(rows.len() as u64);
        debug!(written_rows, "bulk insert accepted");
        Ok(InsertSummary {
            table: table.to_string(),
            rows_sent: rows.len(),
            written_rows,
        })
    }

    #[instrument(skip_all, fields(table = %table, key = %key))]
    async fn last_dumped_timestamp(
        &self,
        table: &str,
        key_column: &str,
        key: &str,
    ) -> Result<Option<String>> {
        let query = format!(
            "SELECT time_last_dumped FROM {} WHERE {} = {{key:String}} \
             ORDER BY time_last_dumped DESC LIMIT 1 FORMAT TabSeparated",
            self.qualified(table)?,
            quote_identifier(key_column)?
        );
        let body = self
            .query(&[("query", query), ("param_key", key.to_string())])
            .await?;

        let value = body.lines().next().map(str::trim).unwrap_or_default();
        Ok((!value.is_empty()).then(|| value.to_string()))
    }

    #[instrument(skip_all, fields(table = %table, column = %column))]
    async fn delete_rows(&self, table: &str, column: &str, value: &str) -> Result<()> {
        let query = format!(
            "ALTER TABLE {} DELETE WHERE {} = {{value:String}}",
            self.qualified(table)?,
            quote_identifier(column)?
        );
        self.query(&[("query", query), ("param_value", value.to_string())])
            .await?;
        debug!("delete submitted");
        Ok(())
    }
}
