//! Google Sheets result log.
//!
//! One worksheet per prefix, created on first use with a header row. Rows are
//! appended through the v4 `values:append` endpoint with `USER_ENTERED`
//! input, and the updated A1 range is returned as the location.

use std::collections::HashSet;

use anyhow::{Context, anyhow};
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{ResultLog, ResultRow};
use crate::config::RecorderSection;
use crate::errors::RecordError;

const HEADERS: [&str; 4] = ["Serial", "Generated ID", "Timestamp", "Mobile Number"];
const MAX_TITLE_CHARS: usize = 100;

#[derive(Debug, Deserialize)]
struct SpreadsheetMeta {
    #[serde(default)]
    sheets: Vec<SheetEntry>,
}

#[derive(Debug, Deserialize)]
struct SheetEntry {
    properties: SheetProperties,
}

#[derive(Debug, Deserialize)]
struct SheetProperties {
    title: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendResponse {
    updates: AppendUpdates,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppendUpdates {
    updated_range: String,
}

pub struct SheetsResultLog {
    client: reqwest::Client,
    api_url: String,
    sheet_id: String,
    access_token: String,
    /// Worksheet titles known to exist.
    worksheets: Mutex<HashSet<String>>,
}

impl SheetsResultLog {
    pub fn new(api_url: &str, sheet_id: &str, access_token: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .context("Failed to build Sheets HTTP client")?;
        Ok(Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            sheet_id: sheet_id.to_string(),
            access_token: access_token.to_string(),
            worksheets: Mutex::new(HashSet::new()),
        })
    }

    pub fn from_config(section: &RecorderSection) -> anyhow::Result<Self> {
        let sheet_id = section
            .sheet_id
            .as_deref()
            .context("recorder.sheet_id is required for the sheets backend")?;
        let token = section
            .access_token
            .as_deref()
            .context("SERIALFORGE_SHEETS_TOKEN is required for the sheets backend")?;
        Self::new(&section.sheets_api_url, sheet_id, token)
    }

    fn url(&self, tail: &[&str]) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.api_url)
            .with_context(|| format!("Invalid Sheets API url: {}", self.api_url))?;
        url.path_segments_mut()
            .map_err(|_| anyhow!("Sheets API url cannot be a base: {}", self.api_url))?
            .pop_if_empty()
            .push("spreadsheets")
            .push(&self.sheet_id)
            .extend(tail);
        Ok(url)
    }

    async fn worksheet_titles(&self) -> Result<HashSet<String>, RecordError> {
        let url = self.url(&[])?;
        let resp = self
            .client
            .get(url)
            .bearer_auth(&self.access_token)
            .query(&[("fields", "sheets.properties.title")])
            .send()
            .await
            .context("Failed to fetch spreadsheet metadata")?;
        let meta: SpreadsheetMeta = check(resp)
            .await?
            .json()
            .await
            .context("Failed to parse spreadsheet metadata")?;
        Ok(meta.sheets.into_iter().map(|s| s.properties.title).collect())
    }

    async fn ensure_worksheet(&self, title: &str) -> Result<(), RecordError> {
        let mut known = self.worksheets.lock().await;
        if known.contains(title) {
            return Ok(());
        }
        known.extend(self.worksheet_titles().await?);
        if known.contains(title) {
            debug!(worksheet = title, "Found existing worksheet");
            return Ok(());
        }

        info!(worksheet = title, "Creating worksheet");
        let mut url = self.url(&[])?;
        let path = format!("{}:batchUpdate", url.path());
        url.set_path(&path);
        let body = json!({
            "requests": [{
                "addSheet": {
                    "properties": {
                        "title": title,
                        "gridProperties": { "rowCount": 1000, "columnCount": 10 }
                    }
                }
            }]
        });
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .context("Failed to send addSheet request")?;
        check(resp).await?;

        self.append_values(title, json!(HEADERS)).await?;
        known.insert(title.to_string());
        Ok(())
    }

    async fn append_values(
        &self,
        title: &str,
        row: serde_json::Value,
    ) -> Result<String, RecordError> {
        let range = format!("'{}'!A:D", title.replace('\'', "''"));
        let url = self.url(&["values", &format!("{}:append", range)])?;
        let resp = self
            .client
            .post(url)
            .bearer_auth(&self.access_token)
            .query(&[
                ("valueInputOption", "USER_ENTERED"),
                ("insertDataOption", "INSERT_ROWS"),
            ])
            .json(&json!({ "values": [row] }))
            .send()
            .await
            .context("Failed to send values:append request")?;
        let parsed: AppendResponse = check(resp)
            .await?
            .json()
            .await
            .context("Failed to parse values:append response")?;
        Ok(parsed.updates.updated_range)
    }
}

/// Worksheet title for a prefix.
pub fn worksheet_title(prefix: &str) -> String {
    prefix.chars().take(MAX_TITLE_CHARS).collect()
}

/// Client errors other than throttling are permanent.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response, RecordError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    if status.is_client_error() && status != StatusCode::TOO_MANY_REQUESTS {
        Err(RecordError::Rejected(format!("HTTP {}: {}", status.as_u16(), body)))
    } else {
        Err(RecordError::Backend(anyhow!("Sheets API returned HTTP {}", status.as_u16())))
    }
}

#[async_trait]
impl ResultLog for SheetsResultLog {
    async fn append(&self, row: &ResultRow) -> Result<String, RecordError> {
        let title = worksheet_title(&row.prefix);
        self.ensure_worksheet(&title).await?;
        self.append_values(
            &title,
            json!([
                row.serial,
                row.identifier,
                row.recorded_at.to_rfc3339(),
                row.value
            ]),
        )
        .await
    }

    async fn health_check(&self) -> bool {
        match self.worksheet_titles().await {
            Ok(_) => true,
            Err(e) => {
                warn!(error = %e, "Sheets health check failed");
                false
            }
        }
    }
}
