//! HTTP attribute lookup against the service-number search form.
//!
//! The service answers a form POST with an HTML page. The attribute lives in
//! the `Mobile` column of the results table, in the row whose first cell
//! contains the identifier.

use std::sync::LazyLock;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use tracing::{debug, info, warn};

use super::{AttributeLookup, LookupResult};
use crate::config::LookupSection;
use crate::errors::LookupError;

const FORM_PATH: &str = "/knowyourusn";
const DATA_PATH: &str = "/getUkscno";
const NO_MATCH_MARKER: &str = "doesn't matched";
const ATTRIBUTE_COLUMN: &str = "Mobile";
const ATTRIBUTE_DIGITS: usize = 10;

static MAIN_SECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<section[^>]*\bid\s*=\s*"main-container"[^>]*>(.*?)</section>"#).unwrap()
});
static TABLE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<table[^>]*\bclass\s*=\s*"[^"]*\btable\b[^"]*"[^>]*>(.*?)</table>"#)
        .unwrap()
});
static ROW: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<tr[^>]*>(.*?)</tr>").unwrap());
static HEADER_CELL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<th[^>]*>(.*?)</th>").unwrap());
static DATA_CELL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<td[^>]*>(.*?)</td>").unwrap());
static TAG: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

pub struct HttpLookupClient {
    client: reqwest::Client,
    base_url: String,
    enabled: bool,
    timeout: Duration,
}

impl HttpLookupClient {
    pub fn new(section: &LookupSection) -> anyhow::Result<Self> {
        let timeout = Duration::from_secs(section.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36")
            .build()
            .context("Failed to build lookup HTTP client")?;
        Ok(Self {
            client,
            base_url: section.base_url.trim_end_matches('/').to_string(),
            enabled: section.enabled,
            timeout,
        })
    }

    fn form_url(&self) -> String {
        format!("{}{}", self.base_url, FORM_PATH)
    }

    fn data_url(&self) -> String {
        format!("{}{}", self.base_url, DATA_PATH)
    }

    /// True when the search form answers with 200.
    pub async fn health_check(&self) -> bool {
        match self.client.get(self.form_url()).send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(e) => {
                warn!(error = %e, "Lookup health check failed");
                false
            }
        }
    }

    fn map_transport(&self, e: reqwest::Error) -> LookupError {
        if e.is_timeout() {
            LookupError::Timeout(self.timeout)
        } else {
            LookupError::Transport(e.into())
        }
    }
}

#[async_trait]
impl AttributeLookup for HttpLookupClient {
    async fn fetch(&self, identifier: &str) -> Result<LookupResult, LookupError> {
        if !self.enabled {
            debug!(identifier, "Lookup disabled");
            return Ok(LookupResult::not_found());
        }

        let resp = self
            .client
            .post(self.data_url())
            .header("Accept", "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.5")
            .header("Referer", self.form_url())
            .form(&[("ukscno", identifier)])
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(LookupError::Status {
                status: status.as_u16(),
            });
        }
        let body = resp.text().await.map_err(|e| self.map_transport(e))?;

        match extract_attribute(&body, identifier) {
            Some(value) => {
                info!(identifier, "Attribute found");
                Ok(LookupResult::found(value))
            }
            None => {
                debug!(identifier, bytes = body.len(), "No attribute in response");
                Ok(LookupResult::not_found())
            }
        }
    }
}

/// Pull the 10-digit attribute for `identifier` out of a result page.
pub fn extract_attribute(html: &str, identifier: &str) -> Option<String> {
    if cell_text(html).contains(NO_MATCH_MARKER) {
        return None;
    }

    let section = MAIN_SECTION.captures(html)?.get(1)?.as_str();
    let table = TABLE.captures(section)?.get(1)?.as_str();

    let mut rows = ROW.captures_iter(table).filter_map(|c| c.get(1).map(|m| m.as_str()));
    let header_row = rows.next()?;
    let column = HEADER_CELL
        .captures_iter(header_row)
        .filter_map(|c| c.get(1).map(|m| cell_text(m.as_str())))
        .position(|h| h == ATTRIBUTE_COLUMN)?;

    for row in rows {
        let cells: Vec<String> = DATA_CELL
            .captures_iter(row)
            .filter_map(|c| c.get(1).map(|m| cell_text(m.as_str())))
            .collect();
        let Some(first) = cells.first() else {
            continue;
        };
        if !first.contains(identifier) {
            continue;
        }
        if let Some(raw) = cells.get(column) {
            let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
            if digits.len() == ATTRIBUTE_DIGITS {
                return Some(digits);
            }
        }
    }
    None
}

fn cell_text(fragment: &str) -> String {
    let stripped = TAG.replace_all(fragment, "");
    stripped
        .replace("&nbsp;", " ")
        .replace("&#39;", "'")
        .replace("&apos;", "'")
        .replace("&quot;", "\"")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
        .trim()
        .to_string()
}
