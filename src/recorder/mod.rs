//! Result recorder: persists positive findings to an external log.
//!
//! Only rows with a real attribute value are written. A blank or `N/A` value
//! yields a skip sentinel instead, so replaying an item after a crash is
//! harmless for the log.

pub mod file;
pub mod sheets;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{RecorderBackend, RecorderSection};
use crate::errors::RecordError;

pub use file::FileResultLog;
pub use sheets::SheetsResultLog;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// One row written to a result log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultRow {
    pub prefix: String,
    pub serial: u64,
    pub identifier: String,
    pub value: String,
    pub recorded_at: DateTime<Utc>,
}

#[async_trait]
pub trait ResultLog: Send + Sync {
    /// Durably append a row and return where it landed.
    async fn append(&self, row: &ResultRow) -> Result<String, RecordError>;

    async fn health_check(&self) -> bool;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded { location: String },
    Skipped { sentinel: String },
}

impl RecordOutcome {
    pub fn location(&self) -> &str {
        match self {
            Self::Recorded { location } => location,
            Self::Skipped { sentinel } => sentinel,
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }
}

/// Values that carry no finding.
pub fn is_blank_value(value: Option<&str>) -> bool {
    match value.map(str::trim) {
        None | Some("") | Some("N/A") => true,
        Some(_) => false,
    }
}

pub fn skipped_sentinel(prefix: &str, serial: u64) -> String {
    format!("SKIPPED_{}_{}", prefix, serial)
}

pub struct ResultRecorder {
    log: Arc<dyn ResultLog>,
    timeout: Duration,
    max_attempts: u32,
    retry_delay: Duration,
}

impl ResultRecorder {
    pub fn new(
        log: Arc<dyn ResultLog>,
        timeout: Duration,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            log,
            timeout,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(log: Arc<dyn ResultLog>, section: &RecorderSection) -> Self {
        Self::new(
            log,
            Duration::from_secs(section.timeout_secs),
            section.max_attempts,
            Duration::from_millis(section.retry_delay_ms),
        )
    }

    /// Build the configured backend.
    pub fn log_from_config(section: &RecorderSection) -> anyhow::Result<Arc<dyn ResultLog>> {
        Ok(match section.backend {
            RecorderBackend::File => Arc::new(FileResultLog::new(&section.path)),
            RecorderBackend::Sheets => Arc::new(SheetsResultLog::from_config(section)?),
        })
    }

    pub async fn record(
        &self,
        prefix: &str,
        serial: u64,
        identifier: &str,
        value: Option<&str>,
    ) -> Result<RecordOutcome, RecordError> {
        let value = match value.map(str::trim) {
            Some(v) if !is_blank_value(Some(v)) => v,
            _ => {
                info!(identifier, "No value, skipping result log");
                return Ok(RecordOutcome::Skipped {
                    sentinel: skipped_sentinel(prefix, serial),
                });
            }
        };

        let row = ResultRow {
            prefix: prefix.to_string(),
            serial,
            identifier: identifier.to_string(),
            value: value.to_string(),
            recorded_at: Utc::now(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, self.log.append(&row)).await {
                Ok(result) => result,
                Err(_) => Err(RecordError::Timeout(self.timeout)),
            };
            match result {
                Ok(location) => {
                    info!(identifier, location = %location, "Recorded result");
                    return Ok(RecordOutcome::Recorded { location });
                }
                Err(RecordError::Rejected(reason)) => return Err(RecordError::Rejected(reason)),
                Err(e) if attempt < self.max_attempts => {
                    let delay = self
                        .retry_delay
                        .saturating_mul(2u32.saturating_pow(attempt - 1))
                        .min(MAX_RETRY_DELAY);
                    warn!(identifier, attempt, ?delay, error = %e, "Recording failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryLog {
        rows: Mutex<Vec<ResultRow>>,
        failures: Mutex<Vec<RecordError>>,
    }

    #[async_trait]
    impl ResultLog for MemoryLog {
        async fn append(&self, row: &ResultRow) -> Result<String, RecordError> {
            if let Some(err) = self.failures.lock().unwrap().pop() {
                return Err(err);
            }
            let mut rows = self.rows.lock().unwrap();
            rows.push(row.clone());
            Ok(format!("{}!A{}:D{}", row.prefix, rows.len() + 1, rows.len() + 1))
        }

        async fn health_check(&self) -> bool {
            true
        }
    }

    fn recorder(log: Arc<MemoryLog>) -> ResultRecorder {
        ResultRecorder::new(log, Duration::from_secs(1), 3, Duration::from_millis(1))
    }

    #[test]
    fn test_blank_values() {
        assert!(is_blank_value(None));
        assert!(is_blank_value(Some("  ")));
        assert!(is_blank_value(Some("N/A")));
        assert!(!is_blank_value(Some("9876543210")));
    }

    #[tokio::test]
    async fn test_skip_rule_returns_sentinel_without_writing() {
        let log = Arc::new(MemoryLog::default());
        let outcome = recorder(log.clone())
            .record("ABC", 7, "ABC 00007", Some("N/A"))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RecordOutcome::Skipped {
                sentinel: "SKIPPED_ABC_7".to_string()
            }
        );
        assert!(log.rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_records_trimmed_value() {
        let log = Arc::new(MemoryLog::default());
        let outcome = recorder(log.clone())
            .record("ABC", 1, "ABC 00001", Some(" 9876543210 "))
            .await
            .unwrap();
        assert_eq!(outcome.location(), "ABC!A2:D2");
        assert!(!outcome.is_skipped());
        assert_eq!(log.rows.lock().unwrap()[0].value, "9876543210");
    }

    #[tokio::test]
    async fn test_backend_errors_are_retried() {
        let log = Arc::new(MemoryLog::default());
        log.failures
            .lock()
            .unwrap()
            .push(RecordError::Backend(anyhow::anyhow!("quota")));
        let outcome = recorder(log.clone())
            .record("ABC", 2, "ABC 00002", Some("9876543210"))
            .await
            .unwrap();
        assert!(matches!(outcome, RecordOutcome::Recorded { .. }));
        assert_eq!(log.rows.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejection_is_not_retried() {
        let log = Arc::new(MemoryLog::default());
        {
            let mut failures = log.failures.lock().unwrap();
            failures.push(RecordError::Backend(anyhow::anyhow!("never reached")));
            failures.push(RecordError::Rejected("bad range".into()));
        }
        let err = recorder(log.clone())
            .record("ABC", 3, "ABC 00003", Some("9876543210"))
            .await
            .unwrap_err();
        assert!(matches!(err, RecordError::Rejected(_)));
        assert_eq!(log.failures.lock().unwrap().len(), 1);
    }
}
