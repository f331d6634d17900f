//! Attribute lookup: identifier in, optional attribute value out.
//!
//! `AttributeLookup` is the raw service seam; `LookupAdapter` adds the
//! per-call timeout and bounded retry the scheduler relies on.

pub mod http;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::LookupSection;
use crate::errors::LookupError;

pub use http::HttpLookupClient;

const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Outcome of one lookup. `succeeded` is false when nothing was found or the
/// service is disabled; neither case is an error.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LookupResult {
    pub value: Option<String>,
    pub succeeded: bool,
}

impl LookupResult {
    pub fn found(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into()),
            succeeded: true,
        }
    }

    pub fn not_found() -> Self {
        Self::default()
    }
}

#[async_trait]
pub trait AttributeLookup: Send + Sync {
    async fn fetch(&self, identifier: &str) -> Result<LookupResult, LookupError>;
}

pub struct LookupAdapter {
    inner: Arc<dyn AttributeLookup>,
    timeout: Duration,
    max_attempts: u32,
    retry_delay: Duration,
}

impl LookupAdapter {
    pub fn new(
        inner: Arc<dyn AttributeLookup>,
        timeout: Duration,
        max_attempts: u32,
        retry_delay: Duration,
    ) -> Self {
        Self {
            inner,
            timeout,
            max_attempts: max_attempts.max(1),
            retry_delay,
        }
    }

    pub fn from_config(inner: Arc<dyn AttributeLookup>, section: &LookupSection) -> Self {
        Self::new(
            inner,
            Duration::from_secs(section.timeout_secs),
            section.max_attempts,
            Duration::from_millis(section.retry_delay_ms),
        )
    }

    /// Fetch with timeout and retry. "Not found" is returned as-is and never
    /// retried; only transport failures and timeouts are.
    pub async fn lookup(&self, identifier: &str) -> Result<LookupResult, LookupError> {
        let identifier = identifier.trim();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = match tokio::time::timeout(self.timeout, self.inner.fetch(identifier)).await {
                Ok(result) => result,
                Err(_) => Err(LookupError::Timeout(self.timeout)),
            };
            match result {
                Ok(found) => {
                    debug!(identifier, attempt, found = found.value.is_some(), "Lookup finished");
                    return Ok(found);
                }
                Err(e) if attempt < self.max_attempts => {
                    let delay = self
                        .retry_delay
                        .saturating_mul(2u32.saturating_pow(attempt - 1))
                        .min(MAX_RETRY_DELAY);
                    warn!(identifier, attempt, ?delay, error = %e, "Lookup failed, retrying");
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

    /// Replays a script of responses, one per call.
    struct ScriptedLookup {
        script: Mutex<Vec<Result<LookupResult, LookupError>>>,
        calls: Mutex<Vec<String>>,
    }

    impl ScriptedLookup {
        fn new(mut script: Vec<Result<LookupResult, LookupError>>) -> Self {
            script.reverse();
            Self {
                script: Mutex::new(script),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AttributeLookup for ScriptedLookup {
        async fn fetch(&self, identifier: &str) -> Result<LookupResult, LookupError> {
            self.calls.lock().unwrap().push(identifier.to_string());
            self.script
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Ok(LookupResult::not_found()))
        }
    }

    struct SlowLookup;

    #[async_trait]
    impl AttributeLookup for SlowLookup {
        async fn fetch(&self, _identifier: &str) -> Result<LookupResult, LookupError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(LookupResult::found("never"))
        }
    }

    fn adapter(inner: Arc<dyn AttributeLookup>) -> LookupAdapter {
        LookupAdapter::new(inner, Duration::from_millis(200), 3, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_found_value_passes_through() {
        let inner = Arc::new(ScriptedLookup::new(vec![Ok(LookupResult::found("9876543210"))]));
        let result = adapter(inner.clone()).lookup(" ABC 00001 ").await.unwrap();
        assert_eq!(result, LookupResult::found("9876543210"));
        assert_eq!(inner.calls.lock().unwrap().as_slice(), ["ABC 00001"]);
    }

    #[tokio::test]
    async fn test_not_found_is_not_retried() {
        let inner = Arc::new(ScriptedLookup::new(vec![Ok(LookupResult::not_found())]));
        let result = adapter(inner.clone()).lookup("ABC 00002").await.unwrap();
        assert!(!result.succeeded);
        assert_eq!(inner.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_transport_error_retried_until_success() {
        let inner = Arc::new(ScriptedLookup::new(vec![
            Err(LookupError::Status { status: 502 }),
            Err(LookupError::Transport(anyhow::anyhow!("reset"))),
            Ok(LookupResult::found("9000000001")),
        ]));
        let result = adapter(inner.clone()).lookup("ABC 00003").await.unwrap();
        assert_eq!(result.value.as_deref(), Some("9000000001"));
        assert_eq!(inner.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let inner = Arc::new(ScriptedLookup::new(vec![
            Err(LookupError::Status { status: 500 }),
            Err(LookupError::Status { status: 500 }),
            Err(LookupError::Status { status: 503 }),
            Ok(LookupResult::found("unreachable")),
        ]));
        let err = adapter(inner.clone()).lookup("ABC 00004").await.unwrap_err();
        assert!(matches!(err, LookupError::Status { status: 503 }));
        assert_eq!(inner.calls.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_slow_service_times_out() {
        let adapter = LookupAdapter::new(
            Arc::new(SlowLookup),
            Duration::from_millis(20),
            1,
            Duration::from_millis(1),
        );
        let err = adapter.lookup("ABC 00005").await.unwrap_err();
        assert!(matches!(err, LookupError::Timeout(_)));
    }
}
