//! Shared helpers for unit tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

use crate::allocator::{RetryPolicy, SerialAllocator};
use crate::engine::item::ItemPipeline;
use crate::errors::{LookupError, RecordError};
use crate::lookup::{AttributeLookup, LookupAdapter, LookupResult};
use crate::recorder::{ResultLog, ResultRecorder, ResultRow};
use crate::store::{PrefixDefaults, PrefixStore, SqliteStore};

/// A request seen by [`CannedServer`].
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: Method,
    /// Path and query.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: String,
}

impl CapturedRequest {
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
    }
}

#[derive(Clone, Default)]
struct CannedState {
    responses: Arc<Mutex<VecDeque<(StatusCode, String)>>>,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

/// Local HTTP server answering every request with the next canned
/// `(status, json body)` pair, in order. Requests past the script get 501.
pub struct CannedServer {
    pub base_url: String,
    state: CannedState,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl CannedServer {
    pub async fn start(responses: Vec<(StatusCode, String)>) -> Self {
        let state = CannedState::default();
        state.responses.lock().unwrap().extend(responses);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(answer).with_state(state.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            base_url: format!("http://{}", addr),
            state,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.state.requests.lock().unwrap().clone()
    }
}

impl Drop for CannedServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn answer(
    State(state): State<CannedState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: String,
) -> Response {
    state.requests.lock().unwrap().push(CapturedRequest {
        method,
        uri: uri.path_and_query().map(|pq| pq.to_string()).unwrap_or_default(),
        headers,
        body,
    });
    let next = state.responses.lock().unwrap().pop_front();
    match next {
        Some((status, body)) => {
            (status, [(header::CONTENT_TYPE, "application/json")], body).into_response()
        }
        None => StatusCode::NOT_IMPLEMENTED.into_response(),
    }
}

/// Lookup double answering every identifier the same way.
pub struct StaticLookup {
    value: Option<String>,
    fail: bool,
    pub calls: Mutex<Vec<String>>,
}

impl StaticLookup {
    pub fn found(value: &str) -> Self {
        Self {
            value: Some(value.to_string()),
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn empty() -> Self {
        Self {
            value: None,
            fail: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            value: None,
            fail: true,
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AttributeLookup for StaticLookup {
    async fn fetch(&self, identifier: &str) -> Result<LookupResult, LookupError> {
        self.calls.lock().unwrap().push(identifier.to_string());
        if self.fail {
            return Err(LookupError::Status { status: 500 });
        }
        Ok(match &self.value {
            Some(v) => LookupResult::found(v.clone()),
            None => LookupResult::not_found(),
        })
    }
}

/// Result log double keeping rows in memory.
#[derive(Default)]
pub struct MemoryLog {
    pub rows: Mutex<Vec<ResultRow>>,
}

#[async_trait]
impl ResultLog for MemoryLog {
    async fn append(&self, row: &ResultRow) -> Result<String, RecordError> {
        let mut rows = self.rows.lock().unwrap();
        rows.push(row.clone());
        Ok(format!("{}!A{}:D{}", row.prefix, rows.len() + 1, rows.len() + 1))
    }

    async fn health_check(&self) -> bool {
        true
    }
}

pub fn memory_store() -> Arc<SqliteStore> {
    Arc::new(SqliteStore::in_memory(PrefixDefaults::default()).unwrap())
}

/// Pipeline with millisecond retry delays and a single allocation attempt.
pub fn pipeline(
    store: Arc<dyn PrefixStore>,
    audit: Arc<SqliteStore>,
    lookup: Arc<dyn AttributeLookup>,
    log: Arc<dyn ResultLog>,
) -> ItemPipeline {
    let policy = RetryPolicy {
        max_attempts: 1,
        base: Duration::from_millis(1),
        cap: Duration::from_millis(1),
    };
    ItemPipeline::new(
        SerialAllocator::new(store, policy, Duration::from_secs(5)),
        LookupAdapter::new(lookup, Duration::from_secs(5), 1, Duration::from_millis(1)),
        ResultRecorder::new(log, Duration::from_secs(5), 1, Duration::from_millis(1)),
        audit,
        Duration::from_secs(5),
    )
}
