//! Boot-time reconciliation of store state.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use crate::errors::EngineError;
use crate::store::{PrefixRecord, PrefixStatus, PrefixStore};

/// Work found by [`ResumeCoordinator::reconcile`], prefixes in store order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ResumeSummary {
    pub pending_to_process: Vec<String>,
    pub not_started_to_process: Vec<String>,
    pub completed: Vec<String>,
    pub total_to_automate: usize,
}

impl ResumeSummary {
    pub fn has_work(&self) -> bool {
        self.total_to_automate > 0
    }
}

/// Store-wide counts plus every row, for status reporting.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DatabaseSummary {
    pub total_prefixes: usize,
    pub by_status: BTreeMap<String, usize>,
    pub prefixes: Vec<PrefixRecord>,
}

pub struct ResumeCoordinator {
    store: Arc<dyn PrefixStore>,
    store_timeout: Duration,
}

impl ResumeCoordinator {
    pub fn new(store: Arc<dyn PrefixStore>, store_timeout: Duration) -> Self {
        Self {
            store,
            store_timeout,
        }
    }

    /// Migrate legacy statuses and partition every prefix by status.
    ///
    /// Only legacy rows are written. Safe to call repeatedly and while the
    /// scheduler runs.
    pub async fn reconcile(&self) -> Result<ResumeSummary, EngineError> {
        let migrated = self.bounded(self.store.migrate_legacy_statuses()).await?;
        if !migrated.is_empty() {
            info!(count = migrated.len(), prefixes = ?migrated, "Migrated legacy statuses to pending");
        }

        let records = self.bounded(self.store.list_all()).await?;
        let mut summary = ResumeSummary::default();
        for record in records {
            match record.status {
                PrefixStatus::Pending => summary.pending_to_process.push(record.prefix),
                PrefixStatus::NotStarted => summary.not_started_to_process.push(record.prefix),
                PrefixStatus::Completed => summary.completed.push(record.prefix),
            }
        }
        summary.total_to_automate =
            summary.pending_to_process.len() + summary.not_started_to_process.len();

        info!(
            pending = summary.pending_to_process.len(),
            not_started = summary.not_started_to_process.len(),
            completed = summary.completed.len(),
            "Reconciled prefix store"
        );
        Ok(summary)
    }

    pub async fn database_summary(&self) -> Result<DatabaseSummary, EngineError> {
        let prefixes = self.bounded(self.store.list_all()).await?;
        let mut by_status: BTreeMap<String, usize> = PrefixStatus::all()
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for record in &prefixes {
            *by_status.entry(record.status.as_str().to_string()).or_default() += 1;
        }
        Ok(DatabaseSummary {
            total_prefixes: prefixes.len(),
            by_status,
            prefixes,
        })
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, EngineError> {
        tokio::time::timeout(self.store_timeout, fut)
            .await
            .map_err(|_| EngineError::StoreTimeout(self.store_timeout))?
            .map_err(EngineError::Store)
    }
}
