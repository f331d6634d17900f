//! Operator-facing prefix administration.

use serde::Serialize;
use tracing::info;

use super::Engine;
use super::resume::DatabaseSummary;
use crate::allocator;
use crate::audit::SerialLogEntry;
use crate::errors::EngineError;
use crate::store::models::max_serial;
use crate::store::{PrefixFields, PrefixRecord, PrefixStatus};

/// Settings for creating or reconfiguring a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PrefixSettings {
    pub digits: u32,
    pub has_space: bool,
    /// Stored as `last_number`; the next serial is `starting_number + 1`.
    pub starting_number: u64,
}

impl Engine {
    /// Create or reconfigure a prefix.
    ///
    /// New prefixes start as not started. An existing prefix keeps its status
    /// unless the new range changes whether it is exhausted. The prefix the
    /// running scheduler is driving is refused.
    pub async fn configure_prefix(
        &self,
        prefix: &str,
        settings: PrefixSettings,
    ) -> Result<PrefixRecord, EngineError> {
        let prefix = allocator::validate(prefix, Some(settings.digits))?;
        let max = max_serial(settings.digits);
        if settings.starting_number > max {
            return Err(EngineError::InvalidStartingNumber {
                prefix,
                starting_number: settings.starting_number,
                max,
            });
        }
        let busy = self.inner.state.current_prefix().as_deref() == Some(prefix.as_str());
        if busy && self.is_running() {
            return Err(EngineError::PrefixBusy { prefix });
        }

        let exhausted = settings.starting_number >= max;
        let existing = self.bounded(self.inner.store.get(&prefix)).await?;
        let status = match (existing.map(|r| r.status), exhausted) {
            (_, true) => PrefixStatus::Completed,
            (None, false) => PrefixStatus::NotStarted,
            (Some(PrefixStatus::Completed), false) => PrefixStatus::Pending,
            (Some(current), false) => current,
        };

        let fields = PrefixFields {
            digits: Some(settings.digits),
            last_number: Some(settings.starting_number),
            has_space: Some(settings.has_space),
            status: Some(status),
            remarks: Some(format!("Configured to start at {}", settings.starting_number + 1)),
        };
        let record = self.bounded(self.inner.store.upsert(&prefix, fields)).await?;
        info!(
            prefix = %record.prefix,
            digits = record.digits,
            next = record.last_number + 1,
            status = %record.status,
            "Configured prefix"
        );
        Ok(record)
    }

    pub async fn prefix(&self, prefix: &str) -> Result<Option<PrefixRecord>, EngineError> {
        let prefix = allocator::validate(prefix, None)?;
        self.bounded(self.inner.store.get(&prefix)).await
    }

    /// Operator status change. Moving back to not started is refused, and a
    /// prefix may only be completed once exhausted.
    pub async fn set_prefix_status(
        &self,
        prefix: &str,
        status: PrefixStatus,
    ) -> Result<PrefixRecord, EngineError> {
        let prefix = allocator::validate(prefix, None)?;
        let record = self
            .bounded(self.inner.store.get(&prefix))
            .await?
            .ok_or_else(|| EngineError::PrefixNotFound {
                prefix: prefix.clone(),
            })?;

        let allowed = match status {
            PrefixStatus::NotStarted => record.status == PrefixStatus::NotStarted,
            PrefixStatus::Pending => !record.is_exhausted(),
            PrefixStatus::Completed => record.is_exhausted(),
        };
        if !allowed {
            return Err(EngineError::InvalidTransition {
                prefix,
                from: record.status,
                to: status,
            });
        }

        let fields = PrefixFields {
            status: Some(status),
            remarks: Some(format!("Status set to {}", status)),
            ..PrefixFields::default()
        };
        self.bounded(self.inner.store.upsert(&prefix, fields)).await
    }

    /// Start a new cycle for every completed prefix.
    pub async fn reset_completed(&self) -> Result<Vec<String>, EngineError> {
        let reset = self.bounded(self.inner.store.reset_completed()).await?;
        info!(count = reset.len(), "Reset completed prefixes to pending");
        Ok(reset)
    }

    pub async fn database_summary(&self) -> Result<DatabaseSummary, EngineError> {
        self.inner.resume.database_summary().await
    }

    /// Newest serial log entries for a prefix.
    pub async fn recent_log(
        &self,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<SerialLogEntry>, EngineError> {
        let prefix = allocator::validate(prefix, None)?;
        self.bounded(self.inner.audit.recent(&prefix, limit)).await
    }
}
