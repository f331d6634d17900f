//! Persistent prefix store.
//!
//! The store is the single source of truth for `last_number` and `status`.
//! The engine never keeps an authoritative in-memory copy; every resume
//! re-reads it through this trait.

pub mod models;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;

pub use models::{PrefixFields, PrefixRecord, PrefixStatus};
pub use sqlite::{PrefixDb, SqliteStore};

/// Values applied when a prefix row is created without explicit settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefixDefaults {
    pub digits: u32,
    pub has_space: bool,
}

impl Default for PrefixDefaults {
    fn default() -> Self {
        Self {
            digits: 5,
            has_space: true,
        }
    }
}

/// Row-per-prefix store consumed by the allocator, scheduler and resume logic.
///
/// Every read path returns normalized statuses: legacy values surface as
/// `PrefixStatus::Pending`.
#[async_trait]
pub trait PrefixStore: Send + Sync {
    async fn get(&self, prefix: &str) -> Result<Option<PrefixRecord>>;

    /// Create or partially update a row. Missing fields keep their stored
    /// value (or the creation default for a new row). A request to move a
    /// row that already left `NotStarted` back to `NotStarted` is ignored.
    async fn upsert(&self, prefix: &str, fields: PrefixFields) -> Result<PrefixRecord>;

    /// Rows with the given status in insertion order.
    async fn list(&self, status: PrefixStatus) -> Result<Vec<PrefixRecord>>;

    async fn list_all(&self) -> Result<Vec<PrefixRecord>>;

    /// Single round-trip increment-and-return. Creates the row with
    /// `last_number = 1` and status `Pending` when it does not exist.
    async fn atomic_increment(
        &self,
        prefix: &str,
        digits: Option<u32>,
        has_space: Option<bool>,
    ) -> Result<PrefixRecord>;

    /// Apply `fields` only if the stored `last_number` still equals
    /// `expected_last_number`. Returns `None` when the row changed underneath.
    async fn compare_and_update(
        &self,
        prefix: &str,
        expected_last_number: u64,
        fields: PrefixFields,
    ) -> Result<Option<PrefixRecord>>;

    /// Conditional status flip. Returns `true` when this call made the change.
    async fn transition_status(
        &self,
        prefix: &str,
        from: PrefixStatus,
        to: PrefixStatus,
    ) -> Result<bool>;

    /// Put a row that has not completed back to `Pending` with a
    /// `Stopped at N` remark, in one guarded write. Returns `None` when the
    /// row is missing or already completed.
    async fn release(&self, prefix: &str) -> Result<Option<PrefixRecord>>;

    /// Rewrite legacy status values to `pending`. Returns the migrated prefixes.
    async fn migrate_legacy_statuses(&self) -> Result<Vec<String>>;

    /// Start a new cycle for every completed prefix: status `pending`,
    /// `last_number` back to zero. Returns the affected prefixes.
    async fn reset_completed(&self) -> Result<Vec<String>>;
}
