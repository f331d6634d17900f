//! Prefix scheduler: pick one prefix, drive it to completion, repeat.
//!
//! One scheduler runs as one task. Items for a prefix are processed by
//! sequential awaits, so serials are allocated strictly in order and never
//! in parallel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::item::ItemPipeline;
use super::state::EngineState;
use crate::errors::EngineError;
use crate::store::{PrefixFields, PrefixRecord, PrefixStatus, PrefixStore};

/// Why the scheduler let go of a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixExit {
    /// Reached its digit ceiling and was marked completed.
    Completed,
    /// The engine was stopped; the prefix stays pending.
    Stopped,
    /// Consecutive-error threshold reached; the prefix stays pending.
    Abandoned,
    /// Deleted or taken out of rotation by someone else.
    Released,
}

enum Step {
    Continue,
    Exhausted,
    Released,
}

pub struct Scheduler {
    store: Arc<dyn PrefixStore>,
    pipeline: Arc<ItemPipeline>,
    state: Arc<EngineState>,
    interval: Duration,
    max_consecutive_errors: u32,
    store_timeout: Duration,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn PrefixStore>,
        pipeline: Arc<ItemPipeline>,
        state: Arc<EngineState>,
        interval: Duration,
        max_consecutive_errors: u32,
        store_timeout: Duration,
    ) -> Self {
        Self {
            store,
            pipeline,
            state,
            interval,
            max_consecutive_errors: max_consecutive_errors.max(1),
            store_timeout,
        }
    }

    /// First pending prefix; otherwise claim the first not-started one.
    ///
    /// A claim is a conditional status flip, so a prefix claimed by someone
    /// else in between is skipped for the next candidate.
    pub async fn next_prefix(&self) -> Result<Option<PrefixRecord>, EngineError> {
        let pending = self.bounded(self.store.list(PrefixStatus::Pending)).await?;
        if let Some(record) = pending.into_iter().next() {
            return Ok(Some(record));
        }

        let candidates = self.bounded(self.store.list(PrefixStatus::NotStarted)).await?;
        for mut candidate in candidates {
            let claimed = self
                .bounded(self.store.transition_status(
                    &candidate.prefix,
                    PrefixStatus::NotStarted,
                    PrefixStatus::Pending,
                ))
                .await?;
            if claimed {
                info!(prefix = %candidate.prefix, "Claimed prefix");
                candidate.status = PrefixStatus::Pending;
                return Ok(Some(candidate));
            }
            debug!(prefix = %candidate.prefix, "Claim lost, trying next prefix");
        }
        Ok(None)
    }

    /// Main loop. Returns once the running flag is cleared.
    pub async fn run(self) {
        info!(interval = ?self.interval, "Scheduler started");
        while self.state.is_running() {
            match self.next_prefix().await {
                Ok(Some(record)) => {
                    let exit = self.drive_prefix(&record.prefix).await;
                    info!(prefix = %record.prefix, ?exit, "Released prefix");
                    if exit == PrefixExit::Abandoned && !self.state.pause(self.interval).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!("No prefixes to process");
                    if !self.state.pause(self.interval).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(error = %e, "Failed to pick next prefix");
                    self.state.record_error();
                    if !self.state.pause(self.interval).await {
                        break;
                    }
                }
            }
        }
        self.state.set_current_prefix(None);
        info!("Scheduler stopped");
    }

    /// Process `prefix` one serial per interval until it completes, the
    /// engine stops, or the consecutive-error threshold is hit.
    pub async fn drive_prefix(&self, prefix: &str) -> PrefixExit {
        self.state.set_current_prefix(Some(prefix.to_string()));
        let mut consecutive_errors = 0u32;

        let exit = loop {
            if !self.state.is_running() {
                break PrefixExit::Stopped;
            }
            match self.step(prefix).await {
                Ok(Step::Continue) => consecutive_errors = 0,
                Ok(Step::Exhausted) => break PrefixExit::Completed,
                Ok(Step::Released) => break PrefixExit::Released,
                Err(e) => {
                    consecutive_errors += 1;
                    self.state.record_error();
                    warn!(prefix, consecutive_errors, error = %e, "Item failed");
                    if e.is_validation() || consecutive_errors >= self.max_consecutive_errors {
                        error!(prefix, consecutive_errors, "Abandoning prefix for this run");
                        break PrefixExit::Abandoned;
                    }
                }
            }
            if !self.state.pause(self.interval).await {
                break PrefixExit::Stopped;
            }
        };

        self.state.set_current_prefix(None);
        exit
    }

    async fn step(&self, prefix: &str) -> Result<Step, EngineError> {
        let Some(record) = self.bounded(self.store.get(prefix)).await? else {
            warn!(prefix, "Prefix disappeared from store");
            return Ok(Step::Released);
        };
        if record.status != PrefixStatus::Pending {
            info!(prefix, status = %record.status, "Prefix changed status externally");
            return Ok(Step::Released);
        }
        if record.is_exhausted() {
            self.mark_completed(&record.prefix, record.last_number).await?;
            return Ok(Step::Exhausted);
        }

        let report = self.pipeline.run(prefix, None, None, false).await?;
        self.state.record_generated(report.value.is_some());
        if report.exhausted {
            self.mark_completed(&report.prefix, report.serial).await?;
            return Ok(Step::Exhausted);
        }
        Ok(Step::Continue)
    }

    async fn mark_completed(&self, prefix: &str, last_number: u64) -> Result<(), EngineError> {
        let fields = PrefixFields {
            status: Some(PrefixStatus::Completed),
            remarks: Some(format!("Completed at {}", last_number)),
            ..PrefixFields::default()
        };
        self.bounded(self.store.upsert(prefix, fields)).await?;
        info!(prefix, last_number, "Prefix completed");
        Ok(())
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::{AuditSink, LogOutcome};
    use crate::store::SqliteStore;
    use crate::test_support::{MemoryLog, StaticLookup, memory_store, pipeline};
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Fixture {
        store: Arc<SqliteStore>,
        lookup: Arc<StaticLookup>,
        log: Arc<MemoryLog>,
        state: Arc<EngineState>,
        scheduler: Scheduler,
    }

    fn fixture_with(store: Arc<SqliteStore>, lookup: StaticLookup) -> Fixture {
        let lookup = Arc::new(lookup);
        let log = Arc::new(MemoryLog::default());
        let state = Arc::new(EngineState::new());
        state.try_begin();
        let pipeline = Arc::new(pipeline(store.clone(), store.clone(), lookup.clone(), log.clone()));
        let scheduler = Scheduler::new(
            store.clone(),
            pipeline,
            state.clone(),
            Duration::from_millis(1),
            10,
            Duration::from_secs(5),
        );
        Fixture {
            store,
            lookup,
            log,
            state,
            scheduler,
        }
    }

    fn fixture(lookup: StaticLookup) -> Fixture {
        fixture_with(memory_store(), lookup)
    }

    async fn add(store: &SqliteStore, prefix: &str, digits: u32, last: u64, status: PrefixStatus) {
        store
            .upsert(
                prefix,
                PrefixFields {
                    digits: Some(digits),
                    last_number: Some(last),
                    has_space: Some(true),
                    status: Some(status),
                    remarks: None,
                },
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_pending_prefix_wins_over_not_started() -> Result<()> {
        let f = fixture(StaticLookup::empty());
        add(&f.store, "NS1", 3, 0, PrefixStatus::NotStarted).await;
        add(&f.store, "PEND", 3, 4, PrefixStatus::Pending).await;
        add(&f.store, "NS2", 3, 0, PrefixStatus::NotStarted).await;

        for _ in 0..3 {
            let next = f.scheduler.next_prefix().await?.unwrap();
            assert_eq!(next.prefix, "PEND");
        }
        assert_eq!(f.store.get("NS1").await?.unwrap().status, PrefixStatus::NotStarted);
        Ok(())
    }

    #[tokio::test]
    async fn test_claim_on_read_is_sticky() -> Result<()> {
        let f = fixture(StaticLookup::empty());
        add(&f.store, "ONLY", 3, 0, PrefixStatus::NotStarted).await;

        let first = f.scheduler.next_prefix().await?.unwrap();
        assert_eq!(first.prefix, "ONLY");
        assert_eq!(first.status, PrefixStatus::Pending);
        assert_eq!(f.store.get("ONLY").await?.unwrap().status, PrefixStatus::Pending);

        let second = f.scheduler.next_prefix().await?.unwrap();
        assert_eq!(second.prefix, "ONLY");
        Ok(())
    }

    #[tokio::test]
    async fn test_claims_prefix_written_in_upper_case() -> Result<()> {
        let f = fixture(StaticLookup::empty());
        add(&f.store, "EXT", 3, 0, PrefixStatus::NotStarted).await;
        f.store.lock_sync()?.set_raw_status("EXT", "NOT_STARTED")?;

        let next = f.scheduler.next_prefix().await?.unwrap();
        assert_eq!(next.prefix, "EXT");
        assert_eq!(f.store.get("EXT").await?.unwrap().status, PrefixStatus::Pending);
        Ok(())
    }

    #[tokio::test]
    async fn test_no_work_returns_none() -> Result<()> {
        let f = fixture(StaticLookup::empty());
        add(&f.store, "DONE", 1, 9, PrefixStatus::Completed).await;
        assert!(f.scheduler.next_prefix().await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_drive_to_completion_in_order() -> Result<()> {
        let f = fixture(StaticLookup::found("9876543210"));
        add(&f.store, "D", 1, 0, PrefixStatus::Pending).await;

        assert_eq!(f.scheduler.drive_prefix("D").await, PrefixExit::Completed);

        let record = f.store.get("D").await?.unwrap();
        assert_eq!(record.last_number, 9);
        assert_eq!(record.status, PrefixStatus::Completed);

        let expected: Vec<String> = (1..=9).map(|n| format!("D {}", n)).collect();
        assert_eq!(f.lookup.identifiers(), expected);
        assert_eq!(f.log.rows.lock().unwrap().len(), 9);

        let stats = f.state.snapshot();
        assert_eq!(stats.total_generated, 9);
        assert_eq!(stats.total_found, 9);
        assert_eq!(stats.current_prefix, None);
        Ok(())
    }

    #[tokio::test]
    async fn test_completed_exactly_at_ceiling() -> Result<()> {
        let f = fixture(StaticLookup::empty());
        add(&f.store, "ABCD", 4, 9997, PrefixStatus::Pending).await;

        assert_eq!(f.scheduler.drive_prefix("ABCD").await, PrefixExit::Completed);
        assert_eq!(f.lookup.identifiers(), ["ABCD 9998", "ABCD 9999"]);
        let record = f.store.get("ABCD").await?.unwrap();
        assert_eq!(record.last_number, 9999);
        assert_eq!(record.status, PrefixStatus::Completed);
        Ok(())
    }

    #[tokio::test]
    async fn test_exhausted_pending_prefix_is_completed_without_allocating() -> Result<()> {
        let f = fixture(StaticLookup::empty());
        add(&f.store, "FULL", 2, 99, PrefixStatus::Pending).await;
        assert_eq!(f.scheduler.drive_prefix("FULL").await, PrefixExit::Completed);
        assert!(f.lookup.identifiers().is_empty());
        assert_eq!(f.store.get("FULL").await?.unwrap().last_number, 99);
        Ok(())
    }

    #[tokio::test]
    async fn test_lookup_failure_is_advisory() -> Result<()> {
        let f = fixture(StaticLookup::failing());
        add(&f.store, "LF", 1, 7, PrefixStatus::Pending).await;

        assert_eq!(f.scheduler.drive_prefix("LF").await, PrefixExit::Completed);
        assert_eq!(f.state.snapshot().errors, 0);
        assert!(f.log.rows.lock().unwrap().is_empty());

        let entries = f.store.recent("LF", 10).await?;
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.outcome == LogOutcome::Error));
        Ok(())
    }

    #[tokio::test]
    async fn test_stop_between_items_leaves_pending() -> Result<()> {
        let f = fixture(StaticLookup::empty());
        add(&f.store, "STOP", 5, 0, PrefixStatus::Pending).await;

        let scheduler = Arc::new(f.scheduler);
        let driver = {
            let scheduler = scheduler.clone();
            tokio::spawn(async move { scheduler.drive_prefix("STOP").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.state.request_stop();
        let exit = tokio::time::timeout(Duration::from_secs(5), driver).await??;
        assert_eq!(exit, PrefixExit::Stopped);

        let record = f.store.get("STOP").await?.unwrap();
        assert_eq!(record.status, PrefixStatus::Pending);
        // Every allocated serial was fully processed.
        assert_eq!(record.last_number as usize, f.lookup.identifiers().len());
        assert_eq!(f.store.recent("STOP", 1000).await?.len(), record.last_number as usize);
        Ok(())
    }

    #[tokio::test]
    async fn test_released_when_status_changes_externally() -> Result<()> {
        let f = fixture(StaticLookup::empty());
        add(&f.store, "EXT", 5, 0, PrefixStatus::Completed).await;
        assert_eq!(f.scheduler.drive_prefix("EXT").await, PrefixExit::Released);
        assert_eq!(f.scheduler.drive_prefix("MISSING").await, PrefixExit::Released);
        Ok(())
    }

    /// Reads work; every write path that allocates fails.
    struct NoIncrementStore {
        inner: Arc<SqliteStore>,
        increments: AtomicU32,
    }

    #[async_trait]
    impl PrefixStore for NoIncrementStore {
        async fn get(&self, prefix: &str) -> Result<Option<PrefixRecord>> {
            self.inner.get(prefix).await
        }
        async fn upsert(&self, prefix: &str, fields: PrefixFields) -> Result<PrefixRecord> {
            self.inner.upsert(prefix, fields).await
        }
        async fn list(&self, status: PrefixStatus) -> Result<Vec<PrefixRecord>> {
            self.inner.list(status).await
        }
        async fn list_all(&self) -> Result<Vec<PrefixRecord>> {
            self.inner.list_all().await
        }
        async fn atomic_increment(
            &self,
            _prefix: &str,
            _digits: Option<u32>,
            _has_space: Option<bool>,
        ) -> Result<PrefixRecord> {
            self.increments.fetch_add(1, Ordering::SeqCst);
            anyhow::bail!("increment unavailable")
        }
        async fn compare_and_update(
            &self,
            _prefix: &str,
            _expected_last_number: u64,
            _fields: PrefixFields,
        ) -> Result<Option<PrefixRecord>> {
            anyhow::bail!("update unavailable")
        }
        async fn transition_status(
            &self,
            prefix: &str,
            from: PrefixStatus,
            to: PrefixStatus,
        ) -> Result<bool> {
            self.inner.transition_status(prefix, from, to).await
        }
        async fn release(&self, prefix: &str) -> Result<Option<PrefixRecord>> {
            self.inner.release(prefix).await
        }
        async fn migrate_legacy_statuses(&self) -> Result<Vec<String>> {
            self.inner.migrate_legacy_statuses().await
        }
        async fn reset_completed(&self) -> Result<Vec<String>> {
            self.inner.reset_completed().await
        }
    }

    #[tokio::test]
    async fn test_ten_consecutive_failures_abandon_prefix() -> Result<()> {
        let sqlite = memory_store();
        add(&sqlite, "BAD", 5, 3, PrefixStatus::Pending).await;
        let store = Arc::new(NoIncrementStore {
            inner: sqlite.clone(),
            increments: AtomicU32::new(0),
        });
        let state = Arc::new(EngineState::new());
        state.try_begin();
        let lookup = Arc::new(StaticLookup::empty());
        let pipeline = Arc::new(pipeline(
            store.clone(),
            sqlite.clone(),
            lookup,
            Arc::new(MemoryLog::default()),
        ));
        let scheduler = Scheduler::new(
            store.clone(),
            pipeline,
            state.clone(),
            Duration::from_millis(1),
            10,
            Duration::from_secs(5),
        );

        assert_eq!(scheduler.drive_prefix("BAD").await, PrefixExit::Abandoned);
        assert_eq!(store.increments.load(Ordering::SeqCst), 10);
        assert_eq!(state.snapshot().errors, 10);

        let record = sqlite.get("BAD").await?.unwrap();
        assert_eq!(record.status, PrefixStatus::Pending);
        assert_eq!(record.last_number, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_run_moves_through_prefixes_in_order() -> Result<()> {
        let f = fixture(StaticLookup::empty());
        add(&f.store, "A", 1, 8, PrefixStatus::NotStarted).await;
        add(&f.store, "B", 1, 7, PrefixStatus::NotStarted).await;

        let state = f.state.clone();
        let store = f.store.clone();
        let worker = tokio::spawn(f.scheduler.run());
        for _ in 0..200 {
            let done = store.list(PrefixStatus::Completed).await?.len() == 2;
            if done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        state.request_stop();
        tokio::time::timeout(Duration::from_secs(5), worker).await??;

        assert_eq!(f.lookup.identifiers(), ["A 9", "B 8", "B 9"]);
        assert_eq!(store.list(PrefixStatus::Completed).await?.len(), 2);
        Ok(())
    }
}
