//! The automation engine.
//!
//! `Engine` is a cheap clonable handle. It owns one scheduler worker task at
//! a time, the change-monitor task, and the shared [`EngineState`]. Callers
//! drive it through `start`, `stop`, `get_stats` and
//! `reconcile_and_maybe_start`; everything else hangs off those.

pub mod admin;
pub mod item;
pub mod monitor;
pub mod resume;
pub mod scheduler;
pub mod state;

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::allocator::{self, SerialAllocator};
use crate::audit::AuditSink;
use crate::config::{EngineConfig, EngineSection};
use crate::errors::EngineError;
use crate::lookup::{AttributeLookup, HttpLookupClient, LookupAdapter};
use crate::recorder::{ResultLog, ResultRecorder};
use crate::store::models::max_serial;
use crate::store::{PrefixDefaults, PrefixFields, PrefixStatus, PrefixStore, SqliteStore};

pub use admin::PrefixSettings;
pub use item::{ItemPipeline, ItemReport};
pub use monitor::{ChangeMonitor, Observation, should_restart};
pub use resume::{DatabaseSummary, ResumeCoordinator, ResumeSummary};
pub use scheduler::{PrefixExit, Scheduler};
pub use state::{EngineState, EngineStats};

/// Timing knobs for the scheduler and monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub generation_interval: Duration,
    pub monitor_interval: Duration,
    pub settle_delay: Duration,
    pub max_consecutive_errors: u32,
    pub store_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(section: &EngineSection) -> Self {
        Self {
            generation_interval: Duration::from_secs(section.generation_interval_secs),
            monitor_interval: Duration::from_secs(section.monitor_interval_secs),
            settle_delay: Duration::from_secs(section.settle_delay_secs),
            max_consecutive_errors: section.max_consecutive_errors,
            store_timeout: Duration::from_secs(section.store_timeout_secs),
        }
    }
}

/// The external collaborators an engine is wired to.
pub struct EngineComponents {
    pub store: Arc<dyn PrefixStore>,
    pub audit: Arc<dyn AuditSink>,
    pub lookup: Arc<dyn AttributeLookup>,
    pub log: Arc<dyn ResultLog>,
}

struct EngineInner {
    store: Arc<dyn PrefixStore>,
    audit: Arc<dyn AuditSink>,
    pipeline: Arc<ItemPipeline>,
    state: Arc<EngineState>,
    resume: ResumeCoordinator,
    monitor: ChangeMonitor,
    settings: EngineSettings,
    /// Interval of the most recent `start`, reused by restarts.
    interval: Mutex<Duration>,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    monitor_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    pub fn new(components: EngineComponents, config: &EngineConfig) -> Self {
        Self::with_settings(components, config, EngineSettings::from_config(&config.engine))
    }

    pub fn with_settings(
        components: EngineComponents,
        config: &EngineConfig,
        settings: EngineSettings,
    ) -> Self {
        let EngineComponents {
            store,
            audit,
            lookup,
            log,
        } = components;
        let state = Arc::new(EngineState::new());
        let pipeline = Arc::new(ItemPipeline::new(
            SerialAllocator::from_config(store.clone(), &config.allocator),
            LookupAdapter::from_config(lookup, &config.lookup),
            ResultRecorder::from_config(log, &config.recorder),
            audit.clone(),
            settings.store_timeout,
        ));
        let inner = EngineInner {
            resume: ResumeCoordinator::new(store.clone(), settings.store_timeout),
            monitor: ChangeMonitor::new(store.clone(), state.clone(), settings.store_timeout),
            store,
            audit,
            pipeline,
            state,
            settings,
            interval: Mutex::new(settings.generation_interval),
            worker: tokio::sync::Mutex::new(None),
            monitor_task: Mutex::new(None),
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Wire the SQLite store, HTTP lookup and configured result log.
    pub fn from_config(config: &EngineConfig) -> anyhow::Result<Self> {
        let defaults = PrefixDefaults {
            digits: config.allocator.default_digits,
            has_space: config.allocator.default_has_space,
        };
        let store = Arc::new(
            SqliteStore::open(&config.store.path, defaults).with_context(|| {
                format!("Failed to open store at {}", config.store.path.display())
            })?,
        );
        let lookup = Arc::new(HttpLookupClient::new(&config.lookup)?);
        let log = ResultRecorder::log_from_config(&config.recorder)?;
        let components = EngineComponents {
            store: store.clone(),
            audit: store,
            lookup,
            log,
        };
        Ok(Self::new(components, config))
    }

    pub fn settings(&self) -> EngineSettings {
        self.inner.settings
    }

    pub fn is_running(&self) -> bool {
        self.inner.state.is_running()
    }

    pub fn get_stats(&self) -> EngineStats {
        self.inner.state.snapshot()
    }

    /// Spawn the scheduler. No-op (returns false) when already running.
    ///
    /// A worker still finishing its last item after `stop` is awaited first,
    /// so two workers never overlap.
    pub async fn start(&self, generation_interval: Duration) -> bool {
        let mut worker = self.inner.worker.lock().await;
        if self.inner.state.is_running() {
            debug!("Scheduler already running");
            return false;
        }
        if let Some(previous) = worker.take() {
            if !previous.is_finished() {
                info!("Waiting for previous scheduler to finish its item");
            }
            if let Err(e) = previous.await {
                warn!(error = %e, "Previous scheduler task ended abnormally");
            }
        }
        if !self.inner.state.try_begin() {
            return false;
        }

        *lock(&self.inner.interval) = generation_interval;
        let scheduler = Scheduler::new(
            self.inner.store.clone(),
            self.inner.pipeline.clone(),
            self.inner.state.clone(),
            generation_interval,
            self.inner.settings.max_consecutive_errors,
            self.inner.settings.store_timeout,
        );
        *worker = Some(tokio::spawn(scheduler.run()));
        info!(interval = ?generation_interval, "Automation started");
        true
    }

    /// Clear the running flag. The current prefix, if any, is left pending.
    /// Returns false when nothing was running.
    pub async fn stop(&self) -> bool {
        if !self.inner.state.request_stop() {
            return false;
        }
        if let Some(prefix) = self.inner.state.current_prefix() {
            self.release_prefix(&prefix).await;
        }
        info!("Automation stop requested");
        true
    }

    async fn release_prefix(&self, prefix: &str) {
        let record = match self.bounded(self.inner.store.get(prefix)).await {
            Ok(Some(record)) => record,
            Ok(None) => return,
            Err(e) => {
                warn!(prefix, error = %e, "Could not read prefix while stopping");
                return;
            }
        };
        if record.status == PrefixStatus::Completed || record.is_exhausted() {
            return;
        }
        // The write re-checks the status, so a completion that landed after
        // the read above is kept.
        match self.bounded(self.inner.store.release(prefix)).await {
            Ok(Some(_)) => {}
            Ok(None) => debug!(prefix, "Prefix completed while stopping"),
            Err(e) => warn!(prefix, error = %e, "Could not mark prefix pending while stopping"),
        }
    }

    pub async fn reconcile(&self) -> Result<ResumeSummary, EngineError> {
        self.inner.resume.reconcile().await
    }

    /// Reconcile the store and start the scheduler if there is work and it
    /// is not already running.
    pub async fn reconcile_and_maybe_start(&self) -> Result<ResumeSummary, EngineError> {
        let summary = self.reconcile().await?;
        if summary.has_work() && !self.is_running() {
            let interval = *lock(&self.inner.interval);
            self.start(interval).await;
        }
        Ok(summary)
    }

    /// Boot sequence: resume any work, then start the change monitor.
    ///
    /// The monitor is started even when reconciliation fails so that a later
    /// poll can recover.
    pub async fn boot(&self) -> Result<ResumeSummary, EngineError> {
        let result = self.reconcile_and_maybe_start().await;
        if let Err(e) = &result {
            error!(error = %e, "Startup reconciliation failed");
        }
        self.spawn_monitor();
        result
    }

    fn spawn_monitor(&self) {
        let engine = self.clone();
        let period = self.inner.settings.monitor_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; boot already reconciled.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match engine.inner.monitor.check().await {
                    Ok(true) => {
                        engine.restart().await;
                    }
                    Ok(false) => {}
                    Err(e) => warn!(error = %e, "Change monitor poll failed"),
                }
            }
        });
        info!(interval = ?period, "Change monitor started");
        if let Some(previous) = lock(&self.inner.monitor_task).replace(handle) {
            previous.abort();
        }
    }

    /// Stop, let the worker settle, then reconcile and start again if work
    /// remains. Errors are logged; the next monitor poll retries.
    pub async fn restart(&self) -> Option<ResumeSummary> {
        info!("Store change detected, restarting automation");
        self.stop().await;
        tokio::time::sleep(self.inner.settings.settle_delay).await;
        match self.reconcile_and_maybe_start().await {
            Ok(summary) => Some(summary),
            Err(e) => {
                error!(error = %e, "Restart reconciliation failed");
                None
            }
        }
    }

    /// Stop the monitor and scheduler and wait for the in-flight item.
    pub async fn shutdown(&self) {
        if let Some(monitor) = lock(&self.inner.monitor_task).take() {
            monitor.abort();
        }
        self.stop().await;
        let worker = self.inner.worker.lock().await.take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        info!("Engine shut down");
    }

    /// Allocate one serial outside the scheduler. With `dry_run` only the
    /// allocation happens; lookup, recording and audit are skipped.
    /// Engine counters are not touched.
    pub async fn generate_once(
        &self,
        prefix: &str,
        digits: Option<u32>,
        has_space: Option<bool>,
        dry_run: bool,
    ) -> Result<ItemReport, EngineError> {
        let prefix = allocator::validate(prefix, digits)?;
        if let Some(existing) = self.bounded(self.inner.store.get(&prefix)).await? {
            let ceiling = max_serial(digits.unwrap_or(existing.digits));
            if existing.last_number >= ceiling {
                return Err(EngineError::Exhausted {
                    prefix,
                    last_number: existing.last_number,
                });
            }
        }

        let report = self
            .inner
            .pipeline
            .run(&prefix, digits, has_space, dry_run)
            .await?;
        if report.exhausted {
            let fields = PrefixFields {
                status: Some(PrefixStatus::Completed),
                remarks: Some(format!("Completed at {}", report.serial)),
                ..PrefixFields::default()
            };
            self.bounded(self.inner.store.upsert(&prefix, fields)).await?;
        }
        Ok(report)
    }

    pub(crate) async fn bounded<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, EngineError> {
        let timeout = self.inner.settings.store_timeout;
        tokio::time::timeout(timeout, fut)
            .await
            .map_err(|_| EngineError::StoreTimeout(timeout))?
            .map_err(EngineError::Store)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
