//! Shared engine state: running flag, current prefix and counters.
//!
//! The scheduler is the only writer apart from `request_stop`. Everyone else
//! reads through [`EngineState::snapshot`].

use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Notify;

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineStats {
    pub running: bool,
    pub current_prefix: Option<String>,
    pub total_generated: u64,
    pub total_found: u64,
    pub errors: u64,
    pub started_at: Option<DateTime<Utc>>,
    /// `found / max(generated, 1) * 100`
    pub success_rate: f64,
    pub runtime_seconds: f64,
}

#[derive(Debug, Default)]
struct Counters {
    current_prefix: Option<String>,
    total_generated: u64,
    total_found: u64,
    errors: u64,
    started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct EngineState {
    running: AtomicBool,
    counters: Mutex<Counters>,
    wake: Notify,
}

impl EngineState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Flip `running` from false to true. Returns false if already running.
    pub(crate) fn try_begin(&self) -> bool {
        let begun = self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if begun {
            self.with_counters(|c| c.started_at = Some(Utc::now()));
        }
        begun
    }

    /// Clear `running` and wake any interruptible sleep. Returns false if the
    /// engine was not running.
    pub fn request_stop(&self) -> bool {
        let was_running = self.running.swap(false, Ordering::SeqCst);
        self.wake.notify_waiters();
        was_running
    }

    /// Sleep for `duration` unless stopped first. Returns whether the engine
    /// is still running afterwards.
    pub async fn pause(&self, duration: Duration) -> bool {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.is_running() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.is_running(),
            _ = notified => false,
        }
    }

    pub fn current_prefix(&self) -> Option<String> {
        self.with_counters(|c| c.current_prefix.clone())
    }

    pub(crate) fn set_current_prefix(&self, prefix: Option<String>) {
        self.with_counters(|c| c.current_prefix = prefix);
    }

    pub(crate) fn record_generated(&self, found: bool) {
        self.with_counters(|c| {
            c.total_generated += 1;
            if found {
                c.total_found += 1;
            }
        });
    }

    pub(crate) fn record_error(&self) {
        self.with_counters(|c| c.errors += 1);
    }

    pub fn snapshot(&self) -> EngineStats {
        let running = self.is_running();
        self.with_counters(|c| {
            let runtime_seconds = c
                .started_at
                .map(|t| (Utc::now() - t).num_milliseconds().max(0) as f64 / 1000.0)
                .unwrap_or(0.0);
            EngineStats {
                running,
                current_prefix: c.current_prefix.clone(),
                total_generated: c.total_generated,
                total_found: c.total_found,
                errors: c.errors,
                started_at: c.started_at,
                success_rate: c.total_found as f64 / c.total_generated.max(1) as f64 * 100.0,
                runtime_seconds,
            }
        })
    }

    fn with_counters<R>(&self, f: impl FnOnce(&mut Counters) -> R) -> R {
        // Counters stay consistent even if a holder panicked.
        let mut guard = self.counters.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }
}
