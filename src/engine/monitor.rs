//! Change monitor: polls the store for work added behind the engine's back.
//!
//! The store has no push API, so this is a plain timer comparing the set of
//! pending prefix names between polls.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::debug;

use super::state::EngineState;
use crate::errors::EngineError;
use crate::store::{PrefixStatus, PrefixStore};

/// One poll of the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observation {
    /// Pending prefixes, not counting the one the scheduler is driving.
    pub pending: usize,
    /// Pending prefixes the previous poll had not seen. Zero on the first poll.
    pub new_pending: usize,
    pub not_started: usize,
    pub scheduler_running: bool,
}

/// Restart when a prefix became pending since the last poll, or when the
/// scheduler sits idle while work exists. Pending work that was already
/// known, shrinking or not, is left alone while the scheduler runs.
pub fn should_restart(obs: &Observation) -> bool {
    let grew = obs.new_pending > 0;
    let idle_with_work = !obs.scheduler_running && (obs.pending > 0 || obs.not_started > 0);
    grew || idle_with_work
}

pub struct ChangeMonitor {
    store: Arc<dyn PrefixStore>,
    state: Arc<EngineState>,
    store_timeout: Duration,
    /// Pending names from the last poll, plus the prefix being driven then.
    last_seen: Mutex<Option<BTreeSet<String>>>,
}

struct Poll {
    pending: BTreeSet<String>,
    current: Option<String>,
    not_started: usize,
    scheduler_running: bool,
}

impl ChangeMonitor {
    pub fn new(store: Arc<dyn PrefixStore>, state: Arc<EngineState>, store_timeout: Duration) -> Self {
        Self {
            store,
            state,
            store_timeout,
            last_seen: Mutex::new(None),
        }
    }

    /// Current pending count, excluding the scheduler's own prefix so that
    /// its claim-on-read does not look like new work.
    pub async fn observe(&self) -> Result<usize, EngineError> {
        Ok(self.poll().await?.pending.len())
    }

    async fn poll(&self) -> Result<Poll, EngineError> {
        let current = self.state.current_prefix();
        let pending = self
            .bounded(self.store.list(PrefixStatus::Pending))
            .await?
            .into_iter()
            .map(|r| r.prefix)
            .filter(|p| Some(p) != current.as_ref())
            .collect();
        let not_started = self.bounded(self.store.list(PrefixStatus::NotStarted)).await?.len();
        Ok(Poll {
            pending,
            current,
            not_started,
            scheduler_running: self.state.is_running(),
        })
    }

    /// Poll once, remember which prefixes were pending, and report whether a
    /// restart is due. A prefix the scheduler was driving at the previous
    /// poll counts as seen, so releasing it back to pending is not new work.
    pub async fn check(&self) -> Result<bool, EngineError> {
        let poll = self.poll().await?;
        let new_pending = {
            let mut last = self.last_seen.lock().unwrap_or_else(|e| e.into_inner());
            let new_pending = last
                .as_ref()
                .map_or(0, |seen| poll.pending.difference(seen).count());
            let mut seen = poll.pending.clone();
            seen.extend(poll.current.iter().cloned());
            *last = Some(seen);
            new_pending
        };
        let obs = Observation {
            pending: poll.pending.len(),
            new_pending,
            not_started: poll.not_started,
            scheduler_running: poll.scheduler_running,
        };
        let restart = should_restart(&obs);
        debug!(?obs, restart, "Change monitor poll");
        Ok(restart)
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
