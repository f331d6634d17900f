//! One serial, end to end: allocate, look up, record, audit.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::allocator::SerialAllocator;
use crate::audit::{AuditSink, LogOutcome, SerialLogEntry};
use crate::errors::EngineError;
use crate::lookup::LookupAdapter;
use crate::recorder::{RecordOutcome, ResultRecorder, is_blank_value};

/// What happened to one allocated serial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ItemReport {
    pub prefix: String,
    pub serial: u64,
    pub identifier: String,
    pub value: Option<String>,
    pub outcome: LogOutcome,
    /// Result log location or skip sentinel; `None` when recording failed or
    /// the item was a dry run.
    pub location: Option<String>,
    /// True once `serial` reached the digit-width ceiling.
    pub exhausted: bool,
}

pub struct ItemPipeline {
    allocator: SerialAllocator,
    lookup: LookupAdapter,
    recorder: ResultRecorder,
    audit: Arc<dyn AuditSink>,
    audit_timeout: Duration,
}

impl ItemPipeline {
    pub fn new(
        allocator: SerialAllocator,
        lookup: LookupAdapter,
        recorder: ResultRecorder,
        audit: Arc<dyn AuditSink>,
        audit_timeout: Duration,
    ) -> Self {
        Self {
            allocator,
            lookup,
            recorder,
            audit,
            audit_timeout,
        }
    }

    /// Run one item. Only allocation failures escape; lookup, record and
    /// audit failures are logged and folded into the report.
    pub async fn run(
        &self,
        prefix: &str,
        digits: Option<u32>,
        has_space: Option<bool>,
        dry_run: bool,
    ) -> Result<ItemReport, EngineError> {
        let allocation = self.allocator.allocate(prefix, digits, has_space).await?;
        let record = &allocation.record;
        let identifier = allocation.identifier.clone();

        let mut report = ItemReport {
            prefix: record.prefix.clone(),
            serial: record.last_number,
            identifier: identifier.clone(),
            value: None,
            outcome: LogOutcome::Completed,
            location: None,
            exhausted: record.is_exhausted(),
        };
        if dry_run {
            return Ok(report);
        }

        match self.lookup.lookup(&identifier).await {
            Ok(found) if found.succeeded => {
                report.value = found.value.filter(|v| !is_blank_value(Some(v.as_str())));
            }
            Ok(_) => {}
            Err(e) => {
                warn!(identifier = %identifier, error = %e, "Lookup failed, treating as no value");
                report.outcome = LogOutcome::Error;
            }
        }

        if report.value.is_some() {
            match self
                .recorder
                .record(&report.prefix, report.serial, &identifier, report.value.as_deref())
                .await
            {
                Ok(RecordOutcome::Recorded { location }) => report.location = Some(location),
                Ok(RecordOutcome::Skipped { sentinel }) => report.location = Some(sentinel),
                Err(e) => warn!(identifier = %identifier, error = %e, "Recording failed"),
            }
        }

        self.append_audit(&report).await;
        Ok(report)
    }

    async fn append_audit(&self, report: &ItemReport) {
        let mut entry = SerialLogEntry::new(
            &report.prefix,
            &report.identifier,
            report.value.clone(),
            report.outcome,
        )
        .with_metadata("serial", report.serial);
        if let Some(location) = &report.location {
            entry = entry.with_metadata("location", location.as_str());
        }

        match tokio::time::timeout(self.audit_timeout, self.audit.append(entry)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => warn!(identifier = %report.identifier, error = %e, "Audit append failed"),
            Err(_) => warn!(identifier = %report.identifier, "Audit append timed out"),
        }
    }
}
