//! Append-only serial log.
//!
//! One `SerialLogEntry` is written per allocation attempt. Entries are never
//! mutated or deleted by the engine.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one allocation attempt as seen by the audit log.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogOutcome {
    /// The lookup step ran without raising (value found or not).
    Completed,
    /// The lookup step raised.
    Error,
}

impl LogOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed" => Ok(Self::Completed),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid log outcome: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SerialLogEntry {
    pub id: Uuid,
    pub prefix: String,
    pub identifier: String,
    pub value: Option<String>,
    pub outcome: LogOutcome,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl SerialLogEntry {
    pub fn new(prefix: &str, identifier: &str, value: Option<String>, outcome: LogOutcome) -> Self {
        Self {
            id: Uuid::new_v4(),
            prefix: prefix.to_string(),
            identifier: identifier.to_string(),
            value,
            outcome,
            metadata: HashMap::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

/// Destination for serial log entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Persist an entry and return its id.
    async fn append(&self, entry: SerialLogEntry) -> Result<Uuid>;

    /// Most recent entries for a prefix, newest first.
    async fn recent(&self, prefix: &str, limit: usize) -> Result<Vec<SerialLogEntry>>;
}
