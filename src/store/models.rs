use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Widest supported zero-pad width.
pub const MAX_DIGITS: u32 = 12;

/// Lifecycle of a prefix.
///
/// Only three values are ever written. Rows carrying one of the legacy
/// values (`running`, `error`, `paused`) parse as `Pending`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PrefixStatus {
    NotStarted,
    Pending,
    Completed,
}

/// Raw status strings from older deployments that migrate to `pending`.
pub const LEGACY_STATUSES: &[&str] = &["running", "error", "paused"];

impl PrefixStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Pending => "pending",
            Self::Completed => "completed",
        }
    }

    pub fn all() -> [PrefixStatus; 3] {
        [Self::NotStarted, Self::Pending, Self::Completed]
    }
}

impl std::fmt::Display for PrefixStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PrefixStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "not_started" => Ok(Self::NotStarted),
            "pending" => Ok(Self::Pending),
            "completed" => Ok(Self::Completed),
            legacy if LEGACY_STATUSES.contains(&legacy) => Ok(Self::Pending),
            other => Err(format!("Invalid prefix status: {}", other)),
        }
    }
}

/// Whether a raw stored status is one of the legacy values.
pub fn is_legacy_status(raw: &str) -> bool {
    LEGACY_STATUSES.contains(&raw.trim().to_lowercase().as_str())
}

/// Trim and uppercase a prefix. Returns `None` when nothing is left.
pub fn normalize_prefix(prefix: &str) -> Option<String> {
    let trimmed = prefix.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_uppercase())
    }
}

/// Largest serial representable in `digits` digits (`10^digits - 1`).
pub fn max_serial(digits: u32) -> u64 {
    10u64.pow(digits.min(MAX_DIGITS)) - 1
}

/// One row of the prefix table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrefixRecord {
    pub prefix: String,
    pub digits: u32,
    pub last_number: u64,
    pub has_space: bool,
    pub status: PrefixStatus,
    pub remarks: Option<String>,
    pub updated_at: String,
}

impl PrefixRecord {
    pub fn max_serial(&self) -> u64 {
        max_serial(self.digits)
    }

    /// True once `last_number` has reached the digit-width ceiling.
    pub fn is_exhausted(&self) -> bool {
        self.last_number >= self.max_serial()
    }

    pub fn remaining(&self) -> u64 {
        self.max_serial().saturating_sub(self.last_number)
    }
}

/// Partial update applied by `PrefixStore::upsert`.
///
/// `None` leaves the stored column untouched. When the row does not exist
/// yet, missing fields fall back to the store's creation defaults.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PrefixFields {
    pub digits: Option<u32>,
    pub last_number: Option<u64>,
    pub has_space: Option<bool>,
    pub status: Option<PrefixStatus>,
    pub remarks: Option<String>,
}

impl PrefixFields {
    pub fn status(status: PrefixStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legacy_statuses_parse_as_pending() {
        for raw in ["running", "ERROR", " paused "] {
            assert_eq!(PrefixStatus::from_str(raw).unwrap(), PrefixStatus::Pending);
            assert!(is_legacy_status(raw));
        }
        assert!(!is_legacy_status("pending"));
    }

    #[test]
    fn status_round_trips_through_as_str() {
        for status in PrefixStatus::all() {
            assert_eq!(PrefixStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(PrefixStatus::from_str("archived").is_err());
    }

    #[test]
    fn normalize_prefix_trims_and_uppercases() {
        assert_eq!(normalize_prefix("  abc1 ").as_deref(), Some("ABC1"));
        assert_eq!(normalize_prefix("   "), None);
    }

    #[test]
    fn max_serial_matches_digit_width() {
        assert_eq!(max_serial(1), 9);
        assert_eq!(max_serial(4), 9999);
        assert_eq!(max_serial(12), 999_999_999_999);
    }

    #[test]
    fn record_is_exhausted_only_at_ceiling() {
        let mut record = PrefixRecord {
            prefix: "P".into(),
            digits: 4,
            last_number: 9998,
            has_space: false,
            status: PrefixStatus::Pending,
            remarks: None,
            updated_at: String::new(),
        };
        assert!(!record.is_exhausted());
        assert_eq!(record.remaining(), 1);
        record.last_number = 9999;
        assert!(record.is_exhausted());
        assert_eq!(record.remaining(), 0);
    }
}
