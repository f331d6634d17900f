//! Typed error hierarchy for the serial engine.
//!
//! Each seam gets its own enum:
//! - `AllocatorError`: serial allocation (validation vs transient failures)
//! - `LookupError`: attribute lookup transport failures
//! - `RecordError`: result log failures
//! - `EngineError`: per-item and lifecycle failures inside the scheduler
//! - `ConfigError`: configuration validation

use std::time::Duration;

use thiserror::Error;

use crate::store::PrefixStatus;

/// Errors from the serial allocator.
#[derive(Debug, Error)]
pub enum AllocatorError {
    #[error("Invalid prefix '{prefix}': {reason}")]
    InvalidPrefix { prefix: String, reason: String },

    #[error("Invalid digit width {digits}: must be between 1 and 12")]
    InvalidDigits { digits: u32 },

    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("Allocation for {prefix} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        prefix: String,
        attempts: u32,
        #[source]
        source: Box<AllocatorError>,
    },
}

impl AllocatorError {
    /// Validation failures are surfaced immediately; everything else may be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::InvalidPrefix { .. } | Self::InvalidDigits { .. } => false,
            Self::Timeout(_) | Self::Store(_) => true,
            Self::RetriesExhausted { .. } => false,
        }
    }
}

/// Errors from the attribute lookup service.
#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Lookup timed out after {0:?}")]
    Timeout(Duration),

    #[error("Lookup request failed: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("Lookup service returned HTTP {status}")]
    Status { status: u16 },
}

/// Errors from the result log.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Recording timed out after {0:?}")]
    Timeout(Duration),

    #[error("Result log rejected the row: {0}")]
    Rejected(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Errors surfaced by the engine.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Allocation(#[from] AllocatorError),

    #[error("Prefix {prefix} not found in store")]
    PrefixNotFound { prefix: String },

    #[error("Prefix {prefix} is exhausted at {last_number}")]
    Exhausted { prefix: String, last_number: u64 },

    #[error("Starting number {starting_number} exceeds {max} for {prefix}")]
    InvalidStartingNumber {
        prefix: String,
        starting_number: u64,
        max: u64,
    },

    #[error("Cannot move {prefix} from {from} to {to}")]
    InvalidTransition {
        prefix: String,
        from: PrefixStatus,
        to: PrefixStatus,
    },

    #[error("Prefix {prefix} is being generated; stop the engine before reconfiguring it")]
    PrefixBusy { prefix: String },

    #[error("Store call timed out after {0:?}")]
    StoreTimeout(Duration),

    #[error("Store error: {0}")]
    Store(#[source] anyhow::Error),
}

impl EngineError {
    /// Validation failures should reach the caller instead of feeding the
    /// consecutive-error counter.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Allocation(AllocatorError::InvalidPrefix { .. })
                | Self::Allocation(AllocatorError::InvalidDigits { .. })
                | Self::InvalidStartingNumber { .. }
                | Self::InvalidTransition { .. }
                | Self::PrefixBusy { .. }
        )
    }
}

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {source}")]
    Read {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file at {path}: {source}")]
    Parse {
        path: std::path::PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_are_not_retryable() {
        let err = AllocatorError::InvalidPrefix {
            prefix: "".into(),
            reason: "empty".into(),
        };
        assert!(!err.is_retryable());
        assert!(!AllocatorError::InvalidDigits { digits: 13 }.is_retryable());
    }

    #[test]
    fn transient_errors_are_retryable() {
        assert!(AllocatorError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(AllocatorError::Store(anyhow::anyhow!("connection reset")).is_retryable());
    }

    #[test]
    fn retries_exhausted_carries_attempts_and_source() {
        let err = AllocatorError::RetriesExhausted {
            prefix: "ABC".into(),
            attempts: 3,
            source: Box::new(AllocatorError::Timeout(Duration::from_secs(10))),
        };
        let msg = err.to_string();
        assert!(msg.contains("ABC"));
        assert!(msg.contains('3'));
        assert!(!err.is_retryable());
    }

    #[test]
    fn engine_error_converts_from_allocator_error() {
        let inner = AllocatorError::InvalidDigits { digits: 0 };
        let err: EngineError = inner.into();
        match &err {
            EngineError::Allocation(AllocatorError::InvalidDigits { digits }) => {
                assert_eq!(*digits, 0)
            }
            _ => panic!("Expected EngineError::Allocation(InvalidDigits)"),
        }
    }

    #[test]
    fn operator_errors_are_validation_failures() {
        let err = EngineError::InvalidTransition {
            prefix: "ABC".into(),
            from: PrefixStatus::Pending,
            to: PrefixStatus::NotStarted,
        };
        assert!(err.is_validation());
        assert_eq!(err.to_string(), "Cannot move ABC from pending to not_started");
        assert!(!EngineError::StoreTimeout(Duration::from_secs(1)).is_validation());
        assert!(EngineError::from(AllocatorError::InvalidDigits { digits: 0 }).is_validation());
    }

    #[test]
    fn config_error_names_field() {
        let err = ConfigError::Invalid {
            field: "engine.generation_interval_secs",
            message: "must be greater than zero".into(),
        };
        assert!(err.to_string().contains("generation_interval_secs"));
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&AllocatorError::InvalidDigits { digits: 20 });
        assert_std_error(&LookupError::Status { status: 503 });
        assert_std_error(&RecordError::Rejected("bad range".into()));
        assert_std_error(&EngineError::PrefixNotFound { prefix: "X".into() });
    }
}
