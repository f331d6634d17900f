//! Serial allocator: "give me the next number for prefix X".
//!
//! The primary path is the store's single round-trip atomic increment. When
//! that path errors, the allocator falls back to a point read followed by a
//! conditional update keyed on the `last_number` it read.
//!
//! The fallback is race-free for updates but not for creation: two
//! out-of-process writers creating the same unknown prefix at the same time
//! can both write `last_number = 1`. The scheduler never allocates
//! concurrently for one prefix, so only external actors can hit this window.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::AllocatorSection;
use crate::errors::AllocatorError;
use crate::store::models::{MAX_DIGITS, normalize_prefix};
use crate::store::{PrefixFields, PrefixRecord, PrefixStatus, PrefixStore};

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base: Duration::from_secs(1),
            cap: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(section: &AllocatorSection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base: Duration::from_millis(section.backoff_base_ms),
            cap: Duration::from_millis(section.backoff_cap_ms),
        }
    }

    /// Delay before retrying after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base.saturating_mul(factor).min(self.cap)
    }
}

/// Zero-pad `number` to `digits`, joining with a space when `has_space`.
///
/// Numbers wider than `digits` are written in full; nothing is truncated.
pub fn format_identifier(prefix: &str, number: u64, digits: u32, has_space: bool) -> String {
    let separator = if has_space { " " } else { "" };
    format!("{}{}{:0width$}", prefix, separator, number, width = digits as usize)
}

/// Split a generated identifier back into prefix and serial.
///
/// The digit width is required because a prefix may itself end in digits.
pub fn parse_identifier(identifier: &str, digits: u32, has_space: bool) -> Option<(String, u64)> {
    let (prefix, number) = if has_space {
        identifier.rsplit_once(' ')?
    } else {
        let split = identifier.len().checked_sub(digits as usize)?;
        if !identifier.is_char_boundary(split) {
            return None;
        }
        identifier.split_at(split)
    };
    if prefix.is_empty() || number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((prefix.to_string(), number.parse().ok()?))
}

/// A freshly allocated serial and its formatted identifier.
#[derive(Debug, Clone, PartialEq)]
pub struct Allocation {
    pub record: PrefixRecord,
    pub identifier: String,
}

impl Allocation {
    pub fn new(record: PrefixRecord) -> Self {
        let identifier = format_identifier(
            &record.prefix,
            record.last_number,
            record.digits,
            record.has_space,
        );
        Self { record, identifier }
    }

    pub fn serial(&self) -> u64 {
        self.record.last_number
    }
}

pub struct SerialAllocator {
    store: Arc<dyn PrefixStore>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl SerialAllocator {
    pub fn new(store: Arc<dyn PrefixStore>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self {
            store,
            policy,
            timeout,
        }
    }

    pub fn from_config(store: Arc<dyn PrefixStore>, section: &AllocatorSection) -> Self {
        Self::new(
            store,
            RetryPolicy::from_config(section),
            Duration::from_secs(section.timeout_secs),
        )
    }

    /// Allocate the next serial for `prefix`.
    ///
    /// Unknown prefixes are created at `last_number = 1`. `digits` and
    /// `has_space` overwrite an existing record only when supplied.
    pub async fn allocate(
        &self,
        prefix: &str,
        digits: Option<u32>,
        has_space: Option<bool>,
    ) -> Result<Allocation, AllocatorError> {
        let prefix = validate(prefix, digits)?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.try_allocate(&prefix, digits, has_space).await {
                Ok(record) => {
                    let allocation = Allocation::new(record);
                    info!(
                        prefix = %prefix,
                        serial = allocation.serial(),
                        identifier = %allocation.identifier,
                        "Allocated serial"
                    );
                    return Ok(allocation);
                }
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(prefix = %prefix, attempt, ?delay, error = %e, "Allocation failed, retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_retryable() => {
                    return Err(AllocatorError::RetriesExhausted {
                        prefix,
                        attempts: attempt,
                        source: Box::new(e),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn try_allocate(
        &self,
        prefix: &str,
        digits: Option<u32>,
        has_space: Option<bool>,
    ) -> Result<PrefixRecord, AllocatorError> {
        match self
            .bounded(self.store.atomic_increment(prefix, digits, has_space))
            .await
        {
            Ok(record) => Ok(record),
            Err(e) => {
                warn!(prefix, error = %e, "Atomic increment failed, using fallback");
                self.increment_via_update(prefix, digits, has_space).await
            }
        }
    }

    async fn increment_via_update(
        &self,
        prefix: &str,
        digits: Option<u32>,
        has_space: Option<bool>,
    ) -> Result<PrefixRecord, AllocatorError> {
        match self.bounded(self.store.get(prefix)).await? {
            Some(current) => {
                let fields = PrefixFields {
                    digits,
                    has_space,
                    last_number: Some(current.last_number + 1),
                    ..PrefixFields::default()
                };
                let updated = self
                    .bounded(self.store.compare_and_update(prefix, current.last_number, fields))
                    .await?;
                updated.ok_or_else(|| {
                    AllocatorError::Store(anyhow::anyhow!(
                        "{} changed concurrently (expected last_number {})",
                        prefix,
                        current.last_number
                    ))
                })
            }
            None => {
                debug!(prefix, "Creating prefix through fallback path");
                let fields = PrefixFields {
                    digits,
                    has_space,
                    last_number: Some(1),
                    status: Some(PrefixStatus::Pending),
                    remarks: None,
                };
                self.bounded(self.store.upsert(prefix, fields)).await
            }
        }
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = anyhow::Result<T>>,
    ) -> Result<T, AllocatorError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| AllocatorError::Timeout(self.timeout))?
            .map_err(AllocatorError::Store)
    }
}

/// Normalize the prefix and check the digit width.
pub fn validate(prefix: &str, digits: Option<u32>) -> Result<String, AllocatorError> {
    let normalized = normalize_prefix(prefix).ok_or_else(|| AllocatorError::InvalidPrefix {
        prefix: prefix.to_string(),
        reason: "prefix cannot be empty".to_string(),
    })?;
    if normalized.chars().any(|c| c.is_control()) {
        return Err(AllocatorError::InvalidPrefix {
            prefix: prefix.to_string(),
            reason: "prefix contains control characters".to_string(),
        });
    }
    if let Some(d) = digits {
        if d == 0 || d > MAX_DIGITS {
            return Err(AllocatorError::InvalidDigits { digits: d });
        }
    }
    Ok(normalized)
}
