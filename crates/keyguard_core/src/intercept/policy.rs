use std::time::Duration;

use bon::Builder;
use serde::Deserialize;
use snafu::ensure;

use crate::{
    error::{GuardError, InvalidPolicySnafu},
    mutex::RetryPolicy,
};

/// Unit attached to the integer durations of a policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeUnit {
    Milliseconds,
    #[default]
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    pub const fn duration(self, amount: u64) -> Duration {
        match self {
            TimeUnit::Milliseconds => Duration::from_millis(amount),
            TimeUnit::Seconds => Duration::from_secs(amount),
            TimeUnit::Minutes => Duration::from_secs(amount.saturating_mul(60)),
            TimeUnit::Hours => Duration::from_secs(amount.saturating_mul(60 * 60)),
            TimeUnit::Days => Duration::from_secs(amount.saturating_mul(24 * 60 * 60)),
        }
    }
}

/// Declarative rate limit for one call site.
///
/// ```rust
/// use keyguard_core::intercept::{RateLimitPolicy, TimeUnit};
///
/// let policy = RateLimitPolicy::builder()
///     .key("login:${request.username}")
///     .quota(5)
///     .period(1)
///     .period_unit(TimeUnit::Minutes)
///     .build();
/// assert_eq!(policy.effective_capacity(), 5);
/// ```
#[derive(Clone, Debug, Builder, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RateLimitPolicy {
    /// Key template, expanded against the call's parameters.
    #[builder(into)]
    pub key: String,

    /// Tokens added per period.
    pub quota: u64,

    #[serde(default = "default_period")]
    #[builder(default = default_period())]
    pub period: u64,

    #[serde(default)]
    #[builder(default)]
    pub period_unit: TimeUnit,

    /// Bucket size; `0` means "same as quota".
    #[serde(default)]
    #[builder(default)]
    pub capacity: u64,

    /// Tokens consumed by each call.
    #[serde(default = "default_quantity")]
    #[builder(default = default_quantity())]
    pub quantity: u64,

    /// Message carried by [`GuardError::RateLimited`].
    #[serde(default = "default_rate_limit_message")]
    #[builder(into, default = default_rate_limit_message())]
    pub message: String,
}

impl RateLimitPolicy {
    pub fn period(&self) -> Duration {
        self.period_unit.duration(self.period)
    }

    pub fn effective_capacity(&self) -> u64 {
        if self.capacity == 0 {
            self.quota
        } else {
            self.capacity
        }
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        ensure!(
            !self.key.is_empty(),
            InvalidPolicySnafu {
                reason: "rate limit key template is empty"
            }
        );
        ensure!(
            self.quota > 0,
            InvalidPolicySnafu {
                reason: "rate limit quota must be positive"
            }
        );
        ensure!(
            !self.period().is_zero(),
            InvalidPolicySnafu {
                reason: "rate limit period must be positive"
            }
        );
        ensure!(
            self.quantity > 0,
            InvalidPolicySnafu {
                reason: "rate limit quantity must be at least 1"
            }
        );
        Ok(())
    }
}

/// How a lock taken by the interceptor is released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseMode {
    /// Delete only if the record still carries this acquisition's token.
    #[default]
    Owned,
    /// Delete whatever is there. Can release a successor's lock after our TTL expired.
    Unconditional,
}

/// Declarative lock for one call site.
#[derive(Clone, Debug, Builder, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LockPolicy {
    /// Key template, expanded against the call's parameters.
    #[builder(into)]
    pub key: String,

    #[serde(default = "default_expire")]
    #[builder(default = default_expire())]
    pub expire: u64,

    #[serde(default)]
    #[builder(default)]
    pub expire_unit: TimeUnit,

    /// Attempts after the first one while the key is held.
    #[serde(default)]
    #[builder(default)]
    pub retries: u32,

    #[serde(default = "default_retry_interval")]
    #[builder(default = default_retry_interval())]
    pub retry_interval: u64,

    #[serde(default = "default_retry_interval_unit")]
    #[builder(default = default_retry_interval_unit())]
    pub retry_interval_unit: TimeUnit,

    /// Release the lock once the guarded operation finishes.
    #[serde(default = "default_auto_unlock")]
    #[builder(default = default_auto_unlock())]
    pub auto_unlock: bool,

    #[serde(default)]
    #[builder(default)]
    pub release_mode: ReleaseMode,

    /// Message carried by [`GuardError::LockBusy`].
    #[serde(default = "default_lock_message")]
    #[builder(into, default = default_lock_message())]
    pub message: String,
}

impl LockPolicy {
    pub fn expiry(&self) -> Duration {
        self.expire_unit.duration(self.expire)
    }

    pub fn retry(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retries,
            self.retry_interval_unit.duration(self.retry_interval),
        )
    }

    pub fn validate(&self) -> Result<(), GuardError> {
        ensure!(
            !self.key.is_empty(),
            InvalidPolicySnafu {
                reason: "lock key template is empty"
            }
        );
        ensure!(
            self.expiry().as_millis() > 0,
            InvalidPolicySnafu {
                reason: "lock expiry must be at least one millisecond"
            }
        );
        Ok(())
    }
}

const fn default_period() -> u64 {
    1
}

const fn default_quantity() -> u64 {
    1
}

fn default_rate_limit_message() -> String {
    "too many requests, please try again later".to_string()
}

const fn default_expire() -> u64 {
    30
}

const fn default_retry_interval() -> u64 {
    100
}

const fn default_retry_interval_unit() -> TimeUnit {
    TimeUnit::Milliseconds
}

const fn default_auto_unlock() -> bool {
    true
}

fn default_lock_message() -> String {
    "resource is busy, please try again later".to_string()
}
