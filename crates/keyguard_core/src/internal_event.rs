//! Metrics and log lines emitted by the engines.
//!
//! Every observable decision goes through an [`InternalEvent`] so that the counter and the
//! tracing line for it stay next to each other.

use std::time::Duration;

use metrics::{counter, histogram};

use crate::{rate_limiter::Strategy, store::StoreError};

pub trait InternalEvent: Sized {
    fn emit(self);
}

#[derive(Debug)]
pub struct RateLimitDecision<'a> {
    pub key: &'a str,
    pub strategy: Strategy,
    pub granted: bool,
}

impl InternalEvent for RateLimitDecision<'_> {
    fn emit(self) {
        let outcome = if self.granted { "granted" } else { "denied" };
        debug!(
            message = "Rate limit decision.",
            key = %self.key,
            strategy = self.strategy.as_str(),
            outcome
        );
        counter!(
            "keyguard_rate_limit_decisions_total",
            "strategy" => self.strategy.as_str(),
            "outcome" => outcome
        )
        .increment(1);
    }
}

#[derive(Debug)]
pub struct RateLimitFallback<'a> {
    pub key: &'a str,
    pub error: &'a StoreError,
    /// The limiter switched to the fallback strategy for good.
    pub demoted: bool,
}

impl InternalEvent for RateLimitFallback<'_> {
    fn emit(self) {
        warn!(
            message = "Atomic rate limiting failed; using non-atomic fallback.",
            key = %self.key,
            error = %self.error,
            demoted = self.demoted
        );
        counter!("keyguard_rate_limit_fallbacks_total").increment(1);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockOutcome {
    Acquired,
    Busy,
    Cancelled,
}

impl LockOutcome {
    const fn as_str(&self) -> &'static str {
        match self {
            LockOutcome::Acquired => "acquired",
            LockOutcome::Busy => "busy",
            LockOutcome::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug)]
pub struct LockAttempted<'a> {
    pub key: &'a str,
    pub outcome: LockOutcome,
    pub attempts: u32,
    pub waited: Duration,
}

impl InternalEvent for LockAttempted<'_> {
    fn emit(self) {
        debug!(
            message = "Lock attempt finished.",
            key = %self.key,
            outcome = self.outcome.as_str(),
            attempts = self.attempts,
            waited_ms = self.waited.as_millis() as u64
        );
        counter!("keyguard_lock_acquisitions_total", "outcome" => self.outcome.as_str())
            .increment(1);
        histogram!("keyguard_lock_wait_seconds").record(self.waited);
    }
}

#[derive(Debug)]
pub struct LockReleased<'a> {
    pub key: &'a str,
    /// `owned` or `unconditional`.
    pub mode: &'static str,
    pub released: bool,
}

impl InternalEvent for LockReleased<'_> {
    fn emit(self) {
        let outcome = if self.released { "released" } else { "not_held" };
        debug!(
            message = "Lock release.",
            key = %self.key,
            mode = self.mode,
            outcome
        );
        counter!(
            "keyguard_lock_releases_total",
            "mode" => self.mode,
            "outcome" => outcome
        )
        .increment(1);
    }
}

#[derive(Debug)]
pub struct GuardRejected<'a> {
    pub key: &'a str,
    /// `rate_limited` or `lock_busy`.
    pub reason: &'static str,
}

impl InternalEvent for GuardRejected<'_> {
    fn emit(self) {
        info!(message = "Guarded call rejected.", key = %self.key, reason = self.reason);
        counter!("keyguard_rejections_total", "reason" => self.reason).increment(1);
    }
}
