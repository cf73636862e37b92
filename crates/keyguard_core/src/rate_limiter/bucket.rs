//! The token-bucket step, independent of where the state lives.

use std::time::Duration;

use snafu::ensure;

use crate::store::{InvalidArgumentSnafu, StoreError};

/// Hash field holding the (fractional) token count.
pub const TOKENS_FIELD: &str = "tokens";
/// Hash field holding the Unix second of the last refill.
pub const LAST_REFILL_FIELD: &str = "last_refill";

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_refill: i64,
}

impl BucketState {
    /// Rebuilds a state from its two hash fields.
    ///
    /// A record with a missing or unparseable field is treated as absent, which re-initialises
    /// the bucket to full on the next step (the server-side script behaves the same way).
    pub fn from_fields(key: &str, tokens: Option<&str>, last_refill: Option<&str>) -> Option<Self> {
        let (tokens, last_refill) = (tokens?, last_refill?);
        match (tokens.parse::<f64>(), last_refill.parse::<i64>()) {
            (Ok(tokens), Ok(last_refill)) if tokens.is_finite() => Some(BucketState {
                tokens,
                last_refill,
            }),
            _ => {
                warn!(message = "Discarding unreadable bucket state.", key = %key, tokens, last_refill);
                None
            }
        }
    }

    pub fn to_fields(&self) -> Vec<(String, String)> {
        vec![
            (TOKENS_FIELD.to_string(), self.tokens.to_string()),
            (LAST_REFILL_FIELD.to_string(), self.last_refill.to_string()),
        ]
    }
}

/// One acquisition against a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketRequest {
    /// Tokens added per `period`.
    pub quota: u64,
    pub period: Duration,
    /// Tokens taken by this call.
    pub quantity: u64,
    /// Upper bound on stored tokens.
    pub capacity: u64,
}

impl BucketRequest {
    pub fn validate(&self) -> Result<(), StoreError> {
        ensure!(
            self.quota > 0,
            InvalidArgumentSnafu {
                reason: "quota must be positive"
            }
        );
        ensure!(
            self.period.as_millis() > 0,
            InvalidArgumentSnafu {
                reason: "period must be at least one millisecond"
            }
        );
        ensure!(
            self.quantity > 0,
            InvalidArgumentSnafu {
                reason: "quantity must be at least 1"
            }
        );
        ensure!(
            self.capacity > 0,
            InvalidArgumentSnafu {
                reason: "capacity must be positive"
            }
        );
        Ok(())
    }

    /// Arguments in the order the token bucket script reads them.
    pub fn script_args(&self, now: i64) -> Vec<String> {
        vec![
            self.quota.to_string(),
            self.period_millis().to_string(),
            self.quantity.to_string(),
            self.capacity.to_string(),
            now.to_string(),
        ]
    }

    /// Inverse of [`BucketRequest::script_args`]; returns the request and `now`.
    pub fn from_script_args(args: &[String]) -> Result<(Self, i64), StoreError> {
        let invalid = || {
            InvalidArgumentSnafu {
                reason: format!("malformed token bucket arguments: {args:?}"),
            }
            .build()
        };
        let [quota, period_ms, quantity, capacity, now] = args else {
            return Err(invalid());
        };
        let request = BucketRequest {
            quota: quota.parse().map_err(|_| invalid())?,
            period: Duration::from_millis(period_ms.parse().map_err(|_| invalid())?),
            quantity: quantity.parse().map_err(|_| invalid())?,
            capacity: capacity.parse().map_err(|_| invalid())?,
        };
        Ok((request, now.parse().map_err(|_| invalid())?))
    }

    pub fn period_millis(&self) -> u64 {
        self.period.as_millis().clamp(1, u64::MAX as u128) as u64
    }
}

/// Outcome of one [`apply`] step.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Decision {
    pub granted: bool,
    /// State to persist.
    pub state: BucketState,
    /// Whether `state` differs from what was read and has to be written back (with a fresh TTL).
    pub dirty: bool,
}

/// Lazy refill followed by a debit of `request.quantity`.
///
/// Tokens are kept in `[0, capacity]` after every step. A `now` earlier than the last refill (a
/// caller with a lagging clock) yields no refill and leaves `last_refill` where it was.
pub fn apply(current: Option<BucketState>, request: &BucketRequest, now: i64) -> Decision {
    let capacity = request.capacity as f64;

    let (mut state, mut dirty) = match current {
        None => (
            BucketState {
                tokens: capacity,
                last_refill: now,
            },
            true,
        ),
        Some(stored) => {
            let mut state = BucketState {
                tokens: clamp(stored.tokens, capacity),
                ..stored
            };
            let mut dirty = state.tokens != stored.tokens;

            let elapsed = (now - state.last_refill) as f64;
            let refill = elapsed / request.period.as_secs_f64() * request.quota as f64;
            if refill > 0.0 {
                state.tokens = clamp(state.tokens + refill, capacity);
                state.last_refill = now;
                dirty = true;
            }
            (state, dirty)
        }
    };

    let quantity = request.quantity as f64;
    let granted = state.tokens >= quantity;
    if granted {
        state.tokens = clamp(state.tokens - quantity, capacity);
        dirty = true;
    }

    Decision {
        granted,
        state,
        dirty,
    }
}

fn clamp(tokens: f64, capacity: f64) -> f64 {
    tokens.clamp(0.0, capacity)
}
