//! Mutual exclusion through a TTL'd record in the shared store.
//!
//! A lock is held while `key` exists. Acquisition is a conditional set-if-absent of a caller
//! chosen ownership token, retried a bounded number of times. Release is a compare-and-delete on
//! that token so a holder whose lock already expired cannot remove a successor's lock.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use snafu::ensure;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;

use crate::{
    config::KeyguardSettings,
    internal_event::{InternalEvent, LockAttempted, LockOutcome, LockReleased},
    key::KeyCodec,
    store::{CorruptedSnafu, InvalidArgumentSnafu, Script, ScriptValue, Store, StoreError},
};

/// How often and how far apart `try_lock` retries a busy key.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after the first one.
    pub retries: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    /// A single attempt.
    pub const NONE: RetryPolicy = RetryPolicy {
        retries: 0,
        interval: Duration::ZERO,
    };

    pub const fn new(retries: u32, interval: Duration) -> Self {
        Self { retries, interval }
    }
}

pub struct MutexLock {
    store: Arc<dyn Store>,
    codec: KeyCodec,
    scripting: AtomicBool,
}

impl MutexLock {
    pub async fn new(store: Arc<dyn Store>, settings: &KeyguardSettings) -> Result<Self, StoreError> {
        let scripting = store.probe_scripting().await?;
        if !scripting {
            warn!(
                message = "Store has no scripting support; owned unlock falls back to a non-atomic get-then-delete.",
                key_prefix = %settings.key_prefix()
            );
        }

        Ok(Self {
            store,
            codec: KeyCodec::new(settings.key_prefix()),
            scripting: AtomicBool::new(scripting),
        })
    }

    /// A fresh ownership token: 128 random bits as lowercase hex.
    pub fn new_token() -> String {
        format!("{:032x}", rand::random::<u128>())
    }

    /// The fully-qualified key this lock uses for `key`.
    pub fn qualify(&self, key: &str) -> String {
        self.codec.encode(key)
    }

    /// Tries to store `value` at `key` for `expiry`, retrying while the key is held.
    ///
    /// Returns `Ok(false)` when the key is still held after `retry.retries + 1` attempts.
    pub async fn try_lock(
        &self,
        key: &str,
        value: &str,
        expiry: Duration,
        retry: RetryPolicy,
    ) -> Result<bool, StoreError> {
        self.try_lock_until(key, value, expiry, retry, &CancellationToken::new())
            .await
    }

    /// Like [`MutexLock::try_lock`], but gives up with `Ok(false)` as soon as `cancel` fires.
    pub async fn try_lock_until(
        &self,
        key: &str,
        value: &str,
        expiry: Duration,
        retry: RetryPolicy,
        cancel: &CancellationToken,
    ) -> Result<bool, StoreError> {
        ensure!(
            expiry.as_millis() > 0,
            InvalidArgumentSnafu {
                reason: "lock expiry must be at least one millisecond"
            }
        );

        let key = self.codec.encode(key);
        let started = Instant::now();
        let mut remaining = retry.retries;
        let mut attempts = 0;

        let outcome = loop {
            if cancel.is_cancelled() {
                break LockOutcome::Cancelled;
            }

            attempts += 1;
            if self.store.set_if_absent(&key, value, expiry).await? {
                break LockOutcome::Acquired;
            }
            if remaining == 0 {
                break LockOutcome::Busy;
            }
            remaining -= 1;

            tokio::select! {
                _ = cancel.cancelled() => break LockOutcome::Cancelled,
                _ = sleep(retry.interval) => {}
            }
        };

        LockAttempted {
            key: &key,
            outcome,
            attempts,
            waited: started.elapsed(),
        }
        .emit();
        Ok(outcome == LockOutcome::Acquired)
    }

    /// Releases `key` if, and only if, it still holds `value`.
    ///
    /// Returns `Ok(false)` when the key is absent or owned by someone else.
    pub async fn unlock(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let key = self.codec.encode(key);

        let released = if self.scripting.load(Ordering::Relaxed) {
            match self.compare_and_delete(&key, value).await {
                Err(error) if error.is_scripting_unsupported() => {
                    self.scripting.store(false, Ordering::Relaxed);
                    warn!(message = "Scripting unsupported; owned unlock degrades to get-then-delete.", key = %key, %error);
                    self.get_then_delete(&key, value).await?
                }
                result => result?,
            }
        } else {
            self.get_then_delete(&key, value).await?
        };

        LockReleased {
            key: &key,
            mode: "owned",
            released,
        }
        .emit();
        Ok(released)
    }

    /// Deletes `key` regardless of who holds it.
    ///
    /// This can release another holder's lock if ours expired first; prefer [`MutexLock::unlock`].
    pub async fn unlock_unconditional(&self, key: &str) -> Result<bool, StoreError> {
        let key = self.codec.encode(key);
        let released = self.store.delete(&key).await?;

        LockReleased {
            key: &key,
            mode: "unconditional",
            released,
        }
        .emit();
        Ok(released)
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        let reply = self
            .store
            .run_script(
                Script::CompareAndDelete,
                &[key.to_string()],
                &[value.to_string()],
            )
            .await?;

        match reply.first().and_then(ScriptValue::as_i64) {
            Some(deleted) => Ok(deleted > 0),
            None => CorruptedSnafu {
                key,
                reason: format!("unexpected compare-and-delete reply: {reply:?}"),
            }
            .fail(),
        }
    }

    // Not atomic: the key can change hands between the read and the delete.
    async fn get_then_delete(&self, key: &str, value: &str) -> Result<bool, StoreError> {
        match self.store.get(key).await? {
            Some(current) if current == value => self.store.delete(key).await,
            _ => Ok(false),
        }
    }
}
