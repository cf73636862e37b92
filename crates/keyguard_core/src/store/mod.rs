//! The key-value store both primitives coordinate through.
//!
//! Implementations are expected to be cheap to share (`Arc<dyn Store>`) and to surface transport
//! failures as [`StoreError::Unavailable`] so callers can tell them apart from a legitimate
//! denial.

mod memory;
mod script;

use std::time::Duration;

use async_trait::async_trait;
use snafu::Snafu;

pub use memory::MemoryStore;
pub use script::{Script, ScriptValue};

/// Failures reported by a [`Store`].
///
/// The context selectors are public so store implementations outside this crate build their
/// errors the same way.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum StoreError {
    /// The store could not be reached or the request timed out.
    #[snafu(display("store unavailable: {reason}"))]
    Unavailable { reason: String },

    /// Server-side scripting is disabled or not implemented by the store.
    #[snafu(display("store does not support scripting: {reason}"))]
    ScriptingUnsupported { reason: String },

    /// A record or reply did not have the expected shape.
    #[snafu(display("corrupted data in key '{key}': {reason}"))]
    Corrupted { key: String, reason: String },

    /// The caller passed arguments the engines refuse to act on.
    #[snafu(display("invalid argument: {reason}"))]
    InvalidArgument { reason: String },

    /// Any other error reported by the store client.
    #[snafu(display("store backend error: {source}"))]
    Backend { source: crate::Error },
}

impl StoreError {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        UnavailableSnafu { reason }.build()
    }

    pub const fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }

    pub const fn is_scripting_unsupported(&self) -> bool {
        matches!(self, StoreError::ScriptingUnsupported { .. })
    }
}

/// Capabilities the rate limiter and the lock need from the shared store.
///
/// Scripting is optional: the default [`Store::probe_scripting`] reports it as absent and the
/// default [`Store::run_script`] refuses with [`StoreError::ScriptingUnsupported`].
#[async_trait]
pub trait Store: Send + Sync {
    /// Reads a string value.
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Writes hash fields, creating the hash if needed. An existing TTL is kept.
    async fn set_hash_fields(&self, key: &str, fields: &[(String, String)])
    -> Result<(), StoreError>;

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError>;

    /// Sets a TTL on an existing key. Missing keys are ignored.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError>;

    /// Stores `value` with `ttl` only if `key` does not exist. Returns whether it was stored.
    async fn set_if_absent(&self, key: &str, value: &str, ttl: Duration)
    -> Result<bool, StoreError>;

    /// Removes `key`. Returns whether something was removed.
    async fn delete(&self, key: &str) -> Result<bool, StoreError>;

    /// Checks whether [`Store::run_script`] is usable.
    ///
    /// Must return `Ok(false)` when scripting is unsupported and `Err` only for transport
    /// failures, so that an outage is not mistaken for a missing capability.
    async fn probe_scripting(&self) -> Result<bool, StoreError> {
        Ok(false)
    }

    /// Runs `script` atomically with respect to every other client of the store.
    async fn run_script(
        &self,
        script: Script,
        _keys: &[String],
        _args: &[String],
    ) -> Result<Vec<ScriptValue>, StoreError> {
        ScriptingUnsupportedSnafu {
            reason: format!("no script runner for {}", script.name()),
        }
        .fail()
    }
}
