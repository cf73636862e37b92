//! Redis backend for `keyguard_core`
//!
//! [`RedisStore`] implements [`keyguard_core::store::Store`] on a shared
//! [`redis::aio::ConnectionManager`]. Bucket updates and owned unlocks run as cached Lua scripts
//! (`EVALSHA` with an `EVAL` fallback), so every process sharing the server sees one serialised
//! history per key.
//!
//! ```no_run
//! # async fn run() -> Result<(), keyguard_core::StoreError> {
//! use keyguard_redis::{RedisStoreConfig, connect_interceptor};
//!
//! let guard = connect_interceptor(&RedisStoreConfig::from_env()).await?;
//! assert_eq!(guard.rate_limiter().strategy(), keyguard_core::Strategy::Atomic);
//! # Ok(())
//! # }
//! ```
mod config;
mod store;

#[macro_use]
extern crate tracing;

use std::sync::Arc;

use keyguard_core::{Interceptor, StoreError};

pub use crate::{
    config::{
        ENV_CONNECTION_TIMEOUT_MS, ENV_KEY_PREFIX, ENV_REDIS_URL, ENV_RESPONSE_TIMEOUT_MS,
        RedisStoreConfig,
    },
    store::RedisStore,
};

/// Connects to Redis and builds an [`Interceptor`] in the configured namespace.
pub async fn connect_interceptor(config: &RedisStoreConfig) -> Result<Interceptor, StoreError> {
    let store = RedisStore::connect(config).await?;
    Interceptor::connect(Arc::new(store), &config.settings()).await
}
