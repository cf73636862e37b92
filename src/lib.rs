//! Distributed token-bucket rate limiting and mutual exclusion
//!
//! Facade over the workspace crates:
//!
//! - [`keyguard_core`]: the engines, the `Store` abstraction, an in-memory store and the
//!   policy-driven interceptor with its tower layers.
//! - [`keyguard_redis`]: the Redis-backed store and environment-driven configuration.
//!
//! # Configuration
//! See [`RedisStoreConfig`] for the environment variables read by [`RedisStoreConfig::from_env`].
pub use keyguard_core;
pub use keyguard_redis;

pub use keyguard_core::{
    Error, FallbackMode, GuardError, Interceptor, KeyguardSettings, MemoryStore, MutexLock,
    RateLimiter, RetryPolicy, Store, StoreError, Strategy,
    intercept::{
        Call, Invocation, LockLayer, LockPolicy, Parameters, RateLimitLayer, RateLimitPolicy,
        ReleaseMode, TimeUnit,
    },
};
pub use keyguard_redis::{RedisStore, RedisStoreConfig, connect_interceptor};
