//! Distributed rate limiting and mutual exclusion over a shared key-value store
//!
//! Two primitives share one [`store::Store`] abstraction:
//!
//! - [`rate_limiter::RateLimiter`]: a token bucket per key with lazy refill. It runs as one atomic
//!   server-side script when the store supports scripting, and as a read-compute-write under a
//!   process-local lock otherwise.
//! - [`mutex::MutexLock`]: a TTL'd set-if-absent lock with bounded retries and an owned
//!   compare-and-delete release.
//!
//! [`intercept`] wraps both behind declarative policies whose keys are templates such as
//! `order:${order.id}`, either around a single future or as tower layers.
//!
//! # Basic Usage
//! ```
//! # tokio_test::block_on(async {
//! use std::sync::Arc;
//!
//! use keyguard_core::{
//!     config::KeyguardSettings,
//!     intercept::{Interceptor, Parameters, RateLimitPolicy},
//!     store::MemoryStore,
//! };
//!
//! let settings = KeyguardSettings::builder().key_prefix("billing").build();
//! let guard = Interceptor::connect(Arc::new(MemoryStore::new()), &settings)
//!     .await
//!     .unwrap();
//!
//! let policy = RateLimitPolicy::builder()
//!     .key("invoice:${customer}")
//!     .quota(10)
//!     .build();
//! let parameters = Parameters::new().with("customer", "c-17");
//!
//! let total = guard
//!     .rate_limited(&policy, &parameters, async { Ok::<_, std::io::Error>(42) })
//!     .await
//!     .unwrap();
//! assert_eq!(total, 42);
//! # });
//! ```
//!
//! # Metrics
//! Emits metrics via the `InternalEvent` trait, see [`internal_event`].
pub mod clock;
pub mod config;
pub mod error;
pub mod intercept;
pub mod internal_event;
pub mod key;
pub mod mutex;
pub mod placeholder;
pub mod rate_limiter;
pub mod store;

#[macro_use]
extern crate tracing;

pub use crate::{
    config::{FallbackMode, KeyguardSettings},
    error::GuardError,
    intercept::Interceptor,
    mutex::{MutexLock, RetryPolicy},
    rate_limiter::{RateLimiter, Strategy},
    store::{MemoryStore, Store, StoreError},
};

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
