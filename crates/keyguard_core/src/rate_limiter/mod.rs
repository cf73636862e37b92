//! Token-bucket rate limiting against the shared store.

pub mod bucket;
mod strategy;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

pub use strategy::Strategy;

use self::{bucket::BucketRequest, strategy::FallbackStripes};
use crate::{
    clock::{Clock, SystemClock},
    config::{FallbackMode, KeyguardSettings},
    internal_event::{InternalEvent, RateLimitDecision, RateLimitFallback},
    key::KeyCodec,
    store::{Store, StoreError},
};

/// Distributed token-bucket rate limiter.
///
/// The execution strategy is chosen once, by probing the store for scripting support when the
/// limiter is built. An atomic limiter only demotes itself to the fallback strategy when the store
/// later says scripting is unsupported; with [`FallbackMode::OnAnyError`] any atomic-path error
/// also routes that single call through the fallback.
///
/// The fallback strategy is only safe against concurrent callers in this process; its critical
/// sections are shared by every limiter in the process.
pub struct RateLimiter {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    codec: KeyCodec,
    fallback_mode: FallbackMode,
    atomic: AtomicBool,
}

impl RateLimiter {
    pub async fn new(store: Arc<dyn Store>, settings: &KeyguardSettings) -> Result<Self, StoreError> {
        Self::with_clock(store, Arc::new(SystemClock), settings).await
    }

    pub async fn with_clock(
        store: Arc<dyn Store>,
        clock: Arc<dyn Clock>,
        settings: &KeyguardSettings,
    ) -> Result<Self, StoreError> {
        let atomic = store.probe_scripting().await?;
        if !atomic {
            warn!(
                message = "Store has no scripting support; rate limiting is only serialised within this process.",
                key_prefix = %settings.key_prefix()
            );
        }

        Ok(Self {
            store,
            clock,
            codec: KeyCodec::new(settings.key_prefix()),
            fallback_mode: settings.fallback_mode(),
            atomic: AtomicBool::new(atomic),
        })
    }

    pub fn strategy(&self) -> Strategy {
        if self.atomic.load(Ordering::Relaxed) {
            Strategy::Atomic
        } else {
            Strategy::Fallback
        }
    }

    pub fn key_prefix(&self) -> &str {
        self.codec.prefix()
    }

    /// Takes `quantity` tokens from the bucket at `key` if it holds at least that many.
    ///
    /// Returns `Ok(false)` on a denial and `Err` when the store could not be consulted. `capacity`
    /// must already be defaulted by the caller (`0` is rejected).
    pub async fn acquire(
        &self,
        key: &str,
        quota: u64,
        period: Duration,
        quantity: u64,
        capacity: u64,
    ) -> Result<bool, StoreError> {
        let request = BucketRequest {
            quota,
            period,
            quantity,
            capacity,
        };
        request.validate()?;

        let key = self.codec.encode(key);
        let now = self.clock.now_unix_secs();

        let (strategy, granted) = match self.strategy() {
            Strategy::Atomic => {
                match strategy::acquire_atomic(self.store.as_ref(), &key, &request, now).await {
                    Ok(granted) => (Strategy::Atomic, granted),
                    Err(error) if self.falls_back_on(&error) => {
                        let demoted = error.is_scripting_unsupported();
                        if demoted {
                            self.atomic.store(false, Ordering::Relaxed);
                        }
                        RateLimitFallback {
                            key: &key,
                            error: &error,
                            demoted,
                        }
                        .emit();
                        (Strategy::Fallback, self.acquire_fallback(&key, &request, now).await?)
                    }
                    Err(error) => return Err(error),
                }
            }
            Strategy::Fallback => (Strategy::Fallback, self.acquire_fallback(&key, &request, now).await?),
        };

        RateLimitDecision {
            key: &key,
            strategy,
            granted,
        }
        .emit();
        Ok(granted)
    }

    async fn acquire_fallback(
        &self,
        key: &str,
        request: &BucketRequest,
        now: i64,
    ) -> Result<bool, StoreError> {
        FallbackStripes::shared()
            .acquire(self.store.as_ref(), key, request, now)
            .await
    }

    fn falls_back_on(&self, error: &StoreError) -> bool {
        match self.fallback_mode {
            FallbackMode::OnUnsupported => error.is_scripting_unsupported(),
            FallbackMode::OnAnyError => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        clock::ManualClock,
        store::{MemoryStore, Script, ScriptValue},
    };

    const START: i64 = 1_700_000_000;

    async fn limiter(store: MemoryStore, clock: &ManualClock) -> RateLimiter {
        RateLimiter::with_clock(
            Arc::new(store),
            Arc::new(clock.clone()),
            &KeyguardSettings::builder().key_prefix("rl").build(),
        )
        .await
        .unwrap()
    }

    fn stores() -> [MemoryStore; 2] {
        [MemoryStore::new(), MemoryStore::without_scripting()]
    }

    #[tokio::test]
    async fn strategy_follows_the_probe() {
        let clock = ManualClock::new(START);
        assert_eq!(
            limiter(MemoryStore::new(), &clock).await.strategy(),
            Strategy::Atomic
        );
        assert_eq!(
            limiter(MemoryStore::without_scripting(), &clock)
                .await
                .strategy(),
            Strategy::Fallback
        );
    }

    #[tokio::test]
    async fn fresh_key_starts_full() {
        for store in stores() {
            let clock = ManualClock::new(START);
            let limiter = limiter(store, &clock).await;
            assert!(limiter
                .acquire("fresh", 10, Duration::from_secs(1), 1, 10)
                .await
                .unwrap());
        }
    }

    #[tokio::test]
    async fn exhaustion_then_refill() {
        for store in stores() {
            let clock = ManualClock::new(START);
            let limiter = limiter(store.clone(), &clock).await;
            let period = Duration::from_secs(60);

            for _ in 0..4 {
                assert!(limiter.acquire("orders", 4, period, 1, 4).await.unwrap());
            }
            assert!(!limiter.acquire("orders", 4, period, 1, 4).await.unwrap());

            clock.advance(period);
            assert!(limiter.acquire("orders", 4, period, 1, 4).await.unwrap());
            assert_eq!(
                store
                    .get_hash_field("rl:orders", bucket::TOKENS_FIELD)
                    .await
                    .unwrap()
                    .as_deref(),
                Some("3")
            );
        }
    }

    #[tokio::test]
    async fn tokens_never_exceed_capacity() {
        for store in stores() {
            let clock = ManualClock::new(START);
            let limiter = limiter(store.clone(), &clock).await;
            let period = Duration::from_secs(1);

            assert!(limiter.acquire("burst", 100, period, 1, 3).await.unwrap());
            clock.advance(Duration::from_secs(3_600));

            let mut granted = 0;
            while limiter.acquire("burst", 100, period, 1, 3).await.unwrap() {
                granted += 1;
            }
            assert_eq!(granted, 3);

            let stored: f64 = store
                .get_hash_field("rl:burst", bucket::TOKENS_FIELD)
                .await
                .unwrap()
                .unwrap()
                .parse()
                .unwrap();
            assert!((0.0..=3.0).contains(&stored));
        }
    }

    #[tokio::test]
    async fn multi_token_requests() {
        for store in stores() {
            let clock = ManualClock::new(START);
            let limiter = limiter(store, &clock).await;
            let period = Duration::from_secs(10);

            assert!(limiter.acquire("batch", 10, period, 6, 10).await.unwrap());
            assert!(!limiter.acquire("batch", 10, period, 6, 10).await.unwrap());
            assert!(limiter.acquire("batch", 10, period, 4, 10).await.unwrap());
            assert!(!limiter.acquire("batch", 10, period, 1, 10).await.unwrap());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn record_ttl_is_the_period() {
        for store in stores() {
            let clock = ManualClock::new(START);
            let limiter = limiter(store.clone(), &clock).await;
            limiter
                .acquire("ttl", 5, Duration::from_secs(30), 1, 5)
                .await
                .unwrap();
            assert_eq!(store.ttl("rl:ttl"), Some(Duration::from_secs(30)));
        }
    }

    #[tokio::test]
    async fn invalid_arguments_are_rejected() {
        let clock = ManualClock::new(START);
        let limiter = limiter(MemoryStore::new(), &clock).await;
        let error = limiter
            .acquire("k", 0, Duration::from_secs(1), 1, 1)
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::InvalidArgument { .. }));
        assert!(limiter
            .acquire("k", 1, Duration::from_secs(1), 1, 0)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn outage_is_an_error_not_a_denial() {
        for store in stores() {
            let clock = ManualClock::new(START);
            let limiter = limiter(store.clone(), &clock).await;
            store.set_available(false);
            let error = limiter
                .acquire("k", 1, Duration::from_secs(1), 1, 1)
                .await
                .unwrap_err();
            assert!(error.is_unavailable());
        }
    }

    #[tokio::test]
    async fn construction_fails_when_store_is_down() {
        let store = MemoryStore::new();
        store.set_available(false);
        let result = RateLimiter::new(Arc::new(store), &KeyguardSettings::default()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn concurrent_callers_in_one_process_never_over_grant() {
        for store in stores() {
            let clock = ManualClock::new(START);
            let limiter = Arc::new(limiter(store, &clock).await);

            let tasks: Vec<_> = (0..32)
                .map(|_| {
                    let limiter = Arc::clone(&limiter);
                    tokio::spawn(async move {
                        limiter
                            .acquire("hot", 10, Duration::from_secs(60), 1, 10)
                            .await
                            .unwrap()
                    })
                })
                .collect();

            let mut granted = 0;
            for task in tasks {
                if task.await.unwrap() {
                    granted += 1;
                }
            }
            assert_eq!(granted, 10);
        }
    }

    /// Yields to the scheduler before every round trip, like a networked store would.
    struct YieldingStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl Store for YieldingStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            tokio::task::yield_now().await;
            self.inner.get(key).await
        }

        async fn set_hash_fields(
            &self,
            key: &str,
            fields: &[(String, String)],
        ) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.inner.set_hash_fields(key, fields).await
        }

        async fn get_hash_field(
            &self,
            key: &str,
            field: &str,
        ) -> Result<Option<String>, StoreError> {
            tokio::task::yield_now().await;
            self.inner.get_hash_field(key, field).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
            tokio::task::yield_now().await;
            self.inner.expire(key, ttl).await
        }

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            tokio::task::yield_now().await;
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            tokio::task::yield_now().await;
            self.inner.delete(key).await
        }
    }

    #[tokio::test]
    async fn separate_limiters_share_the_fallback_sections() {
        let store: Arc<dyn Store> = Arc::new(YieldingStore {
            inner: MemoryStore::without_scripting(),
        });
        let clock = ManualClock::new(START);
        let settings = KeyguardSettings::builder().key_prefix("shared").build();
        let a = RateLimiter::with_clock(Arc::clone(&store), Arc::new(clock.clone()), &settings)
            .await
            .unwrap();
        let b = RateLimiter::with_clock(Arc::clone(&store), Arc::new(clock.clone()), &settings)
            .await
            .unwrap();
        assert_eq!(a.strategy(), Strategy::Fallback);
        assert_eq!(b.strategy(), Strategy::Fallback);

        let period = Duration::from_secs(60);
        // Leaves exactly one token in the bucket.
        assert!(a.acquire("seeded", 2, period, 1, 2).await.unwrap());

        let (from_a, from_b) = tokio::join!(
            a.acquire("seeded", 2, period, 1, 2),
            b.acquire("seeded", 2, period, 1, 2)
        );
        let granted = [from_a.unwrap(), from_b.unwrap()]
            .into_iter()
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 1);
    }

    /// Claims scripting on the probe, then refuses (or fails) every script call.
    struct FlakyScripts {
        inner: MemoryStore,
        unsupported: bool,
    }

    #[async_trait]
    impl Store for FlakyScripts {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn set_hash_fields(
            &self,
            key: &str,
            fields: &[(String, String)],
        ) -> Result<(), StoreError> {
            self.inner.set_hash_fields(key, fields).await
        }

        async fn get_hash_field(
            &self,
            key: &str,
            field: &str,
        ) -> Result<Option<String>, StoreError> {
            self.inner.get_hash_field(key, field).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
            self.inner.expire(key, ttl).await
        }

        async fn set_if_absent(
            &self,
            key: &str,
            value: &str,
            ttl: Duration,
        ) -> Result<bool, StoreError> {
            self.inner.set_if_absent(key, value, ttl).await
        }

        async fn delete(&self, key: &str) -> Result<bool, StoreError> {
            self.inner.delete(key).await
        }

        async fn probe_scripting(&self) -> Result<bool, StoreError> {
            Ok(true)
        }

        async fn run_script(
            &self,
            _script: Script,
            _keys: &[String],
            _args: &[String],
        ) -> Result<Vec<ScriptValue>, StoreError> {
            if self.unsupported {
                Err(StoreError::ScriptingUnsupported {
                    reason: "unknown command 'EVALSHA'".to_string(),
                })
            } else {
                Err(StoreError::unavailable("read timed out"))
            }
        }
    }

    async fn flaky_limiter(unsupported: bool, mode: FallbackMode) -> RateLimiter {
        let store = FlakyScripts {
            inner: MemoryStore::new(),
            unsupported,
        };
        RateLimiter::with_clock(
            Arc::new(store),
            Arc::new(ManualClock::new(START)),
            &KeyguardSettings::builder().fallback_mode(mode).build(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn unsupported_scripting_demotes_for_good() {
        let limiter = flaky_limiter(true, FallbackMode::OnUnsupported).await;
        assert_eq!(limiter.strategy(), Strategy::Atomic);

        assert!(limiter
            .acquire("k", 2, Duration::from_secs(60), 1, 2)
            .await
            .unwrap());
        assert_eq!(limiter.strategy(), Strategy::Fallback);
        assert!(limiter
            .acquire("k", 2, Duration::from_secs(60), 1, 2)
            .await
            .unwrap());
        assert!(!limiter
            .acquire("k", 2, Duration::from_secs(60), 1, 2)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn transient_atomic_errors_surface_by_default() {
        let limiter = flaky_limiter(false, FallbackMode::OnUnsupported).await;
        let error = limiter
            .acquire("k", 2, Duration::from_secs(60), 1, 2)
            .await
            .unwrap_err();
        assert!(error.is_unavailable());
        assert_eq!(limiter.strategy(), Strategy::Atomic);
    }

    #[tokio::test]
    async fn any_error_mode_falls_back_without_demoting() {
        let limiter = flaky_limiter(false, FallbackMode::OnAnyError).await;
        assert!(limiter
            .acquire("k", 2, Duration::from_secs(60), 1, 2)
            .await
            .unwrap());
        assert_eq!(limiter.strategy(), Strategy::Atomic);
    }
}
