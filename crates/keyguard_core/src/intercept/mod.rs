//! Declarative guards around arbitrary async operations.
//!
//! A guard reads a policy, expands the policy's key template against the call's [`Parameters`],
//! consults the [`RateLimiter`] or the [`MutexLock`] and only then runs the operation. Denials
//! become [`GuardError::RateLimited`] or [`GuardError::LockBusy`].
//!
//! Use [`Interceptor`] directly around a future, or [`RateLimitLayer`] and [`LockLayer`] to guard a
//! `tower::Service` whose requests implement [`Invocation`].

mod layer;
mod policy;

use std::{future::Future, sync::Arc};

use serde::Serialize;
use serde_json::Value;
use snafu::{ResultExt, ensure};
use tokio_util::sync::CancellationToken;

pub use self::{
    layer::{LockLayer, Locked, RateLimit, RateLimitLayer},
    policy::{LockPolicy, RateLimitPolicy, ReleaseMode, TimeUnit},
};
use crate::{
    config::KeyguardSettings,
    error::{GuardError, InvalidPolicySnafu, LockBusySnafu, RateLimitedSnafu, StoreSnafu},
    internal_event::{GuardRejected, InternalEvent},
    mutex::MutexLock,
    placeholder,
    rate_limiter::RateLimiter,
    store::{Store, StoreError},
};

/// Named arguments of a guarded call, in declaration order.
///
/// Placeholders such as `${order.id}` are looked up by the first segment's name and then walked
/// through nested members.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Parameters {
    names: Vec<String>,
    values: Vec<Value>,
}

impl Parameters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.names.push(name.into());
        self.values.push(value.into());
        self
    }

    /// Adds any serializable value, e.g. a request struct whose fields keys refer to.
    pub fn with_serialized<T: Serialize + ?Sized>(
        self,
        name: impl Into<String>,
        value: &T,
    ) -> Result<Self, serde_json::Error> {
        let value = serde_json::to_value(value)?;
        Ok(self.with(name, value))
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Expands every `${...}` placeholder in `template`.
    pub fn resolve(&self, template: &str) -> String {
        placeholder::resolve(template, &self.names, &self.values)
    }
}

/// A request that carries the parameters its guard keys are resolved against.
pub trait Invocation {
    fn parameters(&self) -> &Parameters;
}

impl Invocation for Parameters {
    fn parameters(&self) -> &Parameters {
        self
    }
}

/// A service request paired with its guard parameters.
#[derive(Clone, Debug, PartialEq)]
pub struct Call<T> {
    pub parameters: Parameters,
    pub payload: T,
}

impl<T> Call<T> {
    pub fn new(parameters: Parameters, payload: T) -> Self {
        Self {
            parameters,
            payload,
        }
    }
}

impl<T> Invocation for Call<T> {
    fn parameters(&self) -> &Parameters {
        &self.parameters
    }
}

/// A lock taken by [`Interceptor::acquire_lock`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeldLock {
    key: String,
    token: String,
    mode: ReleaseMode,
}

impl HeldLock {
    /// The resolved key, before prefixing.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn release_mode(&self) -> ReleaseMode {
        self.mode
    }
}

/// Applies rate-limit and lock policies around operations.
///
/// Cheap to clone; clones share the same engines.
#[derive(Clone)]
pub struct Interceptor {
    limiter: Arc<RateLimiter>,
    mutex: Arc<MutexLock>,
}

impl Interceptor {
    pub fn new(limiter: Arc<RateLimiter>, mutex: Arc<MutexLock>) -> Self {
        Self { limiter, mutex }
    }

    /// Builds both engines over `store`, probing it once for each.
    pub async fn connect(
        store: Arc<dyn Store>,
        settings: &KeyguardSettings,
    ) -> Result<Self, StoreError> {
        let limiter = RateLimiter::new(Arc::clone(&store), settings).await?;
        let mutex = MutexLock::new(store, settings).await?;
        Ok(Self::new(Arc::new(limiter), Arc::new(mutex)))
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn mutex(&self) -> &MutexLock {
        &self.mutex
    }

    /// Takes the policy's tokens or rejects the call.
    pub async fn check_rate_limit(
        &self,
        policy: &RateLimitPolicy,
        parameters: &Parameters,
    ) -> Result<(), GuardError> {
        policy.validate()?;
        let key = resolve_key(&policy.key, parameters)?;

        let granted = self
            .limiter
            .acquire(
                &key,
                policy.quota,
                policy.period(),
                policy.quantity,
                policy.effective_capacity(),
            )
            .await
            .inspect_err(|error| log_store_failure(&key, error))
            .context(StoreSnafu { key: &key })?;

        if granted {
            Ok(())
        } else {
            GuardRejected {
                key: &key,
                reason: "rate_limited",
            }
            .emit();
            RateLimitedSnafu {
                key,
                message: &policy.message,
            }
            .fail()
        }
    }

    /// Runs `operation` only if the rate limit admits the call.
    ///
    /// `operation` is not polled when the call is rejected, so it should be lazy (an `async`
    /// block or an unstarted future).
    pub async fn rate_limited<F, T, E>(
        &self,
        policy: &RateLimitPolicy,
        parameters: &Parameters,
        operation: F,
    ) -> Result<T, GuardError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<crate::Error>,
    {
        self.check_rate_limit(policy, parameters).await?;
        operation.await.map_err(GuardError::inner)
    }

    /// Acquires the policy's lock with a fresh ownership token.
    ///
    /// A retry wait interrupted by `cancel` is reported as [`GuardError::LockBusy`].
    pub async fn acquire_lock(
        &self,
        policy: &LockPolicy,
        parameters: &Parameters,
        cancel: &CancellationToken,
    ) -> Result<HeldLock, GuardError> {
        policy.validate()?;
        let key = resolve_key(&policy.key, parameters)?;
        let token = MutexLock::new_token();

        let acquired = self
            .mutex
            .try_lock_until(&key, &token, policy.expiry(), policy.retry(), cancel)
            .await
            .inspect_err(|error| log_store_failure(&key, error))
            .context(StoreSnafu { key: &key })?;

        if acquired {
            Ok(HeldLock {
                key,
                token,
                mode: policy.release_mode,
            })
        } else {
            GuardRejected {
                key: &key,
                reason: "lock_busy",
            }
            .emit();
            LockBusySnafu {
                key,
                message: &policy.message,
            }
            .fail()
        }
    }

    /// Releases `held` according to its release mode.
    ///
    /// `Ok(false)` means the lock was no longer ours (or no longer there) when we got to it.
    pub async fn release_lock(&self, held: &HeldLock) -> Result<bool, GuardError> {
        let released = match held.mode {
            ReleaseMode::Owned => self.mutex.unlock(&held.key, &held.token).await,
            ReleaseMode::Unconditional => self.mutex.unlock_unconditional(&held.key).await,
        };
        released
            .inspect_err(|error| log_store_failure(&held.key, error))
            .context(StoreSnafu { key: &held.key })
    }

    /// Runs `operation` while holding the policy's lock.
    pub async fn locked<F, T, E>(
        &self,
        policy: &LockPolicy,
        parameters: &Parameters,
        operation: F,
    ) -> Result<T, GuardError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<crate::Error>,
    {
        self.locked_until(policy, parameters, &CancellationToken::new(), operation)
            .await
    }

    /// Like [`Interceptor::locked`], with a cancellable acquisition.
    pub async fn locked_until<F, T, E>(
        &self,
        policy: &LockPolicy,
        parameters: &Parameters,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, GuardError>
    where
        F: Future<Output = Result<T, E>>,
        E: Into<crate::Error>,
    {
        let held = self.acquire_lock(policy, parameters, cancel).await?;
        let result = operation.await.map_err(GuardError::inner);
        self.finish(policy, &held).await;
        result
    }

    // Post-operation release. A failed release leaves the record to its TTL and never replaces the
    // operation's own result.
    pub(crate) async fn finish(&self, policy: &LockPolicy, held: &HeldLock) {
        if !policy.auto_unlock {
            return;
        }
        match self.release_lock(held).await {
            Ok(true) => {}
            Ok(false) => warn!(
                message = "Lock was gone before release; it likely expired while the operation ran.",
                key = %held.key
            ),
            Err(error) => error!(
                message = "Failed to release lock; it will expire on its own.",
                key = %held.key,
                %error
            ),
        }
    }
}

fn resolve_key(template: &str, parameters: &Parameters) -> Result<String, GuardError> {
    let key = parameters.resolve(template);
    ensure!(
        !key.is_empty(),
        InvalidPolicySnafu {
            reason: format!("key template '{template}' resolved to an empty key"),
        }
    );
    Ok(key)
}

fn log_store_failure(key: &str, error: &StoreError) {
    error!(message = "Store failure while guarding a call.", key = %key, error = %error);
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use serde_json::json;

    use super::*;
    use crate::store::MemoryStore;

    async fn interceptor(store: &MemoryStore) -> Interceptor {
        Interceptor::connect(
            Arc::new(store.clone()),
            &KeyguardSettings::builder().key_prefix("svc").build(),
        )
        .await
        .unwrap()
    }

    fn user(id: &str) -> Parameters {
        Parameters::new().with("user", json!({ "id": id }))
    }

    #[test]
    fn parameters_resolve_nested_members() {
        #[derive(Serialize)]
        struct Order {
            id: u64,
            sku: &'static str,
        }

        let parameters = Parameters::new()
            .with("tenant", "acme")
            .with_serialized("order", &Order { id: 42, sku: "X-1" })
            .unwrap();

        assert_eq!(parameters.names(), ["tenant", "order"]);
        assert_eq!(
            parameters.resolve("${tenant}:${order.sku}:${order.id}"),
            "acme:X-1:42"
        );
    }

    #[tokio::test]
    async fn rate_limited_admits_up_to_quota() {
        let store = MemoryStore::new();
        let guard = interceptor(&store).await;
        let policy = RateLimitPolicy::builder()
            .key("login:${user.id}")
            .quota(2)
            .period(1)
            .period_unit(TimeUnit::Minutes)
            .message("too many logins")
            .build();
        let runs = AtomicUsize::new(0);

        for _ in 0..2 {
            let value = guard
                .rate_limited(&policy, &user("u1"), async {
                    runs.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, GuardError>("ok")
                })
                .await
                .unwrap();
            assert_eq!(value, "ok");
        }

        let error = guard
            .rate_limited(&policy, &user("u1"), async {
                runs.fetch_add(1, Ordering::SeqCst);
                Ok::<_, GuardError>("ok")
            })
            .await
            .unwrap_err();

        assert!(error.is_rejection());
        assert_eq!(error.to_string(), "too many logins");
        assert_eq!(error.key(), Some("login:u1"));
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert!(store.contains_key("svc:login:u1"));
    }

    #[tokio::test]
    async fn keys_are_resolved_per_call() {
        let store = MemoryStore::new();
        let guard = interceptor(&store).await;
        let policy = RateLimitPolicy::builder()
            .key("login:${user.id}")
            .quota(1)
            .build();

        guard.check_rate_limit(&policy, &user("a")).await.unwrap();
        guard.check_rate_limit(&policy, &user("b")).await.unwrap();
        assert!(guard.check_rate_limit(&policy, &user("a")).await.is_err());
    }

    #[tokio::test]
    async fn operation_errors_are_wrapped() {
        let store = MemoryStore::new();
        let guard = interceptor(&store).await;
        let policy = RateLimitPolicy::builder().key("k").quota(5).build();

        let error = guard
            .rate_limited(&policy, &Parameters::new(), async {
                Err::<(), _>(std::io::Error::other("disk full"))
            })
            .await
            .unwrap_err();

        assert!(matches!(error, GuardError::Inner { .. }));
        assert!(!error.is_rejection());
    }

    #[tokio::test]
    async fn store_outage_is_not_a_rejection() {
        let store = MemoryStore::new();
        let guard = interceptor(&store).await;
        store.set_available(false);

        let policy = RateLimitPolicy::builder().key("k").quota(5).build();
        let error = guard
            .check_rate_limit(&policy, &Parameters::new())
            .await
            .unwrap_err();
        assert!(matches!(error, GuardError::Store { .. }));

        let policy = LockPolicy::builder().key("k").build();
        let error = guard
            .acquire_lock(&policy, &Parameters::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(error, GuardError::Store { .. }));
    }

    #[tokio::test]
    async fn empty_resolved_key_is_invalid() {
        let store = MemoryStore::new();
        let guard = interceptor(&store).await;
        let policy = RateLimitPolicy::builder().key("${missing}").quota(5).build();

        let error = guard
            .check_rate_limit(&policy, &Parameters::new())
            .await
            .unwrap_err();
        assert!(matches!(error, GuardError::InvalidPolicy { .. }));
    }

    #[tokio::test]
    async fn invalid_policy_never_touches_the_store() {
        let store = MemoryStore::new();
        let guard = interceptor(&store).await;
        let policy = RateLimitPolicy::builder().key("k").quota(0).build();

        assert!(matches!(
            guard.check_rate_limit(&policy, &Parameters::new()).await,
            Err(GuardError::InvalidPolicy { .. })
        ));
        assert!(!store.contains_key("svc:k"));
    }

    #[tokio::test]
    async fn locked_releases_after_the_operation() {
        let store = MemoryStore::new();
        let guard = interceptor(&store).await;
        let policy = LockPolicy::builder().key("order:${order}").build();
        let parameters = Parameters::new().with("order", 7);

        let value = guard
            .locked(&policy, &parameters, async {
                assert!(store.contains_key("svc:order:7"));
                Ok::<_, GuardError>(7)
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert!(!store.contains_key("svc:order:7"));
    }

    #[tokio::test]
    async fn locked_releases_after_a_failed_operation() {
        let store = MemoryStore::new();
        let guard = interceptor(&store).await;
        let policy = LockPolicy::builder().key("job").build();

        let result = guard
            .locked(&policy, &Parameters::new(), async {
                Err::<(), _>(std::io::Error::other("boom"))
            })
            .await;

        assert!(matches!(result, Err(GuardError::Inner { .. })));
        assert!(!store.contains_key("svc:job"));
    }

    #[tokio::test]
    async fn held_lock_rejects_a_second_caller() {
        let store = MemoryStore::new();
        let guard = interceptor(&store).await;
        let policy = LockPolicy::builder()
            .key("job")
            .message("job already running")
            .build();

        let held = guard
            .acquire_lock(&policy, &Parameters::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(held.key(), "job");

        let error = guard
            .locked(&policy, &Parameters::new(), async { Ok::<_, GuardError>(()) })
            .await
            .unwrap_err();
        assert!(matches!(error, GuardError::LockBusy { .. }));
        assert_eq!(error.to_string(), "job already running");

        assert!(guard.release_lock(&held).await.unwrap());
        guard
            .locked(&policy, &Parameters::new(), async { Ok::<_, GuardError>(()) })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn without_auto_unlock_the_ttl_reclaims() {
        let store = MemoryStore::new();
        let guard = interceptor(&store).await;
        let policy = LockPolicy::builder()
            .key("report")
            .expire(10)
            .auto_unlock(false)
            .build();

        guard
            .locked(&policy, &Parameters::new(), async { Ok::<_, GuardError>(()) })
            .await
            .unwrap();

        assert!(store.contains_key("svc:report"));
        let ttl = store.ttl("svc:report").unwrap();
        assert!(ttl <= Duration::from_secs(10) && ttl > Duration::from_secs(9));
    }

    #[tokio::test]
    async fn owned_release_keeps_a_successors_lock() {
        let store = MemoryStore::new();
        let guard = interceptor(&store).await;
        let policy = LockPolicy::builder().key("job").build();

        let held = guard
            .acquire_lock(&policy, &Parameters::new(), &CancellationToken::new())
            .await
            .unwrap();
        // Simulate expiry followed by another holder.
        guard.mutex().unlock_unconditional("job").await.unwrap();
        assert!(
            guard
                .mutex()
                .try_lock("job", "successor", Duration::from_secs(30), Default::default())
                .await
                .unwrap()
        );

        assert!(!guard.release_lock(&held).await.unwrap());
        assert!(store.contains_key("svc:job"));

        let blind = HeldLock {
            mode: ReleaseMode::Unconditional,
            ..held
        };
        assert!(guard.release_lock(&blind).await.unwrap());
        assert!(!store.contains_key("svc:job"));
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_acquisition_is_busy() {
        let store = MemoryStore::new();
        let guard = interceptor(&store).await;
        let policy = LockPolicy::builder()
            .key("job")
            .retries(100)
            .retry_interval(1)
            .retry_interval_unit(TimeUnit::Seconds)
            .build();

        let _held = guard
            .acquire_lock(&policy, &Parameters::new(), &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        let error = guard
            .locked_until(&policy, &Parameters::new(), &cancel, async {
                Ok::<_, GuardError>(())
            })
            .await
            .unwrap_err();
        assert!(matches!(error, GuardError::LockBusy { .. }));
    }
}
