use std::{
    sync::Arc,
    task::{Context, Poll},
};

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tower::{Layer, Service};

use super::{Interceptor, Invocation, LockPolicy, RateLimitPolicy};
use crate::error::GuardError;

/// Rate limits every request of the wrapped service with one policy.
#[derive(Clone)]
pub struct RateLimitLayer {
    interceptor: Interceptor,
    policy: Arc<RateLimitPolicy>,
}

impl RateLimitLayer {
    pub fn new(interceptor: Interceptor, policy: RateLimitPolicy) -> Self {
        Self {
            interceptor,
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for RateLimitLayer {
    type Service = RateLimit<S>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimit {
            inner,
            interceptor: self.interceptor.clone(),
            policy: Arc::clone(&self.policy),
        }
    }
}

#[derive(Clone)]
pub struct RateLimit<S> {
    inner: S,
    interceptor: Interceptor,
    policy: Arc<RateLimitPolicy>,
}

impl<S, R> Service<R> for RateLimit<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send,
    S::Response: Send + 'static,
    S::Error: Into<crate::Error>,
    R: Invocation + Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::inner)
    }

    fn call(&mut self, request: R) -> Self::Future {
        // The ready clone stays behind for the next call.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let interceptor = self.interceptor.clone();
        let policy = Arc::clone(&self.policy);

        Box::pin(async move {
            interceptor
                .check_rate_limit(&policy, request.parameters())
                .await?;
            inner.call(request).await.map_err(GuardError::inner)
        })
    }
}

/// Serialises requests of the wrapped service that resolve to the same lock key.
#[derive(Clone)]
pub struct LockLayer {
    interceptor: Interceptor,
    policy: Arc<LockPolicy>,
}

impl LockLayer {
    pub fn new(interceptor: Interceptor, policy: LockPolicy) -> Self {
        Self {
            interceptor,
            policy: Arc::new(policy),
        }
    }
}

impl<S> Layer<S> for LockLayer {
    type Service = Locked<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Locked {
            inner,
            interceptor: self.interceptor.clone(),
            policy: Arc::clone(&self.policy),
        }
    }
}

#[derive(Clone)]
pub struct Locked<S> {
    inner: S,
    interceptor: Interceptor,
    policy: Arc<LockPolicy>,
}

impl<S, R> Service<R> for Locked<S>
where
    S: Service<R> + Clone + Send + 'static,
    S::Future: Send,
    S::Response: Send + 'static,
    S::Error: Into<crate::Error>,
    R: Invocation + Send + 'static,
{
    type Response = S::Response;
    type Error = GuardError;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(GuardError::inner)
    }

    fn call(&mut self, request: R) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let interceptor = self.interceptor.clone();
        let policy = Arc::clone(&self.policy);

        Box::pin(async move {
            let held = interceptor
                .acquire_lock(&policy, request.parameters(), &CancellationToken::new())
                .await?;
            // The inner call may start work eagerly, so it only happens once the lock is ours.
            let result = inner.call(request).await.map_err(GuardError::inner);
            interceptor.finish(&policy, &held).await;
            result
        })
    }
}
