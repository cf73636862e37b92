use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
    sync::LazyLock,
};

use tokio::sync::Mutex;

use super::bucket::{self, BucketRequest, BucketState, LAST_REFILL_FIELD, TOKENS_FIELD};
use crate::store::{CorruptedSnafu, Script, ScriptValue, Store, StoreError};

/// How a rate limiter runs the token-bucket step against the store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// One server-side script per call; serialised per key across every process.
    Atomic,
    /// Read, compute, write under a process-local lock. Processes sharing a key can over-grant.
    Fallback,
}

impl Strategy {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Strategy::Atomic => "atomic",
            Strategy::Fallback => "fallback",
        }
    }
}

pub(super) async fn acquire_atomic(
    store: &dyn Store,
    key: &str,
    request: &BucketRequest,
    now: i64,
) -> Result<bool, StoreError> {
    let reply = store
        .run_script(
            Script::TokenBucket,
            &[key.to_string()],
            &request.script_args(now),
        )
        .await?;

    match reply.first().and_then(ScriptValue::as_i64) {
        Some(granted) => Ok(granted == 1),
        None => CorruptedSnafu {
            key,
            reason: format!("unexpected token bucket reply: {reply:?}"),
        }
        .fail(),
    }
}

const STRIPES: usize = 64;

static FALLBACK_STRIPES: LazyLock<FallbackStripes> = LazyLock::new(FallbackStripes::new);

/// Process-wide critical sections for the fallback strategy.
///
/// A fixed arena of async mutexes indexed by the fully-qualified key's hash. Every limiter in the
/// process shares it, so callers on the same key always serialise, callers on different keys
/// mostly don't, and the arena never grows.
pub(super) struct FallbackStripes {
    stripes: Box<[Mutex<()>]>,
}

impl FallbackStripes {
    pub(super) fn shared() -> &'static FallbackStripes {
        &FALLBACK_STRIPES
    }

    fn new() -> Self {
        Self {
            stripes: (0..STRIPES).map(|_| Mutex::new(())).collect(),
        }
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.stripes[hasher.finish() as usize % self.stripes.len()]
    }

    pub(super) async fn acquire(
        &self,
        store: &dyn Store,
        key: &str,
        request: &BucketRequest,
        now: i64,
    ) -> Result<bool, StoreError> {
        let _section = self.stripe(key).lock().await;

        let tokens = store.get_hash_field(key, TOKENS_FIELD).await?;
        let last_refill = store.get_hash_field(key, LAST_REFILL_FIELD).await?;
        let current = BucketState::from_fields(key, tokens.as_deref(), last_refill.as_deref());

        let decision = bucket::apply(current, request, now);
        if decision.dirty {
            store
                .set_hash_fields(key, &decision.state.to_fields())
                .await?;
            store.expire(key, request.period).await?;
        }

        Ok(decision.granted)
    }
}
