use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use snafu::ensure;
use tokio::time::Instant;

use super::{
    CorruptedSnafu, InvalidArgumentSnafu, Script, ScriptValue, ScriptingUnsupportedSnafu, Store,
    StoreError, UnavailableSnafu,
};
use crate::rate_limiter::bucket::{self, BucketRequest, BucketState, LAST_REFILL_FIELD, TOKENS_FIELD};

#[derive(Clone, Debug)]
enum Value {
    Text(String),
    Hash(HashMap<String, String>),
}

#[derive(Clone, Debug)]
struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline <= now)
    }
}

/// An in-process [`Store`] for tests and single-process deployments.
///
/// TTLs run on the tokio clock, so paused-time tests can expire records with
/// `tokio::time::advance`. Scripts are executed natively under the store's lock, which gives them
/// the same all-or-nothing behaviour a server-side script has. Clones share the same data.
#[derive(Clone, Debug)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    scripting: bool,
    available: Arc<AtomicBool>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            scripting: true,
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A store that refuses [`Store::run_script`], forcing the engines onto their fallback paths.
    pub fn without_scripting() -> Self {
        Self {
            scripting: false,
            ..Self::new()
        }
    }

    /// Simulates an outage: while unavailable every operation fails with
    /// [`StoreError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Remaining time to live of `key`, if it exists and has one.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut entries = self.lock();
        live(&mut entries, key, now)?
            .expires_at
            .map(|deadline| deadline.saturating_duration_since(now))
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let mut entries = self.lock();
        live(&mut entries, key, Instant::now()).is_some()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        ensure!(
            self.available.load(Ordering::SeqCst),
            UnavailableSnafu {
                reason: "memory store is offline"
            }
        );
        Ok(())
    }

    fn run_token_bucket(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        args: &[String],
    ) -> Result<Vec<ScriptValue>, StoreError> {
        let (request, now) = BucketRequest::from_script_args(args)?;
        let clock = Instant::now();

        let current = match live(entries, key, clock) {
            None => None,
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => BucketState::from_fields(
                key,
                fields.get(TOKENS_FIELD).map(String::as_str),
                fields.get(LAST_REFILL_FIELD).map(String::as_str),
            ),
            Some(_) => return Err(wrong_type(key)),
        };

        let decision = bucket::apply(current, &request, now);
        if decision.dirty {
            let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
                value: Value::Hash(HashMap::new()),
                expires_at: None,
            });
            if let Value::Hash(fields) = &mut entry.value {
                fields.extend(decision.state.to_fields());
            }
            entry.expires_at = Some(clock + request.period);
        }

        Ok(vec![
            ScriptValue::Int(i64::from(decision.granted)),
            ScriptValue::Text(decision.state.tokens.to_string()),
        ])
    }

    fn run_compare_and_delete(
        entries: &mut HashMap<String, Entry>,
        key: &str,
        args: &[String],
    ) -> Result<Vec<ScriptValue>, StoreError> {
        let [expected] = args else {
            return InvalidArgumentSnafu {
                reason: format!("compare_and_delete takes one argument, got {}", args.len()),
            }
            .fail();
        };

        let matches = matches!(
            live(entries, key, Instant::now()),
            Some(Entry { value: Value::Text(current), .. }) if current == expected
        );
        if matches {
            entries.remove(key);
        }
        Ok(vec![ScriptValue::Int(i64::from(matches))])
    }
}

/// Looks `key` up, dropping it first if its TTL has passed.
fn live<'a>(
    entries: &'a mut HashMap<String, Entry>,
    key: &str,
    now: Instant,
) -> Option<&'a mut Entry> {
    if entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
        entries.remove(key);
    }
    entries.get_mut(key)
}

fn wrong_type(key: &str) -> StoreError {
    CorruptedSnafu {
        key,
        reason: "operation against a key holding the wrong kind of value",
    }
    .build()
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.ensure_available()?;
        let mut entries = self.lock();
        match live(&mut entries, key, Instant::now()) {
            None => Ok(None),
            Some(Entry {
                value: Value::Text(text),
                ..
            }) => Ok(Some(text.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_hash_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), StoreError> {
        self.ensure_available()?;
        let mut entries = self.lock();
        let now = Instant::now();
        if live(&mut entries, key, now).is_none() {
            entries.insert(
                key.to_string(),
                Entry {
                    value: Value::Hash(HashMap::new()),
                    expires_at: None,
                },
            );
        }

        match entries.get_mut(key) {
            Some(Entry {
                value: Value::Hash(stored),
                ..
            }) => {
                stored.extend(fields.iter().cloned());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        self.ensure_available()?;
        let mut entries = self.lock();
        match live(&mut entries, key, Instant::now()) {
            None => Ok(None),
            Some(Entry {
                value: Value::Hash(fields),
                ..
            }) => Ok(fields.get(field).cloned()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.lock();
        if let Some(entry) = live(&mut entries, key, now) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut entries = self.lock();
        if live(&mut entries, key, now).is_some() {
            return Ok(false);
        }

        entries.insert(
            key.to_string(),
            Entry {
                value: Value::Text(value.to_string()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let mut entries = self.lock();
        let existed = live(&mut entries, key, Instant::now()).is_some();
        entries.remove(key);
        Ok(existed)
    }

    async fn probe_scripting(&self) -> Result<bool, StoreError> {
        self.ensure_available()?;
        Ok(self.scripting)
    }

    async fn run_script(
        &self,
        script: Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<ScriptValue>, StoreError> {
        self.ensure_available()?;
        ensure!(
            self.scripting,
            ScriptingUnsupportedSnafu {
                reason: "scripting disabled on this memory store"
            }
        );

        let [key] = keys else {
            return InvalidArgumentSnafu {
                reason: format!("{} takes exactly one key, got {}", script.name(), keys.len()),
            }
            .fail();
        };

        let mut entries = self.lock();
        match script {
            Script::TokenBucket => Self::run_token_bucket(&mut entries, key, args),
            Script::CompareAndDelete => Self::run_compare_and_delete(&mut entries, key, args),
        }
    }
}
