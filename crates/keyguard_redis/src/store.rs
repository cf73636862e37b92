use std::time::Duration;

use async_trait::async_trait;
use keyguard_core::store::{
    BackendSnafu, CorruptedSnafu, Script, ScriptValue, ScriptingUnsupportedSnafu, Store, StoreError,
};
use redis::{
    ErrorKind, RedisError, Value,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use snafu::IntoError;

use crate::config::RedisStoreConfig;

/// [`Store`] backed by a Redis-compatible server.
///
/// Cloning is cheap: clones share one multiplexed, auto-reconnecting connection.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    token_bucket: redis::Script,
    compare_and_delete: redis::Script,
}

impl RedisStore {
    /// Connects and checks the server answers `PING`.
    pub async fn connect(config: &RedisStoreConfig) -> Result<Self, StoreError> {
        let client = redis::Client::open(config.url.as_str()).map_err(|error| {
            warn!(message = "Invalid Redis URL.", url = %config.url, %error);
            BackendSnafu.into_error(Box::new(error))
        })?;

        let manager_config = ConnectionManagerConfig::new()
            .set_response_timeout(config.response_timeout())
            .set_connection_timeout(config.connection_timeout());
        let connection = ConnectionManager::new_with_config(client, manager_config)
            .await
            .map_err(|error| classify("", error))?;

        let store = Self {
            connection,
            token_bucket: redis::Script::new(Script::TokenBucket.source()),
            compare_and_delete: redis::Script::new(Script::CompareAndDelete.source()),
        };

        let mut connection = store.connection.clone();
        let _: Value = redis::cmd("PING")
            .query_async(&mut connection)
            .await
            .map_err(|error| classify("", error))?;

        debug!(message = "Connected to Redis.", url = %config.url);
        Ok(store)
    }

    fn script(&self, script: Script) -> &redis::Script {
        match script {
            Script::TokenBucket => &self.token_bucket,
            Script::CompareAndDelete => &self.compare_and_delete,
        }
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("GET")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(|error| classify(key, error))
    }

    async fn set_hash_fields(
        &self,
        key: &str,
        fields: &[(String, String)],
    ) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut connection = self.connection.clone();
        let mut command = redis::cmd("HSET");
        command.arg(key);
        for (field, value) in fields {
            command.arg(field).arg(value);
        }
        let _: Value = command
            .query_async(&mut connection)
            .await
            .map_err(|error| classify(key, error))?;
        Ok(())
    }

    async fn get_hash_field(&self, key: &str, field: &str) -> Result<Option<String>, StoreError> {
        let mut connection = self.connection.clone();
        redis::cmd("HGET")
            .arg(key)
            .arg(field)
            .query_async(&mut connection)
            .await
            .map_err(|error| classify(key, error))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut connection = self.connection.clone();
        let _: Value = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(millis(ttl))
            .query_async(&mut connection)
            .await
            .map_err(|error| classify(key, error))?;
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let reply: Value = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut connection)
            .await
            .map_err(|error| classify(key, error))?;
        Ok(!matches!(reply, Value::Nil))
    }

    async fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let deleted: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut connection)
            .await
            .map_err(|error| classify(key, error))?;
        Ok(deleted > 0)
    }

    async fn probe_scripting(&self) -> Result<bool, StoreError> {
        let mut connection = self.connection.clone();
        let probe: Result<Value, RedisError> = redis::cmd("EVAL")
            .arg("return 1")
            .arg(0)
            .query_async(&mut connection)
            .await;

        match probe.map_err(|error| classify("", error)) {
            Ok(_) => Ok(true),
            Err(error) if error.is_scripting_unsupported() => {
                debug!(message = "Scripting probe rejected by server.", %error);
                Ok(false)
            }
            Err(error) => Err(error),
        }
    }

    async fn run_script(
        &self,
        script: Script,
        keys: &[String],
        args: &[String],
    ) -> Result<Vec<ScriptValue>, StoreError> {
        let mut connection = self.connection.clone();
        let mut invocation = self.script(script).prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        for arg in args {
            invocation.arg(arg);
        }

        let key = keys.first().map(String::as_str).unwrap_or_default();
        // EVALSHA, falling back to EVAL when the script cache misses.
        let reply: Value = invocation
            .invoke_async(&mut connection)
            .await
            .map_err(|error| classify(key, error))?;
        Ok(flatten(reply))
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Maps a client error onto the engine's failure taxonomy.
pub(crate) fn classify(key: &str, error: RedisError) -> StoreError {
    if error.is_io_error()
        || error.is_timeout()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.kind() == ErrorKind::ClusterDown
        || error.kind() == ErrorKind::TryAgain
    {
        return StoreError::unavailable(error.to_string());
    }

    if error.code() == Some("WRONGTYPE") {
        return CorruptedSnafu {
            key,
            reason: error.to_string(),
        }
        .build();
    }

    if is_scripting_refusal(&error) {
        return ScriptingUnsupportedSnafu {
            reason: error.to_string(),
        }
        .build();
    }

    BackendSnafu.into_error(Box::new(error))
}

// Servers and proxies without Lua answer EVAL with a plain error reply.
fn is_scripting_refusal(error: &RedisError) -> bool {
    if !matches!(
        error.kind(),
        ErrorKind::ResponseError | ErrorKind::ExtensionError
    ) {
        return false;
    }
    let message = error.to_string().to_ascii_lowercase();
    ["unknown command", "command not allowed", "not supported", "disabled"]
        .iter()
        .any(|needle| message.contains(needle))
}

pub(crate) fn flatten(value: Value) -> Vec<ScriptValue> {
    match value {
        Value::Array(items) => items.into_iter().map(scalar).collect(),
        other => vec![scalar(other)],
    }
}

fn scalar(value: Value) -> ScriptValue {
    match value {
        Value::Nil => ScriptValue::Nil,
        Value::Int(number) => ScriptValue::Int(number),
        Value::BulkString(bytes) => ScriptValue::Text(String::from_utf8_lossy(&bytes).into_owned()),
        Value::SimpleString(text) => ScriptValue::Text(text),
        Value::Okay => ScriptValue::Text("OK".to_string()),
        Value::Double(number) => ScriptValue::Text(number.to_string()),
        Value::Boolean(flag) => ScriptValue::Int(i64::from(flag)),
        other => ScriptValue::Text(format!("{other:?}")),
    }
}
