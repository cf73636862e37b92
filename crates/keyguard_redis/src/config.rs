use std::{env, str::FromStr, time::Duration};

use bon::Builder;
use keyguard_core::{FallbackMode, KeyguardSettings};
use serde::Deserialize;

pub const ENV_REDIS_URL: &str = "KEYGUARD_REDIS_URL";
pub const ENV_KEY_PREFIX: &str = "KEYGUARD_KEY_PREFIX";
pub const ENV_RESPONSE_TIMEOUT_MS: &str = "KEYGUARD_REDIS_RESPONSE_TIMEOUT_MS";
pub const ENV_CONNECTION_TIMEOUT_MS: &str = "KEYGUARD_REDIS_CONNECTION_TIMEOUT_MS";

/// Connection settings for [`crate::RedisStore`].
///
/// | Parameter | Env var | Default |
/// |-----------|---------|---------|
/// | `url` | `KEYGUARD_REDIS_URL` | `redis://127.0.0.1:6379` |
/// | `key_prefix` | `KEYGUARD_KEY_PREFIX` | `""` |
/// | `response_timeout_ms` | `KEYGUARD_REDIS_RESPONSE_TIMEOUT_MS` | `500` |
/// | `connection_timeout_ms` | `KEYGUARD_REDIS_CONNECTION_TIMEOUT_MS` | `1000` |
///
/// The response timeout is the only deadline a rate-limit decision has; an expired one surfaces
/// as an unavailable store.
#[derive(Clone, Debug, Builder, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RedisStoreConfig {
    #[builder(into, default = default_url())]
    pub url: String,

    #[builder(into, default)]
    pub key_prefix: String,

    #[builder(default)]
    pub fallback_mode: FallbackMode,

    #[builder(default = 500)]
    pub response_timeout_ms: u64,

    #[builder(default = 1_000)]
    pub connection_timeout_ms: u64,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl RedisStoreConfig {
    /// Reads the `KEYGUARD_*` variables, loading a `.env` file first if there is one.
    pub fn from_env() -> Self {
        if let Err(error) = dotenvy::dotenv() {
            if !error.not_found() {
                warn!(message = "Ignoring unreadable .env file.", %error);
            }
        }

        let defaults = Self::default();
        Self {
            url: get_env_var(ENV_REDIS_URL, defaults.url),
            key_prefix: get_env_var(ENV_KEY_PREFIX, defaults.key_prefix),
            fallback_mode: defaults.fallback_mode,
            response_timeout_ms: get_env_var(ENV_RESPONSE_TIMEOUT_MS, defaults.response_timeout_ms),
            connection_timeout_ms: get_env_var(
                ENV_CONNECTION_TIMEOUT_MS,
                defaults.connection_timeout_ms,
            ),
        }
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Engine settings matching this store's namespace.
    pub fn settings(&self) -> KeyguardSettings {
        KeyguardSettings::builder()
            .key_prefix(self.key_prefix.clone())
            .fallback_mode(self.fallback_mode)
            .build()
    }
}

fn default_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

// Unset or unparseable variables keep the default.
fn get_env_var<T: FromStr + std::fmt::Debug>(var_name: &str, default_value: T) -> T
where
    <T as FromStr>::Err: std::fmt::Debug,
{
    env::var(var_name)
        .ok()
        .and_then(|value| match value.parse::<T>() {
            Ok(parsed) => Some(parsed),
            Err(error) => {
                warn!(
                    message = "Failed to parse environment variable; using default.",
                    variable = var_name,
                    value = %value,
                    error = ?error,
                    default = ?default_value
                );
                None
            }
        })
        .unwrap_or(default_value)
}
