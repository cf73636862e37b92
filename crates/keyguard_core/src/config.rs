use bon::Builder;
use serde::Deserialize;

/// When the rate limiter leaves its atomic strategy for the non-atomic one.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackMode {
    /// Fall back only when the store reports that scripting is unsupported. Transport errors on
    /// the atomic path are returned to the caller.
    #[default]
    OnUnsupported,

    /// Fall back for the current call on any error from the atomic path. This masks outages as
    /// degraded-mode operation and is kept for compatibility with deployments that relied on it.
    OnAnyError,
}

/// Engine-wide settings shared by the rate limiter, the lock and the interceptor.
///
/// | Parameter | Default | Description |
/// |-----------|---------|-------------|
/// | `key_prefix` | `""` | Namespace prepended (with `:`) to every bucket and lock key |
/// | `fallback_mode` | `OnUnsupported` | See [`FallbackMode`] |
///
/// ```rust
/// use keyguard_core::config::{FallbackMode, KeyguardSettings};
///
/// let settings = KeyguardSettings::builder()
///     .key_prefix("billing")
///     .fallback_mode(FallbackMode::OnAnyError)
///     .build();
/// assert_eq!(settings.key_prefix(), "billing");
/// ```
#[derive(Clone, Debug, Default, Builder, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KeyguardSettings {
    #[builder(into, default)]
    pub(crate) key_prefix: String,

    #[builder(default)]
    pub(crate) fallback_mode: FallbackMode,
}

impl KeyguardSettings {
    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    pub fn fallback_mode(&self) -> FallbackMode {
        self.fallback_mode
    }
}
