//! Fully-qualified store keys.
//!
//! Both primitives namespace their records under a configured prefix. Encoding is idempotent so a
//! key that has already been qualified (for example one handed back to `unlock` after a retry) is
//! never prefixed twice.

/// Separator placed between a prefix and a logical key.
pub const SEPARATOR: char = ':';

/// Joins `prefix` and `key` with exactly one [`SEPARATOR`].
///
/// - An empty prefix returns `key` unchanged.
/// - A key already qualified with `prefix` is returned unchanged.
/// - Trailing separators on the prefix and leading separators on the key are collapsed.
///
/// ```
/// use keyguard_core::key::encode;
///
/// assert_eq!(encode("p", "k"), "p:k");
/// assert_eq!(encode("p", "p:k"), "p:k");
/// assert_eq!(encode("", "k"), "k");
/// ```
pub fn encode(prefix: &str, key: &str) -> String {
    let prefix = prefix.trim_end_matches(SEPARATOR);
    if prefix.is_empty() || is_qualified(prefix, key) {
        return key.to_string();
    }

    let key = key.trim_start_matches(SEPARATOR);
    format!("{prefix}{SEPARATOR}{key}")
}

fn is_qualified(prefix: &str, key: &str) -> bool {
    match key.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with(SEPARATOR),
        None => false,
    }
}

/// A prefix bound once and applied to every key an engine touches.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyCodec {
    prefix: String,
}

impl KeyCodec {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn encode(&self, key: &str) -> String {
        encode(&self.prefix, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_prefix_is_passthrough() {
        assert_eq!(encode("", "k"), "k");
        assert_eq!(encode("", ":k"), ":k");
    }

    #[test]
    fn joins_with_single_separator() {
        assert_eq!(encode("p", "k"), "p:k");
        assert_eq!(encode("p:", "k"), "p:k");
        assert_eq!(encode("p", ":k"), "p:k");
        assert_eq!(encode("p::", "::k"), "p:k");
    }

    #[test]
    fn already_qualified_keys_are_unchanged() {
        assert_eq!(encode("p", "p:k"), "p:k");
        assert_eq!(encode("p:", "p:k"), "p:k");
        assert_eq!(encode("orders", "orders"), "orders");
    }

    #[test]
    fn encoding_twice_is_stable() {
        let once = encode("svc:limits", "user-42");
        assert_eq!(once, "svc:limits:user-42");
        assert_eq!(encode("svc:limits", &once), once);
    }

    #[test]
    fn prefix_must_end_on_a_segment_boundary() {
        assert_eq!(encode("p", "pk"), "p:pk");
    }

    #[test]
    fn separator_only_prefix_counts_as_empty() {
        assert_eq!(encode(":", "k"), "k");
    }

    #[test]
    fn codec_applies_its_prefix() {
        let codec = KeyCodec::new("app");
        assert_eq!(codec.prefix(), "app");
        assert_eq!(codec.encode("lock:order-1"), "app:lock:order-1");
        assert_eq!(codec.encode("app:lock:order-1"), "app:lock:order-1");
    }
}
