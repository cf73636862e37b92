//! `${name}` / `${name.field}` expansion of key templates.

use serde_json::Value;

const OPEN: &str = "${";
const CLOSE: char = '}';

/// Expands every `${path}` in `template` against the call's parameters.
///
/// The first path segment selects a parameter by name, each further segment reads a member of the
/// value resolved so far. Anything that cannot be resolved (unknown parameter, `null` hop, missing
/// member) expands to the empty string. Text that is not a well-formed placeholder is copied
/// verbatim.
///
/// ```
/// use keyguard_core::placeholder::resolve;
/// use serde_json::json;
///
/// assert_eq!(resolve("user-${id}", &["id"], &[json!(42)]), "user-42");
/// assert_eq!(resolve("u-${obj.name}", &["obj"], &[json!({"name": "Ann"})]), "u-Ann");
/// assert_eq!(resolve("u-${obj.name}", &["obj"], &[json!(null)]), "u-");
/// ```
pub fn resolve<N: AsRef<str>>(template: &str, names: &[N], values: &[Value]) -> String {
    let mut resolved = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find(OPEN) {
        resolved.push_str(&rest[..start]);
        let body = &rest[start + OPEN.len()..];

        let Some(end) = body.find(CLOSE) else {
            resolved.push_str(&rest[start..]);
            return resolved;
        };

        let path = &body[..end];
        if is_path(path) {
            resolved.push_str(&lookup(path, names, values));
            rest = &body[end + 1..];
        } else {
            // Not a placeholder; keep the `$` and rescan from the brace.
            resolved.push('$');
            rest = &rest[start + 1..];
        }
    }

    resolved.push_str(rest);
    resolved
}

fn is_path(path: &str) -> bool {
    !path.is_empty()
        && path.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '$')
        })
}

fn lookup<N: AsRef<str>>(path: &str, names: &[N], values: &[Value]) -> String {
    let mut segments = path.split('.');
    let Some(root) = segments.next() else {
        return String::new();
    };
    let Some(mut current) = names
        .iter()
        .position(|name| name.as_ref() == root)
        .and_then(|index| values.get(index))
    else {
        return String::new();
    };

    for segment in segments {
        match current.get(segment) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }

    render(current)
}

fn render(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}
