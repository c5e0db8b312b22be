/// Render a lock key into a Redis key, applying the optional prefix.
///
/// The format is `prefix:key`, or `key` unchanged without a prefix.
pub fn render_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(prefix) if !prefix.is_empty() => format!("{prefix}:{key}"),
        _ => key.to_owned(),
    }
}
