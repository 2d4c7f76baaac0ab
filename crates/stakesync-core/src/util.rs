//! Small helpers shared by the engine, the HTTP client and the CLI.

/// Current Unix timestamp in milliseconds.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Trimmed text, or `None` when missing or blank.
pub fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Validate a sync server base URL and strip trailing slashes.
///
/// The error is a user-facing reason.
pub fn parse_server_url(raw: &str) -> Result<String, &'static str> {
    let url = raw.trim();
    if url.is_empty() {
        return Err("server URL must not be empty");
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err("server URL must include http:// or https://");
    }
    Ok(url.trim_end_matches('/').to_string())
}
