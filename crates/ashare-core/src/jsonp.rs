//! Extraction of JSON payloads wrapped in a script callback invocation.
//!
//! Several upstreams answer `callbackName({...});` instead of plain JSON.
//! Plain JSON bodies pass through untouched.

use crate::error::FetchError;

/// Returns the JSON text inside a `callback(...)` wrapper.
pub fn unwrap_jsonp<'a>(provider: &str, body: &'a str) -> Result<&'a str, FetchError> {
    let trimmed = body.trim().trim_start_matches('\u{feff}');
    if trimmed.starts_with('{') || trimmed.starts_with('[') {
        return Ok(trimmed);
    }

    let open = trimmed.find('(').ok_or_else(|| missing_wrapper(provider))?;
    let callee = trimmed[..open].trim();
    let is_identifier = !callee.is_empty()
        && callee
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '$' || ch == '.');
    if !is_identifier {
        return Err(missing_wrapper(provider));
    }

    let close = trimmed.rfind(')').ok_or_else(|| missing_wrapper(provider))?;
    if close <= open {
        return Err(missing_wrapper(provider));
    }

    let inner = trimmed[open + 1..close].trim();
    if inner.is_empty() {
        return Err(FetchError::parse(format!(
            "{provider} callback wrapper contained no payload"
        )));
    }
    Ok(inner)
}

/// Callback name carrying a millisecond token so intermediaries never serve a cached body.
pub fn callback_name(prefix: &str, token_ms: i64) -> String {
    format!("{prefix}{token_ms}")
}

fn missing_wrapper(provider: &str) -> FetchError {
    FetchError::parse(format!(
        "{provider} response is neither JSON nor a callback-wrapped JSON payload"
    ))
}
