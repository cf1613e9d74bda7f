//! HTTP response wrappers.

use std::collections::HashMap;

use reqwest::StatusCode;

/// A fully-read HTTP response.
///
/// Bodies are read eagerly because every caller classifies the text before
/// deciding what to do with it.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    /// URL after redirects.
    pub final_url: String,
    pub headers: HashMap<String, String>,
    pub body: String,
}

impl RawResponse {
    /// Build a response by hand (fakes and tests).
    pub fn new(status: u16, final_url: &str, body: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            final_url: final_url.to_string(),
            headers: HashMap::new(),
            body: body.into(),
        }
    }

    /// Check if the response is successful.
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Check if the server rejected our credentials.
    pub fn is_unauthorized(&self) -> bool {
        self.status == StatusCode::UNAUTHORIZED
    }

    /// Get the Content-Type header.
    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(|s| s.as_str())
    }

    /// First `max` characters of the body, for log lines.
    pub fn snippet(&self, max: usize) -> String {
        snippet(&self.body, max)
    }
}

/// Truncate text to at most `max` characters on a char boundary.
pub fn snippet(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    match trimmed.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// Extract response headers into a lowercase-keyed map.
pub(crate) fn extract_response_headers(response: &reqwest::Response) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for (name, value) in response.headers() {
        if let Ok(v) = value.to_str() {
            headers.insert(name.to_string(), v.to_string());
        }
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unauthorized_status() {
        let response = RawResponse::new(401, "https://www.njuskalo.hr/ccapi", "");
        assert!(response.is_unauthorized());
        assert!(!response.is_success());
    }

    #[test]
    fn test_snippet_truncates_on_char_boundary() {
        let s = snippet("  Njuškalo oglasi  ", 5);
        assert_eq!(s, "Njušk...");
    }

    #[test]
    fn test_snippet_short_text_untouched() {
        assert_eq!(snippet("ok", 10), "ok");
    }
}
