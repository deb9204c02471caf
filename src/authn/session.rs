//! Per-request authentication session.

use std::collections::BTreeMap;

use http::{HeaderMap, Method};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use url::Url;

/// What the rule matcher learned about the request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchContext {
    /// Positional captures of the matched rule's URL pattern.
    #[serde(default)]
    pub regexp_capture_groups: Vec<String>,

    #[serde(default)]
    pub url: String,

    #[serde(default)]
    pub method: String,

    /// Inbound request headers, keyed by canonical header name.
    #[serde(default)]
    pub header: BTreeMap<String, Vec<String>>,
}

/// Identity and header state built up while a request moves through the pipeline.
///
/// Created fresh for each request. Authenticators set `subject` and `extra`;
/// authenticators and authorizers add outbound header overrides with
/// [`set_header`](Self::set_header). Serialized as the template context for
/// remote authorizer payloads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthenticationSession {
    #[serde(default)]
    pub subject: String,

    #[serde(default)]
    pub extra: Map<String, Value>,

    /// Header overrides for the upstream request, keyed by canonical header name.
    #[serde(default)]
    pub header: BTreeMap<String, String>,

    #[serde(default)]
    pub match_context: MatchContext,
}

impl AuthenticationSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a session for a request that matched a rule.
    pub fn for_request(
        method: &Method,
        url: &Url,
        headers: &HeaderMap,
        capture_groups: Vec<String>,
    ) -> Self {
        let mut header: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in headers {
            if let Ok(value) = value.to_str() {
                header
                    .entry(canonical_header_key(name.as_str()))
                    .or_default()
                    .push(value.to_string());
            }
        }

        Self {
            match_context: MatchContext {
                regexp_capture_groups: capture_groups,
                url: url.to_string(),
                method: method.to_string(),
                header,
            },
            ..Self::default()
        }
    }

    /// Sets (or replaces) an outbound header override.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        self.header.insert(canonical_header_key(name), value.into());
    }

    pub fn get_header(&self, name: &str) -> Option<&str> {
        self.header.get(&canonical_header_key(name)).map(String::as_str)
    }
}

/// Canonical MIME form of a header name: `x-user-id` becomes `X-User-Id`.
pub fn canonical_header_key(name: &str) -> String {
    let mut canonical = String::with_capacity(name.len());
    let mut upper = true;
    for ch in name.chars() {
        if upper {
            canonical.push(ch.to_ascii_uppercase());
        } else {
            canonical.push(ch.to_ascii_lowercase());
        }
        upper = ch == '-';
    }
    canonical
}

#[cfg(test)]
mod tests {
    use http::HeaderValue;

    use super::*;

    #[test]
    fn test_canonical_header_key() {
        assert_eq!(canonical_header_key("x-user-id"), "X-User-Id");
        assert_eq!(canonical_header_key("AUTHORIZATION"), "Authorization");
        assert_eq!(canonical_header_key("content-type"), "Content-Type");
        assert_eq!(canonical_header_key(""), "");
    }

    #[test]
    fn test_set_header_canonicalizes_and_replaces() {
        let mut session = AuthenticationSession::new();
        session.set_header("x-user", "alice");
        session.set_header("X-USER", "bob");

        assert_eq!(session.header.len(), 1);
        assert_eq!(session.get_header("x-user"), Some("bob"));
        assert_eq!(session.header["X-User"], "bob");
    }

    #[test]
    fn test_for_request_fills_match_context() {
        let mut headers = HeaderMap::new();
        headers.insert("x-tenant", HeaderValue::from_static("acme"));
        headers.append("accept", HeaderValue::from_static("text/html"));
        headers.append("accept", HeaderValue::from_static("application/json"));

        let url = Url::parse("https://example.com/users/42").unwrap();
        let session =
            AuthenticationSession::for_request(&Method::GET, &url, &headers, vec!["42".into()]);

        assert!(session.subject.is_empty());
        assert_eq!(session.match_context.method, "GET");
        assert_eq!(session.match_context.url, "https://example.com/users/42");
        assert_eq!(session.match_context.regexp_capture_groups, vec!["42"]);
        assert_eq!(session.match_context.header["X-Tenant"], vec!["acme"]);
        assert_eq!(session.match_context.header["Accept"].len(), 2);
    }

    #[test]
    fn test_session_serializes_as_template_context() {
        let mut session = AuthenticationSession::new();
        session.subject = "alice".into();
        session
            .extra
            .insert("scope".into(), Value::String("read write".into()));

        let value = serde_json::to_value(&session).unwrap();
        assert_eq!(value["subject"], "alice");
        assert_eq!(value["extra"]["scope"], "read write");
        assert!(value["match_context"]["regexp_capture_groups"].is_array());
    }
}
