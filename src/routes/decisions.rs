//! Decision endpoint.
//!
//! A reverse proxy forwards the original request to `/decisions/<original path>`
//! and lets it through only on a 200. The URL under decision is rebuilt from the
//! forwarding headers:
//!
//! | Part   | Source                                         |
//! |--------|------------------------------------------------|
//! | scheme | `X-Forwarded-Proto`, default `http`            |
//! | host   | `X-Forwarded-Host`, then `Host`                |
//! | path   | request path with the `/decisions` prefix cut  |
//! | query  | request query                                  |
//! | method | `X-Forwarded-Method`, then the request method  |
//!
//! On allow, the session's header overrides are returned as response headers so
//! the proxy can copy them onto the upstream request.

use axum::{
    body::Body,
    extract::{Request, State},
    response::{IntoResponse, Response},
};
use http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header::HOST};

use super::AppState;
use crate::pipeline::DecisionError;

const DECISIONS_PREFIX: &str = "/decisions";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_METHOD: &str = "x-forwarded-method";

fn header_str<'a>(headers: &'a HeaderMap, name: impl http::header::AsHeaderName) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Reconstructs the absolute URL and method of the request under decision.
fn forwarded_target(method: &Method, uri: &Uri, headers: &HeaderMap) -> Result<(Method, Uri), DecisionError> {
    let scheme = header_str(headers, X_FORWARDED_PROTO).unwrap_or("http");
    let host = header_str(headers, X_FORWARDED_HOST)
        .or_else(|| header_str(headers, HOST))
        .ok_or_else(|| DecisionError::InvalidUrl {
            url: uri.to_string(),
            reason: "neither X-Forwarded-Host nor Host is set".to_string(),
        })?;

    let path = uri.path().strip_prefix(DECISIONS_PREFIX).unwrap_or(uri.path());
    let path = if path.is_empty() { "/" } else { path };

    let mut target = format!("{scheme}://{host}{path}");
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }

    let target: Uri = target.parse().map_err(|e: http::uri::InvalidUri| DecisionError::InvalidUrl {
        url: target.clone(),
        reason: e.to_string(),
    })?;

    let method = match header_str(headers, X_FORWARDED_METHOD) {
        Some(forwarded) => Method::from_bytes(forwarded.to_ascii_uppercase().as_bytes()).map_err(|e| {
            DecisionError::InvalidUrl {
                url: target.to_string(),
                reason: format!("invalid X-Forwarded-Method: {e}"),
            }
        })?,
        None => method.clone(),
    };

    Ok((method, target))
}

#[tracing::instrument(name = "decisions.decide", skip_all)]
pub async fn decide(State(state): State<AppState>, request: Request) -> Result<Response, DecisionError> {
    let (mut parts, body) = request.into_parts();
    let (method, uri) = forwarded_target(&parts.method, &parts.uri, &parts.headers)?;
    parts.method = method;
    parts.uri = uri;
    let mut request = http::Request::<Body>::from_parts(parts, body);

    let session = state.engine.decide(&mut request).await?;

    let mut response = StatusCode::OK.into_response();
    for (name, value) in &session.header {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response.headers_mut().insert(name, value);
            }
            _ => tracing::warn!(header = %name, "Dropping header override that is not valid HTTP"),
        }
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(*name, HeaderValue::from_static(value));
        }
        map
    }

    #[test]
    fn test_forwarded_target() {
        let (method, uri) = forwarded_target(
            &Method::GET,
            &"/decisions/users/1?expand=true".parse().unwrap(),
            &headers(&[
                ("x-forwarded-proto", "https"),
                ("x-forwarded-host", "api.example.com"),
                ("x-forwarded-method", "delete"),
                ("host", "sidecar:4456"),
            ]),
        )
        .unwrap();
        assert_eq!(method, Method::DELETE);
        assert_eq!(uri.to_string(), "https://api.example.com/users/1?expand=true");
    }

    #[test]
    fn test_forwarded_target_defaults() {
        let (method, uri) = forwarded_target(
            &Method::POST,
            &"/decisions".parse().unwrap(),
            &headers(&[("host", "api.example.com:8080")]),
        )
        .unwrap();
        assert_eq!(method, Method::POST);
        assert_eq!(uri.to_string(), "http://api.example.com:8080/");
    }

    #[test]
    fn test_forwarded_target_requires_host() {
        let err = forwarded_target(&Method::GET, &"/decisions/a".parse().unwrap(), &HeaderMap::new())
            .unwrap_err();
        assert!(matches!(err, DecisionError::InvalidUrl { .. }));
    }
}
