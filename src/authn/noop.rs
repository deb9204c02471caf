use async_trait::async_trait;
use axum::body::Body;
use http::Request;
use serde_json::Value;

use super::{AuthenticationSession, Authenticator, AuthnError};
use crate::rule::Rule;

/// Accepts every request and leaves the subject empty.
#[derive(Debug, Default)]
pub struct NoopAuthenticator;

#[async_trait]
impl Authenticator for NoopAuthenticator {
    fn id(&self) -> &'static str {
        "noop"
    }

    fn validate(&self, _config: &Value) -> Result<(), AuthnError> {
        Ok(())
    }

    async fn authenticate(
        &self,
        _request: &mut Request<Body>,
        _session: &mut AuthenticationSession,
        _config: &Value,
        _rule: &Rule,
    ) -> Result<(), AuthnError> {
        Ok(())
    }
}
