use async_trait::async_trait;
use axum::body::Body;
use http::Request;
use serde_json::Value;

use super::{AuthenticationSession, Authenticator, AuthnError};
use crate::rule::Rule;

/// Rejects every request.
#[derive(Debug, Default)]
pub struct UnauthorizedAuthenticator;

#[async_trait]
impl Authenticator for UnauthorizedAuthenticator {
    fn id(&self) -> &'static str {
        "unauthorized"
    }

    fn validate(&self, _config: &Value) -> Result<(), AuthnError> {
        Ok(())
    }

    async fn authenticate(
        &self,
        _request: &mut Request<Body>,
        _session: &mut AuthenticationSession,
        _config: &Value,
        rule: &Rule,
    ) -> Result<(), AuthnError> {
        Err(AuthnError::unauthorized(format!(
            "rule '{}' rejects all requests",
            rule.id
        )))
    }
}
