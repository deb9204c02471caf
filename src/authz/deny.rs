use async_trait::async_trait;
use axum::body::Body;
use http::Request;
use serde_json::Value;

use super::{Authorizer, AuthzError};
use crate::{authn::AuthenticationSession, rule::Rule};

/// Denies every request.
#[derive(Debug, Default)]
pub struct DenyAuthorizer;

#[async_trait]
impl Authorizer for DenyAuthorizer {
    fn id(&self) -> &'static str {
        "deny"
    }

    fn validate(&self, _config: &Value) -> Result<(), AuthzError> {
        Ok(())
    }

    async fn authorize(
        &self,
        _request: &mut Request<Body>,
        _session: &mut AuthenticationSession,
        _config: &Value,
        rule: &Rule,
    ) -> Result<(), AuthzError> {
        tracing::debug!(rule_id = %rule.id, "Request denied by deny authorizer");
        Err(AuthzError::forbidden(format!("rule '{}' denies all requests", rule.id)))
    }
}
