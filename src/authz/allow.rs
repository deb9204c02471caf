use async_trait::async_trait;
use axum::body::Body;
use http::Request;
use serde_json::Value;

use super::{Authorizer, AuthzError};
use crate::{authn::AuthenticationSession, rule::Rule};

/// Allows every request.
#[derive(Debug, Default)]
pub struct AllowAuthorizer;

#[async_trait]
impl Authorizer for AllowAuthorizer {
    fn id(&self) -> &'static str {
        "allow"
    }

    fn validate(&self, _config: &Value) -> Result<(), AuthzError> {
        Ok(())
    }

    async fn authorize(
        &self,
        _request: &mut Request<Body>,
        _session: &mut AuthenticationSession,
        _config: &Value,
        _rule: &Rule,
    ) -> Result<(), AuthzError> {
        Ok(())
    }
}
