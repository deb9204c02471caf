//! Authorization handlers.
//!
//! An authorizer runs after the authenticator chain has established a session and
//! decides whether the request may proceed:
//! - `allow` / `deny`: constant decisions
//! - `required_scope`: the subject's granted scopes must cover the rule's scopes
//! - `remote_json`: a remote endpoint decides on a templated JSON payload

mod allow;
mod deny;
mod error;
mod remote_json;
mod scope;
mod template;

use async_trait::async_trait;
use axum::body::Body;
use http::Request;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use allow::AllowAuthorizer;
pub use deny::DenyAuthorizer;
pub use error::AuthzError;
pub use remote_json::{RemoteJsonAuthorizer, RemoteJsonConfig, RetryConfig, SignedPayloadConfig};
pub use scope::{RequiredScopeAuthorizer, RequiredScopeConfig};
pub use template::TemplateCache;

use crate::{authn::AuthenticationSession, rule::Rule};

#[async_trait]
pub trait Authorizer: Send + Sync {
    /// Identifier used in rule and configuration files.
    fn id(&self) -> &'static str;

    /// Checks that `config` (global defaults merged with the rule override) is usable.
    fn validate(&self, config: &Value) -> Result<(), AuthzError>;

    async fn authorize(
        &self,
        request: &mut Request<Body>,
        session: &mut AuthenticationSession,
        config: &Value,
        rule: &Rule,
    ) -> Result<(), AuthzError>;
}

/// Deserializes a handler config, reporting failures as misconfiguration of `id`.
pub(crate) fn parse_config<T: DeserializeOwned>(id: &str, config: &Value) -> Result<T, AuthzError> {
    let config = if config.is_null() {
        Value::Object(Default::default())
    } else {
        config.clone()
    };
    serde_json::from_value(config).map_err(|e| AuthzError::misconfigured(id, e))
}
