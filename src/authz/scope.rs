use async_trait::async_trait;
use axum::body::Body;
use http::Request;
use serde::Deserialize;
use serde_json::Value;

use super::{Authorizer, AuthzError, parse_config};
use crate::{authn::AuthenticationSession, rule::Rule, scope::ScopeStrategy};

const ID: &str = "required_scope";

/// Claims searched for granted scopes when no claim is configured.
const DEFAULT_SCOPE_CLAIMS: [&str; 2] = ["scp", "scope"];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequiredScopeConfig {
    /// Every one of these must be granted.
    #[serde(default)]
    pub required_scope: Vec<String>,

    #[serde(default)]
    pub scope_strategy: ScopeStrategy,

    /// Session `extra` claim holding the granted scopes.
    #[serde(default)]
    pub scope_claim: Option<String>,
}

/// Requires the authenticated subject to hold the rule's scopes.
#[derive(Debug, Default)]
pub struct RequiredScopeAuthorizer;

/// Reads granted scopes from a claim: either an array or a space-delimited string.
fn granted_scopes(session: &AuthenticationSession, claim: Option<&str>) -> Vec<String> {
    let value = match claim {
        Some(claim) => session.extra.get(claim),
        None => DEFAULT_SCOPE_CLAIMS
            .iter()
            .find_map(|claim| session.extra.get(*claim)),
    };

    match value {
        Some(Value::String(scopes)) => scopes.split_whitespace().map(str::to_string).collect(),
        Some(Value::Array(scopes)) => scopes
            .iter()
            .filter_map(|scope| scope.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl Authorizer for RequiredScopeAuthorizer {
    fn id(&self) -> &'static str {
        ID
    }

    fn validate(&self, config: &Value) -> Result<(), AuthzError> {
        parse_config::<RequiredScopeConfig>(ID, config).map(|_| ())
    }

    async fn authorize(
        &self,
        _request: &mut Request<Body>,
        session: &mut AuthenticationSession,
        config: &Value,
        rule: &Rule,
    ) -> Result<(), AuthzError> {
        let config: RequiredScopeConfig = parse_config(ID, config)?;
        let granted = granted_scopes(session, config.scope_claim.as_deref());

        for required in &config.required_scope {
            if !config.scope_strategy.matches(&granted, required) {
                tracing::debug!(
                    rule_id = %rule.id,
                    subject = %session.subject,
                    required = %required,
                    strategy = ?config.scope_strategy,
                    "Required scope not granted"
                );
                return Err(AuthzError::forbidden(format!(
                    "scope '{required}' was not granted"
                )));
            }
        }
        Ok(())
    }
}
