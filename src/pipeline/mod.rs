//! The decision pipeline.
//!
//! For each request: find the one rule that matches, run its authenticators
//! until one takes responsibility, then run its authorizer. The resulting
//! [`AuthenticationSession`] carries the subject and the header overrides the
//! caller should apply upstream.

mod error;
mod registry;

use std::sync::Arc;

use axum::body::Body;
use http::Request;
use tracing::instrument;
use url::Url;

pub use error::{DecisionError, ErrorInfo, ErrorResponse};
pub use registry::HandlerRegistry;

use crate::{
    authn::{AuthenticationSession, Authenticator, AuthnError},
    authz::{Authorizer, AuthzError},
    config::{ConfigurationProvider, ProxyConfig},
    rule::{Rule, RuleHandler, RuleRepository},
};

pub struct DecisionEngine {
    rules: Arc<RuleRepository>,
    handlers: HandlerRegistry,
    config: Arc<dyn ConfigurationProvider>,
}

impl DecisionEngine {
    pub fn new(
        rules: Arc<RuleRepository>,
        handlers: HandlerRegistry,
        config: Arc<dyn ConfigurationProvider>,
    ) -> Self {
        Self {
            rules,
            handlers,
            config,
        }
    }

    /// Engine over the rules and handler settings of `config`. The rules are
    /// moved out of `config`.
    pub fn from_config(config: &mut ProxyConfig, handlers: HandlerRegistry) -> Self {
        let rules = RuleRepository::new(std::mem::take(&mut config.rules));
        Self::new(Arc::new(rules), handlers, Arc::new(config.pipeline()))
    }

    pub fn rules(&self) -> &RuleRepository {
        &self.rules
    }

    /// Checks every rule up front: patterns compile, handlers exist and are
    /// enabled, and each handler accepts its effective config.
    pub fn validate_rules(&self) -> Result<(), DecisionError> {
        for rule in self.rules.list().iter() {
            rule.compile()?;

            if rule.authenticators.is_empty() {
                return Err(DecisionError::NoAuthenticators(rule.id.clone()));
            }
            for handler in &rule.authenticators {
                let (authenticator, config) = self.authenticator(rule, handler)?;
                authenticator.validate(&config)?;
            }

            let (authorizer, config) = self.authorizer(rule, &rule.authorizer)?;
            authorizer.validate(&config)?;

            tracing::debug!(rule_id = %rule.id, "Rule validated");
        }
        Ok(())
    }

    /// Decides on `request`, whose URI must be the absolute URL being accessed.
    ///
    /// The request body is available to handlers and left in place for the caller.
    #[instrument(skip_all, fields(method = %request.method(), url = %request.uri()))]
    pub async fn decide(
        &self,
        request: &mut Request<Body>,
    ) -> Result<AuthenticationSession, DecisionError> {
        let raw_url = request.uri().to_string();
        let url = Url::parse(&raw_url).map_err(|e| DecisionError::InvalidUrl {
            url: raw_url.clone(),
            reason: e.to_string(),
        })?;

        let rule = self.rules.match_rule(request.method(), &url)?;
        tracing::debug!(rule_id = %rule.id, "Rule matched");

        let captures = rule.capture_groups(&url)?;
        let mut session =
            AuthenticationSession::for_request(request.method(), &url, request.headers(), captures);

        self.authenticate(request, &mut session, &rule).await?;

        let (authorizer, config) = self.authorizer(&rule, &rule.authorizer)?;
        authorizer
            .authorize(request, &mut session, &config, &rule)
            .await?;

        tracing::debug!(rule_id = %rule.id, subject = %session.subject, "Request allowed");
        Ok(session)
    }

    async fn authenticate(
        &self,
        request: &mut Request<Body>,
        session: &mut AuthenticationSession,
        rule: &Rule,
    ) -> Result<(), DecisionError> {
        for handler in &rule.authenticators {
            let (authenticator, config) = self.authenticator(rule, handler)?;
            match authenticator
                .authenticate(request, session, &config, rule)
                .await
            {
                Ok(()) => {
                    tracing::debug!(authenticator = authenticator.id(), "Authenticated");
                    return Ok(());
                }
                Err(AuthnError::NotResponsible) => {
                    tracing::trace!(authenticator = authenticator.id(), "Not responsible");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AuthnError::unauthorized(format!(
            "no authenticator of rule '{}' was responsible for the request",
            rule.id
        ))
        .into())
    }

    fn authenticator(
        &self,
        rule: &Rule,
        handler: &RuleHandler,
    ) -> Result<(Arc<dyn Authenticator>, serde_json::Value), DecisionError> {
        let id = handler.handler.as_str();
        let authenticator =
            self.handlers
                .authenticator(id)
                .ok_or_else(|| DecisionError::UnknownHandler {
                    rule: rule.id.clone(),
                    kind: "authenticator",
                    id: id.to_string(),
                })?;
        if !self.config.authenticator_is_enabled(id) {
            return Err(AuthnError::NotEnabled(id.to_string()).into());
        }
        let config = self
            .config
            .authenticator_config(id, handler.config.as_ref());
        Ok((authenticator, config))
    }

    fn authorizer(
        &self,
        rule: &Rule,
        handler: &RuleHandler,
    ) -> Result<(Arc<dyn Authorizer>, serde_json::Value), DecisionError> {
        let id = handler.handler.as_str();
        let authorizer =
            self.handlers
                .authorizer(id)
                .ok_or_else(|| DecisionError::UnknownHandler {
                    rule: rule.id.clone(),
                    kind: "authorizer",
                    id: id.to_string(),
                })?;
        if !self.config.authorizer_is_enabled(id) {
            return Err(AuthzError::NotEnabled(id.to_string()).into());
        }
        let config = self.config.authorizer_config(id, handler.config.as_ref());
        Ok((authorizer, config))
    }
}
