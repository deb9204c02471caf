//! Authentication handlers.
//!
//! Each rule lists authenticators in order. The first one that takes responsibility
//! for the request decides: it either fills the [`AuthenticationSession`] or
//! rejects the request. An authenticator that does not apply returns
//! [`AuthnError::NotResponsible`] and the next one is tried.
//!
//! Available handlers:
//! - `http_message_signing`: detached JWS over the body or query, checked against
//!   trusted issuer key sets
//! - `anonymous`: assigns a fixed subject to requests without credentials
//! - `noop`: accepts every request without a subject
//! - `unauthorized`: rejects every request

mod anonymous;
mod error;
mod message_signing;
mod noop;
mod session;
mod unauthorized;

use async_trait::async_trait;
use axum::body::Body;
use http::Request;
use serde::de::DeserializeOwned;
use serde_json::Value;

pub use anonymous::{AnonymousAuthenticator, AnonymousConfig};
pub use error::{AuthnError, AuthorityError};
pub use message_signing::{
    Authority, AuthorityHeaders, IssuerMatcher, MessageSigningAuthenticator, MessageSigningConfig,
};
pub use noop::NoopAuthenticator;
pub use session::{AuthenticationSession, MatchContext, canonical_header_key};
pub use unauthorized::UnauthorizedAuthenticator;

use crate::rule::Rule;

#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Identifier used in rule and configuration files.
    fn id(&self) -> &'static str;

    /// Checks that `config` (global defaults merged with the rule override) is usable.
    fn validate(&self, config: &Value) -> Result<(), AuthnError>;

    /// Authenticates `request`, filling `session` on success.
    ///
    /// The request is mutable so a handler that consumes the body can put it back
    /// for later stages.
    async fn authenticate(
        &self,
        request: &mut Request<Body>,
        session: &mut AuthenticationSession,
        config: &Value,
        rule: &Rule,
    ) -> Result<(), AuthnError>;
}

/// Deserializes a handler config, reporting failures as misconfiguration of `id`.
pub(crate) fn parse_config<T: DeserializeOwned>(id: &str, config: &Value) -> Result<T, AuthnError> {
    let config = if config.is_null() {
        Value::Object(Default::default())
    } else {
        config.clone()
    };
    serde_json::from_value(config).map_err(|e| AuthnError::misconfigured(id, e))
}
