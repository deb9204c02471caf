use async_trait::async_trait;
use axum::body::Body;
use http::{Request, header::AUTHORIZATION};
use serde::Deserialize;
use serde_json::Value;

use super::{AuthenticationSession, Authenticator, AuthnError, parse_config};
use crate::rule::Rule;

const ID: &str = "anonymous";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnonymousConfig {
    #[serde(default = "default_subject")]
    pub subject: String,
}

fn default_subject() -> String {
    "anonymous".to_string()
}

/// Gives requests without credentials a fixed subject.
///
/// Requests carrying an `Authorization` header are left to the next authenticator.
#[derive(Debug, Default)]
pub struct AnonymousAuthenticator;

#[async_trait]
impl Authenticator for AnonymousAuthenticator {
    fn id(&self) -> &'static str {
        ID
    }

    fn validate(&self, config: &Value) -> Result<(), AuthnError> {
        parse_config::<AnonymousConfig>(ID, config).map(|_| ())
    }

    async fn authenticate(
        &self,
        request: &mut Request<Body>,
        session: &mut AuthenticationSession,
        config: &Value,
        _rule: &Rule,
    ) -> Result<(), AuthnError> {
        if request.headers().contains_key(AUTHORIZATION) {
            return Err(AuthnError::NotResponsible);
        }

        let config: AnonymousConfig = parse_config(ID, config)?;
        session.subject = config.subject;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn rule() -> Rule {
        Rule::new("r", &[], "https://example.com/")
    }

    #[tokio::test]
    async fn test_default_subject() {
        let mut request = Request::new(Body::empty());
        let mut session = AuthenticationSession::new();
        AnonymousAuthenticator
            .authenticate(&mut request, &mut session, &Value::Null, &rule())
            .await
            .unwrap();
        assert_eq!(session.subject, "anonymous");
    }

    #[tokio::test]
    async fn test_configured_subject() {
        let mut request = Request::new(Body::empty());
        let mut session = AuthenticationSession::new();
        AnonymousAuthenticator
            .authenticate(&mut request, &mut session, &json!({ "subject": "guest" }), &rule())
            .await
            .unwrap();
        assert_eq!(session.subject, "guest");
    }

    #[tokio::test]
    async fn test_not_responsible_with_credentials() {
        let mut request = Request::builder()
            .header("Authorization", "Bearer abc")
            .body(Body::empty())
            .unwrap();
        let mut session = AuthenticationSession::new();
        let err = AnonymousAuthenticator
            .authenticate(&mut request, &mut session, &Value::Null, &rule())
            .await
            .unwrap_err();
        assert!(err.is_not_responsible());
        assert!(session.subject.is_empty());
    }
}
