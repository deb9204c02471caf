use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

use crate::{authn::AuthnError, authz::AuthzError, rule::RuleError};

/// Why a request was not allowed through.
#[derive(Debug, Error)]
pub enum DecisionError {
    #[error("invalid request URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error(transparent)]
    Rule(#[from] RuleError),

    #[error(transparent)]
    Authn(#[from] AuthnError),

    #[error(transparent)]
    Authz(#[from] AuthzError),

    #[error("rule '{rule}' references unknown {kind} '{id}'")]
    UnknownHandler {
        rule: String,
        kind: &'static str,
        id: String,
    },

    #[error("rule '{0}' has no authenticators")]
    NoAuthenticators(String),
}

impl DecisionError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidUrl { .. } => StatusCode::BAD_REQUEST,
            Self::Rule(RuleError::NoRuleMatched { .. } | RuleError::NotMatched { .. }) => {
                StatusCode::NOT_FOUND
            }
            Self::Rule(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Authn(AuthnError::Unauthorized { .. } | AuthnError::NotResponsible) => {
                StatusCode::UNAUTHORIZED
            }
            Self::Authn(AuthnError::Body(_)) => StatusCode::BAD_REQUEST,
            Self::Authn(AuthnError::BodyTooLarge) => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Authn(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Authz(AuthzError::Forbidden(_)) => StatusCode::FORBIDDEN,
            Self::Authz(AuthzError::Upstream(_) | AuthzError::UnexpectedStatus { .. }) => {
                StatusCode::BAD_GATEWAY
            }
            Self::Authz(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::UnknownHandler { .. } | Self::NoAuthenticators(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error code for the response body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } => "invalid_url",
            Self::Rule(RuleError::NoRuleMatched { .. } | RuleError::NotMatched { .. }) => {
                "no_rule_matched"
            }
            Self::Rule(RuleError::MultipleRulesMatched { .. }) => "multiple_rules_matched",
            Self::Rule(_) => "rule_error",
            Self::Authn(AuthnError::Unauthorized { .. } | AuthnError::NotResponsible) => {
                "unauthorized"
            }
            Self::Authn(AuthnError::Body(_)) => "invalid_body",
            Self::Authn(AuthnError::BodyTooLarge) => "payload_too_large",
            Self::Authn(_) => "authenticator_misconfigured",
            Self::Authz(AuthzError::Forbidden(_)) => "forbidden",
            Self::Authz(AuthzError::Upstream(_) | AuthzError::UnexpectedStatus { .. }) => {
                "upstream_error"
            }
            Self::Authz(_) => "authorizer_error",
            Self::UnknownHandler { .. } | Self::NoAuthenticators(_) => "rule_misconfigured",
        }
    }

    fn error_type(&self) -> &'static str {
        match self.status() {
            StatusCode::BAD_REQUEST | StatusCode::PAYLOAD_TOO_LARGE => "invalid_request_error",
            StatusCode::NOT_FOUND => "not_found_error",
            StatusCode::UNAUTHORIZED => "authentication_error",
            StatusCode::FORBIDDEN => "permission_error",
            StatusCode::BAD_GATEWAY => "upstream_error",
            _ => "server_error",
        }
    }

    /// Client-facing message. Authentication failures stay generic so the
    /// response does not reveal which authority or key was tried.
    fn public_message(&self) -> String {
        match self {
            Self::Authn(AuthnError::Unauthorized { .. } | AuthnError::NotResponsible) => {
                "The request could not be authenticated".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Error body: `{"error": {"type": ..., "code": ..., "message": ...}}`.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorInfo,
}

#[derive(Debug, Serialize)]
pub struct ErrorInfo {
    #[serde(rename = "type")]
    pub error_type: String,
    pub code: String,
    pub message: String,
}

impl IntoResponse for DecisionError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, code = self.code(), "Decision failed");
        } else {
            tracing::info!(error = %self, code = self.code(), "Request denied");
        }

        let body = ErrorResponse {
            error: ErrorInfo {
                error_type: self.error_type().to_string(),
                code: self.code().to_string(),
                message: self.public_message(),
            },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;
    use rstest::rstest;

    use super::*;
    use crate::{authn::AuthorityError, credentials::CredentialsError};

    #[rstest]
    #[case::no_rule(
        DecisionError::Rule(RuleError::NoRuleMatched { method: "GET".into(), url: "https://a.test/".into() }),
        StatusCode::NOT_FOUND
    )]
    #[case::multiple_rules(
        DecisionError::Rule(RuleError::MultipleRulesMatched { method: "GET".into(), url: "https://a.test/".into(), ids: vec!["a".into(), "b".into()] }),
        StatusCode::INTERNAL_SERVER_ERROR
    )]
    #[case::unauthorized(DecisionError::Authn(AuthnError::unauthorized("nope")), StatusCode::UNAUTHORIZED)]
    #[case::misconfigured(
        DecisionError::Authn(AuthnError::misconfigured("anonymous", "bad")),
        StatusCode::INTERNAL_SERVER_ERROR
    )]
    #[case::body_too_large(DecisionError::Authn(AuthnError::BodyTooLarge), StatusCode::PAYLOAD_TOO_LARGE)]
    #[case::forbidden(DecisionError::Authz(AuthzError::forbidden("no")), StatusCode::FORBIDDEN)]
    #[case::upstream(
        DecisionError::Authz(AuthzError::UnexpectedStatus { expected: 200, got: 500 }),
        StatusCode::BAD_GATEWAY
    )]
    #[case::payload(DecisionError::Authz(AuthzError::Payload("x".into())), StatusCode::INTERNAL_SERVER_ERROR)]
    fn test_status_mapping(#[case] error: DecisionError, #[case] expected: StatusCode) {
        assert_eq!(error.status(), expected);
    }

    #[tokio::test]
    async fn test_error_body() {
        let response = DecisionError::Authz(AuthzError::forbidden("subject may not write")).into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["type"], "permission_error");
        assert_eq!(json["error"]["code"], "forbidden");
        assert_eq!(json["error"]["message"], "access denied: subject may not write");
    }

    #[tokio::test]
    async fn test_unauthorized_body_hides_causes() {
        let error = DecisionError::Authn(AuthnError::Unauthorized {
            reason: "rejected".into(),
            causes: vec![AuthorityError::Verification {
                authority: 0,
                source: CredentialsError::KeyNotFound { kid: "k1".into() },
            }],
            payload: None,
        });
        let body = error.into_response().into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"]["message"], "The request could not be authenticated");
    }
}
