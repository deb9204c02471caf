//! Authorization errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthzError {
    #[error("authorizer '{0}' is not enabled")]
    NotEnabled(String),

    #[error("authorizer '{id}' is misconfigured: {reason}")]
    Misconfigured { id: String, reason: String },

    #[error("access denied: {0}")]
    Forbidden(String),

    #[error("template error: {0}")]
    Template(String),

    #[error("payload is not a JSON text: {0}")]
    Payload(String),

    #[error("remote authorizer call failed: {0}")]
    Upstream(String),

    #[error("expected status code {expected} but got {got}")]
    UnexpectedStatus { expected: u16, got: u16 },

    #[error("unable to sign payload: {0}")]
    Signing(String),
}

impl AuthzError {
    pub fn misconfigured(id: &str, reason: impl ToString) -> Self {
        Self::Misconfigured {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden(reason.into())
    }
}
