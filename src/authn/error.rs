//! Authentication errors.

use thiserror::Error;

use crate::{config::ConfigError, credentials::CredentialsError};

#[derive(Debug, Error)]
pub enum AuthnError {
    /// The authenticator does not apply to this request; the next one is tried.
    #[error("authenticator is not responsible for this request")]
    NotResponsible,

    #[error("authenticator '{0}' is not enabled")]
    NotEnabled(String),

    #[error("authenticator '{id}' is misconfigured: {reason}")]
    Misconfigured { id: String, reason: String },

    /// Credentials were presented and rejected.
    #[error("{reason}{}", format_causes(.causes))]
    Unauthorized {
        reason: String,
        /// Every failure seen along the way, oldest first.
        causes: Vec<AuthorityError>,
        /// What was verified, for diagnostics.
        payload: Option<String>,
    },

    #[error("unable to read request body: {0}")]
    Body(String),

    #[error("request body exceeds the configured limit")]
    BodyTooLarge,
}

/// Why one signing authority rejected a request.
#[derive(Debug, Error)]
pub enum AuthorityError {
    #[error("authority {authority}: invalid key set URL: {source}")]
    KeyUrl {
        authority: usize,
        #[source]
        source: ConfigError,
    },

    #[error("authority {authority}: {source}")]
    Verification {
        authority: usize,
        #[source]
        source: CredentialsError,
    },
}

impl AuthorityError {
    /// Index of the authority in the handler config.
    pub fn authority(&self) -> usize {
        match self {
            Self::KeyUrl { authority, .. } | Self::Verification { authority, .. } => *authority,
        }
    }
}

impl AuthnError {
    pub fn misconfigured(id: &str, reason: impl ToString) -> Self {
        Self::Misconfigured {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized {
            reason: reason.into(),
            causes: Vec::new(),
            payload: None,
        }
    }

    pub fn is_not_responsible(&self) -> bool {
        matches!(self, Self::NotResponsible)
    }
}

fn format_causes(causes: &[AuthorityError]) -> String {
    if causes.is_empty() {
        return String::new();
    }
    let joined: Vec<String> = causes.iter().map(ToString::to_string).collect();
    format!(": {}", joined.join("; "))
}

#[cfg(test)]
mod tests {
    use std::error::Error as _;

    use super::*;

    #[test]
    fn test_unauthorized_display_joins_causes() {
        let err = AuthnError::Unauthorized {
            reason: "no authority accepted the signature".into(),
            causes: vec![
                AuthorityError::Verification {
                    authority: 0,
                    source: CredentialsError::InvalidSignature,
                },
                AuthorityError::Verification {
                    authority: 1,
                    source: CredentialsError::KeyNotFound { kid: "k9".into() },
                },
            ],
            payload: Some("{}".into()),
        };
        assert_eq!(
            err.to_string(),
            "no authority accepted the signature: authority 0: signature does not match payload; \
             authority 1: key 'k9' not found in any trusted key set"
        );
    }

    #[test]
    fn test_authority_error_keeps_source() {
        let cause = AuthorityError::Verification {
            authority: 2,
            source: CredentialsError::InvalidSignature,
        };
        assert_eq!(cause.authority(), 2);
        let source = cause.source().unwrap();
        assert!(matches!(
            source.downcast_ref::<CredentialsError>(),
            Some(CredentialsError::InvalidSignature)
        ));
    }

    #[test]
    fn test_unauthorized_display_without_causes() {
        assert_eq!(AuthnError::unauthorized("denied").to_string(), "denied");
    }

    #[test]
    fn test_is_not_responsible() {
        assert!(AuthnError::NotResponsible.is_not_responsible());
        assert!(!AuthnError::unauthorized("x").is_not_responsible());
    }
}
