//! Credential errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CredentialsError {
    #[error("unable to fetch key set from {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("key set at {url} is not a valid JWK set: {reason}")]
    InvalidKeySet { url: String, reason: String },

    #[error("key '{kid}' not found in any trusted key set")]
    KeyNotFound { kid: String },

    #[error("key '{kid}' is not trusted for this request")]
    KeyNotAllowed { kid: String },

    #[error("signature is malformed: {0}")]
    MalformedSignature(String),

    #[error("signature algorithm {0} is not allowed")]
    AlgorithmNotAllowed(String),

    #[error("key '{kid}' cannot verify {algorithm} signatures")]
    KeyAlgorithmMismatch { kid: String, algorithm: String },

    #[error("signature does not match payload")]
    InvalidSignature,

    #[error("key set at {0} has no symmetric signing key")]
    NoSigningKey(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] jsonwebtoken::errors::Error),
}
