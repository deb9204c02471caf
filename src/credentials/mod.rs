//! Payload signing and signature verification.
//!
//! Signatures are compact JWS with a detached payload (RFC 7515 appendix F):
//! `<base64url header>..<base64url signature>`. The header names the algorithm and
//! the key id; the key itself comes from a JWK set.

mod error;
mod jwks;
mod signer;
#[cfg(test)]
pub(crate) mod test_utils;

use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
pub use error::CredentialsError;
use jsonwebtoken::Header;
pub use jwks::{JwksVerifier, fetch_key_set};
pub use signer::JwksSigner;
use url::Url;

/// What a signature must be checked against.
#[derive(Debug, Clone, Default)]
pub struct ValidationContext {
    /// Key sets to look the signing key up in, tried in order.
    pub key_urls: Vec<Url>,
    pub issuers: Vec<String>,
    /// Key ids the signature may use. Empty accepts any key in the key sets.
    pub key_ids: Vec<String>,
}

/// A detached signature and the id of the key that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub signature: String,
    pub key_id: String,
}

#[async_trait]
pub trait CredentialsVerifier: Send + Sync {
    async fn verify_payload(
        &self,
        ctx: &ValidationContext,
        signature: &str,
        body: &[u8],
    ) -> Result<(), CredentialsError>;
}

#[async_trait]
pub trait CredentialsSigner: Send + Sync {
    async fn sign_payload(&self, jwks_url: &Url, body: &[u8]) -> Result<Signature, CredentialsError>;
}

/// A parsed detached JWS.
pub(crate) struct DetachedJws {
    pub header: Header,
    /// `<header>.<payload>` exactly as the signer hashed it.
    pub signing_input: String,
    pub signature: String,
}

impl DetachedJws {
    /// Parses `signature` and binds it to `body`.
    ///
    /// An attached payload is tolerated only when it is the body itself.
    pub fn parse(signature: &str, body: &[u8]) -> Result<Self, CredentialsError> {
        let mut parts = signature.split('.');
        let (Some(header), Some(payload), Some(sig), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(CredentialsError::MalformedSignature(
                "expected three dot-separated parts".into(),
            ));
        };

        let encoded_body = URL_SAFE_NO_PAD.encode(body);
        if !payload.is_empty() && payload != encoded_body {
            return Err(CredentialsError::MalformedSignature(
                "attached payload differs from request body".into(),
            ));
        }

        let decoded = URL_SAFE_NO_PAD
            .decode(header)
            .map_err(|e| CredentialsError::MalformedSignature(format!("header: {e}")))?;
        let parsed: Header = serde_json::from_slice(&decoded)
            .map_err(|e| CredentialsError::MalformedSignature(format!("header: {e}")))?;

        Ok(Self {
            header: parsed,
            signing_input: format!("{header}.{encoded_body}"),
            signature: sig.to_string(),
        })
    }
}

/// Builds the signing input for a detached JWS: encoded header and encoded body.
pub(crate) fn signing_input(header: &Header, body: &[u8]) -> Result<(String, String), CredentialsError> {
    let header_json = serde_json::to_vec(header)
        .map_err(|e| CredentialsError::MalformedSignature(format!("header: {e}")))?;
    let encoded_header = URL_SAFE_NO_PAD.encode(header_json);
    let input = format!("{}.{}", encoded_header, URL_SAFE_NO_PAD.encode(body));
    Ok((encoded_header, input))
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::Algorithm;

    use super::*;

    fn header(kid: &str) -> Header {
        let mut header = Header::new(Algorithm::HS256);
        header.typ = None;
        header.kid = Some(kid.to_string());
        header
    }

    #[test]
    fn test_parse_detached() {
        let (encoded_header, input) = signing_input(&header("k1"), b"hello").unwrap();
        let jws = DetachedJws::parse(&format!("{encoded_header}..c2ln"), b"hello").unwrap();

        assert_eq!(jws.header.kid.as_deref(), Some("k1"));
        assert_eq!(jws.header.alg, Algorithm::HS256);
        assert_eq!(jws.signing_input, input);
        assert_eq!(jws.signature, "c2ln");
    }

    #[test]
    fn test_parse_attached_payload_must_match_body() {
        let (encoded_header, _) = signing_input(&header("k1"), b"hello").unwrap();
        let attached = URL_SAFE_NO_PAD.encode(b"hello");

        assert!(DetachedJws::parse(&format!("{encoded_header}.{attached}.c2ln"), b"hello").is_ok());
        assert!(
            DetachedJws::parse(&format!("{encoded_header}.{attached}.c2ln"), b"goodbye").is_err()
        );
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(DetachedJws::parse("not-a-jws", b"").is_err());
        assert!(DetachedJws::parse("a.b.c.d", b"").is_err());
        assert!(DetachedJws::parse("%%%..sig", b"").is_err());
    }
}
