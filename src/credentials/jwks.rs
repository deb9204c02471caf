//! JWK set retrieval and signature verification.

use std::{
    collections::HashMap,
    str::FromStr,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use jsonwebtoken::{
    Algorithm, DecodingKey, crypto,
    jwk::{AlgorithmParameters, EllipticCurve, Jwk, JwkSet},
};
use tokio::sync::RwLock;
use url::Url;

use super::{CredentialsError, CredentialsVerifier, DetachedJws, ValidationContext};

const DEFAULT_REFRESH: Duration = Duration::from_secs(300);

/// Loads a JWK set from `file://`, `http://` or `https://`.
pub async fn fetch_key_set(client: &reqwest::Client, url: &Url) -> Result<JwkSet, CredentialsError> {
    let fetch_err = |reason: String| CredentialsError::Fetch {
        url: url.to_string(),
        reason,
    };
    let invalid = |reason: String| CredentialsError::InvalidKeySet {
        url: url.to_string(),
        reason,
    };

    match url.scheme() {
        "file" => {
            let path = url
                .to_file_path()
                .map_err(|_| fetch_err("not a local file path".into()))?;
            let raw = tokio::fs::read(&path)
                .await
                .map_err(|e| fetch_err(e.to_string()))?;
            serde_json::from_slice(&raw).map_err(|e| invalid(e.to_string()))
        }
        "http" | "https" => {
            tracing::debug!(url = %url, "Fetching JWKS");
            let response = client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| fetch_err(e.to_string()))?;

            if !response.status().is_success() {
                let status = response.status();
                tracing::error!(status = %status, url = %url, "JWKS endpoint returned error");
                return Err(fetch_err(format!("endpoint returned {status}")));
            }

            response
                .json::<JwkSet>()
                .await
                .map_err(|e| invalid(e.to_string()))
        }
        other => Err(fetch_err(format!("unsupported scheme '{other}'"))),
    }
}

/// Signature family a key or algorithm belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyFamily {
    Hmac,
    Rsa,
    Ec,
    Ed,
}

impl KeyFamily {
    fn of(algorithm: Algorithm) -> Self {
        match algorithm {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Self::Hmac,
            Algorithm::RS256
            | Algorithm::RS384
            | Algorithm::RS512
            | Algorithm::PS256
            | Algorithm::PS384
            | Algorithm::PS512 => Self::Rsa,
            Algorithm::ES256 | Algorithm::ES384 => Self::Ec,
            Algorithm::EdDSA => Self::Ed,
        }
    }
}

/// A decoded key together with the algorithms it may verify.
#[derive(Clone)]
struct VerificationKey {
    key: DecodingKey,
    family: KeyFamily,
    /// Pinned by the JWK `alg` member, or by the curve for EC keys.
    algorithm: Option<Algorithm>,
}

impl VerificationKey {
    fn accepts(&self, algorithm: Algorithm) -> bool {
        KeyFamily::of(algorithm) == self.family && self.algorithm.is_none_or(|a| a == algorithm)
    }
}

/// Convert a JWK to a key usable for signature verification.
fn jwk_to_verification_key(jwk: &Jwk) -> Result<VerificationKey, String> {
    let (key, family, curve_algorithm) = match &jwk.algorithm {
        AlgorithmParameters::RSA(rsa) => (
            DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
                .map_err(|e| format!("invalid RSA key: {e}"))?,
            KeyFamily::Rsa,
            None,
        ),
        AlgorithmParameters::EllipticCurve(ec) => {
            let algorithm = match ec.curve {
                EllipticCurve::P256 => Algorithm::ES256,
                EllipticCurve::P384 => Algorithm::ES384,
                ref other => return Err(format!("unsupported EC curve {other:?}")),
            };
            (
                DecodingKey::from_ec_components(&ec.x, &ec.y)
                    .map_err(|e| format!("invalid EC key: {e}"))?,
                KeyFamily::Ec,
                Some(algorithm),
            )
        }
        AlgorithmParameters::OctetKeyPair(okp) => {
            if okp.curve != EllipticCurve::Ed25519 {
                return Err(format!("unsupported OKP curve {:?}", okp.curve));
            }
            (
                DecodingKey::from_ed_components(&okp.x).map_err(|e| format!("invalid OKP key: {e}"))?,
                KeyFamily::Ed,
                None,
            )
        }
        AlgorithmParameters::OctetKey(oct) => (
            DecodingKey::from_base64_secret(&oct.value)
                .map_err(|e| format!("invalid symmetric key: {e}"))?,
            KeyFamily::Hmac,
            None,
        ),
        #[allow(unreachable_patterns)]
        _ => return Err("unsupported key type".to_string()),
    };

    let declared = match &jwk.common.key_algorithm {
        Some(key_algorithm) => {
            let algorithm = Algorithm::from_str(&key_algorithm.to_string())
                .map_err(|_| format!("'{key_algorithm}' is not a signature algorithm"))?;
            if KeyFamily::of(algorithm) != family {
                return Err(format!("'{key_algorithm}' does not fit a {family:?} key"));
            }
            Some(algorithm)
        }
        None => None,
    };
    if let (Some(declared), Some(curve)) = (declared, curve_algorithm)
        && declared != curve
    {
        return Err(format!("'{declared:?}' does not fit the key's curve"));
    }

    Ok(VerificationKey {
        key,
        family,
        algorithm: declared.or(curve_algorithm),
    })
}

/// Decoded keys of one key set.
struct CachedJwks {
    keys: HashMap<String, VerificationKey>,
    fetched_at: Instant,
}

/// Verifies detached JWS signatures against keys published in JWK sets.
///
/// Key sets are cached per URL and refetched when stale or when an unknown key id
/// shows up, which picks up key rotation without a restart.
///
/// Only asymmetric algorithms are accepted by default. A published key set is
/// public, so an HMAC key in it would let anyone sign; enable HS* through
/// [`JwksVerifier::with_allowed_algorithms`] for private key sets only.
pub struct JwksVerifier {
    http_client: reqwest::Client,
    refresh_interval: Duration,
    allowed_algorithms: Vec<Algorithm>,
    cache: RwLock<HashMap<Url, CachedJwks>>,
}

impl JwksVerifier {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            refresh_interval: DEFAULT_REFRESH,
            allowed_algorithms: vec![
                Algorithm::RS256,
                Algorithm::RS384,
                Algorithm::RS512,
                Algorithm::PS256,
                Algorithm::PS384,
                Algorithm::PS512,
                Algorithm::ES256,
                Algorithm::ES384,
                Algorithm::EdDSA,
            ],
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    pub fn with_allowed_algorithms(mut self, allowed_algorithms: Vec<Algorithm>) -> Self {
        self.allowed_algorithms = allowed_algorithms;
        self
    }

    async fn cached_key(&self, url: &Url, kid: &str) -> Option<VerificationKey> {
        let cache = self.cache.read().await;
        let cached = cache.get(url)?;
        if cached.fetched_at.elapsed() < self.refresh_interval {
            cached.keys.get(kid).cloned()
        } else {
            None
        }
    }

    async fn verification_key(
        &self,
        url: &Url,
        kid: &str,
    ) -> Result<Option<VerificationKey>, CredentialsError> {
        if let Some(key) = self.cached_key(url, kid).await {
            return Ok(Some(key));
        }

        self.refresh(url).await?;
        let cache = self.cache.read().await;
        Ok(cache.get(url).and_then(|c| c.keys.get(kid).cloned()))
    }

    async fn refresh(&self, url: &Url) -> Result<(), CredentialsError> {
        let jwks = fetch_key_set(&self.http_client, url).await?;

        let mut keys = HashMap::new();
        for jwk in jwks.keys {
            if let Some(kid) = &jwk.common.key_id {
                match jwk_to_verification_key(&jwk) {
                    Ok(key) => {
                        keys.insert(kid.clone(), key);
                    }
                    Err(e) => {
                        tracing::warn!(kid = kid, error = %e, "Failed to convert JWK to decoding key");
                    }
                }
            }
        }

        tracing::info!(url = %url, keys_count = keys.len(), "JWKS refreshed");

        let mut cache = self.cache.write().await;
        cache.insert(
            url.clone(),
            CachedJwks {
                keys,
                fetched_at: Instant::now(),
            },
        );
        Ok(())
    }
}

#[async_trait]
impl CredentialsVerifier for JwksVerifier {
    async fn verify_payload(
        &self,
        ctx: &ValidationContext,
        signature: &str,
        body: &[u8],
    ) -> Result<(), CredentialsError> {
        let jws = DetachedJws::parse(signature, body)?;
        let algorithm = jws.header.alg;

        if !self.allowed_algorithms.contains(&algorithm) {
            tracing::warn!(
                algorithm = ?algorithm,
                allowed = ?self.allowed_algorithms,
                "Signature algorithm not in allowlist"
            );
            return Err(CredentialsError::AlgorithmNotAllowed(format!("{algorithm:?}")));
        }

        let kid = jws.header.kid.clone().ok_or_else(|| {
            CredentialsError::MalformedSignature("header has no key id".into())
        })?;
        if !ctx.key_ids.is_empty() && !ctx.key_ids.contains(&kid) {
            return Err(CredentialsError::KeyNotAllowed { kid });
        }

        for url in &ctx.key_urls {
            let Some(key) = self.verification_key(url, &kid).await? else {
                continue;
            };
            // The header is attacker-controlled; never let it pick how a key is used.
            if !key.accepts(algorithm) {
                tracing::warn!(kid = %kid, algorithm = ?algorithm, "Signature algorithm does not fit key");
                return Err(CredentialsError::KeyAlgorithmMismatch {
                    kid,
                    algorithm: format!("{algorithm:?}"),
                });
            }
            let valid = crypto::verify(
                &jws.signature,
                jws.signing_input.as_bytes(),
                &key.key,
                algorithm,
            )?;
            if valid {
                tracing::debug!(kid = %kid, url = %url, issuers = ?ctx.issuers, "Signature verified");
                return Ok(());
            }
            return Err(CredentialsError::InvalidSignature);
        }

        Err(CredentialsError::KeyNotFound { kid })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use jsonwebtoken::EncodingKey;
    use serde_json::{Value, json};
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{method, path},
    };

    use super::*;
    use crate::credentials::{
        CredentialsSigner, JwksSigner,
        test_utils::{detached_jws, ed25519_public_bytes, issuer_key_set, sign_ed25519},
    };

    // base64url("super-secret-signing-key-000000")
    const SECRET: &str = "c3VwZXItc2VjcmV0LXNpZ25pbmcta2V5LTAwMDAwMA";

    fn symmetric_key_set() -> Value {
        json!({ "keys": [{ "kty": "oct", "kid": "k1", "alg": "HS256", "k": SECRET }] })
    }

    fn key_file(key_set: &Value) -> (tempfile::NamedTempFile, Url) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(key_set.to_string().as_bytes()).unwrap();
        let url = Url::from_file_path(file.path()).unwrap();
        (file, url)
    }

    fn context(url: Url) -> ValidationContext {
        ValidationContext {
            key_urls: vec![url],
            ..Default::default()
        }
    }

    fn with_hmac() -> JwksVerifier {
        JwksVerifier::new(reqwest::Client::new()).with_allowed_algorithms(vec![
            Algorithm::HS256,
            Algorithm::RS256,
            Algorithm::PS256,
            Algorithm::EdDSA,
        ])
    }

    #[tokio::test]
    async fn test_verify_signed_payload() {
        let (_file, url) = key_file(&issuer_key_set());
        let signature = sign_ed25519(b"payload");

        let verifier = JwksVerifier::new(reqwest::Client::new());
        let ctx = ValidationContext {
            key_urls: vec![url],
            issuers: vec!["https://issuer.test".into()],
            key_ids: vec!["ed1".into()],
        };
        verifier.verify_payload(&ctx, &signature, b"payload").await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_rejects_tampered_body() {
        let (_file, url) = key_file(&issuer_key_set());
        let signature = sign_ed25519(b"payload");

        let verifier = JwksVerifier::new(reqwest::Client::new());
        let err = verifier
            .verify_payload(&context(url), &signature, b"tampered")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::InvalidSignature));
    }

    #[tokio::test]
    async fn test_verify_rejects_unexpected_key_id() {
        let (_file, url) = key_file(&issuer_key_set());
        let signature = sign_ed25519(b"payload");

        let verifier = JwksVerifier::new(reqwest::Client::new());
        let ctx = ValidationContext {
            key_urls: vec![url],
            key_ids: vec!["other".into()],
            ..Default::default()
        };
        let err = verifier
            .verify_payload(&ctx, &signature, b"payload")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::KeyNotAllowed { .. }));
    }

    #[tokio::test]
    async fn test_verify_rejects_disallowed_algorithm() {
        let (_file, url) = key_file(&issuer_key_set());
        let signature = sign_ed25519(b"payload");

        let verifier = JwksVerifier::new(reqwest::Client::new())
            .with_allowed_algorithms(vec![Algorithm::RS256]);
        let err = verifier
            .verify_payload(&context(url), &signature, b"payload")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::AlgorithmNotAllowed(_)));
    }

    #[tokio::test]
    async fn test_hmac_not_allowed_by_default() {
        let (_file, url) = key_file(&symmetric_key_set());
        let signature = JwksSigner::new(reqwest::Client::new())
            .sign_payload(&url, b"payload")
            .await
            .unwrap()
            .signature;

        let err = JwksVerifier::new(reqwest::Client::new())
            .verify_payload(&context(url.clone()), &signature, b"payload")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::AlgorithmNotAllowed(_)));

        // Opting in works for a private symmetric key set.
        with_hmac()
            .verify_payload(&context(url), &signature, b"payload")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_hmac_over_public_okp_key_rejected() {
        let (_file, url) = key_file(&issuer_key_set());
        // Anyone can compute this: the "secret" is the published public key.
        let forged = detached_jws(
            Algorithm::HS256,
            "ed1",
            &EncodingKey::from_secret(&ed25519_public_bytes()),
            b"payload",
        );

        let err = with_hmac()
            .verify_payload(&context(url), &forged, b"payload")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::KeyAlgorithmMismatch { ref kid, .. } if kid == "ed1"));
    }

    #[tokio::test]
    async fn test_hmac_over_rsa_key_rejected() {
        let (_file, url) = key_file(&issuer_key_set());
        let forged = detached_jws(
            Algorithm::HS256,
            "rsa1",
            &EncodingKey::from_secret(b"guess"),
            b"payload",
        );

        let err = with_hmac()
            .verify_payload(&context(url), &forged, b"payload")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::KeyAlgorithmMismatch { .. }));
    }

    #[tokio::test]
    async fn test_jwk_alg_pins_algorithm() {
        // rsa1 declares RS256; a PS256 header must not be tried against it.
        let (_file, url) = key_file(&issuer_key_set());
        let mut header = jsonwebtoken::Header::new(Algorithm::PS256);
        header.typ = None;
        header.kid = Some("rsa1".into());
        let (encoded_header, _) = crate::credentials::signing_input(&header, b"payload").unwrap();

        let err = with_hmac()
            .verify_payload(&context(url), &format!("{encoded_header}..c2ln"), b"payload")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::KeyAlgorithmMismatch { .. }));
    }

    #[test]
    fn test_jwk_conversion_rejects_inconsistent_alg() {
        let jwk: Jwk = serde_json::from_value(json!({
            "kty": "OKP", "crv": "Ed25519", "kid": "ed1", "alg": "HS256",
            "x": crate::credentials::test_utils::ED25519_X,
        }))
        .unwrap();
        assert!(jwk_to_verification_key(&jwk).is_err());

        let jwk: Jwk = serde_json::from_value(json!({
            "kty": "RSA", "kid": "enc", "alg": "RSA-OAEP",
            "n": crate::credentials::test_utils::RSA_N, "e": "AQAB",
        }))
        .unwrap();
        assert!(jwk_to_verification_key(&jwk).is_err());
    }

    #[tokio::test]
    async fn test_verify_fetches_key_set_over_http() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/.well-known/jwks.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(issuer_key_set()))
            .expect(1)
            .mount(&server)
            .await;

        let signature = sign_ed25519(b"payload");
        let verifier = JwksVerifier::new(reqwest::Client::new());
        let ctx = ValidationContext {
            key_urls: vec![Url::parse(&format!("{}/.well-known/jwks.json", server.uri())).unwrap()],
            key_ids: vec!["ed1".into()],
            ..Default::default()
        };

        // Second call is served from cache; the mock expects a single fetch.
        verifier.verify_payload(&ctx, &signature, b"payload").await.unwrap();
        verifier.verify_payload(&ctx, &signature, b"payload").await.unwrap();
    }

    #[tokio::test]
    async fn test_verify_unknown_key_set_url() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let signature = sign_ed25519(b"payload");
        let verifier = JwksVerifier::new(reqwest::Client::new());
        let ctx = context(Url::parse(&format!("{}/jwks.json", server.uri())).unwrap());
        let err = verifier
            .verify_payload(&ctx, &signature, b"payload")
            .await
            .unwrap_err();
        assert!(matches!(err, CredentialsError::Fetch { .. }));
    }

    #[tokio::test]
    async fn test_fetch_key_set_rejects_unknown_scheme() {
        let url = Url::parse("ftp://keys.test/jwks.json").unwrap();
        let err = fetch_key_set(&reqwest::Client::new(), &url).await.unwrap_err();
        assert!(matches!(err, CredentialsError::Fetch { .. }));
    }
}
