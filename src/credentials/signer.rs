//! Payload signing with symmetric keys from a JWK set.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use jsonwebtoken::{
    Algorithm, EncodingKey, Header, crypto,
    jwk::{AlgorithmParameters, KeyAlgorithm},
};
use tokio::sync::RwLock;
use url::Url;

use super::{CredentialsError, CredentialsSigner, Signature, fetch_key_set, signing_input};

const DEFAULT_REFRESH: Duration = Duration::from_secs(300);

#[derive(Clone)]
struct SigningKey {
    kid: String,
    algorithm: Algorithm,
    key: EncodingKey,
    loaded_at: Instant,
}

/// Signs payloads with the first `oct` key of a JWK set.
pub struct JwksSigner {
    http_client: reqwest::Client,
    refresh_interval: Duration,
    keys: RwLock<HashMap<Url, SigningKey>>,
}

impl JwksSigner {
    pub fn new(http_client: reqwest::Client) -> Self {
        Self {
            http_client,
            refresh_interval: DEFAULT_REFRESH,
            keys: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_refresh_interval(mut self, refresh_interval: Duration) -> Self {
        self.refresh_interval = refresh_interval;
        self
    }

    async fn signing_key(&self, url: &Url) -> Result<SigningKey, CredentialsError> {
        {
            let keys = self.keys.read().await;
            if let Some(key) = keys.get(url)
                && key.loaded_at.elapsed() < self.refresh_interval
            {
                return Ok(key.clone());
            }
        }

        let jwks = fetch_key_set(&self.http_client, url).await?;
        let key = jwks
            .keys
            .iter()
            .find_map(|jwk| {
                let AlgorithmParameters::OctetKey(oct) = &jwk.algorithm else {
                    return None;
                };
                let kid = jwk.common.key_id.clone()?;
                let algorithm = match jwk.common.key_algorithm {
                    Some(KeyAlgorithm::HS384) => Algorithm::HS384,
                    Some(KeyAlgorithm::HS512) => Algorithm::HS512,
                    _ => Algorithm::HS256,
                };
                let key = EncodingKey::from_base64_secret(&oct.value).ok()?;
                Some(SigningKey {
                    kid,
                    algorithm,
                    key,
                    loaded_at: Instant::now(),
                })
            })
            .ok_or_else(|| CredentialsError::NoSigningKey(url.to_string()))?;

        tracing::debug!(url = %url, kid = %key.kid, "Loaded signing key");
        self.keys.write().await.insert(url.clone(), key.clone());
        Ok(key)
    }
}

#[async_trait]
impl CredentialsSigner for JwksSigner {
    async fn sign_payload(&self, jwks_url: &Url, body: &[u8]) -> Result<Signature, CredentialsError> {
        let key = self.signing_key(jwks_url).await?;

        let mut header = Header::new(key.algorithm);
        header.typ = None;
        header.kid = Some(key.kid.clone());

        let (encoded_header, input) = signing_input(&header, body)?;
        let signature = crypto::sign(input.as_bytes(), &key.key, key.algorithm)?;

        Ok(Signature {
            signature: format!("{encoded_header}..{signature}"),
            key_id: key.kid,
        })
    }
}
