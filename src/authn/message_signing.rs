//! HTTP message signing authenticator.
//!
//! The caller signs the request body (or, for body-less requests, the raw query
//! string) with a key from its own JWK set and sends three headers: the detached
//! signature, the key id and its issuer URL. The issuer's key set is expected at
//! `<issuer>/.well-known/jwks.json`.
//!
//! Trust is configured as a list of authorities, each with its own header names
//! and allowed issuers. Authorities are tried in order and the first one that
//! verifies the signature wins:
//!
//! ```toml
//! [authenticators.http_message_signing]
//! enabled = true
//! config.max_challenge_age = "30s"
//! config.authorities = [
//!   { allowed_issuers = ["https://partner.example.com", "regex:https://.*\\.internal\\.example\\.com"] },
//!   { allowed_issuers = ["https://billing.example.com"], scope = ["invoices:read"] },
//! ]
//!
//! An authority's `scope` list is what `required_scope` later checks against; the
//! signed request itself carries no scope claim.
//! ```
//!
//! Query-signed requests must carry a `challenge` ULID no older than
//! `max_challenge_age` (plus 30s of clock skew), which bounds replays.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::Body;
use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, Request};
use http_body_util::{BodyExt, LengthLimitError};
use regex::Regex;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::instrument;
use ulid::Ulid;

use super::{AuthenticationSession, Authenticator, AuthnError, AuthorityError, parse_config};
use crate::{
    config::parse_urls,
    credentials::{CredentialsVerifier, ValidationContext},
    rule::Rule,
};

const ID: &str = "http_message_signing";

const CHALLENGE_PARAM: &str = "challenge";
const DEFAULT_SIGNATURE_HEADER: &str = "x-jwks-signature";
const DEFAULT_KID_HEADER: &str = "x-jwks-signature-kid";
const DEFAULT_ISSUER_HEADER: &str = "x-jwks-issuer";
const REGEX_PREFIX: &str = "regex:";
const REGEXP_PREFIX: &str = "regexp:";
const INSECURE_PREFIX: &str = "http://";

const DEFAULT_MAX_CHALLENGE_AGE: Duration = Duration::from_secs(30);
/// Clock skew tolerated on top of `max_challenge_age`.
const CHALLENGE_JITTER: Duration = Duration::from_secs(30);

/// Header name overrides. Unset or empty entries fall back to the defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuthorityHeaders {
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub kid: Option<String>,
    #[serde(default)]
    pub issuer: Option<String>,
}

impl AuthorityHeaders {
    fn signature(&self) -> &str {
        header_or_default(self.signature.as_deref(), DEFAULT_SIGNATURE_HEADER)
    }

    fn kid(&self) -> &str {
        header_or_default(self.kid.as_deref(), DEFAULT_KID_HEADER)
    }

    fn issuer(&self) -> &str {
        header_or_default(self.issuer.as_deref(), DEFAULT_ISSUER_HEADER)
    }
}

fn header_or_default<'a>(configured: Option<&'a str>, default: &'a str) -> &'a str {
    match configured {
        Some(name) if !name.is_empty() => name,
        _ => default,
    }
}

/// One entry of an authority's issuer allow-list.
///
/// On the wire this is a plain string; a `regex:` or `regexp:` prefix marks a
/// pattern, which is anchored at both ends.
#[derive(Debug, Clone)]
pub enum IssuerMatcher {
    Literal(String),
    Pattern(Regex),
}

impl IssuerMatcher {
    /// Parses one allow-list entry. Patterns that fail to compile yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        let Some(pattern) = raw
            .strip_prefix(REGEX_PREFIX)
            .or_else(|| raw.strip_prefix(REGEXP_PREFIX))
        else {
            return Some(Self::Literal(raw.to_string()));
        };

        let mut anchored = String::with_capacity(pattern.len() + 2);
        if !pattern.starts_with('^') {
            anchored.push('^');
        }
        anchored.push_str(pattern);
        if !pattern.ends_with('$') {
            anchored.push('$');
        }

        match Regex::new(&anchored) {
            Ok(regex) => Some(Self::Pattern(regex)),
            Err(e) => {
                tracing::warn!(pattern = %raw, error = %e, "Skipping issuer pattern that does not compile");
                None
            }
        }
    }

    pub fn matches(&self, issuer: &str) -> bool {
        match self {
            Self::Literal(literal) => literal == issuer,
            Self::Pattern(regex) => regex.is_match(issuer),
        }
    }
}

fn deserialize_allowed_issuers<'de, D>(deserializer: D) -> Result<Vec<IssuerMatcher>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Vec::<String>::deserialize(deserializer)?;
    Ok(raw.iter().filter_map(|entry| IssuerMatcher::parse(entry)).collect())
}

/// A trust source: where to read credentials from and which issuers to accept.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Authority {
    #[serde(default)]
    pub headers: AuthorityHeaders,

    #[serde(default, deserialize_with = "deserialize_allowed_issuers")]
    pub allowed_issuers: Vec<IssuerMatcher>,

    /// Scopes granted to requests this authority verifies, recorded as `extra.scp`.
    #[serde(default)]
    pub scope: Vec<String>,
}

impl Authority {
    fn allows_issuer(&self, issuer: &str) -> bool {
        self.allowed_issuers.iter().any(|m| m.matches(issuer))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MessageSigningConfig {
    #[serde(default)]
    pub authorities: Vec<Authority>,

    /// Maximum age of a query `challenge`. Defaults to 30s; `0s` disables the check.
    #[serde(default)]
    pub max_challenge_age: String,

    /// Accept `http://` issuers.
    #[serde(default)]
    pub allow_insecure: bool,
}

/// A config after its one-time validation pass.
#[derive(Debug)]
struct ParsedConfig {
    authorities: Vec<Authority>,
    max_challenge_age: Duration,
    allow_insecure: bool,
}

impl ParsedConfig {
    fn allows_issuer(&self, authority: &Authority, issuer: &str) -> bool {
        if issuer.starts_with(INSECURE_PREFIX) && !self.allow_insecure {
            return false;
        }
        authority.allows_issuer(issuer)
    }
}

/// Authenticates requests signed by a trusted issuer.
pub struct MessageSigningAuthenticator {
    verifier: Arc<dyn CredentialsVerifier>,
    /// Parsed configs keyed by SHA-256 of the merged config JSON.
    configs: DashMap<String, Arc<ParsedConfig>>,
}

impl MessageSigningAuthenticator {
    pub fn new(verifier: Arc<dyn CredentialsVerifier>) -> Self {
        Self {
            verifier,
            configs: DashMap::new(),
        }
    }

    fn config(&self, config: &Value) -> Result<Arc<ParsedConfig>, AuthnError> {
        let key = hex::encode(Sha256::digest(config.to_string().as_bytes()));
        if let Some(parsed) = self.configs.get(&key) {
            return Ok(Arc::clone(&parsed));
        }

        let raw: MessageSigningConfig = parse_config(ID, config)?;
        let max_challenge_age = if raw.max_challenge_age.is_empty() {
            DEFAULT_MAX_CHALLENGE_AGE
        } else {
            humantime::parse_duration(&raw.max_challenge_age).map_err(|e| {
                AuthnError::misconfigured(
                    ID,
                    format!("max_challenge_age '{}': {e}", raw.max_challenge_age),
                )
            })?
        };

        let parsed = Arc::new(ParsedConfig {
            authorities: raw.authorities,
            max_challenge_age,
            allow_insecure: raw.allow_insecure,
        });
        self.configs.insert(key, Arc::clone(&parsed));
        Ok(parsed)
    }
}

/// Buffers the request body and puts an identical body back on the request.
async fn buffer_body(request: &mut Request<Body>) -> Result<Bytes, AuthnError> {
    let body = std::mem::take(request.body_mut());
    let bytes = body
        .collect()
        .await
        .map_err(|e| {
            if exceeds_length_limit(&e) {
                AuthnError::BodyTooLarge
            } else {
                AuthnError::Body(e.to_string())
            }
        })?
        .to_bytes();
    *request.body_mut() = Body::from(bytes.clone());
    Ok(bytes)
}

/// True when `RequestBodyLimitLayer` cut the body short somewhere in the chain.
fn exceeds_length_limit(error: &(dyn std::error::Error + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if err.is::<LengthLimitError>() {
            return true;
        }
        current = err.source();
    }
    false
}

/// Extracts the `challenge` ULID from a raw query string.
fn challenge(query: &str) -> Option<Result<Ulid, ulid::DecodeError>> {
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(name, _)| name == CHALLENGE_PARAM)
        .map(|(_, value)| Ulid::from_string(&value))
}

/// True when the challenge was issued longer ago than `max_age` plus jitter.
fn challenge_expired(id: &Ulid, max_age: Duration, now_ms: i64) -> bool {
    let issued_ms = i64::try_from(id.timestamp_ms()).unwrap_or(i64::MAX);
    let budget_ms = i64::try_from((max_age + CHALLENGE_JITTER).as_millis()).unwrap_or(i64::MAX);
    now_ms.saturating_sub(issued_ms) > budget_ms
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

#[async_trait]
impl Authenticator for MessageSigningAuthenticator {
    fn id(&self) -> &'static str {
        ID
    }

    fn validate(&self, config: &Value) -> Result<(), AuthnError> {
        self.config(config).map(|_| ())
    }

    #[instrument(skip_all, fields(rule_id = %rule.id))]
    async fn authenticate(
        &self,
        request: &mut Request<Body>,
        session: &mut AuthenticationSession,
        config: &Value,
        rule: &Rule,
    ) -> Result<(), AuthnError> {
        let config = self.config(config)?;
        if config.authorities.is_empty() {
            return Err(AuthnError::NotResponsible);
        }

        let buffered = buffer_body(request).await?;
        let query = request.uri().query().unwrap_or_default().to_string();

        let payload = if !buffered.is_empty() {
            buffered
        } else if !query.is_empty() {
            if !config.max_challenge_age.is_zero() {
                let id = match challenge(&query) {
                    Some(Ok(id)) => id,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "Unparsable challenge");
                        return Err(AuthnError::NotResponsible);
                    }
                    None => return Err(AuthnError::NotResponsible),
                };
                let now_ms = chrono::Utc::now().timestamp_millis();
                if challenge_expired(&id, config.max_challenge_age, now_ms) {
                    tracing::debug!(challenge = %id, "Challenge expired");
                    return Err(AuthnError::NotResponsible);
                }
            }
            Bytes::from(query)
        } else {
            return Err(AuthnError::NotResponsible);
        };

        let mut causes = Vec::new();
        for (index, authority) in config.authorities.iter().enumerate() {
            let headers = request.headers();
            let Some(signature) = header(headers, authority.headers.signature()) else {
                continue;
            };
            let Some(kid) = header(headers, authority.headers.kid()) else {
                continue;
            };
            let Some(issuer) = header(headers, authority.headers.issuer()) else {
                continue;
            };

            if !config.allows_issuer(authority, issuer) {
                tracing::debug!(authority = index, issuer = %issuer, "Issuer not allowed");
                continue;
            }

            let key_urls = match parse_urls(&[format!("{issuer}/.well-known/jwks.json")]) {
                Ok(urls) => urls,
                Err(source) => {
                    causes.push(AuthorityError::KeyUrl {
                        authority: index,
                        source,
                    });
                    continue;
                }
            };

            let ctx = ValidationContext {
                key_urls,
                issuers: vec![issuer.to_string()],
                key_ids: vec![kid.to_string()],
            };
            match self.verifier.verify_payload(&ctx, signature, &payload).await {
                Ok(()) => {
                    tracing::debug!(authority = index, issuer = %issuer, kid = %kid, "Request signature verified");
                    session.extra.insert("iss".into(), Value::String(issuer.to_string()));
                    session.extra.insert("kid".into(), Value::String(kid.to_string()));
                    if !authority.scope.is_empty() {
                        session.extra.insert("scp".into(), Value::from(authority.scope.clone()));
                    }
                    return Ok(());
                }
                Err(source) => causes.push(AuthorityError::Verification {
                    authority: index,
                    source,
                }),
            }
        }

        Err(AuthnError::Unauthorized {
            reason: "request signature was not accepted by any authority".to_string(),
            causes,
            payload: Some(String::from_utf8_lossy(&payload).into_owned()),
        })
    }
}
