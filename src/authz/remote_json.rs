//! Remote JSON authorizer.
//!
//! Renders a JSON payload from the authentication session, POSTs it to a remote
//! decision endpoint and maps the answer: 200 allows, 403 denies, anything else is
//! an error. Selected response headers are copied into the session so they reach
//! the upstream request.
//!
//! ```toml
//! [authorizers.remote_json]
//! enabled = true
//! config.remote = "http://keto:4466/check"
//! config.payload = '{"subject": "{{ subject }}", "resource": "{{ match_context.regexp_capture_groups[0] }}"}'
//! config.forward_response_headers_to_upstream = ["X-Permissions"]
//! ```

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::body::Body;
use hmac::{Hmac, Mac};
use http::{
    HeaderMap, HeaderName, HeaderValue, Request, StatusCode,
    header::CONTENT_TYPE,
};
use parking_lot::RwLock;
use serde::{Deserialize, de::IgnoredAny};
use serde_json::Value;
use sha2::Sha256;
use tracing::instrument;
use url::Url;

use super::{Authorizer, AuthzError, TemplateCache, parse_config};
use crate::{
    authn::AuthenticationSession,
    credentials::CredentialsSigner,
    http_client::{ResilientClient, RetrySettings},
    rule::Rule,
};

const ID: &str = "remote_json";

const DEFAULT_HMAC_HEADER: &str = "X-Request-Signature";
const DEFAULT_JWKS_HEADER: &str = "X-Jwks-Signature";
const JWKS_ISSUER_HEADER: &str = "X-Jwks-Issuer";

/// Inbound headers always passed on to the remote endpoint.
const FORWARDED_HEADERS: [&str; 3] = ["x-correlation-id", "x-session-entropy", "authorization"];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoteJsonConfig {
    /// Decision endpoint.
    pub remote: String,

    /// Extra request headers; values are templates rendered against the session.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// JSON body template.
    pub payload: String,

    #[serde(default)]
    pub forward_response_headers_to_upstream: Vec<String>,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub signed_payload: Option<SignedPayloadConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryConfig {
    /// Per-attempt timeout.
    #[serde(default = "default_max_delay")]
    pub max_delay: String,

    /// Total retry budget.
    #[serde(default = "default_give_up_after")]
    pub give_up_after: String,
}

fn default_max_delay() -> String {
    "100ms".to_string()
}

fn default_give_up_after() -> String {
    "1s".to_string()
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_delay: default_max_delay(),
            give_up_after: default_give_up_after(),
        }
    }
}

impl RetryConfig {
    pub fn settings(&self) -> Result<RetrySettings, AuthzError> {
        let parse = |field: &str, raw: &str| -> Result<Duration, AuthzError> {
            humantime::parse_duration(raw)
                .map_err(|e| AuthzError::misconfigured(ID, format!("retry.{field} '{raw}': {e}")))
        };
        Ok(RetrySettings {
            connection_timeout: parse("max_delay", &self.max_delay)?,
            max_retry_wait: parse("give_up_after", &self.give_up_after)?,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SignedPayloadConfig {
    /// Signature header. Defaults depend on the signing mode.
    #[serde(default)]
    pub header: String,

    /// HMAC-SHA256 secret. Mutually exclusive with `jwks_url`.
    #[serde(default)]
    pub shared_key: String,

    /// Key set holding the signing key. Mutually exclusive with `shared_key`.
    #[serde(default)]
    pub jwks_url: String,

    #[serde(default, rename = "issuer_url")]
    pub issuer: String,
}

impl SignedPayloadConfig {
    fn check_mode(&self) -> Result<(), AuthzError> {
        if self.shared_key.is_empty() == self.jwks_url.is_empty() {
            return Err(AuthzError::misconfigured(
                ID,
                "exactly one of signed_payload.shared_key or signed_payload.jwks_url must be specified",
            ));
        }
        Ok(())
    }
}

impl RemoteJsonConfig {
    fn remote_url(&self) -> Result<Url, AuthzError> {
        Url::parse(&self.remote)
            .map_err(|e| AuthzError::misconfigured(ID, format!("remote '{}': {e}", self.remote)))
    }
}

/// Delegates the decision to a remote JSON endpoint.
pub struct RemoteJsonAuthorizer {
    signer: Arc<dyn CredentialsSigner>,
    templates: TemplateCache,
    client: RwLock<ResilientClient>,
}

impl RemoteJsonAuthorizer {
    pub fn new(signer: Arc<dyn CredentialsSigner>) -> Result<Self, AuthzError> {
        let client = ResilientClient::new(RetrySettings::default())
            .map_err(|e| AuthzError::Upstream(e.to_string()))?;
        Ok(Self {
            signer,
            templates: TemplateCache::new(),
            client: RwLock::new(client),
        })
    }

    pub fn templates(&self) -> &TemplateCache {
        &self.templates
    }

    fn config(&self, config: &Value) -> Result<(RemoteJsonConfig, RetrySettings), AuthzError> {
        let parsed: RemoteJsonConfig = parse_config(ID, config)?;
        let settings = parsed.retry.settings()?;
        parsed.remote_url()?;
        Ok((parsed, settings))
    }

    /// Client for `settings`, rebuilt only when the retry timing changed.
    fn client(&self, settings: RetrySettings) -> Result<ResilientClient, AuthzError> {
        {
            let client = self.client.read();
            if client.settings() == settings {
                return Ok(client.clone());
            }
        }

        let rebuilt =
            ResilientClient::new(settings).map_err(|e| AuthzError::Upstream(e.to_string()))?;
        tracing::debug!(
            connection_timeout_ms = settings.connection_timeout.as_millis(),
            max_retry_wait_ms = settings.max_retry_wait.as_millis(),
            "Rebuilt remote_json HTTP client"
        );
        *self.client.write() = rebuilt.clone();
        Ok(rebuilt)
    }

    async fn sign(
        &self,
        headers: &mut HeaderMap,
        body: &str,
        signed: &SignedPayloadConfig,
    ) -> Result<(), AuthzError> {
        signed.check_mode()?;

        if !signed.shared_key.is_empty() {
            let header = or_default(&signed.header, DEFAULT_HMAC_HEADER);
            let signature = hmac_sha256_hex(body.as_bytes(), signed.shared_key.as_bytes())?;
            append_header(headers, header, &signature)?;
            return Ok(());
        }

        let jwks_url = Url::parse(&signed.jwks_url).map_err(|e| {
            AuthzError::misconfigured(ID, format!("signed_payload.jwks_url '{}': {e}", signed.jwks_url))
        })?;
        let signature = self
            .signer
            .sign_payload(&jwks_url, body.as_bytes())
            .await
            .map_err(|e| AuthzError::Signing(e.to_string()))?;

        let header = or_default(&signed.header, DEFAULT_JWKS_HEADER);
        append_header(headers, header, &signature.signature)?;
        append_header(headers, &format!("{header}-Kid"), &signature.key_id)?;
        if !signed.issuer.is_empty() {
            append_header(headers, JWKS_ISSUER_HEADER, &signed.issuer)?;
        }
        Ok(())
    }
}

fn or_default<'a>(value: &'a str, default: &'a str) -> &'a str {
    if value.is_empty() { default } else { value }
}

/// Hex-encoded HMAC-SHA256 of `msg`.
pub(crate) fn hmac_sha256_hex(msg: &[u8], key: &[u8]) -> Result<String, AuthzError> {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(key).map_err(|e| AuthzError::Signing(e.to_string()))?;
    mac.update(msg);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn header_name(name: &str) -> Result<HeaderName, AuthzError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| AuthzError::misconfigured(ID, format!("header name '{name}': {e}")))
}

fn header_value(name: &str, value: &str) -> Result<HeaderValue, AuthzError> {
    HeaderValue::from_str(value)
        .map_err(|e| AuthzError::Template(format!("value for header '{name}': {e}")))
}

fn append_header(headers: &mut HeaderMap, name: &str, value: &str) -> Result<(), AuthzError> {
    headers.append(header_name(name)?, header_value(name, value)?);
    Ok(())
}

#[async_trait]
impl Authorizer for RemoteJsonAuthorizer {
    fn id(&self) -> &'static str {
        ID
    }

    fn validate(&self, config: &Value) -> Result<(), AuthzError> {
        let (parsed, _) = self.config(config)?;
        if let Some(signed) = &parsed.signed_payload {
            signed.check_mode()?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(rule_id = %rule.id))]
    async fn authorize(
        &self,
        request: &mut Request<Body>,
        session: &mut AuthenticationSession,
        config: &Value,
        rule: &Rule,
    ) -> Result<(), AuthzError> {
        let (config, settings) = self.config(config)?;
        let client = self.client(settings)?;

        let payload_key = TemplateCache::payload_key(&config.payload);
        let body = self.templates.render(&payload_key, &config.payload, &*session)?;
        serde_json::from_str::<IgnoredAny>(&body).map_err(|e| AuthzError::Payload(e.to_string()))?;

        let mut outbound = client
            .inner()
            .post(config.remote_url()?)
            .header(CONTENT_TYPE, "application/json")
            .body(body.clone())
            .build()
            .map_err(|e| AuthzError::Upstream(e.to_string()))?;

        for name in FORWARDED_HEADERS {
            if let Some(value) = request.headers().get(name)
                && !value.is_empty()
            {
                outbound.headers_mut().append(name, value.clone());
            }
        }

        if let Some(signed) = &config.signed_payload
            && !body.is_empty()
        {
            tracing::trace!(
                header = %signed.header,
                jwks_url = %signed.jwks_url,
                issuer = %signed.issuer,
                body = %body,
                "Signing remote_json payload"
            );
            self.sign(outbound.headers_mut(), &body, signed).await?;
        }

        for (name, source) in &config.headers {
            let key = TemplateCache::header_key(&rule.id, name);
            let value = self.templates.render(&key, source, &*session)?;
            if value.is_empty() {
                continue;
            }
            outbound
                .headers_mut()
                .insert(header_name(name)?, header_value(name, &value)?);
        }

        tracing::trace!(remote = %config.remote, payload = %body, "Issuing remote_json authorizer call");

        let response = client.execute(outbound).await.map_err(|e| {
            tracing::warn!(remote = %config.remote, error = %e, "remote_json authorizer call failed");
            AuthzError::Upstream(e.to_string())
        })?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::FORBIDDEN => {
                return Err(AuthzError::forbidden(format!(
                    "remote authorizer {} denied the request",
                    config.remote
                )));
            }
            status => {
                return Err(AuthzError::UnexpectedStatus {
                    expected: StatusCode::OK.as_u16(),
                    got: status.as_u16(),
                });
            }
        }

        // A header missing from the response is forwarded as an empty value.
        for name in &config.forward_response_headers_to_upstream {
            let value = response
                .headers()
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default();
            session.set_header(name, value);
        }

        Ok(())
    }
}
