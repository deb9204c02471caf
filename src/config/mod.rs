//! Configuration for the decision service.
//!
//! The service is configured via a TOML file, with support for environment
//! variable interpolation using `${VAR_NAME}` syntax.
//!
//! # Example
//!
//! ```toml
//! [server]
//! host = "0.0.0.0"
//! port = 4456
//!
//! [authenticators.anonymous]
//! enabled = true
//!
//! [authorizers.remote_json]
//! enabled = true
//! config.remote = "https://authz.internal/check"
//! config.payload = '{"subject": "{{ subject }}"}'
//! config.signed_payload.shared_key = "${AUTHZ_SHARED_KEY}"
//!
//! rule_files = ["rules/api.json"]
//!
//! [[rules]]
//! id = "public"
//! match = { url = "https://api.example.com/public/<.*>" }
//! authenticators = [{ handler = "anonymous" }]
//! authorizer = { handler = "allow" }
//! ```

mod observability;
mod pipeline;
mod server;

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

pub use observability::*;
pub use pipeline::*;
use serde::Deserialize;
pub use server::*;
use url::Url;

use crate::rule::Rule;

/// Root configuration.
///
/// All sections are optional; an empty file yields a server with no rules, which
/// answers every decision request with "no rule matched".
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    /// HTTP server configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Observability configuration (logging).
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Global authenticator settings, keyed by handler id.
    #[serde(default)]
    pub authenticators: BTreeMap<String, HandlerConfig>,

    /// Global authorizer settings, keyed by handler id.
    #[serde(default)]
    pub authorizers: BTreeMap<String, HandlerConfig>,

    /// Rules defined inline.
    #[serde(default)]
    pub rules: Vec<Rule>,

    /// Additional rule files, each a JSON array of rules. Relative paths are
    /// resolved against the directory of the config file.
    #[serde(default)]
    pub rule_files: Vec<PathBuf>,
}

impl ProxyConfig {
    /// Load configuration from a TOML file, including its rule files.
    ///
    /// Environment variables in the format `${VAR_NAME}` are expanded.
    /// Missing variables cause an error.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e, path.to_path_buf()))?;

        let mut config = Self::from_str(&contents)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.load_rule_files(base_dir)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string. Rule files are not loaded.
    pub fn from_str(contents: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(contents)?;
        let config: ProxyConfig = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Appends the rules from every file in `rule_files`.
    fn load_rule_files(&mut self, base_dir: &Path) -> Result<(), ConfigError> {
        for file in &self.rule_files {
            let path = if file.is_absolute() {
                file.clone()
            } else {
                base_dir.join(file)
            };
            let contents =
                std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e, path.clone()))?;
            let rules: Vec<Rule> = serde_json::from_str(&contents)
                .map_err(|e| ConfigError::RuleFile(path.clone(), e))?;
            tracing::debug!(file = %path.display(), count = rules.len(), "Loaded rule file");
            self.rules.extend(rules);
        }
        Ok(())
    }

    /// Validate the configuration for consistency.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.server.body_limit_bytes == 0 {
            return Err(ConfigError::Validation(
                "server.body_limit_bytes must be greater than zero".into(),
            ));
        }

        let mut seen = HashSet::new();
        for rule in &self.rules {
            if rule.id.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "rule matching '{}' has an empty id",
                    rule.matcher.url
                )));
            }
            if !seen.insert(rule.id.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "duplicate rule id '{}'",
                    rule.id
                )));
            }
        }

        Ok(())
    }

    /// Global handler settings, as consumed by the decision pipeline.
    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig::new(self.authenticators.clone(), self.authorizers.clone())
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {1}: {0}")]
    Io(std::io::Error, PathBuf),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to parse rule file {0}: {1}")]
    RuleFile(PathBuf, serde_json::Error),

    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),

    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Parses a list of URLs, failing on the first one that does not parse.
pub fn parse_urls<S: AsRef<str>>(raw: &[S]) -> Result<Vec<Url>, ConfigError> {
    raw.iter()
        .map(|s| {
            let s = s.as_ref();
            Url::parse(s).map_err(|e| ConfigError::InvalidUrl {
                url: s.to_string(),
                reason: e.to_string(),
            })
        })
        .collect()
}

/// Expand `${VAR_NAME}` references, leaving anything after a `#` untouched.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let re = regex::Regex::new(r"\$\{([^}]+)\}")
        .map_err(|e| ConfigError::Validation(e.to_string()))?;
    let mut result = String::with_capacity(input.len());

    for line in input.lines() {
        let comment_pos = line.find('#');
        let mut last_end = 0;

        for cap in re.captures_iter(line) {
            let Some(whole) = cap.get(0) else {
                continue;
            };
            if let Some(pos) = comment_pos
                && whole.start() >= pos
            {
                continue;
            }

            result.push_str(&line[last_end..whole.start()]);
            let var_name = &cap[1];
            let value = std::env::var(var_name)
                .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
            result.push_str(&value);
            last_end = whole.end();
        }

        result.push_str(&line[last_end..]);
        result.push('\n');
    }

    // Remove trailing newline if input didn't have one
    if !input.ends_with('\n') && result.ends_with('\n') {
        result.pop();
    }

    Ok(result)
}
