//! Access rules and rule matching.
//!
//! A rule pairs a URL pattern (see [`matcher`] for the capture syntax) and a set of
//! HTTP methods with the authenticator chain and authorizer that guard it:
//!
//! ```toml
//! [[rules]]
//! id = "users-api"
//! match = { methods = ["GET"], url = "https://api.example.com/users/<[0-9]+>" }
//! authenticators = [{ handler = "anonymous" }]
//! authorizer = { handler = "allow" }
//! ```
//!
//! Every rule owns its own [`RegexpMatchingEngine`], so compiling one rule's
//! pattern never contends with another rule.

mod error;
pub mod matcher;

use std::{collections::HashMap, sync::Arc};

use http::Method;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::{Position, Url};

pub use error::RuleError;
pub use matcher::RegexpMatchingEngine;

/// Which requests a rule applies to.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleMatch {
    /// Allowed methods. Empty allows every method.
    #[serde(default)]
    pub methods: Vec<String>,

    /// URL pattern matched against `scheme://host/path` of the request.
    pub url: String,
}

/// A pipeline handler reference with an optional per-rule config override.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleHandler {
    pub handler: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<Value>,
}

impl RuleHandler {
    pub fn new(handler: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            config: None,
        }
    }

    pub fn with_config(mut self, config: Value) -> Self {
        self.config = Some(config);
        self
    }
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Rule {
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(rename = "match")]
    pub matcher: RuleMatch,

    /// Tried in order until one takes responsibility for the request.
    #[serde(default)]
    pub authenticators: Vec<RuleHandler>,

    pub authorizer: RuleHandler,

    /// Accepted so rule files written for a full proxy load unchanged. Not executed.
    #[serde(default)]
    pub mutators: Vec<RuleHandler>,

    #[serde(skip)]
    engine: Mutex<RegexpMatchingEngine>,
}

impl Rule {
    pub fn new(id: impl Into<String>, methods: &[&str], url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: None,
            matcher: RuleMatch {
                methods: methods.iter().map(|m| m.to_string()).collect(),
                url: url.into(),
            },
            authenticators: Vec::new(),
            authorizer: RuleHandler::new("deny"),
            mutators: Vec::new(),
            engine: Mutex::default(),
        }
    }

    pub fn with_authenticator(mut self, handler: RuleHandler) -> Self {
        self.authenticators.push(handler);
        self
    }

    pub fn with_authorizer(mut self, handler: RuleHandler) -> Self {
        self.authorizer = handler;
        self
    }

    /// Compiles the rule's URL pattern (cached until the pattern changes).
    pub fn compile(&self) -> Result<Arc<fancy_regex::Regex>, RuleError> {
        self.engine.lock().compile(&self.matcher.url)
    }

    /// Checksum of the last successfully compiled pattern.
    pub fn checksum(&self) -> u64 {
        self.engine.lock().checksum()
    }

    pub fn allows_method(&self, method: &Method) -> bool {
        self.matcher.methods.is_empty()
            || self
                .matcher
                .methods
                .iter()
                .any(|m| m.eq_ignore_ascii_case(method.as_str()))
    }

    pub fn is_match(&self, method: &Method, url: &Url) -> Result<bool, RuleError> {
        if !self.allows_method(method) {
            return Ok(false);
        }
        let compiled = self.compile()?;
        compiled
            .is_match(match_target(url))
            .map_err(|e| RuleError::evaluation(&self.matcher.url, e))
    }

    /// Positional captures of the rule pattern against `url`.
    pub fn capture_groups(&self, url: &Url) -> Result<Vec<String>, RuleError> {
        let compiled = self.compile()?;
        matcher::positional_captures(&compiled, &self.matcher.url, match_target(url))
    }

    pub fn named_capture_groups(&self, url: &Url) -> Result<HashMap<String, String>, RuleError> {
        let compiled = self.compile()?;
        matcher::named_captures(&compiled, &self.matcher.url, match_target(url))
    }
}

/// Rules match against the URL without its query string or fragment.
fn match_target(url: &Url) -> &str {
    &url[..Position::AfterPath]
}

/// Holds the active rule set. Reloads publish a whole new set at once.
#[derive(Debug, Default)]
pub struct RuleRepository {
    rules: RwLock<Arc<Vec<Arc<Rule>>>>,
}

impl RuleRepository {
    pub fn new(rules: Vec<Rule>) -> Self {
        let repository = Self::default();
        repository.set(rules);
        repository
    }

    /// Replaces the active rule set.
    pub fn set(&self, rules: Vec<Rule>) {
        let rules = rules.into_iter().map(Arc::new).collect();
        *self.rules.write() = Arc::new(rules);
        tracing::debug!(count = self.len(), "Published rule set");
    }

    /// Snapshot of the active rules.
    pub fn list(&self) -> Arc<Vec<Arc<Rule>>> {
        Arc::clone(&self.rules.read())
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, id: &str) -> Option<Arc<Rule>> {
        self.list().iter().find(|rule| rule.id == id).cloned()
    }

    /// Finds the single rule matching `method` and `url`.
    ///
    /// Zero matches and more than one match are both errors; overlapping rules
    /// are a configuration mistake, not a tie to break.
    pub fn match_rule(&self, method: &Method, url: &Url) -> Result<Arc<Rule>, RuleError> {
        let rules = self.list();
        let mut matched = Vec::new();
        for rule in rules.iter() {
            if rule.is_match(method, url)? {
                matched.push(Arc::clone(rule));
            }
        }

        match matched.len() {
            0 => Err(RuleError::NoRuleMatched {
                method: method.to_string(),
                url: url.to_string(),
            }),
            1 => Ok(matched.remove(0)),
            _ => Err(RuleError::MultipleRulesMatched {
                method: method.to_string(),
                url: url.to_string(),
                ids: matched.iter().map(|rule| rule.id.clone()).collect(),
            }),
        }
    }
}
