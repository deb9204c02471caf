use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Global settings for one pipeline handler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HandlerConfig {
    /// Disabled handlers refuse to run even when a rule references them.
    #[serde(default)]
    pub enabled: bool,

    /// Defaults that per-rule `config` overrides are merged onto.
    #[serde(default)]
    pub config: Value,
}

/// Source of handler enablement and effective handler configuration.
pub trait ConfigurationProvider: Send + Sync {
    fn authenticator_is_enabled(&self, id: &str) -> bool;

    fn authorizer_is_enabled(&self, id: &str) -> bool;

    /// Global config for authenticator `id` with the rule's override merged on top.
    fn authenticator_config(&self, id: &str, overrides: Option<&Value>) -> Value;

    /// Global config for authorizer `id` with the rule's override merged on top.
    fn authorizer_config(&self, id: &str, overrides: Option<&Value>) -> Value;
}

/// [`ConfigurationProvider`] backed by the `[authenticators]` and `[authorizers]`
/// tables of the config file.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    authenticators: BTreeMap<String, HandlerConfig>,
    authorizers: BTreeMap<String, HandlerConfig>,
}

impl PipelineConfig {
    pub fn new(
        authenticators: BTreeMap<String, HandlerConfig>,
        authorizers: BTreeMap<String, HandlerConfig>,
    ) -> Self {
        Self {
            authenticators,
            authorizers,
        }
    }

    /// Enables authenticator `id` with the given global config.
    pub fn with_authenticator(mut self, id: &str, config: Value) -> Self {
        self.authenticators.insert(
            id.to_string(),
            HandlerConfig {
                enabled: true,
                config,
            },
        );
        self
    }

    /// Enables authorizer `id` with the given global config.
    pub fn with_authorizer(mut self, id: &str, config: Value) -> Self {
        self.authorizers.insert(
            id.to_string(),
            HandlerConfig {
                enabled: true,
                config,
            },
        );
        self
    }
}

impl ConfigurationProvider for PipelineConfig {
    fn authenticator_is_enabled(&self, id: &str) -> bool {
        self.authenticators.get(id).is_some_and(|h| h.enabled)
    }

    fn authorizer_is_enabled(&self, id: &str) -> bool {
        self.authorizers.get(id).is_some_and(|h| h.enabled)
    }

    fn authenticator_config(&self, id: &str, overrides: Option<&Value>) -> Value {
        effective_config(self.authenticators.get(id), overrides)
    }

    fn authorizer_config(&self, id: &str, overrides: Option<&Value>) -> Value {
        effective_config(self.authorizers.get(id), overrides)
    }
}

fn effective_config(global: Option<&HandlerConfig>, overrides: Option<&Value>) -> Value {
    let mut merged = global.map(|h| h.config.clone()).unwrap_or(Value::Null);
    if let Some(overrides) = overrides {
        merge_json(&mut merged, overrides);
    }
    merged
}

/// Deep-merges `overrides` onto `base`. Objects merge key by key; any other
/// value replaces what was there. A null override leaves the base untouched.
pub fn merge_json(base: &mut Value, overrides: &Value) {
    match (base, overrides) {
        (_, Value::Null) => {}
        (Value::Object(base), Value::Object(overrides)) => {
            for (key, value) in overrides {
                match base.get_mut(key) {
                    Some(existing) => merge_json(existing, value),
                    None => {
                        base.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overrides) => *base = overrides.clone(),
    }
}
