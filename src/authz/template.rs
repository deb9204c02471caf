//! Compiled template cache for authorizer payloads and headers.

use minijinja::{AutoEscape, Environment};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::AuthzError;

/// Memoizes compiled templates by key for the lifetime of the owning authorizer.
///
/// Lookups take the read lock; a miss (or a key whose source text changed) takes
/// the write lock once to compile. Rendering never mutates the cache.
pub struct TemplateCache {
    env: RwLock<Environment<'static>>,
}

impl Default for TemplateCache {
    fn default() -> Self {
        let mut env = Environment::new();
        // Payloads are JSON and headers are plain text; never HTML-escape.
        env.set_auto_escape_callback(|_| AutoEscape::None);
        Self {
            env: RwLock::new(env),
        }
    }
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cache key for a payload template: hex SHA-256 of its text.
    pub fn payload_key(payload: &str) -> String {
        hex::encode(Sha256::digest(payload.as_bytes()))
    }

    /// Cache key for a header template: `<rule id>:<header name>`.
    pub fn header_key(rule_id: &str, header: &str) -> String {
        format!("{rule_id}:{header}")
    }

    pub fn contains(&self, key: &str) -> bool {
        self.env.read().get_template(key).is_ok()
    }

    /// Renders the template cached under `key`, compiling `source` on first use.
    pub fn render<S: Serialize>(
        &self,
        key: &str,
        source: &str,
        context: &S,
    ) -> Result<String, AuthzError> {
        {
            let env = self.env.read();
            if let Ok(template) = env.get_template(key)
                && template.source() == source
            {
                return template
                    .render(context)
                    .map_err(|e| AuthzError::Template(format!("rendering '{key}': {e}")));
            }
        }

        let mut env = self.env.write();
        env.add_template_owned(key.to_string(), source.to_string())
            .map_err(|e| AuthzError::Template(format!("parsing '{key}': {e}")))?;
        tracing::debug!(key = key, "Compiled template");

        let template = env
            .get_template(key)
            .map_err(|e| AuthzError::Template(e.to_string()))?;
        template
            .render(context)
            .map_err(|e| AuthzError::Template(format!("rendering '{key}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_payload_key_is_sha256_hex() {
        assert_eq!(
            TemplateCache::payload_key(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(TemplateCache::header_key("rule-1", "X-User"), "rule-1:X-User");
    }

    #[test]
    fn test_render_and_cache() {
        let cache = TemplateCache::new();
        let source = r#"{"subject": "{{ subject }}"}"#;
        let key = TemplateCache::payload_key(source);

        assert!(!cache.contains(&key));
        let rendered = cache.render(&key, source, &json!({ "subject": "alice" })).unwrap();
        assert_eq!(rendered, r#"{"subject": "alice"}"#);
        assert!(cache.contains(&key));

        let rendered = cache.render(&key, source, &json!({ "subject": "bob" })).unwrap();
        assert_eq!(rendered, r#"{"subject": "bob"}"#);
    }

    #[test]
    fn test_render_does_not_html_escape() {
        let cache = TemplateCache::new();
        let rendered = cache
            .render("rule:X-Q", "{{ q }}", &json!({ "q": "a<b & \"c\"" }))
            .unwrap();
        assert_eq!(rendered, "a<b & \"c\"");
    }

    #[test]
    fn test_changed_source_is_recompiled() {
        let cache = TemplateCache::new();
        let ctx = json!({ "subject": "alice" });
        assert_eq!(cache.render("rule:X-User", "{{ subject }}", &ctx).unwrap(), "alice");
        assert_eq!(
            cache.render("rule:X-User", "user={{ subject }}", &ctx).unwrap(),
            "user=alice"
        );
    }

    #[test]
    fn test_render_parse_error() {
        let cache = TemplateCache::new();
        let err = cache.render("bad", "{{ subject ", &json!({})).unwrap_err();
        assert!(matches!(err, AuthzError::Template(_)));
    }
}
