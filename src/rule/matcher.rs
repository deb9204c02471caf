//! Rule URL pattern compilation and matching.
//!
//! Rule patterns are plain text with regular expressions embedded between capture
//! delimiters. `https://api.example.com/users/<[0-9]+>` becomes
//! `^https://api\.example\.com/users/([0-9]+)$`.
//!
//! The default delimiters are `<` and `>`. Patterns that need lookbehind `(?<=`,
//! `(?<!` or atomic groups `(?>` must use `<<` and `>>` instead, otherwise the
//! delimiters and the group syntax cannot be told apart.

use std::{collections::HashMap, sync::Arc};

use crc::{CRC_64_GO_ISO, Crc};
use fancy_regex::Regex;

use super::RuleError;

static CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Stand-ins for `<<` and `>>` so doubled delimiters can be scanned as single chars.
const START_SENTINEL: char = '\u{E000}';
const END_SENTINEL: char = '\u{E001}';

/// Compiles rule patterns and caches the last compiled regex.
///
/// One slot only: compiling a different pattern replaces the cached one. The slot
/// is keyed by a CRC-64 of the raw pattern, so a changed pattern is recompiled
/// without any explicit invalidation. Failed compiles leave the slot untouched.
#[derive(Debug, Default)]
pub struct RegexpMatchingEngine {
    compiled: Option<Arc<Regex>>,
    checksum: u64,
}

impl RegexpMatchingEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Checksum of the pattern behind the cached regex (0 when nothing compiled yet).
    pub fn checksum(&self) -> u64 {
        self.checksum
    }

    /// Compiles `pattern`, reusing the cached regex when the pattern is unchanged.
    pub fn compile(&mut self, pattern: &str) -> Result<Arc<Regex>, RuleError> {
        let checksum = CRC64.checksum(pattern.as_bytes());
        if let Some(compiled) = &self.compiled
            && checksum == self.checksum
        {
            return Ok(Arc::clone(compiled));
        }

        let compiled = Arc::new(compile_pattern(pattern)?);
        self.compiled = Some(Arc::clone(&compiled));
        self.checksum = checksum;
        Ok(compiled)
    }

    pub fn is_matching(&mut self, pattern: &str, input: &str) -> Result<bool, RuleError> {
        let compiled = self.compile(pattern)?;
        compiled
            .is_match(input)
            .map_err(|e| RuleError::evaluation(pattern, e))
    }

    /// Replaces every match of `pattern` in `input`. `$1` / `${name}` expand captures.
    pub fn replace_all(
        &mut self,
        pattern: &str,
        input: &str,
        replacement: &str,
    ) -> Result<String, RuleError> {
        let compiled = self.compile(pattern)?;
        compiled
            .try_replacen(input, 0, replacement)
            .map(|replaced| replaced.into_owned())
            .map_err(|e| RuleError::evaluation(pattern, e))
    }

    /// Returns the positional captures of `input`.
    pub fn find_string_submatch(
        &mut self,
        pattern: &str,
        input: &str,
    ) -> Result<Vec<String>, RuleError> {
        let compiled = self.compile(pattern)?;
        positional_captures(&compiled, pattern, input)
    }

    /// Returns every capture of `input` keyed by group name or group index.
    pub fn find_named_string_submatch(
        &mut self,
        pattern: &str,
        input: &str,
    ) -> Result<HashMap<String, String>, RuleError> {
        let compiled = self.compile(pattern)?;
        named_captures(&compiled, pattern, input)
    }
}

/// Positional captures of a compiled rule pattern.
///
/// A group is kept only when its name is its own 1-based index, which is true for
/// unnamed groups and false for `(?<name>...)` groups.
pub(crate) fn positional_captures(
    compiled: &Regex,
    pattern: &str,
    input: &str,
) -> Result<Vec<String>, RuleError> {
    let captures = compiled
        .captures(input)
        .map_err(|e| RuleError::evaluation(pattern, e))?
        .ok_or_else(|| not_matched(pattern, input))?;

    let groups = compiled
        .capture_names()
        .enumerate()
        .skip(1)
        .filter(|(index, name)| group_name(*index, *name).parse::<usize>() == Ok(*index))
        .map(|(index, _)| capture_text(&captures, index))
        .collect();
    Ok(groups)
}

pub(crate) fn named_captures(
    compiled: &Regex,
    pattern: &str,
    input: &str,
) -> Result<HashMap<String, String>, RuleError> {
    let captures = compiled
        .captures(input)
        .map_err(|e| RuleError::evaluation(pattern, e))?
        .ok_or_else(|| not_matched(pattern, input))?;

    let groups = compiled
        .capture_names()
        .enumerate()
        .skip(1)
        .map(|(index, name)| (group_name(index, name), capture_text(&captures, index)))
        .collect();
    Ok(groups)
}

fn group_name(index: usize, name: Option<&str>) -> String {
    name.map(str::to_string).unwrap_or_else(|| index.to_string())
}

// Groups that did not participate in the match read as "".
fn capture_text(captures: &fancy_regex::Captures<'_>, index: usize) -> String {
    captures
        .get(index)
        .map(|m| m.as_str().to_string())
        .unwrap_or_default()
}

fn not_matched(pattern: &str, input: &str) -> RuleError {
    RuleError::NotMatched {
        pattern: pattern.to_string(),
        input: input.to_string(),
    }
}

/// Turns a delimited rule pattern into an anchored regular expression.
fn compile_pattern(pattern: &str) -> Result<Regex, RuleError> {
    let (template, start, end) = select_delimiters(pattern)?;
    let expression = delimited_to_regex(pattern, &template, start, end)?;
    Regex::new(&expression).map_err(|e| RuleError::compile(pattern, e.to_string()))
}

/// Picks the delimiter pair, rewriting `<<`/`>>` into sentinels when both are used.
fn select_delimiters(pattern: &str) -> Result<(String, char, char), RuleError> {
    let rewritten = pattern
        .replace("<<", &START_SENTINEL.to_string())
        .replace(">>", &END_SENTINEL.to_string());
    if rewritten.contains(START_SENTINEL) && rewritten.contains(END_SENTINEL) {
        return Ok((rewritten, START_SENTINEL, END_SENTINEL));
    }

    if pattern.contains("(?>") || pattern.contains("(?<") {
        return Err(RuleError::compile(
            pattern,
            "atomic groups and lookbehind need the capture delimiters switched \
             from '<...>' to '<<...>>'",
        ));
    }
    Ok((pattern.to_string(), '<', '>'))
}

/// Escapes literal text, wraps each delimited span in a group and anchors the result.
fn delimited_to_regex(
    pattern: &str,
    template: &str,
    start: char,
    end: char,
) -> Result<String, RuleError> {
    let mut expression = String::with_capacity(template.len() + 16);
    expression.push('^');

    let mut level = 0usize;
    let mut literal_from = 0;
    let mut span_from = 0;
    for (index, ch) in template.char_indices() {
        if ch == start {
            level += 1;
            if level == 1 {
                quote_meta(&template[literal_from..index], &mut expression);
                span_from = index + ch.len_utf8();
            }
        } else if ch == end {
            if level == 0 {
                return Err(RuleError::compile(
                    pattern,
                    format!("unbalanced capture delimiters at byte {index}"),
                ));
            }
            level -= 1;
            if level == 0 {
                expression.push('(');
                expression.push_str(&template[span_from..index]);
                expression.push(')');
                literal_from = index + ch.len_utf8();
            }
        }
    }
    if level != 0 {
        return Err(RuleError::compile(pattern, "unbalanced capture delimiters"));
    }

    quote_meta(&template[literal_from..], &mut expression);
    expression.push('$');
    Ok(expression)
}

// Same character set as RE2's QuoteMeta; fancy-regex rejects some of the extra
// escapes `regex::escape` emits.
fn quote_meta(literal: &str, out: &mut String) {
    for ch in literal.chars() {
        if matches!(
            ch,
            '\\' | '.' | '+' | '*' | '?' | '(' | ')' | '|' | '[' | ']' | '{' | '}' | '^' | '$'
        ) {
            out.push('\\');
        }
        out.push(ch);
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::one_group("urn:foo:<.*>", "urn:foo:user", vec!["user"])]
    #[case::several_groups("urn:foo:<.*>:<.*>", "urn:foo:user:one", vec!["user", "one"])]
    #[case::alternation("urn:foo:<foo|bar>", "urn:foo:bar", vec!["bar"])]
    #[case::positive_lookbehind("urn:foo:<<(?<=foo:)foobar>>", "urn:foo:foobar", vec!["foobar"])]
    #[case::negative_lookbehind("urn:foo:<<(?<!boo:)foobar>>", "urn:foo:foobar", vec!["foobar"])]
    #[case::named_group_excluded(
        "urn:foo:<<(?:(?<foo>abc))(?:\\k<foo>.*)>>",
        "urn:foo:abcabcabc",
        vec!["abcabcabc"]
    )]
    #[case::no_groups("https://example.com/health", "https://example.com/health", vec![])]
    fn test_find_string_submatch(
        #[case] pattern: &str,
        #[case] input: &str,
        #[case] want: Vec<&str>,
    ) {
        let mut engine = RegexpMatchingEngine::new();
        let got = engine.find_string_submatch(pattern, input).unwrap();
        assert_eq!(got, want);
    }

    #[rstest]
    #[case::single_char_vs_word("urn:foo:<.?>", "urn:foo:user")]
    #[case::lookbehind_rejects("urn:foo:<<(?<!boo:)foobar>>", "urn:boo:foobar")]
    #[case::literal_is_escaped("https://example.com/<.*>", "https://exampleXcom/a")]
    #[case::anchored_end("https://example.com/<[a-z]+>", "https://example.com/abc/def")]
    fn test_find_string_submatch_not_matched(#[case] pattern: &str, #[case] input: &str) {
        let mut engine = RegexpMatchingEngine::new();
        let err = engine.find_string_submatch(pattern, input).unwrap_err();
        assert!(err.is_not_matched(), "unexpected error: {err}");
    }

    #[rstest]
    #[case::lookbehind_default_delimiters("urn:foo:<(?<=foo:)foobar>")]
    #[case::atomic_default_delimiters("urn:foo:<(?>foo)bar>")]
    #[case::unbalanced_open("urn:foo:<.*")]
    #[case::unbalanced_close("urn:foo:.*>")]
    #[case::invalid_regex("urn:foo:<[a-z>")]
    fn test_compile_errors(#[case] pattern: &str) {
        let mut engine = RegexpMatchingEngine::new();
        let err = engine.compile(pattern).unwrap_err();
        assert!(matches!(err, RuleError::Compile { .. }), "unexpected error: {err}");
    }

    #[test]
    fn test_wrong_delimiters_error_explains_fix() {
        let mut engine = RegexpMatchingEngine::new();
        let err = engine.compile("urn:foo:<(?<=foo:)foobar>").unwrap_err();
        assert!(err.to_string().contains("<<...>>"));
    }

    #[test]
    fn test_find_named_string_submatch() {
        let mut engine = RegexpMatchingEngine::new();
        let got = engine
            .find_named_string_submatch("urn:foo:<<(?<named>.*)>>", "urn:foo:ready")
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got["1"], "ready");
        assert_eq!(got["named"], "ready");
    }

    #[test]
    fn test_find_named_string_submatch_backreference() {
        let mut engine = RegexpMatchingEngine::new();
        let got = engine
            .find_named_string_submatch(
                "urn:foo:<<(?:(?<foo>abc))(?:\\k<foo>.*)>>",
                "urn:foo:abcabcabc",
            )
            .unwrap();
        assert_eq!(got["1"], "abcabcabc");
        assert_eq!(got["foo"], "abc");
    }

    #[test]
    fn test_find_named_string_submatch_not_matched() {
        let mut engine = RegexpMatchingEngine::new();
        let err = engine
            .find_named_string_submatch("urn:foo:<.*>", "urn:bar:ready")
            .unwrap_err();
        assert!(err.is_not_matched());
    }

    #[test]
    fn test_is_matching() {
        let mut engine = RegexpMatchingEngine::new();
        assert!(
            engine
                .is_matching("https://example.com/users/<[0-9]+>", "https://example.com/users/42")
                .unwrap()
        );
        assert!(
            !engine
                .is_matching("https://example.com/users/<[0-9]+>", "https://example.com/users/me")
                .unwrap()
        );
    }

    #[test]
    fn test_replace_all() {
        let mut engine = RegexpMatchingEngine::new();
        let replaced = engine
            .replace_all("https://example.com/<[a-z]+>", "https://example.com/users", "$1")
            .unwrap();
        assert_eq!(replaced, "users");
    }

    #[test]
    fn test_compile_is_cached_by_checksum() {
        let mut engine = RegexpMatchingEngine::new();
        assert_eq!(engine.checksum(), 0);

        let first = engine.compile("urn:foo:<.*>").unwrap();
        let checksum = engine.checksum();
        assert_ne!(checksum, 0);

        let second = engine.compile("urn:foo:<.*>").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.checksum(), checksum);

        let third = engine.compile("urn:bar:<.*>").unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
        assert_ne!(engine.checksum(), checksum);
    }

    #[test]
    fn test_cached_and_fresh_compiles_agree() {
        let pattern = "https://<[a-z]+>.example.com/<.*>";
        let mut cached = RegexpMatchingEngine::new();
        cached.compile(pattern).unwrap();

        for input in [
            "https://api.example.com/v1/users",
            "https://API.example.com/v1",
            "http://api.example.com/",
        ] {
            let mut fresh = RegexpMatchingEngine::new();
            assert_eq!(
                cached.find_string_submatch(pattern, input).ok(),
                fresh.find_string_submatch(pattern, input).ok(),
                "{input}"
            );
        }
    }

    #[test]
    fn test_failed_compile_keeps_previous_checksum() {
        let mut engine = RegexpMatchingEngine::new();
        engine.compile("urn:foo:<.*>").unwrap();
        let checksum = engine.checksum();

        assert!(engine.compile("urn:foo:<[a-z>").is_err());
        assert_eq!(engine.checksum(), checksum);

        // The same bad pattern is attempted again rather than served from cache.
        assert!(engine.compile("urn:foo:<[a-z>").is_err());
        assert_eq!(engine.checksum(), checksum);
    }
}
