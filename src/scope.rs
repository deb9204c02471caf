//! OAuth-style scope matching strategies.
//!
//! Scopes are dot-segmented permission strings. A caller holds a set of granted
//! scopes (the haystack) which is checked against one requested scope (the needle).
//! Three strategies are available:
//!
//! - [`exact_scope_strategy`]: byte-for-byte equality
//! - [`hierarchic_scope_strategy`]: `picture` grants `picture.read`
//! - [`wildcard_scope_strategy`]: `+` matches one segment, `*` matches zero or more
//!
//! All strategies are pure functions and safe to call concurrently.

use serde::{Deserialize, Serialize};

/// Strategy used to decide whether granted scopes cover a requested scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeStrategy {
    #[default]
    Exact,
    Hierarchic,
    Wildcard,
}

impl ScopeStrategy {
    /// Returns true if any entry of `granted` authorizes `needle`.
    pub fn matches<S: AsRef<str>>(&self, granted: &[S], needle: &str) -> bool {
        match self {
            ScopeStrategy::Exact => exact_scope_strategy(granted, needle),
            ScopeStrategy::Hierarchic => hierarchic_scope_strategy(granted, needle),
            ScopeStrategy::Wildcard => wildcard_scope_strategy(granted, needle),
        }
    }
}

/// Requested scope must equal one granted scope exactly.
pub fn exact_scope_strategy<S: AsRef<str>>(granted: &[S], needle: &str) -> bool {
    granted.iter().any(|this| this.as_ref() == needle)
}

/// A granted scope authorizes every scope below it in the dot hierarchy.
///
/// `picture` authorizes `picture` and `picture.read`, but `picture.read` does not
/// authorize `picture`.
pub fn hierarchic_scope_strategy<S: AsRef<str>>(granted: &[S], needle: &str) -> bool {
    for this in granted {
        let this = this.as_ref();

        if this == needle {
            return true;
        }

        // picture.read never grants picture
        if this.len() > needle.len() {
            continue;
        }

        let mut needles = needle.split('.');
        let mut covered = true;
        for segment in this.split('.') {
            match needles.next() {
                Some(current) if current == segment => {}
                _ => {
                    covered = false;
                    break;
                }
            }
        }

        // Every granted segment matched and the needle goes deeper.
        if covered && needles.next().is_some() {
            return true;
        }
    }

    false
}

/// Granted scopes are patterns with segment wildcards.
///
/// - `+` matches exactly one non-empty segment
/// - `*` matches zero or more segments (only meaningful as a whole segment)
/// - literal segments must match exactly
///
/// A needle with an empty segment (leading dot, trailing dot, `..`) never matches.
pub fn wildcard_scope_strategy<S: AsRef<str>>(granted: &[S], needle: &str) -> bool {
    granted
        .iter()
        .any(|pattern| match_pattern(pattern.as_ref(), needle))
}

/// Matches one wildcard pattern against a candidate scope.
///
/// Works on byte ranges of both inputs; nothing is allocated.
///
/// ```ignore
/// assert!(match_pattern("a.+.c", "a.b.c"));
/// assert!(!match_pattern("a.+.c", "a..c"));
/// assert!(match_pattern("a.b.*.d", "a.b.d"));
/// assert!(match_pattern("x.*.y", "x.a.b.y"));
/// ```
fn match_pattern(pattern: &str, candidate: &str) -> bool {
    if has_empty_segment(candidate.as_bytes()) {
        return false;
    }
    match_from(pattern.as_bytes(), 0, candidate.as_bytes(), 0)
}

fn has_empty_segment(s: &[u8]) -> bool {
    if s.is_empty() {
        return false;
    }
    if s[0] == b'.' || s[s.len() - 1] == b'.' {
        return true;
    }
    s.windows(2).any(|w| w == b"..")
}

/// Returns the end of the segment starting at `start` and the index after its dot.
fn segment_bounds(s: &[u8], start: usize) -> (usize, usize) {
    let mut end = start;
    while end < s.len() && s[end] != b'.' {
        end += 1;
    }
    let next = if end < s.len() { end + 1 } else { end };
    (end, next)
}

/// Matches `pattern[pi..]` against `candidate[ci..]` with segment semantics.
fn match_from(pattern: &[u8], pi: usize, candidate: &[u8], ci: usize) -> bool {
    if pi >= pattern.len() {
        return ci >= candidate.len();
    }

    let p_start = pi;
    let (p_end, next_pi) = segment_bounds(pattern, pi);
    let p_segment = &pattern[p_start..p_end];

    if p_segment == b"*" {
        // Trailing "*" swallows whatever is left, including nothing.
        if next_pi >= pattern.len() {
            return true;
        }

        // Let "*" consume zero, one, two, ... candidate segments.
        let mut ci_try = ci;
        loop {
            if match_from(pattern, next_pi, candidate, ci_try) {
                return true;
            }
            if ci_try >= candidate.len() {
                return false;
            }
            ci_try = segment_bounds(candidate, ci_try).1;
        }
    }

    if ci >= candidate.len() || candidate[ci] == b'.' {
        return false;
    }

    let c_start = ci;
    let (c_end, next_ci) = segment_bounds(candidate, ci);

    if p_segment == b"+" {
        return match_from(pattern, next_pi, candidate, next_ci);
    }

    if p_segment != &candidate[c_start..c_end] {
        return false;
    }
    match_from(pattern, next_pi, candidate, next_ci)
}
