//! Rule errors.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuleError {
    /// The pattern cannot be turned into a regular expression.
    #[error("unable to compile rule pattern {pattern:?}: {reason}")]
    Compile { pattern: String, reason: String },

    /// The pattern compiled but the input does not match it.
    #[error("rule pattern {pattern:?} does not match {input:?}")]
    NotMatched { pattern: String, input: String },

    /// The regex engine gave up while evaluating (backtrack limit and similar).
    #[error("rule pattern {pattern:?} could not be evaluated: {reason}")]
    Evaluation { pattern: String, reason: String },

    #[error("no rule matched {method} {url}")]
    NoRuleMatched { method: String, url: String },

    #[error("expected exactly one rule to match {method} {url}, found {}: {}", .ids.len(), .ids.join(", "))]
    MultipleRulesMatched {
        method: String,
        url: String,
        ids: Vec<String>,
    },
}

impl RuleError {
    pub(crate) fn compile(pattern: &str, reason: impl Into<String>) -> Self {
        Self::Compile {
            pattern: pattern.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn evaluation(pattern: &str, reason: impl ToString) -> Self {
        Self::Evaluation {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Returns true when the error only means "this rule does not apply".
    pub fn is_not_matched(&self) -> bool {
        matches!(self, Self::NotMatched { .. })
    }
}
