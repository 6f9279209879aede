//! Anchored shell-glob matching for peer names and endpoints.
//!
//! Wants, subscriptions and recv-handler keys are all shell globs
//! (`*`, `?`, `[...]`) that must match the whole candidate string.
//! A pattern that fails to compile degrades to literal comparison so a
//! user typo can never take down the dispatch path.

use glob::Pattern;

/// A compiled glob pattern keyed by its original text.
#[derive(Debug, Clone)]
pub struct NamePattern {
    raw: String,
    compiled: Option<Pattern>,
}

impl NamePattern {
    pub fn new(pattern: &str) -> Self {
        Self {
            raw: pattern.to_string(),
            compiled: Pattern::new(pattern).ok(),
        }
    }

    /// Match `name` against the whole pattern.
    pub fn matches(&self, name: &str) -> bool {
        match &self.compiled {
            Some(pattern) => pattern.matches(name),
            None => self.raw == name,
        }
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// One-shot glob match without keeping the compiled pattern.
pub fn glob_match(pattern: &str, name: &str) -> bool {
    match Pattern::new(pattern) {
        Ok(pattern) => pattern.matches(name),
        Err(_) => pattern == name,
    }
}
