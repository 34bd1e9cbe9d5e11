//! Text-pattern classification of captured diagnostics.
//!
//! Remote channels (the proxied command runner, the registry import service)
//! only hand back free text. Callers describe how to interpret that text as an
//! ordered list of [`Rule`]s; the first rule whose pattern occurs in the text
//! decides the category. Matching is case-insensitive substring matching so
//! the rule tables stay readable and can be tested without a live backend.

/// One `(pattern, category)` classification rule.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rule<C> {
    /// Substring to look for (compared case-insensitively)
    pub pattern: &'static str,
    /// Category assigned when the pattern matches
    pub category: C,
}

impl<C> Rule<C> {
    /// Create a rule
    pub const fn new(pattern: &'static str, category: C) -> Self {
        Self { pattern, category }
    }
}

/// Return the category of the first rule matching `text`, in rule order.
pub fn classify<C: Copy>(text: &str, rules: &[Rule<C>]) -> Option<C> {
    let haystack = text.to_ascii_lowercase();
    rules
        .iter()
        .find(|rule| haystack.contains(&rule.pattern.to_ascii_lowercase()))
        .map(|rule| rule.category)
}

/// Like [`classify`] but falls back to `default` when nothing matches.
pub fn classify_or<C: Copy>(text: &str, rules: &[Rule<C>], default: C) -> C {
    classify(text, rules).unwrap_or(default)
}
