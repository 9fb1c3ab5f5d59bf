//! Label matchers: the predicates silences are built from.
//!
//! A matcher set is a conjunction (all matchers must match); a silence holds
//! one or more sets in disjunctive normal form. Regex matchers use full-match
//! semantics: the pattern is anchored on both ends at compile time.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Error, LabelSet, Result};

/// Matcher comparison type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MatchType {
    Equal,
    NotEqual,
    Regexp,
    NotRegexp,
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MatchType::Equal => "=",
            MatchType::NotEqual => "!=",
            MatchType::Regexp => "=~",
            MatchType::NotRegexp => "!~",
        };
        write!(f, "{}", s)
    }
}

/// A single label predicate.
///
/// Regex patterns compile at construction; an invalid pattern never produces
/// a `Matcher` value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Matcher {
    pub name: String,
    pub pattern: String,
    pub match_type: MatchType,

    #[serde(skip)]
    compiled: Option<Regex>,
}

// Equality ignores the compiled regex: two matchers with the same
// name/pattern/type are the same predicate.
impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.pattern == other.pattern
            && self.match_type == other.match_type
    }
}

impl Eq for Matcher {}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}\"{}\"", self.name, self.match_type, self.pattern)
    }
}

/// Classic label name form: `[a-zA-Z_][a-zA-Z0-9_]*`.
fn is_valid_classic_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

impl Matcher {
    /// Build and validate a matcher. `utf8_labels` relaxes name validation
    /// to any non-empty string.
    pub fn new(
        name: impl Into<String>,
        pattern: impl Into<String>,
        match_type: MatchType,
        utf8_labels: bool,
    ) -> Result<Self> {
        let name = name.into();
        let pattern = pattern.into();

        if name.is_empty() {
            return Err(Error::validation("matcher label name must not be empty"));
        }
        if !utf8_labels && !is_valid_classic_name(&name) {
            return Err(Error::validation(format!(
                "invalid label name \"{}\"",
                name
            )));
        }

        let compiled = match match_type {
            MatchType::Regexp | MatchType::NotRegexp => {
                let anchored = format!("^(?:{})$", pattern);
                let re = Regex::new(&anchored).map_err(|e| {
                    Error::validation(format!("invalid regex \"{}\": {}", pattern, e))
                })?;
                Some(re)
            }
            MatchType::Equal | MatchType::NotEqual => None,
        };

        Ok(Self {
            name,
            pattern,
            match_type,
            compiled,
        })
    }

    /// Re-validate a deserialized matcher and compile its pattern.
    ///
    /// Serde skips the compiled regex, so anything coming off the wire or
    /// out of a snapshot passes through here before use.
    pub fn init(&mut self, utf8_labels: bool) -> Result<()> {
        let rebuilt = Matcher::new(
            self.name.clone(),
            self.pattern.clone(),
            self.match_type,
            utf8_labels,
        )?;
        self.compiled = rebuilt.compiled;
        Ok(())
    }

    /// Evaluate against a single value.
    pub fn matches_value(&self, value: &str) -> bool {
        match self.match_type {
            MatchType::Equal => value == self.pattern,
            MatchType::NotEqual => value != self.pattern,
            // An uncompiled regex matcher (never passed through init) is
            // treated as non-matching rather than panicking.
            MatchType::Regexp => self
                .compiled
                .as_ref()
                .map(|re| re.is_match(value))
                .unwrap_or(false),
            MatchType::NotRegexp => self
                .compiled
                .as_ref()
                .map(|re| !re.is_match(value))
                .unwrap_or(false),
        }
    }

    /// Evaluate against a label set. A missing label reads as "".
    pub fn matches(&self, labels: &LabelSet) -> bool {
        self.matches_value(labels.get(&self.name).unwrap_or(""))
    }

    /// Whether this matcher accepts the empty string. A silence where every
    /// matcher accepts "" would mute every alert.
    pub fn matches_empty(&self) -> bool {
        self.matches_value("")
    }
}

/// Evaluate a conjunction: every matcher in the set must match.
pub fn set_matches(set: &[Matcher], labels: &LabelSet) -> bool {
    !set.is_empty() && set.iter().all(|m| m.matches(labels))
}

/// Evaluate the disjunctive normal form: any set matching in full matches.
pub fn dnf_matches(sets: &[Vec<Matcher>], labels: &LabelSet) -> bool {
    sets.iter().any(|set| set_matches(set, labels))
}
