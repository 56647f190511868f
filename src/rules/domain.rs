//! Domain criteria matcher using Aho-Corasick
//!
//! A [`DomainCriteria`] answers one question: does a domain match any of its
//! entries? Five entry kinds are supported:
//!
//! - **Complete**: O(1) hash lookup
//! - **Prefix**: plain `starts_with`
//! - **Suffix**: label-aligned, via an automaton over reversed patterns
//! - **Keyword**: substring search (Aho-Corasick)
//! - **Regex**: a single `RegexSet`
//!
//! Domains are compared lowercase with any trailing dot removed.
//!
//! # Example
//!
//! ```
//! use policy_router::rules::domain::DomainCriteria;
//!
//! let criteria = DomainCriteria::builder()
//!     .add_complete("example.com")
//!     .add_suffix("google.com")
//!     .add_keyword("ads")
//!     .build()
//!     .unwrap();
//!
//! assert!(criteria.matches("example.com"));
//! assert!(criteria.matches("mail.google.com"));
//! assert!(criteria.matches("ads.example.org"));
//! assert!(!criteria.matches("notgoogle.com"));
//! ```

use std::collections::HashSet;

use aho_corasick::AhoCorasick;
use regex::RegexSet;
use serde::{Deserialize, Serialize};

use crate::error::RuleError;

/// One entry of a domain list
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainCriterion {
    /// Whole-domain equality
    Complete(String),
    /// Domain starts with the value
    Prefix(String),
    /// Domain equals the value or ends with `.value`
    Suffix(String),
    /// Domain contains the value
    Keyword(String),
    /// Domain matches the regular expression
    Regex(String),
}

/// Compiled set of domain criteria
#[derive(Debug)]
pub struct DomainCriteria {
    complete: HashSet<String>,
    prefixes: Vec<String>,
    /// Automaton over reversed suffix patterns
    suffix_automaton: Option<AhoCorasick>,
    keyword_automaton: Option<AhoCorasick>,
    regexes: Option<RegexSet>,
    len: usize,
}

impl DomainCriteria {
    /// Create a new builder
    #[must_use]
    pub fn builder() -> DomainCriteriaBuilder {
        DomainCriteriaBuilder::default()
    }

    /// Compile a list of criteria
    ///
    /// # Errors
    ///
    /// Returns `RuleError` if a regex is invalid or the list is empty.
    pub fn from_criteria<I>(criteria: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = DomainCriterion>,
    {
        criteria
            .into_iter()
            .fold(Self::builder(), DomainCriteriaBuilder::add)
            .build()
    }

    /// Check whether `domain` matches any entry
    #[must_use]
    pub fn matches(&self, domain: &str) -> bool {
        let domain = normalize(domain);
        if domain.is_empty() {
            return false;
        }

        if self.complete.contains(domain.as_str()) {
            return true;
        }
        if self.prefixes.iter().any(|p| domain.starts_with(p.as_str())) {
            return true;
        }
        if self.match_suffix(&domain) {
            return true;
        }
        if self
            .keyword_automaton
            .as_ref()
            .is_some_and(|ac| ac.is_match(domain.as_str()))
        {
            return true;
        }
        self.regexes.as_ref().is_some_and(|set| set.is_match(&domain))
    }

    /// Suffix match on label boundaries
    ///
    /// Pattern "google.com" is stored as "moc.elgoog". The reversed domain
    /// "moc.elgoog.liam" matches when a pattern hit starts at offset 0 and ends
    /// at the end of the string or right before a dot.
    fn match_suffix(&self, domain: &str) -> bool {
        let Some(automaton) = self.suffix_automaton.as_ref() else {
            return false;
        };
        let reversed: String = domain.chars().rev().collect();
        let bytes = reversed.as_bytes();

        automaton
            .find_overlapping_iter(reversed.as_str())
            .filter(|m| m.start() == 0)
            .any(|m| m.end() == bytes.len() || bytes[m.end()] == b'.')
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether there are no entries
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Builder for [`DomainCriteria`]
#[derive(Debug, Default)]
pub struct DomainCriteriaBuilder {
    complete: HashSet<String>,
    prefixes: Vec<String>,
    suffixes: Vec<String>,
    keywords: Vec<String>,
    regexes: Vec<String>,
}

impl DomainCriteriaBuilder {
    /// Add any criterion
    #[must_use]
    pub fn add(self, criterion: DomainCriterion) -> Self {
        match criterion {
            DomainCriterion::Complete(v) => self.add_complete(v),
            DomainCriterion::Prefix(v) => self.add_prefix(v),
            DomainCriterion::Suffix(v) => self.add_suffix(v),
            DomainCriterion::Keyword(v) => self.add_keyword(v),
            DomainCriterion::Regex(v) => self.add_regex(v),
        }
    }

    /// Add a complete-domain entry
    #[must_use]
    pub fn add_complete(mut self, domain: impl AsRef<str>) -> Self {
        self.complete.insert(normalize(domain.as_ref()));
        self
    }

    /// Add a prefix entry
    #[must_use]
    pub fn add_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        self.prefixes.push(prefix.as_ref().to_ascii_lowercase());
        self
    }

    /// Add a suffix entry
    ///
    /// A leading dot is ignored: ".google.com" and "google.com" are equivalent.
    #[must_use]
    pub fn add_suffix(mut self, suffix: impl AsRef<str>) -> Self {
        let suffix = normalize(suffix.as_ref().trim_start_matches('.'));
        self.suffixes.push(suffix.chars().rev().collect());
        self
    }

    /// Add a keyword entry
    #[must_use]
    pub fn add_keyword(mut self, keyword: impl AsRef<str>) -> Self {
        self.keywords.push(keyword.as_ref().to_ascii_lowercase());
        self
    }

    /// Add a regex entry (validated at build time)
    #[must_use]
    pub fn add_regex(mut self, pattern: impl Into<String>) -> Self {
        self.regexes.push(pattern.into());
        self
    }

    /// Compile the criteria
    ///
    /// # Errors
    ///
    /// Returns `RuleError::InvalidRegex` for a bad pattern, `RuleError::Empty`
    /// when nothing was added.
    pub fn build(self) -> Result<DomainCriteria, RuleError> {
        let len = self.complete.len()
            + self.prefixes.len()
            + self.suffixes.len()
            + self.keywords.len()
            + self.regexes.len();
        if len == 0 {
            return Err(RuleError::Empty);
        }

        let suffix_automaton = build_automaton(&self.suffixes)?;
        let keyword_automaton = build_automaton(&self.keywords)?;

        let regexes = if self.regexes.is_empty() {
            None
        } else {
            // Report the offending pattern rather than the whole set
            for pattern in &self.regexes {
                regex::Regex::new(pattern)
                    .map_err(|e| RuleError::invalid_regex(pattern, e.to_string()))?;
            }
            Some(
                RegexSet::new(&self.regexes)
                    .map_err(|e| RuleError::invalid_regex(self.regexes.join("|"), e.to_string()))?,
            )
        };

        Ok(DomainCriteria {
            complete: self.complete,
            prefixes: self.prefixes,
            suffix_automaton,
            keyword_automaton,
            regexes,
            len,
        })
    }
}

fn build_automaton(patterns: &[String]) -> Result<Option<AhoCorasick>, RuleError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    AhoCorasick::new(patterns)
        .map(Some)
        .map_err(|e| RuleError::MatcherBuild(e.to_string()))
}

/// Lowercase and strip the trailing root dot
pub(crate) fn normalize(domain: &str) -> String {
    domain.trim_end_matches('.').to_ascii_lowercase()
}
