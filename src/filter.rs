//! Filter engine: decides whether a source is polled and which of its items
//! become download candidates.
//!
//! Three gates, cheapest first:
//!
//! * [`is_eligible`]: disabled or expired sources are skipped before any
//!   network access.
//! * [`passes_date_threshold`]: items not published strictly after the
//!   source's `download_after` are dropped.
//! * [`matches`]: exclude patterns win over include patterns; an empty
//!   include set matches everything.
//!
//! Patterns are regular expressions.  A pattern that fails to compile is
//! logged and dropped from its set; the remaining patterns still apply.

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::config::Source;
use crate::source::FeedItem;

/// A compiled set of title patterns.  First match wins; no scoring.
#[derive(Debug, Clone, Default)]
pub struct PatternSet {
    patterns: Vec<Regex>,
}

/// A pattern that was dropped because it does not compile.
#[derive(Debug, Clone)]
pub struct PatternError {
    pub pattern: String,
    pub error: regex::Error,
}

impl PatternSet {
    /// Compile every pattern, returning the usable set together with a
    /// diagnostic for each pattern that was dropped.
    pub fn compile<S: AsRef<str>>(patterns: &[S]) -> (Self, Vec<PatternError>) {
        let mut compiled = Vec::with_capacity(patterns.len());
        let mut errors = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref();
            match Regex::new(pattern) {
                Ok(re) => compiled.push(re),
                Err(error) => errors.push(PatternError {
                    pattern: pattern.to_string(),
                    error,
                }),
            }
        }

        (Self { patterns: compiled }, errors)
    }

    /// [`compile`](Self::compile), logging every dropped pattern against
    /// the owning source.
    pub fn compile_logged<S: AsRef<str>>(source: &str, patterns: &[S]) -> Self {
        let (set, errors) = Self::compile(patterns);
        for e in &errors {
            warn!(source, pattern = %e.pattern, error = %e.error, "dropping invalid pattern");
        }
        if !set.is_empty() {
            debug!(source, patterns = set.len(), "compiled title patterns");
        }
        set
    }

    pub fn is_match(&self, title: &str) -> bool {
        self.patterns.iter().any(|re| re.is_match(title))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Whether `source` takes part in a cycle right now.
pub fn is_eligible(source: &Source) -> bool {
    is_eligible_at(source, Utc::now())
}

/// [`is_eligible`] against an explicit clock.
///
/// A source is ineligible when disabled or when its expiry is not after
/// `now`.
pub fn is_eligible_at(source: &Source, now: DateTime<Utc>) -> bool {
    if source.disabled {
        return false;
    }
    match source.expires_at() {
        Some(expiry) => expiry > now,
        None => true,
    }
}

/// Whether `item` was published strictly after the source's threshold.
///
/// Always true when no threshold is configured.  An item without a publish
/// date never passes a configured threshold.
pub fn passes_date_threshold(source: &Source, item: &FeedItem) -> bool {
    let Some(threshold) = source.download_after_time() else {
        return true;
    };
    item.published.is_some_and(|published| published > threshold)
}

/// Whether `title` is selected by the source's patterns.
///
/// Any exclude match rejects the title outright.  An empty include set (as
/// configured, not as compiled) accepts everything else.
pub fn matches(source: &Source, title: &str) -> bool {
    if source.exclude_patterns().is_match(title) {
        return false;
    }
    if source.include.is_empty() {
        return true;
    }
    source.include_patterns().is_match(title)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
