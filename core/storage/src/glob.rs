//! Wildcard patterns for cache keys.
//!
//! `*` matches any run of characters (including none) and may appear at the
//! end or in the middle of a pattern. Everything else matches literally,
//! so `?` and `.` in query strings need no escaping by callers.

use regex::Regex;

use fiscalgate_common::{Error, Result};

/// A compiled cache-key wildcard pattern.
#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    /// Compile a pattern into an anchored regular expression.
    pub fn new(pattern: &str) -> Result<Self> {
        let body = pattern
            .split('*')
            .map(regex::escape)
            .collect::<Vec<_>>()
            .join(".*");
        let regex = Regex::new(&format!("^{}$", body))
            .map_err(|e| Error::InvalidInput(format!("Invalid pattern '{}': {}", pattern, e)))?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    /// Check whether a key matches.
    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    /// The pattern as written.
    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_trailing_wildcard() {
        let pattern = GlobPattern::new("/mf1/receipts*").unwrap();
        assert!(pattern.matches("/mf1/receipts"));
        assert!(pattern.matches("/mf1/receipts?page=2"));
        assert!(pattern.matches("/mf1/receipts/abc-123"));
        assert!(!pattern.matches("/mf1/merchants"));
        assert!(!pattern.matches("/v2/mf1/receipts"));
    }

    #[test]
    fn test_embedded_wildcard() {
        let pattern = GlobPattern::new("/mf1/cash-registers/*/receipts").unwrap();
        assert!(pattern.matches("/mf1/cash-registers/42/receipts"));
        assert!(!pattern.matches("/mf1/cash-registers/42/receipts?page=1"));
        assert!(!pattern.matches("/mf1/cash-registers/42"));
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let pattern = GlobPattern::new("/mf1/receipts?page=1").unwrap();
        assert!(pattern.matches("/mf1/receipts?page=1"));
        assert!(!pattern.matches("/mf1/receiptpage=1"));
    }

    proptest! {
        #[test]
        fn prop_prefix_pattern_matches_exactly_prefixed_keys(
            prefix in "/[a-z0-9/]{1,20}",
            suffix in "[a-z0-9/?=&]{0,20}",
            other in "/[a-z0-9/?=&]{1,40}",
        ) {
            let pattern = GlobPattern::new(&format!("{}*", prefix)).unwrap();
            let key = format!("{}{}", prefix, suffix);
            prop_assert!(pattern.matches(&key));
            prop_assert_eq!(pattern.matches(&other), other.starts_with(&prefix));
        }
    }
}
