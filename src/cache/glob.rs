//! Glob patterns for bulk invalidation.
//!
//! `*` matches any run of characters and `?` exactly one. Everything else is
//! literal, so keys containing `.`, `(` or `+` never widen a match.

use std::fmt;

use regex::Regex;

use super::error::CacheError;

#[derive(Debug, Clone)]
pub struct GlobPattern {
    source: String,
    regex: Regex,
}

impl GlobPattern {
    /// Compile a glob into an anchored regular expression.
    pub fn new(pattern: &str) -> Result<Self, CacheError> {
        let mut expr = String::with_capacity(pattern.len() + 8);
        expr.push('^');
        let mut literal = String::new();
        for ch in pattern.chars() {
            match ch {
                '*' | '?' => {
                    expr.push_str(&regex::escape(&literal));
                    literal.clear();
                    expr.push_str(if ch == '*' { ".*" } else { "." });
                }
                other => literal.push(other),
            }
        }
        expr.push_str(&regex::escape(&literal));
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|source| CacheError::InvalidPattern {
            pattern: pattern.to_string(),
            source,
        })?;

        Ok(Self {
            source: pattern.to_string(),
            regex,
        })
    }

    pub fn matches(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Longest literal prefix before the first wildcard.
    pub fn literal_prefix(&self) -> &str {
        let end = self
            .source
            .find(['*', '?'])
            .unwrap_or(self.source.len());
        &self.source[..end]
    }
}

impl fmt::Display for GlobPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_any_suffix() {
        let pattern = GlobPattern::new("content:list:*").expect("valid glob");
        assert!(pattern.matches("content:list:a"));
        assert!(pattern.matches("content:list:"));
        assert!(!pattern.matches("content:item:1"));
    }

    #[test]
    fn question_mark_matches_one_char() {
        let pattern = GlobPattern::new("media:item:?").expect("valid glob");
        assert!(pattern.matches("media:item:7"));
        assert!(!pattern.matches("media:item:70"));
    }

    #[test]
    fn matches_are_anchored() {
        let pattern = GlobPattern::new("content:*").expect("valid glob");
        assert!(!pattern.matches("api:content:1"));
        assert!(!pattern.matches("user:id:1"));
    }

    #[test]
    fn regex_metacharacters_are_literal() {
        let pattern = GlobPattern::new("api:v1.0:(list)+*").expect("valid glob");
        assert!(pattern.matches("api:v1.0:(list)+page=2"));
        assert!(!pattern.matches("api:v1x0:(list)+page=2"));
        assert!(!pattern.matches("api:v1.0:listtt"));
    }

    #[test]
    fn literal_prefix_stops_at_wildcard() {
        let pattern = GlobPattern::new("content:list:*").expect("valid glob");
        assert_eq!(pattern.literal_prefix(), "content:list:");

        let pattern = GlobPattern::new("exact:key").expect("valid glob");
        assert_eq!(pattern.literal_prefix(), "exact:key");
    }
}
