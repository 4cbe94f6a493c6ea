//! Testcase matching.
//!
//! `matches` decides pass/fail for one expected string against one actual
//! output. The strategy set is closed; unknown names are a configuration
//! error, never a silent fallback.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::types::{Error, Result};

/// Comparison rule used to judge a testcase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MatchType {
    Exact,
    Contains,
    Regex,
    Prefix,
    Suffix,
}

impl MatchType {
    pub fn as_str(self) -> &'static str {
        match self {
            MatchType::Exact => "exact",
            MatchType::Contains => "contains",
            MatchType::Regex => "regex",
            MatchType::Prefix => "prefix",
            MatchType::Suffix => "suffix",
        }
    }
}

impl FromStr for MatchType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "exact" | "equals" => Ok(MatchType::Exact),
            "contains" => Ok(MatchType::Contains),
            "regex" => Ok(MatchType::Regex),
            "prefix" => Ok(MatchType::Prefix),
            "suffix" => Ok(MatchType::Suffix),
            other => Err(Error::configuration(format!(
                "unknown match type '{}', expected one of: exact, contains, regex, prefix, suffix",
                other
            ))),
        }
    }
}

impl TryFrom<String> for MatchType {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MatchType> for String {
    fn from(value: MatchType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Judge `actual` against `expected` under `match_type`.
///
/// Fails only when `expected` is not a valid pattern for `Regex`.
pub fn matches(actual: &str, expected: &str, match_type: MatchType) -> Result<bool> {
    let ok = match match_type {
        MatchType::Exact => actual == expected,
        MatchType::Contains => actual.contains(expected),
        MatchType::Prefix => actual.starts_with(expected),
        MatchType::Suffix => actual.ends_with(expected),
        MatchType::Regex => Regex::new(expected)
            .map_err(|e| Error::configuration(format!("invalid pattern '{}': {}", expected, e)))?
            .is_match(actual),
    };
    Ok(ok)
}

/// Same as [`matches`] with the strategy given by name.
pub fn matches_named(actual: &str, expected: &str, match_type: &str) -> Result<bool> {
    matches(actual, expected, match_type.parse()?)
}

/// Strip the trailing line break(s) a command prints after its last line.
///
/// Testcase runners compare against this form so `echo hello` matches an
/// exact expectation of `hello`.
pub fn normalize_output(raw: &str) -> &str {
    raw.trim_end_matches(['\n', '\r'])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_documented_examples() {
        assert!(matches("same", "same", MatchType::Exact).unwrap());
        assert!(matches("abcXYZ", "XYZ", MatchType::Contains).unwrap());
        assert!(matches("2024-01-01", r"^\d{4}-\d{2}-\d{2}$", MatchType::Regex).unwrap());
    }

    #[test]
    fn test_negative_cases() {
        assert!(!matches("abc", "abcd", MatchType::Exact).unwrap());
        assert!(!matches("abc", "x", MatchType::Contains).unwrap());
        assert!(!matches("2024-1-01", r"^\d{4}-\d{2}-\d{2}$", MatchType::Regex).unwrap());
        assert!(!matches("Python 3.12", "3.12 ", MatchType::Suffix).unwrap());
        assert!(matches("Python 3.12", "Python 3.", MatchType::Prefix).unwrap());
    }

    #[test]
    fn test_invalid_regex_is_configuration_error() {
        let err = matches("anything", "(unclosed", MatchType::Regex).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn test_unknown_strategy_is_configuration_error() {
        let err = matches_named("a", "a", "fuzzy").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("fuzzy"));
    }

    #[test]
    fn test_equals_alias_and_case() {
        assert_eq!("equals".parse::<MatchType>().unwrap(), MatchType::Exact);
        assert_eq!("Contains".parse::<MatchType>().unwrap(), MatchType::Contains);
        assert_eq!(
            serde_json::to_string(&MatchType::Regex).unwrap(),
            "\"regex\""
        );
    }

    #[test]
    fn test_normalize_output() {
        assert_eq!(normalize_output("hello\n"), "hello");
        assert_eq!(normalize_output("hello\r\n\n"), "hello");
        assert_eq!(normalize_output("  hello  "), "  hello  ");
    }

    proptest! {
        #[test]
        fn exact_is_reflexive(s in ".*") {
            prop_assert!(matches(&s, &s, MatchType::Exact).unwrap());
        }

        #[test]
        fn contains_finds_any_infix(a in ".*", b in ".*", c in ".*") {
            let actual = format!("{a}{b}{c}");
            prop_assert!(matches(&actual, &b, MatchType::Contains).unwrap());
        }

        #[test]
        fn escaped_literal_regex_matches_itself(s in "[ -~]{0,32}") {
            let pattern = format!("^{}$", regex::escape(&s));
            prop_assert!(matches(&s, &pattern, MatchType::Regex).unwrap());
        }
    }
}
