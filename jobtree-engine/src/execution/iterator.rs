// Template Iterators
// Expands executeTemplate iterator expressions into iteration tokens

use crate::error::{EngineError, EngineResult};

use regex::Regex;
use std::sync::LazyLock;

static ALPHA_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z]+)\.\.([a-z]+)$").expect("constant regex pattern is valid")
});

static NUMERIC_RANGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\.\.(\d+)$").expect("constant regex pattern is valid"));

static LIST_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9\-.*]+$").expect("constant regex pattern is valid"));

/// Longest alphabetic bound accepted; keeps arithmetic inside u64
const MAX_ALPHA_LEN: usize = 12;

/// Largest number of tokens an alphabetic range may expand to
pub const MAX_RANGE_TOKENS: u64 = 100_000;

/// Parsed iterator expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IteratorSpec {
    /// Inclusive alphabetic range such as `aa..zz`
    AlphaRange { from: String, to: String },
    /// Explicit whitespace-separated tokens
    List(Vec<String>),
}

impl IteratorSpec {
    pub fn parse(expression: &str) -> EngineResult<Self> {
        let trimmed = expression.trim();

        if let Some(caps) = ALPHA_RANGE.captures(trimmed) {
            let (from, to) = (&caps[1], &caps[2]);
            if from.len() != to.len() {
                return Err(EngineError::unsupported_iterator(
                    expression,
                    "range bounds must have the same length",
                ));
            }
            if from.len() > MAX_ALPHA_LEN {
                return Err(EngineError::unsupported_iterator(expression, "range bounds are too long"));
            }
            if from >= to {
                return Err(EngineError::unsupported_iterator(
                    expression,
                    "lower bound must be strictly less than upper bound",
                ));
            }
            let span = match (from_base26(from), from_base26(to)) {
                (Some(lo), Some(hi)) => hi - lo + 1,
                _ => return Err(EngineError::unsupported_iterator(expression, "invalid range bounds")),
            };
            if span > MAX_RANGE_TOKENS {
                return Err(EngineError::unsupported_iterator(
                    expression,
                    format!("range expands to {} tokens, limit is {}", span, MAX_RANGE_TOKENS),
                ));
            }
            return Ok(IteratorSpec::AlphaRange {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        if NUMERIC_RANGE.is_match(trimmed) {
            return Err(EngineError::unsupported_iterator(
                expression,
                "numeric ranges are not implemented",
            ));
        }

        let tokens: Vec<String> = trimmed.split_whitespace().map(String::from).collect();
        if tokens.is_empty() {
            return Err(EngineError::unsupported_iterator(expression, "iterator is empty"));
        }
        if let Some(bad) = tokens.iter().find(|t| !LIST_TOKEN.is_match(t)) {
            return Err(EngineError::unsupported_iterator(
                expression,
                format!("token '{}' may only contain letters, digits, '-', '.' and '*'", bad),
            ));
        }
        Ok(IteratorSpec::List(tokens))
    }

    /// Iteration tokens in order
    pub fn tokens(&self) -> Vec<String> {
        match self {
            IteratorSpec::AlphaRange { from, to } => {
                match (from_base26(from), from_base26(to)) {
                    (Some(lo), Some(hi)) => (lo..=hi).map(to_base26).collect(),
                    _ => Vec::new(),
                }
            }
            IteratorSpec::List(tokens) => tokens.clone(),
        }
    }
}

/// Bijective base-26 value of a lowercase string: `a` = 0, `z` = 25, `aa` = 26
pub fn from_base26(text: &str) -> Option<u64> {
    if text.is_empty() {
        return None;
    }
    let mut n: u64 = 0;
    for c in text.chars() {
        if !c.is_ascii_lowercase() {
            return None;
        }
        let digit = (c as u64) - ('a' as u64) + 1;
        n = n.checked_mul(26)?.checked_add(digit)?;
    }
    Some(n - 1)
}

/// Inverse of [`from_base26`]
pub fn to_base26(value: u64) -> String {
    let mut n = value as u128 + 1;
    let mut digits = Vec::new();
    while n > 0 {
        n -= 1;
        digits.push((b'a' + (n % 26) as u8) as char);
        n /= 26;
    }
    digits.iter().rev().collect()
}
