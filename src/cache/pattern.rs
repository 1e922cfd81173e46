//! Key patterns and placeholder templates.
//!
//! Patterns use the glob dialect of TTL key-value stores: `*` matches any run
//! of characters, `?` a single character, `[...]` a character class.
//! Templates carry `{placeholder}` segments bound from event context.

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PatternError {
    #[error("invalid key pattern `{pattern}`: {reason}")]
    Invalid { pattern: String, reason: String },
}

/// A compiled glob key pattern.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    raw: String,
    regex: Regex,
}

impl KeyPattern {
    pub fn compile(pattern: &str) -> Result<Self, PatternError> {
        let mut expr = String::with_capacity(pattern.len() * 2 + 2);
        expr.push('^');

        let mut chars = pattern.chars().peekable();
        while let Some(ch) = chars.next() {
            match ch {
                '*' => expr.push_str(".*"),
                '?' => expr.push('.'),
                '[' => {
                    let mut class = String::new();
                    let mut closed = false;
                    for inner in chars.by_ref() {
                        if inner == ']' {
                            closed = true;
                            break;
                        }
                        class.push(inner);
                    }
                    if !closed || class.is_empty() {
                        return Err(PatternError::Invalid {
                            pattern: pattern.to_string(),
                            reason: "unterminated or empty character class".to_string(),
                        });
                    }
                    let (negated, body) = match class.strip_prefix('^') {
                        Some(rest) => (true, rest),
                        None => (false, class.as_str()),
                    };
                    expr.push('[');
                    if negated {
                        expr.push('^');
                    }
                    for c in body.chars() {
                        if matches!(c, '\\' | '[' | ']' | '^') {
                            expr.push('\\');
                        }
                        expr.push(c);
                    }
                    expr.push(']');
                }
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        expr.push_str(&regex::escape(&escaped.to_string()));
                    }
                }
                other => expr.push_str(&regex::escape(&other.to_string())),
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|err| PatternError::Invalid {
            pattern: pattern.to_string(),
            reason: err.to_string(),
        })?;

        Ok(Self {
            raw: pattern.to_string(),
            regex,
        })
    }

    pub fn is_match(&self, key: &str) -> bool {
        self.regex.is_match(key)
    }

    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// True when the pattern contains glob metacharacters.
pub fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

/// A template rendered against an event context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rendered {
    pub value: String,
    /// Placeholders that had no binding and were left in place.
    pub unresolved: Vec<String>,
}

/// Substitute `{name}` placeholders from `context`.
///
/// Unbound placeholders are left literally in the output and reported.
pub fn render_template(template: &str, context: &HashMap<String, String>) -> Rendered {
    let mut value = String::with_capacity(template.len());
    let mut unresolved = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        value.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('}') {
            Some(close) => {
                let name = &after[..close];
                match context.get(name) {
                    Some(bound) => value.push_str(bound),
                    None => {
                        value.push('{');
                        value.push_str(name);
                        value.push('}');
                        unresolved.push(name.to_string());
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                value.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    value.push_str(rest);

    Rendered { value, unresolved }
}
