//! Value predicates shared by the in-memory matcher and the SQL backends.
//!
//! The SQLite driver registers these same functions as SQL functions, so a
//! clause evaluated in memory and the same clause evaluated by the database
//! cannot disagree.

use nymph_model::canonical_json;
use regex_lite::{Regex, RegexBuilder};
use serde_json::Value;

use crate::{QueryError, QueryResult};

/// JavaScript truthiness: `null`, `false`, `0` and `""` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

/// Equality used by `equal`: numbers and strings natively, everything else
/// by canonical JSON text.
pub fn json_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::String(x), Value::String(y)) => x == y,
        (Value::Number(_), _) | (_, Value::Number(_)) => false,
        (Value::String(_), _) | (_, Value::String(_)) => false,
        _ => canonical_json(a) == canonical_json(b),
    }
}

/// Containment used by `contain`.
///
/// An array contains an equal element; a string contains a substring; an
/// object contains every key/value of an object needle. Anything else falls
/// back to equality.
pub fn json_contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Array(items), _) => items.iter().any(|item| json_equal(item, needle)),
        (Value::String(h), Value::String(n)) => h.contains(n.as_str()),
        (Value::Object(h), Value::Object(n)) => n
            .iter()
            .all(|(k, v)| h.get(k).is_some_and(|hv| json_equal(hv, v))),
        _ => json_equal(haystack, needle),
    }
}

/// Compiles a `match`/`imatch` pattern.
pub fn compile_regex(pattern: &str, case_insensitive: bool) -> QueryResult<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(case_insensitive)
        .build()
        .map_err(|e| QueryError::InvalidParameters(format!("invalid pattern `{pattern}`: {e}")))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LikeToken {
    Many,
    One,
    Lit(char),
}

fn like_tokens(pattern: &str, case_insensitive: bool) -> Vec<LikeToken> {
    let mut tokens = Vec::with_capacity(pattern.len());
    let mut chars = pattern.chars();
    let push_lit = |tokens: &mut Vec<LikeToken>, c: char| {
        if case_insensitive {
            tokens.extend(c.to_lowercase().map(LikeToken::Lit));
        } else {
            tokens.push(LikeToken::Lit(c));
        }
    };
    while let Some(c) = chars.next() {
        match c {
            '%' => tokens.push(LikeToken::Many),
            '_' => tokens.push(LikeToken::One),
            '\\' => push_lit(&mut tokens, chars.next().unwrap_or('\\')),
            other => push_lit(&mut tokens, other),
        }
    }
    tokens
}

/// SQL `LIKE` semantics: `%` matches any run, `_` one character, `\`
/// escapes the next character. The whole string has to match.
pub fn like_match(pattern: &str, text: &str, case_insensitive: bool) -> bool {
    let tokens = like_tokens(pattern, case_insensitive);
    let chars: Vec<char> = if case_insensitive {
        text.chars().flat_map(char::to_lowercase).collect()
    } else {
        text.chars().collect()
    };

    let (mut p, mut t) = (0usize, 0usize);
    let mut backtrack: Option<(usize, usize)> = None;
    while t < chars.len() {
        match tokens.get(p) {
            Some(LikeToken::Many) => {
                backtrack = Some((p, t));
                p += 1;
                continue;
            }
            Some(LikeToken::One) => {
                p += 1;
                t += 1;
                continue;
            }
            Some(LikeToken::Lit(c)) if *c == chars[t] => {
                p += 1;
                t += 1;
                continue;
            }
            _ => {}
        }
        match backtrack {
            Some((star, from)) => {
                p = star + 1;
                t = from + 1;
                backtrack = Some((star, from + 1));
            }
            None => return false,
        }
    }
    tokens[p..].iter().all(|tok| *tok == LikeToken::Many)
}

/// Typed sort columns of a property value: `(number, string)`.
pub fn sort_columns(value: Option<&Value>) -> (Option<f64>, Option<&str>) {
    match value {
        Some(Value::Number(n)) => (n.as_f64(), None),
        Some(Value::String(s)) => (None, Some(s.as_str())),
        _ => (None, None),
    }
}
