//! Per-backend rendering of the few constructs SQL dialects disagree on.

use super::plan::{CompiledQuery, SqlValue};

/// Dialect-specific fragments. Arguments are already-rendered SQL
/// expressions (column references or `@pN` placeholders).
pub trait Dialect: Send + Sync {
    fn name(&self) -> &'static str;

    /// Quotes an identifier.
    fn quote(&self, ident: &str) -> String {
        format!("\"{}\"", ident.replace('"', "\"\""))
    }

    /// True when `haystack` contains the text `needle`.
    fn contains_text(&self, haystack: &str, needle: &str) -> String;

    /// Regular expression match of `column` against `pattern`.
    fn regex(&self, column: &str, pattern: &str, case_insensitive: bool) -> String;

    /// LIKE match of `column` against `pattern` with `\` as escape.
    fn like(&self, column: &str, pattern: &str, case_insensitive: bool) -> String;

    /// Structural containment of the JSON `needle` in the JSON `column`.
    fn json_contains(&self, column: &str, needle: &str) -> String;

    /// One `ORDER BY` term. Missing values sort first ascending and last
    /// descending.
    fn order_term(&self, expr: &str, descending: bool) -> String;

    /// Trailing `LIMIT`/`OFFSET`, empty when neither is set.
    fn limit_offset(&self, limit: Option<&str>, offset: Option<&str>) -> String;

    /// Final rewrite of a compiled plan into the backend's placeholder
    /// convention.
    fn render(&self, compiled: CompiledQuery) -> CompiledQuery {
        compiled
    }
}

/// SQLite, with the `nymph_*` functions registered by the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn contains_text(&self, haystack: &str, needle: &str) -> String {
        format!("instr({haystack}, {needle}) > 0")
    }

    fn regex(&self, column: &str, pattern: &str, case_insensitive: bool) -> String {
        format!("nymph_regexp({pattern}, {column}, {})", case_insensitive as u8)
    }

    fn like(&self, column: &str, pattern: &str, case_insensitive: bool) -> String {
        format!("nymph_like({pattern}, {column}, {})", case_insensitive as u8)
    }

    fn json_contains(&self, column: &str, needle: &str) -> String {
        format!("nymph_contains({column}, {needle})")
    }

    // SQLite already sorts NULL lowest.
    fn order_term(&self, expr: &str, descending: bool) -> String {
        format!("{expr} {}", if descending { "DESC" } else { "ASC" })
    }

    fn limit_offset(&self, limit: Option<&str>, offset: Option<&str>) -> String {
        match (limit, offset) {
            (None, None) => String::new(),
            (Some(l), None) => format!(" LIMIT {l}"),
            (None, Some(o)) => format!(" LIMIT -1 OFFSET {o}"),
            (Some(l), Some(o)) => format!(" LIMIT {l} OFFSET {o}"),
        }
    }
}

/// PostgreSQL text rendering. Placeholders become `$1..$n`.
#[derive(Debug, Clone, Copy, Default)]
pub struct PostgresDialect;

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn contains_text(&self, haystack: &str, needle: &str) -> String {
        format!("strpos({haystack}, {needle}) > 0")
    }

    fn regex(&self, column: &str, pattern: &str, case_insensitive: bool) -> String {
        format!("{column} {} {pattern}", if case_insensitive { "~*" } else { "~" })
    }

    fn like(&self, column: &str, pattern: &str, case_insensitive: bool) -> String {
        let op = if case_insensitive { "ILIKE" } else { "LIKE" };
        format!("{column} {op} {pattern} ESCAPE '\\'")
    }

    fn json_contains(&self, column: &str, needle: &str) -> String {
        format!("{column}::jsonb @> {needle}::jsonb")
    }

    fn order_term(&self, expr: &str, descending: bool) -> String {
        if descending {
            format!("{expr} DESC NULLS LAST")
        } else {
            format!("{expr} ASC NULLS FIRST")
        }
    }

    fn limit_offset(&self, limit: Option<&str>, offset: Option<&str>) -> String {
        let mut out = String::new();
        if let Some(l) = limit {
            out.push_str(&format!(" LIMIT {l}"));
        }
        if let Some(o) = offset {
            out.push_str(&format!(" OFFSET {o}"));
        }
        out
    }

    fn render(&self, compiled: CompiledQuery) -> CompiledQuery {
        let (text, params) = number_placeholders(&compiled.text, compiled.params);
        CompiledQuery {
            text,
            params,
            ..compiled
        }
    }
}

/// Rewrites `@pN` placeholders to `$1..$n` in order of first appearance and
/// reorders the parameter list to match. A name used twice keeps one number.
pub fn number_placeholders(
    text: &str,
    params: Vec<(String, SqlValue)>,
) -> (String, Vec<(String, SqlValue)>) {
    let mut out = String::with_capacity(text.len());
    let mut order: Vec<String> = Vec::new();
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        let is_placeholder = c == '@' && text[i + 1..].starts_with('p') && text[i + 2..]
            .chars()
            .next()
            .is_some_and(|d| d.is_ascii_digit());
        if !is_placeholder {
            out.push(c);
            continue;
        }
        let mut name = String::new();
        while let Some(&(_, d)) = chars.peek() {
            if (d == 'p' && name.is_empty()) || (d.is_ascii_digit() && !name.is_empty()) {
                name.push(d);
                chars.next();
            } else {
                break;
            }
        }
        let position = match order.iter().position(|n| *n == name) {
            Some(p) => p,
            None => {
                order.push(name);
                order.len() - 1
            }
        };
        out.push_str(&format!("${}", position + 1));
    }

    let mut by_name: Vec<Option<(String, SqlValue)>> = params.into_iter().map(Some).collect();
    let ordered = order
        .iter()
        .filter_map(|name| {
            by_name
                .iter_mut()
                .find(|slot| slot.as_ref().is_some_and(|(n, _)| n == name))
                .and_then(Option::take)
        })
        .collect();
    (out, ordered)
}
