use nymph_model::ReturnKind;
use serde_json::Value;

/// A bound parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Real(f64),
    Integer(i64),
}

impl SqlValue {
    /// JSON view, used by the CLI's `explain` output.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Real(f) => serde_json::Number::from_f64(*f)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            Self::Integer(i) => Value::from(*i),
        }
    }
}

/// Output of [`Compiler::compile`](super::Compiler::compile).
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    /// Plan text in the dialect's placeholder convention.
    pub text: String,
    /// Parameters by name (without the `@`), in binding order for
    /// positional dialects.
    pub params: Vec<(String, SqlValue)>,
    /// Every etype whose tables the plan reads, the queried one first.
    pub etypes: Vec<String>,
    pub return_kind: ReturnKind,
}

/// The four tables kept per etype.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableKind {
    /// `guid`, `tags`, `cdate`, `mdate`
    Entities,
    /// `guid`, `name`, `value`, `truthy`, `string`, `number`
    Data,
    /// `guid`, `name`, `reference`
    References,
    /// `guid`, `unique`
    Uniques,
}

impl TableKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Entities => "entities",
            Self::Data => "data",
            Self::References => "references",
            Self::Uniques => "uniques",
        }
    }
}

/// `{prefix}{kind}_{etype}`, e.g. `nymph_data_Employee`.
pub fn table_name(prefix: &str, kind: TableKind, etype: &str) -> String {
    format!("{prefix}{}_{etype}", kind.as_str())
}
