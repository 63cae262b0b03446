//! The selector algebra.
//!
//! On the wire a selector is an object with a `type` combinator and named
//! clause arrays (`{"type": "&", "equal": ["name", "Jane"], "!tag": "old"}`).
//! Each clause name takes either a single value or a list of values. Parsing
//! normalises that into a flat list of [`Clause`]s; serialising always emits
//! the list form, so a parsed-then-serialised selector is canonical.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::entity::validate_tag;
use crate::query::Query;
use crate::reference::Reference;
use crate::{Error, Guid};

/// How the clauses of one selector combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SelectorType {
    #[serde(rename = "&")]
    And,
    #[serde(rename = "|")]
    Or,
    #[serde(rename = "!&")]
    Nand,
    #[serde(rename = "!|")]
    Nor,
}

impl SelectorType {
    /// True when at least one clause has to pass (`|`, `!|`).
    pub fn is_or(self) -> bool {
        matches!(self, Self::Or | Self::Nor)
    }

    /// True when every clause result is inverted (`!&`, `!|`).
    pub fn is_not(self) -> bool {
        matches!(self, Self::Nand | Self::Nor)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::And => "&",
            Self::Or => "|",
            Self::Nand => "!&",
            Self::Nor => "!|",
        }
    }

    fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "&" => Ok(Self::And),
            "|" => Ok(Self::Or),
            "!&" => Ok(Self::Nand),
            "!|" => Ok(Self::Nor),
            other => Err(Error::InvalidParameters(format!("invalid selector type `{other}`"))),
        }
    }
}

/// What a single clause tests.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Guid(Guid),
    Tag(String),
    Defined(String),
    Truthy(String),
    Equal(String, Value),
    Contain(String, Value),
    Match(String, String),
    IMatch(String, String),
    Like(String, String),
    ILike(String, String),
    Gt(String, f64),
    Gte(String, f64),
    Lt(String, f64),
    Lte(String, f64),
    Ref(String, Guid),
    QRef(String, Box<Query>),
    Selector(Selector),
}

impl Predicate {
    /// Wire name of the clause, without negation.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Guid(_) => "guid",
            Self::Tag(_) => "tag",
            Self::Defined(_) => "defined",
            Self::Truthy(_) => "truthy",
            Self::Equal(..) => "equal",
            Self::Contain(..) => "contain",
            Self::Match(..) => "match",
            Self::IMatch(..) => "imatch",
            Self::Like(..) => "like",
            Self::ILike(..) => "ilike",
            Self::Gt(..) => "gt",
            Self::Gte(..) => "gte",
            Self::Lt(..) => "lt",
            Self::Lte(..) => "lte",
            Self::Ref(..) => "ref",
            Self::QRef(..) => "qref",
            Self::Selector(_) => "selector",
        }
    }

    fn to_value(&self) -> Value {
        match self {
            Self::Guid(guid) => Value::String(guid.to_hex()),
            Self::Tag(s) | Self::Defined(s) | Self::Truthy(s) => Value::String(s.clone()),
            Self::Equal(name, value) | Self::Contain(name, value) => {
                Value::Array(vec![Value::String(name.clone()), normalize_numbers(value)])
            }
            Self::Match(name, pattern)
            | Self::IMatch(name, pattern)
            | Self::Like(name, pattern)
            | Self::ILike(name, pattern) => Value::Array(vec![
                Value::String(name.clone()),
                Value::String(pattern.clone()),
            ]),
            Self::Gt(name, n) | Self::Gte(name, n) | Self::Lt(name, n) | Self::Lte(name, n) => {
                Value::Array(vec![Value::String(name.clone()), number_value(*n)])
            }
            Self::Ref(name, guid) => Value::Array(vec![
                Value::String(name.clone()),
                Value::String(guid.to_hex()),
            ]),
            Self::QRef(name, query) => {
                Value::Array(vec![Value::String(name.clone()), query.to_value()])
            }
            Self::Selector(selector) => selector.to_value(),
        }
    }
}

/// One clause of a selector; `negated` is the `!name` form.
#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub negated: bool,
    pub predicate: Predicate,
}

impl Clause {
    pub fn new(predicate: Predicate) -> Self {
        Self {
            negated: false,
            predicate,
        }
    }

    pub fn not(predicate: Predicate) -> Self {
        Self {
            negated: true,
            predicate,
        }
    }
}

/// A combinator with its clauses.
#[derive(Debug, Clone, PartialEq)]
pub struct Selector {
    pub kind: SelectorType,
    pub clauses: Vec<Clause>,
}

impl Selector {
    pub fn new(kind: SelectorType) -> Self {
        Self {
            kind,
            clauses: Vec::new(),
        }
    }

    pub fn and() -> Self {
        Self::new(SelectorType::And)
    }

    pub fn or() -> Self {
        Self::new(SelectorType::Or)
    }

    /// Builder: adds a clause.
    pub fn with(mut self, predicate: Predicate) -> Self {
        self.clauses.push(Clause::new(predicate));
        self
    }

    /// Builder: adds a negated clause.
    pub fn without(mut self, predicate: Predicate) -> Self {
        self.clauses.push(Clause::not(predicate));
        self
    }

    /// Iterates every `qref` clause, descending into nested selectors.
    pub fn qrefs(&self) -> Vec<(&str, &Query)> {
        let mut out = Vec::new();
        self.collect_qrefs(&mut out);
        out
    }

    fn collect_qrefs<'a>(&'a self, out: &mut Vec<(&'a str, &'a Query)>) {
        for clause in &self.clauses {
            match &clause.predicate {
                Predicate::QRef(name, query) => out.push((name.as_str(), query.as_ref())),
                Predicate::Selector(nested) => nested.collect_qrefs(out),
                _ => {}
            }
        }
    }

    /// Canonical wire form.
    pub fn to_value(&self) -> Value {
        let mut grouped: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for clause in &self.clauses {
            let name = if clause.negated {
                format!("!{}", clause.predicate.name())
            } else {
                clause.predicate.name().to_string()
            };
            grouped.entry(name).or_default().push(clause.predicate.to_value());
        }
        let mut map = Map::new();
        map.insert("type".into(), Value::String(self.kind.as_str().into()));
        for (name, values) in grouped {
            map.insert(name, Value::Array(values));
        }
        Value::Object(map)
    }

    /// Parses the wire form, normalising single values into lists and
    /// reference values into GUIDs. `null` clause values are skipped.
    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let map = value
            .as_object()
            .ok_or_else(|| Error::InvalidParameters("selector must be an object".into()))?;
        let kind = match map.get("type") {
            Some(Value::String(s)) => SelectorType::parse(s)?,
            _ => return Err(Error::InvalidParameters("selector is missing `type`".into())),
        };
        let mut selector = Selector::new(kind);
        for (key, value) in map {
            if key == "type" || value.is_null() {
                continue;
            }
            let (negated, name) = match key.strip_prefix('!') {
                Some(rest) => (true, rest),
                None => (false, key.as_str()),
            };
            for predicate in parse_clause(name, value)? {
                selector.clauses.push(Clause { negated, predicate });
            }
        }
        Ok(selector)
    }
}

impl Serialize for Selector {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Selector {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}

fn parse_clause(name: &str, value: &Value) -> Result<Vec<Predicate>, Error> {
    match name {
        "guid" => strings(name, value)?
            .into_iter()
            .map(|s| Guid::parse(&s).map(Predicate::Guid))
            .collect(),
        "tag" => strings(name, value)?
            .into_iter()
            .map(|tag| validate_tag(&tag).map(|()| Predicate::Tag(tag)))
            .collect(),
        "defined" => Ok(strings(name, value)?.into_iter().map(Predicate::Defined).collect()),
        "truthy" => Ok(strings(name, value)?.into_iter().map(Predicate::Truthy).collect()),
        "selector" => match value {
            Value::Array(items) => items
                .iter()
                .map(|v| Selector::from_value(v).map(Predicate::Selector))
                .collect(),
            other => Ok(vec![Predicate::Selector(Selector::from_value(other)?)]),
        },
        _ => pairs(name, value)?
            .into_iter()
            .map(|(prop, arg)| parse_pair(name, prop, arg))
            .collect(),
    }
}

fn parse_pair(clause: &str, prop: String, arg: &Value) -> Result<Predicate, Error> {
    let pattern = |arg: &Value| {
        arg.as_str()
            .map(str::to_string)
            .ok_or_else(|| Error::InvalidParameters(format!("`{clause}` needs a string pattern")))
    };
    let number = |arg: &Value| {
        arg.as_f64()
            .ok_or_else(|| Error::InvalidParameters(format!("`{clause}` needs a number")))
    };
    Ok(match clause {
        "equal" => Predicate::Equal(prop, normalize_numbers(arg)),
        "contain" => Predicate::Contain(prop, normalize_numbers(arg)),
        "match" => Predicate::Match(prop, pattern(arg)?),
        "imatch" => Predicate::IMatch(prop, pattern(arg)?),
        "like" => Predicate::Like(prop, pattern(arg)?),
        "ilike" => Predicate::ILike(prop, pattern(arg)?),
        "gt" => Predicate::Gt(prop, number(arg)?),
        "gte" => Predicate::Gte(prop, number(arg)?),
        "lt" => Predicate::Lt(prop, number(arg)?),
        "lte" => Predicate::Lte(prop, number(arg)?),
        "ref" => Predicate::Ref(prop, ref_target(arg)?),
        "qref" => Predicate::QRef(prop, Box::new(Query::from_value(arg)?)),
        other => {
            return Err(Error::InvalidParameters(format!("unknown clause `{other}`")));
        }
    })
}

/// Accepts a GUID string, a reference tuple, or an entity object with a
/// `guid` field.
fn ref_target(arg: &Value) -> Result<Guid, Error> {
    if let Some(s) = arg.as_str() {
        return Guid::parse(s);
    }
    if let Some(reference) = Reference::from_value(arg) {
        return Ok(reference.guid);
    }
    if let Some(Value::String(s)) = arg.get("guid") {
        return Guid::parse(s);
    }
    Err(Error::InvalidParameters("`ref` needs a guid, reference or saved entity".into()))
}

fn strings(clause: &str, value: &Value) -> Result<Vec<String>, Error> {
    let bad = || Error::InvalidParameters(format!("`{clause}` takes a string or list of strings"));
    match value {
        Value::String(s) => Ok(vec![s.clone()]),
        Value::Array(items) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| v.as_str().map(str::to_string).ok_or_else(bad))
            .collect(),
        _ => Err(bad()),
    }
}

/// A pair clause is `[name, arg]` or a list of such pairs; the list form is
/// recognised by its first element being an array.
fn pairs<'a>(clause: &str, value: &'a Value) -> Result<Vec<(String, &'a Value)>, Error> {
    let bad = || Error::InvalidParameters(format!("`{clause}` takes [name, value] pairs"));
    let items = value.as_array().ok_or_else(bad)?;
    let single = |pair: &'a [Value]| -> Result<(String, &'a Value), Error> {
        match pair {
            [Value::String(name), arg] => Ok((name.clone(), arg)),
            _ => Err(bad()),
        }
    };
    match items.first() {
        Some(Value::Array(_)) => items
            .iter()
            .filter(|v| !v.is_null())
            .map(|v| v.as_array().ok_or_else(bad).and_then(|pair| single(pair.as_slice())))
            .collect(),
        _ => Ok(vec![single(items.as_slice())?]),
    }
}

/// Rewrites integral floats as integers, so `5.0` and `5` compare and key
/// the same.
fn normalize_numbers(value: &Value) -> Value {
    match value {
        Value::Number(n) if n.is_f64() => n.as_f64().map_or(Value::Null, number_value),
        Value::Array(items) => Value::Array(items.iter().map(normalize_numbers).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), normalize_numbers(v)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}
