//! Query options and the `[Options, ...Selector]` wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::selector::Selector;
use crate::Error;

/// What a query returns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnKind {
    #[default]
    Entity,
    Guid,
    Count,
}

/// What a query is ordered by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SortBy {
    #[default]
    Cdate,
    Mdate,
    Property(String),
}

impl From<String> for SortBy {
    fn from(s: String) -> Self {
        match s.as_str() {
            "cdate" => Self::Cdate,
            "mdate" => Self::Mdate,
            _ => Self::Property(s),
        }
    }
}

impl From<SortBy> for String {
    fn from(sort: SortBy) -> Self {
        match sort {
            SortBy::Cdate => "cdate".into(),
            SortBy::Mdate => "mdate".into(),
            SortBy::Property(name) => name,
        }
    }
}

/// Query options: the first element of a wire query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Options {
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
    #[serde(default)]
    pub sort: SortBy,
    #[serde(default)]
    pub reverse: bool,
    #[serde(default, rename = "return")]
    pub return_kind: ReturnKind,
}

impl Options {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            ..Default::default()
        }
    }

    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn sort(mut self, sort: impl Into<String>) -> Self {
        self.sort = SortBy::from(sort.into());
        self
    }

    pub fn reverse(mut self, reverse: bool) -> Self {
        self.reverse = reverse;
        self
    }

    pub fn returning(mut self, kind: ReturnKind) -> Self {
        self.return_kind = kind;
        self
    }

    /// True when limit or offset restrict the result window.
    pub fn is_paged(&self) -> bool {
        self.limit.is_some() || self.offset.is_some()
    }
}

/// A full query: options plus the selectors that must all pass.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub options: Options,
    pub selectors: Vec<Selector>,
}

impl Query {
    pub fn new(options: Options) -> Self {
        Self {
            options,
            selectors: Vec::new(),
        }
    }

    /// Builder: appends a selector.
    pub fn select(mut self, selector: Selector) -> Self {
        self.selectors.push(selector);
        self
    }

    /// Returns a copy with a different return kind.
    pub fn returning(&self, kind: ReturnKind) -> Self {
        let mut query = self.clone();
        query.options.return_kind = kind;
        query
    }

    /// Canonical wire form.
    pub fn to_value(&self) -> Value {
        let mut items = Vec::with_capacity(self.selectors.len() + 1);
        items.push(serde_json::to_value(&self.options).unwrap_or(Value::Null));
        items.extend(self.selectors.iter().map(Selector::to_value));
        Value::Array(items)
    }

    pub fn from_value(value: &Value) -> Result<Self, Error> {
        let items = value
            .as_array()
            .ok_or_else(|| Error::InvalidParameters("query must be [options, ...selectors]".into()))?;
        let (first, rest) = items
            .split_first()
            .ok_or_else(|| Error::InvalidParameters("query is missing options".into()))?;
        let options: Options = serde_json::from_value(first.clone())
            .map_err(|e| Error::InvalidParameters(format!("invalid options: {e}")))?;
        if options.class.is_empty() {
            return Err(Error::InvalidParameters("options.class is required".into()));
        }
        let selectors = rest
            .iter()
            .map(Selector::from_value)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { options, selectors })
    }

    /// Parses a JSON string in wire format.
    pub fn parse(text: &str) -> Result<Self, Error> {
        let value: Value = serde_json::from_str(text)?;
        Self::from_value(&value)
    }

    /// Stable serialisation: logically equal queries produce identical keys.
    pub fn key(&self) -> String {
        crate::canonical_json(&self.to_value())
    }

    /// Every `qref` sub-query in the selectors, including nested groups.
    pub fn qrefs(&self) -> Vec<(&str, &Query)> {
        self.selectors.iter().flat_map(Selector::qrefs).collect()
    }
}

impl Serialize for Query {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Query {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(&value).map_err(serde::de::Error::custom)
    }
}
