//! Operations behind the `nymph-cli` binary.

use anyhow::{anyhow, bail, Context, Result};
use nymph_model::{ClassRegistry, Query, ReturnKind};
use nymph_query::{Compiler, Dialect, PostgresDialect, SqliteDialect};
use nymph_store::{Nymph, QueryOutput, SqliteConfig, SqliteDriver};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum DialectName {
    Sqlite,
    Postgres,
}

impl DialectName {
    fn dialect(self) -> &'static dyn Dialect {
        match self {
            Self::Sqlite => &SqliteDialect,
            Self::Postgres => &PostgresDialect,
        }
    }
}

/// Parses a `CLASS=ETYPE` argument.
pub fn parse_class_mapping(arg: &str) -> Result<(String, String)> {
    let (class, etype) = arg
        .split_once('=')
        .ok_or_else(|| anyhow!("expected CLASS=ETYPE, got `{arg}`"))?;
    if class.is_empty() || etype.is_empty() {
        bail!("expected CLASS=ETYPE, got `{arg}`");
    }
    Ok((class.to_string(), etype.to_string()))
}

/// Class table for a query: the explicit mappings, plus every class the
/// query names (including inside `qref` clauses) mapped to an etype of the
/// same name.
pub fn registry_for(query: &Query, mappings: &[(String, String)]) -> Result<ClassRegistry> {
    let mut classes = ClassRegistry::new();
    for (class, etype) in mappings {
        classes
            .register(class, etype)
            .with_context(|| format!("invalid class mapping {class}={etype}"))?;
    }
    let mut named = Vec::new();
    collect_classes(query, &mut named);
    for class in named {
        if classes.get(&class).is_none() {
            classes
                .register(class.clone(), class.clone())
                .with_context(|| format!("class `{class}` needs an explicit --class mapping"))?;
        }
    }
    Ok(classes)
}

fn collect_classes(query: &Query, out: &mut Vec<String>) {
    out.push(query.options.class.clone());
    for (_, child) in query.qrefs() {
        collect_classes(child, out);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Param {
    pub name: String,
    pub value: Value,
}

/// A compiled plan, as printed by `explain`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Explain {
    pub dialect: &'static str,
    pub text: String,
    pub params: Vec<Param>,
    pub etypes: Vec<String>,
    pub returns: ReturnKind,
}

pub fn explain(
    text: &str,
    dialect: DialectName,
    prefix: &str,
    mappings: &[(String, String)],
) -> Result<Explain> {
    let query = Query::parse(text).context("invalid query")?;
    let classes = registry_for(&query, mappings)?;
    let dialect = dialect.dialect();
    let plan = Compiler::new(dialect, &classes, prefix)
        .compile(&query)
        .context("failed to compile query")?;
    Ok(Explain {
        dialect: dialect.name(),
        text: plan.text,
        params: plan
            .params
            .iter()
            .map(|(name, value)| Param {
                name: name.clone(),
                value: value.to_json(),
            })
            .collect(),
        etypes: plan.etypes,
        returns: plan.return_kind,
    })
}

/// Runs a query against a SQLite file and returns the result as JSON:
/// an array of entities or guids, or a number for counts.
pub async fn run_query(
    db: &str,
    text: &str,
    prefix: &str,
    mappings: &[(String, String)],
) -> Result<Value> {
    let query = Query::parse(text).context("invalid query")?;
    let classes = registry_for(&query, mappings)?;
    let driver = SqliteDriver::connect(SqliteConfig::new(db).with_prefix(prefix))
        .with_context(|| format!("failed to open {db}"))?;
    let nymph = Nymph::new(Arc::new(driver), classes);
    let output = nymph.get_entities(&query).await.context("query failed")?;
    debug!(results = output.len(), "query finished");
    Ok(match output {
        QueryOutput::Entities(entities) => serde_json::to_value(entities)?,
        QueryOutput::Guids(guids) => serde_json::to_value(guids)?,
        QueryOutput::Count(count) => json!(count),
    })
}
