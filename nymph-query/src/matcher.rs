//! In-memory selector evaluation.
//!
//! Evaluates selectors against an entity's tags and data without touching
//! storage. `qref` clauses need the result of a nested query and are
//! rejected; translate them with [`crate::translate_qrefs`] first.

use nymph_model::{collect_references, validate_tag, Entity, Predicate, Selector};

use crate::functions::{compile_regex, is_truthy, json_contains, json_equal, like_match};
use crate::{QueryError, QueryResult};

/// True when the entity passes every selector.
pub fn matches(entity: &Entity, selectors: &[Selector]) -> QueryResult<bool> {
    if selectors.iter().any(|s| !s.qrefs().is_empty()) {
        return Err(QueryError::QrefRequiresTranslation);
    }
    for selector in selectors {
        if !matches_selector(entity, selector)? {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Evaluates one selector. AND-type selectors need every clause to pass,
/// OR-type ones at least one; each clause result is inverted when exactly
/// one of the selector type and the clause name is negated.
pub fn matches_selector(entity: &Entity, selector: &Selector) -> QueryResult<bool> {
    let is_or = selector.kind.is_or();
    for clause in &selector.clauses {
        let invert = selector.kind.is_not() ^ clause.negated;
        let pass = check(entity, &clause.predicate)? ^ invert;
        if is_or && pass {
            return Ok(true);
        }
        if !is_or && !pass {
            return Ok(false);
        }
    }
    Ok(!is_or)
}

/// `cdate`/`mdate` address the entity's own timestamps.
fn timestamp(entity: &Entity, name: &str) -> Option<Option<f64>> {
    match name {
        "cdate" => Some(entity.cdate()),
        "mdate" => Some(entity.mdate()),
        _ => None,
    }
}

fn numeric(entity: &Entity, name: &str) -> Option<f64> {
    match timestamp(entity, name) {
        Some(ts) => ts,
        None => entity.get(name).filter(|v| v.is_number()).and_then(|v| v.as_f64()),
    }
}

fn check(entity: &Entity, predicate: &Predicate) -> QueryResult<bool> {
    Ok(match predicate {
        Predicate::Guid(guid) => entity.guid() == Some(*guid),
        Predicate::Tag(tag) => {
            validate_tag(tag)?;
            entity.has_tag(tag)
        }
        Predicate::Defined(name) => match timestamp(entity, name) {
            Some(ts) => ts.is_some(),
            None => entity.has(name),
        },
        Predicate::Truthy(name) => match timestamp(entity, name) {
            Some(ts) => ts.is_some_and(|t| t != 0.0),
            None => entity.get(name).is_some_and(is_truthy),
        },
        Predicate::Equal(name, value) => match timestamp(entity, name) {
            Some(ts) => matches!((ts, value.as_f64()), (Some(a), Some(b)) if value.is_number() && a == b),
            None => entity.get(name).is_some_and(|v| json_equal(v, value)),
        },
        Predicate::Contain(name, value) => {
            entity.get(name).is_some_and(|v| json_contains(v, value))
        }
        Predicate::Match(name, pattern) | Predicate::IMatch(name, pattern) => {
            let ci = matches!(predicate, Predicate::IMatch(..));
            let regex = compile_regex(pattern, ci)?;
            entity.get_str(name).is_some_and(|s| regex.is_match(s))
        }
        Predicate::Like(name, pattern) => {
            entity.get_str(name).is_some_and(|s| like_match(pattern, s, false))
        }
        Predicate::ILike(name, pattern) => {
            entity.get_str(name).is_some_and(|s| like_match(pattern, s, true))
        }
        Predicate::Gt(name, n) => numeric(entity, name).is_some_and(|v| v > *n),
        Predicate::Gte(name, n) => numeric(entity, name).is_some_and(|v| v >= *n),
        Predicate::Lt(name, n) => numeric(entity, name).is_some_and(|v| v < *n),
        Predicate::Lte(name, n) => numeric(entity, name).is_some_and(|v| v <= *n),
        Predicate::Ref(name, guid) => entity
            .get(name)
            .is_some_and(|v| collect_references(v).contains(guid)),
        Predicate::QRef(..) => return Err(QueryError::QrefRequiresTranslation),
        Predicate::Selector(nested) => matches_selector(entity, nested)?,
    })
}
