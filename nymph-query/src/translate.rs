//! Rewrites `qref` clauses into plain `ref` clauses.
//!
//! A `qref` asks whether a reference property points at any entity matched by
//! a nested query. Once that nested result is known, the clause is the same
//! as an OR of `ref` clauses over the result's GUIDs, which the in-memory
//! matcher can evaluate. The caller decides where the nested result comes
//! from (a live subscription's cached result, or running the query).

use nymph_model::{Clause, Guid, Predicate, Query, Selector, SelectorType};

/// Replaces every `qref` clause, including those in nested selectors.
///
/// `resolve` is called once per `qref` clause with its nested query and
/// returns the GUIDs it matches. A negated `!qref` becomes a negated group,
/// so the translated selector keeps the original semantics.
pub fn translate_qrefs<E, F>(selectors: &[Selector], resolve: &mut F) -> Result<Vec<Selector>, E>
where
    F: FnMut(&Query) -> Result<Vec<Guid>, E>,
{
    selectors
        .iter()
        .map(|selector| translate_selector(selector, resolve))
        .collect()
}

fn translate_selector<E, F>(selector: &Selector, resolve: &mut F) -> Result<Selector, E>
where
    F: FnMut(&Query) -> Result<Vec<Guid>, E>,
{
    let mut clauses = Vec::with_capacity(selector.clauses.len());
    for clause in &selector.clauses {
        let predicate = match &clause.predicate {
            Predicate::QRef(name, query) => {
                let guids = resolve(query)?;
                Predicate::Selector(refs_to_any(name, guids))
            }
            Predicate::Selector(nested) => Predicate::Selector(translate_selector(nested, resolve)?),
            other => other.clone(),
        };
        clauses.push(Clause {
            negated: clause.negated,
            predicate,
        });
    }
    Ok(Selector {
        kind: selector.kind,
        clauses,
    })
}

/// `{type: '|', ref: [[name, g1], [name, g2], ...]}`. With no GUIDs this is
/// an empty OR, which never passes.
fn refs_to_any(name: &str, guids: Vec<Guid>) -> Selector {
    Selector {
        kind: SelectorType::Or,
        clauses: guids
            .into_iter()
            .map(|guid| Clause::new(Predicate::Ref(name.to_string(), guid)))
            .collect(),
    }
}
