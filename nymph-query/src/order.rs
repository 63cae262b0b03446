//! In-memory ordering, identical to the `ORDER BY` the compiler emits.
//!
//! The sort key is the timestamp for `cdate`/`mdate`, otherwise the
//! property's `(number, string)` columns. Missing values sort first
//! ascending and last descending. GUID ascending breaks ties either way.

use nymph_model::{Entity, SortBy};
use std::cmp::Ordering;

use crate::functions::sort_columns;

fn cmp_f64(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

/// Compares two entities for the given sort.
pub fn compare(a: &Entity, b: &Entity, sort: &SortBy, reverse: bool) -> Ordering {
    let primary = match sort {
        SortBy::Cdate => cmp_f64(a.cdate(), b.cdate()),
        SortBy::Mdate => cmp_f64(a.mdate(), b.mdate()),
        SortBy::Property(name) => {
            let (an, as_) = sort_columns(a.get(name));
            let (bn, bs) = sort_columns(b.get(name));
            cmp_f64(an, bn).then_with(|| as_.cmp(&bs))
        }
    };
    let primary = if reverse { primary.reverse() } else { primary };
    primary.then_with(|| a.guid().cmp(&b.guid()))
}

/// Sorts entities in place.
pub fn sort_entities(entities: &mut [Entity], sort: &SortBy, reverse: bool) {
    entities.sort_by(|a, b| compare(a, b, sort, reverse));
}
