//! Query compiler: [`Query`] to parameterised SQL.
//!
//! Every etype has four tables (see [`TableKind`]). Clauses compile to
//! column comparisons on the entities table, a substring test on the
//! `,tag,`-delimited tags column, or a correlated `EXISTS` against the data
//! or references table. The data table carries typed columns (`truthy`,
//! `string`, `number` and canonical JSON `value`) so one property name can be
//! compared numerically, textually or structurally.
//!
//! The GUID set is always selected, ordered and paged in an inner query.
//! Entity rows and their property rows are joined on afterwards, so a
//! `LIMIT` never cuts through the one-to-many property join.

mod dialect;
mod plan;

pub use dialect::{number_placeholders, Dialect, PostgresDialect, SqliteDialect};
pub use plan::{table_name, CompiledQuery, SqlValue, TableKind};

use nymph_model::{
    canonical_json, validate_tag, ClassRegistry, Predicate, Query, ReturnKind, Selector, SortBy,
};
use serde_json::Value;
use tracing::debug;

use crate::functions::compile_regex;
use crate::QueryResult;

/// Compiles queries for one dialect and table prefix.
pub struct Compiler<'a> {
    dialect: &'a dyn Dialect,
    classes: &'a ClassRegistry,
    prefix: &'a str,
}

/// Mutable state for one compilation: counters and collected parameters.
#[derive(Default)]
struct Builder {
    params: Vec<(String, SqlValue)>,
    aliases: usize,
    etypes: Vec<String>,
}

impl Builder {
    fn param(&mut self, value: SqlValue) -> String {
        let name = format!("p{}", self.params.len() + 1);
        self.params.push((name.clone(), value));
        format!("@{name}")
    }

    fn text(&mut self, value: impl Into<String>) -> String {
        self.param(SqlValue::Text(value.into()))
    }

    fn alias(&mut self, stem: &str) -> String {
        self.aliases += 1;
        format!("{stem}{}", self.aliases)
    }

    fn depend_on(&mut self, etype: &str) {
        if !self.etypes.iter().any(|e| e == etype) {
            self.etypes.push(etype.to_string());
        }
    }
}

/// Sort expressions of an inner GUID query.
struct Ordering {
    join: String,
    exprs: Vec<String>,
    descending: bool,
}

impl<'a> Compiler<'a> {
    pub fn new(dialect: &'a dyn Dialect, classes: &'a ClassRegistry, prefix: &'a str) -> Self {
        Self {
            dialect,
            classes,
            prefix,
        }
    }

    pub fn dialect(&self) -> &dyn Dialect {
        self.dialect
    }

    fn table(&self, kind: TableKind, etype: &str) -> String {
        self.dialect.quote(&table_name(self.prefix, kind, etype))
    }

    fn col(&self, alias: &str, column: &str) -> String {
        format!("{alias}.{}", self.dialect.quote(column))
    }

    /// Compiles `query` according to its `return` option.
    ///
    /// - `entity`: one row per property as `guid, tags, cdate, mdate, name,
    ///   value`, ordered by the query's sort; entities without properties
    ///   yield one row with null `name`/`value`.
    /// - `guid`: one `guid` column, ordered.
    /// - `count`: a single `count` column.
    pub fn compile(&self, query: &Query) -> QueryResult<CompiledQuery> {
        let mut b = Builder::default();
        let etype = self.classes.etype_of(&query.options.class)?.to_string();
        b.depend_on(&etype);

        let text = match query.options.return_kind {
            ReturnKind::Guid => self.guid_select(&mut b, query, &etype, false)?,
            ReturnKind::Entity => self.entity_select(&mut b, query, &etype)?,
            ReturnKind::Count => self.count_select(&mut b, query, &etype)?,
        };

        let compiled = CompiledQuery {
            text,
            params: b.params,
            etypes: b.etypes,
            return_kind: query.options.return_kind,
        };
        let compiled = self.dialect.render(compiled);
        debug!(dialect = self.dialect.name(), etype = %etype, sql = %compiled.text, "compiled query");
        Ok(compiled)
    }

    fn ordering(&self, b: &mut Builder, query: &Query, etype: &str, e: &str) -> Ordering {
        let descending = query.options.reverse;
        match &query.options.sort {
            SortBy::Cdate => Ordering {
                join: String::new(),
                exprs: vec![self.col(e, "cdate")],
                descending,
            },
            SortBy::Mdate => Ordering {
                join: String::new(),
                exprs: vec![self.col(e, "mdate")],
                descending,
            },
            SortBy::Property(name) => {
                let s = b.alias("s");
                let name = b.text(name.as_str());
                Ordering {
                    join: format!(
                        " LEFT JOIN {} {s} ON {} = {} AND {} = {name}",
                        self.table(TableKind::Data, etype),
                        self.col(&s, "guid"),
                        self.col(e, "guid"),
                        self.col(&s, "name"),
                    ),
                    exprs: vec![self.col(&s, "number"), self.col(&s, "string")],
                    descending,
                }
            }
        }
    }

    /// `SELECT guid [, sort columns] ... ORDER BY ... LIMIT ...` over the
    /// queried etype. `with_sort` exposes the sort expressions as
    /// `sort_0..` so an outer query can keep the order.
    fn guid_select(
        &self,
        b: &mut Builder,
        query: &Query,
        etype: &str,
        with_sort: bool,
    ) -> QueryResult<String> {
        let e = b.alias("e");
        let order = self.ordering(b, query, etype, &e);
        let filter = self.where_clause(b, &query.selectors, etype, &e)?;

        let mut columns = vec![self.col(&e, "guid")];
        if with_sort {
            columns.extend(
                order
                    .exprs
                    .iter()
                    .enumerate()
                    .map(|(i, expr)| format!("{expr} AS {}", self.dialect.quote(&format!("sort_{i}")))),
            );
        }
        let mut terms: Vec<String> = order
            .exprs
            .iter()
            .map(|expr| self.dialect.order_term(expr, order.descending))
            .collect();
        terms.push(format!("{} ASC", self.col(&e, "guid")));

        let limit = query.options.limit.map(|l| b.param(SqlValue::Integer(clamp(l))));
        let offset = query.options.offset.map(|o| b.param(SqlValue::Integer(clamp(o))));

        Ok(format!(
            "SELECT {} FROM {} {e}{} WHERE {filter} ORDER BY {}{}",
            columns.join(", "),
            self.table(TableKind::Entities, etype),
            order.join,
            terms.join(", "),
            self.dialect.limit_offset(limit.as_deref(), offset.as_deref()),
        ))
    }

    fn entity_select(&self, b: &mut Builder, query: &Query, etype: &str) -> QueryResult<String> {
        let inner = self.guid_select(b, query, etype, true)?;
        let l = b.alias("l");
        let e = b.alias("e");
        let d = b.alias("d");
        let sort_count = match query.options.sort {
            SortBy::Property(_) => 2,
            _ => 1,
        };
        let mut terms: Vec<String> = (0..sort_count)
            .map(|i| {
                self.dialect
                    .order_term(&self.col(&l, &format!("sort_{i}")), query.options.reverse)
            })
            .collect();
        terms.push(format!("{} ASC", self.col(&l, "guid")));
        terms.push(format!("{} ASC", self.col(&d, "name")));

        Ok(format!(
            "SELECT {}, {}, {}, {}, {}, {} FROM ({inner}) {l} JOIN {} {e} ON {} = {} LEFT JOIN {} {d} ON {} = {} ORDER BY {}",
            self.col(&e, "guid"),
            self.col(&e, "tags"),
            self.col(&e, "cdate"),
            self.col(&e, "mdate"),
            self.col(&d, "name"),
            self.col(&d, "value"),
            self.table(TableKind::Entities, etype),
            self.col(&e, "guid"),
            self.col(&l, "guid"),
            self.table(TableKind::Data, etype),
            self.col(&d, "guid"),
            self.col(&e, "guid"),
            terms.join(", "),
        ))
    }

    fn count_select(&self, b: &mut Builder, query: &Query, etype: &str) -> QueryResult<String> {
        let count = self.dialect.quote("count");
        if query.options.is_paged() {
            let inner = self.guid_select(b, query, etype, false)?;
            let c = b.alias("c");
            return Ok(format!("SELECT COUNT(*) AS {count} FROM ({inner}) {c}"));
        }
        let e = b.alias("e");
        let filter = self.where_clause(b, &query.selectors, etype, &e)?;
        Ok(format!(
            "SELECT COUNT({}) AS {count} FROM {} {e} WHERE {filter}",
            self.col(&e, "guid"),
            self.table(TableKind::Entities, etype),
        ))
    }

    /// Top-level selectors are AND'd together.
    fn where_clause(
        &self,
        b: &mut Builder,
        selectors: &[Selector],
        etype: &str,
        e: &str,
    ) -> QueryResult<String> {
        if selectors.is_empty() {
            return Ok("1=1".into());
        }
        let parts = selectors
            .iter()
            .map(|s| self.selector(b, s, etype, e))
            .collect::<QueryResult<Vec<_>>>()?;
        Ok(parts.join(" AND "))
    }

    fn selector(
        &self,
        b: &mut Builder,
        selector: &Selector,
        etype: &str,
        e: &str,
    ) -> QueryResult<String> {
        let is_or = selector.kind.is_or();
        if selector.clauses.is_empty() {
            return Ok(if is_or { "(1=0)" } else { "(1=1)" }.into());
        }
        let mut parts = Vec::with_capacity(selector.clauses.len());
        for clause in &selector.clauses {
            let condition = self.predicate(b, &clause.predicate, etype, e)?;
            if selector.kind.is_not() ^ clause.negated {
                parts.push(format!("NOT ({condition})"));
            } else {
                parts.push(format!("({condition})"));
            }
        }
        let joiner = if is_or { " OR " } else { " AND " };
        Ok(format!("({})", parts.join(joiner)))
    }

    /// Correlated existence check for a property row satisfying `condition`.
    fn property(
        &self,
        b: &mut Builder,
        etype: &str,
        e: &str,
        name: &str,
        condition: impl FnOnce(&Self, &mut Builder, &str) -> String,
    ) -> String {
        let d = b.alias("d");
        let name = b.text(name);
        let mut sql = format!(
            "EXISTS (SELECT 1 FROM {} {d} WHERE {} = {} AND {} = {name}",
            self.table(TableKind::Data, etype),
            self.col(&d, "guid"),
            self.col(e, "guid"),
            self.col(&d, "name"),
        );
        let condition = condition(self, b, &d);
        if !condition.is_empty() {
            sql.push_str(" AND ");
            sql.push_str(&condition);
        }
        sql.push(')');
        sql
    }

    fn reference(
        &self,
        b: &mut Builder,
        etype: &str,
        e: &str,
        name: &str,
        target: impl FnOnce(&Self, &mut Builder, &str) -> QueryResult<String>,
    ) -> QueryResult<String> {
        let r = b.alias("r");
        let name = b.text(name);
        let target = target(self, b, &self.col(&r, "reference"))?;
        Ok(format!(
            "EXISTS (SELECT 1 FROM {} {r} WHERE {} = {} AND {} = {name} AND {target})",
            self.table(TableKind::References, etype),
            self.col(&r, "guid"),
            self.col(e, "guid"),
            self.col(&r, "name"),
        ))
    }

    fn predicate(
        &self,
        b: &mut Builder,
        predicate: &Predicate,
        etype: &str,
        e: &str,
    ) -> QueryResult<String> {
        if let Some(sql) = self.timestamp_predicate(b, predicate, e) {
            return Ok(sql);
        }
        Ok(match predicate {
            Predicate::Guid(guid) => {
                let p = b.text(guid.to_hex());
                format!("{} = {p}", self.col(e, "guid"))
            }
            Predicate::Tag(tag) => {
                validate_tag(tag)?;
                let p = b.text(format!(",{tag},"));
                self.dialect.contains_text(&self.col(e, "tags"), &p)
            }
            Predicate::Defined(name) => self.property(b, etype, e, name, |_, _, _| String::new()),
            Predicate::Truthy(name) => {
                self.property(b, etype, e, name, |c, _, d| format!("{} = 1", c.col(d, "truthy")))
            }
            Predicate::Equal(name, value) => self.property(b, etype, e, name, |c, b, d| match value {
                Value::Number(n) => {
                    let p = b.param(SqlValue::Real(n.as_f64().unwrap_or_default()));
                    format!("{} = {p}", c.col(d, "number"))
                }
                Value::String(s) => {
                    let p = b.text(s.as_str());
                    format!("{} = {p}", c.col(d, "string"))
                }
                other => {
                    let p = b.text(canonical_json(other));
                    format!("{} = {p}", c.col(d, "value"))
                }
            }),
            Predicate::Contain(name, value) => self.property(b, etype, e, name, |c, b, d| {
                let p = b.text(canonical_json(value));
                c.dialect.json_contains(&c.col(d, "value"), &p)
            }),
            Predicate::Match(name, pattern) | Predicate::IMatch(name, pattern) => {
                let ci = matches!(predicate, Predicate::IMatch(..));
                compile_regex(pattern, ci)?;
                self.property(b, etype, e, name, |c, b, d| {
                    let p = b.text(pattern.as_str());
                    c.dialect.regex(&c.col(d, "string"), &p, ci)
                })
            }
            Predicate::Like(name, pattern) | Predicate::ILike(name, pattern) => {
                let ci = matches!(predicate, Predicate::ILike(..));
                self.property(b, etype, e, name, |c, b, d| {
                    let p = b.text(pattern.as_str());
                    c.dialect.like(&c.col(d, "string"), &p, ci)
                })
            }
            Predicate::Gt(name, n)
            | Predicate::Gte(name, n)
            | Predicate::Lt(name, n)
            | Predicate::Lte(name, n) => {
                let op = comparison(predicate);
                self.property(b, etype, e, name, |c, b, d| {
                    let p = b.param(SqlValue::Real(*n));
                    format!("{} {op} {p}", c.col(d, "number"))
                })
            }
            Predicate::Ref(name, guid) => self.reference(b, etype, e, name, |_, b, column| {
                let p = b.text(guid.to_hex());
                Ok(format!("{column} = {p}"))
            })?,
            Predicate::QRef(name, child) => {
                let child_etype = self.classes.etype_of(&child.options.class)?.to_string();
                b.depend_on(&child_etype);
                self.reference(b, etype, e, name, |c, b, column| {
                    let inner = c.guid_select(b, child, &child_etype, false)?;
                    Ok(format!("{column} IN ({inner})"))
                })?
            }
            Predicate::Selector(nested) => self.selector(b, nested, etype, e)?,
        })
    }

    /// `cdate`/`mdate` clauses compare the entity's own columns.
    fn timestamp_predicate(&self, b: &mut Builder, predicate: &Predicate, e: &str) -> Option<String> {
        let name = match predicate {
            Predicate::Defined(n)
            | Predicate::Truthy(n)
            | Predicate::Equal(n, _)
            | Predicate::Gt(n, _)
            | Predicate::Gte(n, _)
            | Predicate::Lt(n, _)
            | Predicate::Lte(n, _) => n.as_str(),
            _ => return None,
        };
        if name != "cdate" && name != "mdate" {
            return None;
        }
        let column = self.col(e, name);
        Some(match predicate {
            Predicate::Defined(_) => format!("{column} IS NOT NULL"),
            Predicate::Truthy(_) => format!("{column} IS NOT NULL AND {column} <> 0"),
            Predicate::Equal(_, Value::Number(n)) => {
                let p = b.param(SqlValue::Real(n.as_f64().unwrap_or_default()));
                format!("{column} = {p}")
            }
            Predicate::Equal(..) => "1=0".into(),
            Predicate::Gt(_, n) | Predicate::Gte(_, n) | Predicate::Lt(_, n) | Predicate::Lte(_, n) => {
                let p = b.param(SqlValue::Real(*n));
                format!("{column} {} {p}", comparison(predicate))
            }
            _ => return None,
        })
    }
}

fn comparison(predicate: &Predicate) -> &'static str {
    match predicate {
        Predicate::Gt(..) => ">",
        Predicate::Gte(..) => ">=",
        Predicate::Lt(..) => "<",
        _ => "<=",
    }
}

fn clamp(n: u64) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}
