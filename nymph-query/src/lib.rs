//! Query evaluation for Nymph.
//!
//! Two ways of answering the same selector:
//! - [`matches`] evaluates it against an in-memory [`Entity`](nymph_model::Entity)
//! - [`Compiler`] turns a full [`Query`](nymph_model::Query) into parameterised SQL
//!
//! Both go through the predicates in [`functions`], so they agree on
//! truthiness, equality, containment, regex and LIKE semantics.

pub mod compiler;
pub mod functions;
mod matcher;
mod order;
mod translate;

pub use compiler::{
    table_name, CompiledQuery, Compiler, Dialect, PostgresDialect, SqlValue, SqliteDialect,
    TableKind,
};
pub use matcher::{matches, matches_selector};
pub use order::{compare, sort_entities};
pub use translate::translate_qrefs;

/// Result type alias for query operations.
pub type QueryResult<T> = std::result::Result<T, QueryError>;

/// Errors raised while matching or compiling a query.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("qref clauses must be translated before in-memory matching")]
    QrefRequiresTranslation,

    #[error(transparent)]
    Model(#[from] nymph_model::Error),
}
