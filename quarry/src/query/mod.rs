//! Query builders: accumulate a mutable expression map through fluent
//! calls, then render it into dialect-specific SQL plus an ordered
//! parameter array at a terminal method.

mod delete;
mod expression;
mod insert;
mod select;
mod update;
mod where_clause;

pub use delete::DeleteQueryBuilder;
pub use expression::{
    Alias, AliasTarget, Conjunction, JoinAttribute, JoinKind, OrderDirection,
    QueryExpressionMap, SelectItem, WhereExpr, WherePredicate,
};
pub use insert::{InsertQueryBuilder, OnConflict};
pub use select::SelectQueryBuilder;
pub use update::UpdateQueryBuilder;

/// The single column-aliasing scheme shared by the renderer and the
/// hydrator; both sides must use this function or round-tripping breaks.
pub fn column_alias(table_alias: &str, database_name: &str) -> String {
    format!("{table_alias}_{database_name}")
}

/// Deterministic alias for a relation join derived from (parent alias,
/// property path), so repeated joins of the same path reuse one alias.
pub fn relation_alias(parent_alias: &str, property: &str) -> String {
    format!("{parent_alias}_{property}")
}
