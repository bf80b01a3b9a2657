//! The mutable state a query builder accumulates before rendering: aliases,
//! join attributes, selections, the where tree, ordering, pagination and
//! the parameter bag. Created fresh per builder, consumed at SQL-generation
//! time.

use std::collections::BTreeMap;

use crate::criteria::FindOperator;
use crate::error::{QuarryError, QuarryResult};
use crate::metadata::EntityId;
use crate::value::Value;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasTarget {
    Entity(EntityId),
    Table(String),
}

/// A named reference to a table or joined relation within one query.
#[derive(Debug, Clone)]
pub struct Alias {
    pub name: String,
    pub target: AliasTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Left,
    Inner,
}

impl JoinKind {
    pub fn sql(self) -> &'static str {
        match self {
            JoinKind::Left => "LEFT JOIN",
            JoinKind::Inner => "INNER JOIN",
        }
    }
}

/// One join attribute: binds a relation path (or a raw table) to an alias.
#[derive(Debug, Clone)]
pub struct JoinAttribute {
    pub kind: JoinKind,
    pub alias: String,
    pub parent_alias: String,
    /// Relation property on the parent alias's entity; `None` for raw
    /// table joins.
    pub relation_property: Option<String>,
    /// Raw table name for non-relation joins.
    pub table: Option<String>,
    /// Extra raw ON condition (the only condition for raw table joins).
    pub condition: Option<String>,
    /// Whether the joined alias's columns participate in the SELECT list
    /// and therefore in hydration.
    pub and_select: bool,
}

/// One SELECT list entry. `property: None` selects the alias wholesale
/// (expanded to all mapped columns at render time).
#[derive(Debug, Clone)]
pub struct SelectItem {
    pub alias: String,
    pub property: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Conjunction {
    And,
    Or,
}

#[derive(Debug, Clone)]
pub enum WhereExpr {
    /// Trusted SQL fragment; may reference `:named` parameters.
    Raw(String),
    /// One column condition rendered with dialect tokens and bound
    /// parameters.
    Condition {
        alias: String,
        property: String,
        operator: FindOperator,
    },
    /// Parenthesized group of predicates.
    Group(Vec<WherePredicate>),
}

#[derive(Debug, Clone)]
pub struct WherePredicate {
    pub conjunction: Conjunction,
    pub expr: WhereExpr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Asc,
    Desc,
}

impl OrderDirection {
    pub fn sql(self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderItem {
    pub alias: String,
    pub property: String,
    pub direction: OrderDirection,
}

#[derive(Debug, Clone)]
pub struct GroupItem {
    pub alias: String,
    pub property: String,
}

#[derive(Debug, Clone, Default)]
pub struct QueryExpressionMap {
    pub main_alias: Option<Alias>,
    pub aliases: Vec<Alias>,
    pub joins: Vec<JoinAttribute>,
    pub selects: Vec<SelectItem>,
    pub wheres: Vec<WherePredicate>,
    pub order_bys: Vec<OrderItem>,
    pub group_bys: Vec<GroupItem>,
    pub havings: Vec<WherePredicate>,
    /// SQL-level LIMIT/OFFSET. `Some(0)` is meaningful and renders a
    /// literal zero; only `None` means unset.
    pub limit: Option<u64>,
    pub offset: Option<u64>,
    /// Root-entity-level pagination; rewritten through a primary-key
    /// subquery when a to-many relation is joined for selection.
    pub take: Option<u64>,
    pub skip: Option<u64>,
    /// Caller-supplied named parameters.
    pub parameters: BTreeMap<String, Value>,
    /// Counter for internally generated parameter names.
    pub parameter_counter: usize,
    /// Include soft-deleted rows.
    pub with_deleted: bool,
}

impl QueryExpressionMap {
    pub fn register_alias(&mut self, alias: Alias) {
        self.aliases.push(alias);
    }

    pub fn find_alias(&self, name: &str) -> QuarryResult<&Alias> {
        if let Some(main) = &self.main_alias {
            if main.name == name {
                return Ok(main);
            }
        }
        self.aliases
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| QuarryError::AliasNotFound {
                alias: name.to_string(),
            })
    }

    pub fn has_alias(&self, name: &str) -> bool {
        self.find_alias(name).is_ok()
    }

    /// Register an internally generated parameter and return its name.
    pub fn next_parameter(&mut self, value: Value) -> String {
        let name = format!("qp_{}", self.parameter_counter);
        self.parameter_counter += 1;
        self.parameters.insert(name.clone(), value);
        name
    }

    pub fn set_parameter(&mut self, name: impl Into<String>, value: Value) {
        self.parameters.insert(name.into(), value);
    }

    /// Whether any join selects a to-many relation, which makes SQL-level
    /// LIMIT/OFFSET wrong for root-entity pagination.
    pub fn join_attribute(&self, alias: &str) -> Option<&JoinAttribute> {
        self.joins.iter().find(|j| j.alias == alias)
    }
}

/// Identifier-list predicate shared by the builders: each id map becomes an
/// AND-joined equality group, the groups OR-joined, supporting composite
/// keys. Conditions follow the primary-key declaration order, not the map's
/// iteration order.
pub(crate) fn in_ids_predicate(
    alias: &str,
    primary_properties: &[String],
    ids: Vec<BTreeMap<String, Value>>,
) -> WherePredicate {
    let mut id_groups = Vec::with_capacity(ids.len());
    for mut id in ids {
        let mut ordered: Vec<(String, Value)> = Vec::with_capacity(id.len());
        for property in primary_properties {
            if let Some(value) = id.remove(property) {
                ordered.push((property.clone(), value));
            }
        }
        ordered.extend(id);
        let conditions: Vec<WherePredicate> = ordered
            .into_iter()
            .map(|(property, value)| WherePredicate {
                conjunction: Conjunction::And,
                expr: WhereExpr::Condition {
                    alias: alias.to_string(),
                    property,
                    operator: FindOperator::Equal(value),
                },
            })
            .collect();
        id_groups.push(WherePredicate {
            conjunction: Conjunction::Or,
            expr: WhereExpr::Group(vec![WherePredicate {
                conjunction: Conjunction::And,
                expr: WhereExpr::Group(conditions),
            }]),
        });
    }
    WherePredicate {
        conjunction: Conjunction::And,
        expr: WhereExpr::Group(id_groups),
    }
}
