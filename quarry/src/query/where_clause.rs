//! WHERE tree rendering: dialect-correct operator tokens, parameter
//! registration through the bag (never string interpolation, `Raw`
//! excepted) and NULL-aware rewriting of equality.

use std::collections::BTreeMap;

use crate::criteria::FindOperator;
use crate::dialect::Dialect;
use crate::error::{QuarryError, QuarryResult};
use crate::metadata::{ColumnMetadata, MetadataRegistry};
use crate::query::expression::{
    AliasTarget, Conjunction, QueryExpressionMap, WhereExpr, WherePredicate,
};
use crate::value::Value;

/// Collects parameters in SQL appearance order while rendering. Seeded with
/// the caller-supplied named parameters; generated names never collide with
/// user names because of the `qp_` prefix.
pub struct ParamSink {
    pub named: BTreeMap<String, Value>,
    counter: usize,
}

impl ParamSink {
    pub fn new(seed: &BTreeMap<String, Value>, counter: usize) -> Self {
        Self {
            named: seed.clone(),
            counter,
        }
    }

    /// Bind a generated parameter, returning its `:name` reference.
    pub fn bind(&mut self, value: Value) -> String {
        let name = format!("qp_{}", self.counter);
        self.counter += 1;
        self.named.insert(name.clone(), value);
        format!(":{name}")
    }

    pub fn insert_named(&mut self, name: &str, value: Value) {
        self.named.insert(name.to_string(), value);
    }
}

pub struct RenderCtx<'a> {
    pub registry: &'a MetadataRegistry,
    pub dialect: Dialect,
    pub expr: &'a QueryExpressionMap,
}

impl<'a> RenderCtx<'a> {
    /// Resolve `alias.property` to an escaped column expression.
    pub fn column_expr(&self, alias: &str, property: &str) -> QuarryResult<String> {
        let resolved = self.expr.find_alias(alias)?;
        let database_name = match &resolved.target {
            AliasTarget::Entity(id) => {
                let metadata = self.registry.get(*id);
                self.resolve_column(metadata.id, property)?
                    .database_name
                    .clone()
            }
            AliasTarget::Table(_) => property.to_string(),
        };
        Ok(format!(
            "{}.{}",
            self.dialect.escape(alias),
            self.dialect.escape(&database_name)
        ))
    }

    pub fn resolve_column(
        &self,
        entity: crate::metadata::EntityId,
        property: &str,
    ) -> QuarryResult<&'a ColumnMetadata> {
        let metadata = self.registry.get(entity);
        metadata
            .find_column_with_property_path(property)
            .or_else(|| metadata.find_column_with_database_name(property))
            .ok_or_else(|| QuarryError::ColumnNotFound {
                entity: metadata.name.clone(),
                property: property.to_string(),
            })
    }

    /// Column metadata behind `alias.property` when the alias maps an
    /// entity; used to run condition operands through value preparation.
    fn column_metadata(&self, alias: &str, property: &str) -> Option<&'a ColumnMetadata> {
        let resolved = self.expr.find_alias(alias).ok()?;
        match &resolved.target {
            AliasTarget::Entity(id) => self.resolve_column(*id, property).ok(),
            AliasTarget::Table(_) => None,
        }
    }
}

pub fn render_predicates(
    predicates: &[WherePredicate],
    ctx: &RenderCtx<'_>,
    sink: &mut ParamSink,
) -> QuarryResult<String> {
    let mut out = String::new();
    for (i, predicate) in predicates.iter().enumerate() {
        if i > 0 {
            out.push_str(match predicate.conjunction {
                Conjunction::And => " AND ",
                Conjunction::Or => " OR ",
            });
        }
        out.push_str(&render_expr(&predicate.expr, ctx, sink)?);
    }
    Ok(out)
}

fn render_expr(
    expr: &WhereExpr,
    ctx: &RenderCtx<'_>,
    sink: &mut ParamSink,
) -> QuarryResult<String> {
    match expr {
        WhereExpr::Raw(sql) => Ok(sql.clone()),
        WhereExpr::Group(inner) => Ok(format!("({})", render_predicates(inner, ctx, sink)?)),
        WhereExpr::Condition {
            alias,
            property,
            operator,
        } => {
            let column = ctx.column_expr(alias, property)?;
            let metadata = ctx.column_metadata(alias, property);
            render_condition(&column, metadata, operator, ctx, sink)
        }
    }
}

fn prepare(
    column: Option<&ColumnMetadata>,
    value: &Value,
) -> QuarryResult<Value> {
    match column {
        Some(c) => c.prepare_persistent_value(value.clone()),
        None => Ok(value.clone()),
    }
}

fn bind_list(
    values: &[Value],
    column: Option<&ColumnMetadata>,
    sink: &mut ParamSink,
) -> QuarryResult<String> {
    let mut parts = Vec::with_capacity(values.len());
    for value in values {
        parts.push(sink.bind(prepare(column, value)?));
    }
    Ok(parts.join(", "))
}

pub fn render_condition(
    column: &str,
    column_meta: Option<&ColumnMetadata>,
    operator: &FindOperator,
    ctx: &RenderCtx<'_>,
    sink: &mut ParamSink,
) -> QuarryResult<String> {
    let dialect = ctx.dialect;
    Ok(match operator {
        // `= NULL` never matches in SQL; equality on null rewrites to the
        // IS NULL form.
        FindOperator::Equal(Value::Null) => format!("{column} IS NULL"),
        FindOperator::Equal(value) => {
            format!("{column} = {}", sink.bind(prepare(column_meta, value)?))
        }
        FindOperator::IsNull => format!("{column} IS NULL"),
        FindOperator::Not(inner) => match inner.as_ref() {
            FindOperator::IsNull | FindOperator::Equal(Value::Null) => {
                format!("{column} IS NOT NULL")
            }
            FindOperator::Equal(value) => {
                format!("{column} != {}", sink.bind(prepare(column_meta, value)?))
            }
            FindOperator::In(values) if values.is_empty() => "1 = 1".to_string(),
            FindOperator::In(values) => {
                format!("{column} NOT IN ({})", bind_list(values, column_meta, sink)?)
            }
            FindOperator::Like(pattern) => {
                format!("{column} NOT LIKE {}", sink.bind(Value::from(pattern.as_str())))
            }
            other => format!(
                "NOT ({})",
                render_condition(column, column_meta, other, ctx, sink)?
            ),
        },
        // An empty IN list matches nothing rather than producing invalid
        // SQL.
        FindOperator::In(values) if values.is_empty() => "1 = 0".to_string(),
        FindOperator::In(values) => {
            format!("{column} IN ({})", bind_list(values, column_meta, sink)?)
        }
        FindOperator::Any(values) => {
            if dialect == Dialect::Postgres {
                format!("{column} = ANY (ARRAY[{}])", bind_list(values, column_meta, sink)?)
            } else {
                format!("{column} IN ({})", bind_list(values, column_meta, sink)?)
            }
        }
        FindOperator::Between(low, high) => format!(
            "{column} BETWEEN {} AND {}",
            sink.bind(prepare(column_meta, low)?),
            sink.bind(prepare(column_meta, high)?)
        ),
        FindOperator::LessThan(value) => {
            format!("{column} < {}", sink.bind(prepare(column_meta, value)?))
        }
        FindOperator::LessThanOrEqual(value) => {
            format!("{column} <= {}", sink.bind(prepare(column_meta, value)?))
        }
        FindOperator::MoreThan(value) => {
            format!("{column} > {}", sink.bind(prepare(column_meta, value)?))
        }
        FindOperator::MoreThanOrEqual(value) => {
            format!("{column} >= {}", sink.bind(prepare(column_meta, value)?))
        }
        FindOperator::Like(pattern) => {
            format!("{column} LIKE {}", sink.bind(Value::from(pattern.as_str())))
        }
        FindOperator::ILike(pattern) => {
            if dialect.supports_ilike() {
                format!("{column} ILIKE {}", sink.bind(Value::from(pattern.as_str())))
            } else {
                format!(
                    "LOWER({column}) LIKE LOWER({})",
                    sink.bind(Value::from(pattern.as_str()))
                )
            }
        }
        FindOperator::ArrayContains(values) => {
            if !dialect.supports_array_operators() {
                return Err(QuarryError::UnsupportedOperator {
                    operator: "array-contains".to_string(),
                    dialect: dialect.name().to_string(),
                });
            }
            format!("{column} @> ARRAY[{}]", bind_list(values, None, sink)?)
        }
        FindOperator::ArrayOverlap(values) => {
            if !dialect.supports_array_operators() {
                return Err(QuarryError::UnsupportedOperator {
                    operator: "array-overlap".to_string(),
                    dialect: dialect.name().to_string(),
                });
            }
            format!("{column} && ARRAY[{}]", bind_list(values, None, sink)?)
        }
        FindOperator::Raw { sql, params } => {
            for (name, value) in params {
                sink.insert_named(name, value.clone());
            }
            sql.replace("{}", column)
        }
    })
}
