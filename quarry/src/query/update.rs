//! UPDATE builder: property-keyed SET list with value preparation, raw SET
//! fragments for in-database expressions, and the shared where tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::criteria::FindOperator;
use crate::dialect::{Dialect, ReturningKind};
use crate::driver::{ExecuteResult, QueryRunner};
use crate::error::{QuarryError, QuarryResult};
use crate::metadata::{EntityId, MetadataRegistry};
use crate::query::expression::{
    in_ids_predicate, Alias, AliasTarget, Conjunction, QueryExpressionMap, WhereExpr,
    WherePredicate,
};
use crate::query::where_clause::{render_predicates, ParamSink, RenderCtx};
use crate::value::Value;

pub struct UpdateQueryBuilder {
    registry: Arc<MetadataRegistry>,
    entity: EntityId,
    /// Property name to value, in call order.
    sets: Vec<(String, Value)>,
    /// Trusted SET fragments, e.g. an in-database counter bump.
    raw_sets: Vec<String>,
    expr: QueryExpressionMap,
    returning: Vec<String>,
}

impl UpdateQueryBuilder {
    pub fn new(registry: Arc<MetadataRegistry>, entity: &str) -> QuarryResult<Self> {
        let id = registry.id_of(entity)?;
        let mut expr = QueryExpressionMap::default();
        // Conditions qualify columns with the table name; UPDATE takes no
        // alias.
        expr.main_alias = Some(Alias {
            name: registry.get(id).table_name.clone(),
            target: AliasTarget::Entity(id),
        });
        Ok(Self {
            registry,
            entity: id,
            sets: Vec::new(),
            raw_sets: Vec::new(),
            expr,
            returning: Vec::new(),
        })
    }

    pub fn set(mut self, property: impl Into<String>, value: impl Into<Value>) -> Self {
        self.sets.push((property.into(), value.into()));
        self
    }

    pub fn set_raw(mut self, fragment: impl Into<String>) -> Self {
        self.raw_sets.push(fragment.into());
        self
    }

    pub fn where_op(mut self, property: &str, operator: FindOperator) -> Self {
        self.expr.wheres.clear();
        let predicate = self.condition(property, operator, Conjunction::And);
        self.expr.wheres.push(predicate);
        self
    }

    pub fn and_where_op(mut self, property: &str, operator: FindOperator) -> Self {
        let predicate = self.condition(property, operator, Conjunction::And);
        self.expr.wheres.push(predicate);
        self
    }

    pub fn where_raw(mut self, sql: impl Into<String>) -> Self {
        self.expr.wheres.push(WherePredicate {
            conjunction: Conjunction::And,
            expr: WhereExpr::Raw(sql.into()),
        });
        self
    }

    pub fn where_in_ids(mut self, ids: Vec<BTreeMap<String, Value>>) -> Self {
        let alias = self.table_alias();
        let order: Vec<String> = self
            .registry
            .get(self.entity)
            .primary_columns()
            .map(|c| c.property_name.clone())
            .collect();
        self.expr.wheres.push(in_ids_predicate(&alias, &order, ids));
        self
    }

    pub fn set_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.expr.set_parameter(name, value.into());
        self
    }

    /// Database column names to read back when the dialect supports
    /// RETURNING on UPDATE.
    pub fn returning(mut self, columns: Vec<String>) -> Self {
        self.returning = columns;
        self
    }

    fn table_alias(&self) -> String {
        self.expr
            .main_alias
            .as_ref()
            .map(|a| a.name.clone())
            .unwrap_or_default()
    }

    fn condition(
        &self,
        property: &str,
        operator: FindOperator,
        conjunction: Conjunction,
    ) -> WherePredicate {
        WherePredicate {
            conjunction,
            expr: WhereExpr::Condition {
                alias: self.table_alias(),
                property: property.to_string(),
                operator,
            },
        }
    }

    pub fn get_query_and_parameters(
        &self,
        dialect: Dialect,
    ) -> QuarryResult<(String, Vec<Value>)> {
        if self.sets.is_empty() && self.raw_sets.is_empty() {
            return Err(QuarryError::query_validation("update has no SET values"));
        }
        let metadata = self.registry.get(self.entity);
        let mut sink = ParamSink::new(&self.expr.parameters, self.expr.parameter_counter);

        let mut sets = Vec::with_capacity(self.sets.len() + self.raw_sets.len());
        for (property, value) in &self.sets {
            let column = metadata
                .find_column_with_property_path(property)
                .ok_or_else(|| QuarryError::ColumnNotFound {
                    entity: metadata.name.clone(),
                    property: property.clone(),
                })?;
            let prepared = column.prepare_persistent_value(value.clone())?;
            sets.push(format!(
                "{} = {}",
                dialect.escape(&column.database_name),
                sink.bind(prepared)
            ));
        }
        sets.extend(self.raw_sets.iter().cloned());

        let table = match &metadata.schema {
            Some(schema) => format!(
                "{}.{}",
                dialect.escape(schema),
                dialect.escape(&metadata.table_name)
            ),
            None => dialect.escape(&metadata.table_name),
        };
        let mut sql = format!("UPDATE {} SET {}", table, sets.join(", "));
        if !self.expr.wheres.is_empty() {
            let ctx = RenderCtx {
                registry: &self.registry,
                dialect,
                expr: &self.expr,
            };
            sql.push_str(" WHERE ");
            sql.push_str(&render_predicates(&self.expr.wheres, &ctx, &mut sink)?);
        }
        if !self.returning.is_empty() && dialect.supports_returning(ReturningKind::Update) {
            sql.push_str(" RETURNING ");
            sql.push_str(
                &self
                    .returning
                    .iter()
                    .map(|c| dialect.escape(c))
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }

        let named = sink.named;
        dialect.escape_query_with_parameters(&sql, &|name| named.get(name).cloned())
    }

    pub fn get_sql(&self, dialect: Dialect) -> QuarryResult<String> {
        self.get_query_and_parameters(dialect).map(|(sql, _)| sql)
    }

    pub async fn execute(
        &self,
        runner: &mut dyn QueryRunner,
        dialect: Dialect,
    ) -> QuarryResult<ExecuteResult> {
        let (sql, params) = self.get_query_and_parameters(dialect)?;
        debug!("query: {sql} -- parameters: {params:?}");
        runner
            .execute(&sql, &params)
            .await
            .map_err(|e| e.with_query(sql, &params))
    }
}
