//! DELETE builder. Soft deletion goes through the UPDATE builder; this one
//! always removes rows.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::criteria::FindOperator;
use crate::dialect::Dialect;
use crate::driver::{ExecuteResult, QueryRunner};
use crate::error::{QuarryError, QuarryResult};
use crate::metadata::{EntityId, MetadataRegistry};
use crate::query::expression::{
    in_ids_predicate, Alias, AliasTarget, Conjunction, QueryExpressionMap, WhereExpr,
    WherePredicate,
};
use crate::query::where_clause::{render_predicates, ParamSink, RenderCtx};
use crate::value::Value;

pub struct DeleteQueryBuilder {
    registry: Arc<MetadataRegistry>,
    entity: Option<EntityId>,
    /// Raw table deletes (junction rows) bypass entity metadata.
    raw_table: Option<String>,
    expr: QueryExpressionMap,
}

impl DeleteQueryBuilder {
    pub fn new(registry: Arc<MetadataRegistry>, entity: &str) -> QuarryResult<Self> {
        let id = registry.id_of(entity)?;
        let mut expr = QueryExpressionMap::default();
        expr.main_alias = Some(Alias {
            name: registry.get(id).table_name.clone(),
            target: AliasTarget::Entity(id),
        });
        Ok(Self {
            registry,
            entity: Some(id),
            raw_table: None,
            expr,
        })
    }

    /// Delete from a table with no entity mapping, e.g. a junction table.
    pub fn from_table(registry: Arc<MetadataRegistry>, table: &str) -> Self {
        let mut expr = QueryExpressionMap::default();
        expr.main_alias = Some(Alias {
            name: table.to_string(),
            target: AliasTarget::Table(table.to_string()),
        });
        Self {
            registry,
            entity: None,
            raw_table: Some(table.to_string()),
            expr,
        }
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

    pub fn or_where_op(mut self, property: &str, operator: FindOperator) -> Self {
        let predicate = self.condition(property, operator, Conjunction::Or);
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
            .entity
            .map(|id| {
                self.registry
                    .get(id)
                    .primary_columns()
                    .map(|c| c.property_name.clone())
                    .collect()
            })
            .unwrap_or_default();
        self.expr.wheres.push(in_ids_predicate(&alias, &order, ids));
        self
    }

    pub fn set_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.expr.set_parameter(name, value.into());
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
        // Unfiltered deletes wipe the table; require an explicit predicate.
        if self.expr.wheres.is_empty() {
            return Err(QuarryError::query_validation(
                "delete requires a WHERE condition",
            ));
        }
        let mut sink = ParamSink::new(&self.expr.parameters, self.expr.parameter_counter);
        let table = match self.entity {
            Some(id) => {
                let metadata = self.registry.get(id);
                match &metadata.schema {
                    Some(schema) => format!(
                        "{}.{}",
                        dialect.escape(schema),
                        dialect.escape(&metadata.table_name)
                    ),
                    None => dialect.escape(&metadata.table_name),
                }
            }
            None => dialect.escape(self.raw_table.as_deref().unwrap_or_default()),
        };
        let ctx = RenderCtx {
            registry: &self.registry,
            dialect,
            expr: &self.expr,
        };
        let mut sql = format!("DELETE FROM {table} WHERE ");
        sql.push_str(&render_predicates(&self.expr.wheres, &ctx, &mut sink)?);

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
