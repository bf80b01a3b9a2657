//! SELECT builder: fluent accumulation into the expression map, then
//! staged rendering — main table, joins (relation paths expand their ON
//! clauses from metadata), select-list expansion, where tree, ordering and
//! pagination — into dialect SQL plus ordered parameters.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::criteria::{Criterion, FindOperator};
use crate::driver::{QueryRunner, Row};
use crate::entity::EntityRef;
use crate::error::{QuarryError, QuarryResult};
use crate::hydration::RawSqlResultTransformer;
use crate::metadata::{EntityId, MetadataRegistry, RelationKind};
use crate::query::expression::{
    Alias, AliasTarget, Conjunction, GroupItem, JoinAttribute, JoinKind, OrderDirection,
    OrderItem, QueryExpressionMap, SelectItem, WhereExpr, WherePredicate,
};
use crate::query::where_clause::{render_predicates, ParamSink, RenderCtx};
use crate::query::{column_alias, relation_alias};
use crate::value::Value;

#[derive(Debug)]
pub struct SelectQueryBuilder {
    registry: Arc<MetadataRegistry>,
    pub(crate) expr: QueryExpressionMap,
    /// Relation paths requested but absent from metadata, reported all at
    /// once at render time.
    unresolved_relations: Vec<String>,
}

impl SelectQueryBuilder {
    pub fn new(
        registry: Arc<MetadataRegistry>,
        entity: &str,
        alias: &str,
    ) -> QuarryResult<Self> {
        let id = registry.id_of(entity)?;
        let mut expr = QueryExpressionMap::default();
        expr.main_alias = Some(Alias {
            name: alias.to_string(),
            target: AliasTarget::Entity(id),
        });
        expr.selects.push(SelectItem {
            alias: alias.to_string(),
            property: None,
        });
        Ok(Self {
            registry,
            expr,
            unresolved_relations: Vec::new(),
        })
    }

    fn main_alias_name(&self) -> String {
        self.expr
            .main_alias
            .as_ref()
            .map(|a| a.name.clone())
            .unwrap_or_default()
    }

    fn main_entity(&self) -> Option<EntityId> {
        match self.expr.main_alias.as_ref().map(|a| &a.target) {
            Some(AliasTarget::Entity(id)) => Some(*id),
            _ => None,
        }
    }

    // ---- selection ----

    /// Replace the selection with `alias` or `alias.property`.
    pub fn select(mut self, path: &str) -> Self {
        self.expr.selects.clear();
        self.add_select_path(path);
        self
    }

    pub fn add_select(mut self, path: &str) -> Self {
        self.add_select_path(path);
        self
    }

    fn add_select_path(&mut self, path: &str) {
        let (alias, property) = match path.split_once('.') {
            Some((a, p)) => (a.to_string(), Some(p.to_string())),
            None => (path.to_string(), None),
        };
        self.expr.selects.push(SelectItem { alias, property });
    }

    // ---- where ----

    /// Replace the where tree with a trusted SQL fragment; `:name`
    /// placeholders bind through [`Self::set_parameter`].
    pub fn where_raw(mut self, sql: impl Into<String>) -> Self {
        self.expr.wheres.clear();
        self.expr.wheres.push(WherePredicate {
            conjunction: Conjunction::And,
            expr: WhereExpr::Raw(sql.into()),
        });
        self
    }

    pub fn and_where_raw(mut self, sql: impl Into<String>) -> Self {
        self.expr.wheres.push(WherePredicate {
            conjunction: Conjunction::And,
            expr: WhereExpr::Raw(sql.into()),
        });
        self
    }

    pub fn or_where_raw(mut self, sql: impl Into<String>) -> Self {
        self.expr.wheres.push(WherePredicate {
            conjunction: Conjunction::Or,
            expr: WhereExpr::Raw(sql.into()),
        });
        self
    }

    /// Structured condition on `alias.property` (or a bare property of the
    /// main alias).
    pub fn where_op(mut self, path: &str, operator: FindOperator) -> Self {
        self.expr.wheres.clear();
        let predicate = self.condition_predicate(path, operator, Conjunction::And);
        self.expr.wheres.push(predicate);
        self
    }

    pub fn and_where_op(mut self, path: &str, operator: FindOperator) -> Self {
        let predicate = self.condition_predicate(path, operator, Conjunction::And);
        self.expr.wheres.push(predicate);
        self
    }

    pub fn or_where_op(mut self, path: &str, operator: FindOperator) -> Self {
        let predicate = self.condition_predicate(path, operator, Conjunction::Or);
        self.expr.wheres.push(predicate);
        self
    }

    fn condition_predicate(
        &self,
        path: &str,
        operator: FindOperator,
        conjunction: Conjunction,
    ) -> WherePredicate {
        let (alias, property) = match path.split_once('.') {
            Some((a, p)) if self.expr.has_alias(a) => (a.to_string(), p.to_string()),
            _ => (self.main_alias_name(), path.to_string()),
        };
        WherePredicate {
            conjunction,
            expr: WhereExpr::Condition {
                alias,
                property,
                operator,
            },
        }
    }

    /// Filter by a list of identifier maps (property name to value),
    /// supporting composite keys:
    /// `(((a = ? AND b = ?)) OR ((a = ? AND b = ?)))`.
    pub fn where_in_ids(mut self, ids: Vec<BTreeMap<String, Value>>) -> Self {
        let alias = self.main_alias_name();
        let order: Vec<String> = self
            .main_entity()
            .map(|id| {
                self.registry
                    .get(id)
                    .primary_columns()
                    .map(|c| c.property_name.clone())
                    .collect()
            })
            .unwrap_or_default();
        self.expr
            .wheres
            .push(crate::query::expression::in_ids_predicate(&alias, &order, ids));
        self
    }

    /// Flatten a nested criteria tree onto the builder. A nested key that
    /// names a relation adds (or reuses) an implicit LEFT JOIN and renders
    /// the leaf against the joined alias.
    pub fn where_criterion(mut self, criterion: Criterion) -> QuarryResult<Self> {
        let alias = self.main_alias_name();
        let predicates = self.flatten_criterion(&alias, criterion)?;
        self.expr.wheres.push(WherePredicate {
            conjunction: Conjunction::And,
            expr: WhereExpr::Group(predicates),
        });
        Ok(self)
    }

    fn flatten_criterion(
        &mut self,
        alias: &str,
        criterion: Criterion,
    ) -> QuarryResult<Vec<WherePredicate>> {
        match criterion {
            Criterion::Nested(map) => {
                let mut predicates = Vec::new();
                for (key, sub) in map {
                    predicates.extend(self.flatten_entry(alias, &key, sub)?);
                }
                Ok(predicates)
            }
            Criterion::And(parts) => {
                let mut groups = Vec::new();
                for part in parts {
                    groups.push(WherePredicate {
                        conjunction: Conjunction::And,
                        expr: WhereExpr::Group(self.flatten_criterion(alias, part)?),
                    });
                }
                Ok(groups)
            }
            Criterion::Or(parts) => {
                let mut groups = Vec::new();
                for part in parts {
                    groups.push(WherePredicate {
                        conjunction: Conjunction::Or,
                        expr: WhereExpr::Group(self.flatten_criterion(alias, part)?),
                    });
                }
                Ok(groups)
            }
            Criterion::Value(_) | Criterion::Operator(_) => Err(QuarryError::query_validation(
                "criteria root must be a nested map, and/or group",
            )),
        }
    }

    fn flatten_entry(
        &mut self,
        alias: &str,
        key: &str,
        sub: Criterion,
    ) -> QuarryResult<Vec<WherePredicate>> {
        let resolved = self.expr.find_alias(alias)?.clone();
        let AliasTarget::Entity(entity) = resolved.target else {
            return Err(QuarryError::query_validation(format!(
                "criteria key '{key}' used against raw table alias '{alias}'"
            )));
        };
        let metadata = self.registry.get(entity);

        if let Some(relation) = metadata.find_relation_with_property_path(key) {
            let target = relation.target;
            let joined = self.ensure_relation_join(alias, key, false)?;
            return match sub {
                Criterion::Nested(_) | Criterion::And(_) | Criterion::Or(_) => {
                    self.flatten_criterion(&joined, sub)
                }
                // A scalar against a relation compares the target's
                // primary key.
                Criterion::Value(value) => {
                    let pk = self
                        .registry
                        .get(target)
                        .primary_columns()
                        .next()
                        .map(|c| c.property_name.clone())
                        .ok_or_else(|| QuarryError::MissingPrimaryColumn {
                            entity: self.registry.get(target).name.clone(),
                        })?;
                    Ok(vec![WherePredicate {
                        conjunction: Conjunction::And,
                        expr: WhereExpr::Condition {
                            alias: joined,
                            property: pk,
                            operator: FindOperator::Equal(value),
                        },
                    }])
                }
                Criterion::Operator(op) => {
                    let pk = self
                        .registry
                        .get(target)
                        .primary_columns()
                        .next()
                        .map(|c| c.property_name.clone())
                        .ok_or_else(|| QuarryError::MissingPrimaryColumn {
                            entity: self.registry.get(target).name.clone(),
                        })?;
                    Ok(vec![WherePredicate {
                        conjunction: Conjunction::And,
                        expr: WhereExpr::Condition {
                            alias: joined,
                            property: pk,
                            operator: op,
                        },
                    }])
                }
            };
        }

        if metadata.find_column_with_property_path(key).is_none() {
            return Err(QuarryError::ColumnNotFound {
                entity: metadata.name.clone(),
                property: key.to_string(),
            });
        }
        let operator = match sub {
            Criterion::Value(value) => FindOperator::Equal(value),
            Criterion::Operator(op) => op,
            _ => {
                return Err(QuarryError::query_validation(format!(
                    "column '{key}' cannot take a nested criteria value"
                )))
            }
        };
        Ok(vec![WherePredicate {
            conjunction: Conjunction::And,
            expr: WhereExpr::Condition {
                alias: alias.to_string(),
                property: key.to_string(),
                operator,
            },
        }])
    }

    // ---- joins ----

    pub fn left_join(self, parent_path: &str, alias: &str) -> Self {
        self.add_join(JoinKind::Left, parent_path, alias, false)
    }

    pub fn inner_join(self, parent_path: &str, alias: &str) -> Self {
        self.add_join(JoinKind::Inner, parent_path, alias, false)
    }

    pub fn left_join_and_select(self, parent_path: &str, alias: &str) -> Self {
        self.add_join(JoinKind::Left, parent_path, alias, true)
    }

    pub fn inner_join_and_select(self, parent_path: &str, alias: &str) -> Self {
        self.add_join(JoinKind::Inner, parent_path, alias, true)
    }

    /// Join a raw table with an explicit ON condition.
    pub fn left_join_table(mut self, table: &str, alias: &str, on: &str) -> Self {
        self.expr.joins.push(JoinAttribute {
            kind: JoinKind::Left,
            alias: alias.to_string(),
            parent_alias: self.main_alias_name(),
            relation_property: None,
            table: Some(table.to_string()),
            condition: Some(on.to_string()),
            and_select: false,
        });
        self.expr.register_alias(Alias {
            name: alias.to_string(),
            target: AliasTarget::Table(table.to_string()),
        });
        self
    }

    fn add_join(mut self, kind: JoinKind, parent_path: &str, alias: &str, and_select: bool) -> Self {
        let (parent_alias, property) = match parent_path.split_once('.') {
            Some((a, p)) => (a.to_string(), p.to_string()),
            None => (self.main_alias_name(), parent_path.to_string()),
        };

        // Repeat joins of the same relation path reuse the earlier alias
        // instead of emitting a duplicate join.
        if let Some(existing) = self
            .expr
            .joins
            .iter_mut()
            .find(|j| j.parent_alias == parent_alias && j.relation_property.as_deref() == Some(&property))
        {
            existing.and_select = existing.and_select || and_select;
            return self;
        }

        let target = self.resolve_relation_target(&parent_alias, &property);
        match target {
            Some(target) => {
                self.expr.register_alias(Alias {
                    name: alias.to_string(),
                    target: AliasTarget::Entity(target),
                });
            }
            None => {
                self.unresolved_relations
                    .push(format!("{parent_alias}.{property}"));
                self.expr.register_alias(Alias {
                    name: alias.to_string(),
                    target: AliasTarget::Table(property.clone()),
                });
            }
        }
        self.expr.joins.push(JoinAttribute {
            kind,
            alias: alias.to_string(),
            parent_alias,
            relation_property: Some(property),
            table: None,
            condition: None,
            and_select,
        });
        if and_select {
            self.expr.selects.push(SelectItem {
                alias: alias.to_string(),
                property: None,
            });
        }
        self
    }

    fn resolve_relation_target(&self, parent_alias: &str, property: &str) -> Option<EntityId> {
        let parent = self.expr.find_alias(parent_alias).ok()?;
        let AliasTarget::Entity(id) = parent.target else {
            return None;
        };
        self.registry
            .get(id)
            .find_relation_with_property_path(property)
            .map(|r| r.target)
    }

    /// Add or reuse the implicit join for a relation path; the alias is
    /// deterministic in (parent alias, property).
    pub(crate) fn ensure_relation_join(
        &mut self,
        parent_alias: &str,
        property: &str,
        and_select: bool,
    ) -> QuarryResult<String> {
        let alias = relation_alias(parent_alias, property);
        if self.expr.join_attribute(&alias).is_some() {
            if and_select {
                if let Some(join) = self.expr.joins.iter_mut().find(|j| j.alias == alias) {
                    if !join.and_select {
                        join.and_select = true;
                        self.expr.selects.push(SelectItem {
                            alias: alias.clone(),
                            property: None,
                        });
                    }
                }
            }
            return Ok(alias);
        }
        let target = self
            .resolve_relation_target(parent_alias, property)
            .ok_or_else(|| {
                let parent_entity = match self.expr.find_alias(parent_alias).map(|a| &a.target) {
                    Ok(AliasTarget::Entity(id)) => self.registry.get(*id).name.clone(),
                    _ => parent_alias.to_string(),
                };
                QuarryError::RelationsNotFound {
                    entity: parent_entity,
                    paths: vec![property.to_string()],
                }
            })?;
        self.expr.register_alias(Alias {
            name: alias.clone(),
            target: AliasTarget::Entity(target),
        });
        self.expr.joins.push(JoinAttribute {
            kind: JoinKind::Left,
            alias: alias.clone(),
            parent_alias: parent_alias.to_string(),
            relation_property: Some(property.to_string()),
            table: None,
            condition: None,
            and_select,
        });
        if and_select {
            self.expr.selects.push(SelectItem {
                alias: alias.clone(),
                property: None,
            });
        }
        Ok(alias)
    }

    // ---- ordering / grouping / pagination ----

    pub fn order_by(mut self, path: &str, direction: OrderDirection) -> Self {
        self.expr.order_bys.clear();
        self.push_order(path, direction);
        self
    }

    pub fn add_order_by(mut self, path: &str, direction: OrderDirection) -> Self {
        self.push_order(path, direction);
        self
    }

    fn push_order(&mut self, path: &str, direction: OrderDirection) {
        let (alias, property) = match path.split_once('.') {
            Some((a, p)) => (a.to_string(), p.to_string()),
            None => (self.main_alias_name(), path.to_string()),
        };
        self.expr.order_bys.push(OrderItem {
            alias,
            property,
            direction,
        });
    }

    pub fn group_by(mut self, path: &str) -> Self {
        let (alias, property) = match path.split_once('.') {
            Some((a, p)) => (a.to_string(), p.to_string()),
            None => (self.main_alias_name(), path.to_string()),
        };
        self.expr.group_bys.push(GroupItem { alias, property });
        self
    }

    pub fn having_raw(mut self, sql: impl Into<String>) -> Self {
        self.expr.havings.push(WherePredicate {
            conjunction: Conjunction::And,
            expr: WhereExpr::Raw(sql.into()),
        });
        self
    }

    /// SQL-level LIMIT. Zero is meaningful and renders `LIMIT 0`.
    pub fn limit(mut self, limit: u64) -> Self {
        self.expr.limit = Some(limit);
        self
    }

    /// SQL-level OFFSET. Zero is meaningful and renders `OFFSET 0`.
    pub fn offset(mut self, offset: u64) -> Self {
        self.expr.offset = Some(offset);
        self
    }

    /// Root-entity-level limit; correct under to-many joins.
    pub fn take(mut self, take: u64) -> Self {
        self.expr.take = Some(take);
        self
    }

    /// Root-entity-level offset; correct under to-many joins.
    pub fn skip(mut self, skip: u64) -> Self {
        self.expr.skip = Some(skip);
        self
    }

    pub fn set_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.expr.set_parameter(name, value.into());
        self
    }

    pub fn set_parameters(mut self, parameters: Vec<(&str, Value)>) -> Self {
        for (name, value) in parameters {
            self.expr.set_parameter(name, value);
        }
        self
    }

    pub fn with_deleted(mut self) -> Self {
        self.expr.with_deleted = true;
        self
    }

    // ---- rendering ----

    /// Rendered SQL with dialect placeholders.
    pub fn get_sql(&self, dialect: crate::dialect::Dialect) -> QuarryResult<String> {
        self.get_query_and_parameters(dialect).map(|(sql, _)| sql)
    }

    /// Rendered SQL plus the positional parameters in placeholder order.
    pub fn get_query_and_parameters(
        &self,
        dialect: crate::dialect::Dialect,
    ) -> QuarryResult<(String, Vec<Value>)> {
        let (sql, sink) = self.render(dialect)?;
        let named = sink.named;
        dialect.escape_query_with_parameters(&sql, &|name| named.get(name).cloned())
    }

    fn render(&self, dialect: crate::dialect::Dialect) -> QuarryResult<(String, ParamSink)> {
        if !self.unresolved_relations.is_empty() {
            let entity = self
                .main_entity()
                .map(|id| self.registry.get(id).name.clone())
                .unwrap_or_default();
            return Err(QuarryError::RelationsNotFound {
                entity,
                paths: self.unresolved_relations.clone(),
            });
        }
        let main = self
            .expr
            .main_alias
            .as_ref()
            .ok_or_else(|| QuarryError::query_validation("query has no main alias"))?;

        let ctx = RenderCtx {
            registry: &self.registry,
            dialect,
            expr: &self.expr,
        };
        let mut sink = ParamSink::new(&self.expr.parameters, self.expr.parameter_counter);

        let select_list = self.render_select_list(&ctx)?;
        let from = self.render_from(dialect, main)?;
        let joins = self.render_joins(&ctx)?;
        let where_core = self.render_where_core(&ctx, &mut sink)?;

        let paginate_via_subquery =
            (self.expr.take.is_some() || self.expr.skip.is_some()) && self.selects_to_many();

        let mut where_parts = where_core.clone();
        if paginate_via_subquery {
            where_parts.push(self.render_id_subquery(&ctx, &mut sink, &where_core)?);
        }

        let mut sql = format!("SELECT {select_list} FROM {from}");
        for join in &joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !where_parts.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_parts.join(" AND "));
        }
        if !self.expr.group_bys.is_empty() {
            let groups: Vec<String> = self
                .expr
                .group_bys
                .iter()
                .map(|g| ctx.column_expr(&g.alias, &g.property))
                .collect::<QuarryResult<_>>()?;
            sql.push_str(" GROUP BY ");
            sql.push_str(&groups.join(", "));
        }
        if !self.expr.havings.is_empty() {
            sql.push_str(" HAVING ");
            sql.push_str(&render_predicates(&self.expr.havings, &ctx, &mut sink)?);
        }
        if !self.expr.order_bys.is_empty() {
            sql.push_str(" ORDER BY ");
            sql.push_str(&self.render_order_by(&ctx)?);
        }

        // Literal-zero policy: LIMIT 0 / OFFSET 0 render as written, only
        // an unset value is omitted.
        let (limit, offset) = if paginate_via_subquery {
            (self.expr.limit, self.expr.offset)
        } else {
            (
                self.expr.limit.or(self.expr.take),
                self.expr.offset.or(self.expr.skip),
            )
        };
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        if let Some(offset) = offset {
            sql.push_str(&format!(" OFFSET {offset}"));
        }
        Ok((sql, sink))
    }

    fn render_select_list(&self, ctx: &RenderCtx<'_>) -> QuarryResult<String> {
        let dialect = ctx.dialect;
        let mut items = Vec::new();
        for select in &self.expr.selects {
            let alias = self.expr.find_alias(&select.alias)?;
            match (&select.property, &alias.target) {
                (Some(property), AliasTarget::Entity(id)) => {
                    let column = ctx.resolve_column(*id, property)?;
                    items.push(format!(
                        "{}.{} AS {}",
                        dialect.escape(&select.alias),
                        dialect.escape(&column.database_name),
                        dialect.escape(&column_alias(&select.alias, &column.database_name))
                    ));
                }
                (Some(property), AliasTarget::Table(_)) => {
                    items.push(format!(
                        "{}.{} AS {}",
                        dialect.escape(&select.alias),
                        dialect.escape(property),
                        dialect.escape(&column_alias(&select.alias, property))
                    ));
                }
                (None, AliasTarget::Entity(id)) => {
                    // Wholesale alias selection expands to every mapped
                    // column, each aliased to avoid collisions across
                    // joined tables. Single-table children contribute the
                    // columns they add to the shared table.
                    let metadata = self.registry.get(*id);
                    let mut seen: Vec<&str> = Vec::new();
                    let mut push = |column: &crate::metadata::ColumnMetadata| {
                        items.push(format!(
                            "{}.{} AS {}",
                            dialect.escape(&select.alias),
                            dialect.escape(&column.database_name),
                            dialect.escape(&column_alias(&select.alias, &column.database_name))
                        ));
                    };
                    for column in &metadata.columns {
                        seen.push(&column.database_name);
                        push(column);
                    }
                    for child in &metadata.children {
                        for column in &self.registry.get(*child).columns {
                            if seen.iter().any(|s| *s == column.database_name) {
                                continue;
                            }
                            seen.push(&column.database_name);
                            push(column);
                        }
                    }
                }
                (None, AliasTarget::Table(_)) => {
                    items.push(format!("{}.*", dialect.escape(&select.alias)));
                }
            }
        }
        Ok(items.join(", "))
    }

    fn render_from(
        &self,
        dialect: crate::dialect::Dialect,
        main: &Alias,
    ) -> QuarryResult<String> {
        let table = match &main.target {
            AliasTarget::Entity(id) => {
                let metadata = self.registry.get(*id);
                match &metadata.schema {
                    Some(schema) => {
                        format!("{}.{}", dialect.escape(schema), dialect.escape(&metadata.table_name))
                    }
                    None => dialect.escape(&metadata.table_name),
                }
            }
            AliasTarget::Table(table) => dialect.escape(table),
        };
        Ok(format!("{} {}", table, dialect.escape(&main.name)))
    }

    fn render_joins(&self, ctx: &RenderCtx<'_>) -> QuarryResult<Vec<String>> {
        let dialect = ctx.dialect;
        let mut out = Vec::new();
        for join in &self.expr.joins {
            let Some(property) = &join.relation_property else {
                let table = join.table.clone().unwrap_or_default();
                out.push(format!(
                    "{} {} {} ON {}",
                    join.kind.sql(),
                    dialect.escape(&table),
                    dialect.escape(&join.alias),
                    join.condition.clone().unwrap_or_else(|| "1 = 1".to_string())
                ));
                continue;
            };
            let parent = self.expr.find_alias(&join.parent_alias)?;
            let AliasTarget::Entity(parent_id) = parent.target else {
                return Err(QuarryError::query_validation(format!(
                    "relation join '{property}' requires an entity alias parent"
                )));
            };
            let parent_meta = self.registry.get(parent_id);
            let relation = parent_meta
                .find_relation_with_property_path(property)
                .ok_or_else(|| QuarryError::RelationsNotFound {
                    entity: parent_meta.name.clone(),
                    paths: vec![property.clone()],
                })?;
            let target_meta = self.registry.get(relation.target);
            let target_table = dialect.escape(&target_meta.table_name);

            match relation.kind {
                RelationKind::ManyToMany => {
                    let junction = relation.junction.as_ref().ok_or_else(|| {
                        QuarryError::invalid_schema(
                            parent_meta.name.clone(),
                            format!("many-to-many '{property}' has no junction table"),
                        )
                    })?;
                    let junction_alias = format!("{}_junction", join.alias);
                    let mut on: Vec<String> = junction
                        .join_columns
                        .iter()
                        .map(|jc| {
                            format!(
                                "{}.{} = {}.{}",
                                dialect.escape(&junction_alias),
                                dialect.escape(&jc.name),
                                dialect.escape(&join.parent_alias),
                                dialect.escape(&jc.referenced_column)
                            )
                        })
                        .collect();
                    out.push(format!(
                        "{} {} {} ON {}",
                        join.kind.sql(),
                        dialect.escape(&junction.table_name),
                        dialect.escape(&junction_alias),
                        on.join(" AND ")
                    ));
                    on = junction
                        .inverse_join_columns
                        .iter()
                        .map(|jc| {
                            format!(
                                "{}.{} = {}.{}",
                                dialect.escape(&join.alias),
                                dialect.escape(&jc.referenced_column),
                                dialect.escape(&junction_alias),
                                dialect.escape(&jc.name)
                            )
                        })
                        .collect();
                    out.push(self.join_clause(ctx, join, &target_table, on)?);
                }
                _ if relation.is_owning => {
                    // Owning side: joined.pk = parent.fk
                    let on: Vec<String> = relation
                        .join_columns
                        .iter()
                        .map(|jc| {
                            format!(
                                "{}.{} = {}.{}",
                                dialect.escape(&join.alias),
                                dialect.escape(&jc.referenced_column),
                                dialect.escape(&join.parent_alias),
                                dialect.escape(&jc.name)
                            )
                        })
                        .collect();
                    out.push(self.join_clause(ctx, join, &target_table, on)?);
                }
                _ => {
                    // Inverse side: joined.fk = parent.pk
                    let on: Vec<String> = relation
                        .join_columns
                        .iter()
                        .map(|jc| {
                            format!(
                                "{}.{} = {}.{}",
                                dialect.escape(&join.alias),
                                dialect.escape(&jc.name),
                                dialect.escape(&join.parent_alias),
                                dialect.escape(&jc.referenced_column)
                            )
                        })
                        .collect();
                    out.push(self.join_clause(ctx, join, &target_table, on)?);
                }
            }
        }
        Ok(out)
    }

    fn join_clause(
        &self,
        ctx: &RenderCtx<'_>,
        join: &JoinAttribute,
        target_table: &str,
        mut on: Vec<String>,
    ) -> QuarryResult<String> {
        let dialect = ctx.dialect;
        // Soft-deleted rows stay invisible through joins too.
        if !self.expr.with_deleted {
            if let Ok(alias) = self.expr.find_alias(&join.alias) {
                if let AliasTarget::Entity(id) = alias.target {
                    if let Some(deleted) = self.registry.get(id).delete_date() {
                        on.push(format!(
                            "{}.{} IS NULL",
                            dialect.escape(&join.alias),
                            dialect.escape(&deleted.database_name)
                        ));
                    }
                }
            }
        }
        if let Some(extra) = &join.condition {
            on.push(extra.clone());
        }
        Ok(format!(
            "{} {} {} ON {}",
            join.kind.sql(),
            target_table,
            dialect.escape(&join.alias),
            on.join(" AND ")
        ))
    }

    /// Discriminator and soft-delete filters for the main alias plus the
    /// accumulated where tree.
    fn render_where_core(
        &self,
        ctx: &RenderCtx<'_>,
        sink: &mut ParamSink,
    ) -> QuarryResult<Vec<String>> {
        let dialect = ctx.dialect;
        let mut parts = Vec::new();
        if !self.expr.wheres.is_empty() {
            parts.push(format!(
                "({})",
                render_predicates(&self.expr.wheres, ctx, sink)?
            ));
        }
        if let Some(id) = self.main_entity() {
            let metadata = self.registry.get(id);
            if let Some(discriminator) = metadata.discriminator() {
                let values = self.registry.discriminator_values(id);
                if !values.is_empty() {
                    let placeholders: Vec<String> = values
                        .into_iter()
                        .map(|v| sink.bind(Value::Text(v)))
                        .collect();
                    parts.push(format!(
                        "{}.{} IN ({})",
                        dialect.escape(&self.main_alias_name()),
                        dialect.escape(&discriminator.database_name),
                        placeholders.join(", ")
                    ));
                }
            }
            if !self.expr.with_deleted {
                if let Some(deleted) = metadata.delete_date() {
                    parts.push(format!(
                        "{}.{} IS NULL",
                        dialect.escape(&self.main_alias_name()),
                        dialect.escape(&deleted.database_name)
                    ));
                }
            }
        }
        Ok(parts)
    }

    fn render_order_by(&self, ctx: &RenderCtx<'_>) -> QuarryResult<String> {
        let orders: Vec<String> = self
            .expr
            .order_bys
            .iter()
            .map(|o| {
                ctx.column_expr(&o.alias, &o.property)
                    .map(|c| format!("{} {}", c, o.direction.sql()))
            })
            .collect::<QuarryResult<_>>()?;
        Ok(orders.join(", "))
    }

    /// Root-entity pagination under a to-many join: restrict the root's
    /// primary key through a DISTINCT subquery carrying the same joins,
    /// filters, ordering and the take/skip window.
    fn render_id_subquery(
        &self,
        ctx: &RenderCtx<'_>,
        sink: &mut ParamSink,
        where_core: &[String],
    ) -> QuarryResult<String> {
        let dialect = ctx.dialect;
        let main = self
            .expr
            .main_alias
            .as_ref()
            .ok_or_else(|| QuarryError::query_validation("query has no main alias"))?;
        let Some(entity) = self.main_entity() else {
            return Err(QuarryError::query_validation(
                "take/skip pagination requires an entity main alias",
            ));
        };
        let metadata = self.registry.get(entity);
        let pk_exprs: Vec<String> = metadata
            .primary_columns()
            .map(|c| {
                format!(
                    "{}.{}",
                    dialect.escape(&main.name),
                    dialect.escape(&c.database_name)
                )
            })
            .collect();
        if pk_exprs.len() > 1 && dialect == crate::dialect::Dialect::Sqlite {
            return Err(QuarryError::query_validation(
                "take/skip with a composite primary key is not supported on sqlite",
            ));
        }

        // DISTINCT select lists must carry the ORDER BY expressions.
        let mut inner_select: Vec<String> = pk_exprs.clone();
        for order in &self.expr.order_bys {
            let expr = ctx.column_expr(&order.alias, &order.property)?;
            if !inner_select.contains(&expr) {
                inner_select.push(expr);
            }
        }

        let from = self.render_from(dialect, main)?;
        let joins = self.render_joins(ctx)?;
        let mut inner = format!("SELECT DISTINCT {} FROM {}", inner_select.join(", "), from);
        for join in &joins {
            inner.push(' ');
            inner.push_str(join);
        }
        // The inner query re-binds the same filters; parameters are
        // registered again in appearance order.
        let mut inner_where = Vec::new();
        if !self.expr.wheres.is_empty() {
            inner_where.push(format!(
                "({})",
                render_predicates(&self.expr.wheres, ctx, sink)?
            ));
        }
        for part in where_core.iter().skip(usize::from(!self.expr.wheres.is_empty())) {
            inner_where.push(part.clone());
        }
        if !inner_where.is_empty() {
            inner.push_str(" WHERE ");
            inner.push_str(&inner_where.join(" AND "));
        }
        if !self.expr.order_bys.is_empty() {
            inner.push_str(" ORDER BY ");
            inner.push_str(&self.render_order_by(ctx)?);
        }
        if let Some(take) = self.expr.take {
            inner.push_str(&format!(" LIMIT {take}"));
        }
        if let Some(skip) = self.expr.skip {
            inner.push_str(&format!(" OFFSET {skip}"));
        }

        let left = if pk_exprs.len() == 1 {
            pk_exprs[0].clone()
        } else {
            format!("({})", pk_exprs.join(", "))
        };
        Ok(format!("{left} IN ({inner})"))
    }

    fn selects_to_many(&self) -> bool {
        self.expr.joins.iter().any(|join| {
            if !join.and_select {
                return false;
            }
            let Some(property) = &join.relation_property else {
                return false;
            };
            let Ok(parent) = self.expr.find_alias(&join.parent_alias) else {
                return false;
            };
            let AliasTarget::Entity(id) = parent.target else {
                return false;
            };
            self.registry
                .get(id)
                .find_relation_with_property_path(property)
                .map(|r| r.kind.is_many())
                .unwrap_or(false)
        })
    }

    // ---- execution ----

    pub async fn get_raw_many(
        &self,
        runner: &mut dyn QueryRunner,
        dialect: crate::dialect::Dialect,
    ) -> QuarryResult<Vec<Row>> {
        let (sql, params) = self.get_query_and_parameters(dialect)?;
        debug!("query: {sql} -- parameters: {params:?}");
        runner
            .query(&sql, &params)
            .await
            .map_err(|e| e.with_query(sql, &params))
    }

    pub async fn get_many(
        &self,
        runner: &mut dyn QueryRunner,
        dialect: crate::dialect::Dialect,
    ) -> QuarryResult<Vec<EntityRef>> {
        let rows = self.get_raw_many(runner, dialect).await?;
        let transformer = RawSqlResultTransformer::new(&self.registry);
        transformer.transform(&rows, &self.expr)
    }

    pub async fn get_one(
        &self,
        runner: &mut dyn QueryRunner,
        dialect: crate::dialect::Dialect,
    ) -> QuarryResult<Option<EntityRef>> {
        let mut entities = self.get_many(runner, dialect).await?;
        if entities.is_empty() {
            Ok(None)
        } else {
            Ok(Some(entities.remove(0)))
        }
    }

    /// Count of distinct root entities matching the query.
    pub async fn get_count(
        &self,
        runner: &mut dyn QueryRunner,
        dialect: crate::dialect::Dialect,
    ) -> QuarryResult<u64> {
        let main = self
            .expr
            .main_alias
            .as_ref()
            .ok_or_else(|| QuarryError::query_validation("query has no main alias"))?;
        let entity = self
            .main_entity()
            .ok_or_else(|| QuarryError::query_validation("count requires an entity main alias"))?;
        let metadata = self.registry.get(entity);

        let ctx = RenderCtx {
            registry: &self.registry,
            dialect,
            expr: &self.expr,
        };
        let mut sink = ParamSink::new(&self.expr.parameters, self.expr.parameter_counter);

        let count_expr = if metadata.has_composite_primary_key() {
            "COUNT(*)".to_string()
        } else {
            let pk = metadata
                .primary_columns()
                .next()
                .ok_or_else(|| QuarryError::MissingPrimaryColumn {
                    entity: metadata.name.clone(),
                })?;
            format!(
                "COUNT(DISTINCT {}.{})",
                dialect.escape(&main.name),
                dialect.escape(&pk.database_name)
            )
        };

        let from = self.render_from(dialect, main)?;
        let joins = self.render_joins(&ctx)?;
        let where_parts = self.render_where_core(&ctx, &mut sink)?;
        let mut sql = format!("SELECT {count_expr} AS {} FROM {from}", dialect.escape("cnt"));
        for join in &joins {
            sql.push(' ');
            sql.push_str(join);
        }
        if !where_parts.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&where_parts.join(" AND "));
        }
        let named = sink.named;
        let (sql, params) =
            dialect.escape_query_with_parameters(&sql, &|name| named.get(name).cloned())?;
        debug!("query: {sql} -- parameters: {params:?}");
        let rows = runner
            .query(&sql, &params)
            .await
            .map_err(|e| e.with_query(sql, &params))?;
        Ok(rows
            .first()
            .and_then(|row| row.get("cnt"))
            .and_then(Value::as_int)
            .unwrap_or(0) as u64)
    }
}
