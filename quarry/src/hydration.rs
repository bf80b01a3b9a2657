//! Raw result hydration: folds the flat, aliased rows a joined SELECT
//! produces back into entity instances with nested relations. Pure over its
//! inputs; grouping follows the same column-aliasing scheme the renderer
//! writes.

use std::collections::HashMap;

use crate::driver::Row;
use crate::entity::{entity_ref, EntityInstance, EntityRef, PropValue};
use crate::error::{QuarryError, QuarryResult};
use crate::metadata::{EntityId, MetadataRegistry};
use crate::query::{column_alias, AliasTarget, JoinAttribute, QueryExpressionMap};
use crate::value::Value;

pub struct RawSqlResultTransformer<'a> {
    registry: &'a MetadataRegistry,
}

impl<'a> RawSqlResultTransformer<'a> {
    pub fn new(registry: &'a MetadataRegistry) -> Self {
        Self { registry }
    }

    /// Transform raw rows into root entities. Rows sharing the root's
    /// primary key values collapse into one instance; each selected to-many
    /// join contributes to that instance's collection, deduplicated by the
    /// joined entity's key.
    pub fn transform(
        &self,
        rows: &[Row],
        expr: &QueryExpressionMap,
    ) -> QuarryResult<Vec<EntityRef>> {
        let main = expr
            .main_alias
            .as_ref()
            .ok_or_else(|| QuarryError::query_validation("query has no main alias"))?;
        let AliasTarget::Entity(entity) = main.target else {
            return Err(QuarryError::query_validation(
                "raw-table queries cannot hydrate entities",
            ));
        };
        // Parent alias -> selected relation joins under it.
        let mut children: HashMap<&str, Vec<&JoinAttribute>> = HashMap::new();
        for join in &expr.joins {
            if join.and_select && join.relation_property.is_some() {
                children
                    .entry(join.parent_alias.as_str())
                    .or_default()
                    .push(join);
            }
        }
        let row_refs: Vec<&Row> = rows.iter().collect();
        self.hydrate_alias(&main.name, entity, &row_refs, expr, &children)
    }

    fn hydrate_alias(
        &self,
        alias: &str,
        entity: EntityId,
        rows: &[&Row],
        expr: &QueryExpressionMap,
        children: &HashMap<&str, Vec<&JoinAttribute>>,
    ) -> QuarryResult<Vec<EntityRef>> {
        let metadata = self.registry.get(entity);
        let pk_keys: Vec<String> = metadata
            .primary_columns()
            .map(|c| column_alias(alias, &c.database_name))
            .collect();

        // Group rows by primary key values. Rows missing a key column fall
        // back to one-entity-per-row; rows whose key is entirely null are
        // unmatched join slots and drop.
        let mut groups: Vec<(Option<Vec<Value>>, Vec<&Row>)> = Vec::new();
        for row in rows {
            let mut key = Vec::with_capacity(pk_keys.len());
            let mut missing = false;
            for k in &pk_keys {
                match row.get(k) {
                    Some(v) => key.push(v.clone()),
                    None => {
                        missing = true;
                        break;
                    }
                }
            }
            if missing || pk_keys.is_empty() {
                if self.alias_all_null(alias, metadata.id, row) {
                    continue;
                }
                groups.push((None, vec![row]));
                continue;
            }
            if key.iter().all(Value::is_null) {
                continue;
            }
            match groups
                .iter_mut()
                .find(|(k, _)| k.as_ref() == Some(&key))
            {
                Some((_, members)) => members.push(row),
                None => groups.push((Some(key), vec![row])),
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for (_, members) in groups {
            out.push(self.hydrate_group(alias, entity, &members, expr, children)?);
        }
        Ok(out)
    }

    fn hydrate_group(
        &self,
        alias: &str,
        entity: EntityId,
        rows: &[&Row],
        expr: &QueryExpressionMap,
        children: &HashMap<&str, Vec<&JoinAttribute>>,
    ) -> QuarryResult<EntityRef> {
        let metadata = self.registry.get(entity);
        let first = rows[0];

        // Single-table inheritance dispatch by discriminator value.
        let discriminator_value = metadata.discriminator().and_then(|disc| {
            first
                .get(&column_alias(alias, &disc.database_name))
                .and_then(|v| v.as_text().map(str::to_string))
        });
        let mut instance = self
            .registry
            .create_instance(entity, discriminator_value.as_deref());
        let actual = self.registry.get(instance.entity);

        for column in &actual.columns {
            let key = column_alias(alias, &column.database_name);
            if let Some(value) = first.get(&key) {
                let hydrated = column.prepare_hydrated_value(value.clone())?;
                instance.set(column.property_name.clone(), hydrated);
            }
        }

        let entity_handle = entity_ref(instance);
        if let Some(joins) = children.get(alias) {
            for join in joins {
                let property = join
                    .relation_property
                    .as_deref()
                    .unwrap_or_default();
                let relation = metadata
                    .find_relation_with_property_path(property)
                    .ok_or_else(|| QuarryError::RelationsNotFound {
                        entity: metadata.name.clone(),
                        paths: vec![property.to_string()],
                    })?;
                let target = match expr.find_alias(&join.alias)?.target {
                    AliasTarget::Entity(id) => id,
                    AliasTarget::Table(_) => continue,
                };
                let related =
                    self.hydrate_alias(&join.alias, target, rows, expr, children)?;
                let slot = if relation.kind.is_many() {
                    PropValue::Many(related)
                } else {
                    PropValue::One(related.into_iter().next())
                };
                entity_handle
                    .write()
                    .map_err(|_| QuarryError::driver("entity lock poisoned"))?
                    .set(relation.property_name.clone(), slot);
            }
        }
        Ok(entity_handle)
    }

    /// Whether every selected column of this alias is null in the row.
    fn alias_all_null(&self, alias: &str, entity: EntityId, row: &Row) -> bool {
        let metadata = self.registry.get(entity);
        let mut saw_any = false;
        for column in &metadata.columns {
            if let Some(value) = row.get(&column_alias(alias, &column.database_name)) {
                saw_any = true;
                if !value.is_null() {
                    return false;
                }
            }
        }
        saw_any
    }
}

/// Serialize an entity (with its loaded relations) into a JSON document.
/// Already-visited instances render as their identifier map so cycles
/// terminate.
pub fn to_document(registry: &MetadataRegistry, entity: &EntityRef) -> serde_json::Value {
    let mut visited: Vec<EntityRef> = Vec::new();
    document_inner(registry, entity, &mut visited)
}

fn document_inner(
    registry: &MetadataRegistry,
    entity: &EntityRef,
    visited: &mut Vec<EntityRef>,
) -> serde_json::Value {
    use crate::entity::same_instance;

    let instance = match entity.read() {
        Ok(guard) => guard.clone(),
        Err(_) => return serde_json::Value::Null,
    };
    let metadata = registry.get(instance.entity);
    if visited.iter().any(|v| same_instance(v, entity)) {
        let id = metadata.entity_id_map(&instance).unwrap_or_default();
        return serde_json::Value::Object(
            id.into_iter()
                .map(|(k, v)| (k, value_to_json(&v)))
                .collect(),
        );
    }
    visited.push(entity.clone());

    let mut out = serde_json::Map::new();
    for (property, slot) in &instance.props {
        match slot {
            PropValue::Scalar(value) => {
                out.insert(property.clone(), value_to_json(value));
            }
            PropValue::One(Some(related)) => {
                out.insert(property.clone(), document_inner(registry, related, visited));
            }
            PropValue::One(None) => {
                out.insert(property.clone(), serde_json::Value::Null);
            }
            PropValue::Many(related) => {
                out.insert(
                    property.clone(),
                    serde_json::Value::Array(
                        related
                            .iter()
                            .map(|r| document_inner(registry, r, visited))
                            .collect(),
                    ),
                );
            }
        }
    }
    serde_json::Value::Object(out)
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::Number((*i).into()),
        Value::Float(f) => serde_json::Number::from_f64(*f)
            .map(serde_json::Value::Number)
            .unwrap_or(serde_json::Value::Null),
        Value::Decimal(d) => serde_json::Value::String(d.to_string()),
        Value::Text(s) => serde_json::Value::String(s.clone()),
        Value::Bytes(b) => serde_json::Value::Array(
            b.iter().map(|x| serde_json::Value::Number((*x).into())).collect(),
        ),
        Value::Uuid(u) => serde_json::Value::String(u.to_string()),
        Value::DateTime(dt) => serde_json::Value::String(dt.to_rfc3339()),
        Value::Json(j) => j.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn value_to_json_keeps_embedded_json() {
        let json = Value::Json(serde_json::json!({"a": 1}));
        assert_eq!(value_to_json(&json), serde_json::json!({"a": 1}));
    }

    #[test]
    fn float_to_json_handles_nan() {
        assert_eq!(value_to_json(&Value::Float(f64::NAN)), serde_json::Value::Null);
    }
}
