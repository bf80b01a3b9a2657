//! In-memory description of every mapped entity: columns, relations,
//! indices, inheritance. Built once from explicit [`EntitySchema`]
//! declarations, immutable afterwards, and shared read-only across all
//! concurrent operations.
//!
//! All [`EntityMetadata`] lives in one arena owned by the registry;
//! relations hold [`EntityId`] handles into that arena rather than owning
//! references, so cyclic and self-referencing entity graphs need no special
//! ownership treatment.

mod schema;

pub use schema::{ColumnSchema, EntitySchema, RelationSchema};

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::entity::{EntityInstance, EntityRef};
use crate::error::{QuarryError, QuarryResult};
use crate::value::{ColumnType, Value};

/// Handle to an [`EntityMetadata`] inside the registry arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationStrategy {
    /// Database auto-increment.
    Increment,
    /// Client-side UUID generated before insert.
    Uuid,
    /// Driver-assigned row id.
    RowId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpecialColumn {
    CreateDate,
    UpdateDate,
    DeleteDate,
    Version,
}

/// Bidirectional value mapping applied between entity properties and
/// database columns.
#[derive(Clone)]
pub struct ValueTransformer {
    pub to_database: Arc<dyn Fn(Value) -> Value + Send + Sync>,
    pub from_database: Arc<dyn Fn(Value) -> Value + Send + Sync>,
}

impl std::fmt::Debug for ValueTransformer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ValueTransformer")
    }
}

/// One mapped property-to-column pairing.
#[derive(Debug, Clone)]
pub struct ColumnMetadata {
    pub property_name: String,
    pub database_name: String,
    pub column_type: ColumnType,
    pub is_primary: bool,
    pub is_generated: bool,
    pub generation_strategy: Option<GenerationStrategy>,
    pub is_nullable: bool,
    pub length: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub default: Option<Value>,
    pub is_array: bool,
    pub transformer: Option<ValueTransformer>,
    pub is_discriminator: bool,
    pub special: Option<SpecialColumn>,
}

impl ColumnMetadata {
    /// Run the property value through the transformer and the type coercion
    /// used when writing to the database.
    pub fn prepare_persistent_value(&self, value: Value) -> QuarryResult<Value> {
        let value = match &self.transformer {
            Some(t) => (t.to_database)(value),
            None => value,
        };
        self.column_type
            .prepare_persistent(value, &self.property_name)
    }

    /// Reverse of [`Self::prepare_persistent_value`] for hydration.
    pub fn prepare_hydrated_value(&self, value: Value) -> QuarryResult<Value> {
        let value = self.column_type.prepare_hydrated(value, &self.property_name)?;
        Ok(match &self.transformer {
            Some(t) => (t.from_database)(value),
            None => value,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToOne,
    ManyToMany,
}

impl RelationKind {
    /// Whether the relation property holds a sequence of instances.
    pub fn is_many(self) -> bool {
        matches!(self, RelationKind::OneToMany | RelationKind::ManyToMany)
    }
}

/// A foreign-key column pairing: `name` on the owning (or junction) table
/// references `referenced_column` on the target table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinColumn {
    pub name: String,
    pub referenced_column: String,
}

/// The implicit (or explicitly mapped) table materialized for a
/// many-to-many relation.
#[derive(Debug, Clone)]
pub struct JunctionMetadata {
    pub table_name: String,
    /// Junction columns referencing the owning side's primary key.
    pub join_columns: Vec<JoinColumn>,
    /// Junction columns referencing the inverse side's primary key.
    pub inverse_join_columns: Vec<JoinColumn>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeFlags {
    pub insert: bool,
    pub update: bool,
    pub remove: bool,
    pub soft_remove: bool,
    pub recover: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentialAction {
    NoAction,
    Cascade,
    SetNull,
    Restrict,
}

#[derive(Debug, Clone)]
pub struct RelationMetadata {
    pub property_name: String,
    pub kind: RelationKind,
    pub source: EntityId,
    pub target: EntityId,
    /// Exactly one side of a bidirectional relation is owning: the side
    /// holding the foreign key columns or the junction table.
    pub is_owning: bool,
    /// Foreign-key columns on the source table (owning many-to-one and
    /// one-to-one only).
    pub join_columns: Vec<JoinColumn>,
    /// Present on the owning side of a many-to-many.
    pub junction: Option<JunctionMetadata>,
    pub inverse_property: Option<String>,
    pub cascade: CascadeFlags,
    pub on_delete: ReferentialAction,
    pub on_update: ReferentialAction,
    pub is_eager: bool,
    /// All foreign-key columns of the owning side are nullable, so insert
    /// ordering may break a cycle through this relation.
    pub is_nullable: bool,
}

#[derive(Debug, Clone)]
pub struct IndexMetadata {
    pub name: String,
    pub columns: Vec<String>,
    pub is_unique: bool,
}

#[derive(Debug, Clone)]
pub struct CheckMetadata {
    pub name: String,
    pub expression: String,
}

/// One mapped entity: pure data plus derived accessors. Lookup maps are
/// built once at registry build time so every path lookup is O(1).
#[derive(Debug, Clone)]
pub struct EntityMetadata {
    pub id: EntityId,
    pub name: String,
    pub table_name: String,
    pub schema: Option<String>,
    pub database: Option<String>,
    pub columns: Vec<ColumnMetadata>,
    pub relations: Vec<RelationMetadata>,
    pub indices: Vec<IndexMetadata>,
    pub checks: Vec<CheckMetadata>,
    pub primary_columns: Vec<usize>,
    pub discriminator_column: Option<usize>,
    pub discriminator_value: Option<String>,
    pub parent: Option<EntityId>,
    pub children: Vec<EntityId>,
    pub create_date_column: Option<usize>,
    pub update_date_column: Option<usize>,
    pub delete_date_column: Option<usize>,
    pub version_column: Option<usize>,
    column_by_property: HashMap<String, usize>,
    column_by_database_name: HashMap<String, usize>,
    relation_by_property: HashMap<String, usize>,
}

impl EntityMetadata {
    pub(crate) fn index_lookups(&mut self) {
        self.column_by_property = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.property_name.clone(), i))
            .collect();
        self.column_by_database_name = self
            .columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.database_name.clone(), i))
            .collect();
        self.relation_by_property = self
            .relations
            .iter()
            .enumerate()
            .map(|(i, r)| (r.property_name.clone(), i))
            .collect();
        self.primary_columns = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_primary)
            .map(|(i, _)| i)
            .collect();
    }

    pub fn find_column_with_property_path(&self, path: &str) -> Option<&ColumnMetadata> {
        self.column_by_property.get(path).map(|&i| &self.columns[i])
    }

    pub fn find_column_with_database_name(&self, name: &str) -> Option<&ColumnMetadata> {
        self.column_by_database_name
            .get(name)
            .map(|&i| &self.columns[i])
    }

    pub fn find_relation_with_property_path(&self, path: &str) -> Option<&RelationMetadata> {
        self.relation_by_property
            .get(path)
            .map(|&i| &self.relations[i])
    }

    pub fn primary_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.primary_columns.iter().map(|&i| &self.columns[i])
    }

    pub fn has_composite_primary_key(&self) -> bool {
        self.primary_columns.len() > 1
    }

    pub fn create_date(&self) -> Option<&ColumnMetadata> {
        self.create_date_column.map(|i| &self.columns[i])
    }

    pub fn update_date(&self) -> Option<&ColumnMetadata> {
        self.update_date_column.map(|i| &self.columns[i])
    }

    pub fn delete_date(&self) -> Option<&ColumnMetadata> {
        self.delete_date_column.map(|i| &self.columns[i])
    }

    pub fn version(&self) -> Option<&ColumnMetadata> {
        self.version_column.map(|i| &self.columns[i])
    }

    pub fn discriminator(&self) -> Option<&ColumnMetadata> {
        self.discriminator_column.map(|i| &self.columns[i])
    }

    /// Primary-key value map of an instance, or `None` when any primary
    /// property is missing or null (a new, never-inserted entity).
    pub fn entity_id_map(&self, instance: &EntityInstance) -> Option<BTreeMap<String, Value>> {
        let mut map = BTreeMap::new();
        for column in self.primary_columns() {
            let value = instance.scalar(&column.property_name);
            if value.is_null() {
                return None;
            }
            map.insert(column.property_name.clone(), value);
        }
        if map.is_empty() {
            None
        } else {
            Some(map)
        }
    }

    /// Primary-key equality of two instances. Instances without a complete
    /// identifier never compare equal.
    pub fn compare_entities(&self, a: &EntityInstance, b: &EntityInstance) -> bool {
        match (self.entity_id_map(a), self.entity_id_map(b)) {
            (Some(ia), Some(ib)) => ia == ib,
            _ => false,
        }
    }

    /// Columns that participate in inserts/updates: everything except
    /// discriminator bookkeeping is handled by the caller.
    pub fn non_generated_columns(&self) -> impl Iterator<Item = &ColumnMetadata> {
        self.columns.iter().filter(|c| !c.is_generated)
    }
}

/// Immutable registry of all entity metadata, shared by reference into
/// every component. Replaces decorator-driven global registries with an
/// explicit build step.
#[derive(Debug)]
pub struct MetadataRegistry {
    entities: Vec<EntityMetadata>,
    by_name: HashMap<String, EntityId>,
}

impl MetadataRegistry {
    pub(crate) fn from_parts(
        entities: Vec<EntityMetadata>,
        by_name: HashMap<String, EntityId>,
    ) -> Self {
        Self { entities, by_name }
    }

    /// Build a registry from explicit schema declarations, resolving
    /// relation targets, inverse sides and junction tables, and validating
    /// every metadata invariant. See [`EntitySchema`].
    pub fn build(schemas: Vec<EntitySchema>) -> QuarryResult<Self> {
        schema::build_registry(schemas)
    }

    pub fn get(&self, id: EntityId) -> &EntityMetadata {
        &self.entities[id.0]
    }

    pub fn get_by_name(&self, name: &str) -> QuarryResult<&EntityMetadata> {
        self.id_of(name).map(|id| self.get(id))
    }

    pub fn id_of(&self, name: &str) -> QuarryResult<EntityId> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| QuarryError::EntityMetadataNotFound {
                target: name.to_string(),
            })
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityMetadata> {
        self.entities.iter()
    }

    /// Create a new bare instance for a metadata, dispatching to the child
    /// metadata whose discriminator value matches when the entity is a
    /// single-table inheritance root.
    pub fn create_instance(
        &self,
        id: EntityId,
        discriminator_value: Option<&str>,
    ) -> EntityInstance {
        let metadata = self.get(id);
        if let Some(value) = discriminator_value {
            if let Some(child) = self
                .children_of(id)
                .find(|c| c.discriminator_value.as_deref() == Some(value))
            {
                let mut instance = EntityInstance::new(child.id);
                if let Some(disc) = child.discriminator() {
                    instance.set(
                        disc.property_name.clone(),
                        Value::Text(value.to_string()),
                    );
                }
                return instance;
            }
        }
        let mut instance = EntityInstance::new(id);
        if let (Some(disc), Some(value)) = (metadata.discriminator(), &metadata.discriminator_value)
        {
            instance.set(disc.property_name.clone(), Value::Text(value.clone()));
        }
        instance
    }

    fn children_of(&self, id: EntityId) -> impl Iterator<Item = &EntityMetadata> {
        self.get(id).children.iter().map(|&c| self.get(c))
    }

    /// All discriminator values valid for a query against `id`: its own
    /// plus every child's (inheritance dispatch happens at hydration).
    pub fn discriminator_values(&self, id: EntityId) -> Vec<String> {
        let metadata = self.get(id);
        let mut values: Vec<String> = metadata.discriminator_value.iter().cloned().collect();
        for child in self.children_of(id) {
            values.extend(child.discriminator_value.iter().cloned());
        }
        values
    }

    /// Resolve the identifier map of a related instance referenced by an
    /// owning relation, keyed by referenced database column name.
    pub fn related_id_by_database_name(
        &self,
        relation: &RelationMetadata,
        related: &EntityRef,
    ) -> Option<BTreeMap<String, Value>> {
        let target = self.get(relation.target);
        let instance = related.read().expect("entity lock poisoned");
        let mut map = BTreeMap::new();
        for column in target.primary_columns() {
            let value = instance.scalar(&column.property_name);
            if value.is_null() {
                return None;
            }
            map.insert(column.database_name.clone(), value);
        }
        Some(map)
    }
}

/// Extract the foreign-key property values an owning relation would write,
/// reading through the relation slot if present, else the raw FK columns.
pub fn owning_fk_values(
    registry: &MetadataRegistry,
    metadata: &EntityMetadata,
    relation: &RelationMetadata,
    instance: &EntityInstance,
) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    if instance.has_relation(&relation.property_name) {
        let related = instance.relation_one(&relation.property_name);
        match related {
            Some(related) => {
                let target = self_target(registry, relation);
                let related = related.read().expect("entity lock poisoned");
                for jc in &relation.join_columns {
                    let value = target
                        .find_column_with_database_name(&jc.referenced_column)
                        .map(|c| related.scalar(&c.property_name))
                        .unwrap_or(Value::Null);
                    out.push((jc.name.clone(), value));
                }
            }
            None => {
                for jc in &relation.join_columns {
                    out.push((jc.name.clone(), Value::Null));
                }
            }
        }
    } else {
        for jc in &relation.join_columns {
            let value = metadata
                .find_column_with_database_name(&jc.name)
                .map(|c| instance.scalar(&c.property_name))
                .unwrap_or(Value::Null);
            out.push((jc.name.clone(), value));
        }
    }
    out
}

fn self_target<'a>(
    registry: &'a MetadataRegistry,
    relation: &RelationMetadata,
) -> &'a EntityMetadata {
    registry.get(relation.target)
}
