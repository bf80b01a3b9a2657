//! A subject is one entity scheduled into a persistence operation, carrying
//! everything the executor needs: the operation kind, the database copy
//! loaded for diffing, the changed columns, and junction row changes.

use std::collections::BTreeMap;

use crate::entity::{EntityInstance, EntityRef};
use crate::metadata::{EntityId, MetadataRegistry};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubjectOperation {
    Insert,
    Update,
    Remove,
    SoftRemove,
    Recover,
}

/// One junction-table column value: either resolved at planning time (row
/// removals diffed from the database) or read off an entity after inserts
/// have written generated keys back.
#[derive(Debug, Clone)]
pub enum JunctionValue {
    Resolved(Value),
    /// Entity plus the referenced database column to read from it.
    FromEntity(EntityRef, String),
}

/// One junction-table row to insert or delete, keyed by database column
/// name.
#[derive(Debug, Clone)]
pub struct JunctionChange {
    pub table: String,
    pub remove: bool,
    pub values: Vec<(String, JunctionValue)>,
}

pub struct Subject {
    pub entity: EntityRef,
    pub metadata: EntityId,
    pub operation: SubjectOperation,
    /// The row currently in the database, when one was found for the
    /// subject's identifier. Present for updates, absent for inserts.
    pub database_entity: Option<EntityInstance>,
    /// Property name -> new value; scalar differences only. For inserts
    /// the executor derives the full row from the instance at execution
    /// time, after parent keys exist.
    pub changed_columns: Vec<(String, Value)>,
    /// Owning relation properties whose foreign key columns must be
    /// written; resolved at execution time.
    pub changed_relations: Vec<String>,
    pub junction_changes: Vec<JunctionChange>,
}

impl Subject {
    pub fn new(entity: EntityRef, metadata: EntityId, operation: SubjectOperation) -> Self {
        Self {
            entity,
            metadata,
            operation,
            database_entity: None,
            changed_columns: Vec::new(),
            changed_relations: Vec::new(),
            junction_changes: Vec::new(),
        }
    }

    /// The subject's identifier map (property name -> value), if every
    /// primary key column carries a non-null value.
    pub fn identifier(&self, registry: &MetadataRegistry) -> Option<BTreeMap<String, Value>> {
        let instance = self.entity.read().ok()?;
        registry.get(self.metadata).entity_id_map(&instance)
    }

    pub fn has_identifier(&self, registry: &MetadataRegistry) -> bool {
        self.identifier(registry).is_some()
    }
}
