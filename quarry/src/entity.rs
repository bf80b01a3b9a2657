use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::metadata::EntityId;
use crate::value::Value;

/// A property slot on a runtime entity instance: either a scalar column
/// value or a relation holding other instances.
#[derive(Debug, Clone)]
pub enum PropValue {
    Scalar(Value),
    One(Option<EntityRef>),
    Many(Vec<EntityRef>),
}

impl PropValue {
    pub fn as_scalar(&self) -> Option<&Value> {
        match self {
            PropValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn one(item: EntityRef) -> Self {
        PropValue::One(Some(item))
    }

    pub fn many(items: Vec<EntityRef>) -> Self {
        PropValue::Many(items)
    }
}

impl From<Value> for PropValue {
    fn from(v: Value) -> Self {
        PropValue::Scalar(v)
    }
}

/// One in-memory entity instance: a dynamic bag of properties described by
/// the entity's metadata. The persistence planner and hydrator both operate
/// on this shape; how an application maps it onto concrete structs is a
/// reflection detail outside the core.
#[derive(Debug, Clone)]
pub struct EntityInstance {
    pub entity: EntityId,
    pub props: BTreeMap<String, PropValue>,
}

impl EntityInstance {
    pub fn new(entity: EntityId) -> Self {
        Self {
            entity,
            props: BTreeMap::new(),
        }
    }

    pub fn set(&mut self, property: impl Into<String>, value: impl Into<PropValue>) -> &mut Self {
        self.props.insert(property.into(), value.into());
        self
    }

    pub fn get(&self, property: &str) -> Option<&PropValue> {
        self.props.get(property)
    }

    /// Scalar value of a property; `Value::Null` when the slot is absent.
    pub fn scalar(&self, property: &str) -> Value {
        match self.props.get(property) {
            Some(PropValue::Scalar(v)) => v.clone(),
            _ => Value::Null,
        }
    }

    pub fn relation_one(&self, property: &str) -> Option<EntityRef> {
        match self.props.get(property) {
            Some(PropValue::One(v)) => v.clone(),
            _ => None,
        }
    }

    pub fn relation_many(&self, property: &str) -> Vec<EntityRef> {
        match self.props.get(property) {
            Some(PropValue::Many(v)) => v.clone(),
            _ => Vec::new(),
        }
    }

    /// Whether the relation slot is present at all. An absent slot means
    /// "untouched" and must not be diffed; an empty `Many` means "cleared".
    pub fn has_relation(&self, property: &str) -> bool {
        matches!(
            self.props.get(property),
            Some(PropValue::One(_) | PropValue::Many(_))
        )
    }
}

/// Shared handle to an entity instance. Object identity (`Arc::ptr_eq`) is
/// what the persistence planner de-duplicates subjects by and what generated
/// keys propagate through.
pub type EntityRef = Arc<RwLock<EntityInstance>>;

pub fn entity_ref(instance: EntityInstance) -> EntityRef {
    Arc::new(RwLock::new(instance))
}

pub fn same_instance(a: &EntityRef, b: &EntityRef) -> bool {
    Arc::ptr_eq(a, b)
}

/// Read a snapshot of an instance without holding the lock across awaits.
pub fn snapshot(entity: &EntityRef) -> EntityInstance {
    entity.read().expect("entity lock poisoned").clone()
}
