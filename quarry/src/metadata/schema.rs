//! Explicit metadata declaration API. Applications describe entities with
//! fluent schema literals and hand them to [`MetadataRegistry::build`] once
//! at startup; there is no decorator magic and no ambient global state.

use std::collections::{HashMap, HashSet};

use crate::error::{QuarryError, QuarryResult};
use crate::metadata::{
    CascadeFlags, CheckMetadata, ColumnMetadata, EntityId, EntityMetadata, GenerationStrategy,
    IndexMetadata, JoinColumn, JunctionMetadata, MetadataRegistry, ReferentialAction,
    RelationKind, RelationMetadata, SpecialColumn, ValueTransformer,
};
use crate::value::{ColumnType, Value};

/// Declaration of one mapped column.
#[derive(Debug, Clone)]
pub struct ColumnSchema {
    property_name: String,
    database_name: Option<String>,
    column_type: ColumnType,
    is_primary: bool,
    is_generated: bool,
    generation_strategy: Option<GenerationStrategy>,
    is_nullable: bool,
    length: Option<u32>,
    precision: Option<u32>,
    scale: Option<u32>,
    default: Option<Value>,
    is_array: bool,
    transformer: Option<ValueTransformer>,
    special: Option<SpecialColumn>,
}

impl ColumnSchema {
    pub fn new(property: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            property_name: property.into(),
            database_name: None,
            column_type,
            is_primary: false,
            is_generated: false,
            generation_strategy: None,
            is_nullable: false,
            length: None,
            precision: None,
            scale: None,
            default: None,
            is_array: false,
            transformer: None,
            special: None,
        }
    }

    pub fn int(property: impl Into<String>) -> Self {
        Self::new(property, ColumnType::Int)
    }

    pub fn text(property: impl Into<String>) -> Self {
        Self::new(property, ColumnType::Text)
    }

    pub fn bool(property: impl Into<String>) -> Self {
        Self::new(property, ColumnType::Bool)
    }

    pub fn datetime(property: impl Into<String>) -> Self {
        Self::new(property, ColumnType::DateTime)
    }

    pub fn json(property: impl Into<String>) -> Self {
        Self::new(property, ColumnType::Json)
    }

    pub fn uuid(property: impl Into<String>) -> Self {
        Self::new(property, ColumnType::Uuid)
    }

    /// Auto-increment integer primary key.
    pub fn primary_generated(property: impl Into<String>) -> Self {
        Self::int(property)
            .primary()
            .generated(GenerationStrategy::Increment)
    }

    pub fn database_name(mut self, name: impl Into<String>) -> Self {
        self.database_name = Some(name.into());
        self
    }

    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    pub fn generated(mut self, strategy: GenerationStrategy) -> Self {
        self.is_generated = true;
        self.generation_strategy = Some(strategy);
        self
    }

    pub fn nullable(mut self) -> Self {
        self.is_nullable = true;
        self
    }

    pub fn length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    pub fn precision(mut self, precision: u32, scale: u32) -> Self {
        self.precision = Some(precision);
        self.scale = Some(scale);
        self
    }

    pub fn default_value(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn array(mut self) -> Self {
        self.is_array = true;
        self
    }

    pub fn transformer(mut self, transformer: ValueTransformer) -> Self {
        self.transformer = Some(transformer);
        self
    }

    pub fn create_date(mut self) -> Self {
        self.special = Some(SpecialColumn::CreateDate);
        self
    }

    pub fn update_date(mut self) -> Self {
        self.special = Some(SpecialColumn::UpdateDate);
        self
    }

    /// Marks the soft-delete timestamp column; implies nullable.
    pub fn delete_date(mut self) -> Self {
        self.special = Some(SpecialColumn::DeleteDate);
        self.is_nullable = true;
        self
    }

    pub fn version(mut self) -> Self {
        self.special = Some(SpecialColumn::Version);
        self
    }

    fn into_metadata(self, entity: &str) -> QuarryResult<ColumnMetadata> {
        if self.is_generated && self.default.is_some() {
            return Err(QuarryError::invalid_schema(
                entity,
                format!(
                    "column '{}' is generated and cannot also specify a default",
                    self.property_name
                ),
            ));
        }
        if matches!(self.special, Some(SpecialColumn::Version))
            && self.column_type != ColumnType::Int
        {
            return Err(QuarryError::invalid_schema(
                entity,
                format!("version column '{}' must be an int", self.property_name),
            ));
        }
        let database_name = self
            .database_name
            .unwrap_or_else(|| self.property_name.clone());
        Ok(ColumnMetadata {
            property_name: self.property_name,
            database_name,
            column_type: self.column_type,
            is_primary: self.is_primary,
            is_generated: self.is_generated,
            generation_strategy: self.generation_strategy,
            is_nullable: self.is_nullable,
            length: self.length,
            precision: self.precision,
            scale: self.scale,
            default: self.default,
            is_array: self.is_array,
            transformer: self.transformer,
            is_discriminator: false,
            special: self.special,
        })
    }
}

/// Declaration of one relation between entities.
#[derive(Debug, Clone)]
pub struct RelationSchema {
    property_name: String,
    kind: RelationKind,
    target: String,
    join_columns: Vec<JoinColumn>,
    junction_table: Option<String>,
    inverse_property: Option<String>,
    cascade: CascadeFlags,
    on_delete: ReferentialAction,
    on_update: ReferentialAction,
    is_eager: bool,
    is_owner: bool,
    is_required: bool,
}

impl RelationSchema {
    fn new(property: impl Into<String>, kind: RelationKind, target: impl Into<String>) -> Self {
        Self {
            property_name: property.into(),
            kind,
            target: target.into(),
            join_columns: Vec::new(),
            junction_table: None,
            inverse_property: None,
            cascade: CascadeFlags::default(),
            on_delete: ReferentialAction::NoAction,
            on_update: ReferentialAction::NoAction,
            is_eager: false,
            is_owner: false,
            is_required: false,
        }
    }

    pub fn many_to_one(property: impl Into<String>, target: impl Into<String>) -> Self {
        let mut relation = Self::new(property, RelationKind::ManyToOne, target);
        relation.is_owner = true;
        relation
    }

    /// The inverse property names the owning many-to-one on the target.
    pub fn one_to_many(
        property: impl Into<String>,
        target: impl Into<String>,
        inverse: impl Into<String>,
    ) -> Self {
        let mut relation = Self::new(property, RelationKind::OneToMany, target);
        relation.inverse_property = Some(inverse.into());
        relation
    }

    pub fn one_to_one(property: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(property, RelationKind::OneToOne, target)
    }

    pub fn many_to_many(property: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(property, RelationKind::ManyToMany, target)
    }

    /// Explicit foreign-key column pairing; defaults to
    /// `{property}_{referenced pk}` referencing the target's primary key.
    pub fn join_column(
        mut self,
        name: impl Into<String>,
        referenced: impl Into<String>,
    ) -> Self {
        self.join_columns.push(JoinColumn {
            name: name.into(),
            referenced_column: referenced.into(),
        });
        self
    }

    pub fn junction_table(mut self, table: impl Into<String>) -> Self {
        self.junction_table = Some(table.into());
        self.is_owner = true;
        self
    }

    pub fn inverse(mut self, property: impl Into<String>) -> Self {
        self.inverse_property = Some(property.into());
        self
    }

    /// Marks this side as the owner (holds the FK / junction table).
    pub fn owner(mut self) -> Self {
        self.is_owner = true;
        self
    }

    /// Non-nullable foreign key: the related entity must exist first.
    pub fn required(mut self) -> Self {
        self.is_required = true;
        self
    }

    pub fn eager(mut self) -> Self {
        self.is_eager = true;
        self
    }

    pub fn cascade_insert(mut self) -> Self {
        self.cascade.insert = true;
        self
    }

    pub fn cascade_update(mut self) -> Self {
        self.cascade.update = true;
        self
    }

    pub fn cascade_remove(mut self) -> Self {
        self.cascade.remove = true;
        self
    }

    pub fn cascade_soft_remove(mut self) -> Self {
        self.cascade.soft_remove = true;
        self
    }

    pub fn cascade_recover(mut self) -> Self {
        self.cascade.recover = true;
        self
    }

    /// insert + update + remove + soft-remove + recover.
    pub fn cascade_all(mut self) -> Self {
        self.cascade = CascadeFlags {
            insert: true,
            update: true,
            remove: true,
            soft_remove: true,
            recover: true,
        };
        self
    }

    pub fn on_delete(mut self, action: ReferentialAction) -> Self {
        self.on_delete = action;
        self
    }

    pub fn on_update(mut self, action: ReferentialAction) -> Self {
        self.on_update = action;
        self
    }
}

/// Declaration of one entity, consumed by [`MetadataRegistry::build`].
#[derive(Debug, Clone)]
pub struct EntitySchema {
    name: String,
    table_name: String,
    schema: Option<String>,
    database: Option<String>,
    columns: Vec<ColumnSchema>,
    relations: Vec<RelationSchema>,
    indices: Vec<IndexMetadata>,
    checks: Vec<CheckMetadata>,
    discriminator_property: Option<String>,
    parent: Option<String>,
    discriminator_value: Option<String>,
}

impl EntitySchema {
    pub fn new(name: impl Into<String>, table_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table_name: table_name.into(),
            schema: None,
            database: None,
            columns: Vec::new(),
            relations: Vec::new(),
            indices: Vec::new(),
            checks: Vec::new(),
            discriminator_property: None,
            parent: None,
            discriminator_value: None,
        }
    }

    pub fn schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = Some(schema.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    pub fn column(mut self, column: ColumnSchema) -> Self {
        self.columns.push(column);
        self
    }

    pub fn relation(mut self, relation: RelationSchema) -> Self {
        self.relations.push(relation);
        self
    }

    pub fn index(mut self, name: impl Into<String>, columns: Vec<&str>, unique: bool) -> Self {
        self.indices.push(IndexMetadata {
            name: name.into(),
            columns: columns.into_iter().map(String::from).collect(),
            is_unique: unique,
        });
        self
    }

    pub fn check(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.checks.push(CheckMetadata {
            name: name.into(),
            expression: expression.into(),
        });
        self
    }

    /// Declares single-table inheritance on this entity; `property` names
    /// the column storing the subtype tag.
    pub fn discriminator(mut self, property: impl Into<String>, own_value: impl Into<String>) -> Self {
        self.discriminator_property = Some(property.into());
        self.discriminator_value = Some(own_value.into());
        self
    }

    /// Declares this entity as a single-table child of `parent`, stored
    /// under the given discriminator value. The child shares the parent's
    /// table and inherits its columns.
    pub fn extends(mut self, parent: impl Into<String>, discriminator_value: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self.discriminator_value = Some(discriminator_value.into());
        self
    }
}

pub(crate) fn build_registry(schemas: Vec<EntitySchema>) -> QuarryResult<MetadataRegistry> {
    let mut by_name: HashMap<String, EntityId> = HashMap::new();
    for (i, schema) in schemas.iter().enumerate() {
        if by_name.insert(schema.name.clone(), EntityId(i)).is_some() {
            return Err(QuarryError::invalid_schema(
                &schema.name,
                "entity registered twice",
            ));
        }
    }

    // Pass 1: columns, inheritance merging, table uniqueness.
    let mut entities = Vec::with_capacity(schemas.len());
    for (i, schema) in schemas.iter().enumerate() {
        entities.push(build_entity(EntityId(i), schema, &schemas, &by_name)?);
    }

    let mut seen_tables: HashSet<(Option<String>, Option<String>, String)> = HashSet::new();
    for entity in &entities {
        if entity.parent.is_some() {
            // Single-table children share the root's table by design of the
            // inheritance mapping, not by accident.
            continue;
        }
        let key = (
            entity.database.clone(),
            entity.schema.clone(),
            entity.table_name.clone(),
        );
        if !seen_tables.insert(key) {
            return Err(QuarryError::DuplicateTableName {
                table: entity.table_name.clone(),
                schema: entity.schema.clone().unwrap_or_default(),
            });
        }
    }

    // Pass 2: relations need every entity's columns resolved first.
    for (i, schema) in schemas.iter().enumerate() {
        let relations = resolve_relations(EntityId(i), schema, &entities, &by_name)?;
        for relation in &relations {
            ensure_fk_columns(&mut entities, relation)?;
        }
        entities[i].relations = relations;
    }

    // Pass 3: pair inverse sides now that all relations exist.
    pair_inverse_relations(&mut entities)?;

    // Children lists for inheritance dispatch.
    let child_links: Vec<(EntityId, EntityId)> = entities
        .iter()
        .filter_map(|e| e.parent.map(|p| (p, e.id)))
        .collect();
    for (parent, child) in child_links {
        entities[parent.0].children.push(child);
    }

    for entity in &mut entities {
        entity.index_lookups();
        if entity.primary_columns.is_empty() {
            return Err(QuarryError::MissingPrimaryColumn {
                entity: entity.name.clone(),
            });
        }
    }

    Ok(MetadataRegistry::from_parts(entities, by_name))
}

fn build_entity(
    id: EntityId,
    schema: &EntitySchema,
    schemas: &[EntitySchema],
    by_name: &HashMap<String, EntityId>,
) -> QuarryResult<EntityMetadata> {
    let mut columns: Vec<ColumnMetadata> = Vec::new();
    let mut table_name = schema.table_name.clone();
    let mut parent = None;
    let mut discriminator_property = schema.discriminator_property.clone();

    if let Some(parent_name) = &schema.parent {
        let parent_id = *by_name.get(parent_name).ok_or_else(|| {
            QuarryError::EntityMetadataNotFound {
                target: parent_name.clone(),
            }
        })?;
        let parent_schema = &schemas[parent_id.0];
        if parent_schema.discriminator_property.is_none() {
            return Err(QuarryError::invalid_schema(
                &schema.name,
                format!("parent '{parent_name}' declares no discriminator column"),
            ));
        }
        // Children share the parent's table and inherit its columns.
        table_name = parent_schema.table_name.clone();
        parent = Some(parent_id);
        discriminator_property = parent_schema.discriminator_property.clone();
        for column in &parent_schema.columns {
            columns.push(column.clone().into_metadata(&schema.name)?);
        }
    }

    for column in &schema.columns {
        columns.push(column.clone().into_metadata(&schema.name)?);
    }

    let mut seen = HashSet::new();
    for column in &columns {
        if !seen.insert(column.database_name.clone()) {
            return Err(QuarryError::invalid_schema(
                &schema.name,
                format!("duplicate column database name '{}'", column.database_name),
            ));
        }
    }

    let mut discriminator_column = None;
    if let Some(property) = &discriminator_property {
        let index = columns
            .iter()
            .position(|c| &c.property_name == property)
            .ok_or_else(|| {
                QuarryError::invalid_schema(
                    &schema.name,
                    format!("discriminator column '{property}' is not a declared column"),
                )
            })?;
        columns[index].is_discriminator = true;
        discriminator_column = Some(index);
    }

    let mut special: HashMap<SpecialColumn, usize> = HashMap::new();
    for (index, column) in columns.iter().enumerate() {
        if let Some(kind) = column.special {
            if special.insert(kind, index).is_some() {
                return Err(QuarryError::invalid_schema(
                    &schema.name,
                    format!("more than one {kind:?} column"),
                ));
            }
        }
    }

    Ok(EntityMetadata {
        id,
        name: schema.name.clone(),
        table_name,
        schema: schema.schema.clone(),
        database: schema.database.clone(),
        columns,
        relations: Vec::new(),
        indices: schema.indices.clone(),
        checks: schema.checks.clone(),
        primary_columns: Vec::new(),
        discriminator_column,
        discriminator_value: schema.discriminator_value.clone(),
        parent,
        children: Vec::new(),
        create_date_column: special.get(&SpecialColumn::CreateDate).copied(),
        update_date_column: special.get(&SpecialColumn::UpdateDate).copied(),
        delete_date_column: special.get(&SpecialColumn::DeleteDate).copied(),
        version_column: special.get(&SpecialColumn::Version).copied(),
        column_by_property: HashMap::new(),
        column_by_database_name: HashMap::new(),
        relation_by_property: HashMap::new(),
    })
}

fn resolve_relations(
    source: EntityId,
    schema: &EntitySchema,
    entities: &[EntityMetadata],
    by_name: &HashMap<String, EntityId>,
) -> QuarryResult<Vec<RelationMetadata>> {
    let mut relations = Vec::with_capacity(schema.relations.len());
    for declared in &schema.relations {
        let target = *by_name.get(&declared.target).ok_or_else(|| {
            QuarryError::EntityMetadataNotFound {
                target: declared.target.clone(),
            }
        })?;
        let target_meta = &entities[target.0];
        let source_meta = &entities[source.0];

        let target_pks: Vec<&ColumnMetadata> = target_meta
            .columns
            .iter()
            .filter(|c| c.is_primary)
            .collect();
        if target_pks.is_empty() {
            return Err(QuarryError::MissingPrimaryColumn {
                entity: target_meta.name.clone(),
            });
        }

        let mut relation = RelationMetadata {
            property_name: declared.property_name.clone(),
            kind: declared.kind,
            source,
            target,
            is_owning: declared.is_owner,
            join_columns: Vec::new(),
            junction: None,
            inverse_property: declared.inverse_property.clone(),
            cascade: declared.cascade,
            on_delete: declared.on_delete,
            on_update: declared.on_update,
            is_eager: declared.is_eager,
            is_nullable: !declared.is_required,
        };

        match declared.kind {
            RelationKind::ManyToOne => {
                relation.is_owning = true;
                relation.join_columns =
                    default_join_columns(declared, &declared.property_name, &target_pks);
            }
            RelationKind::OneToOne => {
                if declared.is_owner || !declared.join_columns.is_empty() {
                    relation.is_owning = true;
                    relation.join_columns =
                        default_join_columns(declared, &declared.property_name, &target_pks);
                } else if declared.inverse_property.is_none() {
                    return Err(QuarryError::invalid_schema(
                        &source_meta.name,
                        format!(
                            "one-to-one '{}' is neither owning nor names an inverse side",
                            declared.property_name
                        ),
                    ));
                }
            }
            RelationKind::OneToMany => {
                relation.is_owning = false;
                if declared.inverse_property.is_none() {
                    return Err(QuarryError::invalid_schema(
                        &source_meta.name,
                        format!(
                            "one-to-many '{}' must name the owning many-to-one on '{}'",
                            declared.property_name, target_meta.name
                        ),
                    ));
                }
            }
            RelationKind::ManyToMany => {
                if declared.is_owner {
                    let source_pks: Vec<&ColumnMetadata> = source_meta
                        .columns
                        .iter()
                        .filter(|c| c.is_primary)
                        .collect();
                    let table_name = declared.junction_table.clone().unwrap_or_else(|| {
                        format!(
                            "{}_{}_{}",
                            source_meta.table_name, declared.property_name, target_meta.table_name
                        )
                    });
                    relation.junction = Some(JunctionMetadata {
                        table_name,
                        join_columns: source_pks
                            .iter()
                            .map(|pk| JoinColumn {
                                name: format!("{}_{}", source_meta.table_name, pk.database_name),
                                referenced_column: pk.database_name.clone(),
                            })
                            .collect(),
                        inverse_join_columns: target_pks
                            .iter()
                            .map(|pk| JoinColumn {
                                name: format!("{}_{}", target_meta.table_name, pk.database_name),
                                referenced_column: pk.database_name.clone(),
                            })
                            .collect(),
                    });
                } else if declared.inverse_property.is_none() {
                    return Err(QuarryError::invalid_schema(
                        &source_meta.name,
                        format!(
                            "many-to-many '{}' must either own the junction table or name its inverse",
                            declared.property_name
                        ),
                    ));
                }
            }
        }

        // Nullability of the relation follows the FK columns when they are
        // declared explicitly on the source entity.
        if relation.is_owning && !relation.join_columns.is_empty() {
            let declared_nullable: Vec<bool> = relation
                .join_columns
                .iter()
                .filter_map(|jc| {
                    source_meta
                        .columns
                        .iter()
                        .find(|c| c.database_name == jc.name)
                        .map(|c| c.is_nullable)
                })
                .collect();
            if !declared_nullable.is_empty() {
                relation.is_nullable = declared_nullable.into_iter().all(|n| n);
            }
        }

        relations.push(relation);
    }
    Ok(relations)
}

fn default_join_columns(
    declared: &RelationSchema,
    property: &str,
    target_pks: &[&ColumnMetadata],
) -> Vec<JoinColumn> {
    if !declared.join_columns.is_empty() {
        return declared.join_columns.clone();
    }
    target_pks
        .iter()
        .map(|pk| JoinColumn {
            name: format!("{}_{}", property, pk.database_name),
            referenced_column: pk.database_name.clone(),
        })
        .collect()
}

/// FK columns referenced by an owning relation must exist on the source
/// entity; ones the application did not declare are materialized here, the
/// way an annotation-driven mapper would create them implicitly.
fn ensure_fk_columns(
    entities: &mut [EntityMetadata],
    relation: &RelationMetadata,
) -> QuarryResult<()> {
    if !relation.is_owning || relation.join_columns.is_empty() {
        return Ok(());
    }
    let target_types: Vec<(String, ColumnType)> = {
        let target = &entities[relation.target.0];
        relation
            .join_columns
            .iter()
            .map(|jc| {
                let ty = target
                    .columns
                    .iter()
                    .find(|c| c.database_name == jc.referenced_column)
                    .map(|c| c.column_type.clone())
                    .unwrap_or(ColumnType::Int);
                (jc.name.clone(), ty)
            })
            .collect()
    };
    let source = &mut entities[relation.source.0];
    for (name, column_type) in target_types {
        if source.columns.iter().any(|c| c.database_name == name) {
            continue;
        }
        source.columns.push(ColumnMetadata {
            property_name: name.clone(),
            database_name: name,
            column_type,
            is_primary: false,
            is_generated: false,
            generation_strategy: None,
            is_nullable: relation.is_nullable,
            length: None,
            precision: None,
            scale: None,
            default: None,
            is_array: false,
            transformer: None,
            is_discriminator: false,
            special: None,
        });
    }
    Ok(())
}

fn pair_inverse_relations(entities: &mut [EntityMetadata]) -> QuarryResult<()> {
    // Collect fixes first; we cannot mutate while scanning a cyclic graph.
    let mut junction_mirrors: Vec<(EntityId, String, JunctionMetadata)> = Vec::new();
    let mut join_column_mirrors: Vec<(EntityId, String, Vec<JoinColumn>)> = Vec::new();
    let mut back_references: Vec<(EntityId, String, String)> = Vec::new();

    for entity in entities.iter() {
        for relation in &entity.relations {
            let Some(inverse_name) = &relation.inverse_property else {
                continue;
            };
            let target = &entities[relation.target.0];
            let inverse = target
                .relations
                .iter()
                .find(|r| &r.property_name == inverse_name && r.target == relation.source)
                .ok_or_else(|| {
                    QuarryError::invalid_schema(
                        &entity.name,
                        format!(
                            "relation '{}' names inverse '{}' which does not exist on '{}'",
                            relation.property_name, inverse_name, target.name
                        ),
                    )
                })?;
            if relation.is_owning && inverse.is_owning {
                return Err(QuarryError::invalid_schema(
                    &entity.name,
                    format!(
                        "both sides of '{}' <-> '{}' claim ownership",
                        relation.property_name, inverse_name
                    ),
                ));
            }
            if inverse.inverse_property.is_none() {
                back_references.push((
                    relation.target,
                    inverse_name.clone(),
                    relation.property_name.clone(),
                ));
            }
            // The non-owning side borrows the owning side's physical layout
            // so joins can be derived from either direction.
            if !relation.is_owning {
                if let Some(junction) = &inverse.junction {
                    junction_mirrors.push((
                        entity.id,
                        relation.property_name.clone(),
                        JunctionMetadata {
                            table_name: junction.table_name.clone(),
                            join_columns: junction.inverse_join_columns.clone(),
                            inverse_join_columns: junction.join_columns.clone(),
                        },
                    ));
                }
                if !inverse.join_columns.is_empty() {
                    join_column_mirrors.push((
                        entity.id,
                        relation.property_name.clone(),
                        inverse.join_columns.clone(),
                    ));
                }
            }
        }
    }

    for (id, property, back) in back_references {
        if let Some(r) = entities[id.0]
            .relations
            .iter_mut()
            .find(|r| r.property_name == property)
        {
            r.inverse_property = Some(back);
        }
    }
    for (id, property, junction) in junction_mirrors {
        if let Some(r) = entities[id.0]
            .relations
            .iter_mut()
            .find(|r| r.property_name == property)
        {
            r.junction = Some(junction);
        }
    }
    for (id, property, join_columns) in join_column_mirrors {
        if let Some(r) = entities[id.0]
            .relations
            .iter_mut()
            .find(|r| r.property_name == property)
        {
            r.join_columns = join_columns;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post_schema() -> EntitySchema {
        EntitySchema::new("Post", "posts")
            .column(ColumnSchema::primary_generated("id"))
            .column(ColumnSchema::text("title"))
            .relation(
                RelationSchema::many_to_one("category", "Category")
                    .join_column("category_id", "id")
                    .inverse("posts"),
            )
    }

    fn category_schema() -> EntitySchema {
        EntitySchema::new("Category", "categories")
            .column(ColumnSchema::primary_generated("id"))
            .column(ColumnSchema::text("name"))
            .relation(RelationSchema::one_to_many("posts", "Post", "category"))
    }

    #[test]
    fn builds_and_pairs_inverse_relations() {
        let registry =
            MetadataRegistry::build(vec![post_schema(), category_schema()]).unwrap();
        let post = registry.get_by_name("Post").unwrap();
        let relation = post.find_relation_with_property_path("category").unwrap();
        assert!(relation.is_owning);
        assert_eq!(relation.join_columns[0].name, "category_id");

        let category = registry.get_by_name("Category").unwrap();
        let inverse = category.find_relation_with_property_path("posts").unwrap();
        assert!(!inverse.is_owning);
        // The one side mirrors the owning side's FK layout.
        assert_eq!(inverse.join_columns[0].name, "category_id");
    }

    #[test]
    fn rejects_duplicate_table_names() {
        let a = EntitySchema::new("A", "things").column(ColumnSchema::primary_generated("id"));
        let b = EntitySchema::new("B", "things").column(ColumnSchema::primary_generated("id"));
        let err = MetadataRegistry::build(vec![a, b]).unwrap_err();
        assert!(matches!(err, QuarryError::DuplicateTableName { .. }));
    }

    #[test]
    fn rejects_generated_column_with_default() {
        let schema = EntitySchema::new("A", "a").column(
            ColumnSchema::int("id")
                .primary()
                .generated(GenerationStrategy::Increment)
                .default_value(7),
        );
        assert!(MetadataRegistry::build(vec![schema]).is_err());
    }

    #[test]
    fn rejects_missing_primary_column() {
        let schema = EntitySchema::new("A", "a").column(ColumnSchema::text("name"));
        let err = MetadataRegistry::build(vec![schema]).unwrap_err();
        assert!(matches!(err, QuarryError::MissingPrimaryColumn { .. }));
    }

    #[test]
    fn unregistered_lookup_is_a_typed_error() {
        let registry = MetadataRegistry::build(vec![]).unwrap();
        let err = registry.get_by_name("Ghost").unwrap_err();
        assert!(matches!(err, QuarryError::EntityMetadataNotFound { .. }));
    }

    #[test]
    fn materializes_junction_table_for_owning_many_to_many() {
        let post = EntitySchema::new("Post", "posts")
            .column(ColumnSchema::primary_generated("id"))
            .relation(RelationSchema::many_to_many("categories", "Category").owner());
        let category = EntitySchema::new("Category", "categories")
            .column(ColumnSchema::primary_generated("id"))
            .relation(
                RelationSchema::many_to_many("posts", "Post").inverse("categories"),
            );
        let registry = MetadataRegistry::build(vec![post, category]).unwrap();
        let relation = registry
            .get_by_name("Post")
            .unwrap()
            .find_relation_with_property_path("categories")
            .unwrap();
        let junction = relation.junction.as_ref().unwrap();
        assert_eq!(junction.table_name, "posts_categories_categories");
        assert_eq!(junction.join_columns[0].name, "posts_id");
        assert_eq!(junction.inverse_join_columns[0].name, "categories_id");

        // Inverse side sees the same table with the sides swapped.
        let inverse = registry
            .get_by_name("Category")
            .unwrap()
            .find_relation_with_property_path("posts")
            .unwrap();
        let mirrored = inverse.junction.as_ref().unwrap();
        assert_eq!(mirrored.table_name, "posts_categories_categories");
        assert_eq!(mirrored.join_columns[0].name, "categories_id");
    }

    #[test]
    fn single_table_children_inherit_parent_columns() {
        let content = EntitySchema::new("Content", "contents")
            .column(ColumnSchema::primary_generated("id"))
            .column(ColumnSchema::text("kind"))
            .column(ColumnSchema::text("title"))
            .discriminator("kind", "content");
        let article = EntitySchema::new("Article", "contents")
            .column(ColumnSchema::text("body").nullable())
            .extends("Content", "article");
        let registry = MetadataRegistry::build(vec![content, article]).unwrap();
        let article = registry.get_by_name("Article").unwrap();
        assert_eq!(article.table_name, "contents");
        assert!(article.find_column_with_property_path("title").is_some());
        assert!(article.find_column_with_property_path("body").is_some());
        assert_eq!(article.discriminator_value.as_deref(), Some("article"));

        let root_id = registry.id_of("Content").unwrap();
        assert_eq!(
            registry.discriminator_values(root_id),
            vec!["content".to_string(), "article".to_string()]
        );
    }
}
