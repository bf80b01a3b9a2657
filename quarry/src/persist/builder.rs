//! Planning phase of a persistence operation: walk the cascade graph to
//! collect subjects (deduplicated by instance identity), load their current
//! database copies in batches, and diff desired state against loaded state.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dialect::Dialect;
use crate::driver::QueryRunner;
use crate::entity::{same_instance, snapshot, EntityRef};
use crate::error::{QuarryError, QuarryResult};
use crate::metadata::{owning_fk_values, MetadataRegistry, RelationKind, RelationMetadata};
use crate::persist::subject::{JunctionChange, JunctionValue, Subject, SubjectOperation};
use crate::query::SelectQueryBuilder;
use crate::value::Value;

pub struct SubjectBuilder {
    registry: Arc<MetadataRegistry>,
    dialect: Dialect,
}

impl SubjectBuilder {
    pub fn new(registry: Arc<MetadataRegistry>, dialect: Dialect) -> Self {
        Self { registry, dialect }
    }

    /// Collect, load and diff the subjects of a save operation.
    pub async fn build_save(
        &self,
        runner: &mut dyn QueryRunner,
        roots: &[EntityRef],
    ) -> QuarryResult<Vec<Subject>> {
        let mut subjects: Vec<Subject> = Vec::new();
        for root in roots {
            self.collect(root, &mut subjects, |cascade| {
                cascade.insert || cascade.update
            })?;
        }
        self.decide_operations(runner, &mut subjects).await?;
        for i in 0..subjects.len() {
            if subjects[i].operation == SubjectOperation::Update {
                self.diff_subject(&mut subjects[i])?;
            }
            self.diff_junctions(runner, &mut subjects[i]).await?;
        }
        Ok(subjects)
    }

    /// Collect the subjects of a remove, soft-remove or recover operation.
    pub async fn build_remove(
        &self,
        roots: &[EntityRef],
        operation: SubjectOperation,
    ) -> QuarryResult<Vec<Subject>> {
        let mut subjects: Vec<Subject> = Vec::new();
        for root in roots {
            self.collect(root, &mut subjects, |cascade| match operation {
                SubjectOperation::Remove => cascade.remove,
                SubjectOperation::SoftRemove => cascade.soft_remove,
                SubjectOperation::Recover => cascade.recover,
                _ => false,
            })?;
        }
        for subject in &mut subjects {
            subject.operation = operation;
            if !subject.has_identifier(&self.registry) {
                return Err(QuarryError::MissingIdentifier {
                    entity: self.registry.get(subject.metadata).name.clone(),
                });
            }
            if operation == SubjectOperation::Remove {
                self.junction_cleanup(subject);
            }
        }
        Ok(subjects)
    }

    /// Depth-first cascade walk. Roots are always included; related
    /// instances join when the relation's cascade flags allow, each
    /// instance at most once by identity.
    fn collect(
        &self,
        entity: &EntityRef,
        subjects: &mut Vec<Subject>,
        follow: impl Fn(&crate::metadata::CascadeFlags) -> bool + Copy,
    ) -> QuarryResult<()> {
        if subjects.iter().any(|s| same_instance(&s.entity, entity)) {
            return Ok(());
        }
        let instance = snapshot(entity);
        let metadata = self.registry.get(instance.entity);
        subjects.push(Subject::new(
            entity.clone(),
            metadata.id,
            SubjectOperation::Insert,
        ));
        for relation in &metadata.relations {
            if !follow(&relation.cascade) || !instance.has_relation(&relation.property_name) {
                continue;
            }
            if relation.kind.is_many() {
                for related in instance.relation_many(&relation.property_name) {
                    self.collect(&related, subjects, follow)?;
                }
            } else if let Some(related) = instance.relation_one(&relation.property_name) {
                self.collect(&related, subjects, follow)?;
            }
        }
        Ok(())
    }

    /// Load the database copies of every subject carrying a full
    /// identifier, one batched SELECT per entity, and flip found subjects
    /// to updates.
    async fn decide_operations(
        &self,
        runner: &mut dyn QueryRunner,
        subjects: &mut [Subject],
    ) -> QuarryResult<()> {
        let mut by_entity: BTreeMap<usize, Vec<usize>> = BTreeMap::new();
        for (i, subject) in subjects.iter().enumerate() {
            if subject.has_identifier(&self.registry) {
                by_entity
                    .entry(self.registry.get(subject.metadata).id.0)
                    .or_default()
                    .push(i);
            }
        }
        for (_, indexes) in by_entity {
            let metadata = self.registry.get(subjects[indexes[0]].metadata);
            let ids: Vec<BTreeMap<String, Value>> = indexes
                .iter()
                .filter_map(|&i| subjects[i].identifier(&self.registry))
                .collect();
            let loaded = SelectQueryBuilder::new(
                Arc::clone(&self.registry),
                &metadata.name,
                "subject",
            )?
            .where_in_ids(ids)
            .with_deleted()
            .get_many(runner, self.dialect)
            .await?;
            for &i in &indexes {
                let Some(id) = subjects[i].identifier(&self.registry) else {
                    continue;
                };
                let found = loaded.iter().find(|e| {
                    let instance = snapshot(e);
                    metadata.entity_id_map(&instance).as_ref() == Some(&id)
                });
                if let Some(found) = found {
                    subjects[i].operation = SubjectOperation::Update;
                    subjects[i].database_entity = Some(snapshot(found));
                }
            }
        }
        Ok(())
    }

    /// Column-level diff of an update subject against its database copy.
    /// Absent property slots stay untouched.
    fn diff_subject(&self, subject: &mut Subject) -> QuarryResult<()> {
        let metadata = self.registry.get(subject.metadata);
        let instance = snapshot(&subject.entity);
        let Some(database) = &subject.database_entity else {
            return Ok(());
        };
        let fk_columns: Vec<&str> = metadata
            .relations
            .iter()
            .filter(|r| r.is_owning && instance.has_relation(&r.property_name))
            .flat_map(|r| r.join_columns.iter().map(|jc| jc.name.as_str()))
            .collect();

        for column in &metadata.columns {
            if column.is_generated
                || column.is_discriminator
                || column.special.is_some()
                || !instance.props.contains_key(&column.property_name)
            {
                continue;
            }
            // A present relation slot owns its foreign key columns; a raw
            // scalar write to the same column is ignored in that case.
            if fk_columns.iter().any(|c| *c == column.database_name) {
                continue;
            }
            let desired = column.prepare_persistent_value(instance.scalar(&column.property_name))?;
            let current =
                column.prepare_persistent_value(database.scalar(&column.property_name))?;
            if desired != current {
                subject
                    .changed_columns
                    .push((column.property_name.clone(), instance.scalar(&column.property_name)));
            }
        }

        // A delete-date written onto a loaded entity turns the save into a
        // soft removal; clearing it turns the save into a recovery.
        if let Some(column) = metadata.delete_date() {
            if instance.props.contains_key(&column.property_name) {
                let desired = instance.scalar(&column.property_name);
                let current = database.scalar(&column.property_name);
                if current.is_null() && !desired.is_null() {
                    subject.operation = SubjectOperation::SoftRemove;
                } else if !current.is_null() && desired.is_null() {
                    subject.operation = SubjectOperation::Recover;
                }
            }
        }

        for relation in &metadata.relations {
            if !relation.is_owning
                || relation.join_columns.is_empty()
                || !instance.has_relation(&relation.property_name)
            {
                continue;
            }
            let desired = owning_fk_values(&self.registry, metadata, relation, &instance);
            let changed = desired.iter().any(|(db_column, value)| {
                let current = metadata
                    .find_column_with_database_name(db_column)
                    .map(|c| database.scalar(&c.property_name))
                    .unwrap_or(Value::Null);
                // A null desired FK against a related instance means the
                // related row is new; its key arrives during execution.
                value != &current
                    || (value.is_null()
                        && instance.relation_one(&relation.property_name).is_some())
            });
            if changed {
                subject.changed_relations.push(relation.property_name.clone());
            }
        }
        Ok(())
    }

    /// Diff many-to-many junction rows: desired membership comes from the
    /// relation slot, current membership from the junction table.
    async fn diff_junctions(
        &self,
        runner: &mut dyn QueryRunner,
        subject: &mut Subject,
    ) -> QuarryResult<()> {
        let metadata = self.registry.get(subject.metadata);
        let instance = snapshot(&subject.entity);
        for relation in &metadata.relations {
            if relation.kind != RelationKind::ManyToMany
                || !relation.is_owning
                || !instance.has_relation(&relation.property_name)
            {
                continue;
            }
            let Some(junction) = &relation.junction else {
                continue;
            };
            let desired = instance.relation_many(&relation.property_name);

            // Any subject with a loaded database copy may already own
            // junction rows, whatever its operation ended up as.
            let current: Vec<Vec<Value>> = if subject.database_entity.is_some() {
                self.load_junction_rows(runner, subject, junction).await?
            } else {
                Vec::new()
            };

            // Desired ids resolvable now; new related rows have no id yet
            // and always insert.
            let mut kept: Vec<Vec<Value>> = Vec::new();
            for related in &desired {
                let resolved = self.registry.related_id_by_database_name(relation, related);
                let tuple = resolved.map(|map| {
                    junction
                        .inverse_join_columns
                        .iter()
                        .map(|jc| map.get(&jc.referenced_column).cloned().unwrap_or(Value::Null))
                        .collect::<Vec<_>>()
                });
                let exists = tuple
                    .as_ref()
                    .map(|t| current.iter().any(|c| c == t))
                    .unwrap_or(false);
                if let Some(tuple) = &tuple {
                    kept.push(tuple.clone());
                }
                if exists {
                    continue;
                }
                let mut values = Vec::new();
                for jc in &junction.join_columns {
                    values.push((
                        jc.name.clone(),
                        JunctionValue::FromEntity(
                            subject.entity.clone(),
                            jc.referenced_column.clone(),
                        ),
                    ));
                }
                for jc in &junction.inverse_join_columns {
                    values.push((
                        jc.name.clone(),
                        JunctionValue::FromEntity(related.clone(), jc.referenced_column.clone()),
                    ));
                }
                subject.junction_changes.push(JunctionChange {
                    table: junction.table_name.clone(),
                    remove: false,
                    values,
                });
            }

            for tuple in current {
                if kept.iter().any(|k| k == &tuple) {
                    continue;
                }
                let Some(id) = subject.identifier(&self.registry) else {
                    continue;
                };
                let mut values = Vec::new();
                for jc in &junction.join_columns {
                    let value = metadata
                        .find_column_with_database_name(&jc.referenced_column)
                        .and_then(|c| id.get(&c.property_name).cloned())
                        .unwrap_or(Value::Null);
                    values.push((jc.name.clone(), JunctionValue::Resolved(value)));
                }
                for (jc, value) in junction.inverse_join_columns.iter().zip(tuple) {
                    values.push((jc.name.clone(), JunctionValue::Resolved(value)));
                }
                subject.junction_changes.push(JunctionChange {
                    table: junction.table_name.clone(),
                    remove: true,
                    values,
                });
            }
        }
        Ok(())
    }

    async fn load_junction_rows(
        &self,
        runner: &mut dyn QueryRunner,
        subject: &Subject,
        junction: &crate::metadata::JunctionMetadata,
    ) -> QuarryResult<Vec<Vec<Value>>> {
        let metadata = self.registry.get(subject.metadata);
        let Some(id) = subject.identifier(&self.registry) else {
            return Ok(Vec::new());
        };
        let dialect = self.dialect;
        let select_list: Vec<String> = junction
            .inverse_join_columns
            .iter()
            .map(|jc| dialect.escape(&jc.name))
            .collect();
        let mut conditions = Vec::new();
        let mut params = Vec::new();
        for jc in &junction.join_columns {
            let value = metadata
                .find_column_with_database_name(&jc.referenced_column)
                .and_then(|c| id.get(&c.property_name).cloned())
                .unwrap_or(Value::Null);
            conditions.push(format!(
                "{} = {}",
                dialect.escape(&jc.name),
                dialect.placeholder(params.len())
            ));
            params.push(value);
        }
        let sql = format!(
            "SELECT {} FROM {} WHERE {}",
            select_list.join(", "),
            dialect.escape(&junction.table_name),
            conditions.join(" AND ")
        );
        let rows = runner
            .query(&sql, &params)
            .await
            .map_err(|e| e.with_query(sql, &params))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                junction
                    .inverse_join_columns
                    .iter()
                    .map(|jc| row.get(&jc.name).cloned().unwrap_or(Value::Null))
                    .collect()
            })
            .collect())
    }

    /// On hard removal every junction row referencing the subject goes,
    /// from both sides of the relation.
    fn junction_cleanup(&self, subject: &mut Subject) {
        let metadata = self.registry.get(subject.metadata);
        let Some(id) = subject.identifier(&self.registry) else {
            return;
        };
        for relation in &metadata.relations {
            if relation.kind != RelationKind::ManyToMany {
                continue;
            }
            let Some(junction) = &relation.junction else {
                continue;
            };
            let mut values = Vec::new();
            for jc in &junction.join_columns {
                let value = metadata
                    .find_column_with_database_name(&jc.referenced_column)
                    .and_then(|c| id.get(&c.property_name).cloned())
                    .unwrap_or(Value::Null);
                values.push((jc.name.clone(), JunctionValue::Resolved(value)));
            }
            subject.junction_changes.push(JunctionChange {
                table: junction.table_name.clone(),
                remove: true,
                values,
            });
        }
    }
}

/// Relations whose foreign keys live on the subject's own table.
pub(crate) fn owning_relations(
    registry: &MetadataRegistry,
    subject: &Subject,
) -> Vec<RelationMetadata> {
    registry
        .get(subject.metadata)
        .relations
        .iter()
        .filter(|r| r.is_owning && !r.join_columns.is_empty())
        .cloned()
        .collect()
}
