//! Execution phase: turn planned subjects into statements on one query
//! runner inside a single transaction. Inserts run in dependency order with
//! generated keys written back between waves, updates carry the optimistic
//! version check, removals run children-first.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use log::debug;
use uuid::Uuid;

use crate::criteria::FindOperator;
use crate::driver::{Driver, QueryRunner};
use crate::entity::{snapshot, EntityRef};
use crate::error::{QuarryError, QuarryResult};
use crate::metadata::{GenerationStrategy, MetadataRegistry, SpecialColumn};
use crate::persist::builder::{owning_relations, SubjectBuilder};
use crate::persist::ordering::insertion_order;
use crate::persist::subject::{JunctionValue, Subject, SubjectOperation};
use crate::query::{DeleteQueryBuilder, InsertQueryBuilder, UpdateQueryBuilder};
use crate::value::Value;

pub struct PersistExecutor {
    registry: Arc<MetadataRegistry>,
    driver: Arc<dyn Driver>,
}

impl PersistExecutor {
    pub fn new(registry: Arc<MetadataRegistry>, driver: Arc<dyn Driver>) -> Self {
        Self { registry, driver }
    }

    /// Persist the given roots and everything their cascades reach. Runs in
    /// the caller's transaction when one is active, otherwise opens and
    /// settles its own.
    pub async fn save(
        &self,
        runner: &mut dyn QueryRunner,
        roots: &[EntityRef],
    ) -> QuarryResult<()> {
        let own_transaction = !runner.is_transaction_active();
        if own_transaction {
            runner.start_transaction().await?;
        }
        match self.save_inner(runner, roots).await {
            Ok(()) => {
                if own_transaction {
                    runner.commit_transaction().await?;
                }
                Ok(())
            }
            Err(e) => {
                if own_transaction {
                    let _ = runner.rollback_transaction().await;
                }
                Err(e)
            }
        }
    }

    async fn save_inner(
        &self,
        runner: &mut dyn QueryRunner,
        roots: &[EntityRef],
    ) -> QuarryResult<()> {
        let dialect = self.driver.dialect();
        let builder = SubjectBuilder::new(Arc::clone(&self.registry), dialect);
        let subjects = builder.build_save(runner, roots).await?;
        let plan = insertion_order(&self.registry, &subjects)?;
        debug!(
            "save: {} subject(s), {} insert(s), {} deferred key(s)",
            subjects.len(),
            plan.order.len(),
            plan.deferred.len()
        );

        // Insert waves: adjacent subjects of the same entity batch into one
        // multi-row statement.
        let mut i = 0;
        while i < plan.order.len() {
            let mut batch = vec![plan.order[i]];
            while i + batch.len() < plan.order.len()
                && subjects[plan.order[i + batch.len()]].metadata == subjects[batch[0]].metadata
            {
                batch.push(plan.order[i + batch.len()]);
            }
            self.execute_insert_batch(runner, &subjects, &batch).await?;
            i += batch.len();
        }

        for (index, property) in &plan.deferred {
            self.execute_deferred_key(runner, &subjects[*index], property)
                .await?;
        }

        for subject in &subjects {
            match subject.operation {
                SubjectOperation::Update => self.execute_update(runner, subject).await?,
                SubjectOperation::SoftRemove | SubjectOperation::Recover => {
                    self.execute_delete_date_transition(runner, subject, subject.operation)
                        .await?
                }
                _ => {}
            }
        }

        for subject in &subjects {
            self.execute_junction_changes(runner, subject).await?;
        }
        Ok(())
    }

    async fn execute_insert_batch(
        &self,
        runner: &mut dyn QueryRunner,
        subjects: &[Subject],
        batch: &[usize],
    ) -> QuarryResult<()> {
        let dialect = self.driver.dialect();
        let metadata = self.registry.get(subjects[batch[0]].metadata);
        let mut rows = Vec::with_capacity(batch.len());
        for &index in batch {
            rows.push(self.build_insert_row(&subjects[index])?);
        }
        let result = InsertQueryBuilder::new(Arc::clone(&self.registry), &metadata.name)?
            .values_many(rows)
            .execute(runner, dialect)
            .await?;
        for (row_index, &subject_index) in batch.iter().enumerate() {
            let generated = self.driver.create_generated_map(
                metadata,
                &result,
                row_index,
                batch.len(),
            )?;
            write_props(
                &subjects[subject_index].entity,
                generated.into_iter().collect(),
            )?;
        }
        Ok(())
    }

    /// One insert row, property-keyed. Special columns get their values
    /// here and are written back onto the instance so the caller observes
    /// them without a reload.
    fn build_insert_row(&self, subject: &Subject) -> QuarryResult<BTreeMap<String, Value>> {
        let metadata = self.registry.get(subject.metadata);
        let now = Value::DateTime(Utc::now().fixed_offset());
        let mut writeback: Vec<(String, Value)> = Vec::new();
        let mut row: BTreeMap<String, Value> = BTreeMap::new();
        {
            let instance = snapshot(&subject.entity);
            let fk_columns: Vec<String> = metadata
                .relations
                .iter()
                .filter(|r| r.is_owning && instance.has_relation(&r.property_name))
                .flat_map(|r| r.join_columns.iter().map(|jc| jc.name.clone()))
                .collect();

            for column in &metadata.columns {
                if column.is_generated {
                    match column.generation_strategy {
                        Some(GenerationStrategy::Uuid) => {
                            let value = match instance.scalar(&column.property_name) {
                                Value::Null => {
                                    let id = Value::Uuid(Uuid::new_v4());
                                    writeback.push((column.property_name.clone(), id.clone()));
                                    id
                                }
                                existing => existing,
                            };
                            row.insert(column.property_name.clone(), value);
                        }
                        _ => {}
                    }
                    continue;
                }
                match column.special {
                    Some(SpecialColumn::CreateDate) | Some(SpecialColumn::UpdateDate) => {
                        let value = match instance.scalar(&column.property_name) {
                            Value::Null => now.clone(),
                            existing => existing,
                        };
                        writeback.push((column.property_name.clone(), value.clone()));
                        row.insert(column.property_name.clone(), value);
                        continue;
                    }
                    Some(SpecialColumn::Version) => {
                        writeback.push((column.property_name.clone(), Value::Int(1)));
                        row.insert(column.property_name.clone(), Value::Int(1));
                        continue;
                    }
                    Some(SpecialColumn::DeleteDate) | None => {}
                }
                if column.is_discriminator {
                    let value = match instance.scalar(&column.property_name) {
                        Value::Null => metadata
                            .discriminator_value
                            .clone()
                            .map(Value::Text)
                            .unwrap_or(Value::Null),
                        existing => existing,
                    };
                    row.insert(column.property_name.clone(), value);
                    continue;
                }
                if fk_columns.iter().any(|c| *c == column.database_name) {
                    continue;
                }
                if instance.props.contains_key(&column.property_name) {
                    row.insert(
                        column.property_name.clone(),
                        instance.scalar(&column.property_name),
                    );
                }
            }

            // Foreign keys from owning relation slots. A parent not yet
            // inserted reads as null here; the ordering plan guarantees
            // that only happens on deferred edges.
            for relation in owning_relations(&self.registry, subject) {
                if !instance.has_relation(&relation.property_name) {
                    continue;
                }
                for (db_column, value) in
                    crate::metadata::owning_fk_values(&self.registry, metadata, &relation, &instance)
                {
                    if let Some(column) = metadata.find_column_with_database_name(&db_column) {
                        row.insert(column.property_name.clone(), value);
                    }
                }
            }
        }
        write_props(&subject.entity, writeback)?;
        Ok(row)
    }

    /// Post-wave UPDATE writing a foreign key whose edge broke an insert
    /// cycle.
    async fn execute_deferred_key(
        &self,
        runner: &mut dyn QueryRunner,
        subject: &Subject,
        relation_property: &str,
    ) -> QuarryResult<()> {
        let dialect = self.driver.dialect();
        let metadata = self.registry.get(subject.metadata);
        let relation = metadata
            .find_relation_with_property_path(relation_property)
            .ok_or_else(|| QuarryError::RelationsNotFound {
                entity: metadata.name.clone(),
                paths: vec![relation_property.to_string()],
            })?;
        let instance = snapshot(&subject.entity);
        let id = subject
            .identifier(&self.registry)
            .ok_or_else(|| QuarryError::MissingIdentifier {
                entity: metadata.name.clone(),
            })?;
        let mut update = UpdateQueryBuilder::new(Arc::clone(&self.registry), &metadata.name)?;
        for (db_column, value) in
            crate::metadata::owning_fk_values(&self.registry, metadata, relation, &instance)
        {
            let column = metadata
                .find_column_with_database_name(&db_column)
                .ok_or_else(|| QuarryError::ColumnNotFound {
                    entity: metadata.name.clone(),
                    property: db_column.clone(),
                })?;
            update = update.set(column.property_name.clone(), value);
        }
        update.where_in_ids(vec![id]).execute(runner, dialect).await?;
        Ok(())
    }

    async fn execute_update(
        &self,
        runner: &mut dyn QueryRunner,
        subject: &Subject,
    ) -> QuarryResult<()> {
        if subject.changed_columns.is_empty() && subject.changed_relations.is_empty() {
            return Ok(());
        }
        let dialect = self.driver.dialect();
        let metadata = self.registry.get(subject.metadata);
        let instance = snapshot(&subject.entity);
        let id = subject
            .identifier(&self.registry)
            .ok_or_else(|| QuarryError::MissingIdentifier {
                entity: metadata.name.clone(),
            })?;

        let mut update = UpdateQueryBuilder::new(Arc::clone(&self.registry), &metadata.name)?;
        let mut writeback: Vec<(String, Value)> = Vec::new();

        for (property, value) in &subject.changed_columns {
            update = update.set(property.clone(), value.clone());
        }
        for relation_property in &subject.changed_relations {
            let relation = metadata
                .find_relation_with_property_path(relation_property)
                .ok_or_else(|| QuarryError::RelationsNotFound {
                    entity: metadata.name.clone(),
                    paths: vec![relation_property.clone()],
                })?;
            for (db_column, value) in
                crate::metadata::owning_fk_values(&self.registry, metadata, relation, &instance)
            {
                if let Some(column) = metadata.find_column_with_database_name(&db_column) {
                    update = update.set(column.property_name.clone(), value);
                }
            }
        }
        if let Some(column) = metadata.update_date() {
            let now = Value::DateTime(Utc::now().fixed_offset());
            writeback.push((column.property_name.clone(), now.clone()));
            update = update.set(column.property_name.clone(), now);
        }

        let version = metadata.version().map(|column| {
            let current = match instance.scalar(&column.property_name) {
                Value::Int(v) => v,
                _ => subject
                    .database_entity
                    .as_ref()
                    .and_then(|db| db.scalar(&column.property_name).as_int())
                    .unwrap_or(0),
            };
            (column.property_name.clone(), current)
        });
        if let Some((property, current)) = &version {
            update = update
                .set(property.clone(), Value::Int(current + 1))
                .and_where_op(property, FindOperator::Equal(Value::Int(*current)));
            writeback.push((property.clone(), Value::Int(current + 1)));
        }

        let result = update.where_in_ids(vec![id.clone()]).execute(runner, dialect).await?;
        if result.rows_affected == 0 {
            return Err(match version {
                Some((_, current)) => QuarryError::OptimisticLock {
                    entity: metadata.name.clone(),
                    expected: current,
                },
                None => QuarryError::EntityNotFoundForUpdate {
                    entity: metadata.name.clone(),
                    id: format!("{id:?}"),
                },
            });
        }
        write_props(&subject.entity, writeback)?;
        Ok(())
    }

    async fn execute_junction_changes(
        &self,
        runner: &mut dyn QueryRunner,
        subject: &Subject,
    ) -> QuarryResult<()> {
        let dialect = self.driver.dialect();
        for change in &subject.junction_changes {
            let resolved: Vec<(String, Value)> = change
                .values
                .iter()
                .map(|(column, value)| (column.clone(), self.resolve_junction_value(value)))
                .collect();
            if change.remove {
                let mut delete =
                    DeleteQueryBuilder::from_table(Arc::clone(&self.registry), &change.table);
                let mut first = true;
                for (column, value) in resolved {
                    delete = if first {
                        first = false;
                        delete.where_op(&column, FindOperator::Equal(value))
                    } else {
                        delete.and_where_op(&column, FindOperator::Equal(value))
                    };
                }
                delete.execute(runner, dialect).await?;
            } else {
                let columns: Vec<String> =
                    resolved.iter().map(|(c, _)| dialect.escape(c)).collect();
                let placeholders: Vec<String> = (0..resolved.len())
                    .map(|i| dialect.placeholder(i))
                    .collect();
                let params: Vec<Value> = resolved.into_iter().map(|(_, v)| v).collect();
                let sql = format!(
                    "INSERT INTO {} ({}) VALUES ({})",
                    dialect.escape(&change.table),
                    columns.join(", "),
                    placeholders.join(", ")
                );
                debug!("query: {sql} -- parameters: {params:?}");
                runner
                    .execute(&sql, &params)
                    .await
                    .map_err(|e| e.with_query(sql, &params))?;
            }
        }
        Ok(())
    }

    fn resolve_junction_value(&self, value: &JunctionValue) -> Value {
        match value {
            JunctionValue::Resolved(v) => v.clone(),
            JunctionValue::FromEntity(entity, referenced_column) => {
                let instance = snapshot(entity);
                let metadata = self.registry.get(instance.entity);
                metadata
                    .find_column_with_database_name(referenced_column)
                    .map(|c| instance.scalar(&c.property_name))
                    .unwrap_or(Value::Null)
            }
        }
    }

    /// Hard-delete the roots and everything their remove cascades reach,
    /// junction rows first, children before the rows they reference.
    pub async fn remove(
        &self,
        runner: &mut dyn QueryRunner,
        roots: &[EntityRef],
    ) -> QuarryResult<()> {
        let own_transaction = !runner.is_transaction_active();
        if own_transaction {
            runner.start_transaction().await?;
        }
        match self.remove_inner(runner, roots).await {
            Ok(()) => {
                if own_transaction {
                    runner.commit_transaction().await?;
                }
                Ok(())
            }
            Err(e) => {
                if own_transaction {
                    let _ = runner.rollback_transaction().await;
                }
                Err(e)
            }
        }
    }

    async fn remove_inner(
        &self,
        runner: &mut dyn QueryRunner,
        roots: &[EntityRef],
    ) -> QuarryResult<()> {
        let dialect = self.driver.dialect();
        let builder = SubjectBuilder::new(Arc::clone(&self.registry), dialect);
        let subjects = builder.build_remove(roots, SubjectOperation::Remove).await?;
        debug!("remove: {} subject(s)", subjects.len());

        for subject in &subjects {
            self.execute_junction_changes(runner, subject).await?;
        }
        // The cascade walk visits parents before the children referencing
        // them; deleting in reverse keeps foreign keys satisfied throughout.
        let mut index = subjects.len();
        while index > 0 {
            let mut start = index;
            while start > 0 && subjects[start - 1].metadata == subjects[index - 1].metadata {
                start -= 1;
            }
            let batch = &subjects[start..index];
            let metadata = self.registry.get(batch[0].metadata);
            let ids: Vec<BTreeMap<String, Value>> = batch
                .iter()
                .rev()
                .filter_map(|s| s.identifier(&self.registry))
                .collect();
            DeleteQueryBuilder::new(Arc::clone(&self.registry), &metadata.name)?
                .where_in_ids(ids)
                .execute(runner, dialect)
                .await?;
            index = start;
        }
        Ok(())
    }

    /// Mark the roots (and their soft-remove cascades) deleted by setting
    /// the delete-date column.
    pub async fn soft_remove(
        &self,
        runner: &mut dyn QueryRunner,
        roots: &[EntityRef],
    ) -> QuarryResult<()> {
        self.transition_delete_date(runner, roots, SubjectOperation::SoftRemove)
            .await
    }

    /// Clear the delete-date column on the roots (and their recover
    /// cascades).
    pub async fn recover(
        &self,
        runner: &mut dyn QueryRunner,
        roots: &[EntityRef],
    ) -> QuarryResult<()> {
        self.transition_delete_date(runner, roots, SubjectOperation::Recover)
            .await
    }

    async fn transition_delete_date(
        &self,
        runner: &mut dyn QueryRunner,
        roots: &[EntityRef],
        operation: SubjectOperation,
    ) -> QuarryResult<()> {
        let own_transaction = !runner.is_transaction_active();
        if own_transaction {
            runner.start_transaction().await?;
        }
        let result = self
            .transition_delete_date_inner(runner, roots, operation)
            .await;
        match result {
            Ok(()) => {
                if own_transaction {
                    runner.commit_transaction().await?;
                }
                Ok(())
            }
            Err(e) => {
                if own_transaction {
                    let _ = runner.rollback_transaction().await;
                }
                Err(e)
            }
        }
    }

    async fn transition_delete_date_inner(
        &self,
        runner: &mut dyn QueryRunner,
        roots: &[EntityRef],
        operation: SubjectOperation,
    ) -> QuarryResult<()> {
        let dialect = self.driver.dialect();
        let builder = SubjectBuilder::new(Arc::clone(&self.registry), dialect);
        let subjects = builder.build_remove(roots, operation).await?;
        for subject in &subjects {
            self.execute_delete_date_transition(runner, subject, operation)
                .await?;
        }
        Ok(())
    }

    /// UPDATE moving the delete-date column for one subject. A delete date
    /// already set on the instance is kept; otherwise the soft removal
    /// stamps the current time.
    async fn execute_delete_date_transition(
        &self,
        runner: &mut dyn QueryRunner,
        subject: &Subject,
        operation: SubjectOperation,
    ) -> QuarryResult<()> {
        let dialect = self.driver.dialect();
        let metadata = self.registry.get(subject.metadata);
        let delete_date = metadata.delete_date().ok_or_else(|| {
            QuarryError::invalid_schema(
                metadata.name.clone(),
                "soft removal requires a delete-date column",
            )
        })?;
        let id = subject
            .identifier(&self.registry)
            .ok_or_else(|| QuarryError::MissingIdentifier {
                entity: metadata.name.clone(),
            })?;
        let value = match operation {
            SubjectOperation::SoftRemove => {
                match snapshot(&subject.entity).scalar(&delete_date.property_name) {
                    Value::Null => Value::DateTime(Utc::now().fixed_offset()),
                    provided => provided,
                }
            }
            _ => Value::Null,
        };
        let mut update = UpdateQueryBuilder::new(Arc::clone(&self.registry), &metadata.name)?
            .set(delete_date.property_name.clone(), value.clone());
        let mut writeback = vec![(delete_date.property_name.clone(), value)];
        if let Some(column) = metadata.update_date() {
            let now = Value::DateTime(Utc::now().fixed_offset());
            writeback.push((column.property_name.clone(), now.clone()));
            update = update.set(column.property_name.clone(), now);
        }
        update.where_in_ids(vec![id]).execute(runner, dialect).await?;
        write_props(&subject.entity, writeback)?;
        Ok(())
    }
}

fn write_props(entity: &EntityRef, values: Vec<(String, Value)>) -> QuarryResult<()> {
    if values.is_empty() {
        return Ok(());
    }
    let mut guard = entity
        .write()
        .map_err(|_| QuarryError::driver("entity lock poisoned"))?;
    for (property, value) in values {
        guard.set(property, value);
    }
    Ok(())
}
