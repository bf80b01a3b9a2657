//! INSERT builder: multi-row batches with a uniform column shape,
//! dialect-specific conflict handling and RETURNING of generated columns
//! where the dialect supports it.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;

use crate::dialect::{Dialect, ReturningKind, UpsertFlavor};
use crate::driver::{ExecuteResult, QueryRunner};
use crate::error::{QuarryError, QuarryResult};
use crate::metadata::{EntityId, MetadataRegistry};
use crate::query::where_clause::ParamSink;
use crate::value::Value;

/// Conflict handling for an insert.
#[derive(Debug, Clone)]
pub enum OnConflict {
    /// Skip rows that violate the conflict target.
    Ignore { conflict_columns: Vec<String> },
    /// Overwrite the listed properties on conflict.
    Update {
        conflict_columns: Vec<String>,
        overwrite: Vec<String>,
    },
}

pub struct InsertQueryBuilder {
    registry: Arc<MetadataRegistry>,
    entity: EntityId,
    /// Property-name keyed rows; the rendered column shape is the union of
    /// all row keys, absent slots render as DEFAULT.
    rows: Vec<BTreeMap<String, Value>>,
    on_conflict: Option<OnConflict>,
    use_returning: bool,
}

impl InsertQueryBuilder {
    pub fn new(registry: Arc<MetadataRegistry>, entity: &str) -> QuarryResult<Self> {
        let entity = registry.id_of(entity)?;
        Ok(Self {
            registry,
            entity,
            rows: Vec::new(),
            on_conflict: None,
            use_returning: true,
        })
    }

    pub fn values(mut self, row: BTreeMap<String, Value>) -> Self {
        self.rows.push(row);
        self
    }

    pub fn values_many(mut self, rows: Vec<BTreeMap<String, Value>>) -> Self {
        self.rows.extend(rows);
        self
    }

    pub fn or_ignore(mut self, conflict_columns: Vec<String>) -> Self {
        self.on_conflict = Some(OnConflict::Ignore { conflict_columns });
        self
    }

    pub fn or_update(mut self, conflict_columns: Vec<String>, overwrite: Vec<String>) -> Self {
        self.on_conflict = Some(OnConflict::Update {
            conflict_columns,
            overwrite,
        });
        self
    }

    /// Suppress the RETURNING clause even where the dialect supports it.
    pub fn no_returning(mut self) -> Self {
        self.use_returning = false;
        self
    }

    /// The union of property names across all rows, in first-appearance
    /// order, so every batch row renders with the same shape.
    fn column_shape(&self) -> Vec<String> {
        let mut shape: Vec<String> = Vec::new();
        for row in &self.rows {
            for key in row.keys() {
                if !shape.iter().any(|s| s == key) {
                    shape.push(key.clone());
                }
            }
        }
        shape
    }

    /// Generated and bookkeeping columns to read back after the insert.
    fn returning_columns(&self) -> Vec<String> {
        let metadata = self.registry.get(self.entity);
        let mut out: Vec<String> = Vec::new();
        let mut push = |name: &str| {
            if !out.iter().any(|o| o == name) {
                out.push(name.to_string());
            }
        };
        for column in &metadata.columns {
            if column.is_generated {
                push(&column.database_name);
            }
        }
        if let Some(c) = metadata.create_date_column.map(|i| &metadata.columns[i]) {
            push(&c.database_name);
        }
        if let Some(c) = metadata.update_date_column.map(|i| &metadata.columns[i]) {
            push(&c.database_name);
        }
        if let Some(c) = metadata.version_column.map(|i| &metadata.columns[i]) {
            push(&c.database_name);
        }
        out
    }

    pub fn get_query_and_parameters(
        &self,
        dialect: Dialect,
    ) -> QuarryResult<(String, Vec<Value>)> {
        if self.rows.is_empty() {
            return Err(QuarryError::query_validation("insert has no value rows"));
        }
        let metadata = self.registry.get(self.entity);
        let shape = self.column_shape();
        let mut sink = ParamSink::new(&BTreeMap::new(), 0);

        let mut columns = Vec::with_capacity(shape.len());
        for property in &shape {
            let column = metadata
                .find_column_with_property_path(property)
                .ok_or_else(|| QuarryError::ColumnNotFound {
                    entity: metadata.name.clone(),
                    property: property.clone(),
                })?;
            columns.push(column);
        }

        let ignore_prefix = matches!(
            (&self.on_conflict, dialect.upsert_flavor()),
            (Some(OnConflict::Ignore { .. }), UpsertFlavor::OnDuplicateKey)
        );
        let table = match &metadata.schema {
            Some(schema) => format!(
                "{}.{}",
                dialect.escape(schema),
                dialect.escape(&metadata.table_name)
            ),
            None => dialect.escape(&metadata.table_name),
        };
        let mut sql = format!(
            "INSERT{} INTO {} ({})",
            if ignore_prefix { " IGNORE" } else { "" },
            table,
            columns
                .iter()
                .map(|c| dialect.escape(&c.database_name))
                .collect::<Vec<_>>()
                .join(", ")
        );

        sql.push_str(" VALUES ");
        let mut tuples = Vec::with_capacity(self.rows.len());
        for row in &self.rows {
            let mut slots = Vec::with_capacity(shape.len());
            for (property, column) in shape.iter().zip(&columns) {
                match row.get(property) {
                    Some(value) => {
                        let prepared = column.prepare_persistent_value(value.clone())?;
                        slots.push(sink.bind(prepared));
                    }
                    // sqlite has no DEFAULT keyword in a VALUES list.
                    None if dialect == Dialect::Sqlite => slots.push("NULL".to_string()),
                    None => slots.push("DEFAULT".to_string()),
                }
            }
            tuples.push(format!("({})", slots.join(", ")));
        }
        sql.push_str(&tuples.join(", "));

        match (&self.on_conflict, dialect.upsert_flavor()) {
            (Some(OnConflict::Ignore { conflict_columns }), UpsertFlavor::OnConflict) => {
                sql.push_str(&format!(
                    " ON CONFLICT ({}) DO NOTHING",
                    self.conflict_target(dialect, conflict_columns)?
                ));
            }
            (
                Some(OnConflict::Update {
                    conflict_columns,
                    overwrite,
                }),
                UpsertFlavor::OnConflict,
            ) => {
                let sets: Vec<String> = overwrite
                    .iter()
                    .map(|property| {
                        let column = metadata
                            .find_column_with_property_path(property)
                            .ok_or_else(|| QuarryError::ColumnNotFound {
                                entity: metadata.name.clone(),
                                property: property.clone(),
                            })?;
                        Ok(format!(
                            "{} = EXCLUDED.{}",
                            dialect.escape(&column.database_name),
                            dialect.escape(&column.database_name)
                        ))
                    })
                    .collect::<QuarryResult<_>>()?;
                sql.push_str(&format!(
                    " ON CONFLICT ({}) DO UPDATE SET {}",
                    self.conflict_target(dialect, conflict_columns)?,
                    sets.join(", ")
                ));
            }
            (
                Some(OnConflict::Update {
                    overwrite, ..
                }),
                UpsertFlavor::OnDuplicateKey,
            ) => {
                let sets: Vec<String> = overwrite
                    .iter()
                    .map(|property| {
                        let column = metadata
                            .find_column_with_property_path(property)
                            .ok_or_else(|| QuarryError::ColumnNotFound {
                                entity: metadata.name.clone(),
                                property: property.clone(),
                            })?;
                        Ok(format!(
                            "{} = VALUES({})",
                            dialect.escape(&column.database_name),
                            dialect.escape(&column.database_name)
                        ))
                    })
                    .collect::<QuarryResult<_>>()?;
                sql.push_str(&format!(" ON DUPLICATE KEY UPDATE {}", sets.join(", ")));
            }
            _ => {}
        }

        if self.use_returning && dialect.supports_returning(ReturningKind::Insert) {
            let returning = self.returning_columns();
            if !returning.is_empty() {
                sql.push_str(" RETURNING ");
                sql.push_str(
                    &returning
                        .iter()
                        .map(|c| dialect.escape(c))
                        .collect::<Vec<_>>()
                        .join(", "),
                );
            }
        }

        let named = sink.named;
        dialect.escape_query_with_parameters(&sql, &|name| named.get(name).cloned())
    }

    fn conflict_target(&self, dialect: Dialect, properties: &[String]) -> QuarryResult<String> {
        let metadata = self.registry.get(self.entity);
        let target = if properties.is_empty() {
            metadata
                .primary_columns()
                .map(|c| dialect.escape(&c.database_name))
                .collect::<Vec<_>>()
        } else {
            properties
                .iter()
                .map(|property| {
                    metadata
                        .find_column_with_property_path(property)
                        .map(|c| dialect.escape(&c.database_name))
                        .ok_or_else(|| QuarryError::ColumnNotFound {
                            entity: metadata.name.clone(),
                            property: property.clone(),
                        })
                })
                .collect::<QuarryResult<Vec<_>>>()?
        };
        Ok(target.join(", "))
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
