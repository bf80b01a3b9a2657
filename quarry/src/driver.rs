//! Contract between the core and concrete database drivers. The core only
//! ever consumes this surface: connect, run statements with bound
//! parameters, manage transactions, and normalize values in both
//! directions. Wire protocols live entirely behind it.

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::dialect::{Dialect, ReturningKind};
use crate::error::QuarryResult;
use crate::metadata::{ColumnMetadata, EntityMetadata};
use crate::value::Value;

/// A flat result row: aliased column name to value.
pub type Row = BTreeMap<String, Value>;

/// Outcome of a mutating statement.
#[derive(Debug, Clone, Default)]
pub struct ExecuteResult {
    pub rows_affected: u64,
    /// Auto-increment key of the last inserted row, when the dialect
    /// reports one and no RETURNING clause was used.
    pub last_insert_id: Option<i64>,
    /// Rows produced by a RETURNING clause.
    pub rows: Vec<Row>,
}

/// Which member of a replicated setup a runner should talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerMode {
    Master,
    Slave,
}

/// One logical connection/session capable of running statements and
/// transactions. Statements of a single persistence operation execute
/// sequentially on one runner; unrelated operations take their own.
#[async_trait]
pub trait QueryRunner: Send {
    async fn query(&mut self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Row>>;

    async fn execute(&mut self, sql: &str, params: &[Value]) -> QuarryResult<ExecuteResult>;

    async fn start_transaction(&mut self) -> QuarryResult<()>;

    async fn commit_transaction(&mut self) -> QuarryResult<()>;

    async fn rollback_transaction(&mut self) -> QuarryResult<()>;

    fn is_transaction_active(&self) -> bool;

    /// Return the underlying connection to the driver's pool.
    async fn release(&mut self) -> QuarryResult<()>;
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn dialect(&self) -> Dialect;

    async fn connect(&self) -> QuarryResult<()>;

    async fn disconnect(&self) -> QuarryResult<()>;

    async fn create_query_runner(&self, mode: RunnerMode) -> QuarryResult<Box<dyn QueryRunner>>;

    /// Application value to wire value for one column. The default defers
    /// to the column's logical type and transformer.
    fn prepare_persistent_value(&self, value: Value, column: &ColumnMetadata) -> QuarryResult<Value> {
        column.prepare_persistent_value(value)
    }

    /// Wire value back to application value for one column.
    fn prepare_hydrated_value(&self, value: Value, column: &ColumnMetadata) -> QuarryResult<Value> {
        column.prepare_hydrated_value(value)
    }

    fn is_returning_supported(&self, kind: ReturningKind) -> bool {
        self.dialect().supports_returning(kind)
    }

    /// Map one inserted row's generated column values back to property
    /// names. `row_index` selects the row within a multi-row insert;
    /// `row_count` is the batch size, needed to demultiplex a single
    /// last-insert-id into per-row increments.
    fn create_generated_map(
        &self,
        metadata: &EntityMetadata,
        result: &ExecuteResult,
        row_index: usize,
        row_count: usize,
    ) -> QuarryResult<BTreeMap<String, Value>> {
        let mut generated = BTreeMap::new();
        if let Some(row) = result.rows.get(row_index) {
            for column in &metadata.columns {
                if let Some(value) = row.get(&column.database_name) {
                    let value = self.prepare_hydrated_value(value.clone(), column)?;
                    generated.insert(column.property_name.clone(), value);
                }
            }
            return Ok(generated);
        }
        if let Some(last_id) = result.last_insert_id {
            if let Some(column) = metadata.columns.iter().find(|c| {
                c.is_generated
                    && c.generation_strategy
                        == Some(crate::metadata::GenerationStrategy::Increment)
            }) {
                // last_insert_id names the final row of the batch; earlier
                // rows count backwards from it.
                let offset = (row_count - 1 - row_index) as i64;
                generated.insert(column.property_name.clone(), Value::Int(last_id - offset));
            }
        }
        Ok(generated)
    }
}
