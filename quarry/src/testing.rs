//! Scripted driver for exercising the query builders, persistence planner
//! and hydrator without a real database. Records every statement it is
//! handed and replays queued results in order.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::dialect::Dialect;
use crate::driver::{Driver, ExecuteResult, QueryRunner, Row, RunnerMode};
use crate::error::QuarryResult;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    Query,
    Execute,
    StartTransaction,
    Commit,
    Rollback,
}

#[derive(Debug, Clone)]
pub struct ExecutedStatement {
    pub kind: StatementKind,
    pub sql: String,
    pub params: Vec<Value>,
}

#[derive(Default)]
struct ScriptState {
    log: Vec<ExecutedStatement>,
    query_results: VecDeque<Vec<Row>>,
    execute_results: VecDeque<ExecuteResult>,
    transaction_depth: usize,
}

/// Driver double shared by the integration tests. All runners created from
/// one instance share the same statement log and scripted result queues.
#[derive(Clone)]
pub struct ScriptedDriver {
    dialect: Dialect,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedDriver {
    pub fn new(dialect: Dialect) -> Self {
        Self {
            dialect,
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    /// Queue rows for the next `query` call.
    pub fn push_query_result(&self, rows: Vec<Row>) {
        self.state
            .lock()
            .expect("script state poisoned")
            .query_results
            .push_back(rows);
    }

    /// Queue the result of the next `execute` call.
    pub fn push_execute_result(&self, result: ExecuteResult) {
        self.state
            .lock()
            .expect("script state poisoned")
            .execute_results
            .push_back(result);
    }

    /// Queue a plain "n rows affected" execute result.
    pub fn push_affected(&self, rows_affected: u64) {
        self.push_execute_result(ExecuteResult {
            rows_affected,
            ..ExecuteResult::default()
        });
    }

    /// Queue an insert result carrying RETURNING rows.
    pub fn push_returning(&self, rows: Vec<Row>) {
        let rows_affected = rows.len() as u64;
        self.push_execute_result(ExecuteResult {
            rows_affected,
            last_insert_id: None,
            rows,
        });
    }

    /// Everything executed so far, in order.
    pub fn executed(&self) -> Vec<ExecutedStatement> {
        self.state.lock().expect("script state poisoned").log.clone()
    }

    /// Executed statements of one kind.
    pub fn executed_of(&self, kind: StatementKind) -> Vec<ExecutedStatement> {
        self.executed()
            .into_iter()
            .filter(|s| s.kind == kind)
            .collect()
    }

    pub fn clear_log(&self) {
        self.state.lock().expect("script state poisoned").log.clear();
    }
}

/// Build a scripted result row from property pairs.
pub fn row(pairs: Vec<(&str, Value)>) -> Row {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect::<BTreeMap<_, _>>()
}

#[async_trait]
impl Driver for ScriptedDriver {
    fn dialect(&self) -> Dialect {
        self.dialect
    }

    async fn connect(&self) -> QuarryResult<()> {
        Ok(())
    }

    async fn disconnect(&self) -> QuarryResult<()> {
        Ok(())
    }

    async fn create_query_runner(&self, _mode: RunnerMode) -> QuarryResult<Box<dyn QueryRunner>> {
        Ok(Box::new(ScriptedRunner {
            state: Arc::clone(&self.state),
        }))
    }
}

struct ScriptedRunner {
    state: Arc<Mutex<ScriptState>>,
}

#[async_trait]
impl QueryRunner for ScriptedRunner {
    async fn query(&mut self, sql: &str, params: &[Value]) -> QuarryResult<Vec<Row>> {
        let mut state = self.state.lock().expect("script state poisoned");
        state.log.push(ExecutedStatement {
            kind: StatementKind::Query,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        Ok(state.query_results.pop_front().unwrap_or_default())
    }

    async fn execute(&mut self, sql: &str, params: &[Value]) -> QuarryResult<ExecuteResult> {
        let mut state = self.state.lock().expect("script state poisoned");
        state.log.push(ExecutedStatement {
            kind: StatementKind::Execute,
            sql: sql.to_string(),
            params: params.to_vec(),
        });
        Ok(state.execute_results.pop_front().unwrap_or(ExecuteResult {
            rows_affected: 1,
            ..ExecuteResult::default()
        }))
    }

    async fn start_transaction(&mut self) -> QuarryResult<()> {
        let mut state = self.state.lock().expect("script state poisoned");
        state.transaction_depth += 1;
        state.log.push(ExecutedStatement {
            kind: StatementKind::StartTransaction,
            sql: "BEGIN".to_string(),
            params: Vec::new(),
        });
        Ok(())
    }

    async fn commit_transaction(&mut self) -> QuarryResult<()> {
        let mut state = self.state.lock().expect("script state poisoned");
        state.transaction_depth = state.transaction_depth.saturating_sub(1);
        state.log.push(ExecutedStatement {
            kind: StatementKind::Commit,
            sql: "COMMIT".to_string(),
            params: Vec::new(),
        });
        Ok(())
    }

    async fn rollback_transaction(&mut self) -> QuarryResult<()> {
        let mut state = self.state.lock().expect("script state poisoned");
        state.transaction_depth = state.transaction_depth.saturating_sub(1);
        state.log.push(ExecutedStatement {
            kind: StatementKind::Rollback,
            sql: "ROLLBACK".to_string(),
            params: Vec::new(),
        });
        Ok(())
    }

    fn is_transaction_active(&self) -> bool {
        self.state
            .lock()
            .expect("script state poisoned")
            .transaction_depth
            > 0
    }

    async fn release(&mut self) -> QuarryResult<()> {
        Ok(())
    }
}
