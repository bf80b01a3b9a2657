//! Persistence engine: planning (cascade walk, database load, diff),
//! ordering (foreign-key topological sort with nullable cycle breaks) and
//! execution (batched statements in one transaction with generated-key
//! writeback).

mod builder;
mod executor;
mod ordering;
mod subject;

pub use builder::SubjectBuilder;
pub use executor::PersistExecutor;
pub use ordering::{insertion_order, InsertionPlan};
pub use subject::{JunctionChange, JunctionValue, Subject, SubjectOperation};
