//! Quarry is a database mapping core: an explicit metadata registry,
//! criteria and query builders rendering dialect-specific SQL, a
//! change-tracking persistence engine, and hydration of flat result rows
//! back into entity graphs.
//!
//! The crate is driver-agnostic. Everything touching a database goes
//! through the [`driver::Driver`] and [`driver::QueryRunner`] traits;
//! [`testing::ScriptedDriver`] implements them over scripted results for
//! tests.
//!
//! ```no_run
//! use quarry::metadata::{ColumnSchema, EntitySchema, MetadataRegistry};
//!
//! # fn main() -> quarry::QuarryResult<()> {
//! let registry = MetadataRegistry::build(vec![EntitySchema::new("User", "users")
//!     .column(ColumnSchema::primary_generated("id"))
//!     .column(ColumnSchema::text("name"))])?;
//! # let _ = registry;
//! # Ok(())
//! # }
//! ```

pub mod criteria;
pub mod dialect;
pub mod driver;
pub mod entity;
pub mod error;
pub mod hydration;
pub mod manager;
pub mod metadata;
pub mod persist;
pub mod query;
pub mod testing;
pub mod value;

pub use criteria::{ops, Criterion, FindOperator};
pub use dialect::Dialect;
pub use entity::{entity_ref, EntityInstance, EntityRef, PropValue};
pub use error::{QuarryError, QuarryResult};
pub use manager::{EntityManager, FindOptions, Repository};
pub use metadata::{ColumnSchema, EntitySchema, MetadataRegistry, RelationSchema};
pub use value::{ColumnType, Value};
