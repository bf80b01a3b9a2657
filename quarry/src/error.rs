use crate::value::Value;

/// Crate-wide result alias for ergonomics (non-conflicting)
pub type QuarryResult<T> = std::result::Result<T, QuarryError>;

/// Typed errors surfaced by the metadata registry, query builders,
/// persistence planner and result transformers.
///
/// Every variant carries the offending identifier so failures can be
/// diagnosed without re-running with tracing enabled. Nothing in the core
/// swallows one of these and substitutes a default value.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QuarryError {
    // Configuration / metadata errors
    #[error("entity metadata not found for target '{target}'")]
    EntityMetadataNotFound { target: String },

    #[error("column '{property}' not found on entity '{entity}'")]
    ColumnNotFound { entity: String, property: String },

    #[error("relations not found on entity '{entity}': [{}]", paths.join(", "))]
    RelationsNotFound { entity: String, paths: Vec<String> },

    #[error("duplicate table name '{table}' in schema '{schema}'")]
    DuplicateTableName { table: String, schema: String },

    #[error("entity '{entity}' has no primary column")]
    MissingPrimaryColumn { entity: String },

    #[error("invalid entity schema for '{entity}': {message}")]
    InvalidSchema { entity: String, message: String },

    // Query construction errors
    #[error("alias '{alias}' was not found in this query")]
    AliasNotFound { alias: String },

    #[error("query validation failed: {message}")]
    QueryValidation { message: String },

    #[error("parameter '{name}' was referenced in the query but never set")]
    ParameterNotSet { name: String },

    #[error("operator {operator} is not supported by the {dialect} dialect")]
    UnsupportedOperator { operator: String, dialect: String },

    // Driver / transport errors, wrapped with the SQL and parameters that
    // produced them for diagnosability
    #[error("query failed: {message} -- sql: {sql} -- parameters: {parameters:?}")]
    QueryFailed {
        message: String,
        sql: String,
        parameters: Vec<Value>,
    },

    #[error("driver error: {message}")]
    Driver { message: String },

    #[error("connection error: {message}")]
    Connection { message: String },

    #[error("transaction error: {message}")]
    Transaction { message: String },

    // Consistency errors
    #[error("cannot update entity '{entity}': database row {id} no longer exists")]
    EntityNotFoundForUpdate { entity: String, id: String },

    #[error("entity '{entity}' has no identifier and cannot be updated or removed")]
    MissingIdentifier { entity: String },

    #[error(
        "cyclic foreign-key dependency with no nullable break point: [{}]",
        entities.join(" -> ")
    )]
    CyclicDependency { entities: Vec<String> },

    #[error(
        "optimistic lock failed on '{entity}': expected version {expected}, zero rows affected"
    )]
    OptimisticLock { entity: String, expected: i64 },

    // Type system errors
    #[error("cannot convert value '{value}' to {to_type} for column '{column}'")]
    TypeConversion {
        column: String,
        to_type: String,
        value: String,
    },
}

impl QuarryError {
    pub fn query_validation(message: impl Into<String>) -> Self {
        Self::QueryValidation {
            message: message.into(),
        }
    }

    pub fn invalid_schema(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidSchema {
            entity: entity.into(),
            message: message.into(),
        }
    }

    pub fn driver(message: impl Into<String>) -> Self {
        Self::Driver {
            message: message.into(),
        }
    }

    pub fn transaction(message: impl Into<String>) -> Self {
        Self::Transaction {
            message: message.into(),
        }
    }

    /// Attach the SQL and bound parameters to a driver failure.
    pub fn with_query(self, sql: impl Into<String>, parameters: &[Value]) -> Self {
        match self {
            Self::Driver { message } | Self::QueryFailed { message, .. } => Self::QueryFailed {
                message,
                sql: sql.into(),
                parameters: parameters.to_vec(),
            },
            other => other,
        }
    }

    /// Whether retrying the operation could plausibly succeed.
    /// Configuration, schema and type errors never recover.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::Driver { .. } | Self::QueryFailed { .. }
        )
    }
}
