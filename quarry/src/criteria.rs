//! A small closed algebra of find operators and composite criteria, used by
//! the query builder's WHERE clause and by find-options translation.
//!
//! Each operator is a tagged variant carrying its operands; rendering to
//! SQL happens in the query module with dialect-correct tokens and
//! parameter registration. User values are always bound through the
//! parameter bag — the single exception is [`FindOperator::Raw`], which is
//! trusted literal text the caller is responsible for sanitizing.

use std::collections::BTreeMap;

use crate::value::Value;

#[derive(Debug, Clone)]
pub enum FindOperator {
    Equal(Value),
    /// Negates the wrapped operator (`Not(IsNull)` renders `IS NOT NULL`,
    /// `Not(Equal(v))` renders `!=`).
    Not(Box<FindOperator>),
    In(Vec<Value>),
    /// Postgres `= ANY(...)`.
    Any(Vec<Value>),
    Between(Value, Value),
    LessThan(Value),
    LessThanOrEqual(Value),
    MoreThan(Value),
    MoreThanOrEqual(Value),
    Like(String),
    /// Case-insensitive LIKE; native on Postgres, emulated via `LOWER`
    /// elsewhere.
    ILike(String),
    IsNull,
    /// Postgres `@>`.
    ArrayContains(Vec<Value>),
    /// Postgres `&&`.
    ArrayOverlap(Vec<Value>),
    /// Trusted literal SQL. `{}` marks where the column expression is
    /// substituted; `:name` placeholders bind the supplied parameters.
    Raw {
        sql: String,
        params: Vec<(String, Value)>,
    },
}

impl FindOperator {
    /// Operator token used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            FindOperator::Equal(_) => "equal",
            FindOperator::Not(_) => "not",
            FindOperator::In(_) => "in",
            FindOperator::Any(_) => "any",
            FindOperator::Between(..) => "between",
            FindOperator::LessThan(_) => "less-than",
            FindOperator::LessThanOrEqual(_) => "less-than-or-equal",
            FindOperator::MoreThan(_) => "more-than",
            FindOperator::MoreThanOrEqual(_) => "more-than-or-equal",
            FindOperator::Like(_) => "like",
            FindOperator::ILike(_) => "ilike",
            FindOperator::IsNull => "is-null",
            FindOperator::ArrayContains(_) => "array-contains",
            FindOperator::ArrayOverlap(_) => "array-overlap",
            FindOperator::Raw { .. } => "raw",
        }
    }
}

/// One node of a WHERE criteria tree. `Nested` maps keys to criteria; a key
/// naming a relation descends into the joined entity (the query builder
/// adds or reuses the LEFT JOIN), a key naming a column is a leaf.
#[derive(Debug, Clone)]
pub enum Criterion {
    /// Shorthand for `Operator(Equal(value))`.
    Value(Value),
    Operator(FindOperator),
    Nested(BTreeMap<String, Criterion>),
    And(Vec<Criterion>),
    Or(Vec<Criterion>),
}

impl Criterion {
    pub fn nested<I, K>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, Criterion)>,
        K: Into<String>,
    {
        Criterion::Nested(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v))
                .collect(),
        )
    }

    pub fn value(value: impl Into<Value>) -> Self {
        Criterion::Value(value.into())
    }

    pub fn op(operator: FindOperator) -> Self {
        Criterion::Operator(operator)
    }
}

/// Builder-style helpers mirroring the operator constructors of the source
/// API (`Equal`, `In`, `Between`, ...).
pub mod ops {
    use super::FindOperator;
    use crate::value::Value;

    pub fn equal(value: impl Into<Value>) -> FindOperator {
        FindOperator::Equal(value.into())
    }

    pub fn not(operator: FindOperator) -> FindOperator {
        FindOperator::Not(Box::new(operator))
    }

    pub fn not_equal(value: impl Into<Value>) -> FindOperator {
        not(equal(value))
    }

    pub fn in_values<T: Into<Value>>(values: Vec<T>) -> FindOperator {
        FindOperator::In(values.into_iter().map(Into::into).collect())
    }

    pub fn any<T: Into<Value>>(values: Vec<T>) -> FindOperator {
        FindOperator::Any(values.into_iter().map(Into::into).collect())
    }

    pub fn between(low: impl Into<Value>, high: impl Into<Value>) -> FindOperator {
        FindOperator::Between(low.into(), high.into())
    }

    pub fn less_than(value: impl Into<Value>) -> FindOperator {
        FindOperator::LessThan(value.into())
    }

    pub fn less_than_or_equal(value: impl Into<Value>) -> FindOperator {
        FindOperator::LessThanOrEqual(value.into())
    }

    pub fn more_than(value: impl Into<Value>) -> FindOperator {
        FindOperator::MoreThan(value.into())
    }

    pub fn more_than_or_equal(value: impl Into<Value>) -> FindOperator {
        FindOperator::MoreThanOrEqual(value.into())
    }

    pub fn like(pattern: impl Into<String>) -> FindOperator {
        FindOperator::Like(pattern.into())
    }

    pub fn ilike(pattern: impl Into<String>) -> FindOperator {
        FindOperator::ILike(pattern.into())
    }

    pub fn is_null() -> FindOperator {
        FindOperator::IsNull
    }

    pub fn array_contains<T: Into<Value>>(values: Vec<T>) -> FindOperator {
        FindOperator::ArrayContains(values.into_iter().map(Into::into).collect())
    }

    pub fn array_overlap<T: Into<Value>>(values: Vec<T>) -> FindOperator {
        FindOperator::ArrayOverlap(values.into_iter().map(Into::into).collect())
    }

    pub fn raw(sql: impl Into<String>, params: Vec<(&str, Value)>) -> FindOperator {
        FindOperator::Raw {
            sql: sql.into(),
            params: params
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }
}
