//! Dialect-specific SQL surface: identifier escaping, placeholder
//! conventions and capability flags the query builders and persistence
//! executor branch on. The named-to-positional parameter expansion is a
//! pure function of dialect and must be bit-exact per convention.

use crate::error::{QuarryError, QuarryResult};
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
    MySql,
    Sqlite,
}

/// Statement kinds for the RETURNING capability check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturningKind {
    Insert,
    Update,
    Delete,
}

/// How the dialect spells an upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertFlavor {
    /// `INSERT ... ON CONFLICT (cols) DO UPDATE SET ...`
    OnConflict,
    /// `INSERT ... ON DUPLICATE KEY UPDATE ...`
    OnDuplicateKey,
}

impl Dialect {
    pub fn name(self) -> &'static str {
        match self {
            Dialect::Postgres => "postgres",
            Dialect::MySql => "mysql",
            Dialect::Sqlite => "sqlite",
        }
    }

    /// Escape an identifier (table, column or alias name).
    pub fn escape(self, identifier: &str) -> String {
        match self {
            Dialect::MySql => format!("`{}`", identifier.replace('`', "``")),
            _ => format!("\"{}\"", identifier.replace('"', "\"\"")),
        }
    }

    /// Placeholder token for the `index`-th (zero-based) positional
    /// parameter.
    pub fn placeholder(self, index: usize) -> String {
        match self {
            Dialect::Postgres => format!("${}", index + 1),
            _ => "?".to_string(),
        }
    }

    pub fn supports_returning(self, kind: ReturningKind) -> bool {
        let _ = kind;
        match self {
            // Postgres and modern SQLite accept RETURNING on all three
            // statement kinds; MySQL has no RETURNING at all.
            Dialect::Postgres | Dialect::Sqlite => true,
            Dialect::MySql => false,
        }
    }

    pub fn upsert_flavor(self) -> UpsertFlavor {
        match self {
            Dialect::MySql => UpsertFlavor::OnDuplicateKey,
            _ => UpsertFlavor::OnConflict,
        }
    }

    pub fn supports_ilike(self) -> bool {
        self == Dialect::Postgres
    }

    pub fn supports_array_operators(self) -> bool {
        self == Dialect::Postgres
    }

    /// Expand `:name` placeholders into the dialect's positional
    /// convention, returning the rewritten SQL and the parameters in the
    /// order they appear. `::` is left alone (Postgres cast syntax), and
    /// placeholders inside single-quoted literals are not substituted.
    pub fn escape_query_with_parameters(
        self,
        sql: &str,
        lookup: &dyn Fn(&str) -> Option<Value>,
    ) -> QuarryResult<(String, Vec<Value>)> {
        let mut out = String::with_capacity(sql.len());
        let mut params = Vec::new();
        let mut in_literal = false;
        let mut chars = sql.char_indices().peekable();
        while let Some((i, c)) = chars.next() {
            if c == '\'' {
                in_literal = !in_literal;
                out.push(c);
                continue;
            }
            if !in_literal && c == ':' {
                if let Some(&(_, ':')) = chars.peek() {
                    chars.next();
                    out.push_str("::");
                    continue;
                }
                // Parameter names are ASCII alphanumerics and underscores.
                let start = i + 1;
                let mut end = start;
                while let Some(&(j, n)) = chars.peek() {
                    if n.is_ascii_alphanumeric() || n == '_' {
                        end = j + 1;
                        chars.next();
                    } else {
                        break;
                    }
                }
                if end > start {
                    let name = &sql[start..end];
                    let value = lookup(name).ok_or_else(|| QuarryError::ParameterNotSet {
                        name: name.to_string(),
                    })?;
                    out.push_str(&self.placeholder(params.len()));
                    params.push(value);
                    continue;
                }
            }
            out.push(c);
        }
        Ok((out, params))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn lookup(map: &BTreeMap<String, Value>) -> impl Fn(&str) -> Option<Value> + '_ {
        move |name| map.get(name).cloned()
    }

    #[test]
    fn positional_placeholders_follow_dialect_convention() {
        let mut params = BTreeMap::new();
        params.insert("name".to_string(), Value::from("foo"));
        params.insert("age".to_string(), Value::from(3));

        let sql = "SELECT * FROM t WHERE name = :name AND age > :age";
        let (pg, pg_params) = Dialect::Postgres
            .escape_query_with_parameters(sql, &lookup(&params))
            .unwrap();
        assert_eq!(pg, "SELECT * FROM t WHERE name = $1 AND age > $2");
        assert_eq!(pg_params, vec![Value::from("foo"), Value::from(3)]);

        let (lite, _) = Dialect::Sqlite
            .escape_query_with_parameters(sql, &lookup(&params))
            .unwrap();
        assert_eq!(lite, "SELECT * FROM t WHERE name = ? AND age > ?");
    }

    #[test]
    fn double_colon_cast_is_not_a_parameter() {
        let params = BTreeMap::new();
        let (sql, bound) = Dialect::Postgres
            .escape_query_with_parameters("SELECT id::text FROM t", &lookup(&params))
            .unwrap();
        assert_eq!(sql, "SELECT id::text FROM t");
        assert!(bound.is_empty());
    }

    #[test]
    fn unset_parameter_is_a_typed_error() {
        let params = BTreeMap::new();
        let err = Dialect::Sqlite
            .escape_query_with_parameters("WHERE a = :missing", &lookup(&params))
            .unwrap_err();
        assert!(matches!(err, QuarryError::ParameterNotSet { .. }));
    }

    #[test]
    fn multibyte_text_survives_expansion() {
        let mut params = BTreeMap::new();
        params.insert("n".to_string(), Value::from("x"));
        let (sql, bound) = Dialect::Postgres
            .escape_query_with_parameters("SELECT 'café' WHERE name = :n", &lookup(&params))
            .unwrap();
        assert_eq!(sql, "SELECT 'café' WHERE name = $1");
        assert_eq!(bound, vec![Value::from("x")]);
    }

    #[test]
    fn repeated_parameter_binds_each_occurrence() {
        let mut params = BTreeMap::new();
        params.insert("v".to_string(), Value::from(1));
        let (sql, bound) = Dialect::Postgres
            .escape_query_with_parameters("WHERE a = :v OR b = :v", &lookup(&params))
            .unwrap();
        assert_eq!(sql, "WHERE a = $1 OR b = $2");
        assert_eq!(bound.len(), 2);
    }
}
