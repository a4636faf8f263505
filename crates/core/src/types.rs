//! Table, column and index specification types.
//!
//! These are the inputs to the schema compiler (what the caller wants to
//! exist) and the outputs of schema introspection (what actually exists).

use serde::{Deserialize, Serialize};

/// A column in a table specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name
    pub name: String,
    /// SQL type, e.g. `text` or `numeric(10,2)`
    pub sql_type: String,
    /// Whether NULL values are accepted
    pub nullable: bool,
    /// Default expression, spliced verbatim into the DDL
    pub default: Option<String>,
}

impl ColumnSpec {
    /// A nullable column with no default.
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            nullable: true,
            default: None,
        }
    }

    /// Mark the column NOT NULL.
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    /// Attach a default expression.
    pub fn default_expr(mut self, expr: impl Into<String>) -> Self {
        self.default = Some(expr.into());
        self
    }
}

/// A table specification handed to the schema compiler.
///
/// The primary key is a surrogate `BIGSERIAL` column; temporal tables
/// require one because history rows reference their logical record
/// through it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSpec {
    /// Logical table name
    pub name: String,
    /// Primary-key column name; `None` only for non-temporal tables
    pub primary_key: Option<String>,
    /// Non-key columns in declaration order
    pub columns: Vec<ColumnSpec>,
}

impl TableSpec {
    /// A specification with the conventional `id` primary key.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: Some("id".to_string()),
            columns: Vec::new(),
        }
    }

    /// Drop the primary key from the specification.
    pub fn without_primary_key(mut self) -> Self {
        self.primary_key = None;
        self
    }

    /// Append a column.
    pub fn column(mut self, name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        self.columns.push(ColumnSpec::new(name, sql_type));
        self
    }

    /// Append a fully specified column.
    pub fn column_spec(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }

    /// Names of the non-key columns, in declaration order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }
}

/// An index specification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexSpec {
    /// Indexed columns, in order
    pub columns: Vec<String>,
    /// Whether the index enforces uniqueness
    pub unique: bool,
    /// Explicit index name; derived from the columns when absent
    pub name: Option<String>,
}

impl IndexSpec {
    /// A non-unique index over the given columns.
    pub fn new<I, S>(columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
            name: None,
        }
    }

    /// Mark the index UNIQUE.
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Give the index an explicit name.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The effective index name for a table: the explicit name when
    /// given, otherwise `index_<table>_on_<c1>_and_<c2>`.
    pub fn name_for(&self, table: &str) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("index_{}_on_{}", table, self.columns.join("_and_")),
        }
    }
}

/// A column as reported by schema introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ColumnDefinition {
    /// Column name
    pub name: String,
    /// Reported SQL type
    pub sql_type: String,
    /// Whether NULL values are accepted
    pub nullable: bool,
    /// Default expression, if any
    pub default: Option<String>,
}

/// An index as reported by schema introspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexDefinition {
    /// Index name
    pub name: String,
    /// Whether the index enforces uniqueness
    pub unique: bool,
    /// Full `CREATE INDEX` definition
    pub definition: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_spec_builder() {
        let spec = TableSpec::new("foos")
            .column("name", "text")
            .column_spec(ColumnSpec::new("email", "text").not_null());

        assert_eq!(spec.primary_key.as_deref(), Some("id"));
        assert_eq!(spec.column_names(), vec!["name", "email"]);
        assert!(!spec.columns[1].nullable);
    }

    #[test]
    fn index_name_derivation() {
        let index = IndexSpec::new(["email", "name"]);
        assert_eq!(index.name_for("foos"), "index_foos_on_email_and_name");

        let named = IndexSpec::new(["email"]).named("foos_email_idx");
        assert_eq!(named.name_for("foos"), "foos_email_idx");
    }
}
