use super::{DbError, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref IDENTIFIER: Regex = Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*(\.[A-Za-z_][A-Za-z0-9_]*)?$")
        .expect("identifier pattern is valid");
}

/// Returns `true` when `name` can be spliced into SQL without quoting
/// (optionally schema-qualified, e.g. `public.users`).
pub fn is_sql_identifier(name: &str) -> bool {
    IDENTIFIER.is_match(name)
}

/// Storage mapping for one entity kind, supplied by the schema layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMetadata {
    pub entity: String,
    pub table: String,
    pub primary_key: Vec<String>,
    /// `(field, column)` pairs in declaration order.
    pub columns: Vec<(String, String)>,
}

impl EntityMetadata {
    pub fn new(entity: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            table: table.into(),
            primary_key: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// Adds a primary-key field. Call more than once for composite keys.
    pub fn primary_key(mut self, field: impl Into<String>) -> Self {
        self.primary_key.push(field.into());
        self
    }

    pub fn column(mut self, field: impl Into<String>, column: impl Into<String>) -> Self {
        self.columns.push((field.into(), column.into()));
        self
    }

    /// Maps every listed field to a column of the same name.
    pub fn columns<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for field in fields {
            let field = field.into();
            self.columns.push((field.clone(), field));
        }
        self
    }

    pub fn column_for(&self, field: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, c)| c.as_str())
    }

    pub fn is_primary_key(&self, field: &str) -> bool {
        self.primary_key.iter().any(|pk| pk == field)
    }

    pub fn validate(&self) -> Result<()> {
        if !is_sql_identifier(&self.table) {
            return Err(DbError::InvalidConfig(format!(
                "table name '{}' for entity '{}' is not a valid identifier",
                self.table, self.entity
            )));
        }
        if self.primary_key.is_empty() {
            return Err(DbError::InvalidConfig(format!(
                "entity '{}' declares no primary key",
                self.entity
            )));
        }
        for (field, column) in &self.columns {
            if !is_sql_identifier(column) {
                return Err(DbError::InvalidConfig(format!(
                    "column '{}' for field '{}.{}' is not a valid identifier",
                    column, self.entity, field
                )));
            }
        }
        for pk in &self.primary_key {
            if self.column_for(pk).is_none() {
                return Err(DbError::InvalidConfig(format!(
                    "primary key field '{}' of entity '{}' has no column mapping",
                    pk, self.entity
                )));
            }
        }
        Ok(())
    }
}
