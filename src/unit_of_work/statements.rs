//! Builds the parameterized INSERT/UPDATE/DELETE statements for a commit.
//!
//! Placeholders are positional (`$1`, `$2`, ...). Table and column names
//! come from validated metadata and are spliced in as-is.

use crate::core::{EntityMetadata, Result, Value};
use crate::tracking::{ChangeType, EntityChange};
use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub sql: String,
    pub params: Vec<Value>,
}

/// Returns `None` when the change has nothing to write (an update whose
/// changed fields map to no column).
pub fn build(metadata: &EntityMetadata, change: &EntityChange) -> Result<Option<Statement>> {
    match change.change_type {
        ChangeType::Deleted => build_delete(metadata, change).map(Some),
        ChangeType::Updated => build_update(metadata, change),
        ChangeType::Created => Ok(Some(build_insert(metadata, &change.snapshot))),
    }
}

pub fn build_delete(metadata: &EntityMetadata, change: &EntityChange) -> Result<Statement> {
    let mut params = Vec::new();
    let predicate = key_predicate(metadata, change, &mut params)?;
    Ok(Statement {
        sql: format!("DELETE FROM {} WHERE {}", metadata.table, predicate),
        params,
    })
}

/// SET covers exactly the mapped, non-key top-level fields that changed.
pub fn build_update(metadata: &EntityMetadata, change: &EntityChange) -> Result<Option<Statement>> {
    let changed = change.changed_top_level_fields();
    let mut params = Vec::new();
    let mut assignments = Vec::new();

    for (field, column) in &metadata.columns {
        if metadata.is_primary_key(field) || !changed.contains(&field.as_str()) {
            continue;
        }
        params.push(field_value(&change.snapshot, field));
        assignments.push(format!("{} = ${}", column, params.len()));
    }

    if assignments.is_empty() {
        return Ok(None);
    }

    let predicate = key_predicate(metadata, change, &mut params)?;
    Ok(Some(Statement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            metadata.table,
            assignments.join(", "),
            predicate
        ),
        params,
    }))
}

/// Inserts every mapped field present in the snapshot; absent fields are
/// left to column defaults.
pub fn build_insert(metadata: &EntityMetadata, snapshot: &Map<String, Json>) -> Statement {
    let mut columns = Vec::new();
    let mut placeholders = Vec::new();
    let mut params = Vec::new();

    for (field, column) in &metadata.columns {
        let Some(value) = snapshot.get(field) else {
            continue;
        };
        params.push(Value::from(value));
        columns.push(column.as_str());
        placeholders.push(format!("${}", params.len()));
    }

    Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            metadata.table,
            columns.join(", "),
            placeholders.join(", ")
        ),
        params,
    }
}

fn key_predicate(
    metadata: &EntityMetadata,
    change: &EntityChange,
    params: &mut Vec<Value>,
) -> Result<String> {
    let mut clauses = Vec::with_capacity(metadata.primary_key.len());
    for field in &metadata.primary_key {
        let column = metadata.column_for(field).unwrap_or(field.as_str());
        params.push(change.id().value_for(field, &metadata.primary_key)?);
        clauses.push(format!("{} = ${}", column, params.len()));
    }
    Ok(clauses.join(" AND "))
}

fn field_value(snapshot: &Map<String, Json>, field: &str) -> Value {
    snapshot.get(field).map(Value::from).unwrap_or(Value::Null)
}
