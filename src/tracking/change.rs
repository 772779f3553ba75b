// ============================================================================
// Entity Change Sets
// ============================================================================
//
// An EntityChange is a read-only view derived from tracked state when the
// unit of work asks for it. Nothing stores changes independently; the
// tracker recomputes them on demand.
//
// ============================================================================

use crate::core::{EntityId, EntityKey};
use serde::Serialize;
use serde_json::{Map, Value as Json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Created,
    Updated,
    Deleted,
}

impl ChangeType {
    /// Position in a commit batch: deletes, then updates, then creates
    pub fn commit_order(&self) -> u8 {
        match self {
            ChangeType::Deleted => 0,
            ChangeType::Updated => 1,
            ChangeType::Created => 2,
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChangeType::Created => write!(f, "created"),
            ChangeType::Updated => write!(f, "updated"),
            ChangeType::Deleted => write!(f, "deleted"),
        }
    }
}

/// One pending change for one entity
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityChange {
    pub key: EntityKey,
    pub change_type: ChangeType,
    /// Dotted paths written since the baseline; `None` for creates and
    /// deletes
    pub changed_fields: Option<Vec<String>>,
    /// Live data at the time the change was computed
    pub snapshot: Map<String, Json>,
}

impl EntityChange {
    pub fn kind(&self) -> &str {
        self.key.kind()
    }

    pub fn id(&self) -> &EntityId {
        self.key.id()
    }

    /// Top-level fields touched by an update, deduplicated, in path order.
    pub fn changed_top_level_fields(&self) -> Vec<&str> {
        let mut fields: Vec<&str> = Vec::new();
        for path in self.changed_fields.iter().flatten() {
            let field = super::path::top_level(path);
            if !fields.contains(&field) {
                fields.push(field);
            }
        }
        fields
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_order() {
        let mut types = vec![ChangeType::Created, ChangeType::Deleted, ChangeType::Updated];
        types.sort_by_key(ChangeType::commit_order);
        assert_eq!(
            types,
            vec![ChangeType::Deleted, ChangeType::Updated, ChangeType::Created]
        );
    }

    #[test]
    fn test_changed_top_level_fields() {
        let change = EntityChange {
            key: EntityKey::new("User", 1i64),
            change_type: ChangeType::Updated,
            changed_fields: Some(vec![
                "address.city".into(),
                "name".into(),
                "address.zip".into(),
            ]),
            snapshot: Map::new(),
        };
        assert_eq!(change.changed_top_level_fields(), vec!["address", "name"]);
        assert_eq!(change.kind(), "User");
    }
}
