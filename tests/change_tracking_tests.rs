/// Change tracking tests
///
/// Field-path marking through the managed handle and change collection in
/// the tracker.
/// Run with: cargo test --test change_tracking_tests

use mapperdb::{ChangeTracker, ChangeType, DbError, EntityKey, TrackerStats};
use serde_json::{Map, Value as Json, json};

fn object(value: Json) -> Map<String, Json> {
    match value {
        Json::Object(map) => map,
        other => panic!("expected an object, got {}", other),
    }
}

fn document() -> Map<String, Json> {
    object(json!({
        "id": 1,
        "title": "Draft",
        "meta": {"author": {"name": "ann"}, "views": 0},
        "tags": ["b", "a", "c"],
        "__version": 1
    }))
}

#[test]
fn test_nested_writes_record_leaf_paths() {
    let tracker = ChangeTracker::new();
    let doc = tracker.track(EntityKey::new("Post", 1), document(), false);

    doc.set("meta.author.name", "bob").unwrap();
    doc.set("meta.views", 3).unwrap();
    doc.set("meta.editor.name", "cy").unwrap();

    assert_eq!(
        doc.changed_fields(),
        vec!["meta.author.name", "meta.editor.name", "meta.views"]
    );
    assert_eq!(doc.get("meta.editor"), Some(json!({"name": "cy"})));
    assert_eq!(doc.baseline()["meta"]["author"]["name"], json!("ann"));
}

#[test]
fn test_array_operations_mark_array_path() {
    let tracker = ChangeTracker::new();
    let doc = tracker.track(EntityKey::new("Post", 1), document(), false);

    assert_eq!(doc.push("tags", "d").unwrap(), 4);
    assert_eq!(doc.pop("tags").unwrap(), Some(json!("d")));
    doc.sort_by("tags", |a, b| a.as_str().cmp(&b.as_str())).unwrap();
    assert_eq!(doc.get("tags"), Some(json!(["a", "b", "c"])));

    doc.insert_at("tags", 0, "z").unwrap();
    assert_eq!(doc.remove_at("tags", 0).unwrap(), json!("z"));
    assert_eq!(doc.retain("tags", |t| *t != "b").unwrap(), 1);
    doc.reverse("tags").unwrap();

    assert_eq!(doc.get("tags"), Some(json!(["c", "a"])));
    assert_eq!(doc.changed_fields(), vec!["tags"]);
}

#[test]
fn test_array_ops_that_change_nothing_do_not_mark() {
    let tracker = ChangeTracker::new();
    let doc = tracker.track(
        EntityKey::new("Post", 1),
        object(json!({"id": 1, "tags": ["a", "b"]})),
        false,
    );

    doc.sort_by("tags", |a, b| a.as_str().cmp(&b.as_str())).unwrap();
    assert_eq!(doc.retain("tags", |_| true).unwrap(), 0);
    assert!(doc.changed_fields().is_empty());

    assert!(matches!(doc.push("id", 1), Err(DbError::TypeMismatch(_))));
    assert!(matches!(
        doc.remove_at("tags", 9),
        Err(DbError::ExecutionError(_))
    ));
}

#[test]
fn test_internal_fields_are_never_recorded() {
    let tracker = ChangeTracker::new();
    let doc = tracker.track(EntityKey::new("Post", 1), document(), false);

    doc.set("__version", 2).unwrap();
    doc.set("__cache.hits", 5).unwrap();

    assert!(doc.changed_fields().is_empty());
    assert!(!tracker.has_changes());
    assert_eq!(doc.get("__version"), Some(json!(2)));
}

#[test]
fn test_marks_persist_until_rebaseline() {
    let tracker = ChangeTracker::new();
    let key = EntityKey::new("Post", 1);
    let doc = tracker.track(key.clone(), document(), false);

    doc.set("title", "Final").unwrap();
    doc.set("title", "Draft").unwrap();
    assert_eq!(doc.changed_fields(), vec!["title"]);

    tracker.reset_changes(&key).unwrap();
    assert!(doc.changed_fields().is_empty());
    assert_eq!(doc.baseline()["title"], json!("Draft"));
    assert!(!tracker.has_changes());
}

#[test]
fn test_modify_diffs_whole_payload() {
    let tracker = ChangeTracker::new();
    let doc = tracker.track(EntityKey::new("Post", 1), document(), false);

    let previous = doc
        .modify(|data| {
            data.remove("tags");
            data.insert("summary".into(), json!("short"));
            data["meta"]["views"] = json!(10);
            data.get("title").cloned()
        })
        .unwrap();

    assert_eq!(previous, Some(json!("Draft")));
    assert_eq!(doc.changed_fields(), vec!["meta.views", "summary", "tags"]);
}

#[test]
fn test_scalar_in_path_is_a_type_mismatch() {
    let tracker = ChangeTracker::new();
    let doc = tracker.track(EntityKey::new("Post", 1), document(), false);

    let err = doc.set("title.first", "x").unwrap_err();
    assert!(matches!(err, DbError::TypeMismatch(_)));
    assert_eq!(doc.get("title"), Some(json!("Draft")));
    assert!(doc.changed_fields().is_empty());
}

#[test]
fn test_changes_follow_registration_order() {
    let tracker = ChangeTracker::new();
    let first = tracker.track(EntityKey::new("Post", 1), document(), false);
    let _second = tracker.track(EntityKey::new("Post", 2), document(), true);
    let third = tracker.track(EntityKey::new("Post", 3), document(), false);

    third.set("title", "x").unwrap();
    first.set("title", "y").unwrap();
    tracker.mark_deleted(&EntityKey::new("Post", 3)).unwrap();

    let changes = tracker.get_changes();
    let summary: Vec<(String, ChangeType)> = changes
        .iter()
        .map(|c| (c.id().to_string(), c.change_type))
        .collect();
    assert_eq!(
        summary,
        vec![
            ("1".to_string(), ChangeType::Updated),
            ("2".to_string(), ChangeType::Created),
            ("3".to_string(), ChangeType::Deleted),
        ]
    );
    assert_eq!(changes[0].changed_fields, Some(vec!["title".to_string()]));
    assert_eq!(changes[1].changed_fields, None);
    assert_eq!(changes[0].snapshot["title"], json!("y"));
}

#[test]
fn test_tracking_twice_returns_first_handle() {
    let tracker = ChangeTracker::new();
    let key = EntityKey::new("Post", 1);
    let first = tracker.track(key.clone(), document(), false);
    let second = tracker.track(key.clone(), object(json!({"id": 1})), true);

    assert!(first.same_instance(&second));
    assert!(!second.is_new());
    assert_eq!(tracker.len(), 1);
}

#[test]
fn test_unknown_keys_are_reported() {
    let tracker = ChangeTracker::new();
    let key = EntityKey::new("Post", 404);

    assert_eq!(
        tracker.mark_deleted(&key).unwrap_err(),
        DbError::NotTracked(key.to_string())
    );
    assert!(matches!(
        tracker.reset_changes(&key),
        Err(DbError::NotTracked(_))
    ));
}

#[test]
fn test_stats_by_state() {
    let tracker = ChangeTracker::new();
    tracker.track(EntityKey::new("Post", 1), document(), true);
    let updated = tracker.track(EntityKey::new("Post", 2), document(), false);
    tracker.track(EntityKey::new("Post", 3), document(), false);
    tracker.track(EntityKey::new("Post", 4), document(), false);

    updated.set("title", "changed").unwrap();
    tracker.mark_deleted(&EntityKey::new("Post", 4)).unwrap();

    assert_eq!(
        tracker.stats(),
        TrackerStats {
            total: 4,
            created: 1,
            updated: 1,
            deleted: 1,
            unchanged: 1,
        }
    );

    tracker.clear();
    assert!(tracker.is_empty());
    assert!(!tracker.has_changes());
}
