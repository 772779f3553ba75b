//! Dotted-path access into JSON entity payloads.
//!
//! A path is a `.`-separated chain of object keys. Numeric segments index
//! into arrays (`tags.0`). Writes create missing intermediate objects;
//! they never grow arrays.

use crate::core::{DbError, Result};
use serde_json::{Map, Value as Json};

/// Prefix marking internal bookkeeping fields.
pub const INTERNAL_PREFIX: &str = "__";

pub fn segments(path: &str) -> Result<Vec<&str>> {
    let parts: Vec<&str> = path.split('.').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return Err(DbError::ExecutionError(format!("invalid field path '{}'", path)));
    }
    Ok(parts)
}

/// The top-level field a path belongs to (`address.city` -> `address`).
pub fn top_level(path: &str) -> &str {
    path.split('.').next().unwrap_or(path)
}

/// `true` when any segment names an internal field.
pub fn is_internal(path: &str) -> bool {
    path.split('.').any(|part| part.starts_with(INTERNAL_PREFIX))
}

pub fn get<'a>(root: &'a Map<String, Json>, path: &str) -> Option<&'a Json> {
    let mut parts = path.split('.');
    let mut current = root.get(parts.next()?)?;
    for part in parts {
        current = step(current, part)?;
    }
    Some(current)
}

pub fn get_mut<'a>(root: &'a mut Map<String, Json>, path: &str) -> Option<&'a mut Json> {
    let mut parts = path.split('.');
    let mut current = root.get_mut(parts.next()?)?;
    for part in parts {
        current = step_mut(current, part)?;
    }
    Some(current)
}

/// Writes `value` at `path`, returning the value it replaced.
pub fn set(root: &mut Map<String, Json>, path: &str, value: Json) -> Result<Option<Json>> {
    let parts = segments(path)?;
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| DbError::ExecutionError("empty field path".into()))?;

    let mut container = root;
    for (depth, part) in parents.iter().enumerate() {
        let slot = container
            .entry(part.to_string())
            .or_insert_with(|| Json::Object(Map::new()));
        if slot.is_null() {
            *slot = Json::Object(Map::new());
        }
        container = match slot {
            Json::Object(map) => map,
            Json::Array(items) => {
                let rest = parts[depth + 1..].join(".");
                return set_in_array(items, &rest, value, path);
            }
            other => {
                return Err(DbError::TypeMismatch(format!(
                    "cannot write '{}': '{}' holds {}",
                    path,
                    part,
                    json_type(other)
                )));
            }
        };
    }
    Ok(container.insert(last.to_string(), value))
}

fn set_in_array(items: &mut [Json], rest: &str, value: Json, full: &str) -> Result<Option<Json>> {
    let (head, tail) = match rest.split_once('.') {
        Some((head, tail)) => (head, Some(tail)),
        None => (rest, None),
    };
    let index: usize = head.parse().map_err(|_| {
        DbError::TypeMismatch(format!("cannot write '{}': '{}' is not an index", full, head))
    })?;
    let len = items.len();
    let slot = items.get_mut(index).ok_or_else(|| {
        DbError::ExecutionError(format!(
            "cannot write '{}': index {} out of bounds (len {})",
            full, index, len
        ))
    })?;

    match tail {
        None => Ok(Some(std::mem::replace(slot, value))),
        Some(tail) => match slot {
            Json::Object(map) => set(map, tail, value),
            Json::Array(inner) => set_in_array(inner, tail, value, full),
            other => Err(DbError::TypeMismatch(format!(
                "cannot write '{}': element {} holds {}",
                full,
                index,
                json_type(other)
            ))),
        },
    }
}

/// Removes the value at `path`. Array elements cannot be removed this way;
/// use the array operations on the handle.
pub fn remove(root: &mut Map<String, Json>, path: &str) -> Option<Json> {
    match path.rsplit_once('.') {
        None => root.remove(path),
        Some((parent, last)) => match get_mut(root, parent)? {
            Json::Object(map) => map.remove(last),
            _ => None,
        },
    }
}

pub fn json_type(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "a boolean",
        Json::Number(_) => "a number",
        Json::String(_) => "a string",
        Json::Array(_) => "an array",
        Json::Object(_) => "an object",
    }
}

fn step<'a>(value: &'a Json, part: &str) -> Option<&'a Json> {
    match value {
        Json::Object(map) => map.get(part),
        Json::Array(items) => items.get(part.parse::<usize>().ok()?),
        _ => None,
    }
}

fn step_mut<'a>(value: &'a mut Json, part: &str) -> Option<&'a mut Json> {
    match value {
        Json::Object(map) => map.get_mut(part),
        Json::Array(items) => items.get_mut(part.parse::<usize>().ok()?),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Json) -> Map<String, Json> {
        match value {
            Json::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_get_nested_and_indexed() {
        let data = object(json!({"address": {"city": "Oslo"}, "tags": ["a", {"x": 1}]}));
        assert_eq!(get(&data, "address.city"), Some(&json!("Oslo")));
        assert_eq!(get(&data, "tags.1.x"), Some(&json!(1)));
        assert_eq!(get(&data, "tags.9"), None);
        assert_eq!(get(&data, "address.zip"), None);
    }

    #[test]
    fn test_set_creates_intermediate_objects() {
        let mut data = object(json!({"id": 1}));
        let previous = set(&mut data, "profile.social.github", json!("jd")).unwrap();
        assert_eq!(previous, None);
        assert_eq!(data["profile"], json!({"social": {"github": "jd"}}));
    }

    #[test]
    fn test_set_into_array_element() {
        let mut data = object(json!({"items": [{"qty": 1}, {"qty": 2}]}));
        let previous = set(&mut data, "items.1.qty", json!(5)).unwrap();
        assert_eq!(previous, Some(json!(2)));
        assert!(set(&mut data, "items.4.qty", json!(1)).is_err());
    }

    #[test]
    fn test_set_through_scalar_fails() {
        let mut data = object(json!({"name": "John"}));
        assert!(matches!(
            set(&mut data, "name.first", json!("J")),
            Err(DbError::TypeMismatch(_))
        ));
        assert!(set(&mut data, "a..b", json!(1)).is_err());
    }

    #[test]
    fn test_remove_and_helpers() {
        let mut data = object(json!({"address": {"city": "Oslo", "zip": "0150"}}));
        assert_eq!(remove(&mut data, "address.zip"), Some(json!("0150")));
        assert_eq!(remove(&mut data, "missing.zip"), None);
        assert_eq!(top_level("address.city"), "address");
        assert!(is_internal("meta.__version"));
        assert!(!is_internal("meta.version"));
    }
}
