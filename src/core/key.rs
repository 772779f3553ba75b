use super::{DbError, Result, Value};
use serde::{Serialize, Serializer};
use serde_json::Value as Json;
use std::collections::BTreeMap;
use std::fmt;

/// One scalar component of an entity identity.
///
/// Variants are never coerced into one another: `Integer(1)` and
/// `Text("1")` name different entities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeyPart {
    Integer(i64),
    /// Integers above `i64::MAX`
    Unsigned(u64),
    Text(String),
    Boolean(bool),
    /// Stored as raw bits so the key stays `Eq + Hash`.
    Float(u64),
}

impl KeyPart {
    pub fn from_json(json: &Json) -> Result<Self> {
        match json {
            Json::Null => Err(DbError::InvalidKey("identity cannot be null".into())),
            Json::Bool(b) => Ok(Self::Boolean(*b)),
            Json::Number(n) => match (n.as_i64(), n.as_u64()) {
                (Some(i), _) => Ok(Self::Integer(i)),
                (None, Some(u)) => Ok(Self::Unsigned(u)),
                (None, None) => n
                    .as_f64()
                    .map(|f| Self::Float(f.to_bits()))
                    .ok_or_else(|| DbError::InvalidKey(format!("unsupported number {}", n))),
            },
            Json::String(s) => Ok(Self::Text(s.clone())),
            Json::Array(_) | Json::Object(_) => Err(DbError::InvalidKey(
                "identity components must be scalars".into(),
            )),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Self::Integer(i) => Value::Integer(*i),
            Self::Unsigned(u) => Value::Unsigned(*u),
            Self::Text(s) => Value::Text(s.clone()),
            Self::Boolean(b) => Value::Boolean(*b),
            Self::Float(bits) => Value::Float(f64::from_bits(*bits)),
        }
    }
}

impl Serialize for KeyPart {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Integer(i) => serializer.serialize_i64(*i),
            Self::Unsigned(u) => serializer.serialize_u64(*u),
            Self::Text(s) => serializer.serialize_str(s),
            Self::Boolean(b) => serializer.serialize_bool(*b),
            Self::Float(bits) => serializer.serialize_f64(f64::from_bits(*bits)),
        }
    }
}

impl fmt::Display for KeyPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Integer(i) => write!(f, "{}", i),
            Self::Unsigned(u) => write!(f, "{}", u),
            Self::Text(s) => write!(f, "{:?}", s),
            Self::Boolean(b) => write!(f, "{}", b),
            Self::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
        }
    }
}

/// The id half of an identity key: a scalar or a set of named scalars.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(untagged)]
pub enum EntityId {
    Scalar(KeyPart),
    Composite(BTreeMap<String, KeyPart>),
}

impl EntityId {
    pub fn composite<I, K, V>(parts: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Json>,
    {
        let mut fields = BTreeMap::new();
        for (name, value) in parts {
            fields.insert(name.into(), KeyPart::from_json(&value.into())?);
        }
        if fields.is_empty() {
            return Err(DbError::InvalidKey(
                "composite identity needs at least one field".into(),
            ));
        }
        Ok(Self::Composite(fields))
    }

    /// Accepts a JSON scalar, or an object of scalars for composite ids.
    pub fn from_json(json: &Json) -> Result<Self> {
        match json {
            Json::Object(map) => Self::composite(map.iter().map(|(k, v)| (k.clone(), v.clone()))),
            other => KeyPart::from_json(other).map(Self::Scalar),
        }
    }

    /// Extracts the id from an entity payload given its primary-key fields.
    pub fn from_fields(
        data: &serde_json::Map<String, Json>,
        primary_key: &[String],
    ) -> Result<Self> {
        match primary_key {
            [] => Err(DbError::InvalidKey("no primary key fields declared".into())),
            [single] => {
                let value = data.get(single).ok_or_else(|| {
                    DbError::InvalidKey(format!("primary key field '{}' is missing", single))
                })?;
                KeyPart::from_json(value).map(Self::Scalar)
            }
            many => {
                let mut fields = BTreeMap::new();
                for name in many {
                    let value = data.get(name).ok_or_else(|| {
                        DbError::InvalidKey(format!("primary key field '{}' is missing", name))
                    })?;
                    fields.insert(name.clone(), KeyPart::from_json(value)?);
                }
                Ok(Self::Composite(fields))
            }
        }
    }

    /// Returns the value bound to `field` for a WHERE clause on `primary_key`.
    pub fn value_for(&self, field: &str, primary_key: &[String]) -> Result<Value> {
        match self {
            Self::Scalar(part) if primary_key.len() == 1 && primary_key[0] == field => {
                Ok(part.to_value())
            }
            Self::Composite(fields) => fields
                .get(field)
                .map(KeyPart::to_value)
                .ok_or_else(|| DbError::InvalidKey(format!("id has no field '{}'", field))),
            Self::Scalar(_) => Err(DbError::InvalidKey(format!(
                "scalar id cannot address composite key field '{}'",
                field
            ))),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(part) => write!(f, "{}", part),
            Self::Composite(fields) => {
                let parts: Vec<String> = fields
                    .iter()
                    .map(|(name, part)| format!("{}={}", name, part))
                    .collect();
                write!(f, "{{{}}}", parts.join(","))
            }
        }
    }
}

impl From<i64> for EntityId {
    fn from(i: i64) -> Self {
        Self::Scalar(KeyPart::Integer(i))
    }
}

impl From<i32> for EntityId {
    fn from(i: i32) -> Self {
        Self::Scalar(KeyPart::Integer(i64::from(i)))
    }
}

impl From<u64> for EntityId {
    fn from(u: u64) -> Self {
        match i64::try_from(u) {
            Ok(i) => Self::Scalar(KeyPart::Integer(i)),
            Err(_) => Self::Scalar(KeyPart::Unsigned(u)),
        }
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self::Scalar(KeyPart::Text(s.to_string()))
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self::Scalar(KeyPart::Text(s))
    }
}

impl From<bool> for EntityId {
    fn from(b: bool) -> Self {
        Self::Scalar(KeyPart::Boolean(b))
    }
}

/// `(kind, id)`: the identity of one managed entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct EntityKey {
    kind: String,
    id: EntityId,
}

impl EntityKey {
    pub fn new(kind: impl Into<String>, id: impl Into<EntityId>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn id(&self) -> &EntityId {
        &self.id
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalar_types_are_distinct_identities() {
        assert_ne!(EntityId::from(1i64), EntityId::from("1"));
        assert_ne!(EntityKey::new("User", 1i64), EntityKey::new("User", "1"));
        assert_ne!(EntityKey::new("User", 1i64), EntityKey::new("Post", 1i64));
    }

    #[test]
    fn test_large_unsigned_ids_stay_exact() {
        let a = EntityId::from_json(&json!(9223372036854775809u64)).unwrap();
        let b = EntityId::from_json(&json!(9223372036854775810u64)).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, EntityId::from(9223372036854775809u64));
        assert_eq!(EntityId::from(7u64), EntityId::from(7i64));
        assert_eq!(
            a.value_for("id", &["id".to_string()]).unwrap(),
            Value::Unsigned(9223372036854775809)
        );
    }

    #[test]
    fn test_composite_field_order_is_irrelevant() {
        let a = EntityId::from_json(&json!({"tenant": 1, "slug": "x"})).unwrap();
        let b = EntityId::composite([("slug", json!("x")), ("tenant", json!(1))]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_null_identity_is_rejected() {
        assert!(matches!(
            EntityId::from_json(&json!(null)),
            Err(DbError::InvalidKey(_))
        ));
        assert!(matches!(
            EntityId::from_json(&json!({"a": null})),
            Err(DbError::InvalidKey(_))
        ));
        assert!(matches!(
            EntityId::from_json(&json!({})),
            Err(DbError::InvalidKey(_))
        ));
    }

    #[test]
    fn test_from_fields_reads_primary_key() {
        let data = json!({"id": 5, "name": "x"});
        let map = data.as_object().unwrap();
        let id = EntityId::from_fields(map, &["id".to_string()]).unwrap();
        assert_eq!(id, EntityId::from(5i64));

        let missing = EntityId::from_fields(map, &["uuid".to_string()]);
        assert!(matches!(missing, Err(DbError::InvalidKey(_))));
    }

    #[test]
    fn test_display() {
        assert_eq!(EntityKey::new("User", 7i64).to_string(), "User#7");
        let id = EntityId::from_json(&json!({"b": 2, "a": "k"})).unwrap();
        assert_eq!(id.to_string(), "{a=\"k\",b=2}");
    }
}
