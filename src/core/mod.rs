pub mod error;
pub mod key;
pub mod metadata;
pub mod value;

pub use error::{DbError, Result};
pub use key::{EntityId, EntityKey, KeyPart};
pub use metadata::{EntityMetadata, is_sql_identifier};
pub use value::Value;

pub type Row = Vec<Value>;
