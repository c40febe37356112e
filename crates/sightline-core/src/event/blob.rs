//! Opaque structured-data blobs carried by events and stored as JSON text.
//!
//! A [`JsonBlob`] is always a JSON object. The empty object `{}` is the
//! "nothing recorded yet" value: merges never let an incoming empty blob
//! replace stored content.

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Text stored for an empty blob. Merge SQL compares against this literal.
pub const EMPTY_BLOB_SQL: &str = "{}";

/// Free-form JSON object (metadata, context, scope, manifest, ...).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct JsonBlob(Map<String, Value>);

impl JsonBlob {
    /// An empty blob.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// `true` if no keys are recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Look up a top-level key.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// Borrow the underlying map.
    #[must_use]
    pub const fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Compact JSON text as written to the store.
    #[must_use]
    pub fn to_sql_text(&self) -> String {
        if self.0.is_empty() {
            return EMPTY_BLOB_SQL.to_string();
        }
        Value::Object(self.0.clone()).to_string()
    }
}

impl From<Map<String, Value>> for JsonBlob {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for JsonBlob {
    type Error = Value;

    /// Accepts objects and `null` (as empty); hands anything else back.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Null => Ok(Self::default()),
            other => Err(other),
        }
    }
}

// `null` decodes to an empty blob so producers can send either.
impl<'de> Deserialize<'de> for JsonBlob {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Option::<Map<String, Value>>::deserialize(deserializer)?;
        Ok(Self(map.unwrap_or_default()))
    }
}

impl ToSql for JsonBlob {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.to_sql_text()))
    }
}

impl FromSql for JsonBlob {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        let parsed: Value =
            serde_json::from_str(text).map_err(|err| FromSqlError::Other(Box::new(err)))?;
        Self::try_from(parsed).map_err(|_| FromSqlError::InvalidType)
    }
}
