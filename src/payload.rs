use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ApiError, Result};

/// A decoded API entity exposed as a read-only property map.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiObject(Map<String, Value>);

impl ApiObject {
    pub fn properties(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(Value::as_str)
    }

    pub fn get_i64(&self, name: &str) -> Option<i64> {
        self.0.get(name).and_then(Value::as_i64)
    }

    pub fn get_f64(&self, name: &str) -> Option<f64> {
        self.0.get(name).and_then(Value::as_f64)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        self.0.get(name).and_then(Value::as_bool)
    }

    /// Nested object property, e.g. `parent` or `created_by`.
    pub fn get_object(&self, name: &str) -> Option<ApiObject> {
        self.0
            .get(name)
            .and_then(Value::as_object)
            .map(|map| ApiObject(map.clone()))
    }

    pub fn id(&self) -> Option<&str> {
        self.get_str("id")
    }

    /// The entity type, e.g. `file` or `folder`.
    pub fn kind(&self) -> Option<&str> {
        self.get_str("type")
    }

    /// Deserializes the properties into a typed model.
    pub fn into_typed<T: DeserializeOwned>(self) -> Result<T> {
        serde_json::from_value(Value::Object(self.0))
            .map_err(|err| ApiError::Decode(format!("invalid payload: {err}")))
    }
}

impl From<Map<String, Value>> for ApiObject {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}
