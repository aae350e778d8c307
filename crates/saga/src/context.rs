//! Key/value bag shared by the steps of one saga.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Values accumulated as steps complete.
///
/// Only the orchestrator mutates it, by merging a step's [`ContextUpdate`]
/// after the step finishes. A key written again (by a retried or later step)
/// takes the last value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SagaContext(BTreeMap<String, JsonValue>);

impl SagaContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    /// Typed read; `None` if missing or of the wrong shape.
    pub fn get_as<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.0
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) {
        self.0.insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &JsonValue)> {
        self.0.iter()
    }

    pub fn merge(&mut self, update: ContextUpdate) {
        self.0.extend(update.0);
    }

    /// The whole context as a JSON object.
    pub fn to_json(&self) -> JsonValue {
        JsonValue::Object(self.0.clone().into_iter().collect())
    }
}

impl<K: Into<String>> FromIterator<(K, JsonValue)> for SagaContext {
    fn from_iter<I: IntoIterator<Item = (K, JsonValue)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// Keys a step publishes for later steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContextUpdate(BTreeMap<String, JsonValue>);

impl ContextUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    pub fn set(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.0.insert(key.into(), value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: JsonValue) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&JsonValue> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Interpret a JSON value as an update: an object contributes its
    /// entries, `null` nothing, and anything else is stored under `key`.
    pub fn from_json(key: &str, value: JsonValue) -> Self {
        match value {
            JsonValue::Object(map) => Self(map.into_iter().collect()),
            JsonValue::Null => Self::default(),
            other => Self::default().set(key, other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_is_last_writer_wins() {
        let mut ctx: SagaContext = [("order_id", json!("o-1"))].into_iter().collect();
        ctx.merge(ContextUpdate::new().set("reservation_id", json!("r-1")));
        ctx.merge(ContextUpdate::new().set("reservation_id", json!("r-2")));

        assert_eq!(ctx.len(), 2);
        assert_eq!(ctx.get("reservation_id"), Some(&json!("r-2")));
        assert_eq!(ctx.get_as::<String>("order_id").as_deref(), Some("o-1"));
        assert_eq!(ctx.get_as::<u32>("order_id"), None);
    }

    #[test]
    fn update_from_json_shapes() {
        let object = ContextUpdate::from_json("charge", json!({"charge_id": "c-1"}));
        assert_eq!(object.get("charge_id"), Some(&json!("c-1")));

        assert!(ContextUpdate::from_json("charge", json!(null)).is_empty());

        let scalar = ContextUpdate::from_json("charge", json!(42));
        assert_eq!(scalar.get("charge"), Some(&json!(42)));
    }

    #[test]
    fn context_serializes_as_plain_object() {
        let mut ctx = SagaContext::new();
        ctx.insert("a", json!(1));
        assert_eq!(serde_json::to_value(&ctx).unwrap(), json!({"a": 1}));
        assert_eq!(ctx.to_json(), json!({"a": 1}));
    }
}
