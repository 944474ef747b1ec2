use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

pub type StateMap = BTreeMap<String, StateValue>;

/// A value held in the session state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum StateValue {
    Null,
    Text(String),
    Number(f64),
    Bool(bool),
    List(Vec<StateValue>),
    Record(StateMap),
    Blob(Vec<u8>),
}

impl StateValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StateValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&StateMap> {
        match self {
            StateValue::Record(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StateValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Plain JSON view used for prompts and for handing state to generators.
    /// Blobs render as their length since raw bytes mean nothing to a model.
    pub fn to_json(&self) -> Value {
        match self {
            StateValue::Null => Value::Null,
            StateValue::Text(s) => Value::String(s.clone()),
            StateValue::Number(n) => serde_json::Number::from_f64(*n)
                .map(Value::Number)
                .unwrap_or(Value::Null),
            StateValue::Bool(b) => Value::Bool(*b),
            StateValue::List(items) => Value::Array(items.iter().map(|v| v.to_json()).collect()),
            StateValue::Record(map) => Value::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            StateValue::Blob(bytes) => Value::String(format!("<blob: {} bytes>", bytes.len())),
        }
    }
}

impl fmt::Display for StateValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StateValue::Text(s) => f.write_str(s),
            other => write!(f, "{}", other.to_json()),
        }
    }
}

impl From<Value> for StateValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => StateValue::Null,
            Value::Bool(b) => StateValue::Bool(b),
            Value::Number(n) => StateValue::Number(n.as_f64().unwrap_or_default()),
            Value::String(s) => StateValue::Text(s),
            Value::Array(items) => StateValue::List(items.into_iter().map(Into::into).collect()),
            Value::Object(map) => {
                StateValue::Record(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

impl From<&str> for StateValue {
    fn from(value: &str) -> Self {
        StateValue::Text(value.to_string())
    }
}

impl From<String> for StateValue {
    fn from(value: String) -> Self {
        StateValue::Text(value)
    }
}

impl From<f64> for StateValue {
    fn from(value: f64) -> Self {
        StateValue::Number(value)
    }
}

impl From<bool> for StateValue {
    fn from(value: bool) -> Self {
        StateValue::Bool(value)
    }
}

impl From<StateMap> for StateValue {
    fn from(value: StateMap) -> Self {
        StateValue::Record(value)
    }
}

/// Key/value memory shared by every agent taking part in one request.
///
/// Cloning yields another handle to the same store. Each `get`/`set` is atomic
/// on its own; there are no multi-key transactions, so concurrent siblings must
/// not write the same key.
#[derive(Clone, Default)]
pub struct SessionState {
    inner: Arc<RwLock<StateMap>>,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(initial: StateMap) -> Self {
        Self {
            inner: Arc::new(RwLock::new(initial)),
        }
    }

    pub fn get(&self, key: &str) -> Option<StateValue> {
        self.inner.read().get(key).cloned()
    }

    pub fn get_text(&self, key: &str) -> Option<String> {
        self.get(key).and_then(|v| v.as_text().map(str::to_string))
    }

    /// Overwrites any previous value regardless of its type.
    pub fn set(&self, key: impl Into<String>, value: impl Into<StateValue>) {
        self.inner.write().insert(key.into(), value.into());
    }

    pub fn remove(&self, key: &str) -> Option<StateValue> {
        self.inner.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().contains_key(key)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    /// Point-in-time copy for diagnostics and persistence.
    pub fn snapshot(&self) -> StateMap {
        self.inner.read().clone()
    }

    /// True when both handles refer to the same store.
    pub fn same_store(&self, other: &SessionState) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.inner.read().iter()).finish()
    }
}
