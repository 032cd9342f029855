//! Record model and the string-only wire shape handed to sinks.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use smallvec::SmallVec;

use crate::Classification;

/// Transformed event: ordered key/value contents plus a unix timestamp (seconds).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Record {
    pub contents: SmallVec<[(String, Value); 16]>,
    pub timestamp: i64,
}

impl Record {
    pub fn new(timestamp: i64) -> Self {
        Self { contents: SmallVec::new(), timestamp }
    }

    /// Record stamped with the current wall clock.
    pub fn now() -> Self {
        Self::new(chrono::Utc::now().timestamp())
    }

    /// Insert or replace `key`. A replaced key keeps its position.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        let key = key.into();
        let value = value.into();
        match self.contents.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.contents.push((key, value)),
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.contents.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(|v| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.contents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    /// Convert to the sink shape. Keys whose value is not a JSON string are
    /// left out and reported one error each; every other key still ships.
    pub fn to_wire(&self) -> (WireLog, Vec<ConversionError>) {
        let mut contents = Vec::with_capacity(self.contents.len());
        let mut errors = Vec::new();
        for (k, v) in self.contents.iter() {
            match v {
                Value::String(s) => contents.push(LogContent { key: k.clone(), value: s.clone() }),
                other => errors.push(ConversionError { key: k.clone(), found: json_type(other) }),
            }
        }
        let time = self.timestamp.clamp(0, u32::MAX as i64) as u32;
        (WireLog { contents, time }, errors)
    }
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("value for key {key:?} is not a string (found {found})")]
pub struct ConversionError {
    pub key: String,
    pub found: &'static str,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogContent {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct WireLog {
    pub contents: Vec<LogContent>,
    pub time: u32,
}

impl WireLog {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.contents.iter().find(|c| c.key == key).map(|c| c.value.as_str())
    }
}

/// One flush worth of converted records, all of the same classification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogGroup {
    pub classification: Classification,
    pub logs: Vec<WireLog>,
}

impl LogGroup {
    pub fn len(&self) -> usize {
        self.logs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.logs.is_empty()
    }
}

/// Downstream ingestion entry point. Called once per flush from the flush
/// task, so implementations should return promptly.
pub trait Sink: Send + Sync {
    fn submit(&self, group: LogGroup) -> anyhow::Result<()>;
}
