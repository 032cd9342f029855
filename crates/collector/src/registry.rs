use std::sync::Arc;

use kmeta_core::{Record, ResourceType};
use rustc_hash::FxHashMap;
use serde_json::Value;

/// Maps a raw object and its method label (`create`/`update`/`delete`) to an
/// optional record. Must not touch shared state.
pub trait Transform: Send + Sync {
    fn transform(&self, object: &Value, method: &str) -> Option<Record>;
}

impl<F> Transform for F
where
    F: Fn(&Value, &str) -> Option<Record> + Send + Sync,
{
    fn transform(&self, object: &Value, method: &str) -> Option<Record> {
        self(object, method)
    }
}

/// Ordered transforms per resource type. Filled once at start, read-only after.
#[derive(Default, Clone)]
pub struct ProcessorRegistry {
    map: FxHashMap<ResourceType, Vec<Arc<dyn Transform>>>,
}

impl ProcessorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `t` to the list for `kind`; invocation follows registration order.
    pub fn register(&mut self, kind: ResourceType, t: impl Transform + 'static) -> &mut Self {
        self.register_arc(kind, Arc::new(t))
    }

    pub fn register_arc(&mut self, kind: ResourceType, t: Arc<dyn Transform>) -> &mut Self {
        self.map.entry(kind).or_default().push(t);
        self
    }

    /// Transforms for `kind`; empty when nothing is registered.
    pub fn get(&self, kind: ResourceType) -> &[Arc<dyn Transform>] {
        self.map.get(&kind).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn contains(&self, kind: ResourceType) -> bool {
        !self.get(kind).is_empty()
    }

    pub fn len(&self) -> usize {
        self.map.values().map(|v| v.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
