//! In-process [`MetaManager`] driven by explicit `emit` calls. Used by tests
//! and by embedders that produce change events themselves.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kmeta_core::{ChangeEvent, ResourceType};
use tracing::debug;

use crate::{lock, EventHandler, MetaManager};

struct Registration {
    config_name: String,
    kind: ResourceType,
    interval: Duration,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
pub struct ManualMetaManager {
    active: Mutex<Vec<Registration>>,
    unregistered: Mutex<Vec<(String, ResourceType)>>,
}

impl ManualMetaManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver `event` to every handler registered for its resource type.
    /// Returns how many handlers saw it.
    pub async fn emit(&self, event: ChangeEvent) -> usize {
        let handlers: Vec<_> = lock(&self.active)
            .iter()
            .filter(|r| r.kind == event.resource_type)
            .map(|r| Arc::clone(&r.handler))
            .collect();
        for h in handlers.iter() {
            h.handle(event.clone()).await;
        }
        handlers.len()
    }

    /// Kinds currently registered, in registration order.
    pub fn registered(&self) -> Vec<ResourceType> {
        lock(&self.active).iter().map(|r| r.kind).collect()
    }

    pub fn interval_of(&self, kind: ResourceType) -> Option<Duration> {
        lock(&self.active).iter().find(|r| r.kind == kind).map(|r| r.interval)
    }

    /// Every unregister call seen so far, in call order.
    pub fn unregistered(&self) -> Vec<(String, ResourceType)> {
        lock(&self.unregistered).clone()
    }
}

impl MetaManager for ManualMetaManager {
    fn register_callback(&self, config_name: &str, kind: ResourceType, handler: Arc<dyn EventHandler>, interval: Duration) {
        let mut active = lock(&self.active);
        active.retain(|r| !(r.config_name == config_name && r.kind == kind));
        active.push(Registration { config_name: config_name.to_string(), kind, interval, handler });
        debug!(config = %config_name, kind = %kind, "callback registered");
    }

    fn unregister_callback(&self, config_name: &str, kind: ResourceType) {
        lock(&self.active).retain(|r| !(r.config_name == config_name && r.kind == kind));
        lock(&self.unregistered).push((config_name.to_string(), kind));
        debug!(config = %config_name, kind = %kind, "callback unregistered");
    }
}
