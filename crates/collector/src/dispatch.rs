use std::sync::Arc;

use kmeta_buffer::Engine;
use kmeta_core::{ChangeEvent, ResourceType};
use kmeta_kubehub::EventHandler;
use metrics::counter;
use tracing::{debug, error};

use crate::registry::ProcessorRegistry;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown event type {event_type} for {resource_type}")]
    UnknownEventType { resource_type: ResourceType, event_type: String },
}

/// Routes change events through the registry into the buffer engine.
pub struct Dispatcher {
    registry: Arc<ProcessorRegistry>,
    engine: Engine,
}

impl Dispatcher {
    pub fn new(registry: Arc<ProcessorRegistry>, engine: Engine) -> Self {
        Self { registry, engine }
    }

    pub fn registry(&self) -> &ProcessorRegistry {
        &self.registry
    }

    /// Run every transform registered for the event's type, in order, and
    /// enqueue each record produced. Returns how many records the engine
    /// accepted; shed or rejected records are reported by the engine.
    pub async fn dispatch(&self, event: &ChangeEvent) -> Result<usize, DispatchError> {
        let Some(method) = event.event_type.method() else {
            counter!("kmeta_unknown_event_total", 1, "kind" => event.resource_type.tag());
            return Err(DispatchError::UnknownEventType {
                resource_type: event.resource_type,
                event_type: event.event_type.to_string(),
            });
        };
        let transforms = self.registry.get(event.resource_type);
        if transforms.is_empty() {
            return Ok(0);
        }
        let classification = event.resource_type.classification();
        let mut accepted = 0;
        for t in transforms {
            let Some(record) = t.transform(&event.object, method) else { continue };
            if self.engine.enqueue(record, classification).await.is_ok() {
                accepted += 1;
            }
        }
        debug!(kind = %event.resource_type, method, accepted, "event dispatched");
        Ok(accepted)
    }
}

#[async_trait::async_trait]
impl EventHandler for Dispatcher {
    async fn handle(&self, event: ChangeEvent) {
        if let Err(e) = self.dispatch(&event).await {
            error!(error = %e, "unknown event type; event dropped");
        }
    }
}
