use std::sync::{Arc, Mutex};

use kmeta_buffer::{Engine, EngineStats, FlushHandle, ShutdownReport};
use kmeta_core::{ResourceType, Sink};
use kmeta_kubehub::{EventHandler, MetaManager};
use tracing::{info, warn};

use crate::config::CollectorConfig;
use crate::dispatch::Dispatcher;
use crate::processors;
use crate::registry::{ProcessorRegistry, Transform};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum LifecycleError {
    #[error("collector already started")]
    AlreadyStarted,
    #[error("collector not started")]
    NotStarted,
    #[error("collector already stopped")]
    AlreadyStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Idle,
    Running,
    Stopped,
}

enum State {
    Idle,
    Running { registered: Vec<ResourceType>, engine: Engine, flush: FlushHandle },
    Stopped,
}

/// Wires the dispatcher into the watch side and owns the flush task.
/// Idle → Running → Stopped; any other transition is rejected.
pub struct MetaCollector {
    config: CollectorConfig,
    manager: Arc<dyn MetaManager>,
    sink: Arc<dyn Sink>,
    extra: Vec<(ResourceType, Arc<dyn Transform>)>,
    state: Mutex<State>,
}

impl MetaCollector {
    pub fn new(config: CollectorConfig, manager: Arc<dyn MetaManager>, sink: Arc<dyn Sink>) -> Self {
        Self { config, manager, sink, extra: Vec::new(), state: Mutex::new(State::Idle) }
    }

    /// Append a transform for `kind`, run after the built-in ones. Ignored
    /// when `kind` is not enabled.
    pub fn with_transform(mut self, kind: ResourceType, t: impl Transform + 'static) -> Self {
        self.extra.push((kind, Arc::new(t)));
        self
    }

    pub fn config(&self) -> &CollectorConfig {
        &self.config
    }

    pub fn state(&self) -> LifecycleState {
        match *self.lock() {
            State::Idle => LifecycleState::Idle,
            State::Running { .. } => LifecycleState::Running,
            State::Stopped => LifecycleState::Stopped,
        }
    }

    /// Engine counters while running.
    pub fn stats(&self) -> Option<EngineStats> {
        match &*self.lock() {
            State::Running { engine, .. } => Some(engine.stats()),
            _ => None,
        }
    }

    /// Producer handle into the running engine.
    pub fn engine(&self) -> Option<Engine> {
        match &*self.lock() {
            State::Running { engine, .. } => Some(engine.clone()),
            _ => None,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn build_registry(&self, kinds: &[ResourceType]) -> ProcessorRegistry {
        let keep_alive = self.config.interval.as_secs().saturating_mul(2);
        let mut registry = ProcessorRegistry::new();
        for &kind in kinds {
            processors::register_defaults(&mut registry, kind, keep_alive);
            for (k, t) in self.extra.iter().filter(|(k, _)| *k == kind) {
                registry.register_arc(*k, Arc::clone(t));
            }
        }
        registry
    }

    /// Build the registry, start the flush task and register one callback
    /// per enabled kind. Must run inside a tokio runtime.
    pub fn start(&self) -> Result<(), LifecycleError> {
        let mut state = self.lock();
        match *state {
            State::Idle => {}
            State::Running { .. } => return Err(LifecycleError::AlreadyStarted),
            State::Stopped => return Err(LifecycleError::AlreadyStopped),
        }
        let kinds = self.config.enabled_kinds();
        let registry = Arc::new(self.build_registry(&kinds));
        let (engine, flush) = Engine::spawn(self.config.buffer_config(), Arc::clone(&self.sink));
        let handler: Arc<dyn EventHandler> = Arc::new(Dispatcher::new(registry, engine.clone()));
        for &kind in kinds.iter() {
            self.manager.register_callback(&self.config.config_name, kind, Arc::clone(&handler), self.config.interval);
        }
        info!(config = %self.config.config_name, kinds = ?kinds, "meta collector started");
        *state = State::Running { registered: kinds, engine, flush };
        Ok(())
    }

    /// Unregister every callback, stop the flush task and report what was
    /// still pending. Pending records are not flushed.
    pub async fn stop(&self) -> Result<ShutdownReport, LifecycleError> {
        let (registered, flush) = {
            let mut state = self.lock();
            match std::mem::replace(&mut *state, State::Stopped) {
                State::Running { registered, flush, .. } => (registered, flush),
                State::Idle => {
                    *state = State::Idle;
                    return Err(LifecycleError::NotStarted);
                }
                State::Stopped => return Err(LifecycleError::AlreadyStopped),
            }
        };
        for kind in registered.iter() {
            self.manager.unregister_callback(&self.config.config_name, *kind);
        }
        let report = flush.stop().await;
        if report.total() > 0 {
            warn!(config = %self.config.config_name, dropped = report.total(), "meta collector stopped with pending records");
        } else {
            info!(config = %self.config.config_name, "meta collector stopped");
        }
        Ok(report)
    }
}
