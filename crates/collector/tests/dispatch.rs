#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kmeta_buffer::{BufferConfig, Engine, FlushHandle};
use kmeta_collector::{ChannelSink, DispatchError, Dispatcher, ProcessorRegistry};
use kmeta_core::{ChangeEvent, EventType, Record, ResourceType};
use serde_json::{json, Value};

fn counting(calls: Arc<AtomicUsize>, emit: bool) -> impl Fn(&Value, &str) -> Option<Record> + Send + Sync {
    move |_o, m| {
        calls.fetch_add(1, Ordering::SeqCst);
        emit.then(|| {
            let mut r = Record::now();
            r.set("method", m);
            r
        })
    }
}

fn dispatcher(registry: ProcessorRegistry) -> (Dispatcher, Engine, FlushHandle) {
    let (sink, _rx) = ChannelSink::new();
    let (engine, handle) = Engine::spawn(BufferConfig::default(), Arc::new(sink));
    (Dispatcher::new(Arc::new(registry), engine.clone()), engine, handle)
}

#[tokio::test]
async fn unknown_event_type_errors_once_without_enqueue() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut reg = ProcessorRegistry::new();
    reg.register(ResourceType::Pod, counting(Arc::clone(&calls), true));
    let (d, engine, _flush) = dispatcher(reg);

    let ev = ChangeEvent::new(ResourceType::Pod, EventType::Other("Bookmark".into()), json!({}));
    let err = d.dispatch(&ev).await.unwrap_err();
    assert_eq!(
        err,
        DispatchError::UnknownEventType { resource_type: ResourceType::Pod, event_type: "Bookmark".into() }
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(engine.stats().enqueued, 0);
}

#[tokio::test]
async fn unregistered_type_is_a_silent_noop() {
    let (d, engine, _flush) = dispatcher(ProcessorRegistry::new());
    let ev = ChangeEvent::new(ResourceType::Service, EventType::Add, json!({}));
    assert_eq!(d.dispatch(&ev).await, Ok(0));
    assert_eq!(engine.stats().enqueued, 0);
}

#[tokio::test]
async fn runs_every_transform_and_skips_none() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut reg = ProcessorRegistry::new();
    reg.register(ResourceType::Pod, counting(Arc::clone(&calls), true))
        .register(ResourceType::Pod, counting(Arc::clone(&calls), false))
        .register(ResourceType::Pod, counting(Arc::clone(&calls), true));
    let (d, engine, _flush) = dispatcher(reg);

    for et in [EventType::Add, EventType::Update, EventType::Delete] {
        let ev = ChangeEvent::new(ResourceType::Pod, et, json!({}));
        assert_eq!(d.dispatch(&ev).await, Ok(2));
    }
    assert_eq!(calls.load(Ordering::SeqCst), 9);
    assert_eq!(engine.stats().enqueued, 6);
}
