#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use kmeta_core::{ChangeEvent, EventType, ResourceType};
use kmeta_kubehub::{EventHandler, ManualMetaManager, MetaManager};

#[derive(Default)]
struct Recorder(Mutex<Vec<ChangeEvent>>);

#[async_trait::async_trait]
impl EventHandler for Recorder {
    async fn handle(&self, event: ChangeEvent) {
        self.0.lock().unwrap().push(event);
    }
}

#[tokio::test]
async fn emits_only_to_matching_kind() {
    let m = ManualMetaManager::new();
    let rec = Arc::new(Recorder::default());
    m.register_callback("cfg", ResourceType::Pod, rec.clone(), Duration::from_secs(60));

    let seen = m.emit(ChangeEvent::new(ResourceType::Pod, EventType::Add, serde_json::json!({}))).await;
    assert_eq!(seen, 1);
    let seen = m.emit(ChangeEvent::new(ResourceType::Service, EventType::Add, serde_json::json!({}))).await;
    assert_eq!(seen, 0);
    assert_eq!(rec.0.lock().unwrap().len(), 1);
    assert_eq!(m.interval_of(ResourceType::Pod), Some(Duration::from_secs(60)));
}

#[tokio::test]
async fn unregister_detaches() {
    let m = ManualMetaManager::new();
    let rec = Arc::new(Recorder::default());
    m.register_callback("cfg", ResourceType::Service, rec.clone(), Duration::ZERO);
    m.register_callback("cfg", ResourceType::Pod, rec.clone(), Duration::ZERO);
    assert_eq!(m.registered(), vec![ResourceType::Service, ResourceType::Pod]);

    m.unregister_callback("cfg", ResourceType::Service);
    assert_eq!(m.registered(), vec![ResourceType::Pod]);
    assert_eq!(m.unregistered(), vec![("cfg".to_string(), ResourceType::Service)]);
    let seen = m.emit(ChangeEvent::new(ResourceType::Service, EventType::Delete, serde_json::json!({}))).await;
    assert_eq!(seen, 0);
}
