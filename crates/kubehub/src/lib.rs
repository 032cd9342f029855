//! kmeta kubehub – watch subsystem seam and kube watcher wiring
//!
//! Consumers register an [`EventHandler`] per resource kind through a
//! [`MetaManager`]. [`KubeMetaManager`] backs that with kube list+watch over
//! pods and services, derives `pod->service` link events from service
//! selectors and re-sends cached objects every registration interval. The
//! cache and handler table live in [`WatchHub`], which needs no client.

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kmeta_core::{ChangeEvent, ResourceType};
use kube::{
    api::Api,
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client, Resource,
};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

pub mod cache;
pub mod hub;
pub mod manual;

pub use cache::Cache;
pub use hub::WatchHub;
pub use manual::ManualMetaManager;

use hub::RegKey;

/// Receiver of change events for the kinds it was registered under.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: ChangeEvent);
}

/// Watch-side registration surface.
pub trait MetaManager: Send + Sync {
    /// Route events of `kind` to `handler`; cached objects are re-sent as
    /// updates every `interval` (zero disables the re-send).
    fn register_callback(&self, config_name: &str, kind: ResourceType, handler: Arc<dyn EventHandler>, interval: Duration);
    fn unregister_callback(&self, config_name: &str, kind: ResourceType);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn read<T>(m: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    m.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(m: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    m.write().unwrap_or_else(|e| e.into_inner())
}

struct Inner {
    client: Client,
    namespace: Option<String>,
    hub: Arc<WatchHub>,
    tickers: Mutex<FxHashMap<RegKey, JoinHandle<()>>>,
    watchers: Mutex<FxHashMap<ResourceType, JoinHandle<()>>>,
}

/// kube-backed [`MetaManager`]. Watchers start with the first registration
/// that needs them and stop when the last registration goes away.
#[derive(Clone)]
pub struct KubeMetaManager {
    inner: Arc<Inner>,
}

impl KubeMetaManager {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                client,
                namespace,
                hub: Arc::new(WatchHub::new()),
                tickers: Mutex::new(FxHashMap::default()),
                watchers: Mutex::new(FxHashMap::default()),
            }),
        }
    }

    /// Build from the current kube context.
    pub async fn try_default(namespace: Option<String>) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, namespace))
    }

    /// Abort every watcher and keep-alive task.
    pub fn shutdown(&self) {
        for (_, t) in lock(&self.inner.tickers).drain() {
            t.abort();
        }
        self.inner.stop_watchers();
        self.inner.hub.clear_handlers();
    }

    fn ensure_watchers(&self, kind: ResourceType) {
        let needed: &[ResourceType] = match kind {
            ResourceType::Pod => &[ResourceType::Pod],
            ResourceType::Service => &[ResourceType::Service],
            ResourceType::PodService => &[ResourceType::Pod, ResourceType::Service],
        };
        let mut watchers = lock(&self.inner.watchers);
        for k in needed {
            if watchers.contains_key(k) {
                continue;
            }
            let inner = Arc::clone(&self.inner);
            let task = match k {
                ResourceType::Pod => tokio::spawn(run_watcher::<Pod>(inner, *k)),
                _ => tokio::spawn(run_watcher::<Service>(inner, *k)),
            };
            watchers.insert(*k, task);
        }
    }
}

impl MetaManager for KubeMetaManager {
    fn register_callback(&self, config_name: &str, kind: ResourceType, handler: Arc<dyn EventHandler>, interval: Duration) {
        let key: RegKey = (config_name.to_string(), kind);
        self.inner.hub.attach(config_name, kind, handler);
        self.ensure_watchers(kind);
        if !interval.is_zero() {
            let task = tokio::spawn(keep_alive(Arc::clone(&self.inner.hub), key.clone(), interval));
            if let Some(prev) = lock(&self.inner.tickers).insert(key, task) {
                prev.abort();
            }
        }
        info!(config = %config_name, kind = %kind, interval_secs = interval.as_secs(), "callback registered");
    }

    fn unregister_callback(&self, config_name: &str, kind: ResourceType) {
        let key: RegKey = (config_name.to_string(), kind);
        let removed = self.inner.hub.detach(config_name, kind);
        if let Some(t) = lock(&self.inner.tickers).remove(&key) {
            t.abort();
        }
        if !self.inner.hub.has_handlers() {
            self.inner.stop_watchers();
        }
        if removed {
            info!(config = %config_name, kind = %kind, "callback unregistered");
        } else {
            debug!(config = %config_name, kind = %kind, "unregister for unknown callback ignored");
        }
    }
}

impl Inner {
    fn stop_watchers(&self) {
        let mut watchers = lock(&self.watchers);
        if watchers.is_empty() {
            return;
        }
        for (_, t) in watchers.drain() {
            t.abort();
        }
        self.hub.reset_cache();
        info!("watchers stopped");
    }
}

fn to_raw<K: Serialize>(obj: &K) -> Option<Value> {
    match serde_json::to_value(obj) {
        Ok(mut v) => {
            cache::strip_managed_fields(&mut v);
            Some(v)
        }
        Err(e) => {
            warn!(error = %e, "serializing watched object");
            None
        }
    }
}

async fn run_watcher<K>(inner: Arc<Inner>, kind: ResourceType)
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + DeserializeOwned
        + Serialize
        + Debug
        + Send
        + Sync
        + 'static,
{
    let api: Api<K> = match &inner.namespace {
        Some(ns) => Api::namespaced(inner.client.clone(), ns),
        None => Api::all(inner.client.clone()),
    };
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    info!(kind = %kind, ns = ?inner.namespace, "watcher started");
    while let Some(ev) = stream.next().await {
        match ev {
            Ok(Event::Applied(o)) => {
                if let Some(raw) = to_raw(&o) {
                    inner.hub.on_applied(kind, raw).await;
                }
            }
            Ok(Event::Deleted(o)) => {
                if let Some(raw) = to_raw(&o) {
                    inner.hub.on_deleted(kind, raw).await;
                }
            }
            Ok(Event::Restarted(list)) => {
                let raws = list.iter().filter_map(|o| to_raw(o)).collect();
                inner.hub.on_restarted(kind, raws).await;
            }
            Err(e) => {
                counter!("kmeta_watch_errors_total", 1, "kind" => kind.tag());
                warn!(kind = %kind, error = %e, "watch error; backing off");
            }
        }
    }
    warn!(kind = %kind, "watcher stream ended");
}

async fn keep_alive(hub: Arc<WatchHub>, key: RegKey, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if !hub.resend(&key.0, key.1).await {
            break;
        }
    }
}
