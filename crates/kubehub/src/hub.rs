//! Client-independent half of the watch side: the object cache, the
//! registered handlers and the translation of watch notifications into
//! [`ChangeEvent`]s, including derived `pod->service` links.

use std::sync::{Arc, RwLock};

use kmeta_core::{ChangeEvent, EventType, ResourceType};
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tracing::{debug, warn};

use crate::cache::{link_key, uid_of, Cache, Uid};
use crate::{read, write, EventHandler};

pub(crate) type RegKey = (String, ResourceType);

type LinkSet = Vec<(EventType, Value)>;

/// Cache plus handler table. Fed by watchers (or tests) through
/// [`on_applied`](Self::on_applied), [`on_deleted`](Self::on_deleted) and
/// [`on_restarted`](Self::on_restarted).
#[derive(Default)]
pub struct WatchHub {
    cache: RwLock<Cache>,
    handlers: RwLock<FxHashMap<RegKey, Arc<dyn EventHandler>>>,
}

impl WatchHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route events of `kind` to `handler`, replacing an earlier handler
    /// registered under the same name.
    pub fn attach(&self, config_name: &str, kind: ResourceType, handler: Arc<dyn EventHandler>) {
        write(&self.handlers).insert((config_name.to_string(), kind), handler);
    }

    /// Returns whether a handler was registered.
    pub fn detach(&self, config_name: &str, kind: ResourceType) -> bool {
        write(&self.handlers).remove(&(config_name.to_string(), kind)).is_some()
    }

    pub fn has_handlers(&self) -> bool {
        !read(&self.handlers).is_empty()
    }

    pub fn clear_handlers(&self) {
        write(&self.handlers).clear();
    }

    pub fn reset_cache(&self) {
        *write(&self.cache) = Cache::new();
    }

    pub fn cached(&self, kind: ResourceType) -> usize {
        read(&self.cache).len(kind)
    }

    fn handlers_for(&self, kind: ResourceType) -> Vec<Arc<dyn EventHandler>> {
        read(&self.handlers).iter().filter(|((_, k), _)| *k == kind).map(|(_, h)| Arc::clone(h)).collect()
    }

    fn wants_links(&self) -> bool {
        read(&self.handlers).keys().any(|(_, k)| *k == ResourceType::PodService)
    }

    async fn emit(&self, kind: ResourceType, event_type: EventType, object: Value) {
        let handlers = self.handlers_for(kind);
        if handlers.is_empty() {
            return;
        }
        counter!("kmeta_watch_events_total", 1, "kind" => kind.tag());
        for h in handlers {
            h.handle(ChangeEvent::new(kind, event_type.clone(), object.clone())).await;
        }
    }

    async fn emit_links(&self, links: LinkSet) {
        for (ev, link) in links {
            self.emit(ResourceType::PodService, ev, link).await;
        }
    }

    fn links_for(&self, cache: &Cache, kind: ResourceType, raw: &Value) -> Vec<Value> {
        match kind {
            ResourceType::Pod => cache.links_for_pod(raw),
            ResourceType::Service => cache.links_for_service(raw),
            ResourceType::PodService => Vec::new(),
        }
    }

    /// An object was created or changed. Emits the object event, then one
    /// link event per matching counterpart. Links that held for the previous
    /// copy but no longer match are emitted as deletes.
    pub async fn on_applied(&self, kind: ResourceType, raw: Value) {
        let links = self.wants_links();
        let (ev, changed) = {
            let mut cache = write(&self.cache);
            let before = match (links, cache.get(kind, &raw)) {
                (true, Some(prev)) => self.links_for(&cache, kind, prev),
                _ => Vec::new(),
            };
            let ev = match cache.apply(kind, raw.clone()) {
                Ok(ev) => ev,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "skipping object");
                    return;
                }
            };
            let after = if links { self.links_for(&cache, kind, &raw) } else { Vec::new() };
            (ev.clone(), diff_links(&ev, before, after))
        };
        self.emit(kind, ev, raw).await;
        self.emit_links(changed).await;
    }

    /// An object was deleted. Its links are emitted as deletes after it.
    pub async fn on_deleted(&self, kind: ResourceType, raw: Value) {
        let links = {
            let mut cache = write(&self.cache);
            let links = if self.wants_links() { self.links_for(&cache, kind, &raw) } else { Vec::new() };
            if let Err(e) = cache.remove(kind, &raw) {
                warn!(kind = %kind, error = %e, "skipping object");
                return;
            }
            links
        };
        self.emit(kind, EventType::Delete, raw).await;
        self.emit_links(links.into_iter().map(|l| (EventType::Delete, l)).collect()).await;
    }

    /// The watch relisted `kind`. Objects missing from `list` are deleted
    /// together with their links; listed ones are emitted as adds or updates
    /// with their links diffed against the previous copy.
    pub async fn on_restarted(&self, kind: ResourceType, list: Vec<Value>) {
        debug!(kind = %kind, count = list.len(), "watch restart");
        let links = self.wants_links();
        let (gone, seen) = {
            let mut cache = write(&self.cache);
            let mut before: FxHashMap<Uid, Vec<Value>> = FxHashMap::default();
            if links {
                for raw in list.iter() {
                    if let (Ok(uid), Some(prev)) = (uid_of(raw), cache.get(kind, raw)) {
                        before.insert(uid, self.links_for(&cache, kind, prev));
                    }
                }
            }
            let (gone, seen) = match cache.replace(kind, list) {
                Ok(r) => r,
                Err(e) => {
                    warn!(kind = %kind, error = %e, "relist rejected");
                    return;
                }
            };
            // a relist only touches `kind`, so counterpart links still resolve
            let gone: Vec<_> = gone
                .into_iter()
                .map(|raw| {
                    let l = if links { self.links_for(&cache, kind, &raw) } else { Vec::new() };
                    (raw, l.into_iter().map(|link| (EventType::Delete, link)).collect::<LinkSet>())
                })
                .collect();
            let seen: Vec<_> = seen
                .into_iter()
                .map(|(ev, raw)| {
                    let prev = uid_of(&raw).ok().and_then(|u| before.remove(&u)).unwrap_or_default();
                    let after = if links { self.links_for(&cache, kind, &raw) } else { Vec::new() };
                    let l = diff_links(&ev, prev, after);
                    (ev, raw, l)
                })
                .collect();
            (gone, seen)
        };
        for (raw, l) in gone {
            self.emit(kind, EventType::Delete, raw).await;
            self.emit_links(l).await;
        }
        for (ev, raw, l) in seen {
            self.emit(kind, ev, raw).await;
            self.emit_links(l).await;
        }
    }

    /// Re-send every cached object of `kind` as an update to the handler
    /// registered under `(config_name, kind)`. Returns `false` once that
    /// handler is gone.
    pub async fn resend(&self, config_name: &str, kind: ResourceType) -> bool {
        let Some(handler) = read(&self.handlers).get(&(config_name.to_string(), kind)).cloned() else {
            return false;
        };
        let objects = read(&self.cache).snapshot(kind);
        debug!(config = %config_name, kind = %kind, count = objects.len(), "keep-alive resend");
        for object in objects {
            handler.handle(ChangeEvent::new(kind, EventType::Update, object)).await;
        }
        true
    }
}

/// Links in `after` carry `ev`, except ones new to an updated object, which
/// are adds. Links only in `before` become deletes.
fn diff_links(ev: &EventType, before: Vec<Value>, after: Vec<Value>) -> LinkSet {
    let before_keys: FxHashSet<_> = before.iter().filter_map(link_key).collect();
    let after_keys: FxHashSet<_> = after.iter().filter_map(link_key).collect();
    let mut out: LinkSet = after
        .into_iter()
        .map(|link| {
            let known = link_key(&link).map(|k| before_keys.contains(&k)).unwrap_or(false);
            let e = if *ev == EventType::Update && !known { EventType::Add } else { ev.clone() };
            (e, link)
        })
        .collect();
    out.extend(
        before
            .into_iter()
            .filter(|link| link_key(link).map(|k| !after_keys.contains(&k)).unwrap_or(false))
            .map(|link| (EventType::Delete, link)),
    );
    out
}
