//! Uid-keyed object cache for pods and services, plus pod→service link derivation.

use anyhow::{anyhow, Context, Result};
use kmeta_core::{EventType, ResourceType};
use rustc_hash::FxHashMap;
use serde_json::Value;
use uuid::Uuid;

pub type Uid = [u8; 16];

#[derive(Debug, Default)]
pub struct Cache {
    pods: FxHashMap<Uid, Value>,
    services: FxHashMap<Uid, Value>,
}

impl Cache {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, kind: ResourceType) -> Option<&FxHashMap<Uid, Value>> {
        match kind {
            ResourceType::Pod => Some(&self.pods),
            ResourceType::Service => Some(&self.services),
            ResourceType::PodService => None,
        }
    }

    fn map_mut(&mut self, kind: ResourceType) -> Result<&mut FxHashMap<Uid, Value>> {
        match kind {
            ResourceType::Pod => Ok(&mut self.pods),
            ResourceType::Service => Ok(&mut self.services),
            ResourceType::PodService => Err(anyhow!("{} is derived, not cached", kind)),
        }
    }

    pub fn len(&self, kind: ResourceType) -> usize {
        self.map(kind).map(|m| m.len()).unwrap_or(0)
    }

    /// Store `raw` and report whether this was the first sighting.
    pub fn apply(&mut self, kind: ResourceType, mut raw: Value) -> Result<EventType> {
        strip_managed_fields(&mut raw);
        let uid = uid_of(&raw)?;
        let prev = self.map_mut(kind)?.insert(uid, raw);
        Ok(if prev.is_some() { EventType::Update } else { EventType::Add })
    }

    /// Cached copy of the object `raw` identifies, by uid.
    pub fn get(&self, kind: ResourceType, raw: &Value) -> Option<&Value> {
        let uid = uid_of(raw).ok()?;
        self.map(kind)?.get(&uid)
    }

    /// Forget `raw`; returns the cached copy when there was one.
    pub fn remove(&mut self, kind: ResourceType, raw: &Value) -> Result<Option<Value>> {
        let uid = uid_of(raw)?;
        Ok(self.map_mut(kind)?.remove(&uid))
    }

    /// Replace the whole `kind` map after a relist. Returns the objects that
    /// disappeared and, for each listed object, whether it is new. Objects
    /// without a parseable uid are skipped.
    pub fn replace(&mut self, kind: ResourceType, list: Vec<Value>) -> Result<(Vec<Value>, Vec<(EventType, Value)>)> {
        let mut fresh: FxHashMap<Uid, Value> = FxHashMap::default();
        let mut seen = Vec::with_capacity(list.len());
        let old = std::mem::take(self.map_mut(kind)?);
        for mut raw in list {
            strip_managed_fields(&mut raw);
            let Ok(uid) = uid_of(&raw) else { continue };
            let ev = if old.contains_key(&uid) { EventType::Update } else { EventType::Add };
            seen.push((ev, raw.clone()));
            fresh.insert(uid, raw);
        }
        let gone = old.into_iter().filter(|(uid, _)| !fresh.contains_key(uid)).map(|(_, v)| v).collect();
        *self.map_mut(kind)? = fresh;
        Ok((gone, seen))
    }

    pub fn snapshot(&self, kind: ResourceType) -> Vec<Value> {
        match kind {
            ResourceType::PodService => self.all_links(),
            _ => self.map(kind).map(|m| m.values().cloned().collect()).unwrap_or_default(),
        }
    }

    /// Link payloads for every cached service selecting `pod`.
    pub fn links_for_pod(&self, pod: &Value) -> Vec<Value> {
        self.services
            .values()
            .filter(|svc| selects(svc, pod))
            .map(|svc| link_payload(pod, svc))
            .collect()
    }

    /// Link payloads for every cached pod selected by `service`.
    pub fn links_for_service(&self, service: &Value) -> Vec<Value> {
        self.pods
            .values()
            .filter(|pod| selects(service, pod))
            .map(|pod| link_payload(pod, service))
            .collect()
    }

    fn all_links(&self) -> Vec<Value> {
        self.pods.values().flat_map(|pod| self.links_for_pod(pod)).collect()
    }
}

pub fn link_payload(pod: &Value, service: &Value) -> Value {
    serde_json::json!({ "pod": pod, "service": service })
}

/// `(pod uid, service uid)` of a link payload.
pub fn link_key(link: &Value) -> Option<(String, String)> {
    let pod = link.pointer("/pod/metadata/uid")?.as_str()?;
    let service = link.pointer("/service/metadata/uid")?.as_str()?;
    Some((pod.to_string(), service.to_string()))
}

/// A service selects a pod when both live in the same namespace and the
/// service's non-empty `spec.selector` is a subset of the pod labels.
pub fn selects(service: &Value, pod: &Value) -> bool {
    if namespace_of(service) != namespace_of(pod) {
        return false;
    }
    let Some(selector) = service.pointer("/spec/selector").and_then(|v| v.as_object()) else { return false };
    if selector.is_empty() {
        return false;
    }
    let labels = pod.pointer("/metadata/labels").and_then(|v| v.as_object());
    selector.iter().all(|(k, v)| labels.and_then(|l| l.get(k)) == Some(v))
}

fn namespace_of(v: &Value) -> &str {
    v.pointer("/metadata/namespace").and_then(|v| v.as_str()).unwrap_or("")
}

pub fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}

pub fn uid_of(raw: &Value) -> Result<Uid> {
    let uid_str = raw
        .pointer("/metadata/uid")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow!("object missing metadata.uid"))?;
    let u = Uuid::parse_str(uid_str).context("parsing metadata.uid as uuid")?;
    Ok(*u.as_bytes())
}
