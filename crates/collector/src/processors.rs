//! Built-in transforms for pods, services and their relationships.
//!
//! Entity records carry the `__domain__`/`__entity_type__`/`__entity_id__`
//! header followed by resource fields; link records carry source and
//! destination entity ids. Every value is rendered as a string.

use kmeta_core::{identity_key, identity_key_for, Record, ResourceType};
use serde_json::Value;

use crate::registry::ProcessorRegistry;

pub const DOMAIN: &str = "k8s";
pub const POD_ENTITY_TYPE: &str = "k8s.pod";
pub const SERVICE_ENTITY_TYPE: &str = "k8s.service";
pub const REPLICASET_ENTITY_TYPE: &str = "k8s.replicaset";
pub const RELATION_RELATED_TO: &str = "related_to";

/// Register the built-in transforms for `kind`. Entities are kept alive on
/// the consumer side for `keep_alive_secs`.
pub fn register_defaults(registry: &mut ProcessorRegistry, kind: ResourceType, keep_alive_secs: u64) {
    match kind {
        ResourceType::Pod => {
            registry
                .register(kind, move |o: &Value, m: &str| pod_entity(o, m, keep_alive_secs))
                .register(kind, move |o: &Value, m: &str| pod_replicaset_link(o, m, keep_alive_secs));
        }
        ResourceType::Service => {
            registry.register(kind, move |o: &Value, m: &str| service_entity(o, m, keep_alive_secs));
        }
        ResourceType::PodService => {
            registry.register(kind, move |o: &Value, m: &str| pod_service_link(o, m, keep_alive_secs));
        }
    }
}

fn str_at<'a>(v: &'a Value, ptr: &str) -> &'a str {
    v.pointer(ptr).and_then(|v| v.as_str()).unwrap_or("")
}

fn json_at(v: &Value, ptr: &str) -> String {
    match v.pointer(ptr) {
        Some(x) if !x.is_null() => x.to_string(),
        _ => "{}".to_string(),
    }
}

fn created_secs(v: &Value) -> i64 {
    v.pointer("/metadata/creationTimestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.timestamp())
        .unwrap_or(0)
}

fn entity_header(object: &Value, method: &str, entity_type: &str, keep_alive_secs: u64) -> Option<Record> {
    let name = str_at(object, "/metadata/name");
    if name.is_empty() {
        return None;
    }
    let mut r = Record::now();
    let now = r.timestamp;
    let created = created_secs(object);
    let first_seen = if created > 0 { created } else { now };
    r.set("__domain__", DOMAIN)
        .set("__entity_type__", entity_type)
        .set("__entity_id__", identity_key_for(object))
        .set("__method__", method)
        .set("__first_observed_time__", first_seen.to_string())
        .set("__last_observed_time__", now.to_string())
        .set("__keep_alive_seconds__", keep_alive_secs.to_string())
        .set("namespace", str_at(object, "/metadata/namespace"))
        .set("name", name)
        .set("api_version", str_at(object, "/apiVersion"))
        .set("kind", str_at(object, "/kind"))
        .set("labels", json_at(object, "/metadata/labels"))
        .set("annotations", json_at(object, "/metadata/annotations"))
        .set("creation_time", str_at(object, "/metadata/creationTimestamp"));
    Some(r)
}

fn link_header(method: &str, keep_alive_secs: u64) -> Record {
    let mut r = Record::now();
    let now = r.timestamp.to_string();
    r.set("__src_domain__", DOMAIN)
        .set("__dest_domain__", DOMAIN)
        .set("__method__", method)
        .set("__first_observed_time__", now.clone())
        .set("__last_observed_time__", now)
        .set("__keep_alive_seconds__", keep_alive_secs.to_string());
    r
}

pub fn pod_entity(object: &Value, method: &str, keep_alive_secs: u64) -> Option<Record> {
    let mut r = entity_header(object, method, POD_ENTITY_TYPE, keep_alive_secs)?;
    let restarts: i64 = object
        .pointer("/status/containerStatuses")
        .and_then(|v| v.as_array())
        .map(|cs| cs.iter().filter_map(|c| c.get("restartCount").and_then(|n| n.as_i64())).sum())
        .unwrap_or(0);
    r.set("status", str_at(object, "/status/phase"))
        .set("instance_ip", str_at(object, "/status/podIP"))
        .set("node_name", str_at(object, "/spec/nodeName"))
        .set("restart_count", restarts.to_string());
    Some(r)
}

/// Link from a pod to the ReplicaSet owning it; `None` when unowned.
pub fn pod_replicaset_link(object: &Value, method: &str, keep_alive_secs: u64) -> Option<Record> {
    let name = str_at(object, "/metadata/name");
    if name.is_empty() {
        return None;
    }
    let ns = str_at(object, "/metadata/namespace");
    let owner = object
        .pointer("/metadata/ownerReferences")
        .and_then(|v| v.as_array())?
        .iter()
        .find(|o| o.get("kind").and_then(|k| k.as_str()) == Some("ReplicaSet"))?;
    let owner_name = owner.get("name").and_then(|n| n.as_str()).filter(|s| !s.is_empty())?;
    let mut r = link_header(method, keep_alive_secs);
    r.set("__src_entity_type__", POD_ENTITY_TYPE)
        .set("__src_entity_id__", identity_key_for(object))
        .set("__dest_entity_type__", REPLICASET_ENTITY_TYPE)
        .set("__dest_entity_id__", identity_key(ns, "ReplicaSet", owner_name))
        .set("__relation_type__", RELATION_RELATED_TO);
    Some(r)
}

pub fn service_entity(object: &Value, method: &str, keep_alive_secs: u64) -> Option<Record> {
    let mut r = entity_header(object, method, SERVICE_ENTITY_TYPE, keep_alive_secs)?;
    let ports = match object.pointer("/spec/ports") {
        Some(p) if p.is_array() => p.to_string(),
        _ => "[]".to_string(),
    };
    r.set("type", str_at(object, "/spec/type"))
        .set("cluster_ip", str_at(object, "/spec/clusterIP"))
        .set("ports", ports)
        .set("selector", json_at(object, "/spec/selector"));
    Some(r)
}

/// Link from a pod to a service selecting it. Expects `{"pod": .., "service": ..}`.
pub fn pod_service_link(object: &Value, method: &str, keep_alive_secs: u64) -> Option<Record> {
    let pod = object.get("pod")?;
    let service = object.get("service")?;
    if str_at(pod, "/metadata/name").is_empty() || str_at(service, "/metadata/name").is_empty() {
        return None;
    }
    let mut r = link_header(method, keep_alive_secs);
    r.set("__src_entity_type__", POD_ENTITY_TYPE)
        .set("__src_entity_id__", identity_key_for(pod))
        .set("__dest_entity_type__", SERVICE_ENTITY_TYPE)
        .set("__dest_entity_id__", identity_key_for(service))
        .set("__relation_type__", RELATION_RELATED_TO);
    Some(r)
}
