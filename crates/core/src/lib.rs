//! kmeta core types: resource tags, change events and identity keys

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod record;

pub use record::{ConversionError, LogContent, LogGroup, Record, Sink, WireLog};

/// Separator joining two kind names into a relationship tag, e.g. `pod->service`.
/// Plain kind names never contain it.
pub const LINK_DELIMITER: &str = "->";

/// Closed set of resource tags the collector knows how to route.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Pod,
    Service,
    PodService,
}

impl ResourceType {
    /// Registration order used by the lifecycle controller.
    pub const ALL: [ResourceType; 3] = [ResourceType::Pod, ResourceType::Service, ResourceType::PodService];

    pub fn tag(&self) -> &'static str {
        match self {
            ResourceType::Pod => "pod",
            ResourceType::Service => "service",
            ResourceType::PodService => "pod->service",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.tag() == tag)
    }

    pub fn classification(&self) -> Classification {
        classify(self.tag())
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Which queue a record travels through.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Entity,
    Link,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Entity => "entity",
            Classification::Link => "link",
        }
    }
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Any tag containing [`LINK_DELIMITER`] describes a relationship.
pub fn classify(tag: &str) -> Classification {
    if tag.contains(LINK_DELIMITER) {
        Classification::Link
    } else {
        Classification::Entity
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum EventType {
    Add,
    Update,
    Delete,
    /// Operation the watch side emitted but the collector does not understand.
    Other(String),
}

impl EventType {
    /// Label handed to transforms; `None` for unrecognised operations.
    pub fn method(&self) -> Option<&'static str> {
        match self {
            EventType::Add => Some("create"),
            EventType::Update => Some("update"),
            EventType::Delete => Some("delete"),
            EventType::Other(_) => None,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Add => f.write_str("add"),
            EventType::Update => f.write_str("update"),
            EventType::Delete => f.write_str("delete"),
            EventType::Other(s) => write!(f, "other({})", s),
        }
    }
}

/// Notification from the watch subsystem. `object` is the raw resource;
/// link events carry `{"pod": .., "service": ..}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub resource_type: ResourceType,
    pub event_type: EventType,
    pub object: serde_json::Value,
}

impl ChangeEvent {
    pub fn new(resource_type: ResourceType, event_type: EventType, object: serde_json::Value) -> Self {
        Self { resource_type, event_type, object }
    }
}

pub mod prelude {
    pub use super::{
        classify, identity_key, identity_key_for, ChangeEvent, Classification, EventType, LogGroup, Record,
        ResourceType, Sink, WireLog,
    };
}

const FNV128_OFFSET: u128 = 0x6c62272e07bb014262b821756295c58d;
const FNV128_PRIME: u128 = 0x0000000001000000000000000000013b;

/// Correlation key for a resource: 128-bit FNV-1a over `namespace ‖ kind ‖ name`,
/// rendered as 32 lowercase hex chars. Not a security primitive.
pub fn identity_key(namespace: &str, kind: &str, name: &str) -> String {
    let mut h = FNV128_OFFSET;
    for part in [namespace, kind, name] {
        for b in part.as_bytes() {
            h ^= *b as u128;
            h = h.wrapping_mul(FNV128_PRIME);
        }
    }
    format!("{:032x}", h)
}

/// [`identity_key`] for a raw object, reading `metadata.namespace`, `kind`
/// and `metadata.name`. Missing fields count as empty.
pub fn identity_key_for(raw: &serde_json::Value) -> String {
    let meta = raw.get("metadata");
    let ns = meta.and_then(|m| m.get("namespace")).and_then(|v| v.as_str()).unwrap_or("");
    let name = meta.and_then(|m| m.get("name")).and_then(|v| v.as_str()).unwrap_or("");
    let kind = raw.get("kind").and_then(|v| v.as_str()).unwrap_or("");
    identity_key(ns, kind, name)
}
