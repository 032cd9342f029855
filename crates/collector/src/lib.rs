//! kmeta collector: turns pod/service change events into batched records.
//!
//! [`MetaCollector`] registers a [`Dispatcher`] with a watch-side
//! [`kmeta_kubehub::MetaManager`] for every enabled kind. The dispatcher runs
//! the kind's transforms from the [`ProcessorRegistry`] and enqueues the
//! resulting records into the [`kmeta_buffer::Engine`], which batches them
//! for the sink.

#![forbid(unsafe_code)]

pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod processors;
pub mod registry;
pub mod sink;

pub use config::{CollectorConfig, ConfigError};
pub use dispatch::{DispatchError, Dispatcher};
pub use lifecycle::{LifecycleError, LifecycleState, MetaCollector};
pub use registry::{ProcessorRegistry, Transform};
pub use sink::{ChannelSink, StdoutSink};
