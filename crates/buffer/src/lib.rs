//! kmeta buffer: bounded entity/link queues drained by a single flush task.
//!
//! Records enter through [`Engine::enqueue`]. A full queue makes the caller
//! wait at most `flush_interval`; after that the record is shed. The flush task
//! batches per classification and submits a [`LogGroup`] to the sink when a
//! batch reaches `flush_size`, or when `flush_interval` passes without any
//! wakeup. The idle timer restarts at every wakeup, so steady traffic below
//! the size threshold on either queue postpones idle flushes of both batches.
//!
//! Stopping does not flush: whatever is batched or still queued is dropped and
//! reported in the [`ShutdownReport`].

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use kmeta_core::{Classification, LogGroup, Record, Sink};
use metrics::counter;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::SendTimeoutError, error::TrySendError};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod batch;

pub use batch::Batch;

pub const DEFAULT_FLUSH_SIZE: usize = 100;
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_QUEUE_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferConfig {
    /// Capacity of each of the two queues.
    pub queue_capacity: usize,
    pub flush_size: usize,
    /// Idle flush delay, also the longest time `enqueue` waits on a full queue.
    pub flush_interval: Duration,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            flush_size: DEFAULT_FLUSH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError {
    #[error("{classification} queue stayed full for {waited:?}; record dropped")]
    Timeout { classification: Classification, waited: Duration },
    #[error("{classification} queue closed; engine stopped")]
    Closed { classification: Classification },
}

#[derive(Default)]
pub(crate) struct Counters {
    enqueued: AtomicU64,
    dropped_backpressure: AtomicU64,
    rejected_closed: AtomicU64,
    flushes: AtomicU64,
    flushed_records: AtomicU64,
    conversion_errors: AtomicU64,
    sink_errors: AtomicU64,
    dropped_shutdown: AtomicU64,
}

impl Counters {
    fn add(field: &AtomicU64, n: u64) {
        field.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self) -> EngineStats {
        EngineStats {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped_backpressure: self.dropped_backpressure.load(Ordering::Relaxed),
            rejected_closed: self.rejected_closed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
            flushed_records: self.flushed_records.load(Ordering::Relaxed),
            conversion_errors: self.conversion_errors.load(Ordering::Relaxed),
            sink_errors: self.sink_errors.load(Ordering::Relaxed),
            dropped_shutdown: self.dropped_shutdown.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of the engine counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub enqueued: u64,
    pub dropped_backpressure: u64,
    pub rejected_closed: u64,
    pub flushes: u64,
    pub flushed_records: u64,
    pub conversion_errors: u64,
    pub sink_errors: u64,
    pub dropped_shutdown: u64,
}

/// Records lost because the flush task stopped before shipping them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Sitting in a batch, not yet flushed.
    pub batched: usize,
    /// Still in a queue, never received by the flush task.
    pub queued: usize,
}

impl ShutdownReport {
    pub fn total(&self) -> usize {
        self.batched + self.queued
    }
}

/// Producer side of the engine. Cheap to clone; every watch task can own one.
#[derive(Clone)]
pub struct Engine {
    entity_tx: mpsc::Sender<Record>,
    link_tx: mpsc::Sender<Record>,
    wait: Duration,
    counters: Arc<Counters>,
}

/// Owner of the flush task. Stopping consumes it; dropping it also stops the task.
pub struct FlushHandle {
    stop_tx: oneshot::Sender<()>,
    join: JoinHandle<ShutdownReport>,
    counters: Arc<Counters>,
}

impl Engine {
    /// Create both queues and spawn the flush task on the current tokio runtime.
    pub fn spawn(config: BufferConfig, sink: Arc<dyn Sink>) -> (Engine, FlushHandle) {
        let cap = config.queue_capacity.max(1);
        let (entity_tx, entity_rx) = mpsc::channel::<Record>(cap);
        let (link_tx, link_rx) = mpsc::channel::<Record>(cap);
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let counters = Arc::new(Counters::default());

        let task = FlushTask {
            config,
            sink,
            counters: Arc::clone(&counters),
            entity: Batch::new(Classification::Entity, config.flush_size),
            link: Batch::new(Classification::Link, config.flush_size),
        };
        let join = tokio::spawn(task.run(entity_rx, link_rx, stop_rx));
        info!(
            queue_capacity = cap,
            flush_size = config.flush_size,
            flush_interval_ms = config.flush_interval.as_millis() as u64,
            "flush loop started"
        );

        let engine = Engine { entity_tx, link_tx, wait: config.flush_interval, counters: Arc::clone(&counters) };
        (engine, FlushHandle { stop_tx, join, counters })
    }

    /// Place `record` on its queue. Waits up to `flush_interval` when the queue
    /// is full, then drops the record. Never blocks longer than that.
    pub async fn enqueue(&self, record: Record, classification: Classification) -> Result<(), EnqueueError> {
        let tx = match classification {
            Classification::Entity => &self.entity_tx,
            Classification::Link => &self.link_tx,
        };
        let record = match tx.try_send(record) {
            Ok(()) => {
                self.accepted(classification);
                return Ok(());
            }
            Err(TrySendError::Closed(_)) => return Err(self.closed(classification)),
            Err(TrySendError::Full(record)) => record,
        };
        debug!(kind = %classification, "queue full; waiting for space");
        match tx.send_timeout(record, self.wait).await {
            Ok(()) => {
                self.accepted(classification);
                Ok(())
            }
            Err(SendTimeoutError::Closed(_)) => Err(self.closed(classification)),
            Err(SendTimeoutError::Timeout(_)) => {
                Counters::add(&self.counters.dropped_backpressure, 1);
                counter!("kmeta_backpressure_dropped_total", 1, "kind" => classification.as_str());
                warn!(kind = %classification, waited_ms = self.wait.as_millis() as u64, "send event timeout; record dropped");
                Err(EnqueueError::Timeout { classification, waited: self.wait })
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    fn accepted(&self, classification: Classification) {
        Counters::add(&self.counters.enqueued, 1);
        counter!("kmeta_enqueued_total", 1, "kind" => classification.as_str());
    }

    fn closed(&self, classification: Classification) -> EnqueueError {
        Counters::add(&self.counters.rejected_closed, 1);
        counter!("kmeta_enqueue_rejected_total", 1, "kind" => classification.as_str());
        debug!(kind = %classification, "engine stopped; record rejected");
        EnqueueError::Closed { classification }
    }
}

impl FlushHandle {
    /// Signal the flush task and wait for it to exit. Pending records are not flushed.
    pub async fn stop(self) -> ShutdownReport {
        let _ = self.stop_tx.send(());
        match self.join.await {
            Ok(report) => report,
            Err(e) => {
                warn!(error = %e, "flush loop did not exit cleanly");
                ShutdownReport::default()
            }
        }
    }

    pub fn stats(&self) -> EngineStats {
        self.counters.snapshot()
    }
}

enum Wake {
    Entity(Option<Record>),
    Link(Option<Record>),
    Idle,
}

/// First of: a record on either queue or `idle` elapsing. The two queues are
/// polled in random order so a busy one cannot starve the other. The idle
/// timer is armed per call, i.e. measured from the previous wakeup.
async fn next_wake(
    entity_rx: &mut mpsc::Receiver<Record>,
    link_rx: &mut mpsc::Receiver<Record>,
    entity_open: bool,
    link_open: bool,
    idle: Duration,
) -> Wake {
    tokio::select! {
        r = entity_rx.recv(), if entity_open => Wake::Entity(r),
        r = link_rx.recv(), if link_open => Wake::Link(r),
        _ = tokio::time::sleep(idle) => Wake::Idle,
    }
}

struct FlushTask {
    config: BufferConfig,
    sink: Arc<dyn Sink>,
    counters: Arc<Counters>,
    entity: Batch,
    link: Batch,
}

impl FlushTask {
    async fn run(
        mut self,
        mut entity_rx: mpsc::Receiver<Record>,
        mut link_rx: mpsc::Receiver<Record>,
        mut stop_rx: oneshot::Receiver<()>,
    ) -> ShutdownReport {
        let mut entity_open = true;
        let mut link_open = true;
        let idle = self.config.flush_interval;
        loop {
            tokio::select! {
                biased;
                // Fires on an explicit stop and when the handle is dropped.
                _ = &mut stop_rx => {
                    return self.abandon(&mut entity_rx, &mut link_rx);
                }
                wake = next_wake(&mut entity_rx, &mut link_rx, entity_open, link_open, idle) => match wake {
                    Wake::Entity(Some(r)) => self.push(Classification::Entity, r),
                    Wake::Entity(None) => entity_open = false,
                    Wake::Link(Some(r)) => self.push(Classification::Link, r),
                    Wake::Link(None) => link_open = false,
                    Wake::Idle => {
                        self.entity.flush(self.sink.as_ref(), &self.counters);
                        self.link.flush(self.sink.as_ref(), &self.counters);
                    }
                },
            }
            if !entity_open && !link_open {
                debug!("all producers gone; draining and exiting flush loop");
                self.entity.flush(self.sink.as_ref(), &self.counters);
                self.link.flush(self.sink.as_ref(), &self.counters);
                info!("flush loop stopped");
                return ShutdownReport::default();
            }
        }
    }

    fn push(&mut self, classification: Classification, record: Record) {
        let batch = match classification {
            Classification::Entity => &mut self.entity,
            Classification::Link => &mut self.link,
        };
        batch.push(record);
        if batch.len() >= self.config.flush_size {
            batch.flush(self.sink.as_ref(), &self.counters);
        }
    }

    fn abandon(self, entity_rx: &mut mpsc::Receiver<Record>, link_rx: &mut mpsc::Receiver<Record>) -> ShutdownReport {
        let mut queued = 0usize;
        for rx in [entity_rx, link_rx] {
            rx.close();
            while rx.try_recv().is_ok() {
                queued += 1;
            }
        }
        let report = ShutdownReport { batched: self.entity.len() + self.link.len(), queued };
        if report.total() > 0 {
            Counters::add(&self.counters.dropped_shutdown, report.total() as u64);
            counter!("kmeta_shutdown_dropped_total", report.total() as u64);
            warn!(batched = report.batched, queued = report.queued, "flush loop stopped; pending records dropped");
        } else {
            info!("flush loop stopped");
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_collector_defaults() {
        let c = BufferConfig::default();
        assert_eq!(c.flush_size, 100);
        assert_eq!(c.flush_interval, Duration::from_secs(3));
        assert!(c.queue_capacity >= c.flush_size);
    }

    #[test]
    fn shutdown_report_total() {
        let r = ShutdownReport { batched: 3, queued: 4 };
        assert_eq!(r.total(), 7);
    }
}
