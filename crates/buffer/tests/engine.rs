#![forbid(unsafe_code)]

use std::sync::{mpsc as std_mpsc, Arc, Mutex};
use std::time::Duration;

use kmeta_buffer::{BufferConfig, Engine, EnqueueError};
use kmeta_core::{Classification, LogGroup, Record, Sink};
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};

struct ChanSink(mpsc::UnboundedSender<LogGroup>);

impl Sink for ChanSink {
    fn submit(&self, group: LogGroup) -> anyhow::Result<()> {
        self.0.send(group).map_err(|_| anyhow::anyhow!("receiver gone"))
    }
}

fn chan_sink() -> (Arc<dyn Sink>, mpsc::UnboundedReceiver<LogGroup>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(ChanSink(tx)), rx)
}

fn rec(seq: usize) -> Record {
    let mut r = Record::new(1_700_000_000);
    r.set("seq", seq.to_string());
    r
}

fn seqs(group: &LogGroup) -> Vec<usize> {
    group.logs.iter().map(|l| l.get("seq").unwrap().parse().unwrap()).collect()
}

fn cfg(capacity: usize) -> BufferConfig {
    BufferConfig { queue_capacity: capacity, ..BufferConfig::default() }
}

#[tokio::test(start_paused = true)]
async fn size_threshold_flushes_exactly_once() {
    let (sink, mut rx) = chan_sink();
    let (engine, handle) = Engine::spawn(cfg(1000), sink);
    for i in 0..100 {
        engine.enqueue(rec(i), Classification::Entity).await.unwrap();
    }
    let group = rx.recv().await.unwrap();
    assert_eq!(group.classification, Classification::Entity);
    assert_eq!(group.len(), 100);
    // batch was cleared: idle ticks find nothing to flush
    assert!(timeout(Duration::from_secs(10), rx.recv()).await.is_err());
    let stats = engine.stats();
    assert_eq!(stats.flushes, 1);
    assert_eq!(stats.flushed_records, 100);
    assert_eq!(handle.stop().await.total(), 0);
}

#[tokio::test(start_paused = true)]
async fn idle_flush_ships_pending_records_once() {
    let (sink, mut rx) = chan_sink();
    let (engine, handle) = Engine::spawn(cfg(1000), sink);
    for i in 0..7 {
        engine.enqueue(rec(i), Classification::Link).await.unwrap();
    }
    let started = Instant::now();
    let group = rx.recv().await.unwrap();
    let waited = started.elapsed();
    assert_eq!(group.classification, Classification::Link);
    assert_eq!(seqs(&group), (0..7).collect::<Vec<_>>());
    assert!(waited >= Duration::from_secs(3), "flushed too early: {:?}", waited);
    assert!(waited < Duration::from_secs(4), "flushed too late: {:?}", waited);
    assert!(timeout(Duration::from_secs(10), rx.recv()).await.is_err());
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn fifo_within_a_queue_across_flushes() {
    let (sink, mut rx) = chan_sink();
    let (engine, handle) = Engine::spawn(cfg(16), sink);
    let producer = {
        let engine = engine.clone();
        tokio::spawn(async move {
            for i in 0..250 {
                engine.enqueue(rec(i), Classification::Entity).await.unwrap();
            }
        })
    };
    let mut all = Vec::new();
    let mut sizes = Vec::new();
    while all.len() < 250 {
        let g = rx.recv().await.unwrap();
        sizes.push(g.len());
        all.extend(seqs(&g));
    }
    producer.await.unwrap();
    assert_eq!(sizes, vec![100, 100, 50]);
    assert_eq!(all, (0..250).collect::<Vec<_>>());
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn steady_arrivals_postpone_idle_flush() {
    let (sink, mut rx) = chan_sink();
    let (engine, handle) = Engine::spawn(cfg(1000), sink);
    let started = Instant::now();
    engine.enqueue(rec(1000), Classification::Link).await.unwrap();
    // one entity record every 2s keeps the 3s idle timer from ever elapsing
    for i in 0..5 {
        engine.enqueue(rec(i), Classification::Entity).await.unwrap();
        if i < 4 {
            tokio::time::sleep(Duration::from_secs(2)).await;
        }
    }
    let mut groups = vec![rx.recv().await.unwrap()];
    let elapsed = started.elapsed();
    groups.push(rx.recv().await.unwrap());
    assert!(elapsed >= Duration::from_secs(11), "idle flush fired mid-stream: {:?}", elapsed);
    groups.sort_by_key(|g| g.classification == Classification::Link);
    assert_eq!(seqs(&groups[0]), vec![0, 1, 2, 3, 4]);
    assert_eq!(seqs(&groups[1]), vec![1000]);
    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn stop_drops_pending_and_rejects_later_enqueues() {
    let (sink, mut rx) = chan_sink();
    let (engine, handle) = Engine::spawn(cfg(1000), sink);
    for i in 0..5 {
        engine.enqueue(rec(i), Classification::Entity).await.unwrap();
    }
    engine.enqueue(rec(9), Classification::Link).await.unwrap();
    let report = handle.stop().await;
    assert_eq!(report.total(), 6);
    assert_eq!(engine.stats().dropped_shutdown, 6);

    let err = engine.enqueue(rec(10), Classification::Entity).await.unwrap_err();
    assert_eq!(err, EnqueueError::Closed { classification: Classification::Entity });
    assert_eq!(engine.stats().rejected_closed, 1);
    // nothing ever reached the sink
    assert!(timeout(Duration::from_secs(10), rx.recv()).await.unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn dropping_all_producers_drains() {
    let (sink, mut rx) = chan_sink();
    let (engine, _handle) = Engine::spawn(cfg(1000), sink);
    engine.enqueue(rec(1), Classification::Entity).await.unwrap();
    drop(engine);
    let g = rx.recv().await.unwrap();
    assert_eq!(seqs(&g), vec![1]);
}

/// Sink that parks the flush task until released.
struct GateSink {
    entered: mpsc::UnboundedSender<()>,
    release: Mutex<std_mpsc::Receiver<()>>,
}

impl Sink for GateSink {
    fn submit(&self, _group: LogGroup) -> anyhow::Result<()> {
        let _ = self.entered.send(());
        let _ = self.release.lock().unwrap().recv();
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn full_queue_sheds_after_bounded_wait() {
    let (entered_tx, mut entered_rx) = mpsc::unbounded_channel();
    let (release_tx, release_rx) = std_mpsc::channel();
    let sink = Arc::new(GateSink { entered: entered_tx, release: Mutex::new(release_rx) });
    let config = BufferConfig { queue_capacity: 1, flush_size: 1, flush_interval: Duration::from_millis(200) };
    let (engine, handle) = Engine::spawn(config, sink);

    // first record is received and its flush parks the loop
    engine.enqueue(rec(0), Classification::Entity).await.unwrap();
    entered_rx.recv().await.unwrap();
    // second fills the queue (capacity 1)
    engine.enqueue(rec(1), Classification::Entity).await.unwrap();

    let started = std::time::Instant::now();
    let err = engine.enqueue(rec(2), Classification::Entity).await.unwrap_err();
    let waited = started.elapsed();
    assert!(matches!(err, EnqueueError::Timeout { classification: Classification::Entity, .. }));
    assert!(waited >= Duration::from_millis(200), "returned before the bounded wait: {:?}", waited);
    assert!(waited < Duration::from_secs(5), "enqueue hung: {:?}", waited);
    assert_eq!(engine.stats().dropped_backpressure, 1);

    // the other queue is independent
    engine.enqueue(rec(3), Classification::Link).await.unwrap();

    release_tx.send(()).unwrap();
    drop(release_tx);
    handle.stop().await;
}

struct FailingSink;

impl Sink for FailingSink {
    fn submit(&self, _group: LogGroup) -> anyhow::Result<()> {
        anyhow::bail!("downstream unavailable")
    }
}

#[tokio::test(start_paused = true)]
async fn sink_errors_are_counted_not_fatal() {
    let config = BufferConfig { flush_size: 2, ..BufferConfig::default() };
    let (engine, handle) = Engine::spawn(config, Arc::new(FailingSink));
    for i in 0..4 {
        engine.enqueue(rec(i), Classification::Entity).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
    let stats = engine.stats();
    assert_eq!(stats.sink_errors, 2);
    assert_eq!(stats.flushes, 0);
    // the loop is still alive
    engine.enqueue(rec(9), Classification::Entity).await.unwrap();
    assert_eq!(handle.stop().await.total(), 1);
}

#[tokio::test(start_paused = true)]
async fn non_string_fields_counted_at_flush() {
    let (sink, mut rx) = chan_sink();
    let (engine, handle) = Engine::spawn(cfg(1000), sink);
    let mut r = Record::new(5);
    r.set("a", "x").set("b", serde_json::json!(42));
    engine.enqueue(r, Classification::Entity).await.unwrap();
    let g = rx.recv().await.unwrap();
    assert_eq!(g.logs[0].contents.len(), 1);
    assert_eq!(g.logs[0].get("a"), Some("x"));
    assert_eq!(engine.stats().conversion_errors, 1);
    handle.stop().await;
}

/// Sink that takes a few milliseconds per group and records what it saw.
struct SlowSink {
    per_submit: Duration,
    seen: Mutex<Vec<Classification>>,
}

impl Sink for SlowSink {
    fn submit(&self, group: LogGroup) -> anyhow::Result<()> {
        std::thread::sleep(self.per_submit);
        self.seen.lock().unwrap().push(group.classification);
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn busy_entity_queue_does_not_starve_links() {
    let sink = Arc::new(SlowSink { per_submit: Duration::from_millis(5), seen: Mutex::new(Vec::new()) });
    let config = BufferConfig { queue_capacity: 4, flush_size: 1, flush_interval: Duration::from_millis(300) };
    let (engine, handle) = Engine::spawn(config, sink.clone());

    let running = Arc::new(std::sync::atomic::AtomicBool::new(true));
    let producers: Vec<_> = (0..3)
        .map(|p| {
            let engine = engine.clone();
            let running = Arc::clone(&running);
            tokio::spawn(async move {
                let mut i = 0;
                while running.load(std::sync::atomic::Ordering::Relaxed) {
                    let _ = engine.enqueue(rec(p * 1_000_000 + i), Classification::Entity).await;
                    i += 1;
                }
            })
        })
        .collect();
    // let the entity queue saturate first
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut link_timeouts = 0;
    for i in 0..8 {
        if let Err(EnqueueError::Timeout { .. }) = engine.enqueue(rec(i), Classification::Link).await {
            link_timeouts += 1;
        }
    }
    // give the loop time to drain the link queue while entities keep coming
    tokio::time::sleep(Duration::from_millis(200)).await;
    running.store(false, std::sync::atomic::Ordering::Relaxed);
    for p in producers {
        p.await.unwrap();
    }
    handle.stop().await;

    assert_eq!(link_timeouts, 0);
    let seen = sink.seen.lock().unwrap();
    assert_eq!(seen.iter().filter(|c| **c == Classification::Link).count(), 8);
    assert!(seen.iter().filter(|c| **c == Classification::Entity).count() > 8);
}
