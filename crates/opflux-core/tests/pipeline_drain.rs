//! End-to-end writer pool behavior against in-memory collaborators:
//! events flow through projection into batches, shutdown drains in-flight
//! points, and the checkpoint reflects only flushed work.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;

use opflux_core::error::{CheckpointError, PipelineError, SinkError};
use opflux_core::event::{ChangeEvent, Namespace, OpKind, ReplTimestamp};
use opflux_core::pipeline::WriterPool;
use opflux_core::point::{Batch, Precision};
use opflux_core::value::Value;
use opflux_core::worker::WorkerSettings;
use opflux_core::{CheckpointStore, Measurement, MeasurementRegistry, SinkClient};

struct MemorySink {
    batches: Mutex<Vec<Batch>>,
    fail_next: AtomicU32,
}

impl MemorySink {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
            fail_next: AtomicU32::new(0),
        })
    }

    fn point_count(&self) -> usize {
        self.batches.lock().unwrap().iter().map(|b| b.points.len()).sum()
    }
}

#[async_trait]
impl SinkClient for MemorySink {
    async fn write(&self, batch: &Batch) -> Result<(), SinkError> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SinkError::Write("transient".into()));
        }
        self.batches.lock().unwrap().push(batch.clone());
        Ok(())
    }

    async fn query(
        &self,
        _statement: &str,
        _database: &str,
        _precision: Option<Precision>,
    ) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Default)]
struct MemoryCheckpoints {
    saved: Mutex<Vec<ReplTimestamp>>,
}

#[async_trait]
impl CheckpointStore for MemoryCheckpoints {
    async fn load(&self, _resume_name: &str) -> Result<Option<ReplTimestamp>, CheckpointError> {
        Ok(self.saved.lock().unwrap().last().copied())
    }

    async fn save(&self, _resume_name: &str, ts: ReplTimestamp) -> Result<(), CheckpointError> {
        self.saved.lock().unwrap().push(ts);
        Ok(())
    }
}

fn registry() -> Arc<MeasurementRegistry> {
    let mut spec = Measurement::new("weather.city");
    spec.tags = ["region".to_string()].into_iter().collect();
    spec.fields = ["temp".to_string()].into_iter().collect();
    Arc::new(MeasurementRegistry::new(vec![spec]).unwrap())
}

fn event(ts: ReplTimestamp, temp: f64) -> ChangeEvent {
    ChangeEvent::new(Namespace::new("weather", "city"), OpKind::Insert, ts).with_data(
        [
            ("region".to_string(), Value::String("NA".into())),
            ("temp".to_string(), Value::Float(temp)),
        ]
        .into(),
    )
}

#[tokio::test]
async fn shutdown_drains_in_flight_points_and_checkpoints() {
    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpoints::default());
    let (events_tx, events_rx) = mpsc::channel(64);
    let (errors_tx, errors_rx) = mpsc::channel(64);

    let pool = WriterPool::spawn(
        2,
        registry(),
        sink.clone(),
        checkpoints.clone(),
        WorkerSettings {
            resume: true,
            ..WorkerSettings::default()
        },
        events_rx,
        errors_tx,
        errors_rx,
    );

    let t1 = ReplTimestamp::new(100, 1);
    let t2 = ReplTimestamp::new(100, 2);
    events_tx.send(event(t1, 21.5)).await.unwrap();
    events_tx.send(event(t2, 22.0)).await.unwrap();
    drop(events_tx);

    // Give workers a moment to pull both events before the drain.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let faults = pool.shutdown().await;
    assert_eq!(faults, 0);
    assert_eq!(sink.point_count(), 2);

    let saved = checkpoints.saved.lock().unwrap().clone();
    assert!(!saved.is_empty());
    // The newest persisted position is the newest flushed event.
    assert_eq!(saved.iter().max().copied(), Some(t2));
}

#[tokio::test]
async fn size_threshold_flushes_without_a_tick() {
    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpoints::default());
    let (events_tx, events_rx) = mpsc::channel(64);
    let (errors_tx, errors_rx) = mpsc::channel(64);

    let pool = WriterPool::spawn(
        1,
        registry(),
        sink.clone(),
        checkpoints,
        WorkerSettings {
            flush_threshold: 2,
            // Long interval so only the size trigger can explain a flush.
            flush_interval: std::time::Duration::from_secs(3600),
            ..WorkerSettings::default()
        },
        events_rx,
        errors_tx,
        errors_rx,
    );

    events_tx.send(event(ReplTimestamp::new(1, 1), 1.0)).await.unwrap();
    events_tx.send(event(ReplTimestamp::new(1, 2), 2.0)).await.unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            if sink.point_count() == 2 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("size-triggered flush");

    drop(events_tx);
    pool.shutdown().await;
}

#[tokio::test]
async fn upstream_errors_raise_the_fault_count() {
    let sink = MemorySink::new();
    let checkpoints = Arc::new(MemoryCheckpoints::default());
    let (events_tx, events_rx) = mpsc::channel(8);
    let (errors_tx, errors_rx) = mpsc::channel(8);

    let pool = WriterPool::spawn(
        1,
        registry(),
        sink,
        checkpoints,
        WorkerSettings::default(),
        events_rx,
        errors_tx.clone(),
        errors_rx,
    );

    errors_tx
        .send(PipelineError::Upstream("cursor died".into()))
        .await
        .unwrap();

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while pool.fault_count() == 0 {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("fault counted");

    drop(events_tx);
    drop(errors_tx);
    let faults = pool.shutdown().await;
    assert_eq!(faults, 1);
}
