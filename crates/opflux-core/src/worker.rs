//! Writer workers: the parallel consumers of the event stream.
//!
//! Each worker owns its batcher, its flush ticker, and a set of databases
//! it has already ensured in the sink; the sink client, checkpoint store,
//! and channels are shared. A worker's loop selects over shutdown, flush
//! ticks, the shared error channel, and the shared event channel.
//!
//! Flushes write open batches in namespace order. A failed write stops the
//! flush immediately: written batches are gone from the map, the failed and
//! remaining ones stay for the next tick, and the checkpoint does not move.
//! Only after a fully successful flush does the worker persist its newest
//! contributed timestamp. Workers race on that upsert, so the persisted
//! value is a non-deterministic winner among concurrent flushes; upstream
//! redelivery from any earlier position projects to identical points, which
//! keeps the race harmless.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, warn};

use crate::batch::Batcher;
use crate::checkpoint::CheckpointStore;
use crate::error::{PipelineError, ProjectionError, SinkError};
use crate::event::ChangeEvent;
use crate::pipeline::SharedReceiver;
use crate::project::project;
use crate::schema::MeasurementRegistry;
use crate::sink::SinkClient;

/// Knobs shared by every worker in a pool.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Flush a batch as soon as it holds this many points.
    pub flush_threshold: usize,
    /// Periodic flush interval.
    pub flush_interval: Duration,
    /// Issue `CREATE DATABASE` for target databases not yet seen.
    pub auto_create_databases: bool,
    /// Persist a checkpoint after each fully successful flush.
    pub resume: bool,
    /// Checkpoint record key.
    pub resume_name: String,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            flush_threshold: 1000,
            flush_interval: Duration::from_secs(1),
            auto_create_databases: true,
            resume: false,
            resume_name: "default".into(),
        }
    }
}

/// One writer worker.
pub struct Worker {
    id: usize,
    registry: Arc<MeasurementRegistry>,
    sink: Arc<dyn SinkClient>,
    checkpoints: Arc<dyn CheckpointStore>,
    settings: WorkerSettings,
    batcher: Batcher,
    ensured_dbs: HashSet<String>,
}

impl Worker {
    /// Builds a worker around the shared registry, sink, and checkpoint
    /// store.
    #[must_use]
    pub fn new(
        id: usize,
        registry: Arc<MeasurementRegistry>,
        sink: Arc<dyn SinkClient>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: WorkerSettings,
    ) -> Self {
        let batcher = Batcher::new(settings.flush_threshold);
        Self {
            id,
            registry,
            sink,
            checkpoints,
            settings,
            batcher,
            ensured_dbs: HashSet::new(),
        }
    }

    /// The worker loop. Returns after a shutdown signal (or the shutdown
    /// channel closing) and a final drain of open batches.
    pub async fn run(
        mut self,
        events: SharedReceiver<ChangeEvent>,
        errors_tx: mpsc::Sender<PipelineError>,
        errors: SharedReceiver<PipelineError>,
        shutdown: SharedReceiver<()>,
        faults: Arc<AtomicU32>,
    ) {
        let mut flusher = tokio::time::interval(self.settings.flush_interval);
        flusher.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip the immediate first tick.
        flusher.tick().await;

        let mut events_open = true;
        let mut errors_open = true;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    if let Err(e) = self.flush_all().await {
                        faults.fetch_add(1, Ordering::Relaxed);
                        error!(worker = self.id, error = %e, "final flush failed");
                    }
                    debug!(worker = self.id, "writer stopped");
                    return;
                }
                _ = flusher.tick() => {
                    if let Err(e) = self.flush_all().await {
                        let _ = errors_tx.send(e).await;
                    }
                }
                err = errors.recv(), if errors_open => {
                    match err {
                        Some(e) => {
                            faults.fetch_add(1, Ordering::Relaxed);
                            error!(worker = self.id, error = %e, "pipeline error");
                        }
                        None => errors_open = false,
                    }
                }
                event = events.recv(), if events_open => {
                    match event {
                        Some(event) => self.handle_event(event, &errors_tx).await,
                        None => {
                            debug!(worker = self.id, "event stream ended");
                            events_open = false;
                        }
                    }
                }
            }
        }
    }

    async fn handle_event(&mut self, event: ChangeEvent, errors_tx: &mpsc::Sender<PipelineError>) {
        match self.apply(&event) {
            Ok(true) => {
                if let Err(e) = self.flush_all().await {
                    let _ = errors_tx.send(e).await;
                }
            }
            Ok(false) => {}
            Err(projection) => {
                let _ = errors_tx.send(projection.into()).await;
            }
        }
    }

    /// Projects one event into its open batch. Returns true when the batch
    /// reached the flush threshold.
    fn apply(&mut self, event: &ChangeEvent) -> Result<bool, ProjectionError> {
        let qualified = event.ns.qualified();
        let Some(spec) = self.registry.spec_for(&qualified) else {
            return Ok(false);
        };
        match project(event, spec)? {
            Some(point) => Ok(self.batcher.add(
                spec,
                &event.ns.database,
                event.timestamp,
                point,
            )),
            None => Ok(false),
        }
    }

    /// Ensures target databases exist, writes every open batch in namespace
    /// order, and on full success persists the resume checkpoint.
    async fn flush_all(&mut self) -> Result<(), PipelineError> {
        if self.batcher.is_empty() {
            return Ok(());
        }

        self.ensure_databases().await?;

        let mut flushed_points = 0usize;
        for namespace in self.batcher.namespaces() {
            if let Some(batch) = self.batcher.get(&namespace) {
                self.sink.write(batch).await?;
                flushed_points += batch.len();
                self.batcher.remove(&namespace);
            }
        }
        if flushed_points > 0 {
            debug!(worker = self.id, points = flushed_points, "points flushed");
        }

        let last_ts = self.batcher.last_ts();
        if self.settings.resume && !last_ts.is_zero() {
            self.checkpoints
                .save(&self.settings.resume_name, last_ts)
                .await?;
            self.batcher.clear_last_ts();
        }
        Ok(())
    }

    /// Issues `CREATE DATABASE` for any open batch's database not yet
    /// ensured, when auto-creation is enabled.
    async fn ensure_databases(&mut self) -> Result<(), SinkError> {
        if !self.settings.auto_create_databases {
            return Ok(());
        }
        for database in self.batcher.databases() {
            if self.ensured_dbs.contains(&database) {
                continue;
            }
            let statement = format!("CREATE DATABASE \"{database}\"");
            if let Err(e) = self.sink.query(&statement, "", None).await {
                warn!(worker = self.id, database = %database, error = %e, "database creation failed");
                return Err(e);
            }
            self.ensured_dbs.insert(database);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Namespace, OpKind, ReplTimestamp};
    use crate::point::{Batch, Precision};
    use crate::schema::Measurement;
    use crate::value::Value;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Sink that records writes and can fail the next N of them.
    struct RecordingSink {
        writes: Mutex<Vec<Batch>>,
        queries: Mutex<Vec<String>>,
        fail_next_writes: AtomicU32,
    }

    impl RecordingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                writes: Mutex::new(Vec::new()),
                queries: Mutex::new(Vec::new()),
                fail_next_writes: AtomicU32::new(0),
            })
        }

        fn written(&self) -> Vec<Batch> {
            self.writes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl SinkClient for RecordingSink {
        async fn write(&self, batch: &Batch) -> Result<(), SinkError> {
            if self
                .fail_next_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SinkError::Write("injected failure".into()));
            }
            self.writes.lock().unwrap().push(batch.clone());
            Ok(())
        }

        async fn query(
            &self,
            statement: &str,
            _database: &str,
            _precision: Option<Precision>,
        ) -> Result<(), SinkError> {
            self.queries.lock().unwrap().push(statement.to_string());
            Ok(())
        }
    }

    struct MemoryCheckpoints {
        saved: Mutex<Vec<(String, ReplTimestamp)>>,
    }

    impl MemoryCheckpoints {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                saved: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl CheckpointStore for MemoryCheckpoints {
        async fn load(
            &self,
            _resume_name: &str,
        ) -> Result<Option<ReplTimestamp>, crate::error::CheckpointError> {
            Ok(self.saved.lock().unwrap().last().map(|(_, ts)| *ts))
        }

        async fn save(
            &self,
            resume_name: &str,
            ts: ReplTimestamp,
        ) -> Result<(), crate::error::CheckpointError> {
            self.saved
                .lock()
                .unwrap()
                .push((resume_name.to_string(), ts));
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

    fn worker(
        sink: Arc<RecordingSink>,
        checkpoints: Arc<MemoryCheckpoints>,
        resume: bool,
    ) -> Worker {
        let settings = WorkerSettings {
            resume,
            ..WorkerSettings::default()
        };
        Worker::new(0, registry(), sink, checkpoints, settings)
    }

    #[tokio::test]
    async fn flush_writes_in_order_and_checkpoints_newest_ts() {
        let sink = RecordingSink::new();
        let checkpoints = MemoryCheckpoints::new();
        let mut w = worker(sink.clone(), checkpoints.clone(), true);

        let t1 = ReplTimestamp::new(100, 1);
        let t2 = ReplTimestamp::new(100, 2);
        assert!(!w.apply(&event(t1, 1.0)).unwrap());
        assert!(!w.apply(&event(t2, 2.0)).unwrap());

        w.flush_all().await.unwrap();

        let written = sink.written();
        assert_eq!(written.len(), 1);
        assert_eq!(written[0].database, "weather");
        assert_eq!(written[0].points.len(), 2);
        let temps: Vec<_> = written[0]
            .points
            .iter()
            .map(|p| p.fields["temp"].clone())
            .collect();
        assert_eq!(
            temps,
            vec![crate::point::FieldValue::Float(1.0), crate::point::FieldValue::Float(2.0)]
        );

        let saved = checkpoints.saved.lock().unwrap().clone();
        assert_eq!(saved, vec![("default".to_string(), t2)]);

        // No open batches after a successful flush, and the tracked ts is
        // cleared so an idle tick does not re-save.
        assert!(w.batcher.is_empty());
        assert!(w.batcher.last_ts().is_zero());
        w.flush_all().await.unwrap();
        assert_eq!(checkpoints.saved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_flush_retains_batches_and_checkpoint() {
        let sink = RecordingSink::new();
        let checkpoints = MemoryCheckpoints::new();
        let mut w = worker(sink.clone(), checkpoints.clone(), true);

        let t = ReplTimestamp::new(200, 1);
        w.apply(&event(t, 1.0)).unwrap();

        sink.fail_next_writes.store(1, Ordering::SeqCst);
        assert!(w.flush_all().await.is_err());
        assert!(!w.batcher.is_empty());
        assert!(checkpoints.saved.lock().unwrap().is_empty());

        // Next tick succeeds and the checkpoint advances exactly once.
        w.flush_all().await.unwrap();
        assert_eq!(sink.written().len(), 1);
        let saved = checkpoints.saved.lock().unwrap().clone();
        assert_eq!(saved, vec![("default".to_string(), t)]);
    }

    #[tokio::test]
    async fn auto_create_runs_once_per_database() {
        let sink = RecordingSink::new();
        let checkpoints = MemoryCheckpoints::new();
        let mut w = worker(sink.clone(), checkpoints.clone(), false);

        w.apply(&event(ReplTimestamp::new(1, 1), 1.0)).unwrap();
        w.flush_all().await.unwrap();
        w.apply(&event(ReplTimestamp::new(1, 2), 2.0)).unwrap();
        w.flush_all().await.unwrap();

        let queries = sink.queries.lock().unwrap().clone();
        assert_eq!(queries, vec!["CREATE DATABASE \"weather\""]);
    }

    #[tokio::test]
    async fn auto_create_disabled_skips_queries() {
        let sink = RecordingSink::new();
        let checkpoints = MemoryCheckpoints::new();
        let settings = WorkerSettings {
            auto_create_databases: false,
            ..WorkerSettings::default()
        };
        let mut w = Worker::new(0, registry(), sink.clone(), checkpoints, settings);
        w.apply(&event(ReplTimestamp::new(1, 1), 1.0)).unwrap();
        w.flush_all().await.unwrap();
        assert!(sink.queries.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resume_disabled_never_checkpoints() {
        let sink = RecordingSink::new();
        let checkpoints = MemoryCheckpoints::new();
        let mut w = worker(sink.clone(), checkpoints.clone(), false);
        w.apply(&event(ReplTimestamp::new(1, 1), 1.0)).unwrap();
        w.flush_all().await.unwrap();
        assert!(checkpoints.saved.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unconfigured_namespace_is_ignored() {
        let sink = RecordingSink::new();
        let checkpoints = MemoryCheckpoints::new();
        let mut w = worker(sink.clone(), checkpoints, false);
        let other = ChangeEvent::new(
            Namespace::new("metrics", "cpu"),
            OpKind::Insert,
            ReplTimestamp::new(1, 1),
        );
        assert!(!w.apply(&other).unwrap());
        assert!(w.batcher.is_empty());
    }

    #[tokio::test]
    async fn threshold_reached_signals_flush() {
        let sink = RecordingSink::new();
        let checkpoints = MemoryCheckpoints::new();
        let settings = WorkerSettings {
            flush_threshold: 2,
            ..WorkerSettings::default()
        };
        let mut w = Worker::new(0, registry(), sink, checkpoints, settings);
        assert!(!w.apply(&event(ReplTimestamp::new(1, 1), 1.0)).unwrap());
        assert!(w.apply(&event(ReplTimestamp::new(1, 2), 2.0)).unwrap());
    }
}
