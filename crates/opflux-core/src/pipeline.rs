//! Wiring for the writer pool: shared channels, spawn, shutdown fan-out.
//!
//! The supervisor (the binary) builds the upstream reader, the sink client,
//! and the checkpoint store, then hands this module one event channel and
//! one error channel. [`WriterPool::spawn`] launches N workers contending
//! on those channels; [`WriterPool::shutdown`] sends one shutdown signal
//! per worker, waits for the final drains, and reports the fault count that
//! decides the process exit status.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};
use tracing::info;

use crate::checkpoint::CheckpointStore;
use crate::error::PipelineError;
use crate::event::ChangeEvent;
use crate::schema::MeasurementRegistry;
use crate::sink::SinkClient;
use crate::worker::{Worker, WorkerSettings};

/// A receiver pulled from by several tasks. Receives are serialized by a
/// lock held only for the duration of one `recv`.
pub struct SharedReceiver<T> {
    inner: Arc<Mutex<mpsc::Receiver<T>>>,
}

impl<T> Clone for SharedReceiver<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send> SharedReceiver<T> {
    /// Wraps a channel receiver for shared consumption.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<T>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(rx)),
        }
    }

    /// Receives the next message; `None` once the channel is closed and
    /// drained. Cancel-safe: an abandoned call loses no message.
    pub async fn recv(&self) -> Option<T> {
        self.inner.lock().await.recv().await
    }
}

/// A running pool of writer workers.
pub struct WriterPool {
    handles: Vec<tokio::task::JoinHandle<()>>,
    shutdown_tx: mpsc::Sender<()>,
    faults: Arc<AtomicU32>,
}

impl WriterPool {
    /// Spawns `count` workers (at least one) sharing the event and error
    /// channels. Workers push their own failures into `errors_tx` and drain
    /// `errors_rx` cooperatively; each drained error is logged and counted
    /// as a fault.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        count: usize,
        registry: Arc<MeasurementRegistry>,
        sink: Arc<dyn SinkClient>,
        checkpoints: Arc<dyn CheckpointStore>,
        settings: WorkerSettings,
        events: mpsc::Receiver<ChangeEvent>,
        errors_tx: mpsc::Sender<PipelineError>,
        errors_rx: mpsc::Receiver<PipelineError>,
    ) -> Self {
        let count = count.max(1);
        let faults = Arc::new(AtomicU32::new(0));
        let (shutdown_tx, shutdown_rx) = mpsc::channel(count);

        let events = SharedReceiver::new(events);
        let errors = SharedReceiver::new(errors_rx);
        let shutdown = SharedReceiver::new(shutdown_rx);

        let handles = (0..count)
            .map(|id| {
                let worker = Worker::new(
                    id,
                    Arc::clone(&registry),
                    Arc::clone(&sink),
                    Arc::clone(&checkpoints),
                    settings.clone(),
                );
                tokio::spawn(worker.run(
                    events.clone(),
                    errors_tx.clone(),
                    errors.clone(),
                    shutdown.clone(),
                    Arc::clone(&faults),
                ))
            })
            .collect();

        info!(workers = count, "writer pool started");
        Self {
            handles,
            shutdown_tx,
            faults,
        }
    }

    /// Faults observed so far (flush, checkpoint, projection, upstream).
    #[must_use]
    pub fn fault_count(&self) -> u32 {
        self.faults.load(Ordering::Relaxed)
    }

    /// Sends one shutdown signal per worker, waits for every worker to
    /// drain and exit, and returns the final fault count.
    pub async fn shutdown(self) -> u32 {
        for _ in 0..self.handles.len() {
            let _ = self.shutdown_tx.send(()).await;
        }
        for handle in self.handles {
            let _ = handle.await;
        }
        info!(faults = self.faults.load(Ordering::Relaxed), "writer pool stopped");
        self.faults.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn shared_receiver_delivers_each_message_once() {
        let (tx, rx) = mpsc::channel(8);
        let shared = SharedReceiver::new(rx);

        for i in 0..6 {
            tx.send(i).await.unwrap();
        }
        drop(tx);

        let a = shared.clone();
        let b = shared.clone();
        let (ra, rb) = tokio::join!(
            async {
                let mut got = Vec::new();
                while let Some(v) = a.recv().await {
                    got.push(v);
                }
                got
            },
            async {
                let mut got = Vec::new();
                while let Some(v) = b.recv().await {
                    got.push(v);
                }
                got
            }
        );

        let mut all: Vec<i32> = ra.into_iter().chain(rb).collect();
        all.sort_unstable();
        assert_eq!(all, vec![0, 1, 2, 3, 4, 5]);
    }
}
