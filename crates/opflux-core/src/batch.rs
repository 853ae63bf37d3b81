//! Per-worker accumulation of points into open batches.
//!
//! Each writer worker owns one [`Batcher`]: a map from namespace to the
//! batch currently open for it. Keying on namespace guarantees every point
//! in a batch shares target database, retention policy, and precision.
//! Batches iterate in namespace order, which makes the flush order
//! deterministic.

use std::collections::BTreeMap;

use crate::event::ReplTimestamp;
use crate::point::{Batch, Point};
use crate::schema::Measurement;

/// Open batches for one writer worker.
#[derive(Debug)]
pub struct Batcher {
    /// Flush as soon as any single batch reaches this many points.
    threshold: usize,
    open: BTreeMap<String, Batch>,
    last_ts: ReplTimestamp,
}

impl Batcher {
    /// An empty batcher flushing batches at `threshold` points.
    #[must_use]
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold: threshold.max(1),
            open: BTreeMap::new(),
            last_ts: ReplTimestamp::ZERO,
        }
    }

    /// Adds a point to the namespace's open batch, creating the batch from
    /// the spec's retention policy and precision on first use. Advances the
    /// tracked replication timestamp when `ts` is strictly newer.
    ///
    /// Returns true when the batch reached the flush threshold.
    pub fn add(
        &mut self,
        spec: &Measurement,
        database: &str,
        ts: ReplTimestamp,
        point: Point,
    ) -> bool {
        let batch = self
            .open
            .entry(spec.namespace.clone())
            .or_insert_with(|| {
                Batch::new(database, spec.retention_policy.clone(), spec.precision)
            });
        batch.add(point);
        if ts > self.last_ts {
            self.last_ts = ts;
        }
        batch.len() >= self.threshold
    }

    /// Namespaces with an open batch, in flush order.
    #[must_use]
    pub fn namespaces(&self) -> Vec<String> {
        self.open.keys().cloned().collect()
    }

    /// The open batch for a namespace.
    #[must_use]
    pub fn get(&self, namespace: &str) -> Option<&Batch> {
        self.open.get(namespace)
    }

    /// Removes a namespace's batch after it was written.
    pub fn remove(&mut self, namespace: &str) -> Option<Batch> {
        self.open.remove(namespace)
    }

    /// Target databases of all open batches, deduplicated, in order.
    #[must_use]
    pub fn databases(&self) -> Vec<String> {
        let mut dbs: Vec<String> = self.open.values().map(|b| b.database.clone()).collect();
        dbs.sort();
        dbs.dedup();
        dbs
    }

    /// True when no batches are open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.open.is_empty()
    }

    /// Total buffered points across all open batches.
    #[must_use]
    pub fn point_count(&self) -> usize {
        self.open.values().map(Batch::len).sum()
    }

    /// Replication timestamp of the newest point contributed to a
    /// not-yet-flushed batch; zero after [`clear_last_ts`](Self::clear_last_ts).
    #[must_use]
    pub fn last_ts(&self) -> ReplTimestamp {
        self.last_ts
    }

    /// Clears the tracked timestamp once it has been checkpointed.
    pub fn clear_last_ts(&mut self) {
        self.last_ts = ReplTimestamp::ZERO;
    }
}
