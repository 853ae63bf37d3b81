//! The checkpoint store contract.

use async_trait::async_trait;

use crate::error::CheckpointError;
use crate::event::ReplTimestamp;

/// Persistent storage for resume positions, keyed by resume name.
///
/// Exclusively written by the pipeline, read once at startup. Writes must
/// be atomic upserts; concurrent writers race with last-writer-wins, which
/// is acceptable under the pipeline's at-least-once semantics.
#[async_trait]
pub trait CheckpointStore: Send + Sync + 'static {
    /// Reads the stored position for `resume_name`, if any.
    ///
    /// # Errors
    ///
    /// [`CheckpointError`] when the store is unreachable.
    async fn load(&self, resume_name: &str) -> Result<Option<ReplTimestamp>, CheckpointError>;

    /// Upserts `{id: resume_name, ts}`.
    ///
    /// # Errors
    ///
    /// [`CheckpointError`] when the write fails; the caller keeps the
    /// timestamp and retries after the next flush.
    async fn save(&self, resume_name: &str, ts: ReplTimestamp) -> Result<(), CheckpointError>;
}
