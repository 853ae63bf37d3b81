//! The sink client contract.

use async_trait::async_trait;

use crate::error::SinkError;
use crate::point::{Batch, Precision};

/// A thread-safe client for the metrics store. One instance is shared by
/// every writer worker; implementations wrap their own connection pooling.
#[async_trait]
pub trait SinkClient: Send + Sync + 'static {
    /// Writes one batch. The batch carries its target database, retention
    /// policy, and precision.
    ///
    /// # Errors
    ///
    /// [`SinkError::Write`] on any transport or server failure; the caller
    /// retains the batch for retry.
    async fn write(&self, batch: &Batch) -> Result<(), SinkError>;

    /// Executes a statement (database creation) against `database`, with an
    /// optional result-timestamp precision.
    ///
    /// # Errors
    ///
    /// [`SinkError::Query`] on any transport or server failure.
    async fn query(
        &self,
        statement: &str,
        database: &str,
        precision: Option<Precision>,
    ) -> Result<(), SinkError>;

    /// Releases any underlying resources. The default does nothing.
    async fn close(&self) {}
}
