//! Error types for the ingest engine.
//!
//! Only [`ConfigError`] is fatal, and only at startup. Everything else is
//! reported, counted toward the process exit status, and survived: one bad
//! event cannot stop the stream.

use thiserror::Error;

/// Fatal startup validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No measurements were configured.
    #[error("at least one measurement is required")]
    NoMeasurements,

    /// A measurement has an empty field set.
    #[error("measurement for {namespace} requires at least one field")]
    EmptyFields {
        /// The offending measurement's namespace.
        namespace: String,
    },

    /// Two measurements share a namespace.
    #[error("duplicate measurement namespace {namespace}")]
    DuplicateNamespace {
        /// The namespace configured twice.
        namespace: String,
    },
}

/// A change event could not be turned into a point. The event is dropped;
/// the pipeline continues.
#[derive(Debug, Error)]
pub enum ProjectionError {
    /// The configured time field was absent or not a time type.
    #[error("time field {field} not found in document for {namespace}")]
    MissingTimeField {
        /// Namespace of the failing event.
        namespace: String,
        /// The configured time field.
        field: String,
    },

    /// A nested sub-document exceeded the flattening depth bound.
    #[error("document in {namespace} nests deeper than {limit} levels")]
    NestingTooDeep {
        /// Namespace of the failing event.
        namespace: String,
        /// The depth bound that was exceeded.
        limit: usize,
    },
}

/// A sink write or query failed. The affected batches are retained and
/// retried on the next flush tick.
#[derive(Debug, Error)]
pub enum SinkError {
    /// A batch write failed.
    #[error("sink write failed: {0}")]
    Write(String),

    /// A statement (database creation) failed.
    #[error("sink query failed: {0}")]
    Query(String),
}

/// The checkpoint store could not be read or written.
#[derive(Debug, Error)]
#[error("checkpoint store: {0}")]
pub struct CheckpointError(pub String);

/// Anything a worker or the upstream reader can report on the shared error
/// channel.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Per-event projection failure.
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    /// Per-flush sink failure.
    #[error(transparent)]
    Sink(#[from] SinkError),

    /// Checkpoint persistence failure; treated like a sink failure.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// Failure surfaced by the upstream tailing reader.
    #[error("upstream: {0}")]
    Upstream(String),
}
