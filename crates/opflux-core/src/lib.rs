//! # opflux core
//!
//! The streaming ingest engine behind opflux: consumes an ordered stream of
//! change events from a replication log, projects selected document fields
//! through per-namespace measurement specs into time-series points, batches
//! them per target database, and flushes through a shared sink client while
//! persisting a resume checkpoint that reflects only successfully flushed
//! work.
//!
//! The upstream log reader and the concrete sink/checkpoint backends live in
//! sibling crates; this crate defines the traits they implement
//! ([`SinkClient`], [`CheckpointStore`]) and everything in between.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod batch;
pub mod checkpoint;
pub mod error;
pub mod event;
pub mod filter;
pub mod pipeline;
pub mod point;
pub mod project;
pub mod schema;
pub mod sink;
pub mod value;
pub mod worker;

pub use checkpoint::CheckpointStore;
pub use event::{ChangeEvent, Namespace, OpKind, ReplTimestamp};
pub use filter::FilterChain;
pub use point::{Batch, FieldValue, Point, Precision};
pub use schema::{Measurement, MeasurementRegistry};
pub use sink::SinkClient;
pub use value::Value;

/// Database reserved for the pipeline's own bookkeeping.
///
/// The checkpoint collection lives here, and the filter chain excludes the
/// whole database from capture so the pipeline never observes its own
/// writes.
pub const RESERVED_DATABASE: &str = "opflux";
