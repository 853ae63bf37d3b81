//! MongoDB collaborators for opflux.
//!
//! [`session`] dials the server (including the `ssl=true` connection-string
//! quirk), [`oplog`] tails the replication log and performs initial direct
//! reads, [`resume`] persists checkpoints in the pipeline's reserved
//! database, and [`convert`] maps BSON into the core value space.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod convert;
pub mod oplog;
pub mod resume;
pub mod session;

pub use oplog::{OplogReader, ReaderOptions};
pub use resume::MongoCheckpointStore;
pub use session::{dial, DialSettings};
