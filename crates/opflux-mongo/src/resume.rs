//! Checkpoint persistence in the reserved database.
//!
//! One document per resume name in `opflux.resume`:
//! `{_id: <resume-name>, ts: <replication timestamp>}`. Writes are atomic
//! upserts; with `resume-write-unsafe` the collection handle uses an
//! unacknowledged write concern, trading error checking for speed. That
//! setting scopes to this collection only.

use async_trait::async_trait;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{Acknowledgment, CollectionOptions, WriteConcern};
use mongodb::{Client, Collection};

use opflux_core::checkpoint::CheckpointStore;
use opflux_core::error::CheckpointError;
use opflux_core::event::ReplTimestamp;
use opflux_core::RESERVED_DATABASE;

use crate::convert::{repl_from_bson, repl_to_bson};

/// Collection holding resume documents inside the reserved database.
pub const RESUME_COLLECTION: &str = "resume";

/// Checkpoint store backed by the shared source session.
#[derive(Debug, Clone)]
pub struct MongoCheckpointStore {
    collection: Collection<Document>,
}

impl MongoCheckpointStore {
    /// Binds to `opflux.resume` on the shared session.
    #[must_use]
    pub fn new(client: &Client, write_unsafe: bool) -> Self {
        let database = client.database(RESERVED_DATABASE);
        let collection = if write_unsafe {
            let mut write_concern = WriteConcern::default();
            write_concern.w = Some(Acknowledgment::Nodes(0));
            let mut options = CollectionOptions::default();
            options.write_concern = Some(write_concern);
            database.collection_with_options(RESUME_COLLECTION, options)
        } else {
            database.collection(RESUME_COLLECTION)
        };
        Self { collection }
    }
}

#[async_trait]
impl CheckpointStore for MongoCheckpointStore {
    async fn load(&self, resume_name: &str) -> Result<Option<ReplTimestamp>, CheckpointError> {
        let found = self
            .collection
            .find_one(doc! {"_id": resume_name})
            .await
            .map_err(|e| CheckpointError(e.to_string()))?;
        Ok(found
            .and_then(|doc| doc.get_timestamp("ts").ok())
            .map(repl_from_bson))
    }

    async fn save(&self, resume_name: &str, ts: ReplTimestamp) -> Result<(), CheckpointError> {
        self.collection
            .update_one(
                doc! {"_id": resume_name},
                doc! {"$set": {"ts": Bson::Timestamp(repl_to_bson(ts))}},
            )
            .upsert(true)
            .await
            .map_err(|e| CheckpointError(e.to_string()))?;
        Ok(())
    }
}
