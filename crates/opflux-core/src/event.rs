//! Change events and replication timestamps.

use std::fmt;

use chrono::{DateTime, Utc};

use crate::value::ValueMap;

/// A 64-bit replication timestamp: UNIX seconds in the high 32 bits, an
/// intra-second ordinal in the low 32 bits. Totally ordered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ReplTimestamp(u64);

impl ReplTimestamp {
    /// The zero timestamp, used as "no position" / "start of log".
    pub const ZERO: Self = Self(0);

    /// Builds a timestamp from wall-clock seconds and an ordinal.
    #[must_use]
    pub const fn new(seconds: u32, ordinal: u32) -> Self {
        Self(((seconds as u64) << 32) | (ordinal as u64))
    }

    /// Reinterprets a raw 64-bit value.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw 64-bit encoding.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// UNIX seconds from the high 32 bits.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn seconds(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Intra-second ordinal from the low 32 bits.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn ordinal(self) -> u32 {
        self.0 as u32
    }

    /// True for the zero timestamp.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The wall-clock time carried in the high 32 bits, in UTC. The ordinal
    /// does not contribute.
    #[must_use]
    pub fn to_datetime(self) -> DateTime<Utc> {
        DateTime::from_timestamp(i64::from(self.seconds()), 0)
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl fmt::Display for ReplTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds(), self.ordinal())
    }
}

/// The kind of operation a change event carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// A document insert.
    Insert,
    /// A document update.
    Update,
    /// A document delete.
    Delete,
    /// A database command.
    Command,
    /// Anything else found in the log.
    Unknown,
}

impl OpKind {
    /// True for inserts and updates, the only kinds that project to points.
    #[must_use]
    pub fn is_insert_or_update(self) -> bool {
        matches!(self, OpKind::Insert | OpKind::Update)
    }
}

/// A `database.collection` pair identifying the source of an event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    /// Source database name.
    pub database: String,
    /// Source collection name.
    pub collection: String,
}

impl Namespace {
    /// Builds a namespace from its parts.
    #[must_use]
    pub fn new(database: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            collection: collection.into(),
        }
    }

    /// Parses a `database.collection` string. The collection part may itself
    /// contain dots (`db.system.profile`).
    #[must_use]
    pub fn parse(qualified: &str) -> Option<Self> {
        let (database, collection) = qualified.split_once('.')?;
        if database.is_empty() || collection.is_empty() {
            return None;
        }
        Some(Self::new(database, collection))
    }

    /// The `database.collection` form used to key measurement specs and
    /// open batches.
    #[must_use]
    pub fn qualified(&self) -> String {
        format!("{}.{}", self.database, self.collection)
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.collection)
    }
}

/// One operation read from the replication log.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    /// Where the operation happened.
    pub ns: Namespace,
    /// What kind of operation it was.
    pub op: OpKind,
    /// Position of the operation in the replication log.
    pub timestamp: ReplTimestamp,
    /// The document state carried by the operation. Empty for deletes and
    /// commands.
    pub data: ValueMap,
}

impl ChangeEvent {
    /// Builds an event with empty data.
    #[must_use]
    pub fn new(ns: Namespace, op: OpKind, timestamp: ReplTimestamp) -> Self {
        Self {
            ns,
            op,
            timestamp,
            data: ValueMap::new(),
        }
    }

    /// Attaches document data.
    #[must_use]
    pub fn with_data(mut self, data: ValueMap) -> Self {
        self.data = data;
        self
    }
}
