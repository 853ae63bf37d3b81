//! The tailing-log reader: oplog cursor, ordered update resolution, and
//! initial direct reads.
//!
//! One tail task opens a tailable-await cursor over the oplog and routes
//! accepted entries to a small pool of resolver lanes by document-id hash,
//! so events for any one document stay in log order while different
//! documents resolve in parallel. Resolvers buffer briefly and batch-fetch
//! the current documents behind buffered updates with a single `$in` query
//! per namespace, then emit change events in buffered order.
//!
//! Direct reads scan configured namespaces once at startup, synthesizing
//! insert events stamped with the scan-time position; a watch channel
//! flips to `true` when every scan has finished.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::StreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::CursorType;
use mongodb::{Client, Collection};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use opflux_core::error::PipelineError;
use opflux_core::event::{ChangeEvent, Namespace, OpKind, ReplTimestamp};
use opflux_core::filter::FilterChain;
use opflux_core::pipeline::SharedReceiver;

use crate::convert::{document_values, repl_from_bson, repl_to_bson};

/// Database holding the oplog unless overridden.
pub const DEFAULT_OPLOG_DATABASE: &str = "local";

/// Collection holding the oplog unless overridden.
pub const DEFAULT_OPLOG_COLLECTION: &str = "oplog.rs";

/// Delay before reopening a dead tail cursor.
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Options for [`OplogReader::start`].
pub struct ReaderOptions {
    /// Tail entries strictly after this position.
    pub start: ReplTimestamp,
    /// Predicate chain applied before events are enqueued.
    pub filter: Arc<FilterChain>,
    /// Override for the oplog database name.
    pub oplog_database: Option<String>,
    /// Override for the oplog collection name.
    pub oplog_collection: Option<String>,
    /// Tail cursor await timeout.
    pub cursor_timeout: Option<Duration>,
    /// Capacity of the outgoing event channel.
    pub channel_size: usize,
    /// Number of resolver lanes; events for one document always share a
    /// lane.
    pub worker_count: usize,
    /// Resolver buffer length that forces a resolution pass.
    pub buffer_size: usize,
    /// Resolver buffer age that forces a resolution pass.
    pub buffer_duration: Duration,
    /// Namespaces to bulk-scan at startup.
    pub direct_read_namespaces: Vec<String>,
    /// Page size for direct-read cursors.
    pub direct_read_limit: u32,
    /// Concurrent document forwarders per scanned collection.
    pub direct_readers_per_collection: usize,
}

impl ReaderOptions {
    /// Options with the stock sizing: channel 512, four resolver lanes,
    /// buffers of 32 ops or 750 ms, direct-read pages of 1000.
    #[must_use]
    pub fn new(start: ReplTimestamp, filter: Arc<FilterChain>) -> Self {
        Self {
            start,
            filter,
            oplog_database: None,
            oplog_collection: None,
            cursor_timeout: None,
            channel_size: 512,
            worker_count: 4,
            buffer_size: 32,
            buffer_duration: Duration::from_millis(750),
            direct_read_namespaces: Vec::new(),
            direct_read_limit: 1000,
            direct_readers_per_collection: 1,
        }
    }
}

/// A running reader: the tail task, its resolver lanes, and any direct-read
/// scans.
pub struct OplogReader {
    direct_done: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl OplogReader {
    /// Spawns the reader. Returns the handle and the event channel the
    /// writer pool consumes. Reader failures flow into `errors`; the
    /// `shutdown` token stops every task cooperatively.
    #[must_use]
    pub fn start(
        client: Client,
        options: ReaderOptions,
        errors: mpsc::Sender<PipelineError>,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::Receiver<ChangeEvent>) {
        let (events_tx, events_rx) = mpsc::channel(options.channel_size.max(1));
        let mut tasks = Vec::new();

        let lanes = options.worker_count.max(1);
        let mut routes = Vec::with_capacity(lanes);
        for _ in 0..lanes {
            let (lane_tx, lane_rx) = mpsc::channel(options.channel_size.max(1));
            routes.push(lane_tx);
            tasks.push(tokio::spawn(run_resolver(
                client.clone(),
                lane_rx,
                events_tx.clone(),
                errors.clone(),
                options.buffer_size.max(1),
                options.buffer_duration,
                shutdown.clone(),
            )));
        }

        tasks.push(tokio::spawn(run_tail(
            client.clone(),
            TailTarget {
                database: options
                    .oplog_database
                    .unwrap_or_else(|| DEFAULT_OPLOG_DATABASE.to_string()),
                collection: options
                    .oplog_collection
                    .unwrap_or_else(|| DEFAULT_OPLOG_COLLECTION.to_string()),
                cursor_timeout: options.cursor_timeout,
                start: options.start,
            },
            Arc::clone(&options.filter),
            routes,
            errors.clone(),
            shutdown.clone(),
        )));

        let (done_tx, done_rx) = watch::channel(false);
        let mut scans = Vec::new();
        for qualified in &options.direct_read_namespaces {
            let Some(ns) = Namespace::parse(qualified) else {
                warn!(namespace = %qualified, "skipping malformed direct-read namespace");
                continue;
            };
            scans.push(tokio::spawn(run_direct_read(
                client.clone(),
                ns,
                Arc::clone(&options.filter),
                events_tx.clone(),
                errors.clone(),
                options.direct_read_limit.max(1),
                options.direct_readers_per_collection.max(1),
                shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(async move {
            for scan in scans {
                let _ = scan.await;
            }
            let _ = done_tx.send(true);
        }));

        (
            Self {
                direct_done: done_rx,
                tasks,
            },
            events_rx,
        )
    }

    /// A watch flipping to `true` once every direct-read scan has finished
    /// (immediately when none were configured).
    #[must_use]
    pub fn direct_reads_done(&self) -> watch::Receiver<bool> {
        self.direct_done.clone()
    }

    /// Waits for every reader task to exit. Call after cancelling the
    /// shutdown token handed to [`start`](Self::start).
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Where and from when to tail.
struct TailTarget {
    database: String,
    collection: String,
    cursor_timeout: Option<Duration>,
    start: ReplTimestamp,
}

/// An accepted oplog entry, before update resolution.
#[derive(Debug)]
enum RawOp {
    Insert {
        ns: Namespace,
        ts: ReplTimestamp,
        doc: Document,
    },
    Update {
        ns: Namespace,
        ts: ReplTimestamp,
        id: Bson,
    },
}

/// A decoded oplog entry of any kind.
struct ParsedEntry {
    ns: Namespace,
    kind: OpKind,
    ts: ReplTimestamp,
    body: Option<Document>,
    update_id: Option<Bson>,
}

/// Decodes one oplog entry. Returns `None` for entries the pipeline can
/// never use: malformed documents, updates without an id, and chunk
/// migration echoes (`fromMigrate`).
fn parse_entry(entry: &Document) -> Option<ParsedEntry> {
    if entry.contains_key("fromMigrate") {
        return None;
    }
    let ts = repl_from_bson(entry.get_timestamp("ts").ok()?);
    let ns = Namespace::parse(entry.get_str("ns").ok()?)?;
    let kind = match entry.get_str("op").ok()? {
        "i" => OpKind::Insert,
        "u" => OpKind::Update,
        "d" => OpKind::Delete,
        "c" => OpKind::Command,
        _ => OpKind::Unknown,
    };
    let mut body = None;
    let mut update_id = None;
    match kind {
        OpKind::Insert => {
            body = Some(entry.get_document("o").ok()?.clone());
        }
        OpKind::Update => {
            update_id = Some(entry.get_document("o2").ok()?.get("_id")?.clone());
        }
        _ => {}
    }
    Some(ParsedEntry {
        ns,
        kind,
        ts,
        body,
        update_id,
    })
}

/// A stable key for a document id; used for lane routing and to match
/// batch-fetched documents back to their updates.
fn id_key(id: &Bson) -> String {
    format!("{id:?}")
}

fn lane_for(id: &Bson, lanes: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id_key(id).hash(&mut hasher);
    #[allow(clippy::cast_possible_truncation)]
    {
        (hasher.finish() as usize) % lanes
    }
}

/// The current wall-clock position, used to stamp direct-read events.
fn wall_clock_timestamp() -> ReplTimestamp {
    let seconds = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    ReplTimestamp::new(u32::try_from(seconds).unwrap_or(u32::MAX), 0)
}

async fn run_tail(
    client: Client,
    target: TailTarget,
    filter: Arc<FilterChain>,
    routes: Vec<mpsc::Sender<RawOp>>,
    errors: mpsc::Sender<PipelineError>,
    shutdown: CancellationToken,
) {
    let collection: Collection<Document> = client
        .database(&target.database)
        .collection(&target.collection);
    let mut position = target.start;

    'outer: while !shutdown.is_cancelled() {
        let find = collection
            .find(doc! {"ts": {"$gt": Bson::Timestamp(repl_to_bson(position))}})
            .cursor_type(CursorType::TailableAwait)
            .no_cursor_timeout(true);
        let find = match target.cursor_timeout {
            Some(timeout) => find.max_await_time(timeout),
            None => find,
        };

        // Opening is bounded by the session's server-selection timeout, so
        // shutdown responsiveness only degrades briefly here.
        let mut cursor = match find.await {
            Ok(cursor) => cursor,
            Err(e) => {
                let _ = errors
                    .send(PipelineError::Upstream(format!("opening tail cursor: {e}")))
                    .await;
                if pause(&shutdown).await {
                    continue;
                }
                break;
            }
        };
        info!(position = %position, oplog = %target.collection, "tailing replication log");

        loop {
            let entry = tokio::select! {
                () = shutdown.cancelled() => break 'outer,
                entry = cursor.next() => entry,
            };
            match entry {
                Some(Ok(doc)) => {
                    let Some(parsed) = parse_entry(&doc) else {
                        continue;
                    };
                    if parsed.ts > position {
                        position = parsed.ts;
                    }
                    if !dispatch(parsed, &filter, &routes).await {
                        break 'outer;
                    }
                }
                Some(Err(e)) => {
                    let _ = errors
                        .send(PipelineError::Upstream(format!("tail cursor: {e}")))
                        .await;
                    break;
                }
                None => break,
            }
        }
        if !pause(&shutdown).await {
            break;
        }
    }
    debug!("tail task stopped");
}

/// Sleeps before a cursor reopen; false when shutdown arrived instead.
async fn pause(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(RETRY_DELAY) => true,
    }
}

/// Filters one entry and routes it to its resolver lane. False when the
/// lanes are gone and tailing should stop.
async fn dispatch(
    parsed: ParsedEntry,
    filter: &FilterChain,
    routes: &[mpsc::Sender<RawOp>],
) -> bool {
    let probe = ChangeEvent::new(parsed.ns.clone(), parsed.kind, parsed.ts);
    if !filter.accepts(&probe) {
        return true;
    }
    let raw = match parsed.kind {
        OpKind::Insert => match parsed.body {
            Some(doc) => RawOp::Insert {
                ns: parsed.ns,
                ts: parsed.ts,
                doc,
            },
            None => return true,
        },
        OpKind::Update => match parsed.update_id {
            Some(id) => RawOp::Update {
                ns: parsed.ns,
                ts: parsed.ts,
                id,
            },
            None => return true,
        },
        _ => return true,
    };
    let lane = match &raw {
        RawOp::Insert { doc, .. } => doc
            .get("_id")
            .map_or(0, |id| lane_for(id, routes.len())),
        RawOp::Update { id, .. } => lane_for(id, routes.len()),
    };
    routes[lane].send(raw).await.is_ok()
}

async fn run_resolver(
    client: Client,
    mut ops: mpsc::Receiver<RawOp>,
    events: mpsc::Sender<ChangeEvent>,
    errors: mpsc::Sender<PipelineError>,
    buffer_size: usize,
    buffer_duration: Duration,
    shutdown: CancellationToken,
) {
    let mut pending: Vec<RawOp> = Vec::with_capacity(buffer_size);
    let mut ticker = tokio::time::interval(buffer_duration);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    ticker.tick().await;

    loop {
        tokio::select! {
            () = shutdown.cancelled() => {
                resolve_pending(&client, &mut pending, &events, &errors).await;
                break;
            }
            _ = ticker.tick() => {
                if !resolve_pending(&client, &mut pending, &events, &errors).await {
                    break;
                }
            }
            op = ops.recv() => match op {
                Some(op) => {
                    pending.push(op);
                    if pending.len() >= buffer_size
                        && !resolve_pending(&client, &mut pending, &events, &errors).await
                    {
                        break;
                    }
                }
                None => {
                    resolve_pending(&client, &mut pending, &events, &errors).await;
                    break;
                }
            },
        }
    }
    debug!("resolver lane stopped");
}

/// Resolves and emits the buffered ops in order. Updates are looked up with
/// one `$in` query per namespace; a document deleted before resolution
/// drops its event. False when the event channel is gone.
async fn resolve_pending(
    client: &Client,
    pending: &mut Vec<RawOp>,
    events: &mpsc::Sender<ChangeEvent>,
    errors: &mpsc::Sender<PipelineError>,
) -> bool {
    if pending.is_empty() {
        return true;
    }

    let mut wanted: HashMap<String, (Namespace, Vec<Bson>)> = HashMap::new();
    for op in pending.iter() {
        if let RawOp::Update { ns, id, .. } = op {
            wanted
                .entry(ns.qualified())
                .or_insert_with(|| (ns.clone(), Vec::new()))
                .1
                .push(id.clone());
        }
    }

    let mut fetched: HashMap<(String, String), Document> = HashMap::new();
    for (qualified, (ns, ids)) in wanted {
        let collection: Collection<Document> = client
            .database(&ns.database)
            .collection(&ns.collection);
        match collection.find(doc! {"_id": {"$in": ids}}).await {
            Ok(mut cursor) => {
                while let Some(item) = cursor.next().await {
                    match item {
                        Ok(doc) => {
                            if let Some(id) = doc.get("_id") {
                                let key = (qualified.clone(), id_key(id));
                                fetched.insert(key, doc.clone());
                            }
                        }
                        Err(e) => {
                            let _ = errors
                                .send(PipelineError::Upstream(format!(
                                    "resolving updates in {qualified}: {e}"
                                )))
                                .await;
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                let _ = errors
                    .send(PipelineError::Upstream(format!(
                        "resolving updates in {qualified}: {e}"
                    )))
                    .await;
            }
        }
    }

    for op in pending.drain(..) {
        let event = match op {
            RawOp::Insert { ns, ts, doc } => {
                ChangeEvent::new(ns, OpKind::Insert, ts).with_data(document_values(&doc))
            }
            RawOp::Update { ns, ts, id } => {
                let key = (ns.qualified(), id_key(&id));
                match fetched.get(&key) {
                    Some(doc) => ChangeEvent::new(ns, OpKind::Update, ts)
                        .with_data(document_values(doc)),
                    None => {
                        debug!(namespace = %ns, "document gone before resolution, dropping update");
                        continue;
                    }
                }
            }
        };
        if events.send(event).await.is_err() {
            return false;
        }
    }
    true
}

#[allow(clippy::too_many_arguments)]
async fn run_direct_read(
    client: Client,
    ns: Namespace,
    filter: Arc<FilterChain>,
    events: mpsc::Sender<ChangeEvent>,
    errors: mpsc::Sender<PipelineError>,
    page_size: u32,
    readers: usize,
    shutdown: CancellationToken,
) {
    let scan_ts = wall_clock_timestamp();
    // The chain's predicates only look at namespace and kind, so one probe
    // decides the whole scan.
    let probe = ChangeEvent::new(ns.clone(), OpKind::Insert, scan_ts);
    if !filter.accepts(&probe) {
        debug!(namespace = %ns, "direct read excluded by filter");
        return;
    }

    let (docs_tx, docs_rx) = mpsc::channel::<Document>(usize::try_from(page_size).unwrap_or(1024));
    let docs = SharedReceiver::new(docs_rx);
    let mut forwarders = Vec::with_capacity(readers);
    for _ in 0..readers {
        let docs = docs.clone();
        let events = events.clone();
        let ns = ns.clone();
        forwarders.push(tokio::spawn(async move {
            while let Some(doc) = docs.recv().await {
                let event = ChangeEvent::new(ns.clone(), OpKind::Insert, scan_ts)
                    .with_data(document_values(&doc));
                if events.send(event).await.is_err() {
                    break;
                }
            }
        }));
    }

    let collection: Collection<Document> = client
        .database(&ns.database)
        .collection(&ns.collection);
    match collection.find(doc! {}).batch_size(page_size).await {
        Ok(mut cursor) => {
            let mut count = 0u64;
            loop {
                let item = tokio::select! {
                    () = shutdown.cancelled() => break,
                    item = cursor.next() => item,
                };
                match item {
                    Some(Ok(doc)) => {
                        count += 1;
                        if docs_tx.send(doc).await.is_err() {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        let _ = errors
                            .send(PipelineError::Upstream(format!("direct read of {ns}: {e}")))
                            .await;
                        break;
                    }
                    None => break,
                }
            }
            info!(namespace = %ns, documents = count, "direct read complete");
        }
        Err(e) => {
            let _ = errors
                .send(PipelineError::Upstream(format!("direct read of {ns}: {e}")))
                .await;
        }
    }

    drop(docs_tx);
    for forwarder in forwarders {
        let _ = forwarder.await;
    }
}

/// The newest position in the oplog, used as the start when neither replay
/// nor resume apply.
///
/// # Errors
///
/// Any driver error from the lookup.
pub async fn latest_timestamp(
    client: &Client,
    oplog_database: Option<&str>,
    oplog_collection: Option<&str>,
) -> Result<ReplTimestamp, mongodb::error::Error> {
    let collection: Collection<Document> = client
        .database(oplog_database.unwrap_or(DEFAULT_OPLOG_DATABASE))
        .collection(oplog_collection.unwrap_or(DEFAULT_OPLOG_COLLECTION));
    let newest = collection
        .find_one(doc! {})
        .sort(doc! {"$natural": -1})
        .await?;
    Ok(newest
        .and_then(|entry| entry.get_timestamp("ts").ok())
        .map(repl_from_bson)
        .unwrap_or(ReplTimestamp::ZERO))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::Timestamp;

    fn oplog_doc(op: &str, ns: &str) -> Document {
        doc! {
            "ts": Bson::Timestamp(Timestamp { time: 100, increment: 2 }),
            "op": op,
            "ns": ns,
            "o": { "_id": "doc-1", "temp": 21.5 },
            "o2": { "_id": "doc-1" },
        }
    }

    #[test]
    fn parse_insert_carries_the_document() {
        let parsed = parse_entry(&oplog_doc("i", "weather.city")).unwrap();
        assert_eq!(parsed.kind, OpKind::Insert);
        assert_eq!(parsed.ns.qualified(), "weather.city");
        assert_eq!(parsed.ts, ReplTimestamp::new(100, 2));
        let body = parsed.body.unwrap();
        assert_eq!(body.get_str("_id").unwrap(), "doc-1");
        assert!(parsed.update_id.is_none());
    }

    #[test]
    fn parse_update_carries_only_the_id() {
        let parsed = parse_entry(&oplog_doc("u", "weather.city")).unwrap();
        assert_eq!(parsed.kind, OpKind::Update);
        assert!(parsed.body.is_none());
        assert_eq!(parsed.update_id, Some(Bson::String("doc-1".into())));
    }

    #[test]
    fn parse_update_without_selector_is_skipped() {
        let mut entry = oplog_doc("u", "weather.city");
        entry.remove("o2");
        assert!(parse_entry(&entry).is_none());
    }

    #[test]
    fn parse_other_kinds() {
        assert_eq!(
            parse_entry(&oplog_doc("d", "weather.city")).unwrap().kind,
            OpKind::Delete
        );
        assert_eq!(
            parse_entry(&oplog_doc("c", "weather.$cmd")).unwrap().kind,
            OpKind::Command
        );
        assert_eq!(
            parse_entry(&oplog_doc("n", "weather.city")).unwrap().kind,
            OpKind::Unknown
        );
    }

    #[test]
    fn parse_skips_migration_echoes() {
        let mut entry = oplog_doc("i", "weather.city");
        entry.insert("fromMigrate", true);
        assert!(parse_entry(&entry).is_none());
    }

    #[test]
    fn parse_rejects_malformed_entries() {
        let mut entry = oplog_doc("i", "weather.city");
        entry.remove("ts");
        assert!(parse_entry(&entry).is_none());

        let mut entry = oplog_doc("i", "weather.city");
        entry.insert("ns", "nodot");
        assert!(parse_entry(&entry).is_none());
    }

    #[test]
    fn lane_routing_is_stable_and_in_range() {
        let id = Bson::String("doc-1".into());
        let lane = lane_for(&id, 4);
        assert!(lane < 4);
        assert_eq!(lane, lane_for(&id, 4));
        // Distinct Bson types with the same rendering stay distinct.
        assert_ne!(id_key(&Bson::String("5".into())), id_key(&Bson::Int64(5)));
    }

    #[test]
    fn reader_options_defaults_match_stock_sizing() {
        let filter = Arc::new(FilterChain::standard(opflux_core::RESERVED_DATABASE));
        let options = ReaderOptions::new(ReplTimestamp::ZERO, filter);
        assert_eq!(options.channel_size, 512);
        assert_eq!(options.worker_count, 4);
        assert_eq!(options.buffer_size, 32);
        assert_eq!(options.buffer_duration, Duration::from_millis(750));
        assert_eq!(options.direct_read_limit, 1000);
        assert_eq!(options.direct_readers_per_collection, 1);
    }

    #[test]
    fn wall_clock_position_is_current() {
        let ts = wall_clock_timestamp();
        assert!(ts.seconds() > 1_600_000_000);
        assert_eq!(ts.ordinal(), 0);
    }
}
