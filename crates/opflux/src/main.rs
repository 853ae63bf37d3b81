//! opflux: tail a MongoDB replication log and project document fields into
//! InfluxDB as time-series points.
//!
//! Startup wires the collaborators around the core engine: resolve the
//! configuration, dial the source session, compute the start position,
//! build the filter chain and sink client, start the oplog reader, and
//! launch the writer pool. Interrupt/termination (or bulk-read completion
//! with `--exit-after-direct-reads`) cancels the stop token, which drains
//! in-flight batches before exit.
//!
//! Exit codes: 0 clean, 1 when any flush, checkpoint, projection, or
//! upstream error was reported during the run, 2 on startup failure.

mod cli;
mod config;

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use opflux_core::checkpoint::CheckpointStore;
use opflux_core::event::ReplTimestamp;
use opflux_core::pipeline::WriterPool;
use opflux_core::sink::SinkClient;
use opflux_core::worker::WorkerSettings;
use opflux_core::MeasurementRegistry;
use opflux_influx::{InfluxClient, InfluxSettings};
use opflux_mongo::oplog::latest_timestamp;
use opflux_mongo::session::DialSettings;
use opflux_mongo::{MongoCheckpointStore, OplogReader, ReaderOptions};

use crate::cli::Cli;
use crate::config::Config;

#[derive(Debug, thiserror::Error)]
enum StartupError {
    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Measurements(#[from] opflux_core::error::ConfigError),

    #[error("source database: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("sink client: {0}")]
    Influx(#[from] opflux_influx::client::ClientError),

    #[error(transparent)]
    Checkpoint(#[from] opflux_core::error::CheckpointError),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if cli.version {
        println!("{}", config::VERSION);
        return ExitCode::SUCCESS;
    }

    let config = match Config::load(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", config::NAME);
            return ExitCode::from(2);
        }
    };
    init_tracing(config.verbose);

    match run(config).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "startup failed");
            ExitCode::from(2)
        }
    }
}

fn init_tracing(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(config: Config) -> Result<ExitCode, StartupError> {
    let registry = Arc::new(MeasurementRegistry::new(config.measurements.clone())?);
    let filter = Arc::new(config.build_filter()?);

    let client = opflux_mongo::dial(&DialSettings {
        url: config.mongo_url.clone(),
        pem_file: config.mongo_pem_file.clone(),
        skip_verify: config.mongo_skip_verify,
        ssl: config.mongo_ssl,
        dial_timeout: config.mongo_dial_timeout,
        socket_timeout: config.mongo_socket_timeout,
        sync_timeout: config.mongo_sync_timeout,
    })
    .await?;

    let checkpoints = Arc::new(MongoCheckpointStore::new(
        &client,
        config.resume_write_unsafe,
    ));

    let start = resolve_start(&config, &client, checkpoints.as_ref()).await?;
    info!(
        start = %start,
        measurements = registry.len(),
        workers = config.influx_clients,
        "starting pipeline"
    );

    let sink = Arc::new(InfluxClient::connect(InfluxSettings {
        url: config.influx_url.clone(),
        username: config.influx_user.clone(),
        password: config.influx_password.clone(),
        skip_verify: config.influx_skip_verify,
        pem_file: config.influx_pem_file.clone(),
        user_agent: format!("{} v{}", config::NAME, config::VERSION),
        timeout: Duration::from_secs(30),
    })?);

    let (errors_tx, errors_rx) = mpsc::channel(config.channel_size);
    let stop = CancellationToken::new();

    let mut reader_options = ReaderOptions::new(start, Arc::clone(&filter));
    reader_options.oplog_database = config.mongo_oplog_database.clone();
    reader_options.oplog_collection = config.mongo_oplog_collection.clone();
    reader_options.cursor_timeout = config.mongo_cursor_timeout;
    reader_options.channel_size = config.channel_size;
    reader_options.buffer_size = config.tail_buffer_size;
    reader_options.buffer_duration = config.tail_buffer_duration;
    if config.direct_reads {
        reader_options.direct_read_namespaces = registry.namespaces();
    }

    let (reader, events_rx) = OplogReader::start(
        client.clone(),
        reader_options,
        errors_tx.clone(),
        stop.child_token(),
    );

    let sink_client: Arc<dyn SinkClient> = sink.clone();
    let checkpoint_store: Arc<dyn CheckpointStore> = checkpoints;
    let pool = WriterPool::spawn(
        config.influx_clients,
        registry,
        sink_client,
        checkpoint_store,
        WorkerSettings {
            flush_threshold: config.influx_buffer_size,
            flush_interval: Duration::from_secs(1),
            auto_create_databases: config.influx_auto_create_db,
            resume: config.resume,
            resume_name: config.resume_name.clone(),
        },
        events_rx,
        errors_tx.clone(),
        errors_rx,
    );

    {
        let stop = stop.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            stop.cancel();
        });
    }
    if config.direct_reads && config.exit_after_direct_reads {
        let mut done = reader.direct_reads_done();
        let stop = stop.clone();
        tokio::spawn(async move {
            if done.wait_for(|finished| *finished).await.is_ok() {
                info!("direct reads complete, stopping");
                stop.cancel();
            }
        });
    }

    stop.cancelled().await;
    info!("flushing in-flight points");
    reader.join().await;
    drop(errors_tx);
    let faults = pool.shutdown().await;
    sink.close().await;
    client.shutdown().await;

    Ok(if faults > 0 {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

/// The position to start tailing from: zero for a full replay, then an
/// explicit override, then the stored checkpoint (or zero when none is
/// stored yet), otherwise the current tail of the log.
async fn resolve_start(
    config: &Config,
    client: &mongodb::Client,
    checkpoints: &MongoCheckpointStore,
) -> Result<ReplTimestamp, StartupError> {
    if config.replay {
        return Ok(ReplTimestamp::ZERO);
    }
    if config.resume_from_timestamp != 0 {
        let raw = u64::try_from(config.resume_from_timestamp).unwrap_or(0);
        return Ok(ReplTimestamp::from_raw(raw));
    }
    if config.resume {
        let stored = checkpoints.load(&config.resume_name).await?;
        return Ok(stored.unwrap_or(ReplTimestamp::ZERO));
    }
    Ok(latest_timestamp(
        client,
        config.mongo_oplog_database.as_deref(),
        config.mongo_oplog_collection.as_deref(),
    )
    .await?)
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = ctrl_c => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "SIGTERM handler unavailable");
            let _ = ctrl_c.await;
        }
    }
}
