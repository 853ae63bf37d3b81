//! Configuration resolution: CLI flags over the TOML file over defaults.
//!
//! String and numeric flags win over the file when set; boolean flags OR
//! with the file value (either side can enable). `influx-auto-create-db`
//! is the one value-style boolean: it defaults on and either side can turn
//! it off.

use std::path::PathBuf;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;

use opflux_core::point::{InvalidPrecision, Precision};
use opflux_core::schema::Measurement;
use opflux_core::{FilterChain, RESERVED_DATABASE};
use opflux_mongo::session::strip_ssl_param;

use crate::cli::Cli;

/// Process name; also the reserved database name the filter chain excludes.
pub const NAME: &str = "opflux";

/// Crate version, printed by `-v`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

const MONGO_URL_DEFAULT: &str = "localhost";
const INFLUX_URL_DEFAULT: &str = "http://localhost:8086";
const INFLUX_CLIENTS_DEFAULT: usize = 10;
const INFLUX_BUFFER_DEFAULT: usize = 1000;
const RESUME_NAME_DEFAULT: &str = "default";
const CHANNEL_SIZE_DEFAULT: usize = 512;
const TAIL_BUFFER_SIZE_DEFAULT: usize = 32;
const TAIL_BUFFER_DURATION_DEFAULT: Duration = Duration::from_millis(750);

/// Configuration failures; all fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read.
    #[error("reading config file {path}: {source}")]
    Io {
        /// File that failed to read.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The config file is not valid TOML.
    #[error("parsing config file {path}: {source}")]
    Parse {
        /// File that failed to parse.
        path: PathBuf,
        /// Underlying TOML error.
        source: toml::de::Error,
    },

    /// A duration string did not parse.
    #[error("invalid duration {value:?} for {key}")]
    Duration {
        /// Which setting carried the bad value.
        key: &'static str,
        /// The unparseable input.
        value: String,
    },

    /// A measurement precision did not parse.
    #[error("measurement {namespace}: {source}")]
    Precision {
        /// The measurement's namespace.
        namespace: String,
        /// Underlying parse error.
        source: InvalidPrecision,
    },

    /// A namespace regex did not compile.
    #[error("invalid {key}: {source}")]
    Regex {
        /// Which setting carried the bad pattern.
        key: &'static str,
        /// Underlying regex error.
        source: regex::Error,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FileConfig {
    mongo_url: Option<String>,
    mongo_pem_file: Option<PathBuf>,
    mongo_skip_verify: Option<bool>,
    mongo_oplog_database_name: Option<String>,
    mongo_oplog_collection_name: Option<String>,
    mongo_cursor_timeout: Option<String>,
    mongo_dial_settings: DialSection,
    mongo_session_settings: SessionSection,
    gtm_settings: TailSection,
    resume_name: Option<String>,
    namespace_regex: Option<String>,
    namespace_exclude_regex: Option<String>,
    verbose: Option<bool>,
    resume: Option<bool>,
    resume_write_unsafe: Option<bool>,
    resume_from_timestamp: Option<i64>,
    replay: Option<bool>,
    direct_reads: Option<bool>,
    exit_after_direct_reads: Option<bool>,
    measurement: Vec<MeasurementSection>,
    influx_url: Option<String>,
    influx_user: Option<String>,
    influx_password: Option<String>,
    influx_skip_verify: Option<bool>,
    influx_pem_file: Option<PathBuf>,
    influx_auto_create_db: Option<bool>,
    influx_clients: Option<usize>,
    influx_buffer_size: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct DialSection {
    timeout: Option<i64>,
    ssl: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct SessionSection {
    socket_timeout: Option<i64>,
    sync_timeout: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
struct TailSection {
    channel_size: Option<usize>,
    buffer_size: Option<usize>,
    buffer_duration: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct MeasurementSection {
    namespace: String,
    #[serde(default)]
    timefield: Option<String>,
    #[serde(default)]
    retention: Option<String>,
    #[serde(default)]
    precision: Option<String>,
    #[serde(default)]
    measure: Option<String>,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    fields: Vec<String>,
}

impl FileConfig {
    /// Parses a TOML config file.
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })
    }
}

/// Fully resolved runtime configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub verbose: bool,
    pub resume: bool,
    pub resume_name: String,
    pub resume_from_timestamp: i64,
    pub resume_write_unsafe: bool,
    pub replay: bool,
    pub direct_reads: bool,
    pub exit_after_direct_reads: bool,
    pub namespace_regex: Option<String>,
    pub namespace_exclude_regex: Option<String>,

    pub mongo_url: String,
    pub mongo_pem_file: Option<PathBuf>,
    pub mongo_skip_verify: bool,
    pub mongo_ssl: bool,
    pub mongo_oplog_database: Option<String>,
    pub mongo_oplog_collection: Option<String>,
    pub mongo_cursor_timeout: Option<Duration>,
    pub mongo_dial_timeout: Option<Duration>,
    pub mongo_socket_timeout: Option<Duration>,
    pub mongo_sync_timeout: Option<Duration>,

    pub influx_url: String,
    pub influx_user: Option<String>,
    pub influx_password: Option<String>,
    pub influx_skip_verify: bool,
    pub influx_pem_file: Option<PathBuf>,
    pub influx_auto_create_db: bool,
    pub influx_clients: usize,
    pub influx_buffer_size: usize,

    pub channel_size: usize,
    pub tail_buffer_size: usize,
    pub tail_buffer_duration: Duration,

    pub measurements: Vec<Measurement>,
}

impl Config {
    /// Loads the config file named by `-f` (when present) and resolves it
    /// against the flags.
    pub fn load(cli: &Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config_file {
            Some(path) => FileConfig::from_file(path)?,
            None => FileConfig::default(),
        };
        Self::resolve(cli, file)
    }

    /// Merges flags over the file, applies defaults, and normalizes the
    /// source URL (`ssl=true` moves from the query string to the dial
    /// options).
    pub fn resolve(cli: &Cli, file: FileConfig) -> Result<Self, ConfigError> {
        let raw_mongo_url = cli
            .mongo_url
            .clone()
            .or(file.mongo_url)
            .unwrap_or_else(|| MONGO_URL_DEFAULT.to_string());
        let (mongo_url, ssl_in_url) = strip_ssl_param(&raw_mongo_url);

        let resume = cli.resume || file.resume.unwrap_or(false);
        let resume_name = cli
            .resume_name
            .clone()
            .or(if resume { file.resume_name } else { None })
            .unwrap_or_else(|| RESUME_NAME_DEFAULT.to_string());

        let measurements = file
            .measurement
            .into_iter()
            .map(measurement_from_section)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            verbose: cli.verbose || file.verbose.unwrap_or(false),
            resume,
            resume_name,
            resume_from_timestamp: cli
                .resume_from_timestamp
                .or(file.resume_from_timestamp)
                .unwrap_or(0),
            resume_write_unsafe: cli.resume_write_unsafe
                || file.resume_write_unsafe.unwrap_or(false),
            replay: cli.replay || file.replay.unwrap_or(false),
            direct_reads: cli.direct_reads || file.direct_reads.unwrap_or(false),
            exit_after_direct_reads: cli.exit_after_direct_reads
                || file.exit_after_direct_reads.unwrap_or(false),
            namespace_regex: cli.namespace_regex.clone().or(file.namespace_regex),
            namespace_exclude_regex: cli
                .namespace_exclude_regex
                .clone()
                .or(file.namespace_exclude_regex),

            mongo_url,
            mongo_pem_file: cli.mongo_pem_file.clone().or(file.mongo_pem_file),
            mongo_skip_verify: cli.mongo_skip_verify || file.mongo_skip_verify.unwrap_or(false),
            mongo_ssl: ssl_in_url || file.mongo_dial_settings.ssl.unwrap_or(false),
            mongo_oplog_database: cli
                .mongo_oplog_database_name
                .clone()
                .or(file.mongo_oplog_database_name),
            mongo_oplog_collection: cli
                .mongo_oplog_collection_name
                .clone()
                .or(file.mongo_oplog_collection_name),
            mongo_cursor_timeout: parse_optional_duration(
                "mongo-cursor-timeout",
                cli.mongo_cursor_timeout.clone().or(file.mongo_cursor_timeout),
            )?,
            mongo_dial_timeout: seconds(file.mongo_dial_settings.timeout),
            mongo_socket_timeout: seconds(file.mongo_session_settings.socket_timeout),
            mongo_sync_timeout: seconds(file.mongo_session_settings.sync_timeout),

            influx_url: cli
                .influx_url
                .clone()
                .or(file.influx_url)
                .unwrap_or_else(|| INFLUX_URL_DEFAULT.to_string()),
            influx_user: cli.influx_user.clone().or(file.influx_user),
            influx_password: cli.influx_password.clone().or(file.influx_password),
            influx_skip_verify: cli.influx_skip_verify
                || file.influx_skip_verify.unwrap_or(false),
            influx_pem_file: cli.influx_pem_file.clone().or(file.influx_pem_file),
            influx_auto_create_db: cli.influx_auto_create_db
                && file.influx_auto_create_db.unwrap_or(true),
            influx_clients: cli
                .influx_clients
                .or(file.influx_clients)
                .unwrap_or(INFLUX_CLIENTS_DEFAULT),
            influx_buffer_size: cli
                .influx_buffer_size
                .or(file.influx_buffer_size)
                .unwrap_or(INFLUX_BUFFER_DEFAULT),

            channel_size: file
                .gtm_settings
                .channel_size
                .unwrap_or(CHANNEL_SIZE_DEFAULT),
            tail_buffer_size: file
                .gtm_settings
                .buffer_size
                .unwrap_or(TAIL_BUFFER_SIZE_DEFAULT),
            tail_buffer_duration: parse_optional_duration(
                "gtm-settings.buffer-duration",
                file.gtm_settings.buffer_duration,
            )?
            .unwrap_or(TAIL_BUFFER_DURATION_DEFAULT),

            measurements,
        })
    }

    /// Builds the event filter chain from the resolved regexes.
    pub fn build_filter(&self) -> Result<FilterChain, ConfigError> {
        let mut chain = FilterChain::standard(RESERVED_DATABASE);
        if let Some(pattern) = &self.namespace_regex {
            let regex = Regex::new(pattern).map_err(|source| ConfigError::Regex {
                key: "namespace-regex",
                source,
            })?;
            chain = chain.include_namespaces(regex);
        }
        if let Some(pattern) = &self.namespace_exclude_regex {
            let regex = Regex::new(pattern).map_err(|source| ConfigError::Regex {
                key: "namespace-exclude-regex",
                source,
            })?;
            chain = chain.exclude_namespaces(regex);
        }
        Ok(chain)
    }
}

fn measurement_from_section(section: MeasurementSection) -> Result<Measurement, ConfigError> {
    let mut spec = Measurement::new(section.namespace.clone());
    spec.time_field = section.timefield.filter(|s| !s.is_empty());
    spec.measurement = section.measure.filter(|s| !s.is_empty());
    spec.retention_policy = section.retention.unwrap_or_default();
    if let Some(precision) = section.precision.filter(|s| !s.is_empty()) {
        spec.precision = precision
            .parse::<Precision>()
            .map_err(|source| ConfigError::Precision {
                namespace: section.namespace,
                source,
            })?;
    }
    spec.tags = section.tags.into_iter().collect();
    spec.fields = section.fields.into_iter().collect();
    Ok(spec)
}

/// Positive whole seconds into a duration; zero and negative mean unset.
fn seconds(value: Option<i64>) -> Option<Duration> {
    value
        .filter(|v| *v > 0)
        .and_then(|v| u64::try_from(v).ok())
        .map(Duration::from_secs)
}

fn parse_optional_duration(
    key: &'static str,
    value: Option<String>,
) -> Result<Option<Duration>, ConfigError> {
    match value.filter(|v| !v.is_empty()) {
        Some(value) => parse_duration(&value)
            .map(Some)
            .ok_or(ConfigError::Duration { key, value }),
        None => Ok(None),
    }
}

/// Parses compound duration strings like `750ms`, `1s`, or `1m30s`.
fn parse_duration(input: &str) -> Option<Duration> {
    let mut rest = input.trim();
    if rest.is_empty() {
        return None;
    }
    let mut total = Duration::ZERO;
    while !rest.is_empty() {
        let number_end = rest.find(|c: char| !c.is_ascii_digit() && c != '.')?;
        if number_end == 0 {
            return None;
        }
        let value: f64 = rest[..number_end].parse().ok()?;
        let tail = &rest[number_end..];
        let (unit_seconds, consumed) = if let Some(after) = tail.strip_prefix("ns") {
            (1e-9, after)
        } else if let Some(after) = tail.strip_prefix("us") {
            (1e-6, after)
        } else if let Some(after) = tail.strip_prefix("ms") {
            (1e-3, after)
        } else if let Some(after) = tail.strip_prefix('s') {
            (1.0, after)
        } else if let Some(after) = tail.strip_prefix('m') {
            (60.0, after)
        } else if let Some(after) = tail.strip_prefix('h') {
            (3600.0, after)
        } else {
            return None;
        };
        total += Duration::from_secs_f64(value * unit_seconds);
        rest = consumed;
    }
    Some(total)
}
