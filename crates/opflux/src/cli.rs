//! Command-line flags.
//!
//! Flag names are wire-stable: scripts and service units depend on them.
//! `-v` prints the version and exits; everything else merges over the TOML
//! config file per the precedence rules in [`crate::config`].

use std::path::PathBuf;

use clap::Parser;

/// Tail a MongoDB replication log and project document fields into
/// InfluxDB as time-series points.
#[derive(Debug, Parser)]
#[command(name = "opflux", disable_version_flag = true)]
pub struct Cli {
    /// Location of configuration file
    #[arg(short = 'f', value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Print the version number and exit
    #[arg(short = 'v')]
    pub version: bool,

    /// Output verbose messages
    #[arg(long)]
    pub verbose: bool,

    /// Store the last synced timestamp and resume from it on restart
    #[arg(long)]
    pub resume: bool,

    /// Name under which to load and store the resume state
    #[arg(long)]
    pub resume_name: Option<String>,

    /// Replication timestamp to resume syncing from
    #[arg(long)]
    pub resume_from_timestamp: Option<i64>,

    /// Speed up resume-state writes at the cost of error checking
    #[arg(long)]
    pub resume_write_unsafe: bool,

    /// Replay all events from the start of the replication log
    #[arg(long)]
    pub replay: bool,

    /// Bulk-read existing documents from the configured namespaces at startup
    #[arg(long)]
    pub direct_reads: bool,

    /// Exit once the startup bulk reads are complete
    #[arg(long)]
    pub exit_after_direct_reads: bool,

    /// Only sync operations whose database.collection matches
    #[arg(long, value_name = "REGEX")]
    pub namespace_regex: Option<String>,

    /// Skip operations whose database.collection matches
    #[arg(long, value_name = "REGEX")]
    pub namespace_exclude_regex: Option<String>,

    /// MongoDB connection URL
    #[arg(long, value_name = "URL")]
    pub mongo_url: Option<String>,

    /// Path to a PEM file for secure connections to MongoDB
    #[arg(long, value_name = "FILE")]
    pub mongo_pem_file: Option<PathBuf>,

    /// Skip certificate validation for MongoDB
    #[arg(long)]
    pub mongo_skip_verify: bool,

    /// Override the database name which contains the oplog
    #[arg(long, value_name = "NAME")]
    pub mongo_oplog_database_name: Option<String>,

    /// Override the collection name which contains the oplog
    #[arg(long, value_name = "NAME")]
    pub mongo_oplog_collection_name: Option<String>,

    /// Override the duration before a tail cursor timeout occurs
    #[arg(long, value_name = "DURATION")]
    pub mongo_cursor_timeout: Option<String>,

    /// InfluxDB connection URL
    #[arg(long, value_name = "URL")]
    pub influx_url: Option<String>,

    /// InfluxDB user name
    #[arg(long, value_name = "USER")]
    pub influx_user: Option<String>,

    /// InfluxDB user password
    #[arg(long, value_name = "PASSWORD")]
    pub influx_password: Option<String>,

    /// Skip certificate validation for InfluxDB
    #[arg(long)]
    pub influx_skip_verify: bool,

    /// Path to a PEM file for secure connections to InfluxDB
    #[arg(long, value_name = "FILE")]
    pub influx_pem_file: Option<PathBuf>,

    /// Automatically create target databases on InfluxDB
    #[arg(
        long,
        value_name = "BOOL",
        default_value_t = true,
        action = clap::ArgAction::Set,
        num_args = 1
    )]
    pub influx_auto_create_db: bool,

    /// Number of concurrent InfluxDB writer clients
    #[arg(long, value_name = "N")]
    pub influx_clients: Option<usize>,

    /// Flush a batch once it holds this many points
    #[arg(long, value_name = "N")]
    pub influx_buffer_size: Option<usize>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("opflux").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_with_no_flags() {
        let cli = parse(&[]);
        assert!(!cli.version);
        assert!(!cli.verbose);
        assert!(!cli.resume);
        assert!(cli.influx_auto_create_db);
        assert!(cli.config_file.is_none());
        assert!(cli.influx_clients.is_none());
    }

    #[test]
    fn short_flags() {
        let cli = parse(&["-f", "/etc/opflux.toml", "-v"]);
        assert_eq!(
            cli.config_file.as_deref(),
            Some(std::path::Path::new("/etc/opflux.toml"))
        );
        assert!(cli.version);
    }

    #[test]
    fn long_flags_round_trip() {
        let cli = parse(&[
            "--resume",
            "--resume-name",
            "weather",
            "--resume-from-timestamp",
            "6844226964479737857",
            "--namespace-regex",
            "^weather\\.",
            "--mongo-url",
            "mongodb://db:27017",
            "--influx-clients",
            "4",
            "--influx-buffer-size",
            "500",
        ]);
        assert!(cli.resume);
        assert_eq!(cli.resume_name.as_deref(), Some("weather"));
        assert_eq!(cli.resume_from_timestamp, Some(6_844_226_964_479_737_857));
        assert_eq!(cli.namespace_regex.as_deref(), Some("^weather\\."));
        assert_eq!(cli.mongo_url.as_deref(), Some("mongodb://db:27017"));
        assert_eq!(cli.influx_clients, Some(4));
        assert_eq!(cli.influx_buffer_size, Some(500));
    }

    #[test]
    fn auto_create_takes_an_explicit_value() {
        let cli = parse(&["--influx-auto-create-db", "false"]);
        assert!(!cli.influx_auto_create_db);
        let cli = parse(&["--influx-auto-create-db", "true"]);
        assert!(cli.influx_auto_create_db);
    }
}
