//! Error taxonomy for the pipeline (§7): one context-selector enum per
//! subsystem, in the style the teacher builds its own `vector-common` error
//! types around `snafu`.

use snafu::Snafu;
use std::path::PathBuf;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ConfigError {
    #[snafu(display("failed to read config file at {}: {source}", path.display()))]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("failed to parse config as TOML: {source}"))]
    Parse { source: toml::de::Error },

    #[snafu(display("{field} must not be empty"))]
    MissingField { field: &'static str },

    #[snafu(display("{path_field} ({}) is not writable: {source}", path.display()))]
    NotWritable {
        path_field: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Parse-time failures (§7 "Parse error"): discarded and counted, never retried.
#[derive(Debug, Snafu, PartialEq, Eq, Clone)]
pub enum ParseError {
    #[snafu(display("line matched neither the with-NAT nor the no-NAT pattern"))]
    NoMatch,

    #[snafu(display("could not parse syslog timestamp {raw:?}"))]
    BadTimestamp { raw: String },

    #[snafu(display("malformed IPv4 address {raw:?}"))]
    BadAddress { raw: String },

    #[snafu(display("malformed port {raw:?}"))]
    BadPort { raw: String },
}

/// Shard-store failures (§7 "Storage transient"/"Storage fatal").
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ShardError {
    #[snafu(display("failed to open shard {}: {source}", path.display()))]
    Open {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("failed to create shard schema: {source}"))]
    Schema { source: rusqlite::Error },

    #[snafu(display("failed to insert batch: {source}"))]
    Insert { source: rusqlite::Error },

    #[snafu(display("failed to look up or create dictionary id for {table} = {name:?}: {source}"))]
    Dictionary {
        table: &'static str,
        name: String,
        source: rusqlite::Error,
    },

    #[snafu(display("failed to upsert processor_stats[{key}]: {source}"))]
    Stats {
        key: String,
        source: rusqlite::Error,
    },

    #[snafu(display("failed to remove retired shard {}: {source}", path.display()))]
    Retention {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Query-time failures (§7 "Filter error" / per-shard failures).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum QueryError {
    #[snafu(display("invalid filter: {reason}"))]
    InvalidFilter { reason: String },

    #[snafu(display("query execution failed on shard {}: {source}", path.display()))]
    Execution {
        path: PathBuf,
        source: rusqlite::Error,
    },

    #[snafu(display("shard {} could not be opened for query: {source}", path.display()))]
    ShardUnavailable {
        path: PathBuf,
        source: ShardError,
    },
}
