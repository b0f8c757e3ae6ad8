//! Command-line contract: two positionals (`mode`, `action`) plus four
//! flags. This module defines the clap surface only; `src/bin/kdht-store.rs`
//! wires it to the engine.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Operate on the local storage root directly.
    Run,
    /// Operate against a remote keystore over the TCP wire protocol.
    Remote,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    Upload,
    Store,
    View,
    Download,
    Delete,
    Verify,
    Expire,
    Clean,
    #[value(name = "deep-clean")]
    DeepClean,
    Stats,
}

#[derive(Debug, Parser)]
#[command(name = "kdht-store")]
#[command(about = "Content-addressed, chunked local file store with a TCP front end")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Whether to operate on the local storage root or a remote server.
    pub mode: Mode,

    /// Which keystore operation to perform.
    pub action: Action,

    /// The file path, name, or hex hash the action applies to, depending on
    /// the action (e.g. a path for `store`, a name or hash for `download`).
    pub target: Option<String>,

    /// Output path for `download`/`view` when reassembling to disk.
    #[arg(long)]
    pub output: Option<PathBuf>,

    /// Host:port of the remote server, used when `mode` is `remote`.
    #[arg(long, default_value = "127.0.0.1:9031")]
    pub addr: String,

    /// Reassemble to a file instead of printing/streaming raw bytes.
    #[arg(long)]
    pub reassemble: bool,

    /// Verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// TTL applied to files stored in this invocation; 0 means never expires.
    #[arg(long = "ttl-seconds")]
    pub ttl_seconds: Option<u64>,

    /// Storage root directory.
    #[arg(long = "store-path", env = "KDHT_STORE_ROOT")]
    pub store_path: Option<PathBuf>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

pub fn resolve_store_root(cli: &Cli) -> crate::Result<PathBuf> {
    if let Some(path) = &cli.store_path {
        return Ok(path.clone());
    }
    if let Ok(path) = std::env::var("KDHT_STORE_ROOT") {
        return Ok(PathBuf::from(path));
    }
    dirs::home_dir()
        .map(|h| h.join(".kdht-store"))
        .ok_or_else(|| crate::Error::BadArgument {
            reason: "could not determine a default store root; pass --store-path".into(),
        })
}

pub fn init_logging(verbose: bool, format: LogFormat) {
    use tracing_subscriber::EnvFilter;

    let default_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => subscriber.json().init(),
        LogFormat::Text => subscriber.init(),
    }
}
