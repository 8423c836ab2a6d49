use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "bifrost", version, about = "Protocol-translating chat proxy")]
pub(crate) struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, env = "BIFROST_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen address override.
    #[arg(short, long)]
    pub listen: Option<SocketAddr>,

    /// Log filter, e.g. "info" or "llm=debug,broker=debug".
    #[arg(long, env = "BIFROST_LOG", default_value = "info")]
    pub log_filter: String,
}
