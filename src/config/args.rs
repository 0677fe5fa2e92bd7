//! Command-line arguments for the Streamgate server

use clap::Parser;
use std::path::PathBuf;

/// Streamgate - transparent Kafka protocol proxy
#[derive(Parser, Debug, Clone)]
#[command(name = "streamgate")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Transparent protocol-level proxy for the Kafka wire protocol")]
pub struct ProxyArgs {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "STREAMGATE_CONFIG", default_value = "streamgate.toml")]
    pub config: PathBuf,

    /// Log level filter (e.g. info, debug, streamgate=debug)
    #[arg(long, env = "STREAMGATE_LOG", default_value = "info")]
    pub log_level: String,

    /// Override the per-connection in-flight request limit
    #[arg(long)]
    pub max_in_flight: Option<usize>,

    /// Force-enable the admin HTTP endpoint
    #[arg(long)]
    pub admin: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    pub check_config: bool,
}
