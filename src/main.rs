//! Streamgate - transparent Kafka protocol proxy

use clap::Parser;
use std::process::ExitCode;
use streamgate::{default_filter_registry, ProxyArgs, ProxyConfig, ProxyServer};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let args = ProxyArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone())),
        )
        .init();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "streamgate failed");
            eprintln!("streamgate failed: {e}");
            ExitCode::from(1)
        }
    }
}

fn run(args: ProxyArgs) -> streamgate::Result<()> {
    let config = ProxyConfig::from_file(&args.config)?.merge_args(&args);
    let registry = default_filter_registry();

    if args.check_config {
        // Building the server performs all process-fatal validation:
        // TLS material, filter configs and capability shapes
        ProxyServer::new(config, &registry)?;
        println!("configuration ok");
        return Ok(());
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        streamgate::admin::spawn(&config.admin).await?;
        let server = ProxyServer::new(config, &registry)?;
        info!(version = env!("CARGO_PKG_VERSION"), "streamgate starting");
        server.run().await
    })
}
