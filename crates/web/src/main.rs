use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use relaygate_web::WebConfig;

/// Relaygate web service
#[derive(Parser, Debug)]
#[command(name = "relaygate-web", version, about)]
struct Args {
    /// Path to a TOML configuration file
    #[arg(short, long, env = "RELAYGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, overrides the configuration file
    #[arg(short, long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut config = match WebConfig::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            return Err(e.into());
        }
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }

    info!(
        "Starting Relaygate on http://{} (gateway: {}, database: {})",
        config.listen_addr,
        config.gateway.base_url(),
        config.database_path.display()
    );

    relaygate_web::server::serve(config).await
}
