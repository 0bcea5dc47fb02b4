//! AgentCom hub entry point

use agentcom::config::HubConfig;
use agentcom::hub::{Hub, HubDeps, HubStorage};
use agentcom::server;
use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Coordination hub for fleets of autonomous worker agents
#[derive(Debug, Parser)]
#[command(name = "agentcom", version, about)]
struct Args {
    /// Address the transport listens on
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: String,

    /// SQLite database path
    #[arg(long, default_value = "agentcom.db")]
    db: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("agentcom=info"));
    if args.json_logs {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let hub = Hub::start(
        HubConfig::default(),
        HubStorage::Path(args.db),
        HubDeps::default(),
    )
    .await?;
    let hub = Arc::new(hub);

    let (listener, _local) = server::bind(&args.bind).await?;
    let router = server::create_router(hub.clone());

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("ctrl-c received, shutting down");
        })
        .await?;

    if let Ok(hub) = Arc::try_unwrap(hub) {
        hub.shutdown().await;
    }
    info!("hub stopped");
    Ok(())
}
