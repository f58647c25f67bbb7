use std::sync::Arc;

use alertd::alerter::{Alerter, configured_channels};
use alertd::api::{self, AppState};
use alertd::cli::CliArgs;
use alertd::config::AlertConfig;
use alertd::logging;
use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let args = CliArgs::parse();
    let _log_guard = logging::init_logging(args.log_dir.as_deref(), args.verbose)?;

    let config = AlertConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let listen = match args.listen {
        Some(addr) => addr,
        None => config.listen_addr()?,
    };

    let cancel = CancellationToken::new();
    let (alerter, agents) = Alerter::start(&config, configured_channels(&config), cancel.clone())?;
    let alerter = Arc::new(alerter);

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received shutdown signal"),
            Err(e) => error!("failed to listen for shutdown signal: {}", e),
        }
        shutdown.cancel();
    });

    info!("alertd {} started", env!("CARGO_PKG_VERSION"));
    let served = api::serve(listen, AppState::new(alerter.clone()), cancel.clone()).await;

    alerter.shutdown().await;
    for agent in agents {
        let _ = agent.await;
    }
    info!("alertd stopped");

    served.map_err(Into::into)
}
