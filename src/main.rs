use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use hermod::config::Config;
use hermod::HermodEngine;

#[tokio::main]
async fn main() {
    let config = Config::global();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.engine.log_level.clone())),
        )
        .init();

    println!("🚀 Hermod Broker starting...");

    let engine = HermodEngine::new(config);
    info!("[Main] engine running; transports attach through the service facade");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("[Main] signal handler failed: {}", e);
    }
    engine.shutdown().await;
    info!("[Main] bye");
}
