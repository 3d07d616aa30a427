use common::utils::config::get_config;
use engine::Engine;
use ingestion_pipeline::run_worker_loop;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set up tracing
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .try_init()
        .ok();

    // Get config
    let config = get_config()?;

    let engine = Engine::init(config).await?;
    info!("engine initialized");

    // Ingestion runs on its own task so heavy documents never block the
    // request path.
    let worker_pipeline = engine.ingestion();
    let worker = tokio::spawn(async move {
        run_worker_loop(worker_pipeline).await;
    });

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
    }

    info!("shutting down");
    worker.abort();
    engine.shutdown().await;

    Ok(())
}
