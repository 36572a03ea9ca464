//! askhub relay hub entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting askhub server");

    let config = config::Config::load()?;
    tracing::info!(
        port = config.port,
        orchestrator = %config.orchestrator_identity,
        end_user = %config.end_user_identity,
        wait_timeout_secs = config.wait_timeout_secs,
        "configuration loaded"
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("askhub server shut down cleanly");
    Ok(())
}
