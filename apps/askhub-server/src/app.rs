//! Wires the hub and its WebSocket server together.

use std::sync::Arc;

use askhub_hub::{HubServer, RelayHub, ServerConfig};

use crate::config::Config;

/// Runs the hub until Ctrl-C.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let hub = RelayHub::new(config.hub_config());
    let server = HubServer::new(ServerConfig { port: config.port }, hub);

    let server_run = Arc::clone(&server);
    let mut serving = tokio::spawn(async move { server_run.run().await });

    tokio::select! {
        result = &mut serving => {
            // The accept loop only returns on its own when binding fails.
            result??;
            return Ok(());
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("SIGINT received, shutting down");
        }
    }

    server.shutdown();
    serving.await??;
    tracing::info!(
        participants = server.hub().registry().len().await,
        "server stopped"
    );
    Ok(())
}
