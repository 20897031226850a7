//! Pixel Canvas Server
//!
//! Serves the shared canvas over WebSocket.
//! Configured through `CANVAS_*` environment variables, logging through `RUST_LOG`.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use pixel_canvas::{
    network::{AccountStore, MemoryAccounts},
    ServerConfig, SyncServer, VERSION,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set tracing subscriber")?;

    let config = ServerConfig::from_env().context("Invalid configuration")?;

    info!("Pixel Canvas Server v{}", VERSION);
    info!(
        "Canvas: {}x{} (chunks of {})",
        config.canvas.width, config.canvas.height, config.canvas.chunk_size
    );
    info!(
        "Limits: {} points, {:?} cooldown, {:?} regeneration",
        config.limits.max_points, config.limits.cooldown, config.limits.policy
    );

    let accounts: Arc<dyn AccountStore> = match &config.accounts_file {
        Some(path) => Arc::new(
            MemoryAccounts::load(path)
                .with_context(|| format!("Failed to load accounts from {}", path.display()))?,
        ),
        None => {
            warn!("No CANVAS_ACCOUNTS_FILE set; every login will be refused");
            Arc::new(MemoryAccounts::new())
        }
    };

    match &config.persistence.data_dir {
        Some(dir) => info!("Persisting to {}", dir.display()),
        None => warn!("No CANVAS_DATA_DIR set; canvas lives in memory only"),
    }

    let server = SyncServer::open(config, accounts)
        .await
        .context("Failed to open canvas state")?;
    let listener = server.bind().await.context("Failed to bind")?;

    let signal_server = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            signal_server.shutdown();
        }
    });

    server.serve(listener).await?;

    // Give connection tasks a moment to deliver the shutdown notice.
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    info!("Server stopped");
    Ok(())
}
