pub mod blocklist;
pub mod cli;
pub mod logging;
pub mod proxy;
pub mod settings;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::{blocklist::Blocklist, proxy::cache::Cache, settings::Settings};

/// Assemble the shared state, bind the listener, and serve until
/// interrupted. Ctrl-C (SIGINT) triggers a graceful shutdown: the
/// accept loop stops, in-flight workers finish, and the cache drains.
pub async fn run(settings: Settings) -> Result<()> {
    let settings = Arc::new(settings);
    let blocklist = Arc::new(Blocklist::load(&settings.blocklist_path).await);
    let cache = Arc::new(Cache::new(settings.cache_dir.clone(), settings.cache_ttl()).await?);
    let app = proxy::AppContext::new(settings, blocklist, cache);

    let server = proxy::listener::Server::bind(app).await?;
    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received; shutting down");
                shutdown.cancel();
            }
            Err(err) => {
                tracing::error!(error = %err, "failed to install interrupt handler");
            }
        }
    });
    server.serve().await
}
