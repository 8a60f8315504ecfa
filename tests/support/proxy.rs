use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::TempDir;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use wirecache::blocklist::Blocklist;
use wirecache::proxy::cache::Cache;
use wirecache::proxy::{AppContext, listener::Server};
use wirecache::settings::{MAX_BODY_BYTES, MAX_HEADER_BYTES, Settings};

/// Knobs the scenarios need to vary; everything else uses the
/// protocol defaults scaled down to test time.
pub struct FixtureConfig {
    pub cache_ttl: u64,
    pub keep_alive: Duration,
    /// Blocklist file contents, written before the proxy loads it.
    pub blocklist: Option<String>,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            cache_ttl: 60,
            keep_alive: Duration::from_secs(5),
            blocklist: None,
        }
    }
}

/// A proxy bound to an ephemeral local port, serving in a background
/// task, with its cache and blocklist under a temp workspace.
pub struct ProxyFixture {
    pub addr: SocketAddr,
    cache_dir: PathBuf,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
    _workspace: TempDir,
}

impl ProxyFixture {
    pub async fn start(config: FixtureConfig) -> Result<Self> {
        let workspace = TempDir::new()?;
        let cache_dir = workspace.path().join("cache");
        let blocklist_path = workspace.path().join("blocklist");
        if let Some(contents) = &config.blocklist {
            tokio::fs::write(&blocklist_path, contents).await?;
        }

        let settings = Arc::new(Settings {
            listen: "127.0.0.1:0".parse()?,
            cache_ttl: config.cache_ttl,
            keep_alive: config.keep_alive,
            cache_dir: cache_dir.clone(),
            blocklist_path,
            max_header_bytes: MAX_HEADER_BYTES,
            max_body_bytes: MAX_BODY_BYTES,
            verbose: false,
        });

        let blocklist = Arc::new(Blocklist::load(&settings.blocklist_path).await);
        let cache = Arc::new(Cache::new(settings.cache_dir.clone(), settings.cache_ttl()).await?);
        let app = AppContext::new(settings, blocklist, cache);

        let server = Server::bind(app).await?;
        let addr = server.local_addr()?;
        let shutdown = server.shutdown_token();
        let handle = tokio::spawn(server.serve());

        Ok(Self {
            addr,
            cache_dir,
            shutdown,
            handle,
            _workspace: workspace,
        })
    }

    pub async fn start_default() -> Result<Self> {
        Self::start(FixtureConfig::default()).await
    }

    /// Names of the files currently materialized in the cache dir.
    pub fn cached_files(&self) -> Vec<String> {
        std::fs::read_dir(&self.cache_dir)
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| entry.file_name().into_string().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Request a graceful shutdown and wait for the serve loop to
    /// finish draining workers and the cache.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.cancel();
        self.handle.await??;
        Ok(())
    }
}
