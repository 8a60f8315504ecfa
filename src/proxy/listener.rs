use std::net::SocketAddr;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info};

use super::{AppContext, net::Connection, worker};

/// Supervisor: owns the listening socket, spawns one worker task per
/// accepted connection, and coordinates graceful shutdown.
pub struct Server {
    listener: TcpListener,
    app: AppContext,
    shutdown: CancellationToken,
    workers: TaskTracker,
}

impl Server {
    /// Bind the listener with `SO_REUSEADDR` so a restart does not
    /// trip over sockets lingering in TIME_WAIT.
    pub async fn bind(app: AppContext) -> Result<Self> {
        let addr = app.settings.listen;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .context("failed to create listening socket")?;
        socket
            .set_reuseaddr(true)
            .context("failed to set SO_REUSEADDR")?;
        socket
            .bind(addr)
            .with_context(|| format!("failed to bind listener on {addr}"))?;
        let listener = socket.listen(1024).context("failed to listen")?;
        info!(address = %listener.local_addr()?, "proxy listener started");
        Ok(Self {
            listener,
            app,
            shutdown: CancellationToken::new(),
            workers: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Token that breaks the accept loop when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept until shutdown, then close the listener, wait for every
    /// worker to finish, and drain the cache (which itself blocks on
    /// in-flight readers). Workers are never force-killed.
    pub async fn serve(self) -> Result<()> {
        let Self {
            listener,
            app,
            shutdown,
            workers,
        } = self;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested; no longer accepting connections");
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(err) => {
                            error!(error = %err, "failed to accept incoming connection");
                            continue;
                        }
                    };
                    debug!(peer = %peer, "accepted connection");
                    if let Err(err) = stream.set_nodelay(true) {
                        debug!(peer = %peer, error = %err, "failed to set TCP_NODELAY on client stream");
                    }
                    let conn = Connection::new(stream, peer);
                    let connection_app = app.clone();
                    workers.spawn(async move {
                        if let Err(err) = worker::handle_client(conn, connection_app).await {
                            debug!(peer = %peer, error = %err, "connection closed with error");
                        }
                    });
                }
            }
        }

        drop(listener);
        workers.close();
        workers.wait().await;
        app.cache.drain().await;
        info!("proxy stopped");
        Ok(())
    }
}
