use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::{TcpStream, lookup_host};
use tokio::time::timeout;
use tracing::debug;

use super::error::ProxyError;

/// One TCP endpoint, owned by exactly one worker. The stream is closed
/// once when the connection is dropped (or earlier via [`shutdown`]);
/// ownership makes a double close unrepresentable.
///
/// [`shutdown`]: Connection::shutdown
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Connection {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Presentation form of the remote address, as written into the
    /// `Forwarded` header.
    pub fn peer_ip(&self) -> IpAddr {
        self.peer.ip()
    }

    /// Write the whole buffer, retrying partial writes. A zero-length
    /// write from the kernel aborts with a transport error.
    pub async fn send_all(&mut self, mut bytes: &[u8]) -> Result<(), ProxyError> {
        while !bytes.is_empty() {
            let written = self.stream.write(bytes).await?;
            if written == 0 {
                return Err(ProxyError::Transport(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "socket accepted zero bytes",
                )));
            }
            bytes = &bytes[written..];
        }
        Ok(())
    }

    /// Stream `len` bytes from the file's current offset to the socket.
    pub async fn send_file(&mut self, file: &mut File, len: u64) -> Result<(), ProxyError> {
        let mut remaining = len;
        let mut buffer = [0u8; 8192];
        while remaining > 0 {
            let want = buffer.len().min(remaining as usize);
            let read = file.read(&mut buffer[..want]).await?;
            if read == 0 {
                return Err(ProxyError::Transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "body file ended before declared length",
                )));
            }
            self.send_all(&buffer[..read]).await?;
            remaining -= read as u64;
        }
        Ok(())
    }

    /// Half-close the write side and release the socket. Dropping the
    /// connection without calling this closes it too.
    pub async fn shutdown(mut self) {
        let _ = self.stream.shutdown().await;
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        std::pin::Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

/// Resolve `host` (dotted-quad literals skip the lookup) and connect,
/// bounding both the resolution and the connect by `timeout_dur`.
pub async fn connect_to_host(
    host: &str,
    port: u16,
    timeout_dur: Duration,
) -> Result<Connection, ProxyError> {
    let addrs = resolve(host, port, timeout_dur).await?;

    let mut last_err: Option<std::io::Error> = None;
    for addr in addrs {
        match timeout(timeout_dur, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(err) = stream.set_nodelay(true) {
                    debug!(addr = %addr, error = %err, "failed to set TCP_NODELAY on upstream stream");
                }
                debug!(addr = %addr, "connected to origin");
                return Ok(Connection::new(stream, addr));
            }
            Ok(Err(err)) => last_err = Some(err),
            Err(_) => {
                last_err = Some(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connection to {addr} timed out"),
                ))
            }
        }
    }

    Err(ProxyError::Connect(match last_err {
        Some(err) => format!("{host}:{port}: {err}"),
        None => format!("{host}:{port}: no addresses"),
    }))
}

async fn resolve(
    host: &str,
    port: u16,
    timeout_dur: Duration,
) -> Result<Vec<SocketAddr>, ProxyError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(vec![SocketAddr::new(ip, port)]);
    }
    let lookup = timeout(timeout_dur, lookup_host((host, port)))
        .await
        .map_err(|_| ProxyError::Dns(host.to_string()))?
        .map_err(|_| ProxyError::Dns(host.to_string()))?;
    let addrs: Vec<SocketAddr> = lookup.collect();
    if addrs.is_empty() {
        return Err(ProxyError::Dns(host.to_string()));
    }
    Ok(addrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn connects_to_literal_address() -> anyhow::Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let port = listener.local_addr()?.port();
        let accept = tokio::spawn(async move { listener.accept().await });

        let conn = connect_to_host("127.0.0.1", port, Duration::from_secs(1)).await?;
        assert_eq!(conn.peer().port(), port);
        accept.await??;
        Ok(())
    }

    #[tokio::test]
    async fn refused_connection_surfaces_connect_error() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = connect_to_host("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Connect(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn send_all_delivers_every_byte() -> anyhow::Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut buf)
                .await
                .unwrap();
            buf
        });

        let stream = TcpStream::connect(addr).await?;
        let mut conn = Connection::new(stream, addr);
        conn.send_all(b"hello across the wire").await?;
        conn.shutdown().await;

        assert_eq!(reader.await?, b"hello across the wire");
        Ok(())
    }

    #[tokio::test]
    async fn send_file_streams_exact_length() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("body");
        tokio::fs::write(&path, b"0123456789").await?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let reader = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = Vec::new();
            tokio::io::AsyncReadExt::read_to_end(&mut stream, &mut buf)
                .await
                .unwrap();
            buf
        });

        let stream = TcpStream::connect(addr).await?;
        let mut conn = Connection::new(stream, addr);
        let mut file = tokio::fs::File::open(&path).await?;
        conn.send_file(&mut file, 10).await?;
        conn.shutdown().await;

        assert_eq!(reader.await?, b"0123456789");
        Ok(())
    }

    #[tokio::test]
    async fn send_file_rejects_short_file() -> anyhow::Result<()> {
        let dir = tempfile::TempDir::new()?;
        let path = dir.path().join("short");
        tokio::fs::write(&path, b"abc").await?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let _accept = tokio::spawn(async move { listener.accept().await });

        let stream = TcpStream::connect(addr).await?;
        let mut conn = Connection::new(stream, addr);
        let mut file = tokio::fs::File::open(&path).await?;
        let err = conn.send_file(&mut file, 100).await.unwrap_err();
        assert!(matches!(err, ProxyError::Transport(_)));
        Ok(())
    }
}
