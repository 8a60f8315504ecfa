use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Minimal HTTP origin that counts inbound requests and keeps the raw
/// request heads it received.
pub struct OriginMock {
    addr: SocketAddr,
    requests: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<String>>>,
    handle: JoinHandle<()>,
}

impl OriginMock {
    /// Serve `HTTP/1.1 200 OK` with the given body on every request.
    pub async fn http_ok(body: &str) -> Result<Self> {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        Self::with_response(response.into_bytes(), None).await
    }

    /// As [`http_ok`], but stall before answering so that concurrent
    /// clients pile up on the same cache entry.
    ///
    /// [`http_ok`]: OriginMock::http_ok
    pub async fn http_ok_delayed(body: &str, delay: Duration) -> Result<Self> {
        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        );
        Self::with_response(response.into_bytes(), Some(delay)).await
    }

    pub async fn with_response(response: Vec<u8>, delay: Option<Duration>) -> Result<Self> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
        let addr = listener.local_addr()?;
        let requests = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(Mutex::new(Vec::new()));
        let response = Arc::new(response);

        let loop_requests = requests.clone();
        let loop_captured = captured.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(_) => break,
                };
                let requests = loop_requests.clone();
                let captured = loop_captured.clone();
                let response = response.clone();
                tokio::spawn(async move {
                    let _ = serve_one(stream, requests, captured, response, delay).await;
                });
            }
        });

        Ok(Self {
            addr,
            requests,
            captured,
            handle,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn captured_requests(&self) -> Vec<String> {
        self.captured.lock().clone()
    }
}

impl Drop for OriginMock {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_one(
    mut stream: TcpStream,
    requests: Arc<AtomicUsize>,
    captured: Arc<Mutex<Vec<String>>>,
    response: Arc<Vec<u8>>,
    delay: Option<Duration>,
) -> Result<()> {
    let mut buf = [0u8; 4096];
    let mut data = Vec::new();
    loop {
        let read = stream.read(&mut buf).await.unwrap_or(0);
        if read == 0 {
            break;
        }
        data.extend_from_slice(&buf[..read]);
        if data.windows(4).any(|window| window == b"\r\n\r\n") {
            break;
        }
    }
    if data.is_empty() {
        return Ok(());
    }

    requests.fetch_add(1, Ordering::SeqCst);
    captured.lock().push(String::from_utf8_lossy(&data).into_owned());

    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    stream.write_all(&response).await?;
    stream.shutdown().await.ok();
    Ok(())
}
