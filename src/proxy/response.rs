use std::time::Duration;

use http::StatusCode;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use super::error::ProxyError;
use super::http::{Message, ReadLimits, read_message};
use super::net::{Connection, connect_to_host};
use super::request::Request;

/// Status-line grammar: optional version, status code, reason.
static STATUS_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(HTTP/[0-9]+(?:\.[0-9]+)?)?\s*([0-9]+)\s*(.*)$").expect("status line regex")
});

const DEFAULT_VERSION: &str = "HTTP/1.1";

/// An origin (or synthesized) response. The header line is rebuilt
/// from the parsed fields on every send.
#[derive(Debug)]
pub struct Response {
    pub message: Message,
    pub version: String,
    pub status: StatusCode,
    pub reason: String,
}

impl Response {
    /// Parse a message's status line into a response.
    pub fn parse(message: Message) -> Result<Self, ProxyError> {
        let captures = STATUS_LINE.captures(&message.header_line).ok_or_else(|| {
            ProxyError::Parse(format!("unrecognized status line '{}'", message.header_line))
        })?;
        let version = captures
            .get(1)
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| DEFAULT_VERSION.to_string());
        let code: u16 = captures
            .get(2)
            .map(|m| m.as_str())
            .unwrap_or_default()
            .parse()
            .map_err(|_| ProxyError::Parse("status code out of range".to_string()))?;
        let status = StatusCode::from_u16(code)
            .map_err(|_| ProxyError::Parse(format!("invalid status code {code}")))?;
        let reason = captures
            .get(3)
            .map(|m| m.as_str().trim_end().to_string())
            .unwrap_or_default();
        Ok(Self {
            message,
            version,
            status,
            reason,
        })
    }

    /// Rebuild a response from cached raw bytes.
    pub fn from_bytes(raw: Vec<u8>) -> Result<Self, ProxyError> {
        Self::parse(Message::from_bytes(raw)?)
    }

    /// Construct an error response locally: the reason phrase doubles
    /// as the body.
    pub fn synthesize_error(status: StatusCode, reason: &str) -> Self {
        let mut message = Message::new(format!("{DEFAULT_VERSION} {} {reason}", status.as_u16()));
        message.set_body_bytes(reason.as_bytes().to_vec());
        Self {
            message,
            version: DEFAULT_VERSION.to_string(),
            status,
            reason: reason.to_string(),
        }
    }

    /// Serialize to the client; the header line comes from the parsed
    /// fields. Returns bytes written.
    pub async fn send(
        &mut self,
        conn: &mut Connection,
        timeout_dur: Duration,
    ) -> Result<u64, ProxyError> {
        self.message.header_line =
            format!("{} {} {}", self.version, self.status.as_u16(), self.reason);
        self.message.send(conn, timeout_dur).await
    }
}

/// Open an origin connection, forward the (already rewritten) request,
/// and read back one response message. Every socket operation shares
/// the keep-alive deadline; the connection is never reused.
pub async fn fetch_message(
    request: &mut Request,
    keep_alive: Duration,
    limits: &ReadLimits,
) -> Result<Message, ProxyError> {
    let host = request
        .host
        .clone()
        .ok_or_else(|| ProxyError::Parse("request has no host".to_string()))?;
    let port = request.port();

    let mut origin = connect_to_host(&host, port, keep_alive).await?;
    debug!(host, port, "forwarding request to origin");
    request
        .message
        .send(&mut origin, keep_alive)
        .await
        .map_err(upstream_error)?;
    let message = read_message(&mut origin, limits)
        .await
        .map_err(upstream_error)?;
    origin.shutdown().await;
    Ok(message)
}

/// Fetch and parse in one step, for requests that bypass the cache.
pub async fn fetch(
    request: &mut Request,
    keep_alive: Duration,
    limits: &ReadLimits,
) -> Result<Response, ProxyError> {
    let message = fetch_message(request, keep_alive, limits).await?;
    Response::parse(message).map_err(|err| ProxyError::FetchFailed(err.to_string()))
}

/// DNS and connect failures keep their kind; everything else that goes
/// wrong while talking to the origin is a fetch failure.
fn upstream_error(err: ProxyError) -> ProxyError {
    match err {
        ProxyError::Dns(_) | ProxyError::Connect(_) => err,
        other => ProxyError::FetchFailed(other.to_string()),
    }
}
