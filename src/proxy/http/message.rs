use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

use crate::proxy::error::ProxyError;
use crate::proxy::net::Connection;
use crate::settings::CHUNK_SIZE;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";
const CONTENT_LENGTH: &str = "Content-Length";

use super::headers::HeaderTable;

/// Limits applied while reading one message off a socket.
#[derive(Debug, Clone, Copy)]
pub struct ReadLimits {
    /// Idle deadline for each socket read.
    pub keep_alive: Duration,
    /// Cap on the header region, terminator included.
    pub max_header_bytes: usize,
    /// Cap on the declared `Content-Length`.
    pub max_body_bytes: u64,
}

/// Message body: empty, owned bytes, or an open file (used when a
/// large body is materialized on disk rather than in memory).
#[derive(Debug)]
pub enum Body {
    Empty,
    Bytes(Vec<u8>),
    File { file: File, len: u64 },
}

impl Body {
    pub fn len(&self) -> u64 {
        match self {
            Body::Empty => 0,
            Body::Bytes(bytes) => bytes.len() as u64,
            Body::File { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One HTTP message: the first CRLF-terminated line, the ordered
/// header set, and an optional `Content-Length`-framed body. Used for
/// requests and responses alike.
#[derive(Debug)]
pub struct Message {
    pub header_line: String,
    pub headers: HeaderTable,
    body: Body,
}

impl Message {
    pub fn new(header_line: impl Into<String>) -> Self {
        Self {
            header_line: header_line.into(),
            headers: HeaderTable::new(),
            body: Body::Empty,
        }
    }

    pub fn body(&self) -> &Body {
        &self.body
    }

    pub fn body_len(&self) -> u64 {
        self.body.len()
    }

    pub fn set_body_bytes(&mut self, bytes: Vec<u8>) {
        self.body = if bytes.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(bytes)
        };
        self.reconcile_content_length();
    }

    pub fn set_body_file(&mut self, file: File, len: u64) {
        self.body = Body::File { file, len };
        self.reconcile_content_length();
    }

    /// `Content-Length` is authoritative from the body extent; called
    /// before every serialization.
    fn reconcile_content_length(&mut self) {
        let len = self.body.len();
        self.headers.set(CONTENT_LENGTH, &len.to_string());
    }

    /// Serialize the header line and header block, terminator included.
    pub fn encode_head(&mut self) -> Vec<u8> {
        self.reconcile_content_length();
        let mut out =
            Vec::with_capacity(self.header_line.len() + self.headers.encoded_len() + 4);
        out.extend_from_slice(self.header_line.as_bytes());
        if !self.header_line.ends_with("\r\n") {
            out.extend_from_slice(b"\r\n");
        }
        for line in self.headers.iter() {
            out.extend_from_slice(line.name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(line.value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"\r\n");
        out
    }

    /// Full serialized form for in-memory bodies. File-backed bodies
    /// must be streamed with [`Message::send`] instead.
    pub fn to_bytes(&mut self) -> Result<Vec<u8>, ProxyError> {
        let mut out = self.encode_head();
        match &self.body {
            Body::Empty => {}
            Body::Bytes(bytes) => out.extend_from_slice(bytes),
            Body::File { .. } => {
                return Err(ProxyError::CacheIo(
                    "cannot buffer a file-backed body".to_string(),
                ));
            }
        }
        Ok(out)
    }

    /// Write the message to a connection, bounding each transfer by
    /// `timeout_dur`. Returns the number of bytes put on the wire.
    pub async fn send(
        &mut self,
        conn: &mut Connection,
        timeout_dur: Duration,
    ) -> Result<u64, ProxyError> {
        let head = self.encode_head();
        timeout(timeout_dur, conn.send_all(&head))
            .await
            .map_err(|_| ProxyError::IdleTimeout)??;
        let mut sent = head.len() as u64;
        match &mut self.body {
            Body::Empty => {}
            Body::Bytes(bytes) => {
                timeout(timeout_dur, conn.send_all(bytes))
                    .await
                    .map_err(|_| ProxyError::IdleTimeout)??;
                sent += bytes.len() as u64;
            }
            Body::File { file, len } => {
                timeout(timeout_dur, conn.send_file(file, *len))
                    .await
                    .map_err(|_| ProxyError::IdleTimeout)??;
                sent += *len;
            }
        }
        Ok(sent)
    }

    /// Rebuild a message from a complete buffer (a cached entry). The
    /// buffer must contain exactly the header region and the declared
    /// body.
    pub fn from_bytes(buffer: Vec<u8>) -> Result<Self, ProxyError> {
        let header_len = find_terminator(&buffer)
            .map(|pos| pos + HEADER_TERMINATOR.len())
            .ok_or_else(|| ProxyError::Parse("missing header terminator".to_string()))?;
        let (header_line, headers) = parse_head(&buffer[..header_len])?;
        let declared = declared_body_len(&headers, u64::MAX)?;
        let actual = (buffer.len() - header_len) as u64;
        if actual != declared {
            return Err(ProxyError::Framing(format!(
                "body is {actual} bytes but Content-Length is {declared}"
            )));
        }
        let mut message = Message {
            header_line,
            headers,
            body: Body::Empty,
        };
        if actual > 0 {
            let mut buffer = buffer;
            let body = buffer.split_off(header_len);
            message.body = Body::Bytes(body);
        }
        message.reconcile_content_length();
        Ok(message)
    }
}

/// Incrementally read one message. Each read is bounded by the
/// keep-alive deadline; EOF surfaces as a peer close. The header
/// region is capped before parsing, the declared body length after.
pub async fn read_message<S>(stream: &mut S, limits: &ReadLimits) -> Result<Message, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer: Vec<u8> = Vec::with_capacity(CHUNK_SIZE);
    let mut chunk = [0u8; CHUNK_SIZE];

    let header_len = loop {
        if let Some(pos) = find_terminator(&buffer) {
            break pos + HEADER_TERMINATOR.len();
        }
        if buffer.len() > limits.max_header_bytes {
            return Err(ProxyError::HeaderTooLarge(limits.max_header_bytes));
        }
        let read = read_chunk(stream, &mut chunk, limits.keep_alive).await?;
        buffer.extend_from_slice(&chunk[..read]);
    };
    if header_len > limits.max_header_bytes {
        return Err(ProxyError::HeaderTooLarge(limits.max_header_bytes));
    }

    let (header_line, mut headers) = parse_head(&buffer[..header_len])?;
    let body_len = declared_body_len(&headers, limits.max_body_bytes)?;
    if !headers.contains(CONTENT_LENGTH) {
        headers.set(CONTENT_LENGTH, "0");
    }

    let total = header_len as u64 + body_len;
    if (buffer.len() as u64) > total {
        return Err(ProxyError::Framing(format!(
            "{} bytes past the declared message end",
            buffer.len() as u64 - total
        )));
    }
    while (buffer.len() as u64) < total {
        let remaining = total - buffer.len() as u64;
        let want = CHUNK_SIZE.min(remaining as usize);
        let read = read_chunk(stream, &mut chunk[..want], limits.keep_alive).await?;
        buffer.extend_from_slice(&chunk[..read]);
    }

    let body = buffer.split_off(header_len);
    Ok(Message {
        header_line,
        headers,
        body: if body.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(body)
        },
    })
}

async fn read_chunk<S>(
    stream: &mut S,
    chunk: &mut [u8],
    keep_alive: Duration,
) -> Result<usize, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let read = timeout(keep_alive, stream.read(chunk))
        .await
        .map_err(|_| ProxyError::IdleTimeout)??;
    if read == 0 {
        return Err(ProxyError::PeerClosed);
    }
    Ok(read)
}

fn find_terminator(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

/// Split the header region into the header line and the header table.
/// Lines without a colon are skipped; values are left-trimmed; empty
/// names are dropped; duplicates collapse last-write-wins.
fn parse_head(region: &[u8]) -> Result<(String, HeaderTable), ProxyError> {
    let text = std::str::from_utf8(region)
        .map_err(|_| ProxyError::Parse("header region is not valid UTF-8".to_string()))?;
    let mut lines = text.split("\r\n");
    let header_line = lines
        .next()
        .map(|line| line.to_string())
        .unwrap_or_default();
    if header_line.is_empty() {
        return Err(ProxyError::Parse("empty header line".to_string()));
    }

    let mut headers = HeaderTable::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        if name.is_empty() {
            continue;
        }
        headers.set(name, value.trim_start());
    }
    Ok((header_line, headers))
}

fn declared_body_len(headers: &HeaderTable, max_body_bytes: u64) -> Result<u64, ProxyError> {
    let Some(value) = headers.get(CONTENT_LENGTH) else {
        return Ok(0);
    };
    let len: u64 = value
        .trim()
        .parse()
        .map_err(|_| ProxyError::Parse(format!("invalid Content-Length '{value}'")))?;
    if len > max_body_bytes {
        return Err(ProxyError::BodyTooLarge(len));
    }
    Ok(len)
}
