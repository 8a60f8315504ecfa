use http::StatusCode;
use thiserror::Error;

/// Error kinds the pipeline distinguishes. Each maps to the status code
/// surfaced to the client via [`ProxyError::status`]; intake-side
/// timeouts and peer closes are handled silently by the worker instead.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed message: {0}")]
    Parse(String),
    #[error("header region exceeds {0} bytes")]
    HeaderTooLarge(usize),
    #[error("declared body length {0} exceeds limit")]
    BodyTooLarge(u64),
    #[error("message framing error: {0}")]
    Framing(String),
    #[error("connection idle past keep-alive deadline")]
    IdleTimeout,
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("failed to resolve host '{0}'")]
    Dns(String),
    #[error("failed to connect to {0}")]
    Connect(String),
    #[error("host '{0}' is blocked")]
    BlockedHost(String),
    #[error("origin fetch failed: {0}")]
    FetchFailed(String),
    #[error("cache I/O error: {0}")]
    CacheIo(String),
}

impl ProxyError {
    /// Status code for the synthesized error response.
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::Parse(_)
            | ProxyError::HeaderTooLarge(_)
            | ProxyError::BodyTooLarge(_)
            | ProxyError::Framing(_) => StatusCode::BAD_REQUEST,
            ProxyError::BlockedHost(_) => StatusCode::FORBIDDEN,
            ProxyError::Dns(_)
            | ProxyError::Connect(_)
            | ProxyError::FetchFailed(_)
            | ProxyError::CacheIo(_) => StatusCode::GATEWAY_TIMEOUT,
            ProxyError::IdleTimeout | ProxyError::PeerClosed | ProxyError::Transport(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// True when the client went away (or never spoke) and no response
    /// should be written at all.
    pub fn is_silent_close(&self) -> bool {
        matches!(self, ProxyError::IdleTimeout | ProxyError::PeerClosed)
    }
}
