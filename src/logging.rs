use std::net::IpAddr;
use std::time::Duration;

use anyhow::{Result, anyhow};
use http::StatusCode;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_FILTER: &str = "info";
const VERBOSE_FILTER: &str = "debug";

/// Install the global stderr logger. `RUST_LOG` overrides the level
/// chosen by the `-v` flag.
pub fn init_logger(verbose: bool) -> Result<()> {
    let fallback = if verbose {
        VERBOSE_FILTER
    } else {
        DEFAULT_FILTER
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    fmt::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .try_init()
        .map_err(|err| anyhow!(err))
}

/// One line per proxied request, emitted after the response (or the
/// synthesized error) has been written to the client.
#[derive(Debug, Clone)]
pub struct AccessLogEvent {
    pub client_ip: IpAddr,
    pub method: String,
    pub host: String,
    pub path: String,
    pub status: u16,
    pub cache: &'static str,
    pub bytes_out: u64,
    pub elapsed_ms: u128,
}

#[derive(Debug)]
pub struct AccessLogBuilder {
    event: AccessLogEvent,
}

impl AccessLogBuilder {
    pub fn new(client_ip: IpAddr) -> Self {
        Self {
            event: AccessLogEvent {
                client_ip,
                method: String::new(),
                host: String::new(),
                path: String::new(),
                status: 0,
                cache: "none",
                bytes_out: 0,
                elapsed_ms: 0,
            },
        }
    }

    pub fn method(mut self, method: impl Into<String>) -> Self {
        self.event.method = method.into();
        self
    }

    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.event.host = host.into();
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.event.path = path.into();
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.event.status = status.as_u16();
        self
    }

    pub fn cache(mut self, cache: &'static str) -> Self {
        self.event.cache = cache;
        self
    }

    pub fn bytes_out(mut self, bytes: u64) -> Self {
        self.event.bytes_out = bytes;
        self
    }

    pub fn elapsed(mut self, elapsed: Duration) -> Self {
        self.event.elapsed_ms = elapsed.as_millis();
        self
    }

    pub fn log(self) {
        let AccessLogEvent {
            client_ip,
            method,
            host,
            path,
            status,
            cache,
            bytes_out,
            elapsed_ms,
        } = self.event;
        tracing::info!(
            target: "access_log",
            client_ip = %client_ip,
            method,
            host,
            path,
            status,
            cache,
            bytes_out,
            elapsed_ms,
        );
    }
}
