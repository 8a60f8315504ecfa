use std::net::IpAddr;

use http::Method;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::debug;

use crate::settings::VIA_IDENTIFIER;

use super::error::ProxyError;
use super::http::Message;

const DEFAULT_PORT: u16 = 80;

/// Request-line grammar. Capture order is fixed: method, scheme, host,
/// port, path, query, version.
static REQUEST_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(GET)\s+(?:(https?)://)?([^/:?\s]+)?(?::([0-9]+))?([^ ?]*)(?:\?([^ ]*))?\s+(HTTP/[0-9]+(?:\.[0-9]+)?)\s*$",
    )
    .expect("request line regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Http,
    Https,
    Unknown,
}

impl Scheme {
    fn parse(capture: Option<&str>) -> Self {
        match capture {
            Some("http") => Scheme::Http,
            Some("https") => Scheme::Https,
            _ => Scheme::Unknown,
        }
    }
}

/// A client request: the parsed header line plus the underlying
/// message, which is rewritten in place before forwarding upstream.
#[derive(Debug)]
pub struct Request {
    pub message: Message,
    pub method: Method,
    pub scheme: Scheme,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub query: Option<String>,
    pub version: String,
}

impl Request {
    /// Parse the message's header line. The `Host` header supplies the
    /// host when the request line carries none, and takes precedence
    /// when both are present.
    pub fn parse(message: Message) -> Result<Self, ProxyError> {
        let captures = REQUEST_LINE
            .captures(&message.header_line)
            .ok_or_else(|| {
                ProxyError::Parse(format!("unrecognized request line '{}'", message.header_line))
            })?;

        let method = Method::GET;
        let scheme = Scheme::parse(captures.get(2).map(|m| m.as_str()));
        let mut host = captures.get(3).map(|m| m.as_str().to_string());
        let mut port = captures
            .get(4)
            .map(|m| m.as_str().parse::<u16>())
            .transpose()
            .map_err(|_| ProxyError::Parse("port out of range".to_string()))?;
        let path = match captures.get(5).map(|m| m.as_str()) {
            None | Some("") => "/".to_string(),
            Some(path) => path.to_string(),
        };
        let query = captures
            .get(6)
            .map(|m| m.as_str().to_string())
            .filter(|query| !query.is_empty());
        let version = captures
            .get(7)
            .map(|m| m.as_str().to_string())
            .unwrap_or_default();

        if let Some(header_value) = message.headers.get("Host") {
            let (header_host, header_port) = split_host_header(header_value)?;
            if let Some(uri_host) = host.as_deref()
                && uri_host != header_host
            {
                debug!(
                    uri_host,
                    header_host, "Host header disagrees with request line; header wins"
                );
            }
            host = Some(header_host.to_string());
            if header_port.is_some() {
                port = header_port;
            }
        }

        Ok(Self {
            message,
            method,
            scheme,
            host,
            port,
            path,
            query,
            version,
        })
    }

    pub fn port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// True iff this request may go through the cache: a `GET` with
    /// host, path, and version all known.
    pub fn is_cacheable(&self) -> bool {
        self.method == Method::GET
            && self.host.is_some()
            && !self.path.is_empty()
            && !self.version.is_empty()
    }

    /// Cache key: host and path concatenated with no separator. Empty
    /// means "do not cache".
    pub fn cache_key(&self) -> String {
        if !self.is_cacheable() {
            return String::new();
        }
        let mut key = self.host.clone().unwrap_or_default();
        key.push_str(&self.path);
        key
    }

    /// Apply the proxy header rewrite before the upstream send: force
    /// `Connection: close`, stamp the forwarding markers, strip the
    /// hop-by-hop `Proxy-*` headers, and pin `Host` to the parsed
    /// authority.
    pub fn rewrite_for_upstream(&mut self, client_ip: IpAddr) {
        let headers = &mut self.message.headers;
        headers.set("Connection", "close");
        headers.set("Forwarded", &client_ip.to_string());
        headers.set("Via", &format!("1.1 {VIA_IDENTIFIER}"));
        headers.remove("Proxy-Connection");
        headers.remove("Proxy-Authorization");
        headers.remove("Proxy-Authenticate");
        if let Some(host) = &self.host {
            let authority = match self.port {
                Some(port) if port != DEFAULT_PORT => format!("{host}:{port}"),
                _ => host.clone(),
            };
            headers.set("Host", &authority);
        }
    }
}

fn split_host_header(value: &str) -> Result<(&str, Option<u16>), ProxyError> {
    let value = value.trim();
    match value.split_once(':') {
        Some((host, port)) => {
            let port = port
                .parse::<u16>()
                .map_err(|_| ProxyError::Parse(format!("invalid Host header port '{port}'")))?;
            Ok((host, Some(port)))
        }
        None => Ok((value, None)),
    }
}
