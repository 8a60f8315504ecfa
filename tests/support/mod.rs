#![allow(dead_code)]

mod origin;
mod proxy;

pub use origin::*;
pub use proxy::*;

use std::net::SocketAddr;

use anyhow::{Result, anyhow};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Send one raw request to the proxy and collect everything it writes
/// back until it closes the connection.
pub async fn send_request(proxy: SocketAddr, raw: &str) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect(proxy).await?;
    stream.write_all(raw.as_bytes()).await?;
    let mut response = Vec::new();
    stream.read_to_end(&mut response).await?;
    Ok(response)
}

/// Split a raw response into its header region and body.
pub fn split_response(raw: &[u8]) -> Result<(String, Vec<u8>)> {
    let pos = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("response has no header terminator"))?;
    let head = String::from_utf8(raw[..pos].to_vec())?;
    Ok((head, raw[pos + 4..].to_vec()))
}

pub fn status_line(head: &str) -> &str {
    head.lines().next().unwrap_or_default()
}

/// Extract a header value from a serialized header region.
pub fn header_value<'a>(head: &'a str, name: &str) -> Option<&'a str> {
    head.lines().skip(1).find_map(|line| {
        let (line_name, value) = line.split_once(':')?;
        line_name
            .eq_ignore_ascii_case(name)
            .then_some(value.trim_start())
    })
}
