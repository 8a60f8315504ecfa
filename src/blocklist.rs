use std::collections::HashSet;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;

use tokio::net::lookup_host;
use tracing::{debug, info, warn};

use crate::proxy::error::ProxyError;

/// Deny list of origin hosts, held as the IPv4 addresses they resolved
/// to at load time. Immutable after construction and shared read-only
/// across workers.
#[derive(Debug, Default)]
pub struct Blocklist {
    addrs: HashSet<Ipv4Addr>,
}

impl Blocklist {
    /// Load a blocklist file: one hostname or IPv4 literal per line,
    /// blank lines and `#` comments skipped. Hostnames are resolved
    /// eagerly; lines that fail to resolve are warned about and
    /// dropped. A missing file yields an empty blocklist.
    pub async fn load(path: &Path) -> Self {
        let contents = match tokio::fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "blocklist not loaded; all hosts allowed");
                return Self::default();
            }
        };

        let mut addrs = HashSet::new();
        for line in contents.lines() {
            let entry = line.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            match resolve_ipv4(entry).await {
                Ok(resolved) => {
                    for addr in resolved {
                        addrs.insert(addr);
                    }
                }
                Err(err) => {
                    warn!(entry, error = %err, "skipping unresolvable blocklist entry");
                }
            }
        }
        info!(entries = addrs.len(), path = %path.display(), "blocklist loaded");
        Self { addrs }
    }

    /// True iff `host` resolves to an address on the list.
    pub async fn check(&self, host: &str) -> Result<bool, ProxyError> {
        if self.addrs.is_empty() {
            return Ok(false);
        }
        let resolved = resolve_ipv4(host)
            .await
            .map_err(|_| ProxyError::Dns(host.to_string()))?;
        let blocked = resolved.iter().any(|addr| self.addrs.contains(addr));
        if blocked {
            debug!(host, "host matched blocklist");
        }
        Ok(blocked)
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Resolve a hostname or dotted-quad literal to its IPv4 addresses.
async fn resolve_ipv4(host: &str) -> std::io::Result<Vec<Ipv4Addr>> {
    if let Ok(literal) = host.parse::<Ipv4Addr>() {
        return Ok(vec![literal]);
    }
    let addrs = lookup_host((host, 0u16)).await?;
    let mut seen = HashSet::new();
    let mut unique = Vec::new();
    for addr in addrs {
        if let SocketAddr::V4(v4) = addr {
            if seen.insert(*v4.ip()) {
                unique.push(*v4.ip());
            }
        } else if let IpAddr::V6(v6) = addr.ip()
            && let Some(mapped) = v6.to_ipv4_mapped()
            && seen.insert(mapped)
        {
            unique.push(mapped);
        }
    }
    if unique.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("no IPv4 addresses for '{host}'"),
        ));
    }
    Ok(unique)
}
