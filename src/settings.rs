use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use crate::cli::Cli;

/// Read chunk size for the incremental message reader.
pub const CHUNK_SIZE: usize = 1024;

/// Largest accepted header region, terminator included.
pub const MAX_HEADER_BYTES: usize = 8192;

/// Largest accepted `Content-Length` value.
pub const MAX_BODY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Identifier advertised in the `Via` header.
pub const VIA_IDENTIFIER: &str = "wirecache";

fn default_keep_alive() -> Duration {
    Duration::from_millis(10_000)
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_blocklist_path() -> PathBuf {
    PathBuf::from("blocklist")
}

/// Runtime configuration. Built from the CLI for the binary; tests
/// construct it directly to shrink timeouts and redirect paths.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the supervisor listens on.
    pub listen: SocketAddr,
    /// Cache time-to-live in seconds.
    pub cache_ttl: u64,
    /// Idle timeout applied to every socket read, client or origin.
    pub keep_alive: Duration,
    /// Directory holding cached response files.
    pub cache_dir: PathBuf,
    /// Path to the blocklist file.
    pub blocklist_path: PathBuf,
    /// Largest accepted header region in bytes.
    pub max_header_bytes: usize,
    /// Largest accepted body in bytes.
    pub max_body_bytes: u64,
    /// Verbose stderr logging.
    pub verbose: bool,
}

impl Settings {
    pub fn from_cli(cli: &Cli) -> Self {
        Self {
            listen: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), cli.port),
            cache_ttl: cli.cache_ttl,
            keep_alive: default_keep_alive(),
            cache_dir: default_cache_dir(),
            blocklist_path: default_blocklist_path(),
            max_header_bytes: MAX_HEADER_BYTES,
            max_body_bytes: MAX_BODY_BYTES,
            verbose: cli.verbose,
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }
}
