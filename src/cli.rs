use clap::Parser;

/// Command line interface for the proxy binary.
///
/// The positional grammar is `wirecache <port> <cache_ttl_seconds>
/// [<prefetch_depth>] [-v]`. The prefetch depth is accepted for
/// compatibility with older deployments but has no effect.
#[derive(Debug, Clone, Parser)]
#[command(name = "wirecache", about = "Caching forward HTTP/1.1 proxy")]
pub struct Cli {
    /// TCP port to listen on.
    #[arg(value_parser = clap::value_parser!(u16).range(1..))]
    pub port: u16,

    /// Cache time-to-live in seconds.
    #[arg(value_parser = clap::value_parser!(u64).range(1..))]
    pub cache_ttl: u64,

    /// Link prefetch depth (accepted, currently ignored).
    pub prefetch_depth: Option<u32>,

    /// Enable verbose logging on stderr.
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}
