use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::Parser;

use crate::dns_question_and_answer::name_labels;
use crate::forwarder::DEFAULT_UPSTREAM;
use crate::local::{StaticRecord, DEFAULT_TTL};
use crate::server::DEFAULT_MAX_WORKERS;

/// Port the server listens on unless told otherwise
pub const DEFAULT_BIND: &str = "0.0.0.0:2053";

#[derive(Parser, Debug)]
#[command(name = "server", about = "Small DNS server answering over UDP")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "DNS_BIND", default_value = DEFAULT_BIND)]
    pub bind: SocketAddr,

    /// Upstream DNS resolver address (e.g., 8.8.8.8:53)
    #[arg(long, env = "DNS_RESOLVER", default_value = DEFAULT_UPSTREAM)]
    pub resolver: SocketAddr,

    /// Only answer from the static table, never forward
    #[arg(long, env = "DNS_NO_FORWARD")]
    pub no_forward: bool,

    /// How long to wait for the upstream, in milliseconds
    #[arg(long, env = "DNS_TIMEOUT_MS", default_value_t = 3000)]
    pub timeout_ms: u64,

    /// Extra static A record, as NAME=IPV4 (repeatable)
    #[arg(
        long = "record",
        env = "DNS_RECORDS",
        value_delimiter = ',',
        value_parser = parse_record
    )]
    pub records: Vec<StaticRecord>,

    /// TTL of static answers, in seconds
    #[arg(long, env = "DNS_TTL", default_value_t = DEFAULT_TTL)]
    pub ttl: u32,

    /// Queries handled at once; further ones get SERVFAIL
    #[arg(long, env = "DNS_MAX_WORKERS", default_value_t = DEFAULT_MAX_WORKERS)]
    pub max_workers: usize,
}

/// Validated settings the server is built from
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub upstream: Option<SocketAddr>,
    pub upstream_timeout: Duration,
    pub ttl: u32,
    pub records: Vec<StaticRecord>,
    pub max_workers: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            bind_addr: ([0, 0, 0, 0], 2053).into(),
            upstream: Some(([8, 8, 8, 8], 53).into()),
            upstream_timeout: crate::forwarder::DEFAULT_TIMEOUT,
            ttl: DEFAULT_TTL,
            records: Vec::new(),
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

impl TryFrom<Args> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: Args) -> Result<Self> {
        if args.timeout_ms == 0 {
            return Err(anyhow!("--timeout-ms must be greater than zero"));
        }
        if args.max_workers == 0 {
            return Err(anyhow!("--max-workers must be greater than zero"));
        }

        Ok(ServerConfig {
            bind_addr: args.bind,
            upstream: (!args.no_forward).then_some(args.resolver),
            upstream_timeout: Duration::from_millis(args.timeout_ms),
            ttl: args.ttl,
            records: args.records,
            max_workers: args.max_workers,
        })
    }
}

/// Parse `NAME=IPV4`
fn parse_record(input: &str) -> Result<StaticRecord> {
    let (name, addr) = input
        .split_once('=')
        .ok_or_else(|| anyhow!("expected NAME=IPV4, got `{}`", input))?;

    let name = name.trim();
    if name_labels(name)?.is_empty() {
        return Err(anyhow!("record name must not be the root"));
    }
    let addr: Ipv4Addr = addr
        .trim()
        .parse()
        .with_context(|| format!("invalid IPv4 address in `{}`", input))?;

    Ok(StaticRecord::new(name, addr))
}
