mod config;
mod dns_header;
mod dns_message;
mod dns_question_and_answer;
mod error;
mod forwarder;
mod local;
mod router;
mod server;

use anyhow::Result;
use clap::Parser;
use log::info;

use config::{Args, ServerConfig};
use server::DnsServer;

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::try_from(Args::parse())?;

    match config.upstream {
        Some(upstream) => info!(
            "Using resolver: {} (timeout {:?})",
            upstream, config.upstream_timeout
        ),
        None => info!("Forwarding disabled, answering from the static table only"),
    }

    let server = DnsServer::new(&config)?;
    info!(
        "Listening on {} with {} static record(s)",
        server.local_addr()?,
        server.static_records()
    );

    server.run();

    Ok(())
}
