use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use log::{debug, error, warn};
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::ServerConfig;
use crate::dns_header::{DnsHeader, ResponseCode};
use crate::dns_message::{DnsMessage, MAX_UDP_PAYLOAD};
use crate::forwarder::Forwarder;
use crate::local::StaticTable;
use crate::router::Router;

/// Workers allowed to run at once unless configured otherwise
pub const DEFAULT_MAX_WORKERS: usize = 256;

/// DNS Server that handles incoming DNS requests
pub struct DnsServer {
    socket: Arc<UdpSocket>,
    router: Arc<Router>,
    active_workers: Arc<AtomicUsize>,
    max_workers: usize,
}

impl DnsServer {
    /// Bind the listening socket and build the resolution pipeline
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let table = StaticTable::from_records(config.ttl, &config.records)
            .context("Invalid static record")?;
        let forwarder = config
            .upstream
            .map(|upstream| Forwarder::new(upstream, config.upstream_timeout));

        let server = Self::with_router(config.bind_addr, Router::new(table, forwarder))
            .with_context(|| format!("Failed to bind to {}", config.bind_addr))?;
        Ok(server.with_worker_limit(config.max_workers))
    }

    /// Bind `bind_addr` and answer with `router`
    pub fn with_router(bind_addr: SocketAddr, router: Router) -> io::Result<Self> {
        let socket = bind_reusable(bind_addr)?;
        Ok(Self {
            socket: Arc::new(socket),
            router: Arc::new(router),
            active_workers: Arc::new(AtomicUsize::new(0)),
            max_workers: DEFAULT_MAX_WORKERS,
        })
    }

    /// Cap the number of datagrams handled at once. Past the cap, queries
    /// are answered with SERVFAIL straight from the receive loop.
    pub fn with_worker_limit(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers;
        self
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn static_records(&self) -> usize {
        self.router.static_records()
    }

    /// Run the DNS server main loop
    /// Every datagram is handled on its own thread, so a slow upstream only
    /// delays the client that asked for it. At most `max_workers` threads
    /// run at once.
    pub fn run(&self) {
        let mut buf = [0u8; MAX_UDP_PAYLOAD];

        loop {
            let (size, source) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) => {
                    // e.g. ICMP port unreachable reported for an earlier send
                    error!("Error receiving data: {}", e);
                    continue;
                }
            };
            debug!("Received {} bytes from {}", size, source);

            let Some(slot) = WorkerSlot::acquire(&self.active_workers, self.max_workers) else {
                warn!("{} workers busy, refusing query from {}", self.max_workers, source);
                if let Some(response) = overloaded_response(&buf[..size]) {
                    send_response(&self.socket, &response, source);
                }
                continue;
            };

            let packet = buf[..size].to_vec();
            let socket = Arc::clone(&self.socket);
            let router = Arc::clone(&self.router);

            let spawned = thread::Builder::new()
                .name("dns-query".to_string())
                .spawn(move || {
                    let _slot = slot;
                    handle_datagram(&socket, &router, &packet, source)
                });
            if let Err(e) = spawned {
                warn!("Could not spawn worker for {}: {}", source, e);
            }
        }
    }
}

/// Bind a UDP socket with address (and, where supported, port) reuse, so a
/// restarted server does not trip over the previous one
fn bind_reusable(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(not(any(target_os = "illumos", target_os = "solaris", windows)))]
    socket.set_reuse_port(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// One running worker; the count goes back down when the slot is dropped
struct WorkerSlot {
    active: Arc<AtomicUsize>,
}

impl WorkerSlot {
    fn acquire(active: &Arc<AtomicUsize>, max: usize) -> Option<Self> {
        active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(WorkerSlot {
            active: Arc::clone(active),
        })
    }
}

impl Drop for WorkerSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

fn handle_datagram(socket: &UdpSocket, router: &Router, packet: &[u8], source: SocketAddr) {
    if let Some(response) = handle_request(router, packet, source) {
        send_response(socket, &response, source);
    }
}

fn send_response(socket: &UdpSocket, response: &[u8], source: SocketAddr) {
    if let Err(e) = socket.send_to(response, source) {
        error!("Failed to send response to {}: {}", source, e);
    }
}

/// SERVFAIL for a query that could not get a worker. Responses and packets
/// without a full header get nothing.
fn overloaded_response(packet: &[u8]) -> Option<Vec<u8>> {
    let response = match DnsMessage::decode(packet) {
        Ok(query) if !query.header.flags.qr => {
            DnsMessage::response_to(&query, ResponseCode::ServFail)
        }
        Ok(_) => return None,
        Err(_) => {
            let header = DnsHeader::from_bytes(packet).ok()?;
            if header.flags.qr {
                return None;
            }
            DnsMessage::error_response(&header, ResponseCode::ServFail)
        }
    };
    encode_or_servfail(&response)
}

/// Handle a DNS request: parse, resolve, and build response
/// Returns `None` when nothing should be sent back
pub fn handle_request(router: &Router, packet: &[u8], source: SocketAddr) -> Option<Vec<u8>> {
    let query = match DnsMessage::decode(packet) {
        Ok(query) => query,
        Err(e) => {
            warn!("Malformed packet from {}: {}", source, e);
            // Without a complete header there is no id to answer to
            let header = DnsHeader::from_bytes(packet).ok()?;
            if header.flags.qr {
                return None;
            }
            let response = DnsMessage::error_response(&header, ResponseCode::ServFail);
            return encode_or_servfail(&response);
        }
    };

    let response = router.route(&query, source)?;
    encode_or_servfail(&response)
}

fn encode_or_servfail(response: &DnsMessage) -> Option<Vec<u8>> {
    match response.encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!("Could not encode response id {}: {}", response.header.id, e);
            DnsMessage::error_response(&response.header, ResponseCode::ServFail)
                .encode()
                .ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use super::*;
    use crate::dns_header::HEADER_LEN;
    use crate::dns_question_and_answer::{DnsQuestion, RecordType};
    use crate::local::DEFAULT_TTL;

    /// Start a static-only server on an ephemeral loopback port
    fn start_server() -> SocketAddr {
        let router = Router::new(StaticTable::with_defaults(DEFAULT_TTL), None);
        let server = DnsServer::with_router("127.0.0.1:0".parse().unwrap(), router).unwrap();
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.run());
        addr
    }

    fn client_socket() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        socket
    }

    fn exchange(server: SocketAddr, packet: &[u8]) -> io::Result<Vec<u8>> {
        let socket = client_socket();
        socket.send_to(packet, server)?;
        let mut buf = [0u8; 1024];
        let (size, _) = socket.recv_from(&mut buf)?;
        Ok(buf[..size].to_vec())
    }

    #[test]
    fn test_google_query_over_udp() {
        let server = start_server();
        let query = DnsMessage::query(0x5151, DnsQuestion::new("google.com", RecordType::A));

        let bytes = exchange(server, &query.encode().unwrap()).unwrap();
        let response = DnsMessage::decode(&bytes).unwrap();

        assert_eq!(response.header.id, 0x5151);
        assert!(response.header.flags.qr);
        assert!(!response.header.flags.tc);
        assert_eq!(response.rcode(), ResponseCode::NoError.to_u8());
        assert_eq!(response.header.question_count, 1);
        assert_eq!(response.header.answer_count, 1);
        assert_eq!(response.header.authority_count, 0);
        assert_eq!(response.header.additional_count, 0);
        assert_eq!(response.answers[0].name, "google.com");
        assert_eq!(response.answers[0].ipv4(), Some(Ipv4Addr::new(8, 8, 8, 8)));

        // nothing trailing after the last record
        assert_eq!(response.encode().unwrap(), bytes);
    }

    #[test]
    fn test_garbage_body_gets_servfail() {
        let server = start_server();
        let mut packet = vec![0x77, 0x88, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0];
        // pointer to itself
        packet.extend([0xC0, 0x0C, 0, 1, 0, 1]);

        let bytes = exchange(server, &packet).unwrap();
        let response = DnsMessage::decode(&bytes).unwrap();

        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(response.header.id, 0x7788);
        assert_eq!(response.rcode(), ResponseCode::ServFail.to_u8());
        assert!(response.questions.is_empty());
    }

    #[test]
    fn test_short_packet_is_dropped_and_server_keeps_running() {
        let server = start_server();

        let dropped = exchange(server, &[0x01, 0x02, 0x03]);
        assert!(dropped.is_err());

        let query = DnsMessage::query(2, DnsQuestion::new("google.com", RecordType::A));
        let bytes = exchange(server, &query.encode().unwrap()).unwrap();
        assert_eq!(DnsMessage::decode(&bytes).unwrap().header.id, 2);
    }

    #[test]
    fn test_busy_server_answers_servfail() {
        let router = Router::new(StaticTable::with_defaults(DEFAULT_TTL), None);
        let server = DnsServer::with_router("127.0.0.1:0".parse().unwrap(), router)
            .unwrap()
            .with_worker_limit(0);
        let addr = server.local_addr().unwrap();
        thread::spawn(move || server.run());

        let query = DnsMessage::query(0x0B0B, DnsQuestion::new("google.com", RecordType::A));
        let bytes = exchange(addr, &query.encode().unwrap()).unwrap();
        let response = DnsMessage::decode(&bytes).unwrap();

        assert_eq!(response.header.id, 0x0B0B);
        assert_eq!(response.rcode(), ResponseCode::ServFail.to_u8());
        assert_eq!(response.questions, query.questions);
        assert!(response.answers.is_empty());
    }

    #[test]
    fn test_worker_slots_are_bounded_and_released() {
        let active = Arc::new(AtomicUsize::new(0));

        let first = WorkerSlot::acquire(&active, 2).unwrap();
        let second = WorkerSlot::acquire(&active, 2).unwrap();
        assert!(WorkerSlot::acquire(&active, 2).is_none());
        assert_eq!(active.load(Ordering::Acquire), 2);

        drop(first);
        let third = WorkerSlot::acquire(&active, 2);
        assert!(third.is_some());

        drop((second, third));
        assert_eq!(active.load(Ordering::Acquire), 0);
    }

    #[test]
    fn test_overloaded_response_skips_responses() {
        let mut reply = DnsMessage::query(1, DnsQuestion::new("google.com", RecordType::A));
        reply.header.flags.qr = true;

        assert!(overloaded_response(&reply.encode().unwrap()).is_none());
        assert!(overloaded_response(&[0, 1, 2]).is_none());
    }

    #[test]
    fn test_handle_request_drops_malformed_responses() {
        let router = Router::new(StaticTable::with_defaults(DEFAULT_TTL), None);
        let source: SocketAddr = "127.0.0.1:9".parse().unwrap();
        // QR set and a truncated body
        let packet = [0, 1, 0x80, 0, 0, 1, 0, 0, 0, 0, 0, 0, 3, b'c'];

        assert!(handle_request(&router, &packet, source).is_none());
    }

    #[test]
    fn test_handle_request_unknown_name_is_nxdomain() {
        let router = Router::new(StaticTable::with_defaults(DEFAULT_TTL), None);
        let source: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let query = DnsMessage::query(44, DnsQuestion::new("unknown.test", RecordType::A));

        let bytes = handle_request(&router, &query.encode().unwrap(), source).unwrap();
        let response = DnsMessage::decode(&bytes).unwrap();
        assert_eq!(response.rcode(), ResponseCode::NxDomain.to_u8());
        assert_eq!(response.questions, query.questions);
    }
}
