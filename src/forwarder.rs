use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;
use rand::Rng;

use crate::dns_header::ResponseCode;
use crate::dns_message::{DnsMessage, MAX_UDP_PAYLOAD};
use crate::dns_question_and_answer::DnsQuestion;
use crate::error::DnsError;

/// Default upstream DNS server
pub const DEFAULT_UPSTREAM: &str = "8.8.8.8:53";
/// How long a forwarded query may wait for its reply
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);

/// Random ids tried before falling back to a scan of the id space
const RANDOM_ID_ATTEMPTS: usize = 64;

/// Lifecycle of one forwarded query: `Sent` -> `Answered` | `TimedOut`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    Sent,
    Answered,
    TimedOut,
}

/// Correlation entry for a query waiting on the upstream
#[derive(Debug, Clone)]
pub struct PendingForward {
    pub client: SocketAddr,
    pub original_id: u16,
    pub state: ForwardState,
    pub sent_at: Instant,
}

/// Upstream transaction id -> pending forward
type InFlightTable = Mutex<HashMap<u16, PendingForward>>;

/// Forwards queries to an upstream resolver over UDP
#[derive(Debug)]
pub struct Forwarder {
    upstream: SocketAddr,
    timeout: Duration,
    in_flight: Arc<InFlightTable>,
}

impl Forwarder {
    pub fn new(upstream: SocketAddr, timeout: Duration) -> Self {
        Forwarder {
            upstream,
            timeout,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of forwards still waiting on the upstream
    pub fn in_flight(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Send the first question of `query` upstream and wait for the reply.
    /// The reply is returned as received, with the client's transaction id
    /// and RD bit put back.
    pub fn forward(
        &self,
        query: &DnsMessage,
        client: SocketAddr,
    ) -> Result<DnsMessage, DnsError> {
        let question = query
            .questions
            .first()
            .ok_or(DnsError::MalformedPacket("query has no question"))?;

        let entry = self.register(client, query.header.id)?;
        let request = DnsMessage::query(entry.upstream_id, question.clone()).encode()?;

        let socket = self.bind_socket().map_err(|e| self.unreachable(e))?;
        socket
            .send_to(&request, self.upstream)
            .map_err(|e| self.unreachable(e))?;
        debug!(
            "forwarded {} for {} to {} as id {} ({} in flight)",
            question.name,
            client,
            self.upstream,
            entry.upstream_id,
            self.in_flight()
        );

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; MAX_UDP_PAYLOAD];

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                entry.finish(ForwardState::TimedOut);
                return Err(DnsError::UpstreamTimeout {
                    upstream: self.upstream,
                    timeout: self.timeout,
                });
            }

            socket
                .set_read_timeout(Some(remaining))
                .map_err(|e| self.unreachable(e))?;

            let (size, source) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if is_timeout(&e) => continue,
                Err(e) => return Err(self.unreachable(e)),
            };

            if source != self.upstream {
                debug!("ignoring datagram from {} while waiting on {}", source, self.upstream);
                continue;
            }

            let mut reply = match DnsMessage::decode(&buf[..size]) {
                Ok(reply) => reply,
                // A broken reply only counts if it carries our id
                Err(e) if buf[..size].starts_with(&entry.upstream_id.to_be_bytes()) => {
                    warn!("upstream {} sent a malformed reply: {}", self.upstream, e);
                    return Err(e);
                }
                Err(_) => continue,
            };

            if reply.header.id != entry.upstream_id
                || !reply.header.flags.qr
                || !answers_question(&reply, question)
            {
                debug!("ignoring unrelated reply id {} from {}", reply.header.id, source);
                continue;
            }

            if let Some(rcode) = ResponseCode::from_u8(reply.rcode()) {
                debug!("upstream answered {} with {:?}", question.name, rcode);
            }
            reply.header.id = query.header.id;
            reply.header.flags.rd = query.header.flags.rd;
            entry.finish(ForwardState::Answered);
            return Ok(reply);
        }
    }

    fn bind_socket(&self) -> io::Result<UdpSocket> {
        let local = if self.upstream.is_ipv4() {
            "0.0.0.0:0"
        } else {
            "[::]:0"
        };
        UdpSocket::bind(local)
    }

    fn unreachable(&self, source: io::Error) -> DnsError {
        DnsError::UpstreamUnreachable {
            upstream: self.upstream,
            source,
        }
    }

    /// Reserve an upstream id that no other in-flight query uses
    fn register(&self, client: SocketAddr, original_id: u16) -> Result<InFlightEntry, DnsError> {
        let mut table = self.in_flight.lock();
        if table.len() > u16::MAX as usize {
            return Err(DnsError::InFlightExhausted);
        }

        let mut rng = rand::thread_rng();
        let mut upstream_id = rng.gen::<u16>();
        let mut attempts = 0;
        while table.contains_key(&upstream_id) {
            attempts += 1;
            upstream_id = if attempts < RANDOM_ID_ATTEMPTS {
                rng.gen()
            } else {
                upstream_id.wrapping_add(1)
            };
        }

        table.insert(
            upstream_id,
            PendingForward {
                client,
                original_id,
                state: ForwardState::Sent,
                sent_at: Instant::now(),
            },
        );

        Ok(InFlightEntry {
            table: Arc::clone(&self.in_flight),
            upstream_id,
        })
    }
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

fn answers_question(reply: &DnsMessage, question: &DnsQuestion) -> bool {
    reply.questions.first().map_or(false, |echoed| {
        echoed.qtype == question.qtype
            && echoed.qclass == question.qclass
            && echoed.name.eq_ignore_ascii_case(&question.name)
    })
}

/// Holds a slot in the in-flight table; the slot is released on drop, so
/// every exit path of a forward cleans up
struct InFlightEntry {
    table: Arc<InFlightTable>,
    upstream_id: u16,
}

impl InFlightEntry {
    fn finish(&self, state: ForwardState) {
        if let Some(pending) = self.table.lock().get_mut(&self.upstream_id) {
            pending.state = state;
            debug!(
                "forward {} -> {} for {} {:?} after {:?}",
                self.upstream_id,
                pending.original_id,
                pending.client,
                pending.state,
                pending.sent_at.elapsed()
            );
        }
    }
}

impl Drop for InFlightEntry {
    fn drop(&mut self) {
        self.table.lock().remove(&self.upstream_id);
    }
}
