use std::net::SocketAddr;

use log::{debug, warn};

use crate::dns_header::ResponseCode;
use crate::dns_message::DnsMessage;
use crate::dns_question_and_answer::{DnsAnswer, DnsQuestion};
use crate::error::DnsError;
use crate::forwarder::Forwarder;
use crate::local::{Lookup, StaticTable};

/// Opcode of a standard query
const OPCODE_QUERY: u8 = 0;

/// How a question gets answered
#[derive(Debug)]
pub enum Strategy<'a> {
    /// Answer from the static table, possibly with no records (NODATA)
    Local(Vec<DnsAnswer>),
    /// Relay the query to the upstream resolver
    Forward(&'a Forwarder),
}

/// Picks a strategy per query and turns its outcome into a response
pub struct Router {
    table: StaticTable,
    forwarder: Option<Forwarder>,
}

impl Router {
    pub fn new(table: StaticTable, forwarder: Option<Forwarder>) -> Self {
        Router { table, forwarder }
    }

    pub fn static_records(&self) -> usize {
        self.table.len()
    }

    /// Static entries win; everything else goes upstream when an upstream
    /// is configured
    pub fn select(&self, question: &DnsQuestion) -> Result<Strategy<'_>, DnsError> {
        match self.table.lookup(question) {
            Lookup::Found(answers) => Ok(Strategy::Local(answers)),
            lookup => match &self.forwarder {
                Some(forwarder) => Ok(Strategy::Forward(forwarder)),
                None if lookup == Lookup::NoData => Ok(Strategy::Local(Vec::new())),
                None => Err(DnsError::NameError(question.name.clone())),
            },
        }
    }

    /// Build the response for a decoded query. Returns `None` when the
    /// packet has to be dropped instead of answered.
    pub fn route(&self, query: &DnsMessage, client: SocketAddr) -> Option<DnsMessage> {
        // Never answer a response
        if query.header.flags.qr {
            debug!("dropping response packet id {} from {}", query.header.id, client);
            return None;
        }

        if query.header.flags.opcode != OPCODE_QUERY {
            debug!("opcode {} from {} is not implemented", query.header.flags.opcode, client);
            return Some(self.respond(query, ResponseCode::NotImp));
        }

        if query.questions.is_empty() {
            return Some(self.respond(query, ResponseCode::FormErr));
        }

        match self.resolve(query, client) {
            Ok(response) => Some(response),
            Err(DnsError::NameError(name)) => {
                debug!("{} does not exist", name);
                Some(self.respond(query, ResponseCode::NxDomain))
            }
            Err(e) => {
                warn!("failed to resolve query id {} from {}: {}", query.header.id, client, e);
                Some(self.respond(query, e.rcode()))
            }
        }
    }

    fn resolve(&self, query: &DnsMessage, client: SocketAddr) -> Result<DnsMessage, DnsError> {
        let question = query
            .questions
            .first()
            .ok_or(DnsError::MalformedPacket("query has no question"))?;

        match self.select(question)? {
            Strategy::Local(answers) => {
                debug!(
                    "answering {} type {} locally with {} record(s)",
                    question.name,
                    question.qtype,
                    answers.len()
                );
                let mut response = self.respond(query, ResponseCode::NoError);
                response.header.flags.aa = true;
                response.set_answers(answers);
                Ok(response)
            }
            Strategy::Forward(forwarder) => forwarder.forward(query, client),
        }
    }

    /// Locally built response; recursion is available only with an upstream
    fn respond(&self, query: &DnsMessage, rcode: ResponseCode) -> DnsMessage {
        let mut response = DnsMessage::response_to(query, rcode);
        response.header.flags.ra = self.forwarder.is_some();
        response
    }
}
