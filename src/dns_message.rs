use bytes::{BufMut, BytesMut};

use crate::dns_header::{DnsFlags, DnsHeader, ResponseCode, HEADER_LEN};
use crate::dns_question_and_answer::{DnsAnswer, DnsQuestion, NameCompressor};
use crate::error::DnsError;

/// Classic DNS-over-UDP payload limit without EDNS0
pub const MAX_UDP_PAYLOAD: usize = 512;

/// Smallest possible question: root name + type + class
const MIN_QUESTION_LEN: usize = 5;
/// Smallest possible record: root name + type + class + ttl + rdlength
const MIN_RECORD_LEN: usize = 11;

/// A whole DNS message. Lives for the handling of a single datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsMessage {
    pub header: DnsHeader,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsAnswer>,
    pub authorities: Vec<DnsAnswer>,
    pub additionals: Vec<DnsAnswer>,
}

impl DnsMessage {
    /// A standard recursive query for a single question
    pub fn query(id: u16, question: DnsQuestion) -> Self {
        let flags = DnsFlags {
            rd: true,
            ..DnsFlags::default()
        };

        DnsMessage {
            header: DnsHeader {
                id,
                flags,
                question_count: 1,
                answer_count: 0,
                authority_count: 0,
                additional_count: 0,
            },
            questions: vec![question],
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    /// Response skeleton for `query`: echoes the ID, opcode, RD and the
    /// first question. Only the first question is ever answered.
    pub fn response_to(query: &DnsMessage, rcode: ResponseCode) -> Self {
        let questions: Vec<DnsQuestion> = query.questions.iter().take(1).cloned().collect();

        let mut response = Self::error_response(&query.header, rcode);
        response.header.question_count = questions.len() as u16;
        response.questions = questions;
        response
    }

    /// Response carrying only a header, for requests whose body could not be
    /// parsed
    pub fn error_response(request: &DnsHeader, rcode: ResponseCode) -> Self {
        let response_flags = DnsFlags {
            qr: true,                     // This is a response
            opcode: request.flags.opcode, // Echo opcode
            aa: false,
            tc: false,
            rd: request.flags.rd,         // Echo recursion desired
            ra: false,
            z: 0,
            rcode: rcode.to_u8(),
        };

        DnsMessage {
            header: DnsHeader {
                id: request.id,
                flags: response_flags,
                question_count: 0,
                answer_count: 0,
                authority_count: 0,
                additional_count: 0,
            },
            questions: Vec::new(),
            answers: Vec::new(),
            authorities: Vec::new(),
            additionals: Vec::new(),
        }
    }

    pub fn set_answers(&mut self, answers: Vec<DnsAnswer>) {
        self.header.answer_count = answers.len() as u16;
        self.answers = answers;
    }

    pub fn rcode(&self) -> u8 {
        self.header.flags.rcode
    }

    /// Parse a full message from a datagram
    pub fn decode(buf: &[u8]) -> Result<Self, DnsError> {
        let header = DnsHeader::from_bytes(buf)?;

        let claimed = header.question_count as usize * MIN_QUESTION_LEN
            + (header.answer_count as usize
                + header.authority_count as usize
                + header.additional_count as usize)
                * MIN_RECORD_LEN;
        if claimed > buf.len() - HEADER_LEN {
            return Err(DnsError::MalformedPacket(
                "section counts exceed the packet size",
            ));
        }

        let mut offset = HEADER_LEN;

        let mut questions = Vec::with_capacity(header.question_count as usize);
        for _ in 0..header.question_count {
            let (question, new_offset) = DnsQuestion::from_bytes(buf, offset)?;
            questions.push(question);
            offset = new_offset;
        }

        let answers = read_records(buf, &mut offset, header.answer_count)?;
        let authorities = read_records(buf, &mut offset, header.authority_count)?;
        let additionals = read_records(buf, &mut offset, header.additional_count)?;

        Ok(DnsMessage {
            header,
            questions,
            answers,
            authorities,
            additionals,
        })
    }

    /// Serialize the message. Header counts are taken from the sections.
    /// Records that would push the message past 512 bytes are left out,
    /// together with everything after them, and the TC bit is set.
    pub fn encode(&self) -> Result<Vec<u8>, DnsError> {
        let mut buf = BytesMut::with_capacity(MAX_UDP_PAYLOAD);
        buf.put_slice(&[0u8; HEADER_LEN]);

        let mut names = NameCompressor::new();
        let mut header = self.header;
        let mut truncated = false;

        let mut question_count = 0u16;
        for question in &self.questions {
            let written =
                write_limited(&mut buf, &mut names, |buf, names| question.write_to(buf, names))?;
            if !written {
                truncated = true;
                break;
            }
            question_count += 1;
        }

        let mut counts = [0u16; 3];
        let sections = [&self.answers, &self.authorities, &self.additionals];
        'sections: for (count, records) in counts.iter_mut().zip(sections) {
            for record in records {
                let written = !truncated
                    && write_limited(&mut buf, &mut names, |buf, names| {
                        record.write_to(buf, names)
                    })?;
                if !written {
                    truncated = true;
                    break 'sections;
                }
                *count += 1;
            }
        }

        header.question_count = question_count;
        header.answer_count = counts[0];
        header.authority_count = counts[1];
        header.additional_count = counts[2];
        header.flags.tc |= truncated;
        buf[..HEADER_LEN].copy_from_slice(&header.to_bytes());

        Ok(buf.to_vec())
    }
}

fn read_records(buf: &[u8], offset: &mut usize, count: u16) -> Result<Vec<DnsAnswer>, DnsError> {
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let (record, new_offset) = DnsAnswer::from_bytes(buf, *offset)?;
        records.push(record);
        *offset = new_offset;
    }
    Ok(records)
}

/// Run `write`, rolling the buffer and compression table back when the
/// result no longer fits in a UDP payload
fn write_limited<F>(
    buf: &mut BytesMut,
    names: &mut NameCompressor,
    write: F,
) -> Result<bool, DnsError>
where
    F: FnOnce(&mut BytesMut, &mut NameCompressor) -> Result<(), DnsError>,
{
    let mark = buf.len();
    let saved = names.clone();

    write(buf, names)?;

    if buf.len() > MAX_UDP_PAYLOAD {
        buf.truncate(mark);
        *names = saved;
        return Ok(false);
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;
    use crate::dns_question_and_answer::RecordType;

    fn a_record(name: &str, last_octet: u8) -> DnsAnswer {
        DnsAnswer::new_a_record(name.to_string(), 60, Ipv4Addr::new(10, 0, 0, last_octet))
    }

    #[test]
    fn test_message_roundtrip() {
        let query = DnsMessage::query(0xBEEF, DnsQuestion::new("Example.com", RecordType::A));
        let mut message = DnsMessage::response_to(&query, ResponseCode::NoError);
        message.set_answers(vec![a_record("Example.com", 1), a_record("Example.com", 2)]);
        message.authorities = vec![DnsAnswer::new(
            "com".to_string(),
            RecordType::NS.to_u16(),
            1,
            300,
            crate::dns_question_and_answer::encode_domain_name("a.gtld-servers.net").unwrap(),
        )];
        message.header.authority_count = 1;
        message.additionals = vec![a_record("a.gtld-servers.net", 3)];
        message.header.additional_count = 1;

        let bytes = message.encode().unwrap();
        let decoded = DnsMessage::decode(&bytes).unwrap();

        assert_eq!(decoded, message);
    }

    #[test]
    fn test_encode_compresses_repeated_names() {
        let query = DnsMessage::query(1, DnsQuestion::new("google.com", RecordType::A));
        let mut message = DnsMessage::response_to(&query, ResponseCode::NoError);
        message.set_answers(vec![a_record("google.com", 1)]);

        let bytes = message.encode().unwrap();

        // header + question (12 + 4) + answer with a 2 byte pointer (2 + 10 + 4)
        assert_eq!(bytes.len(), HEADER_LEN + 16 + 16);
        assert_eq!(&bytes[HEADER_LEN + 16..HEADER_LEN + 18], &[0xC0, 0x0C]);
    }

    #[test]
    fn test_header_counts_follow_sections() {
        let query = DnsMessage::query(7, DnsQuestion::new("google.com", RecordType::A));
        let mut message = DnsMessage::response_to(&query, ResponseCode::NoError);
        // stale count on purpose
        message.answers.push(a_record("google.com", 1));

        let bytes = message.encode().unwrap();
        let header = DnsHeader::from_bytes(&bytes).unwrap();

        assert_eq!(header.question_count, 1);
        assert_eq!(header.answer_count, 1);
        assert_eq!(header.authority_count, 0);
        assert_eq!(header.additional_count, 0);
    }

    #[test]
    fn test_short_buffers_are_malformed() {
        for len in 0..HEADER_LEN {
            let bytes = vec![0xFFu8; len];
            assert!(matches!(
                DnsMessage::decode(&bytes),
                Err(DnsError::MalformedPacket(_))
            ));
        }
    }

    #[test]
    fn test_counts_beyond_buffer_are_malformed() {
        let mut bytes = DnsMessage::query(9, DnsQuestion::new("google.com", RecordType::A))
            .encode()
            .unwrap();
        // claim 3 answers that are not there
        bytes[7] = 3;

        assert!(matches!(
            DnsMessage::decode(&bytes),
            Err(DnsError::MalformedPacket(_))
        ));

        let mut huge = vec![0u8; HEADER_LEN];
        huge[4] = 0xFF;
        huge[5] = 0xFF;
        assert!(matches!(
            DnsMessage::decode(&huge),
            Err(DnsError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_pointer_into_own_position_is_malformed() {
        let mut bytes = vec![0, 1, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0];
        // question name is a pointer to offset 12, i.e. itself
        bytes.extend([0xC0, 0x0C, 0, 1, 0, 1]);

        assert!(matches!(
            DnsMessage::decode(&bytes),
            Err(DnsError::MalformedPacket(_))
        ));
    }

    #[test]
    fn test_unknown_types_decode_structurally() {
        let mut message = DnsMessage::query(3, DnsQuestion::new("example.org", RecordType::A));
        message.questions[0].qtype = 0xFFAA;
        message.questions[0].qclass = 0x00FE;

        let decoded = DnsMessage::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_oversized_message_is_truncated() {
        let query = DnsMessage::query(5, DnsQuestion::new("many.example", RecordType::A));
        let mut message = DnsMessage::response_to(&query, ResponseCode::NoError);
        let answers: Vec<DnsAnswer> = (0..40).map(|i| a_record("many.example", i)).collect();
        message.set_answers(answers);

        let bytes = message.encode().unwrap();
        assert!(bytes.len() <= MAX_UDP_PAYLOAD);

        let decoded = DnsMessage::decode(&bytes).unwrap();
        assert!(decoded.header.flags.tc);
        assert_eq!(decoded.header.answer_count as usize, decoded.answers.len());
        assert!(decoded.answers.len() < 40);
        assert_eq!(decoded.answers[..], message.answers[..decoded.answers.len()]);
    }

    #[test]
    fn test_response_to_echoes_request() {
        let mut query = DnsMessage::query(0x4242, DnsQuestion::new("first.example", RecordType::A));
        query.questions.push(DnsQuestion::new("second.example", RecordType::A));
        query.header.question_count = 2;
        query.header.flags.z = 5;

        let response = DnsMessage::response_to(&query, ResponseCode::NoError);

        assert_eq!(response.header.id, 0x4242);
        assert!(response.header.flags.qr);
        assert!(response.header.flags.rd);
        assert_eq!(response.header.flags.z, 0);
        assert_eq!(response.header.question_count, 1);
        assert_eq!(response.questions, vec![query.questions[0].clone()]);
    }

    #[test]
    fn test_error_response_has_no_sections() {
        let header = DnsHeader::from_bytes(&[0xAB, 0xCD, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0])
            .unwrap();
        let response = DnsMessage::error_response(&header, ResponseCode::ServFail);
        let bytes = response.encode().unwrap();

        assert_eq!(bytes.len(), HEADER_LEN);
        assert_eq!(&bytes[..2], &[0xAB, 0xCD]);
        let parsed = DnsMessage::decode(&bytes).unwrap();
        assert_eq!(parsed.rcode(), ResponseCode::ServFail.to_u8());
        assert!(parsed.header.flags.rd);
    }
}
