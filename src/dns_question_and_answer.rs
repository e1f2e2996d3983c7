use std::collections::HashMap;
use std::net::Ipv4Addr;

use bytes::{BufMut, BytesMut};

use crate::error::DnsError;

/// Longest domain name on the wire, length octets included
pub const MAX_NAME_LEN: usize = 255;
/// Longest single label
pub const MAX_LABEL_LEN: usize = 63;
/// Highest offset a 14-bit compression pointer can reach
const MAX_POINTER_OFFSET: usize = 0x3FFF;

/// DNS Question Section
/// Format: QNAME + QTYPE (2 bytes) + QCLASS (2 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuestion {
    pub name: String, // Domain name (e.g., "example.com")
    pub qtype: u16,   // Query type (A, AAAA, CNAME, etc.)
    pub qclass: u16,  // Query class (usually IN for Internet)
}

/// DNS Answer/Resource Record Section, used for the answer, authority and
/// additional sections alike
/// Format: NAME + TYPE (2 bytes) + CLASS (2 bytes) + TTL (4 bytes) + RDLENGTH (2 bytes) + RDATA
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsAnswer {
    pub name: String,   // Domain name
    pub rtype: u16,     // Record type (A, AAAA, CNAME, etc.)
    pub rclass: u16,    // Record class (usually IN for Internet)
    pub ttl: u32,       // Time to live in seconds
    pub rdata: Vec<u8>, // Resource data, names inside it are stored uncompressed
}

/// Common DNS record types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordType {
    A = 1,     // IPv4 address
    NS = 2,    // Name server
    CNAME = 5, // Canonical name
    SOA = 6,   // Start of authority
    PTR = 12,  // Pointer record
    MX = 15,   // Mail exchange
    TXT = 16,  // Text record
    AAAA = 28, // IPv6 address
    OPT = 41,  // EDNS0 option
}

impl RecordType {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(RecordType::A),
            2 => Some(RecordType::NS),
            5 => Some(RecordType::CNAME),
            6 => Some(RecordType::SOA),
            12 => Some(RecordType::PTR),
            15 => Some(RecordType::MX),
            16 => Some(RecordType::TXT),
            28 => Some(RecordType::AAAA),
            41 => Some(RecordType::OPT),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Common DNS classes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordClass {
    IN = 1, // Internet
    CS = 2, // CSNET (obsolete)
    CH = 3, // CHAOS
    HS = 4, // Hesiod
}

impl RecordClass {
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(RecordClass::IN),
            2 => Some(RecordClass::CS),
            3 => Some(RecordClass::CH),
            4 => Some(RecordClass::HS),
            _ => None,
        }
    }

    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

impl DnsQuestion {
    #[cfg(test)]
    pub fn new(name: impl Into<String>, qtype: RecordType) -> Self {
        DnsQuestion {
            name: name.into(),
            qtype: qtype.to_u16(),
            qclass: RecordClass::IN.to_u16(),
        }
    }

    /// Parse a DNS question from bytes starting at the given offset
    /// Returns the question and the new offset after parsing
    pub fn from_bytes(bytes: &[u8], offset: usize) -> Result<(Self, usize), DnsError> {
        let (name, new_offset) = parse_domain_name(bytes, offset)?;

        let fixed = bytes
            .get(new_offset..new_offset + 4)
            .ok_or(DnsError::MalformedPacket("buffer too small for question type and class"))?;

        let qtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let qclass = u16::from_be_bytes([fixed[2], fixed[3]]);

        Ok((
            DnsQuestion {
                name,
                qtype,
                qclass,
            },
            new_offset + 4,
        ))
    }

    /// Append the question to a message buffer
    pub fn write_to(
        &self,
        buf: &mut BytesMut,
        names: &mut NameCompressor,
    ) -> Result<(), DnsError> {
        names.write_name(buf, &self.name)?;
        buf.put_u16(self.qtype);
        buf.put_u16(self.qclass);
        Ok(())
    }
}

impl DnsAnswer {
    /// Parse a DNS answer/resource record from bytes starting at the given offset
    /// Returns the answer and the new offset after parsing
    pub fn from_bytes(bytes: &[u8], offset: usize) -> Result<(Self, usize), DnsError> {
        let (name, new_offset) = parse_domain_name(bytes, offset)?;

        let fixed = bytes
            .get(new_offset..new_offset + 10)
            .ok_or(DnsError::MalformedPacket("buffer too small for record fields"))?;

        let rtype = u16::from_be_bytes([fixed[0], fixed[1]]);
        let rclass = u16::from_be_bytes([fixed[2], fixed[3]]);
        let ttl = u32::from_be_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let rdlength = u16::from_be_bytes([fixed[8], fixed[9]]) as usize;

        let data_offset = new_offset + 10;
        let rdata = read_rdata(bytes, data_offset, rdlength, rtype)?;

        Ok((
            DnsAnswer {
                name,
                rtype,
                rclass,
                ttl,
                rdata,
            },
            data_offset + rdlength,
        ))
    }

    /// Append the record to a message buffer. Names embedded in NS, CNAME,
    /// PTR, MX and SOA data go through `names` too.
    pub fn write_to(
        &self,
        buf: &mut BytesMut,
        names: &mut NameCompressor,
    ) -> Result<(), DnsError> {
        if self.rdata.len() > u16::MAX as usize {
            return Err(DnsError::MalformedPacket("record data longer than 65535 bytes"));
        }

        names.write_name(buf, &self.name)?;
        buf.put_u16(self.rtype);
        buf.put_u16(self.rclass);
        buf.put_u32(self.ttl);

        let length_at = buf.len();
        buf.put_u16(0);
        match self.embedded_names() {
            Some((prefix, embedded, rest)) => {
                buf.put_slice(prefix);
                for name in &embedded {
                    names.write_name(buf, name)?;
                }
                buf.put_slice(rest);
            }
            None => buf.put_slice(&self.rdata),
        }

        let rdlength = (buf.len() - length_at - 2) as u16;
        buf[length_at..length_at + 2].copy_from_slice(&rdlength.to_be_bytes());
        Ok(())
    }

    /// Split RDATA into the bytes before the embedded names, the names, and
    /// the bytes after them. `None` for opaque data, or data that does not
    /// have the layout its type calls for.
    fn embedded_names(&self) -> Option<(&[u8], Vec<String>, &[u8])> {
        let (prefix_len, count) = match RecordType::from_u16(self.rtype)? {
            RecordType::NS | RecordType::CNAME | RecordType::PTR => (0, 1),
            RecordType::MX => (2, 1),
            RecordType::SOA => (0, 2),
            _ => return None,
        };

        let prefix = self.rdata.get(..prefix_len)?;
        let mut embedded = Vec::with_capacity(count);
        let mut offset = prefix_len;
        for _ in 0..count {
            let (name, next) = parse_domain_name(&self.rdata, offset).ok()?;
            embedded.push(name);
            offset = next;
        }

        let rest = &self.rdata[offset..];
        let complete = match RecordType::from_u16(self.rtype)? {
            RecordType::SOA => rest.len() == 20,
            _ => rest.is_empty(),
        };
        complete.then_some((prefix, embedded, rest))
    }

    /// Create a new DNS answer with the given parameters
    pub fn new(name: String, rtype: u16, rclass: u16, ttl: u32, rdata: Vec<u8>) -> Self {
        DnsAnswer {
            name,
            rtype,
            rclass,
            ttl,
            rdata,
        }
    }

    /// Create an A record (IPv4 address) answer
    pub fn new_a_record(name: String, ttl: u32, ip: Ipv4Addr) -> Self {
        Self::new(
            name,
            RecordType::A.to_u16(),
            RecordClass::IN.to_u16(),
            ttl,
            ip.octets().to_vec(),
        )
    }

    /// The address carried by an IN A record
    #[cfg(test)]
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        if self.rtype != RecordType::A.to_u16() || self.rclass != RecordClass::IN.to_u16() {
            return None;
        }
        let octets: [u8; 4] = self.rdata.as_slice().try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }
}

/// Read RDATA, expanding compressed names for the types known to embed them
/// so the record stays valid when written into another message
fn read_rdata(
    bytes: &[u8],
    start: usize,
    rdlength: usize,
    rtype: u16,
) -> Result<Vec<u8>, DnsError> {
    let end = start + rdlength;
    let raw = bytes
        .get(start..end)
        .ok_or(DnsError::MalformedPacket("buffer too small for RDATA"))?;

    let mut rdata = Vec::with_capacity(rdlength);
    let names_end = match RecordType::from_u16(rtype) {
        Some(RecordType::NS) | Some(RecordType::CNAME) | Some(RecordType::PTR) => {
            copy_name(bytes, start, &mut rdata)?
        }
        Some(RecordType::MX) => {
            if rdlength < 3 {
                return Err(DnsError::MalformedPacket("MX record data too short"));
            }
            rdata.extend_from_slice(&raw[..2]);
            copy_name(bytes, start + 2, &mut rdata)?
        }
        Some(RecordType::SOA) => {
            let mname_end = copy_name(bytes, start, &mut rdata)?;
            let serials = copy_name(bytes, mname_end, &mut rdata)?;
            // serial, refresh, retry, expire, minimum
            if serials + 20 != end {
                return Err(DnsError::MalformedPacket("SOA record data has wrong length"));
            }
            rdata.extend_from_slice(&bytes[serials..end]);
            end
        }
        _ => {
            rdata.extend_from_slice(raw);
            end
        }
    };

    if names_end != end {
        return Err(DnsError::MalformedPacket("name in record data overruns RDLENGTH"));
    }

    Ok(rdata)
}

fn copy_name(bytes: &[u8], offset: usize, out: &mut Vec<u8>) -> Result<usize, DnsError> {
    let (name, next) = parse_domain_name(bytes, offset)?;
    out.extend(encode_domain_name(&name)?);
    Ok(next)
}

/// Parse a domain name from DNS message format
/// Supports DNS name compression (pointers)
/// Returns the parsed domain name and the new offset
///
/// Every pointer has to land strictly before the previous jump target (the
/// first one before its own position), so a chain of pointers always
/// terminates.
pub fn parse_domain_name(bytes: &[u8], offset: usize) -> Result<(String, usize), DnsError> {
    let mut labels = Vec::new();
    let mut pos = offset;
    let mut resume_at = None;
    let mut jump_limit = offset;
    let mut wire_len = 1; // root label

    loop {
        let length = *bytes
            .get(pos)
            .ok_or(DnsError::MalformedPacket("domain name runs past end of packet"))?;

        match length & 0xC0 {
            0xC0 => {
                let low = *bytes
                    .get(pos + 1)
                    .ok_or(DnsError::MalformedPacket("incomplete compression pointer"))?;
                let target = u16::from_be_bytes([length & 0x3F, low]) as usize;

                if target >= jump_limit.min(pos) {
                    return Err(DnsError::MalformedPacket(
                        "compression pointer does not point backwards",
                    ));
                }

                if resume_at.is_none() {
                    resume_at = Some(pos + 2);
                }
                jump_limit = target;
                pos = target;
            }
            0x00 => {
                pos += 1;
                if length == 0 {
                    break;
                }

                let end = pos + length as usize;
                let raw = bytes
                    .get(pos..end)
                    .ok_or(DnsError::MalformedPacket("label extends beyond buffer"))?;

                wire_len += 1 + raw.len();
                if wire_len > MAX_NAME_LEN {
                    return Err(DnsError::MalformedPacket("domain name longer than 255 bytes"));
                }

                let label = std::str::from_utf8(raw)
                    .map_err(|_| DnsError::MalformedPacket("invalid UTF-8 in domain label"))?;
                if label.contains('.') {
                    return Err(DnsError::MalformedPacket("domain label contains a dot"));
                }

                labels.push(label.to_string());
                pos = end;
            }
            // 0x40 and 0x80 prefixes: extended label types, or a length over 63
            _ => {
                return Err(DnsError::MalformedPacket(
                    "label longer than 63 bytes or unknown label type",
                ))
            }
        }
    }

    let final_offset = resume_at.unwrap_or(pos);
    let domain_name = if labels.is_empty() {
        ".".to_string() // Root domain
    } else {
        labels.join(".")
    };

    Ok((domain_name, final_offset))
}

/// Split a textual name into labels, checking the wire limits
/// A trailing dot is accepted; "." and "" are the root
pub fn name_labels(name: &str) -> Result<Vec<&str>, DnsError> {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }

    let mut wire_len = 1;
    let mut labels = Vec::new();
    for label in trimmed.split('.') {
        if label.is_empty() {
            return Err(DnsError::EmptyLabel(name.to_string()));
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(DnsError::LabelTooLong(label.to_string()));
        }
        wire_len += 1 + label.len();
        labels.push(label);
    }

    if wire_len > MAX_NAME_LEN {
        return Err(DnsError::NameTooLong(name.to_string()));
    }

    Ok(labels)
}

/// Encode a domain name to DNS message format without compression
/// Format: length-prefixed labels terminated with a null byte
/// Example: "example.com" -> [7]example[3]com[0]
pub fn encode_domain_name(name: &str) -> Result<Vec<u8>, DnsError> {
    let mut encoded = Vec::new();

    for label in name_labels(name)? {
        encoded.push(label.len() as u8);
        encoded.extend_from_slice(label.as_bytes());
    }

    // Null terminator
    encoded.push(0);

    Ok(encoded)
}

/// Remembers where each name suffix was written in a message so later
/// occurrences can be replaced by a pointer
#[derive(Debug, Clone, Default)]
pub struct NameCompressor {
    offsets: HashMap<String, u16>,
}

impl NameCompressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `name` at the end of `buf`, which must hold the message from
    /// its first header byte
    pub fn write_name(&mut self, buf: &mut BytesMut, name: &str) -> Result<(), DnsError> {
        let labels = name_labels(name)?;

        for i in 0..labels.len() {
            // Case is kept as written, so only exact suffixes are shared
            let suffix = labels[i..].join(".");
            if let Some(&offset) = self.offsets.get(&suffix) {
                buf.put_u16(0xC000 | offset);
                return Ok(());
            }

            let here = buf.len();
            if here <= MAX_POINTER_OFFSET {
                self.offsets.insert(suffix, here as u16);
            }
            buf.put_u8(labels[i].len() as u8);
            buf.put_slice(labels[i].as_bytes());
        }

        buf.put_u8(0);
        Ok(())
    }
}
