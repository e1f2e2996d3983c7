use std::collections::HashMap;
use std::net::Ipv4Addr;

use crate::dns_question_and_answer::{
    name_labels, DnsAnswer, DnsQuestion, RecordClass, RecordType,
};
use crate::error::DnsError;

/// TTL handed out for static answers unless configured otherwise
pub const DEFAULT_TTL: u32 = 60;

/// A single configured `name -> IPv4` mapping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticRecord {
    pub name: String,
    pub addr: Ipv4Addr,
}

impl StaticRecord {
    pub fn new(name: impl Into<String>, addr: Ipv4Addr) -> Self {
        StaticRecord {
            name: name.into(),
            addr,
        }
    }
}

/// Outcome of looking a question up in the static table
#[derive(Debug, PartialEq, Eq)]
pub enum Lookup {
    /// Records for the queried name and type, spelled like the question
    Found(Vec<DnsAnswer>),
    /// The name is known, but not with this type or class
    NoData,
    /// The name is not in the table
    NoName,
}

/// Read-only table of locally answered names. Built once at startup and
/// shared between workers without locking.
#[derive(Debug, Default)]
pub struct StaticTable {
    entries: HashMap<String, Vec<Ipv4Addr>>,
    ttl: u32,
}

/// Lower-case the name and drop the trailing root label
pub fn normalize_name(name: &str) -> String {
    name.strip_suffix('.').unwrap_or(name).to_ascii_lowercase()
}

impl StaticTable {
    pub fn new(ttl: u32) -> Self {
        StaticTable {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// The built-in table: `google.com A 8.8.8.8`
    pub fn with_defaults(ttl: u32) -> Self {
        let mut table = Self::new(ttl);
        table.insert_a("google.com", Ipv4Addr::new(8, 8, 8, 8));
        table
    }

    pub fn from_records(ttl: u32, records: &[StaticRecord]) -> Result<Self, DnsError> {
        let mut table = Self::with_defaults(ttl);
        for record in records {
            name_labels(&record.name)?;
            table.insert_a(&record.name, record.addr);
        }
        Ok(table)
    }

    pub fn insert_a(&mut self, name: &str, addr: Ipv4Addr) {
        let addrs = self.entries.entry(normalize_name(name)).or_default();
        if !addrs.contains(&addr) {
            addrs.push(addr);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }

    /// Look up the question's name and type. Static entries are A records
    /// in class IN only.
    pub fn lookup(&self, question: &DnsQuestion) -> Lookup {
        let Some(addrs) = self.entries.get(&normalize_name(&question.name)) else {
            return Lookup::NoName;
        };

        let wants_a = question.qtype == RecordType::A.to_u16()
            && RecordClass::from_u16(question.qclass) == Some(RecordClass::IN);
        if !wants_a {
            return Lookup::NoData;
        }

        let answers = addrs
            .iter()
            .map(|&addr| DnsAnswer::new_a_record(question.name.clone(), self.ttl, addr))
            .collect();
        Lookup::Found(answers)
    }
}
