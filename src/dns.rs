//! DNS message parsing and construction.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::error::UpstreamError;

pub const HEADER_LEN: usize = 12;

/// Largest reply sent over UDP before the client is told to retry over TCP.
pub const MAX_UDP_PAYLOAD: usize = 512;

const FLAG_QR: u16 = 0x8000;
const FLAG_TC: u16 = 0x0200;
const FLAG_RD: u16 = 0x0100;
const FLAG_RA: u16 = 0x0080;

const CLASS_IN: u16 = 1;

/// Compression pointers followed while decoding one name.
const MAX_POINTER_JUMPS: usize = 16;

pub const RCODE_NOERROR: u8 = 0;
pub const RCODE_SERVFAIL: u8 = 2;
pub const RCODE_REFUSED: u8 = 5;

/// Resource record type (QTYPE / TYPE field).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordType(pub u16);

impl RecordType {
    pub const A: Self = Self(1);
    pub const NS: Self = Self(2);
    pub const CNAME: Self = Self(5);
    pub const SOA: Self = Self(6);
    pub const PTR: Self = Self(12);
    pub const MX: Self = Self(15);
    pub const TXT: Self = Self(16);
    pub const AAAA: Self = Self(28);
    pub const SRV: Self = Self(33);
    pub const HTTPS: Self = Self(65);
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match *self {
            Self::A => "A",
            Self::NS => "NS",
            Self::CNAME => "CNAME",
            Self::SOA => "SOA",
            Self::PTR => "PTR",
            Self::MX => "MX",
            Self::TXT => "TXT",
            Self::AAAA => "AAAA",
            Self::SRV => "SRV",
            Self::HTTPS => "HTTPS",
            _ => return write!(f, "TYPE{}", self.0),
        };
        f.write_str(name)
    }
}

/// A parsed DNS query.
#[derive(Debug, Clone)]
pub struct DnsQuery {
    pub id: u16,
    pub flags: u16,
    /// Lower-cased name, used as the resolution key.
    pub domain: String,
    /// Name as the client spelled it.
    pub raw_domain: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

impl DnsQuery {
    /// Build a recursive IN-class query for `domain`.
    pub fn new(id: u16, domain: &str, qtype: RecordType) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            domain: domain.to_lowercase(),
            raw_domain: domain.trim_end_matches('.').to_string(),
            qtype,
            qclass: CLASS_IN,
        }
    }

    /// Parse a DNS query from raw bytes.
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN + 1 {
            return None;
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let flags = u16::from_be_bytes([data[2], data[3]]);
        if flags & FLAG_QR != 0 {
            return None;
        }

        // Parse domain name
        let mut pos = HEADER_LEN;
        let mut domain_parts = Vec::new();

        while pos < data.len() {
            let label_len = data[pos] as usize;
            if label_len == 0 {
                pos += 1;
                break;
            }
            if label_len & 0xC0 != 0 {
                return None;
            }
            pos += 1;
            if pos + label_len > data.len() {
                return None;
            }
            let label = std::str::from_utf8(&data[pos..pos + label_len]).ok()?;
            domain_parts.push(label.to_string());
            pos += label_len;
        }

        if domain_parts.is_empty() {
            return None;
        }

        // Parse QTYPE and QCLASS
        if pos + 4 > data.len() {
            return None;
        }
        let qtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let qclass = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);

        let raw_domain = domain_parts.join(".");
        Some(Self {
            id,
            flags,
            domain: raw_domain.to_lowercase(),
            raw_domain,
            qtype: RecordType(qtype),
            qclass,
        })
    }

    /// Encode the query to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_LEN + self.raw_domain.len() + 6);
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
        data.extend_from_slice(&[0x00; 6]); // AN/NS/AR counts
        encode_domain(&mut data, &self.raw_domain);
        data.extend_from_slice(&self.qtype.0.to_be_bytes());
        data.extend_from_slice(&self.qclass.to_be_bytes());
        data
    }

    fn rd(&self) -> u16 {
        self.flags & FLAG_RD
    }
}

/// A DNS response.
#[derive(Debug, Clone)]
pub struct DnsResponse {
    pub id: u16,
    pub flags: u16,
    pub questions: Vec<DnsQuestion>,
    pub answers: Vec<DnsRecord>,
}

/// A DNS question section entry.
#[derive(Debug, Clone)]
pub struct DnsQuestion {
    pub domain: String,
    pub qtype: RecordType,
    pub qclass: u16,
}

/// A DNS resource record.
#[derive(Debug, Clone)]
pub struct DnsRecord {
    pub name: String,
    pub rtype: RecordType,
    pub class: u16,
    pub ttl: u32,
    pub rdata: Vec<u8>,
}

impl DnsRecord {
    pub fn a(name: &str, ttl: u32, addr: Ipv4Addr) -> Self {
        Self::new(name, RecordType::A, ttl, addr.octets().to_vec())
    }

    pub fn aaaa(name: &str, ttl: u32, addr: Ipv6Addr) -> Self {
        Self::new(name, RecordType::AAAA, ttl, addr.octets().to_vec())
    }

    pub fn cname(name: &str, ttl: u32, target: &str) -> Self {
        let mut rdata = Vec::with_capacity(target.len() + 2);
        encode_domain(&mut rdata, target);
        Self::new(name, RecordType::CNAME, ttl, rdata)
    }

    fn new(name: &str, rtype: RecordType, ttl: u32, rdata: Vec<u8>) -> Self {
        Self {
            name: name.to_lowercase(),
            rtype,
            class: CLASS_IN,
            ttl,
            rdata,
        }
    }
}

impl DnsResponse {
    /// Create a successful response to `query` carrying `answers`.
    pub fn reply_to(query: &DnsQuery, answers: Vec<DnsRecord>) -> Self {
        Self {
            id: query.id,
            flags: FLAG_QR | query.rd() | FLAG_RA,
            questions: vec![DnsQuestion {
                domain: query.raw_domain.clone(),
                qtype: query.qtype,
                qclass: query.qclass,
            }],
            answers,
        }
    }

    /// Create a SERVFAIL response echoing the question.
    pub fn servfail(query: &DnsQuery) -> Self {
        let mut response = Self::reply_to(query, Vec::new());
        response.flags |= u16::from(RCODE_SERVFAIL);
        response
    }

    /// Create an empty response with TC set so the client retries over TCP.
    pub fn truncated(query: &DnsQuery) -> Self {
        let mut response = Self::reply_to(query, Vec::new());
        response.flags |= FLAG_TC;
        response
    }

    /// Encode the response to wire format bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(512);

        // Header
        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&self.flags.to_be_bytes());
        data.extend_from_slice(&(self.questions.len() as u16).to_be_bytes());
        data.extend_from_slice(&(self.answers.len() as u16).to_be_bytes());
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        // Questions
        for q in &self.questions {
            encode_domain(&mut data, &q.domain);
            data.extend_from_slice(&q.qtype.0.to_be_bytes());
            data.extend_from_slice(&q.qclass.to_be_bytes());
        }

        // Answers
        for a in &self.answers {
            // Use compression pointer if this is the first question's domain
            if !self.questions.is_empty()
                && a.name.eq_ignore_ascii_case(&self.questions[0].domain)
            {
                data.extend_from_slice(&[0xC0, 0x0C]); // Pointer to offset 12
            } else {
                encode_domain(&mut data, &a.name);
            }
            data.extend_from_slice(&a.rtype.0.to_be_bytes());
            data.extend_from_slice(&a.class.to_be_bytes());
            data.extend_from_slice(&a.ttl.to_be_bytes());
            data.extend_from_slice(&(a.rdata.len() as u16).to_be_bytes());
            data.extend_from_slice(&a.rdata);
        }

        data
    }
}

fn encode_domain(buf: &mut Vec<u8>, domain: &str) {
    for label in domain.trim_end_matches('.').split('.') {
        buf.push(label.len() as u8);
        buf.extend_from_slice(label.as_bytes());
    }
    buf.push(0);
}

/// Whether a raw message has TC set, judged from the header alone.
///
/// A truncated datagram may be cut in the middle of a record, so this must
/// not depend on the rest of the message parsing.
pub fn header_truncated(message: &[u8]) -> bool {
    message.len() >= HEADER_LEN && u16::from_be_bytes([message[2], message[3]]) & FLAG_TC != 0
}

/// Record payload, decided when the answer is parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Other,
}

/// An answer-section record of an upstream response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub record_type: RecordType,
    pub ttl: u32,
    pub data: RecordData,
}

impl Record {
    /// The address carried by A and AAAA records.
    pub fn address(&self) -> Option<IpAddr> {
        match self.data {
            RecordData::A(addr) => Some(IpAddr::V4(addr)),
            RecordData::Aaaa(addr) => Some(IpAddr::V6(addr)),
            RecordData::Other => None,
        }
    }
}

/// A complete upstream response: the original message plus its parsed
/// answer records.
///
/// The message is kept verbatim so a cached answer can be replayed to any
/// client by rewriting only the transaction id.
#[derive(Debug, Clone)]
pub struct Answer {
    id: u16,
    rcode: u8,
    truncated: bool,
    /// Lower-cased name and type of the first question, if any.
    question: Option<(String, RecordType)>,
    records: Vec<Record>,
    message: Vec<u8>,
}

impl Answer {
    /// Parse an upstream response message.
    pub fn parse(message: Vec<u8>) -> Result<Self, UpstreamError> {
        if message.len() < HEADER_LEN {
            return Err(UpstreamError::Malformed("short header"));
        }

        let id = u16::from_be_bytes([message[0], message[1]]);
        let flags = u16::from_be_bytes([message[2], message[3]]);
        if flags & FLAG_QR == 0 {
            return Err(UpstreamError::Malformed("not a response"));
        }
        let qdcount = u16::from_be_bytes([message[4], message[5]]) as usize;
        let ancount = u16::from_be_bytes([message[6], message[7]]) as usize;

        let mut pos = HEADER_LEN;
        let mut question = None;

        for i in 0..qdcount {
            let name_end = skip_name(&message, pos)?;
            if name_end + 4 > message.len() {
                return Err(UpstreamError::Malformed("truncated question"));
            }
            if i == 0 {
                let qtype = u16::from_be_bytes([message[name_end], message[name_end + 1]]);
                question = Some((read_name(&message, pos)?, RecordType(qtype)));
            }
            pos = name_end + 4; // QTYPE + QCLASS
        }

        let mut records = Vec::with_capacity(ancount.min(16));
        for _ in 0..ancount {
            pos = skip_name(&message, pos)?;
            if pos + 10 > message.len() {
                return Err(UpstreamError::Malformed("truncated record"));
            }

            let record_type = RecordType(u16::from_be_bytes([message[pos], message[pos + 1]]));
            let ttl = u32::from_be_bytes([
                message[pos + 4],
                message[pos + 5],
                message[pos + 6],
                message[pos + 7],
            ]);
            let rdlength = u16::from_be_bytes([message[pos + 8], message[pos + 9]]) as usize;
            pos += 10;

            let rdata = message
                .get(pos..pos + rdlength)
                .ok_or(UpstreamError::Malformed("truncated rdata"))?;
            let data = match record_type {
                RecordType::A => <[u8; 4]>::try_from(rdata)
                    .map(|octets| RecordData::A(Ipv4Addr::from(octets)))
                    .map_err(|_| UpstreamError::Malformed("bad A rdata"))?,
                RecordType::AAAA => <[u8; 16]>::try_from(rdata)
                    .map(|octets| RecordData::Aaaa(Ipv6Addr::from(octets)))
                    .map_err(|_| UpstreamError::Malformed("bad AAAA rdata"))?,
                _ => RecordData::Other,
            };
            pos += rdlength;

            records.push(Record {
                record_type,
                ttl,
                data,
            });
        }

        Ok(Self {
            id,
            rcode: (flags & 0x000F) as u8,
            truncated: flags & FLAG_TC != 0,
            question,
            records,
            message,
        })
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    pub fn rcode(&self) -> u8 {
        self.rcode
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn question(&self) -> Option<(&str, RecordType)> {
        self.question
            .as_ref()
            .map(|(name, qtype)| (name.as_str(), *qtype))
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn message(&self) -> &[u8] {
        &self.message
    }

    /// Distinct addresses from address-bearing records, in answer order.
    ///
    /// The unspecified address is skipped; some resolvers use it as a
    /// blocking sentinel.
    pub fn addresses(&self) -> Vec<IpAddr> {
        let mut addresses = Vec::with_capacity(self.records.len());
        for ip in self.records.iter().filter_map(Record::address) {
            if !ip.is_unspecified() && !addresses.contains(&ip) {
                addresses.push(ip);
            }
        }
        addresses
    }

    /// Smallest non-zero TTL among the answer records.
    pub fn min_positive_ttl(&self) -> Option<u32> {
        self.records.iter().map(|r| r.ttl).filter(|&ttl| ttl > 0).min()
    }

    /// The stored message re-addressed to `query`: its transaction id,
    /// recursion-available set, and the question name spelled as the client
    /// sent it.
    pub fn to_reply(&self, query: &DnsQuery) -> Vec<u8> {
        let mut reply = self.message.clone();
        reply[0..2].copy_from_slice(&query.id.to_be_bytes());
        reply[3] |= (FLAG_RA & 0xFF) as u8;

        if self.question.is_some() {
            let mut name = Vec::with_capacity(query.raw_domain.len() + 2);
            encode_domain(&mut name, &query.raw_domain);
            let end = HEADER_LEN + name.len();
            if reply
                .get(HEADER_LEN..end)
                .is_some_and(|stored| stored.eq_ignore_ascii_case(&name))
            {
                reply[HEADER_LEN..end].copy_from_slice(&name);
            }
        }

        reply
    }
}

/// Skip an encoded name, returning the position just past it.
fn skip_name(data: &[u8], mut pos: usize) -> Result<usize, UpstreamError> {
    loop {
        let len = *data
            .get(pos)
            .ok_or(UpstreamError::Malformed("truncated name"))? as usize;
        match len {
            0 => return Ok(pos + 1),
            l if l & 0xC0 == 0xC0 => {
                if pos + 2 > data.len() {
                    return Err(UpstreamError::Malformed("truncated name"));
                }
                return Ok(pos + 2);
            }
            l if l & 0xC0 != 0 => return Err(UpstreamError::Malformed("bad label")),
            l => pos += 1 + l,
        }
    }
}

/// Decode a name at `pos`, following compression pointers. Labels are
/// lower-cased.
fn read_name(data: &[u8], mut pos: usize) -> Result<String, UpstreamError> {
    let mut labels = Vec::new();
    let mut jumps = 0;
    loop {
        let len = *data
            .get(pos)
            .ok_or(UpstreamError::Malformed("truncated name"))? as usize;
        match len {
            0 => return Ok(labels.join(".")),
            l if l & 0xC0 == 0xC0 => {
                let low = *data
                    .get(pos + 1)
                    .ok_or(UpstreamError::Malformed("truncated name"))? as usize;
                jumps += 1;
                if jumps > MAX_POINTER_JUMPS {
                    return Err(UpstreamError::Malformed("compression loop"));
                }
                pos = ((l & 0x3F) << 8) | low;
            }
            l if l & 0xC0 != 0 => return Err(UpstreamError::Malformed("bad label")),
            l => {
                let label = data
                    .get(pos + 1..pos + 1 + l)
                    .ok_or(UpstreamError::Malformed("truncated name"))?;
                labels.push(String::from_utf8_lossy(label).to_lowercase());
                pos += 1 + l;
            }
        }
    }
}
