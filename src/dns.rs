//! DNS message parsing and construction.
//!
//! Only what the forwarder needs: building A queries for calibration probes,
//! reading the question name for logs, and walking the answer section of a
//! response.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};

pub const HEADER_LEN: usize = 12;

pub const TYPE_A: u16 = 1;
pub const CLASS_IN: u16 = 1;

/// A parsed DNS query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsQuery {
    pub id: u16,
    pub domain: String,
    pub qtype: u16,
    pub qclass: u16,
}

impl DnsQuery {
    /// A recursive A/IN query for `domain`.
    pub fn a(domain: &str, id: u16) -> Self {
        Self {
            id,
            domain: domain.trim_end_matches('.').to_lowercase(),
            qtype: TYPE_A,
            qclass: CLASS_IN,
        }
    }

    /// Parse the header id and first question of a query.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Protocol("message shorter than header"));
        }

        let id = u16::from_be_bytes([data[0], data[1]]);
        let (domain, pos) = read_question_name(data, HEADER_LEN)?;
        let Some(fixed) = data.get(pos..pos + 4) else {
            return Err(Error::Protocol("truncated question"));
        };

        Ok(Self {
            id,
            domain,
            qtype: u16::from_be_bytes([fixed[0], fixed[1]]),
            qclass: u16::from_be_bytes([fixed[2], fixed[3]]),
        })
    }

    /// Encode the query to wire format with recursion desired.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(HEADER_LEN + self.domain.len() + 6);

        data.extend_from_slice(&self.id.to_be_bytes());
        data.extend_from_slice(&[0x01, 0x00]); // RD
        data.extend_from_slice(&[0x00, 0x01]); // QDCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ANCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // NSCOUNT
        data.extend_from_slice(&[0x00, 0x00]); // ARCOUNT

        for label in self.domain.split('.').filter(|l| !l.is_empty()) {
            data.push(label.len() as u8);
            data.extend_from_slice(label.as_bytes());
        }
        data.push(0);
        data.extend_from_slice(&self.qtype.to_be_bytes());
        data.extend_from_slice(&self.qclass.to_be_bytes());

        data
    }
}

/// Query name of a raw query, for logging.
pub fn query_domain(data: &[u8]) -> String {
    match DnsQuery::parse(data) {
        Ok(q) if !q.domain.is_empty() => q.domain,
        Ok(_) => ".".to_string(),
        Err(_) => "<unknown>".to_string(),
    }
}

/// Read an uncompressed question name as lowercase dotted text, returning
/// it with the offset just past it.
fn read_question_name(data: &[u8], mut pos: usize) -> Result<(String, usize)> {
    let mut domain = String::new();

    loop {
        let Some(&len) = data.get(pos) else {
            return Err(Error::Protocol("truncated name"));
        };
        if len == 0 {
            return Ok((domain, pos + 1));
        }
        if len & 0xC0 != 0 {
            return Err(Error::Protocol("compressed question name"));
        }

        let start = pos + 1;
        let Some(label) = data.get(start..start + len as usize) else {
            return Err(Error::Protocol("truncated label"));
        };
        if !domain.is_empty() {
            domain.push('.');
        }
        domain.extend(label.iter().map(|b| b.to_ascii_lowercase() as char));
        pos = start + len as usize;
    }
}

/// A resource record borrowed from a response buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record<'a> {
    pub rtype: u16,
    pub class: u16,
    pub ttl: u32,
    pub rdata: &'a [u8],
}

impl Record<'_> {
    /// The address carried by an A record.
    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        if self.rtype != TYPE_A {
            return None;
        }
        let octets: [u8; 4] = self.rdata.try_into().ok()?;
        Some(Ipv4Addr::from(octets))
    }
}

/// Iterator over the answer section of a response.
///
/// Yields an error and stops at the first record that cannot be read, since
/// the offsets of anything after it are unknown.
#[derive(Debug, Clone)]
pub struct Answers<'a> {
    data: &'a [u8],
    pos: usize,
    count: u16,
    remaining: u16,
}

impl<'a> Answers<'a> {
    pub fn parse(data: &'a [u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(Error::Protocol("message shorter than header"));
        }

        let qdcount = u16::from_be_bytes([data[4], data[5]]);
        let count = u16::from_be_bytes([data[6], data[7]]);

        let mut pos = HEADER_LEN;
        for _ in 0..qdcount {
            pos = skip_name(data, pos)? + 4; // QTYPE + QCLASS
            if pos > data.len() {
                return Err(Error::Protocol("truncated question"));
            }
        }

        Ok(Self {
            data,
            pos,
            count,
            remaining: count,
        })
    }

    /// Number of answer records announced in the header.
    pub fn announced(&self) -> u16 {
        self.count
    }

    fn read_record(&mut self) -> Result<Record<'a>> {
        let data = self.data;
        let pos = skip_name(data, self.pos)?;
        if pos + 10 > data.len() {
            return Err(Error::Protocol("truncated resource record"));
        }

        let rtype = u16::from_be_bytes([data[pos], data[pos + 1]]);
        let class = u16::from_be_bytes([data[pos + 2], data[pos + 3]]);
        let ttl = u32::from_be_bytes([data[pos + 4], data[pos + 5], data[pos + 6], data[pos + 7]]);
        let rdlength = u16::from_be_bytes([data[pos + 8], data[pos + 9]]) as usize;

        let start = pos + 10;
        let end = start + rdlength;
        if end > data.len() {
            return Err(Error::Protocol("truncated record data"));
        }
        self.pos = end;

        Ok(Record {
            rtype,
            class,
            ttl,
            rdata: &data[start..end],
        })
    }
}

impl<'a> Iterator for Answers<'a> {
    type Item = Result<Record<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let record = self.read_record();
        if record.is_err() {
            self.remaining = 0;
        }
        Some(record)
    }
}

/// Skip an encoded name, returning the offset just past it.
fn skip_name(data: &[u8], mut pos: usize) -> Result<usize> {
    loop {
        let Some(&b) = data.get(pos) else {
            return Err(Error::Protocol("truncated name"));
        };
        match b & 0xC0 {
            0x00 if b == 0 => return Ok(pos + 1),
            0x00 => pos += 1 + b as usize,
            0xC0 if pos + 2 <= data.len() => return Ok(pos + 2),
            0xC0 => return Err(Error::Protocol("truncated name pointer")),
            _ => return Err(Error::Protocol("unsupported label type")),
        }
    }
}
