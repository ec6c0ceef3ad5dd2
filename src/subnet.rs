//! Table of known internal IPv4 ranges.
//!
//! Loaded once at startup from a subnet list (one `a.b.c.d/len` per line)
//! and shared read-only by every session.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Subnet {
    network: u32,
    mask: u32,
}

/// Sorted set of (network, mask) pairs.
#[derive(Debug, Default)]
pub struct SubnetTable {
    subnets: Vec<Subnet>,
}

impl SubnetTable {
    /// Build a table from `address/prefix` entries.
    ///
    /// Blank entries and entries starting with `#` are skipped. Errors carry
    /// the 1-based position of the offending entry.
    pub fn build<'a, I>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut subnets = Vec::new();

        for (index, entry) in entries.into_iter().enumerate() {
            let entry = entry.trim();
            if entry.is_empty() || entry.starts_with('#') {
                continue;
            }
            subnets.push(parse_entry(index + 1, entry)?);
        }

        subnets.sort_unstable_by_key(|s| s.network);

        Ok(Self { subnets })
    }

    /// Load a table from a subnet list file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)?;

        Self::build(contents.lines())
    }

    /// Check whether a host-order address falls inside a known range.
    ///
    /// Only the closest network at or below `addr` is consulted; entries are
    /// expected not to overlap.
    pub fn contains(&self, addr: u32) -> bool {
        let upper = self.subnets.partition_point(|s| s.network <= addr);
        if upper == 0 {
            return false;
        }

        let subnet = self.subnets[upper - 1];
        addr & subnet.mask == subnet.network
    }

    pub fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        self.contains(u32::from(ip))
    }

    pub fn len(&self) -> usize {
        self.subnets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subnets.is_empty()
    }
}

fn parse_entry(line: usize, entry: &str) -> Result<Subnet> {
    let invalid = |reason| Error::InvalidSubnet {
        line,
        entry: entry.to_string(),
        reason,
    };

    let (addr, prefix) = entry.split_once('/').ok_or_else(|| invalid("missing prefix length"))?;
    let addr: Ipv4Addr = addr.trim().parse().map_err(|_| invalid("invalid IPv4 address"))?;
    let prefix: u32 = prefix.trim().parse().map_err(|_| invalid("prefix length is not a number"))?;
    if prefix > 32 {
        return Err(invalid("prefix length out of range"));
    }

    let mask = prefix_mask(prefix);

    Ok(Subnet {
        network: u32::from(addr) & mask,
        mask,
    })
}

/// Network mask for a prefix length; `0` matches every address.
fn prefix_mask(prefix: u32) -> u32 {
    !u32::MAX.checked_shr(prefix).unwrap_or(0)
}
