//! Compact IPv6 address sets
//!
//! An [`AddressSet`] stores sorted, non-overlapping, non-adjacent inclusive
//! ranges of IPv6 addresses. Every constructor normalizes, so two sets built
//! from the same addresses in any order compare equal, containment is a
//! binary search, and a union is a k-way merge of already sorted runs with
//! no re-sort.
//!
//! Sets are immutable once built. Mutation happens by building a new set and
//! swapping it in whole, which is what the dynamic watcher publishes.

use crate::error::{NdpError, Result};
use ipnet::Ipv6Net;
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fmt;
use std::net::Ipv6Addr;

/// Immutable set of IPv6 addresses and prefixes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    /// Inclusive `(first, last)` ranges, sorted by `first`
    ranges: Vec<(u128, u128)>,
}

impl AddressSet {
    /// The empty set
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from configured prefix strings such as `2001:db8::/64`.
    ///
    /// A bare address is accepted as a `/128`. The first entry that fails to
    /// parse aborts the build and is named in the error.
    pub fn from_prefixes<I, S>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut builder = AddressSetBuilder::default();
        for entry in entries {
            builder.add_prefix(parse_prefix(entry.as_ref())?);
        }
        Ok(builder.build())
    }

    /// Build an exact-address set
    pub fn from_addresses<I>(addrs: I) -> Self
    where
        I: IntoIterator<Item = Ipv6Addr>,
    {
        let mut builder = AddressSetBuilder::default();
        for addr in addrs {
            builder.add(addr);
        }
        builder.build()
    }

    /// Union of any number of sets, O(n log k) for n ranges over k sets
    pub fn union<'a, I>(sets: I) -> Self
    where
        I: IntoIterator<Item = &'a AddressSet>,
    {
        let runs: Vec<&[(u128, u128)]> = sets
            .into_iter()
            .map(|set| set.ranges.as_slice())
            .filter(|run| !run.is_empty())
            .collect();

        // Min-heap of each run's next range: (first, last, run, position)
        let mut heads: BinaryHeap<Reverse<(u128, u128, usize, usize)>> = runs
            .iter()
            .enumerate()
            .map(|(run, ranges)| Reverse((ranges[0].0, ranges[0].1, run, 0)))
            .collect();

        let mut merged = Vec::with_capacity(runs.iter().map(|run| run.len()).sum());
        while let Some(Reverse((first, last, run, pos))) = heads.pop() {
            push_merged(&mut merged, first, last);
            if let Some(&(next_first, next_last)) = runs[run].get(pos + 1) {
                heads.push(Reverse((next_first, next_last, run, pos + 1)));
            }
        }
        Self { ranges: merged }
    }

    /// Membership test, O(log n) in the number of ranges
    pub fn contains(&self, addr: &Ipv6Addr) -> bool {
        let value = u128::from(*addr);
        let idx = self.ranges.partition_point(|&(first, _)| first <= value);
        idx > 0 && self.ranges[idx - 1].1 >= value
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of disjoint ranges after normalization
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Inclusive ranges in ascending order
    pub fn ranges(&self) -> impl Iterator<Item = (Ipv6Addr, Ipv6Addr)> + '_ {
        self.ranges
            .iter()
            .map(|&(first, last)| (Ipv6Addr::from(first), Ipv6Addr::from(last)))
    }
}

impl fmt::Display for AddressSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (first, last)) in self.ranges().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            if first == last {
                write!(f, "{first}")?;
            } else {
                write!(f, "{first}-{last}")?;
            }
        }
        f.write_str("}")
    }
}

/// Accumulates addresses and prefixes, then normalizes into an [`AddressSet`]
#[derive(Debug, Default)]
pub struct AddressSetBuilder {
    ranges: Vec<(u128, u128)>,
}

impl AddressSetBuilder {
    pub fn add(&mut self, addr: Ipv6Addr) -> &mut Self {
        let value = u128::from(addr);
        self.ranges.push((value, value));
        self
    }

    pub fn add_prefix(&mut self, prefix: Ipv6Net) -> &mut Self {
        self.ranges.push((
            u128::from(prefix.network()),
            u128::from(prefix.broadcast()),
        ));
        self
    }

    /// Sort and merge overlapping or adjacent ranges
    pub fn build(mut self) -> AddressSet {
        self.ranges.sort_by_key(|&(first, _)| first);

        let mut merged: Vec<(u128, u128)> = Vec::with_capacity(self.ranges.len());
        for (first, last) in self.ranges {
            push_merged(&mut merged, first, last);
        }
        AddressSet { ranges: merged }
    }
}

/// Append a range that starts at or after the last one, folding it in when
/// the two overlap or touch
fn push_merged(merged: &mut Vec<(u128, u128)>, first: u128, last: u128) {
    match merged.last_mut() {
        Some(prev) if first <= prev.1.saturating_add(1) => {
            prev.1 = prev.1.max(last);
        }
        _ => merged.push((first, last)),
    }
}

/// Parse one configured subnet entry
pub fn parse_prefix(entry: &str) -> Result<Ipv6Net> {
    let entry = entry.trim();
    if entry.contains('/') {
        entry
            .parse::<Ipv6Net>()
            .map_err(|e| NdpError::InvalidPrefix {
                entry: entry.to_string(),
                reason: e.to_string(),
            })
    } else {
        entry
            .parse::<Ipv6Addr>()
            .map(Ipv6Net::from)
            .map_err(|e| NdpError::InvalidPrefix {
                entry: entry.to_string(),
                reason: e.to_string(),
            })
    }
}
