//! Command-id arithmetic over wraparound 32-bit sequence numbers.
//!
//! AMQP 0-10 command ids are serial numbers in the RFC 1982 sense: ordering
//! is modular, so comparisons stay correct when the counter wraps, as long
//! as the live window is smaller than 2^31.

use std::cmp::Ordering;
use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};

/// A 32-bit command id with modular ordering.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct SequenceNumber(u32);

impl SequenceNumber {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// The id following this one, wrapping at 2^32.
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }

    pub const fn prev(self) -> Self {
        Self(self.0.wrapping_sub(1))
    }
}

impl From<u32> for SequenceNumber {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl Ord for SequenceNumber {
    fn cmp(&self, other: &Self) -> Ordering {
        let delta = other.0.wrapping_sub(self.0) as i32;
        match delta {
            0 => Ordering::Equal,
            d if d > 0 => Ordering::Less,
            _ => Ordering::Greater,
        }
    }
}

impl PartialOrd for SequenceNumber {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Debug for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An ordered set of sequence numbers, kept as coalesced inclusive ranges.
///
/// Used for the receiver's incomplete and known-completed windows and for
/// the accept sets batched into `message.accept`.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SequenceSet {
    // ascending by modular order, non-overlapping, non-adjacent
    ranges: Vec<(SequenceNumber, SequenceNumber)>,
}

impl SequenceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Number of ids contained.
    pub fn len(&self) -> usize {
        self.ranges
            .iter()
            .map(|&(a, b)| b.value().wrapping_sub(a.value()) as usize + 1)
            .sum()
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
    }

    /// Smallest contained id, by modular order.
    pub fn first(&self) -> Option<SequenceNumber> {
        self.ranges.first().map(|&(a, _)| a)
    }

    pub fn contains(&self, n: SequenceNumber) -> bool {
        self.ranges.iter().any(|&(a, b)| a <= n && n <= b)
    }

    pub fn add(&mut self, n: SequenceNumber) {
        self.add_range(n, n);
    }

    /// Insert the closed interval `[first, last]`, merging neighbours.
    pub fn add_range(&mut self, first: SequenceNumber, last: SequenceNumber) {
        debug_assert!(first <= last, "inverted range {first}..{last}");
        let mut merged = (first, last);
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for &(a, b) in &self.ranges {
            if b.next() < merged.0 {
                // entirely before the new range
                out.push((a, b));
            } else if merged.1.next() < a {
                // entirely after: emit the merged range first
                if !placed {
                    out.push(merged);
                    placed = true;
                }
                out.push((a, b));
            } else {
                // overlapping or adjacent: absorb
                merged.0 = merged.0.min(a);
                merged.1 = merged.1.max(b);
            }
        }
        if !placed {
            out.push(merged);
        }
        self.ranges = out;
    }

    /// Remove a single id, splitting its containing range if needed.
    pub fn remove(&mut self, n: SequenceNumber) {
        let Some(idx) = self.ranges.iter().position(|&(a, b)| a <= n && n <= b) else {
            return;
        };
        let (a, b) = self.ranges[idx];
        if a == b {
            self.ranges.remove(idx);
        } else if n == a {
            self.ranges[idx].0 = a.next();
        } else if n == b {
            self.ranges[idx].1 = b.prev();
        } else {
            self.ranges[idx] = (a, n.prev());
            self.ranges.insert(idx + 1, (n.next(), b));
        }
    }

    /// The contained inclusive ranges, ascending.
    pub fn ranges(&self) -> impl Iterator<Item = (SequenceNumber, SequenceNumber)> + '_ {
        self.ranges.iter().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = SequenceNumber> + '_ {
        self.ranges.iter().flat_map(|&(a, b)| {
            let count = b.value().wrapping_sub(a.value()) as u64 + 1;
            (0..count).map(move |off| SequenceNumber(a.value().wrapping_add(off as u32)))
        })
    }

    /// Compact wire form: a u16 range count, then big-endian (first, last)
    /// pairs. This is the payload shape `execution.result` carries for
    /// `message.acquire`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(2 + self.ranges.len() * 8);
        buf.put_u16(self.ranges.len() as u16);
        for &(a, b) in &self.ranges {
            buf.put_u32(a.value());
            buf.put_u32(b.value());
        }
        buf.freeze()
    }
}

impl FromIterator<SequenceNumber> for SequenceSet {
    fn from_iter<I: IntoIterator<Item = SequenceNumber>>(iter: I) -> Self {
        let mut set = Self::new();
        for n in iter {
            set.add(n);
        }
        set
    }
}

impl fmt::Debug for SequenceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, (a, b)) in self.ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "[{a},{b}]")?;
        }
        write!(f, "}}")
    }
}
