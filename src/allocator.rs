//! Address range bookkeeping.
//!
//! [`AddressAllocator`] tracks which addresses of a contiguous IPv4 range are
//! taken using one bit per address. Addresses are never returned to the free
//! pool: once leased (or excluded) an address stays reserved for the life of
//! the process.
//!
//! The allocator has no internal locking. It is owned by the
//! [`LeaseTable`](crate::LeaseTable), which is only ever touched while the
//! service-wide guard is held.

use std::fmt;
use std::net::Ipv4Addr;

use crate::error::{Error, Result};

const WORD_BITS: u64 = u64::BITS as u64;

/// An inclusive IPv4 range with `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    start: Ipv4Addr,
    end: Ipv4Addr,
}

#[allow(clippy::len_without_is_empty)]
impl AddressRange {
    /// Creates a range, rejecting empty or inverted bounds.
    pub fn new(start: Ipv4Addr, end: Ipv4Addr) -> Result<Self> {
        if u32::from(start) >= u32::from(end) {
            return Err(Error::InvalidConfig(format!(
                "start of IP range ({}) has to be lower than the end of the range ({})",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> Ipv4Addr {
        self.start
    }

    pub fn end(&self) -> Ipv4Addr {
        self.end
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let addr = u32::from(ip);
        addr >= u32::from(self.start) && addr <= u32::from(self.end)
    }

    /// Number of addresses in the range, both bounds included. Never less
    /// than two, so there is no `is_empty`.
    pub fn len(&self) -> u64 {
        u64::from(u32::from(self.end)) - u64::from(u32::from(self.start)) + 1
    }

    fn offset_of(&self, ip: Ipv4Addr) -> Option<u64> {
        self.contains(ip)
            .then(|| u64::from(u32::from(ip) - u32::from(self.start)))
    }

    fn address_at(&self, offset: u64) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.start) + offset as u32)
    }
}

impl fmt::Display for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

/// Bitmap allocator over an [`AddressRange`].
#[derive(Debug, Clone)]
pub struct AddressAllocator {
    range: AddressRange,
    words: Vec<u64>,
    taken: u64,
}

impl AddressAllocator {
    /// Creates an allocator with every address in `excluded` pre-marked taken.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] if an excluded address lies outside
    /// the range. Listing the same address twice is harmless.
    pub fn new(range: AddressRange, excluded: &[Ipv4Addr]) -> Result<Self> {
        let word_count = range.len().div_ceil(WORD_BITS) as usize;
        let mut allocator = Self {
            range,
            words: vec![0; word_count],
            taken: 0,
        };

        for &ip in excluded {
            let offset = range.offset_of(ip).ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "excluded IP {} is not in the range {}",
                    ip, range
                ))
            })?;
            allocator.mark(offset);
        }

        Ok(allocator)
    }

    /// Allocates an address.
    ///
    /// With no preference (`None` or `0.0.0.0`) the lowest free address is
    /// taken. A free requested address is taken as is; a requested address
    /// that is already taken is only a hint, and the lowest free address is
    /// returned instead. Callers needing the exact address must compare.
    ///
    /// # Errors
    ///
    /// - [`Error::AddressOutOfRange`] if the requested address is outside the range
    /// - [`Error::PoolExhausted`] if no address is free
    pub fn allocate(&mut self, requested: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
        if let Some(ip) = requested.filter(|ip| !ip.is_unspecified()) {
            let offset = self
                .range
                .offset_of(ip)
                .ok_or(Error::AddressOutOfRange(ip))?;
            if !self.is_marked(offset) {
                self.mark(offset);
                return Ok(ip);
            }
        }

        let offset = self.next_free().ok_or(Error::PoolExhausted)?;
        self.mark(offset);
        Ok(self.range.address_at(offset))
    }

    /// Returns true if `ip` is in range and taken. Out-of-range addresses are
    /// never taken.
    pub fn is_taken(&self, ip: Ipv4Addr) -> bool {
        self.range
            .offset_of(ip)
            .is_some_and(|offset| self.is_marked(offset))
    }

    pub fn free_count(&self) -> u64 {
        self.range.len() - self.taken
    }

    pub fn capacity(&self) -> u64 {
        self.range.len()
    }

    pub fn range(&self) -> AddressRange {
        self.range
    }

    fn is_marked(&self, offset: u64) -> bool {
        let word = self.words[(offset / WORD_BITS) as usize];
        word & (1 << (offset % WORD_BITS)) != 0
    }

    fn mark(&mut self, offset: u64) {
        if !self.is_marked(offset) {
            self.words[(offset / WORD_BITS) as usize] |= 1 << (offset % WORD_BITS);
            self.taken += 1;
        }
    }

    fn next_free(&self) -> Option<u64> {
        self.words
            .iter()
            .enumerate()
            .find(|(_, word)| **word != u64::MAX)
            .map(|(index, word)| index as u64 * WORD_BITS + u64::from(word.trailing_ones()))
            .filter(|offset| *offset < self.range.len())
    }
}
