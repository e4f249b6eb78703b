//! Lease records and the in-memory lease table.
//!
//! This module holds the per-client state machine. A hardware address is
//! either unknown (absent from the table) or leased. Leases are created on
//! the first request from a client and renewed on later requests whenever
//! renewing would extend the client's coverage. They are never removed.
//!
//! # Thread Safety
//!
//! [`LeaseTable`] is a plain data structure. The
//! [`LeaseService`](crate::LeaseService) wraps it in a single
//! [`tokio::sync::Mutex`] together with the allocator it owns, so every
//! lookup, allocation and update happens under one guard.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};

use crate::allocator::AddressAllocator;
use crate::error::{Error, Result};

/// A 6-byte link-layer address, the stable key of a client's lease.
///
/// Parses colon or dash separated hex and always displays in canonical
/// lower-case colon form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HardwareAddress([u8; 6]);

impl HardwareAddress {
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl From<[u8; 6]> for HardwareAddress {
    fn from(octets: [u8; 6]) -> Self {
        Self(octets)
    }
}

impl FromStr for HardwareAddress {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        let normalized = value.trim().replace('-', ":");
        let mut octets = [0u8; 6];
        let mut parts = normalized.split(':');

        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .filter(|part| part.len() == 2)
                .ok_or_else(|| Error::InvalidHardwareAddress(value.to_string()))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| Error::InvalidHardwareAddress(value.to_string()))?;
        }

        if parts.next().is_some() {
            return Err(Error::InvalidHardwareAddress(value.to_string()));
        }

        Ok(Self(octets))
    }
}

impl fmt::Display for HardwareAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// A lease held by one hardware address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRecord {
    /// The client owning this lease.
    pub hardware_address: HardwareAddress,

    /// The IP address assigned to this client.
    pub ip: Ipv4Addr,

    /// Expiry as seconds since the Unix epoch.
    ///
    /// Advisory only: an expired lease keeps its address.
    pub expires_at: i64,

    /// Client-provided hostname, empty if none was sent.
    pub hostname: String,
}

impl LeaseRecord {
    /// Returns the expiry as a timestamp, or `None` if it is out of range.
    pub fn expires(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.expires_at, 0)
    }

    /// Returns true if the lease has expired.
    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.expires_at
    }

    /// Returns seconds remaining until expiration, or 0 if expired.
    pub fn remaining_seconds(&self) -> i64 {
        (self.expires_at - Utc::now().timestamp()).max(0)
    }

    /// Whether renewing at `now` for `lease_time` would push the expiry out.
    fn needs_renewal(&self, now: DateTime<Utc>, lease_time: TimeDelta) -> bool {
        self.expires()
            .is_none_or(|expires| expires < now + lease_time)
    }
}

/// Outcome of [`LeaseTable::lease`]. Created and renewed records must be
/// persisted; unchanged ones must not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseChange {
    Created(LeaseRecord),
    Renewed(LeaseRecord),
    Unchanged(LeaseRecord),
}

impl LeaseChange {
    pub fn record(&self) -> &LeaseRecord {
        match self {
            LeaseChange::Created(record)
            | LeaseChange::Renewed(record)
            | LeaseChange::Unchanged(record) => record,
        }
    }

    pub fn needs_persist(&self) -> bool {
        !matches!(self, LeaseChange::Unchanged(_))
    }
}

/// Hardware address → lease mapping combined with the address allocator.
#[derive(Debug)]
pub struct LeaseTable {
    records: HashMap<HardwareAddress, LeaseRecord>,
    allocator: AddressAllocator,
}

impl LeaseTable {
    /// Creates an empty table over `allocator`.
    pub fn new(allocator: AddressAllocator) -> Self {
        Self {
            records: HashMap::new(),
            allocator,
        }
    }

    /// Installs persisted leases, re-allocating each address exactly.
    ///
    /// Records are restored in ascending IP order so conflicts are reported
    /// deterministically.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Reconciliation`] if any record is out of range, hits
    /// an excluded address, or shares its address with another record.
    pub fn restore(&mut self, records: HashMap<HardwareAddress, LeaseRecord>) -> Result<()> {
        let mut records: Vec<_> = records.into_values().collect();
        records.sort_by_key(|record| (record.ip, record.hardware_address));

        for record in records {
            let reconciliation_error = |reason: String| Error::Reconciliation {
                hardware_address: record.hardware_address.to_string(),
                ip: record.ip,
                reason,
            };

            let ip = self
                .allocator
                .allocate(Some(record.ip))
                .map_err(|error| reconciliation_error(error.to_string()))?;
            if ip != record.ip {
                return Err(reconciliation_error(
                    "address is already taken by another lease or excluded".to_string(),
                ));
            }

            self.records.insert(record.hardware_address, record);
        }

        Ok(())
    }

    /// Applies the allocate-or-renew policy for one request.
    ///
    /// # Behavior
    ///
    /// - Unknown client: allocate the lowest free address with
    ///   `expires_at = now + lease_time` (truncated to seconds)
    /// - Known client whose lease ends before `now + lease_time`: extend to
    ///   `now + lease_time` rounded to seconds and take the new hostname
    /// - Otherwise the record is left untouched
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if a new client cannot be given an
    /// address. The table is not modified in that case.
    pub fn lease(
        &mut self,
        hardware_address: HardwareAddress,
        hostname: &str,
        now: DateTime<Utc>,
        lease_time: TimeDelta,
    ) -> Result<LeaseChange> {
        let deadline = now + lease_time;

        if let Some(record) = self.records.get_mut(&hardware_address) {
            if !record.needs_renewal(now, lease_time) {
                return Ok(LeaseChange::Unchanged(record.clone()));
            }
            record.expires_at = deadline.round_subsecs(0).timestamp();
            record.hostname = hostname.to_string();
            return Ok(LeaseChange::Renewed(record.clone()));
        }

        let ip = self.allocator.allocate(None)?;
        let record = LeaseRecord {
            hardware_address,
            ip,
            expires_at: deadline.timestamp(),
            hostname: hostname.to_string(),
        };
        self.records.insert(hardware_address, record.clone());
        Ok(LeaseChange::Created(record))
    }

    pub fn get(&self, hardware_address: &HardwareAddress) -> Option<&LeaseRecord> {
        self.records.get(hardware_address)
    }

    /// Returns all leases (including expired ones), sorted by IP.
    pub fn records(&self) -> Vec<LeaseRecord> {
        let mut records: Vec<_> = self.records.values().cloned().collect();
        records.sort_by_key(|record| record.ip);
        records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn allocator(&self) -> &AddressAllocator {
        &self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AddressRange;

    fn mac(last: u8) -> HardwareAddress {
        HardwareAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, last])
    }

    fn test_table(excluded: &[Ipv4Addr]) -> LeaseTable {
        let range = AddressRange::new(Ipv4Addr::new(10, 0, 0, 10), Ipv4Addr::new(10, 0, 0, 12)).unwrap();
        LeaseTable::new(AddressAllocator::new(range, excluded).unwrap())
    }

    fn at(seconds: i64, millis: u32) -> DateTime<Utc> {
        DateTime::from_timestamp(seconds, millis * 1_000_000).unwrap()
    }

    fn record(last: u8, ip: [u8; 4], expires_at: i64) -> LeaseRecord {
        LeaseRecord {
            hardware_address: mac(last),
            ip: Ipv4Addr::from(ip),
            expires_at,
            hostname: String::new(),
        }
    }

    #[test]
    fn test_hardware_address_parsing() {
        let parsed: HardwareAddress = "AA-BB-CC-DD-EE-01".parse().unwrap();
        assert_eq!(parsed, mac(0x01));
        assert_eq!(parsed.to_string(), "aa:bb:cc:dd:ee:01");
        assert_eq!("aa:bb:cc:dd:ee:01".parse::<HardwareAddress>().unwrap(), parsed);

        for invalid in ["", "aa:bb:cc:dd:ee", "aa:bb:cc:dd:ee:01:02", "aa:bb:cc:dd:ee:zz", "a:bb:cc:dd:ee:01"] {
            assert!(
                matches!(invalid.parse::<HardwareAddress>(), Err(Error::InvalidHardwareAddress(_))),
                "{:?} accepted",
                invalid
            );
        }
    }

    #[test]
    fn test_record_helpers() {
        let now = Utc::now().timestamp();
        let active = record(1, [10, 0, 0, 10], now + 3600);
        assert!(!active.is_expired());
        assert!(active.remaining_seconds() > 3500);

        let expired = record(1, [10, 0, 0, 10], now - 1);
        assert!(expired.is_expired());
        assert_eq!(expired.remaining_seconds(), 0);
        assert_eq!(expired.expires().unwrap().timestamp(), now - 1);
    }

    #[test]
    fn test_new_lease_truncates_expiry() {
        let mut table = test_table(&[]);
        let change = table
            .lease(mac(1), "alpha", at(1_000, 900), TimeDelta::hours(1))
            .unwrap();
        assert!(change.needs_persist());
        let LeaseChange::Created(record) = change else {
            panic!("expected a new lease");
        };
        assert_eq!(record.ip, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(record.expires_at, 4_600);
        assert_eq!(record.hostname, "alpha");
        assert_eq!(table.get(&mac(1)), Some(&record));
    }

    #[test]
    fn test_renewal_rounds_and_updates_hostname() {
        let mut table = test_table(&[]);
        table.lease(mac(1), "alpha", at(1_000, 0), TimeDelta::hours(1)).unwrap();

        let change = table
            .lease(mac(1), "beta", at(1_010, 600), TimeDelta::hours(1))
            .unwrap();
        let LeaseChange::Renewed(record) = change else {
            panic!("expected a renewal");
        };
        assert_eq!(record.ip, Ipv4Addr::new(10, 0, 0, 10));
        assert_eq!(record.expires_at, 4_611);
        assert_eq!(record.hostname, "beta");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_no_renewal_when_coverage_would_not_grow() {
        let mut table = test_table(&[]);
        table
            .restore(HashMap::from([(mac(1), record(1, [10, 0, 0, 11], 10_000))]))
            .unwrap();

        let change = table
            .lease(mac(1), "renamed", at(1_000, 0), TimeDelta::hours(1))
            .unwrap();
        assert!(!change.needs_persist());
        assert_eq!(change.record().expires_at, 10_000);
        assert_eq!(change.record().hostname, "");

        // Exactly at the deadline nothing is extended either.
        let change = table
            .lease(mac(1), "renamed", at(6_400, 0), TimeDelta::hours(1))
            .unwrap();
        assert!(matches!(change, LeaseChange::Unchanged(_)));

        let change = table
            .lease(mac(1), "renamed", at(6_400, 1), TimeDelta::hours(1))
            .unwrap();
        assert!(matches!(change, LeaseChange::Renewed(ref record) if record.expires_at == 10_000));
    }

    #[test]
    fn test_exhaustion_leaves_table_untouched() {
        let mut table = test_table(&[Ipv4Addr::new(10, 0, 0, 11)]);
        let lease_time = TimeDelta::hours(1);
        assert_eq!(
            table.lease(mac(1), "", at(0, 0), lease_time).unwrap().record().ip,
            Ipv4Addr::new(10, 0, 0, 10)
        );
        assert_eq!(
            table.lease(mac(2), "", at(0, 0), lease_time).unwrap().record().ip,
            Ipv4Addr::new(10, 0, 0, 12)
        );
        assert!(matches!(
            table.lease(mac(3), "", at(0, 0), lease_time),
            Err(Error::PoolExhausted)
        ));
        assert!(table.get(&mac(3)).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_restore_marks_addresses_taken() {
        let mut table = test_table(&[]);
        table
            .restore(HashMap::from([
                (mac(1), record(1, [10, 0, 0, 12], 100)),
                (mac(2), record(2, [10, 0, 0, 10], 100)),
            ]))
            .unwrap();
        assert!(table.allocator().is_taken(Ipv4Addr::new(10, 0, 0, 10)));
        assert!(table.allocator().is_taken(Ipv4Addr::new(10, 0, 0, 12)));
        assert_eq!(table.allocator().free_count(), 1);

        let change = table.lease(mac(3), "", at(0, 0), TimeDelta::hours(1)).unwrap();
        assert_eq!(change.record().ip, Ipv4Addr::new(10, 0, 0, 11));
        assert_eq!(
            table.records().iter().map(|record| record.ip).collect::<Vec<_>>(),
            vec![
                Ipv4Addr::new(10, 0, 0, 10),
                Ipv4Addr::new(10, 0, 0, 11),
                Ipv4Addr::new(10, 0, 0, 12)
            ]
        );
    }

    #[test]
    fn test_restore_conflicts() {
        let mut table = test_table(&[]);
        let duplicate_ip = HashMap::from([
            (mac(1), record(1, [10, 0, 0, 10], 100)),
            (mac(2), record(2, [10, 0, 0, 10], 100)),
        ]);
        assert!(matches!(
            table.restore(duplicate_ip),
            Err(Error::Reconciliation { ip, .. }) if ip == Ipv4Addr::new(10, 0, 0, 10)
        ));

        let mut table = test_table(&[Ipv4Addr::new(10, 0, 0, 11)]);
        let excluded = HashMap::from([(mac(1), record(1, [10, 0, 0, 11], 100))]);
        assert!(matches!(table.restore(excluded), Err(Error::Reconciliation { .. })));

        let mut table = test_table(&[]);
        let outside = HashMap::from([(mac(1), record(1, [10, 0, 1, 10], 100))]);
        assert!(matches!(table.restore(outside), Err(Error::Reconciliation { .. })));
    }
}
