use std::net::Ipv4Addr;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::allocator::{AddressAllocator, AddressRange};
use crate::config::{Config, PoolSettings};
use crate::error::{Error, Result};
use crate::lease::{HardwareAddress, LeaseChange, LeaseRecord, LeaseTable};
use crate::store::{JsonLeaseStore, LeaseStore};

/// Decoded request handed over by the protocol layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseRequest {
    pub hardware_address: HardwareAddress,
    /// Host name option, empty when the client sent none.
    pub hostname: String,
}

/// The parts of a reply this engine fills in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaseResponse {
    pub your_ip_address: Ipv4Addr,
    pub lease_time_seconds: Option<u32>,
}

impl Default for LeaseResponse {
    fn default() -> Self {
        Self {
            your_ip_address: Ipv4Addr::UNSPECIFIED,
            lease_time_seconds: None,
        }
    }
}

/// Address handed to a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub ip: Ipv4Addr,
    /// Always the full configured lease time, never the remaining time of
    /// the stored lease.
    pub lease_time_seconds: u32,
}

/// Request handler owning the lease table and its store.
///
/// One guard covers the table lookup, the allocation decision and the
/// storage write of every request, so requests are fully serialized. Share
/// it across tasks with an `Arc`.
#[derive(Debug)]
pub struct LeaseService<S> {
    table: Mutex<LeaseTable>,
    store: S,
    range: AddressRange,
    lease_time: TimeDelta,
    lease_time_seconds: u32,
}

impl LeaseService<JsonLeaseStore> {
    /// Validates `config`, opens its lease file and reconciles the persisted
    /// leases.
    pub async fn open(config: &Config) -> Result<Self> {
        let settings = config.validate()?;
        let store = JsonLeaseStore::open(&settings.leases_file).await?;
        Self::new(&settings, store).await
    }
}

impl<S: LeaseStore> LeaseService<S> {
    /// Builds the service from validated settings.
    ///
    /// Exclusions are reserved first, then every persisted lease is
    /// re-allocated at its exact address. Nothing is served unless all of
    /// this succeeds.
    ///
    /// # Errors
    ///
    /// - [`Error::InvalidConfig`] for an unusable lease time or exclusion
    /// - [`Error::StorageRead`] if the persisted leases cannot be loaded
    /// - [`Error::Reconciliation`] if a persisted lease conflicts with the
    ///   allocator state
    pub async fn new(settings: &PoolSettings, store: S) -> Result<Self> {
        let lease_time = TimeDelta::from_std(settings.lease_time).map_err(|_| {
            Error::InvalidConfig(format!("lease duration {:?} is too large", settings.lease_time))
        })?;

        let allocator = AddressAllocator::new(settings.range, &settings.excluded)?;
        let mut table = LeaseTable::new(allocator);

        let records = store.load_all().await?;
        let loaded = records.len();
        table.restore(records)?;

        info!(
            "Loaded {} DHCPv4 leases from {}",
            loaded,
            settings.leases_file.display()
        );
        info!(
            "IP range: {} ({} addresses, {} excluded, {} free)",
            settings.range,
            settings.range.len(),
            settings.excluded.len(),
            table.allocator().free_count()
        );

        Ok(Self {
            table: Mutex::new(table),
            store,
            range: settings.range,
            lease_time,
            lease_time_seconds: settings.lease_time_seconds(),
        })
    }

    /// Returns the address for `hardware_address`, leasing or renewing as
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::PoolExhausted`] if a new client cannot be served; the
    /// caller should drop the request. Storage failures are logged and never
    /// returned.
    pub async fn handle_request(
        &self,
        hardware_address: HardwareAddress,
        hostname: &str,
    ) -> Result<Assignment> {
        self.handle_request_at(hardware_address, hostname, Utc::now())
            .await
    }

    /// [`handle_request`](Self::handle_request) with an explicit clock.
    pub async fn handle_request_at(
        &self,
        hardware_address: HardwareAddress,
        hostname: &str,
        now: DateTime<Utc>,
    ) -> Result<Assignment> {
        let mut table = self.table.lock().await;

        let is_new = table.get(&hardware_address).is_none();
        if is_new {
            info!(
                "MAC address {} is new, leasing new IPv4 address",
                hardware_address
            );
        }

        let change = match table.lease(hardware_address, hostname, now, self.lease_time) {
            Ok(change) => change,
            Err(err) => {
                warn!("Could not allocate IP for MAC {}: {}", hardware_address, err);
                return Err(err);
            }
        };

        if change.needs_persist()
            && let Err(err) = self.store.upsert(change.record()).await
        {
            if matches!(change, LeaseChange::Created(_)) {
                error!("Saving lease for MAC {} failed: {}", hardware_address, err);
            } else {
                error!("Could not persist lease for MAC {}: {}", hardware_address, err);
            }
        }

        let ip = change.record().ip;
        debug!("found IP address {} for MAC {}", ip, hardware_address);

        Ok(Assignment {
            ip,
            lease_time_seconds: self.lease_time_seconds,
        })
    }

    /// Protocol-layer entry point: fills `response` or returns `None` when
    /// the request must be dropped without a reply.
    pub async fn respond(
        &self,
        request: &LeaseRequest,
        mut response: LeaseResponse,
    ) -> Option<LeaseResponse> {
        let assignment = self
            .handle_request(request.hardware_address, &request.hostname)
            .await
            .ok()?;
        response.your_ip_address = assignment.ip;
        response.lease_time_seconds = Some(assignment.lease_time_seconds);
        Some(response)
    }

    /// Returns the lease held by a client, if any.
    pub async fn lease_for(&self, hardware_address: &HardwareAddress) -> Option<LeaseRecord> {
        self.table.lock().await.get(hardware_address).cloned()
    }

    /// Returns all leases (including expired ones), sorted by IP.
    pub async fn leases(&self) -> Vec<LeaseRecord> {
        self.table.lock().await.records()
    }

    /// Returns true if `ip` is leased or excluded.
    pub async fn is_taken(&self, ip: Ipv4Addr) -> bool {
        self.table.lock().await.allocator().is_taken(ip)
    }

    /// Returns the count of addresses still available for new clients.
    pub async fn free_count(&self) -> u64 {
        self.table.lock().await.allocator().free_count()
    }

    pub fn range(&self) -> AddressRange {
        self.range
    }

    /// The configured lease time, rounded to whole seconds.
    pub fn lease_time(&self) -> Duration {
        Duration::from_secs(u64::from(self.lease_time_seconds))
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
