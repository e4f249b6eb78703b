//! # rangelease
//!
//! An IPv4 DHCP lease allocation engine. It sits behind a DHCP protocol layer
//! and answers one question per request: which address does this hardware
//! address get, and for how long.
//!
//! ## Features
//!
//! - Stable addresses per hardware address, allocated lowest-first from a
//!   contiguous range
//! - Excluded addresses that are never leased
//! - Leases persisted to a JSON file with atomic replace
//! - Startup reconciliation of persisted leases against the allocator
//! - One service-wide guard: no address is ever handed to two clients
//!
//! ## Quick Start
//!
//! ```no_run
//! use rangelease::{Config, LeaseService};
//!
//! #[tokio::main]
//! async fn main() -> rangelease::Result<()> {
//!     let config = Config::load_or_create("config.json")?;
//!     let service = LeaseService::open(&config).await?;
//!     let mac = "aa:bb:cc:dd:ee:01".parse()?;
//!     let assignment = service.handle_request(mac, "laptop").await?;
//!     println!("{} for {}s", assignment.ip, assignment.lease_time_seconds);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`AddressAllocator`] - Bitmap over the configured [`AddressRange`]
//! - [`LeaseStore`] - Durable lease storage ([`JsonLeaseStore`], [`MemoryLeaseStore`])
//! - [`LeaseTable`] - Hardware address to [`LeaseRecord`] mapping plus the allocator
//! - [`LeaseService`] - Request handler applying the allocate-or-renew policy
//! - [`Config`] - Storage location, range, lease time and exclusions

pub mod allocator;
pub mod config;
pub mod error;
pub mod lease;
pub mod service;
pub mod store;

pub use allocator::{AddressAllocator, AddressRange};
pub use config::{Config, PoolSettings, parse_duration};
pub use error::{Error, Result};
pub use lease::{HardwareAddress, LeaseChange, LeaseRecord, LeaseTable};
pub use service::{Assignment, LeaseRequest, LeaseResponse, LeaseService};
pub use store::{JsonLeaseStore, LeaseStore, MemoryLeaseStore};
