//! Error types for the lease engine.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! the [`Error`] enum for error variants.

use std::net::Ipv4Addr;

/// Errors that can occur while configuring or running the lease engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// File system I/O error (configuration files).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error (configuration files).
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    ///
    /// Returned by [`Config::validate`](crate::Config::validate) and during
    /// allocator construction when the range, lease time, storage location or
    /// exclusion list is unusable. Always fatal at startup.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A hardware address string could not be parsed.
    #[error("Invalid hardware address: {0}")]
    InvalidHardwareAddress(String),

    /// Requested IP address is outside the configured range.
    #[error("Address {0} is outside the configured range")]
    AddressOutOfRange(Ipv4Addr),

    /// Every address in the range is leased or excluded.
    ///
    /// Per request and non-fatal: the protocol layer drops the packet and the
    /// client retries later.
    #[error("No available IP addresses in range")]
    PoolExhausted,

    /// A persisted lease conflicts with the allocator state at startup.
    #[error("Lease {ip} for {hardware_address} cannot be restored: {reason}")]
    Reconciliation {
        hardware_address: String,
        ip: Ipv4Addr,
        reason: String,
    },

    /// The persisted lease set could not be read. Fatal at startup.
    #[error("Failed to read lease storage: {0}")]
    StorageRead(String),

    /// A lease could not be written to durable storage.
    #[error("Failed to write lease storage: {0}")]
    StorageWrite(String),
}

/// A specialized Result type for lease operations.
pub type Result<T> = std::result::Result<T, Error>;
