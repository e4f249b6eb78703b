//! Durable lease storage.
//!
//! A [`LeaseStore`] maps hardware addresses to lease records. It is read once
//! at startup ([`LeaseStore::load_all`]) and written on every lease change
//! ([`LeaseStore::upsert`]). Excluded addresses are never stored; they are
//! re-derived from configuration on every start.
//!
//! [`JsonLeaseStore`] keeps all leases in one JSON document. Each write goes
//! to a temporary file that is synced and then renamed over the lease file,
//! so after a crash the file holds either the previous or the new document.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{Error, Result};
use crate::lease::{HardwareAddress, LeaseRecord};

/// Persistence contract used by the [`LeaseService`](crate::LeaseService).
pub trait LeaseStore: Send + Sync {
    /// Reads every persisted lease. Errors are [`Error::StorageRead`].
    fn load_all(&self) -> impl Future<Output = Result<HashMap<HardwareAddress, LeaseRecord>>> + Send;

    /// Writes `record`, replacing any lease stored for the same hardware
    /// address. Errors are [`Error::StorageWrite`].
    fn upsert(&self, record: &LeaseRecord) -> impl Future<Output = Result<()>> + Send;
}

/// On-disk lease format (serialized to JSON).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct LeaseFile {
    /// Leases indexed by canonical hardware address.
    #[serde(default)]
    leases: BTreeMap<String, StoredLease>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredLease {
    ip: Ipv4Addr,
    expires: i64,
    #[serde(default)]
    hostname: String,
}

impl StoredLease {
    fn into_record(self, hardware_address: HardwareAddress) -> LeaseRecord {
        LeaseRecord {
            hardware_address,
            ip: self.ip,
            expires_at: self.expires,
            hostname: self.hostname,
        }
    }
}

impl From<&LeaseRecord> for StoredLease {
    fn from(record: &LeaseRecord) -> Self {
        Self {
            ip: record.ip,
            expires: record.expires_at,
            hostname: record.hostname.clone(),
        }
    }
}

/// Lease store backed by a single JSON file.
#[derive(Debug)]
pub struct JsonLeaseStore {
    path: PathBuf,
    /// Last written document. Also serializes concurrent writers.
    leases: Mutex<BTreeMap<String, StoredLease>>,
}

impl JsonLeaseStore {
    /// Opens the lease file at `path`, creating it (and its parent
    /// directory) if it does not exist yet. An existing file is read right
    /// away, so upserts never drop leases written by an earlier run.
    ///
    /// # Errors
    ///
    /// - [`Error::StorageRead`] if an existing file cannot be read or parsed
    /// - [`Error::StorageWrite`] if the file cannot be created
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = Self {
            path,
            leases: Mutex::new(BTreeMap::new()),
        };

        if tokio::fs::try_exists(&store.path)
            .await
            .map_err(|error| store.read_error(error))?
        {
            let leases = store.read_document().await?;
            debug!(
                "Opened lease file {} with {} leases",
                store.path.display(),
                leases.len()
            );
            *store.leases.lock().await = leases;
        } else {
            if let Some(parent) = store.path.parent()
                && !parent.as_os_str().is_empty()
            {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|error| store.write_error(error))?;
            }
            store.write_document(&LeaseFile::default()).await?;
            debug!("Created empty lease file {}", store.path.display());
        }

        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_error(&self, error: impl std::fmt::Display) -> Error {
        Error::StorageWrite(format!("{}: {}", self.path.display(), error))
    }

    fn read_error(&self, error: impl std::fmt::Display) -> Error {
        Error::StorageRead(format!("{}: {}", self.path.display(), error))
    }

    /// Reads the lease file, keyed by canonical hardware address. When the
    /// file spells one address several ways, the last spelling wins.
    async fn read_document(&self) -> Result<BTreeMap<String, StoredLease>> {
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|error| self.read_error(error))?;

        if content.trim().is_empty() {
            return Ok(BTreeMap::new());
        }

        let document: LeaseFile =
            serde_json::from_str(&content).map_err(|error| self.read_error(error))?;

        let mut leases = BTreeMap::new();
        for (key, stored) in document.leases {
            let hardware_address: HardwareAddress =
                key.parse().map_err(|error| self.read_error(error))?;
            leases.insert(hardware_address.to_string(), stored);
        }
        Ok(leases)
    }

    async fn write_document(&self, document: &LeaseFile) -> Result<()> {
        let content =
            serde_json::to_vec_pretty(document).map_err(|error| self.write_error(error))?;
        let temp_path = self.temp_path();

        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|error| self.write_error(error))?;
        file.write_all(&content)
            .await
            .map_err(|error| self.write_error(error))?;
        file.sync_all()
            .await
            .map_err(|error| self.write_error(error))?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|error| self.write_error(error))
    }
}

impl LeaseStore for JsonLeaseStore {
    async fn load_all(&self) -> Result<HashMap<HardwareAddress, LeaseRecord>> {
        let leases = self.read_document().await?;

        let mut records = HashMap::with_capacity(leases.len());
        for (key, stored) in &leases {
            let hardware_address: HardwareAddress =
                key.parse().map_err(|error| self.read_error(error))?;
            records.insert(hardware_address, stored.clone().into_record(hardware_address));
        }

        *self.leases.lock().await = leases;
        Ok(records)
    }

    async fn upsert(&self, record: &LeaseRecord) -> Result<()> {
        let mut leases = self.leases.lock().await;
        leases.insert(record.hardware_address.to_string(), StoredLease::from(record));

        let document = LeaseFile {
            leases: leases.clone(),
        };
        self.write_document(&document).await
    }
}

/// Volatile lease store. Nothing survives the process; useful when the
/// caller handles persistence elsewhere, and in tests.
#[derive(Debug, Default)]
pub struct MemoryLeaseStore {
    leases: Mutex<HashMap<HardwareAddress, LeaseRecord>>,
    writes: AtomicUsize,
}

impl MemoryLeaseStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-populated with `records`.
    pub fn with_records<I: IntoIterator<Item = LeaseRecord>>(records: I) -> Self {
        let leases = records
            .into_iter()
            .map(|record| (record.hardware_address, record))
            .collect();
        Self {
            leases: Mutex::new(leases),
            writes: AtomicUsize::new(0),
        }
    }

    pub async fn get(&self, hardware_address: &HardwareAddress) -> Option<LeaseRecord> {
        self.leases.lock().await.get(hardware_address).cloned()
    }

    /// Number of successful upserts since creation.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl LeaseStore for MemoryLeaseStore {
    async fn load_all(&self) -> Result<HashMap<HardwareAddress, LeaseRecord>> {
        Ok(self.leases.lock().await.clone())
    }

    async fn upsert(&self, record: &LeaseRecord) -> Result<()> {
        self.leases
            .lock()
            .await
            .insert(record.hardware_address, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
