//! In-memory device registry backed by the metadata store.
//!
//! Two-level locking: a coarse mutex guards the hash -> record map, and each
//! record carries its own mutex over the mutable runtime state. The coarse
//! lock is only ever held for map lookups and inserts, never across backend
//! I/O; multi-step operations hold the per-record lock instead, so work on
//! different devices proceeds concurrently.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::GraphError;
use crate::metastore::{DeviceMetadata, MetaStore};

/// Mutable runtime state of a device. Never persisted.
#[derive(Debug, Default)]
pub struct DeviceState {
    /// Host block-device path while the image is mapped.
    pub device_path: Option<String>,
    /// Number of outstanding mount requests.
    pub mount_count: u32,
    /// Where the device is mounted while `mount_count > 0`.
    pub mount_path: Option<PathBuf>,
    /// Whether the base bootstrap completed. Only meaningful on the base
    /// record.
    pub initialized: bool,
}

/// One registered device: immutable identity plus locked runtime state.
#[derive(Debug)]
pub struct DeviceRecord {
    pub hash: String,
    pub base_hash: String,
    pub size_bytes: u64,
    state: Mutex<DeviceState>,
}

impl DeviceRecord {
    fn new(hash: String, base_hash: String, size_bytes: u64, initialized: bool) -> Self {
        Self {
            hash,
            base_hash,
            size_bytes,
            state: Mutex::new(DeviceState {
                initialized,
                ..DeviceState::default()
            }),
        }
    }

    /// The empty hash designates the base image.
    pub fn is_base(&self) -> bool {
        self.hash.is_empty()
    }

    /// Lock this record's runtime state. Held across whole multi-step
    /// operations on the device.
    pub async fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().await
    }
}

/// Map of registered devices, lazily filled from the metadata store.
pub struct DeviceRegistry {
    devices: Mutex<HashMap<String, Arc<DeviceRecord>>>,
    store: MetaStore,
}

impl DeviceRegistry {
    pub fn new(store: MetaStore) -> Self {
        Self {
            devices: Mutex::new(HashMap::new()),
            store,
        }
    }

    /// Find a record, consulting the metadata store on a cache miss.
    pub async fn lookup(&self, hash: &str) -> Result<Option<Arc<DeviceRecord>>, GraphError> {
        if let Some(record) = self.devices.lock().await.get(hash) {
            return Ok(Some(record.clone()));
        }

        // Cache miss. Read without holding the map lock, then insert with a
        // re-check so a concurrent loader's record wins over ours.
        let Some(meta) = self.store.read(hash).await? else {
            return Ok(None);
        };
        let record = Arc::new(DeviceRecord::new(
            meta.hash,
            meta.base_hash,
            meta.size,
            meta.initialized,
        ));

        let mut devices = self.devices.lock().await;
        let record = devices
            .entry(hash.to_owned())
            .or_insert(record)
            .clone();
        Ok(Some(record))
    }

    /// Register a brand-new device and persist its metadata. Rolls the cache
    /// entry back if the metadata write fails.
    pub async fn register(
        &self,
        hash: &str,
        base_hash: &str,
        size_bytes: u64,
    ) -> Result<Arc<DeviceRecord>, GraphError> {
        let record = Arc::new(DeviceRecord::new(
            hash.to_owned(),
            base_hash.to_owned(),
            size_bytes,
            false,
        ));

        {
            let mut devices = self.devices.lock().await;
            match devices.entry(hash.to_owned()) {
                Entry::Occupied(_) => return Err(GraphError::DeviceExists(hash.to_owned())),
                Entry::Vacant(slot) => {
                    slot.insert(record.clone());
                }
            }
        }

        let meta = DeviceMetadata {
            hash: hash.to_owned(),
            size: size_bytes,
            base_hash: base_hash.to_owned(),
            initialized: false,
        };
        if let Err(e) = self.store.write(&meta).await {
            self.devices.lock().await.remove(hash);
            return Err(e);
        }

        debug!(hash, base_hash, size_bytes, "registered device");
        Ok(record)
    }

    /// Drop a device from the cache and delete its metadata object. The
    /// cache entry is restored if the delete fails, keeping the map honest
    /// about what the backend still holds.
    pub async fn unregister(&self, record: &Arc<DeviceRecord>) -> Result<(), GraphError> {
        self.devices.lock().await.remove(&record.hash);

        if let Err(e) = self.store.delete(&record.hash).await {
            self.devices
                .lock()
                .await
                .insert(record.hash.clone(), record.clone());
            return Err(e);
        }
        debug!(hash = %record.hash, "unregistered device");
        Ok(())
    }

    /// Rewrite a record's metadata object, capturing the current
    /// `initialized` flag from its locked state.
    pub async fn persist(
        &self,
        record: &DeviceRecord,
        state: &DeviceState,
    ) -> Result<(), GraphError> {
        self.store
            .write(&DeviceMetadata {
                hash: record.hash.clone(),
                size: record.size_bytes,
                base_hash: record.base_hash.clone(),
                initialized: state.initialized,
            })
            .await
    }

    pub async fn has_device(&self, hash: &str) -> Result<bool, GraphError> {
        Ok(self.lookup(hash).await?.is_some())
    }

    /// Snapshot of every cached record, for shutdown sweeps.
    pub async fn cached_records(&self) -> Vec<Arc<DeviceRecord>> {
        self.devices.lock().await.values().cloned().collect()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::DeviceRecord;

    /// Build a bare record outside the registry, for unit tests that only
    /// need identity fields.
    pub(crate) fn record(hash: &str, base_hash: &str, size_bytes: u64) -> DeviceRecord {
        DeviceRecord::new(hash.to_owned(), base_hash.to_owned(), size_bytes, false)
    }
}
