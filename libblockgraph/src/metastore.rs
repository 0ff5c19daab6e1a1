//! Persistent per-device metadata.
//!
//! Each device record is mirrored into the backend as a small JSON object so
//! the daemon can rebuild its in-memory registry after a restart. Runtime
//! state (device path, mount count, mount path) is deliberately absent from
//! [`DeviceMetadata`]; only the durable identity fields are written.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backend::BlockBackend;
use crate::config::DeviceSetConfig;
use crate::error::GraphError;

/// Hard cap on an encoded metadata object. The backend stores these as fixed
/// small blobs; anything larger indicates a corrupted or foreign record.
pub const MAX_META_OBJECT_SIZE: usize = 256;

/// Durable fields of a device record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    /// Content hash identifying the device. Empty for the base image.
    pub hash: String,
    /// Logical size in bytes.
    pub size: u64,
    /// Hash of the parent device. Empty for the base image itself and for
    /// devices cloned directly from it.
    pub base_hash: String,
    /// Whether the base image bootstrap (mkfs) completed. Only meaningful on
    /// the base record.
    #[serde(default)]
    pub initialized: bool,
}

/// Reads and writes [`DeviceMetadata`] objects in the backend.
pub struct MetaStore {
    backend: Arc<dyn BlockBackend>,
    config: Arc<DeviceSetConfig>,
}

impl MetaStore {
    pub fn new(backend: Arc<dyn BlockBackend>, config: Arc<DeviceSetConfig>) -> Self {
        Self { backend, config }
    }

    /// Read the metadata object for a hash. `Ok(None)` when no object exists.
    pub async fn read(&self, hash: &str) -> Result<Option<DeviceMetadata>, GraphError> {
        let oid = self.config.meta_object_name(hash);
        let Some(data) = self.backend.read_object(&oid).await? else {
            return Ok(None);
        };
        let meta = serde_json::from_slice(&data).map_err(|source| GraphError::MetadataDecode {
            hash: hash.to_owned(),
            source,
        })?;
        Ok(Some(meta))
    }

    /// Write (create or replace) the metadata object for a record.
    pub async fn write(&self, meta: &DeviceMetadata) -> Result<(), GraphError> {
        let data = serde_json::to_vec(meta).map_err(|source| GraphError::MetadataEncode {
            hash: meta.hash.clone(),
            source,
        })?;
        if data.len() > MAX_META_OBJECT_SIZE {
            return Err(GraphError::MetadataTooLarge {
                hash: meta.hash.clone(),
                limit: MAX_META_OBJECT_SIZE,
                actual: data.len(),
            });
        }
        let oid = self.config.meta_object_name(&meta.hash);
        self.backend.write_object(&oid, &data).await?;
        debug!(hash = %meta.hash, bytes = data.len(), "wrote device metadata");
        Ok(())
    }

    /// Delete the metadata object for a hash.
    pub async fn delete(&self, hash: &str) -> Result<(), GraphError> {
        let oid = self.config.meta_object_name(hash);
        self.backend.delete_object(&oid).await
    }
}
