//! Storage backend capability interface.
//!
//! The core never speaks the backend's wire protocol itself; everything it
//! needs from the block store is expressed by [`BlockBackend`]: image
//! create/remove, the snapshot operations that make copy-on-write cloning
//! possible, small named metadata objects, and the host-side mapping helper.
//! Production deployments use [`rbd::RbdBackend`]; tests and development use
//! [`memory::MemoryBackend`].

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::GraphError;

pub mod memory;
pub mod rbd;

pub use memory::MemoryBackend;
pub use rbd::RbdBackend;

/// One row of the backend's live mapping table: an image currently exposed
/// as a host block device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MappedDevice {
    /// Pool the mapped image lives in.
    pub pool: String,
    /// Backend image name.
    pub name: String,
    /// Snapshot name, if a snapshot rather than the image head is mapped.
    #[serde(default)]
    pub snap: String,
    /// Host block-device path, e.g. `/dev/rbd3`.
    pub device: String,
}

/// Capability interface to the networked block store.
///
/// A backend is opened against a single pool at construction time and shared
/// process-wide behind an `Arc`; [`BlockBackend::close`] is called exactly
/// once, by the shutdown path.
///
/// "Not found" on metadata reads is a first-class outcome (`Ok(None)`), never
/// an error, so callers can branch between create and reuse.
#[async_trait]
pub trait BlockBackend: Send + Sync {
    /// Create an empty image of the given logical size.
    async fn create_image(&self, name: &str, size_bytes: u64) -> Result<(), GraphError>;

    /// Remove an image. Fails while the image still has snapshots.
    async fn remove_image(&self, name: &str) -> Result<(), GraphError>;

    /// Whether `image` carries a snapshot named `snap`.
    async fn snapshot_exists(&self, image: &str, snap: &str) -> Result<bool, GraphError>;

    /// Create a point-in-time snapshot of the image head.
    async fn create_snapshot(&self, image: &str, snap: &str) -> Result<(), GraphError>;

    /// Mark a snapshot clone-safe. Required before [`Self::clone_snapshot`].
    async fn protect_snapshot(&self, image: &str, snap: &str) -> Result<(), GraphError>;

    /// Reverse [`Self::protect_snapshot`]. Fails while clones of the
    /// snapshot exist.
    async fn unprotect_snapshot(&self, image: &str, snap: &str) -> Result<(), GraphError>;

    /// Remove a snapshot. Fails while the snapshot is protected.
    async fn remove_snapshot(&self, image: &str, snap: &str) -> Result<(), GraphError>;

    /// Create `child_image` as a copy-on-write clone of
    /// `parent_image@snap`.
    async fn clone_snapshot(
        &self,
        parent_image: &str,
        snap: &str,
        child_image: &str,
    ) -> Result<(), GraphError>;

    /// Read a named metadata object. `Ok(None)` when the object does not
    /// exist.
    async fn read_object(&self, oid: &str) -> Result<Option<Vec<u8>>, GraphError>;

    /// Write (create or replace) a named metadata object.
    async fn write_object(&self, oid: &str, data: &[u8]) -> Result<(), GraphError>;

    /// Delete a named metadata object.
    async fn delete_object(&self, oid: &str) -> Result<(), GraphError>;

    /// Ask the mapping helper to expose an image as a host block device.
    /// The resulting device path is *not* returned here; callers discover it
    /// through [`Self::list_mapped`], since older helper tools do not print
    /// the device on mapping.
    async fn map_image(&self, image: &str) -> Result<(), GraphError>;

    /// Remove the host block-device mapping at `device`.
    async fn unmap_device(&self, device: &str) -> Result<(), GraphError>;

    /// The live mapping table. Authoritative over any recorded device path.
    async fn list_mapped(&self) -> Result<Vec<MappedDevice>, GraphError>;

    /// Release the backend connection. Called once, at shutdown.
    async fn close(&self);
}
