//! Graph-driver facade: the operation surface a container engine calls.
//!
//! Thin layer over [`DeviceSet`] that owns the on-disk layout under the
//! driver home (`<home>/mnt/<hash>` per device, with a `rootfs/` directory
//! and an `id` marker inside each mount) and translates engine calls into
//! device-set operations.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::deviceset::DeviceSet;
use crate::error::GraphError;
use crate::host::HostOps;

/// Name this driver registers under.
pub const DRIVER_NAME: &str = "blockgraph";

pub struct GraphDriver {
    home: PathBuf,
    devices: DeviceSet,
    host: Arc<dyn HostOps>,
}

impl GraphDriver {
    /// Set up the driver home and make it a private mount so container
    /// mounts do not leak into peer namespaces.
    pub async fn new(
        home: impl Into<PathBuf>,
        devices: DeviceSet,
        host: Arc<dyn HostOps>,
    ) -> Result<Self, GraphError> {
        let home = home.into();
        tokio::fs::create_dir_all(&home).await?;
        host.make_private(&home)
            .map_err(|errno| GraphError::Io(std::io::Error::from_raw_os_error(errno as i32)))?;
        debug!(home = %home.display(), "graph driver ready");
        Ok(Self {
            home,
            devices,
            host,
        })
    }

    fn mount_point(&self, hash: &str) -> PathBuf {
        self.home.join("mnt").join(hash)
    }

    /// Create a new layer as a copy-on-write clone of `parent`. The empty
    /// parent clones from the base image.
    #[instrument(skip(self))]
    pub async fn create(&self, hash: &str, parent: &str) -> Result<(), GraphError> {
        self.devices.add_device(hash, parent).await
    }

    /// Remove a layer. Removing an unknown hash is a no-op so engine
    /// cleanup retries stay idempotent.
    #[instrument(skip(self))]
    pub async fn remove(&self, hash: &str) -> Result<(), GraphError> {
        if !self.devices.has_device(hash).await? {
            debug!(hash, "remove of unknown device ignored");
            return Ok(());
        }
        self.devices.delete_device(hash).await?;

        match tokio::fs::remove_dir_all(self.mount_point(hash)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Mount a layer and return the path to its root filesystem.
    #[instrument(skip(self))]
    pub async fn get(&self, hash: &str, mount_label: &str) -> Result<PathBuf, GraphError> {
        let mount_point = self.mount_point(hash);
        tokio::fs::create_dir_all(&mount_point).await?;
        self.devices
            .mount_device(hash, &mount_point, mount_label)
            .await?;

        // Everything below runs on the mounted filesystem; release the
        // mount reference if any of it fails.
        let rootfs = mount_point.join("rootfs");
        if let Err(e) = self.prepare_contents(hash, &mount_point, &rootfs).await {
            if let Err(u) = self.devices.unmount_device(hash).await {
                warn!(hash, error = %u, "failed to release mount after setup error");
            }
            return Err(e);
        }
        Ok(rootfs)
    }

    async fn prepare_contents(
        &self,
        hash: &str,
        mount_point: &Path,
        rootfs: &Path,
    ) -> Result<(), GraphError> {
        tokio::fs::create_dir_all(rootfs).await?;

        // Write-once identity marker, used to spot stale filesystems left
        // over from a reused device.
        let id_file = mount_point.join("id");
        if !tokio::fs::try_exists(&id_file).await? {
            tokio::fs::write(&id_file, hash).await?;
        }
        Ok(())
    }

    /// Release one mount reference on a layer.
    #[instrument(skip(self))]
    pub async fn put(&self, hash: &str) -> Result<(), GraphError> {
        self.devices.unmount_device(hash).await
    }

    /// Whether a layer exists. Never errors; backend trouble reads as
    /// absence.
    pub async fn exists(&self, hash: &str) -> bool {
        self.devices.has_device(hash).await.unwrap_or(false)
    }

    /// Engine-facing metadata for a layer.
    pub async fn get_metadata(
        &self,
        hash: &str,
    ) -> Result<HashMap<String, String>, GraphError> {
        let info = self.devices.device_info(hash).await?;
        let mut metadata = HashMap::new();
        metadata.insert("BaseHash".to_owned(), info.base_hash);
        metadata.insert("DeviceSize".to_owned(), info.size_bytes.to_string());
        metadata.insert(
            "DeviceName".to_owned(),
            info.device_path.unwrap_or_default(),
        );
        Ok(metadata)
    }

    /// Driver status lines for diagnostics output.
    pub fn status(&self) -> Vec<(String, String)> {
        let config = self.devices.config();
        vec![
            ("Pool".to_owned(), config.data_pool.clone()),
            (
                "Base image size".to_owned(),
                config.base_image_size.to_string(),
            ),
            ("Filesystem".to_owned(), config.filesystem.to_string()),
        ]
    }

    /// Best-effort shutdown: sweep mounts and mappings, close the backend,
    /// detach the driver home.
    #[instrument(skip(self))]
    pub async fn cleanup(&self) -> Result<(), GraphError> {
        self.devices.shutdown().await;
        if let Err(e) = self.host.detach_unmount(&self.home) {
            debug!(error = %e, "failed to detach driver home");
        }
        Ok(())
    }
}
