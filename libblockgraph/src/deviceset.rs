//! The device set: every graph-driver operation on devices goes through
//! here.
//!
//! A device set ties the registry, the image graph, the mapper and the
//! mounter together over one backend pool. Operations that touch a single
//! device hold that device's record lock for their whole duration, so a
//! concurrent mount and remove of the same hash serialize while different
//! hashes proceed in parallel.

use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, instrument, warn};

use crate::backend::BlockBackend;
use crate::config::DeviceSetConfig;
use crate::error::GraphError;
use crate::host::HostOps;
use crate::imagegraph::ImageGraph;
use crate::mapper::BlockMapper;
use crate::metastore::MetaStore;
use crate::mounter::Mounter;
use crate::registry::DeviceRegistry;

/// Point-in-time view of a device, for metadata queries.
#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub base_hash: String,
    pub size_bytes: u64,
    /// Host block-device path if the image is currently mapped.
    pub device_path: Option<String>,
}

pub struct DeviceSet {
    config: Arc<DeviceSetConfig>,
    backend: Arc<dyn BlockBackend>,
    registry: DeviceRegistry,
    graph: ImageGraph,
    mapper: BlockMapper,
    mounter: Mounter,
}

impl DeviceSet {
    /// Build a device set over a backend and host. With `do_init` the base
    /// image is bootstrapped (or its interrupted bootstrap repaired) before
    /// returning.
    pub async fn new(
        backend: Arc<dyn BlockBackend>,
        host: Arc<dyn HostOps>,
        config: DeviceSetConfig,
        do_init: bool,
    ) -> Result<Self, GraphError> {
        let config = Arc::new(config);
        let store = MetaStore::new(backend.clone(), config.clone());
        let set = Self {
            registry: DeviceRegistry::new(store),
            graph: ImageGraph::new(backend.clone(), config.clone()),
            mapper: BlockMapper::new(backend.clone(), config.clone()),
            mounter: Mounter::new(
                host,
                config.filesystem,
                config.mount_options.clone(),
                config.mkfs_args.clone(),
            ),
            backend,
            config,
        };
        if do_init {
            set.ensure_base_image().await?;
        }
        Ok(set)
    }

    pub fn config(&self) -> &DeviceSetConfig {
        &self.config
    }

    /// Bootstrap the base image: create it, map it, create the filesystem,
    /// unmap, and persist the record as initialized.
    ///
    /// A record that exists but was never marked initialized is a bootstrap
    /// that crashed partway; its remnants are torn down and the whole
    /// sequence runs again, so the daemon converges after any interruption.
    #[instrument(skip(self))]
    pub async fn ensure_base_image(&self) -> Result<(), GraphError> {
        if let Some(record) = self.registry.lookup("").await? {
            let mut state = record.lock().await;
            if state.initialized {
                debug!("base image ready");
                return Ok(());
            }

            warn!("base image bootstrap was interrupted, rebuilding");
            if self.mapper.is_mapped(&record, &mut state).await? {
                self.mapper.unmap(&record, &mut state).await?;
            }
            self.graph.delete_image(&record).await?;
            drop(state);
            self.registry.unregister(&record).await?;
        }

        let image = self.config.image_name("");
        self.backend
            .create_image(&image, self.config.base_image_size)
            .await?;
        // Same rollback as add_device: a base image without a persisted
        // record would make every later startup fail on create.
        let record = match self
            .registry
            .register("", "", self.config.base_image_size)
            .await
        {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "base registration failed, removing backend image");
                if let Err(rm) = self.backend.remove_image(&image).await {
                    warn!(error = %rm, "leaving orphaned base image behind");
                }
                return Err(e);
            }
        };
        let mut state = record.lock().await;

        self.mapper.map(&record, &mut state).await?;
        let device = state
            .device_path
            .clone()
            .ok_or_else(|| GraphError::MappingFailed(image.clone()))?;

        let mkfs = self.mounter.create_filesystem(&device).await;
        // The base image stays unmapped between bootstrap and first use,
        // whether or not mkfs succeeded.
        if let Err(e) = self.mapper.unmap(&record, &mut state).await {
            warn!(error = %e, "failed to unmap base image after mkfs");
        }
        mkfs?;

        state.initialized = true;
        if let Err(e) = self.registry.persist(&record, &state).await {
            state.initialized = false;
            return Err(e);
        }
        info!(%image, size = self.config.base_image_size, "base image initialized");
        Ok(())
    }

    /// Register a new device as a copy-on-write clone of `base_hash`.
    ///
    /// The parent's record lock is held for the whole sequence so its
    /// snapshot set cannot change underneath the clone. A clone failure
    /// aborts the operation; no record is registered for a device whose
    /// backend image does not exist.
    #[instrument(skip(self))]
    pub async fn add_device(&self, hash: &str, base_hash: &str) -> Result<(), GraphError> {
        let base = self
            .registry
            .lookup(base_hash)
            .await?
            .ok_or_else(|| GraphError::BaseNotFound(base_hash.to_owned()))?;
        let _base_state = base.lock().await;

        if self.registry.has_device(hash).await? {
            return Err(GraphError::DeviceExists(hash.to_owned()));
        }

        self.graph.create_image(hash, base_hash).await?;

        if let Err(e) = self.registry.register(hash, base_hash, base.size_bytes).await {
            warn!(hash, error = %e, "registration failed, removing cloned image");
            if let Err(rm) = self.graph.remove_image(hash).await {
                warn!(hash, error = %rm, "leaving orphaned clone behind");
            }
            return Err(e);
        }
        Ok(())
    }

    /// Remove a device: backend image, clone linkage, record and metadata.
    ///
    /// A device whose snapshot still backs live clones cannot be removed;
    /// the backend's guard surfaces as an error and the record stays intact.
    #[instrument(skip(self))]
    pub async fn delete_device(&self, hash: &str) -> Result<(), GraphError> {
        let record = self
            .registry
            .lookup(hash)
            .await?
            .ok_or_else(|| GraphError::DeviceNotFound(hash.to_owned()))?;

        let state = record.lock().await;
        self.graph.delete_image(&record).await?;
        drop(state);
        self.registry.unregister(&record).await?;
        Ok(())
    }

    /// Mount a device, mapping it first if needed. Repeat mounts at the same
    /// path stack a reference count; a different path is a conflict.
    #[instrument(skip(self, mount_point), fields(mount_point = %mount_point.display()))]
    pub async fn mount_device(
        &self,
        hash: &str,
        mount_point: &Path,
        mount_label: &str,
    ) -> Result<(), GraphError> {
        let record = self
            .registry
            .lookup(hash)
            .await?
            .ok_or_else(|| GraphError::DeviceNotFound(hash.to_owned()))?;
        let mut state = record.lock().await;

        if state.mount_count > 0 {
            match &state.mount_path {
                Some(mounted_at) if mounted_at == mount_point => {
                    state.mount_count += 1;
                    return Ok(());
                }
                Some(mounted_at) => {
                    return Err(GraphError::MountConflict {
                        hash: hash.to_owned(),
                        mounted_at: mounted_at.display().to_string(),
                        requested: mount_point.display().to_string(),
                    });
                }
                // Count without a path is inconsistent; fall through and
                // mount fresh, keeping the references the count claims.
                None => {}
            }
        }

        self.mapper.map(&record, &mut state).await?;
        let device = state
            .device_path
            .clone()
            .ok_or_else(|| GraphError::MappingFailed(self.config.image_name(hash)))?;

        self.mounter.mount(&device, mount_point, mount_label).await?;
        state.mount_count += 1;
        state.mount_path = Some(mount_point.to_owned());
        Ok(())
    }

    /// Drop one mount reference; the last reference unmounts and unmaps.
    ///
    /// A failed unmount is reported with the count already at zero; the
    /// kernel mount is then out of step with the record and it is the
    /// caller's job to resolve that, not ours to retry.
    #[instrument(skip(self))]
    pub async fn unmount_device(&self, hash: &str) -> Result<(), GraphError> {
        let record = self
            .registry
            .lookup(hash)
            .await?
            .ok_or_else(|| GraphError::DeviceNotFound(hash.to_owned()))?;
        let mut state = record.lock().await;

        if state.mount_count == 0 {
            return Err(GraphError::NotMounted(hash.to_owned()));
        }
        state.mount_count -= 1;
        if state.mount_count > 0 {
            return Ok(());
        }

        let path = state
            .mount_path
            .clone()
            .ok_or_else(|| GraphError::NotMounted(hash.to_owned()))?;
        self.mounter.unmount(&path)?;
        state.mount_path = None;
        self.mapper.unmap(&record, &mut state).await?;
        Ok(())
    }

    pub async fn has_device(&self, hash: &str) -> Result<bool, GraphError> {
        self.registry.has_device(hash).await
    }

    pub async fn device_info(&self, hash: &str) -> Result<DeviceInfo, GraphError> {
        let record = self
            .registry
            .lookup(hash)
            .await?
            .ok_or_else(|| GraphError::DeviceNotFound(hash.to_owned()))?;
        let state = record.lock().await;
        Ok(DeviceInfo {
            base_hash: record.base_hash.clone(),
            size_bytes: record.size_bytes,
            device_path: state.device_path.clone(),
        })
    }

    /// Best-effort shutdown sweep: lazily detach every mounted device, drop
    /// its mapping, and close the backend. Failures are logged and never
    /// stop the sweep.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        for record in self.registry.cached_records().await {
            let mut state = record.lock().await;
            if state.mount_count == 0 {
                continue;
            }
            if let Some(path) = state.mount_path.clone() {
                if let Err(e) = self.mounter.detach_unmount(&path) {
                    debug!(hash = %record.hash, error = %e, "detach unmount failed during shutdown");
                }
            }
            state.mount_count = 0;
            state.mount_path = None;
            if let Err(e) = self.mapper.unmap(&record, &mut state).await {
                debug!(hash = %record.hash, error = %e, "unmap failed during shutdown");
            }
        }

        // The base image may be mapped without being mounted if shutdown
        // races a bootstrap.
        if let Ok(Some(base)) = self.registry.lookup("").await {
            let mut state = base.lock().await;
            match self.mapper.is_mapped(&base, &mut state).await {
                Ok(true) => {
                    if let Err(e) = self.mapper.unmap(&base, &mut state).await {
                        debug!(error = %e, "failed to unmap base image during shutdown");
                    }
                }
                Ok(false) => {}
                Err(e) => debug!(error = %e, "mapping table unavailable during shutdown"),
            }
        }

        self.backend.close().await;
        info!("device set shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use crate::backend::{BlockBackend, MemoryBackend};
    use crate::config::FsType;
    use crate::testutil::{FakeHost, Harness, harness, harness_with};

    use super::*;

    #[tokio::test]
    async fn bootstrap_creates_and_unmaps_base_image() {
        let h = harness().await;
        let image = h.devices.config().image_name("");

        assert!(h.backend.image_exists(&image).await);
        assert_eq!(h.host.mkfs_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        // The base image is left unmapped after mkfs.
        assert_eq!(h.backend.mapped_count().await, 0);
    }

    #[tokio::test]
    async fn bootstrap_is_idempotent_across_restarts() {
        let h = harness().await;

        // A second daemon generation over the same backend finds the
        // initialized record and does nothing.
        let devices2 = DeviceSet::new(
            h.backend.clone(),
            h.host.clone(),
            h.devices.config().clone(),
            true,
        )
        .await
        .unwrap();
        assert_eq!(h.host.mkfs_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(devices2.has_device("").await.unwrap());
    }

    #[tokio::test]
    async fn interrupted_bootstrap_is_rebuilt() {
        let backend = Arc::new(MemoryBackend::new("rbd"));
        let host = Arc::new(FakeHost::new());
        let config = DeviceSetConfig {
            base_image_size: 1 << 20,
            ..DeviceSetConfig::default()
        };

        host.fail_mkfs.store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(
            DeviceSet::new(backend.clone(), host.clone(), config.clone(), true)
                .await
                .is_err()
        );

        // Next start repairs the half-built base image.
        host.fail_mkfs.store(false, std::sync::atomic::Ordering::SeqCst);
        let devices = DeviceSet::new(backend.clone(), host.clone(), config.clone(), true)
            .await
            .unwrap();
        assert_eq!(host.mkfs_calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(backend.image_exists(&devices.config().image_name("")).await);
        assert_eq!(backend.mapped_count().await, 0);
    }

    #[tokio::test]
    async fn bootstrap_retries_after_failed_registration() {
        let backend = Arc::new(MemoryBackend::new("rbd"));
        let host = Arc::new(FakeHost::new());
        let config = DeviceSetConfig {
            base_image_size: 1 << 20,
            ..DeviceSetConfig::default()
        };

        backend.fail_object_writes(true);
        assert!(
            DeviceSet::new(backend.clone(), host.clone(), config.clone(), true)
                .await
                .is_err()
        );
        // The failed registration must not orphan the backend image.
        assert!(!backend.image_exists(&config.image_name("")).await);

        backend.fail_object_writes(false);
        let devices = DeviceSet::new(backend.clone(), host.clone(), config.clone(), true)
            .await
            .unwrap();
        assert!(devices.has_device("").await.unwrap());
    }

    #[tokio::test]
    async fn add_device_clones_from_base() {
        let h = harness().await;
        h.devices.add_device("h1", "").await.unwrap();

        assert!(h.devices.has_device("h1").await.unwrap());
        let info = h.devices.device_info("h1").await.unwrap();
        assert_eq!(info.base_hash, "");
        assert_eq!(info.size_bytes, 1 << 20);
        assert!(info.device_path.is_none());
    }

    #[tokio::test]
    async fn duplicate_device_rejected() {
        let h = harness().await;
        h.devices.add_device("h1", "").await.unwrap();
        assert!(matches!(
            h.devices.add_device("h1", "").await,
            Err(GraphError::DeviceExists(_))
        ));
    }

    #[tokio::test]
    async fn missing_parent_rejected() {
        let h = harness().await;
        assert!(matches!(
            h.devices.add_device("h1", "nope").await,
            Err(GraphError::BaseNotFound(_))
        ));
        assert!(!h.devices.has_device("h1").await.unwrap());
    }

    #[tokio::test]
    async fn failed_registration_removes_cloned_image() {
        let h = harness().await;
        h.backend.fail_object_writes(true);

        assert!(h.devices.add_device("h1", "").await.is_err());
        h.backend.fail_object_writes(false);

        assert!(!h.devices.has_device("h1").await.unwrap());
        let image = h.devices.config().image_name("h1");
        assert!(!h.backend.image_exists(&image).await);
        // The slot is reusable.
        h.devices.add_device("h1", "").await.unwrap();
    }

    #[tokio::test]
    async fn mount_refcount_stacks_and_unwinds() {
        let h = harness().await;
        h.devices.add_device("h1", "").await.unwrap();
        let mp = PathBuf::from("/graph/mnt/h1");

        h.devices.mount_device("h1", &mp, "").await.unwrap();
        h.devices.mount_device("h1", &mp, "").await.unwrap();
        assert_eq!(h.host.mounted_count(), 1);
        assert_eq!(h.backend.mapped_count().await, 1);

        h.devices.unmount_device("h1").await.unwrap();
        // Still held by the first reference.
        assert_eq!(h.host.mounted_count(), 1);

        h.devices.unmount_device("h1").await.unwrap();
        assert_eq!(h.host.mounted_count(), 0);
        assert_eq!(h.backend.mapped_count().await, 0);

        assert!(matches!(
            h.devices.unmount_device("h1").await,
            Err(GraphError::NotMounted(_))
        ));
    }

    #[tokio::test]
    async fn concurrent_mounts_at_same_path() {
        let h = harness().await;
        h.devices.add_device("h1", "").await.unwrap();
        let mp = PathBuf::from("/graph/mnt/h1");

        let (a, b) = tokio::join!(
            h.devices.mount_device("h1", &mp, ""),
            h.devices.mount_device("h1", &mp, "")
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(h.host.mounted_count(), 1);

        // Two references were taken; two puts fully release the device.
        h.devices.unmount_device("h1").await.unwrap();
        assert_eq!(h.host.mounted_count(), 1);
        h.devices.unmount_device("h1").await.unwrap();
        assert_eq!(h.host.mounted_count(), 0);
    }

    #[tokio::test]
    async fn mount_at_second_path_conflicts() {
        let h = harness().await;
        h.devices.add_device("h1", "").await.unwrap();
        let mp_a = PathBuf::from("/graph/mnt/a");
        let mp_b = PathBuf::from("/graph/mnt/b");

        h.devices.mount_device("h1", &mp_a, "").await.unwrap();
        assert!(matches!(
            h.devices.mount_device("h1", &mp_b, "").await,
            Err(GraphError::MountConflict { .. })
        ));

        // The conflict did not disturb the existing reference.
        h.devices.unmount_device("h1").await.unwrap();
        assert_eq!(h.host.mounted_count(), 0);
        assert!(matches!(
            h.devices.unmount_device("h1").await,
            Err(GraphError::NotMounted(_))
        ));
    }

    #[tokio::test]
    async fn failed_unmount_reports_and_drops_reference() {
        let h = harness().await;
        h.devices.add_device("h1", "").await.unwrap();
        let mp = PathBuf::from("/graph/mnt/h1");
        h.devices.mount_device("h1", &mp, "").await.unwrap();

        h.host.fail_unmount_of(&mp);
        assert!(matches!(
            h.devices.unmount_device("h1").await,
            Err(GraphError::UnmountFailed { .. })
        ));
        // The reference is gone but the device is still mapped; resolving
        // the stuck mount is the caller's problem.
        assert_eq!(h.backend.mapped_count().await, 1);
        assert!(matches!(
            h.devices.unmount_device("h1").await,
            Err(GraphError::NotMounted(_))
        ));

        h.host.clear_unmount_failures();
    }

    #[tokio::test]
    async fn remove_parent_with_live_clone_fails() {
        let h = harness().await;
        h.devices.add_device("h1", "").await.unwrap();
        h.devices.add_device("h2", "h1").await.unwrap();

        assert!(h.devices.delete_device("h1").await.is_err());
        // Both records and images survive the refused removal.
        assert!(h.devices.has_device("h1").await.unwrap());
        assert!(h.devices.has_device("h2").await.unwrap());
        assert!(
            h.backend
                .image_exists(&h.devices.config().image_name("h1"))
                .await
        );

        // Leaf-first removal works.
        h.devices.delete_device("h2").await.unwrap();
        h.devices.delete_device("h1").await.unwrap();
        assert!(!h.devices.has_device("h1").await.unwrap());
    }

    #[tokio::test]
    async fn delete_missing_device_errors() {
        let h = harness().await;
        assert!(matches!(
            h.devices.delete_device("nope").await,
            Err(GraphError::DeviceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn device_visible_from_fresh_registry() {
        let h = harness().await;
        h.devices.add_device("h1", "").await.unwrap();

        // A restarted daemon rebuilds records from backend metadata.
        let devices2 = DeviceSet::new(
            h.backend.clone(),
            h.host.clone(),
            h.devices.config().clone(),
            true,
        )
        .await
        .unwrap();
        assert!(devices2.has_device("h1").await.unwrap());
        let info = devices2.device_info("h1").await.unwrap();
        assert_eq!(info.base_hash, "");
    }

    #[tokio::test]
    async fn xfs_mounts_get_nouuid_and_discard_falls_back() {
        let config = DeviceSetConfig {
            base_image_size: 1 << 20,
            filesystem: FsType::Xfs,
            mount_options: "noatime".to_owned(),
            ..DeviceSetConfig::default()
        };
        let Harness {
            backend: _backend,
            host,
            devices,
        } = harness_with(config).await;
        *host.probe_result.lock().unwrap() = Some(FsType::Xfs);
        host.reject_discard
            .store(true, std::sync::atomic::Ordering::SeqCst);

        devices.add_device("h1", "").await.unwrap();
        let mp = PathBuf::from("/graph/mnt/h1");
        devices.mount_device("h1", &mp, "lbl").await.unwrap();

        let options = host.mount_options_for(&mp).unwrap();
        assert!(options.contains("nouuid"));
        assert!(options.contains("noatime"));
        assert!(options.contains("context=\"lbl\""));
        assert!(!options.split(',').any(|o| o == "discard"));
    }

    #[tokio::test]
    async fn shutdown_sweeps_mounts_and_closes_backend() {
        let h = harness().await;
        for hash in ["h1", "h2", "h3"] {
            h.devices.add_device(hash, "").await.unwrap();
            let mp = PathBuf::from(format!("/graph/mnt/{hash}"));
            h.devices.mount_device(hash, &mp, "").await.unwrap();
        }
        // One busy mount must not stall the others.
        h.host.fail_unmount_of(Path::new("/graph/mnt/h2"));

        h.devices.shutdown().await;

        assert!(h.backend.is_closed().await);
        assert_eq!(h.host.detach_calls.lock().unwrap().len(), 3);
        // Every mapping was dropped regardless of the stuck unmount.
        assert_eq!(h.backend.mapped_count().await, 0);
    }

    #[tokio::test]
    async fn shutdown_unmaps_base_image_left_mapped() {
        let h = harness().await;
        // Map the base image behind the device set's back, as a bootstrap
        // interrupted between map and unmap would leave it.
        let base_image = h.devices.config().image_name("");
        h.backend.map_image(&base_image).await.unwrap();
        assert_eq!(h.backend.mapped_count().await, 1);

        h.devices.shutdown().await;

        assert_eq!(h.backend.mapped_count().await, 0);
        assert!(h.backend.is_closed().await);
    }

    #[tokio::test]
    async fn mount_preserves_references_claimed_without_a_path() {
        let h = harness().await;
        h.devices.add_device("h1", "").await.unwrap();

        // Forge a count with no recorded path, as if the path were lost.
        {
            let record = h.devices.registry.lookup("h1").await.unwrap().unwrap();
            let mut state = record.lock().await;
            state.mount_count = 2;
            state.mount_path = None;
        }

        let mp = PathBuf::from("/graph/mnt/h1");
        h.devices.mount_device("h1", &mp, "").await.unwrap();

        let record = h.devices.registry.lookup("h1").await.unwrap().unwrap();
        let state = record.lock().await;
        assert_eq!(state.mount_count, 3);
        assert_eq!(state.mount_path.as_deref(), Some(mp.as_path()));
    }
}
