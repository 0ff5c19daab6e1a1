//! Copy-on-write image graph operations.
//!
//! Every non-base device is a clone of a snapshot on its parent image. The
//! snapshot is named after the *child* hash and lives on the parent, so each
//! clone has its own clone source and siblings never contend. Creation is a
//! three-step backend sequence (snapshot if absent, protect, clone); deletion
//! reverses it (remove clone, unprotect, remove snapshot).

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::backend::BlockBackend;
use crate::config::DeviceSetConfig;
use crate::error::GraphError;
use crate::registry::DeviceRecord;

pub struct ImageGraph {
    backend: Arc<dyn BlockBackend>,
    config: Arc<DeviceSetConfig>,
}

impl ImageGraph {
    pub fn new(backend: Arc<dyn BlockBackend>, config: Arc<DeviceSetConfig>) -> Self {
        Self { backend, config }
    }

    /// Create the backend image for `hash` as a clone of its parent.
    ///
    /// The snapshot step is idempotent: if a previous attempt crashed after
    /// creating the snapshot, the existing one is reused.
    #[instrument(skip(self))]
    pub async fn create_image(&self, hash: &str, base_hash: &str) -> Result<(), GraphError> {
        let parent = self.config.image_name(base_hash);
        let snap = self.config.snap_name(hash);
        let child = self.config.image_name(hash);

        if !self.backend.snapshot_exists(&parent, &snap).await? {
            self.backend.create_snapshot(&parent, &snap).await?;
        } else {
            debug!(%parent, %snap, "reusing snapshot from earlier attempt");
        }
        self.backend.protect_snapshot(&parent, &snap).await?;
        self.backend.clone_snapshot(&parent, &snap, &child).await?;
        Ok(())
    }

    /// Remove the bare backend image for `hash`, without touching parent
    /// snapshots. Rollback helper for a creation that failed after cloning.
    pub async fn remove_image(&self, hash: &str) -> Result<(), GraphError> {
        self.backend.remove_image(&self.config.image_name(hash)).await
    }

    /// Tear down a device's backend image and its clone linkage.
    ///
    /// The image removal and the snapshot unprotect are load-bearing: the
    /// backend refuses both while dependents exist, which is what keeps a
    /// parent alive under its clones. A failure to remove the snapshot after
    /// a successful unprotect only leaks an unused snapshot, so it is logged
    /// and tolerated.
    #[instrument(skip(self, record), fields(hash = %record.hash))]
    pub async fn delete_image(&self, record: &DeviceRecord) -> Result<(), GraphError> {
        self.backend
            .remove_image(&self.config.image_name(&record.hash))
            .await?;

        if record.is_base() {
            // The base image has no parent snapshot to release.
            return Ok(());
        }

        let parent = self.config.image_name(&record.base_hash);
        let snap = self.config.snap_name(&record.hash);
        self.backend.unprotect_snapshot(&parent, &snap).await?;
        if let Err(e) = self.backend.remove_snapshot(&parent, &snap).await {
            warn!(%parent, %snap, error = %e, "leaving stale snapshot behind");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::backend::MemoryBackend;

    use super::*;

    fn graph() -> (Arc<MemoryBackend>, Arc<DeviceSetConfig>, ImageGraph) {
        let backend = Arc::new(MemoryBackend::new("rbd"));
        let config = Arc::new(DeviceSetConfig::default());
        let graph = ImageGraph::new(backend.clone(), config.clone());
        (backend, config, graph)
    }

    async fn seed_base(backend: &MemoryBackend, config: &DeviceSetConfig) {
        backend
            .create_image(&config.image_name(""), 1024)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn create_clones_from_parent_snapshot() {
        let (backend, config, graph) = graph();
        seed_base(&backend, &config).await;

        graph.create_image("child", "").await.unwrap();
        assert!(backend.image_exists(&config.image_name("child")).await);
        assert!(
            backend
                .snapshot_exists(&config.image_name(""), &config.snap_name("child"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn create_reuses_leftover_snapshot() {
        let (backend, config, graph) = graph();
        seed_base(&backend, &config).await;

        // Simulate an earlier attempt that crashed after the snapshot step.
        backend
            .create_snapshot(&config.image_name(""), &config.snap_name("child"))
            .await
            .unwrap();

        graph.create_image("child", "").await.unwrap();
        assert!(backend.image_exists(&config.image_name("child")).await);
    }

    #[tokio::test]
    async fn delete_releases_parent_snapshot() {
        let (backend, config, graph) = graph();
        seed_base(&backend, &config).await;
        graph.create_image("child", "").await.unwrap();

        let record = test_record("child", "");
        graph.delete_image(&record).await.unwrap();

        assert!(!backend.image_exists(&config.image_name("child")).await);
        assert!(
            !backend
                .snapshot_exists(&config.image_name(""), &config.snap_name("child"))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn delete_parent_with_live_clone_fails() {
        let (backend, config, graph) = graph();
        seed_base(&backend, &config).await;
        graph.create_image("mid", "").await.unwrap();
        graph.create_image("leaf", "mid").await.unwrap();

        // "mid" still carries the protected snapshot backing "leaf".
        let record = test_record("mid", "");
        assert!(graph.delete_image(&record).await.is_err());
        assert!(backend.image_exists(&config.image_name("mid")).await);
    }

    fn test_record(hash: &str, base_hash: &str) -> DeviceRecord {
        crate::registry::test_support::record(hash, base_hash, 1024)
    }
}
