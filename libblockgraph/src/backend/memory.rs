//! In-memory backend for tests and development.
//!
//! Models just enough of a real block store to exercise the driver: images
//! with snapshots, snapshot protection, clone parentage, named metadata
//! objects and a fake mapping table handing out `/dev/mblk<N>` paths. The
//! removal guards mirror the real backend's rules: an image with snapshots
//! cannot be removed, a protected snapshot cannot be removed, and a snapshot
//! with live clones cannot be unprotected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::backend::{BlockBackend, MappedDevice};
use crate::error::GraphError;

#[derive(Debug, Default)]
struct SnapEntry {
    protected: bool,
    /// Names of clone images created from this snapshot.
    clones: Vec<String>,
}

#[derive(Debug, Default)]
struct ImageEntry {
    size_bytes: u64,
    snapshots: HashMap<String, SnapEntry>,
}

#[derive(Debug, Default)]
struct Inner {
    images: HashMap<String, ImageEntry>,
    /// child image -> (parent image, snapshot name)
    parents: HashMap<String, (String, String)>,
    objects: HashMap<String, Vec<u8>>,
    /// image -> host device path
    mapped: HashMap<String, String>,
    next_device: u32,
    closed: bool,
}

/// Fake [`BlockBackend`] backed by process memory.
pub struct MemoryBackend {
    pool: String,
    inner: Mutex<Inner>,
    fail_object_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new(pool: &str) -> Self {
        Self {
            pool: pool.to_owned(),
            inner: Mutex::new(Inner::default()),
            fail_object_writes: AtomicBool::new(false),
        }
    }

    /// Make every subsequent [`BlockBackend::write_object`] fail, for
    /// exercising rollback paths.
    pub fn fail_object_writes(&self, fail: bool) {
        self.fail_object_writes.store(fail, Ordering::SeqCst);
    }

    /// Whether [`BlockBackend::close`] has been called.
    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.closed
    }

    pub async fn image_exists(&self, name: &str) -> bool {
        self.inner.lock().await.images.contains_key(name)
    }

    pub async fn object_exists(&self, oid: &str) -> bool {
        self.inner.lock().await.objects.contains_key(oid)
    }

    pub async fn mapped_count(&self) -> usize {
        self.inner.lock().await.mapped.len()
    }

    /// Drop a mapping behind the driver's back, simulating an external
    /// unmap (administrator action, node reboot).
    pub async fn force_unmap(&self, image: &str) {
        self.inner.lock().await.mapped.remove(image);
    }
}

#[async_trait]
impl BlockBackend for MemoryBackend {
    async fn create_image(&self, name: &str, size_bytes: u64) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().await;
        if inner.images.contains_key(name) {
            return Err(GraphError::Backend(format!("image {name} already exists")));
        }
        inner.images.insert(
            name.to_owned(),
            ImageEntry {
                size_bytes,
                snapshots: HashMap::new(),
            },
        );
        Ok(())
    }

    async fn remove_image(&self, name: &str) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().await;
        let image = inner
            .images
            .get(name)
            .ok_or_else(|| GraphError::Backend(format!("image {name} not found")))?;
        if !image.snapshots.is_empty() {
            return Err(GraphError::Backend(format!(
                "image {name} has snapshots - not removing"
            )));
        }
        inner.images.remove(name);
        // Detach from the parent snapshot's clone list, if this was a clone.
        if let Some((parent, snap)) = inner.parents.remove(name) {
            if let Some(entry) = inner
                .images
                .get_mut(&parent)
                .and_then(|img| img.snapshots.get_mut(&snap))
            {
                entry.clones.retain(|c| c != name);
            }
        }
        Ok(())
    }

    async fn snapshot_exists(&self, image: &str, snap: &str) -> Result<bool, GraphError> {
        let inner = self.inner.lock().await;
        let entry = inner
            .images
            .get(image)
            .ok_or_else(|| GraphError::Backend(format!("image {image} not found")))?;
        Ok(entry.snapshots.contains_key(snap))
    }

    async fn create_snapshot(&self, image: &str, snap: &str) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .images
            .get_mut(image)
            .ok_or_else(|| GraphError::Backend(format!("image {image} not found")))?;
        if entry.snapshots.contains_key(snap) {
            return Err(GraphError::Backend(format!(
                "snapshot {image}@{snap} already exists"
            )));
        }
        entry.snapshots.insert(snap.to_owned(), SnapEntry::default());
        Ok(())
    }

    async fn protect_snapshot(&self, image: &str, snap: &str) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .images
            .get_mut(image)
            .and_then(|img| img.snapshots.get_mut(snap))
            .ok_or_else(|| GraphError::Backend(format!("snapshot {image}@{snap} not found")))?;
        entry.protected = true;
        Ok(())
    }

    async fn unprotect_snapshot(&self, image: &str, snap: &str) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().await;
        let entry = inner
            .images
            .get_mut(image)
            .and_then(|img| img.snapshots.get_mut(snap))
            .ok_or_else(|| GraphError::Backend(format!("snapshot {image}@{snap} not found")))?;
        if !entry.clones.is_empty() {
            return Err(GraphError::Backend(format!(
                "snapshot {image}@{snap} is in use by clones"
            )));
        }
        entry.protected = false;
        Ok(())
    }

    async fn remove_snapshot(&self, image: &str, snap: &str) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().await;
        let img = inner
            .images
            .get_mut(image)
            .ok_or_else(|| GraphError::Backend(format!("image {image} not found")))?;
        let entry = img
            .snapshots
            .get(snap)
            .ok_or_else(|| GraphError::Backend(format!("snapshot {image}@{snap} not found")))?;
        if entry.protected {
            return Err(GraphError::Backend(format!(
                "snapshot {image}@{snap} is protected"
            )));
        }
        img.snapshots.remove(snap);
        Ok(())
    }

    async fn clone_snapshot(
        &self,
        parent_image: &str,
        snap: &str,
        child_image: &str,
    ) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().await;
        if inner.images.contains_key(child_image) {
            return Err(GraphError::Backend(format!(
                "image {child_image} already exists"
            )));
        }
        let parent_size = {
            let entry = inner
                .images
                .get_mut(parent_image)
                .ok_or_else(|| GraphError::Backend(format!("image {parent_image} not found")))?;
            let snap_entry = entry.snapshots.get_mut(snap).ok_or_else(|| {
                GraphError::Backend(format!("snapshot {parent_image}@{snap} not found"))
            })?;
            if !snap_entry.protected {
                return Err(GraphError::Backend(format!(
                    "snapshot {parent_image}@{snap} is not protected"
                )));
            }
            snap_entry.clones.push(child_image.to_owned());
            entry.size_bytes
        };
        inner.images.insert(
            child_image.to_owned(),
            ImageEntry {
                size_bytes: parent_size,
                snapshots: HashMap::new(),
            },
        );
        inner
            .parents
            .insert(child_image.to_owned(), (parent_image.to_owned(), snap.to_owned()));
        Ok(())
    }

    async fn read_object(&self, oid: &str) -> Result<Option<Vec<u8>>, GraphError> {
        Ok(self.inner.lock().await.objects.get(oid).cloned())
    }

    async fn write_object(&self, oid: &str, data: &[u8]) -> Result<(), GraphError> {
        if self.fail_object_writes.load(Ordering::SeqCst) {
            return Err(GraphError::Backend("injected object write failure".into()));
        }
        self.inner
            .lock()
            .await
            .objects
            .insert(oid.to_owned(), data.to_vec());
        Ok(())
    }

    async fn delete_object(&self, oid: &str) -> Result<(), GraphError> {
        self.inner
            .lock()
            .await
            .objects
            .remove(oid)
            .map(drop)
            .ok_or_else(|| GraphError::Backend(format!("object {oid} not found")))
    }

    async fn map_image(&self, image: &str) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().await;
        if !inner.images.contains_key(image) {
            return Err(GraphError::Backend(format!("image {image} not found")));
        }
        if inner.mapped.contains_key(image) {
            return Ok(());
        }
        let device = format!("/dev/mblk{}", inner.next_device);
        inner.next_device += 1;
        inner.mapped.insert(image.to_owned(), device);
        Ok(())
    }

    async fn unmap_device(&self, device: &str) -> Result<(), GraphError> {
        let mut inner = self.inner.lock().await;
        let image = inner
            .mapped
            .iter()
            .find(|(_, dev)| dev.as_str() == device)
            .map(|(img, _)| img.clone())
            .ok_or_else(|| GraphError::Backend(format!("device {device} is not mapped")))?;
        inner.mapped.remove(&image);
        Ok(())
    }

    async fn list_mapped(&self) -> Result<Vec<MappedDevice>, GraphError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .mapped
            .iter()
            .map(|(image, device)| MappedDevice {
                pool: self.pool.clone(),
                name: image.clone(),
                snap: String::new(),
                device: device.clone(),
            })
            .collect())
    }

    async fn close(&self) {
        self.inner.lock().await.closed = true;
    }
}
