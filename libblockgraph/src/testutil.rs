//! Shared test fixtures: a scriptable fake host and a device-set harness
//! over the in-memory backend.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use nix::errno::Errno;

use crate::backend::MemoryBackend;
use crate::config::{DeviceSetConfig, FsType};
use crate::deviceset::DeviceSet;
use crate::error::GraphError;
use crate::host::HostOps;

/// Fake [`HostOps`] recording every call, with injectable failures.
#[derive(Default)]
pub(crate) struct FakeHost {
    /// Reject mounts whose options carry the discard hint with `EINVAL`,
    /// like kernels that do not support it.
    pub reject_discard: AtomicBool,
    /// Fail every mkfs invocation.
    pub fail_mkfs: AtomicBool,
    pub mkfs_calls: AtomicU32,
    /// Filesystem reported by `probe_fs`.
    pub probe_result: Mutex<Option<FsType>>,
    /// Currently "mounted" targets and the options they were mounted with.
    pub mounts: Mutex<HashMap<PathBuf, String>>,
    /// Targets whose unmount (plain and detach) fails with `EBUSY`.
    pub fail_unmounts: Mutex<HashSet<PathBuf>>,
    pub detach_calls: Mutex<Vec<PathBuf>>,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mount_options_for(&self, target: &Path) -> Option<String> {
        self.mounts.lock().unwrap().get(target).cloned()
    }

    pub fn mounted_count(&self) -> usize {
        self.mounts.lock().unwrap().len()
    }

    pub fn fail_unmount_of(&self, target: &Path) {
        self.fail_unmounts.lock().unwrap().insert(target.to_owned());
    }

    pub fn clear_unmount_failures(&self) {
        self.fail_unmounts.lock().unwrap().clear();
    }
}

#[async_trait]
impl HostOps for FakeHost {
    async fn probe_fs(&self, _device: &str) -> Result<FsType, GraphError> {
        Ok(self.probe_result.lock().unwrap().unwrap_or(FsType::Ext4))
    }

    async fn make_filesystem(
        &self,
        fstype: FsType,
        device: &str,
        _mkfs_args: &[String],
    ) -> Result<(), GraphError> {
        self.mkfs_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_mkfs.load(Ordering::SeqCst) {
            return Err(GraphError::MkfsFailed {
                fstype: fstype.to_string(),
                device: device.to_owned(),
                reason: "injected mkfs failure".to_owned(),
            });
        }
        Ok(())
    }

    fn mount(
        &self,
        _device: &str,
        target: &Path,
        _fstype: FsType,
        options: &str,
    ) -> nix::Result<()> {
        if self.reject_discard.load(Ordering::SeqCst)
            && options.split(',').any(|o| o == "discard")
        {
            return Err(Errno::EINVAL);
        }
        self.mounts
            .lock()
            .unwrap()
            .insert(target.to_owned(), options.to_owned());
        Ok(())
    }

    fn unmount(&self, target: &Path) -> nix::Result<()> {
        if self.fail_unmounts.lock().unwrap().contains(target) {
            return Err(Errno::EBUSY);
        }
        self.mounts.lock().unwrap().remove(target);
        Ok(())
    }

    fn detach_unmount(&self, target: &Path) -> nix::Result<()> {
        self.detach_calls.lock().unwrap().push(target.to_owned());
        if self.fail_unmounts.lock().unwrap().contains(target) {
            return Err(Errno::EBUSY);
        }
        self.mounts.lock().unwrap().remove(target);
        Ok(())
    }

    fn make_private(&self, _target: &Path) -> nix::Result<()> {
        Ok(())
    }
}

pub(crate) struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub host: Arc<FakeHost>,
    pub devices: DeviceSet,
}

/// Device set over the in-memory backend and fake host, base image already
/// bootstrapped.
pub(crate) async fn harness() -> Harness {
    let config = DeviceSetConfig {
        base_image_size: 1 << 20,
        ..DeviceSetConfig::default()
    };
    harness_with(config).await
}

pub(crate) async fn harness_with(config: DeviceSetConfig) -> Harness {
    let backend = Arc::new(MemoryBackend::new(&config.data_pool));
    let host = Arc::new(FakeHost::new());
    let devices = DeviceSet::new(backend.clone(), host.clone(), config, true)
        .await
        .unwrap();
    Harness {
        backend,
        host,
        devices,
    }
}
