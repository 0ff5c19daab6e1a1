//! Filesystem creation and mounting policy.
//!
//! Wraps [`HostOps`] with the driver's mount behavior: the filesystem on the
//! device is probed rather than assumed, xfs gets `nouuid` (every clone
//! carries the same UUID as the base image), and the `discard` hint is tried
//! first and dropped on `EINVAL` for kernels that reject it.

use std::path::Path;
use std::sync::Arc;

use nix::errno::Errno;
use tracing::{debug, instrument};

use crate::config::FsType;
use crate::error::GraphError;
use crate::host::HostOps;

/// Comma-join two mount option strings, skipping empty parts.
pub(crate) fn join_mount_options(a: &str, b: &str) -> String {
    match (a.is_empty(), b.is_empty()) {
        (true, _) => b.to_owned(),
        (_, true) => a.to_owned(),
        _ => format!("{a},{b}"),
    }
}

/// Append an SELinux context option for `label` to an option string.
pub(crate) fn format_mount_label(options: &str, label: &str) -> String {
    if label.is_empty() {
        options.to_owned()
    } else {
        join_mount_options(options, &format!("context=\"{label}\""))
    }
}

pub struct Mounter {
    host: Arc<dyn HostOps>,
    filesystem: FsType,
    mount_options: String,
    mkfs_args: Vec<String>,
}

impl Mounter {
    pub fn new(
        host: Arc<dyn HostOps>,
        filesystem: FsType,
        mount_options: String,
        mkfs_args: Vec<String>,
    ) -> Self {
        Self {
            host,
            filesystem,
            mount_options,
            mkfs_args,
        }
    }

    /// Create the configured filesystem on a device. Used once per base
    /// image bootstrap.
    pub async fn create_filesystem(&self, device: &str) -> Result<(), GraphError> {
        self.host
            .make_filesystem(self.filesystem, device, &self.mkfs_args)
            .await
    }

    /// Mount a device, probing its filesystem and applying the configured
    /// options plus an optional SELinux label.
    #[instrument(skip(self))]
    pub async fn mount(
        &self,
        device: &str,
        mount_point: &Path,
        mount_label: &str,
    ) -> Result<(), GraphError> {
        let fstype = self.host.probe_fs(device).await?;

        let mut options = String::new();
        if fstype == FsType::Xfs {
            // Clones share the base image's UUID; without nouuid only one of
            // them could ever be mounted.
            options = join_mount_options(&options, "nouuid");
        }
        options = join_mount_options(&options, &self.mount_options);
        options = format_mount_label(&options, mount_label);

        let with_discard = join_mount_options("discard", &options);
        let result = match self.host.mount(device, mount_point, fstype, &with_discard) {
            Err(Errno::EINVAL) => {
                debug!(device, "mount rejected discard hint, retrying without");
                self.host.mount(device, mount_point, fstype, &options)
            }
            other => other,
        };

        result.map_err(|errno| GraphError::MountFailed {
            device: device.to_owned(),
            path: mount_point.display().to_string(),
            errno,
        })
    }

    pub fn unmount(&self, mount_point: &Path) -> Result<(), GraphError> {
        self.host
            .unmount(mount_point)
            .map_err(|errno| GraphError::UnmountFailed {
                path: mount_point.display().to_string(),
                errno,
            })
    }

    /// Lazy detach for shutdown sweeps, where busy mounts must not stall the
    /// daemon.
    pub fn detach_unmount(&self, mount_point: &Path) -> nix::Result<()> {
        self.host.detach_unmount(mount_point)
    }
}
