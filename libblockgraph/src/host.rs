//! Host-side operations: filesystem probing and creation, mount syscalls.
//!
//! Everything the driver needs from the host kernel and the mkfs tools is
//! behind [`HostOps`], so the device set can be exercised in tests without
//! root or real block devices. [`LinuxHost`] is the production
//! implementation.

use std::path::Path;

use async_trait::async_trait;
use nix::mount::{MntFlags, MsFlags, mount, umount, umount2};
use tokio::process::Command;
use tracing::debug;

use crate::config::FsType;
use crate::error::GraphError;

/// ext4 superblock magic, little-endian at byte 1080 of the device.
const EXT4_MAGIC_OFFSET: u64 = 1080;
const EXT4_MAGIC: [u8; 2] = [0x53, 0xEF];

/// XFS superblock magic at byte 0 of the device.
const XFS_MAGIC: [u8; 4] = *b"XFSB";

/// Capability interface to the host: filesystem tools and mount syscalls.
#[async_trait]
pub trait HostOps: Send + Sync {
    /// Identify the filesystem already present on a block device by its
    /// superblock magic.
    async fn probe_fs(&self, device: &str) -> Result<FsType, GraphError>;

    /// Create a filesystem on the device.
    async fn make_filesystem(
        &self,
        fstype: FsType,
        device: &str,
        mkfs_args: &[String],
    ) -> Result<(), GraphError>;

    /// Mount `device` at `target` with comma-joined `options`.
    fn mount(
        &self,
        device: &str,
        target: &Path,
        fstype: FsType,
        options: &str,
    ) -> nix::Result<()>;

    /// Unmount `target`, failing if it is busy.
    fn unmount(&self, target: &Path) -> nix::Result<()>;

    /// Lazily detach `target` even if it is busy. Used on shutdown.
    fn detach_unmount(&self, target: &Path) -> nix::Result<()>;

    /// Make `target` a private mount so mounts under it do not propagate
    /// to peer namespaces.
    fn make_private(&self, target: &Path) -> nix::Result<()>;
}

/// Production [`HostOps`] using real syscalls and the system mkfs tools.
pub struct LinuxHost;

#[async_trait]
impl HostOps for LinuxHost {
    async fn probe_fs(&self, device: &str) -> Result<FsType, GraphError> {
        use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};

        let mut file = tokio::fs::File::open(device).await?;

        let mut head = [0u8; 4];
        file.read_exact(&mut head).await?;
        if head == XFS_MAGIC {
            return Ok(FsType::Xfs);
        }

        file.seek(SeekFrom::Start(EXT4_MAGIC_OFFSET)).await?;
        let mut magic = [0u8; 2];
        file.read_exact(&mut magic).await?;
        if magic == EXT4_MAGIC {
            return Ok(FsType::Ext4);
        }

        Err(GraphError::UnsupportedFilesystem(format!(
            "no known filesystem on {device}"
        )))
    }

    async fn make_filesystem(
        &self,
        fstype: FsType,
        device: &str,
        mkfs_args: &[String],
    ) -> Result<(), GraphError> {
        match fstype {
            FsType::Xfs => {
                run_mkfs("mkfs.xfs", &[], mkfs_args, device, fstype).await?;
            }
            FsType::Ext4 => {
                // Skip lazy initialization so the filesystem is fully usable
                // the moment mkfs returns. Older mkfs.ext4 builds do not know
                // lazy_journal_init; retry without it.
                let full = ["-E", "nodiscard,lazy_itable_init=0,lazy_journal_init=0"];
                if run_mkfs("mkfs.ext4", &full, mkfs_args, device, fstype)
                    .await
                    .is_err()
                {
                    let partial = ["-E", "nodiscard,lazy_itable_init=0"];
                    run_mkfs("mkfs.ext4", &partial, mkfs_args, device, fstype).await?;
                }
                // Disable interval-based fsck; the images are short-lived.
                let output = Command::new("tune2fs")
                    .args(["-c", "-1", "-i", "0"])
                    .arg(device)
                    .output()
                    .await?;
                if !output.status.success() {
                    return Err(GraphError::MkfsFailed {
                        fstype: fstype.to_string(),
                        device: device.to_owned(),
                        reason: format!(
                            "tune2fs: {}",
                            String::from_utf8_lossy(&output.stderr).trim()
                        ),
                    });
                }
            }
        }
        debug!(device, %fstype, "created filesystem");
        Ok(())
    }

    fn mount(
        &self,
        device: &str,
        target: &Path,
        fstype: FsType,
        options: &str,
    ) -> nix::Result<()> {
        let data = if options.is_empty() {
            None
        } else {
            Some(options)
        };
        mount(
            Some(device),
            target,
            Some(fstype.as_str()),
            MsFlags::empty(),
            data,
        )
    }

    fn unmount(&self, target: &Path) -> nix::Result<()> {
        umount(target)
    }

    fn detach_unmount(&self, target: &Path) -> nix::Result<()> {
        umount2(target, MntFlags::MNT_DETACH)
    }

    fn make_private(&self, target: &Path) -> nix::Result<()> {
        // A mount point must exist at target before its propagation can be
        // changed, so bind it onto itself first.
        mount(
            Some(target),
            target,
            None::<&str>,
            MsFlags::MS_BIND,
            None::<&str>,
        )?;
        mount(
            None::<&str>,
            target,
            None::<&str>,
            MsFlags::MS_PRIVATE,
            None::<&str>,
        )
    }
}

async fn run_mkfs(
    tool: &str,
    extra: &[&str],
    mkfs_args: &[String],
    device: &str,
    fstype: FsType,
) -> Result<(), GraphError> {
    let output = Command::new(tool)
        .args(extra)
        .args(mkfs_args)
        .arg(device)
        .output()
        .await?;
    if !output.status.success() {
        return Err(GraphError::MkfsFailed {
            fstype: fstype.to_string(),
            device: device.to_owned(),
            reason: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::io::{Seek, SeekFrom, Write};

    use super::*;

    #[tokio::test]
    async fn probe_detects_xfs_magic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"XFSB").unwrap();
        file.as_file().set_len(2048).unwrap();
        file.flush().unwrap();

        let fs = LinuxHost
            .probe_fs(file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(fs, FsType::Xfs);
    }

    #[tokio::test]
    async fn probe_detects_ext4_magic() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(2048).unwrap();
        file.seek(SeekFrom::Start(EXT4_MAGIC_OFFSET)).unwrap();
        file.write_all(&EXT4_MAGIC).unwrap();
        file.flush().unwrap();

        let fs = LinuxHost
            .probe_fs(file.path().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(fs, FsType::Ext4);
    }

    #[tokio::test]
    async fn probe_rejects_blank_device() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(2048).unwrap();

        let result = LinuxHost.probe_fs(file.path().to_str().unwrap()).await;
        assert!(matches!(
            result,
            Err(GraphError::UnsupportedFilesystem(_))
        ));
    }
}
