//! Unified error type for the graph-driver core.
//!
//! The variants follow the failure taxonomy of the driver: configuration
//! errors are fatal at startup, backend and kernel errors propagate to the
//! caller of the triggering operation, consistency errors (duplicate device,
//! conflicting mount path, unmount without mount) are surfaced explicitly and
//! never silently coerced.

use nix::errno::Errno;
use thiserror::Error;

/// Unified error type for device-set and driver operations.
#[derive(Debug, Error)]
pub enum GraphError {
    /// An unrecognized `key=value` storage option was supplied.
    #[error("unknown storage option {0}")]
    UnknownOption(String),

    /// A storage option had a malformed or out-of-range value.
    #[error("invalid value for storage option {key}: {reason}")]
    InvalidOption {
        /// Option key as supplied by the caller.
        key: String,
        /// Human-readable failure reason.
        reason: String,
    },

    /// The configured filesystem type is not ext4 or xfs.
    #[error("unsupported filesystem type {0}")]
    UnsupportedFilesystem(String),

    /// The storage backend (or one of its helper tools) failed.
    #[error("backend error: {0}")]
    Backend(String),

    /// Encoding a metadata object failed.
    #[error("failed to encode metadata for device {hash:?}: {source}")]
    MetadataEncode {
        hash: String,
        #[source]
        source: serde_json::Error,
    },

    /// Decoding a metadata object read back from the backend failed.
    #[error("failed to decode metadata for device {hash:?}: {source}")]
    MetadataDecode {
        hash: String,
        #[source]
        source: serde_json::Error,
    },

    /// An encoded metadata object exceeded the fixed blob size cap.
    #[error("metadata for device {hash:?} is {actual} bytes, exceeding the {limit} byte limit")]
    MetadataTooLarge {
        hash: String,
        limit: usize,
        actual: usize,
    },

    /// A device with this hash is already registered.
    #[error("device {0:?} already exists")]
    DeviceExists(String),

    /// No device record is registered for this hash.
    #[error("device {0:?} not found")]
    DeviceNotFound(String),

    /// The parent record a clone was requested from does not exist.
    #[error("base device {0:?} not found")]
    BaseNotFound(String),

    /// Mapping succeeded per the helper tool but the live mapping table does
    /// not show the image, so no device path could be recovered.
    #[error("unable to map image {0}")]
    MappingFailed(String),

    /// The device is mounted and a second mount was requested at a
    /// different path.
    #[error("device {hash:?} is mounted at {mounted_at}, refusing second mount at {requested}")]
    MountConflict {
        hash: String,
        mounted_at: String,
        requested: String,
    },

    /// Unmount was requested for a device with no outstanding mounts.
    #[error("device {0:?} is not mounted")]
    NotMounted(String),

    /// The mount syscall failed (after the discard-hint retry, if any).
    #[error("error mounting {device} on {path}: {errno}")]
    MountFailed {
        device: String,
        path: String,
        errno: Errno,
    },

    /// The unmount syscall failed.
    #[error("error unmounting {path}: {errno}")]
    UnmountFailed { path: String, errno: Errno },

    /// A filesystem-creation tool exited with an error.
    #[error("creating {fstype} filesystem on {device} failed: {reason}")]
    MkfsFailed {
        fstype: String,
        device: String,
        reason: String,
    },

    /// Host filesystem I/O error (mount-point directories, marker files).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphError {
    /// Create a [`GraphError::Backend`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn backend<E: std::fmt::Display>(e: E) -> Self {
        Self::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = GraphError::DeviceNotFound("abc123".into());
        assert_eq!(err.to_string(), "device \"abc123\" not found");
    }

    #[test]
    fn mount_conflict_display() {
        let err = GraphError::MountConflict {
            hash: "h1".into(),
            mounted_at: "/mnt/a".into(),
            requested: "/mnt/b".into(),
        };
        assert!(err.to_string().contains("/mnt/a"));
        assert!(err.to_string().contains("/mnt/b"));
    }
}
