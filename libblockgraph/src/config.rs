//! Device-set configuration.
//!
//! [`DeviceSetConfig`] carries every tunable of the driver: the backend pool
//! and naming prefixes, base image size, filesystem type, extra mkfs
//! arguments and mount options. It is built once at startup from repeated
//! `key=value` option strings; an unknown key is a fatal configuration error.

use std::fmt;
use std::str::FromStr;

use crate::error::GraphError;
use crate::mounter::join_mount_options;

/// Default backend configuration file consulted by the CLI tools.
pub const DEFAULT_CONFIG_FILE: &str = "/etc/ceph/ceph.conf";

/// Default logical size of the base image: 10 GiB.
pub const DEFAULT_BASE_IMAGE_SIZE: u64 = 10 * 1024 * 1024 * 1024;

/// Filesystem types the driver knows how to create and mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsType {
    Ext4,
    Xfs,
}

impl FsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FsType::Ext4 => "ext4",
            FsType::Xfs => "xfs",
        }
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FsType {
    type Err = GraphError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ext4" => Ok(FsType::Ext4),
            "xfs" => Ok(FsType::Xfs),
            other => Err(GraphError::UnsupportedFilesystem(other.to_owned())),
        }
    }
}

/// Process-wide driver configuration.
///
/// Image, snapshot and metadata-object names are all derived from the content
/// hash through the naming helpers below; the empty hash designates the base
/// image.
#[derive(Debug, Clone)]
pub struct DeviceSetConfig {
    /// Backend pool holding images and metadata objects.
    pub data_pool: String,
    /// Prefix for backend image names.
    pub image_prefix: String,
    /// Prefix for hash-derived snapshot names.
    pub snap_prefix: String,
    /// Prefix for per-device metadata object names.
    pub meta_prefix: String,
    /// Name component of the base image (combined with `image_prefix`).
    pub base_image_name: String,
    /// Logical size of the base image in bytes.
    pub base_image_size: u64,
    /// Backend client identity.
    pub client_id: String,
    /// Backend configuration file path.
    pub config_file: String,
    /// Filesystem created on the base image.
    pub filesystem: FsType,
    /// Extra arguments forwarded to the mkfs tool.
    pub mkfs_args: Vec<String>,
    /// Extra mount options, comma-joined.
    pub mount_options: String,
}

impl Default for DeviceSetConfig {
    fn default() -> Self {
        Self {
            data_pool: "rbd".to_owned(),
            image_prefix: "docker_image".to_owned(),
            snap_prefix: "docker_snap".to_owned(),
            meta_prefix: "docker_meta".to_owned(),
            base_image_name: "base_image".to_owned(),
            base_image_size: DEFAULT_BASE_IMAGE_SIZE,
            client_id: "admin".to_owned(),
            config_file: DEFAULT_CONFIG_FILE.to_owned(),
            filesystem: FsType::Ext4,
            mkfs_args: Vec::new(),
            mount_options: String::new(),
        }
    }
}

impl DeviceSetConfig {
    /// Build a configuration from repeated `key=value` option strings.
    ///
    /// Recognized keys: `basesize`, `datapool`, `imageprefix`, `client`,
    /// `configfile`, `fs`, `mkfsarg` (repeatable), `mountopt`. Any other key
    /// fails with [`GraphError::UnknownOption`].
    pub fn from_options(options: &[String]) -> Result<Self, GraphError> {
        let mut cfg = Self::default();

        for option in options {
            let (key, val) = option.split_once('=').ok_or_else(|| GraphError::InvalidOption {
                key: option.clone(),
                reason: "expected key=value".to_owned(),
            })?;
            let key = key.to_ascii_lowercase();

            match key.as_str() {
                "basesize" => {
                    cfg.base_image_size =
                        parse_size(val).map_err(|reason| GraphError::InvalidOption {
                            key,
                            reason,
                        })?;
                }
                "datapool" => cfg.data_pool = val.to_owned(),
                "imageprefix" => cfg.image_prefix = val.to_owned(),
                "client" => cfg.client_id = val.to_owned(),
                "configfile" => cfg.config_file = val.to_owned(),
                "fs" => cfg.filesystem = val.parse()?,
                "mkfsarg" => cfg.mkfs_args.push(val.to_owned()),
                "mountopt" => {
                    cfg.mount_options = join_mount_options(&cfg.mount_options, val);
                }
                _ => return Err(GraphError::UnknownOption(key)),
            }
        }

        Ok(cfg)
    }

    /// Backend image name for a content hash; the empty hash names the base
    /// image.
    pub fn image_name(&self, hash: &str) -> String {
        if hash.is_empty() {
            format!("{}_{}", self.image_prefix, self.base_image_name)
        } else {
            format!("{}_{}", self.image_prefix, hash)
        }
    }

    /// Snapshot name derived from the *child* hash. The snapshot lives on the
    /// parent image and is the clone source for the child.
    pub fn snap_name(&self, hash: &str) -> String {
        format!("{}_{}", self.snap_prefix, hash)
    }

    /// Metadata object name for a content hash.
    pub fn meta_object_name(&self, hash: &str) -> String {
        if hash.is_empty() {
            format!("{}_{}", self.meta_prefix, self.base_image_name)
        } else {
            format!("{}_{}", self.meta_prefix, hash)
        }
    }
}

/// Parse a human-readable byte size such as `1024`, `512k`, `10G` or `1tb`.
/// Suffixes are binary multiples and case-insensitive; an optional trailing
/// `b`/`ib` is accepted.
pub fn parse_size(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let digits_end = s
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(s.len());
    let (digits, suffix) = s.split_at(digits_end);

    if digits.is_empty() {
        return Err(format!("{s:?} is not a size"));
    }
    let value: u64 = digits.parse().map_err(|_| format!("{s:?} is not a size"))?;

    let suffix = suffix.trim().to_ascii_lowercase();
    let suffix = suffix
        .strip_suffix("ib")
        .or_else(|| suffix.strip_suffix('b'))
        .unwrap_or(&suffix);

    let shift: u32 = match suffix {
        "" => 0,
        "k" => 10,
        "m" => 20,
        "g" => 30,
        "t" => 40,
        other => return Err(format!("unknown size suffix {other:?}")),
    };

    if value != 0 && value.leading_zeros() < shift {
        return Err(format!("size {s:?} overflows"));
    }
    Ok(value << shift)
}
