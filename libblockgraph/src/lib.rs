//! Content-addressed graph driver over a networked block store.
//!
//! Each filesystem layer is an image in the backend pool, created as a
//! copy-on-write clone of a snapshot on its parent image; the whole layer
//! tree is one clone graph rooted at a shared base image. Mounting a layer
//! maps its image to a host block device and mounts the filesystem created
//! on the base image during bootstrap.
//!
//! Module map:
//! - [`driver`]: the engine-facing operation surface (create/remove/get/put)
//! - [`deviceset`]: per-device orchestration and locking
//! - [`registry`] / [`metastore`]: in-memory records and their persisted form
//! - [`imagegraph`]: snapshot/protect/clone sequences
//! - [`mapper`]: block-device mapping reconciled against the live table
//! - [`mounter`] / [`host`]: filesystem creation and mount syscalls
//! - [`backend`]: the block-store capability trait and its implementations

pub mod backend;
pub mod config;
pub mod deviceset;
pub mod driver;
pub mod error;
pub mod host;
pub mod imagegraph;
pub mod mapper;
pub mod metastore;
pub mod mounter;
pub mod registry;

#[cfg(test)]
pub(crate) mod testutil;

pub use backend::{BlockBackend, MappedDevice, MemoryBackend, RbdBackend};
pub use config::{DeviceSetConfig, FsType};
pub use deviceset::{DeviceInfo, DeviceSet};
pub use driver::{DRIVER_NAME, GraphDriver};
pub use error::GraphError;
pub use host::{HostOps, LinuxHost};
pub use metastore::DeviceMetadata;
pub use registry::DeviceRecord;
