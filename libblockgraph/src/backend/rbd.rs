//! Production backend driving the `rbd` and `rados` command-line tools.
//!
//! Image and snapshot operations go through `rbd`; metadata objects go
//! through `rados` with stdin/stdout piping so no staging files are needed.
//! Mapping uses `rbd map`/`rbd unmap`, with `rbd showmapped --format json`
//! as the live mapping table (older `rbd` binaries do not print the device
//! path on `map`, so the table is the only reliable source).

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::backend::{BlockBackend, MappedDevice};
use crate::config::DeviceSetConfig;
use crate::error::GraphError;

/// Backend implementation shelling out to the Ceph CLI tools.
pub struct RbdBackend {
    pool: String,
    client_id: String,
    config_file: String,
}

impl RbdBackend {
    pub fn new(config: &DeviceSetConfig) -> Self {
        Self {
            pool: config.data_pool.clone(),
            client_id: config.client_id.clone(),
            config_file: config.config_file.clone(),
        }
    }

    fn rbd(&self) -> Command {
        let mut cmd = Command::new("rbd");
        cmd.arg("--id")
            .arg(&self.client_id)
            .arg("--conf")
            .arg(&self.config_file)
            .arg("--pool")
            .arg(&self.pool);
        cmd
    }

    fn rados(&self) -> Command {
        let mut cmd = Command::new("rados");
        cmd.arg("--id")
            .arg(&self.client_id)
            .arg("--conf")
            .arg(&self.config_file)
            .arg("-p")
            .arg(&self.pool);
        cmd
    }

    /// Run a command to completion, mapping a non-zero exit into a backend
    /// error carrying the tool's stderr.
    async fn run(mut cmd: Command, what: &str) -> Result<Vec<u8>, GraphError> {
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| GraphError::Backend(format!("{what}: failed to run tool: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GraphError::Backend(format!(
                "{what}: {} ({})",
                stderr.trim(),
                output.status
            )));
        }
        Ok(output.stdout)
    }

    /// Like [`Self::run`], but treats a "No such file or directory" failure
    /// as `Ok(None)` so absence stays distinguishable from real failures.
    async fn run_optional(mut cmd: Command, what: &str) -> Result<Option<Vec<u8>>, GraphError> {
        let output = cmd
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| GraphError::Backend(format!("{what}: failed to run tool: {e}")))?;

        if output.status.success() {
            return Ok(Some(output.stdout));
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if is_not_found(&stderr) {
            debug!(what, "backend object not found");
            return Ok(None);
        }
        Err(GraphError::Backend(format!(
            "{what}: {} ({})",
            stderr.trim(),
            output.status
        )))
    }

    /// Run a command feeding `input` on stdin.
    async fn run_with_input(
        mut cmd: Command,
        input: &[u8],
        what: &str,
    ) -> Result<(), GraphError> {
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| GraphError::Backend(format!("{what}: failed to run tool: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .await
                .map_err(|e| GraphError::Backend(format!("{what}: writing stdin: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| GraphError::Backend(format!("{what}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(GraphError::Backend(format!(
                "{what}: {} ({})",
                stderr.trim(),
                output.status
            )));
        }
        Ok(())
    }
}

/// Whether a tool's stderr denotes plain absence rather than failure.
fn is_not_found(stderr: &str) -> bool {
    stderr.contains("No such file or directory") || stderr.contains("(2) No such file")
}

/// Parse `rbd showmapped --format json`. Newer releases emit a JSON array;
/// older ones emit an object keyed by mapping id. Both carry the same rows.
fn parse_showmapped(data: &[u8]) -> Result<Vec<MappedDevice>, GraphError> {
    let value: serde_json::Value = serde_json::from_slice(data)
        .map_err(|e| GraphError::Backend(format!("showmapped: malformed json: {e}")))?;

    let rows: Vec<&serde_json::Value> = match &value {
        serde_json::Value::Array(items) => items.iter().collect(),
        serde_json::Value::Object(map) => map.values().collect(),
        _ => {
            return Err(GraphError::Backend(
                "showmapped: unexpected json shape".to_owned(),
            ));
        }
    };

    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row.clone())
                .map_err(|e| GraphError::Backend(format!("showmapped: malformed row: {e}")))
        })
        .collect()
}

#[async_trait]
impl BlockBackend for RbdBackend {
    async fn create_image(&self, name: &str, size_bytes: u64) -> Result<(), GraphError> {
        // rbd takes the size in MiB; round up so we never under-provision.
        let size_mib = size_bytes.div_ceil(1024 * 1024).max(1);
        let mut cmd = self.rbd();
        cmd.args(["create", "--image-feature", "layering", "--size"])
            .arg(size_mib.to_string())
            .arg(name);
        Self::run(cmd, "rbd create").await.map(drop)
    }

    async fn remove_image(&self, name: &str) -> Result<(), GraphError> {
        let mut cmd = self.rbd();
        cmd.args(["rm", "--no-progress"]).arg(name);
        Self::run(cmd, "rbd rm").await.map(drop)
    }

    async fn snapshot_exists(&self, image: &str, snap: &str) -> Result<bool, GraphError> {
        let mut cmd = self.rbd();
        cmd.args(["info"]).arg(format!("{image}@{snap}"));
        Ok(Self::run_optional(cmd, "rbd info").await?.is_some())
    }

    async fn create_snapshot(&self, image: &str, snap: &str) -> Result<(), GraphError> {
        let mut cmd = self.rbd();
        cmd.args(["snap", "create"]).arg(format!("{image}@{snap}"));
        Self::run(cmd, "rbd snap create").await.map(drop)
    }

    async fn protect_snapshot(&self, image: &str, snap: &str) -> Result<(), GraphError> {
        let mut cmd = self.rbd();
        cmd.args(["snap", "protect"]).arg(format!("{image}@{snap}"));
        Self::run(cmd, "rbd snap protect").await.map(drop)
    }

    async fn unprotect_snapshot(&self, image: &str, snap: &str) -> Result<(), GraphError> {
        let mut cmd = self.rbd();
        cmd.args(["snap", "unprotect"]).arg(format!("{image}@{snap}"));
        Self::run(cmd, "rbd snap unprotect").await.map(drop)
    }

    async fn remove_snapshot(&self, image: &str, snap: &str) -> Result<(), GraphError> {
        let mut cmd = self.rbd();
        cmd.args(["snap", "rm"]).arg(format!("{image}@{snap}"));
        Self::run(cmd, "rbd snap rm").await.map(drop)
    }

    async fn clone_snapshot(
        &self,
        parent_image: &str,
        snap: &str,
        child_image: &str,
    ) -> Result<(), GraphError> {
        let mut cmd = self.rbd();
        cmd.args(["clone", "--image-feature", "layering"])
            .arg(format!("{parent_image}@{snap}"))
            .arg(child_image);
        Self::run(cmd, "rbd clone").await.map(drop)
    }

    async fn read_object(&self, oid: &str) -> Result<Option<Vec<u8>>, GraphError> {
        let mut cmd = self.rados();
        cmd.arg("get").arg(oid).arg("-");
        Self::run_optional(cmd, "rados get").await
    }

    async fn write_object(&self, oid: &str, data: &[u8]) -> Result<(), GraphError> {
        let mut cmd = self.rados();
        cmd.arg("put").arg(oid).arg("-");
        Self::run_with_input(cmd, data, "rados put").await
    }

    async fn delete_object(&self, oid: &str) -> Result<(), GraphError> {
        let mut cmd = self.rados();
        cmd.arg("rm").arg(oid);
        Self::run(cmd, "rados rm").await.map(drop)
    }

    async fn map_image(&self, image: &str) -> Result<(), GraphError> {
        let mut cmd = self.rbd();
        cmd.arg("map").arg(image);
        Self::run(cmd, "rbd map").await.map(drop)
    }

    async fn unmap_device(&self, device: &str) -> Result<(), GraphError> {
        let mut cmd = self.rbd();
        cmd.arg("unmap").arg(device);
        Self::run(cmd, "rbd unmap").await.map(drop)
    }

    async fn list_mapped(&self) -> Result<Vec<MappedDevice>, GraphError> {
        let mut cmd = self.rbd();
        cmd.args(["showmapped", "--format", "json"]);
        let out = Self::run(cmd, "rbd showmapped").await?;
        if out.iter().all(|b| b.is_ascii_whitespace()) {
            return Ok(Vec::new());
        }
        parse_showmapped(&out)
    }

    async fn close(&self) {
        // The CLI tools are stateless; there is no connection to tear down.
        debug!(pool = %self.pool, "backend released");
    }
}
