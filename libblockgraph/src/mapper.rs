//! Block-device mapping with live-table reconciliation.
//!
//! The kernel's mapping table outlives the daemon, so a recorded device path
//! is only a hint: every decision goes through [`BlockBackend::list_mapped`]
//! and the in-memory path is corrected to whatever the table says. The
//! corrected value is never written back to persistent metadata.

use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::backend::BlockBackend;
use crate::config::DeviceSetConfig;
use crate::error::GraphError;
use crate::registry::{DeviceRecord, DeviceState};

pub struct BlockMapper {
    backend: Arc<dyn BlockBackend>,
    config: Arc<DeviceSetConfig>,
}

impl BlockMapper {
    pub fn new(backend: Arc<dyn BlockBackend>, config: Arc<DeviceSetConfig>) -> Self {
        Self { backend, config }
    }

    /// Check the live mapping table for this record's image, reconciling
    /// `state.device_path` with what the table reports. The caller holds the
    /// record lock.
    pub async fn is_mapped(
        &self,
        record: &DeviceRecord,
        state: &mut DeviceState,
    ) -> Result<bool, GraphError> {
        let image = self.config.image_name(&record.hash);
        let live = self
            .backend
            .list_mapped()
            .await?
            .into_iter()
            .find(|row| row.pool == self.config.data_pool && row.name == image);

        let Some(row) = live else {
            return Ok(false);
        };

        match &state.device_path {
            None => state.device_path = Some(row.device),
            Some(recorded) if *recorded != row.device => {
                warn!(
                    hash = %record.hash,
                    recorded,
                    live = %row.device,
                    "recorded device path disagrees with mapping table, trusting live value"
                );
                state.device_path = Some(row.device);
            }
            Some(_) => {}
        }
        Ok(true)
    }

    /// Map the record's image to a host block device. Idempotent: an image
    /// mapped by a previous daemon run is adopted rather than remapped.
    #[instrument(skip(self, record, state), fields(hash = %record.hash))]
    pub async fn map(
        &self,
        record: &DeviceRecord,
        state: &mut DeviceState,
    ) -> Result<(), GraphError> {
        if state.device_path.is_some() {
            return Ok(());
        }
        if self.is_mapped(record, state).await? {
            debug!(hash = %record.hash, "adopting existing mapping");
            return Ok(());
        }

        let image = self.config.image_name(&record.hash);
        self.backend.map_image(&image).await?;

        // The mapping helper does not return the device path; recover it
        // from the table.
        if !self.is_mapped(record, state).await? {
            return Err(GraphError::MappingFailed(image));
        }
        Ok(())
    }

    /// Remove the record's host mapping. A mapping already removed behind
    /// our back (external unmap, reboot) just clears the recorded path.
    #[instrument(skip(self, record, state), fields(hash = %record.hash))]
    pub async fn unmap(
        &self,
        record: &DeviceRecord,
        state: &mut DeviceState,
    ) -> Result<(), GraphError> {
        if state.device_path.is_none() {
            return Ok(());
        }
        if !self.is_mapped(record, state).await? {
            debug!(hash = %record.hash, "mapping already gone");
            state.device_path = None;
            return Ok(());
        }

        // is_mapped corrected device_path to the live table, so it is
        // present and accurate here.
        if let Some(device) = &state.device_path {
            self.backend.unmap_device(device).await?;
        }
        state.device_path = None;
        Ok(())
    }
}
