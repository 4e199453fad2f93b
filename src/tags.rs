//! Per-image tagging and run-summary assembly.
//!
//! `MetadataEmitter` is the thin adapter between the sweep and the storage
//! collaborator: it assembles the run summary at setup, stamps every
//! captured image with its acquisition context and the hardware state
//! snapshot, and forwards the result to the sink. Storing rich tags
//! alongside the pixels is what makes a run reproducible and analyzable
//! long after the hardware session is gone.

use crate::core::{HardwareGateway, ImageRecord, PixelBuffer, RunSummary, StorageSink};
use crate::sequence::{SequenceSpec, StagePosition};
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use uuid::Uuid;

/// Generate a new unique run identifier.
pub fn new_run_uid() -> String {
    Uuid::new_v4().to_string()
}

/// Builds tagged image records and forwards them to the storage sink.
pub struct MetadataEmitter {
    storage: Arc<dyn StorageSink>,
    run_uid: String,
}

impl MetadataEmitter {
    pub fn new(storage: Arc<dyn StorageSink>, run_uid: String) -> Self {
        Self { storage, run_uid }
    }

    pub fn run_uid(&self) -> &str {
        &self.run_uid
    }

    /// Assembles the run summary from the spec and the established image
    /// geometry, and initializes the sink with it.
    pub async fn begin(
        &self,
        spec: &SequenceSpec,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
        slices: u32,
        position_label: Option<String>,
    ) -> Result<RunSummary> {
        let summary = RunSummary {
            run_uid: self.run_uid.clone(),
            width,
            height,
            bytes_per_pixel,
            frames: spec.effective_frames(),
            channels: spec.effective_channels(),
            slices,
            frame_interval_ms: spec.frame_interval_ms,
            z_step_um: spec.slice_step_um.abs(),
            channel_names: spec.channels.iter().map(|c| c.config.clone()).collect(),
            channel_colors: spec.channels.iter().map(|c| c.color).collect(),
            comment: spec.comment.clone(),
            position_label,
        };
        self.storage.initialize(&summary).await?;
        Ok(summary)
    }

    /// Builds a tagged record for a freshly captured image, including the
    /// gateway's state snapshot.
    #[allow(clippy::too_many_arguments)]
    pub async fn tag(
        &self,
        gateway: &dyn HardwareGateway,
        pixels: PixelBuffer,
        width: u32,
        height: u32,
        exposure_ms: f64,
        z_um: f64,
        frame: u32,
        channel: u32,
        slice: u32,
        position: u32,
        stage_pos: Option<&StagePosition>,
    ) -> Result<ImageRecord> {
        let state = gateway.system_state().await.unwrap_or_default();
        Ok(ImageRecord {
            run_uid: self.run_uid.clone(),
            pixels,
            width,
            height,
            exposure_ms,
            z_um,
            frame,
            channel,
            slice,
            position,
            timestamp: Utc::now(),
            stage_x_um: stage_pos.map(|p| p.x_um),
            stage_y_um: stage_pos.map(|p| p.y_um),
            state,
            filled: false,
        })
    }

    /// Attaches a record to the dataset.
    pub async fn emit(&self, record: &ImageRecord) -> Result<()> {
        self.storage.attach_image(record).await
    }

    /// Updates the dataset extent after a completed frame.
    pub async fn set_dimensions(&self, frames: u32, channels: u32, slices: u32) -> Result<()> {
        self.storage.set_dimensions(frames, channels, slices).await
    }

    /// Persists accumulated metadata (file-backed runs).
    pub async fn finish(&self) -> Result<()> {
        self.storage.save_metadata().await
    }
}
