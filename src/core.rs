//! Core traits and data types for the acquisition engine.
//!
//! This module defines the foundational abstractions shared by the whole
//! crate: the native-depth pixel buffer, the per-image record handed to the
//! storage and display collaborators, and the capability traits the engine
//! consumes.
//!
//! # Architecture Overview
//!
//! The engine never talks to devices, files, or windows directly. It drives
//! four trait-based collaborators:
//!
//! - [`HardwareGateway`]: camera snapshot, stage motion, configuration
//!   switching, shutter and exposure control, device readiness waits.
//! - [`StorageSink`]: receives tagged image records and run metadata.
//! - [`DisplaySink`]: live view of records, countdown, and run status.
//! - [`AutofocusDevice`]: optional focus module (call contract only).
//!
//! # Data Flow
//!
//! ```text
//! SweepExecutor --[ImageRecord]--> StorageSink
//!                              \-> DisplaySink
//! ```
//!
//! # Thread Safety
//!
//! All traits require `Send + Sync`; the engine invokes them from its
//! scheduler task and, in position-major mode, from a dedicated worker
//! task. Overlapping hardware access is never permitted: calls are
//! serialized on the task driving the sweep.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::sequence::StagePosition;

// =============================================================================
// Pixel data
// =============================================================================

/// Memory-efficient pixel buffer supporting the camera's native bit depths.
///
/// Image data is kept in its native format to avoid type conversions and
/// memory bloat; scientific cameras output 8-bit or 16-bit unsigned pixels.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PixelBuffer {
    /// 8-bit unsigned integer pixels (1 byte/pixel)
    U8(Vec<u8>),
    /// 16-bit unsigned integer pixels (2 bytes/pixel)
    U16(Vec<u16>),
}

impl PixelBuffer {
    /// Returns the number of pixels in the buffer.
    pub fn len(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len(),
        }
    }

    /// Returns true if the buffer contains no pixels.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns the memory size in bytes.
    pub fn memory_bytes(&self) -> usize {
        match self {
            PixelBuffer::U8(data) => data.len(),
            PixelBuffer::U16(data) => data.len() * 2,
        }
    }

    /// Returns the per-pixel byte depth (1 or 2).
    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            PixelBuffer::U8(_) => 1,
            PixelBuffer::U16(_) => 2,
        }
    }

    /// Minimum and maximum pixel value, or `None` for an empty buffer.
    pub fn min_max(&self) -> Option<(f64, f64)> {
        match self {
            PixelBuffer::U8(data) => {
                let min = data.iter().min()?;
                let max = data.iter().max()?;
                Some((f64::from(*min), f64::from(*max)))
            }
            PixelBuffer::U16(data) => {
                let min = data.iter().min()?;
                let max = data.iter().max()?;
                Some((f64::from(*min), f64::from(*max)))
            }
        }
    }

    /// Nearest-neighbor rescale from `(src_w, src_h)` to `(dst_w, dst_h)`.
    ///
    /// Used when a channel or slice reports pixel dimensions that differ
    /// from the ones established at the start of the run; the record must
    /// conform to the run geometry before it is stored.
    pub fn resize(&self, src_w: u32, src_h: u32, dst_w: u32, dst_h: u32) -> PixelBuffer {
        fn nearest<T: Copy>(src: &[T], sw: u32, sh: u32, dw: u32, dh: u32) -> Vec<T> {
            let mut out = Vec::with_capacity((dw * dh) as usize);
            for y in 0..dh {
                let sy = (u64::from(y) * u64::from(sh) / u64::from(dh)) as u32;
                for x in 0..dw {
                    let sx = (u64::from(x) * u64::from(sw) / u64::from(dw)) as u32;
                    out.push(src[(sy * sw + sx) as usize]);
                }
            }
            out
        }

        match self {
            PixelBuffer::U8(data) => PixelBuffer::U8(nearest(data, src_w, src_h, dst_w, dst_h)),
            PixelBuffer::U16(data) => PixelBuffer::U16(nearest(data, src_w, src_h, dst_w, dst_h)),
        }
    }
}

// =============================================================================
// Image records and run summary
// =============================================================================

/// A single captured (or synthesized) image with its acquisition context.
///
/// The pixel buffer is owned by the record until it is handed to the
/// storage sink. `filled` marks records synthesized by the frame-skip and
/// slice-skip policies; those go to the display for continuity but are not
/// attached to storage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Identifier of the run this record belongs to.
    pub run_uid: String,
    /// Pixel data in native format (row-major order).
    pub pixels: PixelBuffer,
    pub width: u32,
    pub height: u32,
    /// Exposure used for this image, in milliseconds.
    pub exposure_ms: f64,
    /// Absolute z position at capture, in micrometers.
    pub z_um: f64,
    pub frame: u32,
    pub channel: u32,
    pub slice: u32,
    pub position: u32,
    /// UTC wall-clock timestamp of the capture.
    pub timestamp: DateTime<Utc>,
    /// Stage x/y in micrometers for multi-position runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_x_um: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_y_um: Option<f64>,
    /// Hardware state snapshot at capture time.
    pub state: serde_json::Value,
    /// True when this record duplicates earlier pixels instead of a snap.
    pub filled: bool,
}

/// Run-level summary handed to the storage and display sinks at setup.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_uid: String,
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    pub frames: u32,
    pub channels: u32,
    pub slices: u32,
    pub frame_interval_ms: f64,
    pub z_step_um: f64,
    pub channel_names: Vec<String>,
    pub channel_colors: Vec<[u8; 3]>,
    pub comment: String,
    /// Label of the stage position this summary describes, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_label: Option<String>,
}

/// Run status surfaced to the display collaborator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisplayStatus {
    Started,
    Paused,
    Resumed,
    Completed,
    Interrupted,
    Failed,
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// Hardware control capability consumed by the engine.
///
/// Implementations block until the device reports readiness; the engine
/// imposes no protocol-level timeouts of its own. All calls are made from
/// a single task at a time.
#[async_trait]
pub trait HardwareGateway: Send + Sync {
    /// Snap a single image and retrieve its pixels.
    async fn snap_image(&self) -> Result<PixelBuffer>;

    /// True when a focus (z) stage is configured.
    fn has_focus_stage(&self) -> bool;

    /// Move the focus stage to an absolute position in micrometers.
    async fn set_focus_position(&self, z_um: f64) -> Result<()>;

    /// Current focus stage position in micrometers.
    async fn focus_position(&self) -> Result<f64>;

    /// Block until the focus stage settles.
    async fn wait_for_focus_stage(&self) -> Result<()>;

    /// Move the XY (and optional Z) stage to a named position.
    async fn move_to_position(&self, pos: &StagePosition) -> Result<()>;

    /// Switch a configuration group to the named preset.
    async fn set_config(&self, group: &str, preset: &str) -> Result<()>;

    /// Block until the named preset is applied.
    async fn wait_for_config(&self, group: &str, preset: &str) -> Result<()>;

    /// Currently applied preset of a group, if any.
    async fn current_config(&self, group: &str) -> Result<Option<String>>;

    async fn set_exposure(&self, ms: f64) -> Result<()>;
    async fn exposure(&self) -> Result<f64>;

    async fn set_shutter_open(&self, open: bool) -> Result<()>;
    async fn shutter_open(&self) -> Result<bool>;

    async fn auto_shutter(&self) -> Result<bool>;
    async fn set_auto_shutter(&self, on: bool) -> Result<()>;

    /// Current camera geometry as (width, height, bytes per pixel).
    async fn image_dimensions(&self) -> Result<(u32, u32, u32)>;

    /// Block until every device in the system is ready.
    async fn wait_for_system(&self) -> Result<()>;

    /// Snapshot of the full device state, for per-image tagging.
    async fn system_state(&self) -> Result<serde_json::Value>;
}

/// Acquisition-data persistence capability.
#[async_trait]
pub trait StorageSink: Send + Sync {
    /// One-time setup with the run summary (dimensions, channels, comment).
    async fn initialize(&self, summary: &RunSummary) -> Result<()>;

    /// Update the logical extent of the dataset as frames accumulate.
    async fn set_dimensions(&self, frames: u32, channels: u32, slices: u32) -> Result<()>;

    /// Attach one tagged image to the dataset.
    async fn attach_image(&self, record: &ImageRecord) -> Result<()>;

    /// Persist accumulated metadata (file-backed runs, at termination).
    async fn save_metadata(&self) -> Result<()>;
}

/// Live display capability.
#[async_trait]
pub trait DisplaySink: Send + Sync {
    /// One-time setup with the run summary.
    async fn initialize(&self, summary: &RunSummary) -> Result<()>;

    /// Show a captured or filled-in record.
    async fn show_frame(&self, record: &ImageRecord) -> Result<()>;

    /// Set the display range of a channel (from the first frame's stats).
    async fn set_channel_range(&self, channel: u32, min: f64, max: f64) -> Result<()>;

    /// Time and frames remaining in the running sequence.
    async fn update_countdown(&self, ms_remaining: i64, frames_remaining: u32) -> Result<()>;

    /// Reflect the run status (started/paused/finished) in the display.
    async fn set_status(&self, status: DisplayStatus) -> Result<()>;
}

/// Optional autofocus module; only its call contract is used.
#[async_trait]
pub trait AutofocusDevice: Send + Sync {
    /// Run a full focus search.
    async fn full_focus(&self) -> Result<()>;

    /// Run an incremental focus refinement.
    async fn incremental_focus(&self) -> Result<()>;

    async fn is_continuous_focus_enabled(&self) -> Result<bool>;
    async fn enable_continuous_focus(&self, on: bool) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pixel_buffer_depth_and_size() {
        let b8 = PixelBuffer::U8(vec![0; 16]);
        assert_eq!(b8.bytes_per_pixel(), 1);
        assert_eq!(b8.memory_bytes(), 16);

        let b16 = PixelBuffer::U16(vec![0; 16]);
        assert_eq!(b16.bytes_per_pixel(), 2);
        assert_eq!(b16.memory_bytes(), 32);
        assert_eq!(b16.len(), 16);
        assert!(!b16.is_empty());
    }

    #[test]
    fn test_min_max() {
        let buf = PixelBuffer::U16(vec![7, 2, 9, 4]);
        assert_eq!(buf.min_max(), Some((2.0, 9.0)));
        assert_eq!(PixelBuffer::U8(vec![]).min_max(), None);
    }

    #[test]
    fn test_resize_nearest_neighbor() {
        // 2x2 -> 4x4 doubles every pixel in both directions
        let buf = PixelBuffer::U8(vec![1, 2, 3, 4]);
        let out = buf.resize(2, 2, 4, 4);
        assert_eq!(
            out,
            PixelBuffer::U8(vec![1, 1, 2, 2, 1, 1, 2, 2, 3, 3, 4, 4, 3, 3, 4, 4])
        );
    }

    #[test]
    fn test_resize_downscale() {
        let buf = PixelBuffer::U16((0..16).collect());
        let out = buf.resize(4, 4, 2, 2);
        assert_eq!(out, PixelBuffer::U16(vec![0, 2, 8, 10]));
    }
}
