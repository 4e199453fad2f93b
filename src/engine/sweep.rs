//! Nested slice/channel sweep for one frame tick.
//!
//! `SweepExecutor` performs the full position/slice/channel iteration for a
//! single frame, calling the hardware gateway and emitting tagged records
//! to storage and display. It owns the per-sequence context: the derived
//! slice depths, the reference z recorded at start, the run's established
//! image geometry, and the fill-in cache used by the skip policies.
//!
//! The abort flag is consulted at the top of every (slice, channel)
//! iteration and never mid-hardware-call; a snap or stage move in flight
//! always completes.

use crate::core::ImageRecord;
use crate::error::{AcqError, AcqResult};
use crate::sequence::{ChannelSpec, PositionMode, SliceMode};
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use super::RunCore;

/// Result of one `acquire_one_frame` call.
#[derive(Debug)]
pub enum FrameOutcome {
    /// More frames to go.
    Continue,
    /// The frame counter reached the configured count.
    Finished,
    /// A cooperative abort was honored mid-sweep.
    Aborted,
    /// A fatal error; the run must terminate and restore hardware.
    Failed(AcqError),
}

/// Shutter spans derived from the sweep order and the keep-open flags.
///
/// `whole` covers the entire slice/channel sweep of a frame; `inner`
/// covers each inner group (the channels of one slice in ChannelsFirst
/// order, the slices of one channel in SlicesFirst order). Only active
/// while the camera's auto-shutter is bypassed.
#[derive(Clone, Copy, Debug, Default)]
struct ShutterSpans {
    whole: bool,
    inner: bool,
}

impl ShutterSpans {
    fn derive(mode: SliceMode, keep_open_slices: bool, keep_open_channels: bool) -> Self {
        match mode {
            SliceMode::ChannelsFirst => Self {
                whole: keep_open_slices,
                inner: keep_open_channels && !keep_open_slices,
            },
            SliceMode::SlicesFirst => Self {
                whole: keep_open_channels,
                inner: keep_open_slices && !keep_open_channels,
            },
        }
    }

    fn any(&self) -> bool {
        self.whole || self.inner
    }
}

/// Per-sequence sweep state and execution.
pub struct SweepExecutor {
    core: Arc<RunCore>,
    slice_depths: Vec<f64>,
    reference_z: f64,
    /// (width, height, bytes per pixel) established by the first sample.
    run_dims: Option<(u32, u32, u32)>,
    /// Most recent real image per (channel, slice), for skip fill-ins.
    fill_cache: HashMap<(u32, u32), ImageRecord>,
    /// Channels whose display range was already set from frame 0.
    ranged_channels: HashSet<u32>,
    previous_pos: Option<u32>,
    /// Whether the focus stage moved during the current frame.
    stage_moved: bool,
}

impl SweepExecutor {
    /// Prepares a sweep for one frame sequence: derives slice depths and
    /// records the reference z from the focus device (0 without one).
    pub async fn new(core: Arc<RunCore>) -> Self {
        let slice_depths = core.spec.slice_depths(core.settings.min_z_step_um);
        let reference_z = if core.gateway.has_focus_stage() {
            core.gateway.focus_position().await.unwrap_or(0.0)
        } else {
            0.0
        };
        Self {
            core,
            slice_depths,
            reference_z,
            run_dims: None,
            fill_cache: HashMap::new(),
            ranged_channels: HashSet::new(),
            previous_pos: None,
            stage_moved: false,
        }
    }

    pub fn slice_count(&self) -> u32 {
        self.slice_depths.len() as u32
    }

    fn channel(&self, idx: u32) -> &ChannelSpec {
        &self.core.spec.channels[idx as usize]
    }

    /// Acquires one frame of the sequence at the given position index.
    pub async fn acquire_one_frame(&mut self, pos_idx: u32) -> FrameOutcome {
        let frame_started = Instant::now();
        let frame = self.core.state.frame_index();
        self.stage_moved = false;

        if let Err(e) = self.prepare_position(pos_idx).await {
            return FrameOutcome::Failed(e);
        }

        // suspend continuous focus for the duration of the sweep
        let mut suspended_focus = false;
        if let Some(af) = &self.core.autofocus {
            if af.is_continuous_focus_enabled().await.unwrap_or(false) {
                if let Err(e) = af.enable_continuous_focus(false).await {
                    warn!("Could not suspend continuous focus: {e}");
                } else {
                    suspended_focus = true;
                }
            }
        }

        let spans = ShutterSpans::derive(
            self.core.spec.slice_mode,
            self.core.spec.keep_shutter_open_slices,
            self.core.spec.keep_shutter_open_channels,
        );
        let manage_shutter =
            spans.any() && self.core.gateway.auto_shutter().await.unwrap_or(false);
        if manage_shutter {
            if let Err(e) = self.core.gateway.set_auto_shutter(false).await {
                warn!("Could not bypass auto-shutter: {e}");
            }
        }

        let mut aborted = false;
        let sweep_result = self
            .run_sweep(pos_idx, frame, spans, manage_shutter, &mut aborted)
            .await;

        // restore the shutter to camera control
        if manage_shutter {
            if let Err(e) = self.core.gateway.set_shutter_open(false).await {
                warn!("Could not close shutter after sweep: {e}");
            }
            if let Err(e) = self.core.gateway.set_auto_shutter(true).await {
                warn!("Could not restore auto-shutter: {e}");
            }
        }

        // return to the pre-frame reference z
        let autofocus_ran = self.core.spec.autofocus_enabled && self.core.autofocus.is_some();
        if self.core.gateway.has_focus_stage()
            && (self.stage_moved || (autofocus_ran && !suspended_focus))
        {
            if let Err(e) = self.return_to_reference_z().await {
                warn!("Could not return to reference z: {e}");
            }
        }

        if suspended_focus {
            if let Some(af) = &self.core.autofocus {
                if let Err(e) = af.enable_continuous_focus(true).await {
                    warn!("Could not re-enable continuous focus: {e}");
                }
            }
        }

        if let Err(e) = sweep_result {
            return FrameOutcome::Failed(e);
        }
        if aborted {
            return FrameOutcome::Aborted;
        }

        self.finish_frame(pos_idx, frame, frame_started).await
    }

    /// Moves the stage when the position changed and refreshes the
    /// reference z afterwards.
    async fn prepare_position(&mut self, pos_idx: u32) -> AcqResult<()> {
        self.core.state.set_position_index(pos_idx);
        if !self.core.spec.multiple_positions() {
            return Ok(());
        }

        if self.previous_pos != Some(pos_idx) {
            let pos = &self.core.spec.positions[pos_idx as usize];
            debug!("Moving to position {} ({})", pos_idx, pos.label);
            self.core
                .gateway
                .move_to_position(pos)
                .await
                .map_err(AcqError::hardware)?;
            self.core
                .gateway
                .wait_for_system()
                .await
                .map_err(AcqError::hardware)?;
        }

        if self.core.spec.autofocus_enabled {
            if let Some(af) = &self.core.autofocus {
                af.full_focus().await.map_err(AcqError::hardware)?;
            }
        }
        self.previous_pos = Some(pos_idx);

        if self.core.gateway.has_focus_stage() {
            self.reference_z = self
                .core
                .gateway
                .focus_position()
                .await
                .map_err(AcqError::hardware)?;
        }
        Ok(())
    }

    async fn run_sweep(
        &mut self,
        pos_idx: u32,
        frame: u32,
        spans: ShutterSpans,
        manage_shutter: bool,
        aborted: &mut bool,
    ) -> AcqResult<()> {
        let num_slices = self.slice_depths.len() as u32;
        let num_channels = self.core.spec.effective_channels();

        if manage_shutter && spans.whole {
            self.core
                .gateway
                .set_shutter_open(true)
                .await
                .map_err(AcqError::hardware)?;
        }

        match self.core.spec.slice_mode {
            SliceMode::ChannelsFirst => {
                'slices: for j in 0..num_slices {
                    if self.core.state.abort_requested() {
                        self.core.state.take_abort();
                        *aborted = true;
                        break 'slices;
                    }
                    let z = self.slice_z(j).await?;
                    if manage_shutter && spans.inner {
                        self.core
                            .gateway
                            .set_shutter_open(true)
                            .await
                            .map_err(AcqError::hardware)?;
                    }
                    for k in 0..num_channels {
                        if self.core.state.abort_requested() {
                            self.core.state.take_abort();
                            *aborted = true;
                            break 'slices;
                        }
                        self.protocol_body(frame, j, k, pos_idx, z).await?;
                    }
                    if manage_shutter && spans.inner {
                        self.core
                            .gateway
                            .set_shutter_open(false)
                            .await
                            .map_err(AcqError::hardware)?;
                    }
                }
            }
            SliceMode::SlicesFirst => {
                'channels: for k in 0..num_channels {
                    if self.core.state.abort_requested() {
                        self.core.state.take_abort();
                        *aborted = true;
                        break 'channels;
                    }
                    if manage_shutter && spans.inner {
                        self.core
                            .gateway
                            .set_shutter_open(true)
                            .await
                            .map_err(AcqError::hardware)?;
                    }
                    for j in 0..num_slices {
                        if self.core.state.abort_requested() {
                            self.core.state.take_abort();
                            *aborted = true;
                            break 'channels;
                        }
                        let z = self.slice_z(j).await?;
                        self.protocol_body(frame, j, k, pos_idx, z).await?;
                    }
                    if manage_shutter && spans.inner {
                        self.core
                            .gateway
                            .set_shutter_open(false)
                            .await
                            .map_err(AcqError::hardware)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Computes the absolute z of a slice and moves the focus stage there
    /// when the sweep actually uses the z dimension.
    async fn slice_z(&mut self, slice_idx: u32) -> AcqResult<f64> {
        let offset = self.slice_depths[slice_idx as usize];
        let z = if self.core.spec.absolute_z {
            offset
        } else {
            self.reference_z + offset
        };
        if self.core.gateway.has_focus_stage() && self.slice_depths.len() > 1 {
            self.core
                .gateway
                .set_focus_position(z)
                .await
                .map_err(AcqError::hardware)?;
            self.stage_moved = true;
        }
        Ok(z)
    }

    /// The per-(slice, channel) body: skip policies, hardware setup, snap,
    /// validation, tagging, and emission.
    async fn protocol_body(
        &mut self,
        frame: u32,
        slice_idx: u32,
        channel_idx: u32,
        pos_idx: u32,
        z: f64,
    ) -> AcqResult<()> {
        let ch = self.channel(channel_idx).clone();

        // frame-skip: fill the gap from the most recent real image
        if frame > 0 && frame % ch.period() != 0 {
            self.show_filled(channel_idx, slice_idx, slice_idx, frame).await;
            return Ok(());
        }

        // slice-skip: channels opting out of the z sweep reuse slice 0
        if !ch.do_z_stack && slice_idx > 0 {
            self.show_filled(channel_idx, 0, slice_idx, frame).await;
            return Ok(());
        }

        let gateway = &self.core.gateway;
        let mut z_actual = z;
        if gateway.has_focus_stage() && ch.z_offset_um != 0.0 && !ch.config.is_empty() {
            gateway
                .wait_for_focus_stage()
                .await
                .map_err(AcqError::hardware)?;
            z_actual = z + ch.z_offset_um;
            gateway
                .set_focus_position(z_actual)
                .await
                .map_err(AcqError::hardware)?;
            self.stage_moved = true;
        }

        if !ch.config.is_empty() {
            let group = &self.core.spec.channel_group;
            gateway
                .set_config(group, &ch.config)
                .await
                .map_err(AcqError::hardware)?;
            gateway
                .wait_for_config(group, &ch.config)
                .await
                .map_err(AcqError::hardware)?;
            gateway
                .set_exposure(ch.exposure_ms)
                .await
                .map_err(AcqError::hardware)?;
        }

        let pixels = gateway.snap_image().await.map_err(AcqError::hardware)?;
        let (width, height, depth) = gateway
            .image_dimensions()
            .await
            .map_err(AcqError::hardware)?;

        // one-time setup on the very first sample of this sequence
        if self.run_dims.is_none() {
            self.run_dims = Some((width, height, depth));
            let label = if self.core.spec.multiple_positions()
                && self.core.spec.position_mode == PositionMode::MultiField
            {
                Some(self.core.spec.positions[pos_idx as usize].label.clone())
            } else {
                None
            };
            let summary = self
                .core
                .emitter
                .begin(
                    &self.core.spec,
                    width,
                    height,
                    depth,
                    self.slice_count(),
                    label,
                )
                .await
                .map_err(|e| AcqError::Storage(e.to_string()))?;
            self.core
                .display
                .initialize(&summary)
                .await
                .map_err(AcqError::hardware)?;
        }
        let (run_w, run_h, run_depth) = self.run_dims.unwrap_or((width, height, depth));

        // check the frame fits in memory before storing its first image
        if slice_idx == 0 && channel_idx == 0 {
            let required = self.core.guard.frame_bytes(
                self.core.spec.effective_channels(),
                self.slice_count(),
                run_w,
                run_h,
                run_depth,
            );
            self.core.guard.check_frame(required).await?;
        }

        // byte depth must be uniform across the whole run
        if pixels.bytes_per_pixel() != run_depth {
            return Err(AcqError::DepthMismatch {
                expected: run_depth,
                actual: pixels.bytes_per_pixel(),
            });
        }

        // conform drifting pixel geometry to the run dimensions
        let pixels = if width != run_w || height != run_h {
            info!("Scaling from {width}x{height} to {run_w}x{run_h}");
            pixels.resize(width, height, run_w, run_h)
        } else {
            pixels
        };

        let stage_pos = if self.core.spec.multiple_positions() {
            Some(&self.core.spec.positions[pos_idx as usize])
        } else {
            None
        };
        let record = self
            .core
            .emitter
            .tag(
                self.core.gateway.as_ref(),
                pixels,
                run_w,
                run_h,
                ch.exposure_ms,
                z_actual,
                frame,
                channel_idx,
                slice_idx,
                pos_idx,
                stage_pos,
            )
            .await
            .map_err(|e| AcqError::Storage(e.to_string()))?;

        // auto-scale the channel display from the first slice of frame 0
        if slice_idx == 0 && frame == 0 && !self.ranged_channels.contains(&channel_idx) {
            if let Some((min, max)) = record.pixels.min_max() {
                if let Err(e) = self
                    .core
                    .display
                    .set_channel_range(channel_idx, min, max)
                    .await
                {
                    warn!("Could not set channel display range: {e}");
                }
            }
            self.ranged_channels.insert(channel_idx);
        }

        if let Err(e) = self.core.display.show_frame(&record).await {
            warn!("Display rejected frame: {e}");
        }
        self.core
            .emitter
            .emit(&record)
            .await
            .map_err(|e| AcqError::Storage(e.to_string()))?;

        self.fill_cache.insert((channel_idx, slice_idx), record);
        Ok(())
    }

    /// Re-emits a cached image to the display as a fill-in record.
    async fn show_filled(&self, channel_idx: u32, cached_slice: u32, slice_idx: u32, frame: u32) {
        if let Some(prev) = self.fill_cache.get(&(channel_idx, cached_slice)) {
            let mut record = prev.clone();
            record.frame = frame;
            record.slice = slice_idx;
            record.filled = true;
            record.timestamp = Utc::now();
            if let Err(e) = self.core.display.show_frame(&record).await {
                warn!("Display rejected fill-in frame: {e}");
            }
        }
    }

    async fn return_to_reference_z(&self) -> anyhow::Result<()> {
        self.core
            .gateway
            .set_focus_position(self.reference_z)
            .await?;
        self.core.gateway.wait_for_focus_stage().await
    }

    /// Post-sweep bookkeeping: countdown, dataset extent, frame counting,
    /// and the termination check.
    async fn finish_frame(
        &mut self,
        pos_idx: u32,
        frame: u32,
        frame_started: Instant,
    ) -> FrameOutcome {
        let spec = &self.core.spec;
        let total_frames = spec.effective_frames();

        let elapsed_ms = frame_started.elapsed().as_millis() as i64;
        let remaining_ms = spec.frame_interval_ms as i64 - elapsed_ms;
        if let Err(e) = self
            .core
            .display
            .update_countdown(remaining_ms, total_frames - frame)
            .await
        {
            warn!("Countdown update failed: {e}");
        }

        if let Err(e) = self
            .core
            .emitter
            .set_dimensions(frame + 1, spec.effective_channels(), self.slice_count())
            .await
        {
            warn!("Dataset dimension update failed: {e}");
        }

        // in time-lapse multi-position mode the frame counter advances only
        // after the last position of the tick
        let advance = if spec.multiple_positions() && spec.position_mode == PositionMode::TimeLapse
        {
            pos_idx as usize + 1 == spec.positions.len()
        } else {
            true
        };
        if advance {
            let current = self.core.state.advance_frame();
            if current >= total_frames {
                return FrameOutcome::Finished;
            }
        }
        FrameOutcome::Continue
    }
}
