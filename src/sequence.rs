//! Sweep description: frames, slices, channels, positions, and modes.
//!
//! A [`SequenceSpec`] is the immutable-per-run description of a
//! multi-dimensional acquisition: how many time points, which z-slices,
//! which channel presets, which stage positions, and in what nesting
//! order. The engine reads it; it never mutates it.

use serde::{Deserialize, Serialize};

/// Default exposure substituted when the camera cannot be queried, in ms.
pub const DEFAULT_EXPOSURE_MS: f64 = 10.0;

/// Nesting order of the slice/channel sweep within one frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SliceMode {
    /// Slice is the outer loop; the channel index changes fastest.
    ChannelsFirst,
    /// Channel is the outer loop; the slice index changes fastest.
    SlicesFirst,
}

/// How stage positions interleave with the frame sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionMode {
    /// Each frame tick visits all positions before the next tick.
    TimeLapse,
    /// Each position completes its entire frame sequence before the next
    /// position starts.
    MultiField,
}

/// A named channel: hardware configuration preset plus acquisition and
/// display metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelSpec {
    /// Configuration preset name within the channel group.
    pub config: String,
    /// Exposure in milliseconds.
    pub exposure_ms: f64,
    /// Z offset applied on top of the slice position, in micrometers.
    pub z_offset_um: f64,
    /// Whether this channel participates in the z sweep. When false,
    /// slices past the first duplicate the first slice's image.
    pub do_z_stack: bool,
    /// Acquire only every (|skip|+1)-th frame; skipped frames are filled
    /// in from the most recent real image.
    pub skip_frames: i32,
    /// Display range.
    pub display_min: f64,
    pub display_max: f64,
    /// Display color as RGB.
    pub color: [u8; 3],
}

impl ChannelSpec {
    /// Channel using the given preset with defaults for everything else.
    pub fn named(config: &str) -> Self {
        Self {
            config: config.to_string(),
            ..Self::default()
        }
    }

    /// The effective skip period: a frame is acquired when
    /// `frame % period() == 0`.
    pub fn period(&self) -> u32 {
        self.skip_frames.unsigned_abs() + 1
    }
}

impl Default for ChannelSpec {
    fn default() -> Self {
        Self {
            config: String::new(),
            exposure_ms: DEFAULT_EXPOSURE_MS,
            z_offset_um: 0.0,
            do_z_stack: true,
            skip_frames: 0,
            display_min: 0.0,
            display_max: 65535.0,
            color: [255, 255, 255],
        }
    }
}

/// A stage position referenced by index from the externally owned list.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StagePosition {
    pub label: String,
    pub x_um: f64,
    pub y_um: f64,
    /// Optional per-position z, applied when moving to the position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub z_um: Option<f64>,
}

impl StagePosition {
    pub fn new(label: &str, x_um: f64, y_um: f64) -> Self {
        Self {
            label: label.to_string(),
            x_um,
            y_um,
            z_um: None,
        }
    }
}

/// Immutable-per-run description of the acquisition sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceSpec {
    /// Number of frame ticks.
    pub frame_count: u32,
    /// Interval between frame ticks; coerced to >= 1 ms at start.
    pub frame_interval_ms: f64,

    /// Dimension toggles. A disabled dimension behaves as length 1.
    pub use_frames: bool,
    pub use_slices: bool,
    pub use_channels: bool,
    pub use_positions: bool,

    /// Z sweep extent, in micrometers.
    pub slice_bottom_um: f64,
    pub slice_top_um: f64,
    pub slice_step_um: f64,
    /// Interpret slice depths as absolute stage positions rather than
    /// offsets from the pre-frame reference z.
    pub absolute_z: bool,

    /// Configuration group the channel presets belong to.
    pub channel_group: String,
    pub channels: Vec<ChannelSpec>,
    pub positions: Vec<StagePosition>,

    pub slice_mode: SliceMode,
    pub position_mode: PositionMode,

    /// Keep the shutter open across a whole z-stack (ChannelsFirst spans)
    /// instead of cycling it per exposure.
    pub keep_shutter_open_slices: bool,
    /// Keep the shutter open across all channels of a slice.
    pub keep_shutter_open_channels: bool,

    /// File-backed run: storage persists metadata at termination and the
    /// whole-run memory pre-flight is skipped.
    pub save_to_disk: bool,
    /// Camera configuration preset applied for the run; only valid
    /// combined with file saving in MultiField mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub camera_config: Option<String>,
    /// Run a full autofocus search at each position change.
    pub autofocus_enabled: bool,

    /// Free-text comment carried into the run metadata.
    pub comment: String,
}

impl Default for SequenceSpec {
    fn default() -> Self {
        Self {
            frame_count: 1,
            frame_interval_ms: 1.0,
            use_frames: true,
            use_slices: false,
            use_channels: true,
            use_positions: false,
            slice_bottom_um: 0.0,
            slice_top_um: 0.0,
            slice_step_um: 0.0,
            absolute_z: false,
            channel_group: "Channel".to_string(),
            channels: Vec::new(),
            positions: Vec::new(),
            slice_mode: SliceMode::ChannelsFirst,
            position_mode: PositionMode::TimeLapse,
            keep_shutter_open_slices: false,
            keep_shutter_open_channels: false,
            save_to_disk: false,
            camera_config: None,
            autofocus_enabled: false,
            comment: String::new(),
        }
    }
}

impl SequenceSpec {
    /// Derives the ordered slice offsets for the z sweep.
    ///
    /// The count is `floor(|top - bottom| / step + 0.5) + 1`, walking from
    /// bottom toward top in the direction of `top - bottom`. A step below
    /// `min_step_um` collapses the dimension to a single slice at offset 0.
    /// The result is never empty.
    pub fn slice_depths(&self, min_step_um: f64) -> Vec<f64> {
        let step = self.slice_step_um.abs();
        if !self.use_slices || step < min_step_um {
            return vec![0.0];
        }

        let span = self.slice_top_um - self.slice_bottom_um;
        let delta = if span >= 0.0 { step } else { -step };
        let count = (span.abs() / step + 0.5).floor() as usize + 1;

        (0..count)
            .map(|i| self.slice_bottom_um + delta * i as f64)
            .collect()
    }

    /// Number of slices the sweep will visit.
    pub fn slice_count(&self, min_step_um: f64) -> u32 {
        self.slice_depths(min_step_um).len() as u32
    }

    /// Number of frame ticks, honoring the dimension toggle.
    pub fn effective_frames(&self) -> u32 {
        if self.use_frames {
            self.frame_count.max(1)
        } else {
            1
        }
    }

    /// Channels visited per slice, honoring the dimension toggle.
    pub fn effective_channels(&self) -> u32 {
        if self.use_channels {
            self.channels.len().max(1) as u32
        } else {
            1
        }
    }

    /// Positions visited, honoring the dimension toggle.
    pub fn effective_positions(&self) -> u32 {
        if self.use_positions {
            self.positions.len().max(1) as u32
        } else {
            1
        }
    }

    /// Whether the run sweeps multiple stage positions.
    pub fn multiple_positions(&self) -> bool {
        self.use_positions && !self.positions.is_empty()
    }

    /// Human-readable protocol summary: counts, total image count,
    /// estimated duration, and the sweep-order description.
    pub fn verbose_summary(&self, min_step_um: f64) -> String {
        let slices = self.slice_count(min_step_um);
        let channels = self.effective_channels();
        let frames = self.effective_frames();
        let positions = self.effective_positions();
        let total_images = frames * slices * channels * positions;

        let total_duration_s = self.frame_interval_ms * f64::from(frames) / 1000.0;
        let hrs = (total_duration_s / 3600.0) as u32;
        let remain_s = total_duration_s - f64::from(hrs) * 3600.0;
        let mins = (remain_s / 60.0) as u32;
        let secs = remain_s - f64::from(mins) * 60.0;

        let mut order = String::from("Order: ");
        if self.multiple_positions() {
            match self.position_mode {
                PositionMode::TimeLapse => order.push_str("Frame,Position"),
                PositionMode::MultiField => order.push_str("Position,Frame"),
            }
        } else {
            order.push_str("Frame");
        }
        match self.slice_mode {
            SliceMode::ChannelsFirst => order.push_str(",Slice,Channel"),
            SliceMode::SlicesFirst => order.push_str(",Channel,Slice"),
        }

        format!(
            "Number of channels: {channels}\n\
             Number of slices: {slices}\n\
             Number of frames: {frames}\n\
             Number of positions: {positions}\n\
             Total images: {total_images}\n\
             Duration: {hrs}h {mins}m {secs:.1}s\n\
             {order}"
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_slices(bottom: f64, top: f64, step: f64) -> SequenceSpec {
        SequenceSpec {
            use_slices: true,
            slice_bottom_um: bottom,
            slice_top_um: top,
            slice_step_um: step,
            ..SequenceSpec::default()
        }
    }

    #[test]
    fn test_slice_depths_walk_up() {
        let spec = spec_with_slices(0.0, 10.0, 2.0);
        assert_eq!(spec.slice_depths(0.1), vec![0.0, 2.0, 4.0, 6.0, 8.0, 10.0]);
    }

    #[test]
    fn test_slice_depths_walk_down() {
        let spec = spec_with_slices(10.0, 0.0, 2.0);
        assert_eq!(
            spec.slice_depths(0.1),
            vec![10.0, 8.0, 6.0, 4.0, 2.0, 0.0]
        );
    }

    #[test]
    fn test_slice_depths_step_below_minimum_collapses() {
        let spec = spec_with_slices(0.0, 10.0, 0.0);
        assert_eq!(spec.slice_depths(0.1), vec![0.0]);
    }

    #[test]
    fn test_slice_depths_negative_step_normalized() {
        let spec = spec_with_slices(0.0, 4.0, -2.0);
        assert_eq!(spec.slice_depths(0.1), vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn test_slice_dimension_disabled() {
        let mut spec = spec_with_slices(0.0, 10.0, 2.0);
        spec.use_slices = false;
        assert_eq!(spec.slice_depths(0.1), vec![0.0]);
    }

    #[test]
    fn test_channel_period() {
        let mut ch = ChannelSpec::default();
        assert_eq!(ch.period(), 1);
        ch.skip_frames = 1;
        assert_eq!(ch.period(), 2);
        ch.skip_frames = -3;
        assert_eq!(ch.period(), 4);
    }

    #[test]
    fn test_verbose_summary_counts_and_order() {
        let mut spec = spec_with_slices(0.0, 10.0, 2.0);
        spec.frame_count = 4;
        spec.frame_interval_ms = 1000.0;
        spec.channels = vec![ChannelSpec::named("DAPI"), ChannelSpec::named("FITC")];
        let summary = spec.verbose_summary(0.1);

        assert!(summary.contains("Number of channels: 2"));
        assert!(summary.contains("Number of slices: 6"));
        assert!(summary.contains("Number of frames: 4"));
        assert!(summary.contains("Total images: 48"));
        assert!(summary.contains("Order: Frame,Slice,Channel"));

        spec.slice_mode = SliceMode::SlicesFirst;
        spec.use_positions = true;
        spec.positions = vec![StagePosition::new("A1", 0.0, 0.0)];
        spec.position_mode = PositionMode::MultiField;
        let summary = spec.verbose_summary(0.1);
        assert!(summary.contains("Order: Position,Frame,Channel,Slice"));
    }
}
