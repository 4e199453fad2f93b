//! Mock collaborator implementations.
//!
//! Provides simulated hardware, storage, display, and autofocus for testing
//! the scheduler without physical devices. All mocks use async-safe
//! operations (tokio::time::sleep, not std::thread::sleep) and record the
//! calls they receive so tests can assert on ordering and call patterns.

use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::{sleep, Duration};

use crate::core::{
    AutofocusDevice, DisplaySink, DisplayStatus, HardwareGateway, ImageRecord, PixelBuffer,
    RunSummary, StorageSink,
};
use crate::sequence::StagePosition;

/// A recorded gateway call, for test assertions.
#[derive(Clone, Debug, PartialEq)]
pub enum GatewayCall {
    Snap,
    SetFocus(f64),
    MoveTo(String),
    SetConfig(String, String),
    SetExposure(f64),
    SetShutter(bool),
    SetAutoShutter(bool),
}

/// Hook invoked with the 0-based snap index before each snap completes.
pub type SnapHook = Box<dyn Fn(u32) + Send + Sync>;

#[derive(Debug)]
struct HwState {
    exposure_ms: f64,
    configs: HashMap<String, String>,
    shutter_open: bool,
    auto_shutter: bool,
    focus_z_um: f64,
    width: u32,
    height: u32,
    bytes_per_pixel: u32,
}

/// Simulated microscope hardware.
///
/// Geometry, exposure, shutter, and configuration state are all tracked so
/// restoration round-trips can be verified. Snap timing, failures, and a
/// per-snap hook are configurable for scheduler tests.
pub struct MockGateway {
    state: Arc<RwLock<HwState>>,
    calls: Arc<RwLock<Vec<GatewayCall>>>,
    snap_count: AtomicU32,
    snap_delay: Arc<RwLock<Duration>>,
    snap_hook: Arc<RwLock<Option<SnapHook>>>,
    has_focus_stage: bool,
    fail_moves: AtomicBool,
    fail_snaps: AtomicBool,
    /// Guards the no-overlap invariant: set while a snap is in progress.
    in_snap: AtomicBool,
    overlap_detected: AtomicBool,
}

impl MockGateway {
    pub fn new(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            state: Arc::new(RwLock::new(HwState {
                exposure_ms: 10.0,
                configs: HashMap::new(),
                shutter_open: false,
                auto_shutter: true,
                focus_z_um: 0.0,
                width,
                height,
                bytes_per_pixel,
            })),
            calls: Arc::new(RwLock::new(Vec::new())),
            snap_count: AtomicU32::new(0),
            snap_delay: Arc::new(RwLock::new(Duration::ZERO)),
            snap_hook: Arc::new(RwLock::new(None)),
            has_focus_stage: true,
            fail_moves: AtomicBool::new(false),
            fail_snaps: AtomicBool::new(false),
            in_snap: AtomicBool::new(false),
            overlap_detected: AtomicBool::new(false),
        }
    }

    /// Gateway without a focus (z) stage.
    pub fn without_focus_stage(width: u32, height: u32, bytes_per_pixel: u32) -> Self {
        Self {
            has_focus_stage: false,
            ..Self::new(width, height, bytes_per_pixel)
        }
    }

    pub fn total_snaps(&self) -> u32 {
        self.snap_count.load(Ordering::SeqCst)
    }

    pub async fn recorded_calls(&self) -> Vec<GatewayCall> {
        self.calls.read().await.clone()
    }

    pub async fn set_snap_delay(&self, delay: Duration) {
        *self.snap_delay.write().await = delay;
    }

    /// Installs a hook called with the snap index as each snap completes.
    pub async fn set_snap_hook(&self, hook: SnapHook) {
        *self.snap_hook.write().await = Some(hook);
    }

    /// Change the reported camera geometry mid-run (dimension-drift tests).
    pub async fn set_geometry(&self, width: u32, height: u32, bytes_per_pixel: u32) {
        let mut state = self.state.write().await;
        state.width = width;
        state.height = height;
        state.bytes_per_pixel = bytes_per_pixel;
    }

    pub fn fail_stage_moves(&self, fail: bool) {
        self.fail_moves.store(fail, Ordering::SeqCst);
    }

    pub fn fail_snaps(&self, fail: bool) {
        self.fail_snaps.store(fail, Ordering::SeqCst);
    }

    /// True if two snaps ever overlapped in time.
    pub fn overlap_detected(&self) -> bool {
        self.overlap_detected.load(Ordering::SeqCst)
    }

    async fn record(&self, call: GatewayCall) {
        self.calls.write().await.push(call);
    }
}

impl Default for MockGateway {
    fn default() -> Self {
        Self::new(64, 64, 2)
    }
}

#[async_trait]
impl HardwareGateway for MockGateway {
    async fn snap_image(&self) -> Result<PixelBuffer> {
        if self.fail_snaps.load(Ordering::SeqCst) {
            anyhow::bail!("MockGateway: camera failure injected");
        }
        if self.in_snap.swap(true, Ordering::SeqCst) {
            self.overlap_detected.store(true, Ordering::SeqCst);
        }

        self.record(GatewayCall::Snap).await;
        let delay = *self.snap_delay.read().await;
        if !delay.is_zero() {
            sleep(delay).await;
        }

        let (width, height, depth) = {
            let state = self.state.read().await;
            (state.width, state.height, state.bytes_per_pixel)
        };
        let pixels = (width * height) as usize;
        // keep the thread-local rng out of scope before the next await
        let buffer = {
            let mut rng = rand::thread_rng();
            match depth {
                1 => PixelBuffer::U8((0..pixels).map(|_| rng.gen()).collect()),
                _ => PixelBuffer::U16((0..pixels).map(|_| rng.gen_range(0..4096)).collect()),
            }
        };

        let index = self.snap_count.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.snap_hook.read().await.as_ref() {
            hook(index);
        }

        self.in_snap.store(false, Ordering::SeqCst);
        Ok(buffer)
    }

    fn has_focus_stage(&self) -> bool {
        self.has_focus_stage
    }

    async fn set_focus_position(&self, z_um: f64) -> Result<()> {
        self.record(GatewayCall::SetFocus(z_um)).await;
        self.state.write().await.focus_z_um = z_um;
        Ok(())
    }

    async fn focus_position(&self) -> Result<f64> {
        Ok(self.state.read().await.focus_z_um)
    }

    async fn wait_for_focus_stage(&self) -> Result<()> {
        Ok(())
    }

    async fn move_to_position(&self, pos: &StagePosition) -> Result<()> {
        if self.fail_moves.load(Ordering::SeqCst) {
            anyhow::bail!("MockGateway: stage motion failure injected");
        }
        self.record(GatewayCall::MoveTo(pos.label.clone())).await;
        if let Some(z) = pos.z_um {
            self.state.write().await.focus_z_um = z;
        }
        Ok(())
    }

    async fn set_config(&self, group: &str, preset: &str) -> Result<()> {
        self.record(GatewayCall::SetConfig(group.to_string(), preset.to_string()))
            .await;
        self.state
            .write()
            .await
            .configs
            .insert(group.to_string(), preset.to_string());
        Ok(())
    }

    async fn wait_for_config(&self, _group: &str, _preset: &str) -> Result<()> {
        Ok(())
    }

    async fn current_config(&self, group: &str) -> Result<Option<String>> {
        Ok(self.state.read().await.configs.get(group).cloned())
    }

    async fn set_exposure(&self, ms: f64) -> Result<()> {
        self.record(GatewayCall::SetExposure(ms)).await;
        self.state.write().await.exposure_ms = ms;
        Ok(())
    }

    async fn exposure(&self) -> Result<f64> {
        Ok(self.state.read().await.exposure_ms)
    }

    async fn set_shutter_open(&self, open: bool) -> Result<()> {
        self.record(GatewayCall::SetShutter(open)).await;
        self.state.write().await.shutter_open = open;
        Ok(())
    }

    async fn shutter_open(&self) -> Result<bool> {
        Ok(self.state.read().await.shutter_open)
    }

    async fn auto_shutter(&self) -> Result<bool> {
        Ok(self.state.read().await.auto_shutter)
    }

    async fn set_auto_shutter(&self, on: bool) -> Result<()> {
        self.record(GatewayCall::SetAutoShutter(on)).await;
        self.state.write().await.auto_shutter = on;
        Ok(())
    }

    async fn image_dimensions(&self) -> Result<(u32, u32, u32)> {
        let state = self.state.read().await;
        Ok((state.width, state.height, state.bytes_per_pixel))
    }

    async fn wait_for_system(&self) -> Result<()> {
        Ok(())
    }

    async fn system_state(&self) -> Result<serde_json::Value> {
        let state = self.state.read().await;
        Ok(serde_json::json!({
            "exposure_ms": state.exposure_ms,
            "focus_z_um": state.focus_z_um,
            "auto_shutter": state.auto_shutter,
        }))
    }
}

// =============================================================================
// MockStorage
// =============================================================================

/// In-memory storage sink recording everything it is handed.
#[derive(Default)]
pub struct MockStorage {
    records: Arc<RwLock<Vec<ImageRecord>>>,
    summaries: Arc<RwLock<Vec<RunSummary>>>,
    dimension_updates: Arc<RwLock<Vec<(u32, u32, u32)>>>,
    metadata_saves: AtomicU32,
    fail_attach: AtomicBool,
}

impl MockStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<ImageRecord> {
        self.records.read().await.clone()
    }

    /// (frame, channel, slice, position) of every attached record, in
    /// attachment order.
    pub async fn coordinates(&self) -> Vec<(u32, u32, u32, u32)> {
        self.records
            .read()
            .await
            .iter()
            .map(|r| (r.frame, r.channel, r.slice, r.position))
            .collect()
    }

    pub async fn summaries(&self) -> Vec<RunSummary> {
        self.summaries.read().await.clone()
    }

    pub async fn last_dimensions(&self) -> Option<(u32, u32, u32)> {
        self.dimension_updates.read().await.last().copied()
    }

    pub fn metadata_saves(&self) -> u32 {
        self.metadata_saves.load(Ordering::SeqCst)
    }

    pub fn fail_attach(&self, fail: bool) {
        self.fail_attach.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageSink for MockStorage {
    async fn initialize(&self, summary: &RunSummary) -> Result<()> {
        self.summaries.write().await.push(summary.clone());
        Ok(())
    }

    async fn set_dimensions(&self, frames: u32, channels: u32, slices: u32) -> Result<()> {
        self.dimension_updates
            .write()
            .await
            .push((frames, channels, slices));
        Ok(())
    }

    async fn attach_image(&self, record: &ImageRecord) -> Result<()> {
        if self.fail_attach.load(Ordering::SeqCst) {
            anyhow::bail!("MockStorage: attach failure injected");
        }
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn save_metadata(&self) -> Result<()> {
        self.metadata_saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// MockDisplay
// =============================================================================

/// Display sink recording shown frames and status changes.
#[derive(Default)]
pub struct MockDisplay {
    /// (frame, channel, slice, filled) per shown record.
    frames: Arc<RwLock<Vec<(u32, u32, u32, bool)>>>,
    statuses: Arc<RwLock<Vec<DisplayStatus>>>,
    channel_ranges: Arc<RwLock<Vec<(u32, f64, f64)>>>,
    countdowns: AtomicU32,
}

impl MockDisplay {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn shown_frames(&self) -> Vec<(u32, u32, u32, bool)> {
        self.frames.read().await.clone()
    }

    pub async fn filled_frames(&self) -> Vec<(u32, u32, u32, bool)> {
        self.frames
            .read()
            .await
            .iter()
            .copied()
            .filter(|(_, _, _, filled)| *filled)
            .collect()
    }

    pub async fn statuses(&self) -> Vec<DisplayStatus> {
        self.statuses.read().await.clone()
    }

    pub async fn channel_ranges(&self) -> Vec<(u32, f64, f64)> {
        self.channel_ranges.read().await.clone()
    }

    pub fn countdown_updates(&self) -> u32 {
        self.countdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DisplaySink for MockDisplay {
    async fn initialize(&self, _summary: &RunSummary) -> Result<()> {
        Ok(())
    }

    async fn show_frame(&self, record: &ImageRecord) -> Result<()> {
        self.frames
            .write()
            .await
            .push((record.frame, record.channel, record.slice, record.filled));
        Ok(())
    }

    async fn set_channel_range(&self, channel: u32, min: f64, max: f64) -> Result<()> {
        self.channel_ranges.write().await.push((channel, min, max));
        Ok(())
    }

    async fn update_countdown(&self, _ms_remaining: i64, _frames_remaining: u32) -> Result<()> {
        self.countdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_status(&self, status: DisplayStatus) -> Result<()> {
        self.statuses.write().await.push(status);
        Ok(())
    }
}

// =============================================================================
// MockAutofocus
// =============================================================================

/// Simulated autofocus module.
pub struct MockAutofocus {
    continuous: Arc<RwLock<bool>>,
    full_focus_calls: AtomicU32,
}

impl MockAutofocus {
    pub fn new(continuous_enabled: bool) -> Self {
        Self {
            continuous: Arc::new(RwLock::new(continuous_enabled)),
            full_focus_calls: AtomicU32::new(0),
        }
    }

    pub fn full_focus_calls(&self) -> u32 {
        self.full_focus_calls.load(Ordering::SeqCst)
    }

    pub async fn continuous_enabled(&self) -> bool {
        *self.continuous.read().await
    }
}

#[async_trait]
impl AutofocusDevice for MockAutofocus {
    async fn full_focus(&self) -> Result<()> {
        self.full_focus_calls.fetch_add(1, Ordering::SeqCst);
        sleep(Duration::from_millis(1)).await;
        Ok(())
    }

    async fn incremental_focus(&self) -> Result<()> {
        Ok(())
    }

    async fn is_continuous_focus_enabled(&self) -> Result<bool> {
        Ok(*self.continuous.read().await)
    }

    async fn enable_continuous_focus(&self, on: bool) -> Result<()> {
        *self.continuous.write().await = on;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_gateway_snap_and_geometry() {
        let gw = MockGateway::new(8, 4, 2);
        let buf = gw.snap_image().await.expect("snap");
        assert_eq!(buf.len(), 32);
        assert_eq!(buf.bytes_per_pixel(), 2);
        assert_eq!(gw.total_snaps(), 1);

        gw.set_geometry(4, 4, 1).await;
        let buf = gw.snap_image().await.expect("snap");
        assert_eq!(buf.len(), 16);
        assert_eq!(buf.bytes_per_pixel(), 1);
    }

    #[tokio::test]
    async fn test_mock_gateway_state_round_trip() {
        let gw = MockGateway::default();
        gw.set_exposure(42.0).await.expect("exposure");
        gw.set_config("Channel", "DAPI").await.expect("config");
        gw.set_auto_shutter(false).await.expect("shutter");
        gw.set_focus_position(12.5).await.expect("focus");

        assert_eq!(gw.exposure().await.expect("exposure"), 42.0);
        assert_eq!(
            gw.current_config("Channel").await.expect("config"),
            Some("DAPI".to_string())
        );
        assert!(!gw.auto_shutter().await.expect("shutter"));
        assert_eq!(gw.focus_position().await.expect("focus"), 12.5);
    }

    #[tokio::test]
    async fn test_mock_gateway_move_failure_injection() {
        let gw = MockGateway::default();
        gw.fail_stage_moves(true);
        let pos = StagePosition::new("A1", 0.0, 0.0);
        assert!(gw.move_to_position(&pos).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_storage_records_coordinates() {
        let storage = MockStorage::new();
        let record = ImageRecord {
            run_uid: "test".to_string(),
            pixels: PixelBuffer::U8(vec![0; 4]),
            width: 2,
            height: 2,
            exposure_ms: 10.0,
            z_um: 0.0,
            frame: 1,
            channel: 2,
            slice: 3,
            position: 0,
            timestamp: chrono::Utc::now(),
            stage_x_um: None,
            stage_y_um: None,
            state: serde_json::Value::Null,
            filled: false,
        };
        storage.attach_image(&record).await.expect("attach");
        assert_eq!(storage.coordinates().await, vec![(1, 2, 3, 0)]);
    }
}
