//! The acquisition scheduler: control surface, run context, and the
//! termination funnel.
//!
//! `AcquisitionEngine` is the entry point consumed by UIs and scripts. It
//! validates preconditions, snapshots the hardware state for later
//! restoration, runs the resource pre-flight, and dispatches the run to
//! either the periodic [`scheduler::FrameScheduler`] or, in position-major
//! mode, the [`multifield::PositionSequencer`] worker.
//!
//! Every way a frame sequence can end (completion, cooperative abort,
//! fatal error, external stop) funnels through
//! [`RunCore::finish_sequence`], which restores the pre-run hardware state
//! (best effort, log-and-continue), persists metadata for file-backed
//! runs, and reports the final status to the display.

pub mod memory;
pub mod multifield;
pub mod scheduler;
pub mod state;
pub mod sweep;

pub use memory::{MemoryProbe, ResourceGuard, SysinfoProbe};
pub use state::{RunPhase, RunState};

use anyhow::Result;
use log::{error, info, warn};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

use crate::config::Settings;
use crate::core::{AutofocusDevice, DisplaySink, DisplayStatus, HardwareGateway, StorageSink};
use crate::error::{AcqError, AcqResult};
use crate::sequence::{ChannelSpec, PositionMode, SequenceSpec};
use crate::tags::{new_run_uid, MetadataEmitter};
use multifield::PositionSequencer;
use scheduler::FrameScheduler;
use sweep::SweepExecutor;

/// Configuration group holding camera presets.
const CAMERA_GROUP: &str = "Camera";

/// How a frame sequence ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// All frames acquired.
    Completed,
    /// A cooperative abort was honored.
    Aborted,
    /// An external stop signal ended the sequence.
    Stopped,
    /// A fatal error terminated the sequence.
    Failed,
}

/// Hardware state captured before a run, for restoration afterwards.
#[derive(Clone, Debug)]
struct HardwareSnapshot {
    exposure_ms: f64,
    channel_preset: Option<String>,
    auto_shutter: bool,
    z_um: Option<f64>,
    continuous_focus: bool,
}

/// Everything a running sequence needs, shared between the controller,
/// the scheduler task, and the position-sequencer worker.
pub struct RunCore {
    pub(crate) spec: SequenceSpec,
    pub(crate) settings: Settings,
    pub(crate) gateway: Arc<dyn HardwareGateway>,
    pub(crate) emitter: MetadataEmitter,
    pub(crate) display: Arc<dyn DisplaySink>,
    pub(crate) autofocus: Option<Arc<dyn AutofocusDevice>>,
    pub(crate) guard: ResourceGuard,
    pub(crate) state: Arc<RunState>,
    stop_tx: watch::Sender<bool>,
    snapshot: Mutex<Option<HardwareSnapshot>>,
}

impl RunCore {
    /// Subscribes to the stop signal shared by every task of this run.
    pub(crate) fn stop_rx(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    fn signal_stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn is_multifield(&self) -> bool {
        self.spec.multiple_positions() && self.spec.position_mode == PositionMode::MultiField
    }

    /// The single termination routine every sequence end funnels through.
    pub(crate) async fn finish_sequence(&self, outcome: SequenceOutcome) {
        self.restore_system().await;

        if self.spec.save_to_disk {
            if let Err(e) = self.emitter.finish().await {
                error!("Saving run metadata failed: {e}");
            }
        }

        let status = match outcome {
            SequenceOutcome::Completed => DisplayStatus::Completed,
            SequenceOutcome::Aborted => DisplayStatus::Interrupted,
            SequenceOutcome::Stopped => {
                if self.state.is_interrupted() {
                    DisplayStatus::Interrupted
                } else {
                    DisplayStatus::Completed
                }
            }
            SequenceOutcome::Failed => DisplayStatus::Failed,
        };
        if let Err(e) = self.display.set_status(status).await {
            warn!("Display status update failed: {e}");
        }

        // in position-major mode the run as a whole terminates only when
        // the sequencer worker ends
        if !self.is_multifield() {
            self.state.mark_terminated();
        }
        info!("Frame sequence terminated: {outcome:?}");
    }

    /// Best-effort restoration of the pre-run hardware state. Never
    /// propagates its own failures.
    pub(crate) async fn restore_system(&self) {
        let snap = match self.snapshot.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        let Some(snap) = snap else {
            return;
        };
        info!("Restoring hardware state");

        if let Err(e) = self.gateway.set_exposure(snap.exposure_ms).await {
            warn!("Exposure restore failed: {e}");
        }
        if let Some(preset) = &snap.channel_preset {
            if let Err(e) = self.gateway.set_config(&self.spec.channel_group, preset).await {
                warn!("Channel config restore failed: {e}");
            } else if let Err(e) = self
                .gateway
                .wait_for_config(&self.spec.channel_group, preset)
                .await
            {
                warn!("Channel config restore wait failed: {e}");
            }
        }
        if let Err(e) = self.gateway.set_auto_shutter(snap.auto_shutter).await {
            warn!("Auto-shutter restore failed: {e}");
        }
        if let Some(z) = snap.z_um {
            if let Err(e) = self.gateway.set_focus_position(z).await {
                warn!("Z restore failed: {e}");
            } else if let Err(e) = self.gateway.wait_for_focus_stage().await {
                warn!("Z restore wait failed: {e}");
            }
        }
        if let Some(af) = &self.autofocus {
            if let Err(e) = af.enable_continuous_focus(snap.continuous_focus).await {
                warn!("Continuous-focus restore failed: {e}");
            }
        }
        if let Err(e) = self.gateway.wait_for_system().await {
            warn!("System wait after restore failed: {e}");
        }
    }
}

struct ActiveRun {
    core: Arc<RunCore>,
    scheduler: Option<FrameScheduler>,
    sequencer: Option<PositionSequencer>,
}

/// The acquisition engine exposed to the excluded GUI/scripting layer.
pub struct AcquisitionEngine {
    settings: Settings,
    gateway: Arc<dyn HardwareGateway>,
    storage: Arc<dyn StorageSink>,
    display: Arc<dyn DisplaySink>,
    autofocus: Option<Arc<dyn AutofocusDevice>>,
    probe: Arc<dyn MemoryProbe>,
    state: Arc<RunState>,
    run: tokio::sync::Mutex<Option<ActiveRun>>,
}

impl AcquisitionEngine {
    pub fn new(
        settings: Settings,
        gateway: Arc<dyn HardwareGateway>,
        storage: Arc<dyn StorageSink>,
        display: Arc<dyn DisplaySink>,
    ) -> Self {
        Self {
            settings,
            gateway,
            storage,
            display,
            autofocus: None,
            probe: Arc::new(SysinfoProbe::new()),
            state: Arc::new(RunState::new()),
            run: tokio::sync::Mutex::new(None),
        }
    }

    /// Attaches an autofocus module.
    pub fn with_autofocus(mut self, autofocus: Arc<dyn AutofocusDevice>) -> Self {
        self.autofocus = Some(autofocus);
        self
    }

    /// Substitutes the free-memory probe (tests use deterministic ones).
    pub fn with_memory_probe(mut self, probe: Arc<dyn MemoryProbe>) -> Self {
        self.probe = probe;
        self
    }

    /// Shared run state, for observers.
    pub fn state(&self) -> Arc<RunState> {
        self.state.clone()
    }

    /// Starts an acquisition run based on the given protocol.
    pub async fn acquire(&self, spec: &SequenceSpec) -> AcqResult<()> {
        let mut run_guard = self.run.lock().await;
        if self.state.is_running() || self.state.is_multi_running() {
            return Err(AcqError::Busy);
        }
        // reap a previously finished run
        run_guard.take();

        let spec = self.normalize(spec).await?;
        self.check_preconditions(&spec)?;

        self.state.begin();
        match self.start_run(spec).await {
            Ok(active) => {
                self.state.mark_running();
                *run_guard = Some(active);
                Ok(())
            }
            Err(e) => {
                self.state.mark_terminated();
                Err(e)
            }
        }
    }

    /// Coerces the interval and substitutes a default channel when the
    /// list is empty, using the camera's current exposure.
    async fn normalize(&self, spec: &SequenceSpec) -> AcqResult<SequenceSpec> {
        let mut spec = spec.clone();
        if spec.frame_interval_ms < 1.0 {
            spec.frame_interval_ms = 1.0;
        }
        if spec.channels.is_empty() {
            let exposure = self
                .gateway
                .exposure()
                .await
                .unwrap_or(crate::sequence::DEFAULT_EXPOSURE_MS);
            spec.channels.push(ChannelSpec {
                exposure_ms: exposure,
                ..ChannelSpec::default()
            });
        }
        Ok(spec)
    }

    fn check_preconditions(&self, spec: &SequenceSpec) -> AcqResult<()> {
        if spec.use_positions && spec.positions.is_empty() {
            return Err(AcqError::Precondition(
                "Multiple position mode is selected but position list is not defined".to_string(),
            ));
        }
        if spec.camera_config.is_some()
            && !(spec.save_to_disk
                && spec.position_mode == PositionMode::MultiField
                && spec.multiple_positions())
        {
            return Err(AcqError::Precondition(
                "A camera configuration override requires file saving in multi-field mode"
                    .to_string(),
            ));
        }
        Ok(())
    }

    async fn start_run(&self, spec: SequenceSpec) -> AcqResult<ActiveRun> {
        let gateway = &self.gateway;

        // snapshot the hardware state for restoration at termination
        let exposure_ms = gateway.exposure().await.map_err(AcqError::hardware)?;
        let channel_preset = gateway
            .current_config(&spec.channel_group)
            .await
            .map_err(AcqError::hardware)?;
        let auto_shutter = gateway.auto_shutter().await.map_err(AcqError::hardware)?;
        let z_um = if gateway.has_focus_stage() {
            Some(gateway.focus_position().await.map_err(AcqError::hardware)?)
        } else {
            None
        };
        let continuous_focus = match &self.autofocus {
            Some(af) => af.is_continuous_focus_enabled().await.unwrap_or(false),
            None => false,
        };
        let snapshot = HardwareSnapshot {
            exposure_ms,
            channel_preset,
            auto_shutter,
            z_um,
            continuous_focus,
        };

        if let Some(camera_config) = &spec.camera_config {
            gateway
                .set_config(CAMERA_GROUP, camera_config)
                .await
                .map_err(AcqError::hardware)?;
            gateway
                .wait_for_config(CAMERA_GROUP, camera_config)
                .await
                .map_err(AcqError::hardware)?;
        }
        gateway.wait_for_system().await.map_err(AcqError::hardware)?;

        let guard = ResourceGuard::new(self.probe.clone(), self.settings.memory.clone());

        // whole-run pre-flight, skipped when frames stream to disk
        if !spec.save_to_disk {
            let (w, h, d) = gateway
                .image_dimensions()
                .await
                .map_err(AcqError::hardware)?;
            let required = guard.whole_run_bytes(
                spec.effective_frames(),
                spec.effective_channels(),
                spec.slice_count(self.settings.min_z_step_um),
                spec.effective_positions(),
                w,
                h,
                d,
            );
            guard.preflight(required)?;
        }

        let run_uid = new_run_uid();
        info!("Starting acquisition run {run_uid}");
        let (stop_tx, _stop_rx) = watch::channel(false);
        let core = Arc::new(RunCore {
            emitter: MetadataEmitter::new(self.storage.clone(), run_uid),
            spec,
            settings: self.settings.clone(),
            gateway: self.gateway.clone(),
            display: self.display.clone(),
            autofocus: self.autofocus.clone(),
            guard,
            state: self.state.clone(),
            stop_tx,
            snapshot: Mutex::new(Some(snapshot)),
        });

        if let Err(e) = self.display.set_status(DisplayStatus::Started).await {
            warn!("Display status update failed: {e}");
        }

        let active = if core.is_multifield() {
            ActiveRun {
                sequencer: Some(PositionSequencer::start(core.clone())),
                scheduler: None,
                core,
            }
        } else {
            let executor = SweepExecutor::new(core.clone()).await;
            ActiveRun {
                scheduler: Some(FrameScheduler::start(core.clone(), executor, 0)),
                sequencer: None,
                core,
            }
        };
        Ok(active)
    }

    /// Toggles the cooperative pause. A tick already in progress runs to
    /// completion; only subsequent ticks are suppressed.
    pub async fn pause(&self, paused: bool) {
        if self.state.set_paused(paused) {
            let status = if paused {
                DisplayStatus::Paused
            } else {
                DisplayStatus::Resumed
            };
            if let Err(e) = self.display.set_status(status).await {
                warn!("Display status update failed: {e}");
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state.is_paused()
    }

    /// Requests a cooperative abort, honored at the next sweep iteration
    /// boundary.
    pub fn abort_request(&self) {
        info!("Abort requested");
        self.state.request_abort();
    }

    /// Stops the run: cancels future ticks, lets the in-flight tick
    /// finish, and joins the worker tasks before returning. Idempotent.
    pub async fn stop(&self, interrupted: bool) {
        let active = self.run.lock().await.take();
        if let Some(active) = active {
            if self.state.is_running() || self.state.is_multi_running() {
                self.state.set_interrupted(interrupted);
                active.core.signal_stop();
            }
            if let Some(sequencer) = active.sequencer {
                sequencer.join().await;
            }
            if let Some(scheduler) = active.scheduler {
                scheduler.join().await;
            }
        }
    }

    pub fn is_acquisition_running(&self) -> bool {
        self.state.is_running()
    }

    pub fn is_multi_field_running(&self) -> bool {
        self.state.is_multi_running()
    }

    /// True when a tick outran the frame interval and a firing was
    /// skipped. Observable state, not an error.
    pub fn is_lagging(&self) -> bool {
        self.state.is_lagging()
    }

    /// Blocks until the run (including every position of a multi-field
    /// sequence) has terminated, polling at a short interval.
    pub async fn wait_for_completion(&self) {
        loop {
            if !self.state.is_running() && !self.state.is_multi_running() {
                return;
            }
            tokio::time::sleep(self.settings.timing.completion_poll).await;
        }
    }

    /// Human-readable protocol summary for the given spec.
    pub fn verbose_summary(&self, spec: &SequenceSpec) -> String {
        spec.verbose_summary(self.settings.min_z_step_um)
    }
}

/// Convenience: run an acquisition and block until it terminates.
pub async fn acquire_and_wait(engine: &AcquisitionEngine, spec: &SequenceSpec) -> Result<()> {
    engine.acquire(spec).await?;
    engine.wait_for_completion().await;
    Ok(())
}
