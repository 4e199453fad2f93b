//! Periodic frame scheduling.
//!
//! `FrameScheduler` owns the tick task of one frame sequence: it fires the
//! sweep at the configured cadence, suppresses ticks while paused, skips
//! (never queues) firings that would overlap a still-running tick, and
//! routes every way a sequence can end (completion, abort, failure,
//! external stop) through the run core's single termination routine.
//!
//! The ticking construct is owned by this task; nothing is registered
//! with a shared timer.

use log::{debug, error, info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::sweep::{FrameOutcome, SweepExecutor};
use super::{RunCore, SequenceOutcome};
use crate::sequence::PositionMode;

/// Handle to a running frame-sequence task.
pub struct FrameScheduler {
    handle: JoinHandle<()>,
}

impl FrameScheduler {
    /// Spawns the tick task for one frame sequence.
    ///
    /// `fixed_position` is the position index swept when the spec is not in
    /// time-lapse multi-position mode (0 for single-position runs, the
    /// current position for a position-major sequence). The first tick
    /// fires immediately.
    pub fn start(core: Arc<RunCore>, executor: SweepExecutor, fixed_position: u32) -> Self {
        core.state.set_running(true);
        core.state.reset_frame();

        let handle = tokio::spawn(run_sequence(core, executor, fixed_position));
        Self { handle }
    }

    /// Waits for the sequence task to end (naturally or after a stop
    /// signal). The in-flight tick always completes first.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!("Frame scheduler task panicked: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn run_sequence(core: Arc<RunCore>, mut executor: SweepExecutor, fixed_position: u32) {
    let interval_duration = Duration::from_secs_f64(core.spec.frame_interval_ms / 1000.0);
    let mut interval = tokio::time::interval(interval_duration);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let mut stop_rx = core.stop_rx();
    let mut outcome: Option<SequenceOutcome> = None;

    info!(
        "Frame sequence started: {} frames at {} ms",
        core.spec.effective_frames(),
        core.spec.frame_interval_ms
    );

    loop {
        tokio::select! {
            biased;
            _ = stop_rx.changed() => {
                debug!("Frame sequence received stop signal");
                break;
            }
            _ = interval.tick() => {
                // the stop flag may have been raised before this task
                // subscribed; changed() alone would miss that edge
                if *stop_rx.borrow() {
                    break;
                }
                // a tick arriving while paused returns without advancing
                // any counters
                if core.state.is_paused() {
                    continue;
                }
                let tick_started = Instant::now();
                let tick = run_tick(&core, &mut executor, fixed_position).await;
                if tick_started.elapsed() > interval_duration {
                    // the next firing was skipped because this tick was
                    // still running; observable state, not an error
                    if !core.state.is_lagging() {
                        warn!("Acquisition is lagging: tick outran the frame interval");
                    }
                    core.state.set_lagging();
                }
                match tick {
                    FrameOutcome::Continue => {}
                    FrameOutcome::Finished => {
                        outcome = Some(SequenceOutcome::Completed);
                        break;
                    }
                    FrameOutcome::Aborted => {
                        outcome = Some(SequenceOutcome::Aborted);
                        break;
                    }
                    FrameOutcome::Failed(e) => {
                        error!("Frame sequence failed: {e}");
                        core.state.record_error(e.to_string());
                        outcome = Some(SequenceOutcome::Failed);
                        break;
                    }
                }
            }
        }
    }

    let outcome = outcome.unwrap_or(SequenceOutcome::Stopped);
    core.finish_sequence(outcome).await;
    core.state.set_running(false);
}

/// One scheduler tick: all positions in time-lapse multi-position mode,
/// a single position otherwise.
async fn run_tick(
    core: &Arc<RunCore>,
    executor: &mut SweepExecutor,
    fixed_position: u32,
) -> FrameOutcome {
    if core.spec.multiple_positions() && core.spec.position_mode == PositionMode::TimeLapse {
        for i in 0..core.spec.positions.len() as u32 {
            match executor.acquire_one_frame(i).await {
                FrameOutcome::Continue => {}
                other => return other,
            }
        }
        FrameOutcome::Continue
    } else {
        executor.acquire_one_frame(fixed_position).await
    }
}
