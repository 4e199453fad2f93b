//! Position-major sequencing.
//!
//! In `MultiField` mode every stage position runs its entire frame
//! sequence to completion before the next position starts. The sequencer
//! is a dedicated worker task, distinct from the controller and from the
//! scheduler tasks it spawns one per position.

use log::{error, info};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::scheduler::FrameScheduler;
use super::sweep::SweepExecutor;
use super::RunCore;
use crate::core::DisplayStatus;

/// Handle to the position-major worker.
pub struct PositionSequencer {
    handle: JoinHandle<()>,
}

impl PositionSequencer {
    pub fn start(core: Arc<RunCore>) -> Self {
        core.state.set_multi_running(true);
        let handle = tokio::spawn(run_positions(core));
        Self { handle }
    }

    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            error!("Position sequencer task panicked: {e}");
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

async fn run_positions(core: Arc<RunCore>) {
    let stop_rx = core.stop_rx();
    let positions = core.spec.positions.clone();

    for (idx, pos) in positions.iter().enumerate() {
        if *stop_rx.borrow() {
            break;
        }
        if core.state.abort_requested() {
            core.state.take_abort();
            break;
        }

        info!("Position sequence {}/{} ({})", idx + 1, positions.len(), pos.label);

        // stage motion failure is fatal for the whole sequencer
        let moved = async {
            core.gateway.move_to_position(pos).await?;
            core.gateway.wait_for_system().await
        }
        .await;
        if let Err(e) = moved {
            error!("Stage motion to position '{}' failed: {e}", pos.label);
            core.state.record_error(format!("Stage motion failed: {e}"));
            if let Err(e) = core.display.set_status(DisplayStatus::Failed).await {
                error!("Display status update failed: {e}");
            }
            break;
        }

        core.state.set_position_index(idx as u32);

        // run the complete frame sequence for this position and block
        // until it terminates
        let executor = SweepExecutor::new(core.clone()).await;
        let scheduler = FrameScheduler::start(core.clone(), executor, idx as u32);
        scheduler.join().await;

        // stop after the current position on abort, interrupt, or failure
        if core.state.was_aborted() || core.state.is_interrupted() || core.state.has_error() {
            break;
        }
    }

    core.state.mark_terminated();
    core.state.set_multi_running(false);
    info!("Position sequencer finished");
}
