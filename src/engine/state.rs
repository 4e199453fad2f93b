//! Shared run state: phase machine, counters, and pollable flags.
//!
//! All mutable state shared between the controller, the frame scheduler
//! task, and the position-sequencer worker lives here, behind a single
//! synchronization boundary. Phase and counters sit under one mutex; the
//! flags external callers poll (`running`, `paused`, `lagging`, ...) are
//! atomics readable without taking the lock.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Lifecycle of one acquisition run.
///
/// `Idle -> Starting -> Running <-> Paused -> Aborting -> Terminated`;
/// `Terminated` is re-enterable by the next `acquire()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunPhase {
    Idle,
    Starting,
    Running,
    Paused,
    Aborting,
    Terminated,
}

#[derive(Debug)]
struct StateInner {
    phase: RunPhase,
    frame_index: u32,
    position_index: u32,
    last_error: Option<String>,
}

/// Engine-owned run state, created at `acquire()` and reset on re-entry.
#[derive(Debug)]
pub struct RunState {
    inner: Mutex<StateInner>,
    running: AtomicBool,
    multi_running: AtomicBool,
    paused: AtomicBool,
    abort_requested: AtomicBool,
    aborted: AtomicBool,
    interrupted: AtomicBool,
    lagging: AtomicBool,
}

impl Default for RunState {
    fn default() -> Self {
        Self::new()
    }
}

impl RunState {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(StateInner {
                phase: RunPhase::Idle,
                frame_index: 0,
                position_index: 0,
                last_error: None,
            }),
            running: AtomicBool::new(false),
            multi_running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            lagging: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        // A panic while holding this short critical section is a bug in
        // this module itself; recover the guard rather than poisoning the
        // whole engine.
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Resets everything for a fresh run and enters `Starting`.
    pub fn begin(&self) {
        let mut inner = self.lock();
        inner.phase = RunPhase::Starting;
        inner.frame_index = 0;
        inner.position_index = 0;
        inner.last_error = None;
        drop(inner);
        self.paused.store(false, Ordering::SeqCst);
        self.abort_requested.store(false, Ordering::SeqCst);
        self.aborted.store(false, Ordering::SeqCst);
        self.interrupted.store(false, Ordering::SeqCst);
        self.lagging.store(false, Ordering::SeqCst);
    }

    pub fn phase(&self) -> RunPhase {
        self.lock().phase
    }

    pub fn mark_running(&self) {
        self.lock().phase = RunPhase::Running;
    }

    pub fn mark_terminated(&self) {
        self.lock().phase = RunPhase::Terminated;
    }

    /// Records a fatal error and moves to `Aborting`.
    pub fn record_error(&self, message: String) {
        let mut inner = self.lock();
        inner.last_error = Some(message);
        inner.phase = RunPhase::Aborting;
    }

    pub fn last_error(&self) -> Option<String> {
        self.lock().last_error.clone()
    }

    pub fn has_error(&self) -> bool {
        self.lock().last_error.is_some()
    }

    // --- pause -------------------------------------------------------------

    /// Toggles the cooperative pause flag. Idempotent; only meaningful
    /// while the run is in `Running` or `Paused`.
    pub fn set_paused(&self, paused: bool) -> bool {
        let mut inner = self.lock();
        match inner.phase {
            RunPhase::Running | RunPhase::Paused => {
                let changed = self.paused.swap(paused, Ordering::SeqCst) != paused;
                inner.phase = if paused {
                    RunPhase::Paused
                } else {
                    RunPhase::Running
                };
                changed
            }
            _ => false,
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // --- abort -------------------------------------------------------------

    /// Requests a cooperative abort, consulted at sweep iteration
    /// boundaries only; a hardware call in flight always completes.
    pub fn request_abort(&self) {
        let mut inner = self.lock();
        if matches!(inner.phase, RunPhase::Running | RunPhase::Paused) {
            inner.phase = RunPhase::Aborting;
        }
        drop(inner);
        self.abort_requested.store(true, Ordering::SeqCst);
    }

    /// Consumes a pending abort request, recording that the run was
    /// abort-terminated.
    pub fn take_abort(&self) -> bool {
        let requested = self.abort_requested.swap(false, Ordering::SeqCst);
        if requested {
            self.aborted.store(true, Ordering::SeqCst);
        }
        requested
    }

    pub fn abort_requested(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    // --- pollable flags ----------------------------------------------------

    pub fn set_running(&self, running: bool) {
        self.running.store(running, Ordering::SeqCst);
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn set_multi_running(&self, running: bool) {
        self.multi_running.store(running, Ordering::SeqCst);
    }

    pub fn is_multi_running(&self) -> bool {
        self.multi_running.load(Ordering::SeqCst)
    }

    pub fn set_interrupted(&self, interrupted: bool) {
        self.interrupted.store(interrupted, Ordering::SeqCst);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn set_lagging(&self) {
        self.lagging.store(true, Ordering::SeqCst);
    }

    pub fn is_lagging(&self) -> bool {
        self.lagging.load(Ordering::SeqCst)
    }

    // --- counters ----------------------------------------------------------

    pub fn frame_index(&self) -> u32 {
        self.lock().frame_index
    }

    /// Advances the frame counter and returns the new value.
    pub fn advance_frame(&self) -> u32 {
        let mut inner = self.lock();
        inner.frame_index += 1;
        inner.frame_index
    }

    /// Resets the frame counter for a new per-position sequence.
    pub fn reset_frame(&self) {
        self.lock().frame_index = 0;
    }

    pub fn position_index(&self) -> u32 {
        self.lock().position_index
    }

    pub fn set_position_index(&self, idx: u32) {
        self.lock().position_index = idx;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_resets_everything() {
        let state = RunState::new();
        state.mark_running();
        state.request_abort();
        state.take_abort();
        state.set_lagging();
        state.advance_frame();

        state.begin();
        assert_eq!(state.phase(), RunPhase::Starting);
        assert_eq!(state.frame_index(), 0);
        assert!(!state.abort_requested());
        assert!(!state.was_aborted());
        assert!(!state.is_lagging());
    }

    #[test]
    fn test_pause_is_idempotent() {
        let state = RunState::new();
        state.begin();
        state.mark_running();

        assert!(state.set_paused(true));
        let phase_once = state.phase();
        assert!(!state.set_paused(true)); // no change the second time
        assert_eq!(state.phase(), phase_once);
        assert!(state.is_paused());

        state.set_paused(false);
        assert_eq!(state.phase(), RunPhase::Running);
    }

    #[test]
    fn test_pause_ignored_when_not_running() {
        let state = RunState::new();
        assert!(!state.set_paused(true));
        assert!(!state.is_paused());
    }

    #[test]
    fn test_abort_flow() {
        let state = RunState::new();
        state.begin();
        state.mark_running();

        state.request_abort();
        assert_eq!(state.phase(), RunPhase::Aborting);
        assert!(state.abort_requested());

        // consuming the request clears the flag and records the abort
        assert!(state.take_abort());
        assert!(!state.abort_requested());
        assert!(state.was_aborted());
        assert!(!state.take_abort());
    }
}
