//! Memory-budget checks for frames that have not been captured yet.
//!
//! Starting a frame that cannot fit in available memory loses data mid-run,
//! so the guard estimates footprints up front: once for the whole run at
//! start (skipped for disk-streamed runs) and once per frame before the
//! first image of that frame is stored. The per-frame check re-polls the
//! probe a bounded number of times before failing, preserving the retry
//! contract of the original engine without relying on a garbage collector.

use crate::config::MemorySettings;
use crate::error::{AcqError, AcqResult};
use log::{info, warn};
use std::sync::Mutex;

/// Source of the free-memory figure. Behind a trait so tests can inject
/// deterministic probes.
pub trait MemoryProbe: Send + Sync {
    /// Currently available memory, in bytes.
    fn free_bytes(&self) -> u64;
}

/// System probe backed by `sysinfo`.
pub struct SysinfoProbe {
    system: Mutex<sysinfo::System>,
}

impl SysinfoProbe {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(sysinfo::System::new()),
        }
    }
}

impl Default for SysinfoProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SysinfoProbe {
    fn free_bytes(&self) -> u64 {
        match self.system.lock() {
            Ok(mut sys) => {
                sys.refresh_memory();
                sys.available_memory()
            }
            Err(poisoned) => {
                let mut sys = poisoned.into_inner();
                sys.refresh_memory();
                sys.available_memory()
            }
        }
    }
}

/// Pre-flight and per-frame budget checks.
pub struct ResourceGuard {
    probe: std::sync::Arc<dyn MemoryProbe>,
    settings: MemorySettings,
}

impl ResourceGuard {
    pub fn new(probe: std::sync::Arc<dyn MemoryProbe>, settings: MemorySettings) -> Self {
        Self { probe, settings }
    }

    /// Estimated footprint of the entire run, in bytes.
    pub fn whole_run_bytes(
        &self,
        frames: u32,
        channels: u32,
        slices: u32,
        positions: u32,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
    ) -> u64 {
        let per_image = u64::from(width) * u64::from(height) * u64::from(bytes_per_pixel);
        u64::from(frames)
            * u64::from(channels)
            * u64::from(slices)
            * u64::from(positions)
            * per_image
            + self.settings.fixed_overhead_bytes
    }

    /// Estimated footprint of one frame plus head room, in bytes.
    pub fn frame_bytes(
        &self,
        channels: u32,
        slices: u32,
        width: u32,
        height: u32,
        bytes_per_pixel: u32,
    ) -> u64 {
        let per_image = u64::from(width) * u64::from(height) * u64::from(bytes_per_pixel);
        (u64::from(channels) * u64::from(slices) + self.settings.frame_head_room) * per_image
    }

    /// One-shot check at run start. Refusal is a user-facing failure, made
    /// before any hardware interaction.
    pub fn preflight(&self, required_bytes: u64) -> AcqResult<()> {
        let free = self.probe.free_bytes();
        info!("Pre-flight memory: {free} bytes free, {required_bytes} required");
        if free < required_bytes {
            return Err(insufficient(free, required_bytes));
        }
        Ok(())
    }

    /// Per-frame check with a bounded number of probe re-polls.
    pub async fn check_frame(&self, required_bytes: u64) -> AcqResult<()> {
        let attempts = self.settings.retry_attempts.max(1);
        let mut free = 0;
        for attempt in 1..=attempts {
            free = self.probe.free_bytes();
            if free >= required_bytes {
                return Ok(());
            }
            warn!(
                "Insufficient memory for next frame (attempt {attempt}/{attempts}): \
                 {free} bytes free, {required_bytes} required"
            );
            if attempt < attempts {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }
        Err(insufficient(free, required_bytes))
    }
}

fn insufficient(free: u64, required: u64) -> AcqError {
    AcqError::InsufficientMemory {
        free_mb: free as f64 / 1_048_576.0,
        required_mb: required as f64 / 1_048_576.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
    use std::sync::Arc;

    struct ScriptedProbe {
        calls: AtomicU32,
        free: AtomicU64,
        /// Free memory jumps to this value after `succeed_on` polls.
        succeed_on: u32,
        free_after: u64,
    }

    impl MemoryProbe for ScriptedProbe {
        fn free_bytes(&self) -> u64 {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.succeed_on {
                self.free_after
            } else {
                self.free.load(Ordering::SeqCst)
            }
        }
    }

    fn settings() -> MemorySettings {
        MemorySettings {
            fixed_overhead_bytes: 1000,
            frame_head_room: 10,
            retry_attempts: 5,
            retry_delay: std::time::Duration::from_millis(1),
        }
    }

    #[test]
    fn test_estimates() {
        let probe = Arc::new(ScriptedProbe {
            calls: AtomicU32::new(0),
            free: AtomicU64::new(0),
            succeed_on: u32::MAX,
            free_after: 0,
        });
        let guard = ResourceGuard::new(probe, settings());
        // 2 frames x 3 channels x 4 slices x 1 position x 10x10x2 bytes + overhead
        assert_eq!(guard.whole_run_bytes(2, 3, 4, 1, 10, 10, 2), 4800 + 1000);
        // (3*4 + 10 head room) * 200
        assert_eq!(guard.frame_bytes(3, 4, 10, 10, 2), 22 * 200);
    }

    #[tokio::test]
    async fn test_check_frame_exhausts_all_attempts() {
        let probe = Arc::new(ScriptedProbe {
            calls: AtomicU32::new(0),
            free: AtomicU64::new(100),
            succeed_on: u32::MAX,
            free_after: 0,
        });
        let guard = ResourceGuard::new(probe.clone(), settings());

        let err = guard.check_frame(1_048_576).await.expect_err("must fail");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 5);
        match err {
            AcqError::InsufficientMemory { free_mb, required_mb } => {
                assert!(free_mb < required_mb);
                assert!((required_mb - 1.0).abs() < 1e-9);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_check_frame_succeeds_before_last_attempt() {
        let probe = Arc::new(ScriptedProbe {
            calls: AtomicU32::new(0),
            free: AtomicU64::new(100),
            succeed_on: 3,
            free_after: u64::MAX,
        });
        let guard = ResourceGuard::new(probe.clone(), settings());

        guard.check_frame(1_048_576).await.expect("should succeed");
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_preflight_refuses_oversized_run() {
        let probe = Arc::new(ScriptedProbe {
            calls: AtomicU32::new(0),
            free: AtomicU64::new(10),
            succeed_on: u32::MAX,
            free_after: 0,
        });
        let guard = ResourceGuard::new(probe, settings());
        assert!(guard.preflight(1_000_000).is_err());
    }
}
