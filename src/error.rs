//! Custom error types for the acquisition engine.
//!
//! This module defines the primary error type, `AcqError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to classify the failure modes of an acquisition run:
//!
//! - **`Busy`**: a new run was requested while one is already active. No
//!   state is changed; the caller may retry after the current run ends.
//! - **`Precondition`**: the sequence specification is unusable as given
//!   (missing position list, invalid mode combination, etc.). Reported
//!   before any hardware interaction.
//! - **`Config`**: wraps errors from the `config` crate, typically file
//!   parsing or format issues in the settings files.
//! - **`Hardware`**: a gateway call failed (snap, stage motion, config
//!   switch, device wait). Fatal for the current run; the engine restores
//!   the pre-run hardware state before surfacing it.
//! - **`DepthMismatch`**: the camera returned a different byte depth than
//!   the one established at the start of the run. Depth must be uniform
//!   across the whole acquisition.
//! - **`InsufficientMemory`**: the resource guard exhausted its retries and
//!   the estimated frame footprint still does not fit in free memory.
//! - **`Storage`**: the storage sink rejected an image or its metadata.
//!   Partial data already written is left in place.
//!
//! A user-requested abort is deliberately NOT an error: it terminates the
//! run cleanly with the `interrupted` flag set on the run state, so callers
//! can distinguish "user cancelled" from "something broke".

use thiserror::Error;

/// Convenience alias for results using the engine error type.
pub type AcqResult<T> = std::result::Result<T, AcqError>;

#[derive(Error, Debug)]
pub enum AcqError {
    #[error("Busy with the current acquisition")]
    Busy,

    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Hardware error: {0}")]
    Hardware(String),

    #[error("The byte depth does not match between channels or slices (expected {expected}, got {actual})")]
    DepthMismatch { expected: u32, actual: u32 },

    #[error("Remaining memory {free_mb:.2} MB. Required for the next step: {required_mb:.2} MB")]
    InsufficientMemory { free_mb: f64, required_mb: f64 },

    #[error("Storage error: {0}")]
    Storage(String),
}

impl AcqError {
    /// Wraps an arbitrary gateway failure as a hardware error.
    pub fn hardware(err: impl std::fmt::Display) -> Self {
        AcqError::Hardware(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AcqError::Hardware("stage timeout".to_string());
        assert_eq!(err.to_string(), "Hardware error: stage timeout");
    }

    #[test]
    fn test_memory_error_reports_both_sides() {
        let err = AcqError::InsufficientMemory {
            free_mb: 12.5,
            required_mb: 64.0,
        };
        let msg = err.to_string();
        assert!(msg.contains("12.50"));
        assert!(msg.contains("64.00"));
    }
}
