//! Configuration management.
//!
//! Engine tunables are loaded from `config/<name>.toml` (defaulting to
//! `config/default.toml`) with `MDACQ_*` environment variables layered on
//! top, so a deployment can override single values without editing files.
//! Every field has a built-in default; a missing config file is not an
//! error.

use crate::error::AcqError;
use config::Config;
use serde::Deserialize;
use std::time::Duration;

/// Engine settings.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Settings {
    /// Log filter passed to the logger at startup (e.g. "info", "debug").
    pub log_level: String,
    /// Smallest usable z step in micrometers; below this the slice
    /// dimension collapses to a single slice.
    pub min_z_step_um: f64,
    pub memory: MemorySettings,
    pub timing: TimingSettings,
}

/// Resource-guard tunables.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MemorySettings {
    /// Flat overhead added to the pre-flight whole-run estimate, in bytes.
    pub fixed_overhead_bytes: u64,
    /// Extra frame-sized slots added to the per-frame estimate as head room.
    pub frame_head_room: u64,
    /// Attempts before an insufficient-memory check becomes fatal.
    pub retry_attempts: u32,
    /// Delay between free-memory re-polls.
    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,
}

/// Polling and wait intervals.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TimingSettings {
    /// Poll interval used by blocking completion waits.
    #[serde(with = "humantime_serde")]
    pub completion_poll: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            min_z_step_um: 0.1,
            memory: MemorySettings::default(),
            timing: TimingSettings::default(),
        }
    }
}

impl Default for MemorySettings {
    fn default() -> Self {
        Self {
            fixed_overhead_bytes: 50 * 1024 * 1024,
            frame_head_room: 10,
            retry_attempts: 5,
            retry_delay: Duration::from_millis(100),
        }
    }
}

impl Default for TimingSettings {
    fn default() -> Self {
        Self {
            completion_poll: Duration::from_millis(50),
        }
    }
}

impl Settings {
    /// Loads settings from `config/<name>.toml` (optional) plus `MDACQ_*`
    /// environment overrides.
    pub fn new(config_name: Option<&str>) -> Result<Self, AcqError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path).required(false))
            .add_source(
                config::Environment::with_prefix("MDACQ")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(AcqError::Config)?;

        s.try_deserialize().map_err(AcqError::Config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn test_defaults_without_config_file() {
        let settings = Settings::new(Some("does_not_exist")).expect("defaults should load");
        assert_eq!(settings.memory.retry_attempts, 5);
        assert!((settings.min_z_step_um - 0.1).abs() < f64::EPSILON);
        assert_eq!(settings.timing.completion_poll, Duration::from_millis(50));
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("MDACQ_MIN_Z_STEP_UM", "0.5");
        let settings = Settings::new(Some("does_not_exist")).expect("defaults should load");
        std::env::remove_var("MDACQ_MIN_Z_STEP_UM");
        assert!((settings.min_z_step_um - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    #[serial]
    fn test_parse_toml_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            r#"
log_level = "debug"
min_z_step_um = 0.25

[memory]
retry_attempts = 3
retry_delay = "10ms"
"#,
        )
        .expect("write config");

        let s = Config::builder()
            .add_source(config::File::from(path))
            .build()
            .expect("build");
        let settings: Settings = s.try_deserialize().expect("deserialize");
        assert_eq!(settings.log_level, "debug");
        assert_eq!(settings.memory.retry_attempts, 3);
        assert_eq!(settings.memory.retry_delay, Duration::from_millis(10));
        // untouched sections keep their defaults
        assert_eq!(settings.memory.frame_head_room, 10);
    }
}
