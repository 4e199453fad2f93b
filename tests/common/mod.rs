//! Shared fixtures for the scheduler integration tests.

#![allow(dead_code)]

use mdacq::config::{MemorySettings, Settings, TimingSettings};
use mdacq::engine::{AcquisitionEngine, MemoryProbe};
use mdacq::gateway::mock::{MockDisplay, MockGateway, MockStorage};
use mdacq::sequence::{ChannelSpec, SequenceSpec};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Settings with short delays so tests finish quickly.
pub fn fast_settings() -> Settings {
    Settings {
        log_level: "warn".to_string(),
        min_z_step_um: 0.1,
        memory: MemorySettings {
            fixed_overhead_bytes: 1024,
            frame_head_room: 10,
            retry_attempts: 5,
            retry_delay: Duration::from_millis(1),
        },
        timing: TimingSettings {
            completion_poll: Duration::from_millis(10),
        },
    }
}

/// Probe that always reports effectively unlimited free memory.
pub struct PlentyProbe;

impl MemoryProbe for PlentyProbe {
    fn free_bytes(&self) -> u64 {
        u64::MAX
    }
}

/// Probe that replays a scripted sequence of free-memory readings and
/// repeats the last one when exhausted.
pub struct ScriptedProbe {
    readings: Mutex<(Vec<u64>, usize)>,
}

impl ScriptedProbe {
    pub fn new(readings: Vec<u64>) -> Self {
        Self {
            readings: Mutex::new((readings, 0)),
        }
    }

    pub fn polls(&self) -> usize {
        self.readings.lock().expect("probe lock").1
    }
}

impl MemoryProbe for ScriptedProbe {
    fn free_bytes(&self) -> u64 {
        let mut guard = self.readings.lock().expect("probe lock");
        let (readings, idx) = &mut *guard;
        let value = readings
            .get(*idx)
            .or_else(|| readings.last())
            .copied()
            .unwrap_or(0);
        *idx += 1;
        value
    }
}

/// A full engine wired to mock collaborators.
pub struct Rig {
    pub gateway: Arc<MockGateway>,
    pub storage: Arc<MockStorage>,
    pub display: Arc<MockDisplay>,
    pub engine: AcquisitionEngine,
}

pub fn rig() -> Rig {
    rig_with_gateway(MockGateway::new(32, 32, 2))
}

pub fn rig_with_gateway(gateway: MockGateway) -> Rig {
    let gateway = Arc::new(gateway);
    let storage = Arc::new(MockStorage::new());
    let display = Arc::new(MockDisplay::new());
    let engine = AcquisitionEngine::new(
        fast_settings(),
        gateway.clone(),
        storage.clone(),
        display.clone(),
    )
    .with_memory_probe(Arc::new(PlentyProbe));
    Rig {
        gateway,
        storage,
        display,
        engine,
    }
}

/// Two-channel spec with a 3-slice z stack, one frame.
pub fn two_channel_stack() -> SequenceSpec {
    SequenceSpec {
        frame_count: 1,
        frame_interval_ms: 1.0,
        use_slices: true,
        slice_bottom_um: 0.0,
        slice_top_um: 10.0,
        slice_step_um: 5.0,
        channels: vec![ChannelSpec::named("DAPI"), ChannelSpec::named("FITC")],
        ..SequenceSpec::default()
    }
}
