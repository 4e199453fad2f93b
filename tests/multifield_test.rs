//! Position-major (multi-field) sequencing tests: each position must run
//! its complete frame sequence before the next position starts.

mod common;

use common::rig;
use mdacq::engine::RunPhase;
use mdacq::gateway::mock::GatewayCall;
use mdacq::sequence::{ChannelSpec, PositionMode, SequenceSpec, StagePosition};
use std::time::Duration;

fn multifield_spec(frames: u32) -> SequenceSpec {
    SequenceSpec {
        frame_count: frames,
        frame_interval_ms: 5.0,
        use_positions: true,
        positions: vec![
            StagePosition::new("P0", 0.0, 0.0),
            StagePosition::new("P1", 100.0, 0.0),
        ],
        position_mode: PositionMode::MultiField,
        save_to_disk: true,
        channels: vec![ChannelSpec::named("DAPI")],
        ..SequenceSpec::default()
    }
}

#[tokio::test]
async fn test_each_position_completes_before_the_next_starts() {
    let rig = rig();
    let spec = multifield_spec(2);

    rig.engine.acquire(&spec).await.expect("acquire");
    assert!(rig.engine.is_multi_field_running());
    rig.engine.wait_for_completion().await;

    // all frames of position 0 precede all frames of position 1, and the
    // frame counter restarts per position
    let coords: Vec<(u32, u32)> = rig
        .storage
        .coordinates()
        .await
        .iter()
        .map(|&(f, _, _, p)| (f, p))
        .collect();
    assert_eq!(coords, vec![(0, 0), (1, 0), (0, 1), (1, 1)]);

    // stage motion never jumps back to an earlier position
    let moves: Vec<String> = rig
        .gateway
        .recorded_calls()
        .await
        .iter()
        .filter_map(|c| match c {
            GatewayCall::MoveTo(label) => Some(label.clone()),
            _ => None,
        })
        .collect();
    let mut sorted = moves.clone();
    sorted.sort();
    assert_eq!(moves, sorted);
    assert!(moves.contains(&"P0".to_string()));
    assert!(moves.contains(&"P1".to_string()));

    assert!(!rig.engine.is_multi_field_running());
    assert_eq!(rig.engine.state().phase(), RunPhase::Terminated);

    // one summary per position, carrying its label
    let labels: Vec<Option<String>> = rig
        .storage
        .summaries()
        .await
        .iter()
        .map(|s| s.position_label.clone())
        .collect();
    assert_eq!(
        labels,
        vec![Some("P0".to_string()), Some("P1".to_string())]
    );

    // file-backed run persists metadata at each sequence termination
    assert_eq!(rig.storage.metadata_saves(), 2);
}

#[tokio::test]
async fn test_stage_motion_failure_stops_the_sequencer() {
    let rig = rig();
    rig.gateway.fail_stage_moves(true);
    let spec = multifield_spec(2);

    rig.engine.acquire(&spec).await.expect("acquire");
    rig.engine.wait_for_completion().await;

    assert!(rig.engine.state().has_error());
    let err = rig.engine.state().last_error().expect("error recorded");
    assert!(err.contains("Stage motion failed"));
    assert!(rig.storage.records().await.is_empty());
    assert_eq!(rig.engine.state().phase(), RunPhase::Terminated);
}

#[tokio::test]
async fn test_abort_stops_after_the_current_position() {
    let rig = rig();
    let spec = multifield_spec(3);

    // abort during position 0's second frame
    let state = rig.engine.state();
    rig.gateway
        .set_snap_hook(Box::new(move |idx| {
            if idx == 1 {
                state.request_abort();
            }
        }))
        .await;

    rig.engine.acquire(&spec).await.expect("acquire");
    rig.engine.wait_for_completion().await;

    assert!(rig.engine.state().was_aborted());
    // position 1 was never visited
    let positions: Vec<u32> = rig
        .storage
        .coordinates()
        .await
        .iter()
        .map(|&(_, _, _, p)| p)
        .collect();
    assert!(positions.iter().all(|&p| p == 0));
    let calls = rig.gateway.recorded_calls().await;
    assert!(calls
        .iter()
        .filter(|c| matches!(c, GatewayCall::MoveTo(_)))
        .all(|c| matches!(c, GatewayCall::MoveTo(label) if label == "P0")));
}

#[tokio::test]
async fn test_stop_interrupts_multifield_run() {
    let rig = rig();
    let spec = SequenceSpec {
        frame_count: 200,
        frame_interval_ms: 20.0,
        ..multifield_spec(200)
    };

    rig.engine.acquire(&spec).await.expect("acquire");
    tokio::time::sleep(Duration::from_millis(50)).await;
    rig.engine.stop(true).await;

    assert!(!rig.engine.is_multi_field_running());
    assert!(!rig.engine.is_acquisition_running());
    assert!(rig.engine.state().is_interrupted());
    assert_eq!(rig.engine.state().phase(), RunPhase::Terminated);
}
