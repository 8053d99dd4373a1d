//! Integration tests for the session lifecycle over the simulated link

use imu_sync_gateway::core::{ClassifierError, InferencePlan, Label};
use imu_sync_gateway::device::sim::{SimDevice, SimulatedTransport};
use imu_sync_gateway::device::{Command, DeviceAddress, DeviceId, DeviceRegistry};
use imu_sync_gateway::session::{
    SessionController, SessionError, SessionRequest, SessionSettings, SessionState,
};
use imu_sync_gateway::stats::create_shared_stats;
use std::sync::Arc;
use std::time::Duration;

const REGISTRY: &str = "\
# address      name
AA:00:00:00:00:01 J
AA:00:00:00:00:02 K
AA:00:00:00:00:03 L
";

fn nodes() -> Vec<SimDevice> {
    vec![
        SimDevice::new("AA:00:00:00:00:01", b'J'),
        SimDevice::new("AA:00:00:00:00:02", b'K'),
        SimDevice::new("AA:00:00:00:00:03", b'L'),
    ]
}

fn setup(nodes: Vec<SimDevice>) -> (Arc<SessionController<SimulatedTransport>>, SimulatedTransport) {
    let transport = SimulatedTransport::new(nodes);
    let controller = SessionController::new(
        Arc::new(transport.clone()),
        Arc::new(DeviceRegistry::parse(REGISTRY).unwrap()),
        SessionSettings::default(),
        create_shared_stats(),
    );
    (Arc::new(controller), transport)
}

#[tokio::test(start_paused = true)]
async fn test_three_devices_produce_aligned_frames() {
    let (controller, _) = setup(nodes());

    let log = controller
        .start_session(SessionRequest::new(["L", "J", "K"], Duration::from_secs(3)))
        .await
        .unwrap();

    let ids: Vec<&str> = log.devices.iter().map(|d| d.as_str()).collect();
    assert_eq!(ids, ["J", "K", "L"]);
    assert_eq!(log.header()[..3], ["ms", "Jax", "Jay"]);
    assert!(log.len() >= 55, "got {} frames", log.len());

    for (i, frame) in log.frames().iter().enumerate() {
        assert_eq!(frame.timestamp_ms, i as u32 * 50);
        assert_eq!(frame.devices, log.devices);
        assert_eq!(frame.vector().len(), 18);
    }

    let stats = controller.stats().stats();
    assert_eq!(stats.frames_emitted, log.len() as u64);
    assert_eq!(stats.samples_duplicate, 0);
    assert_eq!(stats.sessions_completed, 1);
    assert_eq!(controller.state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_rate_set_reaches_all_devices_before_any_reset() {
    let (controller, transport) = setup(nodes());

    controller
        .start_session(
            SessionRequest::new(["J", "K", "L"], Duration::from_secs(1)).with_sampling_ms(100),
        )
        .await
        .unwrap();

    let log = transport.command_log();
    assert_eq!(log.len(), 6);
    let (rates, resets) = log.split_at(3);
    assert!(rates
        .iter()
        .all(|r| r.command == Command::SetSamplePeriod(100)));
    assert!(resets.iter().all(|r| r.command == Command::ResetTimestamp));

    // Each broadcast reaches every device at the same instant.
    assert!(rates.iter().all(|r| r.at == rates[0].at));
    assert!(resets.iter().all(|r| r.at == resets[0].at));
    assert!(resets[0].at > rates[0].at);
}

#[tokio::test(start_paused = true)]
async fn test_start_while_running_is_rejected() {
    let (controller, _) = setup(nodes());

    let running = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .start_session(SessionRequest::new(["J", "K"], Duration::from_secs(5)))
                .await
        })
    };

    let mut state = controller.subscribe_state();
    state
        .wait_for(|s| *s == SessionState::Active)
        .await
        .unwrap();

    let err = controller
        .start_session(SessionRequest::new(["L"], Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert_eq!(err, SessionError::InvalidCommandState(SessionState::Active));
    assert_eq!(controller.state(), SessionState::Active);

    let log = running.await.unwrap().unwrap();
    assert!(!log.is_empty());
    assert_eq!(log.devices, vec![DeviceId::new("J"), DeviceId::new("K")]);
}

#[tokio::test(start_paused = true)]
async fn test_device_loss_marks_disconnected_and_keeps_frames() {
    let mut nodes = nodes();
    nodes[1] = SimDevice::new("AA:00:00:00:00:02", b'K').dropping_after(1000);
    let (controller, transport) = setup(nodes);

    let log = controller
        .start_session(SessionRequest::new(["J", "K"], Duration::from_secs(3)))
        .await
        .unwrap();

    assert_eq!(controller.state(), SessionState::Disconnected);

    // Frames up to the drop survive; nothing after it can complete.
    let last = log.frames().last().unwrap().timestamp_ms;
    assert!(log.len() >= 20, "got {} frames", log.len());
    assert!(last <= 1000, "last frame at {last}");
    assert!(controller.stats().stats().incomplete_discarded > 0);

    // Both links were still released.
    assert_eq!(transport.disconnect_log().len(), 2);

    // Disconnected persists until the next start, which is allowed.
    let next = controller
        .start_session(SessionRequest::new(["J"], Duration::from_secs(1)))
        .await
        .unwrap();
    assert!(!next.is_empty());
    assert_eq!(controller.state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_offline_device_fails_connection() {
    let mut nodes = nodes();
    nodes[2] = SimDevice::new("AA:00:00:00:00:03", b'L').offline();
    let (controller, transport) = setup(nodes);

    let err = controller
        .start_session(SessionRequest::new(["J", "K", "L"], Duration::from_secs(1)))
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SessionError::ConnectionFailed { ref device, .. } if device == &DeviceId::new("L")
    ));
    assert_eq!(controller.state(), SessionState::Ready);
    assert_eq!(
        transport.disconnect_log(),
        vec![
            DeviceAddress::new("AA:00:00:00:00:01"),
            DeviceAddress::new("AA:00:00:00:00:02"),
        ]
    );
    assert!(transport.command_log().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_disconnect_does_not_stop_cleanup() {
    let mut nodes = nodes();
    nodes[0] = SimDevice::new("AA:00:00:00:00:01", b'J').failing_disconnect();
    let (controller, transport) = setup(nodes);

    let log = controller
        .start_session(SessionRequest::new(["J", "K", "L"], Duration::from_secs(1)))
        .await
        .unwrap();

    assert!(!log.is_empty());
    assert_eq!(transport.disconnect_log().len(), 3);
    assert_eq!(controller.state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_stop_ends_collection_early() {
    let (controller, transport) = setup(nodes());

    let running = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .start_session(SessionRequest::new(["J", "K"], Duration::from_secs(60)))
                .await
        })
    };

    let mut state = controller.subscribe_state();
    state
        .wait_for(|s| *s == SessionState::Active)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(controller.stop());

    let log = running.await.unwrap().unwrap();
    assert!(log.len() < 20, "got {} frames", log.len());
    assert_eq!(transport.disconnect_log().len(), 2);
    assert!(!controller.is_running());
    assert!(!controller.stop());
}

#[tokio::test(start_paused = true)]
async fn test_single_frame_plan_sees_every_frame() {
    let (controller, _) = setup(nodes());
    let plan = InferencePlan::single_frame(|v: &[f32]| -> Result<Label, ClassifierError> {
        Ok(if v.len() == 12 { "pair" } else { "other" }.to_string())
    });

    let log = controller
        .start_session(
            SessionRequest::new(["J", "K"], Duration::from_secs(1)).with_plan(plan),
        )
        .await
        .unwrap();

    let stats = controller.stats().stats();
    assert_eq!(stats.classifications, log.len() as u64);
    let latest = controller.latest_result().get().unwrap();
    assert_eq!(latest.label, "pair");
}

#[tokio::test(start_paused = true)]
async fn test_sleep_devices_takes_nodes_offline() {
    let (controller, _) = setup(nodes());
    controller.scan(Duration::from_secs(1)).await.unwrap();
    assert_eq!(controller.registry().online_ids().len(), 3);

    let selected = [DeviceId::new("J"), DeviceId::new("K")].into_iter().collect();
    let asleep = controller.sleep_devices(&selected).await.unwrap();
    assert_eq!(asleep, selected);

    let status = controller.scan(Duration::from_secs(1)).await.unwrap();
    assert_eq!(status[&DeviceId::new("J")], false);
    assert_eq!(status[&DeviceId::new("K")], false);
    assert_eq!(status[&DeviceId::new("L")], true);
}

#[tokio::test(start_paused = true)]
async fn test_aborted_caller_releases_devices_and_saves_frames() {
    let dir = tempfile::tempdir().unwrap();
    let transport = SimulatedTransport::new(nodes());
    let settings = SessionSettings {
        recovery_dir: Some(dir.path().to_path_buf()),
        ..SessionSettings::default()
    };
    let controller = Arc::new(SessionController::new(
        Arc::new(transport.clone()),
        Arc::new(DeviceRegistry::parse(REGISTRY).unwrap()),
        settings,
        create_shared_stats(),
    ));

    let caller = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .start_session(SessionRequest::new(["J", "K"], Duration::from_secs(30)))
                .await
        })
    };

    let mut state = controller.subscribe_state();
    state
        .wait_for(|s| *s == SessionState::Active)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(500)).await;
    caller.abort();
    assert!(caller.await.unwrap_err().is_cancelled());

    state
        .wait_for(|s| *s == SessionState::Ready)
        .await
        .unwrap();
    while controller.is_running() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(transport.disconnect_log().len(), 2);
    assert!(!controller.stop());

    let saved: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().path())
        .collect();
    assert_eq!(saved.len(), 1);
    let text = std::fs::read_to_string(&saved[0]).unwrap();
    let rows = text.lines().count() - 1;
    assert!(text.starts_with("ms,Jax"));
    assert!(rows > 0 && rows < 20, "got {rows} rows");

    // The next session configures from scratch.
    let next = {
        let controller = controller.clone();
        tokio::spawn(async move {
            controller
                .start_session(SessionRequest::new(["L"], Duration::from_secs(1)))
                .await
        })
    };
    state
        .wait_for(|s| *s == SessionState::AwaitingStart)
        .await
        .unwrap();
    assert!(!next.await.unwrap().unwrap().is_empty());
    assert_eq!(controller.state(), SessionState::Ready);
}
