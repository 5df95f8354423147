//! End-to-end driver behavior against the simulated controller.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use zwave_core::protocol::constants::*;
use zwave_core::{
    ControllerTransport, Driver, DriverConfig, DriverError, DriverState, Liveness, MockTransport,
    Notification, NotificationCode, NotificationType, QueryStage, SimNode, SimulatedController,
    TomlFileCache, ValueId, ValuePayload,
};

const HOME: u32 = 0x00C0_FFEE;
const SWITCH: u8 = 2;
const DIMMER: u8 = 3;
const SENSOR: u8 = 4;

fn fast_config() -> DriverConfig {
    DriverConfig {
        ack_timeout_ms: 50,
        reply_timeout_ms: 100,
        retry_initial_backoff_ms: 1,
        retry_max_backoff_ms: 5,
        reconnect_attempts: 2,
        reconnect_backoff_ms: 1,
        save_configuration: false,
        ..DriverConfig::new("sim")
    }
}

type Seen = Arc<Mutex<Vec<Notification>>>;

fn record<T: ControllerTransport>(driver: &Driver<T>) -> Seen {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    driver.add_watcher(Arc::new(move |n: &Notification| {
        sink.lock().unwrap().push(n.clone());
    }));
    seen
}

fn codes_for(seen: &Seen, code: NotificationCode) -> Vec<Notification> {
    seen.lock()
        .unwrap()
        .iter()
        .filter(|n| n.code == Some(code))
        .cloned()
        .collect()
}

fn count_kind(seen: &Seen, kind: NotificationType) -> usize {
    seen.lock().unwrap().iter().filter(|n| n.kind == kind).count()
}

/// Transactions in `ids` in the order their MsgComplete arrived.
fn completed_in_order(seen: &Seen, ids: &[u64]) -> Vec<u64> {
    codes_for(seen, NotificationCode::MsgComplete)
        .iter()
        .filter_map(Notification::transaction)
        .filter(|id| ids.contains(id))
        .collect()
}

fn basic_levels(sim: &SimulatedController, node_id: u8) -> Vec<u8> {
    sim.delivered(node_id)
        .iter()
        .filter(|data| data.starts_with(&[COMMAND_CLASS_BASIC, 0x01]))
        .map(|data| data[2])
        .collect()
}

fn liveness<T: ControllerTransport>(driver: &Driver<T>, node_id: u8) -> Option<Liveness> {
    driver.node_info(node_id).map(|node| node.liveness)
}

/// Every node finished or asleep, nothing left to send.
fn settled<T: ControllerTransport>(driver: &Driver<T>) -> bool {
    driver.state() == DriverState::Ready
        && driver.is_idle()
        && driver.node_ids().into_iter().all(|id| {
            driver
                .node_info(id)
                .is_some_and(|node| node.is_settled() || node.liveness == Liveness::Asleep)
        })
}

fn start(sim: &SimulatedController, config: DriverConfig) -> (Driver<MockTransport>, Seen) {
    let mut driver = Driver::new(config, sim.transport());
    let seen = record(&driver);
    driver.initialize().unwrap();
    assert!(
        driver.run_until(Duration::from_secs(5), settled).unwrap(),
        "network did not settle"
    );
    (driver, seen)
}

fn network() -> SimulatedController {
    let sim = SimulatedController::new(HOME);
    sim.add_node(SimNode::switch(SWITCH));
    sim.add_node(SimNode::dimmer(DIMMER));
    sim.add_node(SimNode::sensor(SENSOR));
    sim
}

#[test]
fn commands_complete_in_submission_order() {
    let sim = network();
    let (mut driver, seen) = start(&sim, fast_config());

    let ids: Vec<u64> = [10u8, 20, 30]
        .iter()
        .map(|level| {
            driver
                .submit_command(SWITCH, COMMAND_CLASS_BASIC, &[0x01, *level])
                .unwrap()
        })
        .collect();
    assert!(
        driver
            .run_until(Duration::from_secs(2), |_| completed_in_order(&seen, &ids).len() == 3)
            .unwrap()
    );

    assert_eq!(completed_in_order(&seen, &ids), ids);
    assert_eq!(basic_levels(&sim, SWITCH), vec![10, 20, 30]);
    assert_eq!(sim.overlap_violations(), 0);

    let report = driver.shutdown();
    assert_eq!(report.completed, ids);
    assert!(report.cancelled.is_empty());
}

#[test]
fn interview_reaches_every_stage_and_announces_sweep() {
    let sim = network();
    let (driver, seen) = start(&sim, fast_config());

    let switch = driver.node_info(SWITCH).unwrap();
    assert_eq!(switch.stage, QueryStage::FullComplete);
    assert_eq!(switch.manufacturer_name, "Aeotec");
    assert!(switch.supports(COMMAND_CLASS_SWITCH_BINARY));
    assert_eq!(liveness(&driver, SENSOR), Some(Liveness::Asleep));

    // The sensor is still asleep: only the awake sweep is done.
    assert_eq!(count_kind(&seen, NotificationType::AwakeNodesQueried), 1);
    assert_eq!(count_kind(&seen, NotificationType::AllNodesQueried), 0);
    assert_eq!(count_kind(&seen, NotificationType::NodeQueriesComplete), 3);
    assert_eq!(count_kind(&seen, NotificationType::NodeNew), 4);
    assert_eq!(sim.overlap_violations(), 0);
}

#[test]
fn sleeping_node_commands_flush_on_wake_in_order() {
    let sim = network();
    let (mut driver, seen) = start(&sim, fast_config());

    let ids: Vec<u64> = [1u8, 2, 3]
        .iter()
        .map(|level| {
            driver
                .submit_command(SENSOR, COMMAND_CLASS_BASIC, &[0x01, *level])
                .unwrap()
        })
        .collect();
    driver.run_until(Duration::from_millis(50), |_| false).unwrap();
    assert!(basic_levels(&sim, SENSOR).is_empty());
    assert!(completed_in_order(&seen, &ids).is_empty());

    sim.wake_up(SENSOR);
    assert!(
        driver
            .run_until(Duration::from_secs(3), |d| {
                d.node_info(SENSOR).is_some_and(|n| n.is_complete())
                    && liveness(d, SENSOR) == Some(Liveness::Asleep)
                    && d.is_idle()
            })
            .unwrap()
    );

    assert_eq!(basic_levels(&sim, SENSOR), vec![1, 2, 3]);
    assert_eq!(completed_in_order(&seen, &ids), ids);
    assert!(!sim.node(SENSOR).unwrap().awake, "NoMoreInformation not sent");
    assert_eq!(count_kind(&seen, NotificationType::AllNodesQueried), 1);

    let codes: Vec<_> = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|n| n.node_id == SENSOR)
        .filter_map(|n| n.code)
        .filter(|c| matches!(c, NotificationCode::Awake | NotificationCode::Sleep))
        .collect();
    assert_eq!(
        codes,
        vec![NotificationCode::Sleep, NotificationCode::Awake, NotificationCode::Sleep]
    );
    assert_eq!(sim.overlap_violations(), 0);
}

#[test]
fn node_falling_asleep_mid_queue_keeps_order() {
    let sim = network();
    let (mut driver, seen) = start(&sim, fast_config());

    sim.wake_up(SENSOR);
    assert!(
        driver
            .run_until(Duration::from_secs(2), |d| liveness(d, SENSOR) == Some(Liveness::Awake))
            .unwrap()
    );
    let ids: Vec<u64> = [7u8, 8, 9]
        .iter()
        .map(|level| {
            driver
                .submit_command(SENSOR, COMMAND_CLASS_BASIC, &[0x01, *level])
                .unwrap()
        })
        .collect();
    sim.sleep(SENSOR);
    assert!(
        driver
            .run_until(Duration::from_secs(2), |d| liveness(d, SENSOR) == Some(Liveness::Asleep))
            .unwrap()
    );
    assert!(basic_levels(&sim, SENSOR).is_empty());

    sim.wake_up(SENSOR);
    assert!(
        driver
            .run_until(Duration::from_secs(3), |_| completed_in_order(&seen, &ids).len() == 3)
            .unwrap()
    );
    assert_eq!(basic_levels(&sim, SENSOR), vec![7, 8, 9]);
    assert_eq!(completed_in_order(&seen, &ids), ids);
    assert!(codes_for(&seen, NotificationCode::Timeout)
        .iter()
        .all(|n| n.transaction().is_none_or(|id| !ids.contains(&id))));
}

#[test]
fn single_dead_node_reports_some_dead_once() {
    let sim = SimulatedController::new(HOME);
    sim.add_node(SimNode::switch(SWITCH));
    sim.add_node(SimNode::dimmer(DIMMER));
    sim.set_responsive(DIMMER, false);
    let (mut driver, seen) = start(&sim, fast_config());

    assert_eq!(liveness(&driver, DIMMER), Some(Liveness::Dead));
    assert_eq!(codes_for(&seen, NotificationCode::Dead).len(), 1);
    assert_eq!(count_kind(&seen, NotificationType::AllNodesQueriedSomeDead), 1);
    assert_eq!(count_kind(&seen, NotificationType::AllNodesQueried), 0);

    // Nothing more happens on later polls.
    driver.run_until(Duration::from_millis(100), |_| false).unwrap();
    assert_eq!(count_kind(&seen, NotificationType::AllNodesQueriedSomeDead), 1);
    assert!(matches!(
        driver.submit_command(DIMMER, COMMAND_CLASS_BASIC, &[0x01, 0xFF]),
        Err(DriverError::NodeUnreachable(DIMMER))
    ));
}

fn timed_out(seen: &Seen, ids: &[u64]) -> Vec<u64> {
    codes_for(seen, NotificationCode::Timeout)
        .iter()
        .filter_map(Notification::transaction)
        .filter(|id| ids.contains(id))
        .collect()
}

#[test]
fn unanswered_commands_time_out_once_each() {
    let sim = SimulatedController::new(HOME);
    sim.add_node(SimNode::switch(SWITCH));
    let config = DriverConfig {
        dead_node_threshold: 10,
        ..fast_config()
    };
    let (mut driver, seen) = start(&sim, config);

    sim.set_responsive(SWITCH, false);
    let ids: Vec<u64> = [10u8, 20, 30]
        .iter()
        .map(|level| {
            driver
                .submit_command(SWITCH, COMMAND_CLASS_BASIC, &[0x01, *level])
                .unwrap()
        })
        .collect();
    assert!(
        driver
            .run_until(Duration::from_secs(3), |d| {
                d.is_idle() && timed_out(&seen, &ids).len() == ids.len()
            })
            .unwrap()
    );

    assert_eq!(timed_out(&seen, &ids), ids);
    assert!(completed_in_order(&seen, &ids).is_empty());
    assert!(basic_levels(&sim, SWITCH).is_empty());
    assert_eq!(liveness(&driver, SWITCH), Some(Liveness::Alive));

    let report = driver.shutdown();
    assert_eq!(report.timed_out, ids);
    assert!(report.completed.is_empty());
}

#[test]
fn interviewed_node_dies_after_repeated_send_failures() {
    let sim = SimulatedController::new(HOME);
    sim.add_node(SimNode::switch(SWITCH));
    let (mut driver, seen) = start(&sim, fast_config());
    assert_eq!(liveness(&driver, SWITCH), Some(Liveness::Alive));

    sim.set_responsive(SWITCH, false);
    let ids: Vec<u64> = (1u8..=5)
        .map(|level| {
            driver
                .submit_command(SWITCH, COMMAND_CLASS_BASIC, &[0x01, level])
                .unwrap()
        })
        .collect();
    assert!(
        driver
            .run_until(Duration::from_secs(3), |d| {
                d.is_idle() && d.node_info(SWITCH).is_some_and(|n| n.liveness == Liveness::Dead)
            })
            .unwrap()
    );

    // Two failed sends kill it; the rest are dropped without going out.
    assert_eq!(codes_for(&seen, NotificationCode::Dead).len(), 1);
    assert_eq!(timed_out(&seen, &ids), ids);
    assert!(completed_in_order(&seen, &ids).is_empty());
    assert!(matches!(
        driver.submit_command(SWITCH, COMMAND_CLASS_BASIC, &[0x01, 0xFF]),
        Err(DriverError::NodeUnreachable(SWITCH))
    ));
    assert_eq!(driver.shutdown().timed_out, ids);
}

#[test]
fn dead_node_revives_on_unsolicited_frame() {
    let sim = SimulatedController::new(HOME);
    sim.add_node(SimNode::dimmer(DIMMER));
    sim.set_responsive(DIMMER, false);
    let (mut driver, seen) = start(&sim, fast_config());
    assert_eq!(liveness(&driver, DIMMER), Some(Liveness::Dead));

    sim.set_responsive(DIMMER, true);
    sim.send_basic_set(DIMMER, 0x63);
    assert!(
        driver
            .run_until(Duration::from_secs(3), |d| {
                d.node_info(DIMMER).is_some_and(|n| n.is_complete())
            })
            .unwrap()
    );
    assert_eq!(liveness(&driver, DIMMER), Some(Liveness::Alive));
    assert_eq!(codes_for(&seen, NotificationCode::Alive).len(), 1);
    assert_eq!(count_kind(&seen, NotificationType::NodeEvent), 1);
}

#[test]
fn set_value_with_wrong_type_changes_nothing() {
    let sim = network();
    let (mut driver, seen) = start(&sim, fast_config());
    let id = ValueId::new(SWITCH, COMMAND_CLASS_SWITCH_BINARY, 1, 0);
    let before = driver.get_value(&id).unwrap();
    let notified = seen.lock().unwrap().len();
    let requests = sim.requests().len();

    let err = driver
        .set_value(&id, ValuePayload::String("on".into()))
        .unwrap_err();
    assert!(matches!(err, DriverError::InvalidType { .. }));

    driver.run_until(Duration::from_millis(50), |_| false).unwrap();
    assert_eq!(driver.get_value(&id).unwrap(), before);
    assert_eq!(seen.lock().unwrap().len(), notified);
    assert_eq!(sim.requests().len(), requests);
}

#[test]
fn set_value_then_refresh_updates_store() {
    let sim = network();
    let (mut driver, seen) = start(&sim, fast_config());
    let id = ValueId::new(DIMMER, COMMAND_CLASS_SWITCH_MULTILEVEL, 1, 0);

    let tx = driver.set_value(&id, ValuePayload::Byte(42)).unwrap();
    assert!(
        driver
            .run_until(Duration::from_secs(2), |d| {
                d.get_value(&id).is_ok_and(|v| v.payload() == &ValuePayload::Byte(42))
            })
            .unwrap()
    );
    assert_eq!(sim.node(DIMMER).unwrap().level, 42);
    assert!(driver.get_value(&id).unwrap().pending().is_none());
    assert_eq!(completed_in_order(&seen, &[tx]), vec![tx]);
    assert!(
        seen.lock()
            .unwrap()
            .iter()
            .any(|n| n.kind == NotificationType::ValueChanged && n.value_id == Some(id))
    );
}

#[test]
fn config_parameters_round_trip() {
    let sim = network();
    let (mut driver, _seen) = start(&sim, fast_config());

    driver.set_config_param(SWITCH, 5, 300, 2).unwrap();
    let id = ValueId::new(SWITCH, COMMAND_CLASS_CONFIGURATION, 1, 5);
    assert!(
        driver
            .run_until(Duration::from_secs(2), |d| {
                d.get_value(&id).is_ok_and(|v| v.payload() == &ValuePayload::Int(300))
            })
            .unwrap()
    );
    assert!(matches!(
        driver.set_config_param(SWITCH, 5, 300, 1),
        Err(DriverError::InvalidValue(_))
    ));

    // A write through the value keeps the two-byte width the device reported.
    assert_eq!(driver.get_value(&id).unwrap().size(), Some(2));
    driver.set_value(&id, ValuePayload::Int(5)).unwrap();
    assert!(
        driver
            .run_until(Duration::from_secs(2), |d| {
                d.get_value(&id).is_ok_and(|v| v.payload() == &ValuePayload::Int(5))
            })
            .unwrap()
    );
    let last_set = sim
        .delivered(SWITCH)
        .into_iter()
        .filter(|d| d.starts_with(&[COMMAND_CLASS_CONFIGURATION, 0x04]))
        .last();
    assert_eq!(last_set, Some(vec![COMMAND_CLASS_CONFIGURATION, 0x04, 5, 2, 0x00, 0x05]));
}

#[test]
fn polling_refreshes_periodically() {
    let sim = network();
    let config = DriverConfig {
        poll_interval_ms: 20,
        ..fast_config()
    };
    let (mut driver, seen) = start(&sim, config);
    let id = ValueId::new(SWITCH, COMMAND_CLASS_SWITCH_BINARY, 1, 0);
    let gets = |sim: &SimulatedController| {
        sim.delivered(SWITCH)
            .iter()
            .filter(|d| d.as_slice() == [COMMAND_CLASS_SWITCH_BINARY, 0x02])
            .count()
    };
    let before = gets(&sim);

    driver.enable_poll(&id).unwrap();
    driver.run_until(Duration::from_millis(200), |_| false).unwrap();
    assert!(gets(&sim) >= before + 3);
    assert_eq!(count_kind(&seen, NotificationType::PollingEnabled), 1);

    assert!(driver.disable_poll(&id));
    driver.run_until(Duration::from_millis(30), |d| d.is_idle()).unwrap();
    let stopped = gets(&sim);
    driver.run_until(Duration::from_millis(100), |_| false).unwrap();
    assert_eq!(gets(&sim), stopped);
}

#[test]
fn transport_reopens_after_fault() {
    let sim = network();
    let (mut driver, seen) = start(&sim, fast_config());
    let mock = sim.transport();

    mock.disconnect();
    let tx = driver
        .submit_command(SWITCH, COMMAND_CLASS_BASIC, &[0x01, 0x11])
        .unwrap();
    assert!(
        driver
            .run_until(Duration::from_secs(2), |_| completed_in_order(&seen, &[tx]) == vec![tx])
            .unwrap()
    );
    assert!(mock.reopen_count() >= 1);
    assert_eq!(driver.state(), DriverState::Ready);
    assert_eq!(count_kind(&seen, NotificationType::DriverFailed), 0);
}

#[test]
fn lost_transport_fails_driver_and_cancels_commands() {
    let sim = network();
    let (mut driver, seen) = start(&sim, fast_config());
    let mock = sim.transport();

    let tx = driver
        .submit_command(SWITCH, COMMAND_CLASS_BASIC, &[0x01, 0x22])
        .unwrap();
    mock.set_reopen_ok(false);
    mock.disconnect();

    assert!(driver.poll().is_err());
    assert_eq!(driver.state(), DriverState::Failed);
    assert_eq!(count_kind(&seen, NotificationType::DriverFailed), 1);
    assert!(matches!(
        driver.submit_command(SWITCH, COMMAND_CLASS_BASIC, &[0x01, 0x00]),
        Err(DriverError::Failed)
    ));
    assert!(matches!(driver.poll(), Err(DriverError::Failed)));

    let report = driver.shutdown();
    assert_eq!(report.cancelled, vec![tx]);
    assert_eq!(count_kind(&seen, NotificationType::DriverRemoved), 1);
}

#[test]
fn cached_network_skips_identification() {
    let dir = std::env::temp_dir().join(format!("zwave-driver-cache-{}", std::process::id()));
    let config = DriverConfig {
        cache_path: Some(dir.to_string_lossy().into_owned()),
        save_configuration: true,
        ..fast_config()
    };

    let sim = network();
    let (mut first, _) = start(&sim, config.clone());
    first.shutdown();
    assert!(TomlFileCache::new(&dir).path_for(HOME).exists());

    let sim = network();
    let (second, seen) = start(&sim, config);
    // Restored nodes are added, never announced as new.
    assert_eq!(count_kind(&seen, NotificationType::NodeNew), 0);
    assert_eq!(count_kind(&seen, NotificationType::NodeAdded), 4);
    let naming_requests = sim
        .delivered(SWITCH)
        .iter()
        .filter(|d| d.first() == Some(&COMMAND_CLASS_MANUFACTURER_SPECIFIC))
        .count();
    assert_eq!(naming_requests, 0);
    assert_eq!(second.node_info(SWITCH).unwrap().manufacturer_name, "Aeotec");
    assert!(second.node_info(SWITCH).unwrap().is_complete());

    let _ = std::fs::remove_dir_all(&dir);
}
