//! Session lifecycle against emulated modules.

use nim_core::{Command, DeviceEvent, Family, NimError, ParamKey, ParamUpdate, ParamValue};
use nim_session::{ConnectRequest, ManagerConfig, Observer, SessionManager, SimulatedBench};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

fn fast_config() -> ManagerConfig {
    let mut config = ManagerConfig::default();
    config.session.drain_ms = 1;
    config.session.command_timeout_ms = 500;
    config.session.shutdown_grace_ms = 200;
    config.mhv4.poll_interval_ms = 20;
    config
}

fn bench_manager(bench: &Arc<SimulatedBench>) -> Arc<SessionManager> {
    SessionManager::new(fast_config(), bench.clone())
}

fn observer() -> (Observer, mpsc::UnboundedReceiver<DeviceEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Observer::new(tx), rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> Vec<DeviceEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

async fn wait_for_disconnect(rx: &mut mpsc::UnboundedReceiver<DeviceEvent>, within: Duration) -> String {
    let deadline = tokio::time::sleep(within);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            () = &mut deadline => panic!("no device_disconnected within {within:?}"),
            event = rx.recv() => match event {
                Some(DeviceEvent::DeviceDisconnected { device_id }) => return device_id,
                Some(_) => {}
                None => panic!("observer channel closed"),
            },
        }
    }
}

fn threshold(channel: impl Into<serde_json::Value>, value: i64) -> Command {
    Command::new("set_threshold")
        .with("channel", channel)
        .with("value", value)
}

#[tokio::test]
async fn thresholds_are_cached_and_rejected_values_never_reach_the_wire() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    let session = manager
        .connect(ConnectRequest::new("SIM-MSCF16-1").family(Family::Mscf16))
        .await
        .unwrap();
    let wire = bench.control("SIM-MSCF16-1").unwrap().wire_log();

    for (channel, value) in [(1u8, 0i64), (8, 128), (16, 255)] {
        manager
            .execute(session.device_id(), &threshold(channel, value))
            .await
            .unwrap();
        let values = session.snapshot().values;
        assert!(values.contains(&ParamUpdate::new(ParamKey::channel("threshold", channel), value)));
    }

    let before = wire.write_count();
    for value in [256, -1, 300] {
        let err = manager
            .execute(session.device_id(), &threshold(5, value))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "value out of range 0-255");
    }
    assert_eq!(wire.write_count(), before);

    let bad_channel = manager
        .execute(session.device_id(), &threshold(18, 10))
        .await
        .unwrap_err();
    assert!(matches!(bad_channel, NimError::Validation(_)));
    assert_eq!(wire.write_count(), before);
}

#[tokio::test]
async fn common_threshold_updates_every_channel() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    let session = manager.connect(ConnectRequest::new("SIM-MSCF16-1")).await.unwrap();

    manager
        .execute("SIM-MSCF16-1", &threshold("all", 77))
        .await
        .unwrap();

    let values = session.snapshot().values;
    for channel in 1..=16u8 {
        assert!(values.contains(&ParamUpdate::new(ParamKey::channel("threshold", channel), 77i64)));
    }
    assert!(values.contains(&ParamUpdate::new(ParamKey::global("threshold_common"), 77i64)));

    // writes land in the remote-control memory of the module
    manager
        .execute("SIM-MSCF16-1", &Command::new("display_setup"))
        .await
        .unwrap();
    let values = session.snapshot().values;
    assert!(values.contains(&ParamUpdate::new(ParamKey::channel("rc_threshold", 9), 77i64)));
    assert!(values.contains(&ParamUpdate::new(ParamKey::global("rc_threshold_common"), 77i64)));
    // the panel memory was not written, so the plain keys now show its values
    assert!(values.contains(&ParamUpdate::new(ParamKey::channel("threshold", 9), 128i64)));
    assert!(values.contains(&ParamUpdate::new(ParamKey::global("threshold_common"), 128i64)));
}

#[tokio::test]
async fn concurrent_commands_never_interleave_on_the_wire() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    manager.connect(ConnectRequest::new("SIM-MSCF16-1")).await.unwrap();
    let control = bench.control("SIM-MSCF16-1").unwrap();
    control.set_delay(Duration::from_millis(3));
    let wire = control.wire_log();
    wire.clear();

    let mut tasks = Vec::new();
    for i in 0..8i64 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move {
            let command = if i % 2 == 0 {
                Command::new("copy_rc_to_panel")
            } else {
                threshold(i, i * 10)
            };
            manager.execute("SIM-MSCF16-1", &command).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert!(wire.is_strictly_alternating());
    let writes = wire.writes();
    assert_eq!(writes.len(), 4 * 2 + 4);
    // every copy is directly followed by its own re-read
    for (i, frame) in writes.iter().enumerate() {
        if frame.starts_with("CPY") {
            assert_eq!(writes[i + 1], "DS\r");
        }
    }
}

#[tokio::test]
async fn double_connect_is_rejected_and_leaves_the_first_session_alone() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    let first = manager.connect(ConnectRequest::new("SIM-MSCF16-1")).await.unwrap();

    let same_id = manager.connect(ConnectRequest::new("SIM-MSCF16-1")).await.unwrap_err();
    assert_eq!(same_id, NimError::AlreadyConnected("SIM-MSCF16-1".into()));

    let same_port = manager
        .connect(ConnectRequest::new("SIM-MSCF16-1").device_id("shaper"))
        .await
        .unwrap_err();
    assert!(matches!(same_port, NimError::AlreadyConnected(_)));

    assert_eq!(manager.list_sessions().len(), 1);
    let outcome = manager
        .execute(first.device_id(), &Command::new("get_version"))
        .await
        .unwrap();
    assert!(outcome
        .updates
        .contains(&ParamUpdate::new(ParamKey::global("version"), "5.3")));
}

#[tokio::test]
async fn second_disconnect_is_not_found() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    manager.connect(ConnectRequest::new("SIM-MSCF16-1")).await.unwrap();

    manager.disconnect("SIM-MSCF16-1").await.unwrap();
    assert_eq!(
        manager.disconnect("SIM-MSCF16-1").await.unwrap_err(),
        NimError::NotFound("SIM-MSCF16-1".into())
    );
    assert!(manager.list_sessions().is_empty());
    assert!(matches!(
        manager.execute("SIM-MSCF16-1", &Command::new("get_version")).await,
        Err(NimError::NotFound(_))
    ));
}

#[tokio::test]
async fn connect_validates_before_opening() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);

    let cases = [
        ConnectRequest::new("  "),
        ConnectRequest {
            family: Some("mcp-16".into()),
            ..ConnectRequest::new("SIM-MSCF16-1")
        },
        ConnectRequest {
            baud_rate: Some(1234),
            ..ConnectRequest::new("SIM-MSCF16-1")
        },
        ConnectRequest {
            timeout_ms: Some(0),
            ..ConnectRequest::new("SIM-MSCF16-1")
        },
    ];
    for request in cases {
        let err = manager.connect(request).await.unwrap_err();
        assert!(matches!(err, NimError::Validation(_)), "{err:?}");
    }
    assert!(bench.control("SIM-MSCF16-1").is_none());

    let missing = manager.connect(ConnectRequest::new("COM42")).await.unwrap_err();
    assert!(missing.is_fatal());
    // a failed connect frees the identifier again
    assert!(manager.connect(ConnectRequest::new("SIM-MSCF16-1")).await.is_ok());
}

#[tokio::test]
async fn com3_walkthrough() {
    let bench = Arc::new(SimulatedBench::with_ports(vec![("COM3".into(), Family::Mscf16)]));
    let manager = bench_manager(&bench);
    let (watcher, mut events) = observer();
    manager.attach(watcher);

    let session = manager
        .connect(ConnectRequest::new("COM3").family(Family::Mscf16))
        .await
        .unwrap();
    assert_eq!(session.device_id(), "COM3");
    let replayed = drain(&mut events);
    assert!(replayed.iter().any(|e| matches!(
        e,
        DeviceEvent::InitialValues { device_id, update }
            if device_id == "COM3" && update.key == ParamKey::global("version")
    )));

    let err = manager.execute("COM3", &threshold(5, 300)).await.unwrap_err();
    assert_eq!(err.to_string(), "value out of range 0-255");
    assert!(drain(&mut events).is_empty());

    manager.execute("COM3", &threshold(5, 200)).await.unwrap();
    let published = drain(&mut events);
    assert_eq!(
        published,
        vec![DeviceEvent::InitialValues {
            device_id: "COM3".into(),
            update: ParamUpdate::new(ParamKey::channel("threshold", 5), 200i64),
        }]
    );

    manager.disconnect("COM3").await.unwrap();
    assert_eq!(
        drain(&mut events),
        vec![DeviceEvent::DeviceDisconnected {
            device_id: "COM3".into()
        }]
    );
}

fn gain(group: i64, value: i64) -> Command {
    Command::new("set_gain").with("group", group).with("value", value)
}

#[tokio::test]
async fn silent_device_times_out_without_touching_the_cache() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    let (watcher, mut events) = observer();
    manager.attach(watcher);
    let session = manager.connect(ConnectRequest::new("SIM-MSCF16-1")).await.unwrap();
    drain(&mut events);
    let before = session.snapshot().values;

    let control = bench.control("SIM-MSCF16-1").unwrap();
    control.set_silent(true);
    let err = manager.execute("SIM-MSCF16-1", &gain(2, 7)).await.unwrap_err();
    assert!(matches!(err, NimError::Timeout(_)), "got {err:?}");

    assert_eq!(session.snapshot().values, before);
    assert!(drain(&mut events).is_empty());
    assert!(manager.get_session("SIM-MSCF16-1").is_ok());

    // the session keeps working once the module answers again
    control.set_silent(false);
    manager.execute("SIM-MSCF16-1", &gain(2, 7)).await.unwrap();
    assert!(session
        .snapshot()
        .values
        .contains(&ParamUpdate::new(ParamKey::group("gain", 2), 7i64)));
}

#[tokio::test]
async fn garbled_reply_is_a_protocol_error_and_changes_nothing() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    let (watcher, mut events) = observer();
    manager.attach(watcher);
    let session = manager.connect(ConnectRequest::new("SIM-MSCF16-1")).await.unwrap();
    drain(&mut events);
    let before = session.snapshot().values;

    let control = bench.control("SIM-MSCF16-1").unwrap();
    control.set_garbled(true);
    let err = manager.execute("SIM-MSCF16-1", &gain(3, 9)).await.unwrap_err();
    assert!(matches!(err, NimError::Protocol(_)), "got {err:?}");
    assert!(!err.is_fatal());

    assert_eq!(session.snapshot().values, before);
    assert!(drain(&mut events).is_empty());
    assert!(manager.get_session("SIM-MSCF16-1").is_ok());
    assert_eq!(manager.list_sessions().len(), 1);
}

#[tokio::test]
async fn late_observer_is_resynchronized_from_cache() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    let session = manager.connect(ConnectRequest::new("SIM-MSCF16-1")).await.unwrap();
    let wire = bench.control("SIM-MSCF16-1").unwrap().wire_log();
    let writes = wire.write_count();

    let (watcher, mut events) = observer();
    manager.subscribe(watcher.clone(), "SIM-MSCF16-1").unwrap();
    let replayed = drain(&mut events);
    assert_eq!(replayed.len(), session.snapshot().values.len());
    assert_eq!(wire.write_count(), writes);

    manager.unsubscribe(watcher.id, "SIM-MSCF16-1").unwrap();
    manager.execute("SIM-MSCF16-1", &threshold(1, 1)).await.unwrap();
    assert!(drain(&mut events).is_empty());

    assert!(matches!(
        manager.subscribe(watcher, "nope"),
        Err(NimError::NotFound(_))
    ));
}

#[tokio::test]
async fn telemetry_publishes_readings() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    let (watcher, mut events) = observer();
    manager.attach(watcher);
    manager
        .connect(ConnectRequest::new("SIM-MHV4-1").family(Family::Mhv4))
        .await
        .unwrap();

    let readings = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Some(DeviceEvent::ReadingsUpdate { readings, .. }) = events.recv().await {
                return readings;
            }
        }
    })
    .await
    .unwrap();
    assert!(readings.contains_key("voltage_0"));
    assert!(readings.contains_key("current_3"));
    assert!(manager.list_sessions()[0].telemetry);

    manager.disconnect("SIM-MHV4-1").await.unwrap();
}

#[tokio::test]
async fn disconnect_during_a_telemetry_tick_finishes_within_grace() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    let (watcher, mut events) = observer();
    manager.attach(watcher);
    manager
        .connect(ConnectRequest::new("SIM-MHV4-1").family(Family::Mhv4))
        .await
        .unwrap();
    // each exchange now takes longer than the grace period
    bench
        .control("SIM-MHV4-1")
        .unwrap()
        .set_delay(Duration::from_millis(400));
    tokio::time::sleep(Duration::from_millis(60)).await;

    let started = Instant::now();
    manager.disconnect("SIM-MHV4-1").await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(1500));

    assert_eq!(
        wait_for_disconnect(&mut events, Duration::from_millis(100)).await,
        "SIM-MHV4-1"
    );
    tokio::time::sleep(Duration::from_millis(100)).await;
    let after: Vec<_> = drain(&mut events)
        .into_iter()
        .filter(|e| matches!(e, DeviceEvent::DeviceDisconnected { .. }))
        .collect();
    assert!(after.is_empty());
}

#[tokio::test]
async fn unplugged_device_is_torn_down_by_telemetry() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    let (watcher, mut events) = observer();
    manager.attach(watcher);
    manager
        .connect(ConnectRequest::new("SIM-MHV4-1").family(Family::Mhv4))
        .await
        .unwrap();

    bench.control("SIM-MHV4-1").unwrap().unplug();

    assert_eq!(
        wait_for_disconnect(&mut events, Duration::from_secs(2)).await,
        "SIM-MHV4-1"
    );
    assert!(matches!(
        manager.get_session("SIM-MHV4-1"),
        Err(NimError::NotFound(_))
    ));
    // the endpoint is free again
    assert!(manager
        .connect(ConnectRequest::new("SIM-MHV4-1").family(Family::Mhv4))
        .await
        .is_ok());
}

#[tokio::test]
async fn unplugged_device_is_torn_down_by_a_command() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    let (watcher, mut events) = observer();
    manager.attach(watcher);
    manager.connect(ConnectRequest::new("SIM-MSCF16-1")).await.unwrap();

    bench.control("SIM-MSCF16-1").unwrap().unplug();
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = manager
        .execute("SIM-MSCF16-1", &Command::new("get_version"))
        .await
        .unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(
        wait_for_disconnect(&mut events, Duration::from_millis(200)).await,
        "SIM-MSCF16-1"
    );
    assert!(manager.list_sessions().is_empty());
}

#[tokio::test]
async fn teardown_closes_everything() {
    let bench = Arc::new(SimulatedBench::new(2, 1));
    let manager = bench_manager(&bench);
    let (watcher, mut events) = observer();
    manager.attach(watcher);
    for port in ["SIM-MSCF16-1", "SIM-MSCF16-2"] {
        manager.connect(ConnectRequest::new(port)).await.unwrap();
    }
    manager
        .connect(ConnectRequest::new("SIM-MHV4-1").family(Family::Mhv4))
        .await
        .unwrap();
    assert_eq!(manager.list_sessions().len(), 3);

    manager.teardown().await;

    assert!(manager.list_sessions().is_empty());
    let mut gone: Vec<String> = drain(&mut events)
        .into_iter()
        .filter_map(|e| match e {
            DeviceEvent::DeviceDisconnected { device_id } => Some(device_id),
            _ => None,
        })
        .collect();
    gone.sort();
    assert_eq!(gone, vec!["SIM-MHV4-1", "SIM-MSCF16-1", "SIM-MSCF16-2"]);
}

#[tokio::test]
async fn cached_values_are_typed() {
    let bench = Arc::new(SimulatedBench::default());
    let manager = bench_manager(&bench);
    let session = manager
        .connect(ConnectRequest::new("SIM-MHV4-1").family(Family::Mhv4))
        .await
        .unwrap();
    manager
        .execute(
            "SIM-MHV4-1",
            &Command::new("set_voltage").with("channel", 2).with("voltage", 120.5),
        )
        .await
        .unwrap();
    let values = session.snapshot().values;
    let preset = values
        .iter()
        .find(|u| u.key == ParamKey::channel("voltage_preset", 2))
        .unwrap();
    assert_eq!(preset.value, ParamValue::Float(120.5));
    manager.teardown().await;
}
