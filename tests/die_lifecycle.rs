use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use chrono::{TimeZone, Utc};
use futures_util::StreamExt;

use pixels_dice::core::bluetooth::MockTransport;
use pixels_dice::core::bluetooth::types::{ManufacturerData, RawAdvertisement};
use pixels_dice::core::protocol::{
    BatteryLevel, BatteryState, DesignAndColor, IAmADie, Message, MessageKind, NotifyUser,
    OkCancel, RollState, RollStateKind, Telemetry, encode,
};
use pixels_dice::{
    DiceManager, Die, DieEvent, EventKind, Field, FieldSet, LinkConfig, LinkState, PixelsError,
    ScanResult, TransportError,
};

const ADDRESS: &str = "E4:7A:2C:10:9F:01";

fn scan_result() -> ScanResult {
    ScanResult {
        address: ADDRESS.to_string(),
        name: "Francis".to_string(),
        rssi: Some(-60),
        led_count: 20,
        design_and_color: DesignAndColor::OnyxBlack,
        roll_state: RollStateKind::OnFace,
        roll_face: 9,
        batt_charging: false,
        batt_level: 100,
        pixel_id: 0x1234_5678,
        build_timestamp: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
    }
}

fn setup(config: LinkConfig) -> (MockTransport, DiceManager, Die) {
    let mock = MockTransport::new();
    mock.add_die(&scan_result());
    let manager = DiceManager::new(Arc::new(mock.clone()), config);
    let die = manager.hydrate(&scan_result());
    (mock, manager, die)
}

fn record(die: &Die, kind: EventKind) -> Arc<Mutex<Vec<DieEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    die.on(kind, move |_, event| {
        sink.lock().unwrap().push(event.clone());
        Ok(())
    });
    events
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

fn roll(state: RollStateKind, face: u8) -> Vec<u8> {
    encode(&Message::RollState(RollState { state, face }))
}

#[tokio::test]
async fn test_scan_yields_dice_only() {
    let mock = MockTransport::new();
    mock.add_advertisement(RawAdvertisement {
        address: "00:11:22:33:44:55".to_string(),
        local_name: Some("Headphones".to_string()),
        rssi: Some(-40),
        manufacturer_data: Some(ManufacturerData {
            company_id: 0x004c,
            data: vec![1, 2, 3],
        }),
        services: vec![pixels_dice::core::bluetooth::UUID_PIXELS_SERVICE],
        service_data: Default::default(),
    });
    mock.add_die(&scan_result());
    let manager = DiceManager::new(Arc::new(mock), LinkConfig::default());

    let mut scan = manager.scan_for_dice().await.unwrap();
    let first = scan.next().await.unwrap();
    assert_eq!(first, scan_result());

    let more = tokio::time::timeout(Duration::from_millis(50), scan.next()).await;
    assert!(more.is_err(), "scan must stay open without yielding non-dice");
}

#[tokio::test]
async fn test_scan_drops_weak_signals() {
    let mock = MockTransport::new();
    mock.add_die(&scan_result());
    let config = LinkConfig {
        min_rssi: Some(-50),
        ..LinkConfig::default()
    };
    let manager = DiceManager::new(Arc::new(mock), config);

    let mut scan = manager.scan_for_dice().await.unwrap();
    let next = tokio::time::timeout(Duration::from_millis(50), scan.next()).await;
    assert!(next.is_err());
}

#[tokio::test]
async fn test_hydrate_is_idempotent() {
    let (_mock, manager, die) = setup(LinkConfig::default());
    let mut newer = scan_result();
    newer.batt_level = 80;

    let again = manager.hydrate(&newer);

    assert!(die.same_die(&again));
    assert_eq!(manager.known_dice().len(), 1);
    assert_eq!(die.batt_level(), Some(80));
    assert_eq!(die.name().as_deref(), Some("Francis"));
    assert_eq!(die.link_state(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_reconnect_after_two_failures() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let connected = record(&die, EventKind::Connected);
    mock.fail_next_connects(ADDRESS, 2);

    die.connect_with_reconnect().await.unwrap();

    assert!(die.is_connected());
    assert_eq!(mock.connect_attempts(ADDRESS), 3);
    assert_eq!(mock.subscription_count(ADDRESS), 1);
    assert_eq!(connected.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_connect_gives_up_after_retry_bound() {
    let config = LinkConfig::default().with_connect_retries(3, Duration::from_millis(1));
    let (mock, _manager, die) = setup(config);
    mock.fail_next_connects(ADDRESS, 10);

    let err = die.connect_with_reconnect().await.unwrap_err();

    assert!(matches!(
        err,
        PixelsError::Transport(TransportError::ConnectFailed { .. })
    ));
    assert_eq!(mock.connect_attempts(ADDRESS), 3);
    assert_eq!(die.link_state(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_failed_discovery_leaves_nothing_open() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    mock.remove_service(ADDRESS);

    let err = die.connect().await.unwrap_err();

    assert!(matches!(
        err,
        PixelsError::Transport(TransportError::ServiceNotFound(_))
    ));
    assert_eq!(die.link_state(), LinkState::Disconnected);
    assert!(!mock.is_connected(ADDRESS));
    assert_eq!(mock.subscription_count(ADDRESS), 0);
}

#[tokio::test]
async fn test_commands_need_a_connection() {
    let (_mock, _manager, die) = setup(LinkConfig::default());
    let err = die.get_rssi().await.unwrap_err();
    assert!(matches!(err, PixelsError::NotConnected));
}

#[tokio::test]
async fn test_rssi_timeout_leaves_cache_untouched() {
    let config = LinkConfig::default().with_command_timeout(Duration::from_millis(50));
    let (_mock, _manager, die) = setup(config);
    die.connect().await.unwrap();

    let err = die.get_rssi().await.unwrap_err();

    assert!(matches!(
        err,
        PixelsError::Timeout {
            kind: MessageKind::Rssi
        }
    ));
    assert_eq!(die.rssi(), Some(-60));
    assert_eq!(die.pending_commands(), 0);
    assert!(die.is_connected());
}

#[tokio::test]
async fn test_rssi_response_updates_cache() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    mock.respond(ADDRESS, MessageKind::RequestRssi, &Message::Rssi(-48));
    let changes = record(&die, EventKind::DataChanged);
    die.connect().await.unwrap();

    assert_eq!(die.get_rssi().await.unwrap(), -48);
    assert_eq!(die.rssi(), Some(-48));
    assert_eq!(
        changes.lock().unwrap().as_slice(),
        &[DieEvent::DataChanged(FieldSet::from([Field::Rssi]))]
    );
}

#[tokio::test]
async fn test_disconnect_fails_pending_commands() {
    let config = LinkConfig::default().with_command_timeout(Duration::from_secs(30));
    let (mock, _manager, die) = setup(config);
    die.connect().await.unwrap();

    let roll = tokio::spawn({
        let die = die.clone();
        async move { die.get_roll_state().await }
    });
    let battery = tokio::spawn({
        let die = die.clone();
        async move { die.get_battery_level().await }
    });
    wait_until(|| die.pending_commands() == 2).await;

    die.disconnect().await.unwrap();

    assert!(matches!(roll.await.unwrap(), Err(PixelsError::Disconnected)));
    assert!(matches!(battery.await.unwrap(), Err(PixelsError::Disconnected)));
    assert_eq!(die.link_state(), LinkState::Disconnected);
    assert_eq!(die.pending_commands(), 0);
    assert!(!mock.is_connected(ADDRESS));
    assert!(!mock.is_subscribed(ADDRESS));
}

#[tokio::test]
async fn test_roll_notifications_update_cache_before_handlers() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let seen_in_handler = Arc::new(Mutex::new(Vec::new()));
    let sink = seen_in_handler.clone();
    die.on(EventKind::DataChanged, move |die, event| {
        sink.lock().unwrap().push((event.clone(), die.roll_face()));
        Ok(())
    });
    let rolled = record(&die, EventKind::Rolled);
    die.connect().await.unwrap();

    assert!(mock.notify(ADDRESS, roll(RollStateKind::Rolling, 0)));
    assert!(mock.notify(ADDRESS, roll(RollStateKind::OnFace, 3)));
    wait_until(|| rolled.lock().unwrap().len() == 1).await;

    let seen = seen_in_handler.lock().unwrap();
    let fields = FieldSet::from([Field::RollState, Field::RollFace]);
    assert_eq!(
        seen.as_slice(),
        &[
            (DieEvent::DataChanged(fields.clone()), Some(0)),
            (DieEvent::DataChanged(fields), Some(3)),
        ]
    );
    assert_eq!(rolled.lock().unwrap()[0], DieEvent::Rolled { face: 3 });
    assert_eq!(die.roll_state(), Some(RollStateKind::OnFace));
}

#[tokio::test]
async fn test_failing_handlers_do_not_stop_dispatch() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    die.on(EventKind::BatteryLevel, |_, _| Err(anyhow!("boom")));
    die.on(EventKind::BatteryLevel, |_, _| panic!("handler panicked"));
    let battery = record(&die, EventKind::BatteryLevel);
    die.connect().await.unwrap();

    let level = BatteryLevel {
        level: 42,
        state: BatteryState::Charging,
    };
    mock.notify(ADDRESS, encode(&Message::BatteryLevel(level)));
    wait_until(|| battery.lock().unwrap().len() == 1).await;

    assert_eq!(battery.lock().unwrap()[0], DieEvent::BatteryLevel(level));
    assert_eq!(die.batt_level(), Some(42));
    assert_eq!(die.batt_state(), Some(BatteryState::Charging));
    assert!(die.is_connected());
}

#[tokio::test]
async fn test_unknown_frames_are_dropped() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let changes = record(&die, EventKind::DataChanged);
    die.connect().await.unwrap();

    mock.notify(ADDRESS, vec![0xee, 1, 2, 3]);
    mock.notify(ADDRESS, vec![MessageKind::RollState.id()]);
    mock.notify(ADDRESS, roll(RollStateKind::Handling, 5));
    wait_until(|| changes.lock().unwrap().len() == 1).await;

    assert_eq!(die.roll_face(), Some(5));
    assert!(die.is_connected());
}

#[tokio::test]
async fn test_who_are_you_refreshes_cache() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let iam = IAmADie {
        led_count: 6,
        design_and_color: DesignAndColor::AuroraSky,
        data_set_hash: 0xdead_beef,
        pixel_id: 0x0a0b_0c0d,
        available_flash: 1024,
        build_timestamp: Utc.timestamp_opt(1_710_000_000, 0).unwrap(),
        roll_state: RollStateKind::Crooked,
        roll_face: 2,
        batt_level: 55,
        batt_state: BatteryState::Ok,
    };
    mock.respond(ADDRESS, MessageKind::WhoAreYou, &Message::IAmADie(iam.clone()));
    die.connect().await.unwrap();

    let reply = die.who_are_you().await.unwrap();

    assert_eq!(reply, iam);
    assert_eq!(die.led_count(), Some(6));
    assert_eq!(die.design_and_color(), Some(DesignAndColor::AuroraSky));
    assert_eq!(die.pixel_id(), Some(0x0a0b_0c0d));
    assert_eq!(die.roll_state(), Some(RollStateKind::Crooked));
    assert_eq!(die.batt_level(), Some(55));
    assert_eq!(die.name().as_deref(), Some("Francis"));
}

#[tokio::test]
async fn test_set_name_commits_after_ack() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    mock.respond(ADDRESS, MessageKind::SetName, &Message::SetNameAck);
    die.connect().await.unwrap();

    die.set_name("Bob").await.unwrap();

    assert_eq!(die.name().as_deref(), Some("Bob"));
    assert_eq!(
        mock.writes(ADDRESS),
        vec![encode(&Message::SetName("Bob".to_string()))]
    );
}

#[tokio::test]
async fn test_same_kind_requests_are_queued() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let state = RollState {
        state: RollStateKind::OnFace,
        face: 11,
    };
    mock.respond(ADDRESS, MessageKind::RequestRollState, &Message::RollState(state));
    die.connect().await.unwrap();

    let (first, second) = tokio::join!(die.get_roll_state(), die.get_roll_state());

    assert_eq!(first.unwrap(), state);
    assert_eq!(second.unwrap(), state);
    assert_eq!(mock.writes(ADDRESS).len(), 2);
}

#[tokio::test]
async fn test_cancelled_request_is_deregistered() {
    let config = LinkConfig::default().with_command_timeout(Duration::from_secs(30));
    let (_mock, _manager, die) = setup(config);
    die.connect().await.unwrap();

    let request = tokio::spawn({
        let die = die.clone();
        async move { die.get_temperature().await }
    });
    wait_until(|| die.pending_commands() == 1).await;

    request.abort();

    wait_until(|| die.pending_commands() == 0).await;
    assert!(die.is_connected());
}

#[tokio::test]
async fn test_advertisements_ignored_while_connected() {
    let (_mock, manager, die) = setup(LinkConfig::default());
    die.connect().await.unwrap();
    let mut newer = scan_result();
    newer.batt_level = 10;

    manager.hydrate(&newer);

    assert_eq!(die.batt_level(), Some(100));
}

#[tokio::test]
async fn test_link_loss_reconnects() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let connected = record(&die, EventKind::Connected);
    let disconnected = record(&die, EventKind::Disconnected);
    die.connect_with_reconnect().await.unwrap();

    mock.drop_link(ADDRESS);

    wait_until(|| connected.lock().unwrap().len() == 2).await;
    assert_eq!(disconnected.lock().unwrap().len(), 1);
    assert!(die.is_connected());
    assert_eq!(mock.subscription_count(ADDRESS), 2);

    mock.notify(ADDRESS, roll(RollStateKind::Rolling, 1));
    wait_until(|| die.roll_state() == Some(RollStateKind::Rolling)).await;
}

#[tokio::test]
async fn test_link_loss_without_reconnect() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let disconnected = record(&die, EventKind::Disconnected);
    die.connect().await.unwrap();

    mock.drop_link(ADDRESS);

    wait_until(|| disconnected.lock().unwrap().len() == 1).await;
    assert_eq!(die.link_state(), LinkState::Disconnected);
    assert_eq!(mock.connect_attempts(ADDRESS), 1);
}

#[tokio::test]
async fn test_reconnect_failure_is_reported() {
    let config = LinkConfig::default().with_connect_retries(2, Duration::ZERO);
    let (mock, _manager, die) = setup(config);
    let failed = record(&die, EventKind::ReconnectFailed);
    die.connect_with_reconnect().await.unwrap();

    mock.fail_next_connects(ADDRESS, 5);
    mock.drop_link(ADDRESS);

    wait_until(|| failed.lock().unwrap().len() == 1).await;
    assert_eq!(die.link_state(), LinkState::Disconnected);
    assert_eq!(mock.connect_attempts(ADDRESS), 3);
}

#[tokio::test]
async fn test_explicit_disconnect_is_not_a_link_loss() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let disconnected = record(&die, EventKind::Disconnected);
    die.connect_with_reconnect().await.unwrap();

    die.disconnect().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(disconnected.lock().unwrap().is_empty());
    assert_eq!(mock.connect_attempts(ADDRESS), 1);
    assert_eq!(die.link_state(), LinkState::Disconnected);
}

#[tokio::test]
async fn test_newer_notification_wins_over_earlier_response() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let older = RollState {
        state: RollStateKind::Rolling,
        face: 1,
    };
    mock.respond(ADDRESS, MessageKind::RequestRollState, &Message::RollState(older));
    mock.respond_raw(ADDRESS, MessageKind::RequestRollState, roll(RollStateKind::OnFace, 5));
    let rolled = record(&die, EventKind::Rolled);
    die.connect().await.unwrap();

    assert_eq!(die.get_roll_state().await.unwrap(), older);

    wait_until(|| die.roll_state() == Some(RollStateKind::OnFace)).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(die.roll_state(), Some(RollStateKind::OnFace));
    assert_eq!(die.roll_face(), Some(5));
    assert_eq!(rolled.lock().unwrap().as_slice(), &[DieEvent::Rolled { face: 5 }]);
}

#[tokio::test]
async fn test_response_is_cached_before_the_caller_resumes() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let level = BatteryLevel {
        level: 64,
        state: BatteryState::Low,
    };
    mock.respond(ADDRESS, MessageKind::RequestBatteryLevel, &Message::BatteryLevel(level));
    die.connect().await.unwrap();

    assert_eq!(die.get_battery_level().await.unwrap(), level);
    assert_eq!(die.batt_level(), Some(64));
    assert_eq!(die.batt_state(), Some(BatteryState::Low));
}

#[tokio::test]
async fn test_notify_user_prompt_and_answer() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let prompts = record(&die, EventKind::NotifyUser);
    die.connect().await.unwrap();

    let prompt = NotifyUser {
        timeout: 30,
        ok: true,
        cancel: true,
        text: "Place face 20 up".to_string(),
    };
    assert!(mock.notify(ADDRESS, encode(&Message::NotifyUser(prompt.clone()))));
    wait_until(|| prompts.lock().unwrap().len() == 1).await;
    assert_eq!(prompts.lock().unwrap()[0], DieEvent::NotifyUser(prompt));

    die.respond_to_notify_user(OkCancel::Ok).await.unwrap();

    assert_eq!(mock.writes(ADDRESS).last(), Some(&vec![40, 1]));
}

#[tokio::test]
async fn test_telemetry_updates_battery_and_rssi_at_once() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let changes = record(&die, EventKind::DataChanged);
    die.connect().await.unwrap();

    let telemetry = Telemetry {
        battery_percent: 73,
        battery_state: BatteryState::Charging,
        voltage: 200,
        v_coil: 240,
        rssi: -55,
        bt_channel: 12,
        mcu_temp: 2_950,
        battery_temp: 2_710,
        internal_charge_state: 1,
        force_disable_charging_state: 0,
    };
    mock.notify(ADDRESS, encode(&Message::Telemetry(telemetry)));
    wait_until(|| changes.lock().unwrap().len() == 1).await;

    assert_eq!(
        changes.lock().unwrap()[0],
        DieEvent::DataChanged(FieldSet::from([Field::BattLevel, Field::BattState, Field::Rssi]))
    );
    assert_eq!(die.batt_level(), Some(73));
    assert_eq!(die.batt_state(), Some(BatteryState::Charging));
    assert_eq!(die.rssi(), Some(-55));
}

#[tokio::test]
async fn test_debug_log_is_forwarded_without_touching_cache() {
    let (mock, _manager, die) = setup(LinkConfig::default());
    let logs = record(&die, EventKind::DebugLog);
    let changes = record(&die, EventKind::DataChanged);
    die.connect().await.unwrap();
    let before = die.attributes();

    mock.notify(ADDRESS, encode(&Message::DebugLog("imu ok".to_string())));
    wait_until(|| logs.lock().unwrap().len() == 1).await;

    assert_eq!(logs.lock().unwrap()[0], DieEvent::DebugLog("imu ok".to_string()));
    assert!(changes.lock().unwrap().is_empty());
    assert_eq!(die.attributes(), before);
}
