mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{manager, wait_for_state, MockConnector, Reply};
use firstmakers_lib::commands;
use firstmakers_lib::config::{RequestPolicy, SensorSettings};
use firstmakers_lib::device::{ConnectionState, DeviceError, TransportKind};
use firstmakers_lib::sensor::{encode_request, AnalogReadMode, CommandCode, SecondaryQuantity};
use firstmakers_lib::ReadingService;

type MockService = ReadingService<MockConnector, MockConnector>;

struct Rig {
    serial: MockConnector,
    hid: MockConnector,
    service: Arc<MockService>,
}

fn rig(settings: SensorSettings) -> Rig {
    let serial = MockConnector::new(TransportKind::Serial);
    let hid = MockConnector::new(TransportKind::Hid);
    let service = ReadingService::new(manager(&serial), manager(&hid), settings);
    Rig {
        serial,
        hid,
        service: Arc::new(service),
    }
}

#[tokio::test]
async fn environment_reading_round_trip() {
    let rig = rig(SensorSettings::default());
    rig.hid.push_environment(0x81, 0x0040, 0x0064);

    let reading = rig.service.request_environment_reading().await.unwrap();

    assert_eq!(reading.celsius, 4.0);
    assert!((reading.lux().unwrap() - 122.4).abs() < 1e-9);
    assert_eq!(rig.hid.written(), vec![encode_request(CommandCode::TempLight).to_vec()]);
    assert_eq!(rig.service.hid().state(), ConnectionState::Ready);
}

#[tokio::test]
async fn humidity_command_reports_relative_humidity() {
    let rig = rig(SensorSettings::default());
    rig.hid.push_environment(0x86, 400, 50);

    let reading = rig
        .service
        .request_environment_reading_with(CommandCode::Humidity)
        .await
        .unwrap();

    assert_eq!(reading.celsius, 25.0);
    assert_eq!(reading.quantity, Some(SecondaryQuantity::Humidity));
    assert!((reading.humidity().unwrap() - 60.0).abs() < 1e-9);
    assert_eq!(rig.hid.written()[0][0], 0x86);
}

#[tokio::test]
async fn read_failure_retires_the_handle_before_returning() {
    let rig = rig(SensorSettings::default());
    rig.hid.push_environment(0x81, 1, 1);
    let first = rig.service.hid().acquire().await.unwrap();
    rig.service.request_environment_reading().await.unwrap();

    rig.hid.push_reply(Reply::Fail("device unplugged"));
    let err = rig.service.request_environment_reading().await.unwrap_err();

    assert!(matches!(err, DeviceError::Transport(_)));
    assert!(!first.is_open());
    assert!(rig.service.hid().current().is_none());
    assert_ne!(rig.service.hid().state(), ConnectionState::Ready);

    // The retired handle ignores anything else it reports.
    assert!(!rig.service.hid().on_disconnect(first.id()));

    rig.hid.push_environment(0x81, 0x0040, 0x0064);
    let reading = rig.service.request_environment_reading().await.unwrap();
    assert_eq!(reading.celsius, 4.0);
    assert_eq!(rig.hid.open_calls(), 2);
    assert_ne!(rig.service.hid().current().unwrap().id, first.id());
}

#[tokio::test]
async fn short_response_is_a_protocol_error() {
    let rig = rig(SensorSettings::default());
    rig.hid.push_reply(Reply::Frame(vec![0x81, 0x40, 0x00, 0x64]));

    let err = rig.service.request_environment_reading().await.unwrap_err();

    assert!(matches!(err, DeviceError::Protocol(_)));
    assert!(rig.service.hid().current().is_none());
}

#[tokio::test]
async fn connect_errors_surface_unchanged() {
    let rig = rig(SensorSettings::default());
    rig.hid.set_endpoints(Vec::new());
    rig.serial.set_endpoints(Vec::new());

    let err = rig.service.request_environment_reading().await.unwrap_err();
    assert!(matches!(err, DeviceError::NoDeviceFound(TransportKind::Hid)));
    let err = rig.service.request_analog_frame().await.unwrap_err();
    assert!(matches!(err, DeviceError::NoDeviceFound(TransportKind::Serial)));
    assert!(rig.hid.written().is_empty());
}

#[tokio::test]
async fn cached_analog_frame_returns_immediately() {
    let rig = rig(SensorSettings {
        analog_channels: 4,
        ..SensorSettings::default()
    });
    rig.serial.record_sample(0, 512);
    rig.serial.record_sample(1, 1023);
    rig.serial.record_sample(3, 7);

    let frame = rig.service.request_analog_frame().await.unwrap();

    assert_eq!(frame.samples, vec![512, 1023, 0, 7]);
    assert!(!frame.complete);
}

#[tokio::test]
async fn fresh_analog_frame_waits_for_first_samples() {
    let rig = rig(SensorSettings {
        analog_channels: 2,
        analog_mode: AnalogReadMode::WaitForFresh { timeout_ms: 1_000 },
        ..SensorSettings::default()
    });

    let service = rig.service.clone();
    let request = tokio::spawn(async move { service.request_analog_frame().await });
    tokio::time::sleep(Duration::from_millis(30)).await;
    rig.serial.record_sample(0, 100);
    rig.serial.record_sample(1, 200);

    let frame = request.await.unwrap().unwrap();
    assert_eq!(frame.samples, vec![100, 200]);
    assert!(frame.complete);
}

#[tokio::test]
async fn stale_analog_timeout_keeps_the_handle() {
    let rig = rig(SensorSettings {
        analog_channels: 2,
        analog_mode: AnalogReadMode::WaitForFresh { timeout_ms: 40 },
        ..SensorSettings::default()
    });
    rig.serial.record_sample(0, 100);

    let err = rig.service.request_analog_frame().await.unwrap_err();

    assert!(matches!(err, DeviceError::Protocol(_)));
    assert_eq!(rig.service.serial().state(), ConnectionState::Ready);
}

#[tokio::test]
async fn fail_fast_rejects_a_second_request_in_flight() {
    let rig = rig(SensorSettings {
        request_policy: RequestPolicy::FailFast,
        ..SensorSettings::default()
    });
    rig.hid.set_read_delay(Some(Duration::from_millis(150)));
    rig.hid.push_environment(0x81, 16, 0);

    let service = rig.service.clone();
    let first = tokio::spawn(async move { service.request_environment_reading().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = rig.service.request_environment_reading().await.unwrap_err();
    assert!(matches!(err, DeviceError::Busy(_)));
    assert!(!err.retires_handle());

    let reading = first.await.unwrap().unwrap();
    assert_eq!(reading.celsius, 1.0);
    assert_eq!(rig.hid.written().len(), 1);
    assert_eq!(rig.service.hid().state(), ConnectionState::Ready);
}

#[tokio::test]
async fn queued_requests_run_one_after_another() {
    let rig = rig(SensorSettings::default());
    rig.hid.set_read_delay(Some(Duration::from_millis(20)));
    rig.hid.push_environment(0x81, 16, 0);
    rig.hid.push_environment(0x81, 32, 0);

    let (a, b) = tokio::join!(
        rig.service.request_environment_reading(),
        rig.service.request_environment_reading()
    );

    let mut temperatures = vec![a.unwrap().celsius, b.unwrap().celsius];
    temperatures.sort_by(f64::total_cmp);
    assert_eq!(temperatures, vec![1.0, 2.0]);
    assert_eq!(rig.hid.written().len(), 2);
    assert_eq!(rig.hid.open_calls(), 1);
}

#[tokio::test]
async fn shutdown_closes_both_boards() {
    let rig = rig(SensorSettings::default());
    rig.hid.push_environment(0x81, 1, 1);
    rig.service.request_environment_reading().await.unwrap();
    rig.service.request_analog_frame().await.unwrap();

    rig.service.shutdown().await;

    assert_eq!(rig.service.hid().state(), ConnectionState::Absent);
    assert_eq!(rig.service.serial().state(), ConnectionState::Absent);
    assert_eq!(rig.hid.close_calls(), 1);
    assert_eq!(rig.serial.close_calls(), 1);
}

#[tokio::test]
async fn produce_operations_pass_results_through() {
    let rig = rig(SensorSettings::default());
    rig.hid.push_environment(0x87, 0x0140, 0x0032);
    rig.serial.record_sample(0, 9);

    let reading = commands::produce_environment_reading(&rig.service).await.unwrap();
    assert_eq!(reading.celsius, 20.0);
    let frame = commands::produce_analog_frame(&rig.service).await.unwrap();
    assert_eq!(frame.samples.len(), 6);
    assert_eq!(frame.samples[0], 9);

    rig.hid.push_reply(Reply::Fail("stalled"));
    assert!(commands::produce_environment_reading(&rig.service).await.is_err());
}

#[tokio::test]
async fn endpoint_listing_describes_the_transport() {
    let rig = rig(SensorSettings::default());

    let listing = commands::endpoint_listing(rig.service.hid()).await.unwrap();
    assert_eq!(listing["kind"], "hid");
    assert_eq!(listing["state"], "absent");
    assert!(listing["current"].is_null());
    assert_eq!(listing["endpoints"][0]["id"], "/dev/hidraw3");
    assert_eq!(listing["endpoints"][0]["vid"], 0x04D8);
    assert_eq!(rig.hid.open_calls(), 0);

    rig.service.hid().acquire().await.unwrap();
    let listing = commands::endpoint_listing(rig.service.hid()).await.unwrap();
    assert_eq!(listing["state"], "ready");
    assert_eq!(listing["current"]["endpoint"]["id"], "/dev/hidraw3");

    rig.service.hid().close().await;
    assert!(wait_for_state(rig.service.hid(), ConnectionState::Absent).await);
}

#[tokio::test]
async fn shutdown_during_connect_leaves_nothing_open() {
    let rig = rig(SensorSettings::default());
    rig.serial.set_open_delay(Some(Duration::from_millis(100)));

    let service = rig.service.clone();
    let request = tokio::spawn(async move { service.request_analog_frame().await });
    assert!(wait_for_state(rig.service.serial(), ConnectionState::Connecting).await);

    rig.service.shutdown().await;

    assert_eq!(rig.service.serial().state(), ConnectionState::Absent);
    assert_eq!(rig.serial.close_calls(), 1);
    assert!(request.await.unwrap().is_err());
    assert_eq!(rig.service.serial().state(), ConnectionState::Absent);
}
