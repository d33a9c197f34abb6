use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use ino_host::autotune::{FailReason, RunState};
use ino_host::config::parse_config;
use ino_host::host::serve_requests;
use ino_host::web::api::create_router;
use ino_host::{ConfigError, Host, HostError};
use ino_shared::{Clock, MonotonicClock};
use ino_simulator::SimConnector;
use std::sync::Arc;
use std::time::Duration;
use tower::util::ServiceExt;

const PRINTER: &str = r#"
[heaters.extruder]
sensor_type = "PLA_INO_SENSOR"
heater_type = "PLA_INO_HEATER"
serial = "/dev/ttyACM1"
min_temp = 10
max_temp = 450

[heaters.heater_bed]
sensor_type = "EPCOS 100K B57560G104F"
min_temp = 0
max_temp = 130
"#;

fn clock() -> Arc<dyn Clock> {
    Arc::new(MonotonicClock::new())
}

fn start(sim: &SimConnector, doc: &str) -> Result<Host, HostError> {
    let config = parse_config(doc).map_err(HostError::Config)?;
    let sim = sim.clone();
    Host::start(config, clock(), move |_, _| sim.clone())
}

/// Poll `check` every 20 ms for up to `limit`.
async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

#[tokio::test]
async fn test_mismatched_pairing_opens_no_session() {
    let sim = SimConnector::hotend("e2e");
    let mut config = parse_config(PRINTER).unwrap();
    config.heaters.get_mut("extruder").unwrap().sensor_type = "EPCOS 100K B57560G104F".to_string();
    let result = Host::start(config, clock(), |_, _| sim.clone());
    assert!(matches!(
        result,
        Err(HostError::Config(ConfigError::IncompatiblePairing { .. }))
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sim.controls().connects(), 0);
}

#[tokio::test]
async fn test_commands_against_simulated_board() {
    let sim = SimConnector::hotend("e2e");
    let host = start(&sim, PRINTER).unwrap();
    let sensor = host.sensor("extruder").unwrap().clone();
    assert!(eventually(Duration::from_secs(2), || sensor.read_latest().valid).await);
    assert!(host.sensor("heater_bed").is_none());

    let version = host.execute("INO_FIRMWARE_VERSION").await.unwrap();
    assert_eq!(version, "extruder: version: ino-sim 1.0.0");
    let gains = host.execute("INO_READ_PID_VALUES T=0").await.unwrap();
    assert_eq!(gains, "extruder: kp:13.41 ki:30.91 kd:1.46");

    host.execute("SET_HEATER_TEMPERATURE HEATER=extruder TARGET=215").await.unwrap();
    host.execute("INO_FREQUENCY F=40").await.unwrap();
    assert!(eventually(Duration::from_secs(2), || {
        let board = sim.board();
        board.target == 215.0 && board.frequency == 40
    })
    .await);

    let debug = host.execute("INO_DEBUG_OUT").await.unwrap();
    assert!(debug.starts_with("INO debug output:\n{tick: "));

    assert_eq!(
        host.execute("INO_RESET_ERROR_FLAGS HEATER=heater_bed").await.unwrap_err(),
        "Command not defined for this heater"
    );
    assert_eq!(
        host.execute("TUNE PID=200 HEATER=chamber").await.unwrap_err(),
        "Unknown heater 'chamber'"
    );
    host.execute("SET_HEATER_TEMPERATURE HEATER=heater_bed TARGET=60").await.unwrap();

    let status = host
        .query(&["gcode_tracker".to_string(), "heater_bed".to_string(), "nothing".to_string()])
        .await;
    assert_eq!(status["gcode_tracker"]["current_gcode_line_count"], 8);
    assert_eq!(
        status["gcode_tracker"]["current_gcode_line"],
        "SET_HEATER_TEMPERATURE HEATER=heater_bed TARGET=60"
    );
    assert_eq!(status["heater_bed"]["target"], 60.0);
    assert!(!status.contains_key("nothing"));

    host.shutdown().await;
    assert!(eventually(Duration::from_secs(1), || {
        let board = sim.board();
        board.target == 0.0 && board.power == 0.0
    })
    .await);
}

#[tokio::test]
async fn test_unplugged_board_fails_autotune_on_timeout() {
    let sim = SimConnector::hotend("e2e");
    let doc = PRINTER.replace("max_temp = 450", "max_temp = 450\ntune_timeout = 1.0");
    let host = start(&sim, &doc).unwrap();
    let sensor = host.sensor("extruder").unwrap().clone();
    assert!(eventually(Duration::from_secs(2), || sensor.read_latest().valid).await);

    host.execute("TUNE PID=250").await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    sim.controls().unplug();

    let heater = host.heater("extruder").unwrap().clone();
    let mut state = RunState::Running;
    for _ in 0..150 {
        state = heater.lock().await.as_ino().unwrap().autotune().state();
        if state != RunState::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(matches!(state, RunState::Failed(FailReason::Timeout { .. })));
    assert_eq!(
        host.execute("READ_TUNED_VALUES").await.unwrap(),
        "extruder: no successful run"
    );
    let active = host.faults().active();
    assert!(active.contains_key("extruder"));
    host.shutdown().await;
}

#[tokio::test]
async fn test_web_api_reaches_host() {
    let sim = SimConnector::hotend("e2e");
    let host = Arc::new(start(&sim, PRINTER).unwrap());
    let (host_tx, host_rx) = tokio::sync::mpsc::channel(16);
    tokio::spawn(serve_requests(host.clone(), host_rx));
    let app = create_router(host_tx);

    let request = Request::builder()
        .method("POST")
        .uri("/api/v1/gcode")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"command":"SET_HEATER_TEMPERATURE TARGET=200"}"#))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["result"], "extruder: target 200.0");

    let request = Request::builder()
        .uri("/api/v1/objects/query?objects=gcode_tracker,extruder")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"]["gcode_tracker"]["current_gcode_line_count"], 1);
    assert_eq!(json["status"]["extruder"]["target"], 200.0);
    assert_eq!(json["status"]["extruder"]["pid"]["kp"], 13.41);

    let request = Request::builder()
        .uri("/api/v1/objects/list")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let objects: Vec<&str> = json["objects"].as_array().unwrap().iter().filter_map(|v| v.as_str()).collect();
    assert!(objects.contains(&"ino_sensor extruder"));
    assert!(objects.contains(&"faults"));

    host.shutdown().await;
}

#[tokio::test]
async fn test_query_reply_skips_unrelated_device_output() {
    let sim = SimConnector::hotend("e2e");
    let host = start(&sim, PRINTER).unwrap();
    let sensor = host.sensor("extruder").unwrap().clone();
    assert!(eventually(Duration::from_secs(2), || sensor.read_latest().valid).await);

    sim.controls().set_chatter(true);
    let version = host.execute("INO_FIRMWARE_VERSION").await.unwrap();
    assert_eq!(version, "extruder: version: ino-sim 1.0.0");
    let gains = host.execute("INO_READ_PID_VALUES").await.unwrap();
    assert_eq!(gains, "extruder: kp:13.41 ki:30.91 kd:1.46");
    host.shutdown().await;
}
