use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::{json, Value as JsonValue};
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{
    net::TcpListener,
    sync::{mpsc, oneshot, watch},
    time::{sleep, timeout},
};

use homewizard_bridge::{
    publish_sink::{ChannelSinkFactory, Publication},
    Bridge, BridgeConfig, BridgeError, DiscoveredService, DiscoveryEvent, DiscoveryProvider,
    HomeWizardClient, RemovalPolicy, Value,
};

/// Mock HomeWizard P1 meter serving the local API
struct MockMeter {
    data: Mutex<JsonValue>,
    data_requests: AtomicU32,
    should_fail: AtomicBool,
}

impl MockMeter {
    fn new() -> Self {
        Self {
            data: Mutex::new(json!({
                "smr_version": 50,
                "meter_model": "ISKRA 2M550T-101",
                "total_power_import_t1_kwh": 100.0,
                "total_power_import_t2_kwh": 50.5,
                "total_power_export_t1_kwh": 10.0,
                "total_power_export_t2_kwh": 0.25,
                "active_power_w": 640,
                "active_power_l1_w": 400,
                "active_power_l2_w": 200,
                "active_power_l3_w": 40,
                "total_gas_m3": 2569.646,
                "gas_timestamp": 210606140010u64
            })),
            data_requests: AtomicU32::new(0),
            should_fail: AtomicBool::new(false),
        }
    }

    fn set_field(&self, key: &str, value: JsonValue) {
        self.data.lock().unwrap()[key] = value;
    }

    fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::Relaxed);
    }

    fn get_data_requests(&self) -> u32 {
        self.data_requests.load(Ordering::Relaxed)
    }

    fn create_router(self: Arc<Self>) -> Router {
        let data_meter = self.clone();
        Router::new()
            .route(
                "/api",
                get(|| async {
                    Json(json!({
                        "product_type": "P1",
                        "product_name": "P1 meter",
                        "serial": "X1",
                        "firmware_version": "1.0",
                        "api_version": "v1"
                    }))
                }),
            )
            .route(
                "/api/v1/data",
                get(move || async move {
                    data_meter.data_requests.fetch_add(1, Ordering::Relaxed);
                    if data_meter.should_fail.load(Ordering::Relaxed) {
                        return Err(StatusCode::INTERNAL_SERVER_ERROR);
                    }
                    let data = data_meter.data.lock().unwrap().clone();
                    Ok(Json(data))
                }),
            )
    }
}

/// Start mock meter HTTP server
async fn start_mock_meter() -> (Arc<MockMeter>, SocketAddr, oneshot::Sender<()>) {
    let mock_meter = Arc::new(MockMeter::new());
    let app = mock_meter.clone().create_router();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    tokio::spawn(async move {
        let server = axum::serve(listener, app);
        tokio::select! {
            _ = server => {},
            _ = shutdown_rx => {
                println!("Mock meter shutting down");
            }
        }
    });

    (mock_meter, addr, shutdown_tx)
}

/// Discovery provider fed by the test
struct ChannelProvider {
    events: Option<mpsc::Receiver<DiscoveryEvent>>,
    stopped: Arc<AtomicBool>,
}

impl DiscoveryProvider for ChannelProvider {
    fn start(&mut self) -> Result<mpsc::Receiver<DiscoveryEvent>, BridgeError> {
        self.events
            .take()
            .ok_or_else(|| BridgeError::Discovery("already started".to_string()))
    }

    fn stop(&mut self) {
        self.stopped.store(true, Ordering::Relaxed);
    }
}

fn test_config(host: Option<String>) -> BridgeConfig {
    BridgeConfig {
        host,
        poll_interval: Duration::from_millis(100),
        http_timeout: Duration::from_millis(500),
        max_backoff: Duration::from_millis(400),
        ..BridgeConfig::default()
    }
}

fn test_bridge(config: BridgeConfig) -> (Bridge, mpsc::UnboundedReceiver<Publication>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let reader = Arc::new(HomeWizardClient::new(config.http_timeout).unwrap());
    let bridge = Bridge::new(config, reader, Arc::new(ChannelSinkFactory::new(tx)));
    (bridge, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<Publication>) -> Vec<Publication> {
    let mut out = Vec::new();
    while let Ok(publication) = rx.try_recv() {
        out.push(publication);
    }
    out
}

fn latest(publications: &[Publication]) -> HashMap<&str, Option<&Value>> {
    publications
        .iter()
        .map(|p| (p.path.as_str(), p.value.as_ref()))
        .collect()
}

#[tokio::test]
async fn test_static_mode_publishes_only_changes() {
    let (mock_meter, addr, _meter_shutdown) = start_mock_meter().await;
    let (bridge, mut publications) = test_bridge(test_config(Some(addr.to_string())));
    let (shutdown_tx, shutdown) = watch::channel(false);

    let bridge_task = tokio::spawn(async move { bridge.run(shutdown).await });

    // Test 1: identity and first reading are published once
    sleep(Duration::from_millis(550)).await;
    let first = drain(&mut publications);
    assert_eq!(first.len(), 9 + 12, "unexpected writes: {first:#?}");
    assert!(first
        .iter()
        .all(|p| p.service == "com.victronenergy.grid.homewizard_X1"));

    let values = latest(&first);
    assert_eq!(values["/ProductName"], Some(&Value::from("HomeWizard - P1")));
    assert_eq!(values["/Ac/Energy/Forward"], Some(&Value::Number(150.5)));
    assert_eq!(values["/Ac/L1/Energy/Forward"], Some(&Value::Number(150.5)));
    assert_eq!(values["/Ac/Energy/Reverse"], Some(&Value::Number(10.25)));
    assert!(!values.contains_key("/Ac/L2/Energy/Forward"));
    let gas = first.iter().find(|p| p.path == "/Gas/Timestamp").unwrap();
    assert_eq!(gas.text, "2021-06-06 14:00:10");
    assert!(
        mock_meter.get_data_requests() >= 4,
        "Expected several polls, got {}",
        mock_meter.get_data_requests()
    );

    // Test 2: a single changed field produces a single write
    mock_meter.set_field("active_power_w", json!(655));
    sleep(Duration::from_millis(350)).await;
    let changed = drain(&mut publications);
    assert_eq!(changed.len(), 1, "unexpected writes: {changed:#?}");
    assert_eq!(changed[0].path, "/Ac/Power");
    assert_eq!(changed[0].value, Some(Value::Number(655.0)));
    assert_eq!(changed[0].text, "655W");

    // Test 3: failing polls keep the session alive without writing
    mock_meter.set_should_fail(true);
    sleep(Duration::from_millis(500)).await;
    assert!(drain(&mut publications).is_empty());

    mock_meter.set_should_fail(false);
    mock_meter.set_field("active_power_l3_w", json!(-15));
    sleep(Duration::from_millis(900)).await;
    let recovered = drain(&mut publications);
    assert_eq!(recovered.len(), 1, "unexpected writes: {recovered:#?}");
    assert_eq!(recovered[0].path, "/Ac/L3/Power");

    shutdown_tx.send(true).unwrap();
    let result = timeout(Duration::from_secs(2), bridge_task)
        .await
        .expect("Bridge did not stop")
        .unwrap();
    assert!(result.is_ok());
}

#[tokio::test]
async fn test_static_mode_unreachable_meter_is_fatal() {
    let (bridge, mut publications) = test_bridge(test_config(Some("127.0.0.1:9".to_string())));
    let (_shutdown_tx, shutdown) = watch::channel(false);

    let result = timeout(Duration::from_secs(5), bridge.run(shutdown))
        .await
        .expect("Bridge should fail fast");

    assert!(matches!(result, Err(BridgeError::Unreachable { .. })));
    assert!(drain(&mut publications).is_empty());
}

#[tokio::test]
async fn test_discovery_mode_lifecycle() {
    let (_mock_meter, addr, _meter_shutdown) = start_mock_meter().await;
    let (bridge, mut publications) = test_bridge(BridgeConfig {
        removal_policy: RemovalPolicy::Exit,
        ..test_config(None)
    });
    let (events_tx, events) = mpsc::channel(8);
    let stopped = Arc::new(AtomicBool::new(false));
    let mut provider = ChannelProvider {
        events: Some(events),
        stopped: stopped.clone(),
    };
    let (_shutdown_tx, shutdown) = watch::channel(false);

    let bridge_task =
        tokio::spawn(async move { bridge.run_discovery(&mut provider, shutdown).await });

    let name = "p1meter-X1._hwenergy._tcp.local.".to_string();
    let advertised = |product_type: &str| DiscoveredService {
        name: name.clone(),
        host: addr.to_string(),
        properties: HashMap::from([
            ("api_enabled".to_string(), "1".to_string()),
            ("product_type".to_string(), product_type.to_string()),
        ]),
    };

    // An unsupported product never starts a session
    events_tx
        .send(DiscoveryEvent::Found(DiscoveredService {
            name: "energysocket-1._hwenergy._tcp.local.".to_string(),
            ..advertised("HWE-SKT")
        }))
        .await
        .unwrap();
    events_tx
        .send(DiscoveryEvent::Found(advertised("HWE-P1")))
        .await
        .unwrap();
    events_tx
        .send(DiscoveryEvent::Found(advertised("HWE-P1")))
        .await
        .unwrap();
    events_tx
        .send(DiscoveryEvent::Updated(advertised("HWE-P1")))
        .await
        .unwrap();

    sleep(Duration::from_millis(450)).await;
    let published = drain(&mut publications);
    let product_names: Vec<_> = published
        .iter()
        .filter(|p| p.path == "/ProductName")
        .collect();
    assert_eq!(product_names.len(), 1, "expected a single session");
    assert_eq!(
        product_names[0].service,
        "com.victronenergy.grid.homewizard_X1"
    );
    assert_eq!(latest(&published)["/Ac/Power"], Some(&Value::Number(640.0)));

    // Losing the meter stops the bridge under the exit policy
    events_tx.send(DiscoveryEvent::Removed(name.clone())).await.unwrap();
    let result = timeout(Duration::from_secs(2), bridge_task)
        .await
        .expect("Bridge did not stop")
        .unwrap();

    assert!(matches!(result, Err(BridgeError::SessionLost { name: lost }) if lost == name));
    assert!(stopped.load(Ordering::Relaxed));
}
