//! E2E regression test suite for Pitwall
//!
//! Runs the real axum router on a loopback port and drives it the way
//! operators and edges do:
//!
//! - Operator → HTTP API → control plane → WebSocket command feed → edge
//! - Edge → heartbeat / command-response → control plane → status API
//! - Full loop with the edge agent, listener and a stand-in encoder process
//!
//! Run: `cargo test -p pitwall --features web,edge --test e2e`

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_util::sync::CancellationToken;

use pitwall::cloud::{ControlPlane, PlaneConfig, StaticDirectory};
use pitwall::web::{router, WebState};
use pitwall::{RedactedString, VehicleKey, TRUCK_TOKEN_HEADER};

const ADMIN: &str = "admin-secret";
const TRUCK: &str = "truck-7";

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// ── Shared helpers ───────────────────────────────────────────────────

fn vehicle() -> VehicleKey {
    VehicleKey::new("gp-2026", "car-7")
}

fn vehicle_body() -> Value {
    json!({ "event_id": "gp-2026", "vehicle_id": "car-7" })
}

fn with_vehicle(mut extra: Value) -> Value {
    if let (Some(map), Some(v)) = (extra.as_object_mut(), vehicle_body().as_object()) {
        for (k, val) in v {
            map.insert(k.clone(), val.clone());
        }
    }
    extra
}

struct TestServer {
    addr: SocketAddr,
    plane: Arc<ControlPlane>,
    client: reqwest::Client,
    shutdown: CancellationToken,
}

impl TestServer {
    async fn start() -> Self {
        let mut directory = StaticDirectory::new();
        directory.register(vehicle(), RedactedString::from(TRUCK));
        directory.register(VehicleKey::new("gp-2026", "car-9"), RedactedString::from(""));
        let plane = Arc::new(ControlPlane::new(
            Arc::new(directory),
            PlaneConfig {
                switch_min_interval_ms: 0,
                ..Default::default()
            },
        ));
        let shutdown = CancellationToken::new();
        let state = Arc::new(WebState {
            plane: plane.clone(),
            admin_token: Some(RedactedString::from(ADMIN)),
            shutdown: shutdown.clone(),
        });

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state);
        let cancel = shutdown.clone();
        tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { cancel.cancelled().await })
                .await
                .unwrap();
        });

        Self {
            addr,
            plane,
            client: reqwest::Client::new(),
            shutdown,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn admin_post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .bearer_auth(ADMIN)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn edge_post(&self, path: &str, body: Value) -> reqwest::Response {
        self.client
            .post(self.url(path))
            .header(TRUCK_TOKEN_HEADER, TRUCK)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn status(&self) -> Value {
        self.client
            .get(self.url("/api/stream/status?event_id=gp-2026&vehicle_id=car-7"))
            .bearer_auth(ADMIN)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    async fn heartbeat(&self, body: Value) {
        let resp = self.edge_post("/api/edge/heartbeat", body).await;
        assert_eq!(resp.status(), 200);
    }

    /// Open the edge command feed and wait until the server has subscribed it.
    async fn connect_edge(&self) -> WsStream {
        let mut request = format!("ws://{}/ws/edge", self.addr)
            .into_client_request()
            .unwrap();
        request
            .headers_mut()
            .insert(TRUCK_TOKEN_HEADER, TRUCK.parse().unwrap());
        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .expect("WebSocket connect failed");
        self.wait_for_listener().await;
        ws
    }

    async fn wait_for_listener(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.plane.transport().listeners(&vehicle()) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("edge never subscribed");
    }

    /// Poll the status API until `pred` holds.
    async fn wait_for_status(&self, pred: impl Fn(&Value) -> bool) -> Value {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        loop {
            let status = self.status().await;
            if pred(&status) {
                return status;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "status never matched: {status}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Collect JSON text frames until timeout.
async fn collect_frames(ws: &mut WsStream, timeout: Duration) -> Vec<Value> {
    let mut frames = Vec::new();
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            break;
        }
        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(tungstenite::Message::Text(text)))) => {
                frames.push(serde_json::from_str(text.as_str()).unwrap());
            }
            Ok(Some(Ok(_))) => {}
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => break,
        }
    }
    frames
}

fn online_heartbeat() -> Value {
    json!({
        "streaming_status": "idle",
        "cameras": ["main", "chase", "pov"],
        "youtube_configured": true,
    })
}

// ═══════════════════════════════════════════════════════════════════════
// Authentication
// ═══════════════════════════════════════════════════════════════════════

#[tokio::test(flavor = "multi_thread")]
async fn edge_routes_require_truck_token() {
    let server = TestServer::start().await;

    let resp = server
        .client
        .post(server.url("/api/edge/heartbeat"))
        .json(&online_heartbeat())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .post(server.url("/api/edge/heartbeat"))
        .header(TRUCK_TOKEN_HEADER, "not-a-truck")
        .json(&online_heartbeat())
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let err = tokio_tungstenite::connect_async(format!("ws://{}/ws/edge", server.addr)).await;
    assert!(err.is_err(), "edge feed opened without a token");
}

#[tokio::test(flavor = "multi_thread")]
async fn operator_routes_require_admin_token() {
    let server = TestServer::start().await;

    let resp = server
        .client
        .get(server.url("/api/stream/status?event_id=gp-2026&vehicle_id=car-7"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let resp = server
        .client
        .post(server.url("/api/stream/switch-camera"))
        .bearer_auth("wrong")
        .json(&with_vehicle(json!({ "camera": "main" })))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);

    let status = server.status().await;
    assert_eq!(status["stream"]["state"], "DISCONNECTED");
    assert_eq!(status["camera_switch"]["status"], "idle");
}

// ═══════════════════════════════════════════════════════════════════════
// Operator → edge command flow
// ═══════════════════════════════════════════════════════════════════════

/// Two identical switch calls produce one command on the wire, and the
/// edge's ACK resolves it.
#[tokio::test(flavor = "multi_thread")]
async fn camera_switch_is_idempotent_and_resolved_by_ack() {
    let server = TestServer::start().await;
    server.heartbeat(online_heartbeat()).await;
    let mut edge = server.connect_edge().await;

    let body = with_vehicle(json!({ "camera": "chase" }));
    let first: Value = server
        .admin_post("/api/stream/switch-camera", body.clone())
        .await
        .json()
        .await
        .unwrap();
    let second: Value = server
        .admin_post("/api/stream/switch-camera", body)
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(first["status"], "pending");
    assert_eq!(first["request_id"], second["request_id"]);
    assert_eq!(second["deduplicated"], true);

    let frames = collect_frames(&mut edge, Duration::from_millis(500)).await;
    assert_eq!(frames.len(), 1, "{frames:?}");
    let frame = &frames[0];
    assert_eq!(frame["type"], "edge_command");
    assert_eq!(frame["command"]["command"], "set_active_camera");
    assert_eq!(frame["command"]["params"]["camera"], "chase");
    assert_eq!(frame["command"]["command_id"], first["request_id"]);

    let resp = server
        .edge_post(
            "/api/edge/command-response",
            json!({
                "command_id": first["request_id"],
                "status": "success",
                "message": "Camera set to chase",
            }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let ack: Value = resp.json().await.unwrap();
    assert_eq!(ack["accepted"], true);

    let status = server.status().await;
    assert_eq!(status["camera_switch"]["status"], "success");
    assert_eq!(status["camera_switch"]["active_value"], "chase");

    // The ledger keeps the resolved command
    let record: Value = server
        .client
        .get(server.url(&format!(
            "/api/commands/{}",
            first["request_id"].as_str().unwrap()
        )))
        .bearer_auth(ADMIN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(record["status"], "success");
}

#[tokio::test(flavor = "multi_thread")]
async fn legacy_camera_name_reaches_edge_normalized() {
    let server = TestServer::start().await;
    server.heartbeat(online_heartbeat()).await;
    let mut edge = server.connect_edge().await;

    let resp = server
        .admin_post(
            "/api/stream/switch-camera",
            with_vehicle(json!({ "camera": "POV" })),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let frames = collect_frames(&mut edge, Duration::from_millis(300)).await;
    assert_eq!(frames[0]["command"]["params"]["camera"], "cockpit");
}

#[tokio::test(flavor = "multi_thread")]
async fn validation_errors_carry_reason_and_hint() {
    let server = TestServer::start().await;

    // No heartbeat yet: edge is offline
    let resp = server
        .admin_post(
            "/api/stream/switch-camera",
            with_vehicle(json!({ "camera": "main" })),
        )
        .await;
    assert_eq!(resp.status(), 409);

    let resp = server
        .admin_post(
            "/api/stream/switch-camera",
            json!({ "event_id": "gp-2026", "vehicle_id": "car-404", "camera": "main" }),
        )
        .await;
    assert_eq!(resp.status(), 404);

    server
        .heartbeat(json!({ "streaming_status": "idle", "cameras": ["main"] }))
        .await;

    let resp = server
        .admin_post(
            "/api/stream/switch-camera",
            with_vehicle(json!({ "camera": "periscope" })),
        )
        .await;
    assert_eq!(resp.status(), 400);

    let resp = server
        .admin_post(
            "/api/stream/start",
            with_vehicle(json!({ "camera": "main" })),
        )
        .await;
    assert_eq!(resp.status(), 412);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["reason"], "ENCODER_KEY_NOT_CONFIGURED");
    assert!(body["hint"].is_string());
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_and_foreign_acks() {
    let server = TestServer::start().await;
    server.heartbeat(online_heartbeat()).await;

    let resp = server
        .edge_post(
            "/api/edge/command-response",
            json!({ "command_id": "never-sent", "status": "success" }),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["accepted"], false);

    // A command for car-9 cannot be acknowledged with car-7's token
    let other = VehicleKey::new("gp-2026", "car-9");
    let id = server.plane.transport().send(
        &other,
        &pitwall::EdgeCommand::GetStatus,
        pitwall::CommandOwner::Dispatch,
        pitwall::now_ms(),
    );
    let resp = server
        .edge_post(
            "/api/edge/command-response",
            json!({ "command_id": id, "status": "success" }),
        )
        .await;
    assert_eq!(resp.status(), 403);
}

#[tokio::test(flavor = "multi_thread")]
async fn dashboard_feed_sees_state_changes_and_featured_vehicle() {
    let server = TestServer::start().await;
    let (mut events, _) = tokio_tungstenite::connect_async(format!(
        "ws://{}/ws/events?token={}",
        server.addr, ADMIN
    ))
    .await
    .expect("events feed connect failed");
    tokio::time::sleep(Duration::from_millis(100)).await;

    server.heartbeat(online_heartbeat()).await;
    let resp = server.admin_post("/api/featured", vehicle_body()).await;
    assert_eq!(resp.status(), 200);

    let frames = collect_frames(&mut events, Duration::from_millis(500)).await;
    let types: Vec<&str> = frames.iter().filter_map(|f| f["type"].as_str()).collect();
    assert!(types.contains(&"stream_state_change"), "{types:?}");
    assert!(types.contains(&"featured_vehicle"), "{types:?}");
    let change = frames
        .iter()
        .find(|f| f["type"] == "stream_state_change")
        .unwrap();
    assert_eq!(change["state"], "IDLE");
    assert_eq!(change["vehicle_id"], "car-7");
}

// ═══════════════════════════════════════════════════════════════════════
// Full loop with the edge runtime
// ═══════════════════════════════════════════════════════════════════════

#[cfg(unix)]
#[tokio::test(flavor = "multi_thread")]
async fn edge_agent_starts_and_stops_stream_on_command() {
    use std::collections::HashMap;

    use pitwall::edge::{
        AgentConfig, BackoffPolicy, CloudClient, CommandListener, EdgeAgent, EncoderSpec,
        Supervisor, SupervisorPolicy,
    };
    use pitwall::{CameraSlot, QualityProfile};

    let server = TestServer::start().await;
    let cloud_url = format!("http://{}", server.addr);
    let cancel = CancellationToken::new();

    let spec = EncoderSpec {
        program: "sh".into(),
        args: vec!["-c".into(), "exec sleep 30".into()],
        inputs: HashMap::from([
            (CameraSlot::Main, "main-input".to_string()),
            (CameraSlot::Chase, "chase-input".to_string()),
        ]),
        rtmp_url: "rtmp://localhost/live".into(),
        stream_key: RedactedString::from("key"),
        orphan_signature: None,
    };
    let policy = SupervisorPolicy {
        start_grace: Duration::from_millis(200),
        stop_timeout: Duration::from_millis(300),
        ..Default::default()
    };
    let cameras = spec.cameras();
    let (supervisor, handle) = Supervisor::new(policy, spec, QualityProfile::Hd720, None);
    tokio::spawn(supervisor.run(cancel.clone()));

    let cloud = Arc::new(CloudClient::new(&cloud_url, RedactedString::from(TRUCK)).unwrap());
    let agent = Arc::new(EdgeAgent::new(
        handle,
        cloud,
        cameras,
        true,
        AgentConfig {
            heartbeat_interval: Duration::from_millis(200),
            auto_quality: false,
            ..Default::default()
        },
    ));
    let (tx, rx) = tokio::sync::mpsc::channel(8);
    let listener = CommandListener::new(&cloud_url, RedactedString::from(TRUCK), tx).with_backoff(
        BackoffPolicy {
            base: Duration::from_millis(50),
            ceiling: Duration::from_millis(200),
            jitter: Duration::ZERO,
            symmetric: false,
        },
    );
    tokio::spawn(listener.run(cancel.clone()));
    tokio::spawn(agent.run(rx, cancel.clone()));

    server.wait_for_listener().await;
    server
        .wait_for_status(|s| s["stream"]["state"] == "IDLE")
        .await;

    let resp = server
        .admin_post(
            "/api/stream/start",
            with_vehicle(json!({ "camera": "main", "controller": "pit_crew" })),
        )
        .await;
    assert_eq!(resp.status(), 200);

    let status = server
        .wait_for_status(|s| s["stream"]["state"] == "STREAMING")
        .await;
    assert_eq!(status["stream"]["source_id"], "main");
    assert_eq!(status["stream"]["controller"], "pit_crew");

    let resp = server
        .admin_post(
            "/api/stream/switch-camera",
            with_vehicle(json!({ "camera": "chase" })),
        )
        .await;
    assert_eq!(resp.status(), 200);
    let status = server
        .wait_for_status(|s| s["camera_switch"]["status"] == "success")
        .await;
    assert_eq!(status["stream"]["source_id"], "chase");

    let resp = server
        .admin_post("/api/stream/stop", vehicle_body())
        .await;
    assert_eq!(resp.status(), 200);
    server
        .wait_for_status(|s| s["stream"]["state"] == "IDLE")
        .await;

    cancel.cancel();
}
