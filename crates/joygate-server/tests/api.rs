use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use joygate_config::Config;
use joygate_kernel::webhook_signature;
use joygate_server::{build_app, AppState};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tower::util::ServiceExt;

fn test_app(cfg: Config) -> Router {
    build_app(AppState::new(cfg))
}

async fn sandbox_cookie(app: &Router) -> String {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/bootstrap")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let set_cookie = response
        .headers()
        .get("set-cookie")
        .expect("bootstrap must set the sandbox cookie")
        .to_str()
        .unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}

fn get(uri: &str, cookie: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .header("cookie", cookie)
        .body(Body::empty())
        .unwrap()
}

fn post_json(uri: &str, cookie: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("cookie", cookie)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn post_json_as(uri: &str, cookie: &str, joykey: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("cookie", cookie)
        .header("x-joykey", joykey)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn read_json(response: axum::response::Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

async fn report_blocked(app: &Router, cookie: &str, charger_id: &str) -> String {
    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/incidents/report_blocked",
            cookie,
            json!({
                "charger_id": charger_id,
                "incident_type": "BLOCKED",
                "evidence_refs": [],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    read_json(response).await["incident_id"]
        .as_str()
        .unwrap()
        .to_string()
}

#[tokio::test]
async fn bootstrap_reuses_a_known_sandbox() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;

    let response = app
        .clone()
        .oneshot(get("/bootstrap", &cookie))
        .await
        .unwrap();
    let payload = read_json(response).await;
    let returned = payload["sandbox_id"].as_str().unwrap();
    assert_eq!(cookie, format!("joygate_sandbox={returned}"));
}

#[tokio::test]
async fn v1_post_without_sandbox_is_rejected() {
    let app = test_app(Config::default());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/v1/reserve")
                .header("content-type", "application/json")
                .body(Body::from(
                    json!({
                        "resource_type": "CHARGER",
                        "resource_id": "charger-001",
                        "joykey": "jk_1",
                    })
                    .to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reserve_contention_emits_congestion_suggestions() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/reserve",
            &cookie,
            json!({
                "resource_type": "CHARGER",
                "resource_id": "charger-001",
                "joykey": "jk_holder",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    assert!(payload["hold_id"].as_str().unwrap().starts_with("hold_"));
    assert_eq!(payload["ttl_seconds"], 180);

    // three distinct joykeys collide with the live hold
    for jk in ["jk_a", "jk_b", "jk_c"] {
        let response = app
            .clone()
            .oneshot(post_json(
                "/v1/reserve",
                &cookie,
                json!({
                    "resource_type": "CHARGER",
                    "resource_id": "charger-001",
                    "joykey": jk,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let payload = read_json(response).await;
        assert_eq!(payload["error"], "RESOURCE_BUSY");
    }

    let response = app
        .clone()
        .oneshot(get("/v1/audit/ledger", &cookie))
        .await
        .unwrap();
    let ledger = read_json(response).await;
    let congestion: Vec<&Value> = ledger["decisions"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|d| {
            d["summary"]
                .as_str()
                .unwrap()
                .contains("proactive congestion")
        })
        .collect();
    assert_eq!(congestion.len(), 3);
    assert_eq!(congestion[0]["decision_type"], "POLICY_SUGGESTED");
}

#[tokio::test]
async fn holder_cannot_double_book() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/reserve",
            &cookie,
            json!({
                "resource_type": "CHARGER",
                "resource_id": "charger-001",
                "joykey": "jk_greedy",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(post_json(
            "/v1/reserve",
            &cookie,
            json!({
                "resource_type": "CHARGER",
                "resource_id": "charger-002",
                "joykey": "jk_greedy",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let payload = read_json(response).await;
    assert_eq!(payload["error"], "QUOTA_EXCEEDED");
}

#[tokio::test]
async fn charging_flow_roundtrip() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/reserve",
            &cookie,
            json!({
                "resource_type": "CHARGER",
                "resource_id": "charger-001",
                "joykey": "jk_1",
            }),
        ))
        .await
        .unwrap();
    let hold_id = read_json(response).await["hold_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/oracle/start_charging",
            &cookie,
            json!({ "hold_id": hold_id.clone(), "charger_id": "charger-001" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let payload = read_json(response).await;
    assert_eq!(payload["ok"], true);
    assert_eq!(payload["truth_event"], "START_CHARGING");

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/oracle/stop_charging",
            &cookie,
            json!({ "hold_id": hold_id, "charger_id": "charger-001" }),
        ))
        .await
        .unwrap();
    let payload = read_json(response).await;
    assert_eq!(payload["ok"], true);

    let response = app
        .oneshot(get("/v1/snapshot", &cookie))
        .await
        .unwrap();
    let snapshot = read_json(response).await;
    assert!(snapshot["holds"].as_array().unwrap().is_empty());
    let charger = snapshot["chargers"]
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["charger_id"] == "charger-001")
        .unwrap();
    assert_eq!(charger["slot_state"], "FREE");
}

#[tokio::test]
async fn witness_confirmation_awards_scores() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;
    let incident_id = report_blocked(&app, &cookie, "charger-001").await;

    for jk in ["w1", "w2"] {
        let response = app
            .clone()
            .oneshot(post_json_as(
                "/v1/witness/respond",
                &cookie,
                jk,
                json!({
                    "incident_id": incident_id.clone(),
                    "charger_id": "charger-001",
                    "charger_state": "OCCUPIED",
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let response = app
        .clone()
        .oneshot(get(
            &format!("/v1/incidents?incident_id={incident_id}"),
            &cookie,
        ))
        .await
        .unwrap();
    let payload = read_json(response).await;
    let items = payload["incidents"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    let item = &items[0];
    assert_eq!(item["incident_status"], "EVIDENCE_CONFIRMED");
    // the projection is exactly the eight documented keys
    assert_eq!(item.as_object().unwrap().len(), 8);
    let tally = item["ai_insights"]
        .as_array()
        .unwrap()
        .iter()
        .find(|i| i["insight_type"] == "WITNESS_TALLY")
        .unwrap();
    assert!(tally["summary"].as_str().unwrap().contains("lead=OCCUPIED"));

    let response = app
        .clone()
        .oneshot(get("/v1/reputation?joykey=w1", &cookie))
        .await
        .unwrap();
    let rep = read_json(response).await;
    assert_eq!(rep["robot_score"], 62.0);

    // a duplicate vote stays a silent no-op
    let response = app
        .clone()
        .oneshot(post_json_as(
            "/v1/witness/respond",
            &cookie,
            "w1",
            json!({
                "incident_id": incident_id.clone(),
                "charger_id": "charger-001",
                "charger_state": "FREE",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(get("/v1/score_events", &cookie))
        .await
        .unwrap();
    let events = read_json(response).await;
    assert_eq!(events["score_events"].as_array().unwrap().len(), 2);
}

#[tokio::test]
async fn witness_outside_allowlist_is_forbidden() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;
    let incident_id = report_blocked(&app, &cookie, "charger-001").await;

    let response = app
        .oneshot(post_json_as(
            "/v1/witness/respond",
            &cookie,
            "intruder",
            json!({
                "incident_id": incident_id,
                "charger_id": "charger-001",
                "charger_state": "FREE",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let payload = read_json(response).await;
    assert_eq!(payload["error"], "PERMISSION_DENIED");
}

#[tokio::test]
async fn out_of_order_telemetry_keeps_latest_signal() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/telemetry/segment_passed",
            &cookie,
            json!({
                "joykey": "jk_rider",
                "segment_ids": ["cell_7_7"],
                "event_occurred_at": 1000,
                "truth_input_source": "SIMULATOR",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    // an older reading arrives late and must not win
    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/telemetry/segment_passed",
            &cookie,
            json!({
                "joykey": "jk_other",
                "segment_ids": ["cell_7_7"],
                "event_occurred_at": 500,
                "truth_input_source": "SIMULATOR",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app.oneshot(get("/v1/snapshot", &cookie)).await.unwrap();
    let snapshot = read_json(response).await;
    let signal = snapshot["segment_passed_signals"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["segment_id"] == "cell_7_7")
        .unwrap();
    assert_eq!(signal["last_passed_ts"], 1000);
    assert_eq!(signal["joykey"], "jk_rider");
}

#[tokio::test]
async fn far_future_telemetry_is_rejected() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;

    let ts = chrono::Utc::now().timestamp() + 3600;
    let response = app
        .oneshot(post_json(
            "/v1/telemetry/segment_passed",
            &cookie,
            json!({
                "joykey": "jk_rider",
                "segment_ids": ["cell_7_7"],
                "event_occurred_at": ts,
                "truth_input_source": "SIMULATOR",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn segment_votes_soft_block_a_hazard() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;

    for jk in ["w1", "w2"] {
        let response = app
            .clone()
            .oneshot(post_json_as(
                "/v1/witness/segment_respond",
                &cookie,
                jk,
                json!({
                    "segment_id": "cell_5_9",
                    "segment_state": "BLOCKED",
                    "points_event_id": format!("pe-{jk}"),
                    "obstacle_type": "ICE_VEHICLE",
                    "evidence_refs": [],
                }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }

    let response = app
        .clone()
        .oneshot(get("/v1/hazards", &cookie))
        .await
        .unwrap();
    let payload = read_json(response).await;
    let hazard = payload["hazards"]
        .as_array()
        .unwrap()
        .iter()
        .find(|h| h["segment_id"] == "cell_5_9")
        .unwrap();
    assert_eq!(hazard["hazard_status"], "SOFT_BLOCKED");
    assert_eq!(hazard["obstacle_type"], "ICE_VEHICLE");

    // a work order nobody issued is upserted (204) but unblocks nothing
    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/work_orders/report",
            &cookie,
            json!({
                "work_order_id": "wo_ffffffffffff",
                "work_order_status": "DONE",
                "segment_id": "cell_5_9",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(get("/v1/hazards", &cookie))
        .await
        .unwrap();
    let payload = read_json(response).await;
    let hazard = payload["hazards"]
        .as_array()
        .unwrap()
        .iter()
        .find(|h| h["segment_id"] == "cell_5_9")
        .unwrap();
    assert_eq!(hazard["hazard_status"], "SOFT_BLOCKED");
}

#[tokio::test]
async fn legacy_hazard_status_alias_is_accepted() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;

    let response = app
        .oneshot(post_json_as(
            "/v1/witness/segment_respond",
            &cookie,
            "w1",
            json!({
                "segment_id": "cell_6_6",
                "hazard_status": "BLOCKED",
                "points_event_id": "pe-legacy",
                "evidence_refs": [],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn zero_budget_vision_audit_skips_without_confirming() {
    let mut cfg = Config::default();
    cfg.ai.daily_budget_calls = 0;
    let app = test_app(cfg);
    let cookie = sandbox_cookie(&app).await;
    let incident_id = report_blocked(&app, &cookie, "charger-001").await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/ai/vision_audit",
            &cookie,
            json!({ "incident_id": incident_id.clone() }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let accepted = read_json(response).await;
    assert!(accepted["ai_report_id"].as_str().unwrap().starts_with("airpt_"));
    assert_eq!(accepted["status"], "ACCEPTED");

    let response = app
        .clone()
        .oneshot(post_json("/v1/ai_jobs/tick", &cookie, json!({ "max_jobs": 5 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let tick = read_json(response).await;
    assert_eq!(tick["processed"], 1);
    assert_eq!(tick["completed"], 1);

    let response = app
        .clone()
        .oneshot(get("/v1/ai_jobs", &cookie))
        .await
        .unwrap();
    let jobs = read_json(response).await;
    assert_eq!(jobs["ai_jobs"][0]["ai_job_status"], "COMPLETED");

    let response = app
        .oneshot(get(
            &format!("/v1/incidents?incident_id={incident_id}"),
            &cookie,
        ))
        .await
        .unwrap();
    let payload = read_json(response).await;
    let item = &payload["incidents"][0];
    // skipped audits never promote the incident
    assert_eq!(item["incident_status"], "OPEN");
    let skipped = item["ai_insights"]
        .as_array()
        .unwrap()
        .iter()
        .any(|i| i["summary"] == "skipped due to budget");
    assert!(skipped);
}

#[tokio::test]
async fn policy_suggestion_applies_only_after_completion() {
    let mut cfg = Config::default();
    cfg.admin.god_token = Some("tkn-test".to_string());
    let app = test_app(cfg);
    let cookie = sandbox_cookie(&app).await;

    let response = app
        .clone()
        .oneshot(post_json("/v1/ai/policy_suggest", &cookie, json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let ai_report_id = read_json(response).await["ai_report_id"]
        .as_str()
        .unwrap()
        .to_string();

    let apply = |confirm: bool, with_token: bool| {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/v1/admin/apply_policy_suggestion")
            .header("cookie", &cookie)
            .header("content-type", "application/json");
        if with_token {
            builder = builder.header("x-joygate-admin-token", "tkn-test");
        }
        builder
            .body(Body::from(
                json!({ "ai_report_id": ai_report_id.clone(), "confirm": confirm }).to_string(),
            ))
            .unwrap()
    };

    // no token
    let response = app.clone().oneshot(apply(true, false)).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // not completed yet
    let response = app.clone().oneshot(apply(true, true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let payload = read_json(response).await;
    assert_eq!(payload["error"], "JOB_NOT_COMPLETED");

    let response = app
        .clone()
        .oneshot(post_json("/v1/ai_jobs/tick", &cookie, json!({ "max_jobs": 5 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.clone().oneshot(apply(true, true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    // applying twice is allowed and repeatable
    let response = app.oneshot(apply(true, true)).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
}

#[tokio::test]
async fn credential_looking_context_ref_is_rejected() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;

    let response = app
        .oneshot(post_json(
            "/v1/ai/policy_suggest",
            &cookie,
            json!({ "context_ref": "bearer abc123" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn sidecar_events_land_in_the_ledger() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/audit/sidecar_safety_event",
            &cookie,
            json!({
                "severity": "WARN",
                "summary": "sidecar saw a hard stop",
                "charger_id": "charger-001",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(get("/v1/audit/ledger", &cookie))
        .await
        .unwrap();
    let ledger = read_json(response).await;
    let events = ledger["sidecar_safety_events"].as_array().unwrap();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0]["severity"], "WARN");
}

#[tokio::test]
async fn per_sandbox_rate_limit_returns_429() {
    let mut cfg = Config::default();
    cfg.rate_limit.per_sandbox_per_min = 2;
    let app = test_app(cfg);
    let cookie = sandbox_cookie(&app).await;

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(get("/v1/snapshot", &cookie))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
    let response = app.oneshot(get("/v1/snapshot", &cookie)).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    let payload = read_json(response).await;
    assert_eq!(payload["error"], "RATE_LIMITED");
}

#[tokio::test]
async fn loopback_subscription_target_is_rejected_by_default() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;

    let response = app
        .oneshot(post_json(
            "/v1/webhooks/subscriptions",
            &cookie,
            json!({
                "target_url": "https://127.0.0.1/hook",
                "event_types": ["HOLD_CREATED"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// -- local webhook receiver ------------------------------------------------

type ReceivedRequest = (HashMap<String, String>, String);

async fn read_http_request(
    stream: &mut TcpStream,
    buf: &mut Vec<u8>,
) -> Option<(HashMap<String, String>, Vec<u8>)> {
    fn find_blank_line(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n")
    }
    loop {
        if let Some(pos) = find_blank_line(buf) {
            let head = String::from_utf8_lossy(&buf[..pos]).to_string();
            let mut headers = HashMap::new();
            for line in head.lines().skip(1) {
                if let Some((name, value)) = line.split_once(':') {
                    headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_string());
                }
            }
            let content_length: usize = headers
                .get("content-length")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            let body_start = pos + 4;
            while buf.len() < body_start + content_length {
                let mut tmp = [0u8; 4096];
                let n = stream.read(&mut tmp).await.ok()?;
                if n == 0 {
                    return None;
                }
                buf.extend_from_slice(&tmp[..n]);
            }
            let body = buf[body_start..body_start + content_length].to_vec();
            buf.drain(..body_start + content_length);
            return Some((headers, body));
        }
        let mut tmp = [0u8; 4096];
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
    }
}

/// Minimal receiver: answers each request with the next queued status code
/// and reports what it saw on the channel.
async fn spawn_receiver(
    statuses: Vec<u16>,
) -> (u16, mpsc::UnboundedReceiver<ReceivedRequest>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    let queue = Arc::new(Mutex::new(VecDeque::from(statuses)));
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else { return };
            let tx = tx.clone();
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut buf = Vec::new();
                while let Some((headers, body)) = read_http_request(&mut stream, &mut buf).await {
                    let status = queue
                        .lock()
                        .map(|mut q| q.pop_front().unwrap_or(200))
                        .unwrap_or(200);
                    let _ = tx.send((headers, String::from_utf8_lossy(&body).to_string()));
                    let reply = format!("HTTP/1.1 {status} X\r\ncontent-length: 0\r\n\r\n");
                    if stream.write_all(reply.as_bytes()).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    (port, rx)
}

#[tokio::test]
async fn webhook_delivery_retries_until_accepted_and_signs_each_attempt() {
    let mut cfg = Config::default();
    cfg.webhooks.allow_http_targets = true;
    cfg.webhooks.allow_loopback_targets = true;
    let app = test_app(cfg);
    let cookie = sandbox_cookie(&app).await;

    let (port, mut rx) = spawn_receiver(vec![500, 500, 200]).await;
    let secret = "whsec_test";

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/webhooks/subscriptions",
            &cookie,
            json!({
                "target_url": format!("http://127.0.0.1:{port}/hook"),
                "event_types": ["HOLD_CREATED"],
                "secret": secret,
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // the reserve handler drains the outbox before answering
    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/reserve",
            &cookie,
            json!({
                "resource_type": "CHARGER",
                "resource_id": "charger-001",
                "joykey": "jk_hook",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let mut seen = Vec::new();
    while let Ok(req) = rx.try_recv() {
        seen.push(req);
    }
    assert_eq!(seen.len(), 3);
    for (headers, body) in &seen {
        let ts: i64 = headers
            .get("x-joygate-timestamp")
            .unwrap()
            .parse()
            .unwrap();
        let sig = headers.get("x-joygate-signature").unwrap();
        assert_eq!(sig, &webhook_signature(secret, ts, body));
        let payload: Value = serde_json::from_str(body).unwrap();
        assert_eq!(payload["event_type"], "HOLD_CREATED");
        assert_eq!(payload["object_type"], "hold");
    }

    let response = app
        .oneshot(get("/v1/webhooks/deliveries", &cookie))
        .await
        .unwrap();
    let payload = read_json(response).await;
    let delivery = &payload["deliveries"][0];
    assert_eq!(delivery["delivery_status"], "DELIVERED");
    assert_eq!(delivery["attempts"], 3);
    assert_eq!(delivery["last_status_code"], 200);
}

#[tokio::test]
async fn failed_delivery_records_http_error_code() {
    let mut cfg = Config::default();
    cfg.webhooks.allow_http_targets = true;
    cfg.webhooks.allow_loopback_targets = true;
    let app = test_app(cfg);
    let cookie = sandbox_cookie(&app).await;

    let (port, _rx) = spawn_receiver(vec![503, 503, 503]).await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/webhooks/subscriptions",
            &cookie,
            json!({
                "target_url": format!("http://127.0.0.1:{port}/hook"),
                "event_types": ["HOLD_CREATED"],
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/reserve",
            &cookie,
            json!({
                "resource_type": "CHARGER",
                "resource_id": "charger-002",
                "joykey": "jk_hook2",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get("/v1/webhooks/deliveries", &cookie))
        .await
        .unwrap();
    let payload = read_json(response).await;
    let delivery = &payload["deliveries"][0];
    assert_eq!(delivery["delivery_status"], "FAILED");
    assert_eq!(delivery["attempts"], 3);
    assert_eq!(delivery["last_error"], "http_503");
}

#[tokio::test]
async fn sandboxes_do_not_share_state() {
    let app = test_app(Config::default());
    let cookie_a = sandbox_cookie(&app).await;
    let cookie_b = sandbox_cookie(&app).await;
    assert_ne!(cookie_a, cookie_b);

    let response = app
        .clone()
        .oneshot(post_json(
            "/v1/reserve",
            &cookie_a,
            json!({
                "resource_type": "CHARGER",
                "resource_id": "charger-001",
                "joykey": "jk_iso",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // the same charger is still free in the other sandbox
    let response = app
        .oneshot(post_json(
            "/v1/reserve",
            &cookie_b,
            json!({
                "resource_type": "CHARGER",
                "resource_id": "charger-001",
                "joykey": "jk_other",
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn dashboard_reports_calendar_day() {
    let app = test_app(Config::default());
    let cookie = sandbox_cookie(&app).await;
    let _ = report_blocked(&app, &cookie, "charger-001").await;

    let response = app
        .oneshot(get("/v1/dashboard/today", &cookie))
        .await
        .unwrap();
    let today = read_json(response).await;
    assert_eq!(today["day_mode"], "CALENDAR");
    assert_eq!(today["chargers_total"], 3);
    assert_eq!(today["incidents_open"], 1);
}
