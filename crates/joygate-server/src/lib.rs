//! HTTP surface of the coordination service. Handlers resolve a sandbox,
//! take its lock for a short CPU-bound critical section, and run webhook
//! delivery and AI provider calls strictly outside any lock.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use joygate_config::Config;
use joygate_contracts::{
    ApplyPolicySuggestionRequest, ChargingRequest, DispatchExplainRequest, IncidentStatus,
    IncidentType, PolicySuggestRequest, ReportBlockedRequest, ReserveRequest,
    SegmentPassedRequest, SegmentRespondRequest, SidecarSafetyEventRequest,
    SubscriptionCreateRequest, TickRequest, UpdateStatusRequest, VisionAuditRequest,
    WitnessRespondRequest, SnapshotView,
};
use joygate_kernel::{context_ref_rejection, is_segment_id, iso_z, parse_flexible_ts};
use serde_json::json;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;

mod aijob;
mod dashboard;
mod error;
mod hazard;
mod incident;
mod ledger;
mod provider;
mod reputation;
mod reservation;
mod sandbox;
mod store;
mod telemetry;
mod webhook;
mod witness;

pub use error::ApiError;

use aijob::TickTask;
use incident::IncidentFilter;
use provider::{render_snapshot, AuditOutcome, Provider};
use sandbox::{claim_sandbox_id, SandboxClaim, SandboxRegistry};
use store::Store;

const SANDBOX_COOKIE: &str = "joygate_sandbox";
const COOKIE_MAX_AGE_SECONDS: u64 = 7 * 24 * 3600;

#[derive(Clone)]
pub struct AppState {
    cfg: Arc<Config>,
    registry: Arc<Mutex<SandboxRegistry>>,
    provider: Provider,
    http: reqwest::Client,
}

impl AppState {
    pub fn new(cfg: Config) -> AppState {
        let provider = Provider::from_config(&cfg);
        AppState {
            cfg: Arc::new(cfg),
            registry: Arc::new(Mutex::new(SandboxRegistry::default())),
            provider,
            http: webhook::delivery_client(),
        }
    }
}

pub fn build_app(state: AppState) -> Router {
    Router::new()
        .route("/bootstrap", get(bootstrap))
        .route("/v1/reserve", post(reserve))
        .route("/v1/oracle/start_charging", post(start_charging))
        .route("/v1/oracle/stop_charging", post(stop_charging))
        .route("/v1/snapshot", get(snapshot))
        .route("/v1/policy", get(policy))
        .route("/v1/hazards", get(hazards))
        .route("/v1/incidents", get(list_incidents))
        .route("/v1/incidents/report_blocked", post(report_blocked))
        .route("/v1/incidents/update_status", post(update_status))
        .route("/v1/witness/respond", post(witness_respond))
        .route("/v1/witness/segment_respond", post(segment_respond))
        .route("/v1/telemetry/segment_passed", post(segment_passed))
        .route("/v1/ai/vision_audit", post(vision_audit))
        .route("/v1/ai_jobs/vision_audit", post(vision_audit))
        .route("/v1/ai/dispatch_explain", post(dispatch_explain))
        .route("/v1/ai/policy_suggest", post(policy_suggest))
        .route("/v1/ai_jobs/tick", post(ai_tick))
        .route("/v1/ai_jobs", get(list_ai_jobs))
        .route("/v1/admin/apply_policy_suggestion", post(apply_policy_suggestion))
        .route("/v1/audit/ledger", get(audit_ledger))
        .route("/v1/audit/sidecar_safety_event", post(sidecar_safety_event))
        .route("/v1/work_orders/report", post(work_order_report))
        .route("/v1/webhooks/subscriptions", post(create_subscription).get(list_subscriptions))
        .route("/v1/webhooks/deliveries", get(list_deliveries))
        .route("/v1/reputation", get(reputation))
        .route("/v1/score_events", get(score_events))
        .route("/v1/vendor_scores", get(vendor_scores))
        .route("/v1/dashboard/today", get(dashboard_today))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Sandbox plumbing
// ---------------------------------------------------------------------------

fn cookie_sandbox_id(headers: &HeaderMap) -> Option<String> {
    let raw = headers.get(header::COOKIE)?.to_str().ok()?;
    for pair in raw.split(';') {
        let value = pair
            .trim()
            .strip_prefix(SANDBOX_COOKIE)
            .and_then(|rest| rest.strip_prefix('='));
        if let Some(value) = value {
            return Some(value.to_string());
        }
    }
    None
}

fn header_triple(headers: &HeaderMap) -> Option<(&str, &str, &str)> {
    let id = headers.get("x-joygate-sandbox")?.to_str().ok()?;
    let ts = headers.get("x-joygate-sandbox-timestamp")?.to_str().ok()?;
    let sig = headers.get("x-joygate-sandbox-signature")?.to_str().ok()?;
    Some((id, ts, sig))
}

fn client_ip(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Resolves the sandbox for `/v1/*` traffic: claim, rate limit, acquire.
async fn resolve_store(
    state: &AppState,
    headers: &HeaderMap,
    now: DateTime<Utc>,
) -> Result<Arc<Mutex<Store>>, ApiError> {
    let claim = claim_sandbox_id(
        &state.cfg,
        cookie_sandbox_id(headers).as_deref(),
        header_triple(headers),
        now,
    );
    let sandbox_id = match claim {
        SandboxClaim::Cookie(id) | SandboxClaim::Header(id) => id,
        SandboxClaim::None => {
            return Err(ApiError::Validation(
                "no sandbox resolved; call GET /bootstrap first".to_string(),
            ))
        }
    };
    let mut registry = state.registry.lock().await;
    registry.check_rate(&state.cfg, &sandbox_id, &client_ip(headers), now)?;
    registry.acquire(&state.cfg, &sandbox_id, now)
}

/// Drains the outbox and runs deliveries. Called after every handler that may
/// have enqueued events; the store lock is never held across a send.
async fn drain_and_deliver(state: &AppState, store: &Arc<Mutex<Store>>, now: DateTime<Utc>) {
    let jobs = {
        let mut guard = store.lock().await;
        guard.drain_outbox(&state.cfg, now)
    };
    if jobs.is_empty() {
        return;
    }
    let mut results = Vec::with_capacity(jobs.len());
    for job in &jobs {
        results.push(webhook::deliver(&state.http, &state.cfg, job).await);
    }
    let mut guard = store.lock().await;
    let done = Utc::now();
    for result in &results {
        guard.record_delivery_result(result, done);
    }
}

// ---------------------------------------------------------------------------
// Edge validation helpers
// ---------------------------------------------------------------------------

fn require_clean<'a>(field: &str, value: &'a str, max: usize) -> Result<&'a str, ApiError> {
    if value.is_empty() {
        return Err(ApiError::invalid(field, "must not be empty"));
    }
    if value.trim() != value {
        return Err(ApiError::invalid(field, "must not carry surrounding whitespace"));
    }
    if value.chars().count() > max {
        return Err(ApiError::invalid(field, "too long"));
    }
    Ok(value)
}

fn check_report_evidence(refs: &[String]) -> Result<(), ApiError> {
    if refs.len() > 20 {
        return Err(ApiError::invalid("evidence_refs", "more than 20 items"));
    }
    for r in refs {
        if r.chars().count() > 256 {
            return Err(ApiError::invalid("evidence_refs", "item longer than 256 chars"));
        }
    }
    Ok(())
}

fn check_context_ref(context_ref: Option<&str>) -> Result<(), ApiError> {
    if let Some(c) = context_ref {
        require_clean("context_ref", c, 64)?;
        if let Some(reason) = context_ref_rejection(c) {
            return Err(ApiError::invalid("context_ref", reason));
        }
    }
    Ok(())
}

fn joykey_header(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get("x-joykey")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::invalid("X-JoyKey", "header is required"))
}

fn require_admin(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(expected) = state.cfg.admin.god_token.as_deref() else {
        return Ok(());
    };
    let provided = headers
        .get("x-joygate-admin-token")
        .and_then(|v| v.to_str().ok());
    if provided == Some(expected) {
        Ok(())
    } else {
        Err(ApiError::PermissionDenied("admin token required".to_string()))
    }
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn bootstrap(State(state): State<AppState>, headers: HeaderMap) -> impl IntoResponse {
    let now = Utc::now();
    let claimed = cookie_sandbox_id(&headers);
    let sandbox_id = {
        let mut registry = state.registry.lock().await;
        registry.bootstrap(&state.cfg, claimed.as_deref(), now)
    };
    let mut response_headers = HeaderMap::new();
    if let Some(id) = &sandbox_id {
        let cookie = format!(
            "{SANDBOX_COOKIE}={id}; Path=/; HttpOnly; SameSite=lax; Max-Age={COOKIE_MAX_AGE_SECONDS}"
        );
        if let Ok(value) = cookie.parse() {
            response_headers.insert(header::SET_COOKIE, value);
        }
    }
    (response_headers, Json(json!({ "sandbox_id": sandbox_id })))
}

async fn reserve(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ReserveRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    require_clean("resource_type", &req.resource_type, 64)?;
    require_clean("resource_id", &req.resource_id, 64)?;
    require_clean("joykey", &req.joykey, 64)?;
    if req.action != "HOLD" {
        return Err(ApiError::invalid("action", "only HOLD is supported"));
    }
    let store = resolve_store(&state, &headers, now).await?;
    let result = {
        let mut guard = store.lock().await;
        guard.reserve(&state.cfg, &req.resource_id, &req.joykey, now)
    };
    drain_and_deliver(&state, &store, now).await;
    let (hold_id, ttl_seconds) = result?;
    Ok(Json(json!({ "hold_id": hold_id, "ttl_seconds": ttl_seconds })))
}

async fn start_charging(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChargingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    charging(&state, &headers, &req, true).await
}

async fn stop_charging(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChargingRequest>,
) -> Result<impl IntoResponse, ApiError> {
    charging(&state, &headers, &req, false).await
}

async fn charging(
    state: &AppState,
    headers: &HeaderMap,
    req: &ChargingRequest,
    start: bool,
) -> Result<Json<serde_json::Value>, ApiError> {
    let now = Utc::now();
    require_clean("hold_id", &req.hold_id, 64)?;
    require_clean("charger_id", &req.charger_id, 64)?;
    let store = resolve_store(state, headers, now).await?;
    let ok = {
        let mut guard = store.lock().await;
        if start {
            guard.start_charging(&req.hold_id, &req.charger_id, now)
        } else {
            guard.stop_charging(&req.hold_id, &req.charger_id, now)
        }
    };
    drain_and_deliver(state, &store, now).await;
    let truth_event = if start { "START_CHARGING" } else { "STOP_CHARGING" };
    Ok(Json(json!({ "ok": ok, "truth_event": truth_event })))
}

async fn snapshot(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let store = resolve_store(&state, &headers, now).await?;
    let view = {
        let mut guard = store.lock().await;
        guard.purge_expired_holds(now);
        guard.witness_sla_pass(&state.cfg, now);
        guard.run_due_rechecks(&state.cfg, now);
        SnapshotView {
            snapshot_at: iso_z(now),
            chargers: guard.charger_views(),
            holds: guard.hold_views(),
            hazards: guard.hazard_snapshots(),
            segment_passed_signals: guard.segment_signal_views(),
        }
    };
    drain_and_deliver(&state, &store, now).await;
    Ok(Json(view))
}

async fn policy(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.cfg.policy_map())
}

async fn hazards(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let store = resolve_store(&state, &headers, now).await?;
    let items = {
        let mut guard = store.lock().await;
        guard.run_due_rechecks(&state.cfg, now);
        guard.hazard_list_items()
    };
    drain_and_deliver(&state, &store, now).await;
    Ok(Json(json!({ "hazards": items })))
}

fn parse_enum<T: serde::de::DeserializeOwned>(field: &str, raw: &str) -> Result<T, ApiError> {
    serde_json::from_value(json!(raw)).map_err(|_| ApiError::invalid(field, "unknown value"))
}

async fn list_incidents(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let mut filter = IncidentFilter {
        incident_id: params.get("incident_id").cloned(),
        charger_id: params.get("charger_id").cloned(),
        segment_id: params.get("segment_id").cloned(),
        ..Default::default()
    };
    if let Some(raw) = params.get("incident_type") {
        filter.incident_type = Some(parse_enum::<IncidentType>("incident_type", raw)?);
    }
    if let Some(raw) = params.get("incident_status") {
        filter.incident_status = Some(parse_enum::<IncidentStatus>("incident_status", raw)?);
    }
    let store = resolve_store(&state, &headers, now).await?;
    let items = {
        let mut guard = store.lock().await;
        guard.witness_sla_pass(&state.cfg, now);
        guard.incident_items(&filter)
    };
    drain_and_deliver(&state, &store, now).await;
    Ok(Json(json!({ "incidents": items })))
}

async fn report_blocked(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ReportBlockedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    require_clean("charger_id", &req.charger_id, 64)?;
    if let Some(seg) = &req.segment_id {
        if !is_segment_id(seg) {
            return Err(ApiError::invalid("segment_id", "expected cell_<int>_<int>"));
        }
    }
    if let Some(snap) = &req.snapshot_ref {
        require_clean("snapshot_ref", snap, 256)?;
    }
    check_report_evidence(&req.evidence_refs)?;
    let store = resolve_store(&state, &headers, now).await?;
    let incident_id = {
        let mut guard = store.lock().await;
        guard.create_incident(
            &state.cfg,
            req.incident_type,
            Some(req.charger_id.clone()),
            req.segment_id.clone(),
            req.snapshot_ref.clone(),
            &req.evidence_refs,
            now,
        )
    };
    drain_and_deliver(&state, &store, now).await;
    Ok(Json(json!({ "incident_id": incident_id })))
}

async fn update_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    require_clean("incident_id", &req.incident_id, 64)?;
    let store = resolve_store(&state, &headers, now).await?;
    let result = {
        let mut guard = store.lock().await;
        guard.update_incident_status(&req.incident_id, req.incident_status, now)
    };
    drain_and_deliver(&state, &store, now).await;
    result?;
    Ok(StatusCode::NO_CONTENT)
}

async fn witness_respond(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<WitnessRespondRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let joykey = joykey_header(&headers)?;
    require_clean("incident_id", &req.incident_id, 64)?;
    require_clean("charger_id", &req.charger_id, 64)?;
    check_report_evidence(&req.evidence_refs)?;
    let store = resolve_store(&state, &headers, now).await?;
    let result = {
        let mut guard = store.lock().await;
        guard.witness_respond(
            &state.cfg,
            &req.incident_id,
            &req.charger_id,
            req.charger_state,
            &joykey,
            req.points_event_id.as_deref(),
            &req.evidence_refs,
            now,
        )
    };
    drain_and_deliver(&state, &store, now).await;
    result?;
    Ok(StatusCode::NO_CONTENT)
}

async fn segment_respond(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SegmentRespondRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let joykey = joykey_header(&headers)?;
    if !is_segment_id(&req.segment_id) {
        return Err(ApiError::invalid("segment_id", "expected cell_<int>_<int>"));
    }
    require_clean("points_event_id", &req.points_event_id, 64)?;
    let segment_state = req
        .segment_state
        .or(req.hazard_status)
        .ok_or_else(|| ApiError::invalid("segment_state", "is required"))?;
    check_report_evidence(&req.evidence_refs)?;
    let store = resolve_store(&state, &headers, now).await?;
    let result = {
        let mut guard = store.lock().await;
        guard.segment_respond(
            &state.cfg,
            &req.segment_id,
            segment_state,
            &joykey,
            req.obstacle_type,
            &req.evidence_refs,
            now,
        )
    };
    drain_and_deliver(&state, &store, now).await;
    result?;
    Ok(StatusCode::NO_CONTENT)
}

async fn segment_passed(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SegmentPassedRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    require_clean("joykey", &req.joykey, 64)?;
    if req.segment_ids.is_empty() || req.segment_ids.len() > 200 {
        return Err(ApiError::invalid("segment_ids", "expected 1..200 items"));
    }
    for seg in &req.segment_ids {
        if !is_segment_id(seg) {
            return Err(ApiError::invalid("segment_ids", "expected cell_<int>_<int>"));
        }
    }
    let ts = parse_flexible_ts(&req.event_occurred_at)
        .ok_or_else(|| ApiError::invalid("event_occurred_at", "not an epoch or ISO-8601 time"))?
        .timestamp();
    let store = resolve_store(&state, &headers, now).await?;
    let result = {
        let mut guard = store.lock().await;
        let mut out = Ok(());
        for seg in &req.segment_ids {
            out = guard.segment_passed(
                seg,
                &req.joykey,
                req.fleet_id.as_deref(),
                ts,
                req.truth_input_source,
                now,
            );
            if out.is_err() {
                break;
            }
        }
        out
    };
    drain_and_deliver(&state, &store, now).await;
    result?;
    Ok(StatusCode::NO_CONTENT)
}

async fn vision_audit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<VisionAuditRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    require_clean("incident_id", &req.incident_id, 64)?;
    if let Some(snap) = &req.snapshot_ref {
        require_clean("snapshot_ref", snap, 256)?;
    }
    check_report_evidence(&req.evidence_refs)?;
    let store = resolve_store(&state, &headers, now).await?;
    let accepted = {
        let mut guard = store.lock().await;
        guard.create_vision_audit(
            &state.cfg,
            &req.incident_id,
            req.snapshot_ref.clone(),
            &req.evidence_refs,
            req.model_tier,
            now,
        )
    };
    drain_and_deliver(&state, &store, now).await;
    Ok((StatusCode::ACCEPTED, Json(accepted?)))
}

async fn dispatch_explain(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DispatchExplainRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    require_clean("hold_id", &req.hold_id, 64)?;
    if req.dispatch_reason_codes.is_empty() {
        return Err(ApiError::invalid("dispatch_reason_codes", "must not be empty"));
    }
    check_context_ref(req.context_ref.as_deref())?;
    let store = resolve_store(&state, &headers, now).await?;
    let accepted = {
        let mut guard = store.lock().await;
        guard.create_dispatch_explain(
            &state.cfg,
            &req.hold_id,
            req.audience,
            req.dispatch_reason_codes.clone(),
            req.obstacle_type,
            req.context_ref.as_deref(),
            req.model_tier,
            now,
        )
    };
    drain_and_deliver(&state, &store, now).await;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn policy_suggest(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<PolicySuggestRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    check_context_ref(req.context_ref.as_deref())?;
    let store = resolve_store(&state, &headers, now).await?;
    let accepted = {
        let mut guard = store.lock().await;
        guard.create_policy_suggest(
            &state.cfg,
            req.incident_id.as_deref(),
            req.context_ref.as_deref(),
            req.model_tier,
            now,
        )
    };
    drain_and_deliver(&state, &store, now).await;
    Ok((StatusCode::ACCEPTED, Json(accepted)))
}

async fn ai_tick(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TickRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let store = resolve_store(&state, &headers, now).await?;

    // phase 1: lease work under the lock
    let tasks = {
        let mut guard = store.lock().await;
        guard.tick_collect(&state.cfg, req.max_jobs, now)
    };
    let processed = tasks.len();
    let mut completed = 0usize;

    for task in tasks {
        match task {
            TickTask::VisionAudit {
                ai_job_id,
                lease_until,
                use_budget,
                render,
                incident,
                ..
            } => {
                // phase 2: render + provider, no lock held
                let result = if !use_budget {
                    Ok(AuditOutcome::budget_skipped())
                } else {
                    match render_snapshot(&render) {
                        Ok(image) => match &incident {
                            Some(item) => Ok(state.provider.vision_audit(&image, item).await),
                            None => Err("incident vanished before audit".to_string()),
                        },
                        Err(err) => Err(err.to_string()),
                    }
                };
                // phase 3: guarded write-back
                let done = Utc::now();
                let mut guard = store.lock().await;
                if guard.finish_vision_audit(&ai_job_id, lease_until, result, done) {
                    completed += 1;
                }
            }
            TickTask::Synth { ai_job_id, lease_until } => {
                let done = Utc::now();
                let mut guard = store.lock().await;
                if guard.finish_synth_job(&ai_job_id, lease_until, done) {
                    completed += 1;
                }
            }
        }
    }

    drain_and_deliver(&state, &store, now).await;
    Ok(Json(json!({ "processed": processed, "completed": completed })))
}

async fn list_ai_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let store = resolve_store(&state, &headers, now).await?;
    let items = {
        let guard = store.lock().await;
        guard.ai_job_items()
    };
    Ok(Json(json!({ "ai_jobs": items })))
}

async fn apply_policy_suggestion(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ApplyPolicySuggestionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    require_admin(&state, &headers)?;
    require_clean("ai_report_id", &req.ai_report_id, 64)?;
    let store = resolve_store(&state, &headers, now).await?;
    let result = {
        let mut guard = store.lock().await;
        guard.apply_policy_suggestion(&req.ai_report_id, req.confirm, now)
    };
    drain_and_deliver(&state, &store, now).await;
    result?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "applied": true }))))
}

async fn audit_ledger(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let store = resolve_store(&state, &headers, now).await?;
    let (decisions, sidecar) = {
        let guard = store.lock().await;
        (guard.decision_views(), guard.sidecar_event_views())
    };
    Ok(Json(json!({
        "audit_status": "CHAINED",
        "decisions": decisions,
        "sidecar_safety_events": sidecar,
    })))
}

async fn sidecar_safety_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SidecarSafetyEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    require_clean("summary", &req.summary, 512)?;
    require_clean("severity", &req.severity, 16)?;
    let store = resolve_store(&state, &headers, now).await?;
    {
        let mut guard = store.lock().await;
        guard.append_sidecar_event(
            &req.severity,
            &req.summary,
            req.charger_id.clone(),
            req.segment_id.clone(),
            now,
        );
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn work_order_report(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<joygate_contracts::WorkOrderReportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    require_clean("work_order_id", &req.work_order_id, 64)?;
    if let Some(seg) = &req.segment_id {
        if !is_segment_id(seg) {
            return Err(ApiError::invalid("segment_id", "expected cell_<int>_<int>"));
        }
    }
    let store = resolve_store(&state, &headers, now).await?;
    let result = {
        let mut guard = store.lock().await;
        guard.work_order_report(
            &req.work_order_id,
            req.work_order_status,
            req.segment_id.as_deref(),
            now,
        )
    };
    drain_and_deliver(&state, &store, now).await;
    result?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_subscription(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<SubscriptionCreateRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let store = resolve_store(&state, &headers, now).await?;
    let view = {
        let mut guard = store.lock().await;
        guard.create_subscription(
            &state.cfg,
            &req.target_url,
            &req.event_types,
            req.secret.clone(),
            req.is_enabled,
            now,
        )?
    };
    Ok(Json(view))
}

async fn list_subscriptions(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let store = resolve_store(&state, &headers, now).await?;
    let views = {
        let guard = store.lock().await;
        guard.subscription_views()
    };
    Ok(Json(json!({ "subscriptions": views })))
}

async fn list_deliveries(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let store = resolve_store(&state, &headers, now).await?;
    let views = {
        let guard = store.lock().await;
        guard.delivery_views()
    };
    Ok(Json(json!({ "deliveries": views })))
}

async fn reputation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let joykey = params
        .get("joykey")
        .ok_or_else(|| ApiError::invalid("joykey", "query parameter is required"))?;
    let store = resolve_store(&state, &headers, now).await?;
    let view = {
        let guard = store.lock().await;
        guard.reputation_view(joykey)
    };
    let view = view.ok_or_else(|| ApiError::NotFound(format!("unknown joykey {joykey}")))?;
    Ok(Json(view))
}

async fn score_events(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let limit = match params.get("limit") {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::invalid("limit", "not an integer"))?,
        None => 50,
    };
    let store = resolve_store(&state, &headers, now).await?;
    let views = {
        let guard = store.lock().await;
        guard.score_event_views(limit)
    };
    Ok(Json(json!({ "score_events": views })))
}

async fn vendor_scores(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let store = resolve_store(&state, &headers, now).await?;
    let views = {
        let guard = store.lock().await;
        guard.vendor_score_views(params.get("fleet_id").map(String::as_str))
    };
    Ok(Json(json!({ "vendor_scores": views })))
}

async fn dashboard_today(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let now = Utc::now();
    let store = resolve_store(&state, &headers, now).await?;
    let today = {
        let mut guard = store.lock().await;
        guard.witness_sla_pass(&state.cfg, now);
        guard.dashboard_today(&state.cfg, now)
    };
    drain_and_deliver(&state, &store, now).await;
    Ok(Json(today))
}

// ---------------------------------------------------------------------------
// Serving
// ---------------------------------------------------------------------------

/// Held for the process lifetime; dropping it releases the advisory lock.
pub struct ProcessLock {
    _file: std::fs::File,
}

/// The in-memory sandbox model requires exactly one process. Refuses to start
/// when another instance holds the advisory lock.
pub fn acquire_process_lock(cfg: &Config) -> Result<ProcessLock, String> {
    let file = std::fs::File::options()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&cfg.server.lock_file)
        .map_err(|err| format!("cannot open lock file {}: {err}", cfg.server.lock_file))?;
    match file.try_lock() {
        Ok(()) => Ok(ProcessLock { _file: file }),
        Err(_) => Err(format!(
            "another instance holds {}; the in-memory sandbox model requires exactly one worker",
            cfg.server.lock_file
        )),
    }
}

pub async fn serve(cfg: Config) -> Result<(), String> {
    let _lock = acquire_process_lock(&cfg)?;
    let listen_addr = cfg.server.listen_addr.clone();
    let state = AppState::new(cfg);
    let app = build_app(state);
    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .map_err(|err| format!("cannot bind {listen_addr}: {err}"))?;
    tracing::info!(%listen_addr, "listening");
    axum::serve(listener, app)
        .await
        .map_err(|err| format!("server error: {err}"))
}
