//! The per-sandbox aggregate. Every map and queue of the coordination engine
//! lives here, guarded by one tokio mutex per sandbox; critical sections stay
//! CPU-bound, anything that touches the network runs outside the lock.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use joygate_config::Config;
use joygate_contracts::{
    AiJobStatus, AiJobType, Audience, ChargerView, DecisionBasis, DecisionType, DeliveryStatus,
    DispatchReasonCode, HazardLockMode, HazardStatus, HoldView, IncidentStatus, IncidentType,
    InsightType, ModelTier, ObstacleType, SegmentState, SlotState, TruthInputSource,
    WebhookEventPayload, WebhookEventType, WorkOrderStatus,
};
use joygate_kernel::witness::WitnessTally;
use joygate_kernel::{iso_z, mint_id};
use serde::Serialize;
use serde_json::Value;

pub const OUTBOX_CAP: usize = 1000;
pub const DRAIN_BATCH: usize = 200;
pub const DECISIONS_CAP: usize = 2000;
pub const SEGMENT_SIGNALS_CAP: usize = 200;
pub const EVIDENCE_REFS_CAP: usize = 5;
pub const EVIDENCE_REF_MAX_CHARS: usize = 120;
pub const SUBSCRIPTIONS_ENABLED_CAP: usize = 50;
pub const DELIVERIES_VIEW_CAP: usize = 50;

#[derive(Debug, Clone)]
pub struct ChargerSlot {
    pub slot_state: SlotState,
    pub hold_id: Option<String>,
    pub joykey: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Hold {
    pub hold_id: String,
    pub charger_id: String,
    pub joykey: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AiInsight {
    pub insight_type: InsightType,
    pub ai_report_id: Option<String>,
    pub summary: String,
}

#[derive(Debug, Clone)]
pub struct Incident {
    pub incident_id: String,
    pub incident_type: IncidentType,
    pub incident_status: IncidentStatus,
    pub charger_id: Option<String>,
    pub segment_id: Option<String>,
    pub snapshot_ref: Option<String>,
    pub evidence_refs: Vec<String>,
    pub ai_insights: Vec<AiInsight>,
    pub created_at: DateTime<Utc>,
    pub status_updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct HazardRecord {
    pub hazard_id: String,
    pub segment_id: String,
    pub hazard_status: HazardStatus,
    pub hazard_lock_mode: Option<HazardLockMode>,
    pub recheck_due_at: Option<DateTime<Utc>>,
    pub recheck_interval_minutes: u64,
    pub soft_recheck_consecutive_blocked: u32,
    pub incident_id: Option<String>,
    pub work_order_id: Option<String>,
    pub obstacle_type: Option<ObstacleType>,
    pub evidence_refs: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SegmentWitnessEvent {
    pub joykey: String,
    pub state: SegmentState,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SegmentSignal {
    pub segment_id: String,
    pub last_passed_ts: i64,
    pub last_passed_at: DateTime<Utc>,
    pub joykey: String,
    pub truth_input_source: TruthInputSource,
    pub fleet_id: Option<String>,
}

/// Frozen world geometry captured at vision-audit creation. Deep copy; later
/// robot movement never leaks into an already-accepted audit.
#[derive(Debug, Clone, Serialize)]
pub struct RenderSnapshot {
    pub robot_tracks: Vec<RobotTrack>,
    pub chargers: Vec<ChargerCell>,
    pub blocked_cell: Option<(i32, i32)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RobotTrack {
    pub joykey: String,
    pub cells: Vec<(i32, i32)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ChargerCell {
    pub charger_id: String,
    pub cell: (i32, i32),
}

#[derive(Debug, Clone)]
pub enum JobPayload {
    VisionAudit {
        render_snapshot: RenderSnapshot,
    },
    DispatchExplain {
        hold_id: String,
        audience: Audience,
        dispatch_reason_codes: Vec<DispatchReasonCode>,
        obstacle_type: ObstacleType,
        charger_id: Option<String>,
        context_ref_hash: Option<String>,
    },
    PolicySuggest {
        context_ref_sha256: Option<String>,
    },
}

#[derive(Debug, Clone)]
pub struct AiJob {
    pub ai_job_id: String,
    pub ai_report_id: String,
    pub ai_job_type: AiJobType,
    pub ai_job_status: AiJobStatus,
    pub incident_id: Option<String>,
    pub model_tier: ModelTier,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub lease_until: Option<DateTime<Utc>>,
    pub payload: JobPayload,
}

#[derive(Debug, Clone)]
pub struct Reputation {
    pub joykey: String,
    pub robot_score: f64,
    pub vendor: Option<String>,
    pub risk_flag: bool,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ScoreEvent {
    pub score_event_id: String,
    pub joykey: String,
    pub event_kind: String,
    pub delta: f64,
    pub score_after: f64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Decision {
    pub decision_id: String,
    pub decision_type: DecisionType,
    pub decision_basis: DecisionBasis,
    pub references: Vec<String>,
    pub summary: String,
    pub prev_bundle_hash: Option<String>,
    pub bundle_hash: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SidecarEvent {
    pub event_id: String,
    pub severity: String,
    pub summary: String,
    pub charger_id: Option<String>,
    pub segment_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct Subscription {
    pub subscription_id: String,
    pub target_url: String,
    pub event_types: Vec<WebhookEventType>,
    pub is_enabled: bool,
    pub created_at: DateTime<Utc>,
    pub secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_id: String,
    pub event_id: String,
    pub event_type: WebhookEventType,
    pub subscription_id: String,
    pub target_url: String,
    pub delivery_status: DeliveryStatus,
    pub attempts: u32,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub payload: WebhookEventPayload,
}

#[derive(Debug, Clone)]
pub struct WorkOrder {
    pub work_order_id: String,
    pub work_order_status: WorkOrderStatus,
    pub segment_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CongestionHit {
    pub joykey: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct Store {
    pub chargers: HashMap<String, ChargerSlot>,
    pub holds: HashMap<String, Hold>,
    pub holds_by_joykey: HashMap<String, String>,
    pub congestion: HashMap<String, Vec<CongestionHit>>,
    pub congestion_emitted: HashSet<(String, String, i64)>,

    pub incidents: HashMap<String, Incident>,
    pub incident_order: VecDeque<String>,
    pub tallies: HashMap<String, WitnessTally>,

    pub hazards: HashMap<String, HazardRecord>,
    pub segment_witness_events: HashMap<String, Vec<SegmentWitnessEvent>>,
    pub segment_signals: HashMap<String, SegmentSignal>,

    pub ai_jobs: HashMap<String, AiJob>,
    pub ai_jobs_by_report: HashMap<String, String>,
    pub ai_queue: VecDeque<String>,
    pub ai_job_order: VecDeque<String>,
    pub ai_daily_calls_count: u32,
    pub ai_day_index: u64,

    pub reputations: HashMap<String, Reputation>,
    pub score_events: Vec<ScoreEvent>,
    pub seen_score_event_ids: HashSet<String>,
    pub witness_roster: HashMap<String, String>,

    pub decisions: VecDeque<Decision>,
    pub sidecar_events: Vec<SidecarEvent>,
    pub last_bundle_hash: Option<String>,

    pub subscriptions: HashMap<String, Subscription>,
    pub subscription_order: Vec<String>,
    pub outbox: VecDeque<WebhookEventPayload>,
    pub deliveries: Vec<Delivery>,
    pub delivery_keys: HashSet<(String, String)>,

    pub work_orders: HashMap<String, WorkOrder>,

    pub world: RenderSnapshot,
    pub boot_at: DateTime<Utc>,
}

impl Store {
    /// Deterministic seed: demo chargers, the configured witness roster with
    /// baseline reputations, and a fixed world layout for audit rendering.
    pub fn new(cfg: &Config, now: DateTime<Utc>) -> Store {
        let mut chargers = HashMap::new();
        let mut charger_cells = Vec::new();
        for (i, charger_id) in ["charger-001", "charger-002", "charger-003"].iter().enumerate() {
            chargers.insert(
                charger_id.to_string(),
                ChargerSlot {
                    slot_state: SlotState::Free,
                    hold_id: None,
                    joykey: None,
                },
            );
            charger_cells.push(ChargerCell {
                charger_id: charger_id.to_string(),
                cell: (4 + 2 * i as i32, 10),
            });
        }

        let mut reputations = HashMap::new();
        let mut witness_roster = HashMap::new();
        let mut robot_tracks = Vec::new();
        for (i, (joykey, vendor)) in cfg.witness.allowlist.iter().enumerate() {
            witness_roster.insert(joykey.clone(), vendor.clone());
            reputations.insert(
                joykey.clone(),
                Reputation {
                    joykey: joykey.clone(),
                    robot_score: 60.0,
                    vendor: Some(vendor.clone()),
                    risk_flag: false,
                    updated_at: now,
                },
            );
            let x = i as i32;
            robot_tracks.push(RobotTrack {
                joykey: joykey.clone(),
                cells: vec![(x, 0), (x, 1), (x, 2)],
            });
        }

        Store {
            chargers,
            holds: HashMap::new(),
            holds_by_joykey: HashMap::new(),
            congestion: HashMap::new(),
            congestion_emitted: HashSet::new(),
            incidents: HashMap::new(),
            incident_order: VecDeque::new(),
            tallies: HashMap::new(),
            hazards: HashMap::new(),
            segment_witness_events: HashMap::new(),
            segment_signals: HashMap::new(),
            ai_jobs: HashMap::new(),
            ai_jobs_by_report: HashMap::new(),
            ai_queue: VecDeque::new(),
            ai_job_order: VecDeque::new(),
            ai_daily_calls_count: 0,
            ai_day_index: 0,
            reputations,
            score_events: Vec::new(),
            seen_score_event_ids: HashSet::new(),
            witness_roster,
            decisions: VecDeque::new(),
            sidecar_events: Vec::new(),
            last_bundle_hash: None,
            subscriptions: HashMap::new(),
            subscription_order: Vec::new(),
            outbox: VecDeque::new(),
            deliveries: Vec::new(),
            delivery_keys: HashSet::new(),
            work_orders: HashMap::new(),
            world: RenderSnapshot {
                robot_tracks,
                chargers: charger_cells,
                blocked_cell: Some((5, 9)),
            },
            boot_at: now,
        }
    }

    /// Appends to the outbox; overflow drops the oldest event.
    pub fn emit_event(
        &mut self,
        event_type: WebhookEventType,
        object_type: &str,
        object_id: &str,
        data: Value,
        now: DateTime<Utc>,
    ) {
        while self.outbox.len() >= OUTBOX_CAP {
            self.outbox.pop_front();
        }
        self.outbox.push_back(WebhookEventPayload {
            event_id: mint_id("evt"),
            event_type,
            occurred_at: iso_z(now),
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
            data,
        });
    }

    pub fn charger_views(&self) -> Vec<ChargerView> {
        let mut ids: Vec<&String> = self.chargers.keys().collect();
        ids.sort();
        ids.into_iter()
            .map(|id| {
                let slot = &self.chargers[id];
                ChargerView {
                    charger_id: id.clone(),
                    slot_state: slot.slot_state,
                    hold_id: slot.hold_id.clone(),
                    joykey: slot.joykey.clone(),
                }
            })
            .collect()
    }

    pub fn hold_views(&self) -> Vec<HoldView> {
        let mut holds: Vec<&Hold> = self.holds.values().collect();
        holds.sort_by(|a, b| a.hold_id.cmp(&b.hold_id));
        holds
            .into_iter()
            .map(|h| HoldView {
                hold_id: h.hold_id.clone(),
                charger_id: h.charger_id.clone(),
                joykey: h.joykey.clone(),
                expires_at: iso_z(h.expires_at),
                is_priority_compensated: false,
                compensation_reason: None,
                queue_position_drift: None,
                incident_id: None,
            })
            .collect()
    }
}
