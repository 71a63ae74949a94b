use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const API_VERSION: &str = "1.0.0";

// ---------------------------------------------------------------------------
// Enumerations (authoritative wire values, SCREAMING_SNAKE_CASE)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlotState {
    Free,
    Held,
    Charging,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentType {
    NoPlug,
    BlockedByOther,
    Blocked,
    Hijacked,
    UnknownOccupancy,
    Overstay,
    NoShow,
    Other,
}

impl IncidentType {
    /// Low-retention types age out of the store on the short resolved TTL.
    pub fn is_low_retention(self) -> bool {
        matches!(
            self,
            IncidentType::NoShow | IncidentType::Other | IncidentType::Overstay | IncidentType::NoPlug
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Open,
    Resolved,
    Escalated,
    UnderObservation,
    EvidenceConfirmed,
}

impl IncidentStatus {
    /// Allowed lifecycle transitions, self-loops included for idempotence.
    pub fn can_transition_to(self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        if self == next {
            return true;
        }
        match self {
            Open => matches!(next, Escalated | UnderObservation | EvidenceConfirmed | Resolved),
            Escalated => matches!(next, UnderObservation | EvidenceConfirmed | Resolved),
            UnderObservation => matches!(next, EvidenceConfirmed | Escalated | Resolved),
            EvidenceConfirmed => matches!(next, Resolved),
            Resolved => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, IncidentStatus::Resolved)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChargerState {
    Free,
    Occupied,
    UnknownOccupancy,
}

impl ChargerState {
    pub const ALL: [ChargerState; 3] = [
        ChargerState::Free,
        ChargerState::Occupied,
        ChargerState::UnknownOccupancy,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ChargerState::Free => "FREE",
            ChargerState::Occupied => "OCCUPIED",
            ChargerState::UnknownOccupancy => "UNKNOWN_OCCUPANCY",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HazardStatus {
    Open,
    SoftBlocked,
    HardBlocked,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HazardLockMode {
    SoftRecheck,
    HardManual,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SegmentState {
    Passable,
    Blocked,
    Unknown,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TruthInputSource {
    Simulator,
    Ocpp,
    ThirdPartyApi,
    QrScan,
    Vision,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkOrderStatus {
    Open,
    InProgress,
    Done,
    Failed,
    Escalated,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AiJobType {
    VisionAudit,
    DispatchExplain,
    PolicySuggest,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AiJobStatus {
    Accepted,
    InProgress,
    Completed,
    Failed,
}

impl AiJobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, AiJobStatus::Completed | AiJobStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelTier {
    Flash,
    Pro,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObstacleType {
    IceVehicle,
    Construction,
    ChargerFault,
    BlockedByCharger,
    Unknown,
    RoutingClosure,
    RoutingDetour,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Audience {
    User,
    Admin,
    System,
}

impl Audience {
    pub fn as_str(self) -> &'static str {
        match self {
            Audience::User => "USER",
            Audience::Admin => "ADMIN",
            Audience::System => "SYSTEM",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchReasonCode {
    QuotaExceeded,
    ChargerBusy,
    IncidentReported,
    WitnessConfirmed,
    VisionConfirmed,
    SegmentHazardSignal,
    SegmentFreshnessSignal,
    BudgetSkipped,
    SafetyFallback,
    PolicyRule,
    Other,
}

impl DispatchReasonCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DispatchReasonCode::QuotaExceeded => "QUOTA_EXCEEDED",
            DispatchReasonCode::ChargerBusy => "CHARGER_BUSY",
            DispatchReasonCode::IncidentReported => "INCIDENT_REPORTED",
            DispatchReasonCode::WitnessConfirmed => "WITNESS_CONFIRMED",
            DispatchReasonCode::VisionConfirmed => "VISION_CONFIRMED",
            DispatchReasonCode::SegmentHazardSignal => "SEGMENT_HAZARD_SIGNAL",
            DispatchReasonCode::SegmentFreshnessSignal => "SEGMENT_FRESHNESS_SIGNAL",
            DispatchReasonCode::BudgetSkipped => "BUDGET_SKIPPED",
            DispatchReasonCode::SafetyFallback => "SAFETY_FALLBACK",
            DispatchReasonCode::PolicyRule => "POLICY_RULE",
            DispatchReasonCode::Other => "OTHER",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookEventType {
    IncidentCreated,
    IncidentStatusChanged,
    AiJobStatusChanged,
    HazardStatusChanged,
    WorkOrderStatusChanged,
    HoldCreated,
    HoldExpired,
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionBasis {
    Policy,
    Human,
    Witness,
    Ai,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecisionType {
    PolicySuggested,
    RerouteSuggested,
    WitnessRecheckRequested,
    PolicyApplied,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InsightType {
    VisionAuditRequested,
    VisionAuditResult,
    WitnessTally,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum RobotTier {
    A,
    B,
    C,
    D,
}

impl RobotTier {
    pub fn for_score(score: f64) -> RobotTier {
        if score >= 80.0 {
            RobotTier::A
        } else if score >= 60.0 {
            RobotTier::B
        } else if score >= 40.0 {
            RobotTier::C
        } else {
            RobotTier::D
        }
    }
}

// ---------------------------------------------------------------------------
// Public views
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiInsightView {
    pub insight_type: InsightType,
    #[serde(default)]
    pub ai_report_id: Option<String>,
    pub summary: String,
}

/// Exactly the 8 documented fields; internal timestamps never leak here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentItem {
    pub incident_id: String,
    pub incident_type: IncidentType,
    pub incident_status: IncidentStatus,
    pub charger_id: Option<String>,
    pub segment_id: Option<String>,
    pub snapshot_ref: Option<String>,
    pub evidence_refs: Vec<String>,
    pub ai_insights: Vec<AiInsightView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargerView {
    pub charger_id: String,
    pub slot_state: SlotState,
    pub hold_id: Option<String>,
    pub joykey: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HoldView {
    pub hold_id: String,
    pub charger_id: String,
    pub joykey: String,
    pub expires_at: String,
    pub is_priority_compensated: bool,
    pub compensation_reason: Option<String>,
    pub queue_position_drift: Option<i64>,
    pub incident_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HazardSnapshot {
    pub hazard_id: String,
    pub segment_id: String,
    pub hazard_status: HazardStatus,
    pub hazard_lock_mode: Option<HazardLockMode>,
    pub recheck_due_at: Option<String>,
    pub recheck_interval_minutes: u64,
    pub soft_recheck_consecutive_blocked: u32,
    pub incident_id: Option<String>,
    pub work_order_id: Option<String>,
    pub obstacle_type: Option<ObstacleType>,
    pub evidence_refs: Vec<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HazardListItem {
    pub segment_id: String,
    pub hazard_status: HazardStatus,
    pub obstacle_type: Option<ObstacleType>,
    pub evidence_refs: Vec<String>,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentSignalView {
    pub segment_id: String,
    pub last_passed_ts: i64,
    pub last_passed_at: String,
    pub joykey: String,
    pub truth_input_source: TruthInputSource,
    pub fleet_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotView {
    pub snapshot_at: String,
    pub chargers: Vec<ChargerView>,
    pub holds: Vec<HoldView>,
    pub hazards: Vec<HazardSnapshot>,
    pub segment_passed_signals: Vec<SegmentSignalView>,
}

/// List view for AI jobs: only the five public fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiJobItem {
    pub ai_job_id: String,
    pub ai_job_type: AiJobType,
    pub ai_job_status: AiJobStatus,
    pub incident_id: Option<String>,
    pub model_tier: ModelTier,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiJobAccepted {
    pub ai_report_id: String,
    pub status: AiJobStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionView {
    pub subscription_id: String,
    pub target_url: String,
    pub event_types: Vec<WebhookEventType>,
    pub is_enabled: bool,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryView {
    pub delivery_id: String,
    pub event_id: String,
    pub event_type: WebhookEventType,
    pub subscription_id: String,
    pub target_url: String,
    pub delivery_status: DeliveryStatus,
    pub attempts: u32,
    pub last_status_code: Option<u16>,
    pub last_error: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionView {
    pub decision_id: String,
    pub decision_type: DecisionType,
    pub decision_basis: DecisionBasis,
    pub references: Vec<String>,
    pub summary: String,
    pub prev_bundle_hash: Option<String>,
    pub bundle_hash: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SidecarSafetyEventView {
    pub event_id: String,
    pub severity: String,
    pub summary: String,
    pub charger_id: Option<String>,
    pub segment_id: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationView {
    pub joykey: String,
    pub robot_score: f64,
    pub robot_tier: RobotTier,
    pub vote_weight: f64,
    pub risk_flag: bool,
    pub robot_score_updated_at: String,
    pub vendor: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreEventView {
    pub score_event_id: String,
    pub joykey: String,
    pub event_kind: String,
    pub delta: f64,
    pub score_after: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VendorScoreView {
    pub fleet_id: String,
    pub robot_avg_score: f64,
    pub ops_baseline: f64,
    pub total_score: f64,
    pub robots_counted: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DashboardToday {
    pub day_mode: String,
    pub day_key: String,
    pub holds_active: usize,
    pub chargers_total: usize,
    pub incidents_open: usize,
    pub incidents_resolved_today: usize,
    pub hazards_soft: usize,
    pub hazards_hard: usize,
    pub ai_jobs_completed_today: usize,
    pub webhook_deliveries_today: usize,
    pub decisions_total: usize,
}

/// Outbox entry; also the body POSTed to webhook targets (canonical JSON).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEventPayload {
    pub event_id: String,
    pub event_type: WebhookEventType,
    pub occurred_at: String,
    pub object_type: String,
    pub object_id: String,
    pub data: Value,
}

// ---------------------------------------------------------------------------
// Request bodies
// ---------------------------------------------------------------------------

fn default_hold_action() -> String {
    "HOLD".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReserveRequest {
    pub resource_type: String,
    pub resource_id: String,
    pub joykey: String,
    #[serde(default = "default_hold_action")]
    pub action: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChargingRequest {
    pub hold_id: String,
    pub charger_id: String,
    #[serde(default)]
    pub meter_session_id: Option<String>,
    #[serde(default)]
    pub event_occurred_at: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportBlockedRequest {
    pub charger_id: String,
    pub incident_type: IncidentType,
    #[serde(default)]
    pub segment_id: Option<String>,
    #[serde(default)]
    pub snapshot_ref: Option<String>,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateStatusRequest {
    pub incident_id: String,
    pub incident_status: IncidentStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WitnessRespondRequest {
    pub incident_id: String,
    pub charger_id: String,
    pub charger_state: ChargerState,
    #[serde(default)]
    pub points_event_id: Option<String>,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

/// Body carries either `segment_state` or the legacy `hazard_status` alias.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentRespondRequest {
    pub segment_id: String,
    #[serde(default)]
    pub segment_state: Option<SegmentState>,
    #[serde(default)]
    pub hazard_status: Option<SegmentState>,
    pub points_event_id: String,
    #[serde(default)]
    pub obstacle_type: Option<ObstacleType>,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SegmentPassedRequest {
    pub joykey: String,
    #[serde(default)]
    pub fleet_id: Option<String>,
    pub segment_ids: Vec<String>,
    pub event_occurred_at: Value,
    pub truth_input_source: TruthInputSource,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VisionAuditRequest {
    pub incident_id: String,
    #[serde(default)]
    pub snapshot_ref: Option<String>,
    #[serde(default)]
    pub evidence_refs: Vec<String>,
    #[serde(default)]
    pub model_tier: Option<ModelTier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchExplainRequest {
    pub hold_id: String,
    #[serde(default)]
    pub obstacle_type: Option<ObstacleType>,
    pub audience: Audience,
    pub dispatch_reason_codes: Vec<DispatchReasonCode>,
    #[serde(default)]
    pub context_ref: Option<String>,
    #[serde(default)]
    pub model_tier: Option<ModelTier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicySuggestRequest {
    #[serde(default)]
    pub incident_id: Option<String>,
    #[serde(default)]
    pub context_ref: Option<String>,
    #[serde(default)]
    pub model_tier: Option<ModelTier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TickRequest {
    pub max_jobs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApplyPolicySuggestionRequest {
    pub ai_report_id: String,
    pub confirm: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SidecarSafetyEventRequest {
    #[serde(default = "default_severity")]
    pub severity: String,
    pub summary: String,
    #[serde(default)]
    pub charger_id: Option<String>,
    #[serde(default)]
    pub segment_id: Option<String>,
}

fn default_severity() -> String {
    "INFO".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WorkOrderReportRequest {
    pub work_order_id: String,
    pub work_order_status: WorkOrderStatus,
    #[serde(default)]
    pub segment_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SubscriptionCreateRequest {
    pub target_url: String,
    pub event_types: Vec<WebhookEventType>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_true")]
    pub is_enabled: bool,
}

fn default_true() -> bool {
    true
}
