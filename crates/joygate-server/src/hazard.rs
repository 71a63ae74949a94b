//! Segment hazard state machine. Witness votes open SOFT_BLOCKED hazards,
//! lazy rechecks escalate or clear them, and only a DONE work order may
//! unblock HARD_BLOCKED.

use chrono::{DateTime, Duration, Utc};
use joygate_config::Config;
use joygate_contracts::{
    DecisionBasis, DecisionType, HazardListItem, HazardLockMode, HazardSnapshot, HazardStatus,
    ObstacleType, SegmentState, WebhookEventType, WorkOrderStatus,
};
use joygate_kernel::hazard::{recheck_verdict, RecheckVerdict};
use joygate_kernel::{iso_z, mint_id};
use serde_json::json;

use crate::error::ApiError;
use crate::incident::merge_evidence_refs;
use crate::store::{HazardRecord, SegmentWitnessEvent, Store, WorkOrder};

impl Store {
    /// Handles one `witness/segment_respond` call. The witness event is
    /// always recorded; state effects depend on the declared segment state.
    pub fn segment_respond(
        &mut self,
        cfg: &Config,
        segment_id: &str,
        state: SegmentState,
        witness_joykey: &str,
        obstacle_type: Option<ObstacleType>,
        evidence_refs: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        if !self.witness_roster.contains_key(witness_joykey) {
            return Err(ApiError::PermissionDenied(format!(
                "joykey {witness_joykey} is not an allow-listed witness"
            )));
        }

        self.segment_witness_events
            .entry(segment_id.to_string())
            .or_default()
            .push(SegmentWitnessEvent {
                joykey: witness_joykey.to_string(),
                state,
                at: now,
            });

        match state {
            SegmentState::Blocked => {
                self.segment_blocked_vote(cfg, segment_id, obstacle_type, evidence_refs, now)
            }
            SegmentState::Passable => {
                if let Some(hz) = self.hazards.get_mut(segment_id) {
                    merge_evidence_refs(&mut hz.evidence_refs, evidence_refs);
                    hz.updated_at = now;
                    if hz.hazard_status == HazardStatus::HardBlocked {
                        let summary = format!(
                            "witness reports PASSABLE on hard-blocked segment {segment_id}; \
                             manual recheck requested"
                        );
                        self.append_decision(
                            DecisionType::WitnessRecheckRequested,
                            DecisionBasis::Witness,
                            vec![segment_id.to_string()],
                            &summary,
                            now,
                        );
                    }
                }
            }
            SegmentState::Unknown => {}
        }
        Ok(())
    }

    fn segment_blocked_vote(
        &mut self,
        cfg: &Config,
        segment_id: &str,
        obstacle_type: Option<ObstacleType>,
        evidence_refs: &[String],
        now: DateTime<Utc>,
    ) {
        let interval = cfg.hazard.recheck_interval_minutes;
        let due = now + Duration::seconds(cfg.scaled_minutes_secs(interval) as i64);
        match self.hazards.get_mut(segment_id) {
            None => {
                let mut refs = Vec::new();
                merge_evidence_refs(&mut refs, evidence_refs);
                let hz = HazardRecord {
                    hazard_id: mint_id("hz"),
                    segment_id: segment_id.to_string(),
                    hazard_status: HazardStatus::SoftBlocked,
                    hazard_lock_mode: Some(HazardLockMode::SoftRecheck),
                    recheck_due_at: Some(due),
                    recheck_interval_minutes: interval,
                    soft_recheck_consecutive_blocked: 0,
                    incident_id: None,
                    work_order_id: None,
                    obstacle_type,
                    evidence_refs: refs,
                    updated_at: now,
                };
                self.hazards.insert(segment_id.to_string(), hz);
                self.emit_hazard_changed(segment_id, now);
            }
            Some(hz) => match hz.hazard_status {
                HazardStatus::Open => {
                    hz.hazard_status = HazardStatus::SoftBlocked;
                    hz.hazard_lock_mode = Some(HazardLockMode::SoftRecheck);
                    hz.recheck_due_at = Some(due);
                    hz.soft_recheck_consecutive_blocked = 0;
                    if hz.obstacle_type.is_none() {
                        hz.obstacle_type = obstacle_type;
                    }
                    merge_evidence_refs(&mut hz.evidence_refs, evidence_refs);
                    hz.updated_at = now;
                    self.emit_hazard_changed(segment_id, now);
                }
                HazardStatus::SoftBlocked => {
                    // a live recheck deadline is never pushed by more votes
                    if hz.recheck_due_at.is_none() {
                        hz.recheck_due_at = Some(due);
                    }
                    merge_evidence_refs(&mut hz.evidence_refs, evidence_refs);
                    hz.updated_at = now;
                }
                HazardStatus::HardBlocked => {
                    merge_evidence_refs(&mut hz.evidence_refs, evidence_refs);
                    hz.updated_at = now;
                }
            },
        }
    }

    /// Lazy scheduler: every SOFT_BLOCKED hazard whose recheck is due gets a
    /// three-way verdict from fresh telemetry or recent witness votes.
    pub fn run_due_rechecks(&mut self, cfg: &Config, now: DateTime<Utc>) {
        let due: Vec<String> = self
            .hazards
            .values()
            .filter(|hz| {
                hz.hazard_status == HazardStatus::SoftBlocked
                    && hz.recheck_due_at.map(|d| d <= now).unwrap_or(false)
            })
            .map(|hz| hz.segment_id.clone())
            .collect();

        for segment_id in due {
            let has_fresh = self
                .segment_signals
                .get(&segment_id)
                .map(|sig| {
                    sig.last_passed_ts
                        >= now.timestamp() - cfg.hazard.freshness_window_seconds as i64
                })
                .unwrap_or(false);
            let vote_cutoff = now
                - Duration::seconds(
                    cfg.scaled_minutes_secs(cfg.hazard.segment_witness_sla_timeout_minutes) as i64,
                );
            let (mut passable, mut blocked) = (0u32, 0u32);
            if let Some(events) = self.segment_witness_events.get(&segment_id) {
                for ev in events.iter().filter(|ev| ev.at >= vote_cutoff) {
                    match ev.state {
                        SegmentState::Passable => passable += 1,
                        SegmentState::Blocked => blocked += 1,
                        SegmentState::Unknown => {}
                    }
                }
            }
            let verdict = recheck_verdict(
                has_fresh,
                passable,
                blocked,
                cfg.hazard.segment_witness_votes_required,
            );
            self.apply_recheck_verdict(cfg, &segment_id, verdict, now);
        }
    }

    fn apply_recheck_verdict(
        &mut self,
        cfg: &Config,
        segment_id: &str,
        verdict: RecheckVerdict,
        now: DateTime<Utc>,
    ) {
        let interval = cfg.scaled_minutes_secs(cfg.hazard.recheck_interval_minutes) as i64;
        let mut changed = false;
        let mut new_work_order: Option<String> = None;
        if let Some(hz) = self.hazards.get_mut(segment_id) {
            match verdict {
                RecheckVerdict::Passable => {
                    hz.hazard_status = HazardStatus::Open;
                    hz.hazard_lock_mode = None;
                    hz.recheck_due_at = None;
                    hz.soft_recheck_consecutive_blocked = 0;
                    hz.updated_at = now;
                    changed = true;
                }
                RecheckVerdict::Inconclusive => {
                    hz.recheck_due_at = Some(now + Duration::seconds(interval));
                    hz.updated_at = now;
                }
                RecheckVerdict::Blocked => {
                    hz.soft_recheck_consecutive_blocked += 1;
                    if hz.soft_recheck_consecutive_blocked
                        < cfg.hazard.soft_escalate_after_rechecks
                    {
                        hz.recheck_due_at = Some(now + Duration::seconds(interval));
                    } else {
                        hz.hazard_status = HazardStatus::HardBlocked;
                        hz.hazard_lock_mode = Some(HazardLockMode::HardManual);
                        hz.recheck_due_at = None;
                        if hz.work_order_id.is_none() {
                            let wo_id = mint_id("wo");
                            hz.work_order_id = Some(wo_id.clone());
                            new_work_order = Some(wo_id);
                        }
                        changed = true;
                    }
                    hz.updated_at = now;
                }
            }
        }
        if let Some(wo_id) = new_work_order {
            self.work_orders.insert(
                wo_id.clone(),
                WorkOrder {
                    work_order_id: wo_id.clone(),
                    work_order_status: WorkOrderStatus::Open,
                    segment_id: Some(segment_id.to_string()),
                    updated_at: now,
                },
            );
            self.emit_event(
                WebhookEventType::WorkOrderStatusChanged,
                "work_order",
                &wo_id,
                json!({
                    "work_order_id": wo_id,
                    "work_order_status": WorkOrderStatus::Open,
                    "segment_id": segment_id,
                }),
                now,
            );
        }
        if changed {
            self.emit_hazard_changed(segment_id, now);
        }
    }

    /// `work_orders/report`. A DONE report against a matching HARD_BLOCKED
    /// segment is the only path that unblocks it.
    pub fn work_order_report(
        &mut self,
        work_order_id: &str,
        status: WorkOrderStatus,
        segment_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        if let Some(wo) = self.work_orders.get_mut(work_order_id) {
            wo.work_order_status = status;
            wo.updated_at = now;
        } else {
            self.work_orders.insert(
                work_order_id.to_string(),
                WorkOrder {
                    work_order_id: work_order_id.to_string(),
                    work_order_status: status,
                    segment_id: segment_id.map(str::to_string),
                    updated_at: now,
                },
            );
        }
        self.emit_event(
            WebhookEventType::WorkOrderStatusChanged,
            "work_order",
            work_order_id,
            json!({
                "work_order_id": work_order_id,
                "work_order_status": status,
                "segment_id": segment_id,
            }),
            now,
        );

        if status != WorkOrderStatus::Done {
            return Ok(());
        }
        let Some(segment_id) = segment_id.filter(|s| !s.is_empty()) else {
            return Ok(());
        };
        let unblocked = match self.hazards.get_mut(segment_id) {
            Some(hz) if hz.hazard_status == HazardStatus::HardBlocked => {
                let matches = hz
                    .work_order_id
                    .as_deref()
                    .map(|id| id == work_order_id)
                    .unwrap_or(true);
                if matches {
                    hz.hazard_status = HazardStatus::Open;
                    hz.hazard_lock_mode = None;
                    hz.recheck_due_at = None;
                    hz.work_order_id = None;
                    hz.soft_recheck_consecutive_blocked = 0;
                    hz.updated_at = now;
                    true
                } else {
                    false
                }
            }
            _ => false,
        };
        if unblocked {
            self.emit_hazard_changed(segment_id, now);
        }
        Ok(())
    }

    fn emit_hazard_changed(&mut self, segment_id: &str, now: DateTime<Utc>) {
        let Some(hz) = self.hazards.get(segment_id) else { return };
        let data = json!({
            "hazard_id": hz.hazard_id,
            "segment_id": hz.segment_id,
            "hazard_status": hz.hazard_status,
            "hazard_lock_mode": hz.hazard_lock_mode,
            "work_order_id": hz.work_order_id,
            "obstacle_type": hz.obstacle_type,
        });
        let hazard_id = hz.hazard_id.clone();
        self.emit_event(
            WebhookEventType::HazardStatusChanged,
            "hazard",
            &hazard_id,
            data,
            now,
        );
    }

    pub fn hazard_snapshots(&self) -> Vec<HazardSnapshot> {
        let mut items: Vec<&HazardRecord> = self.hazards.values().collect();
        items.sort_by(|a, b| a.segment_id.cmp(&b.segment_id));
        items
            .into_iter()
            .map(|hz| HazardSnapshot {
                hazard_id: hz.hazard_id.clone(),
                segment_id: hz.segment_id.clone(),
                hazard_status: hz.hazard_status,
                hazard_lock_mode: hz.hazard_lock_mode,
                recheck_due_at: hz.recheck_due_at.map(iso_z),
                recheck_interval_minutes: hz.recheck_interval_minutes,
                soft_recheck_consecutive_blocked: hz.soft_recheck_consecutive_blocked,
                incident_id: hz.incident_id.clone(),
                work_order_id: hz.work_order_id.clone(),
                obstacle_type: hz.obstacle_type,
                evidence_refs: hz.evidence_refs.clone(),
                updated_at: iso_z(hz.updated_at),
            })
            .collect()
    }

    pub fn hazard_list_items(&self) -> Vec<HazardListItem> {
        let mut items: Vec<&HazardRecord> = self.hazards.values().collect();
        items.sort_by(|a, b| a.segment_id.cmp(&b.segment_id));
        items
            .into_iter()
            .map(|hz| HazardListItem {
                segment_id: hz.segment_id.clone(),
                hazard_status: hz.hazard_status,
                obstacle_type: hz.obstacle_type,
                evidence_refs: hz.evidence_refs.clone(),
                updated_at: iso_z(hz.updated_at),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SEG: &str = "cell_15_42";

    fn setup() -> (Config, Store, DateTime<Utc>) {
        let cfg = Config::default();
        let now = Utc::now();
        let store = Store::new(&cfg, now);
        (cfg, store, now)
    }

    fn vote(
        store: &mut Store,
        cfg: &Config,
        joykey: &str,
        state: SegmentState,
        now: DateTime<Utc>,
    ) {
        store
            .segment_respond(cfg, SEG, state, joykey, None, &[], now)
            .unwrap();
    }

    #[test]
    fn blocked_vote_opens_soft_hazard() {
        let (cfg, mut store, now) = setup();
        vote(&mut store, &cfg, "w1", SegmentState::Blocked, now);
        let hz = &store.hazards[SEG];
        assert_eq!(hz.hazard_status, HazardStatus::SoftBlocked);
        assert_eq!(hz.hazard_lock_mode, Some(HazardLockMode::SoftRecheck));
        assert!(hz.recheck_due_at.is_some());
    }

    #[test]
    fn more_blocked_votes_never_push_the_recheck() {
        let (cfg, mut store, now) = setup();
        vote(&mut store, &cfg, "w1", SegmentState::Blocked, now);
        let due = store.hazards[SEG].recheck_due_at;
        vote(&mut store, &cfg, "w2", SegmentState::Blocked, now + Duration::seconds(30));
        assert_eq!(store.hazards[SEG].recheck_due_at, due);
    }

    /// Drives SEG to HARD_BLOCKED: blocked votes, then two due rechecks that
    /// each see two in-window BLOCKED votes and no telemetry.
    fn escalate_to_hard(store: &mut Store, cfg: &Config, now: DateTime<Utc>) -> DateTime<Utc> {
        vote(store, cfg, "w1", SegmentState::Blocked, now);
        vote(store, cfg, "w2", SegmentState::Blocked, now);
        let t1 = now + Duration::seconds(301);
        store.run_due_rechecks(cfg, t1);
        vote(store, cfg, "w1", SegmentState::Blocked, t1);
        vote(store, cfg, "w2", SegmentState::Blocked, t1);
        let t2 = t1 + Duration::seconds(301);
        store.run_due_rechecks(cfg, t2);
        t2
    }

    #[test]
    fn escalation_after_consecutive_blocked_rechecks() {
        let (cfg, mut store, now) = setup();
        vote(&mut store, &cfg, "w1", SegmentState::Blocked, now);
        vote(&mut store, &cfg, "w2", SegmentState::Blocked, now);

        // first due recheck: 2 blocked votes, no telemetry -> BLOCKED, count 1
        let t1 = now + Duration::seconds(301);
        store.run_due_rechecks(&cfg, t1);
        let hz = &store.hazards[SEG];
        assert_eq!(hz.hazard_status, HazardStatus::SoftBlocked);
        assert_eq!(hz.soft_recheck_consecutive_blocked, 1);

        // second: count 2 >= threshold -> HARD with a work order
        vote(&mut store, &cfg, "w1", SegmentState::Blocked, t1);
        vote(&mut store, &cfg, "w2", SegmentState::Blocked, t1);
        let t2 = t1 + Duration::seconds(301);
        store.run_due_rechecks(&cfg, t2);
        let hz = &store.hazards[SEG];
        assert_eq!(hz.hazard_status, HazardStatus::HardBlocked);
        assert_eq!(hz.hazard_lock_mode, Some(HazardLockMode::HardManual));
        assert!(hz.recheck_due_at.is_none());
        let wo_id = hz.work_order_id.clone().unwrap();
        assert!(wo_id.starts_with("wo_"));
        assert!(store.work_orders.contains_key(&wo_id));
    }

    #[test]
    fn passable_witness_cannot_unblock_hard() {
        let (cfg, mut store, now) = setup();
        let t = escalate_to_hard(&mut store, &cfg, now);
        assert_eq!(store.hazards[SEG].hazard_status, HazardStatus::HardBlocked);

        vote(&mut store, &cfg, "w3", SegmentState::Passable, t + Duration::seconds(5));
        assert_eq!(store.hazards[SEG].hazard_status, HazardStatus::HardBlocked);
        assert!(store
            .decisions
            .iter()
            .any(|d| d.decision_type == DecisionType::WitnessRecheckRequested));
    }

    #[test]
    fn done_work_order_unblocks_hard() {
        let (cfg, mut store, now) = setup();
        let _ = escalate_to_hard(&mut store, &cfg, now);
        let wo_id = store.hazards[SEG].work_order_id.clone().unwrap();

        // wrong work order id: still blocked
        store
            .work_order_report("wo_ffffffffffff", WorkOrderStatus::Done, Some(SEG), now)
            .unwrap();
        assert_eq!(store.hazards[SEG].hazard_status, HazardStatus::HardBlocked);

        // non-DONE status: still blocked
        store
            .work_order_report(&wo_id, WorkOrderStatus::InProgress, Some(SEG), now)
            .unwrap();
        assert_eq!(store.hazards[SEG].hazard_status, HazardStatus::HardBlocked);

        store
            .work_order_report(&wo_id, WorkOrderStatus::Done, Some(SEG), now)
            .unwrap();
        let hz = &store.hazards[SEG];
        assert_eq!(hz.hazard_status, HazardStatus::Open);
        assert!(hz.hazard_lock_mode.is_none());
        assert!(hz.work_order_id.is_none());
        assert_eq!(hz.soft_recheck_consecutive_blocked, 0);
    }

    #[test]
    fn fresh_telemetry_clears_soft_hazard() {
        let (cfg, mut store, now) = setup();
        vote(&mut store, &cfg, "w1", SegmentState::Blocked, now);

        let t1 = now + Duration::seconds(301);
        store
            .segment_passed(
                SEG,
                "rider",
                None,
                t1.timestamp() - 5,
                joygate_contracts::TruthInputSource::Simulator,
                t1,
            )
            .unwrap();
        store.run_due_rechecks(&cfg, t1);
        let hz = &store.hazards[SEG];
        assert_eq!(hz.hazard_status, HazardStatus::Open);
        assert!(hz.recheck_due_at.is_none());
    }

    #[test]
    fn inconclusive_recheck_reschedules() {
        let (cfg, mut store, now) = setup();
        vote(&mut store, &cfg, "w1", SegmentState::Blocked, now);
        // only one vote in the window (< votes_required 2) -> INCONCLUSIVE
        let t1 = now + Duration::seconds(301);
        store.run_due_rechecks(&cfg, t1);
        let hz = &store.hazards[SEG];
        assert_eq!(hz.hazard_status, HazardStatus::SoftBlocked);
        assert_eq!(hz.soft_recheck_consecutive_blocked, 0);
        assert_eq!(hz.recheck_due_at, Some(t1 + Duration::seconds(300)));
    }

    #[test]
    fn unknown_vote_records_event_only() {
        let (cfg, mut store, now) = setup();
        vote(&mut store, &cfg, "w1", SegmentState::Unknown, now);
        assert!(store.hazards.is_empty());
        assert_eq!(store.segment_witness_events[SEG].len(), 1);
    }
}
