//! Incident lifecycle: creation with write-time cleanup, status transitions,
//! evidence-ref merging and the witness-SLA downgrade pass that runs on reads.

use chrono::{DateTime, Duration, Utc};
use joygate_config::Config;
use joygate_contracts::{
    AiInsightView, IncidentItem, IncidentStatus, IncidentType, InsightType, WebhookEventType,
};
use joygate_kernel::mint_id;

use crate::error::ApiError;
use crate::store::{AiInsight, Incident, Store, EVIDENCE_REFS_CAP, EVIDENCE_REF_MAX_CHARS};

/// Filters accepted by `GET /v1/incidents`.
#[derive(Debug, Default, Clone)]
pub struct IncidentFilter {
    pub incident_id: Option<String>,
    pub incident_type: Option<IncidentType>,
    pub incident_status: Option<IncidentStatus>,
    pub charger_id: Option<String>,
    pub segment_id: Option<String>,
}

pub fn incident_item(inc: &Incident) -> IncidentItem {
    IncidentItem {
        incident_id: inc.incident_id.clone(),
        incident_type: inc.incident_type,
        incident_status: inc.incident_status,
        charger_id: inc.charger_id.clone(),
        segment_id: inc.segment_id.clone(),
        snapshot_ref: inc.snapshot_ref.clone(),
        evidence_refs: inc.evidence_refs.clone(),
        ai_insights: inc
            .ai_insights
            .iter()
            .map(|i| AiInsightView {
                insight_type: i.insight_type,
                ai_report_id: i.ai_report_id.clone(),
                summary: i.summary.clone(),
            })
            .collect(),
    }
}

/// Appends refs in order, skipping duplicates, up to the cap. Over-long refs
/// are silently dropped here; the edge rejects them on direct reports.
pub fn merge_evidence_refs(target: &mut Vec<String>, incoming: &[String]) {
    for r in incoming {
        if target.len() >= EVIDENCE_REFS_CAP {
            break;
        }
        if r.is_empty() || r.chars().count() > EVIDENCE_REF_MAX_CHARS {
            continue;
        }
        if !target.iter().any(|e| e == r) {
            target.push(r.clone());
        }
    }
}

impl Store {
    pub fn create_incident(
        &mut self,
        cfg: &Config,
        incident_type: IncidentType,
        charger_id: Option<String>,
        segment_id: Option<String>,
        snapshot_ref: Option<String>,
        evidence_refs: &[String],
        now: DateTime<Utc>,
    ) -> String {
        self.cleanup_incidents(cfg, now);

        let incident_id = mint_id("inc");
        let mut refs = Vec::new();
        merge_evidence_refs(&mut refs, evidence_refs);
        let incident = Incident {
            incident_id: incident_id.clone(),
            incident_type,
            incident_status: IncidentStatus::Open,
            charger_id,
            segment_id,
            snapshot_ref,
            evidence_refs: refs,
            ai_insights: Vec::new(),
            created_at: now,
            status_updated_at: now,
        };
        let item = incident_item(&incident);
        self.incidents.insert(incident_id.clone(), incident);
        self.incident_order.push_back(incident_id.clone());
        self.emit_event(
            WebhookEventType::IncidentCreated,
            "incident",
            &incident_id,
            serde_json::to_value(&item).unwrap_or_default(),
            now,
        );
        incident_id
    }

    /// Explicit transition from `update_status`; invalid edges are 400.
    pub fn update_incident_status(
        &mut self,
        incident_id: &str,
        next: IncidentStatus,
        now: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        let inc = self
            .incidents
            .get_mut(incident_id)
            .ok_or_else(|| ApiError::NotFound(format!("unknown incident {incident_id}")))?;
        if !inc.incident_status.can_transition_to(next) {
            return Err(ApiError::Validation(format!(
                "transition {:?} -> {:?} is not allowed",
                inc.incident_status, next
            )));
        }
        if inc.incident_status == next {
            return Ok(());
        }
        inc.incident_status = next;
        inc.status_updated_at = now;
        let item = incident_item(inc);
        self.emit_event(
            WebhookEventType::IncidentStatusChanged,
            "incident",
            incident_id,
            serde_json::to_value(&item).unwrap_or_default(),
            now,
        );
        Ok(())
    }

    /// Moves the incident into EVIDENCE_CONFIRMED if the lifecycle allows it.
    /// Returns true only on an actual transition; re-entry keeps
    /// status_updated_at untouched.
    pub fn confirm_incident(&mut self, incident_id: &str, now: DateTime<Utc>) -> bool {
        let Some(inc) = self.incidents.get_mut(incident_id) else {
            return false;
        };
        match inc.incident_status {
            IncidentStatus::Open | IncidentStatus::Escalated | IncidentStatus::UnderObservation => {}
            IncidentStatus::EvidenceConfirmed | IncidentStatus::Resolved => return false,
        }
        inc.incident_status = IncidentStatus::EvidenceConfirmed;
        inc.status_updated_at = now;
        let item = incident_item(inc);
        self.emit_event(
            WebhookEventType::IncidentStatusChanged,
            "incident",
            incident_id,
            serde_json::to_value(&item).unwrap_or_default(),
            now,
        );
        true
    }

    /// Upserts an ai_insight by (insight_type, ai_report_id).
    pub fn upsert_insight(
        &mut self,
        incident_id: &str,
        insight_type: InsightType,
        ai_report_id: Option<String>,
        summary: String,
    ) {
        if let Some(inc) = self.incidents.get_mut(incident_id) {
            if let Some(slot) = inc
                .ai_insights
                .iter_mut()
                .find(|i| i.insight_type == insight_type && i.ai_report_id == ai_report_id)
            {
                slot.summary = summary;
            } else {
                inc.ai_insights.push(AiInsight {
                    insight_type,
                    ai_report_id,
                    summary,
                });
            }
        }
    }

    /// Write-time cleanup: expired RESOLVED records first, then pressure
    /// eviction while at or over the cap.
    fn cleanup_incidents(&mut self, cfg: &Config, now: DateTime<Utc>) {
        let expired: Vec<String> = self
            .incidents
            .values()
            .filter(|inc| {
                if inc.incident_status != IncidentStatus::Resolved {
                    return false;
                }
                let ttl = if inc.incident_type.is_low_retention() {
                    cfg.incidents.ttl_resolved_low_seconds
                } else {
                    cfg.incidents.ttl_resolved_high_seconds
                };
                inc.status_updated_at + Duration::seconds(ttl as i64) <= now
            })
            .map(|inc| inc.incident_id.clone())
            .collect();
        for id in expired {
            self.incidents.remove(&id);
        }
        self.incident_order.retain(|id| self.incidents.contains_key(id));

        while self.incidents.len() >= cfg.incidents.max_incidents {
            let victim = self
                .incident_order
                .iter()
                .find(|id| {
                    self.incidents
                        .get(*id)
                        .map(|i| i.incident_status == IncidentStatus::Resolved)
                        .unwrap_or(false)
                })
                .or_else(|| self.incident_order.front())
                .cloned();
            match victim {
                Some(id) => {
                    self.incidents.remove(&id);
                    self.incident_order.retain(|x| *x != id);
                }
                None => break,
            }
        }
    }

    /// SLA downgrade: runs under lock on every list/snapshot read. Aged
    /// non-terminal incidents at OPEN move to UNDER_OBSERVATION and get a
    /// VISION_AUDIT_REQUESTED insight recording the timeout.
    pub fn witness_sla_pass(&mut self, cfg: &Config, now: DateTime<Utc>) {
        let timeout_secs =
            cfg.scaled_minutes_secs(cfg.incidents.witness_sla_timeout_minutes) as i64;
        let aged: Vec<String> = self
            .incidents
            .values()
            .filter(|inc| {
                !inc.incident_status.is_terminal()
                    && inc.created_at + Duration::seconds(timeout_secs) <= now
            })
            .map(|inc| inc.incident_id.clone())
            .collect();
        for id in aged {
            let votes_seen = self.tallies.get(&id).map(|t| t.total).unwrap_or(0);
            let downgraded = {
                let Some(inc) = self.incidents.get_mut(&id) else { continue };
                if inc.incident_status == IncidentStatus::Open {
                    inc.incident_status = IncidentStatus::UnderObservation;
                    inc.status_updated_at = now;
                    true
                } else {
                    false
                }
            };
            let summary = format!(
                "witness SLA timeout: {}m, votes_seen={}, not confirmed -> downgrade triggered",
                cfg.incidents.witness_sla_timeout_minutes, votes_seen
            );
            self.upsert_insight(&id, InsightType::VisionAuditRequested, None, summary);
            if downgraded {
                let item = self.incidents.get(&id).map(incident_item);
                if let Some(item) = item {
                    self.emit_event(
                        WebhookEventType::IncidentStatusChanged,
                        "incident",
                        &id,
                        serde_json::to_value(&item).unwrap_or_default(),
                        now,
                    );
                }
            }
        }
    }

    /// Filtered list, newest first (created_at desc, then incident_id desc).
    pub fn incident_items(&self, filter: &IncidentFilter) -> Vec<IncidentItem> {
        let mut matched: Vec<&Incident> = self
            .incidents
            .values()
            .filter(|inc| {
                filter
                    .incident_id
                    .as_ref()
                    .map(|v| *v == inc.incident_id)
                    .unwrap_or(true)
                    && filter
                        .incident_type
                        .map(|v| v == inc.incident_type)
                        .unwrap_or(true)
                    && filter
                        .incident_status
                        .map(|v| v == inc.incident_status)
                        .unwrap_or(true)
                    && filter
                        .charger_id
                        .as_ref()
                        .map(|v| inc.charger_id.as_ref() == Some(v))
                        .unwrap_or(true)
                    && filter
                        .segment_id
                        .as_ref()
                        .map(|v| inc.segment_id.as_ref() == Some(v))
                        .unwrap_or(true)
            })
            .collect();
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then(b.incident_id.cmp(&a.incident_id))
        });
        matched.into_iter().map(incident_item).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (Config, Store, DateTime<Utc>) {
        let cfg = Config::default();
        let now = Utc::now();
        let store = Store::new(&cfg, now);
        (cfg, store, now)
    }

    fn report(store: &mut Store, cfg: &Config, now: DateTime<Utc>) -> String {
        store.create_incident(
            cfg,
            IncidentType::Blocked,
            Some("charger-001".to_string()),
            None,
            None,
            &[],
            now,
        )
    }

    #[test]
    fn create_emits_created_event_with_public_shape() {
        let (cfg, mut store, now) = setup();
        let id = report(&mut store, &cfg, now);
        assert!(id.starts_with("inc_"));
        let evt = store
            .outbox
            .iter()
            .find(|e| e.event_type == WebhookEventType::IncidentCreated)
            .unwrap();
        let keys: Vec<&String> = evt.data.as_object().unwrap().keys().collect();
        assert_eq!(keys.len(), 8);
        assert!(evt.data.get("created_at").is_none());
        assert!(evt.data.get("status_updated_at").is_none());
    }

    #[test]
    fn transitions_enforced() {
        let (cfg, mut store, now) = setup();
        let id = report(&mut store, &cfg, now);
        store
            .update_incident_status(&id, IncidentStatus::Resolved, now)
            .unwrap();
        let err = store
            .update_incident_status(&id, IncidentStatus::Open, now)
            .unwrap_err();
        assert!(matches!(err, ApiError::Validation(_)));
        // self-loop is fine and does not emit
        let before = store.outbox.len();
        store
            .update_incident_status(&id, IncidentStatus::Resolved, now)
            .unwrap();
        assert_eq!(store.outbox.len(), before);
    }

    #[test]
    fn confirm_preserves_timestamp_on_reentry() {
        let (cfg, mut store, now) = setup();
        let id = report(&mut store, &cfg, now);
        assert!(store.confirm_incident(&id, now));
        let first = store.incidents[&id].status_updated_at;
        assert!(!store.confirm_incident(&id, now + Duration::seconds(5)));
        assert_eq!(store.incidents[&id].status_updated_at, first);
    }

    #[test]
    fn resolved_low_retention_ages_out() {
        let (cfg, mut store, now) = setup();
        let id = store.create_incident(
            &cfg,
            IncidentType::NoShow,
            None,
            None,
            None,
            &[],
            now,
        );
        store
            .update_incident_status(&id, IncidentStatus::Resolved, now)
            .unwrap();
        // below the low TTL: survives the next create
        report(&mut store, &cfg, now + Duration::seconds(10));
        assert!(store.incidents.contains_key(&id));
        // past the low TTL: gone
        report(&mut store, &cfg, now + Duration::seconds(601));
        assert!(!store.incidents.contains_key(&id));
    }

    #[test]
    fn pressure_evicts_resolved_first_then_head() {
        let (mut cfg, mut store, now) = setup();
        cfg.incidents.max_incidents = 3;
        let a = report(&mut store, &cfg, now);
        let b = report(&mut store, &cfg, now);
        store
            .update_incident_status(&b, IncidentStatus::Resolved, now)
            .unwrap();
        let _c = report(&mut store, &cfg, now);
        // at cap; next create pops the resolved one, not the oldest
        let _d = report(&mut store, &cfg, now);
        assert!(!store.incidents.contains_key(&b));
        assert!(store.incidents.contains_key(&a));
        // at cap again with nothing resolved: the head goes
        let _e = report(&mut store, &cfg, now);
        assert!(!store.incidents.contains_key(&a));
    }

    #[test]
    fn sla_pass_downgrades_open_and_records_insight() {
        let (cfg, mut store, now) = setup();
        let id = report(&mut store, &cfg, now);
        let later = now + Duration::seconds(601); // 10 min SLA
        store.witness_sla_pass(&cfg, later);
        let inc = &store.incidents[&id];
        assert_eq!(inc.incident_status, IncidentStatus::UnderObservation);
        let insight = inc
            .ai_insights
            .iter()
            .find(|i| i.insight_type == InsightType::VisionAuditRequested)
            .unwrap();
        assert_eq!(
            insight.summary,
            "witness SLA timeout: 10m, votes_seen=0, not confirmed -> downgrade triggered"
        );
        // a second pass keeps the single insight (upsert, not append)
        store.witness_sla_pass(&cfg, later + Duration::seconds(60));
        assert_eq!(store.incidents[&id].ai_insights.len(), 1);
    }

    #[test]
    fn list_sorts_newest_first_and_filters() {
        let (cfg, mut store, now) = setup();
        let a = report(&mut store, &cfg, now);
        let b = report(&mut store, &cfg, now + Duration::seconds(1));
        let items = store.incident_items(&IncidentFilter::default());
        assert_eq!(items[0].incident_id, b);
        assert_eq!(items[1].incident_id, a);

        let only_a = store.incident_items(&IncidentFilter {
            incident_id: Some(a.clone()),
            ..Default::default()
        });
        assert_eq!(only_a.len(), 1);

        let none = store.incident_items(&IncidentFilter {
            charger_id: Some("charger-404".to_string()),
            ..Default::default()
        });
        assert!(none.is_empty());
    }

    #[test]
    fn evidence_refs_dedup_and_cap() {
        let mut refs = vec!["a".to_string()];
        merge_evidence_refs(
            &mut refs,
            &[
                "a".to_string(),
                "b".to_string(),
                "c".to_string(),
                "d".to_string(),
                "e".to_string(),
                "f".to_string(),
            ],
        );
        assert_eq!(refs, vec!["a", "b", "c", "d", "e"]);
        let long = "x".repeat(EVIDENCE_REF_MAX_CHARS + 1);
        let mut refs = Vec::new();
        merge_evidence_refs(&mut refs, &[long, "ok".to_string()]);
        assert_eq!(refs, vec!["ok"]);
    }
}
