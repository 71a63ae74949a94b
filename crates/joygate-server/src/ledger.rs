//! Append-only decision ledger with a bundle-hash chain, plus the sidecar
//! safety-event log. Summaries are clamped before they are hashed so the
//! chain covers exactly what readers see.

use chrono::{DateTime, Utc};
use joygate_contracts::{
    DecisionBasis, DecisionType, DecisionView, SidecarSafetyEventView,
};
use joygate_kernel::{canonical_json, clamp_summary, iso_z, mint_id, sha256_hex};
use serde_json::json;

use crate::store::{Decision, SidecarEvent, Store, DECISIONS_CAP};

impl Store {
    pub fn append_decision(
        &mut self,
        decision_type: DecisionType,
        decision_basis: DecisionBasis,
        references: Vec<String>,
        summary: &str,
        now: DateTime<Utc>,
    ) -> String {
        let decision_id = mint_id("dec");
        let summary = clamp_summary(summary);
        let prev = self.last_bundle_hash.clone();

        let seed = json!({
            "decision_id": decision_id,
            "decision_type": decision_type,
            "decision_basis": decision_basis,
            "references": references,
            "summary": summary,
            "prev_bundle_hash": prev,
            "created_at": iso_z(now),
        });
        // JCS canonicalization of a value we built ourselves cannot fail;
        // fall back to compact serialization rather than poisoning the chain.
        let canonical = canonical_json(&seed).unwrap_or_else(|_| seed.to_string());
        let bundle_hash = sha256_hex(canonical.as_bytes());

        while self.decisions.len() >= DECISIONS_CAP {
            self.decisions.pop_front();
        }
        self.decisions.push_back(Decision {
            decision_id: decision_id.clone(),
            decision_type,
            decision_basis,
            references,
            summary,
            prev_bundle_hash: prev,
            bundle_hash: Some(bundle_hash.clone()),
            created_at: now,
        });
        self.last_bundle_hash = Some(bundle_hash);
        decision_id
    }

    pub fn append_sidecar_event(
        &mut self,
        severity: &str,
        summary: &str,
        charger_id: Option<String>,
        segment_id: Option<String>,
        now: DateTime<Utc>,
    ) -> String {
        let event_id = mint_id("sse");
        self.sidecar_events.push(SidecarEvent {
            event_id: event_id.clone(),
            severity: severity.to_string(),
            summary: clamp_summary(summary),
            charger_id,
            segment_id,
            created_at: now,
        });
        event_id
    }

    pub fn decision_views(&self) -> Vec<DecisionView> {
        self.decisions
            .iter()
            .map(|d| DecisionView {
                decision_id: d.decision_id.clone(),
                decision_type: d.decision_type,
                decision_basis: d.decision_basis,
                references: d.references.clone(),
                summary: d.summary.clone(),
                prev_bundle_hash: d.prev_bundle_hash.clone(),
                bundle_hash: d.bundle_hash.clone(),
                created_at: iso_z(d.created_at),
            })
            .collect()
    }

    pub fn sidecar_event_views(&self) -> Vec<SidecarSafetyEventView> {
        self.sidecar_events
            .iter()
            .map(|e| SidecarSafetyEventView {
                event_id: e.event_id.clone(),
                severity: e.severity.clone(),
                summary: e.summary.clone(),
                charger_id: e.charger_id.clone(),
                segment_id: e.segment_id.clone(),
                created_at: iso_z(e.created_at),
            })
            .collect()
    }
}
