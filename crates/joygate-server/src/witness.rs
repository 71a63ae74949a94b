//! Witness voting on incidents: dedup, vendor-decayed tally, evidence merge,
//! confirmation and the one-time verified-vote score events.

use chrono::{DateTime, Utc};
use joygate_config::Config;
use joygate_contracts::{ChargerState, InsightType};
use joygate_kernel::witness::{evaluate, tally_summary, ConfirmPolicy, WitnessTally};
use joygate_kernel::derived_id;

use crate::error::ApiError;
use crate::incident::merge_evidence_refs;
use crate::store::Store;

fn confirm_policy(cfg: &Config) -> ConfirmPolicy {
    ConfirmPolicy {
        score_required: cfg.witness.score_required,
        score_required_single_vendor: cfg.witness.score_required_single_vendor,
        min_distinct_vendors: cfg.witness.min_distinct_vendors,
        min_distinct_vendors_risky: cfg.witness.min_distinct_vendors_risky,
        score_required_risky: cfg.witness.score_required_risky,
        min_margin_risky: cfg.witness.min_margin_risky,
        min_certified_support_risky: cfg.witness.min_certified_support_risky,
    }
}

impl Store {
    /// Handles one `witness/respond` call. Duplicate votes (same joykey, or a
    /// points_event_id this incident has already consumed) are silent no-ops.
    pub fn witness_respond(
        &mut self,
        cfg: &Config,
        incident_id: &str,
        charger_id: &str,
        charger_state: ChargerState,
        witness_joykey: &str,
        points_event_id: Option<&str>,
        evidence_refs: &[String],
        now: DateTime<Utc>,
    ) -> Result<(), ApiError> {
        let vendor = self
            .witness_roster
            .get(witness_joykey)
            .cloned()
            .ok_or_else(|| {
                ApiError::PermissionDenied(format!(
                    "joykey {witness_joykey} is not an allow-listed witness"
                ))
            })?;

        let declared = self
            .incidents
            .get(incident_id)
            .ok_or_else(|| ApiError::NotFound(format!("unknown incident {incident_id}")))?
            .charger_id
            .clone();
        if declared.as_deref() != Some(charger_id) {
            return Err(ApiError::invalid(
                "charger_id",
                "does not match the incident",
            ));
        }

        {
            let tally = self.tallies.entry(incident_id.to_string()).or_default();
            if tally.has_voted(witness_joykey) {
                return Ok(());
            }
            if let Some(pe) = points_event_id {
                if tally.has_points_event(pe) {
                    return Ok(());
                }
            }
        }

        let certified = self.robot_score(witness_joykey) >= cfg.witness.certified_points_threshold;
        let gamma = cfg.witness.vendor_decay_gamma;
        let tally = self.tallies.entry(incident_id.to_string()).or_default();
        tally.record_vote(
            witness_joykey,
            &vendor,
            charger_state,
            certified,
            gamma,
            points_event_id,
        );

        if let Some(inc) = self.incidents.get_mut(incident_id) {
            merge_evidence_refs(&mut inc.evidence_refs, evidence_refs);
        }

        let tally = self
            .tallies
            .get(incident_id)
            .cloned()
            .unwrap_or_default();
        let outcome = evaluate(&tally, &confirm_policy(cfg));
        let summary = tally_summary(&tally, &outcome, gamma);
        self.upsert_insight(incident_id, InsightType::WitnessTally, None, summary);

        if outcome.confirmed && self.confirm_incident(incident_id, now) {
            self.award_verified_votes(incident_id, &tally, now);
        }
        Ok(())
    }

    /// +2 for every allow-listed joykey seen on the tally, exactly once per
    /// (incident, joykey) pair regardless of how often confirmation re-fires.
    fn award_verified_votes(&mut self, incident_id: &str, tally: &WitnessTally, now: DateTime<Utc>) {
        let mut joykeys: Vec<String> = tally
            .seen_witness_joykeys
            .iter()
            .filter(|jk| self.witness_roster.contains_key(*jk))
            .cloned()
            .collect();
        joykeys.sort();
        for jk in joykeys {
            let event_id = derived_id("se", &format!("m16:witness_verified:{incident_id}:{jk}"));
            self.apply_score_event(&event_id, &jk, "WITNESS_VOTE_VERIFIED", 2.0, now);
        }
    }
}
