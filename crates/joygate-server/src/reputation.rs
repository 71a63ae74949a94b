//! Robot scores, tiers and vendor aggregates. Score events are append-only
//! and idempotent by score_event_id.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use joygate_contracts::{ReputationView, RobotTier, ScoreEventView, VendorScoreView};
use joygate_kernel::iso_z;

use crate::store::{Reputation, ScoreEvent, Store};

pub const VENDOR_OPS_BASELINE: f64 = 70.0;
pub const RISK_FLAG_BELOW: f64 = 40.0;

impl Store {
    /// Applies one score event. Returns false (and changes nothing) when the
    /// score_event_id was seen before.
    pub fn apply_score_event(
        &mut self,
        score_event_id: &str,
        joykey: &str,
        event_kind: &str,
        delta: f64,
        now: DateTime<Utc>,
    ) -> bool {
        if self.seen_score_event_ids.contains(score_event_id) {
            return false;
        }
        let vendor = self.witness_roster.get(joykey).cloned();
        let rep = self
            .reputations
            .entry(joykey.to_string())
            .or_insert_with(|| Reputation {
                joykey: joykey.to_string(),
                robot_score: 60.0,
                vendor,
                risk_flag: false,
                updated_at: now,
            });
        rep.robot_score = (rep.robot_score + delta).clamp(0.0, 100.0);
        rep.risk_flag = rep.robot_score < RISK_FLAG_BELOW;
        rep.updated_at = now;
        let score_after = rep.robot_score;

        self.seen_score_event_ids.insert(score_event_id.to_string());
        self.score_events.push(ScoreEvent {
            score_event_id: score_event_id.to_string(),
            joykey: joykey.to_string(),
            event_kind: event_kind.to_string(),
            delta,
            score_after,
            created_at: now,
        });
        true
    }

    pub fn robot_score(&self, joykey: &str) -> f64 {
        self.reputations
            .get(joykey)
            .map(|r| r.robot_score)
            .unwrap_or(60.0)
    }

    pub fn reputation_view(&self, joykey: &str) -> Option<ReputationView> {
        self.reputations.get(joykey).map(|r| ReputationView {
            joykey: r.joykey.clone(),
            robot_score: r.robot_score,
            robot_tier: RobotTier::for_score(r.robot_score),
            vote_weight: r.robot_score / 100.0,
            risk_flag: r.risk_flag,
            robot_score_updated_at: iso_z(r.updated_at),
            vendor: r.vendor.clone(),
        })
    }

    pub fn score_event_views(&self, limit: usize) -> Vec<ScoreEventView> {
        self.score_events
            .iter()
            .rev()
            .take(limit)
            .map(|e| ScoreEventView {
                score_event_id: e.score_event_id.clone(),
                joykey: e.joykey.clone(),
                event_kind: e.event_kind.clone(),
                delta: e.delta,
                score_after: e.score_after,
                created_at: iso_z(e.created_at),
            })
            .collect()
    }

    /// Per-fleet aggregate: robot-mapped average and ops baseline, weighted
    /// half and half.
    pub fn vendor_score_views(&self, fleet_id: Option<&str>) -> Vec<VendorScoreView> {
        let mut by_vendor: BTreeMap<String, (f64, usize)> = BTreeMap::new();
        for rep in self.reputations.values() {
            let Some(vendor) = &rep.vendor else { continue };
            if let Some(filter) = fleet_id {
                if vendor != filter {
                    continue;
                }
            }
            let entry = by_vendor.entry(vendor.clone()).or_insert((0.0, 0));
            entry.0 += rep.robot_score;
            entry.1 += 1;
        }
        by_vendor
            .into_iter()
            .map(|(vendor, (sum, n))| {
                let avg = if n > 0 { sum / n as f64 } else { 0.0 };
                VendorScoreView {
                    fleet_id: vendor,
                    robot_avg_score: avg,
                    ops_baseline: VENDOR_OPS_BASELINE,
                    total_score: 0.5 * avg + 0.5 * VENDOR_OPS_BASELINE,
                    robots_counted: n,
                }
            })
            .collect()
    }
}
