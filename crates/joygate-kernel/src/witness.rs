//! Per-incident witness tally: vendor-decayed vote weights and the dual
//! confirmation thresholds, including the certified-support guard for the
//! risky UNKNOWN_OCCUPANCY lead.

use std::collections::{BTreeSet, HashMap, HashSet};

use joygate_contracts::ChargerState;

fn idx(state: ChargerState) -> usize {
    match state {
        ChargerState::Free => 0,
        ChargerState::Occupied => 1,
        ChargerState::UnknownOccupancy => 2,
    }
}

#[derive(Debug, Clone, Default)]
pub struct WitnessTally {
    pub counts: [u32; 3],
    pub weights: [f64; 3],
    pub vendor_vote_counts: HashMap<String, u32>,
    pub vendors_by_state: [BTreeSet<String>; 3],
    pub certified_by_state: [BTreeSet<String>; 3],
    pub seen_witness_joykeys: HashSet<String>,
    pub seen_points_event_ids: HashSet<String>,
    pub total: u32,
}

impl WitnessTally {
    pub fn has_voted(&self, joykey: &str) -> bool {
        self.seen_witness_joykeys.contains(joykey)
    }

    pub fn has_points_event(&self, points_event_id: &str) -> bool {
        self.seen_points_event_ids.contains(points_event_id)
    }

    /// Records one vote. The caller has already dealt with dedup; the vote
    /// weight for vendor v with k prior votes is gamma^k.
    pub fn record_vote(
        &mut self,
        joykey: &str,
        vendor: &str,
        state: ChargerState,
        certified: bool,
        gamma: f64,
        points_event_id: Option<&str>,
    ) -> f64 {
        let prior = *self.vendor_vote_counts.get(vendor).unwrap_or(&0);
        let weight = gamma.powi(prior as i32);

        let i = idx(state);
        self.counts[i] += 1;
        self.weights[i] += weight;
        self.total += 1;
        *self.vendor_vote_counts.entry(vendor.to_string()).or_insert(0) += 1;
        self.vendors_by_state[i].insert(vendor.to_string());
        if certified {
            self.certified_by_state[i].insert(joykey.to_string());
        }
        self.seen_witness_joykeys.insert(joykey.to_string());
        if let Some(id) = points_event_id {
            self.seen_points_event_ids.insert(id.to_string());
        }
        weight
    }

    pub fn distinct_vendors_total(&self) -> usize {
        self.vendor_vote_counts.len()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConfirmPolicy {
    pub score_required: f64,
    pub score_required_single_vendor: f64,
    pub min_distinct_vendors: usize,
    pub min_distinct_vendors_risky: usize,
    pub score_required_risky: f64,
    pub min_margin_risky: f64,
    pub min_certified_support_risky: usize,
}

#[derive(Debug, Clone, Copy)]
pub struct TallyOutcome {
    pub lead: ChargerState,
    pub lead_weight: f64,
    pub margin: f64,
    pub lead_vendors: usize,
    pub confirmed: bool,
}

/// Picks the lead state by weighted sum (FREE wins ties, then OCCUPIED) and
/// applies the confirmation rule.
pub fn evaluate(tally: &WitnessTally, policy: &ConfirmPolicy) -> TallyOutcome {
    let mut lead_i = 0usize;
    for i in 1..3 {
        if tally.weights[i] > tally.weights[lead_i] {
            lead_i = i;
        }
    }
    let lead_weight = tally.weights[lead_i];
    let runner_up = (0..3)
        .filter(|i| *i != lead_i)
        .map(|i| tally.weights[i])
        .fold(0.0_f64, f64::max);
    let margin = lead_weight - runner_up;
    let lead = ChargerState::ALL[lead_i];
    let lead_vendors = tally.vendors_by_state[lead_i].len();

    let confirmed = if lead == ChargerState::UnknownOccupancy {
        lead_vendors >= policy.min_distinct_vendors_risky
            && lead_weight >= policy.score_required_risky
            && margin >= policy.min_margin_risky
            && tally.certified_by_state[lead_i].len() >= policy.min_certified_support_risky
    } else if tally.distinct_vendors_total() >= policy.min_distinct_vendors {
        lead_weight >= policy.score_required
    } else {
        lead_weight >= policy.score_required_single_vendor
    };

    TallyOutcome {
        lead,
        lead_weight,
        margin,
        lead_vendors,
        confirmed,
    }
}

pub fn tally_summary(tally: &WitnessTally, outcome: &TallyOutcome, gamma: f64) -> String {
    format!(
        "witness tally: FREE={} OCCUPIED={} UNKNOWN_OCCUPANCY={} | \
         wFREE={:.2} wOCCUPIED={:.2} wUNKNOWN_OCCUPANCY={:.2} | \
         lead={} w={:.2} vendors={} gamma={:.2}",
        tally.counts[0],
        tally.counts[1],
        tally.counts[2],
        tally.weights[0],
        tally.weights[1],
        tally.weights[2],
        outcome.lead.as_str(),
        outcome.lead_weight,
        outcome.lead_vendors,
        gamma,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> ConfirmPolicy {
        ConfirmPolicy {
            score_required: 2.0,
            score_required_single_vendor: 3.0,
            min_distinct_vendors: 2,
            min_distinct_vendors_risky: 3,
            score_required_risky: 3.0,
            min_margin_risky: 1.0,
            min_certified_support_risky: 1,
        }
    }

    #[test]
    fn two_vendors_first_votes_confirm_occupied() {
        let mut tally = WitnessTally::default();
        let w1 = tally.record_vote("w1", "acme", ChargerState::Occupied, false, 0.5, None);
        let w2 = tally.record_vote("w2", "bolt", ChargerState::Occupied, false, 0.5, None);
        assert_eq!(w1, 1.0);
        assert_eq!(w2, 1.0);

        let outcome = evaluate(&tally, &policy());
        assert_eq!(outcome.lead, ChargerState::Occupied);
        assert!((outcome.lead_weight - 2.0).abs() < 1e-9);
        assert_eq!(outcome.lead_vendors, 2);
        assert!(outcome.confirmed);

        let summary = tally_summary(&tally, &outcome, 0.5);
        assert!(summary.contains("wOCCUPIED=2.00"));
        assert!(summary.contains("lead=OCCUPIED"));
        assert!(summary.contains("vendors=2"));
        assert!(summary.contains("gamma=0.50"));
    }

    #[test]
    fn same_vendor_votes_decay() {
        let mut tally = WitnessTally::default();
        assert_eq!(tally.record_vote("w1", "acme", ChargerState::Occupied, false, 0.5, None), 1.0);
        assert_eq!(tally.record_vote("w3", "acme", ChargerState::Occupied, false, 0.5, None), 0.5);

        // single vendor: the higher single-vendor threshold applies
        let outcome = evaluate(&tally, &policy());
        assert!((outcome.lead_weight - 1.5).abs() < 1e-9);
        assert!(!outcome.confirmed);
    }

    #[test]
    fn risky_lead_requires_certified_support() {
        let mut tally = WitnessTally::default();
        tally.record_vote("w1", "acme", ChargerState::UnknownOccupancy, false, 0.5, None);
        tally.record_vote("w2", "bolt", ChargerState::UnknownOccupancy, false, 0.5, None);
        tally.record_vote("w4", "crux", ChargerState::UnknownOccupancy, false, 0.5, None);
        // 3 vendors, weight 3.0, margin 3.0 - but zero certified witnesses
        let outcome = evaluate(&tally, &policy());
        assert_eq!(outcome.lead, ChargerState::UnknownOccupancy);
        assert!(!outcome.confirmed);

        let mut tally = WitnessTally::default();
        tally.record_vote("w1", "acme", ChargerState::UnknownOccupancy, true, 0.5, None);
        tally.record_vote("w2", "bolt", ChargerState::UnknownOccupancy, false, 0.5, None);
        tally.record_vote("w4", "crux", ChargerState::UnknownOccupancy, false, 0.5, None);
        let outcome = evaluate(&tally, &policy());
        assert!(outcome.confirmed);
    }

    #[test]
    fn risky_margin_counts_runner_up() {
        let mut tally = WitnessTally::default();
        tally.record_vote("w1", "acme", ChargerState::UnknownOccupancy, true, 0.5, None);
        tally.record_vote("w2", "bolt", ChargerState::UnknownOccupancy, true, 0.5, None);
        tally.record_vote("w4", "crux", ChargerState::UnknownOccupancy, true, 0.5, None);
        tally.record_vote("w5", "dyna", ChargerState::Free, false, 0.5, None);
        tally.record_vote("w6", "emph", ChargerState::Free, false, 0.5, None);
        tally.record_vote("w7", "dyna", ChargerState::Free, false, 0.5, None);
        // lead UNKNOWN_OCCUPANCY at 3.0, FREE runner-up at 2.5: margin 0.5 < 1.0
        let outcome = evaluate(&tally, &policy());
        assert_eq!(outcome.lead, ChargerState::UnknownOccupancy);
        assert!((outcome.margin - 0.5).abs() < 1e-9);
        assert!(!outcome.confirmed);
    }

    #[test]
    fn points_event_ids_are_tracked() {
        let mut tally = WitnessTally::default();
        tally.record_vote("w1", "acme", ChargerState::Free, false, 0.5, Some("pe-1"));
        assert!(tally.has_points_event("pe-1"));
        assert!(!tally.has_points_event("pe-2"));
        assert!(tally.has_voted("w1"));
    }
}
