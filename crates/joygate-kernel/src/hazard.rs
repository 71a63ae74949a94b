//! Scheduled-recheck verdict for SOFT_BLOCKED hazards. A fresh segment-passed
//! signal always wins; otherwise the recent witness votes need a quorum.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecheckVerdict {
    Passable,
    Blocked,
    Inconclusive,
}

pub fn recheck_verdict(
    has_fresh_signal: bool,
    passable_votes: u32,
    blocked_votes: u32,
    votes_required: u32,
) -> RecheckVerdict {
    if has_fresh_signal {
        return RecheckVerdict::Passable;
    }
    if passable_votes + blocked_votes < votes_required {
        return RecheckVerdict::Inconclusive;
    }
    if passable_votes > blocked_votes {
        RecheckVerdict::Passable
    } else if blocked_votes > passable_votes {
        RecheckVerdict::Blocked
    } else {
        RecheckVerdict::Inconclusive
    }
}
